// Copyright 2025 The Kestrel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License. You may obtain a copy of
// the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. See the
// License for the specific language governing permissions and limitations under
// the License.

//! # ticktime
//!
//! Strongly typed instants and durations measured in clock ticks.  Each value
//! is tagged with a zero-sized [`Clock`] marker so that timestamps taken from
//! different clocks (e.g. the monotonic tick clock and the wall clock) can
//! not be mixed up.  Instants are produced by the kernel's clock objects; the
//! marker type only fixes the tick rate.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::ops::{Add, Sub};

/// Marker for a time base.  Implementations are typically uninhabited types.
pub trait Clock: Sized {
    /// Ticks per second of this time base.
    const TICKS_PER_SEC: u64;
}

/// A point in time on clock `C`, in ticks since the clock's origin.
pub struct Instant<C: Clock> {
    ticks: u64,
    _clock: PhantomData<C>,
}

impl<C: Clock> Instant<C> {
    pub const MAX: Self = Self::from_ticks(u64::MAX);
    pub const MIN: Self = Self::from_ticks(u64::MIN);

    #[must_use]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self {
            ticks,
            _clock: PhantomData,
        }
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn checked_add_duration(self, duration: Duration<C>) -> Option<Self> {
        match self.ticks.checked_add_signed(duration.ticks) {
            Some(ticks) => Some(Self::from_ticks(ticks)),
            None => None,
        }
    }

    #[must_use]
    pub const fn checked_sub_duration(self, duration: Duration<C>) -> Option<Self> {
        match duration.ticks.checked_neg() {
            Some(neg) => match self.ticks.checked_add_signed(neg) {
                Some(ticks) => Some(Self::from_ticks(ticks)),
                None => None,
            },
            None => None,
        }
    }
}

// Copy/Clone/Eq/Ord are implemented by hand so that the marker type `C` does
// not itself have to satisfy those bounds.
impl<C: Clock> Copy for Instant<C> {}

impl<C: Clock> Clone for Instant<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Clock> Eq for Instant<C> {}

impl<C: Clock> PartialEq for Instant<C> {
    fn eq(&self, other: &Self) -> bool {
        self.ticks == other.ticks
    }
}

impl<C: Clock> Ord for Instant<C> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.ticks.cmp(&other.ticks)
    }
}

impl<C: Clock> PartialOrd for Instant<C> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: Clock> core::fmt::Debug for Instant<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Instant({} ticks)", self.ticks)
    }
}

impl<C: Clock> Sub<Instant<C>> for Instant<C> {
    type Output = Duration<C>;

    fn sub(self, rhs: Instant<C>) -> Duration<C> {
        // Wrapping subtraction followed by a sign cast keeps full resolution
        // for distant instants.
        Duration {
            ticks: self.ticks.wrapping_sub(rhs.ticks) as i64,
            _clock: PhantomData,
        }
    }
}

impl<C: Clock> Add<Duration<C>> for Instant<C> {
    type Output = Instant<C>;

    fn add(self, rhs: Duration<C>) -> Instant<C> {
        match self.checked_add_duration(rhs) {
            Some(instant) => instant,
            None => panic!("instant + duration overflow"),
        }
    }
}

impl<C: Clock> Sub<Duration<C>> for Instant<C> {
    type Output = Instant<C>;

    fn sub(self, rhs: Duration<C>) -> Instant<C> {
        match self.checked_sub_duration(rhs) {
            Some(instant) => instant,
            None => panic!("instant - duration overflow"),
        }
    }
}

/// A signed span of time on clock `C`, in ticks.
pub struct Duration<C: Clock> {
    ticks: i64,
    _clock: PhantomData<C>,
}

impl<C: Clock> Duration<C> {
    pub const MAX: Self = Self::from_ticks(i64::MAX);
    pub const MIN: Self = Self::from_ticks(i64::MIN);
    pub const ZERO: Self = Self::from_ticks(0);

    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self {
            ticks,
            _clock: PhantomData,
        }
    }

    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self::from_ticks(secs * C::TICKS_PER_SEC as i64)
    }

    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self::from_ticks(millis * C::TICKS_PER_SEC as i64 / 1000)
    }

    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self::from_ticks(micros * C::TICKS_PER_SEC as i64 / 1_000_000)
    }

    #[must_use]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.ticks.checked_add(rhs.ticks) {
            Some(ticks) => Some(Self::from_ticks(ticks)),
            None => None,
        }
    }

    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.ticks.checked_sub(rhs.ticks) {
            Some(ticks) => Some(Self::from_ticks(ticks)),
            None => None,
        }
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.ticks < 0
    }
}

impl<C: Clock> Copy for Duration<C> {}

impl<C: Clock> Clone for Duration<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Clock> Eq for Duration<C> {}

impl<C: Clock> PartialEq for Duration<C> {
    fn eq(&self, other: &Self) -> bool {
        self.ticks == other.ticks
    }
}

impl<C: Clock> Ord for Duration<C> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.ticks.cmp(&other.ticks)
    }
}

impl<C: Clock> PartialOrd for Duration<C> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: Clock> core::fmt::Debug for Duration<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Duration({} ticks)", self.ticks)
    }
}

impl<C: Clock> Add<Duration<C>> for Duration<C> {
    type Output = Duration<C>;

    fn add(self, rhs: Duration<C>) -> Duration<C> {
        match self.checked_add(rhs) {
            Some(duration) => duration,
            None => panic!("duration addition overflow"),
        }
    }
}

impl<C: Clock> Sub<Duration<C>> for Duration<C> {
    type Output = Duration<C>;

    fn sub(self, rhs: Duration<C>) -> Duration<C> {
        match self.checked_sub(rhs) {
            Some(duration) => duration,
            None => panic!("duration subtraction overflow"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum MilliTick {}

    impl Clock for MilliTick {
        const TICKS_PER_SEC: u64 = 1_000;
    }

    enum SecondTick {}

    impl Clock for SecondTick {
        const TICKS_PER_SEC: u64 = 1;
    }

    #[test]
    fn duration_constructors_scale_by_tick_rate() {
        assert_eq!(Duration::<MilliTick>::from_secs(3).ticks(), 3_000);
        assert_eq!(Duration::<MilliTick>::from_millis(250).ticks(), 250);
        assert_eq!(Duration::<MilliTick>::from_micros(1_500).ticks(), 1);
        assert_eq!(Duration::<SecondTick>::from_secs(3).ticks(), 3);
        assert_eq!(Duration::<SecondTick>::from_millis(250).ticks(), 0);
    }

    #[test]
    fn instant_duration_arithmetic() {
        let t10 = Instant::<MilliTick>::from_ticks(10);
        let t25 = Instant::<MilliTick>::from_ticks(25);

        assert_eq!(t25 - t10, Duration::from_ticks(15));
        assert_eq!(t10 - t25, Duration::from_ticks(-15));
        assert_eq!(t10 + Duration::from_ticks(15), t25);
        assert_eq!(t25 - Duration::from_ticks(15), t10);
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        let one = Duration::<MilliTick>::from_ticks(1);

        assert_eq!(Instant::<MilliTick>::MAX.checked_add_duration(one), None);
        assert_eq!(Instant::<MilliTick>::MIN.checked_sub_duration(one), None);
        assert_eq!(
            Instant::<MilliTick>::MIN.checked_add_duration(Duration::from_ticks(-1)),
            None
        );
        assert_eq!(Duration::<MilliTick>::MAX.checked_add(one), None);
        assert_eq!(Duration::<MilliTick>::MIN.checked_sub(one), None);
    }

    #[test]
    fn instants_order_by_tick_value() {
        let early = Instant::<MilliTick>::from_ticks(5);
        let late = Instant::<MilliTick>::from_ticks(6);

        assert!(early < late);
        assert_eq!(early, Instant::from_ticks(5));
        assert_eq!(early.max(late), late);
    }
}
