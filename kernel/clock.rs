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

//! The two kernel clocks.
//!
//! `sysclock` counts monotonic ticks from boot at [`config::TICK_HZ`].
//! `rtclock` counts seconds, derived from sysclock, with an adjustable epoch
//! offset.  Each clock owns a deadline-ordered sleep list; the tick handler
//! [`on_tick`] expires sleepers and timed waits and drives the timer queue.

use core::ptr::NonNull;

use list::UnsafeList;
use status::{Error, Result};
use ticktime::{Duration, Instant};

use crate::config;
use crate::scheduler::thread::{ClockLinkAdapter, Thread};
use crate::scheduler::{self, SchedLock, SchedulerState, WaitPayload};
use crate::Kernel;

/// Time base of the monotonic tick clock.
pub enum SysTicks {}

impl ticktime::Clock for SysTicks {
    const TICKS_PER_SEC: u64 = config::TICK_HZ as u64;
}

/// Time base of the wall clock; one tick per second.
pub enum RtSeconds {}

impl ticktime::Clock for RtSeconds {
    const TICKS_PER_SEC: u64 = 1;
}

/// Mutable state of one clock: the tick counter, the epoch offset and the
/// sleep list, ordered by ascending wake deadline with FIFO ties.
pub struct ClockState<K: Kernel> {
    name: &'static str,
    pub(crate) ticks: u64,
    pub(crate) offset: i64,
    sleepers: UnsafeList<Thread<K>, ClockLinkAdapter<K>>,
}

unsafe impl<K: Kernel> Send for ClockState<K> {}
unsafe impl<K: Kernel> Sync for ClockState<K> {}

impl<K: Kernel> ClockState<K> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            ticks: 0,
            offset: 0,
            sleepers: UnsafeList::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) unsafe fn enqueue_sleeper(&mut self, thread: NonNull<Thread<K>>) {
        self.sleepers
            .insert_sorted_by_unchecked(thread.as_ptr(), |new, cur| {
                new.wake_deadline < cur.wake_deadline
            });
    }

    pub(crate) unsafe fn remove_sleeper(&mut self, thread: NonNull<Thread<K>>) {
        self.sleepers.unlink_element(thread);
    }

    /// Wakes every sleeper whose deadline has passed, in deadline order.
    /// Expiry is the `timeout` outcome for sleeps and timed waits alike.
    pub(crate) unsafe fn wake_expired(&mut self, kernel: K, sched: &mut SchedulerState<K>) {
        loop {
            let Some(head) = self.sleepers.peek_head() else {
                return;
            };
            if head.as_ref().wake_deadline > self.ticks {
                return;
            }
            scheduler::wake_thread(kernel, sched, head, Err(Error::Timeout));
        }
    }
}

/// Computes an absolute sysclock deadline `timeout` from now, for use as a
/// [`scheduler::block_current`] deadline.
///
/// # Safety
/// The scheduler lock must be held.
pub(crate) unsafe fn sys_deadline_after<K: Kernel>(
    kernel: K,
    timeout: Duration<SysTicks>,
) -> (NonNull<ClockState<K>>, u64) {
    let state = kernel.sysclock_state();
    let clock = state.raw();
    let ticks = timeout.ticks().max(0) as u64;
    (
        NonNull::new_unchecked(clock),
        (*clock).ticks.saturating_add(ticks),
    )
}

/// The periodic tick interrupt.  Ports arrange for this to run at
/// [`config::TICK_HZ`]; it advances both clocks, expires sleepers and timed
/// waits, fires due timers and finally performs any pending preemption.
pub fn on_tick<K: Kernel>(kernel: K) {
    let mut guard = kernel.sysclock_state().lock(kernel);
    let (sched, sys) = guard.split();
    sys.ticks += 1;
    let now = sys.ticks;
    unsafe {
        sys.wake_expired(kernel, sched);

        if now % config::TICK_HZ as u64 == 0 {
            // Safety: the rtclock shares the scheduler lock held by `guard`.
            let rt = &mut *kernel.rtclock_state().raw();
            rt.ticks += 1;
            rt.wake_expired(kernel, sched);
        }
    }
    drop(guard);

    crate::timer::process_expired(kernel, now);
    scheduler::preempt_if_pending(kernel);
}

fn sleep_until_raw<K: Kernel>(
    kernel: K,
    state: &'static SchedLock<K, ClockState<K>>,
    steady_deadline: u64,
) -> Result<()> {
    if kernel.in_handler_mode() {
        return Err(Error::Permission);
    }
    let mut guard = state.lock(kernel);
    if steady_deadline <= guard.ticks {
        // Already past: report expiry without yielding.
        return Err(Error::Timeout);
    }
    if guard.sched_ref().current_ptr().is_none() {
        return Err(Error::Permission);
    }
    let clock = unsafe { NonNull::new_unchecked(state.raw()) };
    let (guard, status) =
        guard.block_current(None, Some((clock, steady_deadline)), WaitPayload::None);
    guard.finish();
    status
}

/// The monotonic tick clock.
#[derive(Clone, Copy)]
pub struct SysClock<K: Kernel> {
    kernel: K,
}

/// Accessor for the monotonic tick clock.
#[must_use]
pub fn sysclock<K: Kernel>(kernel: K) -> SysClock<K> {
    SysClock { kernel }
}

impl<K: Kernel> SysClock<K> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kernel.sysclock_state().lock(self.kernel).name()
    }

    /// Ticks since boot.  The sysclock has no epoch offset, so `now` and
    /// `steady_now` coincide.
    #[must_use]
    pub fn now(&self) -> Instant<SysTicks> {
        self.steady_now()
    }

    #[must_use]
    pub fn steady_now(&self) -> Instant<SysTicks> {
        Instant::from_ticks(self.kernel.sysclock_state().lock(self.kernel).ticks)
    }

    /// Sleeps for `duration`.  Returns `timeout` after a full sleep or
    /// `interrupted` if the thread was resumed early.
    pub fn sleep_for(&self, duration: Duration<SysTicks>) -> Result<()> {
        let now = self.steady_now();
        self.sleep_until(now + duration)
    }

    /// Sleeps until the absolute tick `deadline`.  A deadline already in the
    /// past reports `timeout` immediately without a context switch.
    pub fn sleep_until(&self, deadline: Instant<SysTicks>) -> Result<()> {
        sleep_until_raw(self.kernel, self.kernel.sysclock_state(), deadline.ticks())
    }

    /// Waits out `timeout` unless interrupted; the timed-wait building
    /// block.
    pub fn wait_for(&self, timeout: Duration<SysTicks>) -> Result<()> {
        self.sleep_for(timeout)
    }
}

/// The wall clock: seconds, adjustable by an epoch offset.
#[derive(Clone, Copy)]
pub struct RtClock<K: Kernel> {
    kernel: K,
}

/// Accessor for the wall clock.
#[must_use]
pub fn rtclock<K: Kernel>(kernel: K) -> RtClock<K> {
    RtClock { kernel }
}

impl<K: Kernel> RtClock<K> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kernel.rtclock_state().lock(self.kernel).name()
    }

    /// Seconds since the epoch: `steady_now` plus the configured offset.
    #[must_use]
    pub fn now(&self) -> Instant<RtSeconds> {
        let guard = self.kernel.rtclock_state().lock(self.kernel);
        Instant::from_ticks(guard.ticks.wrapping_add_signed(guard.offset))
    }

    /// Seconds since boot, ignoring the offset.
    #[must_use]
    pub fn steady_now(&self) -> Instant<RtSeconds> {
        Instant::from_ticks(self.kernel.rtclock_state().lock(self.kernel).ticks)
    }

    #[must_use]
    pub fn offset(&self) -> Duration<RtSeconds> {
        Duration::from_ticks(self.kernel.rtclock_state().lock(self.kernel).offset)
    }

    /// Sets the epoch offset, e.g. after reading a hardware RTC.
    pub fn set_offset(&self, offset: Duration<RtSeconds>) {
        self.kernel.rtclock_state().lock(self.kernel).offset = offset.ticks();
    }

    pub fn sleep_for(&self, duration: Duration<RtSeconds>) -> Result<()> {
        let now = self.steady_now();
        let deadline = now + duration;
        sleep_until_raw(self.kernel, self.kernel.rtclock_state(), deadline.ticks())
    }

    /// Sleeps until the absolute timestamp `deadline`, which includes the
    /// epoch offset.
    pub fn sleep_until(&self, deadline: Instant<RtSeconds>) -> Result<()> {
        let offset = self.kernel.rtclock_state().lock(self.kernel).offset;
        let steady = deadline.ticks().wrapping_add_signed(-offset);
        sleep_until_raw(self.kernel, self.kernel.rtclock_state(), steady)
    }

    pub fn wait_for(&self, timeout: Duration<RtSeconds>) -> Result<()> {
        self.sleep_for(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::priority;
    use crate::scheduler::{park_thread, WaitList, WaitPayload};
    use crate::testutil::{self, TestKernel};

    #[test]
    fn sysclock_ticks_monotonically() {
        let _session = testutil::session();
        let clock = sysclock(TestKernel);
        assert_eq!(clock.now().ticks(), 0);

        let mut last = clock.steady_now();
        for _ in 0..10 {
            testutil::run_ticks(1);
            let now = clock.steady_now();
            assert!(now > last);
            last = now;
        }
        assert_eq!(clock.now(), clock.steady_now());
    }

    #[test]
    fn sleep_until_in_the_past_times_out_without_switching() {
        let _session = testutil::session();
        testutil::run_ticks(100);
        // The stub port panics on any context switch, so a clean return
        // also proves no switch happened.
        let result = sysclock(TestKernel).sleep_until(Instant::from_ticks(50));
        assert_eq!(result, Err(Error::Timeout));
        assert_eq!(testutil::now(), 100);
    }

    #[test]
    fn sleepers_expire_in_deadline_order() {
        let _session = testutil::session();
        let mut early = testutil::thread("early", priority::NORMAL);
        let mut late = testutil::thread("late", priority::NORMAL);

        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let clock = NonNull::new_unchecked(TestKernel.sysclock_state().raw());
                early.wake_deadline = 5;
                park_thread(
                    NonNull::from(&mut late),
                    None,
                    Some((clock, 10)),
                    WaitPayload::None,
                );
                park_thread(
                    NonNull::from(&mut early),
                    None,
                    Some((clock, 5)),
                    WaitPayload::None,
                );
            }
        }

        testutil::run_ticks(5);
        assert_eq!(early.state, crate::State::Ready);
        assert_eq!(early.wake_status, Err(Error::Timeout));
        assert_eq!(late.state, crate::State::Suspended);

        testutil::run_ticks(5);
        assert_eq!(late.state, crate::State::Ready);
        assert_eq!(late.wake_status, Err(Error::Timeout));
    }

    #[test]
    fn timed_wait_expiry_leaves_no_list_residue() {
        let _session = testutil::session();
        let mut list = WaitList::<TestKernel>::new();
        let mut t = testutil::thread("t", priority::NORMAL);

        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let clock = NonNull::new_unchecked(TestKernel.sysclock_state().raw());
                park_thread(
                    NonNull::from(&mut t),
                    Some(NonNull::from(&mut list)),
                    Some((clock, 7)),
                    WaitPayload::None,
                );
            }
        }

        testutil::run_ticks(7);
        assert_eq!(t.state, crate::State::Ready);
        assert_eq!(t.wake_status, Err(Error::Timeout));
        assert!(list.is_empty());
        assert!(t.clock_link.is_unlinked());
        assert!(t.wait_anchor.is_none());
        assert!(t.clock_anchor.is_none());
    }

    #[test]
    fn rtclock_derives_seconds_and_applies_offset() {
        let _session = testutil::session();
        let rt = rtclock(TestKernel);
        assert_eq!(rt.steady_now().ticks(), 0);

        testutil::run_ticks(crate::config::TICK_HZ as u64 * 2);
        assert_eq!(rt.steady_now().ticks(), 2);
        assert_eq!(rt.now().ticks(), 2);

        rt.set_offset(Duration::from_secs(100));
        assert_eq!(rt.now().ticks(), 102);
        assert_eq!(rt.steady_now().ticks(), 2);
        assert_eq!(rt.offset(), Duration::from_secs(100));
    }

    #[test]
    fn rtclock_sleeper_wakes_on_second_boundary() {
        let _session = testutil::session();
        let mut t = testutil::thread("t", priority::NORMAL);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let clock = NonNull::new_unchecked(TestKernel.rtclock_state().raw());
                park_thread(
                    NonNull::from(&mut t),
                    None,
                    Some((clock, 1)),
                    WaitPayload::None,
                );
            }
        }

        testutil::run_ticks(crate::config::TICK_HZ as u64 - 1);
        assert_eq!(t.state, crate::State::Suspended);
        testutil::run_ticks(1);
        assert_eq!(t.state, crate::State::Ready);
        assert_eq!(t.wake_status, Err(Error::Timeout));
    }
}
