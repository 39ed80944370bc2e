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

//! Shared event flags.
//!
//! A word of flags multiple threads can wait on.  `raise` scans the waiters
//! in priority-FIFO order; each satisfied waiter that asked for `CLEAR`
//! consumes its matched bits from the shared mask before the next waiter is
//! evaluated, so one raise can satisfy several waiters with disjoint masks.
//!
//! Per-thread flags (raised on a specific thread) live on [`Thread`] itself;
//! see [`Thread::flags_raise`] and [`this_thread`].
//!
//! [`Thread`]: crate::scheduler::thread::Thread
//! [`Thread::flags_raise`]: crate::scheduler::thread::Thread::flags_raise
//! [`this_thread`]: crate::scheduler::thread::this_thread

use core::ptr::NonNull;

use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::scheduler::thread::{flags_match, flags_mode, Thread};
use crate::scheduler::{self, SchedLock, WaitList, WaitPayload};
use crate::Kernel;

struct EventFlagsInner<K: Kernel> {
    mask: u32,
    waiters: WaitList<K>,
}

/// A shared event-flags object.
pub struct EventFlags<K: Kernel> {
    name: &'static str,
    state: SchedLock<K, EventFlagsInner<K>>,
}

enum FlagsWait {
    Block,
    Try,
    Timed(Duration<SysTicks>),
}

impl<K: Kernel> EventFlags<K> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: SchedLock::new(EventFlagsInner {
                mask: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Raises `mask` and wakes every waiter whose condition now holds, in
    /// priority-FIFO order.  Returns the mask left after consumption.  Safe
    /// from handler mode.
    pub fn raise(&self, kernel: K, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let mut guard = self.state.lock(kernel);
        let after = unsafe {
            let (sched, inner) = guard.split();
            inner.mask |= mask;

            loop {
                let flags = inner.mask;
                let hit = inner
                    .waiters
                    .for_each(|t| -> core::result::Result<(), (NonNull<Thread<K>>, u32)> {
                        if let WaitPayload::Flags { mask: want, mode, .. } = t.payload {
                            if let Some(consumed) = flags_match(flags, want, mode) {
                                return Err((NonNull::from(t), consumed));
                            }
                        }
                        Ok(())
                    });

                let Err((waiter, consumed)) = hit else {
                    break;
                };
                let t = waiter.as_ptr();
                let WaitPayload::Flags { mask: want, mode, .. } = (*t).payload else {
                    unreachable!()
                };
                let observed = inner.mask;
                if mode & flags_mode::CLEAR != 0 {
                    inner.mask &= !consumed;
                }
                (*t).payload = WaitPayload::Flags {
                    mask: want,
                    mode,
                    grabbed: observed,
                };
                scheduler::wake_thread(kernel, sched, waiter, Ok(()));
            }

            inner.mask
        };
        guard.finish();
        Ok(after)
    }

    /// Waits for the flags selected by `mask`/`mode`; returns the flags
    /// observed when the wait completed (before any clearing).
    pub fn wait(&self, kernel: K, mask: u32, mode: u32) -> Result<u32> {
        self.wait_impl(kernel, mask, mode, FlagsWait::Block)
    }

    /// Non-blocking variant; fails with `would_block` when unsatisfied.
    /// Safe from handler mode.
    pub fn try_wait(&self, kernel: K, mask: u32, mode: u32) -> Result<u32> {
        self.wait_impl(kernel, mask, mode, FlagsWait::Try)
    }

    /// Timed variant; fails with `timeout` when the deadline passes first.
    pub fn timed_wait(
        &self,
        kernel: K,
        mask: u32,
        mode: u32,
        timeout: Duration<SysTicks>,
    ) -> Result<u32> {
        self.wait_impl(kernel, mask, mode, FlagsWait::Timed(timeout))
    }

    fn wait_impl(&self, kernel: K, mask: u32, mode: u32, wait: FlagsWait) -> Result<u32> {
        if mode & (flags_mode::ALL | flags_mode::ANY) == 0 {
            return Err(Error::Invalid);
        }
        let mut guard = self.state.lock(kernel);

        {
            let (_, inner) = guard.split();
            if let Some(consumed) = flags_match(inner.mask, mask, mode) {
                let observed = inner.mask;
                if mode & flags_mode::CLEAR != 0 {
                    inner.mask &= !consumed;
                }
                return Ok(observed);
            }
        }

        let deadline = match wait {
            FlagsWait::Try => return Err(Error::WouldBlock),
            FlagsWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            FlagsWait::Timed(timeout) => unsafe {
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        if guard.sched_ref().current_ptr().is_none() {
            return Err(Error::Permission);
        }

        let waiters = unsafe { NonNull::from(&mut (*self.state.raw()).waiters) };
        let payload = WaitPayload::Flags {
            mask,
            mode,
            grabbed: 0,
        };
        let (mut guard, status) = guard.block_current(Some(waiters), deadline, payload);
        let observed = match status {
            Ok(()) => {
                let current = guard.sched().current_ptr();
                match current {
                    Some(t) => unsafe {
                        match (*t.as_ptr()).payload {
                            WaitPayload::Flags { grabbed, .. } => Ok(grabbed),
                            _ => Ok(0),
                        }
                    },
                    None => Ok(0),
                }
            }
            Err(e) => Err(e),
        };
        guard.finish();
        observed
    }

    /// Clears `mask` (all flags when zero is not intended: pass the bits to
    /// drop), returning the prior mask.  Clearing bits that are not raised
    /// is a no-op.
    pub fn clear(&self, kernel: K, mask: u32) -> Result<u32> {
        let mut guard = self.state.lock(kernel);
        let prior = guard.mask;
        guard.mask &= !mask;
        Ok(prior)
    }

    /// Reads the flags selected by `mask` (all of them when `mask` is zero),
    /// consuming them if `mode` includes `CLEAR`.
    #[must_use]
    pub fn get(&self, kernel: K, mask: u32, mode: u32) -> u32 {
        let mut guard = self.state.lock(kernel);
        let selected = if mask == 0 { guard.mask } else { guard.mask & mask };
        if mode & flags_mode::CLEAR != 0 {
            guard.mask &= !selected;
        }
        selected
    }

    /// Number of threads currently waiting.
    #[must_use]
    pub fn waiting(&self, kernel: K) -> usize {
        self.state.lock(kernel).waiters.len()
    }
}

impl<K: Kernel> Drop for EventFlags<K> {
    fn drop(&mut self) {
        debug_assert!(self.state.lock(K::default()).waiters.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::park_thread;
    use crate::scheduler::thread::State;
    use crate::testutil::{self, TestKernel};

    fn park_waiter(
        ef: &EventFlags<TestKernel>,
        t: &mut Thread<TestKernel>,
        mask: u32,
        mode: u32,
    ) {
        let _sched = TestKernel.get_scheduler().lock();
        unsafe {
            let waiters = NonNull::from(&mut (*ef.state.raw()).waiters);
            park_thread(
                NonNull::from(&mut *t),
                Some(waiters),
                None,
                WaitPayload::Flags {
                    mask,
                    mode,
                    grabbed: 0,
                },
            );
        }
    }

    fn grabbed(t: &Thread<TestKernel>) -> u32 {
        match t.payload {
            WaitPayload::Flags { grabbed, .. } => grabbed,
            _ => panic!("payload lost"),
        }
    }

    #[test]
    fn immediate_wait_consumes_raised_flags() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");

        assert_eq!(
            ef.try_wait(TestKernel, 0b11, flags_mode::ANY),
            Err(Error::WouldBlock)
        );
        assert_eq!(ef.raise(TestKernel, 0b01), Ok(0b01));
        assert_eq!(
            ef.try_wait(TestKernel, 0b11, flags_mode::ANY | flags_mode::CLEAR),
            Ok(0b01)
        );
        assert_eq!(ef.get(TestKernel, 0, 0), 0);
    }

    #[test]
    fn all_clear_wait_completes_on_second_raise() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");
        let mut t = testutil::thread("t", 5);
        park_waiter(&ef, &mut t, 0b1010, flags_mode::ALL | flags_mode::CLEAR);

        assert_eq!(ef.raise(TestKernel, 0b1000), Ok(0b1000));
        assert_eq!(t.state, State::Suspended);

        assert_eq!(ef.raise(TestKernel, 0b0010), Ok(0));
        assert_eq!(t.state, State::Ready);
        assert_eq!(t.wake_status, Ok(()));
        assert_eq!(grabbed(&t), 0b1010);
        assert_eq!(ef.get(TestKernel, 0, 0), 0);
    }

    #[test]
    fn one_raise_serves_waiters_in_priority_order() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");

        let mut hi = testutil::thread("hi", 7);
        let mut lo = testutil::thread("lo", 3);
        park_waiter(&ef, &mut hi, 0b01, flags_mode::ANY | flags_mode::CLEAR);
        park_waiter(&ef, &mut lo, 0b10, flags_mode::ANY | flags_mode::CLEAR);

        assert_eq!(ef.raise(TestKernel, 0b11), Ok(0));
        assert_eq!(hi.state, State::Ready);
        assert_eq!(lo.state, State::Ready);
        // The high-priority waiter observed both bits; the second only its
        // own, the first having been consumed before it was evaluated.
        assert_eq!(grabbed(&hi), 0b11);
        assert_eq!(grabbed(&lo), 0b10);
    }

    #[test]
    fn waiter_without_clear_leaves_the_mask_raised() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");
        let mut t = testutil::thread("t", 5);
        park_waiter(&ef, &mut t, 0b100, flags_mode::ANY);

        assert_eq!(ef.raise(TestKernel, 0b100), Ok(0b100));
        assert_eq!(t.state, State::Ready);
        assert_eq!(ef.get(TestKernel, 0, 0), 0b100);
    }

    #[test]
    fn zero_mask_waits_for_any_bit() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");

        assert_eq!(
            ef.try_wait(TestKernel, 0, flags_mode::ANY),
            Err(Error::WouldBlock)
        );
        assert_eq!(ef.raise(TestKernel, 0b100), Ok(0b100));
        assert_eq!(ef.try_wait(TestKernel, 0, flags_mode::ANY), Ok(0b100));
    }

    #[test]
    fn clear_with_nothing_raised_is_a_no_op() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");
        assert_eq!(ef.clear(TestKernel, 0b1111), Ok(0));
        assert_eq!(ef.get(TestKernel, 0, 0), 0);
    }

    #[test]
    fn wait_rejects_a_missing_predicate_mode() {
        let _session = testutil::session();
        let ef = EventFlags::<TestKernel>::new("ef");
        assert_eq!(
            ef.try_wait(TestKernel, 0b1, flags_mode::CLEAR),
            Err(Error::Invalid)
        );
    }
}
