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

//! Software timers.
//!
//! Armed timers sit in a deadline-ordered list driven by the sysclock tick.
//! Callbacks are invoked directly from the tick handler with the kernel lock
//! released, so they run in interrupt context and must restrict themselves
//! to interrupt-safe operations (post, raise, try variants).
//!
//! Periodic timers re-arm at `deadline + period` computed from the *previous*
//! deadline, not from the callback time, so the k-th expiry of a timer
//! started at `t` with period `p` is `t + k*p` with no cumulative drift.

use core::ffi::c_void;
use core::ptr::NonNull;

use list::{Link, UnsafeList};
use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::scheduler::SchedLock;
use crate::Kernel;

/// Timer expiry callback; runs in tick-handler context.
pub type TimerCallback = fn(*mut c_void);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerState {
    /// Never started.
    Initial,
    /// Armed; linked in the deadline list.
    Running,
    /// Expired (one-shot) or explicitly stopped.
    Stopped,
}

/// Creation attributes; one-shot unless marked periodic.
#[derive(Clone, Copy, Default)]
pub struct TimerAttributes {
    pub periodic: bool,
}

impl TimerAttributes {
    #[must_use]
    pub fn one_shot() -> Self {
        Self { periodic: false }
    }

    #[must_use]
    pub fn periodic() -> Self {
        Self { periodic: true }
    }
}

pub(crate) struct TimerInner<K: Kernel> {
    link: Link,
    deadline: u64,
    period: u64,
    periodic: bool,
    state: TimerState,
    callback: TimerCallback,
    arg: *mut c_void,
    _kernel: core::marker::PhantomData<K>,
}

list::define_adapter!(pub(crate) TimerLinkAdapter<K: Kernel> => TimerInner<K>::link);

/// The sysclock's deadline-ordered list of armed timers.
pub struct TimerQueue<K: Kernel> {
    timers: UnsafeList<TimerInner<K>, TimerLinkAdapter<K>>,
}

unsafe impl<K: Kernel> Send for TimerQueue<K> {}
unsafe impl<K: Kernel> Sync for TimerQueue<K> {}

impl<K: Kernel> TimerQueue<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timers: UnsafeList::new(),
        }
    }

    unsafe fn insert(&mut self, timer: NonNull<TimerInner<K>>) {
        self.timers
            .insert_sorted_by_unchecked(timer.as_ptr(), |new, cur| new.deadline < cur.deadline);
    }
}

/// A one-shot or periodic software timer.
pub struct Timer<K: Kernel> {
    name: &'static str,
    periodic: bool,
    inner: SchedLock<K, TimerInner<K>>,
}

impl<K: Kernel> Timer<K> {
    #[must_use]
    pub const fn new(
        name: &'static str,
        attr: TimerAttributes,
        callback: TimerCallback,
        arg: *mut c_void,
    ) -> Self {
        Self {
            name,
            periodic: attr.periodic,
            inner: SchedLock::new(TimerInner {
                link: Link::new(),
                deadline: 0,
                period: 0,
                periodic: attr.periodic,
                state: TimerState::Initial,
                callback,
                arg,
                _kernel: core::marker::PhantomData,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    #[must_use]
    pub fn state(&self, kernel: K) -> TimerState {
        let _queue = kernel.timer_queue().lock(kernel);
        // Safety: the scheduler lock is held.
        unsafe { (*self.inner.raw()).state }
    }

    /// Arms the timer to expire `period` from now; a periodic timer then
    /// re-fires every `period`.  Restarting an armed timer re-schedules it.
    /// Safe from handler mode.
    pub fn start(&self, kernel: K, period: Duration<SysTicks>) -> Result<()> {
        if period.ticks() <= 0 {
            return Err(Error::Invalid);
        }
        let mut queue = kernel.timer_queue().lock(kernel);
        // Safety: the scheduler lock is held.
        unsafe {
            let inner = NonNull::new_unchecked(self.inner.raw());
            let now = (*kernel.sysclock_state().raw()).ticks;
            let t = inner.as_ptr();
            queue.timers.unlink_element(inner);
            (*t).period = period.ticks() as u64;
            (*t).deadline = now.saturating_add((*t).period);
            (*t).state = TimerState::Running;
            queue.insert(inner);
        }
        Ok(())
    }

    /// Disarms the timer.  Stopping an unarmed timer is a no-op.  Safe from
    /// handler mode.
    pub fn stop(&self, kernel: K) -> Result<()> {
        let mut queue = kernel.timer_queue().lock(kernel);
        // Safety: the scheduler lock is held.
        unsafe {
            let inner = NonNull::new_unchecked(self.inner.raw());
            queue.timers.unlink_element(inner);
            (*inner.as_ptr()).state = TimerState::Stopped;
        }
        Ok(())
    }
}

impl<K: Kernel> Drop for Timer<K> {
    fn drop(&mut self) {
        let _ = self.stop(K::default());
    }
}

/// Fires every armed timer whose deadline has passed.  Called from the tick
/// handler; the kernel lock is released around each callback.
pub(crate) fn process_expired<K: Kernel>(kernel: K, now: u64) {
    loop {
        let mut queue = kernel.timer_queue().lock(kernel);
        let expired = unsafe {
            match queue.timers.peek_head() {
                Some(head) if head.as_ref().deadline <= now => {
                    let t = head.as_ptr();
                    queue.timers.unlink_element_unchecked(t);
                    if (*t).periodic {
                        // Fixed-rate: advance from the old deadline so
                        // callback latency never accumulates.
                        (*t).deadline = (*t).deadline.saturating_add((*t).period);
                        queue.insert(head);
                    } else {
                        (*t).state = TimerState::Stopped;
                    }
                    Some(((*t).callback, (*t).arg))
                }
                _ => None,
            }
        };
        drop(queue);

        match expired {
            Some((callback, arg)) => callback(arg),
            None => return,
        }
    }
}
