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

//! Counting and binary semaphores.
//!
//! `post` with parked waiters hands the token straight to the oldest
//! highest-priority one instead of incrementing the count, so a waiter can
//! never lose its token to a later `try_wait`.

use core::ptr::NonNull;

use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::scheduler::{self, SchedLock, WaitList, WaitPayload};
use crate::Kernel;

/// Creation attributes: the starting count and the ceiling.
#[derive(Clone, Copy)]
pub struct SemaphoreAttributes {
    pub initial: u32,
    pub max: u32,
}

impl SemaphoreAttributes {
    #[must_use]
    pub fn counting(initial: u32, max: u32) -> Self {
        Self { initial, max }
    }

    /// A binary semaphore: the count is 0 or 1.
    #[must_use]
    pub fn binary(raised: bool) -> Self {
        Self {
            initial: raised as u32,
            max: 1,
        }
    }
}

struct SemaphoreInner<K: Kernel> {
    count: u32,
    waiters: WaitList<K>,
}

/// A counting semaphore (binary when `max == 1`).
pub struct Semaphore<K: Kernel> {
    name: &'static str,
    initial: u32,
    max: u32,
    state: SchedLock<K, SemaphoreInner<K>>,
}

enum SemWait {
    Block,
    Try,
    Timed(Duration<SysTicks>),
}

impl<K: Kernel> Semaphore<K> {
    #[must_use]
    pub const fn new(name: &'static str, attr: SemaphoreAttributes) -> Self {
        Self {
            name,
            initial: attr.initial,
            max: attr.max,
            state: SchedLock::new(SemaphoreInner {
                count: attr.initial,
                waiters: WaitList::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn initial_value(&self) -> u32 {
        self.initial
    }

    #[must_use]
    pub fn max_value(&self) -> u32 {
        self.max
    }

    /// Current count.
    #[must_use]
    pub fn value(&self, kernel: K) -> u32 {
        self.state.lock(kernel).count
    }

    /// Releases one token: wakes the first waiter, or increments the count.
    /// Fails with `again` at the ceiling.  Safe from handler mode.
    pub fn post(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        let result = unsafe {
            let (sched, inner) = guard.split();
            if let Some(waiter) = inner.waiters.head() {
                scheduler::wake_thread(kernel, sched, waiter, Ok(()));
                Ok(())
            } else if inner.count < self.max {
                inner.count += 1;
                Ok(())
            } else {
                Err(Error::Again)
            }
        };
        guard.finish();
        result
    }

    /// Takes one token, blocking while the count is zero.
    pub fn wait(&self, kernel: K) -> Result<()> {
        self.wait_impl(kernel, SemWait::Block)
    }

    /// Non-blocking take; fails with `would_block` at zero.  Safe from
    /// handler mode.
    pub fn try_wait(&self, kernel: K) -> Result<()> {
        self.wait_impl(kernel, SemWait::Try)
    }

    /// Timed take; fails with `timeout` when the deadline passes first.
    pub fn timed_wait(&self, kernel: K, timeout: Duration<SysTicks>) -> Result<()> {
        self.wait_impl(kernel, SemWait::Timed(timeout))
    }

    fn wait_impl(&self, kernel: K, wait: SemWait) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        if guard.count > 0 {
            guard.count -= 1;
            return Ok(());
        }

        let deadline = match wait {
            SemWait::Try => return Err(Error::WouldBlock),
            SemWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            SemWait::Timed(timeout) => unsafe {
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
        let (guard, status) =
            guard.block_current(Some(waiters), deadline, WaitPayload::None);
        guard.finish();
        status
    }

    /// Restores the initial count; every parked waiter observes
    /// `interrupted`.  Resetting an idle semaphore is a no-op.
    pub fn reset(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        unsafe {
            let (sched, inner) = guard.split();
            while let Some(waiter) = inner.waiters.head() {
                scheduler::wake_thread(kernel, sched, waiter, Err(Error::Interrupted));
            }
            inner.count = self.initial;
        }
        guard.finish();
        Ok(())
    }

    /// Number of threads currently blocked.
    #[must_use]
    pub fn waiting(&self, kernel: K) -> usize {
        self.state.lock(kernel).waiters.len()
    }
}

impl<K: Kernel> Drop for Semaphore<K> {
    fn drop(&mut self) {
        debug_assert!(self.state.lock(K::default()).waiters.is_empty());
    }
}
