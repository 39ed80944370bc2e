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

//! Condition variables.
//!
//! `wait` atomically releases the associated mutex and parks the caller;
//! the mutex is re-acquired before `wait` returns, whatever the outcome.
//! `signal` uses wait morphing: rather than waking a thread that would
//! immediately block on the mutex, the waiter is granted the mutex directly
//! if it is free, or moved onto the mutex's waiting list if it is not.
//! Callers are expected to loop over their predicate.

use core::ptr::NonNull;

use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::scheduler::{SchedLock, WaitList, WaitPayload};
use crate::sync::mutex::{self, Mutex};
use crate::Kernel;

struct CondvarInner<K: Kernel> {
    waiters: WaitList<K>,
}

/// A condition variable tied to a [`Mutex`] by each wait.
pub struct Condvar<K: Kernel> {
    name: &'static str,
    state: SchedLock<K, CondvarInner<K>>,
}

impl<K: Kernel> Condvar<K> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: SchedLock::new(CondvarInner {
                waiters: WaitList::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Releases `mutex` and waits for a signal, re-acquiring `mutex` before
    /// returning.  The caller must hold `mutex` exactly once.
    pub fn wait(&self, kernel: K, mutex: &Mutex<K>) -> Result<()> {
        self.wait_impl(kernel, mutex, None)
    }

    /// Timed variant; on expiry the mutex is still re-acquired and the wait
    /// reports `timeout`.
    pub fn timed_wait(
        &self,
        kernel: K,
        mutex: &Mutex<K>,
        timeout: Duration<SysTicks>,
    ) -> Result<()> {
        self.wait_impl(kernel, mutex, Some(timeout))
    }

    fn wait_impl(
        &self,
        kernel: K,
        mutex: &Mutex<K>,
        timeout: Option<Duration<SysTicks>>,
    ) -> Result<()> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        let mut guard = self.state.lock(kernel);
        let Some(current) = guard.sched_ref().current_ptr() else {
            return Err(Error::Permission);
        };
        let minner = mutex.inner_ptr();

        unsafe {
            if !mutex::held_once_by(minner, current) {
                return Err(Error::Permission);
            }
            // Atomic with respect to other threads: the scheduler lock spans
            // the release and the park.
            mutex::release_and_handoff(kernel, guard.sched(), minner);
        }

        let deadline = match timeout {
            // Safety: `guard` holds the scheduler lock.
            Some(timeout) => unsafe { Some(crate::clock::sys_deadline_after(kernel, timeout)) },
            None => None,
        };

        let waiters = unsafe { NonNull::from(&mut (*self.state.raw()).waiters) };
        let payload = WaitPayload::CondWait { mutex: minner };
        let (guard, status) = guard.block_current(Some(waiters), deadline, payload);

        match status {
            // Signaled: the mutex was handed to us (directly or after
            // morphing onto its waiting list).
            Ok(()) => {
                guard.finish();
                Ok(())
            }
            // The previous owner died while we were re-acquiring; we own the
            // mutex and must recover it.
            Err(Error::OwnerDead) => {
                guard.finish();
                Err(Error::OwnerDead)
            }
            // The mutex became unusable; nothing to re-acquire.
            Err(Error::NotRecoverable) => {
                guard.finish();
                Err(Error::NotRecoverable)
            }
            // Timeout or interruption hit while still on the condvar list;
            // honor the contract by re-acquiring the mutex first.
            Err(e) => {
                guard.finish();
                match mutex.lock(kernel) {
                    Err(Error::OwnerDead) => Err(Error::OwnerDead),
                    _ => Err(e),
                }
            }
        }
    }

    /// Wakes the oldest highest-priority waiter.
    pub fn signal(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        unsafe {
            let (sched, inner) = guard.split();
            if let Some(waiter) = inner.waiters.head() {
                if let WaitPayload::CondWait { mutex } = (*waiter.as_ptr()).payload {
                    mutex::signal_transfer(kernel, sched, mutex, waiter);
                }
            }
        }
        guard.finish();
        Ok(())
    }

    /// Wakes every thread currently waiting.  Threads that cannot take the
    /// mutex immediately queue on it in priority order.
    pub fn broadcast(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        unsafe {
            loop {
                let (sched, inner) = guard.split();
                let Some(waiter) = inner.waiters.head() else {
                    break;
                };
                match (*waiter.as_ptr()).payload {
                    WaitPayload::CondWait { mutex } => {
                        mutex::signal_transfer(kernel, sched, mutex, waiter);
                    }
                    _ => crate::scheduler::wake_thread(
                        kernel,
                        sched,
                        waiter,
                        Err(Error::Interrupted),
                    ),
                }
            }
        }
        guard.finish();
        Ok(())
    }

    /// Number of threads currently waiting.
    #[must_use]
    pub fn waiting(&self, kernel: K) -> usize {
        self.state.lock(kernel).waiters.len()
    }
}

impl<K: Kernel> Drop for Condvar<K> {
    fn drop(&mut self) {
        debug_assert!(self.state.lock(K::default()).waiters.is_empty());
    }
}
