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

//! Data protected by the port's bare spinlock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::port::{BareSpinLock, Port};

pub struct SpinLock<P: Port, T> {
    data: UnsafeCell<T>,
    inner: P::BareSpinLock,
}

// The lock provides the exclusion; the inner data only needs to be Send.
unsafe impl<P: Port, T: Send> Sync for SpinLock<P, T> {}

impl<P: Port, T> SpinLock<P, T> {
    pub const fn new(initial_value: T) -> Self {
        Self {
            data: UnsafeCell::new(initial_value),
            inner: P::BareSpinLock::NEW,
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, P, T>> {
        self.inner.try_lock().map(|guard| SpinLockGuard {
            lock: self,
            _inner_guard: guard,
        })
    }

    pub fn lock(&self) -> SpinLockGuard<'_, P, T> {
        SpinLockGuard {
            _inner_guard: self.inner.lock(),
            lock: self,
        }
    }
}

pub struct SpinLockGuard<'lock, P: Port, T> {
    lock: &'lock SpinLock<P, T>,
    _inner_guard: <P::BareSpinLock as BareSpinLock>::Guard<'lock>,
}

impl<P: Port, T> Deref for SpinLockGuard<'_, P, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<P: Port, T> DerefMut for SpinLockGuard<'_, P, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use crate::port::BareSpinLock as _;
    use crate::testutil::TestKernel;

    use super::*;

    #[test]
    fn bare_try_lock_reports_contention() {
        let lock = <TestKernel as Port>::BareSpinLock::NEW;

        {
            let _held = lock.lock();
            assert!(lock.try_lock().is_none());
        }

        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn guard_gives_exclusive_data_access() {
        let lock: SpinLock<TestKernel, bool> = SpinLock::new(false);

        {
            let mut guard = lock.lock();
            *guard = true;
            assert!(lock.try_lock().is_none());
        }

        let guard = lock.lock();
        assert!(*guard);
    }
}
