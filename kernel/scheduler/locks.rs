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

//! Primitive state sharing the global scheduler lock.
//!
//! Every kernel object (mutex, semaphore, queue, ...) keeps its mutable state
//! in a [`SchedLock`].  Locking one acquires the single scheduler spinlock,
//! so a guard gives coherent access to the object's state *and* the scheduler
//! itself, which is exactly what wait and wake paths need.  Taking two
//! `SchedLock`s at once would self-deadlock; the kernel never does.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use status::Result;

use crate::clock::ClockState;
use crate::scheduler::{self, SchedulerState, WaitList, WaitPayload};
use crate::sync::spinlock::SpinLockGuard;
use crate::Kernel;

pub struct SchedLock<K: Kernel, T> {
    data: UnsafeCell<T>,
    _kernel: core::marker::PhantomData<K>,
}

unsafe impl<K: Kernel, T: Send> Sync for SchedLock<K, T> {}
unsafe impl<K: Kernel, T: Send> Send for SchedLock<K, T> {}

impl<K: Kernel, T> SchedLock<K, T> {
    pub const fn new(initial_value: T) -> Self {
        Self {
            data: UnsafeCell::new(initial_value),
            _kernel: core::marker::PhantomData,
        }
    }

    pub fn lock(&self, kernel: K) -> SchedLockGuard<'_, K, T> {
        SchedLockGuard {
            sched: kernel.get_scheduler().lock(),
            data: self.data.get(),
            kernel,
            _borrow: core::marker::PhantomData,
        }
    }

    /// Raw access for code already holding the scheduler lock through some
    /// other guard.
    ///
    /// # Safety
    /// The scheduler lock must be held for the duration of any access.
    pub(crate) unsafe fn raw(&self) -> *mut T {
        self.data.get()
    }
}

pub struct SchedLockGuard<'lock, K: Kernel, T> {
    sched: SpinLockGuard<'static, K, SchedulerState<K>>,
    data: *mut T,
    kernel: K,
    // Ties the guard to the borrow of the owning `SchedLock`.
    _borrow: core::marker::PhantomData<&'lock T>,
}

impl<K: Kernel, T> SchedLockGuard<'_, K, T> {
    #[must_use]
    pub fn kernel(&self) -> K {
        self.kernel
    }

    pub(crate) fn sched(&mut self) -> &mut SchedulerState<K> {
        &mut self.sched
    }

    pub(crate) fn sched_ref(&self) -> &SchedulerState<K> {
        &self.sched
    }

    /// Simultaneous access to the scheduler and the protected data; both
    /// live behind the one lock this guard holds.
    pub(crate) fn split(&mut self) -> (&mut SchedulerState<K>, &mut T) {
        let data = unsafe { &mut *self.data };
        (&mut self.sched, data)
    }

    /// Parks the calling thread through [`scheduler::block_current`],
    /// releasing and re-acquiring the scheduler lock across the context
    /// switch while keeping this guard's data accessible afterwards.
    pub(crate) fn block_current(
        self,
        wait_list: Option<NonNull<WaitList<K>>>,
        deadline: Option<(NonNull<ClockState<K>>, u64)>,
        payload: WaitPayload<K>,
    ) -> (Self, Result<()>) {
        let Self {
            sched, data, kernel, ..
        } = self;
        let (sched, status) =
            scheduler::block_current(kernel, sched, wait_list, deadline, payload);
        (
            Self {
                sched,
                data,
                kernel,
                _borrow: core::marker::PhantomData,
            },
            status,
        )
    }

    /// Runs a pending preemption before the guard is released.
    pub(crate) fn finish(self) {
        let Self { sched, kernel, .. } = self;
        let sched = scheduler::maybe_preempt(kernel, sched);
        drop(sched);
    }
}

impl<K: Kernel, T> Deref for SchedLockGuard<'_, K, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<K: Kernel, T> DerefMut for SchedLockGuard<'_, K, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}
