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

//! Mutexes.
//!
//! Supports the POSIX type and protocol matrix: normal, recursive and
//! error-checking types; no protocol, priority inheritance and priority
//! ceiling (protect); and robustness against owner termination.
//!
//! Unlock hands the mutex directly to the oldest highest-priority waiter:
//! the woken thread returns from its lock call already owning the mutex,
//! with no window in which a third thread could slip in.

use core::ptr::NonNull;

use list::Link;
use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::scheduler::thread::{priority, Thread};
use crate::scheduler::{self, SchedLock, SchedulerState, WaitList, WaitPayload};
use crate::Kernel;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutexKind {
    /// No owner checks on lock; this implementation reports a self-deadlock
    /// instead of hanging.
    Normal,
    /// The owner may re-lock; unlock decrements the recursion count.
    Recursive,
    /// Re-lock by the owner and unlock by a non-owner are errors.
    ErrorCheck,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutexProtocol {
    None,
    /// Priority inheritance: a blocked acquirer boosts the owner (and any
    /// chain of owners it is transitively blocked on).
    Inherit,
    /// Immediate priority ceiling: the owner runs at the ceiling priority.
    Protect,
}

/// Creation attributes.
#[derive(Clone, Copy)]
pub struct MutexAttributes {
    pub kind: MutexKind,
    pub protocol: MutexProtocol,
    pub ceiling: u8,
    pub robust: bool,
}

impl Default for MutexAttributes {
    fn default() -> Self {
        Self {
            kind: MutexKind::Normal,
            protocol: MutexProtocol::None,
            ceiling: priority::MAX,
            robust: false,
        }
    }
}

impl MutexAttributes {
    #[must_use]
    pub fn recursive() -> Self {
        Self {
            kind: MutexKind::Recursive,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn errorcheck() -> Self {
        Self {
            kind: MutexKind::ErrorCheck,
            ..Self::default()
        }
    }
}

pub(crate) struct MutexInner<K: Kernel> {
    // Links the mutex into its owner's held-mutex list.
    pub(crate) owner_link: Link,
    pub(crate) owner: Option<NonNull<Thread<K>>>,
    recursion: u32,
    pub(crate) ceiling: u8,
    protocol: MutexProtocol,
    robust: bool,
    consistent: bool,
    recoverable: bool,
    pub(crate) waiters: WaitList<K>,
}

list::define_adapter!(pub(crate) OwnedMutexAdapter<K: Kernel> => MutexInner<K>::owner_link);

impl<K: Kernel> MutexInner<K> {
    /// The priority this mutex imposes on its owner.
    pub(crate) fn priority_contribution(&self) -> u8 {
        match self.protocol {
            MutexProtocol::Protect => self.ceiling,
            MutexProtocol::Inherit => unsafe { self.waiters.head_priority() },
            MutexProtocol::None => priority::NONE,
        }
    }

    pub(crate) fn inherits_priority(&self) -> bool {
        self.protocol == MutexProtocol::Inherit
    }
}

/// A mutual exclusion object with optional recursion, error checking,
/// robustness, and a priority protocol.
pub struct Mutex<K: Kernel> {
    name: &'static str,
    kind: MutexKind,
    state: SchedLock<K, MutexInner<K>>,
}

enum LockWait {
    Block,
    Try,
    Timed(Duration<SysTicks>),
}

impl<K: Kernel> Mutex<K> {
    #[must_use]
    pub const fn new(name: &'static str, attr: MutexAttributes) -> Self {
        Self {
            name,
            kind: attr.kind,
            state: SchedLock::new(MutexInner {
                owner_link: Link::new(),
                owner: None,
                recursion: 0,
                ceiling: attr.ceiling,
                protocol: attr.protocol,
                robust: attr.robust,
                consistent: true,
                recoverable: true,
                waiters: WaitList::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    #[must_use]
    pub fn is_owned(&self, kernel: K) -> bool {
        self.state.lock(kernel).owner.is_some()
    }

    /// Identifier of the owning thread (see [`Thread::id`]), if any.
    ///
    /// [`Thread::id`]: crate::scheduler::thread::Thread::id
    #[must_use]
    pub fn owner_id(&self, kernel: K) -> Option<usize> {
        let guard = self.state.lock(kernel);
        guard.owner.map(|t| unsafe { t.as_ref().id() })
    }

    /// Acquires the mutex, blocking while another thread owns it.
    ///
    /// On a robust mutex whose previous owner died, acquisition succeeds
    /// with `owner_dead`; the caller must restore the protected state and
    /// call [`mark_consistent`] before unlocking.
    ///
    /// [`mark_consistent`]: Mutex::mark_consistent
    pub fn lock(&self, kernel: K) -> Result<()> {
        self.lock_impl(kernel, LockWait::Block)
    }

    /// Non-blocking acquire; fails with `would_block` under contention.
    pub fn try_lock(&self, kernel: K) -> Result<()> {
        self.lock_impl(kernel, LockWait::Try)
    }

    /// Acquire with a timeout; fails with `timeout` when it expires first.
    pub fn timed_lock(&self, kernel: K, timeout: Duration<SysTicks>) -> Result<()> {
        self.lock_impl(kernel, LockWait::Timed(timeout))
    }

    fn lock_impl(&self, kernel: K, wait: LockWait) -> Result<()> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        let mut guard = self.state.lock(kernel);
        let Some(current) = guard.sched_ref().current_ptr() else {
            return Err(Error::Permission);
        };
        let inner = unsafe { NonNull::new_unchecked(self.state.raw()) };
        let m = inner.as_ptr();

        unsafe {
            if (*m).owner.is_none() {
                if !(*m).recoverable {
                    return Err(Error::NotRecoverable);
                }
                if (*m).protocol == MutexProtocol::Protect
                    && current.as_ref().effective_priority > (*m).ceiling
                {
                    return Err(Error::Invalid);
                }
                grant(guard.sched(), inner, current);
                if (*m).robust && !(*m).consistent {
                    return Err(Error::OwnerDead);
                }
                return Ok(());
            }

            if (*m).owner == Some(current) {
                return match self.kind {
                    MutexKind::Recursive => match (*m).recursion.checked_add(1) {
                        Some(count) => {
                            (*m).recursion = count;
                            Ok(())
                        }
                        None => Err(Error::Again),
                    },
                    // A normal mutex would deadlock here; report it rather
                    // than hang.
                    MutexKind::Normal | MutexKind::ErrorCheck => Err(Error::Deadlock),
                };
            }
        }

        // The ceiling check holds whether or not the mutex is free: a
        // thread above the ceiling must never queue on it.
        unsafe {
            if (*m).protocol == MutexProtocol::Protect
                && current.as_ref().effective_priority > (*m).ceiling
            {
                return Err(Error::Invalid);
            }
        }

        let deadline = match wait {
            LockWait::Try => return Err(Error::WouldBlock),
            LockWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            LockWait::Timed(timeout) => unsafe {
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };

        unsafe {
            if (*m).protocol == MutexProtocol::Inherit {
                scheduler::boost_priority_chain(
                    guard.sched(),
                    inner,
                    current.as_ref().effective_priority,
                );
            }
            (*current.as_ptr()).blocked_on_mutex = Some(inner);
        }

        let wait_list = unsafe { NonNull::from(&mut (*m).waiters) };
        let (mut guard, status) =
            guard.block_current(Some(wait_list), deadline, WaitPayload::None);

        match status {
            // Ownership was handed to us by the releaser.
            Ok(()) => {
                guard.finish();
                Ok(())
            }
            Err(Error::OwnerDead) => {
                guard.finish();
                Err(Error::OwnerDead)
            }
            Err(e) => {
                // Not acquired: our departure from the waiting list may
                // lower the owner's inherited priority.
                unsafe {
                    if let Some(owner) = (*m).owner {
                        scheduler::refresh_priority(guard.sched(), owner);
                    }
                }
                guard.finish();
                Err(e)
            }
        }
    }

    /// Releases the mutex, waking the oldest highest-priority waiter as the
    /// new owner.
    pub fn unlock(&self, kernel: K) -> Result<()> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        let mut guard = self.state.lock(kernel);
        let Some(current) = guard.sched_ref().current_ptr() else {
            return Err(Error::Permission);
        };
        let inner = unsafe { NonNull::new_unchecked(self.state.raw()) };
        let m = inner.as_ptr();

        unsafe {
            if (*m).owner != Some(current) {
                return Err(Error::Permission);
            }
            if (*m).recursion > 1 {
                (*m).recursion -= 1;
                return Ok(());
            }
            release_and_handoff(kernel, guard.sched(), inner);
        }
        guard.finish();
        Ok(())
    }

    /// Restores a robust mutex to consistent after an `owner_dead`
    /// acquisition.  Must be called by the owner before unlocking.
    pub fn mark_consistent(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        let current = guard.sched_ref().current_ptr();
        let (_, inner) = guard.split();
        if !inner.robust {
            return Err(Error::Invalid);
        }
        if !inner.recoverable {
            return Err(Error::NotRecoverable);
        }
        if inner.consistent || inner.owner != current {
            return Err(Error::Invalid);
        }
        inner.consistent = true;
        Ok(())
    }

    /// Forcibly returns the mutex to its initial state: the holder (if any)
    /// loses ownership and every waiter is woken with `interrupted`.
    pub fn reset(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        let inner = unsafe { NonNull::new_unchecked(self.state.raw()) };
        let m = inner.as_ptr();
        unsafe {
            if let Some(owner) = (*m).owner.take() {
                (*owner.as_ptr()).owned_mutexes.unlink_element(inner);
                (*m).recursion = 0;
                scheduler::refresh_priority(guard.sched(), owner);
            }
            wake_all(kernel, guard.sched(), inner, Err(Error::Interrupted));
            (*m).consistent = true;
            (*m).recoverable = true;
        }
        guard.finish();
        Ok(())
    }

    #[must_use]
    pub fn prio_ceiling(&self, kernel: K) -> u8 {
        self.state.lock(kernel).ceiling
    }

    /// Changes the ceiling, returning the previous value.  The mutex must be
    /// free or held by the caller.
    pub fn set_prio_ceiling(&self, kernel: K, ceiling: u8) -> Result<u8> {
        if ceiling >= priority::ISR {
            return Err(Error::Invalid);
        }
        let mut guard = self.state.lock(kernel);
        let current = guard.sched_ref().current_ptr();
        let (_, inner) = guard.split();
        if inner.owner.is_some() && inner.owner != current {
            return Err(Error::WouldBlock);
        }
        let prior = inner.ceiling;
        inner.ceiling = ceiling;
        Ok(prior)
    }

    /// Number of threads blocked on the mutex.
    #[must_use]
    pub fn waiting(&self, kernel: K) -> usize {
        self.state.lock(kernel).waiters.len()
    }

    /// Pointer to the protected state, for the condition variable paths.
    /// Dereferencing requires the scheduler lock.
    pub(crate) fn inner_ptr(&self) -> NonNull<MutexInner<K>> {
        unsafe { NonNull::new_unchecked(self.state.raw()) }
    }
}

impl<K: Kernel> Drop for Mutex<K> {
    fn drop(&mut self) {
        debug_assert!(self.state.lock(K::default()).waiters.is_empty());
    }
}

// Makes `thread` the owner.  Caller holds the scheduler lock; the mutex must
// be ownerless.
unsafe fn grant<K: Kernel>(
    sched: &mut SchedulerState<K>,
    inner: NonNull<MutexInner<K>>,
    thread: NonNull<Thread<K>>,
) {
    let m = inner.as_ptr();
    debug_assert!((*m).owner.is_none());
    (*m).owner = Some(thread);
    (*m).recursion = 1;
    (*thread.as_ptr()).owned_mutexes.push_back_unchecked(m);
    if (*m).protocol == MutexProtocol::Protect {
        scheduler::refresh_priority(sched, thread);
    }
}

// Fully releases the mutex held by its owner and hands it to the next
// waiter, if any.  Caller holds the scheduler lock.
pub(crate) unsafe fn release_and_handoff<K: Kernel>(
    kernel: K,
    sched: &mut SchedulerState<K>,
    inner: NonNull<MutexInner<K>>,
) {
    let m = inner.as_ptr();
    let owner = (*m).owner.take().expect("release of unowned mutex");
    (*m).recursion = 0;
    (*owner.as_ptr()).owned_mutexes.unlink_element(inner);
    scheduler::refresh_priority(sched, owner);

    if (*m).robust && !(*m).consistent {
        // Unlocked while still inconsistent: unusable from here on.
        (*m).recoverable = false;
        wake_all(kernel, sched, inner, Err(Error::NotRecoverable));
        return;
    }

    if let Some(next) = (*m).waiters.head() {
        grant(sched, inner, next);
        scheduler::wake_thread(kernel, sched, next, Ok(()));
        // The new owner may still inherit from remaining waiters.
        if (*m).protocol == MutexProtocol::Inherit && !(*m).waiters.is_empty() {
            scheduler::refresh_priority(sched, next);
        }
    }
}

/// Hands the mutex to `waiter`, a thread a condition variable is waking.
///
/// If the mutex is free the waiter becomes the owner and wakes; otherwise it
/// is moved from the condition variable's waiting list onto the mutex's
/// (wait morphing) and wakes later, when the mutex is handed to it.  Its
/// clock link is released either way: once signaled, re-acquisition is not
/// bounded by the original timed wait.
///
/// Caller holds the scheduler lock.
pub(crate) unsafe fn signal_transfer<K: Kernel>(
    kernel: K,
    sched: &mut SchedulerState<K>,
    mutex: NonNull<MutexInner<K>>,
    waiter: NonNull<Thread<K>>,
) {
    let m = mutex.as_ptr();
    let t = waiter.as_ptr();

    if !(*m).recoverable {
        scheduler::wake_thread(kernel, sched, waiter, Err(Error::NotRecoverable));
        return;
    }

    if (*m).owner.is_none() {
        grant(sched, mutex, waiter);
        let status = if (*m).robust && !(*m).consistent {
            Err(Error::OwnerDead)
        } else {
            Ok(())
        };
        scheduler::wake_thread(kernel, sched, waiter, status);
        return;
    }

    // Morph: leave the condvar list, join the mutex waiters.
    if let Some(mut list) = (*t).wait_anchor.take() {
        list.as_mut().remove(waiter);
    }
    if let Some(clock) = (*t).clock_anchor.take() {
        (*clock.as_ptr()).remove_sleeper(waiter);
    }
    (*m).waiters.insert(waiter);
    (*t).wait_anchor = Some(NonNull::from(&mut (*m).waiters));
    (*t).blocked_on_mutex = Some(mutex);
    if (*m).protocol == MutexProtocol::Inherit {
        scheduler::boost_priority_chain(sched, mutex, (*t).effective_priority);
    }
}

/// True when a full release (recursion one) is in effect; condition
/// variables refuse to wait with a nested recursive lock.
pub(crate) unsafe fn held_once_by<K: Kernel>(
    inner: NonNull<MutexInner<K>>,
    thread: NonNull<Thread<K>>,
) -> bool {
    let m = inner.as_ptr();
    (*m).owner == Some(thread) && (*m).recursion == 1
}

unsafe fn wake_all<K: Kernel>(
    kernel: K,
    sched: &mut SchedulerState<K>,
    inner: NonNull<MutexInner<K>>,
    status: Result<()>,
) {
    let m = inner.as_ptr();
    while let Some(waiter) = (*m).waiters.head() {
        scheduler::wake_thread(kernel, sched, waiter, status);
    }
}

/// Abandons every mutex held by a terminating thread.
///
/// Robust mutexes become inconsistent and pass to their next waiter with
/// `owner_dead`.  Non-robust mutexes cannot be recovered; they become
/// permanently unusable and their waiters observe `not_recoverable`.
///
/// Caller holds the scheduler lock.
pub(crate) unsafe fn abandon_owned<K: Kernel>(
    kernel: K,
    sched: &mut SchedulerState<K>,
    thread: NonNull<Thread<K>>,
) {
    let t = thread.as_ptr();
    loop {
        let Some(inner) = (*t).owned_mutexes.peek_head() else {
            return;
        };
        let m = inner.as_ptr();
        (*t).owned_mutexes.unlink_element_unchecked(m);
        (*m).owner = None;
        (*m).recursion = 0;

        if (*m).robust {
            (*m).consistent = false;
            if let Some(next) = (*m).waiters.head() {
                grant(sched, inner, next);
                scheduler::wake_thread(kernel, sched, next, Err(Error::OwnerDead));
            }
        } else {
            (*m).recoverable = false;
            wake_all(kernel, sched, inner, Err(Error::NotRecoverable));
        }
    }
}
