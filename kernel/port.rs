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

//! The port abstraction.
//!
//! Everything the kernel needs from a target lives behind the [`Port`] trait:
//! a spinlock built on the target's interrupt masking, a saved-register
//! context type, the context switch itself, the tick source and the fatal
//! error hook.  Ports are zero-sized `Copy` types passed by value, so the
//! whole kernel is monomorphized per target.

use crate::panic::FaultCode;
use crate::scheduler::thread::Stack;
use crate::scheduler::SchedulerState;
use crate::sync::spinlock::SpinLockGuard;
use crate::Kernel;

/// A mutual exclusion primitive the kernel state lives behind.
///
/// On a single-CPU target this is interrupt masking: `try_lock` always
/// succeeds and the guard restores the interrupt state on drop.  The
/// implementation must also provide `const NEW: Self` so locks can be
/// constructed in statics.
pub trait BareSpinLock: Sized {
    type Guard<'a>
    where
        Self: 'a;

    const NEW: Self;

    fn try_lock(&self) -> Option<Self::Guard<'_>>;

    #[inline(always)]
    fn lock(&self) -> Self::Guard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
        }
    }
}

/// Saved register state of a suspended thread.
pub trait ThreadContext: Sized {
    /// Context of a thread that has never run.
    const INIT: Self;

    /// Arranges for the thread to enter `entry(args.0, args.1)` on its first
    /// switch-in.  `entry` never returns; the kernel passes a trampoline that
    /// runs the thread body and then the exit path.
    fn initialize_frame(&mut self, stack: Stack, entry: extern "C" fn(usize, usize), args: (usize, usize));
}

/// The interface a target provides to the kernel.
pub trait Port: 'static + Copy + Default {
    type ThreadContext: ThreadContext;
    type BareSpinLock: BareSpinLock;

    /// Switches from `old_context` to `new_context`.
    ///
    /// Called with the scheduler lock held; the lock may be dropped and
    /// re-acquired across the switch and the returned guard is the one the
    /// resumed thread continues under.  When invoked from handler mode the
    /// port must defer the switch to interrupt exit (e.g. by pending the
    /// PendSV equivalent) and return immediately.
    ///
    /// # Safety
    /// Both context pointers must be valid and `new_context` must belong to
    /// the thread installed as current.
    unsafe fn context_switch(
        self,
        sched: SpinLockGuard<'_, Self, SchedulerState<Self>>,
        old_context: *mut Self::ThreadContext,
        new_context: *mut Self::ThreadContext,
    ) -> SpinLockGuard<'_, Self, SchedulerState<Self>>
    where
        Self: Kernel;

    /// True while executing an interrupt handler.
    fn in_handler_mode(self) -> bool;

    /// Masks interrupts, returning the prior status word.
    fn irq_save(self) -> u32;

    /// Restores a status word obtained from [`Port::irq_save`].
    fn irq_restore(self, status: u32);

    /// Configures the periodic tick to call [`crate::clock::on_tick`] at
    /// `hz`.
    fn start_tick(self, hz: u32);

    /// Free-running cycle counter for CPU time accounting.  Targets without
    /// one report a constant.
    fn cycle_count(self) -> u64 {
        0
    }

    /// Invoked on an unrecoverable kernel invariant violation.
    fn fault(self, code: FaultCode) -> !;

    /// Called by the lowest-priority thread when nothing is runnable.
    fn idle(self) {}
}

/// Masks interrupts for the enclosed scope.
///
/// The guard nests: each level saves the prior status word and restores it on
/// drop.
pub struct CriticalSection<P: Port> {
    port: P,
    status: u32,
}

impl<P: Port> CriticalSection<P> {
    #[must_use]
    pub fn new(port: P) -> Self {
        let status = port.irq_save();
        Self { port, status }
    }
}

impl<P: Port> Drop for CriticalSection<P> {
    fn drop(&mut self) {
        self.port.irq_restore(self.status);
    }
}

/// Unmasks interrupts inside a [`CriticalSection`] for the enclosed scope.
///
/// Status word 0 is the ports' convention for "fully enabled"; the drop
/// handler masks again.
pub struct UncriticalSection<P: Port> {
    port: P,
}

impl<P: Port> UncriticalSection<P> {
    #[must_use]
    pub fn new(port: P) -> Self {
        port.irq_restore(0);
        Self { port }
    }
}

impl<P: Port> Drop for UncriticalSection<P> {
    fn drop(&mut self) {
        let _ = self.port.irq_save();
    }
}
