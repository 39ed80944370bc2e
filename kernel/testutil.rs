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

//! A stub port for host tests.
//!
//! Tests drive the kernel single-threaded: they fabricate threads, park and
//! wake them through the internal machinery, and advance the tick by hand.
//! An attempted context switch is a test bug and panics.  The global kernel
//! state is shared, so every test takes a [`session`], which serializes
//! tests and resets the state.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

use crate::clock::ClockState;
use crate::panic::FaultCode;
use crate::port::{BareSpinLock, Port, ThreadContext};
use crate::scheduler::thread::{State, Thread};
use crate::scheduler::SchedulerState;
use crate::sync::spinlock::SpinLockGuard;
use crate::timer::TimerQueue;
use crate::{Kernel, KernelState};

#[derive(Clone, Copy, Default)]
pub(crate) struct TestKernel;

pub(crate) struct TestSpinLock {
    locked: AtomicBool,
}

pub(crate) struct TestSpinGuard<'a> {
    lock: &'a TestSpinLock,
}

impl BareSpinLock for TestSpinLock {
    type Guard<'a>
        = TestSpinGuard<'a>
    where
        Self: 'a;

    const NEW: Self = Self {
        locked: AtomicBool::new(false),
    };

    fn try_lock(&self) -> Option<TestSpinGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TestSpinGuard { lock: self })
    }
}

impl Drop for TestSpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

pub(crate) struct TestContext;

impl ThreadContext for TestContext {
    const INIT: Self = TestContext;

    fn initialize_frame(
        &mut self,
        _stack: crate::Stack,
        _entry: extern "C" fn(usize, usize),
        _args: (usize, usize),
    ) {
    }
}

static HANDLER_MODE: AtomicBool = AtomicBool::new(false);
static CYCLES: AtomicU64 = AtomicU64::new(0);

impl Port for TestKernel {
    type ThreadContext = TestContext;
    type BareSpinLock = TestSpinLock;

    unsafe fn context_switch(
        self,
        _sched: SpinLockGuard<'_, Self, SchedulerState<Self>>,
        _old_context: *mut TestContext,
        _new_context: *mut TestContext,
    ) -> SpinLockGuard<'_, Self, SchedulerState<Self>> {
        panic!("context switch attempted in host tests");
    }

    fn in_handler_mode(self) -> bool {
        HANDLER_MODE.load(Ordering::Relaxed)
    }

    fn irq_save(self) -> u32 {
        0
    }

    fn irq_restore(self, _status: u32) {}

    fn start_tick(self, _hz: u32) {}

    fn cycle_count(self) -> u64 {
        CYCLES.load(Ordering::Relaxed)
    }

    fn fault(self, code: FaultCode) -> ! {
        panic!("kernel fault: {code:?}");
    }
}

impl Kernel for TestKernel {
    fn state(self) -> &'static KernelState<TestKernel> {
        static STATE: KernelState<TestKernel> = KernelState::new();
        &STATE
    }
}

static SESSION_LOCK: StdMutex<()> = StdMutex::new(());

pub(crate) struct TestSession {
    _guard: StdMutexGuard<'static, ()>,
}

/// Serializes the test and resets all global kernel state.
pub(crate) fn session() -> TestSession {
    let guard = SESSION_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let kernel = TestKernel;

    {
        let mut sched = kernel.get_scheduler().lock();
        *sched = SchedulerState::new();
        unsafe {
            *kernel.sysclock_state().raw() = ClockState::new("sysclock");
            *kernel.rtclock_state().raw() = ClockState::new("rtclock");
            *kernel.timer_queue().raw() = TimerQueue::new();
        }
    }
    HANDLER_MODE.store(false, Ordering::Relaxed);
    CYCLES.store(0, Ordering::Relaxed);

    TestSession { _guard: guard }
}

pub(crate) fn set_handler_mode(on: bool) {
    HANDLER_MODE.store(on, Ordering::Relaxed);
}

/// A control block with its priority set, not yet linked anywhere.
pub(crate) fn thread(name: &'static str, prio: u8) -> Thread<TestKernel> {
    let mut t = Thread::new(name);
    t.base_priority = prio;
    t.effective_priority = prio;
    t
}

/// Installs `t` as the running thread.
pub(crate) fn adopt_current(t: &mut Thread<TestKernel>) {
    let mut sched = TestKernel.get_scheduler().lock();
    sched.test_adopt_current(NonNull::from(t));
}

/// Links `t` into the ready queue.
pub(crate) fn make_ready(t: &mut Thread<TestKernel>) {
    let mut sched = TestKernel.get_scheduler().lock();
    t.state = State::Ready;
    unsafe {
        sched.insert_ready_tail(NonNull::from(t));
    }
}

/// Ticks the sysclock `n` times.
pub(crate) fn run_ticks(n: u64) {
    for _ in 0..n {
        crate::clock::on_tick(TestKernel);
    }
}

/// Current sysclock tick.
pub(crate) fn now() -> u64 {
    crate::clock::sysclock(TestKernel).now().ticks()
}
