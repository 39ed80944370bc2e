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

//! # kestrel kernel
//!
//! The core of a preemptive real-time kernel for single-CPU
//! microcontrollers: a strict-priority scheduler with FIFO order within a
//! level, intrusive wait and sleep lists, and a POSIX-flavoured primitive
//! set (mutexes with inheritance/ceiling/robustness, condition variables,
//! semaphores, event flags, message queues, memory pools and timers) driven
//! by a tick clock and a derived wall clock.
//!
//! The kernel is generic over a [`Port`]: a zero-sized handle for one
//! target, supplying interrupt masking, the saved-register context type and
//! the context switch.  A target implements [`Port`] and [`Kernel`] (which
//! exposes the static [`KernelState`]) and passes its handle by value into
//! every kernel call.

#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod config;
pub mod memory;
pub mod mempool;
pub mod mqueue;
pub mod panic;
pub mod port;
pub mod scheduler;
pub mod sync;
pub mod timer;

#[cfg(test)]
pub(crate) mod testutil;

pub use clock::{rtclock, sysclock, on_tick, ClockState, RtClock, RtSeconds, SysClock, SysTicks};
pub use memory::{set_default_resource, MemoryResource, NullResource};
pub use mempool::MemoryPool;
pub use mqueue::MessageQueue;
pub use panic::FaultCode;
pub use port::{BareSpinLock, CriticalSection, Port, ThreadContext, UncriticalSection};
pub use scheduler::thread::{
    priority, this_thread, Stack, StackStorage, StackStorageExt, State, Thread, ThreadAttributes,
    ThreadEntry,
};
pub use scheduler::SchedulerState;
pub use sync::condvar::Condvar;
pub use sync::spinlock::{SpinLock, SpinLockGuard};
pub use sync::eventflags::EventFlags;
pub use sync::mutex::{Mutex, MutexAttributes, MutexKind, MutexProtocol};
pub use sync::semaphore::{Semaphore, SemaphoreAttributes};
pub use timer::{Timer, TimerAttributes, TimerState};

// Re-exported so applications use the same time types the kernel does.
pub use ticktime::{Duration, Instant};

use scheduler::SchedLock;
use timer::TimerQueue;

/// A port with process-wide kernel state attached.
pub trait Kernel: Port + Sync {
    fn state(self) -> &'static KernelState<Self>;

    fn get_scheduler(self) -> &'static SpinLock<Self, SchedulerState<Self>> {
        &self.state().scheduler
    }

    fn sysclock_state(self) -> &'static SchedLock<Self, ClockState<Self>> {
        &self.state().sysclock
    }

    fn rtclock_state(self) -> &'static SchedLock<Self, ClockState<Self>> {
        &self.state().rtclock
    }

    fn timer_queue(self) -> &'static SchedLock<Self, TimerQueue<Self>> {
        &self.state().timers
    }
}

/// All mutable kernel state for one target, declared in a `static`.
pub struct KernelState<K: Kernel> {
    scheduler: SpinLock<K, SchedulerState<K>>,
    sysclock: SchedLock<K, ClockState<K>>,
    rtclock: SchedLock<K, ClockState<K>>,
    timers: SchedLock<K, TimerQueue<K>>,
}

impl<K: Kernel> KernelState<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            scheduler: SpinLock::new(SchedulerState::new()),
            sysclock: SchedLock::new(ClockState::new("sysclock")),
            rtclock: SchedLock::new(ClockState::new("rtclock")),
            timers: SchedLock::new(TimerQueue::new()),
        }
    }
}

impl<K: Kernel> Default for KernelState<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// One-time startup: initializes the scheduler and starts the tick source.
pub fn initialize<K: Kernel>(kernel: K) -> status::Result<()> {
    scheduler::initialize(kernel)
}
