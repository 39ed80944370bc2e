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

//! Unrecoverable failures.
//!
//! The kernel never unwinds.  When an invariant that cannot be reported
//! through a status code is violated, the port's fault hook takes over.

use log::error;

use crate::port::Port;

/// Reason codes handed to [`Port::fault`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum FaultCode {
    /// The run queue was empty at a reschedule point; the idle thread is
    /// missing or blocked.
    RunQueueEmpty = 1,
    /// `scheduler::start` was re-entered or returned.
    SchedulerState = 2,
    /// A thread operation was attempted from handler mode that cannot even
    /// report `Permission` (e.g. `exit`).
    HandlerModeViolation = 3,
    /// A stack canary was found overwritten.
    StackCorruption = 4,
    /// An object with parked waiters was destroyed.
    DestroyedWhileWaited = 5,
}

/// Reports `code` and enters the port fault hook.  Does not return.
pub fn fault<P: Port>(port: P, code: FaultCode) -> ! {
    error!("kernel fault: {:?}", code);
    port.fault(code)
}
