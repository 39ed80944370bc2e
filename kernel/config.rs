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

//! Compile-time kernel configuration.

use static_assertions::const_assert;

/// Rate of the monotonic system tick.
pub const TICK_HZ: u32 = 1_000;

/// Number of scheduling priority levels.  Level 0 is reserved
/// ([`priority::NONE`]), the highest level is reserved for interrupt
/// priority; runnable threads use the range in between.
///
/// [`priority::NONE`]: crate::scheduler::thread::priority::NONE
pub const PRIORITY_LEVELS: usize = 64;

/// Initial value of the process-wide default thread stack size.
pub const DEFAULT_STACK_SIZE_BYTES: usize = 2048;

/// Initial value of the process-wide minimum thread stack size.
pub const MIN_STACK_SIZE_BYTES: usize = 256;

// The ready queue tracks non-empty priority levels in a single machine word.
const_assert!(PRIORITY_LEVELS <= u64::BITS as usize);
const_assert!(TICK_HZ > 0);
