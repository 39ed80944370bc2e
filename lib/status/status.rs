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

//! # status
//!
//! Error codes returned by every fallible kestrel kernel operation.  The
//! numeric values are part of the kernel ABI: the C facade forwards them
//! unchanged, so they must stay stable.  `OK` is omitted from the `Error`
//! enum to keep the interface idiomatic for Rust; the [`StatusCode`] trait
//! turns a `Result` back into the canonical numeric code.
//!
//! # Example
//!
//! ```
//! use status::{Error, Result, StatusCode};
//!
//! fn take_token(count: &mut u32) -> Result<()> {
//!     if *count == 0 {
//!         return Err(Error::WouldBlock);
//!     }
//!     *count -= 1;
//!     Ok(())
//! }
//!
//! let mut count = 1;
//! assert_eq!(take_token(&mut count), Ok(()));
//! assert_eq!(take_token(&mut count), Err(Error::WouldBlock));
//! assert_eq!(take_token(&mut count).status_code(), 4);
//! ```

#![cfg_attr(not(test), no_std)]

/// Status code reported for a successful operation.
pub const OK: u32 = 0;

/// Failure codes surfaced by kernel operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Error {
    /// The calling context is not allowed to perform the operation, e.g. a
    /// blocking call from an interrupt handler or an unlock by a non-owner.
    Permission = 1,
    /// A parameter is outside the accepted domain.
    Invalid = 2,
    /// A timed wait reached its deadline before the event occurred.
    Timeout = 3,
    /// A non-blocking operation would have had to suspend.
    WouldBlock = 4,
    /// The wait was abandoned because the object was reset or destroyed.
    Interrupted = 5,
    /// A robust mutex was left inconsistent and can no longer be acquired.
    NotRecoverable = 6,
    /// A transient resource limit was hit; retrying may succeed.
    Again = 7,
    /// The operation would deadlock the calling thread.
    Deadlock = 8,
    /// The previous owner of a robust mutex terminated while holding it.
    OwnerDead = 9,
    /// A message payload exceeds the queue's fixed message size.
    MessageSize = 10,
    /// A received message is malformed.
    BadMessage = 11,
    /// An allocation from the memory resource failed.
    NoMemory = 12,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Convert a `Result` into the stable numeric status code.
pub trait StatusCode {
    fn status_code(self) -> u32;
}

impl<T> StatusCode for Result<T> {
    fn status_code(self) -> u32 {
        match self {
            Ok(_) => OK,
            Err(e) => e as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes_are_stable() {
        assert_eq!(OK, 0);
        assert_eq!(Error::Permission as u32, 1);
        assert_eq!(Error::Invalid as u32, 2);
        assert_eq!(Error::Timeout as u32, 3);
        assert_eq!(Error::WouldBlock as u32, 4);
        assert_eq!(Error::Interrupted as u32, 5);
        assert_eq!(Error::NotRecoverable as u32, 6);
        assert_eq!(Error::Again as u32, 7);
        assert_eq!(Error::Deadlock as u32, 8);
        assert_eq!(Error::OwnerDead as u32, 9);
        assert_eq!(Error::MessageSize as u32, 10);
        assert_eq!(Error::BadMessage as u32, 11);
        assert_eq!(Error::NoMemory as u32, 12);
    }

    #[test]
    fn status_code_maps_results() {
        let ok: Result<u32> = Ok(17);
        assert_eq!(ok.status_code(), OK);

        let err: Result<u32> = Err(Error::Timeout);
        assert_eq!(err.status_code(), Error::Timeout as u32);
    }
}
