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

//! The memory-resource capability.
//!
//! The kernel never allocates on its own; message queues and memory pools
//! that are not given caller storage draw it from a [`MemoryResource`].  The
//! concrete allocators live outside the core; a process installs one with
//! [`set_default_resource`] during startup.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// An allocator capability in the polymorphic-resource style.
pub trait MemoryResource {
    /// Allocates `bytes` with `alignment`, or `None` when exhausted.
    fn allocate(&self, bytes: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Returns a block obtained from [`allocate`].
    ///
    /// [`allocate`]: MemoryResource::allocate
    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize);

    /// Whether storage from `other` can be returned to `self`.  The default
    /// is object identity.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        core::ptr::addr_eq(self, other)
    }

    /// Largest single allocation this resource can ever satisfy; 0 when
    /// unknown.
    fn max_size(&self) -> usize {
        0
    }

    /// Returns the resource to its initial state, if supported.
    fn reset(&self) {}

    /// Attempts to merge free blocks; true if anything changed.
    fn coalesce(&self) -> bool {
        false
    }
}

/// A resource that satisfies nothing; the default until a real allocator is
/// installed.
pub struct NullResource;

impl MemoryResource for NullResource {
    fn allocate(&self, _bytes: usize, _alignment: usize) -> Option<NonNull<u8>> {
        None
    }

    fn deallocate(&self, _ptr: NonNull<u8>, _bytes: usize, _alignment: usize) {}
}

pub static NULL_RESOURCE: NullResource = NullResource;

struct DefaultResource(UnsafeCell<Option<&'static dyn MemoryResource>>);

// Written once during single-threaded startup; read-only afterwards.
unsafe impl Sync for DefaultResource {}

static DEFAULT_RESOURCE: DefaultResource = DefaultResource(UnsafeCell::new(None));

/// Installs the process-wide default resource.
///
/// A one-shot startup hook: calling it after threads are running is not
/// thread-safe by contract.
pub fn set_default_resource(resource: &'static dyn MemoryResource) {
    unsafe {
        *DEFAULT_RESOURCE.0.get() = Some(resource);
    }
}

/// The installed default resource, or [`NULL_RESOURCE`].
#[must_use]
pub fn default_resource() -> &'static dyn MemoryResource {
    unsafe { (*DEFAULT_RESOURCE.0.get()).unwrap_or(&NULL_RESOURCE) }
}
