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

//! Fixed-block memory pools.
//!
//! A contiguous arena of `capacity` equal blocks.  Free blocks thread a
//! next pointer through their first word, so allocate and free are O(1)
//! with no metadata outside the arena.  A free with parked allocators hands
//! the block straight to the oldest highest-priority one.

use core::ptr::NonNull;

use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::memory::{self, MemoryResource};
use crate::scheduler::{self, SchedLock, WaitList, WaitPayload};
use crate::Kernel;

struct PoolInner<K: Kernel> {
    free_head: *mut u8,
    free_count: usize,
    waiters: WaitList<K>,
}

enum StorageKind {
    Caller,
    Resource(&'static dyn MemoryResource),
}

/// A pool of fixed-size blocks.
pub struct MemoryPool<K: Kernel> {
    name: &'static str,
    capacity: usize,
    block_size: usize,
    // Original storage base (for deallocation) and the word-aligned arena.
    base: NonNull<u8>,
    arena: NonNull<u8>,
    total_bytes: usize,
    storage: StorageKind,
    state: SchedLock<K, PoolInner<K>>,
}

unsafe impl<K: Kernel> Send for MemoryPool<K> {}
unsafe impl<K: Kernel> Sync for MemoryPool<K> {}

enum PoolWait {
    Block,
    Try,
    Timed(Duration<SysTicks>),
}

impl<K: Kernel> MemoryPool<K> {
    /// Block sizes are rounded up to the machine word.
    #[must_use]
    pub const fn effective_block_size(block_size: usize) -> usize {
        let word = core::mem::size_of::<usize>();
        let rounded = block_size.next_multiple_of(word);
        if rounded < word {
            word
        } else {
            rounded
        }
    }

    /// Bytes of backing storage a pool of `capacity` blocks needs.
    #[must_use]
    pub const fn required_bytes(capacity: usize, block_size: usize) -> usize {
        capacity * Self::effective_block_size(block_size)
            + core::mem::align_of::<usize>()
            - 1
    }

    /// Builds a pool over caller-provided storage; see [`required_bytes`].
    ///
    /// [`required_bytes`]: MemoryPool::required_bytes
    pub fn with_storage(
        name: &'static str,
        capacity: usize,
        block_size: usize,
        storage: &'static mut [u8],
    ) -> Result<Self> {
        let len = storage.len();
        let base = NonNull::new(storage.as_mut_ptr()).ok_or(Error::Invalid)?;
        Self::build(name, capacity, block_size, base, len, StorageKind::Caller)
    }

    /// Builds a pool with storage drawn from `resource`.
    pub fn with_resource(
        name: &'static str,
        capacity: usize,
        block_size: usize,
        resource: &'static dyn MemoryResource,
    ) -> Result<Self> {
        let bytes = Self::required_bytes(capacity, block_size);
        let base = resource
            .allocate(bytes, core::mem::align_of::<usize>())
            .ok_or(Error::NoMemory)?;
        Self::build(
            name,
            capacity,
            block_size,
            base,
            bytes,
            StorageKind::Resource(resource),
        )
    }

    /// Builds a pool with storage from the default memory resource.
    pub fn new(name: &'static str, capacity: usize, block_size: usize) -> Result<Self> {
        Self::with_resource(name, capacity, block_size, memory::default_resource())
    }

    fn build(
        name: &'static str,
        capacity: usize,
        block_size: usize,
        base: NonNull<u8>,
        total_bytes: usize,
        storage: StorageKind,
    ) -> Result<Self> {
        if capacity == 0 || block_size == 0 {
            return Err(Error::Invalid);
        }
        let block_size = Self::effective_block_size(block_size);

        let word = core::mem::align_of::<usize>();
        let start = base.as_ptr() as usize;
        let aligned = start.next_multiple_of(word);
        if aligned - start + capacity * block_size > total_bytes {
            return Err(Error::Invalid);
        }
        let arena = aligned as *mut u8;

        // Thread the free list through the first word of each block, in
        // address order.
        let mut free_head: *mut u8 = core::ptr::null_mut();
        unsafe {
            for i in (0..capacity).rev() {
                let block = arena.add(i * block_size);
                (block as *mut *mut u8).write(free_head);
                free_head = block;
            }
        }

        Ok(Self {
            name,
            capacity,
            block_size,
            base,
            arena: unsafe { NonNull::new_unchecked(arena) },
            total_bytes,
            storage,
            state: SchedLock::new(PoolInner {
                free_head,
                free_count: capacity,
                waiters: WaitList::new(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently handed out.
    #[must_use]
    pub fn allocated(&self, kernel: K) -> usize {
        self.capacity - self.state.lock(kernel).free_count
    }

    #[must_use]
    pub fn is_empty(&self, kernel: K) -> bool {
        self.state.lock(kernel).free_count == self.capacity
    }

    #[must_use]
    pub fn is_exhausted(&self, kernel: K) -> bool {
        self.state.lock(kernel).free_count == 0
    }

    /// Takes a block, blocking while the pool is exhausted.
    pub fn alloc(&self, kernel: K) -> Result<NonNull<u8>> {
        self.alloc_impl(kernel, PoolWait::Block)
    }

    /// Non-blocking take; fails with `would_block` when exhausted.  Safe
    /// from handler mode.
    pub fn try_alloc(&self, kernel: K) -> Result<NonNull<u8>> {
        self.alloc_impl(kernel, PoolWait::Try)
    }

    /// Timed take; fails with `timeout` when the deadline passes first.
    pub fn timed_alloc(&self, kernel: K, timeout: Duration<SysTicks>) -> Result<NonNull<u8>> {
        self.alloc_impl(kernel, PoolWait::Timed(timeout))
    }

    fn alloc_impl(&self, kernel: K, wait: PoolWait) -> Result<NonNull<u8>> {
        let mut guard = self.state.lock(kernel);

        if !guard.free_head.is_null() {
            let block = guard.free_head;
            unsafe {
                guard.free_head = (block as *mut *mut u8).read();
            }
            guard.free_count -= 1;
            return Ok(unsafe { NonNull::new_unchecked(block) });
        }

        let deadline = match wait {
            PoolWait::Try => return Err(Error::WouldBlock),
            PoolWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            PoolWait::Timed(timeout) => unsafe {
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        if guard.sched_ref().current_ptr().is_none() {
            return Err(Error::Permission);
        }

        let waiters = unsafe { NonNull::from(&mut (*self.state.raw()).waiters) };
        let payload = WaitPayload::Alloc {
            block: core::ptr::null_mut(),
        };
        let (mut guard, status) = guard.block_current(Some(waiters), deadline, payload);
        let result = match status {
            Ok(()) => {
                // The freeing thread deposited the block in our payload.
                let current = guard.sched().current_ptr();
                match current {
                    Some(t) => unsafe {
                        match (*t.as_ptr()).payload {
                            WaitPayload::Alloc { block } if !block.is_null() => {
                                Ok(NonNull::new_unchecked(block))
                            }
                            _ => Err(Error::Invalid),
                        }
                    },
                    None => Err(Error::Invalid),
                }
            }
            Err(e) => Err(e),
        };
        guard.finish();
        result
    }

    /// Returns a block to the pool, or hands it to the first parked
    /// allocator.  The pointer must be a block of this pool; anything else
    /// fails with `invalid`.  Safe from handler mode.
    pub fn free(&self, kernel: K, block: NonNull<u8>) -> Result<()> {
        let addr = block.as_ptr() as usize;
        let start = self.arena.as_ptr() as usize;
        let end = start + self.capacity * self.block_size;
        if addr < start || addr >= end || (addr - start) % self.block_size != 0 {
            return Err(Error::Invalid);
        }

        let mut guard = self.state.lock(kernel);
        unsafe {
            let (sched, inner) = guard.split();
            if let Some(waiter) = inner.waiters.head() {
                (*waiter.as_ptr()).payload = WaitPayload::Alloc {
                    block: block.as_ptr(),
                };
                scheduler::wake_thread(kernel, sched, waiter, Ok(()));
            } else {
                (block.as_ptr() as *mut *mut u8).write(inner.free_head);
                inner.free_head = block.as_ptr();
                inner.free_count += 1;
            }
        }
        guard.finish();
        Ok(())
    }

    /// Reclaims every block and wakes parked allocators with `interrupted`.
    /// Outstanding block pointers become invalid.
    pub fn reset(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        unsafe {
            let (sched, inner) = guard.split();
            let arena = self.arena.as_ptr();
            let mut free_head: *mut u8 = core::ptr::null_mut();
            for i in (0..self.capacity).rev() {
                let block = arena.add(i * self.block_size);
                (block as *mut *mut u8).write(free_head);
                free_head = block;
            }
            inner.free_head = free_head;
            inner.free_count = self.capacity;
            while let Some(waiter) = inner.waiters.head() {
                scheduler::wake_thread(kernel, sched, waiter, Err(Error::Interrupted));
            }
        }
        guard.finish();
        Ok(())
    }
}

impl<K: Kernel> Drop for MemoryPool<K> {
    fn drop(&mut self) {
        {
            let guard = self.state.lock(K::default());
            debug_assert!(guard.waiters.is_empty());
        }
        if let StorageKind::Resource(resource) = &self.storage {
            resource.deallocate(
                self.base,
                self.total_bytes,
                core::mem::align_of::<usize>(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::park_thread;
    use crate::scheduler::thread::{priority, State};
    use crate::testutil::{self, TestKernel};

    fn pool(capacity: usize, block_size: usize) -> MemoryPool<TestKernel> {
        let bytes = MemoryPool::<TestKernel>::required_bytes(capacity, block_size);
        let storage = Box::leak(vec![0u8; bytes].into_boxed_slice());
        MemoryPool::with_storage("pool", capacity, block_size, storage).unwrap()
    }

    #[test]
    fn blocks_are_in_range_aligned_and_distinct() {
        let _session = testutil::session();
        let p = pool(3, 12);
        // Requested size is rounded up to the word size.
        assert_eq!(p.block_size() % core::mem::size_of::<usize>(), 0);
        assert!(p.block_size() >= 12);

        let a = p.try_alloc(TestKernel).unwrap();
        let b = p.try_alloc(TestKernel).unwrap();
        let c = p.try_alloc(TestKernel).unwrap();
        assert_eq!(p.allocated(TestKernel), 3);

        let start = p.arena.as_ptr() as usize;
        let end = start + p.capacity() * p.block_size();
        for block in [a, b, c] {
            let addr = block.as_ptr() as usize;
            assert!(addr >= start && addr < end);
            assert_eq!((addr - start) % p.block_size(), 0);
        }
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        assert_eq!(p.try_alloc(TestKernel), Err(Error::WouldBlock));
        assert_eq!(p.free(TestKernel, a), Ok(()));
        assert_eq!(p.allocated(TestKernel), 2);
        // A freed block comes back out.
        assert_eq!(p.try_alloc(TestKernel), Ok(a));
    }

    #[test]
    fn free_rejects_foreign_and_misaligned_pointers() {
        let _session = testutil::session();
        let p = pool(2, 16);
        let a = p.try_alloc(TestKernel).unwrap();

        let outside = unsafe { NonNull::new_unchecked((p.arena.as_ptr()).sub(8)) };
        assert_eq!(p.free(TestKernel, outside), Err(Error::Invalid));

        let misaligned = unsafe { NonNull::new_unchecked(a.as_ptr().add(1)) };
        assert_eq!(p.free(TestKernel, misaligned), Err(Error::Invalid));

        assert_eq!(p.free(TestKernel, a), Ok(()));
    }

    #[test]
    fn free_hands_the_block_to_a_parked_allocator() {
        let _session = testutil::session();
        // Two blocks out, a third thread waiting; a free passes its block on.
        let p = pool(2, 16);
        let a = p.try_alloc(TestKernel).unwrap();
        let _b = p.try_alloc(TestKernel).unwrap();

        let mut waiter = testutil::thread("w", priority::NORMAL);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let waiters = NonNull::from(&mut (*p.state.raw()).waiters);
                park_thread(
                    NonNull::from(&mut waiter),
                    Some(waiters),
                    None,
                    WaitPayload::Alloc {
                        block: core::ptr::null_mut(),
                    },
                );
            }
        }

        assert_eq!(p.free(TestKernel, a), Ok(()));
        assert_eq!(waiter.state, State::Ready);
        assert_eq!(waiter.wake_status, Ok(()));
        match waiter.payload {
            WaitPayload::Alloc { block } => assert_eq!(block, a.as_ptr()),
            _ => panic!("payload lost"),
        }
        // The block went straight through: still two outstanding.
        assert_eq!(p.allocated(TestKernel), 2);
    }

    #[test]
    fn reset_reclaims_blocks_and_interrupts_waiters() {
        let _session = testutil::session();
        let p = pool(2, 16);
        let _a = p.try_alloc(TestKernel).unwrap();
        let _b = p.try_alloc(TestKernel).unwrap();

        let mut waiter = testutil::thread("w", priority::NORMAL);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let waiters = NonNull::from(&mut (*p.state.raw()).waiters);
                park_thread(
                    NonNull::from(&mut waiter),
                    Some(waiters),
                    None,
                    WaitPayload::Alloc {
                        block: core::ptr::null_mut(),
                    },
                );
            }
        }

        assert_eq!(p.reset(TestKernel), Ok(()));
        assert_eq!(p.allocated(TestKernel), 0);
        assert_eq!(waiter.state, State::Ready);
        assert_eq!(waiter.wake_status, Err(Error::Interrupted));
    }

    #[test]
    fn construction_validates_parameters() {
        let _session = testutil::session();
        let storage = Box::leak(vec![0u8; 64].into_boxed_slice());
        assert!(MemoryPool::<TestKernel>::with_storage("p", 0, 16, storage).is_err());
        let storage = Box::leak(vec![0u8; 8].into_boxed_slice());
        assert!(MemoryPool::<TestKernel>::with_storage("p", 4, 16, storage).is_err());
    }
}
