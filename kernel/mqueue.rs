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

//! Priority-ordered message queues.
//!
//! Fixed capacity, fixed message size, messages stored by copy.  The used
//! slots form a chain ordered by descending message priority with FIFO order
//! among equal priorities, so receive always returns the oldest message of
//! the highest priority present.
//!
//! Blocked peers are served by direct handoff: a send finding a parked
//! receiver copies straight into its buffer, and a receive that frees a slot
//! immediately places a parked sender's message.

use core::ptr::NonNull;

use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::memory::{self, MemoryResource};
use crate::scheduler::{self, SchedLock, WaitList, WaitPayload};
use crate::Kernel;

const NIL: u16 = u16::MAX;

#[repr(C)]
struct SlotHeader {
    next: u16,
    len: u16,
    prio: u8,
}

struct MqInner<K: Kernel> {
    headers: *mut SlotHeader,
    payloads: *mut u8,
    free_head: u16,
    used_head: u16,
    used_tail: u16,
    length: u16,
    send_waiters: WaitList<K>,
    recv_waiters: WaitList<K>,
}

enum StorageKind {
    Caller,
    Resource(&'static dyn MemoryResource),
}

/// A message queue ordered by message priority.
pub struct MessageQueue<K: Kernel> {
    name: &'static str,
    capacity: u16,
    msg_size: usize,
    base: NonNull<u8>,
    total_bytes: usize,
    storage: StorageKind,
    state: SchedLock<K, MqInner<K>>,
}

unsafe impl<K: Kernel> Send for MessageQueue<K> {}
unsafe impl<K: Kernel> Sync for MessageQueue<K> {}

enum QueueWait {
    Block,
    Try,
    Timed(Duration<SysTicks>),
}

impl<K: Kernel> MessageQueue<K> {
    /// Bytes of backing storage a queue of `capacity` messages of
    /// `msg_size` bytes needs.
    #[must_use]
    pub const fn required_bytes(capacity: usize, msg_size: usize) -> usize {
        capacity * (core::mem::size_of::<SlotHeader>() + msg_size)
            + core::mem::align_of::<SlotHeader>()
            - 1
    }

    /// Builds a queue over caller-provided storage; see [`required_bytes`].
    ///
    /// [`required_bytes`]: MessageQueue::required_bytes
    pub fn with_storage(
        name: &'static str,
        capacity: usize,
        msg_size: usize,
        storage: &'static mut [u8],
    ) -> Result<Self> {
        let len = storage.len();
        let base = NonNull::new(storage.as_mut_ptr()).ok_or(Error::Invalid)?;
        Self::build(name, capacity, msg_size, base, len, StorageKind::Caller)
    }

    /// Builds a queue with storage drawn from `resource`.
    pub fn with_resource(
        name: &'static str,
        capacity: usize,
        msg_size: usize,
        resource: &'static dyn MemoryResource,
    ) -> Result<Self> {
        let bytes = Self::required_bytes(capacity, msg_size);
        let base = resource
            .allocate(bytes, core::mem::align_of::<SlotHeader>())
            .ok_or(Error::NoMemory)?;
        Self::build(
            name,
            capacity,
            msg_size,
            base,
            bytes,
            StorageKind::Resource(resource),
        )
    }

    /// Builds a queue with storage from the default memory resource.
    pub fn new(name: &'static str, capacity: usize, msg_size: usize) -> Result<Self> {
        Self::with_resource(name, capacity, msg_size, memory::default_resource())
    }

    fn build(
        name: &'static str,
        capacity: usize,
        msg_size: usize,
        base: NonNull<u8>,
        total_bytes: usize,
        storage: StorageKind,
    ) -> Result<Self> {
        if capacity == 0 || capacity >= NIL as usize {
            return Err(Error::Invalid);
        }
        if msg_size == 0 || msg_size > u16::MAX as usize {
            return Err(Error::Invalid);
        }

        let align = core::mem::align_of::<SlotHeader>();
        let start = base.as_ptr() as usize;
        let aligned = start.next_multiple_of(align);
        let needed = capacity * (core::mem::size_of::<SlotHeader>() + msg_size);
        if aligned - start + needed > total_bytes {
            return Err(Error::Invalid);
        }

        let headers = aligned as *mut SlotHeader;
        let payloads =
            (aligned + capacity * core::mem::size_of::<SlotHeader>()) as *mut u8;

        unsafe {
            for i in 0..capacity {
                headers.add(i).write(SlotHeader {
                    next: if i + 1 < capacity { (i + 1) as u16 } else { NIL },
                    len: 0,
                    prio: 0,
                });
            }
        }

        Ok(Self {
            name,
            capacity: capacity as u16,
            msg_size,
            base,
            total_bytes,
            storage,
            state: SchedLock::new(MqInner {
                headers,
                payloads,
                free_head: 0,
                used_head: NIL,
                used_tail: NIL,
                length: 0,
                send_waiters: WaitList::new(),
                recv_waiters: WaitList::new(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[must_use]
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Messages currently queued.
    #[must_use]
    pub fn length(&self, kernel: K) -> usize {
        self.state.lock(kernel).length as usize
    }

    #[must_use]
    pub fn is_empty(&self, kernel: K) -> bool {
        self.length(kernel) == 0
    }

    #[must_use]
    pub fn is_full(&self, kernel: K) -> bool {
        self.length(kernel) == self.capacity as usize
    }

    /// Enqueues a copy of `msg` with `prio`, blocking while the queue is
    /// full.
    pub fn send(&self, kernel: K, msg: &[u8], prio: u8) -> Result<()> {
        self.send_impl(kernel, msg, prio, QueueWait::Block)
    }

    /// Non-blocking send; fails with `would_block` when full.  Safe from
    /// handler mode.
    pub fn try_send(&self, kernel: K, msg: &[u8], prio: u8) -> Result<()> {
        self.send_impl(kernel, msg, prio, QueueWait::Try)
    }

    /// Timed send; fails with `timeout` when the deadline passes first.
    pub fn timed_send(
        &self,
        kernel: K,
        msg: &[u8],
        prio: u8,
        timeout: Duration<SysTicks>,
    ) -> Result<()> {
        self.send_impl(kernel, msg, prio, QueueWait::Timed(timeout))
    }

    fn send_impl(&self, kernel: K, msg: &[u8], prio: u8, wait: QueueWait) -> Result<()> {
        if msg.len() > self.msg_size {
            return Err(Error::MessageSize);
        }
        let mut guard = self.state.lock(kernel);

        unsafe {
            let (sched, inner) = guard.split();

            // A parked receiver means the queue is empty: hand the message
            // straight over.
            if let Some(receiver) = inner.recv_waiters.head() {
                let t = receiver.as_ptr();
                if let WaitPayload::Recv { buf, .. } = (*t).payload {
                    core::ptr::copy_nonoverlapping(msg.as_ptr(), buf, msg.len());
                    (*t).payload = WaitPayload::Recv {
                        buf,
                        len: msg.len(),
                        prio,
                    };
                    scheduler::wake_thread(kernel, sched, receiver, Ok(()));
                    guard.finish();
                    return Ok(());
                }
            }

            if (inner.length as usize) < self.capacity as usize {
                self.insert_message(inner, msg.as_ptr(), msg.len(), prio);
                guard.finish();
                return Ok(());
            }
        }

        let deadline = match wait {
            QueueWait::Try => return Err(Error::WouldBlock),
            QueueWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            QueueWait::Timed(timeout) => unsafe {
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        if guard.sched_ref().current_ptr().is_none() {
            return Err(Error::Permission);
        }

        // Full: park with the message described in the payload; a receiver
        // will place it when a slot frees up.
        let waiters = unsafe { NonNull::from(&mut (*self.state.raw()).send_waiters) };
        let payload = WaitPayload::Send {
            msg: msg.as_ptr(),
            len: msg.len(),
            prio,
        };
        let (guard, status) = guard.block_current(Some(waiters), deadline, payload);
        guard.finish();
        status
    }

    /// Dequeues the oldest highest-priority message into `buf`, blocking
    /// while the queue is empty.  Returns the message length and priority.
    /// `buf` must hold `msg_size` bytes.
    pub fn receive(&self, kernel: K, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_impl(kernel, buf, QueueWait::Block)
    }

    /// Non-blocking receive; fails with `would_block` when empty.  Safe
    /// from handler mode.
    pub fn try_receive(&self, kernel: K, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_impl(kernel, buf, QueueWait::Try)
    }

    /// Timed receive; fails with `timeout` when the deadline passes first.
    pub fn timed_receive(
        &self,
        kernel: K,
        buf: &mut [u8],
        timeout: Duration<SysTicks>,
    ) -> Result<(usize, u8)> {
        self.receive_impl(kernel, buf, QueueWait::Timed(timeout))
    }

    fn receive_impl(
        &self,
        kernel: K,
        buf: &mut [u8],
        wait: QueueWait,
    ) -> Result<(usize, u8)> {
        if buf.len() < self.msg_size {
            return Err(Error::MessageSize);
        }
        let mut guard = self.state.lock(kernel);

        unsafe {
            let (sched, inner) = guard.split();
            if inner.length > 0 {
                let out = self.pop_message(inner, buf.as_mut_ptr());

                // A slot freed up; place a parked sender's message.
                if let Some(sender) = inner.send_waiters.head() {
                    let t = sender.as_ptr();
                    if let WaitPayload::Send { msg, len, prio } = (*t).payload {
                        self.insert_message(inner, msg, len, prio);
                        scheduler::wake_thread(kernel, sched, sender, Ok(()));
                    }
                }
                guard.finish();
                return Ok(out);
            }
        }

        let deadline = match wait {
            QueueWait::Try => return Err(Error::WouldBlock),
            QueueWait::Block => None,
            // Safety: `guard` holds the scheduler lock.
            QueueWait::Timed(timeout) => unsafe {
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        if guard.sched_ref().current_ptr().is_none() {
            return Err(Error::Permission);
        }

        let waiters = unsafe { NonNull::from(&mut (*self.state.raw()).recv_waiters) };
        let payload = WaitPayload::Recv {
            buf: buf.as_mut_ptr(),
            len: 0,
            prio: 0,
        };
        let (mut guard, status) = guard.block_current(Some(waiters), deadline, payload);
        let result = match status {
            Ok(()) => {
                let current = guard.sched().current_ptr();
                match current {
                    Some(t) => unsafe {
                        match (*t.as_ptr()).payload {
                            WaitPayload::Recv { len, prio, .. } => Ok((len, prio)),
                            _ => Err(Error::BadMessage),
                        }
                    },
                    None => Err(Error::BadMessage),
                }
            }
            Err(e) => Err(e),
        };
        guard.finish();
        result
    }

    /// Discards every queued message and wakes all blocked senders and
    /// receivers with `interrupted`.
    pub fn reset(&self, kernel: K) -> Result<()> {
        let mut guard = self.state.lock(kernel);
        unsafe {
            let (sched, inner) = guard.split();
            for i in 0..self.capacity as usize {
                (*inner.headers.add(i)).next =
                    if i + 1 < self.capacity as usize { (i + 1) as u16 } else { NIL };
            }
            inner.free_head = 0;
            inner.used_head = NIL;
            inner.used_tail = NIL;
            inner.length = 0;
            while let Some(waiter) = inner.send_waiters.head() {
                scheduler::wake_thread(kernel, sched, waiter, Err(Error::Interrupted));
            }
            while let Some(waiter) = inner.recv_waiters.head() {
                scheduler::wake_thread(kernel, sched, waiter, Err(Error::Interrupted));
            }
        }
        guard.finish();
        Ok(())
    }

    unsafe fn payload_ptr(&self, inner: &MqInner<K>, slot: u16) -> *mut u8 {
        inner.payloads.add(slot as usize * self.msg_size)
    }

    // Takes a free slot, copies the message in and links the slot into the
    // used chain: before the first slot of strictly lower priority, after
    // every equal-priority one.
    unsafe fn insert_message(
        &self,
        inner: &mut MqInner<K>,
        msg: *const u8,
        len: usize,
        prio: u8,
    ) {
        let slot = inner.free_head;
        debug_assert!(slot != NIL);
        inner.free_head = (*inner.headers.add(slot as usize)).next;

        core::ptr::copy_nonoverlapping(msg, self.payload_ptr(inner, slot), len);
        let header = inner.headers.add(slot as usize);
        (*header).len = len as u16;
        (*header).prio = prio;

        let mut prev = NIL;
        let mut cur = inner.used_head;
        while cur != NIL {
            if (*inner.headers.add(cur as usize)).prio < prio {
                break;
            }
            prev = cur;
            cur = (*inner.headers.add(cur as usize)).next;
        }

        (*header).next = cur;
        if prev == NIL {
            inner.used_head = slot;
        } else {
            (*inner.headers.add(prev as usize)).next = slot;
        }
        if cur == NIL {
            inner.used_tail = slot;
        }
        inner.length += 1;
    }

    // Unlinks the head of the used chain, copies it out and frees the slot.
    unsafe fn pop_message(&self, inner: &mut MqInner<K>, buf: *mut u8) -> (usize, u8) {
        let slot = inner.used_head;
        debug_assert!(slot != NIL);
        let header = inner.headers.add(slot as usize);

        inner.used_head = (*header).next;
        if inner.used_head == NIL {
            inner.used_tail = NIL;
        }

        let len = (*header).len as usize;
        let prio = (*header).prio;
        core::ptr::copy_nonoverlapping(self.payload_ptr(inner, slot), buf, len);

        (*header).next = inner.free_head;
        inner.free_head = slot;
        inner.length -= 1;

        (len, prio)
    }
}

impl<K: Kernel> Drop for MessageQueue<K> {
    fn drop(&mut self) {
        {
            let guard = self.state.lock(K::default());
            debug_assert!(guard.send_waiters.is_empty());
            debug_assert!(guard.recv_waiters.is_empty());
        }
        if let StorageKind::Resource(resource) = &self.storage {
            resource.deallocate(
                self.base,
                self.total_bytes,
                core::mem::align_of::<SlotHeader>(),
            );
        }
    }
}
