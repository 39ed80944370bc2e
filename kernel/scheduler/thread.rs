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

//! Threads.
//!
//! A [`Thread`] is a caller-allocated control block.  The kernel never owns
//! thread memory; it links control blocks into its queues through the
//! intrusive links embedded here.  Each thread carries exactly two wait
//! links: `active_link` parks it in the ready queue *or* one primitive's
//! waiting list, `clock_link` parks it on one clock's sleep list during
//! timed waits.  No kernel operation ever needs a third.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use list::{Link, UnsafeList};
use log::debug;
use status::{Error, Result};
use ticktime::Duration;

use crate::clock::SysTicks;
use crate::config;
use crate::panic::{self, FaultCode};
use crate::port::ThreadContext;
use crate::scheduler::{self, WaitPayload};
use crate::sync::mutex::{MutexInner, OwnedMutexAdapter};
use crate::Kernel;

/// Thread priority levels.
///
/// Higher values are more urgent.  Runnable threads use
/// `[IDLE, ISR)`; `ISR` is the notional priority of interrupt handlers and
/// `NONE` marks an uninitialized thread.
pub mod priority {
    pub const NONE: u8 = 0;
    pub const IDLE: u8 = 1;
    pub const LOWEST: u8 = 2;
    pub const LOW: u8 = 8;
    pub const BELOW_NORMAL: u8 = 24;
    pub const NORMAL: u8 = 32;
    pub const ABOVE_NORMAL: u8 = 40;
    pub const HIGH: u8 = 48;
    pub const REALTIME: u8 = 56;
    pub const MAX: u8 = (crate::config::PRIORITY_LEVELS - 2) as u8;
    pub const ISR: u8 = (crate::config::PRIORITY_LEVELS - 1) as u8;
}

/// Thread lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Control block exists but the thread has not been started.
    Undefined,
    /// Linked in the ready queue.
    Ready,
    /// The one thread currently executing.
    Running,
    /// Parked: blocked on a primitive, sleeping, or explicitly suspended.
    Suspended,
    /// Ran to completion or exited; exit value not yet collected.
    Terminated,
    /// Exit value collected; the control block may be reused.
    Destroyed,
}

/// Modes for event flag waits; `ALL`/`ANY` choose the predicate, `CLEAR`
/// consumes the matched bits on success.
pub mod flags_mode {
    pub const ALL: u32 = 1;
    pub const ANY: u32 = 2;
    pub const CLEAR: u32 = 4;
}

/// Evaluates an event-flags predicate against `current`.
///
/// Returns the bits a successful wait consumes, or `None` if the wait is not
/// satisfied.  A zero `mask` waits for any raised bit regardless of the
/// `ALL`/`ANY` selector.
pub(crate) fn flags_match(current: u32, mask: u32, mode: u32) -> Option<u32> {
    if mask == 0 {
        return if current != 0 { Some(current) } else { None };
    }
    if mode & flags_mode::ALL != 0 {
        if current & mask == mask {
            Some(mask)
        } else {
            None
        }
    } else {
        let matched = current & mask;
        if matched != 0 {
            Some(matched)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Stacks

/// Storage for a thread stack, typically declared `static mut`.
pub type StackStorage<const N: usize> = [MaybeUninit<u8>; N];

pub trait StackStorageExt {
    const ZEROED: Self;
}

impl<const N: usize> StackStorageExt for StackStorage<N> {
    const ZEROED: StackStorage<N> = [MaybeUninit::new(0); N];
}

const STACK_BOTTOM_MAGIC: usize = 0x5AFE_B007;
const STACK_TOP_MAGIC: usize = 0xCAFE_F00D;
const STACK_FILL: usize = 0x5EED_5EED;

static DEFAULT_STACK_SIZE: AtomicUsize = AtomicUsize::new(config::DEFAULT_STACK_SIZE_BYTES);
static MIN_STACK_SIZE: AtomicUsize = AtomicUsize::new(config::MIN_STACK_SIZE_BYTES);

/// Process-wide default stack size for threads that do not specify one.
pub fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE.load(Ordering::Relaxed)
}

pub fn set_default_stack_size(bytes: usize) {
    DEFAULT_STACK_SIZE.store(bytes, Ordering::Relaxed);
}

/// Smallest stack size `Thread::start` accepts.
pub fn min_stack_size() -> usize {
    MIN_STACK_SIZE.load(Ordering::Relaxed)
}

pub fn set_min_stack_size(bytes: usize) {
    MIN_STACK_SIZE.store(bytes, Ordering::Relaxed);
}

/// A word-aligned stack region with canary words at both ends.
///
/// The first and last words hold magic values written when the owning thread
/// starts; the words in between start out holding a fill pattern so the
/// high-water mark can be estimated later.
#[derive(Clone, Copy)]
pub struct Stack {
    base: *mut usize,
    words: usize,
}

impl Stack {
    /// Builds a stack over `storage`, shrinking both ends to word alignment.
    #[must_use]
    pub fn from_slice(storage: &mut [MaybeUninit<u8>]) -> Self {
        let word = core::mem::size_of::<usize>();
        let start = storage.as_mut_ptr() as usize;
        let end = start + storage.len();
        let base = start.next_multiple_of(word);
        let top = end & !(word - 1);
        let words = if top > base { (top - base) / word } else { 0 };
        Self {
            base: base as *mut usize,
            words,
        }
    }

    pub(crate) const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            words: 0,
        }
    }

    /// Lowest address of the region.
    #[must_use]
    pub fn bottom(&self) -> *mut usize {
        self.base
    }

    /// One past the highest word of the region; initial stack pointer for
    /// descending stacks.
    #[must_use]
    pub fn top(&self) -> *mut usize {
        unsafe { self.base.add(self.words) }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.words * core::mem::size_of::<usize>()
    }

    /// Writes the canaries and the fill pattern.  Must happen before the
    /// thread first runs and never after.
    pub(crate) fn prepare(&self) {
        if self.words < 2 {
            return;
        }
        unsafe {
            self.base.write(STACK_BOTTOM_MAGIC);
            self.base.add(self.words - 1).write(STACK_TOP_MAGIC);
            for i in 1..self.words - 1 {
                self.base.add(i).write(STACK_FILL);
            }
        }
    }

    /// Estimated bytes never yet used, found by scanning for the first
    /// overwritten fill word above the bottom canary.
    #[must_use]
    pub fn available(&self) -> usize {
        if self.words < 2 {
            return 0;
        }
        let mut count = 0;
        unsafe {
            for i in 1..self.words - 1 {
                if self.base.add(i).read() != STACK_FILL {
                    break;
                }
                count += 1;
            }
        }
        count * core::mem::size_of::<usize>()
    }

    #[must_use]
    pub fn check_bottom_magic(&self) -> bool {
        self.words >= 2 && unsafe { self.base.read() } == STACK_BOTTOM_MAGIC
    }

    #[must_use]
    pub fn check_top_magic(&self) -> bool {
        self.words >= 2 && unsafe { self.base.add(self.words - 1).read() } == STACK_TOP_MAGIC
    }
}

// ---------------------------------------------------------------------------
// Threads

/// Body of a thread; the returned pointer becomes the exit value.
pub type ThreadEntry = fn(*mut c_void) -> *mut c_void;

/// Creation attributes; see [`Thread::start`].
#[derive(Clone, Copy)]
pub struct ThreadAttributes {
    pub priority: u8,
    pub stack: Stack,
}

impl ThreadAttributes {
    #[must_use]
    pub fn new(priority: u8, stack: Stack) -> Self {
        Self { priority, stack }
    }
}

list::define_adapter!(pub ActiveLinkAdapter<K: Kernel> => Thread<K>::active_link);
list::define_adapter!(pub ClockLinkAdapter<K: Kernel> => Thread<K>::clock_link);
list::define_adapter!(pub ChildLinkAdapter<K: Kernel> => Thread<K>::child_link);

/// A thread control block.
///
/// Allocated by the caller (usually in a `static`), initialized in place and
/// never moved once started.
pub struct Thread<K: Kernel> {
    // Ready queue or one primitive's waiting list.
    pub(crate) active_link: Link,
    // One clock's sleep list, during timed waits and sleeps.
    pub(crate) clock_link: Link,
    // Parent's children list.
    pub(crate) child_link: Link,

    name: &'static str,
    pub(crate) state: State,
    pub(crate) base_priority: u8,
    pub(crate) effective_priority: u8,

    // Where the thread is parked, for wake/interrupt/re-sort paths.
    pub(crate) wait_anchor: Option<NonNull<scheduler::WaitList<K>>>,
    pub(crate) clock_anchor: Option<NonNull<crate::clock::ClockState<K>>>,
    pub(crate) wake_deadline: u64,
    pub(crate) blocked_on_mutex: Option<NonNull<MutexInner<K>>>,

    // Outcome of the wait, written by the waker before readying the thread.
    pub(crate) wake_status: Result<()>,
    pub(crate) payload: WaitPayload<K>,

    stack: Stack,
    pub(crate) context: UnsafeCell<K::ThreadContext>,

    pub(crate) exit_value: *mut c_void,
    pub(crate) flags: u32,

    pub(crate) parent: Option<NonNull<Thread<K>>>,
    pub(crate) children: UnsafeList<Thread<K>, ChildLinkAdapter<K>>,
    // Thread waiting in join on us / thread we are waiting in join on.
    pub(crate) joiner: Option<NonNull<Thread<K>>>,
    pub(crate) joining: Option<NonNull<Thread<K>>>,

    pub(crate) owned_mutexes: UnsafeList<MutexInner<K>, OwnedMutexAdapter<K>>,

    user_storage: *mut c_void,

    #[cfg(feature = "context-switch-stats")]
    pub(crate) context_switches: u64,
    #[cfg(feature = "cpu-cycle-stats")]
    pub(crate) cpu_cycles: u64,
}

unsafe impl<K: Kernel> Send for Thread<K> {}
unsafe impl<K: Kernel> Sync for Thread<K> {}

impl<K: Kernel> Thread<K> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            active_link: Link::new(),
            clock_link: Link::new(),
            child_link: Link::new(),
            name,
            state: State::Undefined,
            base_priority: priority::NONE,
            effective_priority: priority::NONE,
            wait_anchor: None,
            clock_anchor: None,
            wake_deadline: 0,
            blocked_on_mutex: None,
            wake_status: Ok(()),
            payload: WaitPayload::None,
            stack: Stack::empty(),
            context: UnsafeCell::new(K::ThreadContext::INIT),
            exit_value: core::ptr::null_mut(),
            flags: 0,
            parent: None,
            children: UnsafeList::new(),
            joiner: None,
            joining: None,
            owned_mutexes: UnsafeList::new(),
            user_storage: core::ptr::null_mut(),
            #[cfg(feature = "context-switch-stats")]
            context_switches: 0,
            #[cfg(feature = "cpu-cycle-stats")]
            cpu_cycles: 0,
        }
    }

    /// A stable identifier for logging; the control block address.
    #[must_use]
    pub fn id(&self) -> usize {
        core::ptr::from_ref(self).addr()
    }

    pub(crate) const fn null_id() -> usize {
        0
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Effective priority, including inheritance and ceiling boosts.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.effective_priority
    }

    #[must_use]
    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    #[must_use]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    #[must_use]
    pub fn user_storage(&self) -> *mut c_void {
        self.user_storage
    }

    pub fn set_user_storage(&mut self, storage: *mut c_void) {
        self.user_storage = storage;
    }

    #[cfg(feature = "context-switch-stats")]
    #[must_use]
    pub fn context_switch_count(&self) -> u64 {
        self.context_switches
    }

    #[cfg(feature = "cpu-cycle-stats")]
    #[must_use]
    pub fn cpu_cycle_count(&self) -> u64 {
        self.cpu_cycles
    }

    /// Makes the thread runnable, entering at `entry(arg)`.
    ///
    /// The new thread starts ready and preempts the caller only if it has
    /// higher effective priority.  The caller becomes the parent.
    pub fn start(
        &mut self,
        kernel: K,
        attr: &ThreadAttributes,
        entry: ThreadEntry,
        arg: *mut c_void,
    ) -> Result<()> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        if self.state != State::Undefined && self.state != State::Destroyed {
            return Err(Error::Invalid);
        }
        if attr.priority < priority::IDLE || attr.priority >= priority::ISR {
            return Err(Error::Invalid);
        }
        if attr.stack.size_bytes() < min_stack_size() {
            return Err(Error::Invalid);
        }

        debug!("starting thread {} ({:#x})", self.name, self.id());

        self.stack = attr.stack;
        self.stack.prepare();
        self.base_priority = attr.priority;
        self.effective_priority = attr.priority;
        self.exit_value = core::ptr::null_mut();
        self.flags = 0;
        self.joiner = None;
        self.wake_status = Ok(());
        self.payload = WaitPayload::None;

        self.context.get_mut().initialize_frame(
            self.stack,
            thread_trampoline::<K>,
            (entry as usize, arg as usize),
        );

        let this = NonNull::from(&mut *self);
        let mut sched = kernel.get_scheduler().lock();
        unsafe {
            let parent = sched.current_ptr();
            (*this.as_ptr()).parent = parent;
            if let Some(parent) = parent {
                (*parent.as_ptr()).children.push_back_unchecked(this.as_ptr());
            }
            (*this.as_ptr()).state = State::Ready;
            sched.insert_ready_tail(this);
            sched.note_wake_priority(this);
        }
        let sched = scheduler::maybe_preempt(kernel, sched);
        drop(sched);
        Ok(())
    }

    /// Transitions a suspended thread back to ready.
    ///
    /// A thread parked in a wait list or on a clock observes the wake as
    /// `interrupted`.  Safe from handler mode.
    pub fn resume(&self, kernel: K) -> Result<()> {
        let this = NonNull::from(self);
        let mut sched = kernel.get_scheduler().lock();
        if unsafe { this.as_ref() }.state != State::Suspended {
            return Ok(());
        }
        unsafe {
            let interrupted = this.as_ref().wait_anchor.is_some()
                || this.as_ref().clock_anchor.is_some()
                || this.as_ref().joiner_parked();
            let status = if interrupted {
                Err(Error::Interrupted)
            } else {
                Ok(())
            };
            scheduler::wake_thread(kernel, &mut sched, this, status);
        }
        let sched = scheduler::maybe_preempt(kernel, sched);
        drop(sched);
        Ok(())
    }

    // A thread blocked in `join` is findable through its target's joiner
    // slot, not through a wait list.
    fn joiner_parked(&self) -> bool {
        matches!(self.payload, WaitPayload::Join { .. })
    }

    /// Changes the base priority, re-sorting any priority-ordered list the
    /// thread is linked into and cascading inheritance.
    pub fn set_priority(&self, kernel: K, prio: u8) -> Result<()> {
        if prio < priority::IDLE || prio >= priority::ISR {
            return Err(Error::Invalid);
        }
        let this = NonNull::from(self);
        let mut sched = kernel.get_scheduler().lock();
        unsafe {
            (*this.as_ptr()).base_priority = prio;
            scheduler::refresh_priority(&mut sched, this);
        }
        let sched = scheduler::maybe_preempt(kernel, sched);
        drop(sched);
        Ok(())
    }

    /// Raises event flags on the thread, waking it if it is waiting for
    /// them.  Safe from handler mode.
    pub fn flags_raise(&self, kernel: K, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Error::Invalid);
        }
        let this = NonNull::from(self);
        let mut sched = kernel.get_scheduler().lock();
        let after = unsafe {
            let t = this.as_ptr();
            (*t).flags |= mask;

            if (*t).state == State::Suspended && (*t).wait_anchor.is_none() {
                if let WaitPayload::Flags {
                    mask: wanted,
                    mode,
                    ..
                } = (*t).payload
                {
                    if let Some(consumed) = flags_match((*t).flags, wanted, mode) {
                        let observed = (*t).flags;
                        if mode & flags_mode::CLEAR != 0 {
                            (*t).flags &= !consumed;
                        }
                        (*t).payload = WaitPayload::Flags {
                            mask: wanted,
                            mode,
                            grabbed: observed,
                        };
                        scheduler::wake_thread(kernel, &mut sched, this, Ok(()));
                    }
                }
            }
            (*t).flags
        };
        let sched = scheduler::maybe_preempt(kernel, sched);
        drop(sched);
        Ok(after)
    }

    /// Blocks until the thread terminates and collects its exit value.
    ///
    /// Single-joiner discipline: a second concurrent join fails with
    /// `invalid`.
    pub fn join(&self, kernel: K) -> Result<*mut c_void> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        let this = NonNull::from(self);
        let mut sched = kernel.get_scheduler().lock();

        let current = match sched.current_ptr() {
            Some(current) => current,
            None => return Err(Error::Permission),
        };
        if current == this {
            return Err(Error::Deadlock);
        }

        unsafe {
            match this.as_ref().state {
                State::Undefined | State::Destroyed => return Err(Error::Invalid),
                State::Terminated => {
                    let value = this.as_ref().exit_value;
                    reap(this);
                    return Ok(value);
                }
                _ => {}
            }
            if this.as_ref().joiner.is_some() {
                return Err(Error::Invalid);
            }
            (*this.as_ptr()).joiner = Some(current);
            (*current.as_ptr()).joining = Some(this);
        }

        let payload = WaitPayload::Join {
            exit_value: core::ptr::null_mut(),
        };
        let (sched, status) = scheduler::block_current(kernel, sched, None, None, payload);
        drop(sched);
        status?;

        // The exiting thread stored its exit value in our payload and left
        // itself terminated for us to reap.
        let mut sched = kernel.get_scheduler().lock();
        let Some(current) = sched.current_ptr() else {
            return Err(Error::Permission);
        };
        let value = unsafe {
            let value = match (*current.as_ptr()).payload {
                WaitPayload::Join { exit_value } => exit_value,
                _ => core::ptr::null_mut(),
            };
            (*current.as_ptr()).payload = WaitPayload::None;
            reap(this);
            value
        };
        drop(sched);
        Ok(value)
    }

    /// Releases a terminated thread's control block for reuse.
    pub fn destroy(&self, kernel: K) -> Result<()> {
        let this = NonNull::from(self);
        let sched = kernel.get_scheduler().lock();
        let result = unsafe {
            match this.as_ref().state {
                State::Terminated => {
                    reap(this);
                    Ok(())
                }
                State::Undefined | State::Destroyed => Ok(()),
                _ => Err(Error::Invalid),
            }
        };
        drop(sched);
        result
    }

    /// Calls `f` for each child thread, under the scheduler lock.
    pub fn for_each_child(&self, kernel: K, mut f: impl FnMut(&Thread<K>)) {
        let sched = kernel.get_scheduler().lock();
        unsafe {
            let _ = self.children.for_each(|child| -> core::result::Result<(), ()> {
                f(child);
                Ok(())
            });
        }
        drop(sched);
    }

    /// Number of children, under the scheduler lock.
    pub fn child_count(&self, kernel: K) -> usize {
        let sched = kernel.get_scheduler().lock();
        let count = self.children.len();
        drop(sched);
        count
    }
}

// Unlinks a terminated thread from its parent and marks it destroyed.
// Caller holds the scheduler lock.
unsafe fn reap<K: Kernel>(thread: NonNull<Thread<K>>) {
    let t = thread.as_ptr();
    if let Some(parent) = (*t).parent.take() {
        (*parent.as_ptr()).children.unlink_element(thread);
    }
    (*t).state = State::Destroyed;
}

extern "C" fn thread_trampoline<K: Kernel>(entry: usize, arg: usize) {
    let entry: ThreadEntry = unsafe { core::mem::transmute(entry) };
    let value = entry(arg as *mut c_void);
    this_thread::exit(K::default(), value)
}

/// Operations on the calling thread.
pub mod this_thread {
    use super::*;

    /// Parks the calling thread until another thread resumes it.
    pub fn suspend<K: Kernel>(kernel: K) -> Result<()> {
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }
        let sched = kernel.get_scheduler().lock();
        if sched.current_ptr().is_none() {
            return Err(Error::Permission);
        }
        let (sched, status) =
            scheduler::block_current(kernel, sched, None, None, WaitPayload::None);
        drop(sched);
        status
    }

    /// Terminates the calling thread with `value` as its exit value.
    ///
    /// Wakes the joiner, abandons held robust mutexes and orphans children.
    /// Never returns; from handler mode this is a fault.
    pub fn exit<K: Kernel>(kernel: K, value: *mut c_void) -> ! {
        if kernel.in_handler_mode() {
            panic::fault(kernel, FaultCode::HandlerModeViolation);
        }
        let mut sched = kernel.get_scheduler().lock();
        let current = match sched.take_current() {
            Some(current) => current,
            None => panic::fault(kernel, FaultCode::SchedulerState),
        };

        unsafe {
            let t = current.as_ptr();
            debug!("thread {} exiting", (*t).name);
            (*t).exit_value = value;
            (*t).state = State::Terminated;

            crate::sync::mutex::abandon_owned(kernel, &mut sched, current);

            // Children outlive their parent unparented.
            (*t).children.filter(|child| {
                child.parent = None;
                false
            });

            if let Some(joiner) = (*t).joiner.take() {
                (*joiner.as_ptr()).payload = WaitPayload::Join { exit_value: value };
                scheduler::wake_thread(kernel, &mut sched, joiner, Ok(()));
            }
        }

        let _sched = scheduler::reschedule(kernel, sched, Thread::<K>::null_id());
        // A terminated thread is never switched back in.
        panic::fault(kernel, FaultCode::SchedulerState)
    }

    /// Waits until the calling thread's event flags satisfy `mask`/`mode`.
    /// Returns the flags observed when the wait completed.
    pub fn flags_wait<K: Kernel>(kernel: K, mask: u32, mode: u32) -> Result<u32> {
        flags_wait_impl(kernel, mask, mode, FlagsWait::Blocking)
    }

    /// Non-blocking variant; fails with `would_block` when unsatisfied.
    pub fn flags_try_wait<K: Kernel>(kernel: K, mask: u32, mode: u32) -> Result<u32> {
        flags_wait_impl(kernel, mask, mode, FlagsWait::Try)
    }

    /// Timed variant; fails with `timeout` when the deadline passes first.
    pub fn flags_timed_wait<K: Kernel>(
        kernel: K,
        mask: u32,
        mode: u32,
        timeout: Duration<SysTicks>,
    ) -> Result<u32> {
        flags_wait_impl(kernel, mask, mode, FlagsWait::Timed(timeout))
    }

    /// Clears `mask` from the calling thread's flags, returning the prior
    /// value.  Clearing bits that are not raised is a no-op.
    pub fn flags_clear<K: Kernel>(kernel: K, mask: u32) -> Result<u32> {
        let mut sched = kernel.get_scheduler().lock();
        let current = match sched.current_ptr() {
            Some(current) => current,
            None => return Err(Error::Permission),
        };
        let prior = unsafe {
            let t = current.as_ptr();
            let prior = (*t).flags;
            (*t).flags &= !mask;
            prior
        };
        drop(sched);
        Ok(prior)
    }

    /// Reads the calling thread's flags selected by `mask` (all of them when
    /// `mask` is zero), consuming them if `mode` includes `CLEAR`.
    pub fn flags_get<K: Kernel>(kernel: K, mask: u32, mode: u32) -> u32 {
        let mut sched = kernel.get_scheduler().lock();
        let current = match sched.current_ptr() {
            Some(current) => current,
            None => return 0,
        };
        let value = unsafe {
            let t = current.as_ptr();
            let selected = if mask == 0 { (*t).flags } else { (*t).flags & mask };
            if mode & flags_mode::CLEAR != 0 {
                (*t).flags &= !selected;
            }
            selected
        };
        drop(sched);
        value
    }

    enum FlagsWait {
        Blocking,
        Try,
        Timed(Duration<SysTicks>),
    }

    fn flags_wait_impl<K: Kernel>(
        kernel: K,
        mask: u32,
        mode: u32,
        wait: FlagsWait,
    ) -> Result<u32> {
        if mode & (flags_mode::ALL | flags_mode::ANY) == 0 {
            return Err(Error::Invalid);
        }
        if kernel.in_handler_mode() {
            return Err(Error::Permission);
        }

        let mut sched = kernel.get_scheduler().lock();
        let current = match sched.current_ptr() {
            Some(current) => current,
            None => return Err(Error::Permission),
        };

        unsafe {
            let t = current.as_ptr();
            if let Some(consumed) = flags_match((*t).flags, mask, mode) {
                let observed = (*t).flags;
                if mode & flags_mode::CLEAR != 0 {
                    (*t).flags &= !consumed;
                }
                return Ok(observed);
            }
        }

        let deadline = match wait {
            FlagsWait::Try => return Err(Error::WouldBlock),
            FlagsWait::Blocking => None,
            // Safety: `sched` holds the scheduler lock.
            FlagsWait::Timed(timeout) => unsafe {
                let _ = &mut sched;
                Some(crate::clock::sys_deadline_after(kernel, timeout))
            },
        };

        let payload = WaitPayload::Flags {
            mask,
            mode,
            grabbed: 0,
        };
        let (sched, status) = scheduler::block_current(kernel, sched, None, deadline, payload);
        drop(sched);
        status?;

        let sched = kernel.get_scheduler().lock();
        let observed = match sched.current_ptr() {
            Some(current) => unsafe {
                match (*current.as_ptr()).payload {
                    WaitPayload::Flags { grabbed, .. } => grabbed,
                    _ => 0,
                }
            },
            None => 0,
        };
        drop(sched);
        Ok(observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{park_thread, WaitList};
    use crate::testutil::{self, TestKernel};

    fn noop_entry(_arg: *mut c_void) -> *mut c_void {
        core::ptr::null_mut()
    }

    #[test]
    fn flags_match_covers_all_modes() {
        // ALL: every bit of the mask must be raised.
        assert_eq!(flags_match(0b1010, 0b1010, flags_mode::ALL), Some(0b1010));
        assert_eq!(flags_match(0b1000, 0b1010, flags_mode::ALL), None);
        // ANY: the intersection is consumed.
        assert_eq!(flags_match(0b1000, 0b1010, flags_mode::ANY), Some(0b1000));
        assert_eq!(flags_match(0b0100, 0b1010, flags_mode::ANY), None);
        // Zero mask waits for anything.
        assert_eq!(flags_match(0b0100, 0, flags_mode::ANY), Some(0b0100));
        assert_eq!(flags_match(0, 0, flags_mode::ANY), None);
    }

    #[test]
    fn stack_canaries_and_high_water() {
        let mut storage = [MaybeUninit::new(0u8); 32 * core::mem::size_of::<usize>()];
        let stack = Stack::from_slice(&mut storage);
        assert_eq!(stack.size_bytes(), 32 * core::mem::size_of::<usize>());

        stack.prepare();
        assert!(stack.check_bottom_magic());
        assert!(stack.check_top_magic());
        assert_eq!(stack.available(), 30 * core::mem::size_of::<usize>());

        // Simulate use of the upper half of the stack.
        unsafe {
            stack.bottom().add(20).write(0);
        }
        assert_eq!(stack.available(), 19 * core::mem::size_of::<usize>());

        // An overwritten canary is detected.
        unsafe {
            stack.bottom().write(0);
        }
        assert!(!stack.check_bottom_magic());
        assert!(stack.check_top_magic());
    }

    #[test]
    fn stack_size_knobs_round_trip() {
        let default = default_stack_size();
        let min = min_stack_size();
        set_default_stack_size(4096);
        set_min_stack_size(512);
        assert_eq!(default_stack_size(), 4096);
        assert_eq!(min_stack_size(), 512);
        set_default_stack_size(default);
        set_min_stack_size(min);
    }

    #[test]
    fn start_validates_attributes() {
        let _session = testutil::session();
        let mut storage = [MaybeUninit::new(0u8); 512];
        let stack = Stack::from_slice(&mut storage);
        let mut t = Thread::<TestKernel>::new("t");

        let bad_prio = ThreadAttributes::new(priority::ISR, stack);
        assert_eq!(
            t.start(TestKernel, &bad_prio, noop_entry, core::ptr::null_mut()),
            Err(Error::Invalid)
        );

        let mut tiny = [MaybeUninit::new(0u8); 16];
        let bad_stack = ThreadAttributes::new(priority::NORMAL, Stack::from_slice(&mut tiny));
        assert_eq!(
            t.start(TestKernel, &bad_stack, noop_entry, core::ptr::null_mut()),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn start_makes_thread_ready() {
        let _session = testutil::session();
        let mut storage = [MaybeUninit::new(0u8); 512];
        let stack = Stack::from_slice(&mut storage);
        let mut t = Thread::<TestKernel>::new("worker");

        let attr = ThreadAttributes::new(priority::NORMAL, stack);
        assert_eq!(
            t.start(TestKernel, &attr, noop_entry, core::ptr::null_mut()),
            Ok(())
        );
        assert_eq!(t.state(), State::Ready);
        assert_eq!(t.priority(), priority::NORMAL);
        assert!(t.stack().check_bottom_magic());
        assert!(t.stack().check_top_magic());

        let sched = TestKernel.get_scheduler().lock();
        assert_eq!(sched.test_ready_names(), vec!["worker"]);
    }

    #[test]
    fn started_thread_records_parent_and_child() {
        let _session = testutil::session();
        let mut parent = testutil::thread("parent", priority::NORMAL);
        testutil::adopt_current(&mut parent);

        let mut storage = [MaybeUninit::new(0u8); 512];
        let attr = ThreadAttributes::new(priority::LOW, Stack::from_slice(&mut storage));
        let mut child = Thread::<TestKernel>::new("child");
        assert_eq!(
            child.start(TestKernel, &attr, noop_entry, core::ptr::null_mut()),
            Ok(())
        );

        assert_eq!(child.parent, Some(NonNull::from(&mut parent)));
        assert_eq!(parent.child_count(TestKernel), 1);
        let mut names = Vec::new();
        parent.for_each_child(TestKernel, |c| names.push(c.name()));
        assert_eq!(names, vec!["child"]);
    }

    #[test]
    fn per_thread_flags_wait_and_raise() {
        let _session = testutil::session();
        let mut cur = testutil::thread("cur", priority::NORMAL);
        testutil::adopt_current(&mut cur);

        assert_eq!(
            this_thread::flags_try_wait(TestKernel, 0b1010, flags_mode::ALL),
            Err(Error::WouldBlock)
        );

        assert_eq!(cur.flags_raise(TestKernel, 0b1000), Ok(0b1000));
        assert_eq!(
            this_thread::flags_try_wait(TestKernel, 0b1010, flags_mode::ALL),
            Err(Error::WouldBlock)
        );

        assert_eq!(cur.flags_raise(TestKernel, 0b0010), Ok(0b1010));
        assert_eq!(
            this_thread::flags_try_wait(
                TestKernel,
                0b1010,
                flags_mode::ALL | flags_mode::CLEAR
            ),
            Ok(0b1010)
        );
        assert_eq!(this_thread::flags_get(TestKernel, 0, 0), 0);
    }

    #[test]
    fn flags_raise_wakes_parked_thread_with_observed_flags() {
        let _session = testutil::session();
        let mut t = testutil::thread("t", priority::NORMAL);

        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                park_thread(
                    NonNull::from(&mut t),
                    None,
                    None,
                    WaitPayload::Flags {
                        mask: 0b1010,
                        mode: flags_mode::ALL | flags_mode::CLEAR,
                        grabbed: 0,
                    },
                );
            }
        }

        // First raise leaves the condition unsatisfied.
        assert_eq!(t.flags_raise(TestKernel, 0b1000), Ok(0b1000));
        assert_eq!(t.state(), State::Suspended);

        // Second raise completes the wait and consumes the mask.
        assert_eq!(t.flags_raise(TestKernel, 0b0010), Ok(0));
        assert_eq!(t.state(), State::Ready);
        assert_eq!(t.wake_status, Ok(()));
        match t.payload {
            WaitPayload::Flags { grabbed, .. } => assert_eq!(grabbed, 0b1010),
            _ => panic!("payload lost"),
        }
        assert_eq!(t.flags, 0);
    }

    #[test]
    fn flags_clear_is_a_no_op_without_raised_bits() {
        let _session = testutil::session();
        let mut cur = testutil::thread("cur", priority::NORMAL);
        testutil::adopt_current(&mut cur);

        assert_eq!(this_thread::flags_clear(TestKernel, 0b1111), Ok(0));
        assert_eq!(this_thread::flags_get(TestKernel, 0, 0), 0);
    }

    #[test]
    fn set_priority_moves_thread_in_ready_queue() {
        let _session = testutil::session();
        let mut a = testutil::thread("a", 5);
        let mut b = testutil::thread("b", 5);
        testutil::make_ready(&mut a);
        testutil::make_ready(&mut b);

        assert_eq!(a.set_priority(TestKernel, 9), Ok(()));
        assert_eq!(a.priority(), 9);
        {
            let sched = TestKernel.get_scheduler().lock();
            assert_eq!(sched.test_ready_names(), vec!["a", "b"]);
        }
        assert_eq!(a.set_priority(TestKernel, priority::ISR), Err(Error::Invalid));
    }

    #[test]
    fn join_of_terminated_thread_collects_exit_value() {
        let _session = testutil::session();
        let mut cur = testutil::thread("cur", priority::NORMAL);
        testutil::adopt_current(&mut cur);

        let mut t = testutil::thread("t", priority::LOW);
        t.state = State::Terminated;
        t.exit_value = 0x1234 as *mut c_void;

        assert_eq!(t.join(TestKernel), Ok(0x1234 as *mut c_void));
        assert_eq!(t.state(), State::Destroyed);
    }

    #[test]
    fn join_rejects_self_and_unstarted_targets() {
        let _session = testutil::session();
        let mut cur = testutil::thread("cur", priority::NORMAL);
        testutil::adopt_current(&mut cur);

        assert_eq!(cur.join(TestKernel), Err(Error::Deadlock));

        let undefined = testutil::thread("u", priority::LOW);
        assert_eq!(undefined.join(TestKernel), Err(Error::Invalid));
    }

    #[test]
    fn resume_of_plainly_suspended_thread_is_clean() {
        let _session = testutil::session();
        let mut t = testutil::thread("t", priority::NORMAL);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                park_thread(NonNull::from(&mut t), None, None, WaitPayload::None);
            }
        }
        assert_eq!(t.resume(TestKernel), Ok(()));
        assert_eq!(t.state(), State::Ready);
        assert_eq!(t.wake_status, Ok(()));
    }

    #[test]
    fn resume_interrupts_a_parked_wait() {
        let _session = testutil::session();
        let mut list = WaitList::<TestKernel>::new();
        let mut t = testutil::thread("t", priority::NORMAL);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                park_thread(
                    NonNull::from(&mut t),
                    Some(NonNull::from(&mut list)),
                    None,
                    WaitPayload::None,
                );
            }
        }
        assert_eq!(t.resume(TestKernel), Ok(()));
        assert_eq!(t.state(), State::Ready);
        assert_eq!(t.wake_status, Err(Error::Interrupted));
        assert!(list.is_empty());

        // Resuming a thread that is not suspended is a no-op.
        assert_eq!(t.resume(TestKernel), Ok(()));
    }

    #[test]
    fn destroy_requires_a_finished_thread() {
        let _session = testutil::session();
        let mut t = testutil::thread("t", priority::NORMAL);
        assert_eq!(t.destroy(TestKernel), Ok(()));

        testutil::make_ready(&mut t);
        assert_eq!(t.destroy(TestKernel), Err(Error::Invalid));
    }
}
