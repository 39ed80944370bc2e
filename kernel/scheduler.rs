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

//! The scheduler and the wait-list machinery.
//!
//! Strict priority scheduling with FIFO order inside a priority level.  The
//! ready queue is a bitmap of non-empty levels plus one FIFO list per level,
//! so selecting the next thread is O(1).
//!
//! Every blocking primitive is built from two operations defined here:
//! [`block_current`] parks the calling thread in a priority-ordered
//! [`WaitList`] (and, for timed waits, on a clock's sleep list) and switches
//! away; [`wake_thread`] is called by the releasing side, which decides the
//! outcome, transfers any resource, stores a wake status into the parked
//! thread and makes it ready.  Waits are single-shot: a woken thread never
//! re-checks a predicate, it just returns the status its waker recorded.

use core::ffi::c_void;
use core::ptr::NonNull;

use list::UnsafeList;
use log::debug;
use status::{Error, Result};

use crate::clock::ClockState;
use crate::config;
use crate::panic::{self, FaultCode};
use crate::port::ThreadContext as _;
use crate::sync::mutex::MutexInner;
use crate::sync::spinlock::SpinLockGuard;
use crate::Kernel;

mod locks;
pub mod thread;

pub use locks::{SchedLock, SchedLockGuard};
use thread::{ActiveLinkAdapter, State, Thread};

const SCHED_DEBUG: bool = false;
macro_rules! sched_debug {
  ($($args:expr),*) => {{
    if SCHED_DEBUG {
      debug!($($args),*)
    }
  }}
}

/// What a parked thread is waiting for, and where its waker deposits the
/// result.  Pointers reference the blocked caller's stack frame and are only
/// valid while the thread is parked.
#[derive(Clone, Copy)]
pub(crate) enum WaitPayload<K: Kernel> {
    None,
    /// Event-flags wait; `grabbed` receives the observed flags.
    Flags { mask: u32, mode: u32, grabbed: u32 },
    /// Waiting in `join`; receives the target's exit value.
    Join { exit_value: *mut c_void },
    /// Waiting on a condition variable that re-acquires `mutex`.
    CondWait { mutex: NonNull<MutexInner<K>> },
    /// Waiting to place a message into a full queue.
    Send { msg: *const u8, len: usize, prio: u8 },
    /// Waiting to take a message from an empty queue.
    Recv { buf: *mut u8, len: usize, prio: u8 },
    /// Waiting for a memory-pool block; receives the block address.
    Alloc { block: *mut u8 },
}

/// A priority-ordered list of parked threads.
///
/// Insertion keeps descending effective priority with FIFO order among equal
/// priorities, so the head is always the oldest highest-priority waiter.
pub struct WaitList<K: Kernel> {
    threads: UnsafeList<Thread<K>, ActiveLinkAdapter<K>>,
}

unsafe impl<K: Kernel> Send for WaitList<K> {}
unsafe impl<K: Kernel> Sync for WaitList<K> {}

impl<K: Kernel> WaitList<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads: UnsafeList::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) unsafe fn insert(&mut self, thread: NonNull<Thread<K>>) {
        self.threads.insert_sorted_by_unchecked(thread.as_ptr(), |new, cur| {
            new.effective_priority > cur.effective_priority
        });
    }

    pub(crate) unsafe fn remove(&mut self, thread: NonNull<Thread<K>>) {
        self.threads.unlink_element(thread);
    }

    /// Re-sorts `thread` after a priority change.
    pub(crate) unsafe fn requeue(&mut self, thread: NonNull<Thread<K>>) {
        self.threads.unlink_element_unchecked(thread.as_ptr());
        self.insert(thread);
    }

    pub(crate) unsafe fn head(&self) -> Option<NonNull<Thread<K>>> {
        self.threads.peek_head()
    }

    /// Effective priority of the head waiter, or `NONE` when empty.
    pub(crate) unsafe fn head_priority(&self) -> u8 {
        match self.head() {
            Some(t) => t.as_ref().effective_priority,
            None => thread::priority::NONE,
        }
    }

    pub(crate) unsafe fn for_each<E, F: FnMut(&Thread<K>) -> core::result::Result<(), E>>(
        &self,
        callback: F,
    ) -> core::result::Result<(), E> {
        self.threads.for_each(callback)
    }
}

impl<K: Kernel> Default for WaitList<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The ready queue: a bitmap of non-empty levels plus a FIFO list per level.
struct RunQueue<K: Kernel> {
    bitmap: u64,
    levels: [UnsafeList<Thread<K>, ActiveLinkAdapter<K>>; config::PRIORITY_LEVELS],
}

impl<K: Kernel> RunQueue<K> {
    const fn new() -> Self {
        Self {
            bitmap: 0,
            levels: [const { UnsafeList::new() }; config::PRIORITY_LEVELS],
        }
    }

    fn highest(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some((u64::BITS - 1 - self.bitmap.leading_zeros()) as u8)
        }
    }

    unsafe fn push_back(&mut self, thread: NonNull<Thread<K>>) {
        let level = thread.as_ref().effective_priority as usize;
        self.levels[level].push_back_unchecked(thread.as_ptr());
        self.bitmap |= 1 << level;
    }

    unsafe fn push_front(&mut self, thread: NonNull<Thread<K>>) {
        let level = thread.as_ref().effective_priority as usize;
        self.levels[level].push_front_unchecked(thread.as_ptr());
        self.bitmap |= 1 << level;
    }

    unsafe fn remove(&mut self, thread: NonNull<Thread<K>>) {
        let level = thread.as_ref().effective_priority as usize;
        self.levels[level].unlink_element(thread);
        if self.levels[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
    }

    unsafe fn pop_highest(&mut self) -> Option<NonNull<Thread<K>>> {
        let level = self.highest()? as usize;
        let thread = self.levels[level].pop_head();
        if self.levels[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        thread
    }
}

/// Global scheduler state, protected by the port spinlock.
pub struct SchedulerState<K: Kernel> {
    run_queue: RunQueue<K>,
    current: Option<NonNull<Thread<K>>>,
    current_context: *mut K::ThreadContext,
    initialized: bool,
    started: bool,
    locked: bool,
    preempt_pending: bool,
    #[cfg(feature = "context-switch-stats")]
    context_switches: u64,
    #[cfg(feature = "cpu-cycle-stats")]
    last_cycle_sample: u64,
}

unsafe impl<K: Kernel> Send for SchedulerState<K> {}
unsafe impl<K: Kernel> Sync for SchedulerState<K> {}

impl<K: Kernel> SchedulerState<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            run_queue: RunQueue::new(),
            current: None,
            current_context: core::ptr::null_mut(),
            initialized: false,
            started: false,
            locked: false,
            preempt_pending: false,
            #[cfg(feature = "context-switch-stats")]
            context_switches: 0,
            #[cfg(feature = "cpu-cycle-stats")]
            last_cycle_sample: 0,
        }
    }

    pub(crate) fn current_ptr(&self) -> Option<NonNull<Thread<K>>> {
        self.current
    }

    /// Removes the running thread from the current slot, charging its CPU
    /// time.  The caller is responsible for re-queuing it somewhere.
    pub(crate) fn take_current(&mut self) -> Option<NonNull<Thread<K>>> {
        let thread = self.current.take()?;
        #[cfg(feature = "cpu-cycle-stats")]
        unsafe {
            let now = K::default().cycle_count();
            (*thread.as_ptr()).cpu_cycles += now.wrapping_sub(self.last_cycle_sample);
            self.last_cycle_sample = now;
        }
        Some(thread)
    }

    fn set_current(&mut self, thread: NonNull<Thread<K>>) {
        #[cfg(feature = "cpu-cycle-stats")]
        {
            self.last_cycle_sample = K::default().cycle_count();
        }
        self.current_context = unsafe { (*thread.as_ptr()).context.get() };
        self.current = Some(thread);
    }

    pub(crate) unsafe fn insert_ready_tail(&mut self, thread: NonNull<Thread<K>>) {
        debug_assert!(thread.as_ref().state == State::Ready);
        self.run_queue.push_back(thread);
    }

    pub(crate) unsafe fn insert_ready_head(&mut self, thread: NonNull<Thread<K>>) {
        debug_assert!(thread.as_ref().state == State::Ready);
        self.run_queue.push_front(thread);
    }

    pub(crate) unsafe fn remove_ready(&mut self, thread: NonNull<Thread<K>>) {
        self.run_queue.remove(thread);
    }

    /// Flags a preemption if `woken` outranks the running thread.
    pub(crate) fn note_wake_priority(&mut self, woken: NonNull<Thread<K>>) {
        if let Some(current) = self.current {
            let woken_prio = unsafe { woken.as_ref().effective_priority };
            let current_prio = unsafe { current.as_ref().effective_priority };
            if woken_prio > current_prio {
                self.preempt_pending = true;
            }
        }
    }

    pub(crate) fn highest_ready_priority(&self) -> Option<u8> {
        self.run_queue.highest()
    }

    #[cfg(feature = "context-switch-stats")]
    pub(crate) fn context_switch_total(&self) -> u64 {
        self.context_switches
    }
}

#[cfg(test)]
impl<K: Kernel> SchedulerState<K> {
    pub(crate) fn test_adopt_current(&mut self, thread: NonNull<Thread<K>>) {
        unsafe {
            (*thread.as_ptr()).state = State::Running;
        }
        self.set_current(thread);
    }

    pub(crate) fn test_preempt_pending(&self) -> bool {
        self.preempt_pending
    }

    /// Thread names in dequeue order (highest priority first, FIFO within).
    pub(crate) fn test_ready_names(&self) -> std::vec::Vec<&'static str> {
        let mut names = std::vec::Vec::new();
        let mut level = config::PRIORITY_LEVELS;
        while level > 0 {
            level -= 1;
            unsafe {
                let _ = self.run_queue.levels[level].for_each(
                    |t| -> core::result::Result<(), ()> {
                        names.push(t.name());
                        Ok(())
                    },
                );
            }
        }
        names
    }

    /// Pops the next thread the scheduler would run, leaving it unlinked.
    pub(crate) fn test_pop_next(&mut self) -> Option<NonNull<Thread<K>>> {
        unsafe { self.run_queue.pop_highest() }
    }
}

impl<K: Kernel> Default for SchedulerState<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Parking and waking

/// Parks `thread` (already removed from the running slot or ready queue).
///
/// Links it into `wait_list` in priority order and, for timed waits, onto
/// the sleep list of the clock in `deadline`.  Caller holds the scheduler
/// lock.
pub(crate) unsafe fn park_thread<K: Kernel>(
    thread: NonNull<Thread<K>>,
    wait_list: Option<NonNull<WaitList<K>>>,
    deadline: Option<(NonNull<ClockState<K>>, u64)>,
    payload: WaitPayload<K>,
) {
    let t = thread.as_ptr();
    (*t).state = State::Suspended;
    (*t).payload = payload;
    (*t).wake_status = Err(Error::Interrupted);
    if let Some(mut list) = wait_list {
        list.as_mut().insert(thread);
        (*t).wait_anchor = Some(list);
    }
    if let Some((clock, at)) = deadline {
        (*t).wake_deadline = at;
        (*clock.as_ptr()).enqueue_sleeper(thread);
        (*t).clock_anchor = Some(clock);
    }
}

/// Completes a parked thread's wait: unlinks it from its wait list and sleep
/// list, records `status` and readies it.  The woken thread returns `status`
/// from its blocking call; any resource transfer (mutex ownership, a message,
/// a pool block) must already have been recorded in its payload.
///
/// Caller holds the scheduler lock.
pub(crate) unsafe fn wake_thread<K: Kernel>(
    kernel: K,
    sched: &mut SchedulerState<K>,
    thread: NonNull<Thread<K>>,
    status: Result<()>,
) {
    let _ = kernel;
    let t = thread.as_ptr();
    debug_assert!((*t).state == State::Suspended);
    sched_debug!("waking <{}>", (*t).name());

    if let Some(mut list) = (*t).wait_anchor.take() {
        list.as_mut().remove(thread);
    }
    if let Some(clock) = (*t).clock_anchor.take() {
        (*clock.as_ptr()).remove_sleeper(thread);
    }
    // A thread leaving a join releases its claim on the target's joiner
    // slot.
    if let Some(target) = (*t).joining.take() {
        (*target.as_ptr()).joiner = None;
    }
    (*t).blocked_on_mutex = None;
    (*t).wake_status = status;
    (*t).state = State::Ready;
    sched.insert_ready_tail(thread);
    sched.note_wake_priority(thread);
}

/// Parks the calling thread and switches away; returns when some waker has
/// readied it again, with the status the waker recorded.
pub(crate) fn block_current<K: Kernel>(
    kernel: K,
    mut sched: SpinLockGuard<'static, K, SchedulerState<K>>,
    wait_list: Option<NonNull<WaitList<K>>>,
    deadline: Option<(NonNull<ClockState<K>>, u64)>,
    payload: WaitPayload<K>,
) -> (SpinLockGuard<'static, K, SchedulerState<K>>, Result<()>) {
    let Some(thread) = sched.take_current() else {
        return (sched, Err(Error::Permission));
    };
    let id = unsafe { thread.as_ref().id() };
    sched_debug!("<{}> blocking", unsafe { thread.as_ref().name() });

    unsafe { park_thread(thread, wait_list, deadline, payload) };
    let sched = reschedule(kernel, sched, id);

    // We only get here once a waker has recorded the outcome.
    let status = unsafe { thread.as_ref().wake_status };
    (sched, status)
}

// ---------------------------------------------------------------------------
// Scheduling

/// Selects the highest-priority ready thread and switches to it.
///
/// The caller has already parked or re-queued the previously running thread;
/// `prev_id` identifies it so a re-selection of the same thread skips the
/// context switch.
pub(crate) fn reschedule<K: Kernel>(
    kernel: K,
    mut sched: SpinLockGuard<'static, K, SchedulerState<K>>,
    prev_id: usize,
) -> SpinLockGuard<'static, K, SchedulerState<K>> {
    debug_assert!(sched.current.is_none());

    let Some(next) = (unsafe { sched.run_queue.pop_highest() }) else {
        panic::fault(kernel, FaultCode::RunQueueEmpty);
    };

    unsafe {
        debug_assert!(next.as_ref().state == State::Ready);
        (*next.as_ptr()).state = State::Running;
    }

    let old_context = sched.current_context;
    sched.set_current(next);

    if unsafe { next.as_ref().id() } == prev_id {
        return sched;
    }

    #[cfg(feature = "context-switch-stats")]
    unsafe {
        sched.context_switches += 1;
        (*next.as_ptr()).context_switches += 1;
    }

    let new_context = unsafe { (*next.as_ptr()).context.get() };
    unsafe { kernel.context_switch(sched, old_context, new_context) }
}

/// Performs a pending preemption unless the scheduler is locked or not yet
/// running.  The preempted thread keeps its FIFO position by re-entering at
/// the head of its priority level.
pub(crate) fn maybe_preempt<K: Kernel>(
    kernel: K,
    mut sched: SpinLockGuard<'static, K, SchedulerState<K>>,
) -> SpinLockGuard<'static, K, SchedulerState<K>> {
    if !sched.started || sched.locked || !sched.preempt_pending {
        return sched;
    }
    sched.preempt_pending = false;

    let Some(current) = sched.take_current() else {
        return sched;
    };
    let id = unsafe { current.as_ref().id() };
    unsafe {
        (*current.as_ptr()).state = State::Ready;
        sched.insert_ready_head(current);
    }
    reschedule(kernel, sched, id)
}

/// Entry point for port interrupt epilogues: performs a context switch if a
/// wake during the interrupt made a higher-priority thread ready.
pub fn preempt_if_pending<K: Kernel>(kernel: K) {
    let sched = kernel.get_scheduler().lock();
    let sched = maybe_preempt(kernel, sched);
    drop(sched);
}

/// One-time kernel initialization: sets up internal state and starts the
/// tick source.  Must not be called from handler mode; repeated calls are
/// no-ops.
pub fn initialize<K: Kernel>(kernel: K) -> Result<()> {
    if kernel.in_handler_mode() {
        return Err(Error::Permission);
    }
    let mut sched = kernel.get_scheduler().lock();
    if !sched.initialized {
        sched.initialized = true;
        drop(sched);
        kernel.start_tick(config::TICK_HZ);
    }
    Ok(())
}

/// Begins executing the highest-priority ready thread.  Never returns; at
/// least one thread (the idle thread) must have been started.
pub fn start<K: Kernel>(kernel: K) -> ! {
    if kernel.in_handler_mode() {
        panic::fault(kernel, FaultCode::HandlerModeViolation);
    }
    let mut sched = kernel.get_scheduler().lock();
    if sched.started {
        panic::fault(kernel, FaultCode::SchedulerState);
    }
    sched.started = true;

    debug!("scheduler starting");

    // Context save target for the abandoned boot stack.
    let mut boot_context = K::ThreadContext::INIT;
    sched.current_context = &raw mut boot_context;

    let _sched = reschedule(kernel, sched, Thread::<K>::null_id());
    panic::fault(kernel, FaultCode::SchedulerState)
}

/// True once [`start`] has been called.  Safe from any context.
pub fn is_started<K: Kernel>(kernel: K) -> bool {
    kernel.get_scheduler().lock().started
}

/// Sets the scheduler-locked state, returning the prior state.
///
/// While locked, context switches are deferred (interrupts stay enabled).
/// From handler mode this is a no-op that still reports the prior state.
pub fn lock<K: Kernel>(kernel: K, state: bool) -> bool {
    let mut sched = kernel.get_scheduler().lock();
    let prior = sched.locked;
    if !kernel.in_handler_mode() {
        sched.locked = state;
    }
    prior
}

/// Restores a scheduler-locked state saved by [`lock`].  Unlocking performs
/// any preemption that became pending while locked.
pub fn unlock<K: Kernel>(kernel: K, prior: bool) {
    let mut sched = kernel.get_scheduler().lock();
    if kernel.in_handler_mode() {
        return;
    }
    sched.locked = prior;
    if !prior {
        let sched = maybe_preempt(kernel, sched);
        drop(sched);
    }
}

/// True while the scheduler-locked state is set.  Safe from any context.
pub fn is_locked<K: Kernel>(kernel: K) -> bool {
    kernel.get_scheduler().lock().locked
}

/// Yields the processor: the calling thread goes to the back of its priority
/// level and the highest-priority ready thread runs.
pub fn yield_now<K: Kernel>(kernel: K) {
    if kernel.in_handler_mode() {
        return;
    }
    let mut sched = kernel.get_scheduler().lock();
    if !sched.started || sched.locked {
        return;
    }
    let Some(current) = sched.take_current() else {
        return;
    };
    let id = unsafe { current.as_ref().id() };
    unsafe {
        (*current.as_ptr()).state = State::Ready;
        sched.insert_ready_tail(current);
    }
    let sched = reschedule(kernel, sched, id);
    drop(sched);
}

/// Total context switches since boot.
#[cfg(feature = "context-switch-stats")]
pub fn context_switch_count<K: Kernel>(kernel: K) -> u64 {
    kernel.get_scheduler().lock().context_switch_total()
}

// ---------------------------------------------------------------------------
// Priority maintenance

/// Installs a new effective priority, moving the thread within whichever
/// queue position depends on it.  Caller holds the scheduler lock.
unsafe fn set_effective_priority<K: Kernel>(
    sched: &mut SchedulerState<K>,
    thread: NonNull<Thread<K>>,
    effective: u8,
) {
    let t = thread.as_ptr();
    if effective == (*t).effective_priority {
        return;
    }

    match (*t).state {
        State::Ready => {
            sched.remove_ready(thread);
            (*t).effective_priority = effective;
            sched.insert_ready_tail(thread);
            sched.note_wake_priority(thread);
        }
        State::Running => {
            (*t).effective_priority = effective;
            if let Some(highest) = sched.highest_ready_priority() {
                if highest > effective {
                    sched.preempt_pending = true;
                }
            }
        }
        State::Suspended => {
            (*t).effective_priority = effective;
            if let Some(mut list) = (*t).wait_anchor {
                list.as_mut().requeue(thread);
            }
        }
        _ => {
            (*t).effective_priority = effective;
        }
    }
}

/// Recomputes `thread`'s effective priority from its base priority and the
/// mutexes it owns, adjusts whichever queue it occupies, and cascades along
/// an inheritance chain if the thread is itself blocked on an inherit mutex.
///
/// Caller holds the scheduler lock.
pub(crate) unsafe fn refresh_priority<K: Kernel>(
    sched: &mut SchedulerState<K>,
    thread: NonNull<Thread<K>>,
) {
    let mut cur = thread;
    loop {
        let t = cur.as_ptr();

        let mut effective = (*t).base_priority;
        let _ = (*t)
            .owned_mutexes
            .for_each(|mutex| -> core::result::Result<(), ()> {
                let contribution = mutex.priority_contribution();
                if contribution > effective {
                    effective = contribution;
                }
                Ok(())
            });

        if effective == (*t).effective_priority {
            return;
        }
        set_effective_priority(sched, cur, effective);

        // Follow the inheritance chain: our position in the owner's waiting
        // list changed, so the owner's boost may change too.
        match (*t).blocked_on_mutex {
            Some(mutex) if (*mutex.as_ptr()).inherits_priority() => {
                match (*mutex.as_ptr()).owner {
                    Some(owner) => cur = owner,
                    None => return,
                }
            }
            _ => return,
        }
    }
}

/// Raises the owner of `mutex` (and transitively every owner the chain is
/// blocked on) to at least `floor`.  Used by priority-inheritance lock paths
/// before the acquirer parks.
///
/// Caller holds the scheduler lock.
pub(crate) unsafe fn boost_priority_chain<K: Kernel>(
    sched: &mut SchedulerState<K>,
    mutex: NonNull<MutexInner<K>>,
    floor: u8,
) {
    let mut m = mutex;
    loop {
        let Some(owner) = (*m.as_ptr()).owner else {
            return;
        };
        if owner.as_ref().effective_priority >= floor {
            return;
        }
        set_effective_priority(sched, owner, floor);

        match owner.as_ref().blocked_on_mutex {
            Some(next) if (*next.as_ptr()).inherits_priority() => m = next,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, TestKernel};

    #[test]
    fn ready_queue_orders_by_priority_then_fifo() {
        let _session = testutil::session();
        let mut a = testutil::thread("a", 5);
        let mut b = testutil::thread("b", 5);
        let mut c = testutil::thread("c", 7);
        let mut d = testutil::thread("d", 3);

        testutil::make_ready(&mut a);
        testutil::make_ready(&mut b);
        testutil::make_ready(&mut c);
        testutil::make_ready(&mut d);

        let sched = TestKernel.get_scheduler().lock();
        assert_eq!(sched.test_ready_names(), vec!["c", "a", "b", "d"]);
        assert_eq!(sched.highest_ready_priority(), Some(7));
    }

    #[test]
    fn pop_highest_drains_in_priority_fifo_order() {
        let _session = testutil::session();
        let mut a = testutil::thread("a", 5);
        let mut b = testutil::thread("b", 5);
        let mut c = testutil::thread("c", 7);

        testutil::make_ready(&mut a);
        testutil::make_ready(&mut b);
        testutil::make_ready(&mut c);

        let mut sched = TestKernel.get_scheduler().lock();
        let order: Vec<&str> = core::iter::from_fn(|| {
            sched
                .test_pop_next()
                .map(|t| unsafe { t.as_ref().name() })
        })
        .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(sched.highest_ready_priority(), None);
    }

    #[test]
    fn wait_list_wakes_highest_priority_oldest_first() {
        let _session = testutil::session();
        let mut list = WaitList::<TestKernel>::new();
        let mut w1 = testutil::thread("w1", 2);
        let mut w2 = testutil::thread("w2", 5);
        let mut w3 = testutil::thread("w3", 5);
        let mut w4 = testutil::thread("w4", 7);

        let list_ptr = NonNull::from(&mut list);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                for t in [&mut w1, &mut w2, &mut w3, &mut w4] {
                    park_thread(NonNull::from(t), Some(list_ptr), None, WaitPayload::None);
                }
            }
        }
        assert_eq!(list.len(), 4);

        let mut order = Vec::new();
        {
            let mut sched = TestKernel.get_scheduler().lock();
            unsafe {
                while let Some(head) = list.head() {
                    order.push(head.as_ref().name());
                    wake_thread(TestKernel, &mut sched, head, Ok(()));
                }
            }
        }
        assert_eq!(order, vec!["w4", "w2", "w3", "w1"]);
    }

    #[test]
    fn timed_wait_links_exactly_two_nodes() {
        let _session = testutil::session();
        let mut list = WaitList::<TestKernel>::new();
        let mut t = testutil::thread("t", 5);
        let list_ptr = NonNull::from(&mut list);

        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                let clock = NonNull::new_unchecked(TestKernel.sysclock_state().raw());
                park_thread(
                    NonNull::from(&mut t),
                    Some(list_ptr),
                    Some((clock, 10)),
                    WaitPayload::None,
                );
            }
        }
        assert!(t.active_link.is_linked());
        assert!(t.clock_link.is_linked());
        assert!(!t.child_link.is_linked());
        assert_eq!(t.state, State::Suspended);

        {
            let mut sched = TestKernel.get_scheduler().lock();
            unsafe {
                wake_thread(TestKernel, &mut sched, NonNull::from(&mut t), Ok(()));
            }
        }
        // Woken: out of the wait and sleep lists, into the ready queue.
        assert!(t.active_link.is_linked());
        assert!(t.clock_link.is_unlinked());
        assert!(list.is_empty());
        assert!(t.wait_anchor.is_none());
        assert!(t.clock_anchor.is_none());
        assert_eq!(t.state, State::Ready);
    }

    #[test]
    fn wake_of_higher_priority_thread_flags_preemption() {
        let _session = testutil::session();
        let mut cur = testutil::thread("cur", 3);
        testutil::adopt_current(&mut cur);

        let mut lo = testutil::thread("lo", 2);
        let mut hi = testutil::thread("hi", 5);
        {
            let _sched = TestKernel.get_scheduler().lock();
            unsafe {
                park_thread(NonNull::from(&mut lo), None, None, WaitPayload::None);
                park_thread(NonNull::from(&mut hi), None, None, WaitPayload::None);
            }
        }

        {
            let mut sched = TestKernel.get_scheduler().lock();
            unsafe {
                wake_thread(TestKernel, &mut sched, NonNull::from(&mut lo), Ok(()));
            }
            assert!(!sched.test_preempt_pending());
            unsafe {
                wake_thread(TestKernel, &mut sched, NonNull::from(&mut hi), Ok(()));
            }
            assert!(sched.test_preempt_pending());
        }
    }

    #[test]
    fn scheduler_lock_nests_by_saved_state() {
        let _session = testutil::session();
        assert!(!is_locked(TestKernel));

        let outer = lock(TestKernel, true);
        assert!(!outer);
        assert!(is_locked(TestKernel));

        let inner = lock(TestKernel, true);
        assert!(inner);

        unlock(TestKernel, inner);
        assert!(is_locked(TestKernel));
        unlock(TestKernel, outer);
        assert!(!is_locked(TestKernel));
    }

    #[test]
    fn scheduler_lock_from_handler_mode_is_a_no_op() {
        let _session = testutil::session();
        testutil::set_handler_mode(true);
        let prior = lock(TestKernel, true);
        assert!(!prior);
        assert!(!is_locked(TestKernel));
        testutil::set_handler_mode(false);
    }

    #[test]
    fn initialize_is_idempotent_and_rejects_handler_mode() {
        let _session = testutil::session();
        assert_eq!(initialize(TestKernel), Ok(()));
        assert_eq!(initialize(TestKernel), Ok(()));
        testutil::set_handler_mode(true);
        assert_eq!(initialize(TestKernel), Err(Error::Permission));
        testutil::set_handler_mode(false);
    }

    #[test]
    fn refresh_priority_moves_ready_thread_between_levels() {
        let _session = testutil::session();
        let mut a = testutil::thread("a", 5);
        let mut b = testutil::thread("b", 5);
        testutil::make_ready(&mut a);
        testutil::make_ready(&mut b);

        {
            let mut sched = TestKernel.get_scheduler().lock();
            a.base_priority = 9;
            unsafe {
                refresh_priority(&mut sched, NonNull::from(&mut a));
            }
            assert_eq!(a.effective_priority, 9);
            assert_eq!(sched.test_ready_names(), vec!["a", "b"]);
        }

        {
            let mut sched = TestKernel.get_scheduler().lock();
            b.base_priority = 11;
            unsafe {
                refresh_priority(&mut sched, NonNull::from(&mut b));
            }
            assert_eq!(sched.test_ready_names(), vec!["b", "a"]);
        }
    }

    #[test]
    fn wait_list_requeues_on_priority_change() {
        let _session = testutil::session();
        let mut list = WaitList::<TestKernel>::new();
        let mut w1 = testutil::thread("w1", 2);
        let mut w2 = testutil::thread("w2", 5);
        let list_ptr = NonNull::from(&mut list);

        {
            let mut sched = TestKernel.get_scheduler().lock();
            unsafe {
                park_thread(NonNull::from(&mut w1), Some(list_ptr), None, WaitPayload::None);
                park_thread(NonNull::from(&mut w2), Some(list_ptr), None, WaitPayload::None);
                assert_eq!(list.head().unwrap().as_ref().name(), "w2");

                w1.base_priority = 9;
                refresh_priority(&mut sched, NonNull::from(&mut w1));
                assert_eq!(list.head().unwrap().as_ref().name(), "w1");
            }
        }
    }
}
