//! Thread scheduler.
//!
//! The scheduler owns every thread control block. A block is always in
//! exactly one place: the `current` slot, or one of the `ready`, `blocked`
//! and `finished` queues. Moving a thread between places moves its `Box`, so
//! the block itself, and the context embedded in it, never changes address.
//!
//! The scheduler lives in a process-wide cell that is only reachable through
//! [`with_scheduler`], which demands an [`InterruptGuard`]. The guard keeps
//! the preemption handler, the only other code that touches the cell, away.
use super::{BlockReason, MAIN_THREAD, MAX_THREADS, Thread, ThreadId, ThreadState};
use crate::ThreadError;
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::collections::VecDeque;
use uthread_machine::{context, interrupt::InterruptGuard, timer::VirtualTimer};

/// The scheduler queues.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Queue {
    Ready,
    Blocked,
    Finished,
}

impl Queue {
    /// The queue a thread in `state` belongs to.
    fn holding(state: ThreadState) -> Self {
        match state {
            ThreadState::Ready => Queue::Ready,
            ThreadState::Blocked(_) => Queue::Blocked,
            ThreadState::Finished => Queue::Finished,
            ThreadState::Running => fatal!("a running thread does not belong to any queue"),
        }
    }
}

/// Where a thread is.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Location {
    Current,
    Queued(Queue),
}

pub(crate) struct Scheduler {
    ready: VecDeque<Box<Thread>>,
    blocked: VecDeque<Box<Thread>>,
    finished: VecDeque<Box<Thread>>,
    current: Option<Box<Thread>>,
    timer: VirtualTimer,
    stack_size: usize,
    next_tid: ThreadId,
    total_threads: usize,
    total_quantums: u64,
}

impl Scheduler {
    /// A scheduler whose current thread is the caller.
    pub(crate) fn new(timer: VirtualTimer, stack_size: usize) -> Self {
        // Enqueueing must never allocate: the preemption handler enqueues.
        CURRENT_TID.store(MAIN_THREAD, Ordering::SeqCst);
        Self {
            ready: VecDeque::with_capacity(MAX_THREADS),
            blocked: VecDeque::with_capacity(MAX_THREADS),
            finished: VecDeque::with_capacity(MAX_THREADS),
            current: Some(Thread::new_main()),
            timer,
            stack_size,
            next_tid: MAIN_THREAD + 1,
            total_threads: 1,
            total_quantums: 0,
        }
    }

    fn queue(&self, queue: Queue) -> &VecDeque<Box<Thread>> {
        match queue {
            Queue::Ready => &self.ready,
            Queue::Blocked => &self.blocked,
            Queue::Finished => &self.finished,
        }
    }

    fn queue_mut(&mut self, queue: Queue) -> &mut VecDeque<Box<Thread>> {
        match queue {
            Queue::Ready => &mut self.ready,
            Queue::Blocked => &mut self.blocked,
            Queue::Finished => &mut self.finished,
        }
    }

    /// Push `th` at the back of `queue`.
    pub(crate) fn enqueue(&mut self, queue: Queue, th: Box<Thread>) {
        self.queue_mut(queue).push_back(th);
    }

    pub(crate) fn find(&self, queue: Queue, tid: ThreadId) -> Option<&Thread> {
        self.queue(queue)
            .iter()
            .find(|th| th.tid() == tid)
            .map(Box::as_ref)
    }

    pub(crate) fn find_mut(&mut self, queue: Queue, tid: ThreadId) -> Option<&mut Thread> {
        self.queue_mut(queue)
            .iter_mut()
            .find(|th| th.tid() == tid)
            .map(Box::as_mut)
    }

    /// Take thread `tid` out of `queue`, keeping the order of the others.
    pub(crate) fn remove(&mut self, queue: Queue, tid: ThreadId) -> Option<Box<Thread>> {
        let queue = self.queue_mut(queue);
        let idx = queue.iter().position(|th| th.tid() == tid)?;
        queue.remove(idx)
    }

    /// Take the thread at the front of the ready queue.
    ///
    /// Finding the ready queue empty means every thread is blocked. No
    /// thread can ever run again, so the process is aborted.
    pub(crate) fn pop_ready(&mut self) -> Box<Thread> {
        match self.ready.pop_front() {
            Some(th) => th,
            None => fatal!("deadlock: no thread is ready to run"),
        }
    }

    pub(crate) fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub(crate) fn locate(&self, tid: ThreadId) -> Option<Location> {
        if self.current.as_ref().is_some_and(|th| th.tid() == tid) {
            return Some(Location::Current);
        }
        [Queue::Ready, Queue::Blocked, Queue::Finished]
            .into_iter()
            .find(|&queue| self.find(queue, tid).is_some())
            .map(Location::Queued)
    }

    /// Thread `tid`, wherever it is.
    pub(crate) fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        match self.locate(tid)? {
            Location::Current => self.current.as_deref(),
            Location::Queued(queue) => self.find(queue, tid),
        }
    }

    pub(crate) fn state_of(&self, tid: ThreadId) -> Option<ThreadState> {
        self.thread(tid).map(Thread::state)
    }

    /// The thread that claimed the join on `tid`.
    pub(crate) fn joiner_of(&self, tid: ThreadId) -> Option<ThreadId> {
        self.thread(tid).and_then(Thread::joined_by)
    }

    /// Claim the join on `tid` for `joiner`.
    ///
    /// Returns whether `joiner` has to block until `tid` finishes. A claim
    /// stays on the target after it finishes, so a finished thread is reaped
    /// only by the thread that claimed it, if any.
    pub(crate) fn claim_join(
        &mut self,
        tid: ThreadId,
        joiner: ThreadId,
    ) -> Result<bool, ThreadError> {
        let location = self.locate(tid).ok_or(ThreadError::NoSuchThread(tid))?;
        let ready_is_empty = self.ready_is_empty();
        let target = match location {
            Location::Current => return Err(ThreadError::SelfJoin),
            Location::Queued(queue) => self.find_mut(queue, tid),
        };
        let Some(target) = target else {
            return Err(ThreadError::NoSuchThread(tid));
        };
        match (location, target.joined_by()) {
            (Location::Queued(Queue::Finished), None) => Ok(false),
            (Location::Queued(Queue::Finished), Some(claimer)) if claimer == joiner => Ok(false),
            (_, Some(_)) => Err(ThreadError::AlreadyJoined(tid)),
            (_, None) if ready_is_empty => Err(ThreadError::Deadlock),
            (_, None) => {
                target.set_joined_by(Some(joiner));
                Ok(true)
            }
        }
    }

    /// Drop the claim on `tid` after the claiming thread failed to block.
    pub(crate) fn release_join(&mut self, tid: ThreadId) {
        let target = match self.locate(tid) {
            Some(Location::Queued(queue)) => self.find_mut(queue, tid),
            _ => None,
        };
        if let Some(target) = target {
            target.set_joined_by(None);
        }
    }

    pub(crate) fn total_quantums(&self) -> u64 {
        self.total_quantums
    }

    pub(crate) fn live_threads(&self) -> usize {
        self.total_threads
    }

    fn current_mut(&mut self) -> &mut Thread {
        match self.current.as_deref_mut() {
            Some(th) => th,
            None => fatal!("no current thread"),
        }
    }

    /// Count the quantum the current thread just completed.
    pub(crate) fn charge_quantum(&mut self) {
        self.current_mut().add_quantum();
        self.total_quantums += 1;
    }

    /// Undo [`Self::charge_quantum`].
    pub(crate) fn refund_quantum(&mut self) {
        self.current_mut().remove_quantum();
        self.total_quantums -= 1;
    }

    /// Add a new ready thread running `thread_fn`.
    pub(crate) fn spawn<F>(&mut self, thread_fn: F) -> Result<ThreadId, ThreadError>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        if self.total_threads >= MAX_THREADS {
            return Err(ThreadError::TooManyThreads { max: MAX_THREADS });
        }
        let tid = self.next_tid;
        self.next_tid += 1;
        self.enqueue(Queue::Ready, Thread::new(tid, self.stack_size, thread_fn));
        self.total_threads += 1;
        Ok(tid)
    }

    /// Move blocked thread `tid` to the back of the ready queue.
    pub(crate) fn wake(&mut self, tid: ThreadId) {
        let Some(mut th) = self.remove(Queue::Blocked, tid) else {
            fatal!("thread {tid} is woken up but it is not blocked")
        };
        th.set_state(ThreadState::Ready);
        self.enqueue(Queue::Ready, th);
    }

    /// Re-block blocked thread `tid` for another reason.
    pub(crate) fn reblock(&mut self, tid: ThreadId, reason: BlockReason) {
        match self.find_mut(Queue::Blocked, tid) {
            Some(th) => th.set_state(ThreadState::Blocked(reason)),
            None => fatal!("thread {tid} is re-blocked but it is not blocked"),
        }
    }

    /// Block thread `tid`, which is not the current thread, by `suspend`.
    pub(crate) fn suspend(&mut self, tid: ThreadId) -> Result<(), ThreadError> {
        match self.locate(tid) {
            Some(Location::Queued(Queue::Ready)) => {
                if let Some(mut th) = self.remove(Queue::Ready, tid) {
                    th.set_state(ThreadState::Blocked(BlockReason::Suspended));
                    self.enqueue(Queue::Blocked, th);
                }
                Ok(())
            }
            Some(Location::Queued(Queue::Blocked)) => Ok(()),
            _ => Err(ThreadError::NoSuchThread(tid)),
        }
    }

    /// Remove finished thread `tid` for good.
    pub(crate) fn reap(&mut self, tid: ThreadId) -> Option<Box<Thread>> {
        let th = self.remove(Queue::Finished, tid)?;
        self.total_threads -= 1;
        Some(th)
    }

    /// Move the current thread into the queue matching `state`.
    ///
    /// Returns the parked thread, which stays at the same address until it is
    /// reaped.
    pub(crate) fn park(&mut self, state: ThreadState) -> *mut Thread {
        let Some(mut th) = self.current.take() else {
            fatal!("no current thread to park")
        };
        th.set_state(state);
        let prev: *mut Thread = &mut *th;
        self.enqueue(Queue::holding(state), th);
        prev
    }

    /// Undo [`Self::park`] for thread `tid` after a failed dispatch.
    pub(crate) fn unpark(&mut self, tid: ThreadId) {
        let th = match self.locate(tid) {
            Some(Location::Queued(queue)) => self.remove(queue, tid),
            _ => None,
        };
        let Some(mut th) = th else {
            fatal!("parked thread {tid} vanished")
        };
        th.set_state(ThreadState::Running);
        self.current = Some(th);
    }

    /// Finish the current thread with `retval` and make its joiner ready.
    ///
    /// Returns `None`, leaving everything untouched, if the current thread is
    /// the main thread.
    pub(crate) fn finish_current(&mut self, retval: Option<usize>) -> Option<*mut Thread> {
        let current = self.current_mut();
        if current.is_main() {
            return None;
        }
        current.set_retval(retval);
        let joiner = current.joined_by();
        self.charge_quantum();
        if let Some(joiner) = joiner {
            self.wake(joiner);
        }
        Some(self.park(ThreadState::Finished))
    }

    /// Make the thread at the front of the ready queue the current thread and
    /// start its quantum.
    ///
    /// If the timer cannot be armed the thread is put back and nothing
    /// changes.
    fn dispatch(&mut self) -> Result<*mut Thread, ThreadError> {
        let mut next = self.pop_ready();
        if let Err(source) = self.timer.arm() {
            self.ready.push_front(next);
            return Err(ThreadError::Os {
                op: "setitimer",
                source,
            });
        }
        next.set_state(ThreadState::Running);
        CURRENT_TID.store(next.tid(), Ordering::SeqCst);
        let next_ptr: *mut Thread = &mut *next;
        if self.current.replace(next).is_some() {
            fatal!("dispatching over a current thread");
        }
        Ok(next_ptr)
    }
}

struct Runtime(UnsafeCell<Option<Scheduler>>);

// Only reached from the single OS thread running the library, with the
// preemption signal blocked.
unsafe impl Sync for Runtime {}

static RUNTIME: Runtime = Runtime(UnsafeCell::new(None));

/// Mirror of the current thread's id, readable without a guard.
static CURRENT_TID: AtomicUsize = AtomicUsize::new(MAIN_THREAD);

pub(crate) fn current_tid() -> ThreadId {
    CURRENT_TID.load(Ordering::SeqCst)
}

/// Run `f` with the scheduler.
///
/// `f` must not call back into `with_scheduler`, and must not switch.
pub(crate) fn with_scheduler<R>(
    _guard: &InterruptGuard,
    f: impl FnOnce(&mut Scheduler) -> R,
) -> Result<R, ThreadError> {
    match unsafe { (*RUNTIME.0.get()).as_mut() } {
        Some(scheduler) => Ok(f(scheduler)),
        None => Err(ThreadError::NotInitialized),
    }
}

pub(crate) fn is_installed(_guard: &InterruptGuard) -> bool {
    unsafe { (*RUNTIME.0.get()).is_some() }
}

pub(crate) fn install(_guard: &InterruptGuard, scheduler: Scheduler) {
    unsafe { *RUNTIME.0.get() = Some(scheduler) };
}

pub(crate) fn uninstall(_guard: &InterruptGuard) {
    unsafe { *RUNTIME.0.get() = None };
}

/// Run the next ready thread.
///
/// `prev` is the thread that was current until it was parked. When the ready
/// queue hands back `prev` itself, it simply continues. Otherwise this
/// returns once `prev` is dispatched again.
pub(crate) fn switch_to_next(guard: &InterruptGuard, prev: *mut Thread) -> Result<(), ThreadError> {
    let next = with_scheduler(guard, Scheduler::dispatch)??;
    if core::ptr::eq(next, prev) {
        return Ok(());
    }
    unsafe {
        if !(*prev).stack_intact() {
            fatal!("stack overflow detected in thread {}", (*prev).tid());
        }
        context::switch(&raw mut (*prev).context, &raw const (*next).context);
    }
    Ok(())
}

/// Park the current thread in `state` and run the next ready thread.
///
/// Returns once the caller is dispatched again. If no thread can be
/// dispatched, the caller is made current again and the error is returned.
pub(crate) fn park_current(guard: &InterruptGuard, state: ThreadState) -> Result<(), ThreadError> {
    let tid = current_tid();
    let prev = with_scheduler(guard, |s| s.park(state))?;
    if let Err(e) = switch_to_next(guard, prev) {
        with_scheduler(guard, |s| s.unpark(tid))?;
        return Err(e);
    }
    Ok(())
}

/// Block the current thread for `reason` until another thread wakes it.
///
/// Used by the synchronization primitives, which have no way to report a
/// failed switch to their callers.
pub(crate) fn block_current(guard: &InterruptGuard, reason: BlockReason) {
    if let Err(e) = park_current(guard, ThreadState::Blocked(reason)) {
        fatal!("thread {} cannot block: {e}", current_tid());
    }
}

/// Make blocked thread `tid` ready.
pub(crate) fn wake(guard: &InterruptGuard, tid: ThreadId) {
    if with_scheduler(guard, |s| s.wake(tid)).is_err() {
        fatal!("thread {tid} is woken up before initialization");
    }
}

/// Record that blocked thread `tid` now waits for another `reason`.
pub(crate) fn reblock(guard: &InterruptGuard, tid: ThreadId, reason: BlockReason) {
    if with_scheduler(guard, |s| s.reblock(tid, reason)).is_err() {
        fatal!("thread {tid} is re-blocked before initialization");
    }
}
