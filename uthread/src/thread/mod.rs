//! Thread abstraction.
//!
//! ## The threading model
//!
//! A program using uthread consists of a collection of threads, each with its
//! own stack and local state, all running on one OS thread. Exactly one of
//! them runs at any time. The others wait in one of the scheduler's queues:
//!
//! - **ready**: runnable, dispatched in FIFO order,
//! - **blocked**: waiting for [`resume`], for a joined thread to finish, or
//!   for a [`Lock`] or [`CondVar`],
//! - **finished**: done, waiting for [`join`] to collect the return value.
//!
//! A thread's return value is the value returned by its entry function, or
//! the value passed to [`exit`]. It is kept until the thread is joined, which
//! also releases the thread's stack.
//!
//! ```no_run
//! use uthread::thread;
//!
//! uthread::init(10_000).unwrap();
//! let handles: Vec<_> = (0..4)
//!     .map(|i| thread::create(move || i * 10).unwrap())
//!     .collect();
//! for (i, tid) in handles.into_iter().enumerate() {
//!     assert_eq!(thread::join(tid).unwrap(), i * 10);
//! }
//! ```
//!
//! [`Lock`]: crate::sync::Lock
//! [`CondVar`]: crate::sync::CondVar
pub(crate) mod scheduler;

pub use crate::sync::once::once;

use crate::ThreadError;
use scheduler::{Scheduler, with_scheduler};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};
use uthread_machine::{
    context::{Context, Stack},
    interrupt::InterruptGuard,
};

/// Size of each thread's stack.
pub const STACK_SIZE: usize = 0x200000 + 0x4000;

/// Maximum number of threads that exist at the same time, including the main
/// thread.
pub const MAX_THREADS: usize = 100;

/// Identifier of a thread.
///
/// Identifiers are assigned in creation order and never reused.
pub type ThreadId = usize;

/// Identifier of the thread that called [`init`](crate::init).
pub const MAIN_THREAD: ThreadId = 0;

/// Why a thread is blocked.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BlockReason {
    /// Blocked by [`suspend`].
    Suspended,
    /// Waiting for the thread to finish.
    Join(ThreadId),
    /// Waiting to acquire a [`Lock`](crate::sync::Lock).
    Lock,
    /// Waiting on a [`CondVar`](crate::sync::CondVar).
    CondVar,
}

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Ready,
    /// Thread is running.
    Running,
    /// Thread is blocked.
    Blocked(BlockReason),
    /// Thread is finished and waits to be joined.
    Finished,
}

/// The thread control block.
pub(crate) struct Thread {
    pub(crate) context: Context,
    /// `None` for the main thread, which runs on the process stack.
    stack: Option<Stack>,
    tid: ThreadId,
    state: ThreadState,
    quantums: u64,
    /// `None` until finished, and after a panic.
    retval: Option<usize>,
    /// The only thread allowed to reap this one.
    joined_by: Option<ThreadId>,
}

impl Thread {
    /// The control block of the thread that initializes the library.
    pub(crate) fn new_main() -> Box<Self> {
        Box::new(Self {
            context: Context::new(),
            stack: None,
            tid: MAIN_THREAD,
            state: ThreadState::Running,
            quantums: 0,
            retval: None,
            joined_by: None,
        })
    }

    /// A ready thread that runs `thread_fn` on a fresh stack.
    pub(crate) fn new<F>(tid: ThreadId, stack_size: usize, thread_fn: F) -> Box<Self>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        /// The very beginning of the thread.
        unsafe extern "C" fn thread_start<F: FnOnce() -> usize + Send>(thread_fn: usize) -> ! {
            unsafe { InterruptGuard::release_inherited() };
            let thread_fn = unsafe { Box::from_raw(thread_fn as *mut F) };
            match panic::catch_unwind(AssertUnwindSafe(thread_fn)) {
                Ok(retval) => finish(Some(retval)),
                Err(payload) => {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("Box<dyn Any>");
                    error!(tid = self_id(), "thread panicked: {msg}");
                    drop(payload);
                    finish(None)
                }
            }
        }

        let mut stack = Stack::new(stack_size);
        let thread_fn = Box::into_raw(Box::new(thread_fn));
        let context = Context::fresh(&mut stack, thread_start::<F>, thread_fn as usize);
        Box::new(Self {
            context,
            stack: Some(stack),
            tid,
            state: ThreadState::Ready,
            quantums: 0,
            retval: None,
            joined_by: None,
        })
    }

    pub(crate) fn tid(&self) -> ThreadId {
        self.tid
    }

    pub(crate) fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub(crate) fn quantums(&self) -> u64 {
        self.quantums
    }

    pub(crate) fn add_quantum(&mut self) {
        self.quantums += 1;
    }

    pub(crate) fn remove_quantum(&mut self) {
        self.quantums -= 1;
    }

    pub(crate) fn retval(&self) -> Option<usize> {
        self.retval
    }

    pub(crate) fn set_retval(&mut self, retval: Option<usize>) {
        self.retval = retval;
    }

    pub(crate) fn joined_by(&self) -> Option<ThreadId> {
        self.joined_by
    }

    pub(crate) fn set_joined_by(&mut self, joiner: Option<ThreadId>) {
        self.joined_by = joiner;
    }

    pub(crate) fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Returns `false` once the thread overflowed its stack.
    pub(crate) fn stack_intact(&self) -> bool {
        self.stack.as_ref().is_none_or(Stack::is_intact)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("state", &self.state)
            .field("quantums", &self.quantums)
            .field("joined_by", &self.joined_by)
            .finish_non_exhaustive()
    }
}

/// Create a new thread running `thread_fn`.
///
/// The thread starts in the [`Ready`](ThreadState::Ready) state at the back
/// of the ready queue. The caller keeps running. The value returned by
/// `thread_fn` becomes the thread's return value.
///
/// # Errors
/// [`ThreadError::TooManyThreads`] if [`MAX_THREADS`] threads already exist.
pub fn create<F>(thread_fn: F) -> Result<ThreadId, ThreadError>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let guard = InterruptGuard::new();
    let tid = with_scheduler(&guard, |s| s.spawn(thread_fn))??;
    drop(guard);
    debug!(tid, "thread created");
    Ok(tid)
}

/// Give up the rest of the current quantum.
///
/// The caller goes to the back of the ready queue and the thread at the front
/// runs. If no other thread is ready, the caller continues with a fresh
/// quantum. Either way the finished quantum is counted.
///
/// # Errors
/// [`ThreadError::Os`] if the timer cannot be re-armed. The caller then keeps
/// running and the quantum is not counted.
pub fn yield_now() -> Result<(), ThreadError> {
    let guard = InterruptGuard::new();
    with_scheduler(&guard, Scheduler::charge_quantum)?;
    if let Err(e) = scheduler::park_current(&guard, ThreadState::Ready) {
        with_scheduler(&guard, Scheduler::refund_quantum)?;
        return Err(e);
    }
    Ok(())
}

/// Terminate the current thread with `retval`.
///
/// Called from the main thread, this terminates the process with status `0`.
/// Otherwise the thread becomes [`Finished`](ThreadState::Finished), its
/// joiner (if any) becomes ready, and the next ready thread runs.
pub fn exit(retval: usize) -> ! {
    finish(Some(retval))
}

fn finish(retval: Option<usize>) -> ! {
    let guard = InterruptGuard::new();
    let tid = self_id();
    match with_scheduler(&guard, |s| s.finish_current(retval)) {
        Ok(Some(prev)) => {
            if let Err(e) = scheduler::switch_to_next(&guard, prev) {
                crate::fatal!("thread {tid} cannot switch away after exit: {e}");
            }
            crate::fatal!("finished thread {tid} was resumed")
        }
        Ok(None) | Err(_) => {
            drop(guard);
            debug!("main thread exited");
            std::process::exit(0)
        }
    }
}

/// Wait for thread `tid` to finish and collect its return value.
///
/// If the thread has not finished yet, the caller blocks until it does. The
/// finished thread is destroyed and its id becomes invalid.
///
/// # Errors
/// - [`ThreadError::SelfJoin`] if `tid` is the caller.
/// - [`ThreadError::NoSuchThread`] if no thread `tid` exists.
/// - [`ThreadError::AlreadyJoined`] if another thread already joins `tid`,
///   even if `tid` has finished and that thread has not run since.
/// - [`ThreadError::Deadlock`] if the caller would block while no other
///   thread is ready.
/// - [`ThreadError::Panicked`] if the thread's entry function panicked. The
///   thread is destroyed in this case too.
pub fn join(tid: ThreadId) -> Result<usize, ThreadError> {
    let me = self_id();
    if tid == me {
        warn!(tid, "thread tried to join itself");
        return Err(ThreadError::SelfJoin);
    }
    let guard = InterruptGuard::new();
    let should_wait = match with_scheduler(&guard, |s| s.claim_join(tid, me))? {
        Ok(should_wait) => should_wait,
        Err(e) => {
            drop(guard);
            warn!(tid, joiner = me, "join rejected: {e}");
            return Err(e);
        }
    };
    if should_wait {
        let parked = scheduler::park_current(&guard, ThreadState::Blocked(BlockReason::Join(tid)));
        if let Err(e) = parked {
            with_scheduler(&guard, |s| s.release_join(tid))?;
            return Err(e);
        }
    }
    let Some(th) = with_scheduler(&guard, |s| s.reap(tid))? else {
        crate::fatal!("thread {me} woke up from join but thread {tid} is not finished")
    };
    let retval = th.retval();
    drop(th);
    drop(guard);
    debug!(tid, joiner = me, "thread joined");
    retval.ok_or(ThreadError::Panicked(tid))
}

/// Block thread `tid` until [`resume`] is called for it.
///
/// A thread may suspend itself, in which case the next ready thread runs.
/// Suspending a thread that is already blocked only leaves it blocked.
///
/// # Errors
/// - [`ThreadError::NoSuchThread`] if no live thread `tid` exists.
/// - [`ThreadError::Deadlock`] if the caller suspends itself while no other
///   thread is ready.
pub fn suspend(tid: ThreadId) -> Result<(), ThreadError> {
    let guard = InterruptGuard::new();
    if tid == self_id() {
        if with_scheduler(&guard, |s| s.ready_is_empty())? {
            drop(guard);
            warn!(tid, "self-suspend would leave no runnable thread");
            return Err(ThreadError::Deadlock);
        }
        return scheduler::park_current(&guard, ThreadState::Blocked(BlockReason::Suspended));
    }
    with_scheduler(&guard, |s| s.suspend(tid))??;
    drop(guard);
    debug!(tid, "thread suspended");
    Ok(())
}

/// Make thread `tid`, blocked by [`suspend`], ready again.
///
/// The caller keeps running.
///
/// # Errors
/// - [`ThreadError::NoSuchThread`] if no blocked thread `tid` exists.
/// - [`ThreadError::NotSuspended`] if the thread is blocked for another
///   reason, e.g. in [`join`] or on a lock.
pub fn resume(tid: ThreadId) -> Result<(), ThreadError> {
    let guard = InterruptGuard::new();
    let resumed = with_scheduler(&guard, |s| match s.state_of(tid) {
        Some(ThreadState::Blocked(BlockReason::Suspended)) => {
            s.wake(tid);
            Ok(())
        }
        Some(ThreadState::Blocked(_)) => Err(ThreadError::NotSuspended(tid)),
        _ => Err(ThreadError::NoSuchThread(tid)),
    })?;
    drop(guard);
    match resumed {
        Ok(()) => debug!(tid, "thread resumed"),
        Err(ref e) => warn!(tid, "resume rejected: {e}"),
    }
    resumed
}

/// The id of the calling thread.
///
/// Before [`init`](crate::init) this is [`MAIN_THREAD`].
pub fn self_id() -> ThreadId {
    scheduler::current_tid()
}

/// Total number of quantums completed since [`init`](crate::init).
///
/// A quantum completes when its thread yields, is preempted or exits. This is
/// the sum of [`quantums_of`] over every thread that ever existed.
pub fn total_quantums() -> u64 {
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.total_quantums()).unwrap_or(0)
}

/// Number of quantums thread `tid` has completed.
///
/// # Errors
/// [`ThreadError::NoSuchThread`] if no thread `tid` exists.
pub fn quantums_of(tid: ThreadId) -> Result<u64, ThreadError> {
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.thread(tid).map(Thread::quantums))?
        .ok_or(ThreadError::NoSuchThread(tid))
}

/// Get the [`ThreadState`] of thread `tid`.
///
/// # Errors
/// [`ThreadError::NoSuchThread`] if no thread `tid` exists.
pub fn state_of(tid: ThreadId) -> Result<ThreadState, ThreadError> {
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.state_of(tid))?.ok_or(ThreadError::NoSuchThread(tid))
}

/// Number of threads that exist, including finished threads that are not
/// joined yet.
pub fn live_threads() -> usize {
    let guard = InterruptGuard::new();
    with_scheduler(&guard, |s| s.live_threads()).unwrap_or(0)
}

/// Pin the current thread.
///
/// While the returned guard is alive, the current thread is not preempted.
/// The guard must not be held while calling into this crate: opening a
/// critical section inside another one panics.
pub fn pin() -> InterruptGuard {
    InterruptGuard::new()
}
