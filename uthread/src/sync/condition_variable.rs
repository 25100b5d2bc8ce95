//! # Condition Variable.
//!
//! A **Condition Variable** allows a thread to block until a certain
//! condition is met, without consuming CPU cycles. It is always used in
//! conjunction with a [`Lock`] that guards access to the shared state the
//! condition is about.
//!
//! Wake-ups follow Mesa semantics. A signaled thread does not run right away:
//! it is queued to re-acquire the lock, and by the time it owns the lock
//! again another thread may have changed the state. Waiters therefore
//! re-check their condition in a loop, which [`CondVar::wait_while`] does for
//! them:
//!
//! ```no_run
//! # use uthread::sync::{CondVar, Mutex};
//! # let (condvar, mutex) = (CondVar::new(), Mutex::new(Vec::<u8>::new()));
//! let guard = condvar.wait_while(&mutex, |queue| queue.is_empty());
//! ```
use super::{Lock, Mutex, MutexGuard};
use crate::thread::{self, BlockReason, ThreadId, scheduler};
use core::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use crossbeam_queue::SegQueue;
use uthread_machine::interrupt::InterruptGuard;

/// A Condition Variable
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. The predicate is
/// always verified while holding the lock before deciding that a thread must
/// block.
///
/// All waiters of a condition variable must use the same lock.
pub struct CondVar {
    waiters: SegQueue<ThreadId>,
    /// The lock the waiters released. Valid while `waiters` is not empty.
    lock: AtomicPtr<Lock>,
}

impl CondVar {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: SegQueue::new(),
            lock: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Blocks the current thread until it is signaled.
    ///
    /// `lock` is released while waiting. The call returns once the thread
    /// holds `lock` again.
    ///
    /// # Panics
    /// Panics if the current thread does not hold `lock`.
    #[track_caller]
    pub fn wait(&self, lock: &Lock) {
        let me = thread::self_id();
        if !lock.is_held_by_current() {
            panic!("Thread {me} waits on a condition variable without holding the lock.");
        }
        let guard = InterruptGuard::new();
        self.lock.store(ptr::from_ref(lock).cast_mut(), Ordering::Relaxed);
        self.waiters.push(me);
        lock.release(&guard);
        scheduler::block_current(&guard, BlockReason::CondVar);
    }

    /// Blocks the current thread until it is signaled, with the mutex of
    /// `guard` released meanwhile.
    #[track_caller]
    pub fn wait_guard<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        core::mem::forget(guard);
        self.wait(mutex.raw());
        MutexGuard::new_unchecked(mutex)
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function locks `mutex` and checks the predicate. If it returns
    /// `true`, the thread is blocked and the mutex is temporarily released.
    /// When the thread is signaled and holds the mutex again, it re-evaluates
    /// the predicate. This loop continues until the predicate returns
    /// `false`.
    ///
    /// There is **no need to check the predicate before calling**
    /// `wait_while`.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            guard = self.wait_guard(guard);
        }
        guard
    }

    /// Wakes up one blocked thread on this condvar.
    ///
    /// The woken thread returns from its wait once it acquires the lock.
    /// Calls to `signal` are not buffered in any way.
    ///
    /// To wake up all threads, see [`broadcast`].
    ///
    /// [`broadcast`]: CondVar::broadcast
    pub fn signal(&self) {
        let guard = InterruptGuard::new();
        self.signal_one(&guard);
    }

    /// Wakes up all blocked threads on this condvar.
    ///
    /// Calls to `broadcast()` are not buffered in any way.
    ///
    /// To wake up only one thread, see [`signal`].
    ///
    /// [`signal`]: CondVar::signal
    pub fn broadcast(&self) {
        let guard = InterruptGuard::new();
        while self.signal_one(&guard) {}
    }

    fn signal_one(&self, guard: &InterruptGuard) -> bool {
        let Some(tid) = self.waiters.pop() else {
            return false;
        };
        // The waiter is still blocked inside `wait`, which borrows the lock.
        let lock = unsafe { &*self.lock.load(Ordering::Relaxed) };
        lock.hand_over(guard, tid);
        true
    }

    /// Returns `true` if no thread waits on this condvar.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CondVar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CondVar")
            .field("waiters", &self.waiters.len())
            .finish_non_exhaustive()
    }
}
