//! # Lock.
//!
//! [`Lock`] is a blocking mutual exclusion primitive. A thread that finds the
//! lock held is blocked and queued at the lock's **entrance**. On unlock, the
//! lock is not released but **handed over** to the next waiter, which becomes
//! ready already owning it. Threads woken from a [`CondVar`] wait in a second,
//! **signaled** queue that is served before the entrance.
//!
//! [`Mutex`] combines a [`Lock`] with the data it protects.
//!
//! [`CondVar`]: super::CondVar
use crate::thread::{self, BlockReason, ThreadId, scheduler};
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use crossbeam_queue::SegQueue;
use uthread_machine::{interrupt::InterruptGuard, spinlock::WouldBlock};

const NO_OWNER: ThreadId = usize::MAX;

/// A blocking lock with FIFO handoff.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use uthread::{sync::Lock, thread};
///
/// uthread::init(10_000).unwrap();
/// let lock = Arc::new(Lock::new());
/// let c_lock = Arc::clone(&lock);
/// let tid = thread::create(move || {
///     c_lock.lock();
///     // critical section
///     c_lock.unlock();
///     0
/// })
/// .unwrap();
/// thread::join(tid).unwrap();
/// ```
pub struct Lock {
    held: AtomicBool,
    owner: AtomicUsize,
    entrance: SegQueue<ThreadId>,
    signaled: SegQueue<ThreadId>,
}

impl Lock {
    /// Creates a new lock in an unlocked state ready for use.
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            entrance: SegQueue::new(),
            signaled: SegQueue::new(),
        }
    }

    /// Acquires the lock, blocking the current thread until it is able to do
    /// so.
    ///
    /// # Panics
    /// Panics if the current thread already holds the lock.
    #[track_caller]
    pub fn lock(&self) {
        let me = thread::self_id();
        if self.is_owned_by(me) {
            panic!("Thread {me} tries to acquire a lock it already holds.");
        }
        let guard = InterruptGuard::new();
        if !self.held.swap(true, Ordering::Acquire) {
            self.owner.store(me, Ordering::Relaxed);
            return;
        }
        self.entrance.push(me);
        scheduler::block_current(&guard, BlockReason::Lock);
        // Handed over by the previous owner.
        debug_assert!(self.is_owned_by(me));
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// # Errors
    /// [`WouldBlock`] if the lock is held.
    pub fn try_lock(&self) -> Result<(), WouldBlock> {
        let _guard = InterruptGuard::new();
        if self.held.swap(true, Ordering::Acquire) {
            return Err(WouldBlock);
        }
        self.owner.store(thread::self_id(), Ordering::Relaxed);
        Ok(())
    }

    /// Releases the lock, handing it to the next waiter if there is one.
    ///
    /// # Panics
    /// Panics if the current thread does not hold the lock.
    #[track_caller]
    pub fn unlock(&self) {
        let me = thread::self_id();
        if !self.is_owned_by(me) {
            panic!("Thread {me} releases a lock it does not hold.");
        }
        let guard = InterruptGuard::new();
        self.release(&guard);
    }

    /// Returns `true` if some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Returns `true` if the current thread holds the lock.
    pub fn is_held_by_current(&self) -> bool {
        self.is_owned_by(thread::self_id())
    }

    fn is_owned_by(&self, tid: ThreadId) -> bool {
        self.held.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == tid
    }

    /// Pass the lock to the next waiter, or release it.
    pub(super) fn release(&self, guard: &InterruptGuard) {
        match self.signaled.pop().or_else(|| self.entrance.pop()) {
            Some(next) => {
                self.owner.store(next, Ordering::Relaxed);
                scheduler::wake(guard, next);
            }
            None => {
                self.owner.store(NO_OWNER, Ordering::Relaxed);
                self.held.store(false, Ordering::Release);
            }
        }
    }

    /// Let blocked thread `tid`, woken from a condition variable, acquire the
    /// lock.
    ///
    /// `tid` gets the lock right away if it is free. Otherwise it waits in the
    /// signaled queue, ahead of the threads at the entrance.
    pub(super) fn hand_over(&self, guard: &InterruptGuard, tid: ThreadId) {
        if self.held.swap(true, Ordering::Acquire) {
            scheduler::reblock(guard, tid, BlockReason::Lock);
            self.signaled.push(tid);
        } else {
            self.owner.store(tid, Ordering::Relaxed);
            scheduler::wake(guard, tid);
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Lock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("Lock");
        d.field("held", &self.is_locked());
        if self.is_locked() {
            d.field("owner", &self.owner.load(Ordering::Relaxed));
        }
        d.finish_non_exhaustive()
    }
}

/// A mutual exclusion primitive useful for protecting shared data
///
/// This mutex will block threads waiting for the lock to become available.
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], which guarantees that the data is only ever accessed
/// when the mutex is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use uthread::{sync::Mutex, thread};
///
/// const N: usize = 10;
///
/// uthread::init(10_000).unwrap();
/// let data = Arc::new(Mutex::new(0));
/// let workers: Vec<_> = (0..N)
///     .map(|_| {
///         let data = Arc::clone(&data);
///         thread::create(move || {
///             *data.lock() += 1;
///             0
///         })
///         .unwrap()
///     })
///     .collect();
/// for tid in workers {
///     thread::join(tid).unwrap();
/// }
/// assert_eq!(*data.lock(), N);
/// ```
pub struct Mutex<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            lock: Lock::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// The mutex is unlocked when the returned guard goes out of scope.
    ///
    /// # Panics
    /// Panics if the current thread already holds the mutex.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// # Errors
    /// [`WouldBlock`] if the mutex is locked.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        self.lock.try_lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub(super) fn raw(&self) -> &Lock {
        &self.lock
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be unlocked.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Releases the underlying [`Mutex`].
    pub fn unlock(self) {}

    pub(super) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(super) fn new_unchecked(mutex: &'a Mutex<T>) -> Self {
        Self { mutex }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}
