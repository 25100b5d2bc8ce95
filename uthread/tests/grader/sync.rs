use crate::thread::wait_for_state;
use uthread::thread::{self, BlockReason, ThreadState};

/// A counter that is only safe to touch under a lock.
#[derive(Default)]
pub struct RacyCounter(core::cell::UnsafeCell<usize>);

unsafe impl Sync for RacyCounter {}

impl RacyCounter {
    /// Increment with a yield between the read and the write.
    ///
    /// # Safety
    /// The caller must have exclusive access.
    pub unsafe fn increment_slowly(&self) {
        let v = unsafe { *self.0.get() };
        thread::yield_now().unwrap();
        unsafe { *self.0.get() = v + 1 };
    }

    pub fn get(&self) -> usize {
        unsafe { *self.0.get() }
    }
}

pub mod lock {
    use super::*;
    use std::sync::Arc;
    use uthread::{
        ThreadError,
        sync::{Lock, Mutex, WouldBlock},
    };

    pub fn counter() {
        const N: usize = 8;
        const K: usize = 50;
        let shared = Arc::new((Lock::new(), RacyCounter::default()));
        let tids: Vec<_> = (0..N)
            .map(|_| {
                let shared = shared.clone();
                thread::create(move || {
                    let (lock, counter) = &*shared;
                    for _ in 0..K {
                        lock.lock();
                        unsafe { counter.increment_slowly() };
                        lock.unlock();
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for tid in tids {
            thread::join(tid).unwrap();
        }
        assert_eq!(shared.1.get(), N * K);
        assert!(!shared.0.is_locked());
    }

    pub fn parking() {
        let lock = Arc::new(Lock::new());
        lock.lock();
        let blockee = {
            let lock = lock.clone();
            thread::create(move || {
                lock.lock();
                assert!(lock.is_held_by_current());
                lock.unlock();
                0
            })
            .unwrap()
        };
        wait_for_state(blockee, ThreadState::Blocked(BlockReason::Lock));
        assert!(lock.is_held_by_current());
        lock.unlock();
        thread::join(blockee).unwrap();
    }

    pub fn fifo_handoff() {
        let lock = Arc::new(Lock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.lock();
        let tids: Vec<_> = (0..3)
            .map(|i| {
                let (lock, order) = (lock.clone(), order.clone());
                let tid = thread::create(move || {
                    lock.lock();
                    order.lock().push(i);
                    lock.unlock();
                    0
                })
                .unwrap();
                wait_for_state(tid, ThreadState::Blocked(BlockReason::Lock));
                tid
            })
            .collect();

        lock.unlock();
        // The lock went straight to the first waiter.
        assert!(lock.is_locked());
        assert_eq!(lock.try_lock(), Err(WouldBlock));
        assert_eq!(thread::state_of(tids[0]).ok(), Some(ThreadState::Ready));

        for tid in tids {
            thread::join(tid).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(lock.try_lock(), Ok(()));
        lock.unlock();
    }

    pub fn unlock_by_non_owner() {
        let lock = Arc::new(Lock::new());
        lock.lock();
        let intruder = {
            let lock = lock.clone();
            thread::create(move || {
                lock.unlock();
                0
            })
            .unwrap()
        };
        assert!(matches!(
            thread::join(intruder),
            Err(ThreadError::Panicked(_))
        ));
        assert!(lock.is_held_by_current());
        lock.unlock();
    }
}

pub mod mutex {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use uthread::sync::Mutex;

    pub fn smoke() {
        const LENGTH: usize = 64;
        let output = Arc::new(Mutex::new(Vec::new()));
        let arrived = Arc::new(AtomicUsize::new(0));

        let tids: Vec<_> = (0..LENGTH)
            .map(|i| {
                let (output, arrived) = (output.clone(), arrived.clone());
                thread::create(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let mut d = output.lock();
                    // Wait in the critical section for everybody to queue up.
                    while arrived.load(Ordering::SeqCst) != LENGTH {
                        thread::yield_now().unwrap();
                    }
                    d.push(i);
                    d.unlock();
                    0
                })
                .unwrap()
            })
            .collect();
        for tid in tids {
            thread::join(tid).unwrap();
        }

        let output = Arc::into_inner(output).expect("all workers joined");
        assert_eq!(output.into_inner(), (0..LENGTH).collect::<Vec<_>>());
    }
}

pub mod condition_variable {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use uthread::sync::{CondVar, Lock, Mutex};

    pub fn wait_returns_with_lock() {
        let shared = Arc::new((Lock::new(), CondVar::new(), AtomicBool::new(false)));
        let waiter = {
            let shared = shared.clone();
            thread::create(move || {
                let (lock, cv, ready) = &*shared;
                lock.lock();
                while !ready.load(Ordering::SeqCst) {
                    cv.wait(lock);
                    assert!(lock.is_held_by_current());
                }
                lock.unlock();
                0
            })
            .unwrap()
        };
        let (lock, cv, ready) = &*shared;
        wait_for_state(waiter, ThreadState::Blocked(BlockReason::CondVar));
        assert!(!lock.is_locked());

        // A signal without a state change: the waiter checks and waits again.
        lock.lock();
        cv.signal();
        assert_eq!(
            thread::state_of(waiter).ok(),
            Some(ThreadState::Blocked(BlockReason::Lock))
        );
        lock.unlock();
        wait_for_state(waiter, ThreadState::Blocked(BlockReason::CondVar));

        // Signaling with the lock free grants it to the waiter at once.
        ready.store(true, Ordering::SeqCst);
        cv.signal();
        assert!(lock.is_locked() && !lock.is_held_by_current());
        assert!(cv.is_empty());
        thread::join(waiter).unwrap();
        assert!(!lock.is_locked());
    }

    pub fn broadcast() {
        const WAITERS: usize = 5;
        let shared = Arc::new((Mutex::new(false), CondVar::new()));
        let tids: Vec<_> = (0..WAITERS)
            .map(|_| {
                let shared = shared.clone();
                thread::create(move || {
                    let (go, cv) = &*shared;
                    let guard = cv.wait_while(go, |go| !*go);
                    assert!(*guard);
                    0
                })
                .unwrap()
            })
            .collect();
        for tid in &tids {
            wait_for_state(*tid, ThreadState::Blocked(BlockReason::CondVar));
        }
        let (go, cv) = &*shared;
        *go.lock() = true;
        cv.broadcast();
        assert!(cv.is_empty());
        for tid in tids {
            thread::join(tid).unwrap();
        }
    }

    const CAPACITY: usize = 2;

    struct Buffer {
        inner: Mutex<Vec<usize>>,
        not_full: CondVar,
        not_empty: CondVar,
    }

    impl Buffer {
        fn put(&self, val: usize) {
            let mut guard = self.not_full.wait_while(&self.inner, |b| b.len() == CAPACITY);
            // Mesa semantics: the predicate was re-checked with the lock held.
            assert!(guard.len() < CAPACITY);
            guard.push(val);
            self.not_empty.signal();
        }

        fn get(&self) -> usize {
            let mut guard = self.not_empty.wait_while(&self.inner, |b| b.is_empty());
            assert!(!guard.is_empty());
            let val = guard.remove(0);
            self.not_full.signal();
            val
        }
    }

    pub fn bounded_buffer() {
        const PRODUCERS: usize = 3;
        const ITEMS: usize = 20;
        let buffer = Arc::new(Buffer {
            inner: Mutex::new(Vec::new()),
            not_full: CondVar::new(),
            not_empty: CondVar::new(),
        });
        let consumers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let buffer = buffer.clone();
                thread::create(move || (0..ITEMS).map(|_| buffer.get()).sum())
                    .unwrap()
            })
            .collect();
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = buffer.clone();
                thread::create(move || {
                    for i in 0..ITEMS {
                        buffer.put(p * ITEMS + i);
                        if i % 3 == 0 {
                            thread::yield_now().unwrap();
                        }
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for tid in producers {
            thread::join(tid).unwrap();
        }
        let sum: usize = consumers
            .into_iter()
            .map(|tid| thread::join(tid).unwrap())
            .sum();
        let n = PRODUCERS * ITEMS;
        assert_eq!(sum, n * (n - 1) / 2);
        assert!(buffer.inner.lock().is_empty());
    }
}

pub mod spinlock {
    use super::*;
    use std::sync::Arc;
    use uthread::sync::SpinLock;

    pub fn counter() {
        const N: usize = 4;
        const K: usize = 1000;
        let counter = Arc::new(SpinLock::new(0usize));
        let tids: Vec<_> = (0..N)
            .map(|_| {
                let counter = counter.clone();
                thread::create(move || {
                    for i in 0..K {
                        let mut guard = counter.lock();
                        *guard += 1;
                        guard.unlock();
                        if i % 100 == 0 {
                            thread::yield_now().unwrap();
                        }
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for tid in tids {
            thread::join(tid).unwrap();
        }
        let total = counter.lock();
        assert_eq!(*total, N * K);
        total.unlock();
    }
}
