//! # Synchronization Primitives.
//!
//! Threads of one program coordinate access to shared data through the
//! primitives of this module. All of them except [`SpinLock`] are integrated
//! with the scheduler: a thread that has to wait is blocked and consumes no
//! CPU time until another thread hands it what it waits for.
//!
//! | Primitive    | Blocks Thread? | Fair? | Typical Use Case                              |
//! |--------------|----------------|-------|-----------------------------------------------|
//! | [`SpinLock`] | No (busy wait) | No    | Very short critical sections                  |
//! | [`Lock`]     | Yes            | Yes   | Mutual exclusion without attached data        |
//! | [`Mutex`]    | Yes            | Yes   | Exclusive access to shared data               |
//! | [`CondVar`]  | Yes            | Yes   | Waiting for a condition to become true        |
//! | [`OnceFlag`] | No (yields)    | No    | Running an initializer exactly once           |
//!
//! - **SpinLock** spins until the lock becomes available. A waiting thread
//!   spins until it is preempted, so the holder needs a quantum to make
//!   progress.
//! - **Lock** queues waiters in FIFO order and hands the lock directly to the
//!   next waiter on unlock, so a woken thread never competes for it again.
//! - **CondVar** works with a [`Lock`] (or the lock inside a [`Mutex`]).
//!   Wake-ups are Mesa style: a woken thread re-acquires the lock before it
//!   returns, and must re-check its condition.
mod condition_variable;
mod lock;
pub mod once;

pub use condition_variable::CondVar;
pub use lock::{Lock, Mutex, MutexGuard};
pub use once::{OnceFlag, OnceState, once};
pub use uthread_machine::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
