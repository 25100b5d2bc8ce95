//! One-time initialization.
use crate::thread::{self, ThreadId};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::panic::{self, AssertUnwindSafe};
use uthread_machine::interrupt::InterruptGuard;

/// Progress of a [`OnceFlag`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OnceState {
    /// No thread has started the initializer.
    NotExecuted = 0,
    /// A thread is running the initializer.
    Executing = 1,
    /// The initializer has completed.
    Executed = 2,
}

/// A flag that runs an initializer exactly once.
///
/// # Examples
///
/// ```no_run
/// use uthread::sync::{OnceFlag, once};
///
/// static INIT: OnceFlag = OnceFlag::new();
///
/// uthread::init(10_000).unwrap();
/// once(&INIT, || println!("runs once"));
/// once(&INIT, || unreachable!());
/// ```
pub struct OnceFlag {
    state: AtomicU8,
    executor: AtomicUsize,
}

impl OnceFlag {
    /// Creates a flag whose initializer has not run.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(OnceState::NotExecuted as u8),
            executor: AtomicUsize::new(usize::MAX),
        }
    }

    /// The current progress.
    pub fn state(&self) -> OnceState {
        let raw = self.state.load(Ordering::Acquire);
        match OnceState::try_from(raw) {
            Ok(state) => state,
            Err(_) => fatal!("corrupted once flag: {raw}"),
        }
    }

    /// Returns `true` once the initializer has completed.
    pub fn is_completed(&self) -> bool {
        self.state() == OnceState::Executed
    }

    fn set(&self, state: OnceState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Run `f` if no thread has run an initializer with this flag yet.
    ///
    /// When the call returns, the initializer has completed, whichever thread
    /// ran it. Threads that arrive while another thread is running the
    /// initializer yield until it completes. The initializer itself runs
    /// preemptibly.
    ///
    /// If `f` panics, the flag is reset so that a later call runs an
    /// initializer again, and the panic continues.
    ///
    /// # Panics
    /// Panics if `f` calls back into `call_once` on the same flag.
    #[track_caller]
    pub fn call_once(&self, f: impl FnOnce()) {
        let me = thread::self_id();
        loop {
            let guard = InterruptGuard::new();
            match self.state() {
                OnceState::Executed => return,
                OnceState::NotExecuted => {
                    self.set(OnceState::Executing);
                    self.executor.store(me, Ordering::Relaxed);
                    drop(guard);
                    break;
                }
                OnceState::Executing => {
                    let executor: ThreadId = self.executor.load(Ordering::Relaxed);
                    drop(guard);
                    if executor == me {
                        panic!("Thread {me} re-enters the initializer it is running.");
                    }
                    // Fails only if the timer cannot be armed; keep polling.
                    let _ = thread::yield_now();
                }
            }
        }
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        let guard = InterruptGuard::new();
        self.executor.store(usize::MAX, Ordering::Relaxed);
        match result {
            Ok(()) => self.set(OnceState::Executed),
            Err(payload) => {
                self.set(OnceState::NotExecuted);
                drop(guard);
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Default for OnceFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OnceFlag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OnceFlag")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Run `f` exactly once for `flag`.
///
/// Equivalent to [`OnceFlag::call_once`].
#[track_caller]
pub fn once(flag: &OnceFlag, f: impl FnOnce()) {
    flag.call_once(f)
}
