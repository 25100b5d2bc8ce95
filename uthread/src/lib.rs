//! # uthread: user-level threads
//!
//! **uthread** multiplexes many logical threads onto the single OS thread that
//! calls [`init`]. Threads are switched cooperatively, when a thread yields,
//! blocks or exits, and preemptively, when its quantum of virtual (user CPU)
//! time runs out.
//!
//! ## The threading model
//!
//! The thread that calls [`init`] becomes thread `0`, the main thread. Every
//! other thread is created with [`thread::create`] and owns a fixed stack of
//! [`thread::STACK_SIZE`] bytes (configurable through [`RuntimeConfig`]).
//! Threads are scheduled in FIFO order from a single ready queue. A thread
//! that is preempted or yields goes to the back of that queue.
//!
//! ```no_run
//! use uthread::thread;
//!
//! uthread::init(10_000).unwrap();
//! let worker = thread::create(|| {
//!     thread::yield_now().unwrap();
//!     thread::self_id()
//! })
//! .unwrap();
//! assert_eq!(thread::join(worker).unwrap(), worker);
//! ```
//!
//! ## Implementation Notes
//!
//! Each thread runs on its own `STACK_SIZE` stack. The lowest word of every
//! stack holds a magic value that is checked whenever the thread is switched
//! away from. The check is not perfect: **a stack overflow may corrupt memory
//! before it is detected.** To avoid this:
//! - **Avoid declaring large data structures on the stack.**
//! - **Instead, allocate large data structures on the heap using `Box`.**
//!
//! The preemption signal arrives at arbitrary points of user code, including
//! inside the allocator. uthread blocks the signal around all of its own
//! bookkeeping, but it has no way to know that user code is in the middle of
//! a non-reentrant library call. Code that must not be interrupted can pin
//! the current thread with [`thread::pin`].
//!
//! ## Logging
//!
//! The library reports through [`tracing`] but never installs a subscriber.
//! Nothing is logged on the path the preemption signal reaches.
//!
//! ## Synchronization
//!
//! See [`sync`] for the lock, condition variable, spinlock and one-time
//! initialization primitives.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub use thread::{MAX_THREADS, ThreadId};

use thread::scheduler::{self, Scheduler};
use tracing::info;
use uthread_machine::{interrupt::InterruptGuard, timer::VirtualTimer};

/// Print a fatal diagnostic and abort the process.
///
/// Used for violations of the scheduler's own invariants, from which no
/// thread can be resumed safely.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        eprintln!("uthread: fatal: {}", format_args!($($arg)+));
        std::process::abort()
    }};
}
pub(crate) use fatal;

pub mod preemption;
pub mod sync;
pub mod thread;

/// Errors of the thread library.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// [`init`] was already called.
    #[error("the thread library is already initialized")]
    AlreadyInitialized,
    /// The operation needs [`init`] to be called first.
    #[error("the thread library is not initialized")]
    NotInitialized,
    /// The quantum must be a positive number of microseconds.
    #[error("quantum must be positive")]
    InvalidQuantum,
    /// Creating the thread would exceed the thread limit.
    #[error("too many threads (at most {max})")]
    TooManyThreads {
        /// The limit.
        max: usize,
    },
    /// No thread with this id exists.
    #[error("no thread with id {0}")]
    NoSuchThread(ThreadId),
    /// A thread tried to join itself.
    #[error("a thread cannot join itself")]
    SelfJoin,
    /// Another thread is already joining this thread.
    #[error("thread {0} is already being joined")]
    AlreadyJoined(ThreadId),
    /// The thread is not blocked by `suspend`.
    #[error("thread {0} is not suspended")]
    NotSuspended(ThreadId),
    /// Blocking the caller would leave no runnable thread.
    #[error("blocking would leave no runnable thread")]
    Deadlock,
    /// The thread's entry function panicked.
    #[error("thread {0} panicked")]
    Panicked(ThreadId),
    /// A host call failed.
    #[error("{op} failed: {source}")]
    Os {
        /// The failed operation.
        op: &'static str,
        /// The host error.
        #[source]
        source: std::io::Error,
    },
}

/// Runtime configuration.
///
/// ```no_run
/// uthread::RuntimeConfig::new(5_000)
///     .stack_size(0x10_0000)
///     .init()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    quantum_usecs: u64,
    stack_size: usize,
}

impl RuntimeConfig {
    /// Configure a runtime that preempts threads every `quantum_usecs`
    /// microseconds of virtual time.
    pub fn new(quantum_usecs: u64) -> Self {
        Self {
            quantum_usecs,
            stack_size: thread::STACK_SIZE,
        }
    }

    /// Set the stack size of every thread created afterwards.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Initialize the library with this configuration.
    ///
    /// The caller becomes thread `0`, in the `Running` state, and its first
    /// quantum starts.
    ///
    /// # Errors
    /// - [`ThreadError::InvalidQuantum`] if the quantum is zero.
    /// - [`ThreadError::AlreadyInitialized`] on a second call.
    /// - [`ThreadError::Os`] if the signal handler or the timer cannot be
    ///   installed.
    pub fn init(self) -> Result<(), ThreadError> {
        if self.quantum_usecs == 0 {
            return Err(ThreadError::InvalidQuantum);
        }
        let timer = VirtualTimer::new(core::time::Duration::from_micros(self.quantum_usecs));
        let guard = InterruptGuard::new();
        if scheduler::is_installed(&guard) {
            return Err(ThreadError::AlreadyInitialized);
        }
        preemption::install()?;
        scheduler::install(&guard, Scheduler::new(timer, self.stack_size));
        if let Err(source) = timer.arm() {
            scheduler::uninstall(&guard);
            return Err(ThreadError::Os {
                op: "setitimer",
                source,
            });
        }
        drop(guard);
        info!(
            quantum_usecs = self.quantum_usecs,
            stack_size = self.stack_size,
            "uthread initialized"
        );
        Ok(())
    }
}

/// Initialize the library with a quantum of `quantum_usecs` microseconds and
/// the default stack size.
///
/// Equivalent to `RuntimeConfig::new(quantum_usecs).init()`.
pub fn init(quantum_usecs: u64) -> Result<(), ThreadError> {
    RuntimeConfig::new(quantum_usecs).init()
}
