//! Preemption driver.
//!
//! Every thread runs for at most one quantum of virtual time. When the
//! [`VirtualTimer`] armed at dispatch expires, the kernel delivers
//! [`PREEMPTION_SIGNAL`] and the handler installed here makes the running
//! thread yield, exactly as if it had called [`yield_now`] itself. The yield
//! counts the expired quantum and re-arms the timer for whichever thread runs
//! next.
//!
//! The signal is blocked while the library manipulates its own state, so a
//! preemption only ever lands in user code.
//!
//! [`VirtualTimer`]: uthread_machine::timer::VirtualTimer
//! [`yield_now`]: crate::thread::yield_now
use crate::{ThreadError, thread};
use uthread_machine::interrupt;

pub use uthread_machine::interrupt::{InterruptGuard, InterruptState, PREEMPTION_SIGNAL};

/// Install the preemption handler.
pub(crate) fn install() -> Result<(), ThreadError> {
    interrupt::register(on_quantum_expired).map_err(|source| ThreadError::Os {
        op: "sigaction",
        source,
    })
}

/// Runs inside the signal handler.
fn on_quantum_expired() {
    // A failed yield leaves the thread running; the next expiry retries.
    let _ = thread::yield_now();
}
