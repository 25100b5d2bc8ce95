//! Virtual-time countdown timer.
//!
//! The timer counts down only while the process executes in user mode
//! (`ITIMER_VIRTUAL`) and delivers [`PREEMPTION_SIGNAL`] when it expires. It
//! is periodic: after firing it reloads itself with the same quantum.
//!
//! [`PREEMPTION_SIGNAL`]: crate::interrupt::PREEMPTION_SIGNAL
use core::{ptr, time::Duration};
use std::io;

/// A periodic virtual-time timer configured with a fixed quantum.
#[derive(Clone, Copy)]
pub struct VirtualTimer {
    spec: libc::itimerval,
}

impl VirtualTimer {
    /// Create a timer that expires every `quantum`.
    pub fn new(quantum: Duration) -> Self {
        let tv = libc::timeval {
            tv_sec: quantum.as_secs() as libc::time_t,
            tv_usec: quantum.subsec_micros() as libc::suseconds_t,
        };
        Self {
            spec: libc::itimerval {
                it_interval: tv,
                it_value: tv,
            },
        }
    }

    /// The quantum of this timer.
    pub fn quantum(&self) -> Duration {
        let tv = self.spec.it_interval;
        Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
    }

    /// (Re)start the countdown with a full quantum.
    pub fn arm(&self) -> io::Result<()> {
        Self::set(&self.spec)
    }

    fn set(spec: &libc::itimerval) -> io::Result<()> {
        if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, spec, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl core::fmt::Debug for VirtualTimer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualTimer")
            .field("quantum", &self.quantum())
            .finish()
    }
}
