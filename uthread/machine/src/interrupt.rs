//! Interrupt masking and the preemption signal.
//!
//! A green thread is interrupted by exactly one signal, [`PREEMPTION_SIGNAL`].
//! "Disabling interrupts" blocks that signal in the process's signal mask, so
//! the handler cannot run and no preemption-driven switch can happen until the
//! signal is unblocked again.
use core::{
    marker::PhantomData,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};
use std::io;

/// The signal delivered when a quantum of virtual time runs out.
pub const PREEMPTION_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// `true` while an [`InterruptGuard`] is alive.
static GUARDED: AtomicBool = AtomicBool::new(false);

/// The function called by the signal handler.
static HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

fn preemption_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), PREEMPTION_SIGNAL);
        set.assume_init()
    }
}

fn change_mask(how: libc::c_int) -> io::Result<()> {
    let set = preemption_set();
    match unsafe { libc::pthread_sigmask(how, &set, ptr::null_mut()) } {
        0 => Ok(()),
        e => Err(io::Error::from_raw_os_error(e)),
    }
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// The preemption signal can be delivered.
    On,
    /// The preemption signal is blocked.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state from the signal mask.
    pub fn current() -> Self {
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), old.as_mut_ptr());
            if libc::sigismember(old.as_ptr(), PREEMPTION_SIGNAL) == 1 {
                Self::Off
            } else {
                Self::On
            }
        }
    }

    /// Unblocks the preemption signal.
    ///
    /// # Safety
    /// The caller must not be inside a region that relies on being
    /// uninterrupted.
    pub unsafe fn enable() -> io::Result<()> {
        change_mask(libc::SIG_UNBLOCK)
    }

    /// Blocks the preemption signal.
    ///
    /// # Safety
    /// The caller is responsible for enabling interrupts again.
    pub unsafe fn disable() -> io::Result<()> {
        change_mask(libc::SIG_BLOCK)
    }
}

/// An RAII-based guard for a critical section.
///
/// When an `InterruptGuard` is created, the preemption signal is blocked.
/// When it is dropped, the signal is unblocked again.
///
/// Critical sections do **not** nest: creating a guard while another one is
/// alive panics. Code that already holds a guard passes `&InterruptGuard` to
/// the helpers it calls instead of opening a second section.
///
/// A guard may stay alive across a context switch. The thread that is
/// switched to is then inside the same critical section and closes it, either
/// by dropping its own guard or, for a thread that starts running for the
/// first time, with [`InterruptGuard::release_inherited`].
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Create a new guard, blocking the preemption signal.
    ///
    /// # Panics
    /// Panics if another guard is alive.
    #[track_caller]
    pub fn new() -> Self {
        if let Err(e) = unsafe { InterruptState::disable() } {
            panic!("Failed to block the preemption signal: {e}");
        }
        if GUARDED.swap(true, Ordering::SeqCst) {
            panic!(
                "Nested critical section at {}.",
                core::panic::Location::caller()
            );
        }
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns `true` while a guard is alive.
    pub fn is_guarded() -> bool {
        GUARDED.load(Ordering::SeqCst)
    }

    /// Close the critical section that was open when the calling computation
    /// was switched to for the first time.
    ///
    /// # Safety
    /// Must be called exactly once, at the very beginning of a fresh context,
    /// in place of dropping the guard held by the dispatching thread.
    pub unsafe fn release_inherited() {
        GUARDED.store(false, Ordering::SeqCst);
        if let Err(e) = unsafe { InterruptState::enable() } {
            panic!("Failed to unblock the preemption signal: {e}");
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        GUARDED.store(false, Ordering::SeqCst);
        if let Err(e) = unsafe { InterruptState::enable() } {
            panic!("Failed to unblock the preemption signal: {e}");
        }
    }
}

/// Register `handler` to run whenever [`PREEMPTION_SIGNAL`] is delivered.
///
/// The handler runs with the preemption signal blocked and with `errno`
/// preserved for the interrupted code.
pub fn register(handler: fn()) -> io::Result<()> {
    HANDLER.store(handler as *mut (), Ordering::SeqCst);
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = do_handle_interrupt as *const () as libc::sighandler_t;
        action.sa_mask = preemption_set();
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(PREEMPTION_SIGNAL, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

extern "C" fn do_handle_interrupt(_signum: libc::c_int) {
    // The signal is blocked while a guard is alive, so this only trips on a
    // spurious `raise` from inside a critical section.
    if GUARDED.load(Ordering::SeqCst) {
        return;
    }
    let handler = HANDLER.load(Ordering::SeqCst);
    if handler.is_null() {
        return;
    }
    unsafe {
        let errno = *libc::__errno_location();
        let handler: fn() = core::mem::transmute(handler);
        handler();
        *libc::__errno_location() = errno;
    }
}
