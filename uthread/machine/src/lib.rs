//! Machine layer of the uthread library.
//!
//! Everything in this crate touches the host directly: the hand-written
//! context switch, the process signal mask, the virtual-time timer and the
//! atomic test-and-set flag. The scheduler and the public thread API live in
//! the `uthread` crate and reach the host only through this crate.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("uthread-machine supports x86_64 Linux only.");

pub mod context;
pub mod interrupt;
pub mod spinlock;
pub mod timer;
