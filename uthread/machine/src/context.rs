//! Execution contexts.
//!
//! A [`Context`] is the saved stack pointer of a paused computation. Every
//! callee-saved register of the paused computation lives on its own stack, so
//! the stack pointer alone is enough to resume it.
//!
//! [`switch`] stores the caller's state into one context and restores
//! another. The call returns only when some later [`switch`] restores the
//! context it saved, which is how the same call site serves both ends of a
//! context switch.
use core::{
    alloc::Layout,
    arch::naked_asm,
    ptr::NonNull,
};

/// Magic value written at the lowest word of every [`Stack`].
///
/// The stack grows downwards, so a thread that overflows its stack clobbers
/// this word first.
pub const STACK_MAGIC: usize = 0xdeadbeefcafebabe;

/// Alignment of a stack buffer, as required by the System V ABI.
const STACK_ALIGN: usize = 16;

/// An owned, 16-byte aligned stack buffer.
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
}

impl Stack {
    /// Allocate a stack of `size` bytes, rounded up to the stack alignment.
    ///
    /// The lowest word of the stack is initialized to [`STACK_MAGIC`].
    pub fn new(size: usize) -> Self {
        let size = size.max(0x1000).next_multiple_of(STACK_ALIGN);
        let layout = Self::layout(size);
        let base = unsafe { std::alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            std::alloc::handle_alloc_error(layout)
        };
        unsafe { base.cast::<usize>().write(STACK_MAGIC) };
        Self { base, size }
    }

    fn layout(size: usize) -> Layout {
        // `size` is already a non-zero multiple of a power-of-two alignment.
        unsafe { Layout::from_size_align_unchecked(size, STACK_ALIGN) }
    }

    /// Size of the stack in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` while the magic word at the bottom of the stack is
    /// intact.
    pub fn is_intact(&self) -> bool {
        unsafe { self.base.cast::<usize>().read() == STACK_MAGIC }
    }

    /// One-past-the-end address of the stack.
    fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), Self::layout(self.size)) }
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// A saved execution context.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// Stack pointer saved by the last switch away from this context.
    ///
    /// Must stay the first field: the switch routine writes it through the
    /// context's address.
    sp: usize,
}

/// A struct to mimic a stack state on context switch.
///
/// The first switch to a fresh context pops the six callee-saved registers
/// and returns into [`start`], which forwards `r13` as the argument of the
/// entry function stored in `r12`.
#[repr(C)]
struct ContextSwitchFrame {
    _r15: usize,
    _r14: usize,
    arg: usize,
    entry: usize,
    _bx: usize,
    _bp: usize,
    ret_addr: usize,
    end_of_stack: usize,
}

/// Entry point of a fresh context.
pub type Entry = unsafe extern "C" fn(usize) -> !;

impl Context {
    /// Create an empty context.
    ///
    /// An empty context is filled by the first [`switch`] away from the
    /// computation that owns it, i.e. the thread running on the process's
    /// original stack.
    pub const fn new() -> Self {
        Self { sp: 0 }
    }

    /// Build a context that calls `entry(arg)` on `stack` when it is switched
    /// to for the first time.
    ///
    /// `entry` must never return.
    pub fn fresh(stack: &mut Stack, entry: Entry, arg: usize) -> Self {
        let top = stack.top();
        let frame = (top - core::mem::size_of::<ContextSwitchFrame>()) as *mut ContextSwitchFrame;
        unsafe {
            frame.write(ContextSwitchFrame {
                _r15: 0,
                _r14: 0,
                arg,
                entry: entry as *const () as usize,
                _bx: 0,
                _bp: 0,
                ret_addr: start as *const () as usize,
                end_of_stack: 0,
            });
        }
        Self { sp: frame as usize }
    }
}

/// Switch from `current` to `next`.
///
/// Saves the running computation into `current` and resumes `next`. Returns
/// when another [`switch`] resumes `current`.
///
/// # Safety
/// `next` must hold a context produced by [`Context::fresh`] or by a previous
/// [`switch`], whose stack is still alive, and `current` must not be the same
/// context as `next`. Both pointers must be valid, and both contexts must stay
/// at the same address until the saved computation is resumed.
pub unsafe fn switch(current: *mut Context, next: *const Context) {
    unsafe { context_switch_trampoline(&raw mut (*current).sp, (*next).sp) }
}

/// The context-switch magic.
#[unsafe(naked)]
unsafe extern "C" fn context_switch_trampoline(_current_sp: *mut usize, _next_sp: usize) {
    // XXX: rflags and the signal mask are always the same when threads enter
    // this function. RDI: Current Stack pointer storage. RSI: Next Stack
    // pointer.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Switch.
        "mov [rdi], rsp",
        "mov rsp, rsi",

        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// The very beginning of a fresh context.
#[unsafe(naked)]
unsafe extern "C" fn start() -> ! {
    naked_asm!(
        "mov rdi, r13",
        "jmp r12",
    );
}
