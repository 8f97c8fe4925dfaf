//! Machine context switching.
//!
//! A context is the callee-saved register set plus the stack pointer; the
//! instruction pointer rides along as the return address on the saved stack.
//! `switch` stores the caller's registers through `save` and resumes
//! whatever `load` points at, so the call "returns" only when some other
//! context switches back.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::arch::global_asm;
use std::ptr;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is only implemented for x86_64 and aarch64");

// System V x86-64: rbx, rbp, r12-r15 are callee-saved. The fabricated first
// frame puts the entry function where `ret` expects a return address; the
// slot above it keeps the ABI stack alignment an entry function would see
// after a real `call`.
#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .text
    .globl fibrio_context_switch
    .align 16
fibrio_context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

// AAPCS64: x19-x28, fp, lr and d8-d15 are callee-saved. The fabricated
// frame leaves lr pointing at the entry function and sp 16-aligned.
#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .text
    .globl fibrio_context_switch
    .align 4
fibrio_context_switch:
    sub sp, sp, #160
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    stp d8, d9, [sp, #96]
    stp d10, d11, [sp, #112]
    stp d12, d13, [sp, #128]
    stp d14, d15, [sp, #144]
    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    ldp d8, d9, [sp, #96]
    ldp d10, d11, [sp, #112]
    ldp d12, d13, [sp, #128]
    ldp d14, d15, [sp, #144]
    add sp, sp, #160
    ret
"#
);

extern "C" {
    fn fibrio_context_switch(save: *mut Context, load: *const Context);
}

/// Saved execution state: everything lives on the saved stack, the struct
/// itself only records where that stack ends.
#[repr(C)]
pub(crate) struct Context {
    sp: *mut usize,
}

impl Context {
    /// A context that has no saved state yet. Valid only as the `save` side
    /// of a switch; the first switch away from the owning thread fills it.
    pub(crate) fn empty() -> Self {
        Context {
            sp: ptr::null_mut(),
        }
    }

    /// Fabricate a context that, when switched to, starts executing `entry`
    /// on the stack ending at `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the upper end of a live allocation large enough
    /// for the fabricated frame and for `entry` to run.
    #[cfg(target_arch = "x86_64")]
    pub(crate) unsafe fn prepare(stack_top: *mut u8, entry: extern "C" fn() -> !) -> Self {
        let top = (stack_top as usize) & !15;
        // 6 saved registers, the entry address, and a sentinel return
        // address that traps if the entry function ever returns.
        let frame = (top - 64) as *mut usize;
        for i in 0..6 {
            frame.add(i).write(0);
        }
        frame.add(6).write(entry as usize);
        frame.add(7).write(context_abort as usize);
        Context { sp: frame }
    }

    /// See the x86-64 variant; same contract.
    #[cfg(target_arch = "aarch64")]
    pub(crate) unsafe fn prepare(stack_top: *mut u8, entry: extern "C" fn() -> !) -> Self {
        let top = (stack_top as usize) & !15;
        let frame = (top - 160) as *mut usize;
        for i in 0..20 {
            frame.add(i).write(0);
        }
        // lr slot; `ret` branches here with sp back at `top`.
        frame.add(11).write(entry as usize);
        Context { sp: frame }
    }
}

/// Switch execution from the context behind `save` to the one behind `load`.
///
/// # Safety
///
/// `save` must be writable, `load` must hold a prepared or previously saved
/// context, and the stacks behind both must be alive. Only the thread that
/// owns the running context may call this.
pub(crate) unsafe fn switch(save: *mut Context, load: *const Context) {
    fibrio_context_switch(save, load);
}

#[cfg(target_arch = "x86_64")]
extern "C" fn context_abort() -> ! {
    std::process::abort()
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

/// A fiber's dedicated stack. Freed with the fiber; nothing that lives on it
/// survives the owning fiber's terminal yield.
pub(crate) struct Stack {
    base: *mut u8,
    layout: Layout,
}

impl Stack {
    /// Allocation failure is fatal, as for any other allocation.
    pub(crate) fn alloc(size: usize) -> Stack {
        let layout = Layout::from_size_align(size, 16).expect("unrepresentable stack size");
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Stack { base, layout }
    }

    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.size()) }
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
