//! x86_64 context switching.
//!
//! A [`Context`] records what the System V ABI lets a suspended fiber keep:
//! the callee-saved registers, the stack pointer, and the address execution
//! resumes at. `context_switch` parks the live registers in one context and
//! installs another. A context built by [`Context::new`] routes its first
//! restore into the fiber entry trampoline, argument already in `rdi`.

use std::arch::naked_asm;

/// Register file of a parked fiber.
///
/// Field order is load-bearing: the offsets below are hard-coded in
/// `context_switch`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    rbx: u64, // 0x00
    rbp: u64, // 0x08
    r12: u64, // 0x10
    r13: u64, // 0x18
    r14: u64, // 0x20
    r15: u64, // 0x28
    /// Stack pointer as the resumed code will see it.
    rsp: u64, // 0x30
    /// Resume address: the trampoline for a fresh fiber, the instruction
    /// after `context_switch` for a suspended one.
    rip: u64, // 0x38
    /// Copied into `rdi` on every restore; only the first entry reads it.
    arg: u64, // 0x40
}

impl Context {
    /// Build a context whose first restore enters `entry(arg)` on the
    /// given stack.
    ///
    /// `stack_top` is the highest address of the fiber's stack buffer. The
    /// ABI wants `rsp ≡ 8 (mod 16)` at function entry, as if a return
    /// address had just been pushed; the switch jumps instead of calling,
    /// so the aligned top is biased by one unused slot. The trampoline
    /// never returns, so that slot is never popped.
    pub fn new(stack_top: usize, entry: usize, arg: u64) -> Self {
        let rsp = (stack_top & !0xF) - 8;
        Context {
            rsp: rsp as u64,
            rip: entry as u64,
            arg,
            ..Default::default()
        }
    }
}

/// Park the live registers in `old` and continue wherever `new` last
/// stopped.
///
/// Control comes back to the caller only when some later switch restores
/// `old`.
///
/// # Safety
/// Both contexts must stay pinned in memory across the switch, and `new`
/// must hold either a [`Context::new`] result or the state a previous
/// switch left behind.
#[unsafe(naked)]
pub extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // old in rdi, new in rsi. The resume point of `old` is the return
        // address sitting on top of the stack; record it and the
        // as-if-returned stack pointer instead of staging anything on the
        // stack itself.
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x30], rax",
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        // Install the target fiber's register file.
        "mov rbx, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov r12, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r14, [rsi + 0x20]",
        "mov r15, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        // Seed the trampoline argument. On a non-first restore this merely
        // clobbers a caller-saved register nothing relies on.
        "mov rdi, [rsi + 0x40]",
        "mov rax, [rsi + 0x38]",
        "jmp rax",
    );
}
