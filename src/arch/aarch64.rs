//! aarch64 context switching.
//!
//! Same contract as the x86_64 backend, expressed through AAPCS64: a
//! [`Context`] parks x19-x28, fp/lr, the low halves of d8-d15, and sp.
//! `lr` doubles as the resume address, so a plain `ret` finishes the
//! switch for fresh and suspended fibers alike, and the entry argument is
//! seeded into `x0` on the way out.

use std::arch::naked_asm;

/// Register file of a parked fiber.
///
/// Field order is load-bearing: the pairs match the `stp`/`ldp` offsets in
/// `context_switch`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    x19: u64, // 0x00
    x20: u64, // 0x08
    x21: u64, // 0x10
    x22: u64, // 0x18
    x23: u64, // 0x20
    x24: u64, // 0x28
    x25: u64, // 0x30
    x26: u64, // 0x38
    x27: u64, // 0x40
    x28: u64, // 0x48
    /// Frame pointer (x29).
    fp: u64, // 0x50
    /// Link register (x30); resume address of the parked fiber.
    lr: u64, // 0x58
    /// Callee-saved SIMD registers, low 64 bits.
    d8: u64,  // 0x60
    d9: u64,  // 0x68
    d10: u64, // 0x70
    d11: u64, // 0x78
    d12: u64, // 0x80
    d13: u64, // 0x88
    d14: u64, // 0x90
    d15: u64, // 0x98
    sp: u64, // 0xa0
    /// Copied into `x0` on every restore; only the first entry reads it.
    arg: u64, // 0xa8
}

impl Context {
    /// Build a context whose first restore enters `entry(arg)` on the
    /// given stack.
    ///
    /// AAPCS64 only asks that `sp` be 16-byte aligned at entry. `ret`
    /// takes its target from `lr`, so nothing is staged on the stack.
    pub fn new(stack_top: usize, entry: usize, arg: u64) -> Self {
        Context {
            sp: (stack_top & !0xF) as u64,
            lr: entry as u64,
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
    // old in x0, new in x1.
    naked_asm!(
        // Park the callee-saved file pairwise; lr lands in the resume slot.
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "stp d8,  d9,  [x0, #0x60]",
        "stp d10, d11, [x0, #0x70]",
        "stp d12, d13, [x0, #0x80]",
        "stp d14, d15, [x0, #0x90]",
        "mov x9, sp",
        "str x9, [x0, #0xa0]",
        // Install the target fiber's register file.
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldp d8,  d9,  [x1, #0x60]",
        "ldp d10, d11, [x1, #0x70]",
        "ldp d12, d13, [x1, #0x80]",
        "ldp d14, d15, [x1, #0x90]",
        "ldr x9, [x1, #0xa0]",
        "mov sp, x9",
        // Seed the trampoline argument. On a non-first restore this merely
        // clobbers a caller-saved register nothing relies on.
        "ldr x0, [x1, #0xa8]",
        "ret",
    );
}
