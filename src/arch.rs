//! Architecture-specific context switching.
//!
//! Each backend provides the same two items: a `Context` holding a parked
//! fiber's register file and `context_switch` to swap execution between two
//! contexts. A context built with `Context::new(stack_top, entry, arg)`
//! enters `entry` on its first restore with `arg` in the platform's
//! first-argument register, so the fiber trampoline receives it as an
//! ordinary parameter.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
