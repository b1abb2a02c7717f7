//! Interrupt-flag control for `x86_64`.
//!
//! # Safety & Privilege
//!
//! `cli`/`sti` are only legal at CPL 0 (or with a suitable IOPL). These
//! helpers are meant for kernel code; calling them from user mode faults.

/// Bit 9 of `RFLAGS`.
pub const RFLAGS_IF: u64 = 1 << 9;

/// Disables maskable interrupts (`cli`).
#[inline]
pub fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables maskable interrupts (`sti`).
#[inline]
pub fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Whether `IF` is set on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}
