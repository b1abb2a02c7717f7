//! Bare-metal implementations of [`Platform`](crate::Platform) and
//! [`ContextSwitch`](crate::ContextSwitch).

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub mod x86_64;
