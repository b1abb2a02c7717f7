//! # Per-processor 64-bit Task State Segment
//!
//! Long mode no longer switches tasks in hardware, but the CPU still reads
//! `rsp0` from the TSS whenever an interrupt raises the privilege level to
//! ring 0. Every processor owns one TSS and the context-switch engine points
//! `rsp0` at the incoming thread's kernel stack on each switch.

use core::mem::size_of;

/// 64-bit TSS layout (Intel SDM Vol. 3A, 8.7).
#[repr(C, packed)]
pub struct TaskStateSegment {
    _reserved0: u32,
    /// Ring-0 stack pointer loaded on privilege elevation.
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    _reserved1: u64,
    /// Interrupt Stack Table entries 1..=7.
    pub ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    /// Offset of the I/O permission bitmap; past the end disables it.
    pub iopb_offset: u16,
}

const _: () = assert!(size_of::<TaskStateSegment>() == 104);

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStateSegment {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}
