//! # Thread execution context
//!
//! The scheduler owns [`ThreadContext`] objects and hands them to the
//! context-switch engine as raw pointers; the engine only ever touches the
//! outgoing and the incoming context of the switch it performs.
//!
//! ```text
//!  ThreadContext (repr(C))
//!  ┌───────────────────────┐ 0x00
//!  │ SavedRegisters        │  rbx rbp r12-r15 rsp rip rflags rsp0
//!  ├───────────────────────┤ 0x40 (aligned)
//!  │ FpuState (1 KiB)      │  fnsave / fxsave / xsave image
//!  ├───────────────────────┤
//!  │ debug, tls, address   │
//!  │ space, kernel stack   │
//!  │ entry, engine state   │
//!  └───────────────────────┘
//! ```

mod switch;

pub use switch::{ContextSwitch, InitialFrame};

use crate::addr::AddressSpaceId;
use crate::features::FpuSaveMode;
use crate::processor::CpuId;
use core::mem::offset_of;

/// Callee-saved register file of a switched-out thread.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SavedRegisters {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    /// Kernel stack top installed into the TSS while this thread runs.
    pub rsp0: u64,
}

/// Byte offsets used by the switch assembly.
pub mod offsets {
    use super::{SavedRegisters, offset_of};

    pub const RBX: usize = offset_of!(SavedRegisters, rbx);
    pub const RBP: usize = offset_of!(SavedRegisters, rbp);
    pub const R12: usize = offset_of!(SavedRegisters, r12);
    pub const R13: usize = offset_of!(SavedRegisters, r13);
    pub const R14: usize = offset_of!(SavedRegisters, r14);
    pub const R15: usize = offset_of!(SavedRegisters, r15);
    pub const RSP: usize = offset_of!(SavedRegisters, rsp);
    pub const RIP: usize = offset_of!(SavedRegisters, rip);
    pub const RFLAGS: usize = offset_of!(SavedRegisters, rflags);
}

/// Size of the FPU save area; fits the legacy, `FXSAVE` and AVX `XSAVE` images.
pub const FPU_STATE_SIZE: usize = 1024;

/// FPU/vector register image. `FXSAVE` needs 16-byte and `XSAVE` 64-byte
/// alignment.
#[repr(C, align(64))]
#[derive(Clone, PartialEq, Eq)]
pub struct FpuState {
    pub bytes: [u8; FPU_STATE_SIZE],
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            bytes: [0; FPU_STATE_SIZE],
        }
    }
}

/// x87 control word after `FNINIT`: every exception masked, 64-bit
/// precision, round to nearest.
pub const FCW_DEFAULT: u16 = 0x037F;

/// `MXCSR` after reset: every SSE exception masked, round to nearest.
pub const MXCSR_DEFAULT: u32 = 0x1F80;

impl FpuState {
    /// The image of a freshly initialized FPU in the layout `mode` restores.
    ///
    /// New threads start from it; an all-zero image would unmask every
    /// floating-point exception.
    #[must_use]
    pub fn initial(mode: FpuSaveMode) -> Self {
        let mut state = Self::default();
        let b = &mut state.bytes;
        b[0..2].copy_from_slice(&FCW_DEFAULT.to_le_bytes());
        match mode {
            FpuSaveMode::Legacy => {
                // full tag word: every register empty
                b[8..10].copy_from_slice(&0xFFFF_u16.to_le_bytes());
            }
            FpuSaveMode::Fxsave | FpuSaveMode::Xsave => {
                // the abridged tag word at byte 4 stays 0: every register empty
                b[24..28].copy_from_slice(&MXCSR_DEFAULT.to_le_bytes());
                if mode == FpuSaveMode::Xsave {
                    // XSAVE header: x87 and SSE state present, standard format
                    b[512..520].copy_from_slice(&XSTATE_X87_SSE.to_le_bytes());
                }
            }
        }
        state
    }

    #[must_use]
    pub fn control_word(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// `MXCSR` of an `FXSAVE` or `XSAVE` image.
    #[must_use]
    pub fn mxcsr(&self) -> u32 {
        let mut raw = [0; 4];
        raw.copy_from_slice(&self.bytes[24..28]);
        u32::from_le_bytes(raw)
    }

    /// `XSTATE_BV` of an `XSAVE` image.
    #[must_use]
    pub fn xstate_bv(&self) -> u64 {
        let mut raw = [0; 8];
        raw.copy_from_slice(&self.bytes[512..520]);
        u64::from_le_bytes(raw)
    }
}

const XSTATE_X87_SSE: u64 = 0b11;

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState").finish_non_exhaustive()
    }
}

/// Hardware breakpoint state of a traced thread.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Where a new thread starts executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    /// Entry function, called as `extern "C" fn(arg)`.
    pub ip: u64,
    pub arg: u64,
    /// Return address planted below the entry frame.
    pub exit: u64,
    /// Interrupt state once the thread has left its first critical section.
    pub interrupts_enabled: bool,
}

/// Everything needed to suspend and resume a thread on any processor.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadContext {
    pub regs: SavedRegisters,
    pub fpu: FpuState,
    pub debug: DebugRegisters,
    /// Debug registers are only saved and restored for traced threads.
    pub traced: bool,
    /// Thread-local storage base (`FS` base).
    pub tls_base: u64,
    pub address_space: AddressSpaceId,
    /// Highest address of the thread's kernel stack.
    pub kernel_stack_top: u64,
    pub entry: ThreadEntry,
    saved_critical: u32,
    saved_interrupts: bool,
    last_cpu: Option<CpuId>,
}

impl ThreadContext {
    #[must_use]
    pub fn new(entry: ThreadEntry, kernel_stack_top: u64, address_space: AddressSpaceId) -> Self {
        Self {
            regs: SavedRegisters::default(),
            fpu: FpuState::default(),
            debug: DebugRegisters::default(),
            traced: false,
            tls_base: 0,
            address_space,
            kernel_stack_top,
            entry,
            saved_critical: 0,
            saved_interrupts: false,
            last_cpu: None,
        }
    }

    /// Critical-section depth the thread resumes with.
    #[inline]
    #[must_use]
    pub const fn saved_critical(&self) -> u32 {
        self.saved_critical
    }

    /// Interrupt state restored when the thread leaves its outermost critical section.
    #[inline]
    #[must_use]
    pub const fn saved_interrupts(&self) -> bool {
        self.saved_interrupts
    }

    /// The processor this thread last ran on.
    #[inline]
    #[must_use]
    pub const fn last_cpu(&self) -> Option<CpuId> {
        self.last_cpu
    }
}
