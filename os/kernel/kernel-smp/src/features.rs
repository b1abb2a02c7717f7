//! # Capability snapshot
//!
//! Each processor records, once during its early initialization, the subset of
//! CPU features this core cares about together with the address widths it
//! reports. Feature enumeration itself (walking `CPUID`) happens elsewhere;
//! this module only consumes the result.
//!
//! The snapshot decides which FPU save instruction the context-switch engine
//! uses for the lifetime of the processor:
//!
//! | features                          | mode                    |
//! |-----------------------------------|-------------------------|
//! | `AVX` + `XSAVE` + `OSXSAVE`       | [`FpuSaveMode::Xsave`]  |
//! | `FXSR` (always true on `x86_64`)  | [`FpuSaveMode::Fxsave`] |
//! | neither                           | [`FpuSaveMode::Legacy`] |

use bitfield_struct::bitfield;

/// CPU features relevant to the SMP core.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CpuFeatures {
    /// x87 FPU on chip.
    pub fpu: bool,
    pub sse: bool,
    pub sse2: bool,
    /// `FXSAVE`/`FXRSTOR` supported.
    pub fxsr: bool,
    /// `XSAVE`/`XRSTOR` and `XCR0` supported.
    pub xsave: bool,
    /// The OS has set `CR4.OSXSAVE`; `XGETBV` is usable.
    pub osxsave: bool,
    pub avx: bool,
    /// `RDFSBASE`/`WRFSBASE` usable from ring 0.
    pub fsgsbase: bool,
    /// Process-context identifiers.
    pub pcid: bool,
    pub invpcid: bool,
    /// No-execute page protection.
    pub nx: bool,
    pub rdrand: bool,
    pub rdseed: bool,
    pub x2apic: bool,
    pub smep: bool,
    pub smap: bool,
    #[bits(16)]
    __: u16,
}

impl CpuFeatures {
    /// AVX state can be saved: the CPU supports it and the OS enabled `XSAVE`.
    #[inline]
    #[must_use]
    pub const fn avx_usable(&self) -> bool {
        self.avx() && self.xsave() && self.osxsave()
    }
}

/// The instruction family used to save and restore FPU/vector state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FpuSaveMode {
    /// `FNSAVE`/`FRSTOR` (x87 only).
    Legacy,
    /// `FXSAVE`/`FXRSTOR` (x87 + SSE).
    Fxsave,
    /// `XSAVE`/`XRSTOR` (x87 + SSE + AVX).
    Xsave,
}

impl FpuSaveMode {
    #[must_use]
    pub const fn select(features: CpuFeatures) -> Self {
        if features.avx_usable() {
            Self::Xsave
        } else if features.fxsr() {
            Self::Fxsave
        } else {
            Self::Legacy
        }
    }
}

/// Immutable per-processor capability record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub features: CpuFeatures,
    pub physical_address_bits: u8,
    pub virtual_address_bits: u8,
    fpu_save_mode: FpuSaveMode,
}

impl Capabilities {
    #[must_use]
    pub const fn new(
        features: CpuFeatures,
        physical_address_bits: u8,
        virtual_address_bits: u8,
    ) -> Self {
        Self {
            features,
            physical_address_bits,
            virtual_address_bits,
            fpu_save_mode: FpuSaveMode::select(features),
        }
    }

    /// The save mode chosen when the snapshot was taken.
    #[inline]
    #[must_use]
    pub const fn fpu_save_mode(&self) -> FpuSaveMode {
        self.fpu_save_mode
    }
}
