//! # `x86_64` platform
//!
//! Expects the GS base of every processor to point at its
//! [`Processor`](crate::Processor) descriptor, whose first field is the
//! processor id.
//!
//! Programming the interrupt controller is left to the kernel, which hands in
//! the two IPI primitives when constructing [`X86Platform`].

mod switch;

pub use switch::X86ContextSwitch;

use crate::addr::{AddressSpaceId, VirtualAddress};
use crate::platform::Platform;
use crate::processor::CpuId;
use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::irq;

/// Bits 12..=51 of `CR3`: the root table's physical address.
const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub struct X86Platform {
    send_ipi: fn(CpuId),
    broadcast_ipi: fn(),
    random_state: AtomicU64,
}

impl X86Platform {
    /// `send_ipi` raises the messaging vector on one processor,
    /// `broadcast_ipi` on all but the caller.
    #[must_use]
    pub const fn new(send_ipi: fn(CpuId), broadcast_ipi: fn()) -> Self {
        Self {
            send_ipi,
            broadcast_ipi,
            random_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }
}

impl Platform for X86Platform {
    #[inline]
    fn current_cpu(&self) -> CpuId {
        let id: u32;
        unsafe {
            asm!("mov {0:e}, dword ptr gs:[0]", out(reg) id, options(nostack, readonly, preserves_flags));
        }
        id
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        irq::interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        irq::disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        irq::enable_interrupts();
    }

    fn send_ipi(&self, target: CpuId) {
        (self.send_ipi)(target);
    }

    fn broadcast_ipi(&self) {
        (self.broadcast_ipi)();
    }

    #[inline]
    fn invalidate_page(&self, vaddr: VirtualAddress) {
        unsafe {
            asm!("invlpg [{}]", in(reg) vaddr.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn current_address_space(&self) -> AddressSpaceId {
        let cr3: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        AddressSpaceId::new(cr3 & CR3_ADDRESS_MASK)
    }

    #[inline]
    fn load_address_space(&self, space: AddressSpaceId) {
        unsafe {
            asm!("mov cr3, {}", in(reg) space.root(), options(nostack, preserves_flags));
        }
    }

    fn fast_random(&self) -> u8 {
        // xorshift over the TSC; unpredictable enough for stack offsets
        let tsc = unsafe { core::arch::x86_64::_rdtsc() };
        let mut x = self.random_state.load(Ordering::Relaxed) ^ tsc;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random_state.store(x, Ordering::Relaxed);
        x.to_le_bytes()[0]
    }

    fn halt(&self) -> ! {
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }
}
