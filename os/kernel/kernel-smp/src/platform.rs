use crate::addr::{AddressSpaceId, VirtualAddress};
use crate::processor::CpuId;

/// Hardware services the SMP core needs from the processor it runs on.
///
/// Every method acts on the *calling* processor unless it names a target.
/// The bare-metal implementation lives in `arch::x86_64`; the host test suite
/// provides a simulated machine.
pub trait Platform: Sync {
    /// Index of the calling processor.
    fn current_cpu(&self) -> CpuId;

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Raises the messaging interrupt on `target`.
    fn send_ipi(&self, target: CpuId);

    /// Raises the messaging interrupt on every processor except the caller.
    fn broadcast_ipi(&self);

    /// Drops the TLB entry for the page containing `vaddr` on this processor.
    fn invalidate_page(&self, vaddr: VirtualAddress);

    /// The address space currently loaded on this processor.
    fn current_address_space(&self) -> AddressSpaceId;

    /// Switches this processor to `space`.
    fn load_address_space(&self, space: AddressSpaceId);

    /// A cheap, non-cryptographic random byte.
    fn fast_random(&self) -> u8;

    /// Stops this processor for good. Interrupts are disabled by the caller.
    fn halt(&self) -> !;

    /// Spin-wait hint.
    #[inline]
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
