use core::fmt;

/// Size of the pages the TLB shootdown operates on.
pub const PAGE_SIZE: u64 = 4096;

/// First address above the user half of the canonical address space.
pub const USER_RANGE_END: u64 = 0x0000_8000_0000_0000;

/// A virtual address as seen by the TLB.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base of the 4 KiB page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// The address `pages` pages further up.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0.wrapping_add(pages as u64 * PAGE_SIZE))
    }

    /// Whether this address belongs to the per-process (user) half.
    ///
    /// Kernel-half mappings are shared by every address space.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 < USER_RANGE_END
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Identifies an address space by the physical address of its root table
/// (the value loaded into `CR3`, without flag bits).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    #[inline]
    #[must_use]
    pub const fn new(root: u64) -> Self {
        Self(root)
    }

    #[inline]
    #[must_use]
    pub const fn root(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS(0x{:X})", self.0)
    }
}
