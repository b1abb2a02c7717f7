use bitfield_struct::bitfield;

/// The parts of `RFLAGS` the context-switch engine inspects or seeds.
///
/// Arithmetic flags are irrelevant across a voluntary switch and lumped into
/// opaque ranges.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true)]
    _always1: bool, // 1

    /// PF, AF, ZF, SF and the reserved bits between them.
    #[bits(6)]
    _arith: u8, // 2–7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag; must be clear on kernel entry.
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(7)]
    _system: u8, // 15–21

    /// Reserved 22–63
    #[bits(42)]
    _reserved_rest: u64,
}

impl Rflags {
    /// Flags a freshly created thread starts its first switch with.
    ///
    /// The switch itself always runs with interrupts masked; the thread's
    /// interrupt state is restored separately once it leaves its first
    /// critical section.
    #[inline]
    #[must_use]
    pub const fn initial() -> Self {
        Self::new()
    }
}
