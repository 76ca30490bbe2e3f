/// The 32-bit EFLAGS register of the guest.
///
/// Only the flags the trap-and-emulate core inspects or rewrites have
/// accessors; the arithmetic status flags pass through untouched.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Eflags(pub u32);

impl Eflags {
    /// Carry flag (bit 0).
    pub const CARRY: u32 = 1 << 0;

    /// Bit 1 always reads as 1.
    pub const FIXED: u32 = 1 << 1;

    /// Trap flag (bit 8).
    pub const TRAP: u32 = 1 << 8;

    /// Interrupt enable flag (bit 9).
    pub const INTERRUPT_ENABLE: u32 = 1 << 9;

    /// Direction flag (bit 10).
    pub const DIRECTION: u32 = 1 << 10;

    /// Nested task flag (bit 14).
    pub const NESTED_TASK: u32 = 1 << 14;

    /// Virtual-8086 mode flag (bit 17).
    pub const VIRTUAL_8086: u32 = 1 << 17;

    /// Alignment check flag (bit 18).
    pub const ALIGNMENT_CHECK: u32 = 1 << 18;

    /// Checks if the Trap Flag (TF) is set.
    ///
    /// A debug exception follows every instruction while it is set.
    pub fn trap(self) -> bool {
        (self.0 >> 8) & 1 != 0
    }

    /// Checks if the Interrupt Enable Flag (IF) is set.
    pub fn interrupt_enable(self) -> bool {
        (self.0 >> 9) & 1 != 0
    }

    /// Checks if the Direction Flag (DF) is set.
    ///
    /// String instructions decrement their index registers when set and
    /// increment them when clear.
    pub fn direction(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }

    /// Checks if the Nested Task (NT) flag is set.
    pub fn nested_task(self) -> bool {
        (self.0 >> 14) & 1 != 0
    }

    /// Checks if Virtual 8086 Mode (VM) is active.
    pub fn virtual_8086_mode(self) -> bool {
        (self.0 >> 17) & 1 != 0
    }

    /// Checks if the Alignment Check (AC) flag is set.
    ///
    /// Misaligned user-mode data references fault while it is set.
    pub fn alignment_check(self) -> bool {
        (self.0 >> 18) & 1 != 0
    }

    /// Returns the flags with the bits of `mask` cleared.
    pub fn without(self, mask: u32) -> Self {
        Self(self.0 & !mask)
    }

    /// Returns the flags with the bits of `mask` set.
    pub fn with(self, mask: u32) -> Self {
        Self(self.0 | mask)
    }

    /// Replaces the low 16 bits (the FLAGS register of 16-bit code).
    pub fn with_low_word(self, value: u16) -> Self {
        Self((self.0 & 0xffff_0000) | value as u32)
    }
}

impl From<u32> for Eflags {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Eflags> for u32 {
    fn from(value: Eflags) -> Self {
        value.0
    }
}

impl std::fmt::Debug for Eflags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Eflags")
            .field("value", &format_args!("{:#010x}", self.0))
            .field("trap", &self.trap())
            .field("interrupt_enable", &self.interrupt_enable())
            .field("direction", &self.direction())
            .field("nested_task", &self.nested_task())
            .field("virtual_8086_mode", &self.virtual_8086_mode())
            .field("alignment_check", &self.alignment_check())
            .finish()
    }
}
