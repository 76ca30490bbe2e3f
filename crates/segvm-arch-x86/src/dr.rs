/// Number of hardware breakpoint address registers.
pub const BREAKPOINT_COUNT: usize = 4;

/// `DR6` debug status register.
///
/// Reports which debug condition raised the last debug exception.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr6(pub u32);

impl Dr6 {
    /// B0 through B3 (breakpoint condition detected) flags (bits 0 through 3).
    pub fn breakpoint_condition(self) -> u8 {
        (self.0 & 0b1111) as _
    }

    /// Checks whether breakpoint `n` (0-3) fired.
    pub fn hit(self, n: usize) -> bool {
        n < BREAKPOINT_COUNT && (self.0 >> n) & 1 != 0
    }

    /// BD (debug register access detected) flag (bit 13).
    pub fn debug_register_access_detected(self) -> bool {
        (self.0 >> 13) & 1 != 0
    }

    /// BS (single step) flag (bit 14).
    ///
    /// Set when the exception was raised by the trap flag.
    pub fn single_step(self) -> bool {
        (self.0 >> 14) & 1 != 0
    }
}

impl std::fmt::Debug for Dr6 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dr6")
            .field("breakpoint_condition", &self.breakpoint_condition())
            .field(
                "debug_register_access_detected",
                &self.debug_register_access_detected(),
            )
            .field("single_step", &self.single_step())
            .finish()
    }
}

/// `DR7` debug control register.
///
/// Enables or disables the four hardware breakpoints.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr7(pub u32);

impl Dr7 {
    /// Ln (local breakpoint enable) flag of breakpoint `n` (bit `2n`).
    pub fn local_breakpoint(self, n: usize) -> bool {
        n < BREAKPOINT_COUNT && (self.0 >> (2 * n)) & 1 != 0
    }

    /// Gn (global breakpoint enable) flag of breakpoint `n` (bit `2n + 1`).
    pub fn global_breakpoint(self, n: usize) -> bool {
        n < BREAKPOINT_COUNT && (self.0 >> (2 * n + 1)) & 1 != 0
    }

    /// Checks whether breakpoint `n` is enabled locally or globally.
    pub fn enabled(self, n: usize) -> bool {
        self.local_breakpoint(n) || self.global_breakpoint(n)
    }

    /// Returns the register with both enable flags of breakpoint `n`
    /// cleared.
    pub fn disable(self, n: usize) -> Self {
        if n >= BREAKPOINT_COUNT {
            return self;
        }

        Self(self.0 & !(0b11 << (2 * n)))
    }

    /// R/Wn field of breakpoint `n` (bits `16 + 4n`, 2 bits).
    ///
    /// 0 breaks on execution, 1 on data writes, 2 on I/O and 3 on data
    /// reads or writes.
    pub fn condition(self, n: usize) -> u8 {
        if n >= BREAKPOINT_COUNT {
            return 0;
        }

        ((self.0 >> (16 + 4 * n)) & 0b11) as _
    }

    /// LENn field of breakpoint `n` (bits `18 + 4n`, 2 bits).
    pub fn length(self, n: usize) -> u8 {
        if n >= BREAKPOINT_COUNT {
            return 0;
        }

        ((self.0 >> (18 + 4 * n)) & 0b11) as _
    }
}

impl std::fmt::Debug for Dr7 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut s = f.debug_struct("Dr7");
        s.field("value", &format_args!("{:#010x}", self.0));
        for n in 0..BREAKPOINT_COUNT {
            if self.enabled(n) {
                s.field("enabled", &n);
            }
        }
        s.finish()
    }
}
