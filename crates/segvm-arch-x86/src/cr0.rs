/// `CR0` control register, as guest code observes it.
///
/// Guest code never sees the host's real `CR0`. Reads return
/// [`Cr0::EMULATED`] and writes are discarded.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr0(pub u32);

impl Cr0 {
    /// The value reported to guest code: real mode, FPU present, extension
    /// type set.
    pub const EMULATED: Self = Self(0x10);

    /// Checks if the CR0.PE flag (protected mode) is set.
    pub fn protection_enable(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the CR0.EM flag (no x87 FPU) is set.
    pub fn emulation(self) -> bool {
        self.0 >> 2 & 1 != 0
    }

    /// Checks if the CR0.ET flag is set.
    ///
    /// On the 386 it signals 387 coprocessor support; later processors
    /// hardwire it to 1.
    pub fn extension_type(self) -> bool {
        self.0 >> 4 & 1 != 0
    }

    /// Checks if the CR0.PG flag (paging) is set.
    pub fn paging(self) -> bool {
        self.0 >> 31 & 1 != 0
    }
}

impl std::fmt::Debug for Cr0 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr0")
            .field("protection_enable", &self.protection_enable())
            .field("emulation", &self.emulation())
            .field("extension_type", &self.extension_type())
            .field("paging", &self.paging())
            .finish()
    }
}
