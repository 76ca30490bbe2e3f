/// Hardware trap vector, as reported by the host for a synchronous fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapVector(pub u8);

#[expect(non_upper_case_globals)]
impl TrapVector {
    /// Divide Error (#DE).
    pub const DivideError: Self = Self(0);

    /// Debug (#DB). Trap flag, hardware breakpoints and watchpoints.
    pub const DebugException: Self = Self(1);

    /// Non-maskable Interrupt.
    pub const Nmi: Self = Self(2);

    /// Breakpoint (#BP). The `int3` instruction.
    pub const Breakpoint: Self = Self(3);

    /// Overflow (#OF). The `into` instruction.
    pub const Overflow: Self = Self(4);

    /// Bound Range Exceeded (#BR). The `bound` instruction.
    pub const BoundRange: Self = Self(5);

    /// Invalid Opcode (#UD).
    pub const InvalidOpcode: Self = Self(6);

    /// Device Not Available (#NM).
    pub const DeviceNotAvailable: Self = Self(7);

    /// Double fault (#DF).
    pub const DoubleFault: Self = Self(8);

    /// Coprocessor Segment Overrun (reserved).
    pub const CoprocessorSegmentOverrun: Self = Self(9);

    /// Invalid TSS (#TS).
    pub const InvalidTss: Self = Self(10);

    /// Segment Not Present (#NP).
    pub const SegmentNotPresent: Self = Self(11);

    /// Stack Segment Fault (#SS).
    pub const StackSegmentFault: Self = Self(12);

    /// General Protection Fault (#GP).
    pub const GeneralProtectionFault: Self = Self(13);

    /// Page Fault (#PF).
    pub const PageFault: Self = Self(14);

    /// Floating-Point Error (#MF).
    pub const MathsFault: Self = Self(16);

    /// Alignment Check (#AC).
    pub const AlignmentCheck: Self = Self(17);

    /// Machine Check (#MC).
    pub const MachineCheck: Self = Self(18);

    /// SIMD Floating-Point Exception (#XM).
    pub const SimdException: Self = Self(19);

    /// Returns whether the hardware pushes an error code for the vector.
    pub fn requires_error_code(self) -> bool {
        matches!(
            self,
            Self::DoubleFault
                | Self::InvalidTss
                | Self::SegmentNotPresent
                | Self::StackSegmentFault
                | Self::GeneralProtectionFault
                | Self::PageFault
                | Self::AlignmentCheck
        )
    }

    /// Checks whether the vector reports a segment protection fault whose
    /// error code names a selector (#NP, #SS, #GP).
    pub fn is_segment_fault(self) -> bool {
        matches!(
            self,
            Self::SegmentNotPresent | Self::StackSegmentFault | Self::GeneralProtectionFault
        )
    }
}

bitflags::bitflags! {
    /// Page fault error code.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// The page was present (protection violation).
        const PRESENT = 1 << 0;

        /// The access was a write.
        const WRITE = 1 << 1;

        /// The access came from user mode.
        const USER = 1 << 2;

        /// A reserved bit was set in a paging structure.
        const RESERVED = 1 << 3;

        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Selector error code of #NP, #SS and #GP faults.
///
/// ```text
///  15         3   2   1   0
/// +------------+---+---+---+
/// |   index    |TI |IDT|EXT|
/// +------------+---+---+---+
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct SelectorErrorCode(pub u32);

impl SelectorErrorCode {
    /// The fault was raised while delivering an external event.
    pub fn external(self) -> bool {
        self.0 & 1 != 0
    }

    /// The index refers to a gate descriptor in the IDT.
    pub fn idt(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// The index refers to the LDT (only meaningful when [`Self::idt`] is
    /// clear).
    pub fn ldt(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    /// Descriptor index.
    pub fn index(self) -> u16 {
        ((self.0 >> 3) & 0x1fff) as _
    }

    /// The selector part, with the EXT and IDT bits cleared.
    pub fn selector(self) -> u16 {
        (self.0 & 0xfffc) as _
    }
}

impl std::fmt::Debug for SelectorErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SelectorErrorCode")
            .field("external", &self.external())
            .field("idt", &self.idt())
            .field("ldt", &self.ldt())
            .field("index", &self.index())
            .finish()
    }
}
