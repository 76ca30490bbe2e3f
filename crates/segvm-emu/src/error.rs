use segvm_core::MemoryError;

/// An error that stops an instruction from being emulated.
///
/// On any error the guest register context is left exactly as it was.
/// Side effects already performed by a repeated string instruction stay
/// done: ports read or written and guest memory stored before the failing
/// iteration are not undone.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationError {
    /// The instruction bytes ended before the instruction did.
    #[error("Truncated instruction")]
    Truncated,

    /// The opcode is not one the emulator handles.
    #[error("Unsupported opcode")]
    UnsupportedOpcode,

    /// A selector loaded by the instruction is not valid and cannot be
    /// substituted.
    #[error("Invalid selector {0:#06x}")]
    InvalidSelector(u16),

    /// A memory operand falls outside its segment or has the wrong type.
    #[error("Operand out of segment range")]
    OperandOutOfRange,

    /// Guest memory at the linear address could not be accessed.
    #[error("Memory access failed at {0:#010x}")]
    Memory(u32),

    /// The instruction is only emulated in 16-bit code.
    #[error("Instruction not emulated in this mode")]
    UnsupportedMode,
}

impl From<MemoryError> for EmulationError {
    fn from(value: MemoryError) -> Self {
        match value {
            MemoryError::Unmapped(address) => Self::Memory(address.0),
        }
    }
}
