use smallvec::SmallVec;

use crate::AccessKind;

/// Sub-kind of a floating point exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatingPointKind {
    /// An operand was denormal.
    DenormalOperand,

    /// Division by zero.
    DivideByZero,

    /// The result could not be represented exactly.
    InexactResult,

    /// Invalid operation (including operations on signalling NaNs).
    InvalidOperation,

    /// The result overflowed.
    Overflow,

    /// The x87 register stack overflowed or underflowed.
    StackCheck,

    /// The result underflowed.
    Underflow,
}

/// Classified exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// Undefined or unexpected instruction, and the fallback for traps that
    /// have no better classification.
    IllegalInstruction,

    /// Invalid memory access. The record carries `[access kind, address]`.
    AccessViolation,

    /// The thread touched its stack guard page.
    StackOverflow,

    /// `bound` check failed.
    ArrayBoundsExceeded,

    /// Integer division by zero.
    IntegerDivideByZero,

    /// `into` with the overflow flag set.
    IntegerOverflow,

    /// x87 or SSE floating point exception.
    FloatingPoint(FloatingPointKind),

    /// Misaligned data reference with alignment checking enabled.
    DataMisalignment,

    /// Instruction not allowed at the current privilege level.
    PrivilegedInstruction,

    /// `int3` or a software breakpoint.
    Breakpoint,

    /// Trap flag single step or hardware watchpoint.
    SingleStep,
}

impl ExceptionCode {
    /// Returns the legacy NT status value of the exception.
    pub fn status(self) -> u32 {
        match self {
            Self::IllegalInstruction => 0xc000_001d,
            Self::AccessViolation => 0xc000_0005,
            Self::StackOverflow => 0xc000_00fd,
            Self::ArrayBoundsExceeded => 0xc000_008c,
            Self::IntegerDivideByZero => 0xc000_0094,
            Self::IntegerOverflow => 0xc000_0095,
            Self::FloatingPoint(kind) => match kind {
                FloatingPointKind::DenormalOperand => 0xc000_008d,
                FloatingPointKind::DivideByZero => 0xc000_008e,
                FloatingPointKind::InexactResult => 0xc000_008f,
                FloatingPointKind::InvalidOperation => 0xc000_0090,
                FloatingPointKind::Overflow => 0xc000_0091,
                FloatingPointKind::StackCheck => 0xc000_0092,
                FloatingPointKind::Underflow => 0xc000_0093,
            },
            Self::DataMisalignment => 0x8000_0002,
            Self::PrivilegedInstruction => 0xc000_0096,
            Self::Breakpoint => 0x8000_0003,
            Self::SingleStep => 0x8000_0004,
        }
    }
}

bitflags::bitflags! {
    /// Flags of an exception record.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionFlags: u32 {
        /// Execution cannot continue after the exception.
        const NONCONTINUABLE = 1 << 0;

        /// The exception was raised while a handler for a previous
        /// exception was running.
        const NESTED = 1 << 4;
    }
}

/// Maximum number of extra parameters of an exception record.
pub const MAX_PARAMETERS: usize = 2;

/// Parameters of an exception record.
pub type ExceptionParameters = SmallVec<[u64; MAX_PARAMETERS]>;

/// A classified fault, handed to the structured exception chain.
///
/// Records are built inside the fault handler, so they never allocate:
/// the parameters fit the inline capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception code.
    pub code: ExceptionCode,

    /// Record flags.
    pub flags: ExceptionFlags,

    /// Address of the faulting instruction.
    pub address: u64,

    /// Extra parameters, at most [`MAX_PARAMETERS`].
    pub parameters: ExceptionParameters,
}

impl ExceptionRecord {
    /// Creates a continuable record without parameters.
    pub fn new(code: ExceptionCode, address: u64) -> Self {
        Self {
            code,
            flags: ExceptionFlags::empty(),
            address,
            parameters: SmallVec::new(),
        }
    }

    /// Creates an access violation record.
    pub fn access_violation(address: u64, access: AccessKind, fault_address: u64) -> Self {
        Self::new(ExceptionCode::AccessViolation, address)
            .with_parameter(access.parameter())
            .with_parameter(fault_address)
    }

    /// Appends a parameter. Parameters beyond [`MAX_PARAMETERS`] are
    /// dropped.
    pub fn with_parameter(mut self, value: u64) -> Self {
        if self.parameters.len() < MAX_PARAMETERS {
            self.parameters.push(value);
        }

        self
    }

    /// Marks the record as non-continuable.
    pub fn noncontinuable(mut self) -> Self {
        self.flags |= ExceptionFlags::NONCONTINUABLE;
        self
    }

    /// Checks whether execution may continue after the exception.
    pub fn is_continuable(&self) -> bool {
        !self.flags.contains(ExceptionFlags::NONCONTINUABLE)
    }

    /// Returns the access kind and faulting address of an access violation
    /// with two parameters.
    pub fn access(&self) -> Option<(AccessKind, u64)> {
        if self.code != ExceptionCode::AccessViolation || self.parameters.len() != 2 {
            return None;
        }

        let access = AccessKind::from_parameter(self.parameters[0])?;
        Some((access, self.parameters[1]))
    }
}

/// Result of handing an exception to the structured exception chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A handler repaired the fault; resume with the (possibly modified)
    /// context.
    ContinueExecution,

    /// No handler accepted the exception.
    ContinueSearch,
}
