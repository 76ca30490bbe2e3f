use std::ops::Range;

use segvm_arch_x86::{
    GuestCpuContext, PageFaultErrorCode, SelectorErrorCode, TrapVector, simd_exception_kind,
    x87_exception_kind,
};
use segvm_core::{AccessKind, ExceptionCode, ExceptionRecord};
use segvm_emu::{MAX_INSTRUCTION_LENGTH, is_privileged_instruction};

/// First parameter of an access violation raised by a segment fault
/// without a selector in its error code.
pub const NO_SELECTOR: u64 = 0xffff_ffff;

/// Native state captured by the fault handler.
///
/// Everything [`classify`] needs is copied out of the host's fault frame
/// so that classification stays a pure function.
#[derive(Debug, Clone)]
pub struct NativeFault {
    /// Hardware trap number.
    pub trap: TrapVector,

    /// Error code pushed by the trap, or 0.
    pub error_code: u32,

    /// Faulting linear address of a page fault (CR2).
    pub fault_address: u64,

    /// x87 status word.
    pub fpu_status: u16,

    /// x87 control word.
    pub fpu_control: u16,

    /// SSE control and status register.
    pub mxcsr: u32,

    /// Instruction bytes at `cs:eip`.
    pub code: [u8; MAX_INSTRUCTION_LENGTH],

    /// Number of valid bytes in `code`.
    pub code_length: usize,

    /// Guest registers at the fault.
    pub context: GuestCpuContext,

    /// Guard page of the thread's stack, if known.
    pub stack_guard: Option<Range<u64>>,
}

impl NativeFault {
    /// Creates a fault without error code, code bytes or FPU state.
    pub fn new(trap: TrapVector, context: GuestCpuContext) -> Self {
        Self {
            trap,
            error_code: 0,
            fault_address: 0,
            fpu_status: 0,
            fpu_control: 0,
            mxcsr: 0,
            code: [0; MAX_INSTRUCTION_LENGTH],
            code_length: 0,
            context,
            stack_guard: None,
        }
    }

    /// Sets the error code.
    pub fn with_error_code(self, error_code: u32) -> Self {
        Self { error_code, ..self }
    }

    /// Sets the faulting address.
    pub fn with_fault_address(self, fault_address: u64) -> Self {
        Self {
            fault_address,
            ..self
        }
    }

    /// Sets the x87 status and control words.
    pub fn with_fpu(self, fpu_status: u16, fpu_control: u16) -> Self {
        Self {
            fpu_status,
            fpu_control,
            ..self
        }
    }

    /// Sets MXCSR.
    pub fn with_mxcsr(self, mxcsr: u32) -> Self {
        Self { mxcsr, ..self }
    }

    /// Sets the instruction bytes, truncated to
    /// [`MAX_INSTRUCTION_LENGTH`].
    pub fn with_code(mut self, code: &[u8]) -> Self {
        let length = code.len().min(MAX_INSTRUCTION_LENGTH);
        self.code[..length].copy_from_slice(&code[..length]);
        self.code_length = length;
        self
    }

    /// Sets the stack guard page.
    pub fn with_stack_guard(self, stack_guard: Range<u64>) -> Self {
        Self {
            stack_guard: Some(stack_guard),
            ..self
        }
    }

    /// Returns the captured instruction bytes.
    pub fn code(&self) -> &[u8] {
        &self.code[..self.code_length]
    }
}

/// Checks whether [`classify`] knows the trap. Unknown traps are reported
/// as illegal instructions.
pub fn is_known_trap(trap: TrapVector) -> bool {
    matches!(
        trap,
        TrapVector::DivideError
            | TrapVector::DebugException
            | TrapVector::Breakpoint
            | TrapVector::Overflow
            | TrapVector::BoundRange
            | TrapVector::InvalidOpcode
            | TrapVector::DeviceNotAvailable
            | TrapVector::SegmentNotPresent
            | TrapVector::StackSegmentFault
            | TrapVector::GeneralProtectionFault
            | TrapVector::PageFault
            | TrapVector::MathsFault
            | TrapVector::AlignmentCheck
            | TrapVector::SimdException
    )
}

/// Turns a captured trap into an exception record.
///
/// Does not allocate, lock or log, so it may run inside the fault
/// handler.
pub fn classify(fault: &NativeFault) -> ExceptionRecord {
    let ctx = &fault.context;
    let address = ctx.eip as u64;

    let code = match fault.trap {
        TrapVector::DivideError => ExceptionCode::IntegerDivideByZero,

        // Both the trap flag and hardware watchpoints end up here; DR6 in
        // the context tells them apart.
        TrapVector::DebugException => ExceptionCode::SingleStep,

        TrapVector::Breakpoint => {
            return ExceptionRecord::new(ExceptionCode::Breakpoint, address.wrapping_sub(1))
                .with_parameter(0);
        }

        TrapVector::Overflow => ExceptionCode::IntegerOverflow,
        TrapVector::BoundRange => ExceptionCode::ArrayBoundsExceeded,
        TrapVector::InvalidOpcode => ExceptionCode::IllegalInstruction,

        TrapVector::DeviceNotAvailable | TrapVector::MathsFault => ExceptionCode::FloatingPoint(
            x87_exception_kind(fault.fpu_status, fault.fpu_control),
        ),

        TrapVector::SimdException => {
            ExceptionCode::FloatingPoint(simd_exception_kind(fault.mxcsr))
        }

        TrapVector::SegmentNotPresent
        | TrapVector::StackSegmentFault
        | TrapVector::GeneralProtectionFault => {
            let error_code = SelectorErrorCode(fault.error_code);

            if fault.error_code == 0 && is_privileged_instruction(fault.code()) {
                ExceptionCode::PrivilegedInstruction
            }
            else if error_code.idt() {
                ExceptionCode::PrivilegedInstruction
            }
            else {
                let selector = match fault.error_code {
                    0 => NO_SELECTOR,
                    _ => error_code.selector() as u64,
                };

                return ExceptionRecord::new(ExceptionCode::AccessViolation, address)
                    .with_parameter(AccessKind::Read.parameter())
                    .with_parameter(selector);
            }
        }

        TrapVector::PageFault => {
            let in_guard = fault
                .stack_guard
                .as_ref()
                .is_some_and(|guard| guard.contains(&fault.fault_address));

            if in_guard {
                ExceptionCode::StackOverflow
            }
            else {
                let error_code = PageFaultErrorCode::from_bits_retain(fault.error_code);
                let access = if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
                    AccessKind::Execute
                }
                else if error_code.contains(PageFaultErrorCode::WRITE) {
                    AccessKind::Write
                }
                else {
                    AccessKind::Read
                };

                return ExceptionRecord::access_violation(address, access, fault.fault_address);
            }
        }

        TrapVector::AlignmentCheck => ExceptionCode::DataMisalignment,

        _ => ExceptionCode::IllegalInstruction,
    };

    ExceptionRecord::new(code, address)
}
