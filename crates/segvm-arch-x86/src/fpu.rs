use segvm_core::FloatingPointKind;

/// Exception flag bits shared by the x87 status word and MXCSR.
const INVALID: u32 = 1 << 0;
const DENORMAL: u32 = 1 << 1;
const ZERO_DIVIDE: u32 = 1 << 2;
const OVERFLOW: u32 = 1 << 3;
const UNDERFLOW: u32 = 1 << 4;
const PRECISION: u32 = 1 << 5;
const EXCEPTION_MASK: u32 = 0x3f;

/// x87 status word stack fault bit.
const STACK_FAULT: u32 = 1 << 6;

fn kind_from_status(status: u32, stack_fault: bool) -> FloatingPointKind {
    if status & INVALID != 0 {
        if stack_fault {
            FloatingPointKind::StackCheck
        }
        else {
            FloatingPointKind::InvalidOperation
        }
    }
    else if status & DENORMAL != 0 {
        FloatingPointKind::DenormalOperand
    }
    else if status & ZERO_DIVIDE != 0 {
        FloatingPointKind::DivideByZero
    }
    else if status & OVERFLOW != 0 {
        FloatingPointKind::Overflow
    }
    else if status & UNDERFLOW != 0 {
        FloatingPointKind::Underflow
    }
    else if status & PRECISION != 0 {
        FloatingPointKind::InexactResult
    }
    else {
        FloatingPointKind::InvalidOperation
    }
}

/// Classifies an x87 exception from the status and control words.
///
/// Exceptions masked in the control word are ignored. With no unmasked
/// exception pending the result is [`FloatingPointKind::InvalidOperation`].
pub fn x87_exception_kind(status_word: u16, control_word: u16) -> FloatingPointKind {
    let status = status_word as u32;
    let pending = status & !(control_word as u32 & EXCEPTION_MASK);
    kind_from_status(pending, status & STACK_FAULT != 0)
}

/// Classifies an SSE exception from MXCSR.
///
/// The mask bits (7-12) suppress the matching flag bits (0-5).
pub fn simd_exception_kind(mxcsr: u32) -> FloatingPointKind {
    let masks = (mxcsr >> 7) & EXCEPTION_MASK;
    kind_from_status(mxcsr & EXCEPTION_MASK & !masks, false)
}
