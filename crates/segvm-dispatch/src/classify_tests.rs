use segvm_arch_x86::{GuestCpuContext, TrapVector};
use segvm_core::{AccessKind, ExceptionCode, FloatingPointKind};

use crate::{NO_SELECTOR, NativeFault, classify, is_known_trap};

fn context() -> GuestCpuContext {
    GuestCpuContext {
        eip: 0x0040_1000,
        ..Default::default()
    }
}

fn fault(trap: TrapVector) -> NativeFault {
    NativeFault::new(trap, context())
}

#[test]
fn simple_traps() {
    let cases = [
        (TrapVector::DivideError, ExceptionCode::IntegerDivideByZero),
        (TrapVector::DebugException, ExceptionCode::SingleStep),
        (TrapVector::Overflow, ExceptionCode::IntegerOverflow),
        (TrapVector::BoundRange, ExceptionCode::ArrayBoundsExceeded),
        (TrapVector::InvalidOpcode, ExceptionCode::IllegalInstruction),
        (TrapVector::AlignmentCheck, ExceptionCode::DataMisalignment),
    ];

    for (trap, code) in cases {
        let record = classify(&fault(trap));
        assert_eq!(record.code, code, "{trap:?}");
        assert_eq!(record.address, 0x0040_1000);
        assert!(record.parameters.is_empty());
        assert!(record.is_continuable());
    }
}

#[test]
fn breakpoint_reports_int3_address() {
    let record = classify(&fault(TrapVector::Breakpoint));
    assert_eq!(record.code, ExceptionCode::Breakpoint);
    assert_eq!(record.address, 0x0040_0fff);
    assert_eq!(record.parameters.as_slice(), &[0]);
}

#[test]
fn unknown_traps_are_illegal_instructions() {
    for trap in [
        TrapVector::Nmi,
        TrapVector::DoubleFault,
        TrapVector::InvalidTss,
        TrapVector::MachineCheck,
        TrapVector(0x1f),
    ] {
        assert!(!is_known_trap(trap));
        assert_eq!(
            classify(&fault(trap)).code,
            ExceptionCode::IllegalInstruction
        );
    }

    assert!(is_known_trap(TrapVector::GeneralProtectionFault));
}

#[test]
fn privileged_instruction_with_zero_error_code() {
    let record = classify(&fault(TrapVector::GeneralProtectionFault).with_code(&[0xe4, 0x61]));
    assert_eq!(record.code, ExceptionCode::PrivilegedInstruction);

    let record = classify(&fault(TrapVector::GeneralProtectionFault).with_code(&[0xfa]));
    assert_eq!(record.code, ExceptionCode::PrivilegedInstruction);
}

#[test]
fn protection_fault_without_selector() {
    // mov eax, [eax]
    let record = classify(&fault(TrapVector::GeneralProtectionFault).with_code(&[0x8b, 0x00]));
    assert_eq!(record.code, ExceptionCode::AccessViolation);
    assert_eq!(
        record.parameters.as_slice(),
        &[AccessKind::Read.parameter(), NO_SELECTOR]
    );
}

#[test]
fn protection_fault_with_selector() {
    for trap in [
        TrapVector::SegmentNotPresent,
        TrapVector::StackSegmentFault,
        TrapVector::GeneralProtectionFault,
    ] {
        let record = classify(
            &fault(trap)
                .with_error_code(0x1234 | 0b100)
                .with_code(&[0x1f]),
        );

        assert_eq!(record.code, ExceptionCode::AccessViolation, "{trap:?}");
        assert_eq!(record.parameters.as_slice(), &[0, 0x1234]);
    }
}

#[test]
fn idt_bit_means_privileged() {
    // `int 0x21` through a gate the process may not use: index 0x21, IDT.
    let error_code = (0x21 << 3) | 0b10;
    let record = classify(
        &fault(TrapVector::GeneralProtectionFault)
            .with_error_code(error_code)
            .with_code(&[0xcd, 0x21]),
    );
    assert_eq!(record.code, ExceptionCode::PrivilegedInstruction);

    // Same decision for the IDT bit with the external bit clear and index 1.
    let record = classify(&fault(TrapVector::GeneralProtectionFault).with_error_code(0xa));
    assert_eq!(record.code, ExceptionCode::PrivilegedInstruction);
}

#[test]
fn page_fault_access_kinds() {
    let cases = [
        (0b00100, AccessKind::Read),
        (0b00110, AccessKind::Write),
        (0b10101, AccessKind::Execute),
    ];

    for (error_code, access) in cases {
        let record = classify(
            &fault(TrapVector::PageFault)
                .with_error_code(error_code)
                .with_fault_address(0x7000_1234),
        );

        assert_eq!(record.code, ExceptionCode::AccessViolation);
        assert_eq!(record.access(), Some((access, 0x7000_1234)));
    }
}

#[test]
fn page_fault_in_guard_page_is_stack_overflow() {
    let guarded = fault(TrapVector::PageFault)
        .with_error_code(0b110)
        .with_stack_guard(0x7fff_0000..0x7fff_1000);

    let record = classify(&guarded.clone().with_fault_address(0x7fff_0ff8));
    assert_eq!(record.code, ExceptionCode::StackOverflow);
    assert!(record.parameters.is_empty());

    let record = classify(&guarded.with_fault_address(0x7fff_1000));
    assert_eq!(record.code, ExceptionCode::AccessViolation);
}

#[test]
fn floating_point_kinds() {
    // Zero divide pending and unmasked.
    let record = classify(&fault(TrapVector::MathsFault).with_fpu(0x0004, 0x037b));
    assert_eq!(
        record.code,
        ExceptionCode::FloatingPoint(FloatingPointKind::DivideByZero)
    );

    // Invalid operation with the stack fault bit.
    let record = classify(&fault(TrapVector::MathsFault).with_fpu(0x0041, 0x0370));
    assert_eq!(
        record.code,
        ExceptionCode::FloatingPoint(FloatingPointKind::StackCheck)
    );

    // Overflow flagged, all other exceptions masked.
    let record = classify(&fault(TrapVector::SimdException).with_mxcsr(0x1b80 | 0x08));
    assert_eq!(
        record.code,
        ExceptionCode::FloatingPoint(FloatingPointKind::Overflow)
    );
}

#[test]
fn code_is_truncated() {
    let fault = fault(TrapVector::InvalidOpcode).with_code(&[0x90; 20]);
    assert_eq!(fault.code().len(), 16);
}
