use segvm_core::FloatingPointKind;

use super::*;

#[test]
fn selector_fields() {
    let selector = Selector::from_ldt_index(0x20);
    assert_eq!(selector.0, 0x107);
    assert_eq!(selector.index(), 0x20);
    assert_eq!(selector.request_privilege_level(), 3);
    assert_eq!(selector.table(), DescriptorTable::Ldt);
    assert!(!selector.is_null());

    assert!(Selector(0x0003).is_null());
    assert!(!Selector(0x0008).is_ldt());
}

#[test]
fn descriptor_predicates() {
    assert_eq!(DescriptorFlags::DATA.bits(), 0x13);
    assert_eq!(DescriptorFlags::STACK.bits(), 0x17);
    assert_eq!(DescriptorFlags::CODE.bits(), 0x1b);

    assert!(DescriptorFlags::DATA.is_writable_data());
    assert!(DescriptorFlags::STACK.is_writable_data());
    assert!(!DescriptorFlags::CODE.is_writable_data());
    assert!(DescriptorFlags::CODE.is_readable());

    let execute_only = DescriptorFlags::APPLICATION | DescriptorFlags::EXECUTABLE;
    assert!(!execute_only.is_readable());
}

#[test]
fn descriptor_covers() {
    let descriptor = SegmentDescriptor::new(0x1000, 0x100, DescriptorFlags::DATA);
    assert_eq!(descriptor.limit, 0xff);
    assert!(descriptor.covers(0, 0x100));
    assert!(descriptor.covers(0xff, 1));
    assert!(!descriptor.covers(0xff, 2));
    assert!(descriptor.covers(0xff, 0));
    assert!(!descriptor.covers(u32::MAX, 2));
}

#[test]
fn segment_register_encoding() {
    assert_eq!(SegmentRegister::from_encoding(3), Some(SegmentRegister::Ds));
    assert_eq!(SegmentRegister::from_encoding(6), None);
    assert_eq!(SegmentRegister::from_prefix(0x64), Some(SegmentRegister::Fs));
    assert_eq!(SegmentRegister::from_prefix(0x90), None);
}

#[test]
fn eflags_masks() {
    let flags = Eflags(Eflags::TRAP | Eflags::ALIGNMENT_CHECK | Eflags::DIRECTION);
    assert!(flags.trap());
    assert!(flags.direction());

    let cleared = flags.without(Eflags::TRAP | Eflags::ALIGNMENT_CHECK);
    assert!(!cleared.trap());
    assert!(!cleared.alignment_check());
    assert!(cleared.direction());

    assert_eq!(Eflags(0x0004_1234).with_low_word(0x0202).0, 0x0004_0202);
}

#[test]
fn dr7_disable() {
    let dr7 = Dr7(0b1001_0101);
    assert!(dr7.enabled(0));
    assert!(dr7.enabled(3));
    assert!(!dr7.disable(0).enabled(0));
    assert!(dr7.disable(0).enabled(1));
    assert_eq!(dr7.disable(7), dr7);
}

#[test]
fn selector_error_code() {
    let code = SelectorErrorCode(0x0a);
    assert!(code.idt());
    assert_eq!(code.index(), 1);

    let code = SelectorErrorCode(0x0107);
    assert!(code.external());
    assert!(code.ldt());
    assert_eq!(code.selector(), 0x0104);
}

#[test]
fn fpu_kinds() {
    // Unmasked zero divide.
    assert_eq!(x87_exception_kind(0x0004, 0x0000), FloatingPointKind::DivideByZero);
    // Invalid operation with the stack fault bit.
    assert_eq!(x87_exception_kind(0x0041, 0x0000), FloatingPointKind::StackCheck);
    // Masked precision, unmasked underflow.
    assert_eq!(x87_exception_kind(0x0030, 0x0020), FloatingPointKind::Underflow);

    // MXCSR: overflow flagged, all masks clear.
    assert_eq!(simd_exception_kind(0x0008), FloatingPointKind::Overflow);
    // Overflow flagged but masked.
    assert_eq!(simd_exception_kind(0x0408), FloatingPointKind::InvalidOperation);
}

#[test]
fn context_registers() {
    let mut ctx = GuestCpuContext {
        eax: 0x1234_5678,
        ..Default::default()
    };

    ctx.set_gpr_masked(Gpr::Eax, 0xab, 0xff);
    assert_eq!(ctx.eax, 0x1234_56ab);

    ctx.set_gpr(Gpr::from_encoding(1), 7);
    assert_eq!(ctx.ecx, 7);

    ctx.set_segment(SegmentRegister::Es, Selector(0x0f));
    assert_eq!(ctx.segment(SegmentRegister::Es), Selector(0x0f));

    assert!(ctx.set_debug_register(7, 0x55));
    assert_eq!(ctx.debug_registers().dr7, Dr7(0x55));
    assert_eq!(ctx.debug_register(5), Some(0x55));
    assert!(!ctx.set_debug_register(8, 0));
}

#[test]
fn cr0_emulated() {
    assert!(Cr0::EMULATED.extension_type());
    assert!(!Cr0::EMULATED.protection_enable());
}
