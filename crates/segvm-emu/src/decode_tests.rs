use segvm_arch_x86::{Gpr, GuestCpuContext, SegmentRegister};
use segvm_core::PortWidth;

use crate::{
    EmulationError, Instruction, MemoryOperand, OperandSize, Port, RegisterOrMemory, Repeat,
    decode,
};

fn memory_operand(code: &[u8], default_32: bool) -> MemoryOperand {
    match decode(code, default_32).unwrap().instruction {
        Instruction::LoadFarPointer { source, .. } => source,
        Instruction::MovToSegment {
            source: RegisterOrMemory::Memory(source),
            ..
        } => source,
        instruction => panic!("unexpected instruction {instruction:?}"),
    }
}

#[test]
fn prefixes_accumulate_length() {
    // cs: o32 rep insd, in 16-bit code.
    let decoded = decode(&[0x2e, 0x66, 0xf3, 0x6d], false).unwrap();

    assert_eq!(decoded.length, 4);
    assert_eq!(decoded.prefixes.segment, Some(SegmentRegister::Cs));
    assert_eq!(decoded.prefixes.operand_size, OperandSize::Bits32);
    assert_eq!(decoded.prefixes.address_size, OperandSize::Bits16);
    assert_eq!(decoded.prefixes.repeat, Some(Repeat::Rep));
    assert_eq!(decoded.instruction, Instruction::Ins(PortWidth::Dword));
}

#[test]
fn operand_size_toggles_from_default() {
    let decoded = decode(&[0x66, 0x67, 0xa5], true).unwrap();
    assert_eq!(decoded.prefixes.operand_size, OperandSize::Bits16);
    assert_eq!(decoded.prefixes.address_size, OperandSize::Bits16);
    assert_eq!(decoded.instruction, Instruction::Movs(PortWidth::Word));
}

#[test]
fn pop_segment_forms() {
    assert_eq!(
        decode(&[0x1f], false).unwrap().instruction,
        Instruction::PopSegment(SegmentRegister::Ds)
    );
    assert_eq!(
        decode(&[0x0f, 0xa9], false).unwrap().instruction,
        Instruction::PopSegment(SegmentRegister::Gs)
    );
    assert_eq!(decode(&[0x0f, 0xa1], false).unwrap().length, 2);
}

#[test]
fn modrm16_base_index_disp8() {
    // lds si, [bp+di+0x10]
    let decoded = decode(&[0xc5, 0x73, 0x10], false).unwrap();
    assert_eq!(decoded.length, 3);

    let Instruction::LoadFarPointer {
        segment,
        register,
        source,
    } = decoded.instruction
    else {
        panic!("not a far pointer load");
    };

    assert_eq!(segment, SegmentRegister::Ds);
    assert_eq!(register, Gpr::Esi);
    assert_eq!(source.segment(), SegmentRegister::Ss);

    let ctx = GuestCpuContext {
        ebp: 0xdead_0100,
        edi: 0x20,
        ..Default::default()
    };
    assert_eq!(source.offset(&ctx), 0x130);
}

#[test]
fn modrm16_direct_and_negative_disp() {
    // mov ds, [0x1234]
    let operand = memory_operand(&[0x8e, 0x1e, 0x34, 0x12], false);
    assert_eq!(operand.base, None);
    assert_eq!(operand.segment(), SegmentRegister::Ds);
    assert_eq!(operand.offset(&GuestCpuContext::default()), 0x1234);

    // mov es, [bx-2]
    let operand = memory_operand(&[0x8e, 0x47, 0xfe], false);
    let ctx = GuestCpuContext {
        ebx: 0x10,
        ..Default::default()
    };
    assert_eq!(operand.offset(&ctx), 0x0e);

    // 16-bit effective addresses wrap at 64K.
    let ctx = GuestCpuContext {
        ebx: 0x1,
        ..Default::default()
    };
    assert_eq!(operand.offset(&ctx), 0xffff);
}

#[test]
fn modrm32_sib() {
    // lds eax, [ebx+ecx*4+8]
    let decoded = decode(&[0xc5, 0x44, 0x8b, 0x08], true).unwrap();
    assert_eq!(decoded.length, 4);

    let operand = memory_operand(&[0xc5, 0x44, 0x8b, 0x08], true);
    assert_eq!(operand.base, Some(Gpr::Ebx));
    assert_eq!(operand.index, Some(Gpr::Ecx));
    assert_eq!(operand.scale, 4);

    let ctx = GuestCpuContext {
        ebx: 0x1000,
        ecx: 3,
        ..Default::default()
    };
    assert_eq!(operand.offset(&ctx), 0x1014);
}

#[test]
fn modrm32_sib_without_base() {
    // lds eax, [ecx*2+0x1000]
    let code = [0xc5, 0x04, 0x4d, 0x00, 0x10, 0x00, 0x00];
    assert_eq!(decode(&code, true).unwrap().length, 7);

    let operand = memory_operand(&code, true);
    assert_eq!(operand.base, None);
    assert_eq!(operand.segment(), SegmentRegister::Ds);

    let ctx = GuestCpuContext {
        ecx: 0x10,
        ..Default::default()
    };
    assert_eq!(operand.offset(&ctx), 0x1020);
}

#[test]
fn modrm32_esp_base_defaults_to_ss() {
    // lss esp, [esp+4]
    let decoded = decode(&[0x0f, 0xb2, 0x64, 0x24, 0x04], true).unwrap();
    assert_eq!(decoded.length, 5);

    let Instruction::LoadFarPointer {
        segment, source, ..
    } = decoded.instruction
    else {
        panic!("not a far pointer load");
    };

    assert_eq!(segment, SegmentRegister::Ss);
    assert_eq!(source.index, None);
    assert_eq!(source.segment(), SegmentRegister::Ss);
}

#[test]
fn segment_override_wins() {
    // lds ax, es:[bp]
    let operand = memory_operand(&[0x26, 0xc5, 0x46, 0x00], false);
    assert_eq!(operand.segment(), SegmentRegister::Es);
}

#[test]
fn port_io_forms() {
    let decoded = decode(&[0xe4, 0x61], false).unwrap();
    assert_eq!(decoded.length, 2);
    assert_eq!(
        decoded.instruction,
        Instruction::In {
            port: Port::Immediate(0x61),
            width: PortWidth::Byte,
        }
    );

    assert_eq!(
        decode(&[0xef], false).unwrap().instruction,
        Instruction::Out {
            port: Port::Dx,
            width: PortWidth::Word,
        }
    );
}

#[test]
fn control_and_debug_moves() {
    assert_eq!(
        decode(&[0x0f, 0x20, 0xc0], true).unwrap().instruction,
        Instruction::MovFromControl {
            control: 0,
            register: Gpr::Eax,
        }
    );
    assert_eq!(
        decode(&[0x0f, 0x22, 0xe0], true).unwrap().instruction,
        Instruction::MovToControl {
            control: 4,
            register: Gpr::Eax,
        }
    );
    assert_eq!(
        decode(&[0x0f, 0x21, 0xf8], true).unwrap().instruction,
        Instruction::MovFromDebug {
            debug: 7,
            register: Gpr::Eax,
        }
    );
}

#[test]
fn sidt_needs_memory_operand() {
    let decoded = decode(&[0x0f, 0x01, 0x0d, 0x00, 0x20, 0x00, 0x00], true).unwrap();
    assert!(matches!(decoded.instruction, Instruction::Sidt(_)));
    assert_eq!(decoded.length, 7);

    assert_eq!(
        decode(&[0x0f, 0x01, 0xc8], true),
        Err(EmulationError::UnsupportedOpcode)
    );
}

#[test]
fn decode_failures() {
    assert_eq!(decode(&[], false), Err(EmulationError::Truncated));
    assert_eq!(decode(&[0x66], false), Err(EmulationError::Truncated));
    assert_eq!(decode(&[0xc5], true), Err(EmulationError::Truncated));
    assert_eq!(decode(&[0xc5, 0x44, 0x8b], true), Err(EmulationError::Truncated));
    assert_eq!(decode(&[0x90], false), Err(EmulationError::UnsupportedOpcode));

    // mov sreg with an invalid segment register encoding.
    assert_eq!(decode(&[0x8e, 0xf0], false), Err(EmulationError::UnsupportedOpcode));

    // lds with a register operand.
    assert_eq!(decode(&[0xc5, 0xc0], false), Err(EmulationError::UnsupportedOpcode));
}
