//! Decoder for the instructions the emulator handles.
//!
//! Decoding is a small recursive descent: [`prefixes`] consumes legacy
//! prefixes, [`opcode`] dispatches on the opcode byte(s) and calls
//! [`modrm`] (and from there [`sib`]) for instructions with a memory
//! operand. The result is a typed [`Decoded`] instruction; nothing is
//! executed here.

use segvm_arch_x86::{Gpr, GuestCpuContext, SegmentRegister};
use segvm_core::PortWidth;

use crate::EmulationError;

/// Operand or address size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    /// 16 bits.
    Bits16,

    /// 32 bits.
    Bits32,
}

impl OperandSize {
    /// Returns the size selected by the default size of the code segment.
    pub fn from_default(is_32bit: bool) -> Self {
        match is_32bit {
            true => Self::Bits32,
            false => Self::Bits16,
        }
    }

    /// Returns the other size (the effect of a 0x66 or 0x67 prefix).
    pub fn toggled(self) -> Self {
        match self {
            Self::Bits16 => Self::Bits32,
            Self::Bits32 => Self::Bits16,
        }
    }

    /// Returns the size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 4,
        }
    }

    /// Returns the value mask.
    pub fn mask(self) -> u32 {
        match self {
            Self::Bits16 => 0xffff,
            Self::Bits32 => 0xffff_ffff,
        }
    }

    /// Returns the port transfer width of a word/dword string or I/O
    /// instruction.
    pub fn port_width(self) -> PortWidth {
        match self {
            Self::Bits16 => PortWidth::Word,
            Self::Bits32 => PortWidth::Dword,
        }
    }
}

/// Repeat prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// `rep` / `repe` (0xF3).
    Rep,

    /// `repne` (0xF2).
    Repne,
}

/// Legacy prefixes of an instruction, with the operand and address sizes
/// they select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefixes {
    /// Segment override.
    pub segment: Option<SegmentRegister>,

    /// Effective operand size.
    pub operand_size: OperandSize,

    /// Effective address size.
    pub address_size: OperandSize,

    /// `lock` prefix.
    pub lock: bool,

    /// Repeat prefix.
    pub repeat: Option<Repeat>,
}

/// A memory operand, resolved against the context at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    /// Segment override, if any.
    pub segment: Option<SegmentRegister>,

    /// Base register.
    pub base: Option<Gpr>,

    /// Index register.
    pub index: Option<Gpr>,

    /// Index scale factor (1, 2, 4 or 8).
    pub scale: u8,

    /// Displacement.
    pub disp: i32,

    /// Address size of the effective address computation.
    pub address_size: OperandSize,
}

impl MemoryOperand {
    /// Returns the segment the operand is addressed through: the override,
    /// or `ss` for `bp`/`ebp`/`esp` based operands and `ds` otherwise.
    pub fn segment(&self) -> SegmentRegister {
        if let Some(segment) = self.segment {
            return segment;
        }

        match self.base {
            Some(Gpr::Ebp | Gpr::Esp) => SegmentRegister::Ss,
            _ => SegmentRegister::Ds,
        }
    }

    /// Computes the effective address (the offset within the segment).
    pub fn offset(&self, ctx: &GuestCpuContext) -> u32 {
        let mask = self.address_size.mask();

        let mut offset = self.disp as u32;
        if let Some(base) = self.base {
            offset = offset.wrapping_add(ctx.gpr(base) & mask);
        }
        if let Some(index) = self.index {
            let index = (ctx.gpr(index) & mask).wrapping_mul(self.scale as u32);
            offset = offset.wrapping_add(index);
        }

        offset & mask
    }
}

/// Register or memory operand of a ModR/M byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOrMemory {
    /// Register operand (`mod == 3`).
    Register(Gpr),

    /// Memory operand.
    Memory(MemoryOperand),
}

/// Port operand of `in` and `out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Immediate 8-bit port number.
    Immediate(u8),

    /// Port number in `dx`.
    Dx,
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `pop es/ss/ds/fs/gs`.
    PopSegment(SegmentRegister),

    /// `les/lds/lss/lfs/lgs reg, m16:16/m16:32`.
    LoadFarPointer {
        /// Segment register receiving the selector.
        segment: SegmentRegister,

        /// Register receiving the offset.
        register: Gpr,

        /// Far pointer in memory.
        source: MemoryOperand,
    },

    /// `mov sreg, r/m16`.
    MovToSegment {
        /// Destination segment register.
        segment: SegmentRegister,

        /// Source operand.
        source: RegisterOrMemory,
    },

    /// `in al/ax/eax, port`.
    In {
        /// Port operand.
        port: Port,

        /// Transfer width.
        width: PortWidth,
    },

    /// `out port, al/ax/eax`.
    Out {
        /// Port operand.
        port: Port,

        /// Transfer width.
        width: PortWidth,
    },

    /// `insb/insw/insd`.
    Ins(PortWidth),

    /// `outsb/outsw/outsd`.
    Outs(PortWidth),

    /// `movsb/movsw/movsd`.
    Movs(PortWidth),

    /// `int n`.
    Int(u8),

    /// `iret`.
    Iret,

    /// `cli`.
    Cli,

    /// `sti`.
    Sti,

    /// `hlt`.
    Hlt,

    /// `mov reg, crN`.
    MovFromControl {
        /// Control register number.
        control: u8,

        /// Destination register.
        register: Gpr,
    },

    /// `mov crN, reg`.
    MovToControl {
        /// Control register number.
        control: u8,

        /// Source register.
        register: Gpr,
    },

    /// `mov reg, drN`.
    MovFromDebug {
        /// Debug register number.
        debug: u8,

        /// Destination register.
        register: Gpr,
    },

    /// `mov drN, reg`.
    MovToDebug {
        /// Debug register number.
        debug: u8,

        /// Source register.
        register: Gpr,
    },

    /// `sidt m`.
    Sidt(MemoryOperand),
}

/// A decoded instruction with its prefixes and total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Legacy prefixes.
    pub prefixes: Prefixes,

    /// The instruction.
    pub instruction: Instruction,

    /// Length in bytes, prefixes included.
    pub length: usize,
}

/// Cursor over the instruction bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.position).copied()
    }

    fn u8(&mut self) -> Result<u8, EmulationError> {
        let value = self.peek().ok_or(EmulationError::Truncated)?;
        self.position += 1;
        Ok(value)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EmulationError> {
        let end = self.position + N;
        let bytes = self
            .bytes
            .get(self.position..end)
            .ok_or(EmulationError::Truncated)?;

        self.position = end;

        let mut result = [0u8; N];
        result.copy_from_slice(bytes);
        Ok(result)
    }

    fn i8(&mut self) -> Result<i8, EmulationError> {
        Ok(self.u8()? as i8)
    }

    fn i16(&mut self) -> Result<i16, EmulationError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, EmulationError> {
        Ok(i32::from_le_bytes(self.array()?))
    }
}

/// Decodes the instruction at the start of `code`.
///
/// `default_32` is the default operand and address size of the code
/// segment.
pub fn decode(code: &[u8], default_32: bool) -> Result<Decoded, EmulationError> {
    let mut cursor = Cursor::new(code);
    let prefixes = prefixes(&mut cursor, OperandSize::from_default(default_32));
    let instruction = opcode(&mut cursor, &prefixes)?;

    Ok(Decoded {
        prefixes,
        instruction,
        length: cursor.position,
    })
}

/// Consumes legacy prefixes. Never fails: a truncated prefix run is
/// reported by [`opcode`].
fn prefixes(cursor: &mut Cursor, default_size: OperandSize) -> Prefixes {
    let mut prefixes = Prefixes {
        segment: None,
        operand_size: default_size,
        address_size: default_size,
        lock: false,
        repeat: None,
    };

    while let Some(byte) = cursor.peek() {
        match byte {
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => {
                prefixes.segment = SegmentRegister::from_prefix(byte);
            }
            0x66 => prefixes.operand_size = default_size.toggled(),
            0x67 => prefixes.address_size = default_size.toggled(),
            0xf0 => prefixes.lock = true,
            0xf2 => prefixes.repeat = Some(Repeat::Repne),
            0xf3 => prefixes.repeat = Some(Repeat::Rep),
            _ => break,
        }

        cursor.position += 1;
    }

    prefixes
}

/// Width of a byte/word-or-dword instruction pair.
fn width(byte_form: bool, prefixes: &Prefixes) -> PortWidth {
    match byte_form {
        true => PortWidth::Byte,
        false => prefixes.operand_size.port_width(),
    }
}

fn opcode(cursor: &mut Cursor, prefixes: &Prefixes) -> Result<Instruction, EmulationError> {
    let op = cursor.u8()?;

    let instruction = match op {
        0x07 => Instruction::PopSegment(SegmentRegister::Es),
        0x17 => Instruction::PopSegment(SegmentRegister::Ss),
        0x1f => Instruction::PopSegment(SegmentRegister::Ds),
        0x0f => return two_byte_opcode(cursor, prefixes),

        0x6c | 0x6d => Instruction::Ins(width(op == 0x6c, prefixes)),
        0x6e | 0x6f => Instruction::Outs(width(op == 0x6e, prefixes)),

        0x8e => {
            let (reg, source) = modrm(cursor, prefixes)?;
            let segment = SegmentRegister::from_encoding(reg)
                .ok_or(EmulationError::UnsupportedOpcode)?;
            Instruction::MovToSegment { segment, source }
        }

        0xa4 | 0xa5 => Instruction::Movs(width(op == 0xa4, prefixes)),

        0xc4 | 0xc5 => {
            let segment = match op {
                0xc4 => SegmentRegister::Es,
                _ => SegmentRegister::Ds,
            };
            load_far_pointer(cursor, prefixes, segment)?
        }

        0xcd => Instruction::Int(cursor.u8()?),
        0xcf => Instruction::Iret,

        0xe4 | 0xe5 => Instruction::In {
            port: Port::Immediate(cursor.u8()?),
            width: width(op == 0xe4, prefixes),
        },
        0xe6 | 0xe7 => Instruction::Out {
            port: Port::Immediate(cursor.u8()?),
            width: width(op == 0xe6, prefixes),
        },
        0xec | 0xed => Instruction::In {
            port: Port::Dx,
            width: width(op == 0xec, prefixes),
        },
        0xee | 0xef => Instruction::Out {
            port: Port::Dx,
            width: width(op == 0xee, prefixes),
        },

        0xf4 => Instruction::Hlt,
        0xfa => Instruction::Cli,
        0xfb => Instruction::Sti,

        _ => return Err(EmulationError::UnsupportedOpcode),
    };

    Ok(instruction)
}

fn two_byte_opcode(cursor: &mut Cursor, prefixes: &Prefixes) -> Result<Instruction, EmulationError> {
    let op = cursor.u8()?;

    let instruction = match op {
        0x01 => {
            let (reg, operand) = modrm(cursor, prefixes)?;
            match (reg, operand) {
                (1, RegisterOrMemory::Memory(operand)) => Instruction::Sidt(operand),
                _ => return Err(EmulationError::UnsupportedOpcode),
            }
        }

        0x20..=0x23 => {
            let (number, operand) = modrm(cursor, prefixes)?;

            // Moves to and from control and debug registers always use
            // the register form, whatever the mod field says.
            let register = match operand {
                RegisterOrMemory::Register(register) => register,
                RegisterOrMemory::Memory(_) => return Err(EmulationError::UnsupportedOpcode),
            };

            match op {
                0x20 => Instruction::MovFromControl {
                    control: number,
                    register,
                },
                0x21 => Instruction::MovFromDebug {
                    debug: number,
                    register,
                },
                0x22 => Instruction::MovToControl {
                    control: number,
                    register,
                },
                _ => Instruction::MovToDebug {
                    debug: number,
                    register,
                },
            }
        }

        0xa1 => Instruction::PopSegment(SegmentRegister::Fs),
        0xa9 => Instruction::PopSegment(SegmentRegister::Gs),

        0xb2 => load_far_pointer(cursor, prefixes, SegmentRegister::Ss)?,
        0xb4 => load_far_pointer(cursor, prefixes, SegmentRegister::Fs)?,
        0xb5 => load_far_pointer(cursor, prefixes, SegmentRegister::Gs)?,

        _ => return Err(EmulationError::UnsupportedOpcode),
    };

    Ok(instruction)
}

fn load_far_pointer(
    cursor: &mut Cursor,
    prefixes: &Prefixes,
    segment: SegmentRegister,
) -> Result<Instruction, EmulationError> {
    let (reg, operand) = modrm(cursor, prefixes)?;

    match operand {
        RegisterOrMemory::Memory(source) => Ok(Instruction::LoadFarPointer {
            segment,
            register: Gpr::from_encoding(reg),
            source,
        }),
        RegisterOrMemory::Register(_) => Err(EmulationError::UnsupportedOpcode),
    }
}

/// Decodes a ModR/M byte and its SIB byte and displacement. Returns the
/// reg field and the r/m operand.
fn modrm(
    cursor: &mut Cursor,
    prefixes: &Prefixes,
) -> Result<(u8, RegisterOrMemory), EmulationError> {
    let byte = cursor.u8()?;
    let mode = byte >> 6;
    let reg = (byte >> 3) & 0b111;
    let rm = byte & 0b111;

    if mode == 0b11 {
        return Ok((reg, RegisterOrMemory::Register(Gpr::from_encoding(rm))));
    }

    let mut operand = MemoryOperand {
        segment: prefixes.segment,
        base: None,
        index: None,
        scale: 1,
        disp: 0,
        address_size: prefixes.address_size,
    };

    match prefixes.address_size {
        OperandSize::Bits16 => {
            let (base, index) = match rm {
                0 => (Some(Gpr::Ebx), Some(Gpr::Esi)),
                1 => (Some(Gpr::Ebx), Some(Gpr::Edi)),
                2 => (Some(Gpr::Ebp), Some(Gpr::Esi)),
                3 => (Some(Gpr::Ebp), Some(Gpr::Edi)),
                4 => (Some(Gpr::Esi), None),
                5 => (Some(Gpr::Edi), None),
                6 if mode == 0 => (None, None),
                6 => (Some(Gpr::Ebp), None),
                _ => (Some(Gpr::Ebx), None),
            };

            operand.base = base;
            operand.index = index;
            operand.disp = match mode {
                0 if rm == 6 => cursor.i16()? as u16 as i32,
                0 => 0,
                1 => cursor.i8()? as i32,
                _ => cursor.i16()? as i32,
            };
        }

        OperandSize::Bits32 => {
            let mut no_base_disp32 = false;
            match rm {
                4 => no_base_disp32 = sib(cursor, mode, &mut operand)?,
                5 if mode == 0 => no_base_disp32 = true,
                _ => operand.base = Some(Gpr::from_encoding(rm)),
            }

            operand.disp = match mode {
                0 if no_base_disp32 => cursor.i32()?,
                0 => 0,
                1 => cursor.i8()? as i32,
                _ => cursor.i32()?,
            };
        }
    }

    Ok((reg, RegisterOrMemory::Memory(operand)))
}

/// Decodes a SIB byte into `operand`. Returns `true` when the operand has
/// no base and a 32-bit displacement follows.
fn sib(cursor: &mut Cursor, mode: u8, operand: &mut MemoryOperand) -> Result<bool, EmulationError> {
    let byte = cursor.u8()?;
    let scale = byte >> 6;
    let index = (byte >> 3) & 0b111;
    let base = byte & 0b111;

    operand.scale = 1 << scale;
    operand.index = match index {
        4 => None,
        _ => Some(Gpr::from_encoding(index)),
    };

    if base == 5 && mode == 0 {
        return Ok(true);
    }

    operand.base = Some(Gpr::from_encoding(base));
    Ok(false)
}

/// Returns the length of the legacy prefix run at the start of `code`.
pub(crate) fn prefix_length(code: &[u8]) -> usize {
    let mut cursor = Cursor::new(code);
    prefixes(&mut cursor, OperandSize::Bits32);
    cursor.position
}
