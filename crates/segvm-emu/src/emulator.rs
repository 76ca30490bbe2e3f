use segvm_arch_x86::{Cr0, Eflags, Gpr, GuestCpuContext, SegmentRegister, Selector};
use segvm_core::{GuestMemory, Hex, Linear, PortIo, PortWidth};
use segvm_ldt::SelectorTable;

use crate::{
    EmulationError, Machine, is_segment_load,
    decode::{Decoded, Instruction, MemoryOperand, OperandSize, Port, RegisterOrMemory, decode},
};

/// Longest possible x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 16;

/// Emulates the segment-sensitive and privileged instructions guest code
/// may fault on.
///
/// The emulator works on a copy of the context and only commits it when
/// the whole instruction succeeded. A failed `rep ins`, `rep outs` or
/// `rep movs` keeps the port transfers and memory writes of the iterations
/// that completed before the failure.
pub struct Emulator<'a, M, P> {
    table: &'a SelectorTable,
    machine: &'a Machine,
    memory: M,
    ports: P,
}

impl<'a, M, P> Emulator<'a, M, P>
where
    M: GuestMemory,
    P: PortIo,
{
    /// Creates an emulator.
    pub fn new(table: &'a SelectorTable, machine: &'a Machine, memory: M, ports: P) -> Self {
        Self {
            table,
            machine,
            memory,
            ports,
        }
    }

    /// Emulates the instruction at `cs:eip`. Returns `true` when the
    /// context was updated and execution can continue.
    pub fn try_emulate(&self, ctx: &mut GuestCpuContext) -> bool {
        match self.emulate(ctx) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(cs = %ctx.cs, eip = %Hex(ctx.eip), %err, "emulation failed");
                false
            }
        }
    }

    /// Checks whether the instruction at `cs:eip` loads a segment register.
    pub fn is_at_segment_load(&self, ctx: &GuestCpuContext) -> bool {
        self.fetch(ctx)
            .is_ok_and(|(code, length)| is_segment_load(&code[..length]))
    }

    /// Emulates the instruction at `cs:eip`, fetching it from guest
    /// memory.
    pub fn emulate(&self, ctx: &mut GuestCpuContext) -> Result<(), EmulationError> {
        let (code, length) = self.fetch(ctx)?;
        self.emulate_code(ctx, &code[..length])
    }

    /// Emulates the instruction at the start of `code`, which holds the
    /// bytes at `cs:eip`.
    pub fn emulate_code(&self, ctx: &mut GuestCpuContext, code: &[u8]) -> Result<(), EmulationError> {
        let code32 = self.is_32bit_segment(ctx.cs);
        let decoded = decode(code, code32)?;

        let mut next = *ctx;
        self.execute(&mut next, &decoded, code32)?;

        tracing::debug!(
            cs = %ctx.cs,
            eip = %Hex(ctx.eip),
            instruction = ?decoded.instruction,
            "instruction emulated"
        );

        *ctx = next;
        Ok(())
    }

    /// Reads up to [`MAX_INSTRUCTION_LENGTH`] bytes at `cs:eip`, stopping
    /// at the code segment limit or at the first unreadable byte.
    fn fetch(
        &self,
        ctx: &GuestCpuContext,
    ) -> Result<([u8; MAX_INSTRUCTION_LENGTH], usize), EmulationError> {
        let mut available = MAX_INSTRUCTION_LENGTH;

        if !self.table.is_system(ctx.cs) {
            let limit = self
                .table
                .limit(ctx.cs)
                .ok_or(EmulationError::InvalidSelector(ctx.cs.0))?;

            if ctx.eip > limit {
                return Err(EmulationError::OperandOutOfRange);
            }

            available = available.min((limit - ctx.eip) as usize + 1);
        }

        let start = self
            .table
            .map_segmented_to_linear(ctx.cs, ctx.eip)
            .map(Linear)
            .ok_or(EmulationError::InvalidSelector(ctx.cs.0))?;

        let mut code = [0u8; MAX_INSTRUCTION_LENGTH];
        let mut length = 0;
        while length < available {
            match self.memory.read_u8(start + length as u32) {
                Ok(byte) => code[length] = byte,
                Err(err) if length == 0 => return Err(err.into()),
                Err(_) => break,
            }

            length += 1;
        }

        Ok((code, length))
    }

    fn execute(
        &self,
        ctx: &mut GuestCpuContext,
        decoded: &Decoded,
        code32: bool,
    ) -> Result<(), EmulationError> {
        let prefixes = &decoded.prefixes;

        match decoded.instruction {
            Instruction::PopSegment(segment) => {
                let value = self.pop(ctx, prefixes.operand_size)?;
                let selector = self.substitute(value as u16, segment)?;
                ctx.set_segment(segment, selector);
            }

            Instruction::LoadFarPointer {
                segment,
                register,
                source,
            } => {
                let size = prefixes.operand_size;
                let address = self.operand_linear(ctx, &source, size.bytes() + 2, false)?;

                let offset = self.read_sized(address, size.port_width())?;
                let value = self.memory.read_u16(address + size.bytes())?;
                let selector = self.substitute(value, segment)?;

                ctx.set_gpr_masked(register, offset, size.mask());
                ctx.set_segment(segment, selector);
            }

            Instruction::MovToSegment { segment, source } => {
                if segment == SegmentRegister::Cs {
                    return Err(EmulationError::UnsupportedOpcode);
                }

                let value = match source {
                    RegisterOrMemory::Register(register) => ctx.gpr(register) as u16,
                    RegisterOrMemory::Memory(operand) => {
                        let address = self.operand_linear(ctx, &operand, 2, false)?;
                        self.memory.read_u16(address)?
                    }
                };

                let selector = self.substitute(value, segment)?;
                ctx.set_segment(segment, selector);
            }

            Instruction::In { port, width } => {
                let port = port_number(ctx, port);
                let value = self.ports.port_read(port, width);
                ctx.set_gpr_masked(Gpr::Eax, value, width.mask());
            }

            Instruction::Out { port, width } => {
                let port = port_number(ctx, port);
                self.ports.port_write(port, width, ctx.eax & width.mask());
            }

            Instruction::Ins(width) => {
                let address_size = prefixes.address_size;
                let port = ctx.edx as u16;

                for _ in 0..repeat_count(ctx, decoded) {
                    let offset = ctx.edi & address_size.mask();
                    let address = self.linear(ctx.es, offset, width.bytes(), true)?;

                    let value = self.ports.port_read(port, width);
                    self.write_sized(address, value, width)?;
                    step_index(ctx, Gpr::Edi, width, address_size);
                }

                finish_repeat(ctx, decoded);
            }

            Instruction::Outs(width) => {
                let address_size = prefixes.address_size;
                let port = ctx.edx as u16;
                let segment = ctx.segment(prefixes.segment.unwrap_or(SegmentRegister::Ds));

                for _ in 0..repeat_count(ctx, decoded) {
                    let offset = ctx.esi & address_size.mask();
                    let address = self.linear(segment, offset, width.bytes(), false)?;

                    let value = self.read_sized(address, width)?;
                    self.ports.port_write(port, width, value);
                    step_index(ctx, Gpr::Esi, width, address_size);
                }

                finish_repeat(ctx, decoded);
            }

            Instruction::Movs(width) => {
                self.movs(ctx, decoded, width)?;
            }

            Instruction::Int(vector) => {
                if code32 {
                    return Err(EmulationError::UnsupportedMode);
                }

                if let Some((selector, offset)) = self.machine.vectors().get(vector) {
                    let flags = ctx.eflags.0 & 0xffff;
                    let return_cs = ctx.cs.0 as u32;
                    let return_ip = ctx.eip.wrapping_add(decoded.length as u32) & 0xffff;

                    self.push(ctx, flags, OperandSize::Bits16)?;
                    self.push(ctx, return_cs, OperandSize::Bits16)?;
                    self.push(ctx, return_ip, OperandSize::Bits16)?;

                    ctx.cs = selector;
                    ctx.eip = offset as u32;
                    ctx.eflags = ctx
                        .eflags
                        .without(Eflags::TRAP | Eflags::INTERRUPT_ENABLE);
                    return Ok(());
                }

                tracing::debug!(vector, "no handler for interrupt, skipping");
            }

            Instruction::Iret => {
                let size = prefixes.operand_size;
                let ip = self.pop(ctx, size)?;
                let cs = Selector(self.pop(ctx, size)? as u16);
                let flags = self.pop(ctx, size)?;

                if !self.table.is_system(cs) && !self.table.validate_code_pointer(cs, ip) {
                    return Err(EmulationError::InvalidSelector(cs.0));
                }

                ctx.cs = cs;
                ctx.eip = ip;
                ctx.eflags = match size {
                    OperandSize::Bits16 => ctx.eflags.with_low_word(flags as u16),
                    OperandSize::Bits32 => Eflags(flags),
                };
                return Ok(());
            }

            Instruction::Cli | Instruction::Sti => {}

            Instruction::Hlt => {
                if code32 {
                    return Err(EmulationError::UnsupportedMode);
                }
            }

            Instruction::MovFromControl { control, register } => {
                let value = match control {
                    0 => Cr0::EMULATED.0,
                    4 => 0,
                    _ => return Err(EmulationError::UnsupportedOpcode),
                };

                ctx.set_gpr(register, value);
            }

            Instruction::MovToControl { control, .. } => {
                // Writes to cr4 are dropped; nothing else is accepted.
                if control != 4 {
                    return Err(EmulationError::UnsupportedOpcode);
                }
            }

            Instruction::MovFromDebug { debug, register } => {
                let value = ctx
                    .debug_register(debug)
                    .ok_or(EmulationError::UnsupportedOpcode)?;
                ctx.set_gpr(register, value);
            }

            Instruction::MovToDebug { debug, register } => {
                let value = ctx.gpr(register);
                if !ctx.set_debug_register(debug, value) {
                    return Err(EmulationError::UnsupportedOpcode);
                }
            }

            Instruction::Sidt(operand) => {
                let address = self.operand_linear(ctx, &operand, 6, true)?;
                let idt = self.machine.idt();

                let base = match prefixes.operand_size {
                    OperandSize::Bits16 => idt.base() & 0x00ff_ffff,
                    OperandSize::Bits32 => idt.base(),
                };

                self.memory.write_u16(address, idt.limit())?;
                self.memory.write_u32(address + 2, base)?;
            }
        }

        let ip = ctx.eip.wrapping_add(decoded.length as u32);
        ctx.eip = match code32 {
            true => ip,
            false => ip & 0xffff,
        };

        Ok(())
    }

    /// `movs` touching the IDT shadow.
    fn movs(
        &self,
        ctx: &mut GuestCpuContext,
        decoded: &Decoded,
        width: PortWidth,
    ) -> Result<(), EmulationError> {
        let prefixes = &decoded.prefixes;
        let address_size = prefixes.address_size;
        let source_segment = ctx.segment(prefixes.segment.unwrap_or(SegmentRegister::Ds));
        let idt = self.machine.idt();
        let step = width.bytes();

        let mut buffer = [0u8; 4];
        let buffer = &mut buffer[..step as usize];

        for iteration in 0..repeat_count(ctx, decoded) {
            let source = self.linear(source_segment, ctx.esi & address_size.mask(), step, false)?;
            let target = self.linear(ctx.es, ctx.edi & address_size.mask(), step, true)?;

            let source_in_idt = idt.contains(source.0, step);
            let target_in_idt = idt.contains(target.0, step);

            if iteration == 0 && !source_in_idt && !target_in_idt {
                return Err(EmulationError::UnsupportedOpcode);
            }

            if !idt.read(source.0, buffer) {
                self.memory.read(source, buffer)?;
            }

            if !idt.write(target.0, buffer) {
                self.memory.write(target, buffer)?;
            }

            step_index(ctx, Gpr::Esi, width, address_size);
            step_index(ctx, Gpr::Edi, width, address_size);
        }

        finish_repeat(ctx, decoded);
        Ok(())
    }

    /// Substitutes a selector about to be loaded into `segment`.
    fn substitute(&self, value: u16, segment: SegmentRegister) -> Result<Selector, EmulationError> {
        let allow_null = !matches!(segment, SegmentRegister::Cs | SegmentRegister::Ss);
        self.machine
            .substitute_selector(self.table, value, allow_null)
    }

    /// Checks whether a segment defaults to 32-bit operands. System
    /// selectors describe the flat 32-bit space.
    fn is_32bit_segment(&self, selector: Selector) -> bool {
        self.table.is_system(selector) || self.table.is_32bit(selector)
    }

    /// Translates `selector:offset`, checking that `length` bytes fit the
    /// segment.
    fn linear(
        &self,
        selector: Selector,
        offset: u32,
        length: u32,
        for_write: bool,
    ) -> Result<Linear, EmulationError> {
        if selector.is_null() {
            return Err(EmulationError::InvalidSelector(selector.0));
        }

        if self.table.is_system(selector) {
            return Ok(Linear(offset));
        }

        if !self.table.is_allocated(selector) {
            return Err(EmulationError::InvalidSelector(selector.0));
        }

        if !self.table.validate_range(selector, offset, length, for_write) {
            return Err(EmulationError::OperandOutOfRange);
        }

        self.table
            .map_segmented_to_linear(selector, offset)
            .map(Linear)
            .ok_or(EmulationError::InvalidSelector(selector.0))
    }

    fn operand_linear(
        &self,
        ctx: &GuestCpuContext,
        operand: &MemoryOperand,
        length: u32,
        for_write: bool,
    ) -> Result<Linear, EmulationError> {
        let selector = ctx.segment(operand.segment());
        self.linear(selector, operand.offset(ctx), length, for_write)
    }

    fn read_sized(&self, address: Linear, width: PortWidth) -> Result<u32, EmulationError> {
        let value = match width {
            PortWidth::Byte => self.memory.read_u8(address)? as u32,
            PortWidth::Word => self.memory.read_u16(address)? as u32,
            PortWidth::Dword => self.memory.read_u32(address)?,
        };

        Ok(value)
    }

    fn write_sized(&self, address: Linear, value: u32, width: PortWidth) -> Result<(), EmulationError> {
        let bytes = value.to_le_bytes();
        self.memory.write(address, &bytes[..width.bytes() as usize])?;
        Ok(())
    }

    fn stack_size(&self, ctx: &GuestCpuContext) -> OperandSize {
        OperandSize::from_default(self.is_32bit_segment(ctx.ss))
    }

    fn pop(&self, ctx: &mut GuestCpuContext, size: OperandSize) -> Result<u32, EmulationError> {
        let stack = self.stack_size(ctx);
        let offset = ctx.esp & stack.mask();
        let address = self.linear(ctx.ss, offset, size.bytes(), false)?;
        let value = self.read_sized(address, size.port_width())?;

        ctx.set_gpr_masked(Gpr::Esp, offset.wrapping_add(size.bytes()), stack.mask());
        Ok(value)
    }

    fn push(&self, ctx: &mut GuestCpuContext, value: u32, size: OperandSize) -> Result<(), EmulationError> {
        let stack = self.stack_size(ctx);
        let offset = (ctx.esp & stack.mask()).wrapping_sub(size.bytes()) & stack.mask();
        let address = self.linear(ctx.ss, offset, size.bytes(), true)?;
        self.write_sized(address, value, size.port_width())?;

        ctx.set_gpr_masked(Gpr::Esp, offset, stack.mask());
        Ok(())
    }
}

fn port_number(ctx: &GuestCpuContext, port: Port) -> u16 {
    match port {
        Port::Immediate(port) => port as u16,
        Port::Dx => ctx.edx as u16,
    }
}

/// Number of iterations of a string instruction: the count register for
/// a repeated instruction, 1 otherwise.
fn repeat_count(ctx: &GuestCpuContext, decoded: &Decoded) -> u32 {
    match decoded.prefixes.repeat {
        Some(_) => ctx.ecx & decoded.prefixes.address_size.mask(),
        None => 1,
    }
}

/// Zeroes the count register after a repeated string instruction.
fn finish_repeat(ctx: &mut GuestCpuContext, decoded: &Decoded) {
    if decoded.prefixes.repeat.is_some() {
        ctx.set_gpr_masked(Gpr::Ecx, 0, decoded.prefixes.address_size.mask());
    }
}

/// Advances a string index register by one element in the direction
/// given by EFLAGS.DF.
fn step_index(ctx: &mut GuestCpuContext, register: Gpr, width: PortWidth, address_size: OperandSize) {
    let value = ctx.gpr(register);
    let value = match ctx.eflags.direction() {
        true => value.wrapping_sub(width.bytes()),
        false => value.wrapping_add(width.bytes()),
    };

    ctx.set_gpr_masked(register, value, address_size.mask());
}
