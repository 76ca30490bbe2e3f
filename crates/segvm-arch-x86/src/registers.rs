use crate::{Dr6, Dr7, Eflags, SegmentRegister, Selector};

/// General-purpose register, in the order of its 3-bit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    /// `eax` (0).
    Eax,
    /// `ecx` (1).
    Ecx,
    /// `edx` (2).
    Edx,
    /// `ebx` (3).
    Ebx,
    /// `esp` (4).
    Esp,
    /// `ebp` (5).
    Ebp,
    /// `esi` (6).
    Esi,
    /// `edi` (7).
    Edi,
}

impl Gpr {
    /// Decodes the 3-bit register encoding of a ModR/M or SIB field.
    pub fn from_encoding(value: u8) -> Self {
        match value & 0b111 {
            0 => Self::Eax,
            1 => Self::Ecx,
            2 => Self::Edx,
            3 => Self::Ebx,
            4 => Self::Esp,
            5 => Self::Ebp,
            6 => Self::Esi,
            _ => Self::Edi,
        }
    }
}

/// The debug registers of a thread.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegisterSet {
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: Dr6,
    pub dr7: Dr7,
}

/// Portable snapshot of the guest CPU state at a fault.
///
/// Mirrors the native fault frame: general-purpose registers, segment
/// selectors, flags and debug registers. The emulator patches a copy and
/// the host layer writes it back into the native frame on resume.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestCpuContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: Eflags,

    pub cs: Selector,
    pub ds: Selector,
    pub es: Selector,
    pub fs: Selector,
    pub gs: Selector,
    pub ss: Selector,

    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: Dr6,
    pub dr7: Dr7,
}

impl GuestCpuContext {
    /// Returns a general-purpose register.
    pub fn gpr(&self, register: Gpr) -> u32 {
        match register {
            Gpr::Eax => self.eax,
            Gpr::Ecx => self.ecx,
            Gpr::Edx => self.edx,
            Gpr::Ebx => self.ebx,
            Gpr::Esp => self.esp,
            Gpr::Ebp => self.ebp,
            Gpr::Esi => self.esi,
            Gpr::Edi => self.edi,
        }
    }

    /// Sets a general-purpose register.
    pub fn set_gpr(&mut self, register: Gpr, value: u32) {
        let slot = match register {
            Gpr::Eax => &mut self.eax,
            Gpr::Ecx => &mut self.ecx,
            Gpr::Edx => &mut self.edx,
            Gpr::Ebx => &mut self.ebx,
            Gpr::Esp => &mut self.esp,
            Gpr::Ebp => &mut self.ebp,
            Gpr::Esi => &mut self.esi,
            Gpr::Edi => &mut self.edi,
        };

        *slot = value;
    }

    /// Replaces the bits of `mask` in a general-purpose register, keeping
    /// the rest. Used for 8- and 16-bit destinations (`al`, `ax`, `cx`).
    pub fn set_gpr_masked(&mut self, register: Gpr, value: u32, mask: u32) {
        let current = self.gpr(register);
        self.set_gpr(register, (current & !mask) | (value & mask));
    }

    /// Returns a segment register.
    pub fn segment(&self, register: SegmentRegister) -> Selector {
        match register {
            SegmentRegister::Es => self.es,
            SegmentRegister::Cs => self.cs,
            SegmentRegister::Ss => self.ss,
            SegmentRegister::Ds => self.ds,
            SegmentRegister::Fs => self.fs,
            SegmentRegister::Gs => self.gs,
        }
    }

    /// Sets a segment register.
    pub fn set_segment(&mut self, register: SegmentRegister, selector: Selector) {
        match register {
            SegmentRegister::Es => self.es = selector,
            SegmentRegister::Cs => self.cs = selector,
            SegmentRegister::Ss => self.ss = selector,
            SegmentRegister::Ds => self.ds = selector,
            SegmentRegister::Fs => self.fs = selector,
            SegmentRegister::Gs => self.gs = selector,
        }
    }

    /// Returns the debug registers.
    pub fn debug_registers(&self) -> DebugRegisterSet {
        DebugRegisterSet {
            dr0: self.dr0,
            dr1: self.dr1,
            dr2: self.dr2,
            dr3: self.dr3,
            dr6: self.dr6,
            dr7: self.dr7,
        }
    }

    /// Replaces the debug registers.
    pub fn set_debug_registers(&mut self, registers: &DebugRegisterSet) {
        self.dr0 = registers.dr0;
        self.dr1 = registers.dr1;
        self.dr2 = registers.dr2;
        self.dr3 = registers.dr3;
        self.dr6 = registers.dr6;
        self.dr7 = registers.dr7;
    }

    /// Returns a debug register by its `mov drN` number. Numbers 4 and 5
    /// alias 6 and 7.
    pub fn debug_register(&self, number: u8) -> Option<u32> {
        match number {
            0 => Some(self.dr0),
            1 => Some(self.dr1),
            2 => Some(self.dr2),
            3 => Some(self.dr3),
            4 | 6 => Some(self.dr6.0),
            5 | 7 => Some(self.dr7.0),
            _ => None,
        }
    }

    /// Sets a debug register by its `mov drN` number. Returns `false` for
    /// an invalid number.
    pub fn set_debug_register(&mut self, number: u8, value: u32) -> bool {
        match number {
            0 => self.dr0 = value,
            1 => self.dr1 = value,
            2 => self.dr2 = value,
            3 => self.dr3 = value,
            4 | 6 => self.dr6 = Dr6(value),
            5 | 7 => self.dr7 = Dr7(value),
            _ => return false,
        }

        true
    }
}
