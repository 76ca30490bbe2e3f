use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A segment selector is a 16-bit identifier for a segment. It does not point
/// directly to the segment, but instead points to the segment descriptor that
/// defines the segment.
#[repr(C)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable)]
pub struct Selector(pub u16);

/// A descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTable {
    /// The Global Descriptor Table.
    Gdt,

    /// The Local Descriptor Table.
    Ldt,
}

impl Selector {
    /// The null selector.
    pub const NULL: Self = Self(0);

    /// Builds the user-mode LDT selector (TI = 1, RPL = 3) for a descriptor
    /// slot.
    pub const fn from_ldt_index(index: u16) -> Self {
        Self((index << 3) | 0b111)
    }

    /// Specifies the privilege level of the selector. The privilege level can
    /// range from 0 to 3, with 0 being the most privileged level.
    pub fn request_privilege_level(self) -> u8 {
        (self.0 & 0b11) as _
    }

    /// Specifies the descriptor table to use: clearing this flag selects the
    /// GDT; setting this flag selects the current LDT.
    pub fn table(self) -> DescriptorTable {
        match self.0 >> 2 & 1 {
            0 => DescriptorTable::Gdt,
            _ => DescriptorTable::Ldt,
        }
    }

    /// Selects one of 8192 descriptors in the GDT or LDT.
    pub fn index(self) -> u16 {
        self.0 >> 3 & 0x1fff
    }

    /// Checks whether the selector is a null selector. The RPL bits are
    /// ignored.
    pub fn is_null(self) -> bool {
        self.0 & !0b11 == 0
    }

    /// Checks whether the selector refers to the LDT.
    pub fn is_ldt(self) -> bool {
        self.table() == DescriptorTable::Ldt
    }
}

impl From<u16> for Selector {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Selector> for u16 {
    fn from(value: Selector) -> Self {
        value.0
    }
}

impl From<u32> for Selector {
    fn from(value: u32) -> Self {
        Self(value as u16)
    }
}

impl From<Selector> for u32 {
    fn from(value: Selector) -> Self {
        value.0 as u32
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("value", &format_args!("{:#06x}", self.0))
            .field("request_privilege_level", &self.request_privilege_level())
            .field("table", &self.table())
            .field("index", &self.index())
            .finish()
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
