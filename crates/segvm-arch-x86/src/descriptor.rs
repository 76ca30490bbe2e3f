bitflags::bitflags! {
    /// Type and attribute flags of a software segment descriptor.
    ///
    /// The low five bits follow the type field and S flag of a hardware
    /// descriptor; bit 6 is the D/B flag. Bit 7 has no hardware meaning and
    /// marks a slot as allocated.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        /// The segment has been accessed.
        const ACCESSED = 1 << 0;

        /// Data segments: writable. Code segments: readable.
        const WRITABLE = 1 << 1;

        /// Data segments: expand-down. Code segments: conforming.
        const EXPAND_DOWN = 1 << 2;

        /// The segment contains code.
        const EXECUTABLE = 1 << 3;

        /// Code or data segment (S flag); clear for system segments.
        const APPLICATION = 1 << 4;

        /// 32-bit default operand and address size (D/B flag).
        const BIG = 1 << 6;

        /// The slot is allocated.
        const ALLOCATED = 1 << 7;

        /// Type bits, without the size and allocation flags.
        const TYPE_MASK = 0x1f;

        /// Read/write data segment.
        const DATA = Self::APPLICATION.bits() | Self::WRITABLE.bits() | Self::ACCESSED.bits();

        /// Read/write expand-down stack segment.
        const STACK = Self::DATA.bits() | Self::EXPAND_DOWN.bits();

        /// Execute/read code segment.
        const CODE = Self::APPLICATION.bits()
            | Self::EXECUTABLE.bits()
            | Self::WRITABLE.bits()
            | Self::ACCESSED.bits();
    }
}

impl DescriptorFlags {
    /// Checks whether the descriptor is a code segment.
    pub fn is_code(self) -> bool {
        self.contains(Self::EXECUTABLE)
    }

    /// Checks whether the descriptor is a writable data segment. The
    /// accessed and expand-down bits do not matter.
    pub fn is_writable_data(self) -> bool {
        self & (Self::EXECUTABLE | Self::WRITABLE) == Self::WRITABLE
    }

    /// Checks whether the descriptor can be read: any data segment, or a
    /// code segment with the readable bit.
    pub fn is_readable(self) -> bool {
        !self.is_code() || self.contains(Self::WRITABLE)
    }

    /// Checks whether the descriptor defaults to 32-bit operands and
    /// addresses.
    pub fn is_32bit(self) -> bool {
        self.contains(Self::BIG)
    }
}

/// A software segment descriptor.
///
/// The limit is byte-granular and may exceed 1MB; host backends convert it
/// to page granularity when they need to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Linear address of byte 0 of the segment.
    pub base: u32,

    /// Offset of the last valid byte (size - 1).
    pub limit: u32,

    /// Type and attribute flags.
    pub flags: DescriptorFlags,
}

impl SegmentDescriptor {
    /// Creates a descriptor covering `size` bytes at `base`. A zero size
    /// yields a zero limit.
    pub fn new(base: u32, size: u32, flags: DescriptorFlags) -> Self {
        Self {
            base,
            limit: size.saturating_sub(1),
            flags,
        }
    }

    /// Checks whether `[offset, offset + length)` lies within the limit.
    pub fn covers(&self, offset: u32, length: u32) -> bool {
        if length == 0 {
            return offset <= self.limit;
        }

        match offset.checked_add(length - 1) {
            Some(last) => last <= self.limit,
            None => false,
        }
    }

    /// Checks whether the descriptor is present (allocated).
    pub fn present(&self) -> bool {
        self.flags.contains(DescriptorFlags::ALLOCATED)
    }
}
