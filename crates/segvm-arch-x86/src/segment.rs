/// A segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRegister {
    /// Extra segment.
    Es,

    /// Code segment.
    Cs,

    /// Stack segment.
    Ss,

    /// Data segment.
    Ds,

    /// Extra segment (386+).
    Fs,

    /// Extra segment (386+).
    Gs,
}

impl SegmentRegister {
    /// Decodes the `sreg` encoding used by the reg field of `mov sreg` and
    /// `mov r/m, sreg`.
    pub fn from_encoding(value: u8) -> Option<Self> {
        match value & 0b111 {
            0 => Some(Self::Es),
            1 => Some(Self::Cs),
            2 => Some(Self::Ss),
            3 => Some(Self::Ds),
            4 => Some(Self::Fs),
            5 => Some(Self::Gs),
            _ => None,
        }
    }

    /// Decodes a segment override prefix byte.
    pub fn from_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            0x26 => Some(Self::Es),
            0x2e => Some(Self::Cs),
            0x36 => Some(Self::Ss),
            0x3e => Some(Self::Ds),
            0x64 => Some(Self::Fs),
            0x65 => Some(Self::Gs),
            _ => None,
        }
    }
}

impl std::fmt::Display for SegmentRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Es => "es",
            Self::Cs => "cs",
            Self::Ss => "ss",
            Self::Ds => "ds",
            Self::Fs => "fs",
            Self::Gs => "gs",
        })
    }
}
