/// Width of a single port I/O transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortWidth {
    /// 8-bit transfer (`inb`/`outb`).
    Byte,

    /// 16-bit transfer (`inw`/`outw`).
    Word,

    /// 32-bit transfer (`inl`/`outl`).
    Dword,
}

impl PortWidth {
    /// Returns the transfer size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    /// Returns the mask covering the transfer size.
    pub fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Dword => 0xffff_ffff,
        }
    }
}

/// Port I/O device emulation.
///
/// Consulted by the emulated `in`, `out`, `ins` and `outs` instructions,
/// once per unit transfer. Implementations own their device state and use
/// interior mutability.
pub trait PortIo {
    /// Reads `width` bytes from `port`. Only the low `width` bytes of the
    /// result are used.
    fn port_read(&self, port: u16, width: PortWidth) -> u32;

    /// Writes the low `width` bytes of `value` to `port`.
    fn port_write(&self, port: u16, width: PortWidth, value: u32);
}

impl<T> PortIo for &T
where
    T: PortIo + ?Sized,
{
    fn port_read(&self, port: u16, width: PortWidth) -> u32 {
        (**self).port_read(port, width)
    }

    fn port_write(&self, port: u16, width: PortWidth, value: u32) {
        (**self).port_write(port, width, value)
    }
}

impl<T> PortIo for std::sync::Arc<T>
where
    T: PortIo + ?Sized,
{
    fn port_read(&self, port: u16, width: PortWidth) -> u32 {
        (**self).port_read(port, width)
    }

    fn port_write(&self, port: u16, width: PortWidth, value: u32) {
        (**self).port_write(port, width, value)
    }
}

/// Port I/O with nothing attached: reads float high, writes are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPorts;

impl PortIo for NoPorts {
    fn port_read(&self, _port: u16, width: PortWidth) -> u32 {
        width.mask()
    }

    fn port_write(&self, _port: u16, _width: PortWidth, _value: u32) {}
}
