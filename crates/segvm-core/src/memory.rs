use crate::{Linear, MemoryError};

/// Access to the guest's flat linear address space.
///
/// The emulator reads instruction bytes, stack slots and far pointers
/// through this trait and writes the results of string I/O and stack
/// pushes back through it.
pub trait GuestMemory {
    /// Reads `buffer.len()` bytes starting at `address`.
    fn read(&self, address: Linear, buffer: &mut [u8]) -> Result<(), MemoryError>;

    /// Writes `data` starting at `address`.
    fn write(&self, address: Linear, data: &[u8]) -> Result<(), MemoryError>;

    /// Reads a byte.
    fn read_u8(&self, address: Linear) -> Result<u8, MemoryError> {
        let mut buffer = [0u8; 1];
        self.read(address, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a little-endian 16-bit value.
    fn read_u16(&self, address: Linear) -> Result<u16, MemoryError> {
        let mut buffer = [0u8; 2];
        self.read(address, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a little-endian 32-bit value.
    fn read_u32(&self, address: Linear) -> Result<u32, MemoryError> {
        let mut buffer = [0u8; 4];
        self.read(address, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Writes a little-endian 16-bit value.
    fn write_u16(&self, address: Linear, value: u16) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a little-endian 32-bit value.
    fn write_u32(&self, address: Linear, value: u32) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }
}

impl<T> GuestMemory for &T
where
    T: GuestMemory + ?Sized,
{
    fn read(&self, address: Linear, buffer: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read(address, buffer)
    }

    fn write(&self, address: Linear, data: &[u8]) -> Result<(), MemoryError> {
        (**self).write(address, data)
    }
}

impl<T> GuestMemory for std::sync::Arc<T>
where
    T: GuestMemory + ?Sized,
{
    fn read(&self, address: Linear, buffer: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read(address, buffer)
    }

    fn write(&self, address: Linear, data: &[u8]) -> Result<(), MemoryError> {
        (**self).write(address, data)
    }
}

/// The guest's memory is the host process's own memory.
///
/// Guest code runs in-process, so a guest linear address is a host
/// pointer below 4GB. Only the null page is rejected; every other address
/// is trusted to be mapped.
#[derive(Debug)]
pub struct HostMemory {
    _private: (),
}

impl HostMemory {
    /// Creates a view of the current process's memory.
    ///
    /// # Safety
    ///
    /// Every address later passed to [`GuestMemory::read`] or
    /// [`GuestMemory::write`] (other than the null page) must be mapped
    /// with the corresponding access in the current process.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn check(address: Linear, length: usize) -> Result<(), MemoryError> {
        const NULL_PAGE: u32 = 0x1000;

        if address.0 < NULL_PAGE || (address.0 as usize).checked_add(length).is_none() {
            tracing::trace!(%address, length, "host memory access rejected");
            return Err(MemoryError::Unmapped(address));
        }

        Ok(())
    }
}

impl GuestMemory for HostMemory {
    fn read(&self, address: Linear, buffer: &mut [u8]) -> Result<(), MemoryError> {
        Self::check(address, buffer.len())?;

        // SAFETY: `HostMemory::new` requires the address range to be mapped
        // readable.
        unsafe {
            std::ptr::copy_nonoverlapping(
                address.as_usize() as *const u8,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }

        Ok(())
    }

    fn write(&self, address: Linear, data: &[u8]) -> Result<(), MemoryError> {
        Self::check(address, data.len())?;

        // SAFETY: `HostMemory::new` requires the address range to be mapped
        // writable.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address.as_usize() as *mut u8, data.len());
        }

        Ok(())
    }
}
