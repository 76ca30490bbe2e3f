use segvm_arch_x86::{DescriptorFlags, SegmentDescriptor, Selector};
use segvm_core::SegvmError;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::DescriptorBackend;

/// `struct user_desc` of `modify_ldt(2)` and `set_thread_area(2)`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable)]
struct UserDesc {
    entry_number: u32,
    base_addr: u32,
    limit: u32,
    flags: u32,
}

impl UserDesc {
    const SEG_32BIT: u32 = 1 << 0;
    const CONTENTS_SHIFT: u32 = 1;
    const READ_EXEC_ONLY: u32 = 1 << 3;
    const LIMIT_IN_PAGES: u32 = 1 << 4;
    const SEG_NOT_PRESENT: u32 = 1 << 5;
    const USEABLE: u32 = 1 << 6;

    /// Contents field values.
    const CONTENTS_DATA: u32 = 0;
    const CONTENTS_STACK: u32 = 1;
    const CONTENTS_CODE: u32 = 2;

    /// An empty entry; writing it clears the slot.
    fn empty(entry_number: u32) -> Self {
        Self {
            entry_number,
            flags: Self::READ_EXEC_ONLY | Self::SEG_NOT_PRESENT,
            ..Default::default()
        }
    }

    fn new(entry_number: u32, descriptor: &SegmentDescriptor) -> Self {
        let flags = descriptor.flags;
        if !flags.contains(DescriptorFlags::ALLOCATED) {
            return Self::empty(entry_number);
        }

        let (contents, read_exec_only) = if flags.is_code() {
            let contents = match flags.contains(DescriptorFlags::EXPAND_DOWN) {
                true => Self::CONTENTS_CODE | 1,
                false => Self::CONTENTS_CODE,
            };
            (contents, !flags.contains(DescriptorFlags::WRITABLE))
        }
        else {
            let contents = match flags.contains(DescriptorFlags::EXPAND_DOWN) {
                true => Self::CONTENTS_STACK,
                false => Self::CONTENTS_DATA,
            };
            (contents, !flags.contains(DescriptorFlags::WRITABLE))
        };

        let mut limit = descriptor.limit;
        let mut bits = (contents << Self::CONTENTS_SHIFT) | Self::USEABLE;
        if limit > 0xfffff {
            limit >>= 12;
            bits |= Self::LIMIT_IN_PAGES;
        }
        if flags.is_32bit() {
            bits |= Self::SEG_32BIT;
        }
        if read_exec_only {
            bits |= Self::READ_EXEC_ONLY;
        }

        Self {
            entry_number,
            base_addr: descriptor.base,
            limit,
            flags: bits,
        }
    }
}

/// The process's local descriptor table, maintained with `modify_ldt(2)`.
///
/// Native per-thread areas come from `set_thread_area(2)` TLS slots in the
/// GDT.
#[derive(Debug, Default)]
pub struct LinuxLdt {
    _private: (),
}

impl LinuxLdt {
    /// `modify_ldt` function writing one entry (new-style semantics).
    const WRITE_LDT: libc::c_long = 0x11;

    /// Creates the backend.
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl DescriptorBackend for LinuxLdt {
    fn write(&self, index: u16, descriptor: &SegmentDescriptor) -> Result<(), SegvmError> {
        let desc = UserDesc::new(index as u32, descriptor);
        let bytes = desc.as_bytes();

        // SAFETY: `bytes` is a valid `struct user_desc` for the duration of
        // the call.
        let result = unsafe {
            libc::syscall(
                libc::SYS_modify_ldt,
                Self::WRITE_LDT,
                bytes.as_ptr(),
                bytes.len(),
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            tracing::error!(index, %err, "modify_ldt failed");
            return Err(SegvmError::Host(err));
        }

        Ok(())
    }

    fn allocate_per_thread_area(&self, base: u32) -> Option<Selector> {
        let descriptor = SegmentDescriptor::new(
            base,
            0x1000,
            DescriptorFlags::DATA | DescriptorFlags::BIG | DescriptorFlags::ALLOCATED,
        );

        let mut desc = UserDesc::new(u32::MAX, &descriptor);

        // SAFETY: `desc` is a valid `struct user_desc`; the kernel writes
        // the chosen entry number back into it.
        let result = unsafe {
            libc::syscall(
                libc::SYS_set_thread_area,
                desc.as_mut_bytes().as_mut_ptr(),
            )
        };

        if result < 0 {
            tracing::debug!(
                err = %std::io::Error::last_os_error(),
                "no native per-thread area"
            );
            return None;
        }

        Some(Selector(((desc.entry_number as u16) << 3) | 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_desc_encoding() {
        let descriptor = SegmentDescriptor::new(
            0x1234_0000,
            0x20_0000,
            DescriptorFlags::CODE | DescriptorFlags::BIG | DescriptorFlags::ALLOCATED,
        );

        let desc = UserDesc::new(40, &descriptor);
        assert_eq!(desc.entry_number, 40);
        assert_eq!(desc.base_addr, 0x1234_0000);
        assert_eq!(desc.limit, 0x1ff);
        assert_eq!(
            desc.flags,
            UserDesc::SEG_32BIT
                | (UserDesc::CONTENTS_CODE << UserDesc::CONTENTS_SHIFT)
                | UserDesc::LIMIT_IN_PAGES
                | UserDesc::USEABLE
        );
    }

    #[test]
    fn free_slot_is_empty() {
        let desc = UserDesc::new(40, &SegmentDescriptor::default());
        assert_eq!(desc.flags, UserDesc::READ_EXEC_ONLY | UserDesc::SEG_NOT_PRESENT);
        assert_eq!(desc.limit, 0);
    }
}
