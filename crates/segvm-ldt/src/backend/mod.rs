//! Host side of the descriptor table.

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod linux;

use segvm_arch_x86::{SegmentDescriptor, Selector};
use segvm_core::SegvmError;

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use self::linux::LinuxLdt;

/// Propagates descriptor changes to the host.
///
/// The table calls [`write`] with the table lock held, once per changed
/// slot, after the software copy has been updated.
///
/// [`write`]: DescriptorBackend::write
pub trait DescriptorBackend: Send + Sync {
    /// Installs (or clears, for a descriptor without the allocated flag)
    /// slot `index` in the host's descriptor table.
    fn write(&self, index: u16, descriptor: &SegmentDescriptor) -> Result<(), SegvmError>;

    /// Allocates a native per-thread data segment covering 4KB at `base`.
    ///
    /// Returns `None` when the host has no such primitive, in which case
    /// the table falls back to an ordinary slot.
    fn allocate_per_thread_area(&self, base: u32) -> Option<Selector> {
        let _ = base;
        None
    }
}

/// A backend for hosts without a descriptor table.
///
/// Descriptors only exist in the software table, which is enough for the
/// emulator and for every translation query.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareBackend;

impl DescriptorBackend for SoftwareBackend {
    fn write(&self, _index: u16, _descriptor: &SegmentDescriptor) -> Result<(), SegvmError> {
        Ok(())
    }
}

impl<T> DescriptorBackend for std::sync::Arc<T>
where
    T: DescriptorBackend + ?Sized,
{
    fn write(&self, index: u16, descriptor: &SegmentDescriptor) -> Result<(), SegvmError> {
        (**self).write(index, descriptor)
    }

    fn allocate_per_thread_area(&self, base: u32) -> Option<Selector> {
        (**self).allocate_per_thread_area(base)
    }
}
