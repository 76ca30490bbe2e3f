/// Kind of access that caused a memory fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AccessKind {
    /// Data read.
    Read,

    /// Data write.
    Write,

    /// Instruction fetch from a non-executable page.
    Execute,
}

impl AccessKind {
    /// Returns the value stored in the first parameter of an access
    /// violation record.
    pub fn parameter(self) -> u64 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Execute => 8,
        }
    }

    /// Converts the first parameter of an access violation record back.
    pub fn from_parameter(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            8 => Some(Self::Execute),
            _ => None,
        }
    }
}

/// Virtual memory manager of the guest runtime.
///
/// Consulted before an access violation is escalated; it may commit a
/// reserved page, grow a guard region or otherwise repair the fault.
pub trait VirtualMemory {
    /// Attempts to resolve a fault at `address`. Returns `true` when the
    /// faulting instruction can simply be restarted.
    fn try_resolve_fault(&self, address: u64, access: AccessKind) -> bool;
}

impl<T> VirtualMemory for &T
where
    T: VirtualMemory + ?Sized,
{
    fn try_resolve_fault(&self, address: u64, access: AccessKind) -> bool {
        (**self).try_resolve_fault(address, access)
    }
}

impl<T> VirtualMemory for std::sync::Arc<T>
where
    T: VirtualMemory + ?Sized,
{
    fn try_resolve_fault(&self, address: u64, access: AccessKind) -> bool {
        (**self).try_resolve_fault(address, access)
    }
}

/// A virtual memory manager that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVirtualMemory;

impl VirtualMemory for NoVirtualMemory {
    fn try_resolve_fault(&self, _address: u64, _access: AccessKind) -> bool {
        false
    }
}
