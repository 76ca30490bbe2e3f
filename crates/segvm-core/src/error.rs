use crate::Linear;

/// An error that can occur in the segvm core.
#[derive(thiserror::Error, Debug)]
pub enum SegvmError {
    /// A host primitive (signal installation, LDT update, stack mapping)
    /// failed.
    #[error(transparent)]
    Host(#[from] std::io::Error),

    /// Guest memory could not be accessed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The address does not fit into the guest's 32-bit linear space.
    #[error("Address {0:#x} is outside the 32-bit linear space")]
    AddressOutOfRange(u64),

    /// Every descriptor slot is in use.
    #[error("Descriptor table exhausted")]
    TableExhausted,

    /// The selector does not name an allocated descriptor.
    #[error("Invalid selector {0:#06x}")]
    InvalidSelector(u16),

    /// The fault handlers are already installed.
    #[error("Fault handlers already installed")]
    AlreadyInstalled,

    /// The calling thread has no per-thread fault state.
    #[error("Thread is not attached")]
    ThreadNotAttached,

    /// Operation not supported on this host.
    #[error("Operation not supported.")]
    NotSupported,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// An error raised while accessing guest memory.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The linear address is not backed by memory.
    #[error("Linear address {0} is not mapped")]
    Unmapped(Linear),
}
