//! Host fault delivery.
//!
//! On Linux x86-64 synchronous faults arrive as POSIX signals on a
//! per-thread alternate stack. Other hosts compile the portable parts of
//! the crate only; [`install`] reports [`SegvmError::NotSupported`].
//!
//! [`SegvmError::NotSupported`]: segvm_core::SegvmError::NotSupported

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use self::linux::{ThreadState, install};

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod unsupported {
    use segvm_core::{Config, SegvmError};

    use crate::FaultDispatcher;

    /// Per-thread fault state. Not available on this host.
    #[derive(Debug)]
    pub struct ThreadState(());

    impl ThreadState {
        /// Attaches the calling thread.
        pub fn attach(_config: &Config) -> Result<Self, SegvmError> {
            Err(SegvmError::NotSupported)
        }
    }

    /// Installs the process-wide fault handlers.
    pub fn install(_dispatcher: FaultDispatcher<'static>, _config: &Config) -> Result<(), SegvmError> {
        Err(SegvmError::NotSupported)
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub use self::unsupported::{ThreadState, install};
