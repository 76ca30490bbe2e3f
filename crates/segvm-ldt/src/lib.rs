//! Software local descriptor table.
//!
//! A process-wide table of segment descriptors standing in for the
//! segmented memory model of 16-bit guest code. Descriptors are allocated
//! in runs of 64KB windows, mirrored into a lock-free shadow for the fault
//! path, and pushed to the host's descriptor table through a
//! [`DescriptorBackend`].
//!
//! # Examples
//!
//! ```
//! use segvm_arch_x86::DescriptorFlags;
//! use segvm_core::Config;
//! use segvm_ldt::{SelectorTable, SoftwareBackend};
//!
//! let table = SelectorTable::new(&Config::default(), SoftwareBackend);
//!
//! let id = table.allocate_run(2).unwrap();
//! table.set_descriptor(id, 0x10_0000, 0x18000, DescriptorFlags::DATA).unwrap();
//!
//! assert_eq!(table.map_segmented_to_linear(id, 0x10), Some(0x10_0010));
//! assert!(table.validate_range(id, 0, 0x10000, true));
//! assert_eq!(table.free(id), 2);
//! ```

mod backend;
mod selector_id;
mod shadow;
mod table;
mod thread;

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use self::backend::LinuxLdt;
pub use self::{
    backend::{DescriptorBackend, SoftwareBackend},
    selector_id::SelectorId,
    table::SelectorTable,
    thread::thread_selector,
};
