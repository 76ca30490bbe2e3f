//! Core segvm functionality.
//!
//! Shared vocabulary of the trap-and-emulate core: linear addresses,
//! exception records, configuration and the traits of the collaborators
//! that live outside the core (guest memory, port I/O devices and the
//! virtual memory manager).

mod config;
mod core;
mod error;
mod exception;
mod memory;
mod port;
mod vm;

pub use self::{
    config::Config,
    core::{Hex, Linear},
    error::{MemoryError, SegvmError},
    exception::{
        ExceptionCode, ExceptionFlags, ExceptionParameters, ExceptionRecord, FloatingPointKind,
        MAX_PARAMETERS, Resolution,
    },
    memory::{GuestMemory, HostMemory},
    port::{NoPorts, PortIo, PortWidth},
    vm::{AccessKind, NoVirtualMemory, VirtualMemory},
};
