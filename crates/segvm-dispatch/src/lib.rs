//! Fault dispatch.
//!
//! Turns the synchronous faults of guest threads into exception records
//! and decides their fate. Handling is split in two phases:
//!
//! - **capture and classify** run inside the host's fault handler: the
//!   native state is copied into a [`NativeFault`] and [`classify`]
//!   produces the [`ExceptionRecord`], without allocating, locking or
//!   logging;
//! - **raise** runs on the faulting thread once the handler returned:
//!   [`FaultDispatcher::raise`] tries the local recovery paths and
//!   escalates everything else to the guest's [`ExceptionChain`].
//!
//! [`install`] and [`ThreadState::attach`] wire the two phases to the
//! host's signals on Linux x86-64.
//!
//! [`ExceptionRecord`]: segvm_core::ExceptionRecord

mod chain;
mod dispatcher;
mod fault;
mod host;

pub use self::{
    chain::{DebugRegisters, ExceptionChain, NoDebugRegisters, NoHandlers},
    dispatcher::FaultDispatcher,
    fault::{NO_SELECTOR, NativeFault, classify, is_known_trap},
    host::{ThreadState, install},
};

#[cfg(test)]
mod classify_tests;
