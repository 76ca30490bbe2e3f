use std::sync::Arc;

use segvm_arch_x86::{DebugRegisterSet, GuestCpuContext};
use segvm_core::{ExceptionRecord, Resolution};

/// The structured exception chain of the guest runtime.
///
/// Receives every fault the dispatcher cannot resolve locally.
pub trait ExceptionChain {
    /// Offers the exception to the guest's handlers. A handler may modify
    /// the context before asking for execution to continue.
    fn escalate(&self, record: &ExceptionRecord, ctx: &mut GuestCpuContext) -> Resolution;
}

impl<T> ExceptionChain for &T
where
    T: ExceptionChain + ?Sized,
{
    fn escalate(&self, record: &ExceptionRecord, ctx: &mut GuestCpuContext) -> Resolution {
        (**self).escalate(record, ctx)
    }
}

impl<T> ExceptionChain for Arc<T>
where
    T: ExceptionChain + ?Sized,
{
    fn escalate(&self, record: &ExceptionRecord, ctx: &mut GuestCpuContext) -> Resolution {
        (**self).escalate(record, ctx)
    }
}

/// An exception chain without handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandlers;

impl ExceptionChain for NoHandlers {
    fn escalate(&self, _record: &ExceptionRecord, _ctx: &mut GuestCpuContext) -> Resolution {
        Resolution::ContinueSearch
    }
}

/// Access to the calling thread's hardware debug registers.
pub trait DebugRegisters {
    /// Reads the debug registers.
    fn get(&self) -> DebugRegisterSet;

    /// Writes the debug registers.
    fn set(&self, registers: &DebugRegisterSet);
}

impl<T> DebugRegisters for &T
where
    T: DebugRegisters + ?Sized,
{
    fn get(&self) -> DebugRegisterSet {
        (**self).get()
    }

    fn set(&self, registers: &DebugRegisterSet) {
        (**self).set(registers)
    }
}

impl<T> DebugRegisters for Arc<T>
where
    T: DebugRegisters + ?Sized,
{
    fn get(&self) -> DebugRegisterSet {
        (**self).get()
    }

    fn set(&self, registers: &DebugRegisterSet) {
        (**self).set(registers)
    }
}

/// Debug registers of a host that does not expose them. Reads return
/// zeroes, writes are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugRegisters;

impl DebugRegisters for NoDebugRegisters {
    fn get(&self) -> DebugRegisterSet {
        DebugRegisterSet::default()
    }

    fn set(&self, _registers: &DebugRegisterSet) {}
}
