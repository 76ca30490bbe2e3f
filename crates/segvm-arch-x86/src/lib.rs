//! x86 architecture definitions.
//!
//! Register and descriptor layouts of the 32-bit (and 16-bit) protected
//! mode guest: selectors, software segment descriptors, EFLAGS, the debug
//! registers, trap vectors and their error codes, and the guest CPU
//! context captured at every fault.

mod cr0;
mod descriptor;
mod dr;
mod eflags;
mod fpu;
mod registers;
mod segment;
mod selector;
mod trap;

pub use self::{
    cr0::Cr0,
    descriptor::{DescriptorFlags, SegmentDescriptor},
    dr::{BREAKPOINT_COUNT, Dr6, Dr7},
    eflags::Eflags,
    fpu::{simd_exception_kind, x87_exception_kind},
    registers::{DebugRegisterSet, Gpr, GuestCpuContext},
    segment::SegmentRegister,
    selector::{DescriptorTable, Selector},
    trap::{PageFaultErrorCode, SelectorErrorCode, TrapVector},
};

/// Size of a page.
pub const PAGE_SIZE: u32 = 0x1000;

/// Size of the addressing window of one 16-bit segment.
pub const SEGMENT_WINDOW: u32 = 0x10000;

/// The `int3` instruction.
pub const BREAKPOINT: &[u8] = &[0xcc];

#[cfg(test)]
mod arch_tests;
