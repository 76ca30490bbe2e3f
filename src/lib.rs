//! Trap-and-emulate core for running segmented 16/32-bit guest code on a
//! flat host.
//!
//! Guest code that loads segment registers, talks to I/O ports or executes
//! privileged instructions faults on a flat host. This crate ties together
//! the pieces that let such code run anyway:
//!
//! - [`ldt`]: the software descriptor table giving guest selectors their
//!   base and limit;
//! - [`emu`]: the emulator for the faulting instructions;
//! - [`dispatch`]: fault classification, the resolution policy and the
//!   host signal plumbing.
//!
//! The shared vocabulary lives at the crate root and in [`arch`].

pub use segvm_core::*;

/// x86 architecture definitions.
pub mod arch {
    pub use segvm_arch_x86::*;
}

/// Software local descriptor table.
#[cfg(feature = "ldt")]
pub mod ldt {
    pub use segvm_ldt::*;
}

/// Instruction emulator.
#[cfg(feature = "emu")]
pub mod emu {
    pub use segvm_emu::*;
}

/// Fault dispatch.
#[cfg(feature = "dispatch")]
pub mod dispatch {
    pub use segvm_dispatch::*;
}
