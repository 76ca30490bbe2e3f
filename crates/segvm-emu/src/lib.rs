//! Instruction emulator.
//!
//! Interprets the small set of instructions 16-bit guest code executes
//! that fault on a flat host: segment register loads (`pop sreg`, `lds`
//! and friends, `mov sreg`), port I/O, software interrupts and `iret`,
//! interrupt flag changes, and moves from and to control and debug
//! registers. Everything else is left to the structured exception chain.
//!
//! Segment register loads go through [`Machine::substitute_selector`],
//! which maps the real-mode BIOS data segment `0x40` to a protected-mode
//! selector.

mod decode;
mod emulator;
mod error;
mod machine;
mod privileged;
mod tick;

pub use self::{
    decode::{
        Decoded, Instruction, MemoryOperand, OperandSize, Port, Prefixes, RegisterOrMemory,
        Repeat, decode,
    },
    emulator::{Emulator, MAX_INSTRUCTION_LENGTH},
    error::EmulationError,
    machine::{BIOS_DATA_SELECTOR, IdtShadow, InterruptVectorTable, Machine, VECTOR_COUNT},
    privileged::{is_privileged_instruction, is_segment_load},
    tick::{BIOS_TICK_OFFSET, BiosTickTimer, NoTicks, TickSource},
};

#[cfg(test)]
mod decode_tests;
#[cfg(test)]
mod emulator_tests;
