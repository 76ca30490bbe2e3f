use serde::{Deserialize, Serialize};

/// Configuration of the segvm core.
///
/// All fields have defaults matching a conventional 16-bit runtime. The
/// type deserializes from any `serde` format, so an embedding runtime can
/// keep it in its own configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of descriptor slots in the selector table.
    pub table_size: usize,

    /// Index of the first slot handed out by allocation. Lower slots are
    /// reserved for the system.
    pub first_allocatable: usize,

    /// Linear base of the BIOS data area that selector `0x40` aliases.
    pub bios_data_base: u32,

    /// Linear base of the synthetic interrupt descriptor table window.
    pub idt_shadow_base: u32,

    /// Size of the per-thread alternate signal stack. Must be a power of
    /// two.
    pub signal_stack_size: usize,

    /// Size of the per-thread scratch stack used when the faulting stack
    /// is a 16-bit one.
    pub scratch_stack_size: usize,

    /// Signal used to resume a resolved context. `None` picks `SIGUSR2`.
    pub resume_signal: Option<i32>,

    /// Clear a stray EFLAGS.AC instead of raising a misalignment
    /// exception.
    pub clear_stray_alignment_check: bool,

    /// Period of the BIOS tick source in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_size: 8192,
            first_allocatable: 32,
            bios_data_base: 0x400,
            idt_shadow_base: 0xffff_e000,
            signal_stack_size: 0x10000,
            scratch_stack_size: 0x10000,
            resume_signal: None,
            clear_stray_alignment_check: true,
            tick_interval_ms: 55,
        }
    }
}

impl Config {
    /// Sets the number of descriptor slots.
    pub fn with_table_size(self, table_size: usize) -> Self {
        Self { table_size, ..self }
    }

    /// Sets the first allocatable slot.
    pub fn with_first_allocatable(self, first_allocatable: usize) -> Self {
        Self {
            first_allocatable,
            ..self
        }
    }

    /// Sets the linear base of the BIOS data area.
    pub fn with_bios_data_base(self, bios_data_base: u32) -> Self {
        Self {
            bios_data_base,
            ..self
        }
    }

    /// Sets the linear base of the synthetic IDT window.
    pub fn with_idt_shadow_base(self, idt_shadow_base: u32) -> Self {
        Self {
            idt_shadow_base,
            ..self
        }
    }

    /// Sets the resume signal.
    pub fn with_resume_signal(self, signal: i32) -> Self {
        Self {
            resume_signal: Some(signal),
            ..self
        }
    }

    /// Enables or disables clearing of a stray EFLAGS.AC.
    pub fn with_clear_stray_alignment_check(self, clear: bool) -> Self {
        Self {
            clear_stray_alignment_check: clear,
            ..self
        }
    }

    /// Sets the BIOS tick period.
    pub fn with_tick_interval_ms(self, tick_interval_ms: u64) -> Self {
        Self {
            tick_interval_ms,
            ..self
        }
    }
}
