use std::sync::{
    Mutex, Once, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use once_cell::sync::OnceCell;
use segvm_arch_x86::{DescriptorFlags, SEGMENT_WINDOW, Selector};
use segvm_core::Config;
use segvm_ldt::{SelectorId, SelectorTable};

use crate::{EmulationError, TickSource};

/// Number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;

/// Size of one entry of the IDT shadow.
const IDT_ENTRY_SIZE: u32 = 8;

/// The selector 16-bit code uses to reach the BIOS data area.
pub const BIOS_DATA_SELECTOR: u16 = 0x40;

/// Software interrupt vector table used by `int n` in 16-bit code.
///
/// Each vector holds a 16:16 far pointer to its handler, or nothing.
#[derive(Debug)]
pub struct InterruptVectorTable {
    vectors: Box<[AtomicU32]>,
}

impl InterruptVectorTable {
    /// Creates a table with every vector unset.
    pub fn new() -> Self {
        Self {
            vectors: (0..VECTOR_COUNT).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Points `vector` at `selector:offset`.
    pub fn set(&self, vector: u8, selector: Selector, offset: u16) {
        let value = ((selector.0 as u32) << 16) | offset as u32;
        self.vectors[vector as usize].store(value, Ordering::Release);
    }

    /// Unsets `vector`.
    pub fn clear(&self, vector: u8) {
        self.vectors[vector as usize].store(0, Ordering::Release);
    }

    /// Returns the handler of `vector`, if set.
    pub fn get(&self, vector: u8) -> Option<(Selector, u16)> {
        let value = self.vectors[vector as usize].load(Ordering::Acquire);
        if value == 0 {
            return None;
        }

        Some((Selector((value >> 16) as u16), value as u16))
    }
}

impl Default for InterruptVectorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthetic interrupt descriptor table shown to guest code.
///
/// `sidt` reports this window instead of the host's table, and string
/// moves touching the window are redirected to this buffer.
#[derive(Debug)]
pub struct IdtShadow {
    base: u32,
    entries: Mutex<Vec<u8>>,
}

impl IdtShadow {
    /// Creates a zeroed shadow at linear address `base`.
    pub fn new(base: u32) -> Self {
        Self {
            base,
            entries: Mutex::new(vec![0; VECTOR_COUNT * IDT_ENTRY_SIZE as usize]),
        }
    }

    /// Linear base of the window.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Limit of the window (size - 1), as `sidt` reports it.
    pub fn limit(&self) -> u16 {
        (VECTOR_COUNT as u32 * IDT_ENTRY_SIZE - 1) as u16
    }

    /// Checks whether `[address, address + length)` lies inside the window.
    pub fn contains(&self, address: u32, length: u32) -> bool {
        let Some(offset) = address.checked_sub(self.base) else {
            return false;
        };

        offset
            .checked_add(length)
            .is_some_and(|end| end <= self.limit() as u32 + 1)
    }

    /// Reads from the window. Returns `false` when the range is outside.
    pub fn read(&self, address: u32, buffer: &mut [u8]) -> bool {
        if !self.contains(address, buffer.len() as u32) {
            return false;
        }

        let offset = (address - self.base) as usize;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.copy_from_slice(&entries[offset..offset + buffer.len()]);
        true
    }

    /// Writes to the window. Returns `false` when the range is outside.
    pub fn write(&self, address: u32, data: &[u8]) -> bool {
        if !self.contains(address, data.len() as u32) {
            return false;
        }

        let offset = (address - self.base) as usize;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries[offset..offset + data.len()].copy_from_slice(data);
        true
    }
}

/// Lazily created BIOS data segment.
struct BiosData {
    base: u32,
    selector: OnceCell<SelectorId>,
    ticks: Box<dyn TickSource>,
    ticking: Once,
}

impl BiosData {
    fn selector(&self, table: &SelectorTable) -> Result<Selector, EmulationError> {
        let id = self.selector.get_or_try_init(|| {
            let id = table
                .allocate_run(1)
                .ok_or(EmulationError::InvalidSelector(BIOS_DATA_SELECTOR))?;

            if let Err(err) = table.set_descriptor(id, self.base, SEGMENT_WINDOW, DescriptorFlags::DATA)
            {
                tracing::error!(%err, "failed to create BIOS data selector");
                table.free(id);
                return Err(EmulationError::InvalidSelector(BIOS_DATA_SELECTOR));
            }

            tracing::debug!(%id, base = self.base, "BIOS data selector created");
            Ok(id)
        })?;

        self.ticking.call_once(|| self.ticks.start());
        Ok(id.selector())
    }
}

/// Process-wide state of the emulated machine: the software interrupt
/// vectors, the IDT shadow and the BIOS data segment.
pub struct Machine {
    vectors: InterruptVectorTable,
    idt: IdtShadow,
    bios: BiosData,
}

impl Machine {
    /// Creates the machine state.
    pub fn new(config: &Config, ticks: impl TickSource + 'static) -> Self {
        Self {
            vectors: InterruptVectorTable::new(),
            idt: IdtShadow::new(config.idt_shadow_base),
            bios: BiosData {
                base: config.bios_data_base,
                selector: OnceCell::new(),
                ticks: Box::new(ticks),
                ticking: Once::new(),
            },
        }
    }

    /// Returns the interrupt vector table.
    pub fn vectors(&self) -> &InterruptVectorTable {
        &self.vectors
    }

    /// Returns the IDT shadow.
    pub fn idt(&self) -> &IdtShadow {
        &self.idt
    }

    /// Returns the BIOS data selector, if it was created.
    pub fn bios_data_selector(&self) -> Option<Selector> {
        self.bios.selector.get().map(|id| id.selector())
    }

    /// Replaces a selector value guest code is about to load into
    /// `segment`.
    ///
    /// Allocated selectors are kept as they are, as is a null selector
    /// when `allow_null` is set. The real-mode BIOS data segment `0x40`
    /// becomes a selector over the BIOS data area, created on first use;
    /// the first such substitution starts the tick source. Anything else
    /// is rejected.
    pub fn substitute_selector(
        &self,
        table: &SelectorTable,
        value: u16,
        allow_null: bool,
    ) -> Result<Selector, EmulationError> {
        let selector = Selector(value);

        if table.is_allocated(selector) {
            return Ok(selector);
        }

        if allow_null && selector.is_null() {
            return Ok(selector);
        }

        if value == BIOS_DATA_SELECTOR {
            return self.bios.selector(table);
        }

        tracing::warn!(%selector, "cannot substitute selector");
        Err(EmulationError::InvalidSelector(value))
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("idt", &self.idt.base())
            .field("bios_data_base", &self.bios.base)
            .field("bios_data_selector", &self.bios_data_selector())
            .finish_non_exhaustive()
    }
}
