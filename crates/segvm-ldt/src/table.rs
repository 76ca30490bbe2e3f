use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;
use segvm_arch_x86::{DescriptorFlags, SEGMENT_WINDOW, SegmentDescriptor, Selector};
use segvm_core::{Config, SegvmError};

use crate::{
    DescriptorBackend, SelectorId,
    shadow::Shadow,
    thread::{forget_thread_selector, set_thread_selector},
};

/// Size of the descriptor behind a per-thread slot.
const PER_THREAD_SIZE: u32 = 0x1000;

/// One descriptor slot.
#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    descriptor: SegmentDescriptor,

    /// Length of the run starting at this slot; 0 unless this slot heads
    /// a run.
    run: u16,
}

/// Cached binding of a 64KB window of the linear space to a selector.
#[derive(Debug, Clone, Copy)]
struct MappingEntry {
    /// Linear base of the window.
    base: u32,

    /// Data selector covering the window.
    selector: SelectorId,

    /// Number of outstanding mappings. The entry is recycled at 0.
    count: u32,
}

/// State guarded by the table lock.
#[derive(Debug)]
struct TableState {
    slots: Vec<Slot>,
    mappings: Vec<MappingEntry>,
}

/// Number of 64KB slots needed for `size` bytes. At least one.
fn slot_count(size: u32) -> usize {
    size.div_ceil(SEGMENT_WINDOW).max(1) as usize
}

/// Process-wide table of software segment descriptors.
///
/// Mutations take a single lock, which also guards the list of mapping
/// entries. Translation and validation queries read a lock-free shadow
/// copy and are safe to call from any thread at any time.
pub struct SelectorTable {
    state: Mutex<TableState>,
    shadow: Shadow,
    backend: Box<dyn DescriptorBackend>,
    first_allocatable: usize,
}

static GLOBAL: OnceCell<SelectorTable> = OnceCell::new();

impl SelectorTable {
    /// Creates a table with `config.table_size` slots.
    pub fn new(config: &Config, backend: impl DescriptorBackend + 'static) -> Self {
        let size = config.table_size.min(8192);
        let first_allocatable = config.first_allocatable.clamp(1, size);

        Self {
            state: Mutex::new(TableState {
                slots: vec![Slot::default(); size],
                mappings: Vec::new(),
            }),
            shadow: Shadow::new(size),
            backend: Box::new(backend),
            first_allocatable,
        }
    }

    /// Creates the process-wide table.
    ///
    /// Fails with [`SegvmError::AlreadyInstalled`] on a second call.
    pub fn init(
        config: &Config,
        backend: impl DescriptorBackend + 'static,
    ) -> Result<&'static Self, SegvmError> {
        let mut created = false;
        let table = GLOBAL.get_or_init(|| {
            created = true;
            Self::new(config, backend)
        });

        if !created {
            return Err(SegvmError::AlreadyInstalled);
        }

        tracing::debug!(
            size = table.len(),
            first_allocatable = table.first_allocatable,
            "selector table initialized"
        );

        Ok(table)
    }

    /// Returns the process-wide table, if initialized.
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.shadow.len()
    }

    /// Checks whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the index of the first slot handed out by allocation.
    pub fn first_allocatable(&self) -> usize {
        self.first_allocatable
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the slot index of an LDT selector inside the table.
    fn slot_index(&self, selector: Selector) -> Option<usize> {
        if !selector.is_ldt() {
            return None;
        }

        let index = selector.index() as usize;
        (index < self.len()).then_some(index)
    }

    /// Updates one slot: software copy, shadow, then host.
    fn store(
        &self,
        state: &mut TableState,
        index: usize,
        descriptor: SegmentDescriptor,
    ) -> Result<(), SegvmError> {
        state.slots[index].descriptor = descriptor;
        self.shadow.publish(index, &descriptor);
        self.backend.write(index as u16, &descriptor)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Allocation
    ///////////////////////////////////////////////////////////////////////////

    /// Allocates `count` consecutive free slots.
    ///
    /// The slots are marked allocated with an empty descriptor; call
    /// [`set_descriptor`] to give them a base and limit. Returns `None`
    /// when `count` is zero or no large enough run is free.
    ///
    /// [`set_descriptor`]: Self::set_descriptor
    pub fn allocate_run(&self, count: usize) -> Option<SelectorId> {
        let mut state = self.lock();
        self.allocate_run_locked(&mut state, count)
    }

    fn allocate_run_locked(&self, state: &mut TableState, count: usize) -> Option<SelectorId> {
        if count == 0 || count > self.len() {
            return None;
        }

        let mut start = self.first_allocatable;
        let mut found = None;
        for index in self.first_allocatable..self.len() {
            if state.slots[index]
                .descriptor
                .flags
                .contains(DescriptorFlags::ALLOCATED)
            {
                start = index + 1;
                continue;
            }

            if index + 1 - start == count {
                found = Some(start);
                break;
            }
        }

        let Some(start) = found else {
            tracing::warn!(count, "selector table exhausted");
            return None;
        };

        for index in start..start + count {
            let descriptor = SegmentDescriptor {
                flags: DescriptorFlags::ALLOCATED,
                ..Default::default()
            };

            state.slots[index] = Slot {
                descriptor,
                run: 0,
            };
            self.shadow.publish(index, &descriptor);
        }

        state.slots[start].run = count as u16;
        Some(SelectorId::from_index(start as u16))
    }

    /// Sets the descriptors of a run.
    ///
    /// Writes `ceil(size / 64K)` slots (at least one): slot 0 covers
    /// `base` with limit `size - 1`; each following slot's base is 64K
    /// further and its limit 64K smaller. Slots past the end of the
    /// allocated run are never written.
    pub fn set_descriptor(
        &self,
        id: SelectorId,
        base: u32,
        size: u32,
        flags: DescriptorFlags,
    ) -> Result<(), SegvmError> {
        let mut state = self.lock();
        self.set_descriptor_locked(&mut state, id, base, size, flags)
    }

    fn set_descriptor_locked(
        &self,
        state: &mut TableState,
        id: SelectorId,
        base: u32,
        size: u32,
        flags: DescriptorFlags,
    ) -> Result<(), SegvmError> {
        let index = match self.slot_index(id.selector()) {
            Some(index) if state.slots[index].run > 0 => index,
            _ => return Err(SegvmError::InvalidSelector(id.raw())),
        };

        let run = state.slots[index].run;
        let count = slot_count(size).min(run as usize);
        let flags = flags | DescriptorFlags::ALLOCATED;

        let mut descriptor = SegmentDescriptor::new(base, size, flags);
        for n in 0..count {
            self.store(state, index + n, descriptor)?;

            descriptor.base = descriptor.base.wrapping_add(SEGMENT_WINDOW);
            descriptor.limit = descriptor.limit.saturating_sub(SEGMENT_WINDOW);
        }

        tracing::trace!(%id, base, size, count, "descriptor set");
        Ok(())
    }

    /// Frees the run starting at `id`.
    ///
    /// Zeroes every slot of the run, forgets the calling thread's cached
    /// per-thread selector if it was one of them and drops mapping entries
    /// bound to them. Returns the run length, or 0 when `id` does not head
    /// an allocated run.
    pub fn free(&self, id: SelectorId) -> usize {
        let mut state = self.lock();
        self.free_locked(&mut state, id)
    }

    fn free_locked(&self, state: &mut TableState, id: SelectorId) -> usize {
        let Some(index) = self.slot_index(id.selector()) else {
            return 0;
        };

        let run = state.slots[index].run;
        if run == 0 {
            if state.slots[index]
                .descriptor
                .flags
                .contains(DescriptorFlags::ALLOCATED)
            {
                tracing::warn!(%id, "free of a slot inside a run");
            }
            return 0;
        }

        self.release_slots(state, index, run);
        run as usize
    }

    /// Zeroes `count` slots starting at `index`.
    fn release_slots(&self, state: &mut TableState, index: usize, count: u16) {
        for n in index..index + count as usize {
            state.slots[n].run = 0;
            if let Err(err) = self.store(state, n, SegmentDescriptor::default()) {
                tracing::error!(index = n, %err, "failed to clear descriptor");
            }
        }

        forget_thread_selector(index as u16, count);

        let first = index as u16;
        state.mappings.retain(|entry| {
            let slot = entry.selector.index();
            !(slot >= first && slot - first < count)
        });
    }

    /// Resizes the run starting at `id` to cover `new_size` bytes at
    /// `base`.
    ///
    /// Shrinking frees the trailing slots. Growing extends the run in
    /// place when the following slots are free, and otherwise moves it to
    /// a new run. The descriptor flags are kept. Returns the (possibly
    /// new) handle, or `None` when `id` is not allocated, `new_size` needs
    /// more slots than the table has or no run is free. On `None` the
    /// original run is left untouched.
    pub fn reallocate(&self, id: SelectorId, base: u32, new_size: u32) -> Option<SelectorId> {
        let mut state = self.lock();

        let index = match self.slot_index(id.selector()) {
            Some(index) if state.slots[index].run > 0 => index,
            _ => return None,
        };

        let old_count = state.slots[index].run as usize;
        let new_count = slot_count(new_size);
        let flags = state.slots[index].descriptor.flags;

        if new_count > self.len() {
            tracing::warn!(%id, new_size, "reallocation larger than the table");
            return None;
        }

        let mut id = id;
        if new_count > old_count {
            let end = index + new_count;
            let free = end <= self.len()
                && state.slots[index + old_count..end]
                    .iter()
                    .all(|slot| !slot.descriptor.flags.contains(DescriptorFlags::ALLOCATED));

            if free {
                for n in index + old_count..end {
                    let descriptor = SegmentDescriptor {
                        flags: DescriptorFlags::ALLOCATED,
                        ..Default::default()
                    };

                    state.slots[n].descriptor = descriptor;
                    self.shadow.publish(n, &descriptor);
                }

                state.slots[index].run = new_count as u16;
            }
            else {
                let old = id;
                id = self.allocate_run_locked(&mut state, new_count)?;
                self.free_locked(&mut state, old);
                tracing::debug!(%old, new = %id, count = new_count, "run moved");
            }
        }
        else if new_count < old_count {
            self.release_slots(
                &mut state,
                index + new_count,
                (old_count - new_count) as u16,
            );
            state.slots[index].run = new_count as u16;
        }

        match self.set_descriptor_locked(&mut state, id, base, new_size, flags) {
            Ok(()) => Some(id),
            Err(err) => {
                tracing::error!(%id, %err, "failed to set reallocated descriptor");
                None
            }
        }
    }

    /// Allocates a 4KB 32-bit data segment at `base` for the calling
    /// thread.
    ///
    /// Prefers a native per-thread area of the host; falls back to a
    /// table slot. The result is remembered in the thread's fast
    /// segment-register cache (see [`thread_selector`]).
    ///
    /// [`thread_selector`]: crate::thread_selector
    pub fn allocate_per_thread_slot(&self, base: u32) -> Option<SelectorId> {
        if let Some(selector) = self.backend.allocate_per_thread_area(base) {
            set_thread_selector(selector);
            return Some(SelectorId::from(selector));
        }

        let mut state = self.lock();
        let id = self.allocate_run_locked(&mut state, 1)?;
        let flags = DescriptorFlags::DATA | DescriptorFlags::BIG;
        if let Err(err) = self.set_descriptor_locked(&mut state, id, base, PER_THREAD_SIZE, flags) {
            tracing::error!(%id, %err, "failed to set per-thread descriptor");
            self.free_locked(&mut state, id);
            return None;
        }

        set_thread_selector(id.selector());
        Some(id)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Mapping cache
    ///////////////////////////////////////////////////////////////////////////

    /// Gives a linear address a segmented form.
    ///
    /// The address is rounded down to its 64KB window. A mapping entry
    /// for the window is reused (and its count incremented); otherwise an
    /// entry whose count dropped to zero is recycled for the window, or a
    /// new one is created with a fresh 64KB data selector. Returns the
    /// selector and the offset of `ptr` inside the window.
    pub fn map_linear_to_segmented(&self, ptr: u32) -> Option<(SelectorId, u16)> {
        let base = ptr & !(SEGMENT_WINDOW - 1);
        let offset = (ptr - base) as u16;

        let mut state = self.lock();

        if let Some(entry) = state.mappings.iter_mut().find(|entry| entry.base == base) {
            entry.count += 1;
            return Some((entry.selector, offset));
        }

        let recycled = state.mappings.iter().position(|entry| entry.count == 0);
        let selector = match recycled {
            Some(position) => {
                let selector = state.mappings[position].selector;
                tracing::debug!(%selector, base, "recycling mapping entry");
                state.mappings.remove(position);
                selector
            }
            None => self.allocate_run_locked(&mut state, 1)?,
        };

        if let Err(err) =
            self.set_descriptor_locked(&mut state, selector, base, SEGMENT_WINDOW, DescriptorFlags::DATA)
        {
            tracing::error!(%selector, %err, "failed to map window");
            self.free_locked(&mut state, selector);
            return None;
        }

        state.mappings.push(MappingEntry {
            base,
            selector,
            count: 1,
        });

        Some((selector, offset))
    }

    /// Releases one mapping obtained from [`map_linear_to_segmented`].
    ///
    /// The selector stays bound to its window for reuse. An unknown
    /// selector, or one whose count is already zero, is ignored with a
    /// warning.
    ///
    /// [`map_linear_to_segmented`]: Self::map_linear_to_segmented
    pub fn unmap_segmented(&self, selector: impl Into<Selector>) {
        let selector = selector.into();
        let mut state = self.lock();

        let Some(entry) = state
            .mappings
            .iter_mut()
            .find(|entry| entry.selector.selector() == selector)
        else {
            tracing::warn!(%selector, "unmap of an unknown selector");
            return;
        };

        if entry.count == 0 {
            tracing::warn!(%selector, "unmap of an unreferenced selector");
            return;
        }

        entry.count -= 1;
    }

    /// Returns the reference count of the mapping entry bound to
    /// `selector`.
    pub fn mapping_count(&self, selector: impl Into<Selector>) -> Option<u32> {
        let selector = selector.into();
        self.lock()
            .mappings
            .iter()
            .find(|entry| entry.selector.selector() == selector)
            .map(|entry| entry.count)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Lock-free queries
    ///////////////////////////////////////////////////////////////////////////

    /// Translates `selector:offset` to a linear address.
    ///
    /// System selectors map flat. Returns `None` for an unallocated slot.
    /// The offset is not checked against the limit.
    pub fn map_segmented_to_linear(
        &self,
        selector: impl Into<Selector>,
        offset: u32,
    ) -> Option<u32> {
        let selector = selector.into();
        if self.is_system(selector) {
            return Some(offset);
        }

        let index = self.allocated_index(selector)?;
        Some(self.shadow.base(index).wrapping_add(offset))
    }

    /// Checks whether `selector:offset` is a valid code address: the slot
    /// is an allocated code segment and `offset` is within its limit.
    pub fn validate_code_pointer(&self, selector: impl Into<Selector>, offset: u32) -> bool {
        let Some(index) = self.allocated_index(selector.into()) else {
            return false;
        };

        self.shadow.flags(index).is_code() && offset <= self.shadow.limit(index)
    }

    /// Checks whether `length` bytes at `selector:offset` can be read, or
    /// written when `for_write` is set.
    ///
    /// Writes need a writable data segment; the accessed and expand-down
    /// bits do not matter. Reads reject execute-only code. A zero length
    /// only checks the segment type.
    pub fn validate_range(
        &self,
        selector: impl Into<Selector>,
        offset: u32,
        length: u32,
        for_write: bool,
    ) -> bool {
        let Some(index) = self.allocated_index(selector.into()) else {
            return false;
        };

        let flags = self.shadow.flags(index);
        let typed = match for_write {
            true => flags.is_writable_data(),
            false => flags.is_readable(),
        };

        if !typed {
            return false;
        }

        if length == 0 {
            return true;
        }

        match offset.checked_add(length - 1) {
            Some(last) => last <= self.shadow.limit(index),
            None => false,
        }
    }

    fn allocated_index(&self, selector: Selector) -> Option<usize> {
        let index = self.slot_index(selector)?;
        self.shadow
            .flags(index)
            .contains(DescriptorFlags::ALLOCATED)
            .then_some(index)
    }

    /// Returns the descriptor of an allocated slot.
    pub fn descriptor(&self, selector: impl Into<Selector>) -> Option<SegmentDescriptor> {
        let index = self.allocated_index(selector.into())?;
        Some(self.shadow.descriptor(index))
    }

    /// Returns the base of an allocated slot.
    pub fn base(&self, selector: impl Into<Selector>) -> Option<u32> {
        let index = self.allocated_index(selector.into())?;
        Some(self.shadow.base(index))
    }

    /// Returns the limit of an allocated slot.
    pub fn limit(&self, selector: impl Into<Selector>) -> Option<u32> {
        let index = self.allocated_index(selector.into())?;
        Some(self.shadow.limit(index))
    }

    /// Returns the flags of an allocated slot.
    pub fn flags(&self, selector: impl Into<Selector>) -> Option<DescriptorFlags> {
        let index = self.allocated_index(selector.into())?;
        Some(self.shadow.flags(index))
    }

    /// Checks whether the selector names an allocated slot.
    pub fn is_allocated(&self, selector: impl Into<Selector>) -> bool {
        self.allocated_index(selector.into()).is_some()
    }

    /// Checks whether the selector names an allocated 32-bit slot.
    pub fn is_32bit(&self, selector: impl Into<Selector>) -> bool {
        self.flags(selector).is_some_and(DescriptorFlags::is_32bit)
    }

    /// Checks whether the selector belongs to the system: a GDT selector
    /// or an LDT selector in the reserved low range. System selectors
    /// describe the flat 32-bit address space.
    pub fn is_system(&self, selector: impl Into<Selector>) -> bool {
        let selector = selector.into();
        !selector.is_ldt() || (selector.index() as usize) < self.first_allocatable
    }
}

impl std::fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SelectorTable")
            .field("size", &self.len())
            .field("first_allocatable", &self.first_allocatable)
            .finish_non_exhaustive()
    }
}
