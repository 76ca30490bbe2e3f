use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use segvm_arch_x86::{DescriptorFlags, SegmentDescriptor};

/// Lock-free mirror of the descriptor slots.
///
/// Writers update it while holding the table lock, after the authoritative
/// slot. Readers never lock. A reader racing a writer may observe a
/// descriptor half-way through an update; each field is individually
/// consistent.
pub(crate) struct Shadow {
    base: Box<[AtomicU32]>,
    limit: Box<[AtomicU32]>,
    flags: Box<[AtomicU8]>,
}

impl Shadow {
    pub fn new(size: usize) -> Self {
        Self {
            base: (0..size).map(|_| AtomicU32::new(0)).collect(),
            limit: (0..size).map(|_| AtomicU32::new(0)).collect(),
            flags: (0..size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Publishes a slot. The flags are stored last so a reader that sees
    /// the allocated bit also sees the base and limit.
    pub fn publish(&self, index: usize, descriptor: &SegmentDescriptor) {
        self.base[index].store(descriptor.base, Ordering::Release);
        self.limit[index].store(descriptor.limit, Ordering::Release);
        self.flags[index].store(descriptor.flags.bits(), Ordering::Release);
    }

    pub fn base(&self, index: usize) -> u32 {
        self.base[index].load(Ordering::Acquire)
    }

    pub fn limit(&self, index: usize) -> u32 {
        self.limit[index].load(Ordering::Acquire)
    }

    pub fn flags(&self, index: usize) -> DescriptorFlags {
        DescriptorFlags::from_bits_retain(self.flags[index].load(Ordering::Acquire))
    }

    pub fn descriptor(&self, index: usize) -> SegmentDescriptor {
        SegmentDescriptor {
            flags: self.flags(index),
            base: self.base(index),
            limit: self.limit(index),
        }
    }
}
