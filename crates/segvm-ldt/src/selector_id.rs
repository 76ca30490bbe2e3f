use segvm_arch_x86::Selector;

/// Handle to a descriptor slot issued by the [`SelectorTable`].
///
/// The handle carries the user-mode LDT encoding (TI = 1, RPL = 3) of the
/// slot. A handle returned by a native per-thread area may instead carry a
/// GDT selector.
///
/// [`SelectorTable`]: crate::SelectorTable
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectorId(u16);

impl SelectorId {
    /// The null selector. Never issued by allocation.
    pub const NULL: Self = Self(0);

    /// Creates the handle of slot `index`.
    pub const fn from_index(index: u16) -> Self {
        Self(Selector::from_ldt_index(index).0)
    }

    /// Wraps a raw selector value.
    pub const fn from_raw(value: u16) -> Self {
        Self(value)
    }

    /// Returns the raw selector value.
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Returns the slot index.
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Returns the selector.
    pub const fn selector(self) -> Selector {
        Selector(self.0)
    }
}

impl From<SelectorId> for Selector {
    fn from(value: SelectorId) -> Self {
        Selector(value.0)
    }
}

impl From<Selector> for SelectorId {
    fn from(value: Selector) -> Self {
        Self(value.0)
    }
}

impl std::fmt::Debug for SelectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SelectorId({:#06x})", self.0)
    }
}

impl std::fmt::Display for SelectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
