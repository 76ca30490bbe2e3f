//! Fast segment-register cache of the calling thread.
//!
//! Remembers the per-thread data selector handed out by
//! [`SelectorTable::allocate_per_thread_slot`] so the thread can reload
//! `fs` cheaply, and so the table can forget it when the slot is freed.
//!
//! [`SelectorTable::allocate_per_thread_slot`]: crate::SelectorTable::allocate_per_thread_slot

use std::cell::Cell;

use segvm_arch_x86::Selector;

thread_local! {
    static THREAD_SELECTOR: Cell<u16> = const { Cell::new(0) };
}

/// Returns the per-thread data selector of the calling thread, or the null
/// selector.
pub fn thread_selector() -> Selector {
    Selector(THREAD_SELECTOR.with(Cell::get))
}

pub(crate) fn set_thread_selector(selector: Selector) {
    THREAD_SELECTOR.with(|cell| cell.set(selector.0));
}

/// Clears the cache if it names a slot in `[first, first + count)`.
pub(crate) fn forget_thread_selector(first: u16, count: u16) {
    THREAD_SELECTOR.with(|cell| {
        let selector = Selector(cell.get());
        if selector.is_null() || !selector.is_ldt() {
            return;
        }

        let index = selector.index();
        if index >= first && index - first < count {
            cell.set(0);
        }
    });
}
