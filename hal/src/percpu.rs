//! # Per-Processor Storage
//!
//! One slot per processor, reachable only through an [`IrqGuard`] and only
//! for the processor the guard was taken on. This replaces the classic
//! "unlocked array indexed by processor id" pattern with a type whose access
//! rules make cross-processor access unrepresentable.

use crate::platform::{IrqGuard, ProcessorId};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;

/// One cache-line-aligned slot
#[repr(align(64))]
struct Slot<T>(RefCell<T>);

/// Per-processor instances of `T`
///
/// Interior mutability is intentionally [`RefCell`], not a lock: every access
/// happens with local interrupts masked on the owning processor, so there is
/// no concurrency to guard against, only reentrancy (which the `RefCell`
/// turns into a loud failure).
pub struct PerCpu<T> {
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot is only ever touched through `with()`, which indexes by the
// processor captured in an IrqGuard. Slot i is therefore only accessed on
// processor i with interrupts masked, one context at a time.
unsafe impl<T: Send> Sync for PerCpu<T> {}

impl<T> PerCpu<T> {
    /// Create one slot per processor, initialized by `init`
    pub fn new(processors: usize, mut init: impl FnMut(ProcessorId) -> T) -> Self {
        let mut slots = Vec::with_capacity(processors);
        for i in 0..processors {
            slots.push(Slot(RefCell::new(init(ProcessorId::new(i as u32)))));
        }
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Access the current processor's slot
    ///
    /// # Panics
    ///
    /// Panics if the guard's processor is outside the table, or on reentrant
    /// access from the same section.
    pub fn with<R>(&self, guard: &IrqGuard<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = &self.slots[guard.processor().as_usize()];
        let mut value = slot.0.borrow_mut();
        f(&mut value)
    }
}

impl<T> core::fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpu").field("len", &self.len()).finish()
    }
}
