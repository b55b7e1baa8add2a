//! Incremental-update write barrier.
//!
//! While marking, every reference a mutator stores is shaded: a white target
//! turns grey, so a scanned (black) object can never end up as the only
//! holder of an unscanned one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::layout::{Color, ObjectRef};
use crate::manager::HeapManager;

/// Barrier state shared between the collector and every mutator.
#[derive(Debug, Default)]
pub struct WriteBarrier {
    active: CachePadded<AtomicBool>,
    changed: CachePadded<AtomicBool>,
    shaded: AtomicUsize,
}

impl WriteBarrier {
    /// Creates an inactive barrier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Is the barrier shading stores?
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Has the barrier greyed anything since the collector last looked?
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Reads and clears the changed flag.
    pub(crate) fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Objects greyed by the barrier since the last `take_shaded`.
    pub(crate) fn take_shaded(&self) -> usize {
        self.shaded.swap(0, Ordering::AcqRel)
    }

    /// Elements copied between arrays were already reachable from the source.
    pub const fn array_copy(&self, _heap: &HeapManager, _src: ObjectRef, _dst: ObjectRef) {}

    /// Hook for a reference stored into an array element.
    pub fn array_store(&self, heap: &HeapManager, _array: ObjectRef, value: Option<ObjectRef>) {
        self.shade(heap, value);
    }

    /// Hook for a reference stored into an instance field.
    pub fn put_field(&self, heap: &HeapManager, _obj: ObjectRef, value: Option<ObjectRef>) {
        self.shade(heap, value);
    }

    /// Hook for a reference stored into a static or a shadow stack slot.
    pub fn put_static(&self, heap: &HeapManager, value: Option<ObjectRef>) {
        self.shade(heap, value);
    }

    /// Hook for a monitor attached to an object.
    pub fn set_monitor(&self, heap: &HeapManager, _obj: ObjectRef, monitor: Option<ObjectRef>) {
        self.shade(heap, monitor);
    }

    fn shade(&self, heap: &HeapManager, value: Option<ObjectRef>) {
        if !self.is_active() {
            return;
        }
        let Some(value) = value else {
            return;
        };
        let Some(header) = heap.header(value) else {
            return;
        };
        if header.cas_color(Color::White, Color::Grey) {
            self.changed.store(true, Ordering::Release);
            self.shaded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
