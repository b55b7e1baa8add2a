//! Finalization of unreachable objects.
//!
//! Right before the sweep, an unreachable object whose type has a finalizer
//! turns yellow instead of being freed. A finalization pass collects the yellow objects,
//! runs each finalizer once, sets the finalized flag and turns the object
//! white again, so a later sweep frees it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::layout::{Color, ObjectRef, COLOR_MASK};
use crate::manager::HeapManager;
use crate::region::Region;
use crate::safepoint::{self, MutatorGuard};

/// Requests a finalization pass.
///
/// With a running finalizer thread the pass happens there, and `wait` blocks
/// until it is done. Otherwise the pass runs on the calling thread.
pub(crate) fn trigger(heap: &HeapManager, wait: bool) -> bool {
    let trigger = heap.finalizer_trigger();
    if trigger.is_serviced() {
        let ticket = trigger.request();
        return !wait || trigger.wait_for(heap.helper().as_ref(), ticket);
    }
    run_pass(heap);
    true
}

/// Runs every pending finalizer. Returns the number run.
///
/// Passes are serialized; a finalizer that itself triggers finalization runs
/// a nested pass on the same thread.
pub(crate) fn run_pass(heap: &HeapManager) -> usize {
    let _mutator = MutatorGuard::attach(Arc::clone(heap.helper()));
    let lock = heap.finalization_lock();
    let _pass = match lock.try_lock() {
        Some(guard) => guard,
        None => safepoint::blocking(heap.helper().as_ref(), || lock.lock()),
    };

    let pending = pending_objects(heap);
    let mut finalized = 0;
    for obj in pending {
        heap.poll();
        if finalize(heap, obj) {
            finalized += 1;
        }
    }
    #[cfg(feature = "tracing")]
    if finalized > 0 {
        tracing::debug!(finalized, "finalization pass");
    }
    finalized
}

/// Yellow objects, gathered with no cycle in progress.
fn pending_objects(heap: &HeapManager) -> Vec<ObjectRef> {
    let _cycle = heap.collector().lock_cycle(heap);
    let mut pending = Vec::new();
    for region in heap.regions() {
        let mut gather = |obj: ObjectRef| {
            pending.push(obj);
            true
        };
        region.walk(&mut gather, true, COLOR_MASK, Color::Yellow.bits());
    }
    pending
}

fn finalize(heap: &HeapManager, obj: ObjectRef) -> bool {
    let Some(header) = heap.header(obj) else {
        return false;
    };
    if header.color() != Color::Yellow || !header.mark_finalized() {
        return false;
    }
    let finalizer = heap
        .types()
        .get_by_word(header.type_word())
        .and_then(|info| info.finalizer().cloned());
    if let Some(finalizer) = finalizer {
        // The object stays rooted while its finalizer runs.
        let slot = heap.finalizer_slot();
        let previous = heap.roots().load_static(slot).unwrap_or(0);
        heap.record_root_store(Some(obj));
        let _ = heap.roots().store_static(slot, obj.addr());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| finalizer(heap, obj)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(object = %obj, error = %_err, "finalizer failed");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(object = %obj, "finalizer panicked");
            }
        }

        let _ = heap.roots().store_static(slot, previous);
    }
    header.cas_color(Color::Yellow, Color::White);
    true
}
