//! The collection cycle.
//!
//! ```text
//! Idle -> StopTheWorld -> Mark -> Sweep -> Cleanup -> (Verify) -> Resume -> Idle
//! ```
//!
//! Mark iterates to a fixpoint: a bounded mark stack may overflow and the
//! write barrier may grey objects behind the scan, so each iteration re-scans
//! the roots and, after the first, every grey object in the growable regions.

use std::thread::{self, ThreadId};
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};

use crate::gc::visitor::{
    CycleContext, FinalizableVisitor, MarkVisitor, SetWhiteVisitor, SweepVisitor, VerifyVisitor,
};
use crate::layout::{Color, ObjectRef, COLOR_MASK};
use crate::manager::HeapManager;
use crate::metrics::{GcStatistics, PhaseTimer};
use crate::region::{ObjectVisitor, Region};
use crate::safepoint;

#[cfg(feature = "tracing")]
use crate::trace::internal::{
    log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

/// Runs collection cycles, one at a time, and keeps their statistics.
#[derive(Debug, Default)]
pub struct CollectionManager {
    cycle: Mutex<()>,
    collector: Mutex<Option<ThreadId>>,
    statistics: Mutex<GcStatistics>,
}

impl CollectionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Statistics of the last cycle plus running totals.
    #[must_use]
    pub fn statistics(&self) -> GcStatistics {
        *self.statistics.lock()
    }

    /// Is the calling thread running a cycle right now?
    pub(crate) fn is_collector_thread(&self) -> bool {
        *self.collector.lock() == Some(thread::current().id())
    }

    /// Takes the cycle lock, waiting in a safe region if it is contended.
    pub(crate) fn lock_cycle<'a>(&'a self, heap: &HeapManager) -> MutexGuard<'a, ()> {
        match self.cycle.try_lock() {
            Some(guard) => guard,
            None => safepoint::blocking(heap.helper().as_ref(), || self.cycle.lock()),
        }
    }

    /// Runs a full cycle.
    ///
    /// If another thread is already collecting, waits for that cycle to end
    /// and returns `false` without starting another.
    pub fn collect(&self, heap: &HeapManager) -> bool {
        let Some(guard) = self.cycle.try_lock() else {
            safepoint::blocking(heap.helper().as_ref(), || drop(self.cycle.lock()));
            return false;
        };
        let yellowed = self.run_cycle(heap);
        drop(guard);
        if yellowed > 0 {
            heap.trigger_finalization(false);
        }
        true
    }

    fn run_cycle(&self, heap: &HeapManager) -> usize {
        #[cfg(feature = "tracing")]
        let _span = trace_gc_collection(next_gc_id());

        let mut cycle = GcStatistics {
            start_time: Some(SystemTime::now()),
            ..GcStatistics::new()
        };
        let started = Instant::now();
        let mut timer = PhaseTimer::new();

        heap.helper().stop_threads_at_safe_point();
        *self.collector.lock() = Some(thread::current().id());
        heap.set_gc_active(true);

        let cx = CycleContext::new(heap);

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Mark);
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Mark);
            let mut mark = MarkPhase::begin(&cx);
            while mark.iterate() {}
            mark.finish(&mut cycle);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Mark, cycle.marked_objects);
        }
        timer.end_mark();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Sweep);
            #[cfg(feature = "tracing")]
            log_phase_start(GcPhase::Sweep);
            keep_finalizable_referents(&cx, &mut cycle);
            sweep(&cx, &mut cycle);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Sweep, cycle.freed_objects);
        }
        timer.end_sweep();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Cleanup);
            cleanup(&cx);
        }
        timer.end_cleanup();

        if heap.config().verify {
            timer.start();
            #[cfg(feature = "tracing")]
            let _phase = trace_phase(GcPhase::Verify);
            let checked = verify(&cx);
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Verify, checked);
            #[cfg(not(feature = "tracing"))]
            let _ = checked;
            timer.end_verify();
        }

        drop(cx);
        heap.finish_cycle();
        *self.collector.lock() = None;
        heap.helper().restart_threads();

        cycle.duration = started.elapsed();
        cycle.mark_duration = timer.mark;
        cycle.sweep_duration = timer.sweep;
        cycle.cleanup_duration = timer.cleanup;
        cycle.verify_duration = timer.verify;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            freed_bytes = cycle.freed_bytes,
            marked = cycle.marked_objects,
            iterations = cycle.mark_iterations,
            "gc_complete"
        );
        self.statistics.lock().record(&cycle);
        cycle.yellowed_objects
    }
}

/// The mark phase, steppable one iteration at a time.
pub(crate) struct MarkPhase<'c, 'h> {
    cx: &'c CycleContext<'h>,
    visitor: MarkVisitor<'c, 'h>,
    first: bool,
    iterations: usize,
    marked: usize,
}

impl<'c, 'h> MarkPhase<'c, 'h> {
    /// Activates the write barrier.
    pub(crate) fn begin(cx: &'c CycleContext<'h>) -> Self {
        let barrier = cx.heap.barrier();
        barrier.take_shaded();
        barrier.take_changed();
        barrier.set_active(true);
        Self {
            cx,
            visitor: MarkVisitor::new(cx, cx.heap.config().mark_stack_capacity),
            first: true,
            iterations: 0,
            marked: 0,
        }
    }

    /// Runs one iteration. Returns `true` if another one is needed.
    pub(crate) fn iterate(&mut self) -> bool {
        let heap = self.cx.heap;
        let visitor = &mut self.visitor;
        visitor.reset();
        visitor.set_root_set(true);

        scan_roots(self.cx, visitor);
        heap.boot_region().walk(visitor, false, 0, 0);

        if self.first {
            // Whatever a pending finalizer may touch stays alive. Every yellow
            // object is visited: children dropped on overflow stay grey for
            // the rescan, but children never shaded would be lost.
            visitor.set_spare_yellow(true);
            for region in heap.regions() {
                let mut keep = |obj: ObjectRef| {
                    visitor.mark_referents(obj);
                    true
                };
                region.walk(&mut keep, false, COLOR_MASK, Color::Yellow.bits());
            }
            visitor.set_spare_yellow(false);
        } else {
            visitor.set_root_set(false);
            for region in heap.regions() {
                if !region.walk(visitor, false, COLOR_MASK, Color::Grey.bits()) {
                    break;
                }
            }
        }

        self.first = false;
        self.iterations += 1;
        self.marked += visitor.marked_objects();

        let overflow = visitor.is_overflow();
        if overflow && visitor.marked_objects() == 0 {
            heap.helper().die("mark loop makes no progress");
        }
        let changed = heap.barrier().take_changed();
        overflow || changed
    }

    /// Deactivates the write barrier and records the counters.
    pub(crate) fn finish(self, cycle: &mut GcStatistics) {
        let barrier = self.cx.heap.barrier();
        barrier.set_active(false);
        cycle.mark_iterations = self.iterations;
        cycle.marked_objects = self.marked;
        cycle.barrier_shades = barrier.take_shaded();
    }
}

fn scan_roots(cx: &CycleContext<'_>, visitor: &mut MarkVisitor<'_, '_>) {
    let heap = cx.heap;
    for word in heap.roots().statics() {
        visitor.mark_root(word);
    }
    for roots in heap.roots().threads() {
        visitor.mark_root(roots.thread().addr());
    }
    for info in &cx.types {
        if let Some(descriptor) = info.descriptor() {
            visitor.mark_root(descriptor.addr());
        }
    }
}

/// Turns unreachable finalizable objects yellow and marks what they refer to,
/// so the sweep cannot free anything a finalizer will read.
fn keep_finalizable_referents(cx: &CycleContext<'_>, cycle: &mut GcStatistics) {
    let heap = cx.heap;
    let mut pending = Vec::new();
    for region in heap.regions() {
        let mut finalizable = FinalizableVisitor::new(cx, region);
        region.walk(&mut finalizable, false, COLOR_MASK, Color::White.bits());
        pending.append(&mut finalizable.found);
    }
    if pending.is_empty() {
        return;
    }
    cycle.yellowed_objects += pending.len();

    let mut visitor = MarkVisitor::new(cx, heap.config().mark_stack_capacity);
    visitor.set_root_set(false);
    visitor.set_spare_yellow(true);
    for obj in pending {
        visitor.mark_referents(obj);
    }
    cycle.marked_objects += visitor.marked_objects();
    while visitor.is_overflow() {
        visitor.reset();
        for region in heap.regions() {
            if !region.walk(&mut visitor, false, COLOR_MASK, Color::Grey.bits()) {
                break;
            }
        }
        if visitor.is_overflow() && visitor.marked_objects() == 0 {
            heap.helper().die("mark loop makes no progress");
        }
        cycle.marked_objects += visitor.marked_objects();
    }
}

fn sweep(cx: &CycleContext<'_>, cycle: &mut GcStatistics) {
    for region in cx.heap.regions() {
        let mut visitor = SweepVisitor::new(cx, region);
        region.walk(&mut visitor, false, 0, 0);
        cycle.freed_bytes += visitor.freed_bytes;
        cycle.freed_objects += visitor.freed_objects;
    }
}

/// The sweep already whitened the growable regions; the boot region is
/// reset here, then regions that had frees are defragmented.
fn cleanup(cx: &CycleContext<'_>) {
    let boot = cx.heap.boot_region();
    boot.walk(&mut SetWhiteVisitor::new(boot.space()), false, 0, 0);
    for region in cx.heap.regions() {
        if region.is_dirty() {
            region.defragment();
        }
    }
}

fn verify(cx: &CycleContext<'_>) -> usize {
    let heap = cx.heap;
    let mut visitor = VerifyVisitor::new(cx);
    let mut checked = 0;
    let mut counting = |obj: ObjectRef| {
        checked += 1;
        visitor.visit(obj)
    };
    heap.boot_region().walk(&mut counting, false, 0, 0);
    for region in heap.regions() {
        region.walk(&mut counting, false, 0, 0);
    }
    if visitor.errors > 0 {
        heap.helper()
            .die(&format!("verify found {} invalid references", visitor.errors));
    }
    checked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::layout::WORD;
    use crate::types::{TypeDef, ARRAY_LENGTH_OFFSET};

    fn heap() -> std::sync::Arc<HeapManager> {
        HeapManager::builder(HeapConfig {
            region_size: 64 * 1024,
            gc_trigger_ratio: None,
            verify: true,
            ..HeapConfig::default()
        })
        .build()
        .unwrap()
    }

    #[test]
    fn test_store_into_scanned_object_is_shaded() {
        let heap = heap();
        let node = heap
            .register_type(TypeDef::instance("Node", WORD).with_references([0]))
            .unwrap();
        let x = heap.new_object(node).unwrap();
        let a = heap.new_object(node).unwrap();
        let o = heap.new_object(node).unwrap();
        heap.alloc_static(Some(x));
        heap.alloc_static(Some(a));
        heap.write_field(a, 0, Some(o)).unwrap();

        let _guard = heap.collector().cycle.lock();
        heap.set_gc_active(true);
        let cx = CycleContext::new(&heap);
        let mut mark = MarkPhase::begin(&cx);

        // X was scanned already; the mutator moves O from A into X.
        heap.header(x).unwrap().set_color(Color::Black);
        heap.write_field(x, 0, Some(o)).unwrap();
        heap.write_field(a, 0, None).unwrap();
        assert_eq!(heap.header(o).unwrap().color(), Color::Grey);
        assert!(heap.barrier().is_changed());

        let mut iterations = 1;
        while mark.iterate() {
            iterations += 1;
        }
        assert!(iterations >= 2);
        assert_eq!(heap.header(o).unwrap().color(), Color::Black);
        assert_eq!(heap.header(a).unwrap().color(), Color::Black);

        let mut cycle = GcStatistics::new();
        mark.finish(&mut cycle);
        assert_eq!(cycle.barrier_shades, 1);
        assert!(!heap.barrier().is_active());

        sweep(&cx, &mut cycle);
        assert_eq!(cycle.freed_objects, 0);
        drop(cx);
        heap.finish_cycle();
        assert!(heap.is_object(o.addr()));
    }

    #[test]
    fn test_allocation_during_mark_is_black() {
        let heap = heap();
        let node = heap.register_type(TypeDef::instance("Node", WORD)).unwrap();
        let cx = CycleContext::new(&heap);
        let mark = MarkPhase::begin(&cx);
        let fresh = heap.new_object(node).unwrap();
        assert_eq!(heap.header(fresh).unwrap().color(), Color::Black);
        mark.finish(&mut GcStatistics::new());
    }

    #[test]
    fn test_reachable_objects_are_black_after_mark() {
        let heap = HeapManager::builder(HeapConfig {
            region_size: 64 * 1024,
            mark_stack_capacity: 2,
            gc_trigger_ratio: None,
            ..HeapConfig::default()
        })
        .build()
        .unwrap();
        let node = heap
            .register_type(TypeDef::instance("Node", 2 * WORD).with_references([0, WORD]))
            .unwrap();
        // A complete binary tree, wider than the mark stack at every level.
        let mut level = vec![heap.new_object(node).unwrap()];
        heap.alloc_static(Some(level[0]));
        let mut all = level.clone();
        for _ in 0..5 {
            let mut next = Vec::new();
            for parent in &level {
                for offset in [0, WORD] {
                    let child = heap.new_object(node).unwrap();
                    heap.write_field(*parent, offset, Some(child)).unwrap();
                    next.push(child);
                }
            }
            all.extend(&next);
            level = next;
        }
        let garbage = heap.new_object(node).unwrap();

        let cx = CycleContext::new(&heap);
        let mut mark = MarkPhase::begin(&cx);
        let mut iterations = 1;
        while mark.iterate() {
            iterations += 1;
        }
        assert!(iterations > 1, "the stack should have overflowed");
        for obj in &all {
            assert_eq!(heap.header(*obj).unwrap().color(), Color::Black);
        }
        assert_eq!(heap.header(garbage).unwrap().color(), Color::White);
        mark.finish(&mut GcStatistics::new());
    }

    #[test]
    fn test_overflow_keeps_referents_of_every_yellow_object() {
        let heap = HeapManager::builder(HeapConfig {
            region_size: 64 * 1024,
            mark_stack_capacity: 1,
            gc_trigger_ratio: None,
            verify: true,
            ..HeapConfig::default()
        })
        .build()
        .unwrap();
        let leaf = heap.register_type(TypeDef::instance("Leaf", WORD)).unwrap();
        let owner = heap
            .register_type(
                TypeDef::instance("Owner", 2 * WORD)
                    .with_references([0, WORD])
                    .with_finalizer(|_, _| Ok(())),
            )
            .unwrap();
        let mut owners = Vec::new();
        let mut leaves = Vec::new();
        for _ in 0..2 {
            let obj = heap.new_object(owner).unwrap();
            for offset in [0, WORD] {
                let child = heap.new_object(leaf).unwrap();
                heap.write_field(obj, offset, Some(child)).unwrap();
                leaves.push(child);
            }
            heap.header(obj).unwrap().set_color(Color::Yellow);
            owners.push(obj);
        }

        let _guard = heap.collector().cycle.lock();
        heap.set_gc_active(true);
        let cx = CycleContext::new(&heap);
        let mut mark = MarkPhase::begin(&cx);
        while mark.iterate() {}
        let mut cycle = GcStatistics::new();
        mark.finish(&mut cycle);
        assert!(cycle.mark_iterations > 1, "two children cannot fit a stack of 1");

        keep_finalizable_referents(&cx, &mut cycle);
        sweep(&cx, &mut cycle);
        assert_eq!(cycle.freed_objects, 0);
        for obj in &owners {
            assert_eq!(heap.header(*obj).unwrap().color(), Color::Yellow);
        }
        for obj in &leaves {
            assert!(heap.is_object(obj.addr()), "referent of a pending object was freed");
        }
        verify(&cx);
        drop(cx);
        heap.finish_cycle();
    }

    #[test]
    fn test_verify_counts_slots_outside_the_object() {
        let heap = heap();
        let leaf = heap.register_type(TypeDef::instance("Leaf", WORD)).unwrap();
        let refs = heap.register_type(TypeDef::reference_array("Leaf[]")).unwrap();
        let array = heap.new_array(refs, 1).unwrap();
        heap.alloc_static(Some(array));
        let child = heap.new_object(leaf).unwrap();
        heap.write_array_element(array, 0, Some(child)).unwrap();

        // A corrupted length word points past the end of the array.
        heap.space_of(array.addr())
            .unwrap()
            .store_word(array, ARRAY_LENGTH_OFFSET, 1_000_000)
            .unwrap();

        let cx = CycleContext::new(&heap);
        let mut visitor = VerifyVisitor::new(&cx);
        assert!(visitor.visit(array));
        assert!(visitor.visit(child));
        assert_eq!(visitor.errors, 1);

        heap.space_of(array.addr())
            .unwrap()
            .store_word(array, ARRAY_LENGTH_OFFSET, 1)
            .unwrap();
    }
}
