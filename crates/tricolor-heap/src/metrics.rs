//! Collection statistics.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

/// Statistics of the most recent collection plus running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStatistics {
    /// Wall-clock time the last collection started, if any ran.
    pub start_time: Option<SystemTime>,
    /// Duration of the last collection, stop to restart.
    pub duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Duration of the cleanup phase.
    pub cleanup_duration: Duration,
    /// Duration of the verify phase (zero when verify is off).
    pub verify_duration: Duration,
    /// Mark iterations needed to reach the fixpoint.
    pub mark_iterations: usize,
    /// Objects turned black.
    pub marked_objects: usize,
    /// Objects freed by the sweep.
    pub freed_objects: usize,
    /// Body bytes freed by the sweep.
    pub freed_bytes: usize,
    /// Objects turned yellow, awaiting finalization.
    pub yellowed_objects: usize,
    /// Objects greyed by the write barrier during marking.
    pub barrier_shades: usize,
    /// Collections since the heap was built.
    pub total_collections: usize,
    /// Body bytes freed since the heap was built.
    pub total_freed_bytes: usize,
}

impl Default for GcStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcStatistics {
    /// All counters zero, no collection recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start_time: None,
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            cleanup_duration: Duration::ZERO,
            verify_duration: Duration::ZERO,
            mark_iterations: 0,
            marked_objects: 0,
            freed_objects: 0,
            freed_bytes: 0,
            yellowed_objects: 0,
            barrier_shades: 0,
            total_collections: 0,
            total_freed_bytes: 0,
        }
    }

    /// Replaces the per-cycle fields with `cycle` and folds it into the totals.
    pub(crate) fn record(&mut self, cycle: &Self) {
        let total_collections = self.total_collections + 1;
        let total_freed_bytes = self.total_freed_bytes + cycle.freed_bytes;
        *self = Self {
            total_collections,
            total_freed_bytes,
            ..*cycle
        };
    }
}

impl fmt::Display for GcStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "collections:      {}", self.total_collections)?;
        writeln!(f, "last duration:    {:?}", self.duration)?;
        writeln!(
            f,
            "  mark {:?} ({} iterations), sweep {:?}, cleanup {:?}, verify {:?}",
            self.mark_duration,
            self.mark_iterations,
            self.sweep_duration,
            self.cleanup_duration,
            self.verify_duration
        )?;
        writeln!(f, "marked objects:   {}", self.marked_objects)?;
        writeln!(
            f,
            "freed:            {} objects, {} bytes",
            self.freed_objects, self.freed_bytes
        )?;
        writeln!(f, "yellowed objects: {}", self.yellowed_objects)?;
        writeln!(f, "barrier shades:   {}", self.barrier_shades)?;
        write!(f, "total freed:      {} bytes", self.total_freed_bytes)
    }
}

/// Captures phase durations for one cycle.
///
/// # Example
///
/// ```
/// use tricolor_heap::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark ...
/// timer.end_mark();
///
/// timer.start();
/// // ... sweep ...
/// timer.end_sweep();
/// assert!(timer.cleanup.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Mark phase time.
    pub mark: Duration,
    /// Sweep phase time.
    pub sweep: Duration,
    /// Cleanup phase time.
    pub cleanup: Duration,
    /// Verify phase time.
    pub verify: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// All durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            cleanup: Duration::ZERO,
            verify: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the mark phase.
    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// End the sweep phase.
    pub fn end_sweep(&mut self) {
        self.sweep = self.take();
    }

    /// End the cleanup phase.
    pub fn end_cleanup(&mut self) {
        self.cleanup = self.take();
    }

    /// End the verify phase.
    pub fn end_verify(&mut self) {
        self.verify = self.take();
    }
}
