//! Heap configuration.

use crate::error::{HeapError, Result};
use crate::layout::HEADER_SIZE;
use crate::region::GrowableRegion;

/// Default size of a growable region.
pub const DEFAULT_REGION_SIZE: usize = 16 * 1024 * 1024;

/// Default number of entries in the mark stack.
pub const DEFAULT_MARK_STACK_CAPACITY: usize = 4096;

/// Default fraction of free memory that may be allocated before a background
/// collection is requested.
pub const DEFAULT_GC_TRIGGER_RATIO: f32 = 0.75;

/// Which low-level events are traced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceFlags {
    /// Every allocation.
    pub alloc: bool,
    /// Region growth failures and out-of-memory retries.
    pub oom: bool,
    /// Allocation-driven collection requests.
    pub trigger: bool,
}

impl TraceFlags {
    /// All flags set.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            alloc: true,
            oom: true,
            trigger: true,
        }
    }
}

/// Configuration for a [`HeapManager`](crate::HeapManager).
///
/// # Example
///
/// ```
/// use tricolor_heap::HeapConfig;
///
/// let config = HeapConfig {
///     region_size: 1 << 20,
///     gc_trigger_ratio: None,
///     ..HeapConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_object_size(), (1 << 20) - 2 * tricolor_heap::HEADER_SIZE);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Bytes requested from the block source for each growable region.
    pub region_size: usize,
    /// Entries in the mark stack before it overflows.
    pub mark_stack_capacity: usize,
    /// Allocation volume, relative to free memory, that wakes the GC thread.
    /// `None` disables allocation-driven collection.
    pub gc_trigger_ratio: Option<f32>,
    /// Run the verify pass after every collection.
    pub verify: bool,
    /// Low-level event tracing.
    pub trace: TraceFlags,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
            mark_stack_capacity: DEFAULT_MARK_STACK_CAPACITY,
            gc_trigger_ratio: Some(DEFAULT_GC_TRIGGER_RATIO),
            verify: cfg!(debug_assertions),
            trace: TraceFlags::default(),
        }
    }
}

impl HeapConfig {
    /// Largest object body a growable region can hold.
    #[must_use]
    pub const fn max_object_size(&self) -> usize {
        self.region_size.saturating_sub(2 * HEADER_SIZE)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.region_size < GrowableRegion::MIN_SIZE + HEADER_SIZE {
            return Err(HeapError::Config(format!(
                "region_size {} is too small",
                self.region_size
            )));
        }
        if self.mark_stack_capacity == 0 {
            return Err(HeapError::Config(
                "mark_stack_capacity must be at least 1".into(),
            ));
        }
        if let Some(ratio) = self.gc_trigger_ratio {
            if !(ratio > 0.0 && ratio.is_finite()) {
                return Err(HeapError::Config(format!(
                    "gc_trigger_ratio {ratio} must be a positive number"
                )));
            }
        }
        Ok(())
    }
}
