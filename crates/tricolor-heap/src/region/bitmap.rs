//! Allocation bitmap.
//!
//! One bit per [`OBJECT_ALIGN`](crate::layout::OBJECT_ALIGN) quantum of a
//! region. A bit is set iff an object body starts at that offset, which makes
//! `is_object` a single load.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A region-wide bitmap of object start addresses.
///
/// # Example
///
/// ```
/// use tricolor_heap::region::AllocationBitmap;
///
/// let bitmap = AllocationBitmap::new(100);
/// assert_eq!(bitmap.capacity(), 100);
/// assert!(!bitmap.is_set(3));
///
/// bitmap.set(3);
/// assert!(bitmap.is_set(3));
/// assert_eq!(bitmap.count(), 1);
/// ```
#[derive(Debug)]
pub struct AllocationBitmap {
    words: Box<[AtomicU64]>,
    capacity: usize,
    count: AtomicUsize,
}

impl AllocationBitmap {
    /// Creates a cleared bitmap with room for `capacity` bits.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            capacity,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of bits in the bitmap.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Sets bit `index`. Out-of-range indices are ignored.
    pub fn set(&self, index: usize) {
        if index >= self.capacity {
            return;
        }
        let mask = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Clears bit `index`. Out-of-range indices are ignored.
    pub fn clear(&self, index: usize) {
        if index >= self.capacity {
            return;
        }
        let mask = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Returns whether bit `index` is set. Out-of-range indices read as clear.
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        (self.words[index / 64].load(Ordering::Acquire) >> (index % 64)) & 1 != 0
    }
}
