//! Low-level memory for heap regions.
//!
//! The collector never asks the global allocator for region memory. It maps
//! whole blocks of anonymous memory through a [`BlockManager`], which enforces a
//! fixed byte budget the way a kernel-level block manager would.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a whole number of pages.
#[must_use]
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// An owned anonymous memory mapping.
///
/// The memory is zero-filled when mapped and unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Maps `len` bytes (rounded up to pages) of zeroed, read-write memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or the operating system refuses the mapping.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        // SAFETY: a fresh private mapping aliases nothing.
        let inner = unsafe { os::MmapInner::map_anon(round_to_pages(len))? };
        Ok(Self { inner })
    }

    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the start address of the mapping.
    #[must_use]
    pub fn start(&self) -> usize {
        self.inner.ptr() as usize
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty (never the case for a live mapping).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug)]
struct Budget {
    capacity: usize,
    used: AtomicUsize,
}

impl Budget {
    fn reserve(&self, len: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(len)?;
                (next <= self.capacity).then_some(next)
            })
            .is_ok()
    }

    fn release(&self, len: usize) {
        self.used.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Hands out memory blocks against a fixed byte budget.
///
/// Cloning a `BlockManager` shares the budget.
#[derive(Debug, Clone)]
pub struct BlockManager {
    budget: Arc<Budget>,
}

impl BlockManager {
    /// Creates a manager that will map at most `capacity` bytes at any one time.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            budget: Arc::new(Budget {
                capacity,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Maps a block of at least `size` bytes.
    ///
    /// Returns `None` when the budget cannot cover the page-rounded size or the
    /// operating system refuses the mapping. Failure is the caller's cue to
    /// collect garbage before giving up.
    #[must_use]
    pub fn allocate_block(&self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }
        let len = round_to_pages(size);
        if !self.budget.reserve(len) {
            return None;
        }
        match Mmap::anonymous(len) {
            Ok(mmap) => Some(Block {
                mmap,
                budget: Arc::clone(&self.budget),
            }),
            Err(_) => {
                self.budget.release(len);
                None
            }
        }
    }

    /// Bytes still available to `allocate_block`.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        self.budget
            .capacity
            .saturating_sub(self.budget.used.load(Ordering::Acquire))
    }

    /// Total budget in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.budget.capacity
    }
}

/// A mapped block owned by a heap region.
///
/// Dropping the block unmaps it and returns its bytes to the [`BlockManager`].
#[derive(Debug)]
pub struct Block {
    mmap: Mmap,
    budget: Arc<Budget>,
}

impl Block {
    /// Start address of the block.
    #[must_use]
    pub fn start(&self) -> usize {
        self.mmap.start()
    }

    /// Length of the block in bytes (a whole number of pages).
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns `true` if the block has no usable bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Raw pointer to the start of the block.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.mmap.ptr()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.budget.release(self.mmap.len());
    }
}
