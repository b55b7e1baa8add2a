//! Heap regions.
//!
//! A region is a contiguous span of mapped memory laid out as a sequence of
//! `[header | body]` blocks from its start to its end. Two kinds exist:
//!
//! - [`BootRegion`]: populated before the collector exists, never frees.
//! - [`GrowableRegion`]: first-fit allocation, O(1) free, explicit defragment.
//!
//! Both carry an [`AllocationBitmap`] so that validating a candidate reference
//! is a bounds check plus one bit test.

mod bitmap;
mod boot;
mod growable;

pub use bitmap::AllocationBitmap;
pub use boot::{BootImage, BootImageBuilder, BootRegion};
pub use growable::{GrowableRegion, Regions};

use parking_lot::Mutex;
use sys_alloc::{Block, Mmap};

use crate::error::{HeapError, Result};
use crate::layout::{self, ObjectRef, RawHeader, FREE, HEADER_SIZE, OBJECT_ALIGN, WORD};

/// Receives objects from a region walk.
///
/// Returning `false` stops the walk.
pub trait ObjectVisitor {
    /// Visits one allocated object.
    fn visit(&mut self, obj: ObjectRef) -> bool;
}

impl<F: FnMut(ObjectRef) -> bool> ObjectVisitor for F {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        self(obj)
    }
}

/// Operations shared by boot and growable regions.
pub trait Region {
    /// The memory span backing this region.
    fn space(&self) -> &Space;

    /// Visits every allocated object whose `flags & flags_mask == flags_value`.
    ///
    /// With `use_locking` the region lock is taken for each step, so the walk
    /// may run concurrently with allocation and freeing. Returns `false` if the
    /// visitor stopped the walk early.
    fn walk<V: ObjectVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        use_locking: bool,
        flags_mask: usize,
        flags_value: usize,
    ) -> bool;

    /// Bytes of free space inside the region.
    fn free_size(&self) -> usize;

    /// Is `addr` the body address of an allocated object in this region?
    fn is_object(&self, addr: usize) -> bool {
        self.space().is_object(addr)
    }

    /// Is `addr` inside this region's bounds?
    fn in_heap(&self, addr: usize) -> bool {
        self.space().in_heap(addr)
    }

    /// Total size of the region in bytes.
    fn size(&self) -> usize {
        self.space().size()
    }
}

pub(crate) enum Backing {
    Block(Block),
    Image(Mmap),
}

impl Backing {
    fn start(&self) -> usize {
        match self {
            Self::Block(block) => block.start(),
            Self::Image(mmap) => mmap.start(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Block(block) => block.len(),
            Self::Image(mmap) => mmap.len(),
        }
    }
}

/// A mapped span `[start, end)` plus its allocation bitmap.
///
/// All header and body access for objects inside the span goes through here,
/// after a bounds check.
pub struct Space {
    backing: Backing,
    start: usize,
    end: usize,
    bitmap: AllocationBitmap,
}

impl Space {
    /// Uses the first `len` bytes of `backing`.
    pub(crate) fn new(backing: Backing, len: usize) -> Self {
        let start = backing.start();
        let len = len.min(backing.len());
        Self {
            backing,
            start,
            end: start + len,
            bitmap: AllocationBitmap::new(len / OBJECT_ALIGN),
        }
    }

    pub(crate) fn into_backing(self) -> Backing {
        self.backing
    }

    /// First address of the span.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// First address after the span.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Length of the span in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// Is `addr` inside `[start, end)`?
    #[must_use]
    pub const fn in_heap(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Is `addr` the start of an allocated object body?
    #[must_use]
    pub fn is_object(&self, addr: usize) -> bool {
        self.in_heap(addr) && addr % OBJECT_ALIGN == 0 && self.bitmap.is_set(self.bit_index(addr))
    }

    /// Number of allocated objects recorded in the bitmap.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.bitmap.count()
    }

    const fn bit_index(&self, addr: usize) -> usize {
        (addr - self.start) / OBJECT_ALIGN
    }

    pub(crate) fn set_allocated(&self, obj: usize, allocated: bool) {
        if allocated {
            self.bitmap.set(self.bit_index(obj));
        } else {
            self.bitmap.clear(self.bit_index(obj));
        }
    }

    const fn can_hold_header(&self, obj: usize) -> bool {
        obj % OBJECT_ALIGN == 0 && obj >= self.start + HEADER_SIZE && obj <= self.end
    }

    /// Header of the block whose body starts at `obj`, if that header lies
    /// inside the span. This does not check that `obj` is allocated.
    pub(crate) fn raw_header(&self, obj: usize) -> Option<RawHeader> {
        // SAFETY: the header words are aligned and inside the mapping, which
        // lives as long as `self`.
        self.can_hold_header(obj)
            .then(|| unsafe { RawHeader::at(obj) })
    }

    /// Header of an allocated object.
    pub(crate) fn header(&self, obj: ObjectRef) -> Option<RawHeader> {
        if self.is_object(obj.addr()) {
            self.raw_header(obj.addr())
        } else {
            None
        }
    }

    fn body_slot(&self, obj: ObjectRef, offset: usize) -> Result<usize> {
        let header = self
            .header(obj)
            .ok_or_else(|| HeapError::NotAnObject(obj.addr()))?;
        let size = header.size();
        if offset % WORD != 0 || offset.checked_add(WORD).is_none_or(|limit| limit > size) {
            return Err(HeapError::OffsetOutOfBounds { offset, size });
        }
        let slot = obj.addr() + offset;
        if slot + WORD > self.end {
            return Err(HeapError::OffsetOutOfBounds { offset, size });
        }
        Ok(slot)
    }

    /// Loads the word at `offset` inside the body of `obj`.
    pub(crate) fn load_word(&self, obj: ObjectRef, offset: usize) -> Result<usize> {
        let slot = self.body_slot(obj, offset)?;
        // SAFETY: `body_slot` checked alignment and bounds.
        Ok(unsafe { layout::load_word(slot) })
    }

    /// Stores `value` at `offset` inside the body of `obj`.
    pub(crate) fn store_word(&self, obj: ObjectRef, offset: usize, value: usize) -> Result<()> {
        let slot = self.body_slot(obj, offset)?;
        // SAFETY: `body_slot` checked alignment and bounds.
        unsafe { layout::store_word(slot, value) };
        Ok(())
    }

    /// Zeroes the first `len` bytes of the body at `obj`.
    pub(crate) fn clear_body(&self, obj: usize, len: usize) {
        if self.can_hold_header(obj) && obj + len <= self.end {
            // SAFETY: range checked above; the block was just handed out
            // under the region lock and is not yet visible to anyone else.
            unsafe { layout::clear(obj, len) };
        }
    }

    /// Sequential walk from the first block to the end of the span.
    ///
    /// `lock` is taken around each header read when present.
    pub(crate) fn walk<V: ObjectVisitor + ?Sized, T>(
        &self,
        visitor: &mut V,
        lock: Option<&Mutex<T>>,
        flags_mask: usize,
        flags_value: usize,
    ) -> bool {
        let mut obj = self.start + HEADER_SIZE;
        while obj < self.end {
            let (type_word, size, flags) = {
                let _guard = lock.map(|lock| lock.lock());
                let Some(header) = self.raw_header(obj) else {
                    break;
                };
                let flags = if flags_mask == 0 {
                    0
                } else {
                    header.flags() & flags_mask
                };
                (header.type_word(), header.size(), flags)
            };
            if size % OBJECT_ALIGN != 0 {
                debug_assert!(false, "misaligned block size {size} at {obj:#x}");
                break;
            }
            if type_word != FREE && flags == flags_value {
                if let Some(found) = ObjectRef::from_addr(obj) {
                    if !visitor.visit(found) {
                        return false;
                    }
                }
            }
            match size
                .checked_add(HEADER_SIZE)
                .and_then(|step| obj.checked_add(step))
            {
                Some(next) => obj = next,
                None => break,
            }
        }
        true
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("objects", &self.bitmap.count())
            .finish()
    }
}
