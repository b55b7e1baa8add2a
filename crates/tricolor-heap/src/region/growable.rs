//! Regions that allocate, free and defragment.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sys_alloc::Block;

use super::{Backing, ObjectVisitor, Region, Space};
use crate::error::{HeapError, Result};
use crate::layout::{Color, ObjectRef, RawHeader, FREE, HEADER_SIZE, OBJECT_ALIGN};
use crate::types::TypeId;

#[derive(Debug)]
struct FreeList {
    /// First block worth examining, `None` once the region is full.
    next_free: Option<usize>,
    free_size: usize,
    /// Set by `free`, cleared by `defragment`.
    dirty: bool,
}

/// A region carved out of a [`Block`] with first-fit allocation.
///
/// Blocks are split on allocation and marked free in O(1); adjacent free
/// blocks are only merged by [`defragment`](Self::defragment).
#[derive(Debug)]
pub struct GrowableRegion {
    space: Space,
    free: Mutex<FreeList>,
    next: OnceLock<Arc<GrowableRegion>>,
}

impl GrowableRegion {
    /// Smallest block that can hold one header and a minimal body.
    pub const MIN_SIZE: usize = HEADER_SIZE + OBJECT_ALIGN;

    /// Turns `block` into a region holding one free block that spans it.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Config`] if the block is smaller than
    /// [`MIN_SIZE`](Self::MIN_SIZE).
    pub fn initialize(block: Block) -> Result<Self> {
        let len = block.len();
        if len < Self::MIN_SIZE {
            return Err(HeapError::Config(format!(
                "region block of {len} bytes is smaller than {} bytes",
                Self::MIN_SIZE
            )));
        }
        let space = Space::new(Backing::Block(block), len);
        let first = space.start() + HEADER_SIZE;
        let body = (space.end() - first) & !(OBJECT_ALIGN - 1);
        let header = space
            .raw_header(first)
            .ok_or_else(|| HeapError::Config("region block is misaligned".into()))?;
        header.init(body, FREE, 0);
        Ok(Self {
            space,
            free: Mutex::new(FreeList {
                next_free: Some(first),
                free_size: body,
                dirty: false,
            }),
            next: OnceLock::new(),
        })
    }

    fn block_at(&self, addr: usize) -> Option<RawHeader> {
        self.space.raw_header(addr)
    }

    /// First-fit allocation of `aligned_size` body bytes.
    ///
    /// Returns `None` when no free block is large enough. The body is zeroed
    /// and the object starts out white.
    pub fn allocate(&self, ty: TypeId, aligned_size: usize) -> Option<ObjectRef> {
        debug_assert_eq!(aligned_size % OBJECT_ALIGN, 0);
        let end = self.space.end();
        let (obj, body) = {
            let mut free = self.free.lock();
            let mut ptr = free.next_free?;
            let header = loop {
                let Some(header) = self.block_at(ptr) else {
                    free.next_free = None;
                    return None;
                };
                let size = header.size();
                if header.is_free() && aligned_size <= size {
                    break header;
                }
                let next = ptr + size + HEADER_SIZE;
                if next >= end {
                    free.next_free = None;
                    return None;
                }
                ptr = next;
                free.next_free = Some(ptr);
            };

            let current = header.size();
            let body = if current - aligned_size > HEADER_SIZE {
                let rest = ptr + aligned_size + HEADER_SIZE;
                if let Some(remainder) = self.block_at(rest) {
                    remainder.init(current - aligned_size - HEADER_SIZE, FREE, 0);
                }
                free.next_free = Some(rest);
                free.free_size -= aligned_size + HEADER_SIZE;
                aligned_size
            } else {
                let next = ptr + current + HEADER_SIZE;
                free.next_free = (next < end).then_some(next);
                free.free_size -= current;
                current
            };
            header.init(body, ty.to_word(), Color::White.bits());
            self.space.set_allocated(ptr, true);
            (ptr, body)
        };
        self.space.clear_body(obj, body);
        ObjectRef::from_addr(obj)
    }

    /// Returns the object's block to free space. Returns `false` if `obj` is
    /// not an object of this region.
    pub fn free(&self, obj: ObjectRef) -> bool {
        let mut free = self.free.lock();
        let Some(header) = self.space.header(obj) else {
            return false;
        };
        header.make_free();
        self.space.set_allocated(obj.addr(), false);
        free.free_size += header.size();
        free.dirty = true;
        if free.next_free.is_none_or(|cursor| obj.addr() < cursor) {
            free.next_free = Some(obj.addr());
        }
        true
    }

    /// Merges runs of adjacent free blocks and points the cursor at the first
    /// free block.
    pub fn defragment(&self) {
        let mut free = self.free.lock();
        let end = self.space.end();
        let mut ptr = self.space.start() + HEADER_SIZE;
        let mut first_free = None;
        while ptr < end {
            let Some(header) = self.block_at(ptr) else {
                break;
            };
            let size = header.size();
            let next = ptr + size + HEADER_SIZE;
            if header.is_free() {
                first_free.get_or_insert(ptr);
                if let Some(following) = self.block_at(next).filter(|h| next < end && h.is_free()) {
                    header.set_size(size + HEADER_SIZE + following.size());
                    free.free_size += HEADER_SIZE;
                    continue;
                }
            }
            ptr = next;
        }
        free.next_free = first_free;
        free.dirty = false;
    }

    /// Has anything been freed since the last defragment?
    pub fn is_dirty(&self) -> bool {
        self.free.lock().dirty
    }

    /// `true` once allocation has scanned to the end without success.
    pub fn is_full(&self) -> bool {
        self.free.lock().next_free.is_none()
    }

    /// Body size of `obj`, if it is an object of this region.
    pub fn object_size(&self, obj: ObjectRef) -> Option<usize> {
        self.space.header(obj).map(RawHeader::size)
    }

    /// The region after this one in the heap's region list.
    pub fn next(&self) -> Option<&Arc<Self>> {
        self.next.get()
    }

    /// Links `region` after the last region of this list.
    pub(crate) fn append(&self, region: Arc<Self>) {
        let mut tail = self;
        let mut region = region;
        loop {
            match tail.next.get() {
                Some(next) => tail = next,
                None => match tail.next.set(region) {
                    Ok(()) => return,
                    Err(lost) => region = lost,
                },
            }
        }
    }

    /// Iterates this region and every region linked after it.
    pub fn iter(&self) -> Regions<'_> {
        Regions { next: Some(self) }
    }
}

impl Region for GrowableRegion {
    fn space(&self) -> &Space {
        &self.space
    }

    fn walk<V: ObjectVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        use_locking: bool,
        flags_mask: usize,
        flags_value: usize,
    ) -> bool {
        let lock = use_locking.then_some(&self.free);
        self.space.walk(visitor, lock, flags_mask, flags_value)
    }

    fn free_size(&self) -> usize {
        self.free.lock().free_size
    }
}

/// Iterator over a linked list of growable regions.
#[derive(Debug, Clone)]
pub struct Regions<'a> {
    next: Option<&'a GrowableRegion>,
}

impl<'a> Iterator for Regions<'a> {
    type Item = &'a GrowableRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next().map(Arc::as_ref);
        Some(current)
    }
}
