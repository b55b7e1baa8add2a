//! The boot region: objects laid out before the collector exists.

use sys_alloc::Mmap;

use super::{Backing, ObjectVisitor, Region, Space};
use crate::error::{HeapError, Result};
use crate::layout::{object_align, Color, ObjectRef, HEADER_SIZE, OBJECT_ALIGN, WORD};
use crate::types::{TypeId, TypeRegistry, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET};

/// Lays out permanent objects in a fresh mapping.
///
/// Objects are placed back to back, each behind a header, exactly as a
/// growable region would hold them. Once finished, the image is handed to
/// [`HeapBuilder::boot_image`](crate::HeapBuilder::boot_image).
///
/// # Example
///
/// ```
/// use tricolor_heap::{BootImageBuilder, TypeDef, TypeRegistry, WORD};
///
/// let types = TypeRegistry::new();
/// let pair = types
///     .register(TypeDef::instance("Pair", 2 * WORD).with_references([0, WORD]))
///     .unwrap();
///
/// let mut image = BootImageBuilder::new(4096).unwrap();
/// let a = image.place_object(&types, pair).unwrap();
/// let b = image.place_object(&types, pair).unwrap();
/// image.write_ref(a, 0, Some(b)).unwrap();
/// assert_eq!(image.finish().object_count(), 2);
/// ```
#[derive(Debug)]
pub struct BootImageBuilder {
    space: Space,
    used: usize,
}

impl BootImageBuilder {
    /// Maps `capacity` bytes (rounded up to pages) for the image.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Map`] if the mapping fails.
    pub fn new(capacity: usize) -> Result<Self> {
        let mmap = Mmap::anonymous(capacity.max(OBJECT_ALIGN))?;
        let len = mmap.len();
        Ok(Self {
            space: Space::new(Backing::Image(mmap), len),
            used: 0,
        })
    }

    fn place(&mut self, type_word: usize, body: usize) -> Result<ObjectRef> {
        let aligned = object_align(body);
        let needed = aligned + HEADER_SIZE;
        let available = self.space.size() - self.used;
        if needed > available {
            return Err(HeapError::BootImageFull { needed, available });
        }
        let obj = self.space.start() + self.used + HEADER_SIZE;
        let header = self
            .space
            .raw_header(obj)
            .ok_or(HeapError::BootImageFull { needed, available })?;
        header.init(aligned, type_word, Color::White.bits());
        self.space.set_allocated(obj, true);
        self.used += needed;
        ObjectRef::from_addr(obj).ok_or(HeapError::NotAnObject(obj))
    }

    /// Places an instance of `ty`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or array types and when the image is full.
    pub fn place_object(&mut self, types: &TypeRegistry, ty: TypeId) -> Result<ObjectRef> {
        let info = types.get(ty)?;
        if info.kind().is_array() {
            return Err(HeapError::InvalidType {
                name: info.name().to_owned(),
                reason: "use place_array for array types".into(),
            });
        }
        self.place(ty.to_word(), info.instance_size())
    }

    /// Places an array of `length` elements of type `ty`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or non-array types and when the image is full.
    pub fn place_array(
        &mut self,
        types: &TypeRegistry,
        ty: TypeId,
        length: usize,
    ) -> Result<ObjectRef> {
        let info = types.get(ty)?;
        let body = info.array_body_size(length).ok_or_else(|| HeapError::InvalidType {
            name: info.name().to_owned(),
            reason: "not an array type".into(),
        })?;
        let array = self.place(ty.to_word(), body)?;
        self.space.store_word(array, ARRAY_LENGTH_OFFSET, length)?;
        Ok(array)
    }

    /// Stores a reference into a placed object.
    ///
    /// # Errors
    ///
    /// Fails if `obj` was not placed by this builder or `offset` is outside it.
    pub fn write_ref(
        &mut self,
        obj: ObjectRef,
        offset: usize,
        target: Option<ObjectRef>,
    ) -> Result<()> {
        self.space.store_word(obj, offset, ObjectRef::to_word(target))
    }

    /// Stores a reference into element `index` of a placed reference array.
    ///
    /// # Errors
    ///
    /// Fails if `array` was not placed by this builder or `index` is outside it.
    pub fn write_element(
        &mut self,
        array: ObjectRef,
        index: usize,
        target: Option<ObjectRef>,
    ) -> Result<()> {
        let length = self.space.load_word(array, ARRAY_LENGTH_OFFSET)?;
        if index >= length {
            return Err(HeapError::IndexOutOfBounds { index, length });
        }
        self.write_ref(array, ARRAY_DATA_OFFSET + index * WORD, target)
    }

    /// Stores a plain word into a placed object.
    ///
    /// # Errors
    ///
    /// Fails if `obj` was not placed by this builder or `offset` is outside it.
    pub fn write_word(&mut self, obj: ObjectRef, offset: usize, value: usize) -> Result<()> {
        self.space.store_word(obj, offset, value)
    }

    /// Seals the image.
    #[must_use]
    pub fn finish(self) -> BootImage {
        BootImage {
            objects: self.space.object_count(),
            space: self.space,
            used: self.used,
        }
    }
}

/// A sealed boot image, ready to become a [`BootRegion`].
#[derive(Debug)]
pub struct BootImage {
    space: Space,
    used: usize,
    objects: usize,
}

impl BootImage {
    /// An image with no objects.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Map`] if the backing page cannot be mapped.
    pub fn empty() -> Result<Self> {
        Ok(BootImageBuilder::new(OBJECT_ALIGN)?.finish())
    }

    /// Number of objects in the image.
    #[must_use]
    pub const fn object_count(&self) -> usize {
        self.objects
    }

    /// Bytes occupied by objects and their headers.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }
}

/// The permanent region. It never allocates, frees or defragments.
#[derive(Debug)]
pub struct BootRegion {
    space: Space,
}

impl BootRegion {
    /// Adopts `image`, rebuilding the allocation bitmap by scanning it.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::CorruptBootImage`] on free blocks, unknown types,
    /// misaligned sizes or objects running past the end of the image.
    pub fn initialize(image: BootImage, types: &TypeRegistry) -> Result<Self> {
        let used = image.used;
        let space = Space::new(image.space.into_backing(), used);
        let end = space.end();
        let mut obj = space.start() + HEADER_SIZE;
        while obj < end {
            let corrupt = |reason| HeapError::CorruptBootImage { addr: obj, reason };
            let header = space.raw_header(obj).ok_or_else(|| corrupt("header outside image"))?;
            if header.is_free() {
                return Err(corrupt("free block"));
            }
            if types.get_by_word(header.type_word()).is_none() {
                return Err(corrupt("unknown type"));
            }
            let size = header.size();
            if size % OBJECT_ALIGN != 0 {
                return Err(corrupt("misaligned size"));
            }
            if obj.checked_add(size).is_none_or(|body_end| body_end > end) {
                return Err(corrupt("object runs past the image"));
            }
            space.set_allocated(obj, true);
            obj += size + HEADER_SIZE;
        }
        Ok(Self { space })
    }

    /// Boot objects are permanent.
    pub const fn free(&self, _obj: ObjectRef) {}

    /// Nothing to merge in a region without free blocks.
    pub const fn defragment(&self) {}

    /// Number of objects in the region.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.space.object_count()
    }
}

impl Region for BootRegion {
    fn space(&self) -> &Space {
        &self.space
    }

    fn walk<V: ObjectVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        _use_locking: bool,
        flags_mask: usize,
        flags_value: usize,
    ) -> bool {
        self.space
            .walk(visitor, None::<&parking_lot::Mutex<()>>, flags_mask, flags_value)
    }

    fn free_size(&self) -> usize {
        0
    }
}
