//! The heap manager.
//!
//! Owns the regions, the type table, the root set and the collector, and is
//! the only way mutators touch heap memory. Every reference store goes
//! through the write barrier.
//!
//! Every entry point polls the safepoint: allocations and loads on entry,
//! stores after writing. A reference the caller holds outside the roots
//! stays valid until the caller's next allocation or load, so storing a
//! fresh object right after allocating it is safe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, ReentrantMutex};
use sys_alloc::{Block, BlockManager};

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::gc::barrier::WriteBarrier;
use crate::gc::collector::CollectionManager;
use crate::gc::daemon::{self, DaemonKind, Trigger};
use crate::gc::finalizer;
use crate::layout::{object_align, Color, ObjectRef, RawHeader, WORD};
use crate::metrics::GcStatistics;
use crate::region::{BootImage, BootRegion, GrowableRegion, Region, Regions, Space};
use crate::roots::{MutatorThread, RootSet, StaticSlot};
use crate::safepoint::{self, HeapHelper, MutatorGuard, Safepoints};
use crate::stats::HeapStatistics;
use crate::types::{
    TypeDef, TypeId, TypeInfo, TypeKind, TypeRegistry, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET,
};

/// Block budget used when the builder is given no block source.
pub const DEFAULT_BLOCK_BUDGET: usize = 1 << 30;

/// Supplies the memory new regions are carved from.
pub trait BlockSource: Send + Sync {
    /// Maps a block of at least `size` bytes, or `None` if none is available.
    fn allocate_block(&self, size: usize) -> Option<Block>;

    /// Bytes still available.
    fn free_memory(&self) -> usize;
}

impl BlockSource for BlockManager {
    fn allocate_block(&self, size: usize) -> Option<Block> {
        Self::allocate_block(self, size)
    }

    fn free_memory(&self) -> usize {
        Self::free_memory(self)
    }
}

/// Builds a [`HeapManager`].
pub struct HeapBuilder {
    config: HeapConfig,
    types: TypeRegistry,
    boot_image: Option<BootImage>,
    block_source: Option<Box<dyn BlockSource>>,
    helper: Option<Arc<dyn HeapHelper>>,
}

impl HeapBuilder {
    /// Types known before the heap exists. Boot image objects must use these.
    #[must_use]
    pub fn types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Permanent objects laid out by a [`BootImageBuilder`](crate::BootImageBuilder).
    #[must_use]
    pub fn boot_image(mut self, image: BootImage) -> Self {
        self.boot_image = Some(image);
        self
    }

    /// Where region memory comes from. Defaults to a [`BlockManager`] with a
    /// budget of [`DEFAULT_BLOCK_BUDGET`].
    #[must_use]
    pub fn block_source(mut self, source: impl BlockSource + 'static) -> Self {
        self.block_source = Some(Box::new(source));
        self
    }

    /// The stop-the-world capability. Defaults to [`Safepoints`].
    #[must_use]
    pub fn helper(mut self, helper: Arc<dyn HeapHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Maps the first region and adopts the boot image.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Config`] for an invalid configuration,
    /// [`HeapError::CorruptBootImage`] for a malformed image, and
    /// [`HeapError::OutOfMemory`] if the first region cannot be mapped.
    pub fn build(self) -> Result<Arc<HeapManager>> {
        self.config.validate()?;
        let image = match self.boot_image {
            Some(image) => image,
            None => BootImage::empty()?,
        };
        let boot = BootRegion::initialize(image, &self.types)?;
        let blocks = self
            .block_source
            .unwrap_or_else(|| Box::new(BlockManager::new(DEFAULT_BLOCK_BUDGET)));
        let block = blocks
            .allocate_block(self.config.region_size)
            .ok_or(HeapError::OutOfMemory {
                size: self.config.region_size,
            })?;
        let first = Arc::new(GrowableRegion::initialize(block)?);
        let roots = RootSet::default();
        let finalizer_slot = roots.alloc_static(None);

        let heap = HeapManager {
            config: self.config,
            types: self.types,
            boot,
            current: Mutex::new(Arc::clone(&first)),
            first,
            region_count: AtomicUsize::new(1),
            blocks,
            helper: self.helper.unwrap_or_else(|| Arc::new(Safepoints::new())),
            barrier: WriteBarrier::new(),
            collector: CollectionManager::new(),
            roots,
            gc_active: AtomicBool::new(false),
            low_memory: AtomicBool::new(false),
            allocated_since_trigger: AtomicUsize::new(0),
            trigger_size: AtomicUsize::new(usize::MAX),
            gc_trigger: Arc::new(Trigger::new()),
            finalizer_trigger: Arc::new(Trigger::new()),
            finalization: ReentrantMutex::new(()),
            finalizer_slot,
            daemons: Mutex::new(Vec::new()),
        };
        heap.update_trigger_size();
        #[cfg(feature = "tracing")]
        tracing::debug!(
            region_size = heap.config.region_size,
            boot_objects = heap.boot.object_count(),
            "heap built"
        );
        Ok(Arc::new(heap))
    }
}

impl std::fmt::Debug for HeapBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuilder")
            .field("config", &self.config)
            .field("types", &self.types.len())
            .field("boot_image", &self.boot_image)
            .finish_non_exhaustive()
    }
}

/// A non-moving mark-sweep heap.
///
/// # Example
///
/// ```
/// use tricolor_heap::{HeapConfig, HeapManager, TypeDef, WORD};
///
/// let heap = HeapManager::builder(HeapConfig::default()).build().unwrap();
/// let node = heap
///     .register_type(TypeDef::instance("Node", 2 * WORD).with_references([0]))
///     .unwrap();
///
/// let root = heap.new_object(node).unwrap();
/// let child = heap.new_object(node).unwrap();
/// heap.alloc_static(Some(root));
/// heap.write_field(root, 0, Some(child)).unwrap();
/// let garbage = heap.new_object(node).unwrap();
///
/// heap.gc();
/// assert!(heap.is_object(child.addr()));
/// assert!(!heap.is_object(garbage.addr()));
/// ```
pub struct HeapManager {
    config: HeapConfig,
    types: TypeRegistry,
    boot: BootRegion,
    first: Arc<GrowableRegion>,
    /// Where allocation resumes; reset to `first` after every cycle.
    current: Mutex<Arc<GrowableRegion>>,
    region_count: AtomicUsize,
    blocks: Box<dyn BlockSource>,
    helper: Arc<dyn HeapHelper>,
    barrier: WriteBarrier,
    collector: CollectionManager,
    roots: RootSet,
    gc_active: AtomicBool,
    low_memory: AtomicBool,
    allocated_since_trigger: AtomicUsize,
    trigger_size: AtomicUsize,
    gc_trigger: Arc<Trigger>,
    finalizer_trigger: Arc<Trigger>,
    finalization: ReentrantMutex<()>,
    /// Roots the object whose finalizer is running.
    finalizer_slot: StaticSlot,
    daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl HeapManager {
    /// Starts building a heap.
    #[must_use]
    pub fn builder(config: HeapConfig) -> HeapBuilder {
        HeapBuilder {
            config,
            types: TypeRegistry::new(),
            boot_image: None,
            block_source: None,
            helper: None,
        }
    }

    // ------------------------------------------------------------------
    // Types and threads
    // ------------------------------------------------------------------

    /// Registers a type.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidType`] for a malformed definition.
    pub fn register_type(&self, def: TypeDef) -> Result<TypeId> {
        self.types.register(def)
    }

    /// Looks up a registered type.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownType`] for an id this heap never issued.
    pub fn type_info(&self, ty: TypeId) -> Result<Arc<TypeInfo>> {
        self.types.get(ty)
    }

    /// Binds the object describing `ty`. Bound descriptors are roots, and
    /// every instance keeps its type's descriptor alive.
    ///
    /// Returns `false` if a descriptor was already bound.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownType`] or [`HeapError::NotAnObject`].
    pub fn bind_type_descriptor(&self, ty: TypeId, descriptor: ObjectRef) -> Result<bool> {
        let info = self.types.get(ty)?;
        if !self.is_object(descriptor.addr()) {
            return Err(HeapError::NotAnObject(descriptor.addr()));
        }
        self.record_root_store(Some(descriptor));
        let bound = info.bind_descriptor(descriptor);
        self.poll();
        Ok(bound)
    }

    /// Attaches the calling thread, allocating its thread object.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::KindMismatch`] unless `thread_type` is a thread
    /// type, or any allocation error.
    pub fn attach_thread(self: &Arc<Self>, thread_type: TypeId) -> Result<MutatorThread> {
        let info = self.types.get(thread_type)?;
        if info.kind() != TypeKind::Thread {
            return Err(HeapError::KindMismatch {
                ty: thread_type,
                expected: "a thread type",
            });
        }
        let guard = self.attach_mutator();
        let thread = self.allocate(&info, info.instance_size())?;
        let roots = self.roots.register_thread(thread);
        Ok(MutatorThread::new(Arc::clone(self), roots, guard))
    }

    /// Attaches the calling thread without a thread object. It then takes part
    /// in stop-the-world pauses until the guard is dropped.
    pub fn attach_mutator(&self) -> MutatorGuard {
        MutatorGuard::attach(Arc::clone(&self.helper))
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates an instance of `ty` with a zeroed body.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::KindMismatch`] for array types and
    /// [`HeapError::OutOfMemory`] when no memory is left after a collection.
    pub fn new_object(&self, ty: TypeId) -> Result<ObjectRef> {
        let info = self.types.get(ty)?;
        if info.kind().is_array() {
            return Err(HeapError::KindMismatch {
                ty,
                expected: "an instance type",
            });
        }
        self.allocate(&info, info.instance_size())
    }

    /// Allocates an array of `length` zeroed elements.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::KindMismatch`] for non-array types,
    /// [`HeapError::ObjectTooLarge`] if the array can never fit in a region,
    /// and [`HeapError::OutOfMemory`] when no memory is left.
    pub fn new_array(&self, ty: TypeId, length: usize) -> Result<ObjectRef> {
        let info = self.types.get(ty)?;
        let size = info.array_body_size(length).ok_or(if info.kind().is_array() {
            HeapError::ObjectTooLarge {
                size: usize::MAX,
                limit: self.config.max_object_size(),
            }
        } else {
            HeapError::KindMismatch {
                ty,
                expected: "an array type",
            }
        })?;
        let array = self.allocate(&info, size)?;
        self.space_for(array)?
            .store_word(array, ARRAY_LENGTH_OFFSET, length)?;
        Ok(array)
    }

    fn allocate(&self, info: &TypeInfo, size: usize) -> Result<ObjectRef> {
        self.poll();
        let limit = self.config.max_object_size();
        if size > limit {
            #[cfg(feature = "tracing")]
            if self.config.trace.oom {
                tracing::debug!(size, limit, "object too large");
            }
            return Err(HeapError::ObjectTooLarge { size, limit });
        }
        self.ensure_initialized(info);

        if self.gc_active.load(Ordering::Acquire) && !self.collector.is_collector_thread() {
            drop(self.collector.lock_cycle(self));
        }

        let aligned = object_align(size.max(1));
        let mut retried = false;
        let obj = loop {
            if let Some(obj) = self.try_allocate(info.id(), aligned) {
                break obj;
            }
            self.low_memory.store(true, Ordering::Release);
            if retried {
                #[cfg(feature = "tracing")]
                if self.config.trace.oom {
                    tracing::debug!(size, ty = info.name(), "out of memory");
                }
                return Err(HeapError::OutOfMemory { size });
            }
            retried = true;
            #[cfg(feature = "tracing")]
            if self.config.trace.oom {
                tracing::debug!(size, "heap exhausted, collecting");
            }
            self.gc();
        };

        if self.barrier.is_active() {
            if let Some(header) = self.header(obj) {
                header.set_color(Color::Black);
            }
        }
        info.count_instance();
        self.low_memory.store(false, Ordering::Release);
        #[cfg(feature = "tracing")]
        if self.config.trace.alloc {
            tracing::trace!(object = %obj, ty = info.name(), size = aligned, "alloc");
        }
        self.account(aligned);
        Ok(obj)
    }

    /// Tries the current region and the ones after it, then grows the heap.
    fn try_allocate(&self, ty: TypeId, aligned: usize) -> Option<ObjectRef> {
        let mut current = self.current.lock();
        let mut region = Arc::clone(&current);
        loop {
            if let Some(obj) = region.allocate(ty, aligned) {
                *current = region;
                return Some(obj);
            }
            match region.next() {
                Some(next) => region = Arc::clone(next),
                None => break,
            }
        }
        let block = self.blocks.allocate_block(self.config.region_size)?;
        let grown = Arc::new(GrowableRegion::initialize(block).ok()?);
        let obj = grown.allocate(ty, aligned);
        self.first.append(Arc::clone(&grown));
        self.region_count.fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "tracing")]
        tracing::debug!(regions = self.region_count(), "heap grown");
        *current = grown;
        obj
    }

    /// Runs the type's initializer once. A recursive call from inside the
    /// initializer returns immediately.
    fn ensure_initialized(&self, info: &TypeInfo) {
        if info.initialized.load(Ordering::Acquire) {
            return;
        }
        let Some(initializer) = info.initializer() else {
            info.initialized.store(true, Ordering::Release);
            return;
        };
        let started = match info.init_lock.try_lock() {
            Some(guard) => guard,
            None => safepoint::blocking(self.helper.as_ref(), || info.init_lock.lock()),
        };
        if started.get() {
            return;
        }
        started.set(true);
        initializer(self);
        info.initialized.store(true, Ordering::Release);
    }

    fn account(&self, aligned: usize) {
        if self.config.gc_trigger_ratio.is_none() || !self.gc_trigger.is_serviced() {
            return;
        }
        let allocated = self
            .allocated_since_trigger
            .fetch_add(aligned, Ordering::AcqRel)
            + aligned;
        if allocated > self.trigger_size.load(Ordering::Acquire) {
            self.allocated_since_trigger.store(0, Ordering::Release);
            #[cfg(feature = "tracing")]
            if self.config.trace.trigger {
                tracing::debug!(allocated, "allocation triggered gc");
            }
            self.gc_trigger.request();
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn update_trigger_size(&self) {
        let size = self.config.gc_trigger_ratio.map_or(usize::MAX, |ratio| {
            (self.free_memory() as f64 * f64::from(ratio)) as usize
        });
        self.trigger_size.store(size, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Mutator access
    // ------------------------------------------------------------------

    fn space_for(&self, obj: ObjectRef) -> Result<&Space> {
        self.space_of(obj.addr())
            .filter(|space| space.is_object(obj.addr()))
            .ok_or(HeapError::NotAnObject(obj.addr()))
    }

    fn resolve(&self, obj: ObjectRef) -> Result<(&Space, RawHeader, Arc<TypeInfo>)> {
        let space = self.space_for(obj)?;
        let header = space
            .header(obj)
            .ok_or(HeapError::NotAnObject(obj.addr()))?;
        let info = self
            .types
            .get_by_word(header.type_word())
            .ok_or(HeapError::NotAnObject(obj.addr()))?;
        Ok((space, header, info))
    }

    fn check_target(&self, value: Option<ObjectRef>) -> Result<()> {
        match value {
            Some(target) if !self.is_object(target.addr()) => {
                Err(HeapError::NotAnObject(target.addr()))
            }
            _ => Ok(()),
        }
    }

    fn instance_field(
        &self,
        obj: ObjectRef,
        offset: usize,
        reference: bool,
    ) -> Result<&Space> {
        let (space, _, info) = self.resolve(obj)?;
        if info.kind().is_array() {
            return Err(HeapError::WrongKind {
                obj,
                expected: "an instance",
            });
        }
        if info.reference_offsets().contains(&offset) != reference {
            return Err(HeapError::SlotKind {
                offset,
                expected: if reference {
                    "a reference field"
                } else {
                    "a primitive field"
                },
            });
        }
        Ok(space)
    }

    /// Stores a reference into a field declared with
    /// [`TypeDef::with_references`].
    ///
    /// # Errors
    ///
    /// Fails if `obj` or `value` is not an object, `obj` is an array, or
    /// `offset` is not a reference field.
    pub fn write_field(&self, obj: ObjectRef, offset: usize, value: Option<ObjectRef>) -> Result<()> {
        let space = self.instance_field(obj, offset, true)?;
        self.check_target(value)?;
        self.barrier.put_field(self, obj, value);
        space.store_word(obj, offset, ObjectRef::to_word(value))?;
        self.poll();
        Ok(())
    }

    /// Loads a reference field.
    ///
    /// # Errors
    ///
    /// Fails if `obj` is not an instance or `offset` is not a reference field.
    pub fn read_field(&self, obj: ObjectRef, offset: usize) -> Result<Option<ObjectRef>> {
        self.poll();
        let space = self.instance_field(obj, offset, true)?;
        space.load_word(obj, offset).map(ObjectRef::from_addr)
    }

    /// Stores a plain word into a non-reference field or primitive array
    /// element slot.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::SlotKind`] for reference slots and array length
    /// words, and [`HeapError::OffsetOutOfBounds`] outside the body.
    pub fn write_word(&self, obj: ObjectRef, offset: usize, value: usize) -> Result<()> {
        let (space, _, info) = self.resolve(obj)?;
        let writable = match info.kind() {
            TypeKind::Instance | TypeKind::Thread => !info.reference_offsets().contains(&offset),
            TypeKind::PrimitiveArray { .. } => offset >= ARRAY_DATA_OFFSET,
            TypeKind::ReferenceArray => false,
        };
        if !writable {
            return Err(HeapError::SlotKind {
                offset,
                expected: "a primitive field",
            });
        }
        space.store_word(obj, offset, value)?;
        self.poll();
        Ok(())
    }

    /// Loads any word of an object body.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OffsetOutOfBounds`] outside the body.
    pub fn read_word(&self, obj: ObjectRef, offset: usize) -> Result<usize> {
        self.poll();
        self.space_for(obj)?.load_word(obj, offset)
    }

    fn reference_array(&self, array: ObjectRef) -> Result<(&Space, usize)> {
        let (space, _, info) = self.resolve(array)?;
        if info.kind() != TypeKind::ReferenceArray {
            return Err(HeapError::WrongKind {
                obj: array,
                expected: "a reference array",
            });
        }
        let length = space.load_word(array, ARRAY_LENGTH_OFFSET)?;
        Ok((space, length))
    }

    const fn element_offset(index: usize) -> usize {
        ARRAY_DATA_OFFSET + index * WORD
    }

    /// Number of elements in an array.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::WrongKind`] for non-arrays.
    pub fn array_length(&self, array: ObjectRef) -> Result<usize> {
        self.poll();
        let (space, _, info) = self.resolve(array)?;
        if !info.kind().is_array() {
            return Err(HeapError::WrongKind {
                obj: array,
                expected: "an array",
            });
        }
        space.load_word(array, ARRAY_LENGTH_OFFSET)
    }

    /// Stores a reference into a reference array.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::IndexOutOfBounds`], or fails if `array` is not a
    /// reference array or `value` is not an object.
    pub fn write_array_element(
        &self,
        array: ObjectRef,
        index: usize,
        value: Option<ObjectRef>,
    ) -> Result<()> {
        let (space, length) = self.reference_array(array)?;
        if index >= length {
            return Err(HeapError::IndexOutOfBounds { index, length });
        }
        self.check_target(value)?;
        self.barrier.array_store(self, array, value);
        space.store_word(array, Self::element_offset(index), ObjectRef::to_word(value))?;
        self.poll();
        Ok(())
    }

    /// Loads an element of a reference array.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::IndexOutOfBounds`], or fails if `array` is not a
    /// reference array.
    pub fn read_array_element(&self, array: ObjectRef, index: usize) -> Result<Option<ObjectRef>> {
        self.poll();
        let (space, length) = self.reference_array(array)?;
        if index >= length {
            return Err(HeapError::IndexOutOfBounds { index, length });
        }
        space
            .load_word(array, Self::element_offset(index))
            .map(ObjectRef::from_addr)
    }

    /// Copies `count` elements between reference arrays. Overlapping ranges
    /// within one array are handled.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::IndexOutOfBounds`] if either range does not fit.
    pub fn array_copy(
        &self,
        src: ObjectRef,
        src_index: usize,
        dst: ObjectRef,
        dst_index: usize,
        count: usize,
    ) -> Result<()> {
        let (src_space, src_length) = self.reference_array(src)?;
        let (dst_space, dst_length) = self.reference_array(dst)?;
        for (index, length) in [(src_index, src_length), (dst_index, dst_length)] {
            if index.checked_add(count).is_none_or(|end| end > length) {
                return Err(HeapError::IndexOutOfBounds {
                    index: index.saturating_add(count),
                    length,
                });
            }
        }
        self.barrier.array_copy(self, src, dst);
        let copy = |i: usize| -> Result<()> {
            let word = src_space.load_word(src, Self::element_offset(src_index + i))?;
            dst_space.store_word(dst, Self::element_offset(dst_index + i), word)
        };
        if src == dst && dst_index > src_index {
            (0..count).rev().try_for_each(copy)?;
        } else {
            (0..count).try_for_each(copy)?;
        }
        self.poll();
        Ok(())
    }

    /// Allocates a static reference slot. Statics are roots.
    pub fn alloc_static(&self, value: Option<ObjectRef>) -> StaticSlot {
        self.record_root_store(value);
        let slot = self.roots.alloc_static(value);
        self.poll();
        slot
    }

    /// Stores into a static slot.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownStatic`] or [`HeapError::NotAnObject`].
    pub fn write_static(&self, slot: StaticSlot, value: Option<ObjectRef>) -> Result<()> {
        self.check_target(value)?;
        self.barrier.put_static(self, value);
        self.roots.store_static(slot, ObjectRef::to_word(value))?;
        self.poll();
        Ok(())
    }

    /// Loads a static slot.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownStatic`].
    pub fn read_static(&self, slot: StaticSlot) -> Result<Option<ObjectRef>> {
        self.poll();
        self.roots.load_static(slot).map(ObjectRef::from_addr)
    }

    /// Attaches an inflated monitor object to `obj`. The monitor lives as long
    /// as `obj` does.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`] for either argument.
    pub fn set_monitor(&self, obj: ObjectRef, monitor: Option<ObjectRef>) -> Result<()> {
        let (_, header, _) = self.resolve(obj)?;
        self.check_target(monitor)?;
        self.barrier.set_monitor(self, obj, monitor);
        header.set_monitor(ObjectRef::to_word(monitor));
        self.poll();
        Ok(())
    }

    /// The monitor attached to `obj`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`].
    pub fn monitor(&self, obj: ObjectRef) -> Result<Option<ObjectRef>> {
        let (_, header, _) = self.resolve(obj)?;
        Ok(ObjectRef::from_addr(header.monitor()))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Is `addr` the body of an allocated object in any region?
    #[must_use]
    pub fn is_object(&self, addr: usize) -> bool {
        self.space_of(addr).is_some_and(|space| space.is_object(addr))
    }

    /// The type of `obj`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`].
    pub fn type_of(&self, obj: ObjectRef) -> Result<Arc<TypeInfo>> {
        self.resolve(obj).map(|(_, _, info)| info)
    }

    /// Body size of `obj`, as allocated.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`].
    pub fn object_size(&self, obj: ObjectRef) -> Result<usize> {
        self.resolve(obj).map(|(_, header, _)| header.size())
    }

    /// Current color of `obj`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`].
    pub fn color(&self, obj: ObjectRef) -> Result<Color> {
        self.resolve(obj).map(|(_, header, _)| header.color())
    }

    /// Has the finalizer of `obj` run?
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::NotAnObject`].
    pub fn is_finalized(&self, obj: ObjectRef) -> Result<bool> {
        self.resolve(obj).map(|(_, header, _)| header.is_finalized())
    }

    /// Free bytes in all regions plus what the block source can still supply.
    #[must_use]
    pub fn free_memory(&self) -> usize {
        self.regions()
            .map(Region::free_size)
            .sum::<usize>()
            + self.blocks.free_memory()
    }

    /// Size of all regions plus what the block source can still supply.
    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.boot.size() + self.regions().map(Region::size).sum::<usize>() + self.blocks.free_memory()
    }

    /// Did the last allocation have to grow or collect without success?
    #[must_use]
    pub fn is_low_on_memory(&self) -> bool {
        self.low_memory.load(Ordering::Acquire)
    }

    /// Is a collection cycle running?
    #[must_use]
    pub fn is_gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Acquire)
    }

    /// Number of growable regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.region_count.load(Ordering::Acquire)
    }

    /// The boot region.
    #[must_use]
    pub const fn boot_region(&self) -> &BootRegion {
        &self.boot
    }

    /// The growable regions, in allocation order.
    pub fn regions(&self) -> Regions<'_> {
        self.first.iter()
    }

    /// The write barrier.
    #[must_use]
    pub const fn barrier(&self) -> &WriteBarrier {
        &self.barrier
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The type table.
    #[must_use]
    pub const fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Statistics of the last collection plus running totals.
    #[must_use]
    pub fn statistics(&self) -> GcStatistics {
        self.collector.statistics()
    }

    /// Per-type occupancy, gathered by a walk over the whole heap.
    #[must_use]
    pub fn heap_statistics(&self) -> HeapStatistics {
        self.poll();
        HeapStatistics::gather(self)
    }

    // ------------------------------------------------------------------
    // Collection and finalization
    // ------------------------------------------------------------------

    /// Runs a full collection on the calling thread.
    ///
    /// If another thread is collecting, waits for it and then runs one more,
    /// so everything unreachable at the time of the call is found.
    pub fn gc(&self) {
        self.poll();
        while !self.collector.collect(self) {}
    }

    /// Asks the GC thread for a collection; with `wait`, blocks until it ran.
    /// Without a GC thread the collection runs here.
    pub fn request_gc(&self, wait: bool) {
        if self.gc_trigger.is_serviced() {
            let ticket = self.gc_trigger.request();
            if wait {
                self.gc_trigger.wait_for(self.helper.as_ref(), ticket);
            }
        } else {
            self.gc();
        }
    }

    /// Requests a finalization pass; with `wait`, blocks until it is done.
    /// Returns `false` if the finalizer thread stopped before serving it.
    pub fn trigger_finalization(&self, wait: bool) -> bool {
        finalizer::trigger(self, wait)
    }

    /// Runs every pending finalizer before returning.
    pub fn run_finalization(&self) {
        self.trigger_finalization(true);
    }

    /// Spawns the GC and finalizer threads. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Spawn`] if a thread cannot be started.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        for (trigger, kind) in [
            (&self.gc_trigger, DaemonKind::Gc),
            (&self.finalizer_trigger, DaemonKind::Finalizer),
        ] {
            if let Some(handle) = daemon::spawn(self, trigger, kind)? {
                self.daemons.lock().push(handle);
            }
        }
        self.update_trigger_size();
        Ok(())
    }

    /// Stops the GC and finalizer threads and waits for them to exit.
    /// Pending requests are dropped.
    pub fn shutdown(&self) {
        self.gc_trigger.shutdown();
        self.finalizer_trigger.shutdown();
        let daemons = std::mem::take(&mut *self.daemons.lock());
        let me = thread::current().id();
        safepoint::blocking(self.helper.as_ref(), || {
            for handle in daemons {
                if handle.thread().id() != me {
                    let _ = handle.join();
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn poll(&self) {
        self.helper.poll();
    }

    /// Barrier hook for stores into roots that are not heap fields.
    pub(crate) fn record_root_store(&self, value: Option<ObjectRef>) {
        self.barrier.put_static(self, value);
    }

    pub(crate) const fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub(crate) const fn helper(&self) -> &Arc<dyn HeapHelper> {
        &self.helper
    }

    pub(crate) const fn collector(&self) -> &CollectionManager {
        &self.collector
    }

    pub(crate) fn finalizer_trigger(&self) -> &Trigger {
        &self.finalizer_trigger
    }

    pub(crate) const fn finalization_lock(&self) -> &ReentrantMutex<()> {
        &self.finalization
    }

    pub(crate) const fn finalizer_slot(&self) -> StaticSlot {
        self.finalizer_slot
    }

    /// The region span containing `addr`.
    pub(crate) fn space_of(&self, addr: usize) -> Option<&Space> {
        if self.boot.in_heap(addr) {
            return Some(self.boot.space());
        }
        self.regions()
            .find(|region| region.in_heap(addr))
            .map(Region::space)
    }

    /// Header of an allocated object.
    pub(crate) fn header(&self, obj: ObjectRef) -> Option<RawHeader> {
        self.space_of(obj.addr())?.header(obj)
    }

    pub(crate) fn set_gc_active(&self, active: bool) {
        self.gc_active.store(active, Ordering::Release);
    }

    /// End of a cycle: allocation restarts at the first region.
    pub(crate) fn finish_cycle(&self) {
        *self.current.lock() = Arc::clone(&self.first);
        self.allocated_since_trigger.store(0, Ordering::Release);
        self.update_trigger_size();
        self.set_gc_active(false);
    }
}

impl Drop for HeapManager {
    fn drop(&mut self) {
        self.gc_trigger.shutdown();
        self.finalizer_trigger.shutdown();
    }
}

impl std::fmt::Debug for HeapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapManager")
            .field("boot", &self.boot)
            .field("regions", &self.region_count())
            .field("statics", &self.roots.static_count())
            .field("gc_active", &self.is_gc_active())
            .field("low_memory", &self.is_low_on_memory())
            .finish_non_exhaustive()
    }
}
