//! Object model: the per-type layout the collector scans by.
//!
//! The collector never interprets object bodies on its own. Everything it
//! needs to know about an object (size, where its references live, whether it
//! has a finalizer) comes from the [`TypeInfo`] named by the header's type word.
//!
//! Arrays share one layout: the first body word is the element count, the
//! elements follow.

use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{ReentrantMutex, RwLock};

use crate::error::{HeapError, Result};
use crate::layout::{ObjectRef, FREE, WORD};
use crate::manager::HeapManager;

/// Error type returned by finalizers.
pub type FinalizerError = Box<dyn Error + Send + Sync>;

/// A finalizer, run at most once per object after it became unreachable.
pub type Finalizer = Arc<dyn Fn(&HeapManager, ObjectRef) -> Result<(), FinalizerError> + Send + Sync>;

/// Runs once before the first instance of a type is allocated.
pub type Initializer = Arc<dyn Fn(&HeapManager) + Send + Sync>;

/// Offset of the length word in an array body.
pub const ARRAY_LENGTH_OFFSET: usize = 0;

/// Offset of the first element in an array body.
pub const ARRAY_DATA_OFFSET: usize = WORD;

/// Index of a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(usize);

impl TypeId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Position of the type in its registry.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Header encoding. Zero is reserved for free blocks.
    pub(crate) const fn to_word(self) -> usize {
        self.0 + 1
    }

    pub(crate) const fn from_word(word: usize) -> Option<Self> {
        if word == FREE {
            None
        } else {
            Some(Self(word - 1))
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shape of a type's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed-size object with references at the offsets of its type.
    Instance,
    /// Like `Instance`, and additionally owns a shadow stack of roots.
    Thread,
    /// Array whose elements are references.
    ReferenceArray,
    /// Array of plain data elements of the given byte size.
    PrimitiveArray {
        /// Size of one element in bytes.
        element_size: usize,
    },
}

impl TypeKind {
    /// `true` for both array kinds.
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::ReferenceArray | Self::PrimitiveArray { .. })
    }
}

/// Definition of a type, consumed by [`TypeRegistry::register`].
///
/// # Example
///
/// ```
/// use tricolor_heap::{TypeDef, TypeRegistry, WORD};
///
/// let types = TypeRegistry::new();
/// let node = types
///     .register(TypeDef::instance("Node", 2 * WORD).with_references([0, WORD]))
///     .unwrap();
/// assert_eq!(types.get(node).unwrap().reference_offsets(), &[0, WORD]);
/// ```
pub struct TypeDef {
    name: String,
    kind: TypeKind,
    instance_size: usize,
    reference_offsets: Vec<usize>,
    finalizer: Option<Finalizer>,
    initializer: Option<Initializer>,
}

impl TypeDef {
    fn new(name: impl Into<String>, kind: TypeKind, instance_size: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            instance_size,
            reference_offsets: Vec::new(),
            finalizer: None,
            initializer: None,
        }
    }

    /// A plain object with a body of `size` bytes.
    #[must_use]
    pub fn instance(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, TypeKind::Instance, size)
    }

    /// A thread object with a body of `size` bytes.
    #[must_use]
    pub fn thread(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, TypeKind::Thread, size)
    }

    /// An array of references.
    #[must_use]
    pub fn reference_array(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::ReferenceArray, 0)
    }

    /// An array of `element_size`-byte plain values.
    #[must_use]
    pub fn primitive_array(name: impl Into<String>, element_size: usize) -> Self {
        Self::new(name, TypeKind::PrimitiveArray { element_size }, 0)
    }

    /// Byte offsets of the reference fields of an instance.
    #[must_use]
    pub fn with_references(mut self, offsets: impl IntoIterator<Item = usize>) -> Self {
        self.reference_offsets.extend(offsets);
        self
    }

    /// Attaches a finalizer.
    #[must_use]
    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(&HeapManager, ObjectRef) -> Result<(), FinalizerError> + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    /// Attaches an initializer, run before the first allocation of the type.
    #[must_use]
    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&HeapManager) + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| HeapError::InvalidType {
            name: self.name.clone(),
            reason,
        };
        match self.kind {
            TypeKind::Instance | TypeKind::Thread => {
                for &offset in &self.reference_offsets {
                    if offset % WORD != 0 {
                        return Err(invalid(format!("reference offset {offset} is not word aligned")));
                    }
                    if offset + WORD > self.instance_size {
                        return Err(invalid(format!(
                            "reference offset {offset} is outside a body of {} bytes",
                            self.instance_size
                        )));
                    }
                }
            }
            TypeKind::ReferenceArray => {
                if !self.reference_offsets.is_empty() {
                    return Err(invalid("arrays have no reference fields".into()));
                }
            }
            TypeKind::PrimitiveArray { element_size } => {
                if element_size == 0 {
                    return Err(invalid("element size must be at least one byte".into()));
                }
                if !self.reference_offsets.is_empty() {
                    return Err(invalid("arrays have no reference fields".into()));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .field("reference_offsets", &self.reference_offsets)
            .field("finalizer", &self.finalizer.is_some())
            .finish_non_exhaustive()
    }
}

/// A registered type.
pub struct TypeInfo {
    id: TypeId,
    name: String,
    kind: TypeKind,
    instance_size: usize,
    reference_offsets: Box<[usize]>,
    finalizer: Option<Finalizer>,
    initializer: Option<Initializer>,
    /// Held while the initializer runs; the cell records that it started.
    pub(crate) init_lock: ReentrantMutex<Cell<bool>>,
    pub(crate) initialized: AtomicBool,
    descriptor: OnceLock<ObjectRef>,
    instances: AtomicUsize,
}

impl TypeInfo {
    /// The type's id.
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// The type's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type's kind.
    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Body size of an instance. Zero for arrays.
    #[must_use]
    pub const fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Offsets of the reference fields of an instance.
    #[must_use]
    pub fn reference_offsets(&self) -> &[usize] {
        &self.reference_offsets
    }

    /// Does the type have a finalizer?
    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    pub(crate) fn finalizer(&self) -> Option<&Finalizer> {
        self.finalizer.as_ref()
    }

    pub(crate) fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    /// The object describing this type, if one was bound.
    #[must_use]
    pub fn descriptor(&self) -> Option<ObjectRef> {
        self.descriptor.get().copied()
    }

    pub(crate) fn bind_descriptor(&self, descriptor: ObjectRef) -> bool {
        self.descriptor.set(descriptor).is_ok()
    }

    /// Number of instances allocated so far.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.load(Ordering::Relaxed)
    }

    pub(crate) fn count_instance(&self) {
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    /// Size of one array element, `None` for non-arrays.
    #[must_use]
    pub const fn element_size(&self) -> Option<usize> {
        match self.kind {
            TypeKind::ReferenceArray => Some(WORD),
            TypeKind::PrimitiveArray { element_size } => Some(element_size),
            TypeKind::Instance | TypeKind::Thread => None,
        }
    }

    /// Body size of an array of `length` elements.
    #[must_use]
    pub fn array_body_size(&self, length: usize) -> Option<usize> {
        self.element_size()?
            .checked_mul(length)?
            .checked_add(ARRAY_DATA_OFFSET)
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .field("instances", &self.instance_count())
            .finish_non_exhaustive()
    }
}

/// The table of registered types, indexed by [`TypeId`].
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: RwLock<Vec<Arc<TypeInfo>>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidType`] when a reference offset is unaligned
    /// or lies outside the instance body, or the array definition is malformed.
    pub fn register(&self, def: TypeDef) -> Result<TypeId> {
        def.validate()?;
        let mut types = self.types.write();
        let id = TypeId::from_index(types.len());
        types.push(Arc::new(TypeInfo {
            id,
            name: def.name,
            kind: def.kind,
            instance_size: def.instance_size,
            reference_offsets: def.reference_offsets.into_boxed_slice(),
            finalizer: def.finalizer,
            initializer: def.initializer,
            init_lock: ReentrantMutex::new(Cell::new(false)),
            initialized: AtomicBool::new(false),
            descriptor: OnceLock::new(),
            instances: AtomicUsize::new(0),
        }));
        Ok(id)
    }

    /// Looks up a type.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::UnknownType`] for an id this registry never issued.
    pub fn get(&self, id: TypeId) -> Result<Arc<TypeInfo>> {
        self.types
            .read()
            .get(id.index())
            .cloned()
            .ok_or(HeapError::UnknownType(id))
    }

    pub(crate) fn get_by_word(&self, word: usize) -> Option<Arc<TypeInfo>> {
        let id = TypeId::from_word(word)?;
        self.types.read().get(id.index()).cloned()
    }

    /// A point-in-time copy of the table, for lock-free lookups during a cycle.
    pub(crate) fn snapshot(&self) -> Vec<Arc<TypeInfo>> {
        self.types.read().clone()
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// `true` if no type has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}
