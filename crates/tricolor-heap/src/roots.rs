//! The root set: statics plus the shadow stacks of attached threads.
//!
//! Marking starts from here. Every static is a root, and so is the thread
//! object of every attached thread; a thread's shadow stack is scanned when
//! its thread object is marked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{HeapError, Result};
use crate::layout::ObjectRef;
use crate::manager::HeapManager;
use crate::safepoint::MutatorGuard;

/// Handle to a static reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticSlot(usize);

impl StaticSlot {
    /// Position of the slot in the statics table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Reference slots of one thread, with frame markers for scoped rooting.
#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    slots: Vec<usize>,
    frame_markers: Vec<usize>,
}

impl ShadowStack {
    fn push(&mut self, word: usize) -> usize {
        self.slots.push(word);
        self.slots.len() - 1
    }

    fn pop(&mut self) -> Option<usize> {
        let floor = self.frame_markers.last().copied().unwrap_or(0);
        if self.slots.len() > floor {
            self.slots.pop()
        } else {
            None
        }
    }

    fn push_frame(&mut self) {
        self.frame_markers.push(self.slots.len());
    }

    fn pop_frame(&mut self) -> bool {
        match self.frame_markers.pop() {
            Some(marker) => {
                self.slots.truncate(marker);
                true
            }
            None => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().copied().filter(|&word| word != 0)
    }
}

/// An attached thread's object and shadow stack.
#[derive(Debug)]
pub(crate) struct ThreadRoots {
    thread: ObjectRef,
    pub(crate) stack: Mutex<ShadowStack>,
}

impl ThreadRoots {
    pub(crate) const fn thread(&self) -> ObjectRef {
        self.thread
    }
}

#[derive(Debug, Default)]
pub(crate) struct RootSet {
    statics: RwLock<Vec<AtomicUsize>>,
    threads: Mutex<Vec<Arc<ThreadRoots>>>,
}

impl RootSet {
    pub(crate) fn alloc_static(&self, initial: Option<ObjectRef>) -> StaticSlot {
        let mut statics = self.statics.write();
        statics.push(AtomicUsize::new(ObjectRef::to_word(initial)));
        StaticSlot(statics.len() - 1)
    }

    pub(crate) fn load_static(&self, slot: StaticSlot) -> Result<usize> {
        self.statics
            .read()
            .get(slot.0)
            .map(|word| word.load(Ordering::Acquire))
            .ok_or(HeapError::UnknownStatic(slot.0))
    }

    pub(crate) fn store_static(&self, slot: StaticSlot, word: usize) -> Result<()> {
        self.statics
            .read()
            .get(slot.0)
            .map(|cell| cell.store(word, Ordering::Release))
            .ok_or(HeapError::UnknownStatic(slot.0))
    }

    /// Non-null statics, in slot order.
    pub(crate) fn statics(&self) -> Vec<usize> {
        self.statics
            .read()
            .iter()
            .map(|word| word.load(Ordering::Acquire))
            .filter(|&word| word != 0)
            .collect()
    }

    pub(crate) fn static_count(&self) -> usize {
        self.statics.read().len()
    }

    pub(crate) fn register_thread(&self, thread: ObjectRef) -> Arc<ThreadRoots> {
        let roots = Arc::new(ThreadRoots {
            thread,
            stack: Mutex::new(ShadowStack::default()),
        });
        self.threads.lock().push(Arc::clone(&roots));
        roots
    }

    pub(crate) fn unregister_thread(&self, roots: &Arc<ThreadRoots>) {
        self.threads.lock().retain(|other| !Arc::ptr_eq(other, roots));
    }

    pub(crate) fn threads(&self) -> Vec<Arc<ThreadRoots>> {
        self.threads.lock().clone()
    }

    /// Attached threads keyed by thread object address.
    pub(crate) fn threads_by_object(&self) -> HashMap<usize, Arc<ThreadRoots>> {
        self.threads
            .lock()
            .iter()
            .map(|roots| (roots.thread.addr(), Arc::clone(roots)))
            .collect()
    }
}

/// A thread attached to a heap.
///
/// While the handle lives, the thread takes part in stop-the-world pauses,
/// its thread object is a root, and every reference pushed on its shadow
/// stack is kept alive. Dropping the handle detaches the thread.
///
/// # Example
///
/// ```
/// use tricolor_heap::{HeapConfig, HeapManager, TypeDef, WORD};
///
/// let heap = HeapManager::builder(HeapConfig::default()).build().unwrap();
/// let thread_type = heap.register_type(TypeDef::thread("Thread", WORD)).unwrap();
/// let node = heap.register_type(TypeDef::instance("Node", WORD)).unwrap();
///
/// let mut thread = heap.attach_thread(thread_type).unwrap();
/// let obj = heap.new_object(node).unwrap();
/// thread.push(Some(obj));
/// heap.gc();
/// assert!(heap.is_object(obj.addr()));
/// ```
pub struct MutatorThread {
    heap: Arc<HeapManager>,
    roots: Arc<ThreadRoots>,
    _guard: MutatorGuard,
}

impl MutatorThread {
    pub(crate) fn new(heap: Arc<HeapManager>, roots: Arc<ThreadRoots>, guard: MutatorGuard) -> Self {
        Self {
            heap,
            roots,
            _guard: guard,
        }
    }

    /// The thread object.
    #[must_use]
    pub fn thread(&self) -> ObjectRef {
        self.roots.thread
    }

    /// Pushes a reference, returning its slot index.
    ///
    /// The slot is written before the safepoint poll, so a freshly allocated
    /// object pushed here is rooted before any collection can start.
    pub fn push(&mut self, obj: Option<ObjectRef>) -> usize {
        self.heap.record_root_store(obj);
        let index = self.roots.stack.lock().push(ObjectRef::to_word(obj));
        self.heap.poll();
        index
    }

    /// Pops the top slot of the current frame.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.roots
            .stack
            .lock()
            .pop()
            .and_then(ObjectRef::from_addr)
    }

    /// Reads slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjectRef> {
        self.roots
            .stack
            .lock()
            .slots
            .get(index)
            .copied()
            .and_then(ObjectRef::from_addr)
    }

    /// Overwrites slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::IndexOutOfBounds`] if the slot does not exist.
    pub fn set(&mut self, index: usize, obj: Option<ObjectRef>) -> Result<()> {
        self.heap.record_root_store(obj);
        {
            let mut stack = self.roots.stack.lock();
            let length = stack.slots.len();
            let slot = stack
                .slots
                .get_mut(index)
                .ok_or(HeapError::IndexOutOfBounds { index, length })?;
            *slot = ObjectRef::to_word(obj);
        }
        self.heap.poll();
        Ok(())
    }

    /// Opens a frame; [`pop_frame`](Self::pop_frame) drops every slot pushed since.
    pub fn push_frame(&mut self) {
        self.roots.stack.lock().push_frame();
    }

    /// Closes the innermost frame. Returns `false` if no frame was open.
    pub fn pop_frame(&mut self) -> bool {
        self.roots.stack.lock().pop_frame()
    }

    /// Number of slots on the shadow stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.stack.lock().slots.len()
    }

    /// `true` if the shadow stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The heap this thread is attached to.
    #[must_use]
    pub fn heap(&self) -> &Arc<HeapManager> {
        &self.heap
    }
}

impl Drop for MutatorThread {
    fn drop(&mut self) {
        self.heap.roots().unregister_thread(&self.roots);
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("thread", &self.roots.thread)
            .field("slots", &self.len())
            .finish_non_exhaustive()
    }
}
