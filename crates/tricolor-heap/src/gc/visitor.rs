//! The per-object passes of a collection: mark, set-white, sweep and verify.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HeapError;
use crate::gc::mark_stack::MarkStack;
use crate::layout::{Color, ObjectRef, RawHeader, WORD};
use crate::manager::HeapManager;
use crate::region::{GrowableRegion, ObjectVisitor, Region, Space};
use crate::roots::ThreadRoots;
use crate::types::{TypeId, TypeInfo, TypeKind, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET};

/// Read-only state shared by every pass of one cycle.
pub(crate) struct CycleContext<'a> {
    pub(crate) heap: &'a HeapManager,
    pub(crate) types: Vec<Arc<TypeInfo>>,
    pub(crate) threads: HashMap<usize, Arc<ThreadRoots>>,
}

impl<'a> CycleContext<'a> {
    pub(crate) fn new(heap: &'a HeapManager) -> Self {
        Self {
            heap,
            types: heap.types().snapshot(),
            threads: heap.roots().threads_by_object(),
        }
    }

    fn die(&self, reason: &str) -> ! {
        self.heap.helper().die(reason)
    }

    pub(crate) fn type_of(&self, obj: ObjectRef, header: RawHeader) -> &TypeInfo {
        let found = TypeId::from_word(header.type_word())
            .and_then(|id| self.types.get(id.index()))
            .map(Arc::as_ref);
        match found {
            Some(info) => info,
            None => self.die(&format!(
                "object {obj} has unknown type word {:#x}",
                header.type_word()
            )),
        }
    }

    fn locate(&self, obj: ObjectRef) -> (&Space, RawHeader) {
        match self.heap.space_of(obj.addr()) {
            Some(space) => match space.header(obj) {
                Some(header) => (space, header),
                None => self.die(&format!("{obj} is inside the heap but is not an object")),
            },
            None => self.die(&format!("{obj} lies outside every heap region")),
        }
    }

    /// Calls `f` with every reference word held by `obj`: array elements or
    /// reference fields, the shadow stack of a thread, the type descriptor
    /// and the monitor. Null words are skipped.
    ///
    /// A reference slot outside the object is fatal.
    fn for_each_child(&self, obj: ObjectRef, f: impl FnMut(usize)) {
        self.for_each_child_checked(obj, f, |offset, err| {
            self.die(&format!("reference slot {offset} of {obj}: {err}"))
        });
    }

    /// Like [`Self::for_each_child`], but reports reference slots outside
    /// the object to `bad_slot` and skips them.
    fn for_each_child_checked(
        &self,
        obj: ObjectRef,
        mut f: impl FnMut(usize),
        mut bad_slot: impl FnMut(usize, HeapError),
    ) {
        let (space, header) = self.locate(obj);
        let info = self.type_of(obj, header);
        let mut load = |offset: usize| match space.load_word(obj, offset) {
            Ok(word) => Some(word),
            Err(err) => {
                bad_slot(offset, err);
                None
            }
        };
        match info.kind() {
            TypeKind::ReferenceArray => {
                let length = load(ARRAY_LENGTH_OFFSET).unwrap_or(0);
                for index in 0..length {
                    match load(ARRAY_DATA_OFFSET + index * WORD) {
                        Some(0) => {}
                        Some(word) => f(word),
                        // The rest of the array is out of bounds too.
                        None => break,
                    }
                }
            }
            TypeKind::PrimitiveArray { .. } => {}
            TypeKind::Instance | TypeKind::Thread => {
                for &offset in info.reference_offsets() {
                    if let Some(word) = load(offset).filter(|&word| word != 0) {
                        f(word);
                    }
                }
            }
        }
        if info.kind() == TypeKind::Thread {
            if let Some(roots) = self.threads.get(&obj.addr()) {
                roots.stack.lock().iter().for_each(&mut f);
            }
        }
        if let Some(descriptor) = info.descriptor() {
            f(descriptor.addr());
        }
        let monitor = header.monitor();
        if monitor != 0 {
            f(monitor);
        }
    }
}

/// Greys reachable objects and drains the mark stack.
pub(crate) struct MarkVisitor<'c, 'h> {
    cx: &'c CycleContext<'h>,
    stack: MarkStack,
    root_set: bool,
    spare_yellow: bool,
    marked: usize,
}

impl<'c, 'h> MarkVisitor<'c, 'h> {
    pub(crate) fn new(cx: &'c CycleContext<'h>, capacity: usize) -> Self {
        Self {
            cx,
            stack: MarkStack::new(capacity),
            root_set: true,
            spare_yellow: false,
            marked: 0,
        }
    }

    /// Clears the stack and the per-iteration counter.
    pub(crate) fn reset(&mut self) {
        self.stack.reset();
        self.marked = 0;
    }

    pub(crate) fn set_root_set(&mut self, root_set: bool) {
        self.root_set = root_set;
    }

    /// While set, yellow objects are left yellow: they are traced through
    /// their own finalizable walk, and greying one would whiten it before
    /// its finalizer ran.
    pub(crate) fn set_spare_yellow(&mut self, spare_yellow: bool) {
        self.spare_yellow = spare_yellow;
    }

    pub(crate) const fn marked_objects(&self) -> usize {
        self.marked
    }

    pub(crate) const fn is_overflow(&self) -> bool {
        self.stack.is_overflow()
    }

    /// Marks from a root word (static or thread object).
    pub(crate) fn mark_root(&mut self, word: usize) -> bool {
        match ObjectRef::from_addr(word) {
            Some(obj) => self.visit(obj),
            None => true,
        }
    }

    /// Keeps everything `obj` refers to alive without changing the color of
    /// `obj` itself. Used for objects awaiting finalization.
    pub(crate) fn mark_referents(&mut self, obj: ObjectRef) -> bool {
        let cx = self.cx;
        cx.for_each_child(obj, |child| self.process_child(obj, child));
        self.drain();
        !self.stack.is_overflow()
    }

    /// Turns white or yellow into grey. Returns `false` if the object was
    /// already grey or black, or is a spared yellow one.
    fn shade(&self, header: RawHeader) -> bool {
        loop {
            let color = header.color();
            if color > Color::White || (self.spare_yellow && color == Color::Yellow) {
                return false;
            }
            if header.cas_color(color, Color::Grey) {
                return true;
            }
        }
    }

    fn process_child(&mut self, parent: ObjectRef, child: usize) {
        let Some(child) = ObjectRef::from_addr(child) else {
            return;
        };
        let header = match self.cx.heap.space_of(child.addr()) {
            Some(space) => match space.header(child) {
                Some(header) => header,
                None => self
                    .cx
                    .die(&format!("{parent} refers to {child}, which is not an object")),
            },
            None => self
                .cx
                .die(&format!("{parent} refers to {child}, outside every heap region")),
        };
        if self.shade(header) {
            self.stack.push(child);
        }
    }

    fn drain(&mut self) {
        let cx = self.cx;
        while let Some(obj) = self.stack.pop() {
            cx.for_each_child(obj, |child| self.process_child(obj, child));
            let (_, header) = cx.locate(obj);
            header.set_color(Color::Black);
            self.marked += 1;
        }
    }
}

impl ObjectVisitor for MarkVisitor<'_, '_> {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        let (_, header) = self.cx.locate(obj);
        let color = header.color();
        if color == Color::Black {
            return true;
        }
        if self.root_set || color == Color::Grey {
            // Grey objects found by a re-scan are already shaded.
            if self.shade(header) || header.color() == Color::Grey {
                self.stack.push(obj);
                self.drain();
            }
        }
        !self.stack.is_overflow()
    }
}

/// Resets everything but yellow to white.
pub(crate) struct SetWhiteVisitor<'r> {
    space: &'r Space,
}

impl<'r> SetWhiteVisitor<'r> {
    pub(crate) const fn new(space: &'r Space) -> Self {
        Self { space }
    }
}

impl ObjectVisitor for SetWhiteVisitor<'_> {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        if let Some(header) = self.space.header(obj) {
            if header.color() != Color::Yellow {
                header.set_color(Color::White);
            }
        }
        true
    }
}

/// Turns unreachable objects with a pending finalizer yellow, before the
/// sweep, so their referents can be kept alive for the finalizer.
pub(crate) struct FinalizableVisitor<'c, 'h, 'r> {
    cx: &'c CycleContext<'h>,
    region: &'r GrowableRegion,
    pub(crate) found: Vec<ObjectRef>,
}

impl<'c, 'h, 'r> FinalizableVisitor<'c, 'h, 'r> {
    pub(crate) const fn new(cx: &'c CycleContext<'h>, region: &'r GrowableRegion) -> Self {
        Self {
            cx,
            region,
            found: Vec::new(),
        }
    }
}

impl ObjectVisitor for FinalizableVisitor<'_, '_, '_> {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        let Some(header) = self.region.space().header(obj) else {
            return true;
        };
        if header.color() == Color::White
            && !header.is_finalized()
            && self.cx.type_of(obj, header).has_finalizer()
            && header.cas_color(Color::White, Color::Yellow)
        {
            self.found.push(obj);
        }
        true
    }
}

/// Frees white objects and whitens survivors.
///
/// Runs after [`FinalizableVisitor`], so a white object here is either
/// finalized already or has no finalizer.
pub(crate) struct SweepVisitor<'c, 'h, 'r> {
    cx: &'c CycleContext<'h>,
    region: &'r GrowableRegion,
    pub(crate) freed_bytes: usize,
    pub(crate) freed_objects: usize,
}

impl<'c, 'h, 'r> SweepVisitor<'c, 'h, 'r> {
    pub(crate) const fn new(cx: &'c CycleContext<'h>, region: &'r GrowableRegion) -> Self {
        Self {
            cx,
            region,
            freed_bytes: 0,
            freed_objects: 0,
        }
    }
}

impl ObjectVisitor for SweepVisitor<'_, '_, '_> {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        let Some(header) = self.region.space().header(obj) else {
            return true;
        };
        match header.color() {
            Color::White => {
                debug_assert!(
                    header.is_finalized() || !self.cx.type_of(obj, header).has_finalizer(),
                    "{obj} reached the sweep with its finalizer pending"
                );
                let size = header.size();
                if self.region.free(obj) {
                    self.freed_bytes += size;
                    self.freed_objects += 1;
                }
            }
            Color::Grey | Color::Black => header.set_color(Color::White),
            Color::Yellow => {}
        }
        true
    }
}

/// Counts references that do not point at an object and reference slots
/// that lie outside their object.
pub(crate) struct VerifyVisitor<'c, 'h> {
    cx: &'c CycleContext<'h>,
    pub(crate) errors: usize,
}

impl<'c, 'h> VerifyVisitor<'c, 'h> {
    pub(crate) const fn new(cx: &'c CycleContext<'h>) -> Self {
        Self { cx, errors: 0 }
    }
}

impl ObjectVisitor for VerifyVisitor<'_, '_> {
    fn visit(&mut self, obj: ObjectRef) -> bool {
        let heap = self.cx.heap;
        let mut invalid = 0;
        let mut bad_slots = 0;
        self.cx.for_each_child_checked(
            obj,
            |child| {
                if !heap.is_object(child) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(parent = %obj, "invalid reference to {child:#x}");
                    invalid += 1;
                }
            },
            |_offset, _err| {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    parent = %obj,
                    offset = _offset,
                    error = %_err,
                    "reference slot out of bounds"
                );
                bad_slots += 1;
            },
        );
        self.errors += invalid + bad_slots;
        true
    }
}
