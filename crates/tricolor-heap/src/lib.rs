//! A non-moving tri-color mark-sweep heap.
//!
//! `tricolor-heap` manages objects laid out as `[header | body]` blocks in
//! mapped regions and reclaims the unreachable ones with a stop-the-world
//! mark-sweep collector:
//!
//! - **Regions**: a permanent [`BootRegion`] built from a boot image, plus
//!   [`GrowableRegion`]s with first-fit allocation, O(1) free and explicit
//!   defragmentation.
//! - **Tri-color marking** with a bounded [`MarkStack`]: an overflowing stack
//!   or a store caught by the [`WriteBarrier`] triggers another iteration until
//!   a fixpoint is reached.
//! - **Finalization**: unreachable objects with a finalizer turn yellow, are
//!   finalized exactly once by the finalizer thread, and freed by a later
//!   cycle.
//! - **Safepoints**: attached mutator threads park while a cycle runs.
//!
//! # Quick Start
//!
//! ```
//! use tricolor_heap::{HeapConfig, HeapManager, TypeDef, WORD};
//!
//! let heap = HeapManager::builder(HeapConfig::default()).build().unwrap();
//! let list = heap
//!     .register_type(TypeDef::instance("List", 2 * WORD).with_references([0]))
//!     .unwrap();
//!
//! let head = heap.new_object(list).unwrap();
//! let roots = heap.alloc_static(Some(head));
//! let tail = heap.new_object(list).unwrap();
//! heap.write_field(head, 0, Some(tail)).unwrap();
//!
//! heap.gc();
//! assert_eq!(heap.read_field(head, 0).unwrap(), Some(tail));
//!
//! heap.write_static(roots, None).unwrap();
//! heap.gc();
//! assert!(!heap.is_object(head.addr()));
//! ```
//!
//! # Finalization
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use tricolor_heap::{HeapConfig, HeapManager, TypeDef, WORD};
//!
//! let runs = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&runs);
//! let heap = HeapManager::builder(HeapConfig::default()).build().unwrap();
//! let file = heap
//!     .register_type(TypeDef::instance("File", WORD).with_finalizer(move |_, _| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let obj = heap.new_object(file).unwrap();
//! heap.gc(); // turns `obj` yellow and runs its finalizer
//! assert_eq!(runs.load(Ordering::SeqCst), 1);
//! heap.gc(); // frees it
//! assert!(!heap.is_object(obj.addr()));
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
pub mod gc;
mod layout;
mod manager;
pub mod metrics;
pub mod region;
mod roots;
mod safepoint;
mod stats;
mod trace;
mod types;

pub use config::{
    HeapConfig, TraceFlags, DEFAULT_GC_TRIGGER_RATIO, DEFAULT_MARK_STACK_CAPACITY,
    DEFAULT_REGION_SIZE,
};
pub use error::{HeapError, Result};
pub use gc::{CollectionManager, MarkStack, WriteBarrier};
pub use layout::{Color, ObjectRef, HEADER_SIZE, OBJECT_ALIGN, WORD};
pub use manager::{BlockSource, HeapBuilder, HeapManager, DEFAULT_BLOCK_BUDGET};
pub use metrics::GcStatistics;
pub use region::{BootImage, BootImageBuilder, BootRegion, GrowableRegion, Region};
pub use roots::{MutatorThread, StaticSlot};
pub use safepoint::{HeapHelper, MutatorGuard, Safepoints};
pub use stats::{HeapStatistics, TypeUsage};
pub use trace::GcId;
pub use types::{
    FinalizerError, TypeDef, TypeId, TypeInfo, TypeKind, TypeRegistry, ARRAY_DATA_OFFSET,
    ARRAY_LENGTH_OFFSET,
};
