//! Collection: marking, sweeping, the write barrier and finalization.
//!
//! - [`barrier`]: the incremental-update write barrier mutators call on
//!   every reference store.
//! - [`mark_stack`]: the bounded grey stack; overflow costs another mark
//!   iteration, never correctness.
//! - `collector`: one stop-the-world cycle, mark to cleanup.
//! - `finalizer` and `daemon`: the finalization pass and the background
//!   threads that serve collection and finalization requests.

pub mod barrier;
pub(crate) mod collector;
pub(crate) mod daemon;
pub(crate) mod finalizer;
pub mod mark_stack;
mod visitor;

pub use barrier::WriteBarrier;
pub use collector::CollectionManager;
pub use mark_stack::MarkStack;
