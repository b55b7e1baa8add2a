//! Recoverable heap errors.
//!
//! Heap corruption is not represented here: it is reported through
//! [`HeapHelper::die`](crate::HeapHelper::die) and never returns.

use std::io;

use thiserror::Error;

use crate::layout::ObjectRef;
use crate::types::TypeId;

/// Result type used throughout the crate.
pub type Result<T, E = HeapError> = std::result::Result<T, E>;

/// Errors reported to heap callers.
#[derive(Debug, Error)]
pub enum HeapError {
    /// No region could satisfy the request, even after a collection.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested body size.
        size: usize,
    },

    /// The object can never fit in a region.
    #[error("object of {size} bytes exceeds the largest allocatable size of {limit} bytes")]
    ObjectTooLarge {
        /// Requested body size.
        size: usize,
        /// Largest body size a region can hold.
        limit: usize,
    },

    /// The type id was not issued by this heap's registry.
    #[error("unknown type {0}")]
    UnknownType(TypeId),

    /// The address is not the start of an allocated object.
    #[error("{0:#x} is not an object")]
    NotAnObject(usize),

    /// A field offset lies outside the object body.
    #[error("offset {offset} is outside an object body of {size} bytes")]
    OffsetOutOfBounds {
        /// Requested byte offset.
        offset: usize,
        /// Body size of the object.
        size: usize,
    },

    /// An array index lies outside the array.
    #[error("index {index} is outside an array of length {length}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Array length.
        length: usize,
    },

    /// The operation does not apply to this kind of object.
    #[error("{obj} is not {expected}")]
    WrongKind {
        /// The object.
        obj: ObjectRef,
        /// What the operation needed.
        expected: &'static str,
    },

    /// The type cannot be used this way.
    #[error("type {ty} is not {expected}")]
    KindMismatch {
        /// The type.
        ty: TypeId,
        /// What the operation needed.
        expected: &'static str,
    },

    /// The slot at this offset holds the other kind of value.
    #[error("offset {offset} is not {expected}")]
    SlotKind {
        /// Requested byte offset.
        offset: usize,
        /// What the operation needed.
        expected: &'static str,
    },

    /// The static slot was never allocated.
    #[error("unknown static slot {0}")]
    UnknownStatic(usize),

    /// A type definition was rejected.
    #[error("invalid type definition `{name}`: {reason}")]
    InvalidType {
        /// Type name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The heap configuration was rejected.
    #[error("invalid heap configuration: {0}")]
    Config(String),

    /// A boot image does not describe a well-formed object sequence.
    #[error("corrupt boot image at {addr:#x}: {reason}")]
    CorruptBootImage {
        /// Address of the offending object.
        addr: usize,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The boot image builder ran out of room.
    #[error("boot image needs {needed} more bytes but only {available} remain")]
    BootImageFull {
        /// Bytes needed by the rejected object, header included.
        needed: usize,
        /// Bytes left in the image.
        available: usize,
    },

    /// Mapping memory failed.
    #[error("failed to map heap memory")]
    Map(#[from] io::Error),

    /// A heap thread could not be started.
    #[error("failed to spawn the {name} thread")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl HeapError {
    /// `true` for both out-of-memory flavours.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::ObjectTooLarge { .. })
    }
}
