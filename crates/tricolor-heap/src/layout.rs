//! Object header layout and raw word access.
//!
//! Every object is preceded by a four-word header:
//!
//! ```text
//!   obj - 4w   size      body size in bytes, excluding the header
//!   obj - 3w   type      type word (`TypeId` + 1), or `FREE`
//!   obj - 2w   flags     color bits and the finalized flag
//!   obj - 1w   monitor   address of the inflated monitor object, or 0
//!   obj        body ...
//! ```
//!
//! This is the only module that dereferences raw heap addresses. Everything
//! else goes through [`RawHeader`] values handed out by a region after it has
//! checked the address against its bounds.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

/// Size of a machine word (and of a reference slot) in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Alignment of every object address and every object size.
pub const OBJECT_ALIGN: usize = WORD;

/// Number of words in an object header.
pub const HEADER_SLOTS: usize = 4;

/// Size of an object header in bytes.
pub const HEADER_SIZE: usize = HEADER_SLOTS * WORD;

const SIZE_SLOT: usize = 4;
const TYPE_SLOT: usize = 3;
const FLAGS_SLOT: usize = 2;
const MONITOR_SLOT: usize = 1;

/// Type word of a block that holds free space.
pub const FREE: usize = 0;

/// Bits of the flags word holding the [`Color`].
pub const COLOR_MASK: usize = 0b011;

/// Set once the object's finalizer has been invoked.
pub const FINALIZED_FLAG: usize = 0b100;

/// Rounds `size` up to [`OBJECT_ALIGN`].
#[must_use]
pub const fn object_align(size: usize) -> usize {
    (size + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1)
}

/// Tri-color marking state, plus yellow for objects awaiting finalization.
///
/// The ordering matters: anything `<= White` may still be discovered by the
/// mark phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum Color {
    /// Unreachable, with a finalizer that has not run yet.
    Yellow = 0,
    /// Not (yet) known to be reachable.
    White = 1,
    /// Reachable, children not yet scanned.
    Grey = 2,
    /// Reachable and fully scanned.
    Black = 3,
}

impl Color {
    /// Extracts the color from a flags word.
    #[must_use]
    pub const fn from_flags(flags: usize) -> Self {
        match flags & COLOR_MASK {
            0 => Self::Yellow,
            1 => Self::White,
            2 => Self::Grey,
            _ => Self::Black,
        }
    }

    /// Returns `flags` with its color bits replaced by `self`.
    #[must_use]
    pub const fn apply(self, flags: usize) -> usize {
        (flags & !COLOR_MASK) | self as usize
    }

    /// Flags word of a freshly allocated object of this color.
    #[must_use]
    pub const fn bits(self) -> usize {
        self as usize
    }
}

/// A validated, non-null reference to the body of a heap object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wraps a raw object address. Returns `None` for the null address.
    ///
    /// Producing an `ObjectRef` does not prove the address is an object; the
    /// heap checks that with `is_object` wherever it matters.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// The address of the object body.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Encodes an optional reference as a heap word.
    #[must_use]
    pub fn to_word(obj: Option<Self>) -> usize {
        obj.map_or(0, Self::addr)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Views an aligned heap word as an atomic.
///
/// # Safety
///
/// `addr` must be `WORD`-aligned and lie inside a live mapping for `'a`.
unsafe fn word<'a>(addr: usize) -> &'a AtomicUsize {
    debug_assert_eq!(addr % WORD, 0, "unaligned heap word {addr:#x}");
    // SAFETY: guaranteed by the caller.
    unsafe { AtomicUsize::from_ptr(addr as *mut usize) }
}

/// Loads a heap word.
///
/// # Safety
///
/// See [`word`].
pub(crate) unsafe fn load_word(addr: usize) -> usize {
    // SAFETY: forwarded to the caller.
    unsafe { word(addr) }.load(Ordering::Acquire)
}

/// Stores a heap word.
///
/// # Safety
///
/// See [`word`].
pub(crate) unsafe fn store_word(addr: usize, value: usize) {
    // SAFETY: forwarded to the caller.
    unsafe { word(addr) }.store(value, Ordering::Release);
}

/// Zeroes `len` bytes starting at `addr`, one word at a time.
///
/// # Safety
///
/// `[addr, addr + len)` must be word-aligned and inside a live mapping, and
/// must not be read by anyone else until this returns.
pub(crate) unsafe fn clear(addr: usize, len: usize) {
    debug_assert_eq!(len % WORD, 0);
    // SAFETY: guaranteed by the caller.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
}

/// The header of the object (or free block) whose body starts at `obj`.
#[derive(Clone, Copy)]
pub(crate) struct RawHeader {
    obj: usize,
}

impl RawHeader {
    /// # Safety
    ///
    /// `obj - HEADER_SIZE .. obj` must be an aligned range inside a mapping
    /// that outlives the returned value.
    pub(crate) const unsafe fn at(obj: usize) -> Self {
        Self { obj }
    }

    fn slot(self, slot: usize) -> &'static AtomicUsize {
        // SAFETY: `at` guarantees the header words are mapped and aligned.
        unsafe { word(self.obj - slot * WORD) }
    }

    pub(crate) const fn addr(self) -> usize {
        self.obj
    }

    pub(crate) fn size(self) -> usize {
        self.slot(SIZE_SLOT).load(Ordering::Acquire)
    }

    pub(crate) fn set_size(self, size: usize) {
        self.slot(SIZE_SLOT).store(size, Ordering::Release);
    }

    pub(crate) fn type_word(self) -> usize {
        self.slot(TYPE_SLOT).load(Ordering::Acquire)
    }

    pub(crate) fn is_free(self) -> bool {
        self.type_word() == FREE
    }

    pub(crate) fn flags(self) -> usize {
        self.slot(FLAGS_SLOT).load(Ordering::Acquire)
    }

    pub(crate) fn monitor(self) -> usize {
        self.slot(MONITOR_SLOT).load(Ordering::Acquire)
    }

    pub(crate) fn set_monitor(self, monitor: usize) {
        self.slot(MONITOR_SLOT).store(monitor, Ordering::Release);
    }

    /// Writes a complete header.
    pub(crate) fn init(self, size: usize, type_word: usize, flags: usize) {
        self.slot(SIZE_SLOT).store(size, Ordering::Relaxed);
        self.slot(FLAGS_SLOT).store(flags, Ordering::Relaxed);
        self.slot(MONITOR_SLOT).store(0, Ordering::Relaxed);
        self.slot(TYPE_SLOT).store(type_word, Ordering::Release);
    }

    /// Turns the block into free space, keeping its size.
    pub(crate) fn make_free(self) {
        self.slot(FLAGS_SLOT).store(0, Ordering::Relaxed);
        self.slot(MONITOR_SLOT).store(0, Ordering::Relaxed);
        self.slot(TYPE_SLOT).store(FREE, Ordering::Release);
    }

    pub(crate) fn color(self) -> Color {
        Color::from_flags(self.flags())
    }

    /// Unconditionally sets the color, preserving the other flag bits.
    pub(crate) fn set_color(self, color: Color) {
        let _ = self
            .slot(FLAGS_SLOT)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                Some(color.apply(flags))
            });
    }

    /// Changes the color from `old` to `new`.
    ///
    /// Retries while only the non-color bits race; fails as soon as the color
    /// itself is no longer `old`.
    pub(crate) fn cas_color(self, old: Color, new: Color) -> bool {
        let flags_word = self.slot(FLAGS_SLOT);
        let backoff = Backoff::new();
        loop {
            let flags = flags_word.load(Ordering::Acquire);
            if Color::from_flags(flags) != old {
                return false;
            }
            match flags_word.compare_exchange_weak(
                flags,
                new.apply(flags),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => backoff.spin(),
            }
        }
    }

    pub(crate) fn is_finalized(self) -> bool {
        self.flags() & FINALIZED_FLAG != 0
    }

    /// Sets the finalized flag. Returns `true` if this call set it.
    pub(crate) fn mark_finalized(self) -> bool {
        self.slot(FLAGS_SLOT)
            .fetch_or(FINALIZED_FLAG, Ordering::AcqRel)
            & FINALIZED_FLAG
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_align() {
        assert_eq!(object_align(0), 0);
        assert_eq!(object_align(1), OBJECT_ALIGN);
        assert_eq!(object_align(OBJECT_ALIGN), OBJECT_ALIGN);
        assert_eq!(object_align(OBJECT_ALIGN + 1), 2 * OBJECT_ALIGN);
    }

    #[test]
    fn test_color_order_puts_yellow_below_white() {
        assert!(Color::Yellow < Color::White);
        assert!(Color::White < Color::Grey);
        assert!(Color::Grey < Color::Black);
    }

    #[test]
    fn test_color_apply_preserves_finalized_bit() {
        let flags = Color::Yellow.apply(FINALIZED_FLAG);
        assert_eq!(Color::from_flags(flags), Color::Yellow);
        let flags = Color::White.apply(flags);
        assert_eq!(Color::from_flags(flags), Color::White);
        assert_ne!(flags & FINALIZED_FLAG, 0);
    }

    #[test]
    fn test_header_color_transitions() {
        let mut words = [0usize; HEADER_SLOTS + 2];
        let obj = words.as_mut_ptr() as usize + HEADER_SIZE;
        // SAFETY: `words` outlives `header` and is word aligned.
        let header = unsafe { RawHeader::at(obj) };

        header.init(2 * WORD, 7, Color::White.bits());
        assert_eq!(header.size(), 2 * WORD);
        assert_eq!(header.type_word(), 7);
        assert_eq!(header.color(), Color::White);

        assert!(!header.cas_color(Color::Grey, Color::Black));
        assert!(header.cas_color(Color::White, Color::Grey));
        assert_eq!(header.color(), Color::Grey);

        assert!(header.mark_finalized());
        assert!(!header.mark_finalized());
        header.set_color(Color::Black);
        assert!(header.is_finalized());
        assert_eq!(header.color(), Color::Black);

        header.make_free();
        assert!(header.is_free());
        assert_eq!(header.size(), 2 * WORD);
    }

    #[test]
    fn test_object_ref_rejects_null() {
        assert!(ObjectRef::from_addr(0).is_none());
        let obj = ObjectRef::from_addr(0x1000).unwrap();
        assert_eq!(obj.addr(), 0x1000);
        assert_eq!(ObjectRef::to_word(Some(obj)), 0x1000);
        assert_eq!(ObjectRef::to_word(None), 0);
    }
}
