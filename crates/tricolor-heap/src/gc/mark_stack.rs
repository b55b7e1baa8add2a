//! Bounded stack of grey objects.

use crate::layout::ObjectRef;

/// Fixed-capacity LIFO of objects whose children have not been scanned.
///
/// A push onto a full stack is dropped and raises the overflow flag. The
/// dropped object stays grey in its header, so the collector's grey re-scan
/// finds it again.
///
/// # Invariants
///
/// - `len() <= capacity()`
/// - Overflow stays set until `reset`
#[derive(Debug)]
pub struct MarkStack {
    entries: Vec<ObjectRef>,
    capacity: usize,
    overflow: bool,
}

impl MarkStack {
    /// Creates an empty stack holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            overflow: false,
        }
    }

    /// Pushes `obj`, or records an overflow if the stack is full.
    pub fn push(&mut self, obj: ObjectRef) {
        if self.entries.len() < self.capacity {
            self.entries.push(obj);
        } else {
            self.overflow = true;
        }
    }

    /// Pops the most recently pushed object.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        self.entries.pop()
    }

    /// Empties the stack and clears the overflow flag.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.overflow = false;
    }

    /// Has a push been dropped since the last reset?
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pending objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maximum number of pending objects.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_lifo() {
        let mut stack = MarkStack::new(4);
        stack.push(obj(8));
        stack.push(obj(16));
        assert_eq!(stack.pop(), Some(obj(16)));
        assert_eq!(stack.pop(), Some(obj(8)));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_overflow_drops_and_sticks() {
        let mut stack = MarkStack::new(1);
        stack.push(obj(8));
        assert!(!stack.is_overflow());
        stack.push(obj(16));
        assert!(stack.is_overflow());
        assert_eq!(stack.len(), 1);

        assert_eq!(stack.pop(), Some(obj(8)));
        assert!(stack.is_overflow());

        stack.reset();
        assert!(!stack.is_overflow());
        assert!(stack.is_empty());
    }
}
