#![forbid(unsafe_code)]

//! Element identifiers and the monotonic allocator hosts hand them out from.
//!
//! Element ids are assigned by the host in creation order and never reused
//! within a host's lifetime. Creation order is load-bearing: the scheduler
//! drains its dirty set in ascending id order, and a parent element always
//! carries a smaller id than any descendant created while it rendered.

use std::cell::Cell;
use std::fmt;

/// Identifier for a rendered element, assigned by the host in creation order.
///
/// Equality on `ElementId` is the join key between scheduler bookkeeping and
/// the host's rendered node tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(u64);

impl ElementId {
    /// Wrap a raw id value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic element-id source for hosts.
///
/// Single-threaded by design; ids start at 1 and increase by one per
/// allocation, so relative order of two ids always matches creation order.
#[derive(Debug)]
pub struct ElementIdAllocator {
    next: Cell<u64>,
}

impl ElementIdAllocator {
    /// Create an allocator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    /// Hand out the next id.
    pub fn allocate(&self) -> ElementId {
        let id = self.next.get();
        self.next.set(id + 1);
        ElementId::new(id)
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    #[must_use]
    pub fn peek(&self) -> ElementId {
        ElementId::new(self.next.get())
    }
}

impl Default for ElementIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let alloc = ElementIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        let c = alloc.allocate();
        assert!(a < b && b < c);
        assert_eq!(a.raw(), 1);
        assert_eq!(c.raw(), 3);
    }

    #[test]
    fn peek_does_not_advance() {
        let alloc = ElementIdAllocator::new();
        assert_eq!(alloc.peek(), alloc.peek());
        assert_eq!(alloc.peek(), alloc.allocate());
    }

    #[test]
    fn ordering_matches_raw_value() {
        assert!(ElementId::new(2) < ElementId::new(9));
        assert_eq!(ElementId::new(5), ElementId::new(5));
    }

    #[test]
    fn display_is_bare_number() {
        assert_eq!(ElementId::new(42).to_string(), "42");
    }
}
