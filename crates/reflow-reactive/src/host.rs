#![forbid(unsafe_code)]

//! The outbound seam to the native UI tree.
//!
//! The state layer never touches rendered nodes directly. Everything it
//! needs from the host fits in two calls: a request to schedule a flush of
//! dirty elements, and allocation of the next element id. Hosts keep the
//! actual node tree; element-id equality is the join key.

use std::cell::{Cell, RefCell};

use crate::id::{ElementId, ElementIdAllocator};

/// Host-side services the scheduler calls out to.
///
/// Implementations are single-threaded; neither method may re-enter the
/// scheduler synchronously. A tick request is a hint that dirty elements
/// exist; the host decides when to drain.
pub trait RenderHost {
    /// Ask the host to schedule a flush of dirty elements.
    fn request_render_tick(&self);

    /// Allocate the next element id, monotonic in creation order.
    fn allocate_element_id(&self) -> ElementId;
}

/// Recording host for tests and examples.
///
/// Allocates ids from an [`ElementIdAllocator`] and counts tick requests
/// without acting on them, so tests can assert exactly when the scheduler
/// asked for a flush.
#[derive(Debug)]
pub struct RecordingHost {
    ids: ElementIdAllocator,
    ticks: Cell<usize>,
    allocated: RefCell<Vec<ElementId>>,
}

impl RecordingHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: ElementIdAllocator::new(),
            ticks: Cell::new(0),
            allocated: RefCell::new(Vec::new()),
        }
    }

    /// Number of tick requests seen so far.
    #[must_use]
    pub fn tick_count(&self) -> usize {
        self.ticks.get()
    }

    /// Every id this host has handed out, in allocation order.
    #[must_use]
    pub fn allocated_ids(&self) -> Vec<ElementId> {
        self.allocated.borrow().clone()
    }
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderHost for RecordingHost {
    fn request_render_tick(&self) {
        self.ticks.set(self.ticks.get() + 1);
    }

    fn allocate_element_id(&self) -> ElementId {
        let id = self.ids.allocate();
        self.allocated.borrow_mut().push(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_host_counts_ticks() {
        let host = RecordingHost::new();
        assert_eq!(host.tick_count(), 0);
        host.request_render_tick();
        host.request_render_tick();
        assert_eq!(host.tick_count(), 2);
    }

    #[test]
    fn recording_host_allocates_in_order() {
        let host = RecordingHost::new();
        let a = host.allocate_element_id();
        let b = host.allocate_element_id();
        assert!(a < b);
        assert_eq!(host.allocated_ids(), vec![a, b]);
    }
}
