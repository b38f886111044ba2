#![forbid(unsafe_code)]

//! Per-key dependency cells for container-like state.
//!
//! [`KeyedChangeMeta`] maps string keys to independent [`ChangeMeta`] cells,
//! created lazily on first read. A write to one key dirties only the
//! elements that read that key. Container length is tracked under the
//! reserved [`LENGTH_KEY`] cell, so structural changes (push, remove) can be
//! distinguished from per-item mutation.
//!
//! Firing a key that was never read does not materialize a cell; nobody
//! can depend on an unread key, so there is nothing to notify.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::cell::{ChangeMeta, SinkHandle};
use crate::error::StateError;

/// Reserved key for the container-length cell.
pub const LENGTH_KEY: &str = "__LENGTH__";

struct KeyedInner {
    owner: Option<SinkHandle>,
    cells: RefCell<AHashMap<String, ChangeMeta>>,
}

/// Lazily-populated map of string keys to independent dependency cells.
#[derive(Clone)]
pub struct KeyedChangeMeta {
    inner: Rc<KeyedInner>,
}

impl KeyedChangeMeta {
    /// Create an empty keyed cell map. Per-key cells inherit `owner`.
    #[must_use]
    pub fn new(owner: Option<SinkHandle>) -> Self {
        Self {
            inner: Rc::new(KeyedInner {
                owner,
                cells: RefCell::new(AHashMap::new()),
            }),
        }
    }

    /// The cell for `key`, created on first use.
    #[must_use]
    pub fn cell(&self, key: &str) -> ChangeMeta {
        let mut cells = self.inner.cells.borrow_mut();
        if let Some(cell) = cells.get(key) {
            return cell.clone();
        }
        let cell = ChangeMeta::new(self.inner.owner.clone());
        cells.insert(key.to_owned(), cell.clone());
        cell
    }

    /// The length cell, created on first use.
    #[must_use]
    pub fn length_cell(&self) -> ChangeMeta {
        self.cell(LENGTH_KEY)
    }

    /// Record a read of `key`; returns the version read.
    pub fn record_read(&self, key: &str) -> u64 {
        self.cell(key).record_read()
    }

    /// Record a read of the container length.
    pub fn record_length_read(&self) -> u64 {
        self.length_cell().record_read()
    }

    /// Fire the cell for `key`, if any read ever materialized it.
    pub fn fire_key(&self, key: &str) -> Result<(), StateError> {
        let cell = self.inner.cells.borrow().get(key).cloned();
        match cell {
            Some(cell) => cell.fire(),
            None => Ok(()),
        }
    }

    /// Fire the length cell, if it was ever read.
    pub fn fire_length(&self) -> Result<(), StateError> {
        self.fire_key(LENGTH_KEY)
    }

    /// Keys with materialized cells, unordered.
    #[must_use]
    pub fn tracked_keys(&self) -> Vec<String> {
        self.inner.cells.borrow().keys().cloned().collect()
    }

    /// Number of materialized cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.inner.cells.borrow().len()
    }
}

impl std::fmt::Debug for KeyedChangeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedChangeMeta")
            .field("cells", &self.cell_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{DirtySink, WeakChangeMeta};
    use crate::id::ElementId;
    use std::cell::Cell;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct StubSink {
        current: Cell<Option<ElementId>>,
        marked: RefCell<Vec<BTreeSet<ElementId>>>,
    }

    impl DirtySink for StubSink {
        fn current_element(&self) -> Option<ElementId> {
            self.current.get()
        }

        fn mark_dependents_dirty(
            &self,
            dependents: &BTreeSet<ElementId>,
        ) -> Result<(), StateError> {
            self.marked.borrow_mut().push(dependents.clone());
            Ok(())
        }

        fn adopt_cell(&self, _cell: WeakChangeMeta) {}
    }

    #[test]
    fn cells_are_created_lazily_and_cached() {
        let keyed = KeyedChangeMeta::new(None);
        assert_eq!(keyed.cell_count(), 0);
        let a = keyed.cell("3");
        let b = keyed.cell("3");
        assert!(a.ptr_eq(&b));
        assert_eq!(keyed.cell_count(), 1);
    }

    #[test]
    fn firing_an_unread_key_creates_nothing() {
        let keyed = KeyedChangeMeta::new(None);
        keyed.fire_key("7").unwrap();
        keyed.fire_length().unwrap();
        assert_eq!(keyed.cell_count(), 0);
    }

    #[test]
    fn keys_are_independent() {
        let sink = Rc::new(StubSink::default());
        let keyed = KeyedChangeMeta::new(Some(SinkHandle::new(&sink)));

        sink.current.set(Some(ElementId::new(10)));
        keyed.record_read("3");
        sink.current.set(Some(ElementId::new(20)));
        keyed.record_read("4");
        sink.current.set(None);

        keyed.fire_key("3").unwrap();
        let marked = sink.marked.borrow();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0], [ElementId::new(10)].into_iter().collect());
    }

    #[test]
    fn length_is_its_own_cell() {
        let keyed = KeyedChangeMeta::new(None);
        let len = keyed.length_cell();
        let item = keyed.cell("0");
        assert!(!len.ptr_eq(&item));
        assert!(len.ptr_eq(&keyed.cell(LENGTH_KEY)));
    }

    #[test]
    fn tracked_keys_reports_materialized_cells() {
        let keyed = KeyedChangeMeta::new(None);
        keyed.record_read("a");
        keyed.record_length_read();
        let mut keys = keyed.tracked_keys();
        keys.sort();
        assert_eq!(keys, vec![LENGTH_KEY.to_owned(), "a".to_owned()]);
    }
}
