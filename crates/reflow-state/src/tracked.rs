//! A vector with per-index change tracking.
//!
//! [`TrackedVec`] spreads one collection across a [`KeyedChangeMeta`]: each
//! read and write is attributed to the decimal index key it touches, and
//! shape changes fire the length key. An element that only reads index 3
//! re-renders when index 3 changes, not when index 7 does.
//!
//! Writes fire only the cells that already exist; a key nobody has read has
//! no dependents to mark.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use reflow_reactive::{KeyedChangeMeta, SinkHandle, StateError};

struct VecInner<T> {
    items: RefCell<Vec<T>>,
    keys: KeyedChangeMeta,
}

/// A cloneable, index-tracked vector of values.
pub struct TrackedVec<T> {
    inner: Rc<VecInner<T>>,
}

impl<T> Clone for TrackedVec<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TrackedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedVec")
            .field("len", &self.inner.items.borrow().len())
            .field("tracked_cells", &self.inner.keys.cell_count())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> TrackedVec<T> {
    #[must_use]
    pub fn new(owner: Option<SinkHandle>) -> Self {
        Self::with_items(Vec::new(), owner)
    }

    #[must_use]
    pub fn with_items(items: Vec<T>, owner: Option<SinkHandle>) -> Self {
        Self {
            inner: Rc::new(VecInner {
                items: RefCell::new(items),
                keys: KeyedChangeMeta::new(owner),
            }),
        }
    }

    /// Length of the vector; registers a dependency on the length key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.keys.record_length_read();
        self.inner.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index`; registers a dependency on that index key even when
    /// the slot is currently out of bounds, so a later write there still
    /// reaches this reader.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.inner.keys.record_read(&index.to_string());
        self.inner.items.borrow().get(index).cloned()
    }

    /// Full copy of the items; registers a dependency on the length key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.keys.record_length_read();
        self.inner.items.borrow().clone()
    }

    /// Replaces the value at `index`, firing only that index key. Equal
    /// values are a no-op. Returns `Ok(false)` when the index is out of
    /// bounds.
    pub fn set(&self, index: usize, value: T) -> Result<bool, StateError> {
        let changed = {
            let mut items = self.inner.items.borrow_mut();
            match items.get_mut(index) {
                Some(slot) if *slot == value => return Ok(true),
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.inner.keys.fire_key(&index.to_string())?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Appends a value, firing the length key and the newly occupied index
    /// key (if anyone read it while it was out of bounds).
    pub fn push(&self, value: T) -> Result<(), StateError> {
        let index = {
            let mut items = self.inner.items.borrow_mut();
            items.push(value);
            items.len() - 1
        };
        self.inner.keys.fire_key(&index.to_string())?;
        self.inner.keys.fire_length()
    }

    /// Removes and returns the value at `index`. Every tracked index key at
    /// or past `index` fires (those slots shifted), then the length key.
    /// Returns `Ok(None)` when the index is out of bounds.
    pub fn remove(&self, index: usize) -> Result<Option<T>, StateError> {
        let removed = {
            let mut items = self.inner.items.borrow_mut();
            if index >= items.len() {
                return Ok(None);
            }
            items.remove(index)
        };
        let mut shifted: Vec<usize> = self
            .inner
            .keys
            .tracked_keys()
            .iter()
            .filter_map(|key| key.parse::<usize>().ok())
            .filter(|tracked| *tracked >= index)
            .collect();
        shifted.sort_unstable();
        for tracked in shifted {
            self.inner.keys.fire_key(&tracked.to_string())?;
        }
        self.inner.keys.fire_length()?;
        Ok(Some(removed))
    }

    /// The keyed dependency map backing this vector.
    #[must_use]
    pub fn keyed(&self) -> &KeyedChangeMeta {
        &self.inner.keys
    }
}
