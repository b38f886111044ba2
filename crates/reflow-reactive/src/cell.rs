#![forbid(unsafe_code)]

//! Dependency cells and the cell→scheduler channel.
//!
//! [`ChangeMeta`] is the primitive every binding hangs its change tracking
//! on: a version counter plus the set of element ids that read through it.
//! It stores no value of its own. Reads during a render record the element
//! currently on the owner's rendering stack; a fire bumps the version and
//! forwards the dependent snapshot to the owning view's [`DirtySink`].
//!
//! # Invariants
//!
//! 1. The version increments exactly once per `fire()`, whether or not
//!    anything is notified.
//! 2. A fire with no recorded dependents, no owner, or a dead owner is a
//!    cheap early exit; the sink is never called.
//! 3. A read outside any render (owner has no current element) records
//!    nothing.
//! 4. Dependents are recorded against the cell's *owning* sink only; a cell
//!    constructed without an owner never accumulates dependents.
//!
//! # Architecture
//!
//! `ChangeMeta` is a cheap cloneable handle over `Rc` state, single-threaded
//! throughout. The owner is held as a `Weak` sink handle so a cell outliving
//! its view degrades to inert rather than keeping the view alive. On
//! construction with an owner the cell registers itself (weakly) with the
//! sink, which lets the view scrub or remap dependent ids during re-render,
//! purge, and recycle.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::error::StateError;
use crate::id::ElementId;

/// Per-view sink the cells report into.
///
/// Implemented by the view scheduler. All methods are single-threaded and
/// must not re-enter the calling cell.
pub trait DirtySink {
    /// Element currently being rendered by this sink, if any.
    fn current_element(&self) -> Option<ElementId>;

    /// Mark the given elements dirty, honoring the sink's dispatch mode
    /// (immediate or deferred while inactive).
    fn mark_dependents_dirty(&self, dependents: &BTreeSet<ElementId>) -> Result<(), StateError>;

    /// Register a cell with the sink so teardown, re-render scrubbing, and
    /// id remapping can reach its dependent set.
    fn adopt_cell(&self, cell: WeakChangeMeta);
}

/// Cheap cloneable handle to a view's [`DirtySink`].
#[derive(Clone)]
pub struct SinkHandle {
    sink: Weak<dyn DirtySink>,
}

impl SinkHandle {
    /// Build a handle from a shared sink.
    #[must_use]
    pub fn new<S: DirtySink + 'static>(sink: &Rc<S>) -> Self {
        let sink: Weak<dyn DirtySink> = Rc::<S>::downgrade(sink);
        Self { sink }
    }

    /// Upgrade to the sink, if the owning view is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Rc<dyn DirtySink>> {
        self.sink.upgrade()
    }

    /// Element currently rendering under this sink, if any.
    #[must_use]
    pub fn current_element(&self) -> Option<ElementId> {
        self.upgrade().and_then(|sink| sink.current_element())
    }

    /// Whether both handles point at the same sink.
    #[must_use]
    pub fn same_sink(&self, other: &Self) -> bool {
        self.sink.ptr_eq(&other.sink)
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle")
            .field("alive", &(self.sink.strong_count() > 0))
            .finish()
    }
}

struct MetaInner {
    version: Cell<u64>,
    dependents: RefCell<BTreeSet<ElementId>>,
    owner: Option<SinkHandle>,
}

/// A dependency-tracking cell: version counter plus dependent element ids.
#[derive(Clone)]
pub struct ChangeMeta {
    inner: Rc<MetaInner>,
}

impl ChangeMeta {
    /// Create a cell. With an owner, the cell registers itself with the
    /// owning sink so the view can reach its dependent set later.
    #[must_use]
    pub fn new(owner: Option<SinkHandle>) -> Self {
        let cell = Self {
            inner: Rc::new(MetaInner {
                version: Cell::new(0),
                dependents: RefCell::new(BTreeSet::new()),
                owner,
            }),
        };
        if let Some(owner) = &cell.inner.owner
            && let Some(sink) = owner.upgrade()
        {
            sink.adopt_cell(cell.downgrade());
        }
        cell
    }

    /// Record a read: the element currently rendering under the owner, if
    /// any, becomes a dependent. Returns the version that was read.
    pub fn record_read(&self) -> u64 {
        if let Some(owner) = &self.inner.owner
            && let Some(element) = owner.current_element()
        {
            let inserted = self.inner.dependents.borrow_mut().insert(element);
            if inserted {
                trace!(element = %element, "dependency recorded");
            }
        }
        self.inner.version.get()
    }

    /// Bump the version and, if any element depends on this cell, hand the
    /// dependent snapshot to the owning sink.
    pub fn fire(&self) -> Result<(), StateError> {
        self.inner
            .version
            .set(self.inner.version.get().wrapping_add(1));
        if self.inner.dependents.borrow().is_empty() {
            return Ok(());
        }
        let Some(owner) = &self.inner.owner else {
            return Ok(());
        };
        let Some(sink) = owner.upgrade() else {
            return Ok(());
        };
        let snapshot = self.inner.dependents.borrow().clone();
        sink.mark_dependents_dirty(&snapshot)
    }

    /// Current version. Starts at 0 and increments once per fire.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Snapshot of the dependent element ids.
    #[must_use]
    pub fn dependents(&self) -> BTreeSet<ElementId> {
        self.inner.dependents.borrow().clone()
    }

    /// Whether any element currently depends on this cell.
    #[must_use]
    pub fn has_dependents(&self) -> bool {
        !self.inner.dependents.borrow().is_empty()
    }

    /// Drop one element from the dependent set.
    pub fn remove_dependent(&self, element: ElementId) {
        self.inner.dependents.borrow_mut().remove(&element);
    }

    /// Drop every recorded dependent.
    pub fn clear_dependents(&self) {
        self.inner.dependents.borrow_mut().clear();
    }

    /// Rewrite dependent ids through `map`. Ids absent from the map are
    /// kept as-is. Used when a recycled view re-joins the tree under fresh
    /// element ids.
    pub fn remap_dependents(&self, map: &BTreeMap<ElementId, ElementId>) {
        let mut dependents = self.inner.dependents.borrow_mut();
        let remapped = dependents
            .iter()
            .map(|id| map.get(id).copied().unwrap_or(*id))
            .collect();
        *dependents = remapped;
    }

    /// Downgrade to a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakChangeMeta {
        WeakChangeMeta {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether two handles point at the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ChangeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeMeta")
            .field("version", &self.version())
            .field("dependents", &self.dependents())
            .finish()
    }
}

/// Weak handle to a [`ChangeMeta`], held by the owning sink.
#[derive(Clone)]
pub struct WeakChangeMeta {
    inner: Weak<MetaInner>,
}

impl WeakChangeMeta {
    /// Upgrade to the cell, if any binding still owns it.
    #[must_use]
    pub fn upgrade(&self) -> Option<ChangeMeta> {
        self.inner.upgrade().map(|inner| ChangeMeta { inner })
    }
}

impl fmt::Debug for WeakChangeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakChangeMeta")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
