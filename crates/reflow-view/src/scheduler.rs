//! Per-view render scheduling.
//!
//! A [`ViewScheduler`] owns the render closures of one view's elements and
//! the dirty bookkeeping that drives partial re-rendering. It is the sink
//! behind every binding the view declares: while an element's closure runs,
//! reads register that element on the binding's dependency cell, and writes
//! come back through [`DirtySink::mark_dependents_dirty`] to schedule
//! exactly the elements that read the changed binding.
//!
//! # Architecture
//!
//! The scheduler keeps a stack of currently rendering element ids, so nested
//! renders (an element whose closure renders a child element) attribute
//! reads to the innermost element. Dirty ids live in an ordered set and
//! drain in ascending id order; ids marked while the drain is running join
//! the same pass. A single tick latch coalesces any number of marks into
//! one host render-tick request until the next drain.
//!
//! # Invariants
//!
//! - An element marked dirty n times between drains renders once.
//! - Each drain step renders the smallest waiting id, so a set marked
//!   before the drain renders in ascending order; ids marked mid-drain
//!   join the remaining work in sorted position.
//! - Marking an element that is currently on the rendering stack is a
//!   consistency error; other elements named by the same change are still
//!   marked before the error is returned.
//! - A frozen view (inactive and freeze-eligible) defers marks and replays
//!   the deduplicated set on activation.

#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::{debug, error, trace};

use reflow_reactive::{
    DirtySink, ElementId, RenderHost, SinkHandle, StateError, WeakChangeMeta,
};
use reflow_state::ProvideScope;

use crate::recycle::RecyclePool;

/// Render closure for one element. Receives the element id and whether this
/// is the element's first render.
pub type RenderFn = Box<dyn FnMut(ElementId, bool) -> Result<(), StateError>>;

pub(crate) struct ViewCore {
    host: Rc<dyn RenderHost>,
    parent: Option<Weak<ViewCore>>,
    provides: ProvideScope,
    render_fns: RefCell<AHashMap<ElementId, RenderFn>>,
    /// Innermost-last stack of elements currently rendering.
    rendering: RefCell<Vec<ElementId>>,
    dirty: RefCell<BTreeSet<ElementId>>,
    /// Marks deferred while the view is frozen.
    pending: RefCell<BTreeSet<ElementId>>,
    tick_requested: Cell<bool>,
    active: Cell<bool>,
    freeze_eligible: Cell<bool>,
    /// Every dependency cell owned by this view's bindings, for scrubbing
    /// and id remapping. Dead entries are pruned during scrubs.
    cells: RefCell<Vec<WeakChangeMeta>>,
    /// Frozen child views pooled for reuse, keyed by type name.
    pool: RecyclePool,
    /// Elements purged while their own closure was running; their closure
    /// must not be reinstalled when it returns.
    purged_mid_render: RefCell<BTreeSet<ElementId>>,
    disposed: Cell<bool>,
}

impl DirtySink for ViewCore {
    fn current_element(&self) -> Option<ElementId> {
        self.rendering.borrow().last().copied()
    }

    fn mark_dependents_dirty(&self, dirty: &BTreeSet<ElementId>) -> Result<(), StateError> {
        if self.disposed.get() {
            return Ok(());
        }
        if !self.active.get() && self.freeze_eligible.get() {
            self.pending.borrow_mut().extend(dirty.iter().copied());
            trace!(deferred = ?dirty, "view frozen; deferring dirty marks");
            return Ok(());
        }
        let conflicts: Vec<ElementId> = {
            let rendering = self.rendering.borrow();
            dirty
                .iter()
                .copied()
                .filter(|id| rendering.contains(id))
                .collect()
        };
        let mut inserted = false;
        {
            let mut set = self.dirty.borrow_mut();
            for id in dirty {
                if !conflicts.contains(id) && set.insert(*id) {
                    inserted = true;
                }
            }
        }
        if inserted && !self.tick_requested.get() {
            self.tick_requested.set(true);
            self.host.request_render_tick();
        }
        if let Some(element) = conflicts.first().copied() {
            error!(
                %element,
                dirty = ?dirty,
                "binding changed while a dependent element was rendering"
            );
            return Err(StateError::RenderReentrancy { element });
        }
        Ok(())
    }

    fn adopt_cell(&self, cell: WeakChangeMeta) {
        if self.disposed.get() {
            return;
        }
        self.cells.borrow_mut().push(cell);
    }
}

/// Cloneable handle to one view's scheduler. Clones share the same view.
pub struct ViewScheduler {
    core: Rc<ViewCore>,
}

impl Clone for ViewScheduler {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl fmt::Debug for ViewScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewScheduler")
            .field("elements", &self.core.render_fns.borrow().len())
            .field("dirty", &self.core.dirty.borrow().len())
            .field("active", &self.core.active.get())
            .field("disposed", &self.core.disposed.get())
            .finish()
    }
}

impl ViewScheduler {
    /// The root view of a tree, active from the start.
    #[must_use]
    pub fn root(host: Rc<dyn RenderHost>) -> Self {
        Self::with_parts(host, None, ProvideScope::root())
    }

    /// A child view sharing this view's host, with a provide scope nested
    /// under this view's scope.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parts(
            Rc::clone(&self.core.host),
            Some(Rc::downgrade(&self.core)),
            self.core.provides.child(),
        )
    }

    fn with_parts(
        host: Rc<dyn RenderHost>,
        parent: Option<Weak<ViewCore>>,
        provides: ProvideScope,
    ) -> Self {
        Self {
            core: Rc::new(ViewCore {
                host,
                parent,
                provides,
                render_fns: RefCell::new(AHashMap::new()),
                rendering: RefCell::new(Vec::new()),
                dirty: RefCell::new(BTreeSet::new()),
                pending: RefCell::new(BTreeSet::new()),
                tick_requested: Cell::new(false),
                active: Cell::new(true),
                freeze_eligible: Cell::new(false),
                cells: RefCell::new(Vec::new()),
                pool: RecyclePool::new(),
                purged_mid_render: RefCell::new(BTreeSet::new()),
                disposed: Cell::new(false),
            }),
        }
    }

    /// The sink handle bindings owned by this view should carry.
    #[must_use]
    pub fn sink(&self) -> SinkHandle {
        SinkHandle::new(&self.core)
    }

    /// The provide scope of this view.
    #[must_use]
    pub fn provides(&self) -> &ProvideScope {
        &self.core.provides
    }

    /// Registers an element and runs its first render. Reads inside the
    /// closure register the new element as a dependent of each binding they
    /// touch. A failing first render leaves no trace of the element behind.
    pub fn observe_element(
        &self,
        render: impl FnMut(ElementId, bool) -> Result<(), StateError> + 'static,
    ) -> Result<ElementId, StateError> {
        let id = self.core.host.allocate_element_id();
        self.core.render_fns.borrow_mut().insert(id, Box::new(render));
        trace!(%id, "element observed");
        match self.render_element(id, true) {
            Ok(()) => Ok(id),
            Err(err) => {
                self.purge_element(id);
                Err(err)
            }
        }
    }

    /// Runs one element's render closure. Re-renders scrub the element's
    /// stale dependency edges first, so only bindings read by the latest
    /// pass keep it as a dependent.
    pub fn render_element(&self, id: ElementId, first: bool) -> Result<(), StateError> {
        let Some(mut render) = self.core.render_fns.borrow_mut().remove(&id) else {
            debug!(%id, "no render function registered; skipping");
            return Ok(());
        };
        if !first {
            self.scrub_element(id);
        }
        self.core.rendering.borrow_mut().push(id);
        let outcome = render(id, first);
        self.core.rendering.borrow_mut().pop();

        let purged = self.core.purged_mid_render.borrow_mut().remove(&id);
        let keep = !purged && !(first && outcome.is_err());
        if keep {
            self.core.render_fns.borrow_mut().insert(id, render);
        }
        outcome
    }

    /// Schedules one element, with the same freeze and reentrancy rules as
    /// a binding change.
    pub fn mark_dirty(&self, id: ElementId) -> Result<(), StateError> {
        self.core.mark_dependents_dirty(&BTreeSet::from([id]))
    }

    /// Renders every dirty element in ascending id order, including ids
    /// marked while the drain runs. Returns the number of elements
    /// rendered.
    ///
    /// On a render failure the drain stops: the count so far, the failing
    /// element, and the ids still waiting are logged, and the error is
    /// returned. The remaining ids stay dirty for the next pass.
    pub fn drain_dirty(&self) -> Result<usize, StateError> {
        let mut rendered = 0usize;
        loop {
            let next = self.core.dirty.borrow_mut().pop_first();
            let Some(id) = next else { break };
            if !self.core.render_fns.borrow().contains_key(&id) {
                debug!(%id, "dirty element has no render function; skipping");
                continue;
            }
            if let Err(err) = self.render_element(id, false) {
                let remaining = self.core.dirty.borrow().clone();
                error!(
                    failed = %id,
                    rendered,
                    remaining = ?remaining,
                    "render pass aborted"
                );
                self.core.tick_requested.set(false);
                return Err(err);
            }
            rendered += 1;
        }
        self.core.tick_requested.set(false);
        if rendered > 0 {
            debug!(rendered, "render pass complete");
        }
        Ok(rendered)
    }

    /// Unregisters an element and detaches it from every dependency cell.
    /// Safe to call from inside the element's own render closure; the
    /// closure finishes but is not reinstalled. Returns whether the element
    /// was registered.
    pub fn purge_element(&self, id: ElementId) -> bool {
        let in_map = self.core.render_fns.borrow_mut().remove(&id).is_some();
        let mid_render = self.core.rendering.borrow().contains(&id);
        if mid_render {
            self.core.purged_mid_render.borrow_mut().insert(id);
        }
        self.core.dirty.borrow_mut().remove(&id);
        self.core.pending.borrow_mut().remove(&id);
        self.scrub_element(id);
        trace!(%id, "element purged");
        in_map || mid_render
    }

    /// Removes `id` from every live dependency cell this view has adopted,
    /// pruning cells that are gone.
    fn scrub_element(&self, id: ElementId) {
        self.core.cells.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(cell) => {
                cell.remove_dependent(id);
                true
            }
            None => false,
        });
    }

    /// Marks this view as allowed to defer dirty marks while inactive.
    pub fn set_freeze_eligible(&self, eligible: bool) {
        self.core.freeze_eligible.set(eligible);
    }

    /// Activates or deactivates the view. Activation moves every deferred
    /// mark into the dirty set (each element once, however often it was
    /// deferred) and requests a single render tick for them.
    pub fn set_active(&self, active: bool) {
        self.core.active.set(active);
        if !active {
            return;
        }
        let pending = std::mem::take(&mut *self.core.pending.borrow_mut());
        if pending.is_empty() {
            return;
        }
        trace!(replayed = ?pending, "replaying deferred marks on activation");
        self.core.dirty.borrow_mut().extend(pending);
        if !self.core.tick_requested.get() {
            self.core.tick_requested.set(true);
            self.core.host.request_render_tick();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.active.get()
    }

    #[must_use]
    pub fn current_element(&self) -> Option<ElementId> {
        self.core.current_element()
    }

    #[must_use]
    pub fn is_rendering(&self) -> bool {
        !self.core.rendering.borrow().is_empty()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.core.render_fns.borrow().len()
    }

    #[must_use]
    pub fn dirty_snapshot(&self) -> BTreeSet<ElementId> {
        self.core.dirty.borrow().clone()
    }

    #[must_use]
    pub fn pending_snapshot(&self) -> BTreeSet<ElementId> {
        self.core.pending.borrow().clone()
    }

    /// Whether two handles refer to the same view.
    #[must_use]
    pub fn same_view(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// Freezes this view and stores it in the parent's recycle pool under
    /// `type_name`. Returns false when there is no live parent to pool
    /// into; the view is left untouched in that case.
    pub fn recycle_to_parent(&self, type_name: &str) -> bool {
        let Some(parent) = self.core.parent.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        self.set_freeze_eligible(true);
        self.set_active(false);
        parent.pool.store(type_name, self.clone());
        trace!(type_name, "view recycled to parent pool");
        true
    }

    /// Pops a previously recycled child view of `type_name`, most recently
    /// recycled first.
    #[must_use]
    pub fn take_recycled(&self, type_name: &str) -> Option<ViewScheduler> {
        self.core.pool.take(type_name)
    }

    /// Rebinds a recycled view to fresh element ids and reactivates it.
    ///
    /// New ids are allocated in ascending order of the old ids, so relative
    /// element order is preserved. Render closures, dirty and deferred
    /// marks, and every dependency edge move to the new ids. The returned
    /// map lets the host splice the view back into its element tree.
    pub fn reuse(&self) -> BTreeMap<ElementId, ElementId> {
        let old_ids: BTreeSet<ElementId> =
            self.core.render_fns.borrow().keys().copied().collect();
        let mut map = BTreeMap::new();
        for old in old_ids {
            map.insert(old, self.core.host.allocate_element_id());
        }

        {
            let mut fns = self.core.render_fns.borrow_mut();
            let mut rebuilt = AHashMap::with_capacity(fns.len());
            for (old, render) in fns.drain() {
                match map.get(&old) {
                    Some(new) => {
                        rebuilt.insert(*new, render);
                    }
                    None => {
                        debug!(%old, "render function without an id mapping dropped");
                    }
                }
            }
            *fns = rebuilt;
        }

        remap_set(&mut self.core.dirty.borrow_mut(), &map);
        remap_set(&mut self.core.pending.borrow_mut(), &map);
        self.core.cells.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(cell) => {
                cell.remap_dependents(&map);
                true
            }
            None => false,
        });

        self.set_active(true);
        trace!(elements = map.len(), "view reused under fresh ids");
        map
    }

    /// Tears the view down: every element, mark, dependency edge, provided
    /// value, and pooled child is released. Idempotent. Changes to bindings
    /// that outlive the view become no-ops for it.
    pub fn dispose(&self) {
        if self.core.disposed.get() {
            return;
        }
        self.core.disposed.set(true);
        self.core.render_fns.borrow_mut().clear();
        self.core.dirty.borrow_mut().clear();
        self.core.pending.borrow_mut().clear();
        self.core.purged_mid_render.borrow_mut().clear();
        for weak in self.core.cells.borrow().iter() {
            if let Some(cell) = weak.upgrade() {
                cell.clear_dependents();
            }
        }
        self.core.cells.borrow_mut().clear();
        self.core.provides.clear_local();
        self.core.pool.clear();
        trace!("view disposed");
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.core.disposed.get()
    }
}

/// Replaces mapped ids in `set`, keeping unmapped ones.
fn remap_set(set: &mut BTreeSet<ElementId>, map: &BTreeMap<ElementId, ElementId>) {
    let remapped: BTreeSet<ElementId> = set
        .iter()
        .map(|id| map.get(id).copied().unwrap_or(*id))
        .collect();
    *set = remapped;
}
