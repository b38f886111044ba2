//! Typed state bindings with eight sharing disciplines.
//!
//! A [`Binding<T>`] is a named, cloneable handle to one piece of view state.
//! Every handle carries a [`ChangeMeta`] that records which elements read the
//! value and a watcher list that forwards change notifications by name. What
//! differs between bindings is the *kind*: who owns the value, whether user
//! code may write it, and how it follows an upstream source.
//!
//! Kinds that own their value (`Owned`, `PropCopy`, `ObjectLink`, `Provide`,
//! `StoreProp`) store it inline. Kinds that delegate (`Link`, `Consume`,
//! `StoreLink`) hold a handle to the source binding and read through it
//! without registering on the source's own dependency cell; the source change
//! reaches them through a relay watcher instead, so each binding attributes
//! reads and changes to itself exactly once.
//!
//! # Invariants
//!
//! - Writing a value equal to the current one never bumps the version and
//!   never notifies watchers.
//! - A successful write bumps the version exactly once before any watcher
//!   runs.
//! - Delegating reads go through the source's untracked accessor, so an
//!   element that reads a `Link` depends on the link, not on its source.
//! - A watcher error aborts the notification chain and surfaces at the call
//!   that performed the original write.

#![forbid(unsafe_code)]

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use tracing::trace;

use reflow_reactive::watch::{self, WatchGuard, WatchId};
use reflow_reactive::{ChangeMeta, SinkHandle, StateError};

use crate::provide::ProvideScope;
use crate::store::StoreRegistration;

/// How a binding relates to the value it exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Locally owned and freely writable.
    Owned,
    /// Owns a copy seeded from a parent value; follows the parent through
    /// [`Binding::update`] while keeping local edits until the parent
    /// actually changes.
    PropCopy,
    /// Two-way delegate to another binding.
    Link,
    /// Owns a reference-like value updated only by its owner; user writes
    /// are rejected.
    ObjectLink,
    /// Owned value published under a name for descendant views.
    Provide,
    /// Delegate to the nearest provided value with a matching name, with a
    /// synthesized fallback for when none is reachable.
    Consume,
    /// Two-way delegate to a shared store entry.
    StoreLink,
    /// Owns a copy mirrored from a shared store entry; local edits stay
    /// local, store changes overwrite.
    StoreProp,
}

impl BindingKind {
    /// Stable lowercase label used in errors and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::PropCopy => "prop-copy",
            Self::Link => "link",
            Self::ObjectLink => "object-link",
            Self::Provide => "provide",
            Self::Consume => "consume",
            Self::StoreLink => "store-link",
            Self::StoreProp => "store-prop",
        }
    }

    /// Whether this kind stores its value inline rather than delegating.
    #[must_use]
    pub const fn owns_value(self) -> bool {
        !matches!(self, Self::Link | Self::Consume | Self::StoreLink)
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-kind storage. Delegating variants keep their relay watcher guard
/// alive here; dropping the state unregisters the relay.
enum KindState<T> {
    Owned {
        value: T,
    },
    PropCopy {
        value: T,
        /// Last value accepted from the parent. Repeat syncs of the same
        /// parent value must not clobber local edits.
        source_seen: T,
    },
    Link {
        source: Binding<T>,
        _watch: WatchGuard,
    },
    ObjectLink {
        value: T,
    },
    Provide {
        value: T,
    },
    Consume {
        /// Present while a provided value with our name is reachable.
        source: Option<Binding<T>>,
        /// Owned stand-in that takes over when the provider goes away.
        fallback: Binding<T>,
        /// Relay onto whichever of `source`/`fallback` is active; replaced
        /// on every reconnect.
        watch: WatchGuard,
    },
    StoreLink {
        source: Binding<T>,
        _watch: WatchGuard,
        _registration: StoreRegistration,
    },
    StoreProp {
        value: T,
        source_seen: T,
        _watch: WatchGuard,
        _registration: StoreRegistration,
    },
}

impl<T> KindState<T> {
    fn relay_id(&self) -> Option<WatchId> {
        match self {
            Self::Link { _watch, .. } | Self::StoreLink { _watch, .. } => Some(_watch.id()),
            Self::StoreProp { _watch, .. } => Some(_watch.id()),
            Self::Consume { watch, .. } => Some(watch.id()),
            _ => None,
        }
    }
}

struct BindingCore<T> {
    name: String,
    kind: BindingKind,
    meta: ChangeMeta,
    watchers: RefCell<SmallVec<[WatchId; 2]>>,
    state: RefCell<KindState<T>>,
}

/// A named, cloneable handle to one piece of view state.
///
/// Cloning shares the underlying cell; all clones observe the same value,
/// version, and watcher list.
pub struct Binding<T> {
    core: Rc<BindingCore<T>>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.core.name)
            .field("kind", &self.core.kind.label())
            .field("version", &self.core.meta.version())
            .finish_non_exhaustive()
    }
}

/// Resolution of a write before any side effect runs. Computed under the
/// state borrow, acted on after it is released.
enum WriteRoute<T> {
    Unchanged,
    Wrote,
    Delegate(Binding<T>, T),
    Refuse,
}

impl<T: Clone + PartialEq + 'static> Binding<T> {
    /// A freely writable binding that owns its value.
    pub fn owned(name: impl Into<String>, value: T, owner: Option<SinkHandle>) -> Self {
        Self::with_state(name.into(), BindingKind::Owned, KindState::Owned { value }, owner)
    }

    /// An owned copy of a parent-supplied value. The owner pushes later
    /// parent values through [`Binding::update`].
    pub fn prop_copy(name: impl Into<String>, upstream: T, owner: Option<SinkHandle>) -> Self {
        let state = KindState::PropCopy {
            value: upstream.clone(),
            source_seen: upstream,
        };
        Self::with_state(name.into(), BindingKind::PropCopy, state, owner)
    }

    /// A two-way delegate: reads and writes pass through to `source`, and
    /// source changes are relayed to this binding's own dependents and
    /// watchers.
    pub fn link(name: impl Into<String>, source: &Binding<T>, owner: Option<SinkHandle>) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<BindingCore<T>>| BindingCore {
            name: name.into(),
            kind: BindingKind::Link,
            meta: ChangeMeta::new(owner),
            watchers: RefCell::new(SmallVec::new()),
            state: RefCell::new(KindState::Link {
                source: source.clone(),
                _watch: relay_guard(weak.clone()),
            }),
        });
        let binding = Self { core };
        binding.attach_relay(source);
        binding
    }

    /// An owner-updated reference value. User writes are rejected; the owner
    /// pushes replacements through [`Binding::update`], which fires only
    /// when the new value compares unequal.
    pub fn object_link(name: impl Into<String>, value: T, owner: Option<SinkHandle>) -> Self {
        Self::with_state(name.into(), BindingKind::ObjectLink, KindState::ObjectLink { value }, owner)
    }

    /// Publishes an owned value under this binding's name in `scope`.
    ///
    /// Fails with [`StateError::DuplicateProvide`] when the scope already
    /// holds that name, unless `allow_override` is set. Nothing is
    /// registered on failure.
    pub fn provide(
        scope: &ProvideScope,
        name: impl Into<String>,
        value: T,
        owner: Option<SinkHandle>,
        allow_override: bool,
    ) -> Result<Self, StateError> {
        let name = name.into();
        let binding = Self::with_state(
            name.clone(),
            BindingKind::Provide,
            KindState::Provide { value },
            owner,
        );
        scope.register(&name, Rc::new(binding.clone()) as Rc<dyn Any>, allow_override)?;
        Ok(binding)
    }

    /// Connects to the nearest provided value named like this binding.
    ///
    /// When no provider is reachable the binding starts on `default`; with
    /// neither a provider nor a default the configuration is unusable and
    /// [`StateError::MissingProvide`] is returned.
    pub fn consume(
        scope: &ProvideScope,
        name: impl Into<String>,
        default: Option<T>,
        owner: Option<SinkHandle>,
    ) -> Result<Self, StateError> {
        let name = name.into();
        let source: Option<Binding<T>> = scope.resolve(&name);
        let seed = match (&source, default) {
            (Some(src), _) => src.get_untracked(),
            (None, Some(default)) => default,
            (None, None) => return Err(StateError::MissingProvide { name }),
        };
        let fallback = Binding::owned(format!("{name}::fallback"), seed, None);
        let effective = effective_consume(&source, &fallback);
        let core = Rc::new_cyclic(|weak: &Weak<BindingCore<T>>| BindingCore {
            name,
            kind: BindingKind::Consume,
            meta: ChangeMeta::new(owner),
            watchers: RefCell::new(SmallVec::new()),
            state: RefCell::new(KindState::Consume {
                source,
                fallback,
                watch: relay_guard(weak.clone()),
            }),
        });
        let binding = Self { core };
        binding.attach_relay(&effective);
        Ok(binding)
    }

    /// Two-way delegate to a shared store entry. The registration keeps the
    /// entry pinned in the store for this binding's lifetime.
    pub(crate) fn store_link(
        name: impl Into<String>,
        entry: &Binding<T>,
        registration: StoreRegistration,
        owner: Option<SinkHandle>,
    ) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<BindingCore<T>>| BindingCore {
            name: name.into(),
            kind: BindingKind::StoreLink,
            meta: ChangeMeta::new(owner),
            watchers: RefCell::new(SmallVec::new()),
            state: RefCell::new(KindState::StoreLink {
                source: entry.clone(),
                _watch: relay_guard(weak.clone()),
                _registration: registration,
            }),
        });
        let binding = Self { core };
        binding.attach_relay(entry);
        binding
    }

    /// One-way mirror of a shared store entry. Store changes overwrite the
    /// local copy through owner-update semantics; local writes never reach
    /// the store.
    pub(crate) fn store_prop(
        name: impl Into<String>,
        entry: &Binding<T>,
        registration: StoreRegistration,
        owner: Option<SinkHandle>,
    ) -> Self {
        let core = Rc::new_cyclic(|weak: &Weak<BindingCore<T>>| {
            let seen = entry.get_untracked();
            BindingCore {
                name: name.into(),
                kind: BindingKind::StoreProp,
                meta: ChangeMeta::new(owner),
                watchers: RefCell::new(SmallVec::new()),
                state: RefCell::new(KindState::StoreProp {
                    value: seen.clone(),
                    source_seen: seen,
                    _watch: mirror_guard(weak.clone(), entry.clone()),
                    _registration: registration,
                }),
            }
        });
        let binding = Self { core };
        binding.attach_relay(entry);
        binding
    }

    /// Registers this binding's relay watcher on `source`. Stale ids left on
    /// a previous source prune themselves during its next notification.
    fn attach_relay(&self, source: &Binding<T>) {
        if let Some(id) = self.core.state.borrow().relay_id() {
            source.add_watcher(id);
        }
    }

    fn with_state(
        name: String,
        kind: BindingKind,
        state: KindState<T>,
        owner: Option<SinkHandle>,
    ) -> Self {
        Self {
            core: Rc::new(BindingCore {
                name,
                kind,
                meta: ChangeMeta::new(owner),
                watchers: RefCell::new(SmallVec::new()),
                state: RefCell::new(state),
            }),
        }
    }

    /// Reads the value, registering the currently rendering element as a
    /// dependent of this binding.
    #[must_use]
    pub fn get(&self) -> T {
        self.core.meta.record_read();
        self.get_untracked()
    }

    /// Reads the value without registering a dependency.
    #[must_use]
    pub fn get_untracked(&self) -> T {
        let delegate = {
            let state = self.core.state.borrow();
            match &*state {
                KindState::Owned { value }
                | KindState::PropCopy { value, .. }
                | KindState::ObjectLink { value }
                | KindState::Provide { value }
                | KindState::StoreProp { value, .. } => return value.clone(),
                KindState::Link { source, .. } | KindState::StoreLink { source, .. } => {
                    source.clone()
                }
                KindState::Consume { source, fallback, .. } => effective_consume(source, fallback),
            }
        };
        delegate.get_untracked()
    }

    /// Borrows the value for the duration of `f`, registering a dependency.
    ///
    /// `f` must not read or write this binding again; the value is borrowed
    /// for the whole call.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.core.meta.record_read();
        self.with_untracked(f)
    }

    /// Borrows the value for the duration of `f` without registering a
    /// dependency. Same reentrancy restriction as [`Binding::with`].
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let delegate = {
            let state = self.core.state.borrow();
            match &*state {
                KindState::Owned { value }
                | KindState::PropCopy { value, .. }
                | KindState::ObjectLink { value }
                | KindState::Provide { value }
                | KindState::StoreProp { value, .. } => return f(value),
                KindState::Link { source, .. } | KindState::StoreLink { source, .. } => {
                    source.clone()
                }
                KindState::Consume { source, fallback, .. } => effective_consume(source, fallback),
            }
        };
        delegate.with_untracked(f)
    }

    /// Writes a new value.
    ///
    /// Equal values are a no-op. Delegating kinds forward the write to their
    /// source, which then relays the change back. `ObjectLink` bindings
    /// refuse user writes with [`StateError::ImmutableSource`].
    pub fn set(&self, value: T) -> Result<(), StateError> {
        let route = {
            let mut state = self.core.state.borrow_mut();
            match &mut *state {
                KindState::Owned { value: current }
                | KindState::PropCopy { value: current, .. }
                | KindState::Provide { value: current }
                | KindState::StoreProp { value: current, .. } => {
                    if *current == value {
                        WriteRoute::Unchanged
                    } else {
                        *current = value;
                        WriteRoute::Wrote
                    }
                }
                KindState::ObjectLink { .. } => WriteRoute::Refuse,
                KindState::Link { source, .. } | KindState::StoreLink { source, .. } => {
                    WriteRoute::Delegate(source.clone(), value)
                }
                KindState::Consume { source, fallback, .. } => {
                    WriteRoute::Delegate(effective_consume(source, fallback), value)
                }
            }
        };
        match route {
            WriteRoute::Unchanged => Ok(()),
            WriteRoute::Wrote => self.fire_and_notify(),
            WriteRoute::Delegate(source, value) => source.set(value),
            WriteRoute::Refuse => Err(StateError::ImmutableSource {
                binding: self.core.name.clone(),
            }),
        }
    }

    /// Owner-side synchronization with an upstream value.
    ///
    /// `PropCopy` and `StoreProp` accept the value only when it differs from
    /// the last upstream value they saw, so a repeated sync never clobbers a
    /// local edit. `ObjectLink` replaces its value whenever the new one
    /// compares unequal. All other kinds reject the call.
    pub fn update(&self, upstream: T) -> Result<(), StateError> {
        let changed = {
            let mut state = self.core.state.borrow_mut();
            match &mut *state {
                KindState::PropCopy { value, source_seen }
                | KindState::StoreProp {
                    value, source_seen, ..
                } => {
                    if *source_seen == upstream {
                        false
                    } else {
                        *source_seen = upstream.clone();
                        if *value == upstream {
                            false
                        } else {
                            *value = upstream;
                            true
                        }
                    }
                }
                KindState::ObjectLink { value } => {
                    if *value == upstream {
                        false
                    } else {
                        *value = upstream;
                        true
                    }
                }
                _ => {
                    return Err(StateError::SyncUnsupported {
                        binding: self.core.name.clone(),
                        kind: self.core.kind.label(),
                    });
                }
            }
        };
        if changed { self.fire_and_notify() } else { Ok(()) }
    }

    /// Re-resolves a `Consume` binding against `scope`.
    ///
    /// Returns `Ok(true)` when connected to a provider afterwards and
    /// `Ok(false)` when running on the fallback. Connecting to a provider
    /// whose value differs from the currently visible one fires this
    /// binding's dependents and watchers exactly once. Disconnecting seeds
    /// the fallback with the last provider value, so the visible value is
    /// unchanged and nothing fires.
    pub fn reconnect_consume(&self, scope: &ProvideScope) -> Result<bool, StateError> {
        if self.core.kind != BindingKind::Consume {
            return Err(StateError::NotConsume {
                binding: self.core.name.clone(),
                kind: self.core.kind.label(),
            });
        }
        let resolved: Option<Binding<T>> = scope.resolve(&self.core.name);
        let (current, fallback) = {
            let state = self.core.state.borrow();
            match &*state {
                KindState::Consume { source, fallback, .. } => (source.clone(), fallback.clone()),
                _ => {
                    return Err(StateError::NotConsume {
                        binding: self.core.name.clone(),
                        kind: self.core.kind.label(),
                    });
                }
            }
        };
        match (resolved, current) {
            (Some(next), current) => {
                if let Some(current) = &current
                    && current.ptr_eq(&next)
                {
                    return Ok(true);
                }
                let visible = match &current {
                    Some(src) => src.get_untracked(),
                    None => fallback.get_untracked(),
                };
                let guard = relay_guard(Rc::downgrade(&self.core));
                next.add_watcher(guard.id());
                {
                    let mut state = self.core.state.borrow_mut();
                    if let KindState::Consume { source, watch, .. } = &mut *state {
                        *source = Some(next.clone());
                        *watch = guard;
                    }
                }
                if next.get_untracked() != visible {
                    self.fire_and_notify()?;
                }
                trace!(binding = %self.core.name, "consume reconnected");
                Ok(true)
            }
            (None, None) => Ok(false),
            (None, Some(lost)) => {
                // Provider went away: carry its last value over so the
                // switch is invisible to readers.
                fallback.set(lost.get_untracked())?;
                let guard = relay_guard(Rc::downgrade(&self.core));
                fallback.add_watcher(guard.id());
                {
                    let mut state = self.core.state.borrow_mut();
                    if let KindState::Consume { source, watch, .. } = &mut *state {
                        *source = None;
                        *watch = guard;
                    }
                }
                trace!(binding = %self.core.name, "consume disconnected to fallback");
                Ok(false)
            }
        }
    }

    /// Registers a watcher invoked with this binding's name after each
    /// effective change. Dropping the guard unregisters it.
    #[must_use]
    pub fn watch(&self, callback: impl Fn(&str) -> Result<(), StateError> + 'static) -> WatchGuard {
        let guard = watch::register(callback);
        self.core.watchers.borrow_mut().push(guard.id());
        guard
    }

    fn add_watcher(&self, id: WatchId) {
        self.core.watchers.borrow_mut().push(id);
    }

    /// Bumps the version, then notifies watchers in registration order.
    fn fire_and_notify(&self) -> Result<(), StateError> {
        self.core.meta.fire()?;
        notify_watchers(&self.core)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    #[must_use]
    pub fn kind(&self) -> BindingKind {
        self.core.kind
    }

    /// The dependency cell shared by every clone of this binding.
    #[must_use]
    pub fn meta(&self) -> &ChangeMeta {
        &self.core.meta
    }

    /// Whether two handles refer to the same underlying binding.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// For `Consume` bindings, whether a provider is currently connected.
    /// `None` for every other kind.
    #[must_use]
    pub fn consume_connected(&self) -> Option<bool> {
        let state = self.core.state.borrow();
        match &*state {
            KindState::Consume { source, .. } => Some(source.is_some()),
            _ => None,
        }
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.core.watchers.borrow().len()
    }
}

fn effective_consume<T>(source: &Option<Binding<T>>, fallback: &Binding<T>) -> Binding<T> {
    match source {
        Some(source) => source.clone(),
        None => fallback.clone(),
    }
}

/// Relay used by delegating kinds: when the source changes, fire this
/// binding's own cell and watchers under its own name.
fn relay_guard<T: Clone + PartialEq + 'static>(weak: Weak<BindingCore<T>>) -> WatchGuard {
    watch::register(move |_changed| match weak.upgrade() {
        Some(core) => {
            core.meta.fire()?;
            notify_watchers(&core)
        }
        None => Ok(()),
    })
}

/// Mirror used by `StoreProp`: when the store entry changes, pull its value
/// and run owner-update semantics on this binding.
fn mirror_guard<T: Clone + PartialEq + 'static>(
    weak: Weak<BindingCore<T>>,
    entry: Binding<T>,
) -> WatchGuard {
    watch::register(move |_changed| match weak.upgrade() {
        Some(core) => Binding { core }.update(entry.get_untracked()),
        None => Ok(()),
    })
}

/// Invokes every registered watcher with the binding's name. Watchers gone
/// from the registry are pruned; the first error stops the chain after the
/// pruning for the ids seen so far has been applied.
fn notify_watchers<T>(core: &Rc<BindingCore<T>>) -> Result<(), StateError> {
    let ids: SmallVec<[WatchId; 2]> = core.watchers.borrow().clone();
    let mut dead: SmallVec<[WatchId; 2]> = SmallVec::new();
    let mut outcome = Ok(());
    for id in ids {
        match watch::notify(id, &core.name) {
            Ok(true) => {}
            Ok(false) => dead.push(id),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    if !dead.is_empty() {
        core.watchers.borrow_mut().retain(|id| !dead.contains(id));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    use proptest::prelude::*;

    use reflow_reactive::{DirtySink, ElementId, WeakChangeMeta};

    #[derive(Default)]
    struct StubSink {
        current: Cell<Option<ElementId>>,
        marked: RefCell<Vec<BTreeSet<ElementId>>>,
    }

    impl DirtySink for StubSink {
        fn current_element(&self) -> Option<ElementId> {
            self.current.get()
        }

        fn mark_dependents_dirty(&self, dirty: &BTreeSet<ElementId>) -> Result<(), StateError> {
            self.marked.borrow_mut().push(dirty.clone());
            Ok(())
        }

        fn adopt_cell(&self, _cell: WeakChangeMeta) {}
    }

    fn sink() -> (Rc<StubSink>, SinkHandle) {
        let sink = Rc::new(StubSink::default());
        let handle = SinkHandle::new(&sink);
        (sink, handle)
    }

    fn counting_watch(binding: &Binding<i32>) -> (WatchGuard, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        let guard = binding.watch(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        (guard, count)
    }

    #[test]
    fn owned_set_bumps_version_once() {
        let b = Binding::owned("count", 1, None);
        let before = b.meta().version();
        b.set(2).unwrap();
        assert_eq!(b.get_untracked(), 2);
        assert_eq!(b.meta().version(), before.wrapping_add(1));
    }

    #[test]
    fn equal_set_is_silent() {
        let b = Binding::owned("count", 7, None);
        let (_guard, count) = counting_watch(&b);
        let before = b.meta().version();
        b.set(7).unwrap();
        assert_eq!(b.meta().version(), before);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn watcher_receives_binding_name() {
        let b = Binding::owned("title", 0, None);
        let names: Rc<RefCell<Vec<String>>> = Rc::default();
        let seen = Rc::clone(&names);
        let _guard = b.watch(move |name| {
            seen.borrow_mut().push(name.to_owned());
            Ok(())
        });
        b.set(1).unwrap();
        assert_eq!(names.borrow().as_slice(), ["title"]);
    }

    #[test]
    fn dropped_watch_guard_stops_notifications() {
        let b = Binding::owned("count", 0, None);
        let (guard, count) = counting_watch(&b);
        b.set(1).unwrap();
        drop(guard);
        b.set(2).unwrap();
        assert_eq!(count.get(), 1);
        // The stale id was pruned during the second notification.
        assert_eq!(b.watcher_count(), 0);
    }

    #[test]
    fn watcher_error_surfaces_at_set() {
        let b = Binding::owned("count", 0, None);
        let _guard = b.watch(|name| {
            Err(StateError::ImmutableSource {
                binding: name.to_owned(),
            })
        });
        let err = b.set(1).unwrap_err();
        assert_eq!(
            err,
            StateError::ImmutableSource {
                binding: "count".into()
            }
        );
        // The value itself was written before watchers ran.
        assert_eq!(b.get_untracked(), 1);
    }

    #[test]
    fn link_reads_and_writes_through() {
        let source = Binding::owned("source", 1, None);
        let link = Binding::link("mirror", &source, None);
        assert_eq!(link.get_untracked(), 1);
        link.set(5).unwrap();
        assert_eq!(source.get_untracked(), 5);
        assert_eq!(link.get_untracked(), 5);
    }

    #[test]
    fn source_change_relays_to_link_watchers() {
        let source = Binding::owned("source", 1, None);
        let link = Binding::link("mirror", &source, None);
        let names: Rc<RefCell<Vec<String>>> = Rc::default();
        let seen = Rc::clone(&names);
        let _guard = link.watch(move |name| {
            seen.borrow_mut().push(name.to_owned());
            Ok(())
        });
        source.set(2).unwrap();
        // The relay reports the link's own name, not the source's.
        assert_eq!(names.borrow().as_slice(), ["mirror"]);
    }

    #[test]
    fn link_chain_relays_through_two_hops() {
        let source = Binding::owned("root", 0, None);
        let first = Binding::link("first", &source, None);
        let second = Binding::link("second", &first, None);
        let (_guard, count) = counting_watch(&second);
        source.set(3).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(second.get_untracked(), 3);
    }

    #[test]
    fn delegating_read_depends_on_the_delegate_not_the_source() {
        let (sink, handle) = sink();
        let source = Binding::owned("source", 1, None);
        let link = Binding::link("mirror", &source, Some(handle));
        sink.current.set(Some(ElementId::new(4)));
        let _ = link.get();
        sink.current.set(None);
        assert_eq!(link.meta().dependents(), BTreeSet::from([ElementId::new(4)]));
        assert!(source.meta().dependents().is_empty());
    }

    #[test]
    fn source_change_marks_link_dependents_dirty() {
        let (sink, handle) = sink();
        let source = Binding::owned("source", 1, None);
        let link = Binding::link("mirror", &source, Some(handle));
        sink.current.set(Some(ElementId::new(9)));
        let _ = link.get();
        sink.current.set(None);
        source.set(2).unwrap();
        assert_eq!(
            sink.marked.borrow().as_slice(),
            [BTreeSet::from([ElementId::new(9)])]
        );
    }

    #[test]
    fn object_link_rejects_user_writes() {
        let b = Binding::object_link("model", 1, None);
        let err = b.set(2).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(b.get_untracked(), 1);
    }

    #[test]
    fn object_link_update_fires_only_on_change() {
        let b = Binding::object_link("model", 1, None);
        let (_guard, count) = counting_watch(&b);
        b.update(1).unwrap();
        assert_eq!(count.get(), 0);
        b.update(2).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(b.get_untracked(), 2);
    }

    #[test]
    fn prop_copy_repeated_sync_fires_once() {
        let b = Binding::prop_copy("label", 1, None);
        let (_guard, count) = counting_watch(&b);
        b.update(2).unwrap();
        b.update(2).unwrap();
        b.update(2).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(b.get_untracked(), 2);
    }

    #[test]
    fn prop_copy_local_edit_survives_repeated_sync() {
        let b = Binding::prop_copy("label", 1, None);
        b.set(10).unwrap();
        // Parent re-renders with the same value it always had.
        b.update(1).unwrap();
        assert_eq!(b.get_untracked(), 10);
        // A genuinely new parent value replaces the local edit.
        b.update(2).unwrap();
        assert_eq!(b.get_untracked(), 2);
    }

    #[test]
    fn owned_rejects_owner_update() {
        let b = Binding::owned("count", 0, None);
        let err = b.update(1).unwrap_err();
        assert_eq!(
            err,
            StateError::SyncUnsupported {
                binding: "count".into(),
                kind: "owned"
            }
        );
    }

    #[test]
    fn provide_then_consume_shares_the_value() {
        let scope = ProvideScope::root();
        let provide = Binding::provide(&scope, "theme", 1, None, false).unwrap();
        let consume = Binding::consume(&scope, "theme", None, None).unwrap();
        assert_eq!(consume.consume_connected(), Some(true));
        assert_eq!(consume.get_untracked(), 1);
        consume.set(2).unwrap();
        assert_eq!(provide.get_untracked(), 2);
    }

    #[test]
    fn duplicate_provide_fails_without_override() {
        let scope = ProvideScope::root();
        let _first = Binding::provide(&scope, "theme", 1, None, false).unwrap();
        let err = Binding::provide(&scope, "theme", 2, None, false).unwrap_err();
        assert_eq!(err, StateError::DuplicateProvide { name: "theme".into() });
        let replaced = Binding::provide(&scope, "theme", 3, None, true).unwrap();
        assert_eq!(replaced.get_untracked(), 3);
    }

    #[test]
    fn consume_without_provider_or_default_fails() {
        let scope = ProvideScope::root();
        let err = Binding::<i32>::consume(&scope, "theme", None, None).unwrap_err();
        assert_eq!(err, StateError::MissingProvide { name: "theme".into() });
    }

    #[test]
    fn consume_default_carries_until_reconnected() {
        let scope = ProvideScope::root();
        let consume = Binding::consume(&scope, "theme", Some(7), None).unwrap();
        assert_eq!(consume.consume_connected(), Some(false));
        assert_eq!(consume.get_untracked(), 7);

        let _provide = Binding::provide(&scope, "theme", 5, None, false).unwrap();
        let (_guard, count) = counting_watch(&consume);
        assert!(consume.reconnect_consume(&scope).unwrap());
        assert_eq!(count.get(), 1);
        assert_eq!(consume.get_untracked(), 5);
    }

    #[test]
    fn reconnect_to_equal_value_is_silent() {
        let scope = ProvideScope::root();
        let consume = Binding::consume(&scope, "theme", Some(5), None).unwrap();
        let _provide = Binding::provide(&scope, "theme", 5, None, false).unwrap();
        let (_guard, count) = counting_watch(&consume);
        assert!(consume.reconnect_consume(&scope).unwrap());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn reconnect_to_same_provider_is_a_noop() {
        let scope = ProvideScope::root();
        let _provide = Binding::provide(&scope, "theme", 5, None, false).unwrap();
        let consume = Binding::consume(&scope, "theme", None, None).unwrap();
        let (_guard, count) = counting_watch(&consume);
        assert!(consume.reconnect_consume(&scope).unwrap());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn disconnect_keeps_last_provider_value() {
        let scope = ProvideScope::root();
        let provide = Binding::provide(&scope, "theme", 5, None, false).unwrap();
        let consume = Binding::consume(&scope, "theme", None, None).unwrap();
        provide.set(9).unwrap();
        assert!(scope.retract("theme"));
        let (_guard, count) = counting_watch(&consume);
        assert!(!consume.reconnect_consume(&scope).unwrap());
        assert_eq!(count.get(), 0);
        assert_eq!(consume.get_untracked(), 9);
        // Writes now land on the fallback and still notify.
        consume.set(11).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(consume.get_untracked(), 11);
    }

    #[test]
    fn reconnect_on_non_consume_errors() {
        let scope = ProvideScope::root();
        let b = Binding::owned("count", 0, None);
        let err = b.reconnect_consume(&scope).unwrap_err();
        assert_eq!(
            err,
            StateError::NotConsume {
                binding: "count".into(),
                kind: "owned"
            }
        );
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(BindingKind::Owned.label(), "owned");
        assert_eq!(BindingKind::StoreProp.to_string(), "store-prop");
        assert!(BindingKind::Provide.owns_value());
        assert!(!BindingKind::Consume.owns_value());
    }

    proptest! {
        // Interleaved user writes and parent syncs against a model of the
        // prop-copy gate: the version advances once per visible change, and
        // a repeated parent value never clobbers a local edit.
        #[test]
        fn prop_copy_tracks_the_gate_model(
            ops in proptest::collection::vec((any::<bool>(), 0i32..4), 0..48),
        ) {
            let b = Binding::prop_copy("field", 0, None);
            let mut value = 0i32;
            let mut seen = 0i32;
            let mut fires = 0u64;
            for (is_sync, v) in ops {
                if is_sync {
                    b.update(v).unwrap();
                    if seen != v {
                        seen = v;
                        if value != v {
                            value = v;
                            fires += 1;
                        }
                    }
                } else {
                    b.set(v).unwrap();
                    if value != v {
                        value = v;
                        fires += 1;
                    }
                }
            }
            prop_assert_eq!(b.get_untracked(), value);
            prop_assert_eq!(b.meta().version(), fires);
        }
    }
}
