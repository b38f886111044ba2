#![forbid(unsafe_code)]

//! Process-wide watcher registry.
//!
//! Bindings do not hold their observers' callbacks directly. An observer
//! registers a callback here and receives a [`WatchGuard`] owning the only
//! strong reference; the registry keeps a `Weak`. The binding side stores
//! bare [`WatchId`]s in its notify list. Dropping the guard unregisters the
//! callback, and any id left behind in a notify list is pruned the next time
//! it fails to deliver, so a dead binding's watcher cannot outlive it.
//!
//! Callbacks receive the diagnostic name of the binding that changed and
//! return `Result`, letting a failure deep in a propagation chain surface
//! synchronously at the original `set()` call.
//!
//! The registry is `thread_local!`: the process-wide table of a
//! single-threaded cooperative system. The table is never borrowed while a
//! callback runs, so callbacks may freely register, notify, and drop guards.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::debug;

use crate::error::StateError;

/// Callback invoked with the changed binding's diagnostic name.
pub type WatchFn = dyn Fn(&str) -> Result<(), StateError>;

/// Identifier of a registered watcher callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

impl WatchId {
    /// Get the raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RegistryTable {
    next_id: u64,
    entries: AHashMap<u64, Weak<WatchFn>>,
}

thread_local! {
    static REGISTRY: RefCell<RegistryTable> = RefCell::new(RegistryTable {
        next_id: 1,
        entries: AHashMap::new(),
    });
}

/// RAII ownership of a registered watcher callback.
///
/// The guard holds the only strong reference to the callback; dropping it
/// unregisters the id immediately.
#[must_use = "dropping a WatchGuard unregisters its callback"]
pub struct WatchGuard {
    id: WatchId,
    _callback: Rc<WatchFn>,
}

impl WatchGuard {
    /// The id a binding stores in its notify list.
    #[must_use]
    pub fn id(&self) -> WatchId {
        self.id
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        REGISTRY.with(|registry| {
            registry.borrow_mut().entries.remove(&self.id.raw());
        });
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard").field("id", &self.id).finish()
    }
}

/// Register a callback; the returned guard owns it.
pub fn register(callback: impl Fn(&str) -> Result<(), StateError> + 'static) -> WatchGuard {
    let callback: Rc<WatchFn> = Rc::new(callback);
    let id = REGISTRY.with(|registry| {
        let mut table = registry.borrow_mut();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(id, Rc::downgrade(&callback));
        WatchId(id)
    });
    WatchGuard {
        id,
        _callback: callback,
    }
}

/// Deliver a change notification to one watcher.
///
/// Returns `Ok(true)` if the callback ran, `Ok(false)` if the id is gone
/// (unregistered or dead; dead entries are pruned here), or the callback's
/// own error. The registry is not borrowed while the callback runs.
pub fn notify(id: WatchId, changed: &str) -> Result<bool, StateError> {
    let callback = REGISTRY.with(|registry| {
        registry
            .borrow()
            .entries
            .get(&id.raw())
            .and_then(Weak::upgrade)
    });
    match callback {
        Some(callback) => {
            callback(changed)?;
            Ok(true)
        }
        None => {
            let stale = REGISTRY.with(|registry| {
                registry.borrow_mut().entries.remove(&id.raw()).is_some()
            });
            if stale {
                debug!(watcher = %id, "pruned dead watcher during dispatch");
            }
            Ok(false)
        }
    }
}

/// Whether `id` currently maps to a live callback.
#[must_use]
pub fn is_registered(id: WatchId) -> bool {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .entries
            .get(&id.raw())
            .is_some_and(|weak| weak.strong_count() > 0)
    })
}

/// Number of live watcher callbacks. Dead entries are pruned on the way.
#[must_use]
pub fn live_count() -> usize {
    REGISTRY.with(|registry| {
        let mut table = registry.borrow_mut();
        table.entries.retain(|_, weak| weak.strong_count() > 0);
        table.entries.len()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_watcher_receives_the_changed_name() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let guard = register(move |name| {
            sink.borrow_mut().push(name.to_owned());
            Ok(())
        });

        assert_eq!(notify(guard.id(), "count"), Ok(true));
        assert_eq!(notify(guard.id(), "title"), Ok(true));
        assert_eq!(*seen.borrow(), vec!["count".to_owned(), "title".to_owned()]);
    }

    #[test]
    fn dropping_the_guard_unregisters() {
        let before = live_count();
        let guard = register(|_| Ok(()));
        let id = guard.id();
        assert_eq!(live_count(), before + 1);
        assert!(is_registered(id));

        drop(guard);
        assert_eq!(live_count(), before);
        assert!(!is_registered(id));
        assert_eq!(notify(id, "anything"), Ok(false));
    }

    #[test]
    fn callback_failure_surfaces_to_the_notifier() {
        let guard = register(|_| {
            Err(StateError::MissingProvide {
                name: "theme".into(),
            })
        });
        let err = notify(guard.id(), "theme").unwrap_err();
        assert_eq!(err, StateError::MissingProvide { name: "theme".into() });
    }

    #[test]
    fn callbacks_may_register_reentrantly() {
        let inner_id = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&inner_id);
        let keeper = Rc::new(RefCell::new(Vec::new()));
        let guards = Rc::clone(&keeper);
        let guard = register(move |_| {
            let inner = register(|_| Ok(()));
            *slot.borrow_mut() = Some(inner.id());
            guards.borrow_mut().push(inner);
            Ok(())
        });

        assert_eq!(notify(guard.id(), "outer"), Ok(true));
        let inner = inner_id.borrow().unwrap();
        assert!(is_registered(inner));
    }

    #[test]
    fn notify_chains_do_not_deadlock_the_table() {
        let downstream = Rc::new(RefCell::new(0));
        let hits = Rc::clone(&downstream);
        let second = register(move |_| {
            *hits.borrow_mut() += 1;
            Ok(())
        });
        let second_id = second.id();
        let first = register(move |name| {
            notify(second_id, name).map(|_| ())
        });

        assert_eq!(notify(first.id(), "chained"), Ok(true));
        assert_eq!(*downstream.borrow(), 1);
    }

    #[test]
    fn ids_are_never_reused() {
        let a = register(|_| Ok(()));
        let first = a.id();
        drop(a);
        let b = register(|_| Ok(()));
        assert_ne!(first, b.id());
    }
}
