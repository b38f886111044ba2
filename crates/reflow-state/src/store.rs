//! Shared key-value store with typed entries and pinning references.
//!
//! A [`StateStore`] maps string keys to owned bindings whose concrete type is
//! erased at the map level and recovered per call. Views attach to entries
//! in two ways: [`StateStore::link`] hands out a two-way delegate and
//! [`StateStore::prop`] hands out a local mirror. Both pin the entry through
//! a [`StoreRegistration`] guard; while any registration is alive,
//! [`StateStore::delete`] and [`StateStore::clear`] refuse to drop the entry.
//! Plain [`StateStore::entry_ref`] accessors do not pin.
//!
//! Store-level reads never register render dependencies; dependency tracking
//! runs through the link and prop bindings a view holds.
//!
//! A default process-wide instance is reachable through
//! [`StateStore::global`] and replaceable in tests via
//! [`StateStore::reset_global`].

#![forbid(unsafe_code)]

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use tracing::debug;

use reflow_reactive::{SinkHandle, StateError};

use crate::binding::Binding;

thread_local! {
    static GLOBAL_STORE: RefCell<Option<StateStore>> = const { RefCell::new(None) };
}

struct StoreEntry {
    binding: Rc<dyn Any>,
    registrations: AHashSet<u64>,
}

struct StoreInner {
    entries: RefCell<AHashMap<String, StoreEntry>>,
    next_registration: Cell<u64>,
}

/// Pins a store entry for the lifetime of an attached binding. Dropping the
/// guard releases the pin; the entry becomes deletable once no guards
/// remain.
pub(crate) struct StoreRegistration {
    store: Weak<StoreInner>,
    key: String,
    id: u64,
}

impl Drop for StoreRegistration {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade()
            && let Some(entry) = store.entries.borrow_mut().get_mut(&self.key)
        {
            entry.registrations.remove(&self.id);
        }
    }
}

impl fmt::Debug for StoreRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistration")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Cloneable handle to a shared store. Clones share the same entries.
pub struct StateStore {
    inner: Rc<StoreInner>,
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("entries", &self.inner.entries.borrow().len())
            .finish()
    }
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(StoreInner {
                entries: RefCell::new(AHashMap::new()),
                next_registration: Cell::new(1),
            }),
        }
    }

    /// The process-wide store, created on first use.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_STORE.with(|slot| slot.borrow_mut().get_or_insert_with(Self::new).clone())
    }

    /// Drops the process-wide store so the next [`StateStore::global`] call
    /// starts fresh. Intended for tests.
    pub fn reset_global() {
        GLOBAL_STORE.with(|slot| {
            let _ = slot.borrow_mut().take();
        });
    }

    /// The entry binding for `key` when it exists with value type `T`.
    /// Wrong-typed entries behave as absent.
    fn typed_entry<T: Clone + PartialEq + 'static>(&self, key: &str) -> Option<Binding<T>> {
        let entries = self.inner.entries.borrow();
        let entry = entries.get(key)?;
        let binding = entry.binding.as_ref().downcast_ref::<Binding<T>>();
        if binding.is_none() {
            debug!(key, "store entry holds a different type");
        }
        binding.cloned()
    }

    /// Sets the entry when it exists with type `T`, otherwise creates it.
    /// Creating over a wrong-typed entry replaces the entry; bindings
    /// attached to the old one keep it alive independently.
    fn entry_or_create<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
    ) -> Result<Binding<T>, StateError> {
        if let Some(entry) = self.typed_entry::<T>(key) {
            entry.set(value)?;
            return Ok(entry);
        }
        if self.inner.entries.borrow().contains_key(key) {
            debug!(key, "replacing store entry of a different type");
        }
        let binding = Binding::owned(key, value, None);
        self.inner.entries.borrow_mut().insert(
            key.to_owned(),
            StoreEntry {
                binding: Rc::new(binding.clone()),
                registrations: AHashSet::new(),
            },
        );
        Ok(binding)
    }

    /// Adds a pin on `key`. Total by construction: pinning an absent key
    /// yields a guard that releases nothing.
    fn pin(&self, key: &str) -> StoreRegistration {
        let id = self.inner.next_registration.get();
        self.inner.next_registration.set(id + 1);
        if let Some(entry) = self.inner.entries.borrow_mut().get_mut(key) {
            entry.registrations.insert(id);
        }
        StoreRegistration {
            store: Rc::downgrade(&self.inner),
            key: key.to_owned(),
            id,
        }
    }

    /// Snapshot of the current value under `key`, if present with type `T`.
    #[must_use]
    pub fn get<T: Clone + PartialEq + 'static>(&self, key: &str) -> Option<T> {
        self.typed_entry::<T>(key).map(|entry| entry.get_untracked())
    }

    /// Writes `value` into an existing entry. Returns `Ok(false)` when the
    /// key is absent or holds a different type.
    pub fn set<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
    ) -> Result<bool, StateError> {
        match self.typed_entry::<T>(key) {
            Some(entry) => {
                entry.set(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes `value`, creating the entry when missing.
    pub fn set_or_create<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
    ) -> Result<(), StateError> {
        self.entry_or_create(key, value).map(|_| ())
    }

    /// A non-pinning accessor for the entry under `key`.
    #[must_use]
    pub fn entry_ref<T: Clone + PartialEq + 'static>(&self, key: &str) -> Option<StoreRef<T>> {
        self.typed_entry(key).map(|entry| StoreRef { entry })
    }

    /// Writes `value` (creating the entry when missing) and returns a
    /// non-pinning accessor for it.
    pub fn set_and_ref<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
    ) -> Result<StoreRef<T>, StateError> {
        self.entry_or_create(key, value).map(|entry| StoreRef { entry })
    }

    /// A two-way binding onto the entry under `key`. Pins the entry until
    /// the binding is dropped.
    #[must_use]
    pub fn link<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        owner: Option<SinkHandle>,
    ) -> Option<Binding<T>> {
        let entry = self.typed_entry::<T>(key)?;
        Some(Binding::store_link(key, &entry, self.pin(key), owner))
    }

    /// Writes `value` (creating the entry when missing) and returns a
    /// two-way binding onto it.
    pub fn set_and_link<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
        owner: Option<SinkHandle>,
    ) -> Result<Binding<T>, StateError> {
        let entry = self.entry_or_create(key, value)?;
        Ok(Binding::store_link(key, &entry, self.pin(key), owner))
    }

    /// A one-way mirror of the entry under `key`. Pins the entry until the
    /// binding is dropped.
    #[must_use]
    pub fn prop<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        owner: Option<SinkHandle>,
    ) -> Option<Binding<T>> {
        let entry = self.typed_entry::<T>(key)?;
        Some(Binding::store_prop(key, &entry, self.pin(key), owner))
    }

    /// Writes `value` (creating the entry when missing) and returns a
    /// one-way mirror of it.
    pub fn set_and_prop<T: Clone + PartialEq + 'static>(
        &self,
        key: &str,
        value: T,
        owner: Option<SinkHandle>,
    ) -> Result<Binding<T>, StateError> {
        let entry = self.entry_or_create(key, value)?;
        Ok(Binding::store_prop(key, &entry, self.pin(key), owner))
    }

    /// Removes the entry under `key`. Refused while any link or prop still
    /// pins it.
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.borrow_mut();
        match entries.get(key) {
            Some(entry) if entry.registrations.is_empty() => {
                entries.remove(key);
                true
            }
            Some(entry) => {
                debug!(
                    key,
                    registrations = entry.registrations.len(),
                    "delete refused while references are attached"
                );
                false
            }
            None => false,
        }
    }

    /// Removes every entry. Refused when any entry is still pinned.
    pub fn clear(&self) -> bool {
        let mut entries = self.inner.entries.borrow_mut();
        if entries.values().any(|entry| !entry.registrations.is_empty()) {
            debug!("clear refused while references are attached");
            return false;
        }
        entries.clear();
        true
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.inner.entries.borrow().contains_key(key)
    }

    /// Keys in sorted order, for stable iteration and diagnostics.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.borrow().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    /// Number of live pins on `key`. Zero for absent keys.
    #[must_use]
    pub fn registration_count(&self, key: &str) -> usize {
        self.inner
            .entries
            .borrow()
            .get(key)
            .map_or(0, |entry| entry.registrations.len())
    }
}

/// Direct accessor for a store entry. Does not pin the entry; the store may
/// delete it, in which case this handle keeps the old binding alive on its
/// own.
pub struct StoreRef<T> {
    entry: Binding<T>,
}

impl<T: Clone + PartialEq + 'static> StoreRef<T> {
    #[must_use]
    pub fn get(&self) -> T {
        self.entry.get_untracked()
    }

    pub fn set(&self, value: T) -> Result<(), StateError> {
        self.entry.set(value)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        self.entry.name()
    }
}

impl<T: Clone + PartialEq + 'static> fmt::Debug for StoreRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRef")
            .field("key", &self.entry.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_or_create_then_get() {
        let store = StateStore::new();
        store.set_or_create("count", 5).unwrap();
        assert_eq!(store.get::<i32>("count"), Some(5));
        store.set_or_create("count", 6).unwrap();
        assert_eq!(store.get::<i32>("count"), Some(6));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn absent_and_mismatched_keys_read_as_none() {
        let store = StateStore::new();
        store.set_or_create("count", 5).unwrap();
        assert_eq!(store.get::<i32>("missing"), None);
        assert_eq!(store.get::<String>("count"), None);
        assert!(store.has("count"));
    }

    #[test]
    fn set_reports_whether_it_wrote() {
        let store = StateStore::new();
        assert!(!store.set("count", 1).unwrap());
        store.set_or_create("count", 1).unwrap();
        assert!(store.set("count", 2).unwrap());
        assert!(!store.set("count", String::from("x")).unwrap());
        assert_eq!(store.get::<i32>("count"), Some(2));
    }

    #[test]
    fn link_is_two_way() {
        let store = StateStore::new();
        let link = store.set_and_link("count", 1, None).unwrap();
        assert_eq!(link.get_untracked(), 1);
        store.set("count", 2).unwrap();
        assert_eq!(link.get_untracked(), 2);
        link.set(3).unwrap();
        assert_eq!(store.get::<i32>("count"), Some(3));
    }

    #[test]
    fn sibling_links_observe_each_other() {
        let store = StateStore::new();
        let first = store.set_and_link("count", 0, None).unwrap();
        let second = store.link::<i32>("count", None).unwrap();
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        let _guard = second.watch(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        first.set(1).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(second.get_untracked(), 1);
    }

    #[test]
    fn prop_mirrors_but_never_writes_back() {
        let store = StateStore::new();
        let prop = store.set_and_prop("count", 1, None).unwrap();
        store.set("count", 2).unwrap();
        assert_eq!(prop.get_untracked(), 2);

        prop.set(99).unwrap();
        assert_eq!(store.get::<i32>("count"), Some(2));

        // A repeat of the unchanged store value leaves the local edit alone.
        store.set("count", 2).unwrap();
        assert_eq!(prop.get_untracked(), 99);

        // A real store change overwrites it.
        store.set("count", 3).unwrap();
        assert_eq!(prop.get_untracked(), 3);
    }

    #[test]
    fn delete_waits_for_pins_to_drop() {
        let store = StateStore::new();
        let link = store.set_and_link("count", 1, None).unwrap();
        assert_eq!(store.registration_count("count"), 1);
        assert!(!store.delete("count"));
        drop(link);
        assert_eq!(store.registration_count("count"), 0);
        assert!(store.delete("count"));
        assert!(!store.has("count"));
    }

    #[test]
    fn clear_waits_for_every_pin() {
        let store = StateStore::new();
        store.set_or_create("free", 1).unwrap();
        let prop = store.set_and_prop("pinned", 2, None).unwrap();
        assert!(!store.clear());
        assert!(store.has("free"));
        drop(prop);
        assert!(store.clear());
        assert!(store.is_empty());
    }

    #[test]
    fn refs_do_not_pin() {
        let store = StateStore::new();
        let handle = store.set_and_ref("count", 1).unwrap();
        assert_eq!(store.registration_count("count"), 0);
        assert!(store.delete("count"));
        // The detached handle still works against the old entry binding.
        handle.set(5).unwrap();
        assert_eq!(handle.get(), 5);
        assert_eq!(store.get::<i32>("count"), None);
    }

    #[test]
    fn delete_absent_is_false() {
        let store = StateStore::new();
        assert!(!store.delete("missing"));
    }

    #[test]
    fn keys_come_back_sorted() {
        let store = StateStore::new();
        store.set_or_create("zebra", 1).unwrap();
        store.set_or_create("apple", 2).unwrap();
        store.set_or_create("mango", 3).unwrap();
        assert_eq!(store.keys(), ["apple", "mango", "zebra"]);
    }

    #[test]
    fn global_store_is_shared_and_resettable() {
        StateStore::reset_global();
        StateStore::global().set_or_create("count", 1).unwrap();
        assert_eq!(StateStore::global().get::<i32>("count"), Some(1));
        StateStore::reset_global();
        assert_eq!(StateStore::global().get::<i32>("count"), None);
        StateStore::reset_global();
    }

    #[test]
    fn replacing_a_mismatched_entry_detaches_old_references() {
        let store = StateStore::new();
        let old = store.set_and_ref("slot", 1).unwrap();
        store.set_or_create("slot", String::from("text")).unwrap();
        assert_eq!(store.get::<String>("slot"), Some("text".into()));
        assert_eq!(old.get(), 1);
    }
}
