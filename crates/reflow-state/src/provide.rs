//! Name-keyed provide scopes.
//!
//! A [`ProvideScope`] is one node in a chain that mirrors the view tree: each
//! view owns a scope whose parent is the enclosing view's scope. Provided
//! bindings are registered in the owning view's node; consuming bindings
//! resolve a name by walking from their own node toward the root and taking
//! the nearest match. A name may shadow the same name in an ancestor, but
//! registering it twice in one node is a configuration error unless the
//! caller explicitly overrides.
//!
//! Entries are type-erased so one scope can hold bindings of different value
//! types. A name that resolves to the wrong type is treated as absent.

#![forbid(unsafe_code)]

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use tracing::debug;

use reflow_reactive::StateError;

use crate::binding::Binding;

struct ScopeInner {
    parent: Option<ProvideScope>,
    entries: RefCell<AHashMap<String, Rc<dyn Any>>>,
}

/// One node in the provide chain. Cloning shares the node.
pub struct ProvideScope {
    inner: Rc<ScopeInner>,
}

impl Clone for ProvideScope {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for ProvideScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvideScope")
            .field("local_entries", &self.inner.entries.borrow().len())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

impl Default for ProvideScope {
    fn default() -> Self {
        Self::root()
    }
}

impl ProvideScope {
    /// A scope with no parent, for the root view.
    #[must_use]
    pub fn root() -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                parent: None,
                entries: RefCell::new(AHashMap::new()),
            }),
        }
    }

    /// A child node whose lookups fall back to `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                parent: Some(self.clone()),
                entries: RefCell::new(AHashMap::new()),
            }),
        }
    }

    /// Registers a type-erased binding under `name` in this node.
    ///
    /// Shadowing an ancestor's entry is always allowed; a second
    /// registration in the same node needs `allow_override`.
    pub(crate) fn register(
        &self,
        name: &str,
        binding: Rc<dyn Any>,
        allow_override: bool,
    ) -> Result<(), StateError> {
        let mut entries = self.inner.entries.borrow_mut();
        if entries.contains_key(name) && !allow_override {
            return Err(StateError::DuplicateProvide {
                name: name.to_owned(),
            });
        }
        entries.insert(name.to_owned(), binding);
        Ok(())
    }

    /// Resolves `name` to the nearest binding of type `T`, walking toward
    /// the root. Entries of a different type are skipped.
    pub(crate) fn resolve<T: Clone + PartialEq + 'static>(&self, name: &str) -> Option<Binding<T>> {
        let mut node = Some(self.clone());
        while let Some(scope) = node {
            if let Some(entry) = scope.inner.entries.borrow().get(name) {
                if let Some(binding) = entry.as_ref().downcast_ref::<Binding<T>>() {
                    return Some(binding.clone());
                }
                debug!(name, "provided value has a different type; skipping");
            }
            node = scope.inner.parent.clone();
        }
        None
    }

    /// Whether `name` is registered anywhere on the chain, regardless of
    /// value type.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let mut node = Some(self.clone());
        while let Some(scope) = node {
            if scope.inner.entries.borrow().contains_key(name) {
                return true;
            }
            node = scope.inner.parent.clone();
        }
        false
    }

    /// Whether `name` is registered in this node itself.
    #[must_use]
    pub fn contains_local(&self, name: &str) -> bool {
        self.inner.entries.borrow().contains_key(name)
    }

    /// Removes `name` from this node. Ancestor entries with the same name
    /// become visible again. Returns whether anything was removed.
    pub fn retract(&self, name: &str) -> bool {
        self.inner.entries.borrow_mut().remove(name).is_some()
    }

    /// Drops every entry registered in this node.
    pub fn clear_local(&self) {
        self.inner.entries.borrow_mut().clear();
    }

    #[must_use]
    pub fn local_len(&self) -> usize {
        self.inner.entries.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_resolves_through_parent() {
        let root = ProvideScope::root();
        let _theme = Binding::provide(&root, "theme", 1, None, false).unwrap();
        let child = root.child();
        let grandchild = child.child();
        let resolved: Binding<i32> = grandchild.resolve("theme").unwrap();
        assert_eq!(resolved.get_untracked(), 1);
    }

    #[test]
    fn nearest_scope_wins_on_shadowing() {
        let root = ProvideScope::root();
        let _outer = Binding::provide(&root, "theme", 1, None, false).unwrap();
        let child = root.child();
        let _inner = Binding::provide(&child, "theme", 2, None, false).unwrap();
        let from_child: Binding<i32> = child.resolve("theme").unwrap();
        let from_root: Binding<i32> = root.resolve("theme").unwrap();
        assert_eq!(from_child.get_untracked(), 2);
        assert_eq!(from_root.get_untracked(), 1);
    }

    #[test]
    fn shadowing_is_not_a_duplicate() {
        let root = ProvideScope::root();
        let _outer = Binding::provide(&root, "theme", 1, None, false).unwrap();
        let child = root.child();
        assert!(Binding::provide(&child, "theme", 2, None, false).is_ok());
    }

    #[test]
    fn retract_reveals_the_ancestor_entry() {
        let root = ProvideScope::root();
        let _outer = Binding::provide(&root, "theme", 1, None, false).unwrap();
        let child = root.child();
        let _inner = Binding::provide(&child, "theme", 2, None, false).unwrap();
        assert!(child.retract("theme"));
        assert!(!child.retract("theme"));
        let resolved: Binding<i32> = child.resolve("theme").unwrap();
        assert_eq!(resolved.get_untracked(), 1);
    }

    #[test]
    fn wrong_type_behaves_as_absent() {
        let root = ProvideScope::root();
        let _text = Binding::provide(&root, "theme", String::from("dark"), None, false).unwrap();
        assert!(root.resolve::<i32>("theme").is_none());
        assert!(root.contains("theme"));
    }

    #[test]
    fn wrong_type_in_child_falls_through_to_parent() {
        let root = ProvideScope::root();
        let _number = Binding::provide(&root, "theme", 7, None, false).unwrap();
        let child = root.child();
        let _text = Binding::provide(&child, "theme", String::from("dark"), None, false).unwrap();
        let resolved: Binding<i32> = child.resolve("theme").unwrap();
        assert_eq!(resolved.get_untracked(), 7);
    }

    #[test]
    fn clear_local_keeps_ancestors() {
        let root = ProvideScope::root();
        let _outer = Binding::provide(&root, "theme", 1, None, false).unwrap();
        let child = root.child();
        let _a = Binding::provide(&child, "a", 10, None, false).unwrap();
        let _b = Binding::provide(&child, "b", 20, None, false).unwrap();
        assert_eq!(child.local_len(), 2);
        child.clear_local();
        assert_eq!(child.local_len(), 0);
        assert!(child.contains("theme"));
    }
}
