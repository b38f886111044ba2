#![forbid(unsafe_code)]

//! Error taxonomy for the state layer.
//!
//! Two families share one enum. *Configuration* errors
//! ([`ImmutableSource`](StateError::ImmutableSource),
//! [`SyncUnsupported`](StateError::SyncUnsupported),
//! [`MissingProvide`](StateError::MissingProvide),
//! [`DuplicateProvide`](StateError::DuplicateProvide),
//! [`NotConsume`](StateError::NotConsume)) indicate a structural
//! wiring mistake at view-construction time; they surface to the caller and
//! are never retried. The *consistency* error
//! ([`RenderReentrancy`](StateError::RenderReentrancy)) means a binding was
//! mutated while one of its dependent elements was mid-render; it is logged
//! with dirty-set diagnostics at the detection site and re-thrown unchanged.
//!
//! Errors propagate synchronously: binding-level failures from
//! `set`/construction to the caller, scheduler-level failures from the drain
//! to whoever triggered the render tick. There is no catch-and-continue.

use thiserror::Error;

use crate::id::ElementId;

/// Failures surfaced by bindings, stores, and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// `set()` reached a binding that rejects writes through this path.
    #[error("binding `{binding}` is not writable through this path")]
    ImmutableSource {
        /// Diagnostic name of the refusing binding.
        binding: String,
    },

    /// `update()` was called on a kind that does not accept owner pushes.
    #[error("binding `{binding}` ({kind}) does not accept owner updates")]
    SyncUnsupported {
        /// Diagnostic name of the binding.
        binding: String,
        /// Kind label of the binding.
        kind: &'static str,
    },

    /// A consuming binding found no provided value and had no default.
    #[error("no provided value named `{name}` is visible from this view")]
    MissingProvide {
        /// The provide name that failed to resolve.
        name: String,
    },

    /// A provide was registered under a name already taken in its scope.
    #[error("a value named `{name}` is already provided in this scope")]
    DuplicateProvide {
        /// The conflicting provide name.
        name: String,
    },

    /// A consume-only operation was invoked on a different binding kind.
    #[error("binding `{binding}` ({kind}) is not a consuming binding")]
    NotConsume {
        /// Diagnostic name of the binding.
        binding: String,
        /// Kind label of the binding.
        kind: &'static str,
    },

    /// An element was marked dirty while it was on the rendering stack.
    #[error("element #{element} was mutated while it was rendering")]
    RenderReentrancy {
        /// The element that was both rendering and marked dirty.
        element: ElementId,
    },
}

impl StateError {
    /// True for the configuration family (wiring mistakes, never retried).
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::RenderReentrancy { .. })
    }

    /// True for the consistency family (mid-render mutation).
    #[must_use]
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::RenderReentrancy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_binding() {
        let err = StateError::ImmutableSource {
            binding: "title".into(),
        };
        assert_eq!(
            err.to_string(),
            "binding `title` is not writable through this path"
        );
    }

    #[test]
    fn families_partition_the_enum() {
        let config = StateError::MissingProvide { name: "x".into() };
        let consistency = StateError::RenderReentrancy {
            element: ElementId::new(7),
        };
        assert!(config.is_configuration() && !config.is_consistency());
        assert!(consistency.is_consistency() && !consistency.is_configuration());
        assert_eq!(
            consistency.to_string(),
            "element #7 was mutated while it was rendering"
        );
    }
}
