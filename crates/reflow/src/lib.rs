//! Reflow: fine-grained reactive state for declarative view trees.
//!
//! State lives in named [`Binding`]s with explicit sharing disciplines,
//! views schedule re-renders per element through a [`ViewScheduler`], and
//! only the elements that actually read a changed binding render again.
//!
//! ```
//! use std::rc::Rc;
//!
//! use reflow::prelude::*;
//!
//! let host = Rc::new(RecordingHost::new());
//! let view = ViewScheduler::root(host);
//! let count = Binding::owned("count", 0, Some(view.sink()));
//!
//! let shown = count.clone();
//! let _element = view.observe_element(move |_id, _first| {
//!     let _ = shown.get();
//!     Ok(())
//! })?;
//!
//! count.set(1)?;
//! assert_eq!(view.drain_dirty()?, 1);
//! # Ok::<(), reflow::StateError>(())
//! ```

#![forbid(unsafe_code)]

pub use reflow_reactive as reactive;
pub use reflow_state as state;
pub use reflow_view as view;

pub use reflow_reactive::{
    ChangeMeta, DirtySink, ElementId, ElementIdAllocator, KeyedChangeMeta, RecordingHost,
    RenderHost, SinkHandle, StateError, WatchGuard,
};
pub use reflow_state::{Binding, BindingKind, ProvideScope, StateStore, StoreRef, TrackedVec};
pub use reflow_view::{RecyclePool, ViewScheduler};

/// The names most programs want in scope.
pub mod prelude {
    pub use reflow_reactive::{
        ElementId, RecordingHost, RenderHost, SinkHandle, StateError, WatchGuard,
    };
    pub use reflow_state::{Binding, BindingKind, ProvideScope, StateStore, StoreRef, TrackedVec};
    pub use reflow_view::{RecyclePool, ViewScheduler};
}
