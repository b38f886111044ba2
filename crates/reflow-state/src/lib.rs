//! State bindings, provide scopes, and shared stores.
//!
//! This crate is the middle layer of Reflow: it turns the raw dependency
//! cells of `reflow-reactive` into the typed state primitives views declare.
//!
//! # Architecture
//!
//! - [`binding`] defines [`Binding<T>`], one handle type covering eight
//!   sharing disciplines from locally owned state to store-backed mirrors.
//! - [`provide`] defines the scope chain that carries provided values down
//!   the view tree for consuming bindings to resolve by name.
//! - [`store`] defines [`StateStore`], a shared key-value store with typed
//!   entries, pinning link/prop attachments, and a process-wide instance.
//! - [`tracked`] defines [`TrackedVec`], a vector whose reads and writes
//!   are tracked per index.
//!
//! # Invariants
//!
//! 1. Every effective change bumps the binding's version exactly once and
//!    notifies watchers under the binding's own name.
//! 2. Writing an equal value changes nothing and notifies nobody.
//! 3. Delegating bindings read their source untracked; dependents are
//!    recorded on the delegate itself.
//! 4. Store entries pinned by a link or prop cannot be deleted until every
//!    pin is dropped.

#![forbid(unsafe_code)]

pub mod binding;
pub mod provide;
pub mod store;
pub mod tracked;

pub use binding::{Binding, BindingKind};
pub use provide::ProvideScope;
pub use store::{StateStore, StoreRef};
pub use tracked::TrackedVec;
