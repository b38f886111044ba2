#![forbid(unsafe_code)]

//! Change-tracking kernel for Reflow.
//!
//! This crate holds the primitives everything else is built on:
//!
//! - [`ChangeMeta`]: a dependency cell recording which elements read a
//!   binding and firing when it changes, without storing a value itself.
//! - [`KeyedChangeMeta`]: lazily-created per-key cells for container state,
//!   with a reserved length cell.
//! - [`watch`]: the process-wide watcher registry; observers own callbacks
//!   through RAII [`WatchGuard`]s, bindings keep bare [`WatchId`]s.
//! - [`DirtySink`] / [`SinkHandle`]: the channel from cells to the owning
//!   view's scheduler.
//! - [`RenderHost`]: the outbound seam to the native UI tree (tick
//!   requests, element-id allocation).
//! - [`StateError`]: the shared error taxonomy.
//!
//! # Architecture
//!
//! Everything is single-threaded: `Rc`/`Weak` ownership, `Cell`/`RefCell`
//! interior mutability, `thread_local!` for process-wide tables. Cells hold
//! their owner weakly so state outliving its view degrades to inert instead
//! of keeping the view alive.
//!
//! # Invariants
//!
//! 1. A cell's version increments exactly once per fire.
//! 2. Dependents are attributed to the element currently rendering under
//!    the cell's owning sink; reads outside a render record nothing.
//! 3. Watcher callbacks are never invoked while the registry table is
//!    borrowed, so callbacks may register, notify, and unregister freely.
//! 4. Dropping a [`WatchGuard`] removes the callback before the next
//!    dispatch; ids lingering in notify lists are pruned on failed delivery.

pub mod cell;
pub mod error;
pub mod host;
pub mod id;
pub mod keyed;
pub mod watch;

pub use cell::{ChangeMeta, DirtySink, SinkHandle, WeakChangeMeta};
pub use error::StateError;
pub use host::{RecordingHost, RenderHost};
pub use id::{ElementId, ElementIdAllocator};
pub use keyed::{KeyedChangeMeta, LENGTH_KEY};
pub use watch::{WatchFn, WatchGuard, WatchId};
