//! Render scheduling and view recycling.
//!
//! This crate sits on top of `reflow-state`: bindings carry a sink handle
//! obtained from a [`ViewScheduler`], the scheduler records which element
//! read which binding during renders, and binding changes come back as
//! dirty marks that drain in ascending element order. Frozen views defer
//! their marks; recycled views move wholesale to fresh element ids.

#![forbid(unsafe_code)]

pub mod recycle;
pub mod scheduler;

pub use recycle::RecyclePool;
pub use scheduler::{RenderFn, ViewScheduler};
