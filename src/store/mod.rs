//! Durable state for the control plane.
//!
//! Record sets are whole JSON (or markdown) files in the state directory,
//! read through a per-pass cache and replaced atomically on write.

mod cache;
mod files;

pub use cache::ReadCache;
pub use files::{atomic_write, RecordSet, StateStore};
