//! Storage layer for the universe core.
//!
//! Traits define the abstract interface; `memory` is the default backend and
//! `persistent` (feature-gated) adds a durable one on disk.

pub mod codec;
pub mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryNodeStore, InMemoryRunStore, InMemoryStores, InMemoryTelemetryStore};
pub use traits::{NodeStore, RunStore, StorageError, TelemetryLogStore};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}
