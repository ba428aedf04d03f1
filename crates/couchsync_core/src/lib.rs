#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Bootstrap (materialize remote design documents into a local tree)
pub mod bootstrap;

/// Batched bulk-document synchronization
pub mod batch;

/// Cooperative cancellation
pub mod cancel;

/// Configuration options
pub mod config;

/// Design documents (local tree, push, index rebuild)
pub mod design;

/// Local and remote document shapes
pub mod document;

/// Synchronization driver (the stage state machine)
pub mod driver;

/// Error (common error types)
pub mod error;

/// Filesystem abstraction
pub mod fs;

/// Per-document reconciliation
pub mod reconcile;

/// Remote snapshot reader
pub mod snapshot;

/// Remote document store (CouchDB client and in-memory store)
pub mod store;

/// Logical timestamps and the timestamp cache
pub mod timestamp;

pub use cancel::CancelToken;
pub use config::SyncConfig;
pub use driver::{DriverState, StageCounts, SyncDriver, SyncReport};
pub use error::{Result, SyncError, SyncWarning};
