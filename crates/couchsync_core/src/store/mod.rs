//! Remote document store abstraction.
//!
//! The engine only needs a handful of operations from the store: keyed and ranged
//! reads, single-document writes, a streaming bulk write, and a view query used to
//! kick off index builds. [`CouchClient`] speaks the CouchDB HTTP API;
//! [`MemoryStore`] keeps everything in memory for tests and dry runs.
//!
//! Connections are explicit: a [`StoreConnector`] authenticates and hands back a
//! store handle, which is then passed to whoever needs it.

mod couch;
mod memory;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::fs::BoxFuture;

pub use couch::{CouchClient, CouchConnector, Credentials};
pub use memory::MemoryStore;

/// One row of a ranged `_all_docs` read.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    /// Document id
    pub id: String,
    /// Full document body
    pub doc: Value,
}

/// One row of a keyed fetch, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRow {
    /// The store holds the key
    Found(Value),
    /// The key is unknown or deleted
    NotFound,
}

/// Per-document result of a bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkResult {
    /// Document id
    pub id: String,
    /// New revision, when the write was accepted
    #[serde(default)]
    pub rev: Option<String>,
    /// Error code, when the write was rejected (e.g. `conflict`)
    #[serde(default)]
    pub error: Option<String>,
    /// Human-readable rejection reason
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkResult {
    /// Whether the document was written.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Operations the synchronization engine needs from a remote document store.
pub trait DocumentStore: Send + Sync {
    /// Human-readable name for log lines (usually the database URL)
    fn name(&self) -> &str;

    /// All documents with `start <= id < end`, bodies included.
    fn all_docs_in_range<'a>(
        &'a self,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StoreRow>>>;

    /// Fetch documents by key. Returns exactly one row per key, in order; missing
    /// keys come back as [`FetchRow::NotFound`] rather than failing the request.
    fn fetch<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<Vec<FetchRow>>>;

    /// Create or overwrite a document, returning its new revision. Overwriting
    /// requires the current `_rev` in `doc`.
    fn insert<'a>(&'a self, id: &'a str, doc: &'a Value) -> BoxFuture<'a, Result<String>>;

    /// Stream a `{"docs": [...]}` payload file to the bulk update endpoint.
    fn bulk_docs<'a>(&'a self, payload: &'a Path) -> BoxFuture<'a, Result<Vec<BulkResult>>>;

    /// Query a view with a row limit. Used to make the store rebuild its indexes.
    fn query_view<'a>(
        &'a self,
        design: &'a str,
        view: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Produces an authenticated store handle.
pub trait StoreConnector: Send + Sync {
    /// Connect (and authenticate, if configured).
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>>;
}
