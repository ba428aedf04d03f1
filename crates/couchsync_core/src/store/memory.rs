//! In-memory document store.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{BulkResult, DocumentStore, FetchRow, StoreConnector, StoreRow};
use crate::document::{ID_FIELD, REV_FIELD};
use crate::error::{Result, SyncError};
use crate::fs::BoxFuture;

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, Map<String, Value>>,
    writes: Vec<String>,
    view_queries: Vec<(String, String)>,
    bulk_requests: usize,
    fail_bulk: bool,
    fail_connect: bool,
    failing_views: HashMap<String, String>,
}

/// A CouchDB-shaped store held in memory.
///
/// Clones share state, so a test can keep one handle for assertions and give
/// another to the engine.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: Arc<str>,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct BulkPayload {
    docs: Vec<Value>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            name: Arc::from("memory"),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge every other handle.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a document as if another writer had stored it. The revision is
    /// assigned by the store; any `_rev` in `doc` is ignored.
    pub fn put_remote(&self, id: &str, doc: Value) -> String {
        let mut body = match doc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut state = self.lock();
        let generation = state.docs.get(id).map(generation_of).unwrap_or(0) + 1;
        body.remove(REV_FIELD);
        stamp(&mut body, id, generation)
            .map(|rev| {
                state.docs.insert(id.to_string(), body);
                rev
            })
            .unwrap_or_default()
    }

    /// Current body of a document, including `_id` and `_rev`.
    pub fn doc(&self, id: &str) -> Option<Value> {
        self.lock().docs.get(id).cloned().map(Value::Object)
    }

    /// Number of documents held.
    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    /// Whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every accepted write, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// `(design, view)` pairs queried so far.
    pub fn view_queries(&self) -> Vec<(String, String)> {
        self.lock().view_queries.clone()
    }

    /// Number of bulk update requests received (failed ones included).
    pub fn bulk_requests(&self) -> usize {
        self.lock().bulk_requests
    }

    /// Make every bulk update request fail at the transport level.
    pub fn fail_bulk(&self, fail: bool) {
        self.lock().fail_bulk = fail;
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Make queries against `design`'s views fail.
    pub fn fail_views(&self, design: &str, message: &str) {
        self.lock()
            .failing_views
            .insert(design.to_string(), message.to_string());
    }

    fn write(&self, id: &str, doc: &Value) -> std::result::Result<String, (String, String)> {
        let Value::Object(body) = doc else {
            return Err((
                "bad_request".to_string(),
                "Document must be a JSON object".to_string(),
            ));
        };

        let mut state = self.lock();
        let current = state.docs.get(id);
        let current_rev = current.and_then(|d| d.get(REV_FIELD)).and_then(Value::as_str);
        let given_rev = body.get(REV_FIELD).and_then(Value::as_str);

        if current_rev != given_rev {
            return Err((
                "conflict".to_string(),
                "Document update conflict.".to_string(),
            ));
        }

        let generation = current.map(generation_of).unwrap_or(0) + 1;
        let mut body = body.clone();
        let rev = stamp(&mut body, id, generation).map_err(|e| ("bad_request".to_string(), e))?;
        state.docs.insert(id.to_string(), body);
        state.writes.push(id.to_string());
        Ok(rev)
    }
}

fn generation_of(doc: &Map<String, Value>) -> u64 {
    doc.get(REV_FIELD)
        .and_then(Value::as_str)
        .and_then(|rev| rev.split('-').next())
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

/// Attach `_id` and a fresh `<generation>-<hash>` revision to `body`.
fn stamp(body: &mut Map<String, Value>, id: &str, generation: u64) -> std::result::Result<String, String> {
    body.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    body.remove(REV_FIELD);
    let content = serde_json::to_string(body).map_err(|e| e.to_string())?;

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    generation.hash(&mut hasher);
    let rev = format!("{}-{:016x}", generation, hasher.finish());

    body.insert(REV_FIELD.to_string(), Value::String(rev.clone()));
    Ok(rev)
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn all_docs_in_range<'a>(
        &'a self,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StoreRow>>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .docs
                .range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
                .map(|(id, doc)| StoreRow {
                    id: id.clone(),
                    doc: Value::Object(doc.clone()),
                })
                .collect())
        })
    }

    fn fetch<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<Vec<FetchRow>>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(keys
                .iter()
                .map(|key| match state.docs.get(key) {
                    Some(doc) => FetchRow::Found(Value::Object(doc.clone())),
                    None => FetchRow::NotFound,
                })
                .collect())
        })
    }

    fn insert<'a>(&'a self, id: &'a str, doc: &'a Value) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.write(id, doc).map_err(|(error, reason)| {
                SyncError::StoreUnavailable(format!("409 {}: {} {}", id, error, reason))
            })
        })
    }

    fn bulk_docs<'a>(&'a self, payload: &'a Path) -> BoxFuture<'a, Result<Vec<BulkResult>>> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                state.bulk_requests += 1;
                if state.fail_bulk {
                    return Err(SyncError::BulkUpdate("connection reset by peer".to_string()));
                }
            }

            let content = std::fs::read_to_string(payload).map_err(|source| SyncError::FileRead {
                path: payload.to_path_buf(),
                source,
            })?;
            let payload: BulkPayload =
                serde_json::from_str(&content).map_err(|e| SyncError::BulkUpdate(e.to_string()))?;

            Ok(payload
                .docs
                .iter()
                .map(|doc| {
                    let id = doc
                        .get(ID_FIELD)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    match self.write(&id, doc) {
                        Ok(rev) => BulkResult {
                            id,
                            rev: Some(rev),
                            error: None,
                            reason: None,
                        },
                        Err((error, reason)) => BulkResult {
                            id,
                            rev: None,
                            error: Some(error),
                            reason: Some(reason),
                        },
                    }
                })
                .collect())
        })
    }

    fn query_view<'a>(
        &'a self,
        design: &'a str,
        view: &'a str,
        _limit: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(message) = state.failing_views.get(design) {
                return Err(SyncError::StoreUnavailable(message.clone()));
            }
            state
                .view_queries
                .push((design.to_string(), view.to_string()));
            Ok(())
        })
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>> {
        Box::pin(async move {
            if self.lock().fail_connect {
                return Err(SyncError::Connection {
                    url: self.name.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(Arc::new(self.clone()) as Arc<dyn DocumentStore>)
        })
    }
}
