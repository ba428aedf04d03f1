//! Design documents: reading the local `_design` tree, pushing it, and kicking off
//! index builds.
//!
//! A design document is authored as a directory under `_design/`. Sub-directories
//! become nested objects and files become fields named after their stem:
//!
//! ```text
//! _design/app/
//!   language.txt          -> "language": "javascript"
//!   views/by_name/map.js  -> "views": {"by_name": {"map": "function (doc) {...}"}}
//!   options.json          -> "options": {...}
//!   version.json          -> "version": 3
//! ```
//!
//! `.json` files are parsed; every other file is a raw string, so `version.txt`
//! holding `3` is the string `"3"`.
//!
//! Design documents are few, so each one is reconciled and written on its own
//! rather than through the batch path.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use futures_util::future::join_all;
use serde_json::{Map, Value};

use crate::document::{LocalDocument, RemoteDocument, design_key};
use crate::error::{DocumentFailure, Result, SyncError, SyncWarning};
use crate::fs::{AsyncFileSystem, BoxFuture};
use crate::reconcile::{ConflictReport, Decision, decide};
use crate::store::DocumentStore;
use crate::timestamp::{LogicalTimestamp, TimestampStore};

/// Design documents read from disk, keyed by name (`app` for `_design/app`).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DesignTree {
    /// Parsed documents
    pub docs: BTreeMap<String, Map<String, Value>>,
    /// Designs that could not be read
    pub failures: Vec<DocumentFailure>,
}

/// Read every design document below `dir`. A missing directory is an empty tree.
pub async fn read_design_tree(fs: &dyn AsyncFileSystem, dir: &Path) -> Result<DesignTree> {
    let mut tree = DesignTree::default();
    if !fs.is_dir(dir).await {
        return Ok(tree);
    }

    let mut entries = fs.list_files(dir).await.map_err(|source| SyncError::FileRead {
        path: dir.to_path_buf(),
        source,
    })?;
    entries.sort();

    for entry in entries {
        let Some(name) = visible_name(&entry) else {
            continue;
        };

        let parsed = if fs.is_dir(&entry).await {
            read_object(fs, &entry).await.map(|doc| (name.to_string(), doc))
        } else if let Some(stem) = name.strip_suffix(".json") {
            read_whole(fs, &entry, stem).await.map(|doc| (stem.to_string(), doc))
        } else {
            log::debug!("[design] ignoring {}", entry.display());
            continue;
        };

        match parsed {
            Ok((name, doc)) => {
                tree.docs.insert(name, doc);
            }
            Err(e) => {
                let failure = DocumentFailure::local(design_key(name), &entry, &e);
                failure.log();
                tree.failures.push(failure);
            }
        }
    }

    Ok(tree)
}

fn visible_name(path: &Path) -> Option<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
}

/// A pre-materialized `<name>.json` design document.
async fn read_whole(fs: &dyn AsyncFileSystem, path: &Path, name: &str) -> Result<Map<String, Value>> {
    let content = fs.read_to_string(path).await.map_err(|source| SyncError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(LocalDocument::parse(design_key(name), &content, path)?.body)
}

fn read_object<'a>(
    fs: &'a dyn AsyncFileSystem,
    dir: &'a Path,
) -> BoxFuture<'a, Result<Map<String, Value>>> {
    Box::pin(async move {
        let mut object = Map::new();
        let mut entries = fs.list_files(dir).await.map_err(|source| SyncError::FileRead {
            path: dir.to_path_buf(),
            source,
        })?;
        entries.sort();

        for entry in entries {
            let Some(name) = visible_name(&entry) else {
                continue;
            };

            if fs.is_dir(&entry).await {
                let nested = read_object(fs, &entry).await?;
                object.insert(name.to_string(), Value::Object(nested));
                continue;
            }

            let (field, extension) = match name.rsplit_once('.') {
                Some((field, extension)) => (field, extension),
                None => (name, ""),
            };
            let content = fs.read_to_string(&entry).await.map_err(|source| SyncError::FileRead {
                path: entry.clone(),
                source,
            })?;
            object.insert(field.to_string(), field_value(extension, content, &entry)?);
        }

        Ok(object)
    })
}

fn field_value(extension: &str, content: String, path: &Path) -> Result<Value> {
    match extension {
        "json" => serde_json::from_str(&content).map_err(|e| SyncError::InvalidDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        _ => Ok(Value::String(content)),
    }
}

/// What happened to the design documents.
#[derive(Debug, Default, Clone)]
pub struct DesignOutcome {
    /// Designs written to the store
    pub updated: Vec<String>,
    /// Designs identical to the remote copy
    pub skipped: usize,
    /// Designs the remote side moved past
    pub conflicts: Vec<ConflictReport>,
    /// Designs that could not be reconciled or written
    pub failures: Vec<DocumentFailure>,
    /// Non-fatal problems
    pub warnings: Vec<SyncWarning>,
}

enum Outcome {
    Updated(String, Option<SyncWarning>),
    Skipped,
    Conflict(ConflictReport),
    Failed(DocumentFailure),
}

/// Reconcile each local design document against `existing` and write the ones
/// that changed.
///
/// Unlike bulk documents, the timestamp entry of a design document only moves
/// once the store has accepted the write.
pub async fn sync_design_docs(
    store: &dyn DocumentStore,
    timestamps: &TimestampStore,
    local: &BTreeMap<String, Map<String, Value>>,
    existing: &HashMap<String, RemoteDocument>,
    now: &LogicalTimestamp,
) -> DesignOutcome {
    let outcomes = join_all(
        local
            .iter()
            .map(|(name, body)| sync_one(store, timestamps, name, body, existing.get(name), now)),
    )
    .await;

    let mut result = DesignOutcome::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Updated(key, warning) => {
                result.updated.push(key);
                result.warnings.extend(warning);
            }
            Outcome::Skipped => result.skipped += 1,
            Outcome::Conflict(report) => result.conflicts.push(report),
            Outcome::Failed(failure) => result.failures.push(failure),
        }
    }
    result
}

async fn sync_one(
    store: &dyn DocumentStore,
    timestamps: &TimestampStore,
    name: &str,
    body: &Map<String, Value>,
    remote: Option<&RemoteDocument>,
    now: &LogicalTimestamp,
) -> Outcome {
    let key = design_key(name);
    let local = LocalDocument::new(key.clone(), body.clone());

    let stored = match timestamps.get(&key).await {
        Ok(stored) => stored,
        Err(e) => {
            let failure = DocumentFailure::remote(&key, &e);
            failure.log();
            return Outcome::Failed(failure);
        }
    };

    let decision = decide(&local, remote, stored.as_ref(), now);
    match &decision {
        Decision::Skip => {
            log::info!("[design] Skipping {}, no changes detected", key);
            Outcome::Skipped
        }
        Decision::Conflict { .. } => match ConflictReport::from_decision(&key, &decision) {
            Some(report) => {
                report.log();
                Outcome::Conflict(report)
            }
            None => Outcome::Skipped,
        },
        Decision::Update { stamped, .. } => {
            let Some(doc) = decision.apply(&local) else {
                return Outcome::Skipped;
            };
            log::info!("[design] Updating {}", key);
            match store.insert(&key, &Value::Object(doc)).await {
                Ok(_) => {
                    let warning = timestamps.set(&key, stamped).await.err();
                    Outcome::Updated(key, warning)
                }
                Err(e) => {
                    let failure = DocumentFailure::remote(&key, &e);
                    failure.log();
                    Outcome::Failed(failure)
                }
            }
        }
    }
}

/// Designs whose views were queried, and those whose query failed.
#[derive(Debug, Default, Clone)]
pub struct IndexOutcome {
    /// Design names whose first view answered
    pub rebuilt: Vec<String>,
    /// Designs whose view query failed
    pub failures: Vec<DocumentFailure>,
}

/// Query the first view of every design document that has views, so the store
/// rebuilds its indexes now rather than on the first real query.
pub async fn rebuild_indexes(
    store: &dyn DocumentStore,
    existing: &HashMap<String, RemoteDocument>,
) -> IndexOutcome {
    let mut targets: Vec<(&str, &str)> = existing
        .iter()
        .filter_map(|(name, doc)| {
            let views = doc.body.get("views")?.as_object()?;
            let first = views.keys().next()?;
            Some((name.as_str(), first.as_str()))
        })
        .collect();
    targets.sort();

    let results = join_all(targets.into_iter().map(|(design, view)| async move {
        log::info!("[index] Rebuilding {} views", design);
        let result = store.query_view(design, view, 1).await;
        (design, result)
    }))
    .await;

    let mut outcome = IndexOutcome::default();
    for (design, result) in results {
        match result {
            Ok(()) => {
                log::info!("[index] {} view rebuilding complete", design);
                outcome.rebuilt.push(design.to_string());
            }
            Err(e) => {
                let failure = DocumentFailure::remote(design_key(design), &e);
                failure.log();
                outcome.failures.push(failure);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InMemoryFileSystem, SyncToAsyncFs, block_on_test};
    use crate::snapshot::fetch_by_prefix;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    const NOW: &str = "2024-03-01T00:00:00.000Z";

    fn read(fs: InMemoryFileSystem) -> DesignTree {
        let fs = SyncToAsyncFs::new(fs);
        block_on_test(read_design_tree(&fs, Path::new("src/_design"))).unwrap()
    }

    #[test]
    fn test_tree_maps_files_to_fields() {
        let tree = read(
            InMemoryFileSystem::new()
                .with_file("src/_design/app/language.txt", "javascript")
                .with_file("src/_design/app/views/by_name/map.js", "function (doc) { emit(doc.name); }")
                .with_file("src/_design/app/views/by_name/reduce.js", "_count")
                .with_file("src/_design/app/options.json", r#"{"local_seq": true}"#)
                .with_file("src/_design/app/version.json", "3")
                .with_file("src/_design/app/release.txt", "3")
                .with_file("src/_design/app/.DS_Store", "junk"),
        );

        assert_eq!(
            Value::Object(tree.docs["app"].clone()),
            json!({
                "language": "javascript",
                "version": 3,
                "release": "3",
                "options": {"local_seq": true},
                "views": {"by_name": {
                    "map": "function (doc) { emit(doc.name); }",
                    "reduce": "_count"
                }}
            })
        );
        assert!(tree.failures.is_empty());
    }

    #[test]
    fn test_tree_accepts_whole_json_documents() {
        let tree = read(
            InMemoryFileSystem::new()
                .with_file("src/_design/admin.json", r#"{"views": {}}"#)
                .with_file("src/_design/README", "ignored"),
        );
        assert_eq!(tree.docs.keys().collect::<Vec<_>>(), vec!["admin"]);
    }

    #[test]
    fn test_broken_design_is_a_failure_not_an_abort() {
        let tree = read(
            InMemoryFileSystem::new()
                .with_file("src/_design/bad/options.json", "{ nope")
                .with_file("src/_design/good/language.txt", "javascript"),
        );
        assert_eq!(tree.docs.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(tree.failures[0].key, "_design/bad");
    }

    #[test]
    fn test_missing_design_dir_is_empty() {
        assert!(read(InMemoryFileSystem::new()).docs.is_empty());
    }

    #[test]
    fn test_text_files_are_always_strings() {
        let tree = read(
            InMemoryFileSystem::new()
                .with_file("src/_design/app/flag.txt", "true")
                .with_file("src/_design/app/nothing.txt", "null")
                .with_file("src/_design/app/list.txt", "[1]")
                .with_file("src/_design/app/note.txt", "hello\n"),
        );

        assert_eq!(
            Value::Object(tree.docs["app"].clone()),
            json!({"flag": "true", "nothing": "null", "list": "[1]", "note": "hello\n"})
        );
    }

    fn timestamps(fs: &InMemoryFileSystem) -> TimestampStore {
        TimestampStore::new(Arc::new(SyncToAsyncFs::new(fs.clone())), "src/.revTimestamps")
    }

    fn local(docs: &[(&str, Value)]) -> BTreeMap<String, Map<String, Value>> {
        docs.iter()
            .map(|(name, body)| (name.to_string(), body.as_object().cloned().unwrap()))
            .collect()
    }

    #[test]
    fn test_sync_inserts_and_records_timestamp() {
        let store = MemoryStore::new();
        let fs = InMemoryFileSystem::new();
        let ts = timestamps(&fs);

        let outcome = block_on_test(sync_design_docs(
            &store,
            &ts,
            &local(&[("app", json!({"language": "javascript"}))]),
            &HashMap::new(),
            &LogicalTimestamp::from(NOW),
        ));

        assert_eq!(outcome.updated, vec!["_design/app"]);
        assert_eq!(store.doc("_design/app").unwrap()["revTimestamp"], json!(NOW));
        assert_eq!(
            fs.get_content("src/.revTimestamps/_design/app.txt").as_deref(),
            Some(NOW)
        );
    }

    #[test]
    fn test_sync_skips_unchanged_and_reports_conflicts() {
        let store = MemoryStore::new();
        store.put_remote("_design/same", json!({"language": "javascript"}));
        store.put_remote(
            "_design/moved",
            json!({"language": "erlang", "revTimestamp": "2024-02-01T00:00:00.000Z"}),
        );
        let fs = InMemoryFileSystem::new()
            .with_file("src/.revTimestamps/_design/moved.txt", "2024-01-01T00:00:00.000Z");
        let ts = timestamps(&fs);
        let existing = block_on_test(fetch_by_prefix(&store, "_design")).unwrap();

        let outcome = block_on_test(sync_design_docs(
            &store,
            &ts,
            &local(&[
                ("same", json!({"language": "javascript"})),
                ("moved", json!({"language": "javascript"})),
            ]),
            &existing,
            &LogicalTimestamp::from(NOW),
        ));

        assert!(outcome.updated.is_empty());
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.conflicts[0].key, "_design/moved");
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_failed_insert_leaves_timestamp_alone() {
        let store = MemoryStore::new();
        store.put_remote("_design/app", json!({"language": "erlang"}));
        let fs = InMemoryFileSystem::new();
        let ts = timestamps(&fs);

        // No snapshot entry, so the write carries no `_rev` and the store refuses it.
        let outcome = block_on_test(sync_design_docs(
            &store,
            &ts,
            &local(&[("app", json!({"language": "javascript"}))]),
            &HashMap::new(),
            &LogicalTimestamp::from(NOW),
        ));

        assert_eq!(outcome.failures.len(), 1);
        assert!(fs.get_content("src/.revTimestamps/_design/app.txt").is_none());
    }

    #[test]
    fn test_rebuild_queries_first_view_of_each_design() {
        let store = MemoryStore::new();
        store.put_remote(
            "_design/app",
            json!({"views": {"by_name": {"map": "f"}, "by_age": {"map": "g"}}}),
        );
        store.put_remote("_design/validation", json!({"validate_doc_update": "f"}));
        store.put_remote("_design/broken", json!({"views": {"all": {"map": "f"}}}));
        store.fail_views("broken", "500 compilation error");
        let existing = block_on_test(fetch_by_prefix(&store, "_design")).unwrap();

        let outcome = block_on_test(rebuild_indexes(&store, &existing));

        assert_eq!(outcome.rebuilt, vec!["app"]);
        assert_eq!(outcome.failures[0].key, "_design/broken");
        assert_eq!(
            store.view_queries(),
            vec![("app".to_string(), "by_name".to_string())]
        );
    }
}
