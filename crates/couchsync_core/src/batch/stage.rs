//! Batch staging: reconcile a batch and spool the accepted documents to disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::Value;
use tempfile::NamedTempFile;

use super::{Batch, DocumentSource};
use crate::document::{LocalDocument, RemoteDocument};
use crate::error::{DocumentFailure, Result, SyncError, SyncWarning};
use crate::fs::AsyncFileSystem;
use crate::reconcile::{ConflictReport, Decision, decide};
use crate::store::{DocumentStore, FetchRow};
use crate::timestamp::{LogicalTimestamp, TimestampStore};

/// Appends documents to a `{"docs":[...]}` payload.
///
/// Only ever used behind a mutex, so appends from concurrent reconcilers are
/// serialized and the array stays well-formed.
struct PayloadWriter {
    out: BufWriter<File>,
    count: usize,
}

impl PayloadWriter {
    fn begin(file: File) -> std::io::Result<Self> {
        let mut out = BufWriter::new(file);
        out.write_all(b"{\"docs\":[")?;
        Ok(Self { out, count: 0 })
    }

    fn append(&mut self, doc: &Value) -> std::io::Result<()> {
        if self.count > 0 {
            self.out.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.out, doc)?;
        self.count += 1;
        Ok(())
    }

    fn finish(mut self) -> std::io::Result<usize> {
        self.out.write_all(b"]}")?;
        self.out.flush()?;
        Ok(self.count)
    }
}

/// A reconciled batch whose updates sit in a staging file.
///
/// The staging file is removed when this value (or the outcome of submitting it)
/// is dropped.
#[derive(Debug)]
pub struct StagedBatch {
    /// Batch position
    pub index: usize,
    /// The `{"docs":[...]}` payload
    pub payload: NamedTempFile,
    /// Documents written to the payload
    pub staged: usize,
    /// Documents identical to the remote copy
    pub skipped: usize,
    /// Documents the remote side moved past
    pub conflicts: Vec<ConflictReport>,
    /// Documents that could not be read or staged
    pub failures: Vec<DocumentFailure>,
    /// Non-fatal problems (timestamp entries not persisted, ...)
    pub warnings: Vec<SyncWarning>,
}

impl StagedBatch {
    /// Whether there is anything to submit.
    pub fn has_documents(&self) -> bool {
        self.staged > 0
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        self.payload.path()
    }

    /// Remove the staging file without submitting it.
    pub fn discard(self) -> Option<SyncWarning> {
        super::submit::remove_payload(self.index + 1, self.payload)
    }
}

enum Outcome {
    Staged(Option<SyncWarning>),
    Skipped,
    Conflict(ConflictReport),
    Failed(DocumentFailure),
}

/// Reconciles batches of bulk documents against the store.
pub struct BatchStager {
    store: Arc<dyn DocumentStore>,
    fs: Arc<dyn AsyncFileSystem>,
    timestamps: TimestampStore,
    staging_dir: PathBuf,
}

impl BatchStager {
    /// Create a stager writing payloads into `staging_dir`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        fs: Arc<dyn AsyncFileSystem>,
        timestamps: TimestampStore,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            fs,
            timestamps,
            staging_dir: staging_dir.into(),
        }
    }

    /// Reconcile every document of `batch` and stage the updates.
    ///
    /// The remote side is read with a single keyed fetch. Documents are then
    /// reconciled concurrently; one that cannot be read or parsed becomes a
    /// [`DocumentFailure`] and does not affect the rest of the batch.
    pub async fn stage(
        &self,
        batch: &Batch<DocumentSource>,
        now: &LogicalTimestamp,
    ) -> Result<StagedBatch> {
        let keys: Vec<String> = batch.items.iter().map(|d| d.key.clone()).collect();
        let rows = self.store.fetch(&keys).await?;

        let payload = tempfile::Builder::new()
            .prefix(&format!("batch-{}-", batch.index))
            .suffix(".json")
            .tempfile_in(&self.staging_dir)
            .map_err(|source| SyncError::FileWrite {
                path: self.staging_dir.clone(),
                source,
            })?;
        let write_err = |source: std::io::Error| SyncError::FileWrite {
            path: payload.path().to_path_buf(),
            source,
        };
        let file = payload.reopen().map_err(write_err)?;
        let writer = Mutex::new(PayloadWriter::begin(file).map_err(write_err)?);

        let outcomes = join_all(
            batch
                .items
                .iter()
                .zip(rows)
                .map(|(source, row)| self.stage_one(source, row, now, &writer)),
        )
        .await;

        let writer = writer.into_inner().unwrap_or_else(|e| e.into_inner());
        let staged = writer.finish().map_err(write_err)?;

        let mut result = StagedBatch {
            index: batch.index,
            payload,
            staged,
            skipped: 0,
            conflicts: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Staged(warning) => result.warnings.extend(warning),
                Outcome::Skipped => result.skipped += 1,
                Outcome::Conflict(report) => result.conflicts.push(report),
                Outcome::Failed(failure) => result.failures.push(failure),
            }
        }

        log::info!(
            "[batch {}] staged {}, skipped {}, conflicts {}, failed {}",
            batch.index + 1,
            result.staged,
            result.skipped,
            result.conflicts.len(),
            result.failures.len()
        );
        Ok(result)
    }

    async fn stage_one(
        &self,
        source: &DocumentSource,
        row: FetchRow,
        now: &LogicalTimestamp,
        writer: &Mutex<PayloadWriter>,
    ) -> Outcome {
        let failed = |message: &dyn std::fmt::Display| {
            let failure = DocumentFailure::local(&source.key, &source.path, message);
            failure.log();
            Outcome::Failed(failure)
        };

        let content = match self.fs.read_to_string(&source.path).await {
            Ok(content) => content,
            Err(e) => return failed(&e),
        };
        let local = match LocalDocument::parse(&source.key, &content, &source.path) {
            Ok(local) => local,
            Err(e) => return failed(&e),
        };
        let stored = match self.timestamps.get(&source.key).await {
            Ok(stored) => stored,
            Err(e) => return failed(&e),
        };
        let remote = match row {
            FetchRow::Found(doc) => RemoteDocument::from_value(doc),
            FetchRow::NotFound => RemoteDocument::not_found(),
        };

        let decision = decide(&local, Some(&remote), stored.as_ref(), now);
        log::debug!("{}: {:?}", source.key, decision);

        match &decision {
            Decision::Skip => Outcome::Skipped,
            Decision::Conflict { .. } => match ConflictReport::from_decision(&source.key, &decision) {
                Some(report) => {
                    report.log();
                    Outcome::Conflict(report)
                }
                None => Outcome::Skipped,
            },
            Decision::Update { stamped, .. } => {
                let Some(body) = decision.apply(&local) else {
                    return Outcome::Skipped;
                };
                let appended = {
                    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                    writer.append(&Value::Object(body))
                };
                if let Err(e) = appended {
                    return failed(&e);
                }
                // Recorded before the bulk submission; a rejected write leaves this
                // entry ahead of the store until the next successful push.
                Outcome::Staged(self.timestamps.set(&source.key, stamped).await.err())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::plan;
    use crate::fs::{BoxFuture, InMemoryFileSystem, SyncToAsyncFs, block_on_test};
    use crate::store::MemoryStore;
    use serde_json::json;

    const NOW: &str = "2024-03-01T00:00:00.000Z";

    fn setup(fs: InMemoryFileSystem) -> (MemoryStore, BatchStager, TimestampStore, tempfile::TempDir) {
        let store = MemoryStore::new();
        let fs: Arc<dyn AsyncFileSystem> = Arc::new(SyncToAsyncFs::new(fs));
        let timestamps = TimestampStore::new(fs.clone(), "src/.revTimestamps");
        let staging = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(
            Arc::new(store.clone()),
            fs,
            timestamps.clone(),
            staging.path(),
        );
        (store, stager, timestamps, staging)
    }

    /// Suspends before every read and write, so concurrent reconcilers interleave.
    struct YieldingFs(SyncToAsyncFs<InMemoryFileSystem>);

    impl AsyncFileSystem for YieldingFs {
        fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<String>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.0.read_to_string(path).await
            })
        }

        fn write_file<'a>(
            &'a self,
            path: &'a Path,
            content: &'a str,
        ) -> BoxFuture<'a, std::io::Result<()>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.0.write_file(path, content).await
            })
        }

        fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, std::io::Result<()>> {
            self.0.create_dir_all(path)
        }

        fn is_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
            self.0.is_dir(path)
        }

        fn list_files<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, std::io::Result<Vec<PathBuf>>> {
            self.0.list_files(dir)
        }
    }

    fn sources(keys: &[&str]) -> Vec<DocumentSource> {
        keys.iter()
            .map(|k| DocumentSource {
                key: k.to_string(),
                path: PathBuf::from(format!("src/docs/{}.json", k)),
            })
            .collect()
    }

    #[test]
    fn test_stage_writes_payload_and_timestamps() {
        let fs = InMemoryFileSystem::new()
            .with_file("src/docs/a.json", r#"{"name": "A"}"#)
            .with_file("src/docs/b.json", r#"{"name": "B"}"#);
        let (store, stager, timestamps, _staging) = setup(fs);
        store.put_remote("b", json!({"name": "B"}));

        let batch = plan(sources(&["a", "b"]), 10).remove(0);
        let staged = block_on_test(stager.stage(&batch, &LogicalTimestamp::from(NOW))).unwrap();

        assert_eq!(staged.staged, 1);
        assert_eq!(staged.skipped, 1);
        assert!(staged.has_documents());

        let payload: Value = serde_json::from_str(&std::fs::read_to_string(staged.path()).unwrap()).unwrap();
        assert_eq!(
            payload,
            json!({"docs": [{"_id": "a", "name": "A", "revTimestamp": NOW}]})
        );
        assert_eq!(
            block_on_test(timestamps.get("a")).unwrap(),
            Some(LogicalTimestamp::from(NOW))
        );
        assert_eq!(block_on_test(timestamps.get("b")).unwrap(), None);
    }

    #[test]
    fn test_unreadable_document_does_not_abort_batch() {
        let fs = InMemoryFileSystem::new()
            .with_file("src/docs/good.json", r#"{"ok": true}"#)
            .with_file("src/docs/bad.json", "{ not json");
        let (_store, stager, _timestamps, _staging) = setup(fs);

        let batch = plan(sources(&["bad", "good", "missing"]), 10).remove(0);
        let staged = block_on_test(stager.stage(&batch, &LogicalTimestamp::from(NOW))).unwrap();

        assert_eq!(staged.staged, 1);
        let failed: Vec<_> = staged.failures.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(failed, vec!["bad", "missing"]);
    }

    #[test]
    fn test_conflict_is_reported_and_not_staged() {
        let fs = InMemoryFileSystem::new()
            .with_file("src/docs/a.json", r#"{"name": "mine"}"#)
            .with_file("src/.revTimestamps/a.txt", "2024-01-01T00:00:00.000Z");
        let (store, stager, timestamps, _staging) = setup(fs);
        store.put_remote(
            "a",
            json!({"name": "theirs", "revTimestamp": "2024-02-01T00:00:00.000Z"}),
        );

        let batch = plan(sources(&["a"]), 10).remove(0);
        let staged = block_on_test(stager.stage(&batch, &LogicalTimestamp::from(NOW))).unwrap();

        assert!(!staged.has_documents());
        assert_eq!(staged.conflicts.len(), 1);
        assert_eq!(staged.conflicts[0].key, "a");
        assert_eq!(
            block_on_test(timestamps.get("a")).unwrap(),
            Some(LogicalTimestamp::from("2024-01-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn test_read_only_cache_still_stages() {
        let fs = InMemoryFileSystem::new().with_file("src/docs/a.json", r#"{"name": "A"}"#);
        fs.set_read_only(true);
        let (_store, stager, _timestamps, _staging) = setup(fs);

        let batch = plan(sources(&["a"]), 10).remove(0);
        let staged = block_on_test(stager.stage(&batch, &LogicalTimestamp::from(NOW))).unwrap();

        assert_eq!(staged.staged, 1);
        assert!(matches!(
            staged.warnings.as_slice(),
            [SyncWarning::TimestampNotPersisted { .. }]
        ));
    }

    #[tokio::test]
    async fn test_interleaved_appends_keep_payload_well_formed() {
        let keys: Vec<String> = (0..300).map(|i| format!("doc-{:03}", i)).collect();
        let fs = keys.iter().fold(InMemoryFileSystem::new(), |fs, key| {
            fs.with_file(format!("src/docs/{}.json", key), &format!(r#"{{"n": "{}"}}"#, key))
        });
        let store = MemoryStore::new();
        let fs: Arc<dyn AsyncFileSystem> = Arc::new(YieldingFs(SyncToAsyncFs::new(fs)));
        let timestamps = TimestampStore::new(fs.clone(), "src/.revTimestamps");
        let staging = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(Arc::new(store), fs, timestamps, staging.path());

        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let batch = plan(sources(&key_refs), keys.len()).remove(0);
        let staged = stager
            .stage(&batch, &LogicalTimestamp::from(NOW))
            .await
            .unwrap();
        assert_eq!(staged.staged, keys.len());
        assert!(staged.failures.is_empty());

        let payload: Value =
            serde_json::from_str(&std::fs::read_to_string(staged.path()).unwrap()).unwrap();
        let mut ids: Vec<&str> = payload["docs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|doc| doc["_id"].as_str().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, key_refs);
    }
}
