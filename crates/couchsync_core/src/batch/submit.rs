//! Batch submission.

use serde::Serialize;
use tempfile::NamedTempFile;

use super::StagedBatch;
use crate::cancel::CancelToken;
use crate::error::{DocumentFailure, Result, SyncError, SyncWarning};
use crate::store::DocumentStore;

/// What the store did with a submitted batch.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SubmitOutcome {
    /// Documents the store accepted
    pub written: usize,
    /// Documents the store rejected
    pub failures: Vec<DocumentFailure>,
    /// Non-fatal problems (the staging file could not be removed, ...)
    pub warnings: Vec<SyncWarning>,
}

/// Stream a staged batch to the store's bulk endpoint.
///
/// The staging file is removed afterwards whatever the outcome. Rejected rows are
/// per-document failures; a transport failure fails the whole batch with
/// [`SyncError::BulkUpdate`].
pub async fn submit(
    store: &dyn DocumentStore,
    staged: StagedBatch,
    cancel: &CancelToken,
) -> Result<SubmitOutcome> {
    let StagedBatch { index, payload, .. } = staged;
    let batch = index + 1;

    log::info!("[batch {}] submitting {}", batch, payload.path().display());
    let response = cancel.race(store.bulk_docs(payload.path())).await;
    let cleanup = remove_payload(batch, payload);

    let results = response.map_err(|e| match e {
        SyncError::BulkUpdate(_) | SyncError::Cancelled => e,
        other => SyncError::BulkUpdate(other.to_string()),
    })?;

    let mut outcome = SubmitOutcome {
        warnings: cleanup.into_iter().collect(),
        ..SubmitOutcome::default()
    };
    for row in results {
        if row.is_ok() {
            outcome.written += 1;
        } else {
            let failure = DocumentFailure::remote(
                row.id,
                format!(
                    "{}: {}",
                    row.error.unwrap_or_default(),
                    row.reason.unwrap_or_default()
                ),
            );
            failure.log();
            outcome.failures.push(failure);
        }
    }

    log::info!(
        "[batch {}] {} written, {} rejected",
        batch,
        outcome.written,
        outcome.failures.len()
    );
    Ok(outcome)
}

/// Delete a staging file, reporting (not failing on) an unsuccessful delete.
pub(crate) fn remove_payload(batch: usize, payload: NamedTempFile) -> Option<SyncWarning> {
    let path = payload.path().to_path_buf();
    payload.close().err().map(|e| {
        let warning = SyncWarning::StagingCleanup {
            path,
            message: e.to_string(),
        };
        log::warn!("[batch {}] {}", batch, warning);
        warning
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchStager, DocumentSource, plan};
    use crate::fs::{AsyncFileSystem, InMemoryFileSystem, SyncToAsyncFs};
    use crate::store::MemoryStore;
    use crate::timestamp::{LogicalTimestamp, TimestampStore};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn stage(store: &MemoryStore, staging: &std::path::Path) -> StagedBatch {
        let fs: Arc<dyn AsyncFileSystem> = Arc::new(SyncToAsyncFs::new(
            InMemoryFileSystem::new()
                .with_file("docs/a.json", r#"{"n": 1}"#)
                .with_file("docs/b.json", r#"{"n": 2}"#),
        ));
        let timestamps = TimestampStore::new(fs.clone(), ".revTimestamps");
        let stager = BatchStager::new(Arc::new(store.clone()), fs, timestamps, staging);
        let sources = ["a", "b"]
            .iter()
            .map(|k| DocumentSource {
                key: k.to_string(),
                path: PathBuf::from(format!("docs/{}.json", k)),
            })
            .collect();
        let batch = plan(sources, 10).remove(0);
        stager
            .stage(&batch, &LogicalTimestamp::from("2024-03-01T00:00:00.000Z"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_writes_and_cleans_up() {
        let store = MemoryStore::new();
        let staging = tempfile::tempdir().unwrap();
        let staged = stage(&store, staging.path()).await;
        let path = staged.path().to_path_buf();

        let outcome = submit(&store, staged, &CancelToken::new()).await.unwrap();

        assert_eq!(outcome.written, 2);
        assert!(outcome.failures.is_empty());
        assert!(!path.exists());
        assert_eq!(store.doc("a").unwrap()["n"], json!(1));
    }

    #[tokio::test]
    async fn test_transport_failure_still_cleans_up() {
        let store = MemoryStore::new();
        let staging = tempfile::tempdir().unwrap();
        let staged = stage(&store, staging.path()).await;
        let path = staged.path().to_path_buf();
        store.fail_bulk(true);

        let err = submit(&store, staged, &CancelToken::new()).await.unwrap_err();

        assert!(matches!(err, SyncError::BulkUpdate(_)));
        assert!(!path.exists());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_rows_are_document_failures() {
        let store = MemoryStore::new();
        let staging = tempfile::tempdir().unwrap();
        let staged = stage(&store, staging.path()).await;
        // Another writer gets in between staging and submission.
        store.put_remote("b", json!({"n": 99}));

        let outcome = submit(&store, staged, &CancelToken::new()).await.unwrap();

        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, "b");
        assert!(outcome.failures[0].message.starts_with("conflict"));
    }
}
