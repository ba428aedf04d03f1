//! The synchronization driver.
//!
//! A run walks a fixed sequence of stages, each fully settled before the next
//! begins:
//!
//! ```text
//! Init -> Connected -> DesignDocsSynced -> BulkDocsSynced -> IndexesRebuilt -> Done
//!   \________\_______________\__________________\________________\_______-> Failed
//! ```
//!
//! [`SyncDriver::run`] never fails: whatever happened is in the returned
//! [`SyncReport`], including the work directory the run produced.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::{Batch, BatchStager, DocumentSource, batch_count, plan, submit};
use crate::bootstrap::materialize_designs;
use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::design::{read_design_tree, rebuild_indexes, sync_design_docs};
use crate::document::{DOC_EXTENSION, bulk_key};
use crate::error::{DocumentFailure, Result, SerializableError, SyncError, SyncWarning};
use crate::fs::AsyncFileSystem;
use crate::reconcile::ConflictReport;
use crate::snapshot::fetch_by_prefix;
use crate::store::{DocumentStore, StoreConnector};
use crate::timestamp::{LogicalTimestamp, TimestampStore};

/// Range prefix covering every design document
const DESIGN_RANGE: &str = "_design";

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// Preparing the work directory and timestamp cache
    Init,
    /// Holding an authenticated store handle
    Connected,
    /// Design documents reconciled
    DesignDocsSynced,
    /// Bulk documents reconciled
    BulkDocsSynced,
    /// Index rebuilds triggered
    IndexesRebuilt,
    /// Finished
    Done,
    /// Stopped by a fatal error or cancellation
    Failed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Init => "init",
            DriverState::Connected => "connected",
            DriverState::DesignDocsSynced => "design docs synced",
            DriverState::BulkDocsSynced => "bulk docs synced",
            DriverState::IndexesRebuilt => "indexes rebuilt",
            DriverState::Done => "done",
            DriverState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-stage document counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Written to the store
    pub updated: usize,
    /// Unchanged
    pub skipped: usize,
    /// Rejected by reconciliation
    pub conflicts: usize,
    /// Could not be read, staged or written
    pub failed: usize,
}

/// What happened to one batch.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    /// Batch position
    pub index: usize,
    /// Documents in the batch
    pub size: usize,
    /// Documents staged for writing
    pub staged: usize,
    /// Documents the store accepted
    pub written: usize,
    /// Batch-level failure, if any
    pub error: Option<SerializableError>,
}

/// Everything a run did.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// The run's work directory (staging payloads live here)
    pub work_dir: Option<PathBuf>,
    /// Where the run ended
    pub final_state: DriverState,
    /// The stage a failed run was in
    pub failed_in: Option<DriverState>,
    /// Design document counts
    pub design: StageCounts,
    /// Bulk document counts
    pub docs: StageCounts,
    /// Per-batch results, in processing order
    pub batches: Vec<BatchReport>,
    /// Design documents materialized by the bootstrap
    pub bootstrapped: Vec<String>,
    /// Every conflict detected
    pub conflicts: Vec<ConflictReport>,
    /// Non-fatal problems
    pub warnings: Vec<SyncWarning>,
    /// Per-document failures
    pub failures: Vec<DocumentFailure>,
    /// Designs whose indexes were rebuilt
    pub indexes_rebuilt: Vec<String>,
    /// The fatal error, for a failed run
    pub error: Option<SerializableError>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            work_dir: None,
            final_state: DriverState::Init,
            failed_in: None,
            design: StageCounts::default(),
            docs: StageCounts::default(),
            batches: Vec::new(),
            bootstrapped: Vec::new(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            failures: Vec::new(),
            indexes_rebuilt: Vec::new(),
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// The run reached `Done` and every batch went through.
    pub fn is_success(&self) -> bool {
        self.final_state == DriverState::Done
            && self.error.is_none()
            && self.batches.iter().all(|b| b.error.is_none())
    }

    /// Whether any conflict was reported.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Runs one synchronization pass.
pub struct SyncDriver {
    config: SyncConfig,
    connector: Arc<dyn StoreConnector>,
    fs: Arc<dyn AsyncFileSystem>,
    cancel: CancelToken,
    state: DriverState,
}

impl SyncDriver {
    /// Create a driver for `config`, reading the source tree through `fs`.
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn StoreConnector>,
        fs: Arc<dyn AsyncFileSystem>,
    ) -> Self {
        Self {
            config,
            connector,
            fs,
            cancel: CancelToken::new(),
            state: DriverState::Init,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle that cancels this run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        log::info!("[sync] {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run every stage. Never fails; see [`SyncReport`].
    pub async fn run(&mut self) -> SyncReport {
        let mut report = SyncReport::new();

        match self.execute(&mut report).await {
            Ok(()) => self.transition(DriverState::Done),
            Err(e) => {
                log::error!(
                    "[sync] {} failed during '{}': {}",
                    Utc::now().to_rfc3339(),
                    self.state,
                    e
                );
                report.failed_in = Some(self.state);
                report.error = Some(e.to_serializable());
                self.state = DriverState::Failed;
            }
        }

        if let Some(dir) = &report.work_dir {
            log::info!("[sync] work directory: {}", dir.display());
        }
        report.final_state = self.state;
        report.finished_at = Utc::now();
        report
    }

    async fn execute(&mut self, report: &mut SyncReport) -> Result<()> {
        self.state = DriverState::Init;
        let work_dir = self.prepare_work_dir(report);
        report.work_dir = work_dir.clone();
        let staging_dir = work_dir.unwrap_or_else(|| self.config.temp_dir());

        let timestamps = TimestampStore::new(self.fs.clone(), self.config.timestamp_dir());
        if let Err(warning) = timestamps.ensure_root().await {
            report.warnings.push(warning);
        }
        self.cancel.check()?;

        let store = self.cancel.race(self.connector.connect()).await?;
        self.transition(DriverState::Connected);

        if self.config.init_design {
            self.bootstrap(store.as_ref(), &timestamps, report).await?;
        }

        self.cancel.check()?;
        self.sync_designs(store.as_ref(), &timestamps, report).await?;
        self.transition(DriverState::DesignDocsSynced);

        if self.config.manage_docs {
            self.cancel.check()?;
            self.sync_bulk_docs(store.clone(), &timestamps, &staging_dir, report)
                .await?;
        }
        self.transition(DriverState::BulkDocsSynced);

        if self.config.rebuild_indexes {
            self.cancel.check()?;
            let existing = self
                .cancel
                .race(fetch_by_prefix(store.as_ref(), DESIGN_RANGE))
                .await?;
            let outcome = self
                .cancel
                .race(async { Ok(rebuild_indexes(store.as_ref(), &existing).await) })
                .await?;
            report.indexes_rebuilt = outcome.rebuilt;
            report.failures.extend(outcome.failures);
        }
        self.transition(DriverState::IndexesRebuilt);

        Ok(())
    }

    /// Create the run's work directory. It is kept after the run so callers can
    /// inspect it; failing to create it only costs that.
    fn prepare_work_dir(&self, report: &mut SyncReport) -> Option<PathBuf> {
        let parent = self.config.temp_dir();
        match tempfile::Builder::new()
            .prefix("couchsync-")
            .suffix(".tmp")
            .tempdir_in(&parent)
        {
            Ok(dir) => Some(dir.keep()),
            Err(e) => {
                let warning = SyncWarning::TempDir {
                    message: format!("{}: {}", parent.display(), e),
                };
                log::warn!("[sync] {}", warning);
                report.warnings.push(warning);
                None
            }
        }
    }

    async fn bootstrap(
        &self,
        store: &dyn DocumentStore,
        timestamps: &TimestampStore,
        report: &mut SyncReport,
    ) -> Result<()> {
        log::info!("[bootstrap] Initializing local design documents");
        let existing = self
            .cancel
            .race(fetch_by_prefix(store, DESIGN_RANGE))
            .await?;
        let outcome = materialize_designs(
            self.fs.as_ref(),
            timestamps,
            &self.config.design_dir(),
            &existing,
            &LogicalTimestamp::now(),
        )
        .await?;

        report.bootstrapped = outcome.designs;
        report.warnings.extend(outcome.warnings);
        Ok(())
    }

    async fn sync_designs(
        &self,
        store: &dyn DocumentStore,
        timestamps: &TimestampStore,
        report: &mut SyncReport,
    ) -> Result<()> {
        log::info!("[design] Updating design documents");
        let tree = read_design_tree(self.fs.as_ref(), &self.config.design_dir()).await?;
        report.design.failed += tree.failures.len();
        report.failures.extend(tree.failures);

        let existing = self
            .cancel
            .race(fetch_by_prefix(store, DESIGN_RANGE))
            .await?;
        let now = LogicalTimestamp::now();
        let outcome = self
            .cancel
            .race(async {
                Ok(sync_design_docs(store, timestamps, &tree.docs, &existing, &now).await)
            })
            .await?;

        report.design.updated += outcome.updated.len();
        report.design.skipped += outcome.skipped;
        report.design.conflicts += outcome.conflicts.len();
        report.design.failed += outcome.failures.len();
        report.conflicts.extend(outcome.conflicts);
        report.failures.extend(outcome.failures);
        report.warnings.extend(outcome.warnings);
        Ok(())
    }

    async fn sync_bulk_docs(
        &self,
        store: Arc<dyn DocumentStore>,
        timestamps: &TimestampStore,
        staging_dir: &Path,
        report: &mut SyncReport,
    ) -> Result<()> {
        let sources = self.collect_sources(report).await?;
        if sources.is_empty() {
            log::info!("[docs] No documents to synchronize");
            return Ok(());
        }

        let batch_size = self.config.batch_size;
        log::info!(
            "[docs] Processing {} files in {} batches",
            sources.len(),
            batch_count(sources.len(), batch_size)
        );

        let stager = BatchStager::new(
            store.clone(),
            self.fs.clone(),
            timestamps.clone(),
            staging_dir,
        );

        let batches = plan(sources, batch_size);
        let total = batches.len();
        for batch in &batches {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "[docs] Cancelled, skipping {} remaining batch(es)",
                    total - batch.index
                );
                return Err(SyncError::Cancelled);
            }

            let mut batch_report = BatchReport {
                index: batch.index,
                size: batch.len(),
                ..BatchReport::default()
            };
            let result = self
                .run_batch(&stager, store.as_ref(), batch, &mut batch_report, report)
                .await;

            match result {
                Ok(()) => log::info!("[batch {}] complete", batch.index + 1),
                Err(SyncError::Cancelled) => {
                    batch_report.error = Some(SyncError::Cancelled.to_serializable());
                    report.batches.push(batch_report);
                    return Err(SyncError::Cancelled);
                }
                Err(e) => {
                    log::error!("[batch {}] {}", batch.index + 1, e);
                    batch_report.error = Some(e.to_serializable());
                }
            }
            report.batches.push(batch_report);
        }
        Ok(())
    }

    async fn run_batch(
        &self,
        stager: &BatchStager,
        store: &dyn DocumentStore,
        batch: &Batch<DocumentSource>,
        batch_report: &mut BatchReport,
        report: &mut SyncReport,
    ) -> Result<()> {
        log::info!("[batch {}] Preparing", batch.index + 1);
        let now = LogicalTimestamp::now();
        let mut staged = match self.cancel.race(stager.stage(batch, &now)).await {
            Ok(staged) => staged,
            Err(e) => {
                report.docs.failed += batch.len();
                return Err(e);
            }
        };

        let staged_count = staged.staged;
        batch_report.staged = staged_count;
        report.docs.skipped += staged.skipped;
        report.docs.conflicts += staged.conflicts.len();
        report.docs.failed += staged.failures.len();
        report.conflicts.append(&mut staged.conflicts);
        report.failures.append(&mut staged.failures);
        report.warnings.append(&mut staged.warnings);

        if !staged.has_documents() {
            log::info!("[batch {}] Nothing changed, skipping", batch.index + 1);
            report.warnings.extend(staged.discard());
            return Ok(());
        }

        log::info!("[batch {}] Pushing to {}", batch.index + 1, store.name());
        let outcome = match submit(store, staged, &self.cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                report.docs.failed += staged_count;
                return Err(e);
            }
        };

        batch_report.written = outcome.written;
        report.docs.updated += outcome.written;
        report.docs.failed += outcome.failures.len();
        report.failures.extend(outcome.failures);
        report.warnings.extend(outcome.warnings);
        Ok(())
    }

    /// Every `docs/**/*.json` file, sorted by path. A key seen twice (same file
    /// name in two sub-directories) is synchronized once; the others are failures.
    async fn collect_sources(&self, report: &mut SyncReport) -> Result<Vec<DocumentSource>> {
        let docs_dir = self.config.docs_dir();
        let mut files = self
            .fs
            .list_all_files_recursive(&docs_dir)
            .await
            .map_err(|source| SyncError::FileRead {
                path: docs_dir.clone(),
                source,
            })?;
        files.sort();

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(files.len());
        for path in files {
            let is_doc = path.extension().and_then(|e| e.to_str()) == Some(DOC_EXTENSION);
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_doc || hidden {
                continue;
            }
            let Some(key) = bulk_key(&path) else {
                continue;
            };

            if !seen.insert(key.clone()) {
                let failure = DocumentFailure::local(&key, &path, "duplicate document key");
                failure.log();
                report.docs.failed += 1;
                report.failures.push(failure);
                continue;
            }
            sources.push(DocumentSource { key, path });
        }
        Ok(sources)
    }
}
