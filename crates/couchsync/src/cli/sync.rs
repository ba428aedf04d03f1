//! `sync` and `init-design` command handlers.

use std::sync::Arc;

use couchsync_core::fs::{AsyncFileSystem, RealFileSystem, SyncToAsyncFs};
use couchsync_core::store::CouchConnector;
use couchsync_core::{StageCounts, SyncConfig, SyncDriver, SyncReport};

use crate::cli::progress::ProgressGuard;
use crate::cli::report_error;

/// The run failed (or could not start)
pub const EXIT_FAILURE: i32 = 1;

/// The run finished but left conflicts to resolve by hand
pub const EXIT_CONFLICTS: i32 = 2;

/// Run the driver against the configured database and print what happened.
pub fn handle_sync(config: SyncConfig, json: bool) -> i32 {
    let connector = match CouchConnector::from_config(&config) {
        Ok(connector) => connector,
        Err(e) => return report_error(e),
    };
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Failed to start the async runtime: {}", e);
            return EXIT_FAILURE;
        }
    };

    log::info!("Synchronizing {} with {}", config.source_dir.display(), config.url);
    let fs: Arc<dyn AsyncFileSystem> = Arc::new(SyncToAsyncFs::new(RealFileSystem));
    let mut driver = SyncDriver::new(config, Arc::new(connector), fs);
    let cancel = driver.cancel_token();

    let report = {
        let _progress = ProgressGuard::start();
        runtime.block_on(async {
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        eprintln!("\nCancelling sync...");
                        cancel.cancel();
                    }
                    Err(e) => eprintln!("Failed to listen for Ctrl+C: {}", e),
                }
            });
            driver.run().await
        })
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("✗ Could not serialize the report: {}", e),
        }
    } else {
        print_report(&report);
    }
    exit_code(&report)
}

fn exit_code(report: &SyncReport) -> i32 {
    if !report.is_success() {
        EXIT_FAILURE
    } else if report.has_conflicts() {
        EXIT_CONFLICTS
    } else {
        0
    }
}

fn print_counts(label: &str, counts: &StageCounts) {
    println!(
        "{}: {} updated, {} unchanged, {} conflict(s), {} failed",
        label, counts.updated, counts.skipped, counts.conflicts, counts.failed
    );
}

fn print_report(report: &SyncReport) {
    if !report.bootstrapped.is_empty() {
        println!("Initialized design documents: {}", report.bootstrapped.join(", "));
    }
    print_counts("Design documents", &report.design);
    print_counts("Documents", &report.docs);
    for batch in &report.batches {
        match &batch.error {
            Some(e) => println!("  batch {}: ✗ {}", batch.index + 1, e.message),
            None => println!(
                "  batch {}: {} of {} written",
                batch.index + 1,
                batch.written,
                batch.size
            ),
        }
    }
    if !report.indexes_rebuilt.is_empty() {
        println!("Indexes rebuilt: {}", report.indexes_rebuilt.join(", "));
    }

    for conflict in &report.conflicts {
        eprintln!("⚠ {}", conflict);
    }
    for failure in &report.failures {
        match &failure.path {
            Some(path) => eprintln!("✗ {} ({}): {}", failure.key, path.display(), failure.message),
            None => eprintln!("✗ {}: {}", failure.key, failure.message),
        }
    }
    for warning in &report.warnings {
        eprintln!("! {}", warning);
    }

    if let Some(error) = &report.error {
        let stage = report
            .failed_in
            .map(|state| state.to_string())
            .unwrap_or_default();
        eprintln!("✗ Sync failed during '{}': {}", stage, error.message);
    } else if report.has_conflicts() {
        eprintln!(
            "⚠ {} conflict(s) left unresolved; the remote copies were not overwritten",
            report.conflicts.len()
        );
    } else if report.is_success() {
        println!(
            "✓ Done in {:.1}s",
            (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
        );
    }

    match &report.work_dir {
        Some(dir) => println!("Work directory: {}", dir.display()),
        None => println!("Work directory: (not created)"),
    }
}
