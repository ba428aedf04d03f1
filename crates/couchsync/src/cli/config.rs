//! Config command handlers

use std::path::{Path, PathBuf};

use couchsync_core::SyncConfig;
use couchsync_core::fs::RealFileSystem;

use crate::cli::args::ConfigCommands;
use crate::cli::sync::EXIT_FAILURE;
use crate::cli::{config_file, report_error};

pub fn handle_config_command(command: Option<ConfigCommands>, explicit: Option<PathBuf>) -> i32 {
    let Some(path) = config_file(explicit.as_deref()) else {
        eprintln!("✗ No config directory on this platform; pass --config");
        return EXIT_FAILURE;
    };

    match command {
        None | Some(ConfigCommands::Show) => show_config(&path),
        Some(ConfigCommands::Init {
            url,
            source,
            username,
            force,
        }) => {
            if path.exists() && !force {
                eprintln!(
                    "✗ {} already exists (use --force to overwrite)",
                    path.display()
                );
                return EXIT_FAILURE;
            }

            let mut config = SyncConfig::new(url, source.unwrap_or_else(|| PathBuf::from(".")));
            config.username = username;
            match config.save_to_sync(RealFileSystem, &path) {
                Ok(()) => {
                    println!("✓ Wrote {}", path.display());
                    if config.username.is_some() {
                        println!("  Set COUCHSYNC_PASSWORD or pass --password when syncing.");
                    }
                    0
                }
                Err(e) => report_error(e),
            }
        }
    }
}

fn show_config(path: &Path) -> i32 {
    if !path.exists() {
        eprintln!(
            "No configuration at {}. Run 'couchsync config init --url <URL>' first.",
            path.display()
        );
        return EXIT_FAILURE;
    }

    let config = match SyncConfig::load_from_sync(RealFileSystem, path) {
        Ok(config) => config,
        Err(e) => return report_error(e),
    };

    println!("couchsync Configuration");
    println!("=======================");
    println!("Config file: {}", path.display());
    println!("Database URL: {}", config.url);
    if let Some(username) = &config.username {
        let password = if config.password.is_some() { "set" } else { "not set" };
        println!("Username: {} (password {})", username, password);
    }
    println!("Source tree: {}", config.source_dir.display());
    println!("Timestamp cache: {}", config.timestamp_dir().display());
    println!("Work directory parent: {}", config.temp_dir().display());
    println!("Batch size: {}", config.batch_size);
    println!("Initialize design docs: {}", config.init_design);
    println!("Manage docs/: {}", config.manage_docs);
    println!("Rebuild indexes: {}", config.rebuild_indexes);
    0
}
