//! Command dispatch for the `couchsync` binary.

/// Clap argument definitions
mod args;

/// Config command handlers
mod config;

/// Terminal progress indicator
mod progress;

/// `sync` and `init-design` commands
mod sync;

use std::path::{Path, PathBuf};

use clap::Parser;
use couchsync_core::fs::RealFileSystem;
use couchsync_core::{Result, SyncConfig, SyncError};

pub use args::Cli;
use args::{Commands, ConnectionArgs};

/// Environment variable consulted when a username is set without a password
const PASSWORD_ENV: &str = "COUCHSYNC_PASSWORD";

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .format_timestamp(None)
        .init();

    let config_path = cli.config.clone();
    let code = match cli.command {
        Commands::Sync {
            connection,
            init_design,
            no_docs,
            no_rebuild_indexes,
            batch_size,
            json,
        } => match resolve_config(config_path.as_deref(), connection) {
            Ok(mut config) => {
                config.init_design |= init_design;
                config.manage_docs &= !no_docs;
                config.rebuild_indexes &= !no_rebuild_indexes;
                if let Some(size) = batch_size {
                    config.batch_size = size;
                }
                validated(config).map_or_else(report_error, |c| sync::handle_sync(c, json))
            }
            Err(e) => report_error(e),
        },

        Commands::InitDesign { connection, json } => {
            match resolve_config(config_path.as_deref(), connection) {
                Ok(mut config) => {
                    config.init_design = true;
                    config.manage_docs = false;
                    config.rebuild_indexes = false;
                    validated(config).map_or_else(report_error, |c| sync::handle_sync(c, json))
                }
                Err(e) => report_error(e),
            }
        }

        Commands::Config { command } => config::handle_config_command(command, config_path),
    };

    if code != 0 {
        std::process::exit(code);
    }
}

fn report_error(e: SyncError) -> i32 {
    eprintln!("✗ {}", e);
    sync::EXIT_FAILURE
}

fn validated(config: SyncConfig) -> Result<SyncConfig> {
    config.validate()?;
    Ok(config)
}

/// The config file in effect: `--config`, or the default location.
fn config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(SyncConfig::default_path)
}

/// Load the config file (an explicit `--config` must exist, the default location
/// may not) and apply command-line overrides on top.
fn resolve_config(explicit: Option<&Path>, connection: ConnectionArgs) -> Result<SyncConfig> {
    let from_file = match config_file(explicit) {
        Some(path) if explicit.is_some() || path.exists() => {
            log::debug!("Loading config from {}", path.display());
            Some(SyncConfig::load_from_sync(RealFileSystem, &path)?)
        }
        _ => None,
    };

    let mut config = match (from_file, connection.url) {
        (Some(mut config), url) => {
            if let Some(url) = url {
                config.url = url;
            }
            config
        }
        (None, Some(url)) => SyncConfig::new(url, "."),
        (None, None) => {
            return Err(SyncError::InvalidConfig(
                "no database URL; pass --url or run `couchsync config init`".to_string(),
            ));
        }
    };

    if let Some(source) = connection.source {
        config.source_dir = source;
    }
    if connection.username.is_some() {
        config.username = connection.username;
    }
    if connection.password.is_some() {
        config.password = connection.password;
    }
    if config.username.is_some() && config.password.is_none() {
        config.password = std::env::var(PASSWORD_ENV).ok();
    }

    Ok(config)
}
