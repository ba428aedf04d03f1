//! Command-line argument structures and enums

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "couchsync")]
#[command(version)]
#[command(
    about = "Push a local tree of design and bulk documents to CouchDB",
    long_about = None
)]
pub struct Cli {
    /// Config file (default: ~/.config/couchsync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`; `RUST_LOG` still wins.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize design documents and the docs/ tree
    Sync {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Materialize the remote design documents into _design/ first
        #[arg(long)]
        init_design: bool,

        /// Leave the docs/ tree alone
        #[arg(long)]
        no_docs: bool,

        /// Skip querying views after the sync
        #[arg(long)]
        no_rebuild_indexes: bool,

        /// Documents per bulk request
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Print the run report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Write the remote design documents into _design/ and record their timestamps
    InitDesign {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Print the run report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show or create the config file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Where to sync from and to. Each flag overrides the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct ConnectionArgs {
    /// Source tree holding _design/ and docs/
    pub source: Option<PathBuf>,

    /// Database URL (e.g. http://localhost:5984/app)
    #[arg(short, long)]
    pub url: Option<String>,

    /// User for cookie authentication
    #[arg(long)]
    pub username: Option<String>,

    /// Password (falls back to COUCHSYNC_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the resolved configuration
    Show,

    /// Write a new config file
    Init {
        /// Database URL
        #[arg(short, long)]
        url: String,

        /// Source tree (default: current directory)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// User for cookie authentication
        #[arg(long)]
        username: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_flags() {
        let cli = Cli::parse_from([
            "couchsync",
            "sync",
            "couch",
            "--url",
            "http://localhost:5984/app",
            "--no-docs",
            "-b",
            "100",
            "-vv",
        ]);

        assert_eq!(cli.log_filter(), "trace");
        let Commands::Sync {
            connection,
            no_docs,
            batch_size,
            init_design,
            ..
        } = cli.command
        else {
            panic!("expected sync");
        };
        assert_eq!(connection.source, Some(PathBuf::from("couch")));
        assert_eq!(connection.url.as_deref(), Some("http://localhost:5984/app"));
        assert!(no_docs);
        assert!(!init_design);
        assert_eq!(batch_size, Some(100));
    }

    #[test]
    fn test_quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["couchsync", "-q", "-v", "config"]).is_err());
        let cli = Cli::try_parse_from(["couchsync", "-q", "config", "show"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
    }
}
