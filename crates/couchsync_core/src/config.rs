//! Configuration for a synchronization run.
//!
//! [`SyncConfig`] holds the store connection settings and the switches that decide
//! which stages run. It is persisted as TOML (typically at
//! `~/.config/couchsync/config.toml` on Unix systems); command-line flags override
//! whatever the file says.
//!
//! # Example
//!
//! ```ignore
//! use couchsync_core::config::SyncConfig;
//!
//! let mut config = SyncConfig::new("http://localhost:5984/app", "./couch");
//! config.batch_size = 1000;
//! config.validate()?;
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::error::{Result, SyncError};
use crate::fs::{AsyncFileSystem, FileSystem, SyncToAsyncFs};

/// Name of the timestamp cache directory inside the source tree
pub const TIMESTAMP_DIR_NAME: &str = ".revTimestamps";

/// Name of the design document directory inside the source tree
pub const DESIGN_DIR_NAME: &str = "_design";

/// Name of the bulk document directory inside the source tree
pub const DOCS_DIR_NAME: &str = "docs";

/// Settings for one synchronization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Database URL (e.g. `http://localhost:5984/app`)
    pub url: String,

    /// User to authenticate as; enables cookie session auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password, required when `username` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Source tree holding `_design/` and `docs/`
    pub source_dir: PathBuf,

    /// Materialize the remote design documents into `_design/` before syncing
    #[serde(default)]
    pub init_design: bool,

    /// Synchronize the `docs/` tree
    #[serde(default = "default_true")]
    pub manage_docs: bool,

    /// Query each design's first view after syncing
    #[serde(default = "default_true")]
    pub rebuild_indexes: bool,

    /// Documents per bulk batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timestamp cache location (defaults to `<source_dir>/.revTimestamps`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_dir: Option<PathBuf>,

    /// Where the run's work directory is created (defaults to the system temp dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl SyncConfig {
    /// Create a config with defaults for everything but the URL and source tree.
    pub fn new(url: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            source_dir: source_dir.into(),
            init_design: false,
            manage_docs: true,
            rebuild_indexes: true,
            batch_size: DEFAULT_BATCH_SIZE,
            timestamp_dir: None,
            temp_dir: None,
        }
    }

    /// Resolved timestamp cache directory.
    pub fn timestamp_dir(&self) -> PathBuf {
        self.timestamp_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join(TIMESTAMP_DIR_NAME))
    }

    /// Resolved parent of the run's work directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// `<source_dir>/_design`
    pub fn design_dir(&self) -> PathBuf {
        self.source_dir.join(DESIGN_DIR_NAME)
    }

    /// `<source_dir>/docs`
    pub fn docs_dir(&self) -> PathBuf {
        self.source_dir.join(DOCS_DIR_NAME)
    }

    /// Check the settings that would otherwise fail halfway through a run.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.url).map_err(|source| SyncError::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;

        if self.username.is_some() && self.password.is_none() {
            return Err(SyncError::InvalidConfig(
                "a password is required when a username is set".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Load config from a specific path using an AsyncFileSystem.
    pub async fn load_from<FS: AsyncFileSystem + ?Sized>(fs: &FS, path: &Path) -> Result<Self> {
        let contents = fs
            .read_to_string(path)
            .await
            .map_err(|e| SyncError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })?;

        let config: SyncConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a specific path using an AsyncFileSystem.
    pub async fn save_to<FS: AsyncFileSystem + ?Sized>(&self, fs: &FS, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs.create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs.write_file(path, &contents)
            .await
            .map_err(|e| SyncError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }

    /// Sync wrapper for [`SyncConfig::load_from`].
    pub fn load_from_sync<FS: FileSystem + Send + Sync>(fs: FS, path: &Path) -> Result<Self> {
        futures_lite::future::block_on(Self::load_from(&SyncToAsyncFs::new(fs), path))
    }

    /// Sync wrapper for [`SyncConfig::save_to`].
    pub fn save_to_sync<FS: FileSystem + Send + Sync>(&self, fs: FS, path: &Path) -> Result<()> {
        futures_lite::future::block_on(self.save_to(&SyncToAsyncFs::new(fs), path))
    }

    /// Default config file path (`~/.config/couchsync/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("couchsync").join("config.toml"))
    }
}
