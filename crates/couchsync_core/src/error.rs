use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for couchsync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Store errors
    #[error("Could not connect to '{url}': {message}")]
    Connection { url: String, message: String },

    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Bulk update failed: {0}")]
    BulkUpdate(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid store URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // Document errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid document '{path}': {reason}")]
    InvalidDocument { path: PathBuf, reason: String },

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Synchronization cancelled")]
    Cancelled,
}

/// Result type alias for couchsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Convert to a serializable representation for reports
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A non-fatal problem. The run continues, but callers (and tests) can see it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    /// The timestamp file for a key could not be written (read-only deploys hit this).
    TimestampNotPersisted {
        key: String,
        path: PathBuf,
        message: String,
    },

    /// A staging payload could not be removed after submission.
    StagingCleanup { path: PathBuf, message: String },

    /// The timestamp cache directory could not be created; reads still work.
    CacheDir { path: PathBuf, message: String },

    /// A scratch directory could not be prepared.
    TempDir { message: String },
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncWarning::TimestampNotPersisted { key, path, message } => write!(
                f,
                "Could not update timestamp for '{}' at {}: {}",
                key,
                path.display(),
                message
            ),
            SyncWarning::StagingCleanup { path, message } => {
                write!(f, "Could not remove {}: {}", path.display(), message)
            }
            SyncWarning::CacheDir { path, message } => write!(
                f,
                "Timestamp cache {} is not writable: {}",
                path.display(),
                message
            ),
            SyncWarning::TempDir { message } => write!(f, "Could not create temp dir: {}", message),
        }
    }
}

/// A single document that could not be read, staged or written. Siblings are
/// unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    /// Document key
    pub key: String,
    /// Source file, when the failure happened on the local side
    pub path: Option<PathBuf>,
    /// What went wrong
    pub message: String,
}

impl DocumentFailure {
    /// Failure with a local source file.
    pub fn local(key: impl Into<String>, path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            path: Some(path.into()),
            message: message.to_string(),
        }
    }

    /// Failure reported by the store.
    pub fn remote(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            key: key.into(),
            path: None,
            message: message.to_string(),
        }
    }

    /// Log at error level.
    pub fn log(&self) {
        match &self.path {
            Some(path) => log::error!("{} ({}): {}", self.key, path.display(), self.message),
            None => log::error!("{}: {}", self.key, self.message),
        }
    }
}

/// A serializable representation of SyncError for reports
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::Connection { .. } => "Connection",
            SyncError::StoreUnavailable(_) => "StoreUnavailable",
            SyncError::BulkUpdate(_) => "BulkUpdate",
            SyncError::Http(_) => "Http",
            SyncError::InvalidUrl { .. } => "InvalidUrl",
            SyncError::Io(_) => "Io",
            SyncError::FileRead { .. } => "FileRead",
            SyncError::FileWrite { .. } => "FileWrite",
            SyncError::Json(_) => "Json",
            SyncError::InvalidDocument { .. } => "InvalidDocument",
            SyncError::ConfigParse(_) => "ConfigParse",
            SyncError::ConfigSerialize(_) => "ConfigSerialize",
            SyncError::InvalidConfig(_) => "InvalidConfig",
            SyncError::Cancelled => "Cancelled",
        }
        .to_string();

        let path = match err {
            SyncError::FileRead { path, .. } => Some(path.clone()),
            SyncError::FileWrite { path, .. } => Some(path.clone()),
            SyncError::InvalidDocument { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}
