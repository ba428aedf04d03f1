//! Logical timestamps and their durable per-key cache.
//!
//! The timestamp cache records, for each document key, the logical timestamp at which
//! this tool last wrote that key. It is the low-water mark the reconciler uses to tell
//! "the server moved on without us" apart from "the server still holds our last push",
//! which the store's own `_rev` cannot do.
//!
//! Layout: one file per key at `<root>/<key>.txt` holding the raw timestamp string.
//! Design keys (`_design/<name>`) therefore live in a `_design/` namespace directory.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError, SyncWarning};
use crate::fs::AsyncFileSystem;

/// An ISO-8601 instant, ordered lexically.
///
/// Values produced by [`LogicalTimestamp::now`] use a fixed-width UTC format
/// (`2024-01-31T12:00:00.000Z`), so lexical order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTimestamp(String);

impl LogicalTimestamp {
    /// Wrap an existing timestamp string without validating it.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The current instant.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Format a UTC instant.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// The raw timestamp string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalTimestamp {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Durable map from document key to last-written logical timestamp.
#[derive(Clone)]
pub struct TimestampStore {
    fs: Arc<dyn AsyncFileSystem>,
    root: PathBuf,
}

impl TimestampStore {
    /// File extension of a timestamp entry
    pub const EXTENSION: &'static str = "txt";

    /// Create a store rooted at `root`.
    pub fn new(fs: Arc<dyn AsyncFileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, Self::EXTENSION))
    }

    /// Create the root directory. Failure is not fatal: a read-only cache still
    /// answers `get`.
    pub async fn ensure_root(&self) -> std::result::Result<(), SyncWarning> {
        self.fs.create_dir_all(&self.root).await.map_err(|e| {
            let warning = SyncWarning::CacheDir {
                path: self.root.clone(),
                message: e.to_string(),
            };
            log::warn!("{}", warning);
            warning
        })
    }

    /// Last timestamp written for `key`, or `None` if the key was never synchronized.
    pub async fn get(&self, key: &str) -> Result<Option<LogicalTimestamp>> {
        let path = self.path_for(key);
        match self.fs.read_to_string(&path).await {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(LogicalTimestamp::new(trimmed)))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "timestamp cache {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Record `timestamp` as the last write of `key`.
    ///
    /// Best effort: some deploys mount the cache read-only, so a failed write is
    /// handed back as a warning instead of an error.
    pub async fn set(
        &self,
        key: &str,
        timestamp: &LogicalTimestamp,
    ) -> std::result::Result<(), SyncWarning> {
        let path = self.path_for(key);

        let result = async {
            if let Some(parent) = path.parent() {
                self.fs.create_dir_all(parent).await?;
            }
            self.fs.write_file(&path, timestamp.as_str()).await
        }
        .await;

        result.map_err(|e| {
            let warning = SyncWarning::TimestampNotPersisted {
                key: key.to_string(),
                path: path.clone(),
                message: e.to_string(),
            };
            log::warn!("{}", warning);
            warning
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InMemoryFileSystem, SyncToAsyncFs, block_on_test};
    use chrono::TimeZone;

    fn store(fs: &InMemoryFileSystem) -> TimestampStore {
        TimestampStore::new(Arc::new(SyncToAsyncFs::new(fs.clone())), "src/.revTimestamps")
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            LogicalTimestamp::from_datetime(at).as_str(),
            "2024-01-31T12:00:00.000Z"
        );
    }

    #[test]
    fn test_timestamp_order_is_chronological() {
        let earlier = LogicalTimestamp::from_datetime(Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap());
        let later = LogicalTimestamp::from_datetime(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_missing_entry_is_none() {
        let fs = InMemoryFileSystem::new();
        assert_eq!(block_on_test(store(&fs).get("doc-a")).unwrap(), None);
    }

    #[test]
    fn test_set_then_get() {
        let fs = InMemoryFileSystem::new();
        let store = store(&fs);
        let ts = LogicalTimestamp::from("2024-02-01T00:00:00.000Z");

        block_on_test(store.set("doc-a", &ts)).unwrap();

        assert_eq!(block_on_test(store.get("doc-a")).unwrap(), Some(ts));
        assert_eq!(
            fs.get_content("src/.revTimestamps/doc-a.txt").as_deref(),
            Some("2024-02-01T00:00:00.000Z")
        );
    }

    #[test]
    fn test_design_keys_use_namespace_directory() {
        let fs = InMemoryFileSystem::new();
        let store = store(&fs);
        let ts = LogicalTimestamp::from("2024-02-01T00:00:00.000Z");

        block_on_test(store.set("_design/app", &ts)).unwrap();
        block_on_test(store.set("app", &LogicalTimestamp::from("1999"))).unwrap();

        assert_eq!(
            fs.get_content("src/.revTimestamps/_design/app.txt").as_deref(),
            Some("2024-02-01T00:00:00.000Z")
        );
        assert_eq!(block_on_test(store.get("_design/app")).unwrap(), Some(ts));
    }

    #[test]
    fn test_entry_whitespace_is_trimmed() {
        let fs = InMemoryFileSystem::new()
            .with_file("src/.revTimestamps/doc-a.txt", "2024-02-01T00:00:00.000Z\n");
        assert_eq!(
            block_on_test(store(&fs).get("doc-a")).unwrap(),
            Some(LogicalTimestamp::from("2024-02-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn test_read_only_cache_downgrades_to_warning() {
        let fs = InMemoryFileSystem::new();
        fs.set_read_only(true);
        let store = store(&fs);

        let warning = block_on_test(store.set("doc-a", &LogicalTimestamp::now())).unwrap_err();

        assert!(matches!(
            warning,
            SyncWarning::TimestampNotPersisted { ref key, .. } if key == "doc-a"
        ));
        assert_eq!(block_on_test(store.get("doc-a")).unwrap(), None);
    }
}
