//! In-memory filesystem, used by tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::FileSystem;

/// An in-memory filesystem implementation.
///
/// Clones share the same underlying storage. A filesystem can be switched to
/// read-only, after which every write fails with `PermissionDenied` (the way a
/// read-only deploy mount behaves).
#[derive(Clone, Default)]
pub struct InMemoryFileSystem {
    /// Files stored as path -> content
    files: Arc<RwLock<HashMap<PathBuf, String>>>,
    /// Directories that exist (implicitly created when files are added)
    directories: Arc<RwLock<HashSet<PathBuf>>>,
    read_only: Arc<AtomicBool>,
}

impl InMemoryFileSystem {
    /// Create a new empty in-memory filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file (builder pattern). Parent directories are created implicitly.
    pub fn with_file(self, path: impl AsRef<Path>, content: &str) -> Self {
        let normalized = Self::normalize_path(path.as_ref());
        if let Some(parent) = normalized.parent() {
            self.add_dirs(parent);
        }
        self.files
            .write()
            .unwrap()
            .insert(normalized, content.to_string());
        self
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Get the content of a file (for test assertions).
    pub fn get_content(&self, path: impl AsRef<Path>) -> Option<String> {
        let normalized = Self::normalize_path(path.as_ref());
        self.files.read().unwrap().get(&normalized).cloned()
    }

    fn check_writable(&self, path: &Path) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("Read-only filesystem: {:?}", path),
            ));
        }
        Ok(())
    }

    fn add_dirs(&self, path: &Path) {
        let mut dirs = self.directories.write().unwrap();
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            dirs.insert(dir.to_path_buf());
            current = dir.parent();
        }
    }

    /// Helper to normalize paths (remove . and .. components where possible)
    fn normalize_path(path: &Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    components.pop();
                }
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let normalized = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&normalized)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("File not found: {:?}", path)))
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        self.check_writable(path)?;
        let normalized = Self::normalize_path(path);

        if let Some(parent) = normalized.parent() {
            self.add_dirs(parent);
        }

        let mut files = self.files.write().unwrap();
        files.insert(normalized, content.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.check_writable(path)?;
        self.add_dirs(&Self::normalize_path(path));
        Ok(())
    }

    fn is_dir(&self, path: &Path) -> bool {
        let normalized = Self::normalize_path(path);
        self.directories.read().unwrap().contains(&normalized)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let normalized = Self::normalize_path(dir);
        let files = self.files.read().unwrap();
        let dirs = self.directories.read().unwrap();

        let mut result: Vec<PathBuf> = files
            .keys()
            .chain(dirs.iter())
            .filter(|path| path.parent() == Some(normalized.as_path()))
            .cloned()
            .collect();
        result.sort();
        Ok(result)
    }
}
