//! Filesystem abstraction module.
//!
//! This module provides the `FileSystem` trait for abstracting filesystem operations,
//! so the synchronization engine can run against a real source tree or an in-memory
//! one in tests.
//!
//! For async operations, see the `AsyncFileSystem` trait and `SyncToAsyncFs` adapter.
//!
//! ```ignore
//! use couchsync_core::fs::{InMemoryFileSystem, SyncToAsyncFs};
//!
//! let fs = SyncToAsyncFs::new(InMemoryFileSystem::new().with_file("docs/a.json", "{}"));
//! ```

mod async_fs;
mod memory;
mod native;

use std::io::Result;
use std::path::{Path, PathBuf};

pub use async_fs::{AsyncFileSystem, BoxFuture, SyncToAsyncFs};

#[cfg(test)]
pub(crate) use async_fs::block_on_test;
pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;

/// Abstraction over filesystem operations
pub trait FileSystem {
    /// Reads the file content
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Creates or overwrites a file
    fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Creates a directory and all parent directories
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Checks if a path is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// List all entries (files and directories) directly inside a directory
    fn list_files(&self, _dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(vec![])
    }
}

// Blanket implementation for references to FileSystem
impl<T: FileSystem> FileSystem for &T {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        (*self).read_to_string(path)
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        (*self).write_file(path, content)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        (*self).create_dir_all(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (*self).is_dir(path)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        (*self).list_files(dir)
    }
}
