//! Batched bulk-document synchronization.
//!
//! Bulk documents are processed in fixed-size batches, strictly one after another:
//! [`plan`] splits the work, [`BatchStager`] reconciles a batch and writes the
//! accepted documents into a staging payload on disk, and [`submit`] streams that
//! payload to the store's bulk endpoint and removes it.

mod stage;
mod submit;

use std::path::PathBuf;

pub use stage::{BatchStager, StagedBatch};
pub use submit::{SubmitOutcome, submit};

/// Default number of documents per batch
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// A contiguous slice of the work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// Zero-based position of this batch
    pub index: usize,
    /// Items, in input order
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    /// Number of items in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A local bulk document waiting to be synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSource {
    /// Document key (filename stem)
    pub key: String,
    /// Path of the `.json` file
    pub path: PathBuf,
}

/// Split `items` into order-preserving batches of at most `batch_size` items.
///
/// A `batch_size` of zero is treated as one.
pub fn plan<T>(items: Vec<T>, batch_size: usize) -> Vec<Batch<T>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(batch_count(items.len(), size));
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let chunk: Vec<T> = items.by_ref().take(size).collect();
        batches.push(Batch {
            index: batches.len(),
            items: chunk,
        });
    }
    batches
}

/// Number of batches needed for `total` items.
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    total.div_ceil(batch_size.max(1))
}
