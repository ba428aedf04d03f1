//! Per-document reconciliation.
//!
//! Decides whether a local document should overwrite its remote counterpart. The
//! authority for "which side is newer" is the cached logical timestamp, not the
//! store's `_rev`: a `_rev` changes on every write, including our own, so it cannot
//! tell a concurrent writer apart from our last successful push.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::document::{ID_FIELD, LocalDocument, REV_FIELD, RemoteDocument, TIMESTAMP_FIELD};
use crate::timestamp::LogicalTimestamp;

/// Outcome of reconciling one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Local and remote content are identical; nothing to write.
    Skip,
    /// Write the local document.
    Update {
        /// Timestamp to stamp onto the written document (and cache on success)
        stamped: LogicalTimestamp,
        /// Remote revision to carry, required by the store to overwrite
        revision: Option<String>,
    },
    /// The remote side was written by someone else after our last push.
    Conflict {
        /// Effective local timestamp
        local: LogicalTimestamp,
        /// Timestamp found on the remote document
        remote: LogicalTimestamp,
    },
}

impl Decision {
    /// Whether this decision writes the document.
    pub fn is_update(&self) -> bool {
        matches!(self, Decision::Update { .. })
    }

    /// Build the document to write for an `Update`: the local body with `_id`,
    /// `revTimestamp` and the carried `_rev` attached. `None` for any other decision.
    pub fn apply(&self, local: &LocalDocument) -> Option<Map<String, Value>> {
        let Decision::Update { stamped, revision } = self else {
            return None;
        };

        let mut body = local.body.clone();
        body.insert(ID_FIELD.to_string(), Value::String(local.key.clone()));
        body.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(stamped.as_str().to_string()),
        );
        match revision {
            Some(rev) => {
                body.insert(REV_FIELD.to_string(), Value::String(rev.clone()));
            }
            None => {
                body.remove(REV_FIELD);
            }
        }
        Some(body)
    }
}

/// Decide what to do with one document.
///
/// - identical content (ignoring `_id`, `_rev` and `revTimestamp`) is skipped;
/// - otherwise the effective local timestamp is the cached one, or `now` when the
///   key was never pushed from here;
/// - the write goes ahead when the remote is missing, unstamped, or not newer than
///   the effective local timestamp, and is a conflict otherwise.
pub fn decide(
    local: &LocalDocument,
    remote: Option<&RemoteDocument>,
    stored: Option<&LogicalTimestamp>,
    now: &LogicalTimestamp,
) -> Decision {
    let remote = remote.filter(|r| r.exists());

    if let Some(remote) = remote
        && local.stripped() == remote.stripped()
    {
        return Decision::Skip;
    }

    let effective = stored.unwrap_or(now);

    match remote.and_then(|r| r.timestamp.as_ref()) {
        Some(remote_ts) if effective < remote_ts => Decision::Conflict {
            local: effective.clone(),
            remote: remote_ts.clone(),
        },
        _ => Decision::Update {
            stamped: now.clone(),
            revision: remote.and_then(|r| r.revision.clone()),
        },
    }
}

/// A conflict, reported with enough detail to resolve it by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    /// Document key
    pub key: String,
    /// Effective local timestamp
    pub local: LogicalTimestamp,
    /// Remote timestamp
    pub remote: LogicalTimestamp,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
}

impl ConflictReport {
    /// Build a report from a `Conflict` decision. `None` for other decisions.
    pub fn from_decision(key: &str, decision: &Decision) -> Option<Self> {
        match decision {
            Decision::Conflict { local, remote } => Some(Self {
                key: key.to_string(),
                local: local.clone(),
                remote: remote.clone(),
                detected_at: Utc::now(),
            }),
            _ => None,
        }
    }

    /// Log the conflict. It stays unresolved (and is logged again) on every run
    /// until the remote or local side is fixed by hand.
    pub fn log(&self) {
        log::error!("{}", self);
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}._rev conflict: local is {}, server is {}",
            self.detected_at.to_rfc3339(),
            self.key,
            self.local,
            self.remote
        )
    }
}
