//! Local and remote document shapes.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::timestamp::LogicalTimestamp;

/// Key prefix shared by every design document
pub const DESIGN_PREFIX: &str = "_design/";

/// Document id field
pub const ID_FIELD: &str = "_id";

/// Store-assigned revision token, required to overwrite an existing document
pub const REV_FIELD: &str = "_rev";

/// Logical timestamp stamped onto every document this tool writes
pub const TIMESTAMP_FIELD: &str = "revTimestamp";

/// Extension of a bulk document file
pub const DOC_EXTENSION: &str = "json";

/// Document key of the design document called `name`.
pub fn design_key(name: &str) -> String {
    format!("{}{}", DESIGN_PREFIX, name)
}

/// Document key of a bulk document file: its filename without `.json`.
pub fn bulk_key(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(DOC_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(name);
    Some(stem.to_string())
}

/// Remove the fields that never take part in content comparison.
pub fn strip_reserved(body: &mut Map<String, Value>) {
    body.remove(ID_FIELD);
    body.remove(REV_FIELD);
    body.remove(TIMESTAMP_FIELD);
}

/// A document as authored in the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    /// Document key
    pub key: String,
    /// Document body as read from disk
    pub body: Map<String, Value>,
}

impl LocalDocument {
    /// Create a local document from an already-parsed body.
    pub fn new(key: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }

    /// Parse a local document; anything but a JSON object is rejected.
    pub fn from_value(key: impl Into<String>, value: Value, path: &Path) -> Result<Self> {
        match value {
            Value::Object(body) => Ok(Self::new(key, body)),
            other => Err(SyncError::InvalidDocument {
                path: path.to_path_buf(),
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
        }
    }

    /// Read and parse a bulk document file.
    pub fn parse(key: impl Into<String>, content: &str, path: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(content).map_err(|e| SyncError::InvalidDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_value(key, value, path)
    }

    /// Body with reserved fields removed.
    pub fn stripped(&self) -> Map<String, Value> {
        let mut body = self.body.clone();
        strip_reserved(&mut body);
        body
    }
}

/// A document as currently held by the store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteDocument {
    /// Full remote body, including reserved fields
    pub body: Map<String, Value>,
    /// Store revision token
    pub revision: Option<String>,
    /// Logical timestamp previously stamped by this tool
    pub timestamp: Option<LogicalTimestamp>,
    /// The store answered a keyed fetch with `not_found` (or a deleted row)
    pub not_found: bool,
}

impl RemoteDocument {
    /// Build from a document body returned by the store.
    pub fn from_body(body: Map<String, Value>) -> Self {
        let revision = body
            .get(REV_FIELD)
            .and_then(Value::as_str)
            .map(String::from);
        let timestamp = body
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .map(LogicalTimestamp::new);
        let not_found = body.get("error").and_then(Value::as_str) == Some("not_found");

        Self {
            body,
            revision,
            timestamp,
            not_found,
        }
    }

    /// Build from any JSON value; non-objects are treated as not found.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(body) => Self::from_body(body),
            _ => Self::not_found(),
        }
    }

    /// Marker for a key the store does not hold.
    pub fn not_found() -> Self {
        Self {
            not_found: true,
            ..Self::default()
        }
    }

    /// Whether the store actually holds this document.
    pub fn exists(&self) -> bool {
        !self.not_found
    }

    /// Body with reserved fields removed.
    pub fn stripped(&self) -> Map<String, Value> {
        let mut body = self.body.clone();
        strip_reserved(&mut body);
        body
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
