//! Materialize remote design documents into a local `_design` tree.
//!
//! Used once, to seed a source tree from an existing database. The layout written
//! here is exactly what [`crate::design::read_design_tree`] reads back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::document::{ID_FIELD, REV_FIELD, RemoteDocument, TIMESTAMP_FIELD, design_key};
use crate::error::{Result, SyncError, SyncWarning};
use crate::fs::{AsyncFileSystem, BoxFuture};
use crate::timestamp::{LogicalTimestamp, TimestampStore};

/// Where a design document field ends up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRoute {
    /// Not written
    Drop,
    /// Written to the timestamp store instead of the tree
    Timestamp,
    /// `<field>.js`
    Script,
    /// Sub-directory
    Directory,
    /// `<field>.txt`, for strings
    Text,
    /// `<field>.json`, for every other non-object value
    Json,
}

struct RouteRule {
    field: &'static str,
    top_level_only: bool,
    route: FieldRoute,
}

const ROUTES: &[RouteRule] = &[
    RouteRule {
        field: ID_FIELD,
        top_level_only: true,
        route: FieldRoute::Drop,
    },
    RouteRule {
        field: REV_FIELD,
        top_level_only: true,
        route: FieldRoute::Drop,
    },
    RouteRule {
        field: TIMESTAMP_FIELD,
        top_level_only: true,
        route: FieldRoute::Timestamp,
    },
    RouteRule {
        field: "map",
        top_level_only: false,
        route: FieldRoute::Script,
    },
    RouteRule {
        field: "reduce",
        top_level_only: false,
        route: FieldRoute::Script,
    },
];

fn route(field: &str, depth: usize, value: &Value) -> FieldRoute {
    ROUTES
        .iter()
        .find(|rule| {
            rule.field == field
                && (depth == 0 || !rule.top_level_only)
                && (rule.route != FieldRoute::Script || value.is_string())
        })
        .map(|rule| rule.route)
        .unwrap_or(match value {
            Value::Object(_) => FieldRoute::Directory,
            Value::String(_) => FieldRoute::Text,
            _ => FieldRoute::Json,
        })
}

/// Files written by [`materialize_designs`].
#[derive(Debug, Default, Clone)]
pub struct BootstrapOutcome {
    /// Design documents materialized
    pub designs: Vec<String>,
    /// Files written, in walk order
    pub files: Vec<PathBuf>,
    /// Timestamp entries that could not be recorded
    pub warnings: Vec<SyncWarning>,
}

#[derive(Default)]
struct Materialized {
    files: Vec<PathBuf>,
    timestamp: Option<LogicalTimestamp>,
}

/// Write one directory per remote design document under `design_dir`.
///
/// Each design's `revTimestamp` (or `now`, when it carries none) is recorded in
/// the timestamp store, so the first sync after bootstrapping sees the tree as up
/// to date.
pub async fn materialize_designs(
    fs: &dyn AsyncFileSystem,
    timestamps: &TimestampStore,
    design_dir: &Path,
    existing: &HashMap<String, RemoteDocument>,
    now: &LogicalTimestamp,
) -> Result<BootstrapOutcome> {
    fs.create_dir_all(design_dir)
        .await
        .map_err(|source| SyncError::FileWrite {
            path: design_dir.to_path_buf(),
            source,
        })?;

    let mut names: Vec<&String> = existing.keys().collect();
    names.sort();

    let mut outcome = BootstrapOutcome::default();
    for name in names {
        let mut materialized = Materialized::default();
        write_object(
            fs,
            design_dir.join(name),
            &existing[name].body,
            0,
            &mut materialized,
        )
        .await?;

        let timestamp = materialized.timestamp.unwrap_or_else(|| now.clone());
        if let Err(warning) = timestamps.set(&design_key(name), &timestamp).await {
            outcome.warnings.push(warning);
        }

        log::info!(
            "[bootstrap] {} -> {} file(s)",
            design_key(name),
            materialized.files.len()
        );
        outcome.designs.push(name.clone());
        outcome.files.extend(materialized.files);
    }

    log::info!(
        "[bootstrap] Materialized {} design document(s) into {}",
        outcome.designs.len(),
        design_dir.display()
    );
    Ok(outcome)
}

fn write_object<'a: 'b, 'b>(
    fs: &'a dyn AsyncFileSystem,
    dir: PathBuf,
    object: &'a Map<String, Value>,
    depth: usize,
    out: &'b mut Materialized,
) -> BoxFuture<'b, Result<()>> {
    Box::pin(async move {
        fs.create_dir_all(&dir)
            .await
            .map_err(|source| SyncError::FileWrite {
                path: dir.clone(),
                source,
            })?;

        for (field, value) in object {
            match route(field, depth, value) {
                FieldRoute::Drop => {}
                FieldRoute::Timestamp => {
                    out.timestamp = value.as_str().map(LogicalTimestamp::new);
                }
                FieldRoute::Directory => {
                    if let Value::Object(nested) = value {
                        write_object(fs, dir.join(field), nested, depth + 1, out).await?;
                    }
                }
                FieldRoute::Script => {
                    let path = dir.join(format!("{}.js", field));
                    write(fs, &path, value.as_str().unwrap_or_default()).await?;
                    out.files.push(path);
                }
                FieldRoute::Text => {
                    let path = dir.join(format!("{}.txt", field));
                    write(fs, &path, value.as_str().unwrap_or_default()).await?;
                    out.files.push(path);
                }
                FieldRoute::Json => {
                    let path = dir.join(format!("{}.json", field));
                    write(fs, &path, &serde_json::to_string(value)?).await?;
                    out.files.push(path);
                }
            }
        }
        Ok(())
    })
}

async fn write(fs: &dyn AsyncFileSystem, path: &Path, content: &str) -> Result<()> {
    fs.write_file(path, content)
        .await
        .map_err(|source| SyncError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
}
