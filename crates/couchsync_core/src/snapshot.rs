//! Remote snapshot reader.

use std::collections::HashMap;

use crate::document::RemoteDocument;
use crate::error::Result;
use crate::store::DocumentStore;

/// Read every remote document whose id starts with `prefix` in one range query.
///
/// The result is keyed by the part of the id after the first `/`, so `_design/app`
/// lands under `app`. Ids without a `/` are keyed by the whole id.
pub async fn fetch_by_prefix(
    store: &dyn DocumentStore,
    prefix: &str,
) -> Result<HashMap<String, RemoteDocument>> {
    // '0' sorts right after '/', which bounds the `<prefix>/...` range.
    let end = format!("{}0", prefix);
    let rows = store.all_docs_in_range(prefix, &end).await?;

    log::debug!(
        "[snapshot] {} document(s) under '{}' in {}",
        rows.len(),
        prefix,
        store.name()
    );

    Ok(rows
        .into_iter()
        .map(|row| {
            let key = match row.id.split_once('/') {
                Some((_, rest)) => rest.to_string(),
                None => row.id.clone(),
            };
            (key, RemoteDocument::from_value(row.doc))
        })
        .collect())
}
