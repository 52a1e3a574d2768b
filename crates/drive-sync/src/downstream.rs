//! Downstream read path: ordered pagination over `docs/` by server-side
//! modification time, with a checkpoint that survives millisecond ties.

use chrono::{DateTime, Utc};
use drive_client::{ListQuery, ObjectStore, OrderBy};
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::layout::DriveStructure;
use crate::Result;

/// Fixed fan-out for downloading document content.
pub const DOWNLOAD_CONCURRENCY: usize = 5;

/// Extra rows fetched beyond the requested batch. Listing is eventually
/// consistent within a millisecond-equal cluster; overfetching keeps a
/// newly written sibling from being skipped past.
pub const OVERFETCH: usize = 6;

/// Pagination cursor. Stores file *names* at the boundary time, not ids:
/// listing returns names consistently while ids change across
/// re-creations.
///
/// Every `(modified_time, name)` pair recorded here has been delivered to
/// the caller at least once.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub modified_time: DateTime<Utc>,
    #[serde(default)]
    pub doc_ids_with_same_modified_time: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PullBatch {
    pub documents: Vec<Value>,
    /// The advanced cursor, or the caller's own when nothing new was
    /// found.
    pub checkpoint: Option<Checkpoint>,
}

/// List, filter, truncate, download: one page of changed documents at or
/// after the checkpoint. Repeated calls with the returned checkpoint
/// drain to an empty batch once every observable write is delivered.
pub async fn fetch_changes(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    checkpoint: Option<&Checkpoint>,
    batch_size: usize,
) -> Result<PullBatch> {
    let page_size = u32::try_from(batch_size.saturating_add(OVERFETCH))
        .unwrap_or(u32::MAX)
        .min(1000);
    let mut query = ListQuery::children_of(&layout.docs_folder_id)
        .not_trashed()
        .order_by(OrderBy::ModifiedThenName)
        .page_size(page_size);
    if let Some(checkpoint) = checkpoint {
        query = query.modified_since(checkpoint.modified_time);
    }
    let mut listed = store.list_folder(query).await?;

    // Files whose (modifiedTime, name) sits in the checkpoint's tie list
    // were already delivered on an earlier page.
    if let Some(checkpoint) = checkpoint {
        listed.retain(|meta| {
            meta.modified_time != checkpoint.modified_time
                || !checkpoint
                    .doc_ids_with_same_modified_time
                    .contains(&meta.name)
        });
    }
    listed.truncate(batch_size);

    let Some(last) = listed.last() else {
        return Ok(PullBatch {
            documents: Vec::new(),
            checkpoint: checkpoint.cloned(),
        });
    };
    let boundary = last.modified_time;

    let mut tie_names: Vec<String> = listed
        .iter()
        .filter(|meta| meta.modified_time == boundary)
        .map(|meta| meta.name.clone())
        .collect();
    if let Some(checkpoint) = checkpoint {
        if boundary == checkpoint.modified_time {
            // This page stayed inside the old tie cluster; keep carrying
            // the names already delivered so later pages skip them too.
            for name in &checkpoint.doc_ids_with_same_modified_time {
                if !tie_names.contains(name) {
                    tie_names.push(name.clone());
                }
            }
        }
    }

    let documents: Vec<Value> = stream::iter(listed.iter().map(|meta| meta.id.clone()))
        .map(|id| async move { store.download_json(&id).await })
        .buffered(DOWNLOAD_CONCURRENCY)
        .try_collect()
        .await?;

    tracing::trace!(
        documents = documents.len(),
        boundary = %boundary,
        "fetched downstream page"
    );
    Ok(PullBatch {
        documents,
        checkpoint: Some(Checkpoint {
            modified_time: boundary,
            doc_ids_with_same_modified_time: tie_names,
        }),
    })
}
