//! Upstream write path: conflict detection, WAL staging, WAL drain.
//!
//! A push batch is first checked against the current master state of each
//! document, then the non-conflicting rows are staged into the single WAL
//! file, and finally the WAL is applied to the per-document files and
//! blanked. A crash anywhere in between leaves the WAL staged; the next
//! transaction holder replays it, and replay is idempotent because rows
//! are re-classified against the then-current state.

use std::collections::BTreeMap;

use drive_client::{ListQuery, ObjectStore};
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::layout::DriveStructure;
use crate::{docs, Error, Result};

/// Fixed fan-out for applying rows to document files.
pub const WRITE_CONCURRENCY: usize = 5;

/// One upstream write. `assumed_master_state` is the state the writing
/// peer believes the master holds; its absence asserts the document does
/// not exist on the master yet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRow {
    pub new_document_state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumed_master_state: Option<Value>,
}

/// On-disk WAL shape. Empty and drained states have no `rows` field.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct WalFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<WriteRow>>,
}

async fn read_staged(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
) -> Result<Option<Vec<WriteRow>>> {
    let content = store.download_json(&layout.wal_file_id).await?;
    if content.is_null() {
        return Ok(None);
    }
    let wal: WalFile = serde_json::from_value(content).map_err(drive_client::Error::Json)?;
    Ok(wal.rows.filter(|rows| !rows.is_empty()))
}

/// Detect conflicts and stage the surviving rows. Returns the current
/// master state of every conflicting row (Null when the conflict is a
/// concurrent removal), in batch order; callers hand these to the host's
/// conflict resolver and retry.
///
/// Must run inside the transaction, after the defensive drain: staging
/// over a non-empty WAL is a programming error and fails with
/// [`Error::WalNotDrained`].
pub async fn stage_batch(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    primary_key: &str,
    rows: Vec<WriteRow>,
) -> Result<Vec<Value>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let checked: Vec<(WriteRow, Option<Value>)> = stream::iter(rows)
        .map(|row| async move {
            let key = docs::primary_key_of(&row.new_document_state, primary_key)?.to_string();
            let current = current_state(store, layout, &key).await?;
            Ok::<_, Error>((row, current))
        })
        .buffered(WRITE_CONCURRENCY)
        .try_collect()
        .await?;

    let mut conflicts = Vec::new();
    let mut accepted = Vec::new();
    for (row, current) in checked {
        let conflicting = match (&current, &row.assumed_master_state) {
            // Nothing stored and nothing assumed: a clean insert.
            (None, None) => false,
            // The master diverged from what the writer assumed.
            (None, Some(_)) | (Some(_), None) => true,
            (Some(stored), Some(assumed)) => !docs::states_equal(stored, assumed),
        };
        if conflicting {
            conflicts.push(current.unwrap_or(Value::Null));
        } else {
            accepted.push(row);
        }
    }

    if !accepted.is_empty() {
        if read_staged(store, layout).await?.is_some() {
            return Err(Error::WalNotDrained);
        }
        let staged = serde_json::to_value(WalFile {
            rows: Some(accepted),
        })
        .map_err(drive_client::Error::Json)?;
        store.patch_media(&layout.wal_file_id, &staged).await?;
    }

    tracing::debug!(
        conflicts = conflicts.len(),
        "checked upstream batch against master state"
    );
    Ok(conflicts)
}

/// Apply a staged WAL to the document files and blank it. A no-op when
/// the WAL is empty; restartable at any point in between.
pub async fn drain(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    primary_key: &str,
) -> Result<()> {
    let Some(rows) = read_staged(store, layout).await? else {
        return Ok(());
    };
    tracing::debug!(rows = rows.len(), "draining staged write-ahead log");

    // Group rows by primary key: order within one key is preserved,
    // distinct keys apply concurrently.
    let mut by_key: BTreeMap<String, Vec<WriteRow>> = BTreeMap::new();
    for row in rows {
        let key = docs::primary_key_of(&row.new_document_state, primary_key)?.to_string();
        by_key.entry(key).or_default().push(row);
    }

    stream::iter(by_key)
        .map(|(key, rows)| async move {
            for row in rows {
                apply_row(store, layout, &key, row).await?;
            }
            Ok::<_, Error>(())
        })
        .buffer_unordered(WRITE_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;

    store.patch_media(&layout.wal_file_id, &Value::Null).await?;
    Ok(())
}

async fn current_state(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    key: &str,
) -> Result<Option<Value>> {
    let name = docs::file_name(key);
    let listed = store
        .list_folder(
            ListQuery::children_of(&layout.docs_folder_id)
                .named(&name)
                .not_trashed(),
        )
        .await?;
    match listed.first() {
        Some(meta) => Ok(Some(store.download_json(&meta.id).await?)),
        None => Ok(None),
    }
}

/// Update the document file when it exists, insert it otherwise. The
/// existence check runs at apply time, so replaying after a partial apply
/// re-classifies and stays idempotent.
async fn apply_row(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    key: &str,
    row: WriteRow,
) -> Result<()> {
    let name = docs::file_name(key);
    let state = docs::normalize(row.new_document_state);

    let listed = store
        .list_folder(
            ListQuery::children_of(&layout.docs_folder_id)
                .named(&name)
                .not_trashed(),
        )
        .await?;
    match listed.first() {
        Some(meta) => store.patch_media(&meta.id, &state).await?,
        None => {
            store
                .upload_multipart(&layout.docs_folder_id, &name, &state)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout;
    use serde_json::json;
    use std::sync::Arc;
    use test_support::MemoryStore;

    async fn fixture() -> (Arc<MemoryStore>, DriveStructure) {
        let store = Arc::new(MemoryStore::new());
        let structure = layout::init(store.as_ref(), "apps/notes", "id")
            .await
            .unwrap();
        (store, structure)
    }

    fn insert_row(id: &str, age: u64) -> WriteRow {
        WriteRow {
            new_document_state: json!({"id": id, "age": age}),
            assumed_master_state: None,
        }
    }

    async fn doc_count(store: &MemoryStore, layout: &DriveStructure) -> usize {
        store
            .list_folder(ListQuery::children_of(&layout.docs_folder_id).not_trashed())
            .await
            .unwrap()
            .len()
    }

    async fn doc_state(store: &MemoryStore, layout: &DriveStructure, id: &str) -> Value {
        current_state(store, layout, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn stage_and_drain_roundtrip() {
        let (store, layout) = fixture().await;

        let rows: Vec<_> = (0..3).map(|n| insert_row(&format!("doc-{n}"), 1)).collect();
        let conflicts = stage_batch(store.as_ref(), &layout, "id", rows)
            .await
            .unwrap();
        assert!(conflicts.is_empty());

        drain(store.as_ref(), &layout, "id").await.unwrap();

        // The WAL is blank again and every staged row is visible.
        assert!(store
            .download_json(&layout.wal_file_id)
            .await
            .unwrap()
            .is_null());
        assert_eq!(doc_count(&store, &layout).await, 3);
        let doc = doc_state(&store, &layout, "doc-1").await;
        assert_eq!(doc["age"], json!(1));
        assert_eq!(doc["_deleted"], json!(false));
        assert_eq!(doc["_attachments"], json!({}));
    }

    #[tokio::test]
    async fn staging_over_a_staged_wal_is_refused() {
        let (store, layout) = fixture().await;

        stage_batch(store.as_ref(), &layout, "id", vec![insert_row("doc-0", 1)])
            .await
            .unwrap();
        let result = stage_batch(store.as_ref(), &layout, "id", vec![insert_row("doc-1", 1)]).await;
        assert!(matches!(result, Err(Error::WalNotDrained)));
    }

    #[tokio::test]
    async fn conflicts_are_detected_and_withheld() {
        let (store, layout) = fixture().await;

        // Seed doc-0..doc-2 at age 1.
        let seed: Vec<_> = (0..3).map(|n| insert_row(&format!("doc-{n}"), 1)).collect();
        stage_batch(store.as_ref(), &layout, "id", seed).await.unwrap();
        drain(store.as_ref(), &layout, "id").await.unwrap();

        // Blind rewrite of the seeded docs plus four fresh inserts: the
        // three rewrites conflict, the four inserts apply.
        let mut batch: Vec<_> = (0..3).map(|n| insert_row(&format!("doc-{n}"), 2)).collect();
        batch.extend((3..7).map(|n| insert_row(&format!("doc-{n}"), 2)));
        let conflicts = stage_batch(store.as_ref(), &layout, "id", batch)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 3);
        for conflict in &conflicts {
            assert_eq!(conflict["age"], json!(1), "conflict carries the master state");
        }
        drain(store.as_ref(), &layout, "id").await.unwrap();
        assert_eq!(doc_count(&store, &layout).await, 7);
        assert_eq!(doc_state(&store, &layout, "doc-0").await["age"], json!(1));

        // With the correct assumed state the rewrite goes through.
        let informed: Vec<_> = (0..3)
            .map(|n| {
                let id = format!("doc-{n}");
                WriteRow {
                    new_document_state: json!({"id": id, "age": 42}),
                    assumed_master_state: Some(json!({"id": id, "age": 1})),
                }
            })
            .collect();
        let conflicts = stage_batch(store.as_ref(), &layout, "id", informed)
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        drain(store.as_ref(), &layout, "id").await.unwrap();
        assert_eq!(doc_state(&store, &layout, "doc-0").await["age"], json!(42));
        assert_eq!(doc_count(&store, &layout).await, 7);
    }

    #[tokio::test]
    async fn drain_is_idempotent_and_replayable() {
        let (store, layout) = fixture().await;

        stage_batch(store.as_ref(), &layout, "id", vec![insert_row("doc-0", 1)])
            .await
            .unwrap();

        // Simulate a crashed holder that applied part of the batch but
        // never blanked the WAL: the document file already exists.
        apply_row(store.as_ref(), &layout, "doc-0", insert_row("doc-0", 1))
            .await
            .unwrap();

        drain(store.as_ref(), &layout, "id").await.unwrap();
        assert_eq!(doc_count(&store, &layout).await, 1);
        assert_eq!(doc_state(&store, &layout, "doc-0").await["age"], json!(1));

        // Draining an empty WAL is a no-op.
        drain(store.as_ref(), &layout, "id").await.unwrap();
    }

    #[tokio::test]
    async fn rows_for_one_key_apply_in_order() {
        let (store, layout) = fixture().await;

        let rows = vec![insert_row("doc-0", 1), insert_row("doc-0", 2)];
        stage_batch(store.as_ref(), &layout, "id", rows).await.unwrap();
        drain(store.as_ref(), &layout, "id").await.unwrap();

        assert_eq!(doc_count(&store, &layout).await, 1);
        assert_eq!(doc_state(&store, &layout, "doc-0").await["age"], json!(2));
    }
}
