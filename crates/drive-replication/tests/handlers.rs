//! Host-facing pull/push handler behavior without live signaling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use drive_replication::{DriveOptions, Error, Replication, SyncOptions, WriteRow};
use test_support::MemoryStore;

fn options(folder_path: &str) -> SyncOptions {
    SyncOptions::new(
        DriveOptions::new("test-token", folder_path, "id")
            .transaction_timeout(Duration::from_millis(500)),
    )
}

fn insert(id: &str, age: u64) -> WriteRow {
    WriteRow {
        new_document_state: json!({"id": id, "age": age}),
        assumed_master_state: None,
    }
}

#[tokio::test]
async fn push_then_pull_roundtrip() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let replication = Replication::connect(store, None, options("apps/notes")).await?;

    let conflicts = replication
        .push((0..3).map(|n| insert(&format!("doc-{n}"), 1)).collect())
        .await?;
    assert!(conflicts.is_empty());

    let batch = replication.pull(None, 10).await?;
    assert_eq!(batch.documents.len(), 3);
    let checkpoint = batch.checkpoint;

    // Drained.
    let drained = replication.pull(checkpoint.clone(), 10).await?;
    assert!(drained.documents.is_empty());

    // A blind rewrite conflicts and is withheld.
    let conflicts = replication.push(vec![insert("doc-0", 2)]).await?;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["age"], json!(1));
    let still = replication.pull(checkpoint.clone(), 10).await?;
    assert!(still.documents.is_empty());

    // With the master state assumed correctly, the rewrite applies and
    // is re-delivered downstream.
    let conflicts = replication
        .push(vec![WriteRow {
            new_document_state: json!({"id": "doc-0", "age": 2}),
            assumed_master_state: Some(conflicts[0].clone()),
        }])
        .await?;
    assert!(conflicts.is_empty());
    let updated = replication.pull(checkpoint, 10).await?;
    assert_eq!(updated.documents.len(), 1);
    assert_eq!(updated.documents[0]["age"], json!(2));
    Ok(())
}

#[tokio::test]
async fn refuses_the_drive_root() {
    for folder_path in ["", "/", "root"] {
        let store = Arc::new(MemoryStore::new());
        let refused = Replication::connect(store, None, options(folder_path)).await;
        assert!(
            matches!(
                refused,
                Err(Error::Sync(drive_sync::Error::InvalidRoot(_)))
            ),
            "{folder_path:?} must be refused"
        );
    }
}

#[tokio::test]
async fn structures_agree_across_peers() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let a = Replication::connect(store.clone(), None, options("apps/notes")).await?;
    let b = Replication::connect(store, None, options("apps/notes")).await?;
    assert_eq!(a.structure(), b.structure());
    Ok(())
}
