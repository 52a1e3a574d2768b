use drive_client::ObjectStore;

use crate::{Error, Result};

pub const DOCS_FOLDER: &str = "docs";
pub const SIGNALING_FOLDER: &str = "signaling";
pub const TRANSACTION_FILE: &str = "transaction";
pub const BLOCKER_FILE: &str = "blocker";
pub const WAL_FILE: &str = "wal";

/// Opaque ids of the fixed folder hierarchy, resolved once and then owned
/// by the orchestrator for the replication's lifetime. Components receive
/// it by value and never re-resolve ids themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveStructure {
    /// Stable hash of `(folder_path, primary_key)`; names this replication
    /// across restarts and peers.
    pub replication_identifier: String,
    pub root_folder_id: String,
    pub docs_folder_id: String,
    pub signaling_folder_id: String,
    pub transaction_file_id: String,
    pub blocker_file_id: String,
    pub wal_file_id: String,
}

/// Derive the stable replication identifier from the folder path and the
/// collection's primary key field.
pub fn replication_identifier(folder_path: &str, primary_key: &str) -> String {
    let mut seed = Vec::with_capacity(folder_path.len() + primary_key.len() + 1);
    seed.extend_from_slice(folder_path.as_bytes());
    seed.push(0x1f);
    seed.extend_from_slice(primary_key.as_bytes());
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&seed))
}

/// Split and validate the configured folder path. The drive root itself
/// is refused: replication needs a dedicated folder it can own.
pub fn validate_folder_path(folder_path: &str) -> Result<Vec<String>> {
    let segments: Vec<String> = folder_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();

    if segments.is_empty() || folder_path == "root" {
        return Err(Error::InvalidRoot(folder_path.to_string()));
    }
    Ok(segments)
}

/// Materialize the folder hierarchy and resolve every fixed id.
///
/// Idempotent and safe under concurrent callers: parallel invocations for
/// the same path settle on identical [`DriveStructure`] values.
pub async fn init(
    store: &dyn ObjectStore,
    folder_path: &str,
    primary_key: &str,
) -> Result<DriveStructure> {
    let segments = validate_folder_path(folder_path)?;

    let mut parent: Option<String> = None;
    for segment in &segments {
        let id = store.ensure_folder(parent.as_deref(), segment).await?;
        parent = Some(id);
    }
    let root_folder_id = parent.expect("folder path has at least one segment");

    let docs_folder_id = store.ensure_folder(Some(&root_folder_id), DOCS_FOLDER).await?;
    let signaling_folder_id = store
        .ensure_folder(Some(&root_folder_id), SIGNALING_FOLDER)
        .await?;

    let transaction = store.create_empty_file(&root_folder_id, TRANSACTION_FILE).await?;
    let blocker = store.create_empty_file(&root_folder_id, BLOCKER_FILE).await?;
    let wal = store.create_empty_file(&root_folder_id, WAL_FILE).await?;

    let structure = DriveStructure {
        replication_identifier: replication_identifier(folder_path, primary_key),
        root_folder_id,
        docs_folder_id,
        signaling_folder_id,
        transaction_file_id: transaction.id,
        blocker_file_id: blocker.id,
        wal_file_id: wal.id,
    };
    tracing::debug!(
        identifier = %structure.replication_identifier,
        root = %structure.root_folder_id,
        "resolved drive structure"
    );
    Ok(structure)
}
