//! Naming, shape and housekeeping of the signal files under `signaling/`.

use chrono::{DateTime, Utc};
use drive_client::{ListQuery, ObjectStore};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::time::Duration;

use drive_sync::DriveStructure;

use crate::Result;

pub const SESSION_ID_LEN: usize = 12;
pub const MESSAGE_ID_LEN: usize = 8;

/// Fixed fan-out for deleting stale signal files.
const DELETE_CONCURRENCY: usize = 5;

/// Random lower-alphanumeric token. Session ids compare as plain strings
/// for the initiator tiebreak, so the alphabet has no surprises.
pub fn random_token(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Token identifying a peer for the lifetime of its process.
pub fn new_session_id() -> String {
    random_token(SESSION_ID_LEN)
}

/// Content of one signal file: either a presence beacon or a handshake
/// payload relayed to one specific peer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum SignalBody {
    Presence { i: String },
    Relay { to: String, data: Value },
}

impl SignalBody {
    pub fn presence() -> Self {
        SignalBody::Presence {
            i: "exist".to_string(),
        }
    }
}

/// Parsed form of a signal file name, `<sessionId>_<unixMillis>_<messageId>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalName {
    pub sender: String,
    pub sent_at_ms: i64,
    pub message_id: String,
}

pub fn format_name(sender: &str, sent_at_ms: i64, message_id: &str) -> String {
    format!("{sender}_{sent_at_ms}_{message_id}.json")
}

pub fn parse_name(file_name: &str) -> Option<SignalName> {
    let stem = file_name.strip_suffix(".json")?;
    let mut parts = stem.splitn(3, '_');
    let sender = parts.next()?;
    let sent_at_ms = parts.next()?.parse().ok()?;
    let message_id = parts.next()?;
    if sender.is_empty() || message_id.is_empty() {
        return None;
    }
    Some(SignalName {
        sender: sender.to_string(),
        sent_at_ms,
        message_id: message_id.to_string(),
    })
}

/// Append one message to the signaling log.
pub async fn send(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    session_id: &str,
    body: &SignalBody,
) -> Result<()> {
    let name = format_name(
        session_id,
        Utc::now().timestamp_millis(),
        &random_token(MESSAGE_ID_LEN),
    );
    let content = serde_json::to_value(body).map_err(drive_client::Error::Json)?;
    store
        .upload_multipart(&layout.signaling_folder_id, &name, &content)
        .await?;
    Ok(())
}

/// Delete signal files older than `max_age` as of `now`. Best-effort:
/// individual delete failures are logged and skipped, and the survivors
/// are retried on the next pass.
pub async fn cleanup_old_messages(
    store: &dyn ObjectStore,
    layout: &DriveStructure,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
    let listed = store
        .list_folder(ListQuery::children_of(&layout.signaling_folder_id))
        .await?;

    let stale: Vec<_> = listed
        .into_iter()
        .filter(|meta| meta.created_time.unwrap_or(meta.modified_time) < cutoff)
        .collect();

    let deleted: usize = stream::iter(stale)
        .map(|meta| async move {
            match store.delete_file(&meta.id).await {
                Ok(()) => 1,
                Err(err) => {
                    tracing::debug!(name = %meta.name, %err, "stale signal file not deleted");
                    0
                }
            }
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .fold(0, |sum, one| async move { sum + one })
        .await;

    if deleted > 0 {
        tracing::debug!(deleted, "collected stale signal files");
    }
    Ok(deleted)
}
