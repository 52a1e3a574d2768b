//! File-based signaling between peers sharing one drive folder, plus the
//! peer-to-peer mesh it bootstraps. The `signaling/` subfolder is an
//! append-only log of small JSON files; polling it with adaptive backoff
//! is the discovery path, and the mesh's data channels carry the
//! low-latency pings afterwards.

mod bus;
mod mesh;
pub mod message;

pub use bus::{poll_delay, Signaling, SignalingOptions, POLL_DELAYS_MS};
pub use mesh::{PeerConnector, PeerEvent, PeerLink};
pub use message::{new_session_id, SignalBody};

/// Data-channel frame telling peers a remote write landed: re-pull now.
pub const RESYNC_FRAME: &str = "RESYNC";
/// Data-channel frame telling peers the mesh grew: poll eagerly again.
pub const NEW_PEER_FRAME: &str = "NEW_PEER";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] drive_client::Error),
    #[error("peer transport failure: {0}")]
    Peer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
