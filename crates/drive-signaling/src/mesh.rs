use serde_json::Value;
use tokio::sync::mpsc;

/// Lifecycle and traffic notifications of one peer connection, delivered
/// to the signaling loop over the channel handed to
/// [`PeerConnector::connect`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally produced handshake payload that must reach the remote
    /// peer through the signaling bus.
    Signal { remote: String, payload: Value },
    /// The data channel is open.
    Connected { remote: String },
    /// A text frame arrived over the data channel.
    Data { remote: String, payload: String },
    Error { remote: String, message: String },
    Closed { remote: String },
}

/// A live connection to one remote peer.
pub trait PeerLink: Send + Sync {
    /// Feed a handshake payload that arrived from the remote side.
    fn signal(&self, payload: Value);

    /// Send a short text frame over the data channel.
    fn send(&self, data: &str) -> crate::Result<()>;

    fn close(&self);
}

/// Capability that dials peer connections. The transport (a WebRTC stack
/// in browsers, a polyfill elsewhere, a loopback in tests) is injected by
/// the embedder rather than linked here.
#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        own_id: &str,
        remote_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> crate::Result<Box<dyn PeerLink>>;
}

/// Deterministic tiebreak: for any pair of session ids, exactly one side
/// dials as the initiator.
pub(crate) fn is_initiator(own_id: &str, remote_id: &str) -> bool {
    remote_id > own_id
}

#[cfg(test)]
mod test {
    use super::is_initiator;

    #[test]
    fn exactly_one_initiator_per_pair() {
        for (a, b) in [("aaa", "bbb"), ("zzz", "aaa"), ("abc1", "abc2")] {
            assert_ne!(is_initiator(a, b), is_initiator(b, a));
        }
        assert!(!is_initiator("same", "same"));
    }
}
