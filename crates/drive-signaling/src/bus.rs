//! The per-peer signaling loop: polls the message log with adaptive
//! backoff, bootstraps mesh connections, relays handshakes, and surfaces
//! resync nudges to the orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use drive_client::{ListQuery, ObjectStore, OrderBy};
use tokio::sync::{broadcast, mpsc};

use drive_sync::DriveStructure;

use crate::mesh::{is_initiator, PeerConnector, PeerEvent, PeerLink};
use crate::message::{self, SignalBody};
use crate::{Result, NEW_PEER_FRAME, RESYNC_FRAME};

/// Poll delays, walked one step per empty poll and capped at the last
/// entry. Activity resets to the front.
pub const POLL_DELAYS_MS: [u64; 15] = [
    50, 50, 100, 100, 200, 400, 600, 1000, 2000, 4000, 8000, 15000, 30000, 60000, 120000,
];

pub fn poll_delay(step: usize) -> Duration {
    Duration::from_millis(POLL_DELAYS_MS[step.min(POLL_DELAYS_MS.len() - 1)])
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    /// Signal files older than this are garbage collected.
    pub cleanup_max_age: Duration,
    /// How often the collector runs after the startup pass.
    pub cleanup_interval: Duration,
    /// Page size of one poll of the signaling folder.
    pub poll_page_size: u32,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            cleanup_max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            poll_page_size: 1000,
        }
    }
}

enum Command {
    /// Send a text frame to every connected peer.
    Broadcast(String),
    /// Reset the poll backoff, e.g. because the host came back online.
    Wake,
    Close,
}

/// Handle to the signaling loop of one peer session.
pub struct Signaling {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    resync_tx: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl Signaling {
    /// Spawn the loop: beacon, startup GC, then adaptive polling.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        layout: DriveStructure,
        connector: Arc<dyn PeerConnector>,
        options: SignalingOptions,
    ) -> Signaling {
        let session_id = message::new_session_id();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (resync_tx, _) = broadcast::channel(16);

        let looper = Loop {
            store,
            layout,
            connector,
            options,
            session_id: session_id.clone(),
            resync_tx: resync_tx.clone(),
            peer_events_tx,
            peers: HashMap::new(),
            processed: HashSet::new(),
            step: 0,
        };
        let task = tokio::spawn(looper.run(commands_rx, peer_events_rx));

        Signaling {
            session_id,
            commands: commands_tx,
            resync_tx,
            task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stream of "something changed remotely, re-pull" nudges.
    pub fn resync(&self) -> broadcast::Receiver<()> {
        self.resync_tx.subscribe()
    }

    /// Send a text frame to every connected peer.
    pub fn broadcast(&self, data: &str) {
        let _ = self.commands.send(Command::Broadcast(data.to_string()));
    }

    /// Reset the poll backoff to its eager front.
    pub fn wake(&self) {
        let _ = self.commands.send(Command::Wake);
    }

    /// Stop polling and tear down every peer connection.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }
}

struct Loop {
    store: Arc<dyn ObjectStore>,
    layout: DriveStructure,
    connector: Arc<dyn PeerConnector>,
    options: SignalingOptions,
    session_id: String,
    resync_tx: broadcast::Sender<()>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<String, Box<dyn PeerLink>>,
    processed: HashSet<String>,
    step: usize,
}

impl Loop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        if let Err(err) = message::send(
            self.store.as_ref(),
            &self.layout,
            &self.session_id,
            &SignalBody::presence(),
        )
        .await
        {
            tracing::warn!(%err, "presence beacon not sent");
        }
        if let Err(err) = self.cleanup().await {
            tracing::warn!(%err, "startup signal cleanup failed");
        }
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Broadcast(data)) => self.broadcast_frame(&data),
                    Some(Command::Wake) => self.step = 0,
                    Some(Command::Close) | None => break,
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                () = tokio::time::sleep(poll_delay(self.step)) => {
                    match self.poll_once().await {
                        // Only activity resets the backoff; empty polls
                        // keep growing it toward the cap.
                        Ok(0) => self.step = self.step.saturating_add(1),
                        Ok(fresh) => {
                            tracing::trace!(fresh, "processed signal messages");
                            self.step = 0;
                        }
                        Err(err) => {
                            tracing::warn!(%err, "signal poll failed");
                            self.step = self.step.saturating_add(1);
                        }
                    }
                    if last_cleanup.elapsed() >= self.options.cleanup_interval {
                        if let Err(err) = self.cleanup().await {
                            tracing::warn!(%err, "periodic signal cleanup failed");
                        }
                        last_cleanup = tokio::time::Instant::now();
                    }
                }
            }
        }

        for (_, peer) in self.peers.drain() {
            peer.close();
        }
    }

    /// One pass over the message log, oldest first.
    async fn poll_once(&mut self) -> Result<usize> {
        let mut listed = self
            .store
            .list_folder(
                ListQuery::children_of(&self.layout.signaling_folder_id)
                    .order_by(OrderBy::CreatedDesc)
                    .page_size(self.options.poll_page_size),
            )
            .await?;
        listed.reverse();

        let mut fresh = 0;
        for meta in listed {
            let Some(parsed) = message::parse_name(&meta.name) else {
                continue; // Foreign file; the collector will reap it.
            };
            if parsed.sender == self.session_id || self.processed.contains(&parsed.message_id) {
                continue;
            }
            self.processed.insert(parsed.message_id);
            fresh += 1;

            let content = match self.store.download_json(&meta.id).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::debug!(name = %meta.name, %err, "signal file vanished mid-poll");
                    continue;
                }
            };
            match serde_json::from_value::<SignalBody>(content) {
                Ok(body) => self.dispatch(parsed.sender, body).await,
                Err(err) => tracing::debug!(name = %meta.name, %err, "unparseable signal file"),
            }
        }
        Ok(fresh)
    }

    async fn dispatch(&mut self, sender: String, body: SignalBody) {
        if !self.peers.contains_key(&sender) {
            if let Err(err) = self.connect_peer(&sender).await {
                tracing::warn!(remote = %sender, %err, "peer bootstrap failed");
                return;
            }
        }
        match body {
            SignalBody::Presence { .. } => {}
            SignalBody::Relay { to, data } => {
                if to != self.session_id {
                    return; // Addressed to some other peer.
                }
                if let Some(peer) = self.peers.get(&sender) {
                    peer.signal(data);
                }
            }
        }
    }

    async fn connect_peer(&mut self, remote: &str) -> Result<()> {
        let initiator = is_initiator(&self.session_id, remote);
        tracing::debug!(remote, initiator, "bootstrapping peer connection");
        let link = self
            .connector
            .connect(
                &self.session_id,
                remote,
                initiator,
                self.peer_events_tx.clone(),
            )
            .await?;

        // The mesh grew: nudge the peers we already have back to eager
        // polling so they discover the newcomer quickly too.
        self.broadcast_frame(NEW_PEER_FRAME);
        self.peers.insert(remote.to_string(), link);
        Ok(())
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Signal { remote, payload } => {
                let body = SignalBody::Relay {
                    to: remote,
                    data: payload,
                };
                if let Err(err) =
                    message::send(self.store.as_ref(), &self.layout, &self.session_id, &body).await
                {
                    tracing::warn!(%err, "handshake relay not sent");
                }
            }
            PeerEvent::Connected { remote } => {
                tracing::debug!(%remote, "peer connected");
                let _ = self.resync_tx.send(());
            }
            PeerEvent::Data { remote, payload } => match payload.as_str() {
                RESYNC_FRAME => {
                    let _ = self.resync_tx.send(());
                }
                NEW_PEER_FRAME => self.step = 0,
                other => tracing::debug!(%remote, frame = other, "unhandled data frame"),
            },
            PeerEvent::Error { remote, message } => {
                tracing::warn!(%remote, reason = %message, "peer failed");
                if let Some(peer) = self.peers.remove(&remote) {
                    peer.close();
                }
                let _ = self.resync_tx.send(());
            }
            PeerEvent::Closed { remote } => {
                self.peers.remove(&remote);
                let _ = self.resync_tx.send(());
            }
        }
    }

    fn broadcast_frame(&self, data: &str) {
        for (remote, peer) in &self.peers {
            if let Err(err) = peer.send(data) {
                tracing::debug!(remote = %remote, %err, "frame not delivered");
            }
        }
    }

    async fn cleanup(&self) -> Result<usize> {
        message::cleanup_old_messages(
            self.store.as_ref(),
            &self.layout,
            self.options.cleanup_max_age,
            chrono::Utc::now(),
        )
        .await
    }
}
