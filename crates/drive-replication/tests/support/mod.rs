//! In-process peer transport for live-replication tests.
//!
//! Handshake payloads travel through the signaling folder exactly like a
//! real transport's offers and answers; once both sides have seen the
//! counterpart's payload, the hub wires a pair of in-memory data
//! channels and raises `Connected` on both ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use drive_signaling::{PeerConnector, PeerEvent, PeerLink};

#[derive(Default)]
pub struct LoopbackHub {
    pairs: Mutex<HashMap<(String, String), Pair>>,
}

#[derive(Default)]
struct Pair {
    ends: HashMap<String, Endpoint>,
}

struct Endpoint {
    events: mpsc::UnboundedSender<PeerEvent>,
    remote: String,
    /// Frames addressed to this endpoint.
    inbox: mpsc::UnboundedSender<String>,
    /// Where this endpoint's link writes outgoing frames; filled in when
    /// the pair completes its handshake.
    outbox: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    ready: bool,
    wired: bool,
}

impl LoopbackHub {
    fn key(a: &str, b: &str) -> (String, String) {
        if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn register(
        &self,
        own: &str,
        remote: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
        inbox: mpsc::UnboundedSender<String>,
        outbox: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    ) {
        let mut pairs = self.pairs.lock().unwrap();
        let pair = pairs.entry(Self::key(own, remote)).or_default();
        pair.ends.insert(
            own.to_string(),
            Endpoint {
                events,
                remote: remote.to_string(),
                inbox,
                outbox,
                ready: false,
                wired: false,
            },
        );
    }

    fn mark_ready(&self, own: &str, remote: &str) {
        let mut pairs = self.pairs.lock().unwrap();
        let Some(pair) = pairs.get_mut(&Self::key(own, remote)) else {
            return;
        };
        if let Some(end) = pair.ends.get_mut(own) {
            end.ready = true;
        }
        let complete = pair.ends.len() == 2
            && pair.ends.values().all(|end| end.ready)
            && pair.ends.values().any(|end| !end.wired);
        if !complete {
            return;
        }

        let ids: Vec<String> = pair.ends.keys().cloned().collect();
        for id in &ids {
            let other = ids.iter().find(|candidate| *candidate != id).unwrap();
            let other_inbox = pair.ends[other].inbox.clone();
            let end = pair.ends.get_mut(id).unwrap();
            *end.outbox.lock().unwrap() = Some(other_inbox);
            end.wired = true;
            let _ = end.events.send(PeerEvent::Connected {
                remote: end.remote.clone(),
            });
        }
    }

    fn teardown(&self, own: &str, remote: &str) {
        let mut pairs = self.pairs.lock().unwrap();
        if let Some(pair) = pairs.remove(&Self::key(own, remote)) {
            // Dropping the stored inbox senders and clearing the outbox
            // slots closes both channels; each side's forwarding task
            // then raises `Closed`.
            for (_, end) in pair.ends {
                *end.outbox.lock().unwrap() = None;
            }
        }
    }
}

pub struct LoopbackConnector {
    hub: Arc<LoopbackHub>,
}

impl LoopbackConnector {
    pub fn new(hub: &Arc<LoopbackHub>) -> Arc<Self> {
        Arc::new(Self { hub: hub.clone() })
    }
}

#[async_trait::async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        own_id: &str,
        remote_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> drive_signaling::Result<Box<dyn PeerLink>> {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<String>();
        let outbox = Arc::new(Mutex::new(None));
        self.hub
            .register(own_id, remote_id, events.clone(), inbox_tx, outbox.clone());

        let forward_events = events.clone();
        let forward_remote = remote_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = inbox_rx.recv().await {
                let delivered = forward_events.send(PeerEvent::Data {
                    remote: forward_remote.clone(),
                    payload: frame,
                });
                if delivered.is_err() {
                    return;
                }
            }
            let _ = forward_events.send(PeerEvent::Closed {
                remote: forward_remote,
            });
        });

        if initiator {
            let _ = events.send(PeerEvent::Signal {
                remote: remote_id.to_string(),
                payload: json!({"t": "offer"}),
            });
        }

        Ok(Box::new(LoopbackLink {
            hub: self.hub.clone(),
            own: own_id.to_string(),
            remote: remote_id.to_string(),
            events,
            outbox,
        }))
    }
}

pub struct LoopbackLink {
    hub: Arc<LoopbackHub>,
    own: String,
    remote: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    outbox: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl PeerLink for LoopbackLink {
    fn signal(&self, payload: Value) {
        match payload.get("t").and_then(Value::as_str) {
            Some("offer") => {
                let _ = self.events.send(PeerEvent::Signal {
                    remote: self.remote.clone(),
                    payload: json!({"t": "answer"}),
                });
                self.hub.mark_ready(&self.own, &self.remote);
            }
            Some("answer") => self.hub.mark_ready(&self.own, &self.remote),
            _ => {}
        }
    }

    fn send(&self, data: &str) -> drive_signaling::Result<()> {
        let outbox = self.outbox.lock().unwrap();
        match outbox.as_ref() {
            Some(tx) => tx
                .send(data.to_string())
                .map_err(|_| drive_signaling::Error::Peer("data channel torn down".to_string())),
            None => Err(drive_signaling::Error::Peer(
                "data channel not open".to_string(),
            )),
        }
    }

    fn close(&self) {
        self.hub.teardown(&self.own, &self.remote);
    }
}
