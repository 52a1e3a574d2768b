//! The replication orchestrator: wires the transaction-guarded upstream
//! and downstream paths into pull/push handlers for the host replication
//! engine, and owns the signaling lifecycle in live mode.

mod config;

pub use config::{DriveOptions, SyncOptions, DEFAULT_API_ENDPOINT};
pub use drive_sync::{Checkpoint, DriveStructure, PullBatch, WriteRow};

use std::sync::Arc;

use drive_client::ObjectStore;
use drive_signaling::{PeerConnector, Signaling, RESYNC_FRAME};
use drive_sync::{downstream, layout, transaction::Transaction, wal};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sync(#[from] drive_sync::Error),
    #[error(transparent)]
    Signaling(#[from] drive_signaling::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the host observes while replication runs. Transient failures are
/// reported here and retried; they never terminate the replication.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// A live pull cycle drained to empty: local state is caught up.
    Resynced,
    Error(String),
}

/// One replication of one collection through one drive folder.
///
/// Cheap to clone; clones share all state. `pull` and `push` are the
/// handlers the host replication engine calls; `start`/`cancel` bound the
/// live signaling lifecycle.
#[derive(Clone)]
pub struct Replication {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    structure: DriveStructure,
    txn: Transaction,
    options: SyncOptions,
    connector: Option<Arc<dyn PeerConnector>>,
    events_tx: broadcast::Sender<ReplicationEvent>,
    batches_tx: broadcast::Sender<PullBatch>,
    initial_tx: watch::Sender<bool>,
    initial_rx: watch::Receiver<bool>,
    live: Mutex<Option<LiveState>>,
}

struct LiveState {
    signaling: Signaling,
    pump: tokio::task::JoinHandle<()>,
}

impl Replication {
    /// Validate the configuration, materialize the folder hierarchy and
    /// assemble the handlers against the given store.
    pub async fn connect(
        store: Arc<dyn ObjectStore>,
        connector: Option<Arc<dyn PeerConnector>>,
        options: SyncOptions,
    ) -> Result<Self> {
        let structure = layout::init(
            store.as_ref(),
            &options.drive.folder_path,
            &options.drive.primary_key,
        )
        .await?;

        let txn = Transaction::new(
            store.clone(),
            structure.clone(),
            drive_signaling::new_session_id(),
            options.drive.primary_key.clone(),
            options.drive.transaction_timeout,
        );
        let (events_tx, _) = broadcast::channel(64);
        let (batches_tx, _) = broadcast::channel(64);
        let (initial_tx, initial_rx) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                structure,
                txn,
                options,
                connector,
                events_tx,
                batches_tx,
                initial_tx,
                initial_rx,
                live: Mutex::new(None),
            }),
        })
    }

    /// Connect against the real REST service.
    pub async fn connect_rest(
        connector: Option<Arc<dyn PeerConnector>>,
        options: SyncOptions,
    ) -> Result<Self> {
        let client = drive_client::Client::new(
            &options.drive.api_endpoint,
            &options.drive.auth_token,
        );
        Self::connect(Arc::new(client), connector, options).await
    }

    pub fn structure(&self) -> &DriveStructure {
        &self.inner.structure
    }

    /// Pull handler: one transaction-guarded page of changed documents
    /// at or after the caller's checkpoint.
    pub fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<PullBatch>> {
        Box::pin(async move {
            let inner = &self.inner;
            let batch = inner
                .txn
                .run(
                    || -> BoxFuture<'_, drive_sync::Result<PullBatch>> {
                        Box::pin(downstream::fetch_changes(
                            inner.store.as_ref(),
                            &inner.structure,
                            checkpoint.as_ref(),
                            batch_size,
                        ))
                    },
                    None,
                )
                .await?;
            Ok(batch)
        })
    }

    /// Push handler: stage the batch in the WAL inside a transaction and
    /// apply it; returns the master states of conflicting rows. Connected
    /// peers are nudged with `RESYNC` once the lock is released.
    pub async fn push(&self, rows: Vec<WriteRow>) -> Result<Vec<Value>> {
        let inner = &self.inner;
        let on_commit: BoxFuture<'_, ()> = Box::pin(async move { self.notify_peers().await });
        let conflicts = inner
            .txn
            .run(
                || {
                    wal::stage_batch(
                        inner.store.as_ref(),
                        &inner.structure,
                        &inner.options.drive.primary_key,
                        rows,
                    )
                },
                Some(on_commit),
            )
            .await?;
        Ok(conflicts)
    }

    /// In live mode, bring up signaling and the resync-driven pull pump.
    /// A no-op when not live, when no peer connector was supplied, or
    /// when already started.
    pub async fn start(&self) -> Result<()> {
        if !self.inner.options.live {
            return Ok(());
        }
        let Some(connector) = self.inner.connector.clone() else {
            tracing::debug!("live mode without a peer connector; polling only at pull time");
            return Ok(());
        };

        let mut live = self.inner.live.lock().await;
        if live.is_some() {
            return Ok(());
        }

        let signaling = Signaling::start(
            self.inner.store.clone(),
            self.inner.structure.clone(),
            connector,
            self.inner.options.signaling.clone(),
        );
        let resync = signaling.resync();
        let pump_fut: BoxFuture<'static, ()> = Box::pin(Self::pump(self.clone(), resync));
        let pump = tokio::spawn(pump_fut);
        *live = Some(LiveState { signaling, pump });

        tracing::debug!(
            identifier = %self.inner.structure.replication_identifier,
            "live replication started"
        );
        Ok(())
    }

    /// Tear down signaling (destroying every peer connection) and stop
    /// the pull pump. An in-flight transaction is not aborted: it either
    /// completes or its lease expires and another peer takes over.
    pub async fn cancel(&self) {
        let mut live = self.inner.live.lock().await;
        if let Some(state) = live.take() {
            state.pump.abort();
            state.signaling.close().await;
            tracing::debug!("live replication cancelled");
        }
    }

    /// Manually nudge every connected peer to re-pull.
    pub async fn notify_peers(&self) {
        let live = self.inner.live.lock().await;
        if let Some(state) = live.as_ref() {
            state.signaling.broadcast(RESYNC_FRAME);
        }
    }

    /// Resync and error notifications.
    pub fn events(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Document batches produced by the live pull pump, for the host to
    /// apply to its collection. Subscribe before calling [`Self::start`].
    pub fn batches(&self) -> broadcast::Receiver<PullBatch> {
        self.inner.batches_tx.subscribe()
    }

    /// Resolves once a live pull cycle has fully drained for the first
    /// time.
    pub async fn await_initial_replication(&self) {
        let mut initial = self.inner.initial_rx.clone();
        let _ = initial.wait_for(|done| *done).await;
    }

    /// Pull until drained, then sleep until the next resync nudge. Errors
    /// are reported and retried; the pump only stops when cancelled.
    async fn pump(this: Replication, mut resync: broadcast::Receiver<()>) {
        let mut checkpoint: Option<Checkpoint> = None;
        loop {
            match this
                .pull(checkpoint.clone(), this.inner.options.pull_batch_size)
                .await
            {
                Ok(batch) => {
                    checkpoint = batch.checkpoint.clone();
                    if !batch.documents.is_empty() {
                        let _ = this.inner.batches_tx.send(batch);
                        continue; // Keep pulling until drained.
                    }
                    let _ = this.inner.initial_tx.send(true);
                    let _ = this.inner.events_tx.send(ReplicationEvent::Resynced);
                }
                Err(err) => {
                    tracing::warn!(%err, "live pull failed; retrying");
                    let _ = this
                        .inner
                        .events_tx
                        .send(ReplicationEvent::Error(err.to_string()));
                    tokio::time::sleep(this.inner.options.retry_time).await;
                    continue;
                }
            }

            match resync.recv().await {
                Ok(()) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
