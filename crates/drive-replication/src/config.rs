use std::time::Duration;

use drive_signaling::SignalingOptions;

pub const DEFAULT_API_ENDPOINT: &str = "https://www.googleapis.com";

/// Connection settings for the backing drive folder.
#[derive(Debug, Clone)]
pub struct DriveOptions {
    /// OAuth bearer token; obtaining and refreshing it is the host's job.
    pub auth_token: String,
    /// Folder the replication owns. Must not be the drive root.
    pub folder_path: String,
    /// Field of every document that holds its primary key.
    pub primary_key: String,
    /// REST endpoint; overridable so tests can point at a stand-in.
    pub api_endpoint: url::Url,
    /// Lease length of the cross-peer transaction lock.
    pub transaction_timeout: Duration,
}

impl DriveOptions {
    pub fn new(auth_token: &str, folder_path: &str, primary_key: &str) -> Self {
        Self {
            auth_token: auth_token.to_string(),
            folder_path: folder_path.to_string(),
            primary_key: primary_key.to_string(),
            api_endpoint: url::Url::parse(DEFAULT_API_ENDPOINT)
                .expect("default endpoint is a valid url"),
            transaction_timeout: drive_sync::transaction::DEFAULT_TIMEOUT,
        }
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub drive: DriveOptions,
    /// Keep replicating after the initial sync, nudged by peers.
    pub live: bool,
    /// Pause between retries of a failed live pull cycle.
    pub retry_time: Duration,
    pub pull_batch_size: usize,
    pub signaling: SignalingOptions,
}

impl SyncOptions {
    pub fn new(drive: DriveOptions) -> Self {
        Self {
            drive,
            live: false,
            retry_time: Duration::from_secs(5),
            pull_batch_size: 100,
            signaling: SignalingOptions::default(),
        }
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn retry_time(mut self, retry_time: Duration) -> Self {
        self.retry_time = retry_time;
        self
    }

    pub fn pull_batch_size(mut self, batch_size: usize) -> Self {
        self.pull_batch_size = batch_size;
        self
    }
}
