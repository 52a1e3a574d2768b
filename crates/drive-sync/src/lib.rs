pub mod docs;
pub mod downstream;
pub mod layout;
pub mod transaction;
pub mod wal;

pub use downstream::{fetch_changes, Checkpoint, PullBatch};
pub use layout::DriveStructure;
pub use transaction::{Acquire, Transaction, TxnHandle};
pub use wal::WriteRow;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid replication folder path: {0:?}")]
    InvalidRoot(String),
    #[error("write-ahead log is staged but not drained")]
    WalNotDrained,
    #[error("document is missing primary key field {0:?}")]
    MissingPrimaryKey(String),
    #[error(transparent)]
    Store(#[from] drive_client::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
