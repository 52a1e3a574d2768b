mod meta;
mod rest;
mod store;

pub use meta::{FileHandle, FileMeta, ListQuery, OrderBy};
pub use rest::Client;
pub use store::ObjectStore;

/// Errors surfaced by Object Store operations.
///
/// `RateLimited` is produced only after the internal retry budget is
/// exhausted; `EtagMismatch` is a normal signal consumed by the
/// transaction layer and should not reach hosts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file service kept rate-limiting after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("conditional write lost: stored etag no longer matches")]
    EtagMismatch,
    #[error("{status}: {body}")]
    Fetch { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Delay before re-issuing a rate-limited request, for the zero-indexed
/// retry `attempt`: 250ms doubled per attempt, plus up to 200ms of jitter
/// so contending peers spread out.
pub fn backoff(attempt: u32) -> std::time::Duration {
    use rand::Rng;
    let base = 250u64 << attempt.min(10);
    std::time::Duration::from_millis(base + rand::thread_rng().gen_range(0..200))
}

#[cfg(test)]
mod test {
    #[test]
    fn backoff_grows_and_jitters() {
        for attempt in 0..4 {
            let base = 250u64 << attempt;
            let delay = super::backoff(attempt).as_millis() as u64;
            assert!(delay >= base && delay < base + 200, "attempt {attempt}: {delay}");
        }
    }
}
