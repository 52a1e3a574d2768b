use serde_json::Value;

use crate::{FileHandle, FileMeta, ListQuery, Result};

/// The storage operations the replication core builds on.
///
/// Implemented by the REST [`crate::Client`] and by the in-memory store
/// used in tests. Content is always JSON; passing `Value::Null` writes a
/// zero-byte file, and reading a zero-byte file yields `Value::Null`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve or create the folder `name` under `parent` (`None` = drive
    /// root). Safe under concurrent callers: every caller observes the
    /// same resulting id. When a race creates duplicate folders, all
    /// callers settle on the lexicographically least id.
    async fn ensure_folder(&self, parent: Option<&str>, name: &str) -> Result<String>;

    /// Resolve or create the zero-byte file `name` under `parent`, with
    /// the same first-listing-wins race semantics as [`Self::ensure_folder`].
    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<FileHandle>;

    /// Fetch the current metadata of one file.
    async fn stat(&self, file_id: &str) -> Result<FileMeta>;

    /// Overwrite `file_id` iff its stored etag still equals `etag`,
    /// failing with [`crate::Error::EtagMismatch`] otherwise. This is the
    /// compare-and-set primitive behind the cross-peer mutex.
    async fn conditional_fill_if_etag(
        &self,
        file_id: &str,
        etag: &str,
        content: &Value,
    ) -> Result<FileHandle>;

    async fn list_folder(&self, query: ListQuery) -> Result<Vec<FileMeta>>;

    async fn download_json(&self, file_id: &str) -> Result<Value>;

    /// Create `name` under `parent` with the given content, returning the
    /// file id. De-duplicates by `(parent, name)`: re-uploading an
    /// existing name rewrites that file instead of creating a sibling.
    async fn upload_multipart(&self, parent: &str, name: &str, content: &Value) -> Result<String>;

    /// Replace the content of an existing file.
    async fn patch_media(&self, file_id: &str, content: &Value) -> Result<()>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;
}
