//! In-process stand-ins for the external services the replication core
//! talks to, with the same observable semantics: strong per-file
//! compare-and-set, server-assigned millisecond modification times, and
//! first-listing-wins creation races.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use drive_client::{Error, FileHandle, FileMeta, ListQuery, ObjectStore, OrderBy, Result};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// An Object Store held entirely in memory, shared between simulated
/// peers through `Arc`.
///
/// The clock is virtual: every mutation advances it one millisecond, and
/// [`MemoryStore::freeze`] pins it so tests can force `modifiedTime` tie
/// clusters. Stamps are anchored to the wall clock at construction, so
/// lease-age arithmetic against real `Utc::now()` behaves.
pub struct MemoryStore {
    state: Mutex<State>,
}

struct State {
    files: BTreeMap<String, StoredFile>,
    next_id: u64,
    now_ms: i64,
    frozen: bool,
}

#[derive(Debug, Clone)]
struct StoredFile {
    name: String,
    parent: Option<String>,
    folder: bool,
    content: Value,
    version: u64,
    modified_ms: i64,
    created_ms: i64,
    trashed: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                files: BTreeMap::new(),
                next_id: 0,
                now_ms: Utc::now().timestamp_millis(),
                frozen: false,
            }),
        }
    }

    /// Pin the clock: subsequent writes share one modification time.
    pub fn freeze(&self) {
        self.lock().frozen = true;
    }

    pub fn thaw(&self) {
        self.lock().frozen = false;
    }

    /// Jump the clock forward.
    pub fn advance(&self, by: Duration) {
        self.lock().now_ms += by.as_millis() as i64;
    }

    /// Total number of stored files and folders.
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store state is never poisoned")
    }
}

impl State {
    fn tick(&mut self) -> i64 {
        if !self.frozen {
            self.now_ms += 1;
        }
        self.now_ms
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("f{:06}", self.next_id)
    }

    fn create(&mut self, parent: Option<&str>, name: &str, folder: bool, content: Value) -> String {
        let id = self.allocate_id();
        let now = self.tick();
        self.files.insert(
            id.clone(),
            StoredFile {
                name: name.to_string(),
                parent: parent.map(str::to_string),
                folder,
                content,
                version: 1,
                modified_ms: now,
                created_ms: now,
                trashed: false,
            },
        );
        id
    }

    /// First (lexicographically least) live child matching parent+name.
    fn find_child(&self, parent: Option<&str>, name: &str, folder: bool) -> Option<&str> {
        self.files
            .iter()
            .find(|(_, file)| {
                file.folder == folder
                    && !file.trashed
                    && file.name == name
                    && file.parent.as_deref() == parent
            })
            .map(|(id, _)| id.as_str())
    }

    fn get_mut(&mut self, file_id: &str) -> Result<&mut StoredFile> {
        self.files.get_mut(file_id).ok_or(Error::Fetch {
            status: 404,
            body: format!("file {file_id} not found"),
        })
    }

    fn get(&self, file_id: &str) -> Result<&StoredFile> {
        self.files.get(file_id).ok_or(Error::Fetch {
            status: 404,
            body: format!("file {file_id} not found"),
        })
    }
}

fn meta_of(id: &str, file: &StoredFile) -> FileMeta {
    FileMeta {
        id: id.to_string(),
        name: file.name.clone(),
        etag: file.version.to_string(),
        modified_time: stamp(file.modified_ms),
        created_time: Some(stamp(file.created_ms)),
        trashed: file.trashed,
        mime_type: file
            .folder
            .then(|| "application/vnd.google-apps.folder".to_string()),
    }
}

fn stamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).expect("virtual clock stays in range")
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_folder(&self, parent: Option<&str>, name: &str) -> Result<String> {
        let mut state = self.lock();
        if let Some(id) = state.find_child(parent, name, true) {
            return Ok(id.to_string());
        }
        Ok(state.create(parent, name, true, Value::Null))
    }

    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<FileHandle> {
        let mut state = self.lock();
        if let Some(id) = state.find_child(Some(parent), name, false) {
            let id = id.to_string();
            let etag = state.get(&id)?.version.to_string();
            return Ok(FileHandle { id, etag });
        }
        let id = state.create(Some(parent), name, false, Value::Null);
        Ok(FileHandle {
            id,
            etag: "1".to_string(),
        })
    }

    async fn stat(&self, file_id: &str) -> Result<FileMeta> {
        let state = self.lock();
        Ok(meta_of(file_id, state.get(file_id)?))
    }

    async fn conditional_fill_if_etag(
        &self,
        file_id: &str,
        etag: &str,
        content: &Value,
    ) -> Result<FileHandle> {
        let mut state = self.lock();
        let now = state.tick();
        let file = state.get_mut(file_id)?;
        if file.version.to_string() != etag {
            return Err(Error::EtagMismatch);
        }
        file.content = content.clone();
        file.version += 1;
        file.modified_ms = now;
        Ok(FileHandle {
            id: file_id.to_string(),
            etag: file.version.to_string(),
        })
    }

    async fn list_folder(&self, query: ListQuery) -> Result<Vec<FileMeta>> {
        let state = self.lock();
        let since_ms = query.modified_since.map(|bound| bound.timestamp_millis());

        let mut matched: Vec<(&String, &StoredFile)> = state
            .files
            .iter()
            .filter(|(_, file)| {
                query
                    .parent
                    .as_deref()
                    .map_or(true, |parent| file.parent.as_deref() == Some(parent))
                    && query.name.as_deref().map_or(true, |name| file.name == name)
                    && query
                        .mime_type
                        .as_deref()
                        .map_or(true, |mime| (mime == FOLDER_MIME) == file.folder)
                    && query.trashed.map_or(true, |trashed| file.trashed == trashed)
                    && since_ms.map_or(true, |bound| file.modified_ms >= bound)
            })
            .collect();

        match query.order_by {
            Some(OrderBy::ModifiedThenName) => {
                matched.sort_by(|(a_id, a), (b_id, b)| {
                    (a.modified_ms, &a.name, a_id).cmp(&(b.modified_ms, &b.name, b_id))
                });
            }
            Some(OrderBy::CreatedDesc) => {
                matched.sort_by(|(a_id, a), (b_id, b)| {
                    (b.created_ms, b_id).cmp(&(a.created_ms, a_id))
                });
            }
            None => {} // BTreeMap iteration: id order.
        }
        if let Some(page_size) = query.page_size {
            matched.truncate(page_size as usize);
        }

        Ok(matched
            .into_iter()
            .map(|(id, file)| meta_of(id, file))
            .collect())
    }

    async fn download_json(&self, file_id: &str) -> Result<Value> {
        let state = self.lock();
        Ok(state.get(file_id)?.content.clone())
    }

    async fn upload_multipart(&self, parent: &str, name: &str, content: &Value) -> Result<String> {
        let mut state = self.lock();
        if let Some(id) = state.find_child(Some(parent), name, false) {
            let id = id.to_string();
            let now = state.tick();
            let file = state.get_mut(&id)?;
            file.content = content.clone();
            file.version += 1;
            file.modified_ms = now;
            return Ok(id);
        }
        Ok(state.create(Some(parent), name, false, content.clone()))
    }

    async fn patch_media(&self, file_id: &str, content: &Value) -> Result<()> {
        let mut state = self.lock();
        let now = state.tick();
        let file = state.get_mut(file_id)?;
        file.content = content.clone();
        file.version += 1;
        file.modified_ms = now;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.get(file_id)?;
        state.files.remove(file_id);
        Ok(())
    }
}
