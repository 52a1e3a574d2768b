use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::{Error, FileHandle, FileMeta, ListQuery, ObjectStore, OrderBy, Result};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const META_FIELDS: &str = "id,name,version,modifiedTime,createdTime,trashed,mimeType";

/// One retry per backoff step; after this many rate-limited responses the
/// error propagates to the caller.
const MAX_ATTEMPTS: u32 = 4;

/// Typed wrapper over the file service's REST v3 surface.
///
/// Cheap to clone; all clones share one connection pool. The endpoint is
/// configurable so tests can point it at a local stand-in.
#[derive(Clone)]
pub struct Client {
    endpoint: String,
    auth_token: String,
    http: reqwest::Client,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    id: String,
    name: String,
    /// Serialized as a string by the service (it is an int64 field).
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(serde::Deserialize)]
struct WireFileList {
    #[serde(default)]
    files: Vec<WireFile>,
}

impl From<WireFile> for FileMeta {
    fn from(wire: WireFile) -> FileMeta {
        FileMeta {
            id: wire.id,
            name: wire.name,
            etag: wire
                .version
                .map(|version| match version {
                    Value::String(version) => version,
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            modified_time: wire.modified_time.unwrap_or(DateTime::<Utc>::MIN_UTC),
            created_time: wire.created_time,
            trashed: wire.trashed,
            mime_type: wire.mime_type,
        }
    }
}

impl Client {
    pub fn new(api_endpoint: &url::Url, auth_token: &str) -> Self {
        Self {
            endpoint: api_endpoint.as_str().trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    /// Issue a request, retrying 429 and 5xx responses with jittered
    /// exponential backoff until the attempt budget is spent.
    async fn send_with_retry<F>(&self, op: &'static str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let response = build().bearer_auth(&self.auth_token).send().await?;
            let status = response.status();

            if status.as_u16() != 429 && !status.is_server_error() {
                return Ok(response);
            }
            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                tracing::warn!(op, attempt, %status, "file service kept throttling; giving up");
                return Err(Error::RateLimited { attempts: attempt });
            }
            let delay = crate::backoff(attempt - 1);
            tracing::debug!(op, attempt, %status, ?delay, "throttled; backing off");
            tokio::time::sleep(delay).await;
        }
    }

    async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(Error::EtagMismatch);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Fetch {
            status: status.as_u16(),
            body,
        })
    }

    fn response_etag(response: &reqwest::Response) -> Option<String> {
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|raw| raw.to_str().ok())
            .map(|etag| etag.trim_matches('"').to_string())
    }

    async fn list_by_query(&self, query: &ListQuery) -> Result<Vec<FileMeta>> {
        let q = build_filter(query);
        let page_size = query.page_size.unwrap_or(1000).to_string();
        let fields = format!("files({META_FIELDS})");

        let response = self
            .send_with_retry("files.list", || {
                let mut request = self.http.get(self.url("drive/v3/files")).query(&[
                    ("q", q.as_str()),
                    ("pageSize", page_size.as_str()),
                    ("fields", fields.as_str()),
                ]);
                if let Some(order) = query.order_by {
                    request = request.query(&[("orderBy", order.as_param())]);
                }
                request
            })
            .await?;
        let listing: WireFileList = Self::expect_ok(response).await?.json().await?;

        Ok(listing.files.into_iter().map(FileMeta::from).collect())
    }

    async fn create_metadata(&self, metadata: &Value) -> Result<FileMeta> {
        let response = self
            .send_with_retry("files.create", || {
                self.http
                    .post(self.url("drive/v3/files"))
                    .query(&[("fields", META_FIELDS)])
                    .json(metadata)
            })
            .await?;
        let wire: WireFile = Self::expect_ok(response).await?.json().await?;
        Ok(wire.into())
    }
}

#[async_trait::async_trait]
impl ObjectStore for Client {
    async fn ensure_folder(&self, parent: Option<&str>, name: &str) -> Result<String> {
        // The service's root is addressable in filters under the `root`
        // alias; an unscoped listing would match same-named folders
        // anywhere in the drive.
        let query = folder_query(Some(parent.unwrap_or("root")), name);

        if let Some(winner) = least_id(self.list_by_query(&query).await?) {
            return Ok(winner.id);
        }

        let mut metadata = serde_json::json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            metadata["parents"] = serde_json::json!([parent]);
        }
        let created = self.create_metadata(&metadata).await?;

        // A concurrent peer may have created a sibling of the same name;
        // everyone settles on the lexicographically least id.
        match least_id(self.list_by_query(&query).await?) {
            Some(winner) => Ok(winner.id),
            None => Ok(created.id), // Listing lag; ours is the only candidate we know of.
        }
    }

    async fn create_empty_file(&self, parent: &str, name: &str) -> Result<FileHandle> {
        let query = ListQuery::children_of(parent).named(name).not_trashed();

        if let Some(winner) = least_id(self.list_by_query(&query).await?) {
            return Ok(FileHandle {
                id: winner.id,
                etag: winner.etag,
            });
        }

        let metadata = serde_json::json!({ "name": name, "parents": [parent] });
        let created = self.create_metadata(&metadata).await?;

        match least_id(self.list_by_query(&query).await?) {
            Some(winner) => Ok(FileHandle {
                id: winner.id,
                etag: winner.etag,
            }),
            None => Ok(FileHandle {
                id: created.id,
                etag: created.etag,
            }),
        }
    }

    async fn stat(&self, file_id: &str) -> Result<FileMeta> {
        let response = self
            .send_with_retry("files.get", || {
                self.http
                    .get(self.url(&format!("drive/v3/files/{file_id}")))
                    .query(&[("fields", META_FIELDS)])
            })
            .await?;
        let response = Self::expect_ok(response).await?;
        let header_etag = Self::response_etag(&response);
        let mut meta: FileMeta = response.json::<WireFile>().await?.into();
        if let Some(etag) = header_etag {
            meta.etag = etag;
        }
        Ok(meta)
    }

    async fn conditional_fill_if_etag(
        &self,
        file_id: &str,
        etag: &str,
        content: &Value,
    ) -> Result<FileHandle> {
        let body = media_body(content);
        let response = self
            .send_with_retry("files.update(conditional)", || {
                self.http
                    .patch(self.url(&format!("upload/drive/v3/files/{file_id}")))
                    .query(&[("uploadType", "media"), ("fields", META_FIELDS)])
                    .header(reqwest::header::IF_MATCH, format!("\"{etag}\""))
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        let response = Self::expect_ok(response).await?;
        let header_etag = Self::response_etag(&response);
        let wire: WireFile = response.json().await?;
        let meta: FileMeta = wire.into();

        Ok(FileHandle {
            id: meta.id,
            etag: header_etag.unwrap_or(meta.etag),
        })
    }

    async fn list_folder(&self, query: ListQuery) -> Result<Vec<FileMeta>> {
        self.list_by_query(&query).await
    }

    async fn download_json(&self, file_id: &str) -> Result<Value> {
        let response = self
            .send_with_retry("files.get(media)", || {
                self.http
                    .get(self.url(&format!("drive/v3/files/{file_id}")))
                    .query(&[("alt", "media")])
            })
            .await?;
        let body = Self::expect_ok(response).await?.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn upload_multipart(&self, parent: &str, name: &str, content: &Value) -> Result<String> {
        // De-duplicate by (parent, name): the service happily creates
        // sibling files of the same name, but replay of a partially
        // applied batch must rewrite instead.
        let query = ListQuery::children_of(parent).named(name).not_trashed();
        if let Some(existing) = least_id(self.list_by_query(&query).await?) {
            self.patch_media(&existing.id, content).await?;
            return Ok(existing.id);
        }

        let metadata = serde_json::json!({ "name": name, "parents": [parent] });
        let body = multipart_body(&metadata, content);

        let response = self
            .send_with_retry("files.create(multipart)", || {
                self.http
                    .post(self.url("upload/drive/v3/files"))
                    .query(&[("uploadType", "multipart"), ("fields", "id")])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
                    )
                    .body(body.clone())
            })
            .await?;

        #[derive(serde::Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created = Self::expect_ok(response).await?.json().await?;
        Ok(created.id)
    }

    async fn patch_media(&self, file_id: &str, content: &Value) -> Result<()> {
        let body = media_body(content);
        let response = self
            .send_with_retry("files.update(media)", || {
                self.http
                    .patch(self.url(&format!("upload/drive/v3/files/{file_id}")))
                    .query(&[("uploadType", "media")])
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let response = self
            .send_with_retry("files.delete", || {
                self.http
                    .delete(self.url(&format!("drive/v3/files/{file_id}")))
            })
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }
}

const MULTIPART_BOUNDARY: &str = "drivesync-boundary-7MA4YWxkTrZu0gW";

fn media_body(content: &Value) -> String {
    match content {
        Value::Null => String::new(), // Zero-byte file.
        other => other.to_string(),
    }
}

fn multipart_body(metadata: &Value, content: &Value) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: application/json\r\n\r\n{media}\r\n--{b}--",
        b = MULTIPART_BOUNDARY,
        meta = metadata,
        media = media_body(content),
    )
}

fn folder_query(parent: Option<&str>, name: &str) -> ListQuery {
    ListQuery {
        parent: parent.map(str::to_string),
        name: Some(name.to_string()),
        mime_type: Some(FOLDER_MIME.to_string()),
        trashed: Some(false),
        ..Default::default()
    }
}

fn least_id(mut listed: Vec<FileMeta>) -> Option<FileMeta> {
    listed.sort_by(|a, b| a.id.cmp(&b.id));
    listed.into_iter().next()
}

/// Render a [`ListQuery`] as the service's `q` filter expression.
fn build_filter(query: &ListQuery) -> String {
    let mut terms = Vec::new();
    if let Some(parent) = &query.parent {
        terms.push(format!("'{}' in parents", escape(parent)));
    }
    if let Some(name) = &query.name {
        terms.push(format!("name = '{}'", escape(name)));
    }
    if let Some(mime_type) = &query.mime_type {
        terms.push(format!("mimeType = '{}'", escape(mime_type)));
    }
    if let Some(trashed) = query.trashed {
        terms.push(format!("trashed = {trashed}"));
    }
    if let Some(bound) = query.modified_since {
        terms.push(format!(
            "modifiedTime >= '{}'",
            bound.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    terms.join(" and ")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
