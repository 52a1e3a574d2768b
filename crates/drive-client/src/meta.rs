use chrono::{DateTime, Utc};

/// Metadata of a single stored file, as reported by listing and stat.
///
/// `etag` is the opaque version tag backing conditional writes. The file
/// service assigns `modified_time`; it is the only versioning signal the
/// replication core trusts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub etag: String,
    pub modified_time: DateTime<Utc>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Identity plus version of a file that was just created or rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub id: String,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// Oldest modification first, ties broken by name ascending.
    ModifiedThenName,
    /// Newest creation first.
    CreatedDesc,
}

impl OrderBy {
    pub fn as_param(&self) -> &'static str {
        match self {
            OrderBy::ModifiedThenName => "modifiedTime,name",
            OrderBy::CreatedDesc => "createdTime desc",
        }
    }
}

/// Typed listing query, mapped by each store onto its native filter syntax.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub parent: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub trashed: Option<bool>,
    /// Inclusive lower bound on `modified_time`.
    pub modified_since: Option<DateTime<Utc>>,
    pub order_by: Option<OrderBy>,
    pub page_size: Option<u32>,
}

impl ListQuery {
    pub fn children_of(parent: &str) -> Self {
        Self {
            parent: Some(parent.to_string()),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn mime(mut self, mime_type: &str) -> Self {
        self.mime_type = Some(mime_type.to_string());
        self
    }

    pub fn not_trashed(mut self) -> Self {
        self.trashed = Some(false);
        self
    }

    pub fn modified_since(mut self, bound: DateTime<Utc>) -> Self {
        self.modified_since = Some(bound);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }
}
