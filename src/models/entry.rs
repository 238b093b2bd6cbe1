//! Represents a namespace entry: a directory or a committed object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    Object,
}

/// A row of the `entries` table.
///
/// Directories only use `path`, `parent`, `kind` and `account`; the remaining
/// columns describe committed objects.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Entry {
    /// Normalized absolute path (primary key).
    pub path: String,

    /// Parent directory path, `None` for `/`.
    pub parent: Option<String>,

    pub kind: EntryKind,

    /// Account owning the path.
    pub account: String,

    /// Size in bytes.
    pub size: i64,

    /// Base64 MD5 of the object bytes, when the part store could supply it.
    pub content_md5: Option<String>,

    /// Digest of the committed part fingerprints.
    pub parts_md5_summary: Option<String>,

    /// Object headers as a JSON map.
    pub headers: String,

    pub num_copies: i64,

    /// Upload that materialized this object.
    pub upload_id: Option<String>,

    /// Location of the object bytes inside the blob store.
    pub blob: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn header_map(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.headers).unwrap_or_default()
    }
}

/// Everything needed to materialize a committed upload at its target path.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub path: String,
    pub account: String,
    pub size: u64,
    pub content_md5: Option<String>,
    pub parts_md5_summary: String,
    pub headers: BTreeMap<String, String>,
    pub num_copies: u32,
    pub upload_id: Uuid,
    pub blob: String,
}
