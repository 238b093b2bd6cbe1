//! Namespace and upload-record metadata backed by SQLite.
//!
//! The `uploads` table is the single synchronization point for finalization:
//! every state change is a conditional `UPDATE ... WHERE state = ?`, so any
//! number of gateway instances sharing the database agree on which caller won.

use crate::{
    errors::{MpuError, MpuResult, is_unique_violation},
    models::{
        entry::{Entry, EntryKind, NewObject},
        path::{NamespacePath, TOP_LEVEL_DIRS},
        upload::{ExpectedState, UploadRecord, UploadRow},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Executor, SqlitePool, Transaction, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict,
}

/// Result of [`Namespace::publish_object`].
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// The object and the record were both written.
    Published {
        entry: Entry,
        /// Blob of the object that was overwritten, if any.
        replaced_blob: Option<String>,
    },
    /// The record was not in the expected state; nothing was written.
    Conflict,
}

#[async_trait]
pub trait Namespace: Send + Sync {
    async fn account_exists(&self, account: &str) -> MpuResult<bool>;

    async fn lookup(&self, path: &str) -> MpuResult<Option<Entry>>;

    async fn directory_exists(&self, path: &str) -> MpuResult<bool> {
        Ok(self
            .lookup(path)
            .await?
            .is_some_and(|entry| entry.is_directory()))
    }

    /// Number of direct children of `path`.
    async fn entry_count(&self, path: &str) -> MpuResult<u64>;

    async fn mkdir(&self, path: &NamespacePath) -> MpuResult<Entry>;

    /// Atomically create or replace the object at `object.path`.
    async fn create_or_overwrite_object(&self, object: &NewObject) -> MpuResult<Entry>;

    async fn create_upload_record(&self, record: &UploadRecord) -> MpuResult<()>;

    async fn read_upload_record(&self, id: Uuid) -> MpuResult<Option<UploadRecord>>;

    /// Write `record` only if the stored record is still in `expected`.
    async fn conditional_write_upload_record(
        &self,
        record: &UploadRecord,
        expected: ExpectedState,
    ) -> MpuResult<CasOutcome>;

    /// Create or replace `object` and conditionally write `record`, atomically.
    ///
    /// Either both become visible or neither does.
    async fn publish_object(
        &self,
        object: &NewObject,
        record: &UploadRecord,
        expected: ExpectedState,
    ) -> MpuResult<PublishOutcome>;
}

pub struct SqliteNamespace {
    db: Arc<SqlitePool>,
    dir_entry_limit: u64,
}

const ENTRY_COLUMNS: &str = "path, parent, kind, account, size, content_md5, parts_md5_summary, \
                             headers, num_copies, upload_id, blob, created_at, updated_at";

const UPLOAD_COLUMNS: &str = "id, account, object_path, headers, num_copies, state, \
                              parts_directory, finalization_type, result, parts_md5_summary, \
                              created_at, updated_at";

impl SqliteNamespace {
    pub fn new(db: Arc<SqlitePool>, dir_entry_limit: u64) -> Self {
        Self {
            db,
            dir_entry_limit,
        }
    }

    /// Create `/{account}` and its top-level directories if missing.
    pub async fn provision_account(&self, account: &str) -> MpuResult<()> {
        let root = NamespacePath::parse(&format!("/{}", account))?;
        if root.depth() != 1 {
            return Err(MpuError::InvalidResource(account.to_string()));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        insert_directory(&mut *tx, root.as_str(), Some("/"), account, now).await?;
        for top in TOP_LEVEL_DIRS {
            let path = format!("{}/{}", root, top);
            insert_directory(&mut *tx, &path, Some(root.as_str()), account, now).await?;
        }
        tx.commit().await?;

        debug!("provisioned account {}", account);
        Ok(())
    }

    /// Ensure `parent` exists, is a directory and still has room for one more entry.
    async fn check_parent(&self, parent: &str) -> MpuResult<()> {
        match fetch_entry(&*self.db, parent).await? {
            None => return Err(MpuError::DirectoryDoesNotExist(parent.to_string())),
            Some(entry) if !entry.is_directory() => {
                return Err(MpuError::ParentNotDirectory(parent.to_string()));
            }
            Some(_) => {}
        }

        let count = count_children(&*self.db, parent).await?;
        if count >= self.dir_entry_limit {
            return Err(MpuError::DirectoryLimitExceeded {
                path: parent.to_string(),
                limit: self.dir_entry_limit,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Namespace for SqliteNamespace {
    async fn account_exists(&self, account: &str) -> MpuResult<bool> {
        let root = format!("/{}", account);
        Ok(fetch_entry(&*self.db, &root)
            .await?
            .is_some_and(|entry| entry.is_directory() && entry.parent.as_deref() == Some("/")))
    }

    async fn lookup(&self, path: &str) -> MpuResult<Option<Entry>> {
        fetch_entry(&*self.db, path).await
    }

    async fn entry_count(&self, path: &str) -> MpuResult<u64> {
        count_children(&*self.db, path).await
    }

    async fn mkdir(&self, path: &NamespacePath) -> MpuResult<Entry> {
        if path.is_root() {
            return Err(MpuError::OperationNotAllowedOnRootDirectory {
                path: path.to_string(),
                operation: "PUT".into(),
            });
        }
        let account = path.account().unwrap_or_default();
        let parent = path.parent().unwrap_or_else(|| "/".into());

        match fetch_entry(&*self.db, path.as_str()).await? {
            Some(entry) if entry.is_directory() => return Ok(entry),
            Some(_) => return Err(MpuError::EntityAlreadyExists(path.to_string())),
            None => {}
        }
        self.check_parent(&parent).await?;

        let now = Utc::now();
        insert_directory(&*self.db, path.as_str(), Some(&parent), account, now).await?;
        fetch_entry(&*self.db, path.as_str())
            .await?
            .ok_or_else(|| MpuError::ConcurrentRequest(path.to_string()))
    }

    async fn create_or_overwrite_object(&self, object: &NewObject) -> MpuResult<Entry> {
        let mut tx = self.db.begin().await?;
        let (entry, _) = write_object(&mut tx, object, self.dir_entry_limit).await?;
        tx.commit().await?;

        debug!(path = %entry.path, size = entry.size, "materialized object");
        Ok(entry)
    }

    async fn create_upload_record(&self, record: &UploadRecord) -> MpuResult<()> {
        let row = UploadRow::from_record(record)?;
        let result = sqlx::query(&format!(
            "INSERT INTO uploads ({UPLOAD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&row.id)
        .bind(&row.account)
        .bind(&row.object_path)
        .bind(&row.headers)
        .bind(row.num_copies)
        .bind(&row.state)
        .bind(&row.parts_directory)
        .bind(&row.finalization_type)
        .bind(&row.result)
        .bind(&row.parts_md5_summary)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(MpuError::ConcurrentRequest(record.object_path.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_upload_record(&self, id: Uuid) -> MpuResult<Option<UploadRecord>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&*self.db)
        .await?;
        row.map(UploadRecord::try_from).transpose()
    }

    async fn conditional_write_upload_record(
        &self,
        record: &UploadRecord,
        expected: ExpectedState,
    ) -> MpuResult<CasOutcome> {
        write_upload_record(&*self.db, record, expected).await
    }

    async fn publish_object(
        &self,
        object: &NewObject,
        record: &UploadRecord,
        expected: ExpectedState,
    ) -> MpuResult<PublishOutcome> {
        let mut tx = self.db.begin().await?;
        if write_upload_record(&mut *tx, record, expected).await? == CasOutcome::Conflict {
            return Ok(PublishOutcome::Conflict);
        }
        let (entry, previous) = write_object(&mut tx, object, self.dir_entry_limit).await?;
        tx.commit().await?;

        debug!(
            path = %entry.path,
            upload_id = %record.id,
            state = record.state.name(),
            "published object"
        );
        Ok(PublishOutcome::Published {
            entry,
            replaced_blob: previous.and_then(|old| old.blob),
        })
    }
}

/// Insert or overwrite the object entry, returning it and the entry it replaced.
async fn write_object(
    tx: &mut Transaction<'_, Sqlite>,
    object: &NewObject,
    dir_entry_limit: u64,
) -> MpuResult<(Entry, Option<Entry>)> {
    let path = NamespacePath::parse(&object.path)?;
    let parent = path
        .parent()
        .ok_or_else(|| MpuError::InvalidResource(object.path.clone()))?;

    match fetch_entry(&mut **tx, &parent).await? {
        None => return Err(MpuError::DirectoryDoesNotExist(parent)),
        Some(entry) if !entry.is_directory() => {
            return Err(MpuError::ParentNotDirectory(parent));
        }
        Some(_) => {}
    }
    let previous = fetch_entry(&mut **tx, path.as_str()).await?;
    match &previous {
        Some(existing) if existing.is_directory() => {
            return Err(MpuError::OperationNotAllowedOnDirectory {
                path: path.to_string(),
                operation: "PUT".into(),
            });
        }
        // Overwrites don't change the parent's entry count.
        Some(_) => {}
        None => {
            let count = count_children(&mut **tx, &parent).await?;
            if count >= dir_entry_limit {
                return Err(MpuError::DirectoryLimitExceeded {
                    path: parent,
                    limit: dir_entry_limit,
                });
            }
        }
    }

    let now = Utc::now();
    let size = i64::try_from(object.size)
        .map_err(|_| MpuError::MaxContentLengthExceeded(i64::MAX as u64))?;
    let entry = sqlx::query_as::<_, Entry>(&format!(
        r#"
        INSERT INTO entries ({ENTRY_COLUMNS})
        VALUES (?, ?, 'object', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            size = excluded.size,
            content_md5 = excluded.content_md5,
            parts_md5_summary = excluded.parts_md5_summary,
            headers = excluded.headers,
            num_copies = excluded.num_copies,
            upload_id = excluded.upload_id,
            blob = excluded.blob,
            updated_at = excluded.updated_at
        RETURNING {ENTRY_COLUMNS}
        "#
    ))
    .bind(path.as_str())
    .bind(&parent)
    .bind(&object.account)
    .bind(size)
    .bind(object.content_md5.as_deref())
    .bind(&object.parts_md5_summary)
    .bind(serde_json::to_string(&object.headers)?)
    .bind(i64::from(object.num_copies))
    .bind(object.upload_id.to_string())
    .bind(&object.blob)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok((entry, previous))
}

async fn write_upload_record<'e, E>(
    executor: E,
    record: &UploadRecord,
    expected: ExpectedState,
) -> MpuResult<CasOutcome>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = UploadRow::from_record(record)?;
    let (expected_state, expected_type) = expected.columns();

    let result = sqlx::query(
        "UPDATE uploads
         SET state = ?, parts_directory = ?, finalization_type = ?, result = ?,
             parts_md5_summary = ?, updated_at = ?
         WHERE id = ? AND state = ? AND finalization_type IS ?",
    )
    .bind(&row.state)
    .bind(&row.parts_directory)
    .bind(&row.finalization_type)
    .bind(&row.result)
    .bind(&row.parts_md5_summary)
    .bind(row.updated_at)
    .bind(&row.id)
    .bind(expected_state)
    .bind(expected_type)
    .execute(executor)
    .await?;

    Ok(if result.rows_affected() == 1 {
        CasOutcome::Applied
    } else {
        CasOutcome::Conflict
    })
}

async fn fetch_entry<'e, E>(executor: E, path: &str) -> MpuResult<Option<Entry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let entry = sqlx::query_as::<_, Entry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE path = ?"
    ))
    .bind(path)
    .fetch_optional(executor)
    .await?;
    Ok(entry)
}

async fn count_children<'e, E>(executor: E, parent: &str) -> MpuResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE parent = ?")
        .bind(parent)
        .fetch_one(executor)
        .await?;
    Ok(count.max(0) as u64)
}

async fn insert_directory<'e, E>(
    executor: E,
    path: &str,
    parent: Option<&str>,
    account: &str,
    now: chrono::DateTime<Utc>,
) -> MpuResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO entries (path, parent, kind, account, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(path) DO NOTHING",
    )
    .bind(path)
    .bind(parent)
    .bind(EntryKind::Directory)
    .bind(account)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}
