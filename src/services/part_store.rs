//! Part bytes on local disk, part metadata in SQLite.
//!
//! Layout beneath `base_path`:
//! - `staging/` for part bodies still being received
//! - `parts/{upload_id}/{part_number}.{etag}` for in-flight parts
//! - `objects/{shard}/{shard}/{blob_id}` for assembled objects
//!
//! Part files are named by content, so replacing a part never rewrites the
//! file of a part a commit has already validated. Replaced files stay until
//! the upload is discarded.

use crate::{
    errors::{MpuError, MpuResult},
    models::part::Part,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// What the client declared about a part it is sending.
#[derive(Debug, Clone)]
pub struct PartUpload {
    pub part_number: u32,
    pub content_length: u64,
    /// Base64 MD5 the client expects the bytes to have.
    pub content_md5: Option<String>,
}

#[async_trait]
pub trait PartStore: Send + Sync {
    /// Store (or replace) one part and return its fingerprint.
    async fn put_part(&self, upload_id: Uuid, part: PartUpload, body: ByteStream)
    -> MpuResult<Part>;

    async fn get_part(&self, upload_id: Uuid, part_number: u32) -> MpuResult<Option<Part>>;

    /// Base64 MD5 of the bytes `parts` would assemble into, if this store can
    /// compute it. Stores that cannot return `None`.
    async fn content_md5(&self, _upload_id: Uuid, _parts: &[Part]) -> MpuResult<Option<String>> {
        Ok(None)
    }

    /// Concatenate `parts` into a new blob and return its id.
    async fn assemble(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<String>;

    async fn read_blob(&self, blob: &str) -> MpuResult<ByteStream>;

    async fn discard_blob(&self, blob: &str) -> MpuResult<()>;

    /// Free the parts container and every part recorded for the upload.
    async fn discard(&self, upload_id: Uuid) -> MpuResult<()>;
}

pub struct DiskPartStore {
    db: Arc<SqlitePool>,
    base_path: PathBuf,
}

impl DiskPartStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    fn parts_dir(&self, upload_id: Uuid) -> PathBuf {
        self.base_path.join("parts").join(upload_id.to_string())
    }

    fn part_path(&self, upload_id: Uuid, part: &Part) -> PathBuf {
        self.parts_dir(upload_id)
            .join(format!("{}.{}", part.part_number, part.etag))
    }

    fn staging_dir(&self) -> PathBuf {
        self.base_path.join("staging")
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Generate two-level shard identifiers for a blob id.
    ///
    /// Uses MD5(blob) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn blob_shards(blob: &str) -> (String, String) {
        let digest = md5::compute(blob);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, blob: &str) -> MpuResult<PathBuf> {
        // Blob ids are generated here; anything else is a corrupt reference.
        let id = Uuid::try_parse(blob)
            .map_err(|_| MpuError::internal(format!("invalid blob reference `{}`", blob)))?;
        let (shard_a, shard_b) = Self::blob_shards(blob);
        Ok(self
            .objects_root()
            .join(shard_a)
            .join(shard_b)
            .join(id.to_string()))
    }

    async fn open_part(&self, upload_id: Uuid, part: &Part) -> MpuResult<File> {
        File::open(self.part_path(upload_id, part))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    MpuError::internal(format!(
                        "part {} of upload {} is recorded but missing on disk",
                        part.part_number, upload_id
                    ))
                } else {
                    MpuError::from(err)
                }
            })
    }

    /// Record `part` and move its staged bytes into the parts directory.
    ///
    /// Both happen inside one transaction whose insert only applies while the
    /// upload is `created`. The insert takes the database write lock, so a
    /// finalization cannot start between the state check and the rename.
    async fn record_part(&self, upload_id: Uuid, part: &Part, staged: &Path) -> MpuResult<()> {
        let size = i64::try_from(part.size)
            .map_err(|_| MpuError::MaxContentLengthExceeded(i64::MAX as u64))?;
        let mut tx = self.db.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO parts (upload_id, part_number, etag, size, created_at)
            SELECT ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM uploads WHERE id = ? AND state = 'created')
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                etag = excluded.etag,
                size = excluded.size,
                created_at = excluded.created_at
            "#,
        )
        .bind(upload_id.to_string())
        .bind(i64::from(part.part_number))
        .bind(&part.etag)
        .bind(size)
        .bind(Utc::now())
        .bind(upload_id.to_string())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let state: Option<String> = sqlx::query_scalar("SELECT state FROM uploads WHERE id = ?")
                .bind(upload_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match state {
                Some(state) => MpuError::InvalidMultipartUploadState {
                    id: upload_id.to_string(),
                    state,
                },
                None => MpuError::ResourceNotFound(upload_id.to_string()),
            });
        }

        fs::create_dir_all(self.parts_dir(upload_id)).await?;
        fs::rename(staged, self.part_path(upload_id, part)).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Stream `body` into `tmp_path`, returning `(size, md5 digest)`.
///
/// The caller removes `tmp_path` on error.
async fn write_stream(
    tmp_path: &Path,
    mut body: ByteStream,
    max_len: u64,
) -> MpuResult<(u64, md5::Digest)> {
    let mut file = File::create(tmp_path).await?;
    let mut size: u64 = 0;
    let mut digest = Context::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| {
            debug!("part body stream failed: {}", err);
            MpuError::UploadAbandoned
        })?;
        size += chunk.len() as u64;
        if size > max_len {
            return Err(MpuError::MaxContentLengthExceeded(max_len));
        }
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size, digest.compute()))
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            debug!("failed to remove {}: {}", path.display(), err);
        }
    }
}

#[async_trait]
impl PartStore for DiskPartStore {
    async fn put_part(
        &self,
        upload_id: Uuid,
        part: PartUpload,
        body: ByteStream,
    ) -> MpuResult<Part> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let tmp_path = staging.join(format!("{}-{}", upload_id, Uuid::new_v4()));

        let (size, digest) = match write_stream(&tmp_path, body, part.content_length).await {
            Ok(written) => written,
            Err(err) => {
                remove_quietly(&tmp_path).await;
                return Err(err);
            }
        };

        if let Some(expected) = part.content_md5.as_deref() {
            let actual = general_purpose::STANDARD.encode(digest.0);
            if expected != actual {
                remove_quietly(&tmp_path).await;
                return Err(MpuError::ContentMd5Mismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let stored = Part {
            part_number: part.part_number,
            etag: format!("{:x}", digest),
            size,
        };
        if let Err(err) = self.record_part(upload_id, &stored, &tmp_path).await {
            remove_quietly(&tmp_path).await;
            return Err(err);
        }

        debug!(%upload_id, part = stored.part_number, size, "stored part");
        Ok(stored)
    }

    async fn get_part(&self, upload_id: Uuid, part_number: u32) -> MpuResult<Option<Part>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT etag, size FROM parts WHERE upload_id = ? AND part_number = ?")
                .bind(upload_id.to_string())
                .bind(i64::from(part_number))
                .fetch_optional(&*self.db)
                .await?;

        Ok(row.map(|(etag, size)| Part {
            part_number,
            etag,
            size: size.max(0) as u64,
        }))
    }

    async fn content_md5(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<Option<String>> {
        let mut digest = Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        for part in parts {
            let mut file = self.open_part(upload_id, part).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
            }
        }
        Ok(Some(general_purpose::STANDARD.encode(digest.compute().0)))
    }

    async fn assemble(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<String> {
        let blob = Uuid::new_v4().to_string();
        let blob_path = self.blob_path(&blob)?;
        let parent = blob_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            MpuError::internal("blob path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result: MpuResult<()> = async {
            let mut out = File::create(&tmp_path).await?;
            for part in parts {
                let mut file = self.open_part(upload_id, part).await?;
                tokio::io::copy(&mut file, &mut out).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            fs::rename(&tmp_path, &blob_path).await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            remove_quietly(&tmp_path).await;
            return Err(err);
        }

        debug!(%upload_id, %blob, parts = parts.len(), "assembled blob");
        Ok(blob)
    }

    async fn read_blob(&self, blob: &str) -> MpuResult<ByteStream> {
        let file = File::open(self.blob_path(blob)?).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                MpuError::ResourceNotFound(blob.to_string())
            } else {
                MpuError::from(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn discard_blob(&self, blob: &str) -> MpuResult<()> {
        let path = self.blob_path(blob)?;
        remove_quietly(&path).await;
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }

    async fn discard(&self, upload_id: Uuid) -> MpuResult<()> {
        sqlx::query("DELETE FROM parts WHERE upload_id = ?")
            .bind(upload_id.to_string())
            .execute(&*self.db)
            .await?;

        let dir = self.parts_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed parts directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}
