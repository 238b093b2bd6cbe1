//! UploadService ties the gateway together for the HTTP layer.
//!
//! It owns the shared SQLite pool and storage root (used by the readiness
//! probe), the collaborator implementations, and the upload manager and
//! finalizer built on top of them. Part uploads, directory creation and
//! object reads live here because they are thin policy over the collaborators.

use crate::{
    config::UploadLimits,
    errors::{MpuError, MpuResult},
    models::{
        entry::Entry,
        part::Part,
        path::{NamespacePath, OBJECT_ROOTS},
        upload::UploadState,
    },
    services::{
        auth::{Authorizer, Caller, Capability, OwnerAuthorizer},
        finalizer::Finalizer,
        namespace::{Namespace, SqliteNamespace},
        part_store::{ByteStream, DiskPartStore, PartStore, PartUpload},
        upload_manager::{UploadManager, check_object_path},
    },
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    /// Root directory for part and object bytes.
    pub base_path: PathBuf,
    pub uploads: UploadManager,
    pub finalizer: Finalizer,
    namespace: Arc<dyn Namespace>,
    parts: Arc<dyn PartStore>,
    authorizer: Arc<dyn Authorizer>,
    limits: UploadLimits,
}

impl UploadService {
    /// Production wiring: SQLite namespace, disk part store, owner-only access.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, limits: UploadLimits) -> Self {
        let base_path = base_path.into();
        let namespace = Arc::new(SqliteNamespace::new(db.clone(), limits.dir_entry_limit));
        let parts = Arc::new(DiskPartStore::new(db.clone(), base_path.clone()));
        Self::with_collaborators(db, base_path, limits, namespace, parts, Arc::new(OwnerAuthorizer))
    }

    pub fn with_collaborators(
        db: Arc<SqlitePool>,
        base_path: PathBuf,
        limits: UploadLimits,
        namespace: Arc<dyn Namespace>,
        parts: Arc<dyn PartStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let uploads = UploadManager::new(namespace.clone(), authorizer.clone(), limits.clone());
        let finalizer = Finalizer::new(uploads.clone(), namespace.clone(), parts.clone());
        Self {
            db,
            base_path,
            uploads,
            finalizer,
            namespace,
            parts,
            authorizer,
            limits,
        }
    }

    /// Store one part of a `created` upload.
    pub async fn upload_part(
        &self,
        caller: &Caller,
        account: &str,
        id: Uuid,
        part_number: &str,
        content_length: Option<u64>,
        content_md5: Option<String>,
        body: ByteStream,
    ) -> MpuResult<Part> {
        let record = self
            .uploads
            .get(caller, account, id, Capability::Write)
            .await?;
        if !matches!(record.state, UploadState::Created { .. }) {
            return Err(MpuError::InvalidMultipartUploadState {
                id: id.to_string(),
                state: record.state.name().into(),
            });
        }

        let part_number = part_number
            .parse::<u32>()
            .ok()
            .filter(|n| (*n as usize) < self.limits.max_parts)
            .ok_or_else(|| {
                MpuError::invalid_argument(
                    id,
                    format!(
                        "part number \"{}\" must be between 0 and {}",
                        part_number,
                        self.limits.max_parts - 1
                    ),
                )
            })?;
        let content_length = content_length.ok_or(MpuError::ContentLengthRequired)?;
        if content_length > self.limits.max_part_size {
            return Err(MpuError::MaxContentLengthExceeded(self.limits.max_part_size));
        }

        let part = self
            .parts
            .put_part(
                id,
                PartUpload {
                    part_number,
                    content_length,
                    content_md5,
                },
                body,
            )
            .await?;
        debug!(upload_id = %id, part = part_number, etag = %part.etag, "part uploaded");
        Ok(part)
    }

    /// Create a directory under `stor` or `public`. Existing directories are fine.
    pub async fn mkdir(&self, caller: &Caller, raw_path: &str) -> MpuResult<Entry> {
        let path = self.resolve(caller, raw_path, Capability::Write).await?;
        if path.is_root() {
            return Err(MpuError::OperationNotAllowedOnRootDirectory {
                path: path.to_string(),
                operation: "mkdir".into(),
            });
        }
        if !path.top().is_some_and(|top| OBJECT_ROOTS.contains(&top)) {
            return Err(MpuError::InvalidResource(path.to_string()));
        }
        self.namespace.mkdir(&path).await
    }

    /// Metadata of a committed object.
    pub async fn object_metadata(&self, caller: &Caller, raw_path: &str) -> MpuResult<Entry> {
        let path = self.resolve(caller, raw_path, Capability::Read).await?;
        check_object_path(&path, "GET")?;
        let entry = self
            .namespace
            .lookup(path.as_str())
            .await?
            .ok_or_else(|| MpuError::ResourceNotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(MpuError::OperationNotAllowedOnDirectory {
                path: path.to_string(),
                operation: "GET".into(),
            });
        }
        Ok(entry)
    }

    /// Metadata plus a stream over the object bytes.
    pub async fn object_reader(
        &self,
        caller: &Caller,
        raw_path: &str,
    ) -> MpuResult<(Entry, ByteStream)> {
        let entry = self.object_metadata(caller, raw_path).await?;
        let blob = entry
            .blob
            .as_deref()
            .ok_or_else(|| MpuError::internal(format!("object {} has no blob", entry.path)))?;
        let stream = self.parts.read_blob(blob).await?;
        Ok((entry, stream))
    }

    /// Parse a path, check its account exists and that the caller may use it.
    async fn resolve(
        &self,
        caller: &Caller,
        raw_path: &str,
        capability: Capability,
    ) -> MpuResult<NamespacePath> {
        let path = NamespacePath::parse(raw_path)?;
        if let Some(account) = path.account() {
            if !self.namespace.account_exists(account).await? {
                return Err(MpuError::AccountDoesNotExist(account.to_string()));
            }
        }
        self.authorizer
            .check_access(caller, &path, capability)
            .await?;
        Ok(path)
    }
}

/// Create the root and top-level directories of each account.
pub async fn provision_accounts(namespace: &SqliteNamespace, accounts: &[String]) -> MpuResult<()> {
    for account in accounts {
        namespace.provision_account(account).await?;
        info!("account {} ready", account);
    }
    Ok(())
}
