//! Creation, lookup and conditional state transitions of upload records.

use crate::{
    config::UploadLimits,
    errors::{MpuError, MpuResult},
    models::{
        path::{NamespacePath, OBJECT_ROOTS},
        upload::{
            ExpectedState, HEADER_CONTENT_LENGTH, HEADER_CONTENT_MD5, HEADER_DURABILITY_LEVEL,
            HEADER_X_DURABILITY_LEVEL, UploadRecord, parts_directory_for,
        },
    },
    services::{
        auth::{Authorizer, Caller, Capability},
        namespace::{CasOutcome, Namespace},
        retry::RetryPolicy,
    },
};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

/// Result of [`UploadManager::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The write went through; holds the record as written.
    Applied(UploadRecord),
    /// The stored record was not in the expected state; holds what is stored now.
    Conflict(UploadRecord),
}

#[derive(Clone)]
pub struct UploadManager {
    namespace: Arc<dyn Namespace>,
    authorizer: Arc<dyn Authorizer>,
    limits: UploadLimits,
    retry: RetryPolicy,
}

impl UploadManager {
    pub fn new(
        namespace: Arc<dyn Namespace>,
        authorizer: Arc<dyn Authorizer>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            retry: RetryPolicy::new(limits.backend_retries),
            namespace,
            authorizer,
            limits,
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Validate the target path and headers, then persist a fresh `created` record.
    pub async fn create(
        &self,
        caller: &Caller,
        object_path: &str,
        headers: BTreeMap<String, String>,
    ) -> MpuResult<UploadRecord> {
        const OPERATION: &str = "createUpload";

        let path = NamespacePath::parse(object_path)?;
        let account = path
            .account()
            .ok_or_else(|| MpuError::OperationNotAllowedOnRootDirectory {
                path: path.to_string(),
                operation: OPERATION.into(),
            })?;

        let ns = &self.namespace;
        let exists = self
            .retry
            .run("account lookup", move || ns.account_exists(account))
            .await?;
        if !exists {
            return Err(MpuError::AccountDoesNotExist(account.to_string()));
        }
        self.authorizer
            .check_access(caller, &path, Capability::Write)
            .await?;
        check_object_path(&path, OPERATION)?;

        let num_copies = self.num_copies(&headers)?;
        check_declared_headers(&headers)?;

        let target = path.as_str();
        let existing = self
            .retry
            .run("target lookup", move || ns.lookup(target))
            .await?;
        if existing.as_ref().is_some_and(|entry| entry.is_directory()) {
            return Err(MpuError::OperationNotAllowedOnDirectory {
                path: path.to_string(),
                operation: OPERATION.into(),
            });
        }

        let parent = path.parent().unwrap_or_else(|| "/".into());
        let parent_ref = parent.as_str();
        let parent_entry = self
            .retry
            .run("parent lookup", move || ns.lookup(parent_ref))
            .await?;
        match parent_entry {
            None => return Err(MpuError::DirectoryDoesNotExist(parent)),
            Some(entry) if !entry.is_directory() => {
                return Err(MpuError::ParentNotDirectory(parent));
            }
            Some(_) => {}
        }
        if existing.is_none() {
            let count = self
                .retry
                .run("entry count", move || ns.entry_count(parent_ref))
                .await?;
            if count >= self.limits.dir_entry_limit {
                return Err(MpuError::DirectoryLimitExceeded {
                    path: parent,
                    limit: self.limits.dir_entry_limit,
                });
            }
        }

        let record = UploadRecord::new(&caller.account, path.as_str(), headers, num_copies);
        let record_ref = &record;
        self.retry
            .run("create upload record", move || {
                ns.create_upload_record(record_ref)
            })
            .await?;

        info!(
            upload_id = %record.id,
            object = %record.object_path,
            num_copies,
            "created upload"
        );
        Ok(record)
    }

    /// Fetch a record the caller may act on with `capability`.
    ///
    /// Records owned by another account, or addressed under the wrong
    /// account, are reported as missing rather than forbidden.
    pub async fn get(
        &self,
        caller: &Caller,
        account: &str,
        id: Uuid,
        capability: Capability,
    ) -> MpuResult<UploadRecord> {
        let record = self.read(id).await?;
        if record.account != account {
            return Err(MpuError::ResourceNotFound(id.to_string()));
        }

        let parts_directory = NamespacePath::parse(&parts_directory_for(&record.account, &id))?;
        self.authorizer
            .check_access(caller, &parts_directory, capability)
            .await
            .map_err(|err| match err {
                MpuError::AuthorizationFailed { .. } => MpuError::ResourceNotFound(id.to_string()),
                other => other,
            })?;
        Ok(record)
    }

    /// Apply `mutate` to the record if it is currently in `from`.
    ///
    /// The write is a compare-and-set on the stored state, so of several
    /// callers racing from the same state exactly one sees `Applied`.
    pub async fn transition<F>(
        &self,
        id: Uuid,
        from: ExpectedState,
        mutate: F,
    ) -> MpuResult<Transition>
    where
        F: FnOnce(&mut UploadRecord),
    {
        let current = self.read(id).await?;
        if !from.matches(&current.state) {
            return Ok(Transition::Conflict(current));
        }

        let mut next = current.clone();
        mutate(&mut next);
        next.updated_at = Utc::now();

        let ns = &self.namespace;
        let next_ref = &next;
        let outcome = self
            .retry
            .run("conditional write", move || {
                ns.conditional_write_upload_record(next_ref, from)
            })
            .await?;

        match outcome {
            CasOutcome::Applied => {
                info!(
                    upload_id = %id,
                    from = current.state.name(),
                    state = next.state.name(),
                    "upload transitioned"
                );
                Ok(Transition::Applied(next))
            }
            CasOutcome::Conflict => {
                debug!(upload_id = %id, "lost conditional write");
                Ok(Transition::Conflict(self.read(id).await?))
            }
        }
    }

    async fn read(&self, id: Uuid) -> MpuResult<UploadRecord> {
        let ns = &self.namespace;
        self.retry
            .run("read upload record", move || ns.read_upload_record(id))
            .await?
            .ok_or_else(|| MpuError::ResourceNotFound(id.to_string()))
    }

    fn num_copies(&self, headers: &BTreeMap<String, String>) -> MpuResult<u32> {
        let raw = headers
            .get(HEADER_DURABILITY_LEVEL)
            .or_else(|| headers.get(HEADER_X_DURABILITY_LEVEL));
        let Some(raw) = raw else {
            return Ok(self.limits.default_copies);
        };

        raw.trim()
            .parse::<u32>()
            .ok()
            .filter(|n| (self.limits.min_copies..=self.limits.max_copies).contains(n))
            .ok_or(MpuError::InvalidDurabilityLevel {
                min: self.limits.min_copies,
                max: self.limits.max_copies,
            })
    }
}

/// Objects live beneath `/{account}/{stor|public}/`, never at or above it.
pub fn check_object_path(path: &NamespacePath, operation: &str) -> MpuResult<()> {
    if path.is_root() {
        return Err(MpuError::OperationNotAllowedOnRootDirectory {
            path: path.to_string(),
            operation: operation.into(),
        });
    }
    if path.is_top_level() {
        return Err(MpuError::OperationNotAllowedOnDirectory {
            path: path.to_string(),
            operation: operation.into(),
        });
    }
    match path.top() {
        Some(top) if OBJECT_ROOTS.contains(&top) => Ok(()),
        _ => Err(MpuError::InvalidResource(path.to_string())),
    }
}

/// Lower-case header names and render values as strings.
///
/// Names that only differ by case are ambiguous and rejected.
pub fn normalize_headers(raw: Map<String, Value>) -> MpuResult<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    for (key, value) in raw {
        let rendered = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(MpuError::InvalidParameter {
                    key,
                    value: other.to_string(),
                });
            }
        };
        let name = key.to_ascii_lowercase();
        if headers.contains_key(&name) {
            return Err(MpuError::InvalidParameter {
                key,
                value: format!("duplicate header {}", name),
            });
        }
        headers.insert(name, rendered);
    }
    Ok(headers)
}

fn check_declared_headers(headers: &BTreeMap<String, String>) -> MpuResult<()> {
    if let Some(value) = headers.get(HEADER_CONTENT_LENGTH) {
        if value.parse::<u64>().is_err() {
            return Err(MpuError::InvalidParameter {
                key: HEADER_CONTENT_LENGTH.into(),
                value: value.clone(),
            });
        }
    }
    if let Some(value) = headers.get(HEADER_CONTENT_MD5) {
        let decoded = general_purpose::STANDARD.decode(value);
        if !decoded.is_ok_and(|bytes| bytes.len() == 16) {
            return Err(MpuError::InvalidParameter {
                key: HEADER_CONTENT_MD5.into(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}
