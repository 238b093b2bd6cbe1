//! Commit and abort of multipart uploads.
//!
//! Both operations move a record `created -> finalizing -> done`. The first
//! step is a compare-and-set, so exactly one caller owns a finalization; every
//! other caller is classified against the state it finds:
//!
//! | found                 | commit (same parts) | commit (other parts) | abort    |
//! |-----------------------|---------------------|----------------------|----------|
//! | `done(committed)`     | success             | invalid argument     | conflict |
//! | `done(aborted)`       | conflict            | conflict             | success  |
//! | `finalizing`/`created`| concurrent request  | concurrent request   | concurrent request |
//!
//! The owner's work runs on its own task, so it reaches `done` or rolls back
//! to `created` even if the request that started it goes away. A commit
//! publishes the object and its `done` record in one transaction.

use crate::{
    errors::{MpuError, MpuResult},
    models::{
        entry::NewObject,
        upload::{
            ExpectedState, FinalizationType, Outcome, UploadRecord, UploadState,
            parts_directory_for,
        },
    },
    services::{
        auth::{Caller, Capability},
        commit_validator::{CommitValidator, PartList},
        namespace::{Namespace, PublishOutcome},
        part_store::PartStore,
        retry::RetryPolicy,
        upload_manager::{Transition, UploadManager},
    },
};
use chrono::Utc;
use std::{future::Future, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Finalizer {
    uploads: UploadManager,
    validator: CommitValidator,
    namespace: Arc<dyn Namespace>,
    parts: Arc<dyn PartStore>,
    retry: RetryPolicy,
}

impl Finalizer {
    pub fn new(
        uploads: UploadManager,
        namespace: Arc<dyn Namespace>,
        parts: Arc<dyn PartStore>,
    ) -> Self {
        let limits = uploads.limits().clone();
        Self {
            validator: CommitValidator::new(parts.clone(), &limits),
            retry: RetryPolicy::new(limits.backend_retries),
            uploads,
            namespace,
            parts,
        }
    }

    /// Commit the upload as the object made of `fingerprints`, in order.
    ///
    /// Returns the record in `done(committed)`.
    pub async fn commit(
        &self,
        caller: &Caller,
        account: &str,
        id: Uuid,
        fingerprints: &[String],
    ) -> MpuResult<UploadRecord> {
        let record = self
            .uploads
            .get(caller, account, id, Capability::Write)
            .await?;
        let list = self.validator.summarize(id, fingerprints)?;

        if !matches!(record.state, UploadState::Created { .. }) {
            return classify_commit(record, &list);
        }

        let finalizing = match self
            .uploads
            .transition(id, ExpectedState::Created, |r| {
                r.state = UploadState::Finalizing(FinalizationType::Commit)
            })
            .await?
        {
            Transition::Applied(record) => record,
            Transition::Conflict(current) => return classify_commit(current, &list),
        };

        let this = self.clone();
        run_detached(id, async move { this.finish_commit(finalizing, list).await }).await
    }

    /// Abort the upload and free its parts. Aborting an aborted upload succeeds.
    pub async fn abort(&self, caller: &Caller, account: &str, id: Uuid) -> MpuResult<UploadRecord> {
        let record = self
            .uploads
            .get(caller, account, id, Capability::Write)
            .await?;
        if !matches!(record.state, UploadState::Created { .. }) {
            return classify_abort(record);
        }

        let finalizing = match self
            .uploads
            .transition(id, ExpectedState::Created, |r| {
                r.state = UploadState::Finalizing(FinalizationType::Abort)
            })
            .await?
        {
            Transition::Applied(record) => record,
            Transition::Conflict(current) => return classify_abort(current),
        };

        let this = self.clone();
        run_detached(id, async move { this.finish_abort(finalizing).await }).await
    }

    async fn finish_commit(&self, finalizing: UploadRecord, list: PartList) -> MpuResult<UploadRecord> {
        match self.materialize(&finalizing, &list).await {
            Ok(done) => {
                info!(upload_id = %finalizing.id, parts = list.etags.len(), "upload committed");
                Ok(done)
            }
            Err(err) => {
                self.roll_back(&finalizing, FinalizationType::Commit).await;
                Err(err)
            }
        }
    }

    async fn finish_abort(&self, finalizing: UploadRecord) -> MpuResult<UploadRecord> {
        let id = finalizing.id;
        let parts = &self.parts;
        if let Err(err) = self
            .retry
            .run("discard parts", move || parts.discard(id))
            .await
        {
            self.roll_back(&finalizing, FinalizationType::Abort).await;
            return Err(err);
        }

        let finished = self
            .uploads
            .transition(
                id,
                ExpectedState::Finalizing(FinalizationType::Abort),
                |r| r.state = UploadState::Done(Outcome::Aborted),
            )
            .await;
        match finished {
            Ok(Transition::Applied(done)) => {
                info!(upload_id = %id, "upload aborted");
                Ok(done)
            }
            Ok(Transition::Conflict(current)) => Err(MpuError::internal(format!(
                "upload {} left finalizing(abort) while owned, found {}",
                id,
                current.state.name()
            ))),
            Err(err) => {
                self.roll_back(&finalizing, FinalizationType::Abort).await;
                Err(err)
            }
        }
    }

    /// Validate and assemble the parts, then publish the object together
    /// with the `done` record.
    ///
    /// Nothing is visible in the namespace unless this returns `Ok`.
    async fn materialize(&self, record: &UploadRecord, list: &PartList) -> MpuResult<UploadRecord> {
        let commit = self.validator.validate(record, list).await?;
        let id = record.id;

        let parts = &self.parts;
        let committed = commit.parts.as_slice();
        let blob = self
            .retry
            .run("assemble parts", move || parts.assemble(id, committed))
            .await?;

        let object = NewObject {
            path: record.object_path.clone(),
            account: record.account.clone(),
            size: commit.total_size,
            content_md5: commit.content_md5.clone(),
            parts_md5_summary: commit.parts_md5_summary.clone(),
            headers: record.headers.clone(),
            num_copies: record.num_copies,
            upload_id: id,
            blob: blob.clone(),
        };
        let mut done = record.clone();
        done.state = UploadState::Done(Outcome::Committed {
            parts_md5_summary: commit.parts_md5_summary.clone(),
        });
        done.updated_at = Utc::now();

        let namespace = &self.namespace;
        let (object_ref, done_ref) = (&object, &done);
        let published = self
            .retry
            .run("publish object", move || {
                namespace.publish_object(
                    object_ref,
                    done_ref,
                    ExpectedState::Finalizing(FinalizationType::Commit),
                )
            })
            .await;
        let replaced_blob = match published {
            Ok(PublishOutcome::Published { replaced_blob, .. }) => replaced_blob,
            Ok(PublishOutcome::Conflict) => {
                self.discard_blob_quietly(&blob).await;
                return Err(MpuError::internal(format!(
                    "upload {} left finalizing(commit) while owned",
                    id
                )));
            }
            Err(err) => {
                self.discard_blob_quietly(&blob).await;
                return Err(err);
            }
        };
        debug!(upload_id = %id, size = commit.total_size, object = %record.object_path, "object published");

        if let Some(old) = replaced_blob {
            if old != blob {
                self.discard_blob_quietly(&old).await;
            }
        }

        if let Err(err) = self
            .retry
            .run("discard parts", move || parts.discard(id))
            .await
        {
            warn!(upload_id = %id, "failed to free parts after commit: {}", err);
        }
        Ok(done)
    }

    /// Return an owned `finalizing` record to `created`.
    async fn roll_back(&self, record: &UploadRecord, kind: FinalizationType) {
        let parts_directory = parts_directory_for(&record.account, &record.id);
        let result = self
            .uploads
            .transition(record.id, ExpectedState::Finalizing(kind), |r| {
                r.state = UploadState::Created { parts_directory }
            })
            .await;
        match result {
            Ok(Transition::Applied(_)) => {
                warn!(upload_id = %record.id, kind = kind.as_str(), "finalization rolled back")
            }
            Ok(Transition::Conflict(current)) => error!(
                upload_id = %record.id,
                state = current.state.name(),
                "could not roll back finalization"
            ),
            Err(err) => error!(
                upload_id = %record.id,
                "could not roll back finalization: {}",
                err
            ),
        }
    }

    async fn discard_blob_quietly(&self, blob: &str) {
        let parts = &self.parts;
        if let Err(err) = self
            .retry
            .run("discard blob", move || parts.discard_blob(blob))
            .await
        {
            warn!(blob, "failed to discard blob: {}", err);
        }
    }
}

/// Run an owned finalization on its own task and wait for it.
///
/// Dropping the returned future does not cancel the task.
async fn run_detached<F>(id: Uuid, work: F) -> MpuResult<UploadRecord>
where
    F: Future<Output = MpuResult<UploadRecord>> + Send + 'static,
{
    tokio::spawn(work).await.map_err(|err| {
        MpuError::internal(format!("finalization of upload {} did not finish: {}", id, err))
    })?
}

/// Decide a commit that did not win the `created` compare-and-set.
fn classify_commit(current: UploadRecord, list: &PartList) -> MpuResult<UploadRecord> {
    match &current.state {
        UploadState::Done(Outcome::Committed { parts_md5_summary })
            if *parts_md5_summary == list.parts_md5_summary =>
        {
            debug!(upload_id = %current.id, "commit already applied");
            Ok(current)
        }
        UploadState::Done(Outcome::Committed { .. }) => Err(MpuError::invalid_argument(
            current.id,
            "already committed with a different part list",
        )),
        UploadState::Done(Outcome::Aborted) => Err(MpuError::InvalidMultipartUploadState {
            id: current.id.to_string(),
            state: "aborted".into(),
        }),
        UploadState::Finalizing(_) | UploadState::Created { .. } => {
            Err(MpuError::ConcurrentRequest(current.object_path))
        }
    }
}

/// Decide an abort that did not win the `created` compare-and-set.
fn classify_abort(current: UploadRecord) -> MpuResult<UploadRecord> {
    match &current.state {
        UploadState::Done(Outcome::Aborted) => {
            debug!(upload_id = %current.id, "abort already applied");
            Ok(current)
        }
        UploadState::Done(Outcome::Committed { .. }) => {
            Err(MpuError::InvalidMultipartUploadState {
                id: current.id.to_string(),
                state: "committed".into(),
            })
        }
        UploadState::Finalizing(_) | UploadState::Created { .. } => {
            Err(MpuError::ConcurrentRequest(current.object_path))
        }
    }
}
