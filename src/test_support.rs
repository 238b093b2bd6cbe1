//! Fixtures shared by the unit tests.

use crate::{
    config::UploadLimits,
    errors::{MpuError, MpuResult},
    models::part::Part,
    services::{
        db,
        part_store::{ByteStream, PartStore, PartUpload},
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::{StreamExt, stream};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use tokio::sync::Notify;
use uuid::Uuid;

/// Base64 MD5 of zero bytes.
pub const ZERO_BYTE_MD5: &str = "1B2M2Y8AsgTpgAmY7PhCfg==";

/// A migrated in-memory database on a single connection.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = db::connect("sqlite::memory:", 1).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(pool)
}

/// Limits small enough to exercise from tests.
pub fn test_limits() -> UploadLimits {
    UploadLimits {
        max_parts: 4,
        min_part_size: 4,
        max_part_size: 64,
        dir_entry_limit: 100,
        backend_retries: 3,
        ..UploadLimits::default()
    }
}

pub fn body_of(bytes: &'static [u8]) -> ByteStream {
    stream::iter(vec![Ok(Bytes::from_static(bytes))]).boxed()
}

pub fn etag_of(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn content_md5_of(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(bytes).0)
}

/// Pauses the first part lookup until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// In-memory `PartStore` with knobs for failure injection.
#[derive(Default)]
pub struct MemoryParts {
    parts: Mutex<HashMap<(Uuid, u32), (Part, Bytes)>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    gate: Mutex<Option<Arc<Gate>>>,
    /// When false the store cannot supply a content digest.
    pub digests: AtomicBool,
    /// Number of upcoming lookups that fail transiently.
    pub flaky_lookups: AtomicU32,
    pub lookups: AtomicU32,
    pub fail_discard: AtomicBool,
    pub discards: AtomicU32,
}

impl MemoryParts {
    pub fn new() -> Arc<Self> {
        let parts = Self::default();
        parts.digests.store(true, Ordering::SeqCst);
        Arc::new(parts)
    }

    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Store `bytes` as part `part_number` and return its etag.
    pub fn insert(&self, upload_id: Uuid, part_number: u32, bytes: &'static [u8]) -> String {
        let part = Part {
            part_number,
            etag: etag_of(bytes),
            size: bytes.len() as u64,
        };
        let etag = part.etag.clone();
        self.parts
            .lock()
            .unwrap()
            .insert((upload_id, part_number), (part, Bytes::from_static(bytes)));
        etag
    }

    pub fn part_count(&self, upload_id: Uuid) -> usize {
        self.parts
            .lock()
            .unwrap()
            .keys()
            .filter(|(id, _)| *id == upload_id)
            .count()
    }

    pub fn blob(&self, blob: &str) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(blob).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    fn concat(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<Vec<u8>> {
        let stored = self.parts.lock().unwrap();
        let mut out = Vec::new();
        for part in parts {
            let (_, bytes) = stored
                .get(&(upload_id, part.part_number))
                .ok_or_else(|| MpuError::internal("missing part"))?;
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }
}

#[async_trait]
impl PartStore for MemoryParts {
    async fn put_part(
        &self,
        upload_id: Uuid,
        part: PartUpload,
        mut body: ByteStream,
    ) -> MpuResult<Part> {
        let mut bytes = Vec::new();
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk.map_err(|_| MpuError::UploadAbandoned)?);
        }
        let stored = Part {
            part_number: part.part_number,
            etag: etag_of(&bytes),
            size: bytes.len() as u64,
        };
        self.parts.lock().unwrap().insert(
            (upload_id, part.part_number),
            (stored.clone(), Bytes::from(bytes)),
        );
        Ok(stored)
    }

    async fn get_part(&self, upload_id: Uuid, part_number: u32) -> MpuResult<Option<Part>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .flaky_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if flaky.is_ok() {
            return Err(MpuError::ServiceUnavailable);
        }
        Ok(self
            .parts
            .lock()
            .unwrap()
            .get(&(upload_id, part_number))
            .map(|(part, _)| part.clone()))
    }

    async fn content_md5(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<Option<String>> {
        if !self.digests.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(content_md5_of(&self.concat(upload_id, parts)?)))
    }

    async fn assemble(&self, upload_id: Uuid, parts: &[Part]) -> MpuResult<String> {
        let bytes = self.concat(upload_id, parts)?;
        let blob = Uuid::new_v4().to_string();
        self.blobs
            .lock()
            .unwrap()
            .insert(blob.clone(), Bytes::from(bytes));
        Ok(blob)
    }

    async fn read_blob(&self, blob: &str) -> MpuResult<ByteStream> {
        let bytes = self
            .blob(blob)
            .ok_or_else(|| MpuError::ResourceNotFound(blob.to_string()))?;
        Ok(stream::iter(vec![Ok(bytes)]).boxed())
    }

    async fn discard_blob(&self, blob: &str) -> MpuResult<()> {
        self.blobs.lock().unwrap().remove(blob);
        Ok(())
    }

    async fn discard(&self, upload_id: Uuid) -> MpuResult<()> {
        self.discards.fetch_add(1, Ordering::SeqCst);
        if self.fail_discard.load(Ordering::SeqCst) {
            return Err(MpuError::StorageNodesExhausted);
        }
        self.parts
            .lock()
            .unwrap()
            .retain(|(id, _), _| *id != upload_id);
        Ok(())
    }
}
