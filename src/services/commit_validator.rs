//! Validation of a client's commit part list.
//!
//! A commit names its parts by fingerprint, in order. Entry `i` of the list
//! must be the fingerprint of the part stored under number `i`; stored parts
//! past the end of the list are simply not part of the object.

use crate::{
    config::UploadLimits,
    errors::{MpuError, MpuResult},
    models::{
        part::Part,
        upload::{FinalizationType, UploadRecord, UploadState},
    },
    services::{part_store::PartStore, retry::RetryPolicy},
};
use base64::{Engine as _, engine::general_purpose};
use md5::Context;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A syntactically valid part list and its summary digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartList {
    /// Fingerprints with surrounding quotes removed.
    pub etags: Vec<String>,
    pub parts_md5_summary: String,
}

/// Everything a successful validation learned about the object.
#[derive(Debug, Clone)]
pub struct ValidatedCommit {
    pub parts: Vec<Part>,
    pub total_size: u64,
    pub parts_md5_summary: String,
    /// Digest of the assembled bytes, when the part store can compute it.
    pub content_md5: Option<String>,
}

#[derive(Clone)]
pub struct CommitValidator {
    parts: Arc<dyn PartStore>,
    max_parts: usize,
    min_part_size: u64,
    retry: RetryPolicy,
}

impl CommitValidator {
    pub fn new(parts: Arc<dyn PartStore>, limits: &UploadLimits) -> Self {
        Self {
            parts,
            max_parts: limits.max_parts,
            min_part_size: limits.min_part_size,
            retry: RetryPolicy::new(limits.backend_retries),
        }
    }

    /// Check the list's length and syntax and compute its summary digest.
    ///
    /// Needs no backend access, so it is safe to run before taking the
    /// finalization lock.
    pub fn summarize(&self, id: Uuid, fingerprints: &[String]) -> MpuResult<PartList> {
        if fingerprints.len() > self.max_parts {
            return Err(MpuError::invalid_argument(
                id,
                format!(
                    "upload contains {} parts; the maximum is {}",
                    fingerprints.len(),
                    self.max_parts
                ),
            ));
        }

        let etags = fingerprints
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                normalize_fingerprint(raw).map(String::from).ok_or_else(|| {
                    MpuError::invalid_argument(id, format!("part {} has an invalid etag \"{}\"", i, raw))
                })
            })
            .collect::<MpuResult<Vec<_>>>()?;

        let parts_md5_summary = parts_md5_summary(etags.iter().map(String::as_str));
        Ok(PartList {
            etags,
            parts_md5_summary,
        })
    }

    /// Check `list` against the stored parts and the headers declared at creation.
    pub async fn validate(&self, record: &UploadRecord, list: &PartList) -> MpuResult<ValidatedCommit> {
        match record.state {
            UploadState::Created { .. } | UploadState::Finalizing(FinalizationType::Commit) => {}
            ref other => {
                return Err(MpuError::InvalidMultipartUploadState {
                    id: record.id.to_string(),
                    state: other.name().into(),
                });
            }
        }

        let id = record.id;
        let store = &self.parts;
        let last = list.etags.len().saturating_sub(1);
        let mut parts = Vec::with_capacity(list.etags.len());
        let mut total_size: u64 = 0;

        for (i, etag) in list.etags.iter().enumerate() {
            let number = u32::try_from(i)
                .map_err(|_| MpuError::invalid_argument(id, "too many parts"))?;
            let stored = self
                .retry
                .run("part lookup", move || store.get_part(id, number))
                .await?
                .ok_or_else(|| MpuError::invalid_argument(id, format!("part {} does not exist", i)))?;

            if &stored.etag != etag {
                return Err(MpuError::invalid_argument(
                    id,
                    format!(
                        "part {} etag \"{}\" does not match the stored part",
                        i, etag
                    ),
                ));
            }
            if i != last && stored.size < self.min_part_size {
                return Err(MpuError::invalid_argument(
                    id,
                    format!(
                        "part {} is {} bytes; every part but the last must be at least {} bytes",
                        i, stored.size, self.min_part_size
                    ),
                ));
            }

            total_size += stored.size;
            parts.push(stored);
        }

        if let Some(declared) = record.declared_content_length()? {
            if declared != total_size {
                return Err(MpuError::invalid_argument(
                    id,
                    format!(
                        "content-length {} does not match the committed size {}",
                        declared, total_size
                    ),
                ));
            }
        }

        let parts_ref = parts.as_slice();
        let content_md5 = self
            .retry
            .run("content digest", move || store.content_md5(id, parts_ref))
            .await?;
        match (record.declared_content_md5(), content_md5.as_deref()) {
            (Some(declared), Some(actual)) if declared != actual => {
                return Err(MpuError::invalid_argument(
                    id,
                    format!(
                        "content-md5 \"{}\" does not match the committed content \"{}\"",
                        declared, actual
                    ),
                ));
            }
            (Some(_), None) => {
                debug!(upload_id = %id, "part store has no content digest; content-md5 not enforced");
            }
            _ => {}
        }

        Ok(ValidatedCommit {
            parts,
            total_size,
            parts_md5_summary: list.parts_md5_summary.clone(),
            content_md5,
        })
    }
}

/// Strip one pair of surrounding quotes and reject anything that can't be an etag.
pub fn normalize_fingerprint(raw: &str) -> Option<&str> {
    let etag = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    let valid = !etag.is_empty() && etag.bytes().all(|b| b.is_ascii_graphic() && b != b'"');
    valid.then_some(etag)
}

/// Base64 MD5 over the fingerprints fed in order into one digest.
pub fn parts_md5_summary<'a>(etags: impl IntoIterator<Item = &'a str>) -> String {
    let mut digest = Context::new();
    for etag in etags {
        digest.consume(etag.as_bytes());
    }
    general_purpose::STANDARD.encode(digest.compute().0)
}
