//! Multipart upload records.
//!
//! An upload moves strictly `created -> finalizing -> done`. The state carries
//! exactly the fields that are meaningful in it, so a `created` record has a
//! parts directory and nothing else, a `finalizing` record knows whether it is
//! being committed or aborted, and a `done` record holds the durable outcome.

use crate::errors::{MpuError, MpuResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Number of leading id characters used as the parts-directory prefix.
pub const PREFIX_LEN: usize = 1;

pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_MD5: &str = "content-md5";
pub const HEADER_DURABILITY_LEVEL: &str = "durability-level";
pub const HEADER_X_DURABILITY_LEVEL: &str = "x-durability-level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizationType {
    Abort,
    Commit,
}

impl FinalizationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Commit => "commit",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "abort" => Some(Self::Abort),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// The terminal fact recorded when an upload reaches `done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Aborted,
    Committed { parts_md5_summary: String },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::Committed { .. } => "committed",
        }
    }

    pub fn finalization_type(&self) -> FinalizationType {
        match self {
            Self::Aborted => FinalizationType::Abort,
            Self::Committed { .. } => FinalizationType::Commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Created { parts_directory: String },
    Finalizing(FinalizationType),
    Done(Outcome),
}

impl UploadState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Finalizing(_) => "finalizing",
            Self::Done(_) => "done",
        }
    }
}

/// A state a conditional write may require the stored record to be in.
///
/// `done` is terminal, so it can never be the starting point of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedState {
    Created,
    Finalizing(FinalizationType),
}

impl ExpectedState {
    pub fn matches(&self, state: &UploadState) -> bool {
        match (self, state) {
            (Self::Created, UploadState::Created { .. }) => true,
            (Self::Finalizing(want), UploadState::Finalizing(have)) => want == have,
            _ => false,
        }
    }

    /// `(state, finalization_type)` column values identifying this state.
    pub fn columns(&self) -> (&'static str, Option<&'static str>) {
        match self {
            Self::Created => ("created", None),
            Self::Finalizing(kind) => ("finalizing", Some(kind.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub id: Uuid,
    /// Account that created the upload and owns the record.
    pub account: String,
    pub object_path: String,
    /// Object headers captured at creation, lower-cased keys.
    pub headers: BTreeMap<String, String>,
    pub num_copies: u32,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        account: &str,
        object_path: &str,
        headers: BTreeMap<String, String>,
        num_copies: u32,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            account: account.to_string(),
            object_path: object_path.to_string(),
            headers,
            num_copies,
            state: UploadState::Created {
                parts_directory: parts_directory_for(account, &id),
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn parts_directory(&self) -> Option<&str> {
        match &self.state {
            UploadState::Created { parts_directory } => Some(parts_directory),
            _ => None,
        }
    }

    /// Declared `content-length`, if the creator supplied one.
    pub fn declared_content_length(&self) -> MpuResult<Option<u64>> {
        self.headers
            .get(HEADER_CONTENT_LENGTH)
            .map(|value| {
                value.parse::<u64>().map_err(|_| MpuError::InvalidParameter {
                    key: HEADER_CONTENT_LENGTH.into(),
                    value: value.clone(),
                })
            })
            .transpose()
    }

    pub fn declared_content_md5(&self) -> Option<&str> {
        self.headers.get(HEADER_CONTENT_MD5).map(String::as_str)
    }

    pub fn view(&self) -> UploadView {
        let (finalization_type, result, parts_md5_summary) = match &self.state {
            UploadState::Created { .. } => (None, None, None),
            UploadState::Finalizing(kind) => (Some(*kind), None, None),
            UploadState::Done(outcome) => {
                let summary = match outcome {
                    Outcome::Committed { parts_md5_summary } => Some(parts_md5_summary.clone()),
                    Outcome::Aborted => None,
                };
                (None, Some(outcome.as_str()), summary)
            }
        };

        UploadView {
            id: self.id.to_string(),
            state: self.state.name(),
            target_object: self.object_path.clone(),
            headers: self.headers.clone(),
            num_copies: self.num_copies,
            creation_time_ms: self.created_at.timestamp_millis(),
            parts_directory: self.parts_directory().map(String::from),
            finalization_type,
            result,
            parts_md5_summary,
        }
    }
}

/// `/{account}/uploads/{prefix}/{id}`
pub fn parts_directory_for(account: &str, id: &Uuid) -> String {
    format!("/{}/uploads/{}/{}", account, id_prefix(id), id)
}

pub fn id_prefix(id: &Uuid) -> String {
    id.to_string()[..PREFIX_LEN].to_string()
}

/// Parse a client-supplied id; only canonical hyphenated UUIDs are accepted.
pub fn parse_upload_id(raw: &str) -> MpuResult<Uuid> {
    let not_found = || MpuError::ResourceNotFound(raw.to_string());
    let id = Uuid::try_parse(raw).map_err(|_| not_found())?;
    if id.hyphenated().to_string() != raw.to_ascii_lowercase() {
        return Err(not_found());
    }
    Ok(id)
}

/// Resolve the `{prefix}/{id}` pair of an upload URL.
pub fn parse_upload_location(prefix: &str, raw: &str) -> MpuResult<Uuid> {
    let id = parse_upload_id(raw)?;
    if id_prefix(&id) != prefix.to_ascii_lowercase() {
        return Err(MpuError::ResourceNotFound(raw.to_string()));
    }
    Ok(id)
}

/// JSON projection returned by `GET` on an upload; field presence follows the state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadView {
    pub id: String,
    pub state: &'static str,
    pub target_object: String,
    pub headers: BTreeMap<String, String>,
    pub num_copies: u32,
    pub creation_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts_directory: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub finalization_type: Option<FinalizationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'static str>,
    #[serde(rename = "partsMD5Summary", skip_serializing_if = "Option::is_none")]
    pub parts_md5_summary: Option<String>,
}

/// Row shape of the `uploads` table.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: String,
    pub account: String,
    pub object_path: String,
    pub headers: String,
    pub num_copies: i64,
    pub state: String,
    pub parts_directory: Option<String>,
    pub finalization_type: Option<String>,
    pub result: Option<String>,
    pub parts_md5_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRow {
    pub fn from_record(record: &UploadRecord) -> MpuResult<Self> {
        let (state, parts_directory, finalization_type, result, parts_md5_summary) =
            match &record.state {
                UploadState::Created { parts_directory } => {
                    ("created", Some(parts_directory.clone()), None, None, None)
                }
                UploadState::Finalizing(kind) => ("finalizing", None, Some(*kind), None, None),
                UploadState::Done(outcome) => {
                    let summary = match outcome {
                        Outcome::Committed { parts_md5_summary } => {
                            Some(parts_md5_summary.clone())
                        }
                        Outcome::Aborted => None,
                    };
                    (
                        "done",
                        None,
                        Some(outcome.finalization_type()),
                        Some(outcome.as_str().to_string()),
                        summary,
                    )
                }
            };

        Ok(Self {
            id: record.id.to_string(),
            account: record.account.clone(),
            object_path: record.object_path.clone(),
            headers: serde_json::to_string(&record.headers)?,
            num_copies: i64::from(record.num_copies),
            state: state.to_string(),
            parts_directory,
            finalization_type: finalization_type.map(|k| k.as_str().to_string()),
            result,
            parts_md5_summary,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = MpuError;

    fn try_from(row: UploadRow) -> MpuResult<Self> {
        let corrupt = |what: &str| MpuError::internal(format!("upload {}: corrupt {}", row.id, what));

        let kind = row
            .finalization_type
            .as_deref()
            .map(|raw| FinalizationType::parse(raw).ok_or_else(|| corrupt("finalization_type")))
            .transpose()?;

        let state = match (row.state.as_str(), kind, row.result.as_deref()) {
            ("created", None, None) => UploadState::Created {
                parts_directory: row
                    .parts_directory
                    .clone()
                    .ok_or_else(|| corrupt("parts_directory"))?,
            },
            ("finalizing", Some(kind), None) => UploadState::Finalizing(kind),
            ("done", Some(FinalizationType::Abort), Some("aborted")) => {
                UploadState::Done(Outcome::Aborted)
            }
            ("done", Some(FinalizationType::Commit), Some("committed")) => {
                UploadState::Done(Outcome::Committed {
                    parts_md5_summary: row
                        .parts_md5_summary
                        .clone()
                        .ok_or_else(|| corrupt("parts_md5_summary"))?,
                })
            }
            _ => return Err(corrupt("state")),
        };

        Ok(Self {
            id: Uuid::try_parse(&row.id).map_err(|_| corrupt("id"))?,
            headers: serde_json::from_str(&row.headers)?,
            num_copies: u32::try_from(row.num_copies).map_err(|_| corrupt("num_copies"))?,
            account: row.account,
            object_path: row.object_path,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UploadRecord {
        UploadRecord::new("alice", "/alice/stor/file.txt", BTreeMap::new(), 2)
    }

    #[test]
    fn parts_directory_ends_with_the_id() {
        let rec = record();
        let dir = rec.parts_directory().unwrap();
        assert!(dir.starts_with("/alice/uploads/"));
        assert!(dir.ends_with(&rec.id.to_string()));
        assert_eq!(
            dir,
            format!("/alice/uploads/{}/{}", id_prefix(&rec.id), rec.id)
        );
    }

    #[test]
    fn view_fields_follow_the_state() {
        let mut rec = record();

        let created = serde_json::to_value(rec.view()).unwrap();
        assert_eq!(created["state"], "created");
        assert!(created.get("partsDirectory").is_some());
        assert!(created.get("type").is_none());
        assert!(created.get("result").is_none());

        rec.state = UploadState::Finalizing(FinalizationType::Commit);
        let finalizing = serde_json::to_value(rec.view()).unwrap();
        assert_eq!(finalizing["type"], "commit");
        assert!(finalizing.get("partsDirectory").is_none());

        rec.state = UploadState::Done(Outcome::Committed {
            parts_md5_summary: "1B2M2Y8AsgTpgAmY7PhCfg==".into(),
        });
        let done = serde_json::to_value(rec.view()).unwrap();
        assert_eq!(done["result"], "committed");
        assert_eq!(done["partsMD5Summary"], "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert!(done.get("type").is_none());
        assert_eq!(done["targetObject"], "/alice/stor/file.txt");
        assert_eq!(done["numCopies"], 2);
    }

    #[test]
    fn aborted_view_has_no_summary() {
        let mut rec = record();
        rec.state = UploadState::Done(Outcome::Aborted);
        let done = serde_json::to_value(rec.view()).unwrap();
        assert_eq!(done["result"], "aborted");
        assert!(done.get("partsMD5Summary").is_none());
    }

    #[test]
    fn rows_convert_back_to_the_same_record() {
        let mut rec = record();
        rec.headers.insert("content-length".into(), "42".into());
        rec.state = UploadState::Done(Outcome::Committed {
            parts_md5_summary: "abc".into(),
        });
        let row = UploadRow::from_record(&rec).unwrap();
        assert_eq!(row.finalization_type.as_deref(), Some("commit"));
        assert_eq!(UploadRecord::try_from(row).unwrap(), rec);
    }

    #[test]
    fn inconsistent_rows_are_rejected() {
        let mut row = UploadRow::from_record(&record()).unwrap();
        row.result = Some("committed".into());
        assert!(matches!(
            UploadRecord::try_from(row),
            Err(MpuError::Internal(_))
        ));
    }

    #[test]
    fn only_canonical_ids_parse() {
        let id = Uuid::new_v4();
        assert_eq!(parse_upload_id(&id.to_string()).unwrap(), id);
        assert!(parse_upload_id("foobar").is_err());
        assert!(parse_upload_id(&id.simple().to_string()).is_err());
        assert!(parse_upload_id(&format!("{{{}}}", id)).is_err());
    }

    #[test]
    fn prefix_must_match_the_id() {
        let id = Uuid::new_v4();
        let prefix = id_prefix(&id);
        assert_eq!(parse_upload_location(&prefix, &id.to_string()).unwrap(), id);

        let wrong = if prefix == "0" { "1" } else { "0" };
        assert!(matches!(
            parse_upload_location(wrong, &id.to_string()),
            Err(MpuError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn expected_state_matches_kind_too() {
        let commit = UploadState::Finalizing(FinalizationType::Commit);
        assert!(ExpectedState::Finalizing(FinalizationType::Commit).matches(&commit));
        assert!(!ExpectedState::Finalizing(FinalizationType::Abort).matches(&commit));
        assert!(!ExpectedState::Created.matches(&commit));
    }

    #[test]
    fn declared_content_length_must_be_numeric() {
        let mut rec = record();
        assert_eq!(rec.declared_content_length().unwrap(), None);
        rec.headers.insert("content-length".into(), "17".into());
        assert_eq!(rec.declared_content_length().unwrap(), Some(17));
        rec.headers.insert("content-length".into(), "-1".into());
        assert!(rec.declared_content_length().is_err());
    }
}
