//! HTTP handlers for multipart uploads.
//!
//! - `POST /{account}/uploads` creates an upload
//! - `GET  /{account}/uploads/{prefix}/{id}` returns its current state
//! - `PUT  /{account}/uploads/{prefix}/{id}/{part}` stores one part
//! - `POST /{account}/uploads/{prefix}/{id}/commit` and `.../abort` finalize it

use super::{body_stream, content_length, header_string};
use crate::{
    errors::MpuError,
    models::upload::{HEADER_CONTENT_MD5, parse_upload_location},
    services::{
        auth::{Capability, Caller},
        upload_manager::normalize_headers,
        upload_service::UploadService,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadBody {
    pub object_path: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    pub id: String,
    pub parts_directory: String,
}

/// Pull the part list out of a commit body.
///
/// A missing or non-array `parts`, or a non-string entry, is a malformed
/// part list rather than an empty one.
fn commit_parts(id: Uuid, body: Value) -> Result<Vec<String>, MpuError> {
    let malformed = |reason: &str| MpuError::invalid_argument(id, reason.to_string());
    let Value::Object(mut body) = body else {
        return Err(malformed("commit body must be a JSON object"));
    };
    let Some(Value::Array(parts)) = body.remove("parts") else {
        return Err(malformed("parts must be an array of etags"));
    };
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| match part {
            Value::String(etag) => Ok(etag),
            other => Err(MpuError::invalid_argument(
                id,
                format!("part {} is not an etag: {}", i, other),
            )),
        })
        .collect()
}

/// Unwrap a JSON body, reporting malformed input through the error taxonomy.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, MpuError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| MpuError::InvalidParameter {
            key: "body".into(),
            value: rejection.body_text(),
        })
}

/// `POST /{account}/uploads`
pub async fn create_upload(
    State(service): State<UploadService>,
    caller: Caller,
    Path(account): Path<String>,
    body: Result<Json<CreateUploadBody>, JsonRejection>,
) -> Result<Response, MpuError> {
    let body = json_body(body)?;
    if caller.account != account {
        return Err(MpuError::AuthorizationFailed {
            login: caller.account,
            path: format!("/{}/uploads", account),
        });
    }
    let headers = normalize_headers(body.headers)?;
    let record = service
        .uploads
        .create(&caller, &body.object_path, headers)
        .await?;

    let parts_directory = record.parts_directory().unwrap_or_default().to_string();
    let mut response = (
        StatusCode::CREATED,
        Json(CreateUploadResponse {
            id: record.id.to_string(),
            parts_directory: parts_directory.clone(),
        }),
    )
        .into_response();
    if let Ok(location) = HeaderValue::from_str(&parts_directory) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// `GET /{account}/uploads/{prefix}/{id}`
pub async fn get_upload(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, prefix, id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, MpuError> {
    let id = parse_upload_location(&prefix, &id)?;
    let record = service
        .uploads
        .get(&caller, &account, id, Capability::Read)
        .await?;
    Ok(Json(record.view()))
}

/// `PUT /{account}/uploads/{prefix}/{id}/{part}`
pub async fn upload_part(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, prefix, id, part)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, MpuError> {
    let id = parse_upload_location(&prefix, &id)?;
    let stored = service
        .upload_part(
            &caller,
            &account,
            id,
            &part,
            content_length(&headers),
            header_string(&headers, HEADER_CONTENT_MD5),
            body_stream(body),
        )
        .await?;

    // Unquoted: the header value is exactly the fingerprint a commit names.
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(etag) = HeaderValue::from_str(&stored.etag) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    Ok(response)
}

/// `POST /{account}/uploads/{prefix}/{id}/commit`
pub async fn commit_upload(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, prefix, id)): Path<(String, String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, MpuError> {
    let id = parse_upload_location(&prefix, &id)?;
    let parts = commit_parts(id, json_body(body)?)?;
    let record = service
        .finalizer
        .commit(&caller, &account, id, &parts)
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(location) = HeaderValue::from_str(&record.object_path) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// `POST /{account}/uploads/{prefix}/{id}/abort`
pub async fn abort_upload(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, prefix, id)): Path<(String, String, String)>,
) -> Result<StatusCode, MpuError> {
    let id = parse_upload_location(&prefix, &id)?;
    service.finalizer.abort(&caller, &account, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
