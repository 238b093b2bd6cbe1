//! HTTP handlers for directories and committed objects under
//! `/{account}/{stor|public}/{*path}`.
//!
//! Object bodies only enter the namespace through multipart commits, so a
//! `PUT` here must create a directory.

use super::header_string;
use crate::{
    errors::MpuError,
    models::{entry::Entry, upload::HEADER_DURABILITY_LEVEL},
    services::{auth::Caller, upload_service::UploadService},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

const DIRECTORY_CONTENT_TYPE: &str = "application/json; type=directory";

fn full_path(account: &str, top: &str, rest: &str) -> String {
    format!("/{}/{}/{}", account, top, rest)
}

/// PUT `/{account}/{top}/{*path}` with the directory content type.
pub async fn put_directory(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, top, rest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, MpuError> {
    let content_type = header_string(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if content_type.replace(' ', "") != DIRECTORY_CONTENT_TYPE.replace(' ', "") {
        return Err(MpuError::InvalidParameter {
            key: "content-type".into(),
            value: content_type,
        });
    }
    service
        .mkdir(&caller, &full_path(&account, &top, &rest))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/{account}/{top}/{*path}`, streaming the object bytes.
pub async fn get_object(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, top, rest)): Path<(String, String, String)>,
) -> Result<Response, MpuError> {
    let (entry, stream) = service
        .object_reader(&caller, &full_path(&account, &top, &rest))
        .await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &entry);
    Ok(response)
}

/// HEAD `/{account}/{top}/{*path}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<UploadService>,
    caller: Caller,
    Path((account, top, rest)): Path<(String, String, String)>,
) -> Result<Response, MpuError> {
    let entry = service
        .object_metadata(&caller, &full_path(&account, &top, &rest))
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &entry);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, entry: &Entry) {
    let declared = entry.header_map();
    let content_type = declared
        .get(header::CONTENT_TYPE.as_str())
        .cloned()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size.max(0)));

    if let Some(md5) = entry.content_md5.as_deref() {
        if let Ok(value) = HeaderValue::from_str(md5) {
            headers.insert(HeaderName::from_static("content-md5"), value);
        }
    }

    if let Some(upload_id) = entry.upload_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", upload_id)) {
            headers.insert(header::ETAG, value);
        }
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&entry.updated_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    headers.insert(
        HeaderName::from_static(HEADER_DURABILITY_LEVEL),
        HeaderValue::from(entry.num_copies),
    );
}
