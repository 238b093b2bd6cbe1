//! HTTP handlers.
//!
//! Requests arrive already authenticated: the fronting proxy puts the caller's
//! account in the `x-authenticated-account` header.

pub mod health_handlers;
pub mod namespace_handlers;
pub mod upload_handlers;

use crate::{errors::MpuError, services::auth::Caller};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::io;

pub const CALLER_HEADER: &str = "x-authenticated-account";

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = MpuError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Caller::new)
            .ok_or_else(|| MpuError::AuthorizationFailed {
                login: "anonymous".into(),
                path: parts.uri.path().to_string(),
            })
    }
}

/// Parsed `content-length`; a malformed value is treated as absent.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Adapt a request body into the byte stream the part store consumes.
fn body_stream(body: axum::body::Body) -> BoxStream<'static, io::Result<Bytes>> {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed()
}
