//! The error vocabulary of the gateway.
//!
//! Every failure a client can observe is one `MpuError` variant with a stable
//! machine-readable code, an HTTP status and a human message. Collaborator
//! errors (SQLite, disk, JSON) are translated on the way in, so nothing
//! unclassified reaches the HTTP boundary.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::io;
use thiserror::Error;

pub type MpuResult<T> = Result<T, MpuError>;

#[derive(Debug, Error)]
pub enum MpuError {
    #[error("{0} does not exist")]
    AccountDoesNotExist(String),

    #[error("{login} is not allowed to access {path}")]
    AuthorizationFailed { login: String, path: String },

    #[error("Content-MD5 expected {expected}, but was {actual}")]
    ContentMd5Mismatch { expected: String, actual: String },

    #[error("{0} was being concurrently updated")]
    ConcurrentRequest(String),

    #[error("Content-Length must be >= 0")]
    ContentLengthRequired,

    #[error("{0} does not exist")]
    DirectoryDoesNotExist(String),

    #[error("{path} cannot exceed {limit} entries")]
    DirectoryLimitExceeded { path: String, limit: u64 },

    #[error("{0} already exists")]
    EntityAlreadyExists(String),

    #[error("durability-level must be between {min} and {max}")]
    InvalidDurabilityLevel { min: u32, max: u32 },

    #[error("\"{value}\" is invalid for \"{key}\"")]
    InvalidParameter { key: String, value: String },

    #[error("\"{0}\" is invalid")]
    InvalidResource(String),

    #[error("upload {id} is in state \"{state}\"")]
    InvalidMultipartUploadState { id: String, state: String },

    #[error("upload {id}: {reason}")]
    MultipartUploadInvalidArgument { id: String, reason: String },

    #[error("request has exceeded {0} bytes")]
    MaxContentLengthExceeded(u64),

    #[error("not enough free space for {0} MB")]
    NotEnoughSpace(u64),

    #[error("{path} is a directory: {operation} is not allowed")]
    OperationNotAllowedOnDirectory { path: String, operation: String },

    #[error("{operation} is not allowed on {path}")]
    OperationNotAllowedOnRootDirectory { path: String, operation: String },

    #[error("{0} is not a directory")]
    ParentNotDirectory(String),

    #[error("{0} was not found")]
    ResourceNotFound(String),

    #[error("the gateway is unable to serve this request")]
    ServiceUnavailable,

    #[error("No storage nodes available for this request")]
    StorageNodesExhausted,

    #[error("request was aborted prematurely by the client")]
    UploadAbandoned,

    /// The cause is kept for logs only; clients see the generic message.
    #[error("an unexpected error occurred")]
    Internal(String),
}

impl MpuError {
    /// Stable code rendered in the `code` field of error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountDoesNotExist(_) => "AccountDoesNotExist",
            Self::AuthorizationFailed { .. } => "AuthorizationFailed",
            Self::ContentMd5Mismatch { .. } => "ContentMD5Mismatch",
            Self::ConcurrentRequest(_) => "ConcurrentRequest",
            Self::ContentLengthRequired => "ContentLengthRequired",
            Self::DirectoryDoesNotExist(_) => "DirectoryDoesNotExist",
            Self::DirectoryLimitExceeded { .. } => "DirectoryLimitExceeded",
            Self::EntityAlreadyExists(_) => "EntityAlreadyExists",
            Self::InvalidDurabilityLevel { .. } => "InvalidDurabilityLevel",
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::InvalidResource(_) => "InvalidResource",
            Self::InvalidMultipartUploadState { .. } => "InvalidMultipartUploadState",
            Self::MultipartUploadInvalidArgument { .. } => "MultipartUploadInvalidArgument",
            Self::MaxContentLengthExceeded(_) => "MaxContentLengthExceeded",
            Self::NotEnoughSpace(_) => "NotEnoughSpace",
            Self::OperationNotAllowedOnDirectory { .. } => "OperationNotAllowedOnDirectory",
            Self::OperationNotAllowedOnRootDirectory { .. } => {
                "OperationNotAllowedOnRootDirectory"
            }
            Self::ParentNotDirectory(_) => "ParentNotDirectory",
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::StorageNodesExhausted | Self::Internal(_) => "InternalError",
            Self::UploadAbandoned => "UploadAbandoned",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AccountDoesNotExist(_) | Self::AuthorizationFailed { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::ContentMd5Mismatch { .. }
            | Self::InvalidDurabilityLevel { .. }
            | Self::InvalidParameter { .. }
            | Self::InvalidResource(_)
            | Self::MultipartUploadInvalidArgument { .. }
            | Self::OperationNotAllowedOnDirectory { .. }
            | Self::OperationNotAllowedOnRootDirectory { .. }
            | Self::ParentNotDirectory(_) => StatusCode::BAD_REQUEST,
            Self::ConcurrentRequest(_)
            | Self::DirectoryLimitExceeded { .. }
            | Self::EntityAlreadyExists(_)
            | Self::InvalidMultipartUploadState { .. } => StatusCode::CONFLICT,
            Self::ContentLengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::DirectoryDoesNotExist(_) | Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::MaxContentLengthExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotEnoughSpace(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::ServiceUnavailable | Self::StorageNodesExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // nginx's "client closed request"
            Self::UploadAbandoned => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a bounded local retry may succeed where this attempt failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable)
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::Internal(cause.into())
    }

    pub fn invalid_argument(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::MultipartUploadInvalidArgument {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for MpuError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Internal(cause) => tracing::error!(cause = %cause, "internal error"),
            other if status.is_server_error() => tracing::warn!(code = other.code(), "{}", other),
            other => tracing::debug!(code = other.code(), "{}", other),
        }

        let body = Json(ErrorBody {
            code: self.code(),
            message: self.to_string(),
        });
        let mut response = (status, body).into_response();
        if matches!(self, Self::StorageNodesExhausted) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
        }
        response
    }
}

impl From<sqlx::Error> for MpuError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::ServiceUnavailable
            }
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_ascii_lowercase();
                if message.contains("database is locked") || message.contains("busy") {
                    Self::ServiceUnavailable
                } else {
                    Self::Internal(err.to_string())
                }
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<io::Error> for MpuError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => Self::ServiceUnavailable,
            io::ErrorKind::StorageFull => Self::NotEnoughSpace(0),
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::StorageNodesExhausted
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MpuError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
