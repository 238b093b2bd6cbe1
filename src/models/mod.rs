//! Core data models for the multipart upload gateway.
//!
//! Namespace entries and upload records map to SQLite tables via
//! `sqlx::FromRow`; the upload view serializes as the JSON clients see.

pub mod entry;
pub mod part;
pub mod path;
pub mod upload;
