//! Parts of an in-flight multipart upload.

use serde::Serialize;

/// One stored part: its number, content fingerprint and size.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// Part number (0-based).
    pub part_number: u32,

    /// Lowercase hex MD5 of the part bytes.
    pub etag: String,

    /// Size in bytes.
    pub size: u64,
}
