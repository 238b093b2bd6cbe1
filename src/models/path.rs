//! Namespace paths of the form `/{account}/{top}/...`.

use crate::errors::{MpuError, MpuResult};
use std::fmt;

const MAX_PATH_LEN: usize = 1024;

/// Top-level directories provisioned under every account.
pub const TOP_LEVEL_DIRS: [&str; 3] = ["stor", "public", "uploads"];

/// Top-level directories that may hold user objects.
pub const OBJECT_ROOTS: [&str; 2] = ["stor", "public"];

/// A syntactically valid, normalized absolute namespace path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacePath {
    raw: String,
    segments: Vec<String>,
}

impl NamespacePath {
    /// Parse and normalize a path, rejecting anything that could escape its
    /// account or confuse the backing store.
    ///
    /// A single trailing slash is tolerated; empty, `.` and `..` segments are not.
    pub fn parse(path: &str) -> MpuResult<Self> {
        let invalid = || MpuError::InvalidResource(path.to_string());

        if !path.starts_with('/') || path.len() > MAX_PATH_LEN {
            return Err(invalid());
        }
        if path
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }

        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self {
                raw: "/".into(),
                segments: Vec::new(),
            });
        }

        let mut segments = Vec::new();
        for segment in trimmed[1..].split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(invalid());
            }
            segments.push(segment.to_string());
        }

        Ok(Self {
            raw: format!("/{}", segments.join("/")),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The owning account, `None` for `/`.
    pub fn account(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// The top-level directory name (`stor`, `public`, ...), if any.
    pub fn top(&self) -> Option<&str> {
        self.segments.get(1).map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `/` or `/{account}`.
    pub fn is_root(&self) -> bool {
        self.segments.len() <= 1
    }

    /// `/{account}/{top}`.
    pub fn is_top_level(&self) -> bool {
        self.segments.len() == 2
    }

    pub fn parent(&self) -> Option<String> {
        match self.segments.len() {
            0 => None,
            1 => Some("/".into()),
            n => Some(format!("/{}", self.segments[..n - 1].join("/"))),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_trailing_slash() {
        let p = NamespacePath::parse("/alice/stor/dir/").unwrap();
        assert_eq!(p.as_str(), "/alice/stor/dir");
        assert_eq!(p.account(), Some("alice"));
        assert_eq!(p.top(), Some("stor"));
        assert_eq!(p.parent().as_deref(), Some("/alice/stor"));
        assert_eq!(p.file_name(), Some("dir"));
    }

    #[test]
    fn classifies_root_and_top_level() {
        assert!(NamespacePath::parse("/").unwrap().is_root());
        assert!(NamespacePath::parse("/alice").unwrap().is_root());
        assert!(NamespacePath::parse("/alice/stor").unwrap().is_top_level());
        assert!(!NamespacePath::parse("/alice/stor/x").unwrap().is_top_level());
    }

    #[test]
    fn rejects_traversal_and_relative_paths() {
        for bad in ["alice/stor", "/alice/../bob", "/alice//stor", "/alice/./x", "/a\u{7}b"] {
            assert!(
                matches!(NamespacePath::parse(bad), Err(MpuError::InvalidResource(_))),
                "{bad}"
            );
        }
    }
}
