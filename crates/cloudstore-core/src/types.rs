//! Core type definitions shared by the store and its backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object keys are '/'-delimited, hierarchy is purely lexical
pub type ObjectName = String;

/// Opaque backend-issued token used to resume a paged listing
pub type Cursor = String;

/// Default number of keys requested per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default folder boundary
pub const DEFAULT_DELIMITER: &str = "/";

/// Metadata a backend reports for one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Full object key
    pub name: ObjectName,

    /// Object size in bytes
    pub size: u64,

    /// Last-modified timestamp as reported by the backend
    pub updated: DateTime<Utc>,
}

/// Access mode requested when opening an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Content is downloaded, writes are rejected
    ReadOnly,

    /// Content is downloaded (if any) and uploaded again on close when mutated
    ReadWrite,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// One page request issued to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Keys must start with this prefix
    pub prefix: String,

    /// If set, keys below the next delimiter are rolled up into common prefixes
    pub delimiter: Option<String>,

    /// Resume after this cursor
    pub cursor: Option<Cursor>,

    /// Page size hint, backends may return fewer (or cap lower)
    pub page_size: usize,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: None,
            cursor: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of a backend listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page
    pub objects: Vec<ObjectMeta>,

    /// Native common prefixes (only when a delimiter was requested)
    pub common_prefixes: Vec<String>,

    /// Cursor for the next page, `None` when the listing is exhausted
    pub next_cursor: Option<Cursor>,
}

impl ListPage {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::ReadWrite.is_writable());
        assert!(!AccessMode::ReadOnly.is_writable());
    }

    #[test]
    fn test_list_request_defaults() {
        let req = ListRequest::new("list-test/");
        assert_eq!(req.prefix, "list-test/");
        assert_eq!(req.page_size, DEFAULT_PAGE_SIZE);
        assert!(req.delimiter.is_none());
        assert!(req.cursor.is_none());
    }

    #[test]
    fn test_object_meta_serialization() {
        let meta = ObjectMeta {
            name: "prefix/test.csv".to_string(),
            size: 42,
            updated: Utc::now(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: ObjectMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
