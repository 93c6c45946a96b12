//! Data models for shared bibliographic databases
//!
//! A [`SharedEntry`] is a record as stored remotely; a [`LocalEntry`] is the
//! in-memory counterpart that additionally remembers the last remote version
//! it observed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned entry id, stable for the lifetime of the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedId(pub i64);

impl fmt::Display for SharedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic-lock version counter
///
/// Starts at 1 on insert and is incremented exactly once per accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub i64);

impl Version {
    /// Version assigned to freshly inserted rows
    pub const INITIAL: Version = Version(1);

    /// The version following this one
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change-log position used to ask "what changed since I last looked"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub i64);

/// Link from a local entry to its remote row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRef {
    /// Remote row id
    pub shared_id: SharedId,
    /// Last remote version this entry observed
    pub expected_version: Version,
}

/// A bibliographic record as stored in the shared database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedEntry {
    /// Server-assigned id
    pub shared_id: SharedId,
    /// Client-generated identity of the entry (unique remotely)
    pub uid: Uuid,
    /// Current remote version
    pub version: Version,
    /// Entry type (article, book, ...)
    pub entry_type: String,
    /// Field name to value, ordered by name
    pub fields: BTreeMap<String, String>,
    /// Tag of the session that committed the last write
    pub last_modified_by: String,
}

impl SharedEntry {
    /// Whether this row carries the same type and fields as `local`
    pub fn same_content(&self, local: &LocalEntry) -> bool {
        self.entry_type == local.entry_type && self.fields == local.fields
    }

    /// Build the local counterpart of this row
    pub fn to_local(&self) -> LocalEntry {
        LocalEntry {
            uid: self.uid,
            entry_type: self.entry_type.clone(),
            fields: self.fields.clone(),
            shared: Some(SharedRef {
                shared_id: self.shared_id,
                expected_version: self.version,
            }),
            dirty: false,
        }
    }
}

/// In-memory entry owned by the document model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Client-generated identity, shared with the remote row once pushed
    pub uid: Uuid,
    /// Entry type (article, book, ...)
    pub entry_type: String,
    /// Field name to value, ordered by name
    pub fields: BTreeMap<String, String>,
    /// Remote link, `None` until the entry has been pushed once
    pub shared: Option<SharedRef>,
    /// Local edits not yet accepted by the shared database
    #[serde(default)]
    pub dirty: bool,
}

impl LocalEntry {
    /// Create a new, never-shared entry
    pub fn new(entry_type: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            entry_type: entry_type.into(),
            fields: BTreeMap::new(),
            shared: None,
            dirty: true,
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Remote id, if the entry has been shared
    pub fn shared_id(&self) -> Option<SharedId> {
        self.shared.map(|s| s.shared_id)
    }

    /// Last remote version observed, if the entry has been shared
    pub fn expected_version(&self) -> Option<Version> {
        self.shared.map(|s| s.expected_version)
    }
}

/// Database-wide key/value configuration (groups, save order, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMetadata {
    /// Version of the whole row-set
    pub version: Version,
    /// Key to serialized value
    pub values: BTreeMap<String, String>,
}

impl Default for Version {
    fn default() -> Self {
        Version::INITIAL
    }
}
