//! Processor error handling
//!
//! Typed errors for schema-aware SQL operations. Lock violations carry the
//! current remote state so callers can decide how to proceed without a
//! second round trip.

use std::time::Duration;

use thiserror::Error;

use crate::models::{SharedEntry, SharedId, SharedMetadata, Version};

/// Errors that can occur while talking to the shared schema
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The driver reported an error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A statement took longer than the read timeout
    #[error("Database did not answer within {0:?}")]
    Timeout(Duration),

    /// The schema version marker does not match this build
    #[error("Shared database uses schema version {found:?}, this build understands version {expected}")]
    SchemaVersionMismatch {
        found: Option<String>,
        expected: String,
    },

    /// Some but not all shared tables exist
    #[error("Target is not a shared database (missing tables: {missing})")]
    NotASharedDatabase { missing: String },

    /// The stored version differs from the one the writer last observed
    #[error("Entry {} was modified remotely (expected version {expected}, found {})", remote.shared_id, remote.version)]
    OptimisticLock {
        expected: Version,
        remote: Box<SharedEntry>,
    },

    /// The metadata row-set was modified by another session
    #[error("Shared metadata was modified remotely (expected version {expected}, found {})", remote.version)]
    MetadataLockViolation {
        expected: Version,
        remote: Box<SharedMetadata>,
    },

    /// The target row no longer exists
    #[error("Entry {0} is not present in the shared database")]
    EntryNotPresentRemotely(SharedId),

    /// A row with the same entry uid already exists
    #[error("Entry {} already exists in the shared database as {}", remote.uid, remote.shared_id)]
    DuplicateEntry { remote: Box<SharedEntry> },

    /// A row could not be decoded into a model
    #[error("Invalid row in shared database: {0}")]
    InvalidRow(String),
}

impl ProcessorError {
    /// Whether the error is a transient network or driver failure
    pub fn is_connectivity(&self) -> bool {
        match self {
            ProcessorError::Timeout(_) => true,
            ProcessorError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Lock violations and missing rows are routine under concurrent
    /// editing; the session itself stays usable.
    pub fn is_recoverable(&self) -> bool {
        self.is_connectivity()
            || matches!(
                self,
                ProcessorError::OptimisticLock { .. }
                    | ProcessorError::MetadataLockViolation { .. }
                    | ProcessorError::EntryNotPresentRemotely(_)
                    | ProcessorError::DuplicateEntry { .. }
            )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            ProcessorError::Timeout(_) => {
                Some("Check the network connection to the database server and try again.")
            }
            ProcessorError::SchemaVersionMismatch { .. } => {
                Some("Upgrade the client to a version that understands this shared database.")
            }
            ProcessorError::NotASharedDatabase { .. } => {
                Some("Connect to an empty database or to one created by this tool.")
            }
            ProcessorError::OptimisticLock { .. } | ProcessorError::DuplicateEntry { .. } => {
                Some("Review the remote version and decide whether to keep it or your local changes.")
            }
            ProcessorError::MetadataLockViolation { .. } => {
                Some("Pull the latest metadata and reapply your change.")
            }
            ProcessorError::EntryNotPresentRemotely(_) => {
                Some("The entry was deleted by another user. Re-add it if it is still needed.")
            }
            _ => None,
        }
    }

    /// Whether the driver reported a unique-constraint violation
    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            ProcessorError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type for processor operations
pub type ProcessorResult<T> = Result<T, ProcessorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn remote_entry() -> SharedEntry {
        SharedEntry {
            shared_id: SharedId(4),
            uid: Uuid::new_v4(),
            version: Version(2),
            entry_type: "article".to_string(),
            fields: BTreeMap::new(),
            last_modified_by: "other".to_string(),
        }
    }

    #[test]
    fn test_timeout_is_connectivity() {
        let err = ProcessorError::Timeout(Duration::from_secs(3));
        assert!(err.is_connectivity());
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_lock_violation_display() {
        let err = ProcessorError::OptimisticLock {
            expected: Version(1),
            remote: Box::new(remote_entry()),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 1"));
        assert!(msg.contains("found 2"));
        assert!(!err.is_connectivity());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let err = ProcessorError::SchemaVersionMismatch {
            found: Some("7".to_string()),
            expected: "1".to_string(),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("\"7\""));
    }

    #[test]
    fn test_row_not_found_is_not_connectivity() {
        let err = ProcessorError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_connectivity());
        assert!(!err.is_unique_violation());
    }
}
