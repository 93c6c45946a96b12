//! Synchronizer error handling

use thiserror::Error;
use uuid::Uuid;

use super::state::SessionState;
use crate::connection::ConnectionError;
use crate::models::{LocalEntry, SharedEntry, SharedId, SharedMetadata};
use crate::shared::ProcessorError;

/// Errors returned by synchronizer operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The target holds tables that do not form a shared database
    #[error("Target is not a shared database: {0}")]
    NotASharedDatabase(String),

    /// The shared schema version is not supported by this build
    #[error("Shared database is not supported: {0}")]
    DatabaseNotSupported(ProcessorError),

    /// Operation not allowed in the current session state
    #[error("Operation requires session state {expected}, but it is {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// A push was rejected because the remote row changed first
    #[error("Entry {} was changed remotely (now at version {})", remote.shared_id, remote.version)]
    OptimisticLock {
        local: Box<LocalEntry>,
        remote: Box<SharedEntry>,
    },

    /// A metadata push was rejected because the remote row-set changed first
    #[error("Shared metadata was changed remotely (now at version {})", remote.version)]
    MetadataLock { remote: Box<SharedMetadata> },

    /// The remote row no longer exists
    #[error("Entry {0} is not present in the shared database")]
    EntryNotPresentRemotely(SharedId),

    /// No local entry with this uid
    #[error("Entry {0} not found in the library")]
    UnknownEntry(Uuid),

    /// Processor failure
    #[error(transparent)]
    Processor(ProcessorError),

    /// Connection failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<ProcessorError> for SyncError {
    fn from(error: ProcessorError) -> Self {
        match error {
            ProcessorError::NotASharedDatabase { missing } => {
                SyncError::NotASharedDatabase(format!("missing tables: {}", missing))
            }
            ProcessorError::SchemaVersionMismatch { .. } => SyncError::DatabaseNotSupported(error),
            ProcessorError::EntryNotPresentRemotely(id) => SyncError::EntryNotPresentRemotely(id),
            ProcessorError::MetadataLockViolation { remote, .. } => SyncError::MetadataLock { remote },
            other => SyncError::Processor(other),
        }
    }
}

impl SyncError {
    /// Whether the error is a transient network or driver failure
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Processor(e) => e.is_connectivity(),
            SyncError::Connection(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Check if the session stays usable after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::NotASharedDatabase(_)
            | SyncError::DatabaseNotSupported(_)
            | SyncError::InvalidState { .. } => false,
            SyncError::Processor(e) => e.is_recoverable(),
            SyncError::Connection(e) => e.is_recoverable(),
            _ => true,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::NotASharedDatabase(_) => {
                Some("Connect to an empty database or to one created by this tool.")
            }
            SyncError::DatabaseNotSupported(e) | SyncError::Processor(e) => e.recovery_suggestion(),
            SyncError::InvalidState { .. } => Some("Open a shared database first."),
            SyncError::OptimisticLock { .. } => {
                Some("Resolve the conflict by keeping either the remote or your local version.")
            }
            SyncError::MetadataLock { .. } => Some("Pull the latest changes and reapply your edit."),
            SyncError::EntryNotPresentRemotely(_) => {
                Some("The entry was deleted by another user. Re-add it if it is still needed.")
            }
            SyncError::Connection(e) => e.recovery_suggestion(),
            SyncError::UnknownEntry(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_schema_mismatch_maps_to_not_supported() {
        let err: SyncError = ProcessorError::SchemaVersionMismatch {
            found: None,
            expected: "1".to_string(),
        }
        .into();
        assert!(matches!(err, SyncError::DatabaseNotSupported(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_partial_schema_maps_to_not_shared() {
        let err: SyncError = ProcessorError::NotASharedDatabase {
            missing: "field".to_string(),
        }
        .into();
        assert!(matches!(err, SyncError::NotASharedDatabase(ref m) if m.contains("field")));
    }

    #[test]
    fn test_timeout_is_connectivity() {
        let err: SyncError = ProcessorError::Timeout(Duration::from_secs(1)).into();
        assert!(err.is_connectivity());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = SyncError::InvalidState {
            expected: SessionState::Synchronized,
            actual: SessionState::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "Operation requires session state synchronized, but it is disconnected"
        );
    }
}
