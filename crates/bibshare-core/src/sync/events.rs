//! Events delivered to the document/UI layer

use serde::Serialize;

use super::state::SessionState;
use crate::models::{LocalEntry, SharedEntry, SharedMetadata, Watermark};

/// What a pull changed locally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub metadata_changed: bool,
    /// Watermark reached by the pull
    pub watermark: Watermark,
}

impl PullSummary {
    /// Whether the pull changed nothing locally
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0 && !self.metadata_changed
    }
}

/// Events emitted by the synchronizer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Session state changed
    StateChanged { state: SessionState },
    /// The shared database became unreachable
    ConnectionLost { reason: String },
    /// Entries with unpushed local edits were deleted remotely, or a push
    /// targeted a row that no longer exists
    SharedEntriesNotPresent { entries: Vec<LocalEntry> },
    /// A push was rejected because the remote row changed first
    UpdateRefused {
        local: Box<LocalEntry>,
        remote: Box<SharedEntry>,
    },
    /// A metadata push was rejected because the remote row-set changed first
    MetadataUpdateRefused {
        local: Box<SharedMetadata>,
        remote: Box<SharedMetadata>,
    },
    /// A pull or reload changed the local library
    RemoteChangesApplied { summary: PullSummary },
}
