//! In-memory bibliographic library
//!
//! The local document model the synchronizer reconciles against. Every
//! mutation is broadcast as a [`LibraryEvent`] tagged with its
//! [`EventSource`], so edits made by the user can be told apart from
//! changes applied from the shared database.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{LocalEntry, SharedEntry, SharedId, SharedMetadata, SharedRef, Version};

/// Capacity of the change-event broadcast channel
const EVENT_CAPACITY: usize = 1024;

/// Errors raised by library operations
#[derive(Error, Debug)]
pub enum LibraryError {
    /// No entry with this uid
    #[error("Entry {0} not found")]
    UnknownEntry(Uuid),

    /// An entry with this uid is already present
    #[error("Entry {0} already exists")]
    DuplicateEntry(Uuid),

    /// Snapshot could not be serialized
    #[error("Failed to serialize library snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Snapshot could not be written
    #[error("Failed to write library snapshot to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LibraryError {
    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            LibraryError::Write { .. } => {
                Some("Check that the autosave directory exists and is writable.")
            }
            _ => None,
        }
    }
}

/// Who caused a library change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// A user edit
    Local,
    /// An undo or redo of a user edit
    Undo,
    /// A change applied from the shared database
    Shared,
}

impl EventSource {
    /// Whether changes from this source should be pushed to the shared database
    pub fn is_user(&self) -> bool {
        matches!(self, EventSource::Local | EventSource::Undo)
    }
}

/// Change notification emitted by the library
#[derive(Debug, Clone)]
pub enum LibraryEvent {
    EntryAdded { uid: Uuid, source: EventSource },
    EntryChanged { uid: Uuid, source: EventSource },
    /// Carries the removed entry so a pusher still knows its remote link
    EntryRemoved { entry: LocalEntry, source: EventSource },
    MetadataChanged { source: EventSource },
    /// Contents were replaced wholesale
    Reloaded,
}

impl LibraryEvent {
    pub fn source(&self) -> EventSource {
        match self {
            LibraryEvent::EntryAdded { source, .. }
            | LibraryEvent::EntryChanged { source, .. }
            | LibraryEvent::EntryRemoved { source, .. }
            | LibraryEvent::MetadataChanged { source } => *source,
            LibraryEvent::Reloaded => EventSource::Shared,
        }
    }
}

/// Outcome of applying one remote row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Added,
    Changed,
    Unchanged,
}

/// Outcome of applying remote metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataApplied {
    Unchanged,
    Changed,
    /// Remote values replaced unpushed local ones, returned here
    Overwrote(Box<SharedMetadata>),
}

/// What opening against a remote snapshot changed locally
#[derive(Debug)]
pub(crate) struct Reconciled {
    /// Shared entries whose rows no longer exist remotely
    pub dropped: Vec<LocalEntry>,
    pub metadata: MetadataApplied,
}

impl MetadataApplied {
    pub(crate) fn changed(&self) -> bool {
        !matches!(self, MetadataApplied::Unchanged)
    }
}

#[derive(Debug, Default)]
struct LibraryState {
    entries: BTreeMap<Uuid, LocalEntry>,
    metadata: SharedMetadata,
    metadata_dirty: bool,
}

impl LibraryState {
    fn uid_for_shared(&self, shared_id: SharedId) -> Option<Uuid> {
        self.entries
            .values()
            .find(|e| e.shared_id() == Some(shared_id))
            .map(|e| e.uid)
    }
}

/// Serialized form written by autosave and the CLI export
#[derive(Debug, Serialize)]
pub struct LibrarySnapshot {
    pub entries: Vec<LocalEntry>,
    pub metadata: SharedMetadata,
}

/// Shared handle to an in-memory library
///
/// Cloning is cheap; all clones see the same entries.
#[derive(Clone)]
pub struct Library {
    state: Arc<Mutex<LibraryState>>,
    events: broadcast::Sender<LibraryEvent>,
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

impl Library {
    /// Create an empty library
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(LibraryState::default())),
            events,
        }
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, LibraryState> {
        // A poisoned lock only means another thread panicked mid-update;
        // the map itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LibraryEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // ==================== Queries ====================

    /// All entries, ordered by uid
    pub fn entries(&self) -> Vec<LocalEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn get(&self, uid: Uuid) -> Option<LocalEntry> {
        self.lock().entries.get(&uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Entries with local edits not yet accepted remotely
    pub fn dirty_entries(&self) -> Vec<LocalEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.dirty)
            .cloned()
            .collect()
    }

    /// Entries that have never been pushed
    pub fn unshared_entries(&self) -> Vec<LocalEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.shared.is_none())
            .cloned()
            .collect()
    }

    /// Local metadata, with the remote version it was last synchronized at
    pub fn metadata(&self) -> SharedMetadata {
        self.lock().metadata.clone()
    }

    pub fn metadata_dirty(&self) -> bool {
        self.lock().metadata_dirty
    }

    // ==================== User edits ====================

    /// Add a new entry
    pub fn insert_entry(&self, entry: LocalEntry) -> Result<Uuid, LibraryError> {
        self.add(entry, EventSource::Local)
    }

    /// Put back a removed entry (undo of a removal)
    ///
    /// The old remote link is dropped; the entry is shared again by uid,
    /// adopting its row if the removal never reached the shared database.
    pub fn restore_entry(&self, mut entry: LocalEntry) -> Result<Uuid, LibraryError> {
        entry.shared = None;
        self.add(entry, EventSource::Undo)
    }

    fn add(&self, mut entry: LocalEntry, source: EventSource) -> Result<Uuid, LibraryError> {
        let uid = entry.uid;
        {
            let mut state = self.lock();
            if state.entries.contains_key(&uid) {
                return Err(LibraryError::DuplicateEntry(uid));
            }
            entry.dirty = true;
            state.entries.insert(uid, entry);
        }
        self.emit(LibraryEvent::EntryAdded { uid, source });
        Ok(uid)
    }

    /// Set a field value
    pub fn set_field(&self, uid: Uuid, name: &str, value: &str) -> Result<(), LibraryError> {
        self.edit(uid, EventSource::Local, |entry| {
            entry.fields.insert(name.to_string(), value.to_string()) != Some(value.to_string())
        })
    }

    /// Remove a field
    pub fn clear_field(&self, uid: Uuid, name: &str) -> Result<(), LibraryError> {
        self.edit(uid, EventSource::Local, |entry| entry.fields.remove(name).is_some())
    }

    /// Change the entry type
    pub fn set_entry_type(&self, uid: Uuid, entry_type: &str) -> Result<(), LibraryError> {
        self.edit(uid, EventSource::Local, |entry| {
            if entry.entry_type == entry_type {
                false
            } else {
                entry.entry_type = entry_type.to_string();
                true
            }
        })
    }

    /// Replace type and fields in one step (undo of an edit)
    pub fn revert_entry(
        &self,
        uid: Uuid,
        entry_type: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<(), LibraryError> {
        self.edit(uid, EventSource::Undo, |entry| {
            let changed = entry.entry_type != entry_type || entry.fields != fields;
            entry.entry_type = entry_type.to_string();
            entry.fields = fields;
            changed
        })
    }

    fn edit<F>(&self, uid: Uuid, source: EventSource, apply: F) -> Result<(), LibraryError>
    where
        F: FnOnce(&mut LocalEntry) -> bool,
    {
        let changed = {
            let mut state = self.lock();
            let entry = state
                .entries
                .get_mut(&uid)
                .ok_or(LibraryError::UnknownEntry(uid))?;
            let changed = apply(entry);
            if changed {
                entry.dirty = true;
            }
            changed
        };
        if changed {
            self.emit(LibraryEvent::EntryChanged { uid, source });
        }
        Ok(())
    }

    /// Remove an entry
    pub fn remove_entry(&self, uid: Uuid) -> Result<LocalEntry, LibraryError> {
        let entry = self
            .lock()
            .entries
            .remove(&uid)
            .ok_or(LibraryError::UnknownEntry(uid))?;
        self.emit(LibraryEvent::EntryRemoved {
            entry: entry.clone(),
            source: EventSource::Local,
        });
        Ok(entry)
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) {
        {
            let mut state = self.lock();
            state.metadata.values.insert(key.to_string(), value.to_string());
            state.metadata_dirty = true;
        }
        self.emit(LibraryEvent::MetadataChanged {
            source: EventSource::Local,
        });
    }

    /// Remove a metadata value
    pub fn remove_metadata(&self, key: &str) {
        let removed = {
            let mut state = self.lock();
            let removed = state.metadata.values.remove(key).is_some();
            if removed {
                state.metadata_dirty = true;
            }
            removed
        };
        if removed {
            self.emit(LibraryEvent::MetadataChanged {
                source: EventSource::Local,
            });
        }
    }

    // ==================== Synchronizer hooks ====================

    /// Overwrite the local copy of a remote row
    ///
    /// Rows at or below the version the local entry already observed are
    /// skipped so a pull never clobbers edits made after our own push.
    pub(crate) fn apply_remote(&self, remote: &SharedEntry) -> Applied {
        let applied = {
            let mut state = self.lock();
            let uid = state.uid_for_shared(remote.shared_id).unwrap_or(remote.uid);
            match state.entries.get_mut(&uid) {
                Some(local) => {
                    let seen = local
                        .shared
                        .filter(|s| s.shared_id == remote.shared_id)
                        .map(|s| s.expected_version);
                    if seen.is_some_and(|v| v >= remote.version) {
                        Applied::Unchanged
                    } else {
                        *local = remote.to_local();
                        Applied::Changed
                    }
                }
                None => {
                    state.entries.insert(remote.uid, remote.to_local());
                    Applied::Added
                }
            }
        };

        let source = EventSource::Shared;
        match applied {
            Applied::Added => self.emit(LibraryEvent::EntryAdded {
                uid: remote.uid,
                source,
            }),
            Applied::Changed => self.emit(LibraryEvent::EntryChanged {
                uid: remote.uid,
                source,
            }),
            Applied::Unchanged => {}
        }
        applied
    }

    /// Overwrite a local entry with a remote row regardless of versions
    pub(crate) fn replace_with_remote(&self, remote: &SharedEntry) {
        let existed = {
            let mut state = self.lock();
            if let Some(old) = state.uid_for_shared(remote.shared_id) {
                state.entries.remove(&old);
            }
            state.entries.insert(remote.uid, remote.to_local()).is_some()
        };
        let (uid, source) = (remote.uid, EventSource::Shared);
        if existed {
            self.emit(LibraryEvent::EntryChanged { uid, source });
        } else {
            self.emit(LibraryEvent::EntryAdded { uid, source });
        }
    }

    /// Drop the local copy of a row deleted remotely
    pub(crate) fn remove_shared(&self, shared_id: SharedId) -> Option<LocalEntry> {
        let entry = {
            let mut state = self.lock();
            let uid = state.uid_for_shared(shared_id)?;
            state.entries.remove(&uid)?
        };
        self.emit(LibraryEvent::EntryRemoved {
            entry: entry.clone(),
            source: EventSource::Shared,
        });
        Some(entry)
    }

    /// Drop a local entry without it counting as a user removal
    pub(crate) fn discard(&self, uid: Uuid) -> Option<LocalEntry> {
        let entry = self.lock().entries.remove(&uid)?;
        self.emit(LibraryEvent::EntryRemoved {
            entry: entry.clone(),
            source: EventSource::Shared,
        });
        Some(entry)
    }

    /// Record that `pushed` was accepted remotely as `shared`
    ///
    /// The entry stays dirty if it was edited again while the push was in
    /// flight. Returns false when the entry was removed in the meantime.
    #[must_use]
    pub(crate) fn mark_pushed(&self, uid: Uuid, shared: SharedRef, pushed: &LocalEntry) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(&uid) {
            Some(entry) => {
                entry.shared = Some(shared);
                entry.dirty =
                    entry.entry_type != pushed.entry_type || entry.fields != pushed.fields;
                true
            }
            None => false,
        }
    }

    /// Point a local entry at a remote row without touching its content
    pub(crate) fn relink(&self, uid: Uuid, shared: Option<SharedRef>) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(&uid) {
            entry.shared = shared;
            entry.dirty = true;
        }
    }

    /// Reconcile with a full remote snapshot on open
    ///
    /// Remote rows overwrite their local copies, shared entries missing
    /// remotely are dropped and never-shared entries are kept for pushing.
    pub(crate) fn reconcile(&self, remote: &[SharedEntry], metadata: SharedMetadata) -> Reconciled {
        let stale: Vec<SharedId> = {
            let state = self.lock();
            state
                .entries
                .values()
                .filter_map(|e| e.shared_id())
                .filter(|id| !remote.iter().any(|r| r.shared_id == *id))
                .collect()
        };
        let dropped = stale
            .into_iter()
            .filter_map(|id| self.remove_shared(id))
            .collect();
        for entry in remote {
            self.apply_remote(entry);
        }
        Reconciled {
            dropped,
            metadata: self.apply_remote_metadata(metadata),
        }
    }

    /// Discard every local entry and load a remote snapshot
    pub(crate) fn reload(&self, remote: &[SharedEntry], metadata: SharedMetadata) {
        {
            let mut state = self.lock();
            state.entries = remote.iter().map(|e| (e.uid, e.to_local())).collect();
            state.metadata = metadata;
            state.metadata_dirty = false;
        }
        debug!(entries = remote.len(), "Library reloaded from shared database");
        self.emit(LibraryEvent::Reloaded);
    }

    /// Adopt remote metadata if it is newer than what we observed
    ///
    /// Rows at or below the observed version are skipped, which covers the
    /// session's own pushes coming back through a pull. A newer row replaces
    /// unpushed local values; those are handed back so they can be reported.
    pub(crate) fn apply_remote_metadata(&self, remote: SharedMetadata) -> MetadataApplied {
        let applied = {
            let mut state = self.lock();
            if remote.version <= state.metadata.version {
                MetadataApplied::Unchanged
            } else if remote.values == state.metadata.values {
                state.metadata.version = remote.version;
                state.metadata_dirty = false;
                MetadataApplied::Unchanged
            } else {
                let previous = std::mem::replace(&mut state.metadata, remote);
                if std::mem::take(&mut state.metadata_dirty) {
                    MetadataApplied::Overwrote(Box::new(previous))
                } else {
                    MetadataApplied::Changed
                }
            }
        };
        if applied.changed() {
            self.emit(LibraryEvent::MetadataChanged {
                source: EventSource::Shared,
            });
        }
        applied
    }

    /// Record that `pushed` metadata was accepted remotely as `version`
    pub(crate) fn mark_metadata_pushed(
        &self,
        version: Version,
        pushed: &BTreeMap<String, String>,
    ) {
        let mut state = self.lock();
        state.metadata.version = version;
        state.metadata_dirty = state.metadata.values != *pushed;
    }

    // ==================== Snapshots ====================

    pub fn snapshot(&self) -> LibrarySnapshot {
        let state = self.lock();
        LibrarySnapshot {
            entries: state.entries.values().cloned().collect(),
            metadata: state.metadata.clone(),
        }
    }

    /// Pretty-printed JSON snapshot
    pub fn snapshot_json(&self) -> Result<String, LibraryError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Write a JSON snapshot atomically (temp file, then rename)
    pub fn save_snapshot(&self, path: &Path) -> Result<(), LibraryError> {
        let json = self.snapshot_json()?;
        let temp = path.with_extension("json.tmp");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LibraryError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&temp, json).map_err(|source| LibraryError::Write {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, path).map_err(|source| LibraryError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote(shared_id: i64, uid: Uuid, version: i64, title: &str) -> SharedEntry {
        SharedEntry {
            shared_id: SharedId(shared_id),
            uid,
            version: Version(version),
            entry_type: "article".to_string(),
            fields: BTreeMap::from([("title".to_string(), title.to_string())]),
            last_modified_by: "other".to_string(),
        }
    }

    #[test]
    fn test_user_edits_mark_dirty_and_emit_local_events() {
        let library = Library::new();
        let mut events = library.subscribe();

        let uid = library.insert_entry(LocalEntry::new("book")).unwrap();
        library.set_field(uid, "title", "X").unwrap();

        assert!(library.get(uid).unwrap().dirty);
        assert!(matches!(
            events.try_recv().unwrap(),
            LibraryEvent::EntryAdded { source: EventSource::Local, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            LibraryEvent::EntryChanged { source: EventSource::Local, .. }
        ));
    }

    #[test]
    fn test_undo_edits_emit_undo_events() {
        let library = Library::new();
        let uid = library
            .insert_entry(LocalEntry::new("book").with_field("title", "X"))
            .unwrap();
        library.set_entry_type(uid, "article").unwrap();
        let mut removed = library.remove_entry(uid).unwrap();
        removed.shared = Some(SharedRef {
            shared_id: SharedId(3),
            expected_version: Version(2),
        });
        let mut events = library.subscribe();

        library.restore_entry(removed).unwrap();
        library
            .revert_entry(uid, "book", BTreeMap::from([("title".to_string(), "X".to_string())]))
            .unwrap();

        let restored = library.get(uid).unwrap();
        assert_eq!(restored.entry_type, "book");
        assert!(restored.shared.is_none());
        assert!(restored.dirty);
        for _ in 0..2 {
            let event = events.try_recv().unwrap();
            assert_eq!(event.source(), EventSource::Undo);
            assert!(event.source().is_user());
        }
    }

    #[test]
    fn test_remove_metadata_marks_dirty_once() {
        let library = Library::new();
        let mut events = library.subscribe();

        library.remove_metadata("groups");
        assert!(!library.metadata_dirty());
        assert!(events.try_recv().is_err());

        library.set_metadata("groups", "all");
        library.remove_metadata("groups");
        assert!(library.metadata_dirty());
        assert!(library.metadata().values.is_empty());
        assert_eq!(events.try_recv().unwrap().source(), EventSource::Local);
        assert_eq!(events.try_recv().unwrap().source(), EventSource::Local);
    }

    #[test]
    fn test_noop_edit_emits_nothing() {
        let library = Library::new();
        let uid = library
            .insert_entry(LocalEntry::new("book").with_field("title", "X"))
            .unwrap();
        let mut events = library.subscribe();

        library.set_field(uid, "title", "X").unwrap();
        library.clear_field(uid, "missing").unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_unknown_entry() {
        let library = Library::new();
        let uid = Uuid::new_v4();
        assert!(matches!(
            library.set_field(uid, "title", "X"),
            Err(LibraryError::UnknownEntry(u)) if u == uid
        ));
        assert!(library.remove_entry(uid).is_err());
    }

    #[test]
    fn test_apply_remote_skips_versions_already_seen() {
        let library = Library::new();
        let uid = Uuid::new_v4();
        assert_eq!(library.apply_remote(&remote(1, uid, 2, "X")), Applied::Added);

        library.set_field(uid, "title", "local edit").unwrap();
        assert_eq!(library.apply_remote(&remote(1, uid, 2, "X")), Applied::Unchanged);
        assert_eq!(library.get(uid).unwrap().field("title"), Some("local edit"));

        assert_eq!(library.apply_remote(&remote(1, uid, 3, "Y")), Applied::Changed);
        let entry = library.get(uid).unwrap();
        assert_eq!(entry.field("title"), Some("Y"));
        assert_eq!(entry.expected_version(), Some(Version(3)));
        assert!(!entry.dirty);
    }

    #[test]
    fn test_shared_events_are_not_user_events() {
        let library = Library::new();
        let mut events = library.subscribe();
        library.apply_remote(&remote(1, Uuid::new_v4(), 1, "X"));

        let event = events.try_recv().unwrap();
        assert_eq!(event.source(), EventSource::Shared);
        assert!(!event.source().is_user());
    }

    #[test]
    fn test_mark_pushed_keeps_later_edits_dirty() {
        let library = Library::new();
        let uid = library
            .insert_entry(LocalEntry::new("book").with_field("title", "X"))
            .unwrap();
        let pushed = library.get(uid).unwrap();

        library.set_field(uid, "title", "edited during push").unwrap();
        let link = SharedRef {
            shared_id: SharedId(5),
            expected_version: Version::INITIAL,
        };
        assert!(library.mark_pushed(uid, link, &pushed));

        let entry = library.get(uid).unwrap();
        assert_eq!(entry.shared, Some(link));
        assert!(entry.dirty);
    }

    #[test]
    fn test_mark_pushed_reports_removed_entry() {
        let library = Library::new();
        let uid = library.insert_entry(LocalEntry::new("book")).unwrap();
        let pushed = library.remove_entry(uid).unwrap();

        let link = SharedRef {
            shared_id: SharedId(5),
            expected_version: Version::INITIAL,
        };
        assert!(!library.mark_pushed(uid, link, &pushed));
        assert!(library.get(uid).is_none());
    }

    #[test]
    fn test_reconcile_keeps_unshared_and_drops_stale() {
        let library = Library::new();
        let unshared = library.insert_entry(LocalEntry::new("misc")).unwrap();
        let stale = Uuid::new_v4();
        library.apply_remote(&remote(9, stale, 1, "old"));

        let fresh = Uuid::new_v4();
        let reconciled = library.reconcile(&[remote(1, fresh, 1, "X")], SharedMetadata::default());

        let dropped: Vec<Uuid> = reconciled.dropped.iter().map(|e| e.uid).collect();
        assert_eq!(dropped, vec![stale]);
        assert_eq!(reconciled.metadata, MetadataApplied::Unchanged);
        assert!(library.get(unshared).is_some());
        assert!(library.get(stale).is_none());
        assert!(library.get(fresh).is_some());
        assert_eq!(library.unshared_entries().len(), 1);
    }

    #[test]
    fn test_reload_discards_everything() {
        let library = Library::new();
        library.insert_entry(LocalEntry::new("misc")).unwrap();
        library.set_metadata("groups", "local");

        let uid = Uuid::new_v4();
        library.reload(&[remote(1, uid, 4, "X")], SharedMetadata::default());

        assert_eq!(library.len(), 1);
        assert!(library.get(uid).is_some());
        assert!(!library.metadata_dirty());
        assert!(library.metadata().values.is_empty());
    }

    #[test]
    fn test_metadata_push_bookkeeping() {
        let library = Library::new();
        library.set_metadata("saveOrder", "author");
        assert!(library.metadata_dirty());

        let pushed = library.metadata().values;
        library.mark_metadata_pushed(Version(2), &pushed);
        assert!(!library.metadata_dirty());
        assert_eq!(library.metadata().version, Version(2));

        let stale = SharedMetadata {
            version: Version(2),
            values: pushed.clone(),
        };
        assert_eq!(library.apply_remote_metadata(stale), MetadataApplied::Unchanged);
    }

    #[test]
    fn test_own_metadata_row_does_not_revert_later_edit() {
        let library = Library::new();
        library.set_metadata("saveOrder", "author");
        let pushed = library.metadata().values;
        library.mark_metadata_pushed(Version(2), &pushed);

        library.set_metadata("saveOrder", "year");
        let own = SharedMetadata {
            version: Version(2),
            values: pushed,
        };
        assert_eq!(library.apply_remote_metadata(own), MetadataApplied::Unchanged);

        let metadata = library.metadata();
        assert_eq!(metadata.values.get("saveOrder").map(String::as_str), Some("year"));
        assert!(library.metadata_dirty());
    }

    #[test]
    fn test_newer_metadata_over_dirty_local_hands_back_local_values() {
        let library = Library::new();
        library.set_metadata("saveOrder", "year");

        let newer = SharedMetadata {
            version: Version(3),
            values: BTreeMap::from([("saveOrder".to_string(), "author".to_string())]),
        };
        match library.apply_remote_metadata(newer) {
            MetadataApplied::Overwrote(local) => {
                assert_eq!(local.values.get("saveOrder").map(String::as_str), Some("year"));
            }
            other => panic!("expected overwrite, got {:?}", other),
        }
        assert!(!library.metadata_dirty());
        assert_eq!(library.metadata().version, Version(3));
    }

    #[test]
    fn test_save_snapshot_is_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("library.json");
        let library = Library::new();
        library
            .insert_entry(LocalEntry::new("article").with_field("title", "X"))
            .unwrap();

        library.save_snapshot(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"title\": \"X\""));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
