//! Shared-database synchronizer
//!
//! Reconciles a [`Library`] with a shared database: full load on open,
//! incremental pulls driven by the foreign change listener, optimistic
//! pushes of local edits, and conflict surfacing through [`SyncEvent`]s.
//!
//! Pulls and pushes are serialized by a single session lock; the
//! processor's connection is only touched while holding it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SyncError;
use super::events::{PullSummary, SyncEvent};
use super::listener::{
    listener_for, ForeignChangeListener, ListenerHandle, ListenerSettings, ListenerSignal,
    SignalCallback,
};
use super::state::SessionState;
use crate::connection::{ConnectionError, ConnectionProperties, DatabaseConnection};
use crate::library::{Applied, Library, LibraryEvent, MetadataApplied};
use crate::models::{LocalEntry, SharedEntry, SharedMetadata, SharedRef, Version, Watermark};
use crate::shared::{Processor, ProcessorError, SchemaStatus};
use crate::tag::ProcessorTag;

/// Synchronizer behaviour
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Start a foreign change listener and pull when it fires
    pub listen_for_changes: bool,
    /// Push local library edits as they happen
    pub push_local_changes: bool,
    /// Write a JSON snapshot here after every pull that changed something
    pub autosave_path: Option<PathBuf>,
    /// Listener tuning
    pub listener: ListenerSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listen_for_changes: true,
            push_local_changes: true,
            autosave_path: None,
            listener: ListenerSettings::default(),
        }
    }
}

/// How to settle a refused push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local entry with the current remote row
    KeepRemote,
    /// Push the local entry over the remote row seen at `remote_version`
    KeepLocal { remote_version: Version },
}

struct Session {
    processor: Processor,
    watermark: Watermark,
}

#[derive(Default)]
struct Background {
    listener: Option<ListenerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Background {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    library: Library,
    settings: SyncSettings,
    session: Mutex<Option<Session>>,
    state: watch::Sender<SessionState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    background: std::sync::Mutex<Background>,
    connection_lost: AtomicBool,
}

/// Keeps a library in sync with one shared database session
///
/// Cloning is cheap; clones drive the same session.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    /// Create a synchronizer for `library`; no session is open yet
    pub fn new(library: Library, settings: SyncSettings) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                library,
                settings,
                session: Mutex::new(None),
                state,
                event_tx,
                event_rx: std::sync::Mutex::new(Some(event_rx)),
                background: std::sync::Mutex::new(Background::default()),
                connection_lost: AtomicBool::new(false),
            }),
        }
    }

    /// The library being synchronized
    pub fn library(&self) -> &Library {
        &self.inner.library
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to session state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Watermark of the last pull, if a session is open
    pub async fn watermark(&self) -> Option<Watermark> {
        self.inner.session.lock().await.as_ref().map(|s| s.watermark)
    }

    // ==================== Session lifecycle ====================

    /// Open a session on `conn`
    ///
    /// Creates the schema on an empty database, checks the schema version,
    /// loads every entry, pushes local entries that were never shared and
    /// starts the background listener and pusher as configured. Waiting for
    /// a running operation to finish is bounded by the connect timeout.
    pub async fn open_shared_database(&self, conn: DatabaseConnection) -> Result<(), SyncError> {
        let limit = conn.timeouts().connect;
        let mut guard = match tokio::time::timeout(limit, self.inner.session.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                let target = conn.properties().display_target();
                warn!(target = %target, "Timed out waiting for the running session operation");
                conn.close().await;
                return Err(ConnectionError::Timeout {
                    target,
                    timeout: limit,
                }
                .into());
            }
        };
        if guard.is_some() {
            return Err(SyncError::InvalidState {
                expected: SessionState::Disconnected,
                actual: self.state(),
            });
        }

        self.set_state(SessionState::Connecting);
        let properties = conn.properties().clone();
        let mut processor = Processor::new(conn, ProcessorTag::generate());

        let watermark = match self.load_initial(&mut processor).await {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!(target = %properties.display_target(), error = %e, "Failed to open shared database");
                processor.close().await;
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        let tag = processor.tag().clone();
        let mut session = Session {
            processor,
            watermark,
        };
        for entry in self.inner.library.unshared_entries() {
            if let Err(e) = self.push_entry(&mut session, entry.uid).await {
                warn!(uid = %entry.uid, error = %e, "Could not share local entry");
            }
        }
        *guard = Some(session);
        drop(guard);

        self.inner.connection_lost.store(false, Ordering::SeqCst);
        self.start_background(&properties, tag, watermark);
        self.set_state(SessionState::Synchronized);
        self.autosave();

        info!(
            target = %properties.display_target(),
            entries = self.inner.library.len(),
            "Opened shared database"
        );
        Ok(())
    }

    async fn load_initial(&self, processor: &mut Processor) -> Result<Watermark, SyncError> {
        match processor.schema_status().await? {
            SchemaStatus::Absent => processor.initialize_schema_if_absent().await?,
            SchemaStatus::Foreign(missing) => {
                return Err(SyncError::NotASharedDatabase(format!(
                    "missing tables: {}",
                    missing.join(", ")
                )))
            }
            SchemaStatus::Present => {}
        }
        processor.check_schema_compatibility().await?;

        // Read before the snapshot so nothing committed in between is skipped
        let watermark = processor.current_watermark().await?;
        let entries = processor.read_all_entries().await?;
        let metadata = processor.read_metadata().await?;
        let reconciled = self.inner.library.reconcile(&entries, metadata);

        if !reconciled.dropped.is_empty() {
            warn!(
                count = reconciled.dropped.len(),
                "Shared entries were deleted remotely while the library was offline"
            );
            self.emit(SyncEvent::SharedEntriesNotPresent {
                entries: reconciled.dropped,
            });
        }
        if let MetadataApplied::Overwrote(local) = reconciled.metadata {
            self.report_metadata_overwritten(local);
        }
        Ok(watermark)
    }

    fn start_background(&self, properties: &ConnectionProperties, tag: ProcessorTag, since: Watermark) {
        let settings = &self.inner.settings;
        let mut background = self.background();

        if settings.listen_for_changes {
            let (signal_tx, signal_rx) = mpsc::unbounded_channel();
            let callback: SignalCallback = Arc::new(move |signal| {
                let _ = signal_tx.send(signal);
            });
            let listener = listener_for(properties, tag, since, settings.listener.clone());
            background.listener = Some(listener.start(callback));
            background
                .tasks
                .push(tokio::spawn(run_pull_driver(Arc::downgrade(&self.inner), signal_rx)));
        }

        if settings.push_local_changes {
            let events = self.inner.library.subscribe();
            background
                .tasks
                .push(tokio::spawn(run_push_driver(Arc::downgrade(&self.inner), events)));
        }
    }

    /// Stop the listener, release the connection and go to `Disconnected`
    ///
    /// Idempotent. No listener-driven pull runs after this returns.
    pub async fn close_shared_database(&self) {
        let (listener, tasks) = {
            let mut background = self.background();
            (
                background.listener.take(),
                std::mem::take(&mut background.tasks),
            )
        };
        if let Some(listener) = listener {
            listener.stop().await;
        }
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            session.processor.close().await;
            info!("Closed shared database");
        }
        self.set_state(SessionState::Disconnected);
    }

    // ==================== Pull ====================

    /// Apply everything committed since the last pull
    ///
    /// Remote state wins: changed rows overwrite their local copies. Entries
    /// deleted remotely are dropped; those with unpushed edits are reported
    /// through [`SyncEvent::SharedEntriesNotPresent`].
    pub async fn pull_changes(&self) -> Result<PullSummary, SyncError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pulling);
        let result = self.pull_locked(session).await;
        self.set_state(SessionState::Synchronized);
        drop(guard);

        let summary = self.observe(result)?;
        if !summary.is_empty() {
            self.autosave();
        }
        Ok(summary)
    }

    async fn pull_locked(&self, session: &mut Session) -> Result<PullSummary, SyncError> {
        let batch = session
            .processor
            .fetch_changed_since(session.watermark)
            .await?;
        let library = &self.inner.library;

        let mut summary = PullSummary {
            watermark: batch.watermark,
            ..PullSummary::default()
        };
        for remote in &batch.entries {
            match library.apply_remote(remote) {
                Applied::Added => summary.added += 1,
                Applied::Changed => summary.updated += 1,
                Applied::Unchanged => {}
            }
        }

        let mut not_present = Vec::new();
        for shared_id in &batch.removed {
            if let Some(entry) = library.remove_shared(*shared_id) {
                summary.removed += 1;
                if entry.dirty {
                    not_present.push(entry);
                }
            }
        }

        if let Some(metadata) = batch.metadata {
            let applied = library.apply_remote_metadata(metadata);
            summary.metadata_changed = applied.changed();
            if let MetadataApplied::Overwrote(local) = applied {
                self.report_metadata_overwritten(local);
            }
        }
        session.watermark = batch.watermark;

        if !not_present.is_empty() {
            warn!(count = not_present.len(), "Entries with local edits were deleted remotely");
            self.emit(SyncEvent::SharedEntriesNotPresent {
                entries: not_present,
            });
        }
        if !summary.is_empty() {
            debug!(?summary, "Applied remote changes");
            self.emit(SyncEvent::RemoteChangesApplied { summary });
        }
        Ok(summary)
    }

    /// Discard all local state and reload everything from the shared database
    pub async fn synchronize_local_database(&self) -> Result<PullSummary, SyncError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pulling);
        let result = self.reload_locked(session).await;
        self.set_state(SessionState::Synchronized);
        drop(guard);

        let summary = self.observe(result)?;
        self.autosave();
        Ok(summary)
    }

    async fn reload_locked(&self, session: &mut Session) -> Result<PullSummary, SyncError> {
        let processor = &mut session.processor;
        let watermark = processor.current_watermark().await?;
        let entries = processor.read_all_entries().await?;
        let metadata = processor.read_metadata().await?;

        self.inner.library.reload(&entries, metadata);
        session.watermark = watermark;

        let summary = PullSummary {
            added: entries.len(),
            metadata_changed: true,
            watermark,
            ..PullSummary::default()
        };
        self.emit(SyncEvent::RemoteChangesApplied { summary });
        Ok(summary)
    }

    // ==================== Push ====================

    /// Push the current local state of one entry
    ///
    /// Inserts never-shared entries and conditionally updates shared ones.
    /// On success the entry's expected version becomes the returned one. A
    /// refused push leaves local data untouched and emits
    /// [`SyncEvent::UpdateRefused`].
    pub async fn synchronize_shared_entry(&self, uid: Uuid) -> Result<SharedRef, SyncError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pushing);
        let result = self.push_entry(session, uid).await;
        self.set_state(SessionState::Synchronized);
        drop(guard);

        self.observe(result)
    }

    async fn push_entry(&self, session: &mut Session, uid: Uuid) -> Result<SharedRef, SyncError> {
        let library = &self.inner.library;
        let local = library.get(uid).ok_or(SyncError::UnknownEntry(uid))?;

        let shared = match local.shared {
            Some(shared) if !local.dirty => return Ok(shared),
            Some(shared) => self.push_update(session, &local, shared).await?,
            None => self.push_insert(session, &local).await?,
        };

        if !library.mark_pushed(uid, shared, &local) {
            // Removed while the push was in flight; the removal event did not
            // know about this row yet
            debug!(uid = %uid, shared_id = %shared.shared_id, "Deleting row of entry removed during push");
            session
                .processor
                .delete_entry(shared.shared_id, shared.expected_version)
                .await?;
            return Err(SyncError::UnknownEntry(uid));
        }
        Ok(shared)
    }

    async fn push_insert(&self, session: &mut Session, local: &LocalEntry) -> Result<SharedRef, SyncError> {
        match session.processor.insert_entry(local).await {
            Ok(shared_id) => Ok(SharedRef {
                shared_id,
                expected_version: Version::INITIAL,
            }),
            Err(ProcessorError::DuplicateEntry { remote }) if remote.same_content(local) => {
                debug!(uid = %local.uid, shared_id = %remote.shared_id, "Entry already shared, adopting row");
                Ok(SharedRef {
                    shared_id: remote.shared_id,
                    expected_version: remote.version,
                })
            }
            Err(ProcessorError::DuplicateEntry { remote }) => Err(self.refuse(local, remote)),
            Err(e) => Err(e.into()),
        }
    }

    async fn push_update(
        &self,
        session: &mut Session,
        local: &LocalEntry,
        shared: SharedRef,
    ) -> Result<SharedRef, SyncError> {
        match session
            .processor
            .update_entry(shared.shared_id, shared.expected_version, local)
            .await
        {
            Ok(version) => Ok(SharedRef {
                shared_id: shared.shared_id,
                expected_version: version,
            }),
            Err(ProcessorError::OptimisticLock { remote, .. }) => Err(self.refuse(local, remote)),
            Err(ProcessorError::EntryNotPresentRemotely(shared_id)) => {
                self.report_not_present(local);
                Err(SyncError::EntryNotPresentRemotely(shared_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Push a local removal
    ///
    /// A row that is already gone counts as removed.
    pub async fn delete_shared_entry(&self, entry: &LocalEntry) -> Result<(), SyncError> {
        let Some(shared) = entry.shared else {
            return Ok(());
        };

        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pushing);
        let result = match session
            .processor
            .delete_entry(shared.shared_id, shared.expected_version)
            .await
        {
            Ok(()) => Ok(()),
            Err(ProcessorError::OptimisticLock { remote, .. }) => Err(self.refuse(entry, remote)),
            Err(ProcessorError::EntryNotPresentRemotely(shared_id)) => {
                debug!(shared_id = %shared_id, "Entry already deleted remotely");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.set_state(SessionState::Synchronized);
        drop(guard);

        self.observe(result)
    }

    /// Push the local metadata row-set
    pub async fn synchronize_shared_metadata(&self) -> Result<Version, SyncError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pushing);
        let library = &self.inner.library;
        let local = library.metadata();
        let result = match session
            .processor
            .update_metadata(local.version, &local.values)
            .await
        {
            Ok(version) => {
                library.mark_metadata_pushed(version, &local.values);
                Ok(version)
            }
            Err(ProcessorError::MetadataLockViolation { remote, .. }) => {
                warn!(expected = %local.version, found = %remote.version, "Metadata push refused");
                self.emit(SyncEvent::MetadataUpdateRefused {
                    local: Box::new(local),
                    remote: remote.clone(),
                });
                Err(SyncError::MetadataLock { remote })
            }
            Err(e) => Err(e.into()),
        };
        self.set_state(SessionState::Synchronized);
        drop(guard);

        self.observe(result)
    }

    /// Settle a refused push for entry `uid`
    ///
    /// `KeepRemote` overwrites (or drops) the local entry. `KeepLocal` pushes
    /// the local state, or the local removal, over the remote row, provided
    /// the remote row is still at `remote_version`. Returns the entry's new
    /// remote link, if it still has one.
    pub async fn resolve_conflict(
        &self,
        uid: Uuid,
        resolution: Resolution,
    ) -> Result<Option<SharedRef>, SyncError> {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(self.not_open());
        };

        self.set_state(SessionState::Pushing);
        let result = self.resolve_locked(session, uid, resolution).await;
        self.set_state(SessionState::Synchronized);
        drop(guard);

        self.observe(result)
    }

    async fn resolve_locked(
        &self,
        session: &mut Session,
        uid: Uuid,
        resolution: Resolution,
    ) -> Result<Option<SharedRef>, SyncError> {
        let library = &self.inner.library;
        let remote = session.processor.read_entry_by_uid(uid).await?;

        let Resolution::KeepLocal { remote_version } = resolution else {
            return Ok(match remote {
                Some(remote) => {
                    library.replace_with_remote(&remote);
                    Some(SharedRef {
                        shared_id: remote.shared_id,
                        expected_version: remote.version,
                    })
                }
                None => {
                    library.discard(uid);
                    None
                }
            });
        };

        match (library.get(uid), remote) {
            (Some(local), Some(remote)) if remote.version != remote_version => {
                Err(self.refuse(&local, Box::new(remote)))
            }
            (Some(_), Some(remote)) => {
                library.relink(
                    uid,
                    Some(SharedRef {
                        shared_id: remote.shared_id,
                        expected_version: remote_version,
                    }),
                );
                self.push_entry(session, uid).await.map(Some)
            }
            (Some(_), None) => {
                library.relink(uid, None);
                self.push_entry(session, uid).await.map(Some)
            }
            (None, Some(remote)) => {
                session
                    .processor
                    .delete_entry(remote.shared_id, remote_version)
                    .await?;
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    // ==================== Helpers ====================

    fn background(&self) -> std::sync::MutexGuard<'_, Background> {
        self.inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = %state, "Session state changed");
            self.emit(SyncEvent::StateChanged { state });
        }
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.inner.event_tx.send(event);
    }

    fn not_open(&self) -> SyncError {
        SyncError::InvalidState {
            expected: SessionState::Synchronized,
            actual: self.state(),
        }
    }

    /// Surface a refused write and build the matching error
    fn refuse(&self, local: &LocalEntry, remote: Box<SharedEntry>) -> SyncError {
        warn!(
            uid = %local.uid,
            shared_id = %remote.shared_id,
            remote_version = %remote.version,
            "Push refused, entry changed remotely"
        );
        let local = Box::new(local.clone());
        self.emit(SyncEvent::UpdateRefused {
            local: local.clone(),
            remote: remote.clone(),
        });
        SyncError::OptimisticLock { local, remote }
    }

    fn report_not_present(&self, local: &LocalEntry) {
        warn!(uid = %local.uid, "Entry no longer present in shared database");
        self.emit(SyncEvent::SharedEntriesNotPresent {
            entries: vec![local.clone()],
        });
    }

    /// Surface unpushed metadata values replaced by a newer remote row-set
    fn report_metadata_overwritten(&self, local: Box<SharedMetadata>) {
        let remote = Box::new(self.inner.library.metadata());
        warn!(
            expected = %local.version,
            found = %remote.version,
            "Unpushed metadata edits replaced by newer remote values"
        );
        self.emit(SyncEvent::MetadataUpdateRefused { local, remote });
    }

    fn report_connection_lost(&self, reason: String) {
        if !self.inner.connection_lost.swap(true, Ordering::SeqCst) {
            warn!(reason = %reason, "Lost connection to shared database");
            self.emit(SyncEvent::ConnectionLost { reason });
        }
    }

    /// Report the first connectivity failure of a streak
    fn observe<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match &result {
            Err(e) if e.is_connectivity() => self.report_connection_lost(e.to_string()),
            _ => self.inner.connection_lost.store(false, Ordering::SeqCst),
        }
        result
    }

    fn autosave(&self) {
        let Some(path) = &self.inner.settings.autosave_path else {
            return;
        };
        match self.inner.library.save_snapshot(path) {
            Ok(()) => debug!(path = %path.display(), "Autosaved library"),
            Err(e) => warn!(path = %path.display(), error = %e, "Autosave failed"),
        }
    }

    async fn push_library_event(&self, event: LibraryEvent) {
        if !event.source().is_user() {
            return;
        }
        let result = match event {
            LibraryEvent::EntryAdded { uid, .. } | LibraryEvent::EntryChanged { uid, .. } => {
                self.synchronize_shared_entry(uid).await.map(|_| ())
            }
            LibraryEvent::EntryRemoved { entry, .. } => self.delete_shared_entry(&entry).await,
            LibraryEvent::MetadataChanged { .. } => {
                self.synchronize_shared_metadata().await.map(|_| ())
            }
            LibraryEvent::Reloaded => Ok(()),
        };
        match result {
            Ok(()) | Err(SyncError::UnknownEntry(_)) => {}
            Err(e) => debug!(error = %e, "Automatic push failed"),
        }
    }

    async fn push_all_dirty(&self) {
        for entry in self.inner.library.dirty_entries() {
            if let Err(e) = self.synchronize_shared_entry(entry.uid).await {
                debug!(uid = %entry.uid, error = %e, "Automatic push failed");
            }
        }
        if self.inner.library.metadata_dirty() {
            if let Err(e) = self.synchronize_shared_metadata().await {
                debug!(error = %e, "Automatic metadata push failed");
            }
        }
    }
}

/// Pull whenever the listener reports a foreign change
///
/// Signals that pile up while a pull runs are coalesced into one pull.
async fn run_pull_driver(weak: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<ListenerSignal>) {
    while let Some(first) = signals.recv().await {
        let mut pending = vec![first];
        while let Ok(more) = signals.try_recv() {
            pending.push(more);
        }

        let Some(inner) = weak.upgrade() else {
            break;
        };
        let sync = Synchronizer { inner };

        let mut pull = false;
        for signal in pending {
            match signal {
                ListenerSignal::ForeignChange => pull = true,
                ListenerSignal::ConnectionLost(reason) => sync.report_connection_lost(reason),
            }
        }
        if pull {
            if let Err(e) = sync.pull_changes().await {
                warn!(error = %e, "Pull after foreign change failed");
            }
        }
    }
}

/// Push user edits as the library reports them
async fn run_push_driver(weak: Weak<Inner>, mut events: broadcast::Receiver<LibraryEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed library events, pushing every dirty entry");
                None
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = weak.upgrade() else {
            break;
        };
        let sync = Synchronizer { inner };
        match event {
            Some(event) => sync.push_library_event(event).await,
            None => sync.push_all_dirty().await,
        }
    }
}
