//! Foreign change listeners
//!
//! Detect commits made by *other* sessions and signal the synchronizer.
//! Two variants share one contract:
//!
//! - [`NotifyChannelListener`] (PostgreSQL): waits on LISTEN/NOTIFY
//! - [`ChangeLogPoller`] (MySQL, SQLite): polls the `change_log` table
//!
//! Both run on a dedicated task with their own connection, reconnect with
//! exponential backoff and give up with [`ListenerSignal::ConnectionLost`]
//! once the retry budget is spent.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::{AnyConnection, Connection, Row};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendKind;
use crate::connection::{self, ConnectionError, ConnectionProperties, Timeouts};
use crate::models::Watermark;
use crate::shared::{Dialect, NOTIFY_CHANNEL};
use crate::tag::ProcessorTag;

/// What a listener reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSignal {
    /// Another session committed a change
    ForeignChange,
    /// Retries exhausted; the listener has stopped
    ConnectionLost(String),
}

/// Callback invoked from the listener task
pub type SignalCallback = Arc<dyn Fn(ListenerSignal) + Send + Sync>;

/// Listener tuning
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Interval between change-log polls
    pub poll_interval: Duration,
    /// Delay before the first reconnect attempt
    pub initial_reconnect_delay: Duration,
    /// Upper bound for the reconnect delay
    pub max_reconnect_delay: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    /// How long `stop` waits before aborting the task
    pub stop_timeout: Duration,
    /// Bounds for the listener's own connection
    pub timeouts: Timeouts,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_retries: 5,
            stop_timeout: Duration::from_secs(2),
            timeouts: Timeouts::default(),
        }
    }
}

/// Detects commits made by other sessions
pub trait ForeignChangeListener: Send {
    /// Spawn the listener task
    fn start(self: Box<Self>, callback: SignalCallback) -> ListenerHandle;
}

/// Pick the listener variant for a backend family
///
/// `since` is the watermark the caller has already observed; the poller
/// only reports changes after it.
pub fn listener_for(
    properties: &ConnectionProperties,
    tag: ProcessorTag,
    since: Watermark,
    settings: ListenerSettings,
) -> Box<dyn ForeignChangeListener> {
    match properties.backend {
        BackendKind::PostgreSql => Box::new(NotifyChannelListener::new(
            properties.clone(),
            tag,
            settings,
        )),
        BackendKind::MySql | BackendKind::Sqlite => Box::new(ChangeLogPoller::new(
            properties.clone(),
            tag,
            since,
            settings,
        )),
    }
}

#[derive(Debug)]
enum ListenerCommand {
    Shutdown,
}

/// Forwards signals while the handle has not been stopped
#[derive(Clone)]
struct Signals {
    callback: SignalCallback,
    active: Arc<AtomicBool>,
}

impl Signals {
    fn emit(&self, signal: ListenerSignal) {
        if self.active.load(Ordering::SeqCst) {
            (self.callback)(signal);
        }
    }
}

/// Handle for stopping a running listener
pub struct ListenerHandle {
    command_tx: mpsc::Sender<ListenerCommand>,
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
    stop_timeout: Duration,
}

impl ListenerHandle {
    fn spawn<F, Fut>(stop_timeout: Duration, callback: SignalCallback, run: F) -> Self
    where
        F: FnOnce(Signals, mpsc::Receiver<ListenerCommand>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(1);
        let active = Arc::new(AtomicBool::new(true));
        let signals = Signals {
            callback,
            active: active.clone(),
        };
        let task = tokio::spawn(run(signals, command_rx));
        Self {
            command_tx,
            task,
            active,
            stop_timeout,
        }
    }

    /// Whether the listener task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Silence callbacks and abort the task without waiting for it
    pub fn abort(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    /// Stop the listener
    ///
    /// Waits at most the configured stop timeout, then aborts the task. No
    /// callback runs after this returns.
    pub async fn stop(self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.command_tx.try_send(ListenerCommand::Shutdown);

        let mut task = self.task;
        if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
            warn!("Listener did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }
        debug!("Listener stopped");
    }
}

/// Exponential reconnect delay with a retry budget
struct Backoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    failures: u32,
    max_retries: u32,
}

impl Backoff {
    fn new(settings: &ListenerSettings) -> Self {
        Self {
            initial: settings.initial_reconnect_delay,
            max: settings.max_reconnect_delay,
            delay: settings.initial_reconnect_delay,
            failures: 0,
            max_retries: settings.max_retries,
        }
    }

    fn reset(&mut self) {
        self.delay = self.initial;
        self.failures = 0;
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > self.max_retries {
            return None;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        Some(delay)
    }
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile
async fn pause(delay: Duration, commands: &mut mpsc::Receiver<ListenerCommand>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = commands.recv() => true,
    }
}

// ==================== LISTEN/NOTIFY ====================

/// Waits on the PostgreSQL notification channel
pub struct NotifyChannelListener {
    properties: ConnectionProperties,
    tag: ProcessorTag,
    settings: ListenerSettings,
}

impl NotifyChannelListener {
    pub fn new(properties: ConnectionProperties, tag: ProcessorTag, settings: ListenerSettings) -> Self {
        Self {
            properties,
            tag,
            settings,
        }
    }

    async fn connect(&self) -> Result<PgListener, ConnectionError> {
        let url = self.properties.connection_url();
        let attempt = async {
            let mut listener = PgListener::connect(&url).await?;
            listener.listen(NOTIFY_CHANNEL).await?;
            Ok::<_, sqlx::Error>(listener)
        };
        match tokio::time::timeout(self.settings.timeouts.connect, attempt).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout {
                target: self.properties.display_target(),
                timeout: self.settings.timeouts.connect,
            }),
        }
    }

    /// Receive until the connection drops or shutdown is requested
    ///
    /// Returns `None` on shutdown, otherwise the reason the connection was lost.
    async fn receive(
        &self,
        listener: &mut PgListener,
        signals: &Signals,
        commands: &mut mpsc::Receiver<ListenerCommand>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                _ = commands.recv() => return None,
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        if self.tag.is_own(notification.payload()) {
                            continue;
                        }
                        debug!(payload = notification.payload(), "Foreign change notification");
                        signals.emit(ListenerSignal::ForeignChange);
                    }
                    Ok(None) => return Some("connection closed by server".to_string()),
                    Err(e) => return Some(e.to_string()),
                },
            }
        }
    }

    async fn run(self, signals: Signals, mut commands: mpsc::Receiver<ListenerCommand>) {
        let mut backoff = Backoff::new(&self.settings);

        loop {
            let connected = tokio::select! {
                _ = commands.recv() => return,
                connected = self.connect() => connected,
            };

            let reason = match connected {
                Ok(mut listener) => {
                    info!(channel = NOTIFY_CHANNEL, "Listening for foreign changes");
                    backoff.reset();
                    // Notifications sent while we were not listening are lost
                    signals.emit(ListenerSignal::ForeignChange);

                    match self.receive(&mut listener, &signals, &mut commands).await {
                        Some(reason) => reason,
                        None => return,
                    }
                }
                Err(e) => e.to_string(),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    warn!(reason = %reason, retry_in = ?delay, "Notification connection lost");
                    if pause(delay, &mut commands).await {
                        return;
                    }
                }
                None => {
                    warn!(reason = %reason, "Giving up on notification channel");
                    signals.emit(ListenerSignal::ConnectionLost(reason));
                    return;
                }
            }
        }
    }
}

impl ForeignChangeListener for NotifyChannelListener {
    fn start(self: Box<Self>, callback: SignalCallback) -> ListenerHandle {
        let stop_timeout = self.settings.stop_timeout;
        ListenerHandle::spawn(stop_timeout, callback, move |signals, commands| {
            self.run(signals, commands)
        })
    }
}

// ==================== Change-log polling ====================

/// Polls the change log for rows written by other sessions
pub struct ChangeLogPoller {
    properties: ConnectionProperties,
    tag: ProcessorTag,
    cursor: Watermark,
    settings: ListenerSettings,
}

impl ChangeLogPoller {
    pub fn new(
        properties: ConnectionProperties,
        tag: ProcessorTag,
        since: Watermark,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            properties,
            tag,
            cursor: since,
            settings,
        }
    }

    /// Advance the cursor; returns true if a foreign row was seen
    async fn poll_once(&mut self, conn: &mut Option<AnyConnection>) -> Result<bool, ConnectionError> {
        if conn.is_none() {
            *conn = Some(connection::open_raw(&self.properties, self.settings.timeouts).await?);
        }
        let Some(handle) = conn.as_mut() else {
            return Ok(false);
        };

        let dialect = Dialect::new(self.properties.backend);
        let sql = dialect.sql("SELECT seq, processor_tag FROM change_log WHERE seq > ? ORDER BY seq");
        let query = sqlx::query(&sql).bind(self.cursor.0).fetch_all(handle);
        let rows = match tokio::time::timeout(self.settings.timeouts.read, query).await {
            Ok(rows) => rows?,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    target: self.properties.display_target(),
                    timeout: self.settings.timeouts.read,
                })
            }
        };

        let mut foreign = false;
        for row in &rows {
            self.cursor = Watermark(row.try_get::<i64, _>("seq")?);
            let tag: String = row.try_get("processor_tag")?;
            foreign |= !self.tag.is_own(&tag);
        }
        Ok(foreign)
    }

    async fn run(mut self, signals: Signals, mut commands: mpsc::Receiver<ListenerCommand>) {
        let mut backoff = Backoff::new(&self.settings);
        let mut conn: Option<AnyConnection> = None;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.settings.poll_interval, "Polling change log for foreign changes");
        loop {
            tokio::select! {
                _ = commands.recv() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(&mut conn).await {
                Ok(found) => {
                    backoff.reset();
                    if found {
                        debug!(cursor = self.cursor.0, "Foreign change in change log");
                        signals.emit(ListenerSignal::ForeignChange);
                    }
                }
                Err(e) => {
                    conn = None;
                    let reason = e.to_string();
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(reason = %reason, retry_in = ?delay, "Change log poll failed");
                            if pause(delay, &mut commands).await {
                                break;
                            }
                        }
                        None => {
                            warn!(reason = %reason, "Giving up on change log polling");
                            signals.emit(ListenerSignal::ConnectionLost(reason));
                            break;
                        }
                    }
                }
            }
        }

        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
    }
}

impl ForeignChangeListener for ChangeLogPoller {
    fn start(self: Box<Self>, callback: SignalCallback) -> ListenerHandle {
        let stop_timeout = self.settings.stop_timeout;
        ListenerHandle::spawn(stop_timeout, callback, move |signals, commands| {
            self.run(signals, commands)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseConnection;
    use crate::models::{LocalEntry, Version};
    use crate::shared::Processor;
    use tempfile::TempDir;

    fn fast_settings() -> ListenerSettings {
        ListenerSettings {
            poll_interval: Duration::from_millis(20),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            max_retries: 2,
            stop_timeout: Duration::from_secs(1),
            timeouts: Timeouts::default(),
        }
    }

    async fn processor(props: &ConnectionProperties, tag: ProcessorTag) -> Processor {
        let conn = DatabaseConnection::connect(props.clone(), Timeouts::default())
            .await
            .unwrap();
        let mut p = Processor::new(conn, tag);
        p.initialize_schema_if_absent().await.unwrap();
        p
    }

    fn collecting_callback() -> (SignalCallback, mpsc::UnboundedReceiver<ListenerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SignalCallback = Arc::new(move |signal| {
            let _ = tx.send(signal);
        });
        (callback, rx)
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<ListenerSignal>) -> Option<ListenerSignal> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_backoff_doubles_and_gives_up() {
        let mut backoff = Backoff::new(&fast_settings());
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut settings = fast_settings();
        settings.max_retries = 10;
        let mut backoff = Backoff::new(&settings);
        let delays: Vec<Duration> = (0..5).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(delays.last(), Some(&Duration::from_millis(40)));
    }

    #[test]
    fn test_listener_variant_by_backend() {
        // Only checks that selection does not panic for every family
        for backend in BackendKind::ALL {
            let props = ConnectionProperties {
                backend,
                host: "localhost".into(),
                port: None,
                database: "db".into(),
                user: "u".into(),
                password: String::new(),
            };
            let _ = listener_for(&props, ProcessorTag::generate(), Watermark(0), fast_settings());
        }
    }

    #[tokio::test]
    async fn test_poller_signals_foreign_changes_only() {
        let dir = TempDir::new().unwrap();
        let props = ConnectionProperties::sqlite(dir.path().join("shared.db").to_string_lossy());
        let own_tag = ProcessorTag::generate();
        let mut own = processor(&props, own_tag.clone()).await;
        let mut other = processor(&props, ProcessorTag::generate()).await;

        let (callback, mut rx) = collecting_callback();
        let handle = listener_for(&props, own_tag, Watermark(0), fast_settings()).start(callback);

        own.insert_entry(&LocalEntry::new("article")).await.unwrap();
        assert_eq!(next_signal(&mut rx).await, None);

        other.insert_entry(&LocalEntry::new("book")).await.unwrap();
        assert_eq!(next_signal(&mut rx).await, Some(ListenerSignal::ForeignChange));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_poller_starts_after_given_watermark() {
        let dir = TempDir::new().unwrap();
        let props = ConnectionProperties::sqlite(dir.path().join("shared.db").to_string_lossy());
        let mut other = processor(&props, ProcessorTag::generate()).await;
        other.insert_entry(&LocalEntry::new("book")).await.unwrap();
        let seen = other.current_watermark().await.unwrap();

        let (callback, mut rx) = collecting_callback();
        let handle = listener_for(&props, ProcessorTag::generate(), seen, fast_settings()).start(callback);
        assert_eq!(next_signal(&mut rx).await, None);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_no_callback_after_stop() {
        let dir = TempDir::new().unwrap();
        let props = ConnectionProperties::sqlite(dir.path().join("shared.db").to_string_lossy());
        let mut other = processor(&props, ProcessorTag::generate()).await;

        let (callback, mut rx) = collecting_callback();
        let handle = listener_for(&props, ProcessorTag::generate(), Watermark(0), fast_settings()).start(callback);
        handle.stop().await;

        let id = other
            .insert_entry(&LocalEntry::new("book"))
            .await
            .unwrap();
        other.delete_entry(id, Version::INITIAL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poller_reports_connection_lost() {
        let dir = TempDir::new().unwrap();
        // A directory path cannot be opened as a database file
        let props = ConnectionProperties::sqlite(dir.path().to_string_lossy());

        let (callback, mut rx) = collecting_callback();
        let handle = listener_for(&props, ProcessorTag::generate(), Watermark(0), fast_settings()).start(callback);

        match next_signal(&mut rx).await {
            Some(ListenerSignal::ConnectionLost(reason)) => assert!(!reason.is_empty()),
            other => panic!("expected connection lost, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
        handle.stop().await;
    }
}
