//! Schema-aware SQL operations on a shared database
//!
//! The processor owns one [`DatabaseConnection`] and translates entry,
//! field and metadata operations into statements for the connected
//! engine. Every write runs in its own transaction, bumps the affected
//! version exactly once, appends a `change_log` row stamped with the
//! session's [`ProcessorTag`] and, on PostgreSQL, raises a notification
//! that is delivered on commit.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use sqlx::any::AnyRow;
use sqlx::{Executor, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dialect::Dialect;
use super::error::{ProcessorError, ProcessorResult};
use super::schema::{
    self, ChangeKind, SchemaStatus, KEY_METADATA_VERSION, KEY_SCHEMA_VERSION, SCHEMA_VERSION,
};
use crate::connection::DatabaseConnection;
use crate::models::{LocalEntry, SharedEntry, SharedId, SharedMetadata, Version, Watermark};
use crate::tag::ProcessorTag;

/// Maximum number of ids bound into a single `IN (...)` clause
pub const READ_PARTITION: usize = 500;

const ENTRY_COLUMNS: &str = "SELECT e.shared_id, e.entry_uid, e.entry_type, e.version, \
    e.last_modified_by, f.field_name, f.field_value \
    FROM entry e LEFT JOIN field f ON f.entry_shared_id = e.shared_id";

/// Everything that changed after a watermark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Current state of entries inserted or updated since the watermark
    pub entries: Vec<SharedEntry>,
    /// Entries deleted since the watermark
    pub removed: Vec<SharedId>,
    /// Current metadata, when it changed since the watermark
    pub metadata: Option<SharedMetadata>,
    /// Watermark to pass to the next call
    pub watermark: Watermark,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.removed.is_empty() && self.metadata.is_none()
    }
}

/// Run one driver call bounded by `limit`
async fn bounded<T, F>(limit: Duration, fut: F) -> ProcessorResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ProcessorError::from),
        Err(_) => Err(ProcessorError::Timeout(limit)),
    }
}

/// Schema-aware access to one shared database
pub struct Processor {
    conn: DatabaseConnection,
    dialect: Dialect,
    tag: ProcessorTag,
    read_timeout: Duration,
}

impl Processor {
    /// Wrap a live connection; writes are stamped with `tag`
    pub fn new(conn: DatabaseConnection, tag: ProcessorTag) -> Self {
        let dialect = Dialect::new(conn.backend());
        let read_timeout = conn.timeouts().read;
        Self {
            conn,
            dialect,
            tag,
            read_timeout,
        }
    }

    /// Tag stamped on every write of this session
    pub fn tag(&self) -> &ProcessorTag {
        &self.tag
    }

    /// The underlying connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Liveness check
    pub async fn ping(&mut self) -> ProcessorResult<()> {
        let limit = self.read_timeout;
        bounded(limit, sqlx::query("SELECT 1").execute(self.conn.handle())).await?;
        Ok(())
    }

    /// Release the connection
    pub async fn close(self) {
        self.conn.close().await;
    }

    // ==================== Schema ====================

    /// Classify the target database
    pub async fn schema_status(&mut self) -> ProcessorResult<SchemaStatus> {
        let limit = self.read_timeout;
        let rows = bounded(
            limit,
            sqlx::query(self.dialect.list_tables()).fetch_all(self.conn.handle()),
        )
        .await?;

        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            names.push(row.try_get::<String, _>("table_name")?);
        }
        Ok(SchemaStatus::classify(&names))
    }

    /// Create the shared tables and marker rows if they do not exist yet
    ///
    /// Idempotent. Refuses to touch a database that holds only part of the
    /// shared schema.
    pub async fn initialize_schema_if_absent(&mut self) -> ProcessorResult<()> {
        match self.schema_status().await? {
            SchemaStatus::Present => return Ok(()),
            SchemaStatus::Foreign(missing) => {
                return Err(ProcessorError::NotASharedDatabase {
                    missing: missing.join(", "),
                })
            }
            SchemaStatus::Absent => {}
        }

        info!(backend = %self.dialect.backend(), "Creating shared database schema");
        let limit = self.read_timeout;
        for statement in schema::ddl(self.dialect.backend()) {
            bounded(limit, self.conn.handle().execute(*statement)).await?;
        }

        let insert = self.dialect.sql(self.dialect.insert_metadata_if_absent());
        for (key, value) in [
            (KEY_SCHEMA_VERSION, SCHEMA_VERSION),
            (KEY_METADATA_VERSION, "1"),
        ] {
            bounded(
                limit,
                sqlx::query(&insert)
                    .bind(key)
                    .bind(value)
                    .execute(self.conn.handle()),
            )
            .await?;
        }
        Ok(())
    }

    /// Fail unless the schema version marker matches this build
    pub async fn check_schema_compatibility(&mut self) -> ProcessorResult<()> {
        let found = self.read_meta_value(KEY_SCHEMA_VERSION).await?;
        if found.as_deref() == Some(SCHEMA_VERSION) {
            Ok(())
        } else {
            warn!(found = ?found, expected = SCHEMA_VERSION, "Shared schema version mismatch");
            Err(ProcessorError::SchemaVersionMismatch {
                found,
                expected: SCHEMA_VERSION.to_string(),
            })
        }
    }

    // ==================== Entries ====================

    /// Insert a never-shared entry; the new row starts at version 1
    ///
    /// Fails with [`ProcessorError::DuplicateEntry`] when a row with the same
    /// uid exists, including when another session wins the race.
    pub async fn insert_entry(&mut self, entry: &LocalEntry) -> ProcessorResult<SharedId> {
        self.begin().await?;
        let result = self.insert_entry_in_tx(entry).await;
        let result = self.finish(result).await;

        match result {
            Err(e) if e.is_unique_violation() => match self.read_entry_by_uid(entry.uid).await? {
                Some(remote) => Err(ProcessorError::DuplicateEntry {
                    remote: Box::new(remote),
                }),
                None => Err(e),
            },
            other => other,
        }
    }

    async fn insert_entry_in_tx(&mut self, entry: &LocalEntry) -> ProcessorResult<SharedId> {
        if let Some(remote) = self.read_entry_by_uid(entry.uid).await? {
            return Err(ProcessorError::DuplicateEntry {
                remote: Box::new(remote),
            });
        }

        let limit = self.read_timeout;
        let uid = entry.uid.to_string();
        let sql = self.dialect.sql(
            "INSERT INTO entry (entry_uid, entry_type, version, last_modified_by) VALUES (?, ?, ?, ?)",
        );
        bounded(
            limit,
            sqlx::query(&sql)
                .bind(uid.as_str())
                .bind(entry.entry_type.as_str())
                .bind(Version::INITIAL.0)
                .bind(self.tag.as_str())
                .execute(self.conn.handle()),
        )
        .await?;

        let sql = self.dialect.sql("SELECT shared_id FROM entry WHERE entry_uid = ?");
        let row = bounded(
            limit,
            sqlx::query(&sql)
                .bind(uid.as_str())
                .fetch_one(self.conn.handle()),
        )
        .await?;
        let shared_id = SharedId(row.try_get::<i64, _>("shared_id")?);

        self.write_fields(shared_id, &entry.fields).await?;
        self.record_change(Some(shared_id), ChangeKind::Insert, Version::INITIAL)
            .await?;

        debug!(shared_id = %shared_id, uid = %entry.uid, "Inserted shared entry");
        Ok(shared_id)
    }

    /// Overwrite a shared entry if it is still at `expected`
    ///
    /// Returns the new version. When the stored version differs the call
    /// fails with [`ProcessorError::OptimisticLock`] carrying the current
    /// row, read inside the same transaction.
    pub async fn update_entry(
        &mut self,
        shared_id: SharedId,
        expected: Version,
        entry: &LocalEntry,
    ) -> ProcessorResult<Version> {
        self.begin().await?;
        let result = self.update_entry_in_tx(shared_id, expected, entry).await;
        self.finish(result).await
    }

    async fn update_entry_in_tx(
        &mut self,
        shared_id: SharedId,
        expected: Version,
        entry: &LocalEntry,
    ) -> ProcessorResult<Version> {
        let limit = self.read_timeout;
        let sql = self.dialect.sql(
            "UPDATE entry SET entry_type = ?, version = version + 1, last_modified_by = ? \
             WHERE shared_id = ? AND version = ?",
        );
        let done = bounded(
            limit,
            sqlx::query(&sql)
                .bind(entry.entry_type.as_str())
                .bind(self.tag.as_str())
                .bind(shared_id.0)
                .bind(expected.0)
                .execute(self.conn.handle()),
        )
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.rejection(shared_id, expected).await?);
        }

        let sql = self.dialect.sql("DELETE FROM field WHERE entry_shared_id = ?");
        bounded(
            limit,
            sqlx::query(&sql).bind(shared_id.0).execute(self.conn.handle()),
        )
        .await?;
        self.write_fields(shared_id, &entry.fields).await?;

        let version = expected.next();
        self.record_change(Some(shared_id), ChangeKind::Update, version)
            .await?;

        debug!(shared_id = %shared_id, version = %version, "Updated shared entry");
        Ok(version)
    }

    /// Delete a shared entry if it is still at `expected`
    pub async fn delete_entry(
        &mut self,
        shared_id: SharedId,
        expected: Version,
    ) -> ProcessorResult<()> {
        self.begin().await?;
        let result = self.delete_entry_in_tx(shared_id, expected).await;
        self.finish(result).await
    }

    async fn delete_entry_in_tx(
        &mut self,
        shared_id: SharedId,
        expected: Version,
    ) -> ProcessorResult<()> {
        let limit = self.read_timeout;
        let sql = format!(
            "SELECT version FROM entry WHERE shared_id = ?{}",
            self.dialect.for_update()
        );
        let sql = self.dialect.sql(&sql);
        let row = bounded(
            limit,
            sqlx::query(&sql)
                .bind(shared_id.0)
                .fetch_optional(self.conn.handle()),
        )
        .await?;

        let current = match row {
            Some(row) => Version(row.try_get::<i64, _>("version")?),
            None => return Err(ProcessorError::EntryNotPresentRemotely(shared_id)),
        };
        if current != expected {
            return Err(self.rejection(shared_id, expected).await?);
        }

        let sql = self.dialect.sql("DELETE FROM field WHERE entry_shared_id = ?");
        bounded(
            limit,
            sqlx::query(&sql).bind(shared_id.0).execute(self.conn.handle()),
        )
        .await?;
        let sql = self
            .dialect
            .sql("DELETE FROM entry WHERE shared_id = ? AND version = ?");
        bounded(
            limit,
            sqlx::query(&sql)
                .bind(shared_id.0)
                .bind(expected.0)
                .execute(self.conn.handle()),
        )
        .await?;

        self.record_change(Some(shared_id), ChangeKind::Delete, expected)
            .await?;

        debug!(shared_id = %shared_id, "Deleted shared entry");
        Ok(())
    }

    /// Error describing why a conditional write touched no row
    async fn rejection(
        &mut self,
        shared_id: SharedId,
        expected: Version,
    ) -> ProcessorResult<ProcessorError> {
        Ok(match self.read_entry(shared_id).await? {
            Some(remote) => ProcessorError::OptimisticLock {
                expected,
                remote: Box::new(remote),
            },
            None => ProcessorError::EntryNotPresentRemotely(shared_id),
        })
    }

    async fn write_fields(
        &mut self,
        shared_id: SharedId,
        fields: &BTreeMap<String, String>,
    ) -> ProcessorResult<()> {
        let limit = self.read_timeout;
        let sql = self
            .dialect
            .sql("INSERT INTO field (entry_shared_id, field_name, field_value) VALUES (?, ?, ?)");
        for (name, value) in fields {
            bounded(
                limit,
                sqlx::query(&sql)
                    .bind(shared_id.0)
                    .bind(name.as_str())
                    .bind(value.as_str())
                    .execute(self.conn.handle()),
            )
            .await?;
        }
        Ok(())
    }

    // ==================== Reads ====================

    /// Full snapshot of every shared entry, ordered by shared id
    pub async fn read_all_entries(&mut self) -> ProcessorResult<Vec<SharedEntry>> {
        let limit = self.read_timeout;
        let sql = format!("{} ORDER BY e.shared_id, f.field_name", ENTRY_COLUMNS);
        let rows = bounded(limit, sqlx::query(&sql).fetch_all(self.conn.handle())).await?;
        collect_entries(&rows)
    }

    /// Read one entry by shared id
    pub async fn read_entry(&mut self, shared_id: SharedId) -> ProcessorResult<Option<SharedEntry>> {
        let limit = self.read_timeout;
        let sql = format!(
            "{} WHERE e.shared_id = ? ORDER BY f.field_name",
            ENTRY_COLUMNS
        );
        let sql = self.dialect.sql(&sql);
        let rows = bounded(
            limit,
            sqlx::query(&sql)
                .bind(shared_id.0)
                .fetch_all(self.conn.handle()),
        )
        .await?;
        Ok(collect_entries(&rows)?.into_iter().next())
    }

    /// Read one entry by its client-generated uid
    pub async fn read_entry_by_uid(&mut self, uid: Uuid) -> ProcessorResult<Option<SharedEntry>> {
        let limit = self.read_timeout;
        let sql = format!(
            "{} WHERE e.entry_uid = ? ORDER BY f.field_name",
            ENTRY_COLUMNS
        );
        let sql = self.dialect.sql(&sql);
        let uid = uid.to_string();
        let rows = bounded(
            limit,
            sqlx::query(&sql)
                .bind(uid.as_str())
                .fetch_all(self.conn.handle()),
        )
        .await?;
        Ok(collect_entries(&rows)?.into_iter().next())
    }

    /// Read several entries, in partitions of [`READ_PARTITION`] ids
    ///
    /// Ids without a row are skipped.
    pub async fn read_entries(&mut self, ids: &[SharedId]) -> ProcessorResult<Vec<SharedEntry>> {
        let limit = self.read_timeout;
        let mut entries = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(READ_PARTITION) {
            let sql = format!(
                "{} WHERE e.shared_id IN ({}) ORDER BY e.shared_id, f.field_name",
                ENTRY_COLUMNS,
                Dialect::placeholders(chunk.len())
            );
            let sql = self.dialect.sql(&sql);
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.0);
            }
            let rows = bounded(limit, query.fetch_all(self.conn.handle())).await?;
            entries.extend(collect_entries(&rows)?);
        }
        Ok(entries)
    }

    /// Number of shared entries
    pub async fn count_entries(&mut self) -> ProcessorResult<i64> {
        let limit = self.read_timeout;
        let row = bounded(
            limit,
            sqlx::query("SELECT COUNT(*) AS n FROM entry").fetch_one(self.conn.handle()),
        )
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Highest change-log sequence committed so far
    pub async fn current_watermark(&mut self) -> ProcessorResult<Watermark> {
        let limit = self.read_timeout;
        let row = bounded(
            limit,
            sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM change_log")
                .fetch_one(self.conn.handle()),
        )
        .await?;
        Ok(Watermark(row.try_get::<i64, _>("seq")?))
    }

    /// Collect everything that changed after `since`
    ///
    /// Entries are returned in their current state, not one row per change.
    /// An entry whose latest change is a deletion, or whose row is gone by
    /// the time it is read, is reported in `removed`.
    pub async fn fetch_changed_since(&mut self, since: Watermark) -> ProcessorResult<ChangeBatch> {
        let limit = self.read_timeout;
        let sql = self.dialect.sql(
            "SELECT seq, shared_id, change_kind FROM change_log WHERE seq > ? ORDER BY seq",
        );
        let rows = bounded(
            limit,
            sqlx::query(&sql).bind(since.0).fetch_all(self.conn.handle()),
        )
        .await?;

        let mut watermark = since;
        let mut latest: HashMap<SharedId, ChangeKind> = HashMap::new();
        let mut order: Vec<SharedId> = Vec::new();
        let mut metadata_changed = false;

        for row in &rows {
            watermark = Watermark(row.try_get::<i64, _>("seq")?);
            let kind_name: String = row.try_get("change_kind")?;
            let kind = ChangeKind::parse(&kind_name)
                .ok_or_else(|| ProcessorError::InvalidRow(format!("unknown change kind {:?}", kind_name)))?;

            if kind == ChangeKind::Metadata {
                metadata_changed = true;
                continue;
            }
            let id = row
                .try_get::<Option<i64>, _>("shared_id")?
                .map(SharedId)
                .ok_or_else(|| ProcessorError::InvalidRow("entry change without shared id".into()))?;
            if latest.insert(id, kind).is_none() {
                order.push(id);
            }
        }

        let mut removed = Vec::new();
        let mut live = Vec::new();
        for id in order {
            match latest.get(&id) {
                Some(ChangeKind::Delete) => removed.push(id),
                _ => live.push(id),
            }
        }

        let entries = self.read_entries(&live).await?;
        for id in &live {
            if !entries.iter().any(|e| e.shared_id == *id) {
                removed.push(*id);
            }
        }

        let metadata = if metadata_changed {
            Some(self.read_metadata().await?)
        } else {
            None
        };

        Ok(ChangeBatch {
            entries,
            removed,
            metadata,
            watermark,
        })
    }

    // ==================== Metadata ====================

    /// Read the metadata row-set (reserved keys excluded)
    pub async fn read_metadata(&mut self) -> ProcessorResult<SharedMetadata> {
        let limit = self.read_timeout;
        let rows = bounded(
            limit,
            sqlx::query("SELECT meta_key, meta_value FROM metadata").fetch_all(self.conn.handle()),
        )
        .await?;

        let mut metadata = SharedMetadata::default();
        for row in &rows {
            let key: String = row.try_get("meta_key")?;
            let value: String = row.try_get("meta_value")?;
            if key == KEY_METADATA_VERSION {
                metadata.version = parse_version(&value)?;
            } else if !schema::is_reserved_key(&key) {
                metadata.values.insert(key, value);
            }
        }
        Ok(metadata)
    }

    /// Replace the metadata row-set if it is still at `expected`
    ///
    /// Returns the new metadata version.
    pub async fn update_metadata(
        &mut self,
        expected: Version,
        values: &BTreeMap<String, String>,
    ) -> ProcessorResult<Version> {
        self.begin().await?;
        let result = self.update_metadata_in_tx(expected, values).await;
        self.finish(result).await
    }

    async fn update_metadata_in_tx(
        &mut self,
        expected: Version,
        values: &BTreeMap<String, String>,
    ) -> ProcessorResult<Version> {
        let limit = self.read_timeout;
        let version = expected.next();
        let sql = self
            .dialect
            .sql("UPDATE metadata SET meta_value = ? WHERE meta_key = ? AND meta_value = ?");
        let done = bounded(
            limit,
            sqlx::query(&sql)
                .bind(version.0.to_string())
                .bind(KEY_METADATA_VERSION)
                .bind(expected.0.to_string())
                .execute(self.conn.handle()),
        )
        .await?;

        if done.rows_affected() == 0 {
            let remote = self.read_metadata().await?;
            return Err(ProcessorError::MetadataLockViolation {
                expected,
                remote: Box::new(remote),
            });
        }

        let sql = self
            .dialect
            .sql("DELETE FROM metadata WHERE meta_key <> ? AND meta_key <> ?");
        bounded(
            limit,
            sqlx::query(&sql)
                .bind(KEY_SCHEMA_VERSION)
                .bind(KEY_METADATA_VERSION)
                .execute(self.conn.handle()),
        )
        .await?;

        let upsert = self.dialect.sql(self.dialect.upsert_metadata());
        for (key, value) in values {
            if schema::is_reserved_key(key) {
                warn!(key = %key, "Skipping reserved metadata key");
                continue;
            }
            bounded(
                limit,
                sqlx::query(&upsert)
                    .bind(key.as_str())
                    .bind(value.as_str())
                    .execute(self.conn.handle()),
            )
            .await?;
        }

        self.record_change(None, ChangeKind::Metadata, version).await?;
        debug!(version = %version, "Updated shared metadata");
        Ok(version)
    }

    async fn read_meta_value(&mut self, key: &str) -> ProcessorResult<Option<String>> {
        let limit = self.read_timeout;
        let sql = self
            .dialect
            .sql("SELECT meta_value FROM metadata WHERE meta_key = ?");
        let row = bounded(
            limit,
            sqlx::query(&sql)
                .bind(key)
                .fetch_optional(self.conn.handle()),
        )
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("meta_value")?)),
            None => Ok(None),
        }
    }

    // ==================== Transactions ====================

    async fn begin(&mut self) -> ProcessorResult<()> {
        let limit = self.read_timeout;
        let statement = self.dialect.begin();
        bounded(limit, self.conn.handle().execute(statement)).await?;
        Ok(())
    }

    /// Commit on success, roll back on failure
    async fn finish<T>(&mut self, result: ProcessorResult<T>) -> ProcessorResult<T> {
        let limit = self.read_timeout;
        match result {
            Ok(value) => match bounded(limit, self.conn.handle().execute("COMMIT")).await {
                Ok(_) => Ok(value),
                Err(e) => {
                    self.rollback().await;
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn rollback(&mut self) {
        let limit = self.read_timeout;
        if let Err(e) = bounded(limit, self.conn.handle().execute("ROLLBACK")).await {
            warn!(error = %e, "Rollback failed");
        }
    }

    /// Append a change-log row and announce the commit
    async fn record_change(
        &mut self,
        shared_id: Option<SharedId>,
        kind: ChangeKind,
        version: Version,
    ) -> ProcessorResult<()> {
        let limit = self.read_timeout;
        let sql = self.dialect.sql(
            "INSERT INTO change_log (shared_id, change_kind, version, processor_tag) VALUES (?, ?, ?, ?)",
        );
        bounded(
            limit,
            sqlx::query(&sql)
                .bind(shared_id.map(|id| id.0))
                .bind(kind.as_str())
                .bind(version.0)
                .bind(self.tag.as_str())
                .execute(self.conn.handle()),
        )
        .await?;

        if let Some(notify) = self.dialect.notify(self.tag.as_str()) {
            bounded(limit, self.conn.handle().execute(notify.as_str())).await?;
        }
        Ok(())
    }
}

fn parse_version(value: &str) -> ProcessorResult<Version> {
    value
        .trim()
        .parse::<i64>()
        .map(Version)
        .map_err(|_| ProcessorError::InvalidRow(format!("invalid version {:?}", value)))
}

/// Fold joined entry/field rows into entries
///
/// Rows must be grouped by shared id.
fn collect_entries(rows: &[AnyRow]) -> ProcessorResult<Vec<SharedEntry>> {
    let mut entries: Vec<SharedEntry> = Vec::new();
    for row in rows {
        let shared_id = SharedId(row.try_get::<i64, _>("shared_id")?);

        let is_new = entries.last().map(|e| e.shared_id) != Some(shared_id);
        if is_new {
            let uid: String = row.try_get("entry_uid")?;
            let uid = Uuid::parse_str(&uid)
                .map_err(|e| ProcessorError::InvalidRow(format!("entry {}: {}", shared_id, e)))?;
            entries.push(SharedEntry {
                shared_id,
                uid,
                version: Version(row.try_get::<i64, _>("version")?),
                entry_type: row.try_get("entry_type")?,
                fields: BTreeMap::new(),
                last_modified_by: row.try_get("last_modified_by")?,
            });
        }

        let name: Option<String> = row.try_get("field_name")?;
        let value: Option<String> = row.try_get("field_value")?;
        if let (Some(name), Some(value), Some(entry)) = (name, value, entries.last_mut()) {
            entry.fields.insert(name, value);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionProperties, Timeouts};
    use tempfile::TempDir;

    async fn open(path: &std::path::Path) -> Processor {
        let props = ConnectionProperties::sqlite(path.to_string_lossy());
        let conn = DatabaseConnection::connect(props, Timeouts::default())
            .await
            .unwrap();
        Processor::new(conn, ProcessorTag::generate())
    }

    async fn setup() -> (TempDir, Processor) {
        let dir = TempDir::new().unwrap();
        let mut processor = open(&dir.path().join("shared.db")).await;
        processor.initialize_schema_if_absent().await.unwrap();
        (dir, processor)
    }

    fn article(title: &str) -> LocalEntry {
        LocalEntry::new("article")
            .with_field("title", title)
            .with_field("author", "Doe")
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (_dir, mut p) = setup().await;
        assert_eq!(p.schema_status().await.unwrap(), SchemaStatus::Present);
        p.initialize_schema_if_absent().await.unwrap();
        p.check_schema_compatibility().await.unwrap();
        assert_eq!(p.read_metadata().await.unwrap().version, Version::INITIAL);
    }

    #[tokio::test]
    async fn test_schema_version_mismatch() {
        let (_dir, mut p) = setup().await;
        sqlx::query("UPDATE metadata SET meta_value = '99' WHERE meta_key = 'VersionDBStructure'")
            .execute(p.conn.handle())
            .await
            .unwrap();

        let err = p.check_schema_compatibility().await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::SchemaVersionMismatch { found: Some(ref v), .. } if v == "99"
        ));
    }

    #[tokio::test]
    async fn test_partial_schema_is_foreign() {
        let dir = TempDir::new().unwrap();
        let mut p = open(&dir.path().join("foreign.db")).await;
        p.conn
            .handle()
            .execute("CREATE TABLE entry (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();

        assert!(matches!(
            p.schema_status().await.unwrap(),
            SchemaStatus::Foreign(_)
        ));
        assert!(matches!(
            p.initialize_schema_if_absent().await,
            Err(ProcessorError::NotASharedDatabase { .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (_dir, mut p) = setup().await;
        let local = article("X");

        let id = p.insert_entry(&local).await.unwrap();
        let remote = p.read_entry(id).await.unwrap().unwrap();

        assert_eq!(remote.uid, local.uid);
        assert_eq!(remote.version, Version::INITIAL);
        assert_eq!(remote.fields, local.fields);
        assert_eq!(remote.last_modified_by, p.tag().as_str());
        assert_eq!(p.count_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_same_uid_is_duplicate() {
        let (_dir, mut p) = setup().await;
        let local = article("X");
        let id = p.insert_entry(&local).await.unwrap();

        match p.insert_entry(&local).await {
            Err(ProcessorError::DuplicateEntry { remote }) => assert_eq!(remote.shared_id, id),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(p.count_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_bumps_version_once() {
        let (_dir, mut p) = setup().await;
        let mut local = article("X");
        let id = p.insert_entry(&local).await.unwrap();

        local.fields.insert("title".into(), "Y".into());
        local.fields.remove("author");
        let version = p.update_entry(id, Version::INITIAL, &local).await.unwrap();
        assert_eq!(version, Version(2));

        let remote = p.read_entry(id).await.unwrap().unwrap();
        assert_eq!(remote.version, Version(2));
        assert_eq!(remote.fields.get("title").map(String::as_str), Some("Y"));
        assert!(!remote.fields.contains_key("author"));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_without_mutation() {
        let (_dir, mut p) = setup().await;
        let mut local = article("X");
        let id = p.insert_entry(&local).await.unwrap();

        local.fields.insert("title".into(), "Y".into());
        p.update_entry(id, Version::INITIAL, &local).await.unwrap();

        local.fields.insert("title".into(), "Z".into());
        match p.update_entry(id, Version::INITIAL, &local).await {
            Err(ProcessorError::OptimisticLock { expected, remote }) => {
                assert_eq!(expected, Version::INITIAL);
                assert_eq!(remote.version, Version(2));
                assert_eq!(remote.fields.get("title").map(String::as_str), Some("Y"));
            }
            other => panic!("expected lock violation, got {:?}", other),
        }

        let remote = p.read_entry(id).await.unwrap().unwrap();
        assert_eq!(remote.version, Version(2));
        assert_eq!(remote.fields.get("title").map(String::as_str), Some("Y"));
    }

    #[tokio::test]
    async fn test_update_missing_entry() {
        let (_dir, mut p) = setup().await;
        let local = article("X");
        assert!(matches!(
            p.update_entry(SharedId(42), Version::INITIAL, &local).await,
            Err(ProcessorError::EntryNotPresentRemotely(SharedId(42)))
        ));
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let (_dir, mut p) = setup().await;
        let mut local = article("X");
        let id = p.insert_entry(&local).await.unwrap();
        local.fields.insert("title".into(), "Y".into());
        p.update_entry(id, Version::INITIAL, &local).await.unwrap();

        assert!(matches!(
            p.delete_entry(id, Version::INITIAL).await,
            Err(ProcessorError::OptimisticLock { .. })
        ));
        p.delete_entry(id, Version(2)).await.unwrap();
        assert!(p.read_entry(id).await.unwrap().is_none());
        assert!(matches!(
            p.delete_entry(id, Version(2)).await,
            Err(ProcessorError::EntryNotPresentRemotely(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_changed_since() {
        let (_dir, mut p) = setup().await;
        let start = p.current_watermark().await.unwrap();

        let kept = p.insert_entry(&article("kept")).await.unwrap();
        let gone = p.insert_entry(&article("gone")).await.unwrap();
        p.delete_entry(gone, Version::INITIAL).await.unwrap();

        let batch = p.fetch_changed_since(start).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].shared_id, kept);
        assert_eq!(batch.removed, vec![gone]);
        assert!(batch.metadata.is_none());
        assert!(batch.watermark > start);

        let again = p.fetch_changed_since(batch.watermark).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.watermark, batch.watermark);
    }

    #[tokio::test]
    async fn test_read_entries_skips_missing_ids() {
        let (_dir, mut p) = setup().await;
        let a = p.insert_entry(&article("a")).await.unwrap();
        let b = p.insert_entry(&article("b")).await.unwrap();

        let entries = p.read_entries(&[a, SharedId(999), b]).await.unwrap();
        let ids: Vec<SharedId> = entries.iter().map(|e| e.shared_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(p.read_entries(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_optimistic_update() {
        let (_dir, mut p) = setup().await;
        let start = p.current_watermark().await.unwrap();
        let values = BTreeMap::from([("groups".to_string(), "root;".to_string())]);

        let version = p.update_metadata(Version::INITIAL, &values).await.unwrap();
        assert_eq!(version, Version(2));

        let metadata = p.read_metadata().await.unwrap();
        assert_eq!(metadata.version, Version(2));
        assert_eq!(metadata.values, values);

        match p.update_metadata(Version::INITIAL, &BTreeMap::new()).await {
            Err(ProcessorError::MetadataLockViolation { remote, .. }) => {
                assert_eq!(remote.values, values)
            }
            other => panic!("expected metadata lock violation, got {:?}", other),
        }

        let batch = p.fetch_changed_since(start).await.unwrap();
        assert_eq!(batch.metadata.map(|m| m.version), Some(Version(2)));
        p.check_schema_compatibility().await.unwrap();
    }
}
