//! Relational schema of a shared database
//!
//! Four tables with identical names on every engine; only the DDL differs.
//! The `change_log` sequence is the watermark other sessions poll against.

use serde::Serialize;

use crate::backend::BackendKind;

/// Schema version this build understands
pub const SCHEMA_VERSION: &str = "1";

/// Metadata key holding the schema version marker
pub const KEY_SCHEMA_VERSION: &str = "VersionDBStructure";

/// Metadata key holding the optimistic version of the metadata row-set
pub const KEY_METADATA_VERSION: &str = "MetadataVersion";

/// Tables that make up a shared database
pub const TABLES: [&str; 4] = ["entry", "field", "metadata", "change_log"];

/// Whether a metadata key is managed by the processor itself
pub fn is_reserved_key(key: &str) -> bool {
    key == KEY_SCHEMA_VERSION || key == KEY_METADATA_VERSION
}

/// What the target database contains
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "missing", rename_all = "lowercase")]
pub enum SchemaStatus {
    /// None of the shared tables exist
    Absent,
    /// All shared tables exist
    Present,
    /// Some shared tables exist; not a shared database
    Foreign(Vec<String>),
}

impl SchemaStatus {
    /// Classify a database from the names of its tables
    pub fn classify<S: AsRef<str>>(existing: &[S]) -> Self {
        let has = |name: &str| existing.iter().any(|t| t.as_ref().eq_ignore_ascii_case(name));
        let missing: Vec<String> = TABLES
            .iter()
            .filter(|t| !has(t))
            .map(|t| t.to_string())
            .collect();

        if missing.is_empty() {
            SchemaStatus::Present
        } else if missing.len() == TABLES.len() {
            SchemaStatus::Absent
        } else {
            SchemaStatus::Foreign(missing)
        }
    }
}

/// Kind of write recorded in the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Metadata,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeKind::Insert),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            "metadata" => Some(ChangeKind::Metadata),
            _ => None,
        }
    }
}

const SQLITE_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS entry (
        shared_id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_uid VARCHAR(36) NOT NULL UNIQUE,
        entry_type VARCHAR(255) NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        last_modified_by VARCHAR(64) NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS field (
        entry_shared_id INTEGER NOT NULL REFERENCES entry(shared_id) ON DELETE CASCADE,
        field_name VARCHAR(255) NOT NULL,
        field_value TEXT NOT NULL,
        PRIMARY KEY (entry_shared_id, field_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata (
        meta_key VARCHAR(255) NOT NULL PRIMARY KEY,
        meta_value TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        shared_id INTEGER,
        change_kind VARCHAR(16) NOT NULL,
        version INTEGER NOT NULL,
        processor_tag VARCHAR(64) NOT NULL
    )"#,
];

const POSTGRES_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS entry (
        shared_id BIGSERIAL PRIMARY KEY,
        entry_uid VARCHAR(36) NOT NULL UNIQUE,
        entry_type VARCHAR(255) NOT NULL,
        version BIGINT NOT NULL DEFAULT 1,
        last_modified_by VARCHAR(64) NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS field (
        entry_shared_id BIGINT NOT NULL REFERENCES entry(shared_id) ON DELETE CASCADE,
        field_name VARCHAR(255) NOT NULL,
        field_value TEXT NOT NULL,
        PRIMARY KEY (entry_shared_id, field_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata (
        meta_key VARCHAR(255) NOT NULL PRIMARY KEY,
        meta_value TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_log (
        seq BIGSERIAL PRIMARY KEY,
        shared_id BIGINT,
        change_kind VARCHAR(16) NOT NULL,
        version BIGINT NOT NULL,
        processor_tag VARCHAR(64) NOT NULL
    )"#,
];

// MySQL TEXT columns come back as blobs through the Any driver, so values
// are stored as wide VARCHARs that still fit the 64 KiB row limit.
const MYSQL_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS entry (
        shared_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        entry_uid VARCHAR(36) NOT NULL UNIQUE,
        entry_type VARCHAR(255) NOT NULL,
        version BIGINT NOT NULL DEFAULT 1,
        last_modified_by VARCHAR(64) NOT NULL
    ) ENGINE=InnoDB"#,
    r#"CREATE TABLE IF NOT EXISTS field (
        entry_shared_id BIGINT NOT NULL,
        field_name VARCHAR(255) NOT NULL,
        field_value VARCHAR(12000) NOT NULL,
        PRIMARY KEY (entry_shared_id, field_name),
        FOREIGN KEY (entry_shared_id) REFERENCES entry(shared_id) ON DELETE CASCADE
    ) ENGINE=InnoDB"#,
    r#"CREATE TABLE IF NOT EXISTS metadata (
        meta_key VARCHAR(255) NOT NULL PRIMARY KEY,
        meta_value VARCHAR(12000) NOT NULL
    ) ENGINE=InnoDB"#,
    r#"CREATE TABLE IF NOT EXISTS change_log (
        seq BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        shared_id BIGINT NULL,
        change_kind VARCHAR(16) NOT NULL,
        version BIGINT NOT NULL,
        processor_tag VARCHAR(64) NOT NULL
    ) ENGINE=InnoDB"#,
];

/// DDL statements for a backend, to be executed one at a time in order
pub fn ddl(backend: BackendKind) -> &'static [&'static str] {
    match backend {
        BackendKind::PostgreSql => POSTGRES_DDL,
        BackendKind::MySql => MYSQL_DDL,
        BackendKind::Sqlite => SQLITE_DDL,
    }
}
