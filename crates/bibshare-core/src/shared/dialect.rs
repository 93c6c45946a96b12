//! Per-engine SQL dialect differences
//!
//! Statements are written once with `?` placeholders and adjusted here for
//! the engine in use. Everything that differs between engines beyond the
//! connection URL lives in this module.

use std::borrow::Cow;

use crate::backend::BackendKind;

/// Channel used for LISTEN/NOTIFY on PostgreSQL
pub const NOTIFY_CHANNEL: &str = "bibshare_live_update";

/// SQL flavour of one backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    backend: BackendKind,
}

impl Dialect {
    pub fn new(backend: BackendKind) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Rewrite `?` placeholders into the engine's bind syntax
    ///
    /// PostgreSQL wants numbered `$n` parameters. Question marks inside
    /// single-quoted literals are left alone.
    pub fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        if self.backend != BackendKind::PostgreSql || !query.contains('?') {
            return Cow::Borrowed(query);
        }

        let mut out = String::with_capacity(query.len() + 8);
        let mut n = 0;
        let mut in_literal = false;
        for c in query.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '?' if !in_literal => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }
        Cow::Owned(out)
    }

    /// Comma-separated placeholder list for an `IN (...)` clause
    pub fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }

    /// Statement opening a write transaction
    ///
    /// SQLite takes the write lock up front so concurrent writers wait on
    /// the busy timeout instead of failing on lock upgrade.
    pub fn begin(&self) -> &'static str {
        match self.backend {
            BackendKind::PostgreSql => "BEGIN",
            BackendKind::MySql => "START TRANSACTION",
            BackendKind::Sqlite => "BEGIN IMMEDIATE",
        }
    }

    /// Row-lock suffix for reads that precede a conditional write
    pub fn for_update(&self) -> &'static str {
        match self.backend {
            BackendKind::Sqlite => "",
            BackendKind::PostgreSql | BackendKind::MySql => " FOR UPDATE",
        }
    }

    /// Insert or overwrite one metadata row (binds: key, value)
    pub fn upsert_metadata(&self) -> &'static str {
        match self.backend {
            BackendKind::MySql => {
                "INSERT INTO metadata (meta_key, meta_value) VALUES (?, ?) \
                 ON DUPLICATE KEY UPDATE meta_value = VALUES(meta_value)"
            }
            BackendKind::PostgreSql | BackendKind::Sqlite => {
                "INSERT INTO metadata (meta_key, meta_value) VALUES (?, ?) \
                 ON CONFLICT (meta_key) DO UPDATE SET meta_value = excluded.meta_value"
            }
        }
    }

    /// Insert a metadata row unless the key exists (binds: key, value)
    pub fn insert_metadata_if_absent(&self) -> &'static str {
        match self.backend {
            BackendKind::MySql => "INSERT IGNORE INTO metadata (meta_key, meta_value) VALUES (?, ?)",
            BackendKind::PostgreSql | BackendKind::Sqlite => {
                "INSERT INTO metadata (meta_key, meta_value) VALUES (?, ?) ON CONFLICT (meta_key) DO NOTHING"
            }
        }
    }

    /// Query listing the tables of the current database as `table_name`
    pub fn list_tables(&self) -> &'static str {
        match self.backend {
            BackendKind::PostgreSql => {
                "SELECT CAST(table_name AS VARCHAR) AS table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema()"
            }
            BackendKind::MySql => {
                "SELECT CAST(TABLE_NAME AS CHAR) AS table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE()"
            }
            BackendKind::Sqlite => {
                "SELECT name AS table_name FROM sqlite_master WHERE type = 'table'"
            }
        }
    }

    /// Statement announcing a commit to other sessions, if the engine has a
    /// notification channel
    ///
    /// The payload is inlined because NOTIFY takes no bind parameters; the
    /// tag alphabet is restricted to hex digits and dashes.
    pub fn notify(&self, tag: &str) -> Option<String> {
        match self.backend {
            BackendKind::PostgreSql => Some(format!("NOTIFY {}, '{}'", NOTIFY_CHANNEL, tag)),
            BackendKind::MySql | BackendKind::Sqlite => None,
        }
    }

    /// Whether foreign commits arrive over a server push channel
    pub fn has_notify_channel(&self) -> bool {
        self.backend == BackendKind::PostgreSql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_numbers_placeholders_for_postgres() {
        let pg = Dialect::new(BackendKind::PostgreSql);
        assert_eq!(
            pg.sql("UPDATE entry SET version = ? WHERE shared_id = ? AND version = ?"),
            "UPDATE entry SET version = $1 WHERE shared_id = $2 AND version = $3"
        );
    }

    #[test]
    fn test_sql_skips_literals() {
        let pg = Dialect::new(BackendKind::PostgreSql);
        assert_eq!(
            pg.sql("SELECT '?' AS q, meta_value FROM metadata WHERE meta_key = ?"),
            "SELECT '?' AS q, meta_value FROM metadata WHERE meta_key = $1"
        );
    }

    #[test]
    fn test_sql_untouched_elsewhere() {
        let query = "SELECT * FROM entry WHERE shared_id = ?";
        assert!(matches!(
            Dialect::new(BackendKind::MySql).sql(query),
            Cow::Borrowed(_)
        ));
        assert_eq!(Dialect::new(BackendKind::Sqlite).sql(query), query);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::placeholders(3), "?, ?, ?");
        assert_eq!(Dialect::placeholders(1), "?");
    }

    #[test]
    fn test_notify_only_on_postgres() {
        assert_eq!(
            Dialect::new(BackendKind::PostgreSql).notify("ab-12").as_deref(),
            Some("NOTIFY bibshare_live_update, 'ab-12'")
        );
        assert!(Dialect::new(BackendKind::Sqlite).notify("ab-12").is_none());
        assert!(!Dialect::new(BackendKind::MySql).has_notify_channel());
    }

    #[test]
    fn test_begin_statements() {
        assert_eq!(Dialect::new(BackendKind::Sqlite).begin(), "BEGIN IMMEDIATE");
        assert_eq!(Dialect::new(BackendKind::MySql).begin(), "START TRANSACTION");
        assert_eq!(Dialect::new(BackendKind::Sqlite).for_update(), "");
    }
}
