//! Backend descriptors
//!
//! Static knowledge about each supported relational engine family: the
//! driver that talks to it, the connection URL template and the default
//! port. Nothing in here touches the network.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported relational engine families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PostgreSQL (live updates via LISTEN/NOTIFY)
    #[serde(alias = "postgres")]
    PostgreSql,
    /// MySQL and MariaDB
    MySql,
    /// SQLite file on a shared path
    Sqlite,
}

/// Static facts about a backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Driver used to reach the backend
    pub driver: &'static str,
    /// URL template with `{host}`, `{port}` and `{database}` placeholders
    pub url_template: &'static str,
    /// Port used when none is configured (`None` for file-based engines)
    pub default_port: Option<u16>,
}

const POSTGRESQL: BackendDescriptor = BackendDescriptor {
    driver: "sqlx-postgres",
    url_template: "postgres://{host}:{port}/{database}",
    default_port: Some(5432),
};

const MYSQL: BackendDescriptor = BackendDescriptor {
    driver: "sqlx-mysql",
    url_template: "mysql://{host}:{port}/{database}",
    default_port: Some(3306),
};

const SQLITE: BackendDescriptor = BackendDescriptor {
    driver: "sqlx-sqlite",
    url_template: "sqlite://{database}?mode=rwc",
    default_port: None,
};

impl BackendKind {
    /// All supported families, in display order
    pub const ALL: [BackendKind; 3] = [BackendKind::PostgreSql, BackendKind::MySql, BackendKind::Sqlite];

    /// Parse a family name
    ///
    /// Case-insensitive and accepts the usual aliases. Unknown names yield
    /// `None` rather than an error.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Some(BackendKind::PostgreSql),
            "mysql" | "mariadb" => Some(BackendKind::MySql),
            "sqlite" | "sqlite3" => Some(BackendKind::Sqlite),
            _ => None,
        }
    }

    /// Static descriptor for this family
    pub fn descriptor(&self) -> &'static BackendDescriptor {
        match self {
            BackendKind::PostgreSql => &POSTGRESQL,
            BackendKind::MySql => &MYSQL,
            BackendKind::Sqlite => &SQLITE,
        }
    }

    /// Whether the family is a network server (host, port and user apply)
    pub fn is_server(&self) -> bool {
        !matches!(self, BackendKind::Sqlite)
    }

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::PostgreSql => "postgresql",
            BackendKind::MySql => "mysql",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::PostgreSql => "PostgreSQL",
            BackendKind::MySql => "MySQL",
            BackendKind::Sqlite => "SQLite",
        };
        f.write_str(label)
    }
}

impl BackendDescriptor {
    /// Substitute host, port and database into the URL template
    ///
    /// Pure string substitution: no validation and no network access.
    pub fn build_url(&self, host: &str, port: Option<u16>, database: &str) -> String {
        let port = port
            .or(self.default_port)
            .map(|p| p.to_string())
            .unwrap_or_default();
        self.url_template
            .replace("{host}", host)
            .replace("{port}", &port)
            .replace("{database}", database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(BackendKind::parse("PostgreSQL"), Some(BackendKind::PostgreSql));
        assert_eq!(BackendKind::parse("pg"), Some(BackendKind::PostgreSql));
        assert_eq!(BackendKind::parse(" mariadb "), Some(BackendKind::MySql));
        assert_eq!(BackendKind::parse("sqlite3"), Some(BackendKind::Sqlite));
    }

    #[test]
    fn test_parse_unknown_is_none() {
        assert_eq!(BackendKind::parse("oracle"), None);
        assert_eq!(BackendKind::parse(""), None);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(BackendKind::PostgreSql.descriptor().default_port, Some(5432));
        assert_eq!(BackendKind::MySql.descriptor().default_port, Some(3306));
        assert_eq!(BackendKind::Sqlite.descriptor().default_port, None);
    }

    #[test]
    fn test_build_url_substitution() {
        let url = BackendKind::PostgreSql
            .descriptor()
            .build_url("db.example.org", Some(6543), "biblio");
        assert_eq!(url, "postgres://db.example.org:6543/biblio");

        let url = BackendKind::MySql.descriptor().build_url("localhost", None, "refs");
        assert_eq!(url, "mysql://localhost:3306/refs");

        let url = BackendKind::Sqlite
            .descriptor()
            .build_url("", None, "/srv/shared/library.db");
        assert_eq!(url, "sqlite:///srv/shared/library.db?mode=rwc");
    }

    #[test]
    fn test_serde_names() {
        let kind: BackendKind = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(kind, BackendKind::PostgreSql);
        assert_eq!(serde_json::to_string(&BackendKind::MySql).unwrap(), "\"mysql\"");
    }
}
