//! Connection properties and live connections
//!
//! [`ConnectionProperties`] is the parameter surface (engine family, host,
//! port, database, credentials). [`DatabaseConnection`] wraps a live driver
//! handle; every blocking call on it is bounded by [`Timeouts`].

use std::fmt;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{AnyConnection, Connection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::BackendKind;

/// Errors raised while validating properties or establishing a connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// A required property is empty
    #[error("Required field \"{0}\" is empty.")]
    MissingField(&'static str),

    /// Connecting took longer than the configured timeout
    #[error("Connecting to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The driver reported an error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ConnectionError {
    /// Check if retrying later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConnectionError::MissingField(_) => false,
            ConnectionError::Timeout { .. } => true,
            ConnectionError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            ConnectionError::MissingField(_) => {
                Some("Fill in every required connection property and try again.")
            }
            ConnectionError::Timeout { .. } => {
                Some("Check that the database server is reachable and the port is correct.")
            }
            ConnectionError::Database(sqlx::Error::Configuration(_)) => {
                Some("Check the backend type, host and database name.")
            }
            _ => None,
        }
    }
}

/// Bounds for blocking driver calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound for establishing a connection
    pub connect: Duration,
    /// Upper bound for a single statement round trip
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

/// Where and how to reach a shared database
///
/// Immutable once a connection has been established from it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Engine family
    pub backend: BackendKind,
    /// Server host name (ignored for SQLite)
    #[serde(default)]
    pub host: String,
    /// Server port, backend default when unset
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name, or file path for SQLite
    pub database: String,
    /// User name (ignored for SQLite)
    #[serde(default)]
    pub user: String,
    /// Password (ignored for SQLite)
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ConnectionProperties {
    /// Properties for a SQLite database file
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            host: String::new(),
            port: None,
            database: path.into(),
            user: String::new(),
            password: String::new(),
        }
    }

    /// Structural check only; does not contact the server
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Return the first missing required property
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.backend.is_server() {
            if self.host.trim().is_empty() {
                return Err(ConnectionError::MissingField("host"));
            }
            if self.user.trim().is_empty() {
                return Err(ConnectionError::MissingField("user"));
            }
        }
        if self.database.trim().is_empty() {
            return Err(ConnectionError::MissingField("database"));
        }
        Ok(())
    }

    /// Configured port or the backend default
    pub fn port_or_default(&self) -> Option<u16> {
        self.port.or(self.backend.descriptor().default_port)
    }

    /// Driver URL including credentials
    pub fn connection_url(&self) -> String {
        let url = self
            .backend
            .descriptor()
            .build_url(&self.host, self.port_or_default(), &self.database);
        if !self.backend.is_server() {
            return url;
        }

        let credentials = if self.password.is_empty() {
            urlencoding::encode(&self.user).into_owned()
        } else {
            format!(
                "{}:{}",
                urlencoding::encode(&self.user),
                urlencoding::encode(&self.password)
            )
        };
        match url.split_once("://") {
            Some((scheme, rest)) => format!("{}://{}@{}", scheme, credentials, rest),
            None => url,
        }
    }

    /// Human-readable target without credentials, for logs and messages
    pub fn display_target(&self) -> String {
        if self.backend.is_server() {
            format!(
                "{} {}@{}:{}/{}",
                self.backend,
                self.user,
                self.host,
                self.port_or_default().unwrap_or_default(),
                self.database
            )
        } else {
            format!("{} {}", self.backend, self.database)
        }
    }

    /// Whether both property sets point at the same database as the same user
    pub fn same_target(&self, other: &ConnectionProperties) -> bool {
        self.backend == other.backend
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port_or_default() == other.port_or_default()
            && self.database == other.database
            && self.user == other.user
    }
}

static INSTALL_DRIVERS: Once = Once::new();

/// Register the sqlx drivers behind `AnyConnection`
pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

/// Open a raw driver connection bounded by the connect timeout
pub(crate) async fn open_raw(
    properties: &ConnectionProperties,
    timeouts: Timeouts,
) -> Result<AnyConnection, ConnectionError> {
    properties.validate()?;
    install_drivers();

    let target = properties.display_target();
    debug!(target = %target, "Connecting");
    let url = properties.connection_url();
    match tokio::time::timeout(timeouts.connect, AnyConnection::connect(&url)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(ConnectionError::Database(e)),
        Err(_) => Err(ConnectionError::Timeout {
            target,
            timeout: timeouts.connect,
        }),
    }
}

/// A live connection to a shared database
///
/// Not thread-safe; the synchronizer only touches it while holding its
/// session lock.
pub struct DatabaseConnection {
    properties: ConnectionProperties,
    timeouts: Timeouts,
    conn: AnyConnection,
}

impl DatabaseConnection {
    /// Validate the properties and connect
    pub async fn connect(
        properties: ConnectionProperties,
        timeouts: Timeouts,
    ) -> Result<Self, ConnectionError> {
        let conn = open_raw(&properties, timeouts).await?;
        info!(target = %properties.display_target(), "Connected to shared database");
        Ok(Self {
            properties,
            timeouts,
            conn,
        })
    }

    /// Properties this connection was established from
    pub fn properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    /// Engine family
    pub fn backend(&self) -> BackendKind {
        self.properties.backend
    }

    /// Configured bounds for blocking calls
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Liveness check bounded by the read timeout
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        match tokio::time::timeout(self.timeouts.read, self.conn.ping()).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout {
                target: self.properties.display_target(),
                timeout: self.timeouts.read,
            }),
        }
    }

    /// Release the connection
    pub async fn close(self) {
        let target = self.properties.display_target();
        match tokio::time::timeout(self.timeouts.read, self.conn.close()).await {
            Ok(Ok(())) => debug!(target = %target, "Connection closed"),
            Ok(Err(e)) => warn!(target = %target, error = %e, "Error while closing connection"),
            Err(_) => warn!(target = %target, "Timed out while closing connection"),
        }
    }

    pub(crate) fn handle(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }
}
