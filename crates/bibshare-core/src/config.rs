//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/bibshare/config.toml)
//! 3. Environment variables (BIBSHARE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::connection::{ConnectionProperties, Timeouts};
use crate::sync::{ListenerSettings, SyncSettings};

/// Environment variable prefix
const ENV_PREFIX: &str = "BIBSHARE";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (autosave snapshots)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Shared database to connect to
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Synchronizer tuning
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: None,
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// `[connection]` section
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,

    /// Only written to disk when `remember_password` is set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default)]
    pub remember_password: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: String::new(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            remember_password: false,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("backend", &self.backend)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("remember_password", &self.remember_password)
            .finish()
    }
}

/// `[sync]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Change-log poll interval (MySQL, SQLite)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Listener reconnect attempts before reporting the connection lost
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_reconnect_delay")]
    pub initial_reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,

    /// Pull automatically when another session commits
    #[serde(default = "default_true")]
    pub listen_for_changes: bool,

    /// Push local edits as they happen
    #[serde(default = "default_true")]
    pub push_local_changes: bool,

    /// Snapshot file written after every pull that changed something
    #[serde(default)]
    pub autosave_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_retries: default_max_retries(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            listen_for_changes: true,
            push_local_changes: true,
            autosave_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (BIBSHARE_HOST, BIBSHARE_DATABASE, ...)
    /// 2. Config file (~/.config/bibshare/config.toml or BIBSHARE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = env_var("LOG_FILE") {
            self.log_file = non_empty(val).map(PathBuf::from);
        }

        let conn = &mut self.connection;
        if let Some(val) = env_var("BACKEND") {
            conn.backend = BackendKind::parse(&val)
                .with_context(|| format!("Unknown backend in {}_BACKEND: {}", ENV_PREFIX, val))?;
        }
        if let Some(val) = env_var("HOST") {
            conn.host = val;
        }
        if let Some(val) = env_var("PORT") {
            conn.port = match non_empty(val) {
                Some(port) => Some(
                    port.parse()
                        .with_context(|| format!("Invalid port in {}_PORT: {}", ENV_PREFIX, port))?,
                ),
                None => None,
            };
        }
        if let Some(val) = env_var("DATABASE") {
            conn.database = val;
        }
        if let Some(val) = env_var("USER") {
            conn.user = val;
        }
        if let Some(val) = env_var("PASSWORD") {
            conn.password = val;
        }

        if let Some(val) = env_var("LISTEN") {
            self.sync.listen_for_changes = parse_bool(&val);
        }
        if let Some(val) = env_var("PUSH") {
            self.sync.push_local_changes = parse_bool(&val);
        }
        if let Some(val) = env_var("AUTOSAVE") {
            self.sync.autosave_path = non_empty(val).map(PathBuf::from);
        }
        Ok(())
    }

    /// Set a single value by dotted key, as used by `bibshare config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "log_file" => self.log_file = non_empty(value.to_string()).map(PathBuf::from),
            "connection.backend" => {
                self.connection.backend = BackendKind::parse(value)
                    .with_context(|| format!("Unknown backend: {}", value))?
            }
            "connection.host" => self.connection.host = value.to_string(),
            "connection.port" => {
                self.connection.port = match value {
                    "" => None,
                    port => Some(port.parse().with_context(|| format!("Invalid port: {}", port))?),
                }
            }
            "connection.database" => self.connection.database = value.to_string(),
            "connection.user" => self.connection.user = value.to_string(),
            "connection.password" => self.connection.password = value.to_string(),
            "connection.remember_password" => self.connection.remember_password = parse_bool(value),
            "sync.connect_timeout_secs" => self.sync.connect_timeout_secs = parse_number(key, value)?,
            "sync.read_timeout_secs" => self.sync.read_timeout_secs = parse_number(key, value)?,
            "sync.poll_interval_ms" => self.sync.poll_interval_ms = parse_number(key, value)?,
            "sync.max_retries" => self.sync.max_retries = parse_number(key, value)?,
            "sync.initial_reconnect_delay_ms" => {
                self.sync.initial_reconnect_delay_ms = parse_number(key, value)?
            }
            "sync.max_reconnect_delay_ms" => {
                self.sync.max_reconnect_delay_ms = parse_number(key, value)?
            }
            "sync.listen_for_changes" => self.sync.listen_for_changes = parse_bool(value),
            "sync.push_local_changes" => self.sync.push_local_changes = parse_bool(value),
            "sync.autosave_path" => {
                self.sync.autosave_path = non_empty(value.to_string()).map(PathBuf::from)
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(&self.persisted())
            .context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Copy that is safe to write to disk
    fn persisted(&self) -> Config {
        let mut config = self.clone();
        if !config.connection.remember_password {
            config.connection.password.clear();
        }
        config
    }

    /// Get the config file path
    ///
    /// Can be overridden with BIBSHARE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bibshare")
            .join("config.toml")
    }

    /// Default snapshot path used by `export` and autosave
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("library.json")
    }

    /// Connection properties for the configured shared database
    pub fn connection_properties(&self) -> ConnectionProperties {
        let conn = &self.connection;
        ConnectionProperties {
            backend: conn.backend,
            host: conn.host.clone(),
            port: conn.port,
            database: conn.database.clone(),
            user: conn.user.clone(),
            password: conn.password.clone(),
        }
    }

    /// Connect and read timeouts
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.sync.connect_timeout_secs),
            read: Duration::from_secs(self.sync.read_timeout_secs),
        }
    }

    /// Synchronizer settings
    pub fn sync_settings(&self) -> SyncSettings {
        let sync = &self.sync;
        SyncSettings {
            listen_for_changes: sync.listen_for_changes,
            push_local_changes: sync.push_local_changes,
            autosave_path: sync.autosave_path.clone(),
            listener: ListenerSettings {
                poll_interval: Duration::from_millis(sync.poll_interval_ms),
                initial_reconnect_delay: Duration::from_millis(sync.initial_reconnect_delay_ms),
                max_reconnect_delay: Duration::from_millis(sync.max_reconnect_delay_ms),
                max_retries: sync.max_retries,
                timeouts: self.timeouts(),
                ..ListenerSettings::default()
            },
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .ok()
        .with_context(|| format!("Invalid number for {}: {}", key, value))
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bibshare")
}

fn default_backend() -> BackendKind {
    BackendKind::PostgreSql
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_reconnect_delay() -> u64 {
    1000
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "BIBSHARE_DATA_DIR",
        "BIBSHARE_LOG_FILE",
        "BIBSHARE_BACKEND",
        "BIBSHARE_HOST",
        "BIBSHARE_PORT",
        "BIBSHARE_DATABASE",
        "BIBSHARE_USER",
        "BIBSHARE_PASSWORD",
        "BIBSHARE_LISTEN",
        "BIBSHARE_PUSH",
        "BIBSHARE_AUTOSAVE",
        "BIBSHARE_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config::load_from_str("").unwrap();
        assert_eq!(config.connection.backend, BackendKind::PostgreSql);
        assert!(config.sync.listen_for_changes);
        assert!(config.sync.push_local_changes);
        assert_eq!(config.sync.poll_interval_ms, 2000);
        assert!(config.snapshot_path().ends_with("library.json"));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"

            [connection]
            backend = "mysql"
            host = "db.example.org"
            database = "biblio"
            user = "alice"

            [sync]
            read_timeout_secs = 3
            listen_for_changes = false
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.connection.backend, BackendKind::MySql);
        assert_eq!(config.connection.port, None);
        assert_eq!(config.timeouts().read, Duration::from_secs(3));
        assert!(!config.sync_settings().listen_for_changes);

        let props = config.connection_properties();
        assert!(props.is_valid());
        assert_eq!(props.port_or_default(), Some(3306));
    }

    #[test]
    fn test_env_overrides_connection() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("BIBSHARE_BACKEND", "sqlite");
        env::set_var("BIBSHARE_DATABASE", "/tmp/shared.db");
        env::set_var("BIBSHARE_PORT", "6543");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.connection.backend, BackendKind::Sqlite);
        assert_eq!(config.connection.database, "/tmp/shared.db");
        assert_eq!(config.connection.port, Some(6543));

        // Empty string clears the port
        env::set_var("BIBSHARE_PORT", "");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.connection.port, None);
    }

    #[test]
    fn test_env_override_rejects_bad_values() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("BIBSHARE_BACKEND", "oracle-ish");
        assert!(config.apply_env_overrides().is_err());

        env::remove_var("BIBSHARE_BACKEND");
        env::set_var("BIBSHARE_PORT", "not-a-port");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_env_override_flags() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("BIBSHARE_LISTEN", "false");
        env::set_var("BIBSHARE_PUSH", "0");
        env::set_var("BIBSHARE_AUTOSAVE", "/tmp/lib.json");
        config.apply_env_overrides().unwrap();

        assert!(!config.sync.listen_for_changes);
        assert!(!config.sync.push_local_changes);
        assert_eq!(config.sync.autosave_path, Some(PathBuf::from("/tmp/lib.json")));

        env::set_var("BIBSHARE_LISTEN", "1");
        config.apply_env_overrides().unwrap();
        assert!(config.sync.listen_for_changes);
    }

    #[test]
    fn test_password_only_saved_when_remembered() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.connection.password = "secret".to_string();
        config.save_to_path(&path).unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains("secret"));

        config.connection.remember_password = true;
        config.save_to_path(&path).unwrap();
        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.connection.password, "secret");
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();
        config.set_value("connection.host", "db.local").unwrap();
        config.set_value("connection.port", "5433").unwrap();
        config.set_value("sync.poll_interval_ms", "250").unwrap();
        config.set_value("sync.push_local_changes", "false").unwrap();

        assert_eq!(config.connection.host, "db.local");
        assert_eq!(config.connection.port, Some(5433));
        assert_eq!(
            config.sync_settings().listener.poll_interval,
            Duration::from_millis(250)
        );
        assert!(!config.sync.push_local_changes);

        assert!(config.set_value("sync.max_retries", "many").is_err());
        assert!(config.set_value("nope", "x").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = ConnectionConfig::default();
        config.password = "hunter2".to_string();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.connection.host.is_empty());
        assert!(config.sync.autosave_path.is_none());
    }
}
