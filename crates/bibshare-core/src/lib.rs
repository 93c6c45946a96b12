//! bibshare core library
//!
//! Keeps an in-memory bibliographic library in sync with a shared
//! relational database so that several users can edit the same library at
//! once.
//!
//! # Architecture
//!
//! - **Shared database**: the source of truth. Every entry row carries a
//!   version counter; writes are conditional on the version the writer last
//!   saw (optimistic locking).
//! - **Library**: the local working copy, fed by pulls and observed for
//!   local edits.
//! - **Synchronizer**: pulls remote changes when a listener reports a
//!   foreign commit, pushes local edits, and surfaces conflicts as events
//!   instead of merging them.
//!
//! # Quick Start
//!
//! ```text
//! let props = ConnectionProperties::sqlite("/shared/library.db");
//! let conn = DatabaseConnection::connect(props, Timeouts::default()).await?;
//!
//! let sync = Synchronizer::new(Library::new(), SyncSettings::default());
//! sync.open_shared_database(conn).await?;
//!
//! let uid = sync.library().insert_entry(LocalEntry::new("article"))?;
//! sync.synchronize_shared_entry(uid).await?;
//! ```
//!
//! # Modules
//!
//! - `backend`: engine families and connection URL templates
//! - `connection`: connection properties and live connections
//! - `shared`: schema and SQL operations on the shared database
//! - `sync`: synchronizer, foreign change listeners and events
//! - `library`: in-memory library and its change events
//! - `models`: shared and local entry types
//! - `config`: application configuration

pub mod backend;
pub mod config;
pub mod connection;
pub mod library;
pub mod models;
pub mod shared;
pub mod sync;
pub mod tag;

pub use backend::{BackendDescriptor, BackendKind};
pub use config::Config;
pub use connection::{ConnectionError, ConnectionProperties, DatabaseConnection, Timeouts};
pub use library::{EventSource, Library, LibraryError, LibraryEvent, LibrarySnapshot};
pub use models::{LocalEntry, SharedEntry, SharedId, SharedMetadata, SharedRef, Version, Watermark};
pub use shared::{Processor, ProcessorError, SchemaStatus};
pub use sync::{PullSummary, Resolution, SessionState, SyncError, SyncEvent, SyncSettings, Synchronizer};
pub use tag::ProcessorTag;
