//! Shared database access
//!
//! - `schema`: table layout and schema classification
//! - `dialect`: per-engine SQL differences
//! - `processor`: entry, field and metadata operations
//! - `error`: typed processor errors

mod dialect;
mod error;
mod processor;
pub mod schema;

pub use dialect::{Dialect, NOTIFY_CHANNEL};
pub use error::{ProcessorError, ProcessorResult};
pub use processor::{ChangeBatch, Processor, READ_PARTITION};
pub use schema::{SchemaStatus, SCHEMA_VERSION};
