//! Synchronization between a local library and a shared database
//!
//! - `synchronizer`: session lifecycle, pulls, pushes and conflict handling
//! - `listener`: detection of commits made by other sessions
//! - `events`: notifications for the document/UI layer
//! - `state`: session state machine
//! - `error`: synchronizer errors

mod error;
mod events;
pub mod listener;
mod state;
mod synchronizer;

pub use error::SyncError;
pub use events::{PullSummary, SyncEvent};
pub use listener::{
    listener_for, ForeignChangeListener, ListenerHandle, ListenerSettings, ListenerSignal,
};
pub use state::SessionState;
pub use synchronizer::{Resolution, SyncSettings, Synchronizer};
