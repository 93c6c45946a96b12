//! Session state machine
//!
//! `Connecting -> Synchronized -> (Pulling | Pushing) -> Synchronized`,
//! with `Disconnected` reachable from anywhere.

use std::fmt;

use serde::Serialize;

/// State of a shared-database session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session open
    Disconnected,
    /// Opening: schema check and initial load in progress
    Connecting,
    /// Idle and consistent with the last pull
    Synchronized,
    /// Applying remote changes
    Pulling,
    /// Writing a local change
    Pushing,
}

impl SessionState {
    /// Whether a session is open (all states except connecting and disconnected)
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Synchronized | SessionState::Pulling | SessionState::Pushing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Synchronized => "synchronized",
            SessionState::Pulling => "pulling",
            SessionState::Pushing => "pushing",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_open() {
        assert!(SessionState::Synchronized.is_open());
        assert!(SessionState::Pushing.is_open());
        assert!(!SessionState::Connecting.is_open());
        assert!(!SessionState::Disconnected.is_open());
    }

    #[test]
    fn test_display_matches_serde() {
        for state in [SessionState::Disconnected, SessionState::Pulling] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
