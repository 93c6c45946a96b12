//! Processor tags
//!
//! Every session stamps its writes with a tag so that its own change
//! notifications can be told apart from foreign ones.

use std::fmt;

use chrono::Utc;
use uuid::Uuid;

/// Per-session identifier embedded in every write and notification
///
/// Built from the process id, the session start time and a random suffix,
/// so two sessions inside one process still get distinct tags. The tag
/// only ever contains lowercase hex digits and dashes, which keeps it safe
/// to inline as a SQL string literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorTag(String);

impl ProcessorTag {
    /// Generate a fresh tag for a new session
    pub fn generate() -> Self {
        let pid = std::process::id();
        let started = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{:x}-{:x}-{}", pid, started, &suffix[..8]))
    }

    /// The tag as stored in the `change_log` and sent as notification payload
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a notification payload originated from this session
    pub fn is_own(&self, payload: &str) -> bool {
        self.0 == payload.trim()
    }
}

impl fmt::Display for ProcessorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        let a = ProcessorTag::generate();
        let b = ProcessorTag::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tag_charset_is_literal_safe() {
        let tag = ProcessorTag::generate();
        assert!(tag
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-'));
        assert!(tag.as_str().len() <= 64);
    }

    #[test]
    fn test_is_own() {
        let tag = ProcessorTag::generate();
        assert!(tag.is_own(tag.as_str()));
        assert!(!tag.is_own("someone-else"));
    }
}
