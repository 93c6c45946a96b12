//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use bibshare_core::{LocalEntry, SyncEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a list of library entries
    pub fn print_entries(&self, entries: &[LocalEntry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No entries found.");
                    return;
                }
                for entry in entries {
                    let version = entry
                        .expected_version()
                        .map(|v| format!("v{}", v))
                        .unwrap_or_else(|| "local".to_string());
                    println!(
                        "{} | {:<14} | {} | {}",
                        &entry.uid.to_string()[..8],
                        truncate(&entry.entry_type, 14),
                        truncate(entry.field("title").unwrap_or("(untitled)"), 45),
                        version
                    );
                }
                println!("\n{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            }
            OutputFormat::Json => print_json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.uid);
                }
            }
        }
    }

    /// Print one synchronizer event
    ///
    /// JSON mode writes one object per line so the stream can be piped.
    pub fn print_event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => println!("{}", describe_event(event)),
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to serialize event: {}", e),
            },
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Pretty-print any serializable value
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::StateChanged { state } => format!("[state] {}", state),
        SyncEvent::ConnectionLost { reason } => format!("[connection lost] {}", reason),
        SyncEvent::SharedEntriesNotPresent { entries } => {
            let uids: Vec<String> = entries.iter().map(|e| e.uid.to_string()).collect();
            format!("[deleted remotely] {}", uids.join(", "))
        }
        SyncEvent::UpdateRefused { local, remote } => format!(
            "[conflict] {} changed remotely, now at version {}",
            local.uid, remote.version
        ),
        SyncEvent::MetadataUpdateRefused { remote, .. } => format!(
            "[conflict] metadata changed remotely, now at version {}",
            remote.version
        ),
        SyncEvent::RemoteChangesApplied { summary } => format!(
            "[pulled] +{} ~{} -{}{}",
            summary.added,
            summary.updated,
            summary.removed,
            if summary.metadata_changed { " (metadata)" } else { "" }
        ),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibshare_core::{PullSummary, SessionState, Watermark};

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("Übersetzungsprobleme", 8), "Übers...");
    }

    #[test]
    fn test_describe_event() {
        let state = SyncEvent::StateChanged {
            state: SessionState::Pulling,
        };
        assert_eq!(describe_event(&state), "[state] pulling");

        let pulled = SyncEvent::RemoteChangesApplied {
            summary: PullSummary {
                added: 2,
                updated: 1,
                removed: 0,
                metadata_changed: true,
                watermark: Watermark(7),
            },
        };
        assert_eq!(describe_event(&pulled), "[pulled] +2 ~1 -0 (metadata)");
    }
}
