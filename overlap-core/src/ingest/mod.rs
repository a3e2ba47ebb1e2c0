//! Journal ingestion: tailing agent journals and deriving typed events.
//!
//! The seam between the supervisor and any particular coding agent is the
//! [`AgentAdapter`] trait. An adapter knows where its agent writes journals,
//! how to pull a session id out of a journal path, and how to turn one
//! journal record plus a mutable [`SessionAccumulator`] into zero or more
//! [`Event`]s. The supervisor never looks inside records itself.
//!
//! ## Design principles
//!
//! 1. **Purity**: `parse_line` touches nothing but its arguments, so parsing
//!    the same bytes twice with a fresh accumulator yields the same events
//!    regardless of how reads were segmented.
//! 2. **Resilience**: malformed records yield no events and leave the
//!    accumulator untouched.
//! 3. **Extensible**: a new agent is one more `AgentAdapter` instance; the
//!    supervisor does not change.

pub mod claude;
pub mod reader;

pub use claude::ClaudeCodeAdapter;
pub use reader::{JournalReader, ReadBatch};

use std::path::{Path, PathBuf};

use crate::types::{Event, SessionAccumulator};

/// Capability set for one supported coding agent.
pub trait AgentAdapter: Send + Sync {
    /// Short identifier stamped onto derived events (e.g. `claude-code`).
    fn agent_type(&self) -> &'static str;

    /// Root directory the agent writes journals under.
    ///
    /// Returns `None` if the location cannot be determined (e.g. no home
    /// directory).
    fn watch_dir(&self) -> Option<PathBuf>;

    /// Journal file extension, without the dot.
    fn file_extension(&self) -> &'static str;

    /// Derive a session id from a journal path (used when records carry
    /// none).
    fn extract_session_id(&self, path: &Path) -> Option<String>;

    /// Parse one journal record into events, updating the accumulator.
    fn parse_line(
        &self,
        line: &str,
        session_id: &str,
        acc: &mut SessionAccumulator,
    ) -> Vec<Event>;

    /// Whether a path looks like one of this agent's journal files.
    fn matches_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == self.file_extension())
            .unwrap_or(false)
    }

    /// Discover existing journal files under the watch directory.
    fn discover_files(&self) -> Vec<PathBuf> {
        let Some(root) = self.watch_dir() else {
            return Vec::new();
        };
        let pattern = root
            .join("**")
            .join(format!("*.{}", self.file_extension()));
        let Ok(entries) = glob::glob(&pattern.to_string_lossy()) else {
            return Vec::new();
        };
        entries.flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_finds_nested_journals() {
        struct TempAdapter(PathBuf);
        impl AgentAdapter for TempAdapter {
            fn agent_type(&self) -> &'static str {
                "test"
            }
            fn watch_dir(&self) -> Option<PathBuf> {
                Some(self.0.clone())
            }
            fn file_extension(&self) -> &'static str {
                "jsonl"
            }
            fn extract_session_id(&self, path: &Path) -> Option<String> {
                path.file_stem().map(|s| s.to_string_lossy().into_owned())
            }
            fn parse_line(&self, _: &str, _: &str, _: &mut SessionAccumulator) -> Vec<Event> {
                Vec::new()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("projects").join("-w-repo");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("s1.jsonl"), "{}\n").unwrap();
        std::fs::write(nested.join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("top.jsonl"), "{}\n").unwrap();

        let adapter = TempAdapter(dir.path().to_path_buf());
        let mut found = adapter.discover_files();
        found.sort();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().unwrap() == "jsonl"));

        assert!(adapter.matches_path(Path::new("/x/y.jsonl")));
        assert!(!adapter.matches_path(Path::new("/x/y.log")));
    }
}
