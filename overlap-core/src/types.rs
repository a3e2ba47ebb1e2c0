//! Core domain types for overlap.
//!
//! Everything here is tree-shaped and serde-serializable: events flow out to
//! team instances as JSON, tracked-file records persist to `state.json`, and
//! the team-state mirror round-trips through `team-state.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================
// Activity events
// ============================================

/// A typed activity event derived from an agent journal.
///
/// `event_type` is flattened into the JSON object from [`EventKind`], so the
/// wire shape is a single flat object per event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Filled by the sender at transmission time from the team config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Filled at routing time once the journal's repo is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    pub agent_type: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Variant payloads, tagged as `event_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    SessionStart {
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_remote_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_version: Option<String>,
        hostname: String,
        is_remote: bool,
        device_name: String,
    },
    FileOp {
        tool_name: String,
        /// Repo-relative after routing; `(bash)`, `(grep)`, `(glob)` for
        /// tool calls without a target file.
        file_path: String,
        operation: FileOperation,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_line: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_line: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        function_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bash_command: Option<String>,
        /// Carried for symbol resolution; stripped before transmission.
        #[serde(skip_serializing_if = "Option::is_none")]
        old_string: Option<String>,
        /// Carried for symbol resolution; stripped before transmission.
        #[serde(skip_serializing_if = "Option::is_none")]
        new_string: Option<String>,
    },
    Prompt {
        prompt_text: String,
        turn_number: u32,
    },
    AgentResponse {
        response_text: String,
        response_type: ResponseType,
        turn_number: u32,
    },
    SessionEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        turn_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_summary: Option<String>,
        files_touched: Vec<String>,
    },
}

/// What a tracked tool call did to its target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Read,
    Execute,
    Search,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Text,
    Thinking,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl Event {
    /// Strip fields designated local-only before transmission to any team.
    ///
    /// `old_string`/`new_string` are needed locally for symbol resolution but
    /// contain file content and never leave the machine.
    pub fn redact_for_send(&mut self) {
        if let EventKind::FileOp {
            old_string,
            new_string,
            ..
        } = &mut self.kind
        {
            *old_string = None;
            *new_string = None;
        }
    }

    pub fn is_file_op(&self) -> bool {
        matches!(self.kind, EventKind::FileOp { .. })
    }
}

// ============================================
// Tracked journal files and session state
// ============================================

/// Durable per-journal-file record.
///
/// Invariant: the byte range `[0, byte_offset)` has been parsed and every
/// derived event has been acknowledged by each team in `matched_teams`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedFile {
    pub byte_offset: u64,
    pub session_id: String,
    pub matched_teams: Vec<String>,
    pub matched_repo: String,
    /// Subdirectory name → repo name, for parent-of-subrepos sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_dir_repos: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub turn_number: u32,
    #[serde(default)]
    pub files_touched: Vec<String>,
    pub cwd: String,
}

/// Volatile per-session parse state, rebuilt from [`TrackedFile`] at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionAccumulator {
    pub turn_number: u32,
    pub files_touched: BTreeSet<String>,
    pub session_start_emitted: bool,
    pub branch_emitted: bool,
    pub model_emitted: bool,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
}

impl SessionAccumulator {
    /// Rebuild the accumulator from a persisted tracked-file record.
    ///
    /// A non-zero durable offset means the session's start (and any backfill
    /// visible so far) already went out; the flags are set so restarts never
    /// duplicate them.
    pub fn from_tracked(tracked: &TrackedFile) -> Self {
        let already_started = tracked.byte_offset > 0;
        Self {
            turn_number: tracked.turn_number,
            files_touched: tracked.files_touched.iter().cloned().collect(),
            session_start_emitted: already_started,
            branch_emitted: already_started,
            model_emitted: already_started,
            cwd: Some(tracked.cwd.clone()),
            git_branch: None,
            model: None,
        }
    }
}

// ============================================
// Repo rosters
// ============================================

/// The set of repos a team instance tracks, as of `fetched_at`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RepoRoster {
    #[serde(default)]
    pub repos: BTreeSet<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RepoRoster {
    pub fn contains(&self, name: &str) -> bool {
        self.repos.contains(name)
    }
}

// ============================================
// Team-state mirror
// ============================================

/// One teammate session as reported by a team instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamStateSession {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub repo_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub regions: Vec<SessionRegion>,
    /// Originating instance; tagged in by the poller when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
}

/// A file region a teammate session is actively touching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionRegion {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_touched_at: Option<DateTime<Utc>>,
}

/// On-disk shape of `team-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TeamStateMirror {
    #[serde(default)]
    pub sessions: Vec<TeamStateSession>,
    pub updated_at: DateTime<Utc>,
}

/// A mirror older than this is stale and yields no sessions.
pub const MIRROR_FRESHNESS_SECS: i64 = 120;

impl TeamStateMirror {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.updated_at).num_seconds() <= MIRROR_FRESHNESS_SECS
    }
}

// ============================================
// Overlap probe results
// ============================================

/// Overlap severity, ordered `line > function > adjacent > file`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum OverlapTier {
    File,
    Adjacent,
    Function,
    Line,
}

impl OverlapTier {
    /// `line` and `function` overlaps block; the rest only warn.
    pub fn blocks(self) -> bool {
        matches!(self, OverlapTier::Line | OverlapTier::Function)
    }
}

/// One detected collision with a teammate's active region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Overlap {
    pub tier: OverlapTier,
    pub file_path: String,
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeDecision {
    Proceed,
    Warn,
    Block,
}

/// Derive the probe decision from a set of overlaps.
pub fn decision_for(overlaps: &[Overlap]) -> ProbeDecision {
    if overlaps.iter().any(|o| o.tier.blocks()) {
        ProbeDecision::Block
    } else if overlaps.is_empty() {
        ProbeDecision::Proceed
    } else {
        ProbeDecision::Warn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_op_event() -> Event {
        Event {
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            user_id: None,
            repo_name: Some("repo".to_string()),
            agent_type: "claude-code".to_string(),
            kind: EventKind::FileOp {
                tool_name: "Edit".to_string(),
                file_path: "a.ts".to_string(),
                operation: FileOperation::Modify,
                start_line: Some(10),
                end_line: Some(12),
                function_name: Some("render".to_string()),
                bash_command: None,
                old_string: Some("x".to_string()),
                new_string: Some("y".to_string()),
            },
        }
    }

    #[test]
    fn event_type_tag_is_flattened() {
        let event = file_op_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "file_op");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["operation"], "modify");

        let prompt = Event {
            kind: EventKind::Prompt {
                prompt_text: "fix".to_string(),
                turn_number: 1,
            },
            ..file_op_event()
        };
        let json = serde_json::to_value(&prompt).unwrap();
        assert_eq!(json["event_type"], "prompt");
        assert_eq!(json["turn_number"], 1);
    }

    #[test]
    fn redaction_strips_edit_strings() {
        let mut event = file_op_event();
        event.redact_for_send();

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("old_string").is_none());
        assert!(json.get("new_string").is_none());
        // Enrichment survives redaction.
        assert_eq!(json["start_line"], 10);
        assert_eq!(json["function_name"], "render");
    }

    #[test]
    fn tier_ordering_and_blocking() {
        assert!(OverlapTier::Line > OverlapTier::Function);
        assert!(OverlapTier::Function > OverlapTier::Adjacent);
        assert!(OverlapTier::Adjacent > OverlapTier::File);
        assert!(OverlapTier::Line.blocks());
        assert!(OverlapTier::Function.blocks());
        assert!(!OverlapTier::Adjacent.blocks());
        assert!(!OverlapTier::File.blocks());
    }

    #[test]
    fn decision_from_overlaps() {
        let mk = |tier| Overlap {
            tier,
            file_path: "a.ts".to_string(),
            user_id: "u2".to_string(),
            display_name: "Sam".to_string(),
            start_line: None,
            end_line: None,
            function_name: None,
            repo_name: None,
        };
        assert_eq!(decision_for(&[]), ProbeDecision::Proceed);
        assert_eq!(decision_for(&[mk(OverlapTier::File)]), ProbeDecision::Warn);
        assert_eq!(
            decision_for(&[mk(OverlapTier::Adjacent), mk(OverlapTier::Line)]),
            ProbeDecision::Block
        );
    }

    #[test]
    fn tracked_file_roundtrip() {
        let tracked = TrackedFile {
            byte_offset: 4096,
            session_id: "s1".to_string(),
            matched_teams: vec!["https://a.example.com".to_string()],
            matched_repo: "repo".to_string(),
            sub_dir_repos: None,
            turn_number: 3,
            files_touched: vec!["src/a.ts".to_string()],
            cwd: "/w/repo".to_string(),
        };
        let json = serde_json::to_string(&tracked).unwrap();
        let back: TrackedFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tracked);
    }

    #[test]
    fn accumulator_rebuild_suppresses_duplicate_starts() {
        let tracked = TrackedFile {
            byte_offset: 100,
            session_id: "s1".to_string(),
            matched_teams: vec![],
            matched_repo: "repo".to_string(),
            sub_dir_repos: None,
            turn_number: 2,
            files_touched: vec!["a.ts".to_string()],
            cwd: "/w/repo".to_string(),
        };
        let acc = SessionAccumulator::from_tracked(&tracked);
        assert!(acc.session_start_emitted);
        assert!(acc.branch_emitted);
        assert!(acc.model_emitted);
        assert_eq!(acc.turn_number, 2);

        // A brand-new file (offset 0) has emitted nothing yet.
        let fresh = TrackedFile {
            byte_offset: 0,
            ..tracked
        };
        let acc = SessionAccumulator::from_tracked(&fresh);
        assert!(!acc.session_start_emitted);
    }

    #[test]
    fn mirror_freshness_window() {
        let now = Utc::now();
        let fresh = TeamStateMirror {
            sessions: vec![],
            updated_at: now - chrono::Duration::seconds(60),
        };
        assert!(fresh.is_fresh(now));

        let stale = TeamStateMirror {
            sessions: vec![],
            updated_at: now - chrono::Duration::seconds(121),
        };
        assert!(!stale.is_fresh(now));
    }
}
