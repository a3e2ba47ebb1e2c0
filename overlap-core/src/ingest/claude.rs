//! Claude Code journal adapter.
//!
//! Parses session journals from `~/.claude/projects/[encoded-path]/*.jsonl`
//! into activity events. Each journal line is one UTF-8 JSON record; the
//! fields we care about may first appear on later records than the logical
//! session start (`cwd` usually on the first record, `gitBranch` and the
//! model often later), so the adapter keeps per-session accumulators and
//! re-emits a `session_start` carrying a field the first time it is seen.
//!
//! # Error Handling
//!
//! Malformed or non-JSON lines yield no events and leave the accumulator
//! untouched; parsing continues with the next line.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::types::{Event, EventKind, FileOperation, ResponseType, SessionAccumulator, TokenUsage};

use super::AgentAdapter;

/// Environment variables whose presence marks the session host as remote
/// (SSH session, codespace, dev container).
const REMOTE_ENV_VARS: &[&str] = &[
    "SSH_CONNECTION",
    "SSH_CLIENT",
    "SSH_TTY",
    "CODESPACES",
    "REMOTE_CONTAINERS",
    "GITPOD_WORKSPACE_ID",
];

/// Adapter for Claude Code session journals.
pub struct ClaudeCodeAdapter {
    root: Option<PathBuf>,
}

impl ClaudeCodeAdapter {
    /// Create an adapter with the default journal root (`~/.claude/projects`).
    pub fn new() -> Self {
        Self {
            root: dirs::home_dir().map(|h| h.join(".claude").join("projects")),
        }
    }

    /// Create an adapter with a custom journal root (tests, `--journal-root`).
    pub fn with_root(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// One line of a Claude Code journal.
///
/// Uses `#[serde(default)]` liberally so missing fields never fail a record.
/// Result-record fields are snake_case in the journal, hence the aliases.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    #[serde(alias = "session_id")]
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    git_branch: Option<String>,
    version: Option<String>,
    message: Option<RawMessage>,

    // Result-record fields.
    #[serde(alias = "total_cost_usd")]
    total_cost_usd: Option<f64>,
    #[serde(alias = "duration_ms")]
    duration_ms: Option<u64>,
    #[serde(alias = "num_turns")]
    num_turns: Option<u32>,
    usage: Option<RawUsage>,
    result: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    role: Option<String>,
    model: Option<String>,
    content: Option<RawContent>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

impl RawUsage {
    fn into_token_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
        }
    }
}

/// Map a tracked tool name to its file operation; untracked tools are
/// ignored entirely.
fn operation_for_tool(name: &str) -> Option<FileOperation> {
    match name {
        "Write" => Some(FileOperation::Create),
        "Edit" | "MultiEdit" | "NotebookEdit" => Some(FileOperation::Modify),
        "Read" => Some(FileOperation::Read),
        "Bash" => Some(FileOperation::Execute),
        "Grep" | "Glob" => Some(FileOperation::Search),
        _ => None,
    }
}

/// Sentinel file path for tool calls without a target file.
fn sentinel_for_tool(name: &str) -> Option<&'static str> {
    match name {
        "Bash" => Some("(bash)"),
        "Grep" => Some("(grep)"),
        "Glob" => Some("(glob)"),
        _ => None,
    }
}

impl AgentAdapter for ClaudeCodeAdapter {
    fn agent_type(&self) -> &'static str {
        "claude-code"
    }

    fn watch_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn file_extension(&self) -> &'static str {
        "jsonl"
    }

    fn extract_session_id(&self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        Some(stem.to_string())
    }

    fn parse_line(
        &self,
        line: &str,
        session_id: &str,
        acc: &mut SessionAccumulator,
    ) -> Vec<Event> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let record: RawRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::trace!(error = %e, "Skipping malformed journal record");
                return Vec::new();
            }
        };

        let timestamp = record
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        // Fold newly observed session fields into the accumulator.
        if let Some(cwd) = &record.cwd {
            acc.cwd = Some(cwd.clone());
        }
        if acc.git_branch.is_none() {
            if let Some(branch) = &record.git_branch {
                if !branch.is_empty() {
                    acc.git_branch = Some(branch.clone());
                }
            }
        }
        if acc.model.is_none() {
            if let Some(model) = record.message.as_ref().and_then(|m| m.model.clone()) {
                acc.model = Some(model);
            }
        }

        let mut events = Vec::new();

        if !acc.session_start_emitted && acc.turn_number == 0 {
            if acc.cwd.is_some() {
                events.push(self.session_start(
                    session_id,
                    timestamp,
                    acc,
                    record.version.clone(),
                ));
                acc.session_start_emitted = true;
                acc.branch_emitted = acc.git_branch.is_some();
                acc.model_emitted = acc.model.is_some();
            }
        } else if acc.session_start_emitted {
            // Backfill: a field becoming known after the first emission gets
            // exactly one re-emission carrying it.
            let branch_new = !acc.branch_emitted && acc.git_branch.is_some();
            let model_new = !acc.model_emitted && acc.model.is_some();
            if branch_new || model_new {
                events.push(self.session_start(
                    session_id,
                    timestamp,
                    acc,
                    record.version.clone(),
                ));
                acc.branch_emitted = acc.branch_emitted || branch_new;
                acc.model_emitted = acc.model_emitted || model_new;
            }
        }

        match record.record_type.as_deref() {
            Some("user") => {
                if let Some(text) = prompt_text(&record) {
                    acc.turn_number += 1;
                    events.push(Event {
                        session_id: session_id.to_string(),
                        timestamp,
                        user_id: None,
                        repo_name: None,
                        agent_type: self.agent_type().to_string(),
                        kind: EventKind::Prompt {
                            prompt_text: text,
                            turn_number: acc.turn_number,
                        },
                    });
                }
            }
            Some("assistant") => {
                let blocks = match record.message.as_ref().and_then(|m| m.content.as_ref()) {
                    Some(RawContent::Blocks(blocks)) => blocks.as_slice(),
                    Some(RawContent::Text(text)) => {
                        if !text.is_empty() {
                            events.push(self.agent_response(
                                session_id,
                                timestamp,
                                text.clone(),
                                ResponseType::Text,
                                acc.turn_number,
                            ));
                        }
                        &[]
                    }
                    None => &[],
                };

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                events.push(self.agent_response(
                                    session_id,
                                    timestamp,
                                    text.clone(),
                                    ResponseType::Text,
                                    acc.turn_number,
                                ));
                            }
                        }
                        ContentBlock::Thinking { thinking } => {
                            if !thinking.is_empty() {
                                events.push(self.agent_response(
                                    session_id,
                                    timestamp,
                                    thinking.clone(),
                                    ResponseType::Thinking,
                                    acc.turn_number,
                                ));
                            }
                        }
                        ContentBlock::ToolUse { name, input } => {
                            if let Some(event) =
                                self.file_op(session_id, timestamp, name, input, acc)
                            {
                                events.push(event);
                            }
                        }
                        ContentBlock::Unknown => {}
                    }
                }
            }
            Some("result") => {
                let usage = record
                    .usage
                    .or_else(|| record.message.and_then(|m| m.usage))
                    .map(RawUsage::into_token_usage);
                events.push(Event {
                    session_id: session_id.to_string(),
                    timestamp,
                    user_id: None,
                    repo_name: None,
                    agent_type: self.agent_type().to_string(),
                    kind: EventKind::SessionEnd {
                        total_cost_usd: record.total_cost_usd,
                        duration_ms: record.duration_ms,
                        turn_count: record.num_turns.unwrap_or(acc.turn_number),
                        token_usage: usage,
                        result_summary: record.result,
                        files_touched: acc.files_touched.iter().cloned().collect(),
                    },
                });
            }
            _ => {}
        }

        events
    }
}

impl ClaudeCodeAdapter {
    fn session_start(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        acc: &SessionAccumulator,
        agent_version: Option<String>,
    ) -> Event {
        let hostname = host_name();
        Event {
            session_id: session_id.to_string(),
            timestamp,
            user_id: None,
            repo_name: None,
            agent_type: self.agent_type().to_string(),
            kind: EventKind::SessionStart {
                cwd: acc.cwd.clone().unwrap_or_default(),
                git_branch: acc.git_branch.clone(),
                git_remote_url: None,
                model: acc.model.clone(),
                agent_version,
                device_name: device_name(&hostname),
                hostname,
                is_remote: is_remote_host(),
            },
        }
    }

    fn agent_response(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        response_text: String,
        response_type: ResponseType,
        turn_number: u32,
    ) -> Event {
        Event {
            session_id: session_id.to_string(),
            timestamp,
            user_id: None,
            repo_name: None,
            agent_type: self.agent_type().to_string(),
            kind: EventKind::AgentResponse {
                response_text,
                response_type,
                turn_number,
            },
        }
    }

    fn file_op(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        tool_name: &str,
        input: &serde_json::Value,
        acc: &mut SessionAccumulator,
    ) -> Option<Event> {
        let operation = operation_for_tool(tool_name)?;

        let explicit_path = input
            .get("file_path")
            .or_else(|| input.get("notebook_path"))
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string);

        let file_path = match explicit_path {
            Some(p) => p,
            None => sentinel_for_tool(tool_name)?.to_string(),
        };

        let bash_command = input
            .get("command")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);

        // Edit and MultiEdit carry the replaced text; MultiEdit's first edit
        // stands in for the whole batch.
        let (old_string, new_string) = edit_strings(tool_name, input);

        if matches!(operation, FileOperation::Create | FileOperation::Modify) {
            acc.files_touched
                .insert(rel_to_cwd(&file_path, acc.cwd.as_deref()));
        }

        Some(Event {
            session_id: session_id.to_string(),
            timestamp,
            user_id: None,
            repo_name: None,
            agent_type: self.agent_type().to_string(),
            kind: EventKind::FileOp {
                tool_name: tool_name.to_string(),
                file_path,
                operation,
                start_line: None,
                end_line: None,
                function_name: None,
                bash_command,
                old_string,
                new_string,
            },
        })
    }
}

/// Pull `old_string`/`new_string` from an Edit-family tool input.
fn edit_strings(tool_name: &str, input: &serde_json::Value) -> (Option<String>, Option<String>) {
    if !matches!(tool_name, "Edit" | "MultiEdit" | "NotebookEdit") {
        return (None, None);
    }

    let direct = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    };
    if let (old @ Some(_), new) = (direct("old_string"), direct("new_string")) {
        return (old, new);
    }

    if let Some(first) = input
        .get("edits")
        .and_then(|v| v.as_array())
        .and_then(|edits| edits.first())
    {
        let from_edit = |key: &str| {
            first
                .get(key)
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
        };
        return (from_edit("old_string"), from_edit("new_string"));
    }

    (direct("old_string"), direct("new_string"))
}

/// Express a touched path relative to the session cwd when it lies inside.
fn rel_to_cwd(file_path: &str, cwd: Option<&str>) -> String {
    if let Some(cwd) = cwd {
        if let Ok(rel) = Path::new(file_path).strip_prefix(cwd) {
            return rel.to_string_lossy().into_owned();
        }
    }
    file_path.to_string()
}

/// Prompt text from a user record: a plain string, or the text blocks of an
/// array. Tool-result-only records carry no prompt and do not start a turn.
fn prompt_text(record: &RawRecord) -> Option<String> {
    let content = record.message.as_ref()?.content.as_ref()?;
    let text = match content {
        RawContent::Text(text) => text.clone(),
        RawContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn device_name(hostname: &str) -> String {
    std::env::var("OVERLAP_DEVICE_NAME").unwrap_or_else(|_| hostname.to_string())
}

fn is_remote_host() -> bool {
    REMOTE_ENV_VARS
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}
