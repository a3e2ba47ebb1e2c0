//! overlap-check - synchronous probe that warns when an edit would collide
//! with a teammate's active region.
//!
//! Three output modes:
//! - hook mode (`--hook`): reads the editor-protocol JSON from stdin and
//!   prints a hook response; silent (exit 0) when there is nothing to say
//! - machine mode (`--json`): bare JSON report
//! - human mode (default): formatted text; exits 2 on block when `--strict`

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use overlap_core::probe::{run_probe, ProbeReport, ProbeRequest};
use overlap_core::{Config, Overlap, ProbeDecision};

#[derive(Parser)]
#[command(name = "overlap-check")]
#[command(about = "Check whether an edit overlaps a teammate's active work")]
#[command(version)]
struct Args {
    /// Target file (absolute, or relative to --cwd)
    #[arg(long)]
    file: Option<String>,

    /// The text the edit intends to replace (enables line-level checks)
    #[arg(long)]
    old_string: Option<String>,

    /// Repo name override when the working directory is not a git repo
    #[arg(long)]
    repo: Option<String>,

    /// Working directory (default: current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Read the editor hook payload from stdin and answer in hook protocol
    #[arg(long)]
    hook: bool,

    /// Emit the bare JSON report
    #[arg(long)]
    json: bool,

    /// Exit with code 2 when the decision is block
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let request = if args.hook {
        match hook_request()? {
            Some(request) => request,
            // Malformed or non-edit hook input: stay silent.
            None => return Ok(ExitCode::SUCCESS),
        }
    } else {
        let Some(file) = args.file.clone() else {
            anyhow::bail!("--file is required outside hook mode");
        };
        let cwd = match args.cwd.clone() {
            Some(cwd) => cwd,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        ProbeRequest {
            cwd,
            file_path: file,
            old_string: args.old_string.clone(),
            repo_override: args.repo.clone(),
            session_id: None,
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    let report = runtime.block_on(run_probe(&config, &request));

    if args.hook {
        if let Some(payload) = hook_payload(&report) {
            println!("{}", serde_json::to_string(&payload)?);
        }
        // The hook is always silent-success; the editor reads the payload.
        return Ok(ExitCode::SUCCESS);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&machine_payload(&report))?);
    } else {
        print!("{}", human_text(&report));
    }

    if args.strict && report.decision == ProbeDecision::Block {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

/// Parse the editor hook payload from stdin. Returns `None` for input the
/// probe has nothing to say about (missing file, unparseable JSON).
fn hook_request() -> Result<Option<ProbeRequest>> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read hook input")?;
    Ok(parse_hook_input(&input))
}

fn parse_hook_input(input: &str) -> Option<ProbeRequest> {
    let value: serde_json::Value = serde_json::from_str(input).ok()?;
    let tool_input = value.get("tool_input")?;
    let file_path = tool_input.get("file_path")?.as_str()?.to_string();
    let old_string = tool_input
        .get("old_string")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let cwd = value
        .get("cwd")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())?;
    let session_id = value
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    Some(ProbeRequest {
        cwd,
        file_path,
        old_string,
        repo_override: None,
        session_id,
    })
}

/// Hook response: a permission denial on block, advisory context on warn,
/// nothing at all on proceed.
fn hook_payload(report: &ProbeReport) -> Option<serde_json::Value> {
    match report.decision {
        ProbeDecision::Proceed => None,
        ProbeDecision::Warn => Some(json!({
            "additionalContext": human_text(report),
        })),
        ProbeDecision::Block => Some(json!({
            "hookSpecificOutput": {
                "hookEventName": "PreToolUse",
                "permissionDecision": "deny",
                "permissionDecisionReason": human_text(report),
            },
            "additionalContext": human_text(report),
        })),
    }
}

fn machine_payload(report: &ProbeReport) -> serde_json::Value {
    let mut payload = json!({
        "decision": report.decision,
        "overlaps": report.overlaps,
    });
    if !report.team_sessions.is_empty() {
        payload["team_sessions"] = serde_json::to_value(&report.team_sessions).unwrap_or_default();
    }
    if let Some(host) = &report.git_host {
        payload["git_host"] = serde_json::to_value(host).unwrap_or_default();
    }
    if let Some(warning) = &report.warning {
        payload["warning"] = json!(warning);
    }
    payload
}

fn human_text(report: &ProbeReport) -> String {
    if report.overlaps.is_empty() {
        return "No overlapping activity.\n".to_string();
    }

    let mut out = String::new();
    let headline = match report.decision {
        ProbeDecision::Block => "Blocking overlap with a teammate's active work:",
        ProbeDecision::Warn => "A teammate is working nearby:",
        ProbeDecision::Proceed => "No overlapping activity.",
    };
    out.push_str(headline);
    out.push('\n');
    for overlap in &report.overlaps {
        out.push_str(&format!("  - {}\n", describe_overlap(overlap)));
    }
    if let Some(guidance) = &report.guidance {
        out.push_str(&format!("Guidance: {}\n", guidance));
    }
    if let Some(warning) = &report.warning {
        out.push_str(&format!("Note: {}\n", warning));
    }
    out
}

fn describe_overlap(overlap: &Overlap) -> String {
    let mut parts = format!("{} is editing {}", overlap.display_name, overlap.file_path);
    if let (Some(start), Some(end)) = (overlap.start_line, overlap.end_line) {
        parts.push_str(&format!(" (lines {}-{})", start, end));
    }
    if let Some(function) = &overlap.function_name {
        parts.push_str(&format!(" in {}", function));
    }
    parts.push_str(&format!(" [{}]", tier_label(overlap)));
    parts
}

fn tier_label(overlap: &Overlap) -> &'static str {
    use overlap_core::OverlapTier;
    match overlap.tier {
        OverlapTier::Line => "line overlap",
        OverlapTier::Function => "same function",
        OverlapTier::Adjacent => "adjacent lines",
        OverlapTier::File => "same file",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlap_core::OverlapTier;

    fn overlap(tier: OverlapTier) -> Overlap {
        Overlap {
            tier,
            file_path: "src/a.ts".to_string(),
            user_id: "u2".to_string(),
            display_name: "Sam".to_string(),
            start_line: Some(40),
            end_line: Some(60),
            function_name: Some("render".to_string()),
            repo_name: Some("widget".to_string()),
        }
    }

    fn report(decision: ProbeDecision, overlaps: Vec<Overlap>) -> ProbeReport {
        ProbeReport {
            decision,
            overlaps,
            guidance: None,
            git_host: None,
            warning: None,
            team_sessions: Vec::new(),
        }
    }

    #[test]
    fn hook_is_silent_on_proceed() {
        assert!(hook_payload(&report(ProbeDecision::Proceed, vec![])).is_none());
    }

    #[test]
    fn hook_denies_on_block() {
        let payload = hook_payload(&report(
            ProbeDecision::Block,
            vec![overlap(OverlapTier::Line)],
        ))
        .unwrap();
        assert_eq!(
            payload["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
        assert_eq!(
            payload["hookSpecificOutput"]["hookEventName"],
            "PreToolUse"
        );
        assert!(payload["additionalContext"]
            .as_str()
            .unwrap()
            .contains("Sam"));
    }

    #[test]
    fn hook_warns_without_denying() {
        let payload = hook_payload(&report(
            ProbeDecision::Warn,
            vec![overlap(OverlapTier::Adjacent)],
        ))
        .unwrap();
        assert!(payload.get("hookSpecificOutput").is_none());
        assert!(payload["additionalContext"].as_str().is_some());
    }

    #[test]
    fn machine_payload_shape() {
        let mut r = report(ProbeDecision::Block, vec![overlap(OverlapTier::Line)]);
        r.warning = Some("offline".to_string());
        let payload = machine_payload(&r);
        assert_eq!(payload["decision"], "block");
        assert_eq!(payload["overlaps"][0]["tier"], "line");
        assert_eq!(payload["warning"], "offline");
        assert!(payload.get("git_host").is_none());
    }

    #[test]
    fn parse_hook_input_extracts_edit_target() {
        let input = r#"{
            "cwd": "/w/widget",
            "tool_name": "Edit",
            "session_id": "S1",
            "tool_input": {"file_path": "/w/widget/src/a.ts", "old_string": "let x = 1;"}
        }"#;
        let request = parse_hook_input(input).unwrap();
        assert_eq!(request.cwd, PathBuf::from("/w/widget"));
        assert_eq!(request.file_path, "/w/widget/src/a.ts");
        assert_eq!(request.old_string.as_deref(), Some("let x = 1;"));
        assert_eq!(request.session_id.as_deref(), Some("S1"));

        assert!(parse_hook_input("not json").is_none());
        assert!(parse_hook_input(r#"{"tool_input":{}}"#).is_none());
    }

    #[test]
    fn human_text_lists_each_overlap() {
        let text = human_text(&report(
            ProbeDecision::Block,
            vec![overlap(OverlapTier::Line), overlap(OverlapTier::File)],
        ));
        assert!(text.contains("Blocking overlap"));
        assert!(text.contains("lines 40-60"));
        assert!(text.contains("in render"));
        assert_eq!(text.matches("Sam is editing").count(), 2);
    }
}
