//! The synchronous overlap probe.
//!
//! Given a working directory, a target file, and optionally the substring an
//! edit intends to replace, decide whether the edit collides with a
//! teammate's active region. Each configured team is queried in parallel
//! with a short timeout; when every team is unreachable the probe falls back
//! to the locally mirrored team state and classifies overlaps itself.

use std::path::{Component, Path, PathBuf};

use crate::client::{OverlapQuery, TeamClient};
use crate::config::Config;
use crate::repos::{git_info, GitHost};
use crate::symbols;
use crate::teamstate;
use crate::types::{
    decision_for, Overlap, OverlapTier, ProbeDecision, SessionRegion, TeamStateSession,
};

/// Two ranges further apart than this no longer count as adjacent.
const ADJACENT_GAP_LINES: u32 = 30;

/// One probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub cwd: PathBuf,
    pub file_path: String,
    pub old_string: Option<String>,
    /// Explicit repo name when `cwd` is not inside a git repo.
    pub repo_override: Option<String>,
    /// The caller's own session id, forwarded to the server.
    pub session_id: Option<String>,
}

/// Structured probe result, rendered by the CLI in its three output modes.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub decision: ProbeDecision,
    pub overlaps: Vec<Overlap>,
    pub guidance: Option<String>,
    pub git_host: Option<GitHost>,
    pub warning: Option<String>,
    pub team_sessions: Vec<TeamStateSession>,
}

impl ProbeReport {
    fn proceed() -> Self {
        Self {
            decision: ProbeDecision::Proceed,
            overlaps: Vec::new(),
            guidance: None,
            git_host: None,
            warning: None,
            team_sessions: Vec::new(),
        }
    }
}

/// The resolved edit target used for classification.
#[derive(Debug, Clone, Default)]
pub struct TargetRegion {
    pub rel_path: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub function_name: Option<String>,
}

/// Run the probe. Missing preconditions (not a repo and no override, target
/// outside the repo root) resolve to a silent `proceed`.
pub async fn run_probe(config: &Config, req: &ProbeRequest) -> ProbeReport {
    let git = git_info(&req.cwd).await;

    let (repo_name, git_root, git_host) = match (&git, &req.repo_override) {
        (Some(info), None) => (info.repo_name.clone(), info.git_root.clone(), info.host),
        (Some(info), Some(name)) => (name.clone(), info.git_root.clone(), info.host),
        (None, Some(name)) => (name.clone(), req.cwd.clone(), GitHost::None),
        (None, None) => return ProbeReport::proceed(),
    };

    let abs_target = if Path::new(&req.file_path).is_absolute() {
        PathBuf::from(&req.file_path)
    } else {
        req.cwd.join(&req.file_path)
    };
    let Some(rel_path) = relative_to_root(&abs_target, &git_root) else {
        return ProbeReport {
            git_host: Some(git_host),
            ..ProbeReport::proceed()
        };
    };

    let mut target = TargetRegion {
        rel_path,
        ..TargetRegion::default()
    };
    if let Some(old_string) = &req.old_string {
        if let Some(region) = symbols::resolve_region(&abs_target, old_string) {
            target.start_line = Some(region.start_line);
            target.end_line = Some(region.end_line);
            target.function_name = region.enclosing_symbol;
        }
    }

    let self_ids = config.user_ids();

    // Remote first, in parallel with per-team timeouts.
    let queries = config.teams.iter().filter_map(|team| {
        let client = TeamClient::new(&team.canonical_url(), &team.user_token).ok()?;
        let query = OverlapQuery {
            repo_name: repo_name.clone(),
            file_path: target.rel_path.clone(),
            session_id: req.session_id.clone(),
            start_line: target.start_line,
            end_line: target.end_line,
            function_name: target.function_name.clone(),
        };
        Some(async move { client.overlap_query(&query).await })
    });
    let results = futures::future::join_all(queries).await;

    let mut overlaps = Vec::new();
    let mut guidance = None;
    let mut any_reachable = false;
    for result in results {
        match result {
            Ok(response) => {
                any_reachable = true;
                overlaps.extend(
                    response
                        .overlaps
                        .into_iter()
                        .filter(|o| !self_ids.contains(&o.user_id)),
                );
                if guidance.is_none() {
                    guidance = response.guidance;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Overlap query failed");
            }
        }
    }

    if any_reachable {
        return ProbeReport {
            decision: decision_for(&overlaps),
            overlaps,
            guidance,
            git_host: Some(git_host),
            warning: None,
            team_sessions: Vec::new(),
        };
    }

    // Every team unreachable: classify against the local mirror.
    let sessions = teamstate::read_mirror();
    let matching: Vec<TeamStateSession> = sessions
        .into_iter()
        .filter(|s| s.repo_name == repo_name && !self_ids.contains(&s.user_id))
        .collect();
    let overlaps = classify_against_sessions(&target, &matching);

    ProbeReport {
        decision: decision_for(&overlaps),
        overlaps,
        guidance: None,
        git_host: Some(git_host),
        warning: Some("team instances unreachable; using cached team state".to_string()),
        team_sessions: matching,
    }
}

/// Classify the target against every region of the given teammate sessions.
pub fn classify_against_sessions(
    target: &TargetRegion,
    sessions: &[TeamStateSession],
) -> Vec<Overlap> {
    let mut overlaps = Vec::new();
    for session in sessions {
        for region in &session.regions {
            if let Some(tier) = classify_region(target, region) {
                overlaps.push(Overlap {
                    tier,
                    file_path: region.file_path.clone(),
                    user_id: session.user_id.clone(),
                    display_name: session.display_name.clone(),
                    start_line: region.start_line,
                    end_line: region.end_line,
                    function_name: region.function_name.clone(),
                    repo_name: Some(session.repo_name.clone()),
                });
            }
        }
    }
    overlaps
}

/// Tier for one teammate region against the target, or `None` when the
/// region is for a different file.
fn classify_region(target: &TargetRegion, region: &SessionRegion) -> Option<OverlapTier> {
    if !same_file(&target.rel_path, &region.file_path) {
        return None;
    }

    let lines = match (
        target.start_line,
        target.end_line,
        region.start_line,
        region.end_line,
    ) {
        (Some(ts), Some(te), Some(rs), Some(re)) => Some((ts, te, rs, re)),
        _ => None,
    };

    if let Some((ts, te, rs, re)) = lines {
        if ts <= re && te >= rs {
            return Some(OverlapTier::Line);
        }
        if functions_match(target, region) {
            return Some(OverlapTier::Function);
        }
        let gap = if te < rs { rs - te } else { ts.saturating_sub(re) };
        if gap <= ADJACENT_GAP_LINES {
            return Some(OverlapTier::Adjacent);
        }
        return Some(OverlapTier::File);
    }

    if functions_match(target, region) {
        return Some(OverlapTier::Function);
    }
    Some(OverlapTier::File)
}

fn functions_match(target: &TargetRegion, region: &SessionRegion) -> bool {
    match (&target.function_name, &region.function_name) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn same_file(a: &str, b: &str) -> bool {
    a.trim_start_matches("./") == b.trim_start_matches("./")
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Express `abs` relative to `root`; `None` when the path escapes the root.
fn relative_to_root(abs: &Path, root: &Path) -> Option<String> {
    let abs = normalize(abs);
    let root = normalize(root);
    let rel = abs.strip_prefix(&root).ok()?;
    let rel = rel.to_string_lossy();
    if rel.starts_with("..") {
        return None;
    }
    Some(rel.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn region(
        file: &str,
        lines: Option<(u32, u32)>,
        function: Option<&str>,
    ) -> SessionRegion {
        SessionRegion {
            file_path: file.to_string(),
            start_line: lines.map(|(s, _)| s),
            end_line: lines.map(|(_, e)| e),
            function_name: function.map(ToString::to_string),
            last_touched_at: None,
        }
    }

    fn target(file: &str, lines: Option<(u32, u32)>, function: Option<&str>) -> TargetRegion {
        TargetRegion {
            rel_path: file.to_string(),
            start_line: lines.map(|(s, _)| s),
            end_line: lines.map(|(_, e)| e),
            function_name: function.map(ToString::to_string),
        }
    }

    fn session(user_id: &str, regions: Vec<SessionRegion>) -> TeamStateSession {
        TeamStateSession {
            session_id: "s-remote".to_string(),
            user_id: user_id.to_string(),
            display_name: "Sam".to_string(),
            repo_name: "widget".to_string(),
            started_at: Utc::now(),
            summary: None,
            regions,
            instance_url: Some("https://a.example.com".to_string()),
        }
    }

    #[test]
    fn intersecting_ranges_are_line_tier() {
        let tier = classify_region(
            &target("src/a.ts", Some((50, 55)), None),
            &region("src/a.ts", Some((40, 60)), None),
        );
        assert_eq!(tier, Some(OverlapTier::Line));

        // Touching at a boundary still intersects.
        let tier = classify_region(
            &target("src/a.ts", Some((60, 65)), None),
            &region("src/a.ts", Some((40, 60)), None),
        );
        assert_eq!(tier, Some(OverlapTier::Line));
    }

    #[test]
    fn nearby_ranges_are_adjacent_tier() {
        let tier = classify_region(
            &target("src/a.ts", Some((70, 75)), None),
            &region("src/a.ts", Some((40, 60)), None),
        );
        assert_eq!(tier, Some(OverlapTier::Adjacent));

        // Gap beyond 30 lines is only a file-level signal.
        let tier = classify_region(
            &target("src/a.ts", Some((200, 210)), None),
            &region("src/a.ts", Some((40, 60)), None),
        );
        assert_eq!(tier, Some(OverlapTier::File));
    }

    #[test]
    fn same_function_without_line_overlap_is_function_tier() {
        let tier = classify_region(
            &target("src/a.ts", Some((100, 105)), Some("render")),
            &region("src/a.ts", Some((40, 60)), Some("render")),
        );
        assert_eq!(tier, Some(OverlapTier::Function));

        // Without numeric lines on one side, the names still match.
        let tier = classify_region(
            &target("src/a.ts", None, Some("render")),
            &region("src/a.ts", Some((40, 60)), Some("render")),
        );
        assert_eq!(tier, Some(OverlapTier::Function));
    }

    #[test]
    fn different_files_do_not_classify() {
        let tier = classify_region(
            &target("src/a.ts", Some((1, 5)), None),
            &region("src/b.ts", Some((1, 5)), None),
        );
        assert_eq!(tier, None);

        // Leading ./ is cosmetic.
        let tier = classify_region(
            &target("./src/a.ts", Some((1, 5)), None),
            &region("src/a.ts", Some((1, 5)), None),
        );
        assert_eq!(tier, Some(OverlapTier::Line));
    }

    #[test]
    fn no_line_info_is_file_tier() {
        let tier = classify_region(
            &target("src/a.ts", None, None),
            &region("src/a.ts", None, None),
        );
        assert_eq!(tier, Some(OverlapTier::File));
    }

    #[test]
    fn classification_spans_all_regions() {
        let t = target("src/a.ts", Some((50, 55)), None);
        let sessions = vec![session(
            "u2",
            vec![
                region("src/a.ts", Some((40, 60)), None),
                region("src/other.ts", Some((1, 10)), None),
            ],
        )];
        let overlaps = classify_against_sessions(&t, &sessions);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].tier, OverlapTier::Line);
        assert_eq!(overlaps[0].user_id, "u2");
        assert_eq!(decision_for(&overlaps), ProbeDecision::Block);
    }

    #[test]
    fn path_normalization_and_escape() {
        let root = Path::new("/w/widget");
        assert_eq!(
            relative_to_root(Path::new("/w/widget/src/a.ts"), root),
            Some("src/a.ts".to_string())
        );
        assert_eq!(
            relative_to_root(Path::new("/w/widget/src/../src/a.ts"), root),
            Some("src/a.ts".to_string())
        );
        assert_eq!(relative_to_root(Path::new("/w/other/a.ts"), root), None);
        assert_eq!(
            relative_to_root(Path::new("/w/widget/../outside.ts"), root),
            None
        );
    }
}
