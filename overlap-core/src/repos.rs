//! Repository matching: mapping a session's working directory to the teams
//! and repos its events should be routed to.
//!
//! Resolution order (short-circuit):
//! 1. `basename(cwd)` found in a team's roster.
//! 2. The cwd's git origin URL resolves to a roster name (the git lookup is
//!    bounded to 5 s and memoized in the cache so `match_repo` is a function
//!    of its inputs).
//! 3. Each direct non-hidden subdirectory, by basename then origin, against
//!    the union of all rosters — the "parent of subrepos" case.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::types::RepoRoster;

/// Timeout for any single git subprocess.
const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tail segment of a remote URL, optional `.git` suffix stripped.
static REPO_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/:]([^/:]+?)(?:\.git)?$").expect("repo name regex"));

/// Memoized git remote lookup for one directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitRemoteInfo {
    pub name: String,
    pub remote_url: String,
}

/// One routing target for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoMatch {
    pub team_url: String,
    pub repo_name: String,
    /// Set when the match came from a subdirectory of the session cwd.
    pub subdir: Option<String>,
}

/// Extract a repo name from a remote URL
/// (`git@github.com:org/repo.git` → `repo`).
pub fn repo_name_from_url(url: &str) -> Option<String> {
    REPO_NAME_RE
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Run a git subcommand in `dir`, bounded by [`GIT_TIMEOUT`]. Returns the
/// trimmed stdout on success.
async fn run_git(dir: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("-C")
        .arg(dir)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Look up the origin remote for `dir`, memoizing successes in `cache`.
pub async fn origin_info(
    dir: &Path,
    cache: &mut HashMap<String, GitRemoteInfo>,
) -> Option<GitRemoteInfo> {
    let key = dir.to_string_lossy().into_owned();
    if let Some(info) = cache.get(&key) {
        return Some(info.clone());
    }

    let remote_url = run_git(dir, &["remote", "get-url", "origin"]).await?;
    let name = repo_name_from_url(&remote_url)?;
    let info = GitRemoteInfo { name, remote_url };
    cache.insert(key, info.clone());
    Some(info)
}

/// Basename of a path as a string, when it has one.
fn basename(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Teams whose roster contains `repo`, in roster-map order.
fn teams_with_repo<'a, 'b>(
    rosters: &'a BTreeMap<String, RepoRoster>,
    repo: &'b str,
) -> impl Iterator<Item = &'a String> + use<'a, 'b> {
    rosters
        .iter()
        .filter(move |(_, roster)| roster.contains(repo))
        .map(|(url, _)| url)
}

/// Map `cwd` to zero or more routing targets. See the module docs for the
/// resolution order.
pub async fn match_repo(
    cwd: &Path,
    rosters: &BTreeMap<String, RepoRoster>,
    cache: &mut HashMap<String, GitRemoteInfo>,
) -> Vec<RepoMatch> {
    if rosters.is_empty() {
        return Vec::new();
    }

    // 1. cwd basename.
    if let Some(name) = basename(cwd) {
        let matches: Vec<RepoMatch> = teams_with_repo(rosters, &name)
            .map(|team| RepoMatch {
                team_url: team.clone(),
                repo_name: name.clone(),
                subdir: None,
            })
            .collect();
        if !matches.is_empty() {
            return matches;
        }
    }

    // 2. cwd git origin.
    if let Some(info) = origin_info(cwd, cache).await {
        let matches: Vec<RepoMatch> = teams_with_repo(rosters, &info.name)
            .map(|team| RepoMatch {
                team_url: team.clone(),
                repo_name: info.name.clone(),
                subdir: None,
            })
            .collect();
        if !matches.is_empty() {
            return matches;
        }
    }

    // 3. direct non-hidden subdirectories, basename then origin.
    let mut matches = Vec::new();
    for subdir in subdirectories(cwd) {
        let Some(dir_name) = basename(&subdir) else {
            continue;
        };

        let repo = if teams_with_repo(rosters, &dir_name).next().is_some() {
            Some(dir_name.clone())
        } else {
            match origin_info(&subdir, cache).await {
                Some(info) if teams_with_repo(rosters, &info.name).next().is_some() => {
                    Some(info.name)
                }
                _ => None,
            }
        };

        if let Some(repo) = repo {
            for team in teams_with_repo(rosters, &repo) {
                matches.push(RepoMatch {
                    team_url: team.clone(),
                    repo_name: repo.clone(),
                    subdir: Some(dir_name.clone()),
                });
            }
        }
    }
    matches
}

/// Direct subdirectories of `dir`, hidden (`.`-prefixed) ones excluded,
/// sorted for deterministic match order.
fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    dirs.sort();
    dirs
}

// ============================================
// Probe-side git info
// ============================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GitHost {
    Github,
    Gitlab,
    None,
}

/// What the probe needs to know about the repository containing `cwd`.
#[derive(Debug, Clone)]
pub struct GitInfo {
    pub repo_name: String,
    pub host: GitHost,
    pub remote_url: Option<String>,
    pub git_root: PathBuf,
}

/// Resolve the repository containing `cwd`. Returns `None` when `cwd` is not
/// inside a git working tree.
pub async fn git_info(cwd: &Path) -> Option<GitInfo> {
    let root = run_git(cwd, &["rev-parse", "--show-toplevel"]).await?;
    let git_root = PathBuf::from(root);

    let remote_url = run_git(cwd, &["remote", "get-url", "origin"]).await;
    let host = match &remote_url {
        Some(url) if url.contains("github") => GitHost::Github,
        Some(url) if url.contains("gitlab") => GitHost::Gitlab,
        _ => GitHost::None,
    };

    let repo_name = remote_url
        .as_deref()
        .and_then(repo_name_from_url)
        .or_else(|| basename(&git_root))?;

    Some(GitInfo {
        repo_name,
        host,
        remote_url,
        git_root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn roster(repos: &[&str]) -> RepoRoster {
        RepoRoster {
            repos: repos.iter().map(|s| s.to_string()).collect(),
            fetched_at: Some(Utc::now()),
        }
    }

    fn rosters(entries: &[(&str, &[&str])]) -> BTreeMap<String, RepoRoster> {
        entries
            .iter()
            .map(|(url, repos)| (url.to_string(), roster(repos)))
            .collect()
    }

    #[test]
    fn repo_name_extraction() {
        assert_eq!(
            repo_name_from_url("git@github.com:org/widget.git"),
            Some("widget".to_string())
        );
        assert_eq!(
            repo_name_from_url("https://github.com/org/widget"),
            Some("widget".to_string())
        );
        assert_eq!(
            repo_name_from_url("https://gitlab.example.com/group/sub/widget.git"),
            Some("widget".to_string())
        );
        assert_eq!(
            repo_name_from_url("ssh://git@host:2222/org/widget.git"),
            Some("widget".to_string())
        );
        assert_eq!(repo_name_from_url(""), None);
    }

    #[tokio::test]
    async fn basename_match_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("widget");
        std::fs::create_dir(&cwd).unwrap();

        let rosters = rosters(&[
            ("https://a.example.com", &["widget"]),
            ("https://b.example.com", &["other"]),
        ]);
        let mut cache = HashMap::new();

        let matches = match_repo(&cwd, &rosters, &mut cache).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].team_url, "https://a.example.com");
        assert_eq!(matches[0].repo_name, "widget");
        assert!(matches[0].subdir.is_none());
        // No git lookup happened.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn basename_match_fans_out_to_all_teams() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("widget");
        std::fs::create_dir(&cwd).unwrap();

        let rosters = rosters(&[
            ("https://a.example.com", &["widget"]),
            ("https://b.example.com", &["widget"]),
        ]);
        let mut cache = HashMap::new();

        let matches = match_repo(&cwd, &rosters, &mut cache).await;
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn cached_origin_is_used_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("checkout-dir");
        std::fs::create_dir(&cwd).unwrap();

        let rosters = rosters(&[("https://a.example.com", &["widget"])]);
        let mut cache = HashMap::new();
        cache.insert(
            cwd.to_string_lossy().into_owned(),
            GitRemoteInfo {
                name: "widget".to_string(),
                remote_url: "git@github.com:org/widget.git".to_string(),
            },
        );

        // `checkout-dir` is not a git repo; only the cache can resolve it.
        let matches = match_repo(&cwd, &rosters, &mut cache).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].repo_name, "widget");
    }

    #[tokio::test]
    async fn subdir_matches_route_with_subdir_names() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("mono");
        std::fs::create_dir_all(cwd.join("a")).unwrap();
        std::fs::create_dir_all(cwd.join("b")).unwrap();
        std::fs::create_dir_all(cwd.join(".hidden")).unwrap();
        std::fs::create_dir_all(cwd.join("unregistered")).unwrap();

        let rosters = rosters(&[
            ("https://a.example.com", &["a"]),
            ("https://b.example.com", &["b"]),
        ]);
        let mut cache = HashMap::new();

        let matches = match_repo(&cwd, &rosters, &mut cache).await;
        assert_eq!(matches.len(), 2);

        let a = matches.iter().find(|m| m.repo_name == "a").unwrap();
        assert_eq!(a.subdir.as_deref(), Some("a"));
        assert_eq!(a.team_url, "https://a.example.com");

        let b = matches.iter().find(|m| m.repo_name == "b").unwrap();
        assert_eq!(b.subdir.as_deref(), Some("b"));

        // Hidden and unregistered subdirs contribute nothing.
        assert!(matches.iter().all(|m| m.subdir.as_deref() != Some(".hidden")));
        assert!(matches
            .iter()
            .all(|m| m.subdir.as_deref() != Some("unregistered")));
    }

    #[tokio::test]
    async fn empty_rosters_match_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = HashMap::new();
        let matches = match_repo(dir.path(), &BTreeMap::new(), &mut cache).await;
        assert!(matches.is_empty());
    }

    #[test]
    fn hidden_subdirectories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();

        let dirs = subdirectories(dir.path());
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with("src"));
    }
}
