//! Team-state polling and the local mirror.
//!
//! Every 30 s the poller fetches each non-suspended team's active-session
//! snapshot, tags sessions with their originating instance, merges them, and
//! writes `team-state.json` atomically. A team that fails with a transport
//! error keeps its previous sessions in the mirror; consumers treat a mirror
//! older than 120 s as stale and see no sessions at all.

use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::TeamClient;
use crate::config::TeamConfig;
use crate::error::Error;
use crate::paths;
use crate::types::{TeamStateMirror, TeamStateSession};

/// Cadence of team-state polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Per-team result of one poll round.
#[derive(Debug)]
pub struct PollOutcome {
    pub team_url: String,
    pub auth_failed: bool,
}

pub struct TeamStatePoller {
    clients: Vec<(String, TeamClient)>,
    mirror_path: PathBuf,
}

impl TeamStatePoller {
    pub fn new(teams: &[TeamConfig]) -> crate::error::Result<Self> {
        Self::with_mirror_path(teams, paths::mirror_path())
    }

    pub fn with_mirror_path(
        teams: &[TeamConfig],
        mirror_path: PathBuf,
    ) -> crate::error::Result<Self> {
        let mut clients = Vec::new();
        for team in teams {
            let url = team.canonical_url();
            clients.push((url.clone(), TeamClient::new(&url, &team.user_token)?));
        }
        Ok(Self {
            clients,
            mirror_path,
        })
    }

    /// Fetch every non-suspended team once and refresh the mirror.
    pub async fn poll_once(&self, suspended: &HashSet<String>) -> Vec<PollOutcome> {
        let mut outcomes = Vec::new();
        let mut merged: Vec<TeamStateSession> = Vec::new();
        let mut fetched_teams: HashSet<String> = HashSet::new();
        let mut any_success = false;

        let polls = self
            .clients
            .iter()
            .filter(|(url, _)| !suspended.contains(url))
            .map(|(url, client)| async move { (url.clone(), client.team_state().await) });
        let results = futures::future::join_all(polls).await;

        for (url, result) in results {
            match result {
                Ok(mut sessions) => {
                    any_success = true;
                    fetched_teams.insert(url.clone());
                    for session in &mut sessions {
                        if session.instance_url.is_none() {
                            session.instance_url = Some(url.clone());
                        }
                    }
                    merged.extend(sessions);
                }
                Err(Error::Auth(_)) => {
                    tracing::warn!(team = %url, "Team-state poll rejected (401)");
                    outcomes.push(PollOutcome {
                        team_url: url,
                        auth_failed: true,
                    });
                }
                Err(e) => {
                    tracing::debug!(team = %url, error = %e, "Team-state poll failed");
                }
            }
        }

        if !any_success {
            // Nothing reachable; leave the mirror untouched.
            return outcomes;
        }

        // Teams that errored this round keep their previous sessions.
        for session in self.previous_sessions() {
            match &session.instance_url {
                Some(url) if !fetched_teams.contains(url) => merged.push(session),
                _ => {}
            }
        }

        let mirror = TeamStateMirror {
            sessions: merged,
            updated_at: Utc::now(),
        };
        match serde_json::to_string_pretty(&mirror) {
            Ok(json) => {
                if let Err(e) = paths::write_atomic(&self.mirror_path, json.as_bytes()) {
                    tracing::warn!(error = %e, "Failed to write team-state mirror");
                } else {
                    tracing::debug!(
                        sessions = mirror.sessions.len(),
                        "Refreshed team-state mirror"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize team-state mirror"),
        }

        outcomes
    }

    fn previous_sessions(&self) -> Vec<TeamStateSession> {
        read_mirror_at(&self.mirror_path, false)
    }
}

/// Read the mirror for consumers: a missing file means no data, a stale one
/// (older than 120 s) means the daemon is not polling, so also no data.
pub fn read_mirror() -> Vec<TeamStateSession> {
    read_mirror_at(&paths::mirror_path(), true)
}

/// As [`read_mirror`], for an explicit path.
pub fn read_mirror_at(path: &Path, enforce_freshness: bool) -> Vec<TeamStateSession> {
    // Readers tolerate a mid-rename window by retrying once.
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        },
    };
    let Ok(mirror) = serde_json::from_str::<TeamStateMirror>(&content) else {
        return Vec::new();
    };
    if enforce_freshness && !mirror.is_fresh(Utc::now()) {
        return Vec::new();
    }
    mirror.sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn session(id: &str, instance: Option<&str>) -> TeamStateSession {
        TeamStateSession {
            session_id: id.to_string(),
            user_id: "u2".to_string(),
            display_name: "Sam".to_string(),
            repo_name: "widget".to_string(),
            started_at: Utc::now(),
            summary: None,
            regions: vec![],
            instance_url: instance.map(ToString::to_string),
        }
    }

    fn write_mirror(path: &Path, mirror: &TeamStateMirror) {
        std::fs::write(path, serde_json::to_string_pretty(mirror).unwrap()).unwrap();
    }

    #[test]
    fn missing_mirror_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = read_mirror_at(&dir.path().join("team-state.json"), true);
        assert!(sessions.is_empty());
    }

    #[test]
    fn fresh_mirror_reads_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team-state.json");
        write_mirror(
            &path,
            &TeamStateMirror {
                sessions: vec![session("s1", Some("https://a.example.com"))],
                updated_at: Utc::now(),
            },
        );
        let sessions = read_mirror_at(&path, true);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "s1");
    }

    #[test]
    fn stale_mirror_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team-state.json");
        write_mirror(
            &path,
            &TeamStateMirror {
                sessions: vec![session("s1", Some("https://a.example.com"))],
                updated_at: Utc::now() - ChronoDuration::seconds(180),
            },
        );
        assert!(read_mirror_at(&path, true).is_empty());
        // Retention reads skip the freshness gate.
        assert_eq!(read_mirror_at(&path, false).len(), 1);
    }

    #[test]
    fn corrupt_mirror_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team-state.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(read_mirror_at(&path, true).is_empty());
    }
}
