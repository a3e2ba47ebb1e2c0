//! Durable tracer state: `state.json` (tracked journal files) and
//! `cache.json` (repo rosters + memoized git remotes).
//!
//! Both files are pretty-printed JSON written via temp-file-then-rename.
//! An unparseable file is treated as empty — the daemon starts from scratch
//! and only overwrites the corrupt file on the next successful save.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::paths;
use crate::repos::{repo_name_from_url, GitRemoteInfo};
use crate::types::{RepoRoster, TrackedFile};

/// On-disk shape of `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracerState {
    #[serde(default)]
    pub tracked_files: HashMap<String, TrackedFile>,
}

/// On-disk shape of `cache.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheFile {
    #[serde(default)]
    pub repo_lists: BTreeMap<String, RepoRoster>,
    #[serde(default)]
    pub git_remotes: HashMap<String, GitRemoteEntry>,
}

/// Cached git remote, accepting the legacy format.
///
/// Older state writers stored the bare remote URL as a string; the current
/// format is the `{name, remote_url}` object. Legacy entries are migrated to
/// the object form on the next save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GitRemoteEntry {
    Info(GitRemoteInfo),
    Legacy(String),
}

impl GitRemoteEntry {
    /// Normalize to the object form, deriving the name from the URL for
    /// legacy entries. Unparseable legacy URLs are dropped.
    pub fn into_info(self) -> Option<GitRemoteInfo> {
        match self {
            GitRemoteEntry::Info(info) => Some(info),
            GitRemoteEntry::Legacy(url) => {
                let name = repo_name_from_url(&url)?;
                Some(GitRemoteInfo {
                    name,
                    remote_url: url,
                })
            }
        }
    }
}

/// Load/save facade over the two durable files.
pub struct StateStore {
    state_path: PathBuf,
    cache_path: PathBuf,
}

impl StateStore {
    /// Store rooted at the per-user state directory.
    pub fn new() -> Self {
        Self {
            state_path: paths::state_path(),
            cache_path: paths::cache_path(),
        }
    }

    /// Store rooted at an explicit directory (tests).
    pub fn at(dir: &Path) -> Self {
        Self {
            state_path: dir.join("state.json"),
            cache_path: dir.join("cache.json"),
        }
    }

    pub fn load_state(&self) -> TracerState {
        load_or_default(&self.state_path)
    }

    pub fn save_state(&self, state: &TracerState) -> crate::error::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        paths::write_atomic(&self.state_path, json.as_bytes())
    }

    /// Load the cache, migrating legacy git-remote entries to the object
    /// form in memory (the migration persists on the next save).
    pub fn load_cache(&self) -> (BTreeMap<String, RepoRoster>, HashMap<String, GitRemoteInfo>) {
        let cache: CacheFile = load_or_default(&self.cache_path);
        let git_remotes = cache
            .git_remotes
            .into_iter()
            .filter_map(|(path, entry)| entry.into_info().map(|info| (path, info)))
            .collect();
        (cache.repo_lists, git_remotes)
    }

    pub fn save_cache(
        &self,
        repo_lists: &BTreeMap<String, RepoRoster>,
        git_remotes: &HashMap<String, GitRemoteInfo>,
    ) -> crate::error::Result<()> {
        let cache = CacheFile {
            repo_lists: repo_lists.clone(),
            git_remotes: git_remotes
                .iter()
                .map(|(path, info)| (path.clone(), GitRemoteEntry::Info(info.clone())))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&cache)?;
        paths::write_atomic(&self.cache_path, json.as_bytes())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read state file");
            }
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "State file unparseable; starting empty"
            );
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked() -> TrackedFile {
        TrackedFile {
            byte_offset: 2048,
            session_id: "s1".to_string(),
            matched_teams: vec!["https://a.example.com".to_string()],
            matched_repo: "widget".to_string(),
            sub_dir_repos: None,
            turn_number: 4,
            files_touched: vec!["src/lib.rs".to_string()],
            cwd: "/w/widget".to_string(),
        }
    }

    #[test]
    fn state_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path());

        let mut state = TracerState::default();
        state
            .tracked_files
            .insert("/w/widget/s1.jsonl".to_string(), tracked());
        store.save_state(&state).unwrap();

        let loaded = store.load_state();
        assert_eq!(
            loaded.tracked_files.get("/w/widget/s1.jsonl"),
            Some(&tracked())
        );
    }

    #[test]
    fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path());
        assert!(store.load_state().tracked_files.is_empty());
        let (rosters, remotes) = store.load_cache();
        assert!(rosters.is_empty());
        assert!(remotes.is_empty());
    }

    #[test]
    fn corrupt_state_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "{not json").unwrap();

        let store = StateStore::at(dir.path());
        assert!(store.load_state().tracked_files.is_empty());

        // The corrupt file is only replaced by a successful save.
        let mut state = TracerState::default();
        state
            .tracked_files
            .insert("/w/x.jsonl".to_string(), tracked());
        store.save_state(&state).unwrap();
        assert_eq!(store.load_state().tracked_files.len(), 1);
    }

    #[test]
    fn legacy_git_remote_strings_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = r#"{
            "repo_lists": {},
            "git_remotes": {
                "/w/widget": "git@github.com:org/widget.git",
                "/w/gadget": {"name": "gadget", "remote_url": "https://github.com/org/gadget"}
            }
        }"#;
        std::fs::write(dir.path().join("cache.json"), legacy).unwrap();

        let store = StateStore::at(dir.path());
        let (rosters, remotes) = store.load_cache();
        assert!(rosters.is_empty());
        assert_eq!(remotes.get("/w/widget").unwrap().name, "widget");
        assert_eq!(remotes.get("/w/gadget").unwrap().name, "gadget");

        // Saving writes the object form for every entry.
        store.save_cache(&rosters, &remotes).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("cache.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["git_remotes"]["/w/widget"].is_object());
    }

    #[test]
    fn cache_roundtrip_preserves_rosters() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path());

        let mut rosters = BTreeMap::new();
        rosters.insert(
            "https://a.example.com".to_string(),
            RepoRoster {
                repos: ["widget".to_string()].into_iter().collect(),
                fetched_at: None,
            },
        );
        store.save_cache(&rosters, &HashMap::new()).unwrap();

        let (loaded, _) = store.load_cache();
        assert!(loaded["https://a.example.com"].contains("widget"));
    }
}
