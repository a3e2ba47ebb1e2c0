//! Configuration loading and management.
//!
//! Configuration lives at `~/.overlap/config.json`:
//!
//! ```json
//! {
//!   "teams": [
//!     {"name": "core", "instance_url": "https://team.example.com",
//!      "user_token": "ot_live_xxx", "user_id": "u_123"}
//!   ],
//!   "tracer": {"batch_interval_ms": 2000, "max_batch_size": 50,
//!              "repo_sync_interval_ms": 300000}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::paths;

/// Server-side ceiling on events per ingest call; larger configured batch
/// sizes are clamped down to this.
pub const SERVER_MAX_BATCH_SIZE: usize = 100;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Team instances to forward events to
    #[serde(default)]
    pub teams: Vec<TeamConfig>,

    /// Tracer daemon tuning
    #[serde(default)]
    pub tracer: TracerConfig,
}

/// One joined team instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeamConfig {
    /// Display name chosen at join time
    pub name: String,
    /// Base URL of the team instance; canonical form has no trailing slash
    pub instance_url: String,
    /// Bearer token for this user on this instance
    pub user_token: String,
    /// This user's id on the instance, stamped onto outgoing events
    pub user_id: String,
}

impl TeamConfig {
    /// Canonical instance URL: trailing slashes stripped. Two configs whose
    /// URLs differ only by trailing slash are the same team.
    pub fn canonical_url(&self) -> String {
        canonicalize_url(&self.instance_url)
    }
}

/// Strip trailing slashes from an instance URL.
pub fn canonicalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Tracer daemon tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TracerConfig {
    /// Milliseconds to buffer events before a timed flush
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Events per ingest call (clamped to the server maximum of 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Milliseconds between repo roster refreshes
    #[serde(default = "default_repo_sync_interval_ms")]
    pub repo_sync_interval_ms: u64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            max_batch_size: default_max_batch_size(),
            repo_sync_interval_ms: default_repo_sync_interval_ms(),
        }
    }
}

fn default_batch_interval_ms() -> u64 {
    2000
}

fn default_max_batch_size() -> usize {
    50
}

fn default_repo_sync_interval_ms() -> u64 {
    300_000
}

impl TracerConfig {
    /// Batch size after clamping to the server ceiling.
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.clamp(1, SERVER_MAX_BATCH_SIZE)
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file yields the default (no teams) configuration; the
    /// tracer then idles until the user joins a team.
    pub fn load() -> Result<Self> {
        let path = paths::config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Config::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Rejects teams whose instance URLs collide modulo trailing slashes and
    /// teams missing credentials.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for team in &self.teams {
            let canonical = team.canonical_url();
            if canonical.is_empty() {
                return Err(Error::Config(format!(
                    "team {:?} has an empty instance_url",
                    team.name
                )));
            }
            if team.user_token.is_empty() {
                return Err(Error::Config(format!(
                    "team {:?} has an empty user_token",
                    team.name
                )));
            }
            if !seen.insert(canonical.clone()) {
                return Err(Error::Config(format!(
                    "duplicate team instance_url: {}",
                    canonical
                )));
            }
        }
        if self.tracer.max_batch_size == 0 {
            return Err(Error::Config(
                "tracer.max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical URLs of every configured team, in config order.
    pub fn team_urls(&self) -> Vec<String> {
        self.teams.iter().map(|t| t.canonical_url()).collect()
    }

    /// User ids across all configured teams (used for probe self-exclusion).
    pub fn user_ids(&self) -> std::collections::HashSet<String> {
        self.teams.iter().map(|t| t.user_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team(url: &str) -> TeamConfig {
        TeamConfig {
            name: "t".to_string(),
            instance_url: url.to_string(),
            user_token: "tok".to_string(),
            user_id: "u1".to_string(),
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.teams.is_empty());
        assert_eq!(config.tracer.batch_interval_ms, 2000);
        assert_eq!(config.tracer.max_batch_size, 50);
        assert_eq!(config.tracer.repo_sync_interval_ms, 300_000);
    }

    #[test]
    fn parse_config() {
        let json = r#"{
            "teams": [
                {"name": "core", "instance_url": "https://team.example.com/",
                 "user_token": "tok", "user_id": "u1"}
            ],
            "tracer": {"batch_interval_ms": 500}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.teams.len(), 1);
        assert_eq!(
            config.teams[0].canonical_url(),
            "https://team.example.com"
        );
        assert_eq!(config.tracer.batch_interval_ms, 500);
        assert_eq!(config.tracer.max_batch_size, 50);
    }

    #[test]
    fn url_canonicalization() {
        assert_eq!(
            canonicalize_url("https://a.example.com///"),
            "https://a.example.com"
        );
        assert_eq!(
            canonicalize_url("https://a.example.com"),
            "https://a.example.com"
        );
    }

    #[test]
    fn duplicate_urls_modulo_slash_rejected() {
        let config = Config {
            teams: vec![team("https://a.example.com"), team("https://a.example.com/")],
            tracer: TracerConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn distinct_urls_accepted() {
        let config = Config {
            teams: vec![team("https://a.example.com"), team("https://b.example.com")],
            tracer: TracerConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn batch_size_clamped_to_server_maximum() {
        let tracer = TracerConfig {
            max_batch_size: 5000,
            ..Default::default()
        };
        assert_eq!(tracer.effective_batch_size(), 100);

        let tracer = TracerConfig {
            max_batch_size: 20,
            ..Default::default()
        };
        assert_eq!(tracer.effective_batch_size(), 20);
    }
}
