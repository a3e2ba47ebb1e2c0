//! HTTP client for a team instance's v1 API.
//!
//! All endpoints use bearer auth and the `{data: ...}` response envelope.
//! A 401 anywhere maps to [`Error::Auth`] so callers can suspend the team;
//! transport and 5xx failures map to [`Error::Http`] and are retryable.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Event, Overlap, TeamStateSession};

/// Standard response envelope.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

/// Response from `GET /api/v1/auth/verify`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyInfo {
    pub user_id: String,
    pub display_name: String,
    pub team_name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RepoInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReposData {
    repos: Vec<RepoInfo>,
}

/// Response from `POST /api/v1/ingest`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestSummary {
    #[serde(default)]
    pub processed: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub sessions_created: usize,
    #[serde(default)]
    pub sessions_ended: usize,
    #[serde(default)]
    pub file_ops_created: usize,
    #[serde(default)]
    pub prompts_created: usize,
    #[serde(default)]
    pub agent_responses_created: usize,
}

#[derive(Debug, Deserialize)]
struct TeamStateData {
    #[serde(default)]
    sessions: Vec<TeamStateSession>,
}

/// Request body for `POST /api/v1/overlap-query`.
#[derive(Debug, Clone, Serialize)]
pub struct OverlapQuery {
    pub repo_name: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

/// Response from `POST /api/v1/overlap-query`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OverlapQueryResponse {
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub overlaps: Vec<Overlap>,
    #[serde(default)]
    pub guidance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginLinkData {
    login_url: String,
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    events: &'a [Event],
}

/// Per-endpoint timeouts.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(3);
const ROSTER_TIMEOUT: Duration = Duration::from_secs(5);
const TEAM_STATE_TIMEOUT: Duration = Duration::from_secs(5);
const OVERLAP_TIMEOUT: Duration = Duration::from_secs(2);
const INGEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for one team instance.
pub struct TeamClient {
    http: reqwest::Client,
    base_url: String,
}

impl TeamClient {
    /// Build a client for the given canonical instance URL and bearer token.
    pub fn new(instance_url: &str, token: &str) -> Result<Self> {
        let base_url = instance_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("empty instance_url".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = format!("Bearer {}", token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| Error::Config(format!("invalid user_token: {}", e)))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn verify(&self) -> Result<VerifyInfo> {
        let url = format!("{}/api/v1/auth/verify", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(VERIFY_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse::<ApiEnvelope<VerifyInfo>>(response)
            .await
            .map(|env| env.data)
    }

    /// Repo names this team tracks.
    pub async fn fetch_repos(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/repos", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(ROSTER_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let env: ApiEnvelope<ReposData> = self.parse(response).await?;
        Ok(env.data.repos.into_iter().map(|r| r.name).collect())
    }

    /// Deliver a batch of events. The server is the source of truth for
    /// dedup; per-event errors come back in the summary and are never
    /// retried.
    pub async fn ingest(&self, events: &[Event]) -> Result<IngestSummary> {
        let url = format!("{}/api/v1/ingest", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(INGEST_TIMEOUT)
            .json(&IngestRequest { events })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse::<ApiEnvelope<IngestSummary>>(response)
            .await
            .map(|env| env.data)
    }

    pub async fn team_state(&self) -> Result<Vec<TeamStateSession>> {
        let url = format!("{}/api/v1/team-state", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(TEAM_STATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let env: ApiEnvelope<TeamStateData> = self.parse(response).await?;
        Ok(env.data.sessions)
    }

    pub async fn overlap_query(&self, query: &OverlapQuery) -> Result<OverlapQueryResponse> {
        let url = format!("{}/api/v1/overlap-query", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(OVERLAP_TIMEOUT)
            .json(query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse::<ApiEnvelope<OverlapQueryResponse>>(response)
            .await
            .map(|env| env.data)
    }

    /// Request a fresh browser login URL (used for 401 remediation logs).
    pub async fn login_link(&self) -> Result<String> {
        let url = format!("{}/api/v1/auth/login-link", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(VERIFY_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.parse::<ApiEnvelope<LoginLinkData>>(response)
            .await
            .map(|env| env.data.login_url)
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        Error::Http(format!("request to {} failed: {}", self.base_url, e))
    }

    async fn parse<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Auth(self.base_url.clone()));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::Http(format!("API error ({}): {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Http(format!("failed to parse response: {}", e)))
    }
}
