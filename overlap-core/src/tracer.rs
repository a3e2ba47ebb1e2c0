//! The tracer supervisor: wires the journal watcher, event derivation,
//! repo matching, batched delivery, and durable state into one long-lived
//! single-threaded loop.
//!
//! Lifecycle: `Stopped → Starting → Running → Draining → Stopped`. Watch
//! callbacks arrive on notify's thread and are funneled through an mpsc
//! channel into the loop, so tracked files, accumulators, and sender queues
//! are only ever touched from one place.
//!
//! Durability: the supervisor holds an in-memory `read_head` per journal
//! file; the persisted `byte_offset` only advances on the state-flush timer
//! once the sender holds no pending events for that file. On shutdown the
//! read heads are committed unconditionally after a bounded drain — anything
//! dropped at the final attempt has been logged.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};

use crate::client::TeamClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{AgentAdapter, ClaudeCodeAdapter, JournalReader};
use crate::paths;
use crate::repos::{self, GitRemoteInfo};
use crate::sender::{FlushOutcome, Sender, SenderParams};
use crate::state::{StateStore, TracerState};
use crate::symbols;
use crate::teamstate::{TeamStatePoller, POLL_INTERVAL};
use crate::types::{Event, EventKind, RepoRoster, SessionAccumulator, TrackedFile};

const STATE_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const LOOP_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Draining,
}

#[derive(Debug, Default)]
pub struct TracerOptions {
    /// Override the agent's journal root (tests, unusual installs).
    pub journal_root: Option<PathBuf>,
}

enum LoopExit {
    Reload,
    Shutdown,
}

pub struct Tracer {
    config: Config,
    adapter: Box<dyn AgentAdapter>,
    store: StateStore,
    state: TracerState,
    accumulators: HashMap<String, SessionAccumulator>,
    read_heads: HashMap<String, u64>,
    rosters: BTreeMap<String, RepoRoster>,
    git_cache: HashMap<String, GitRemoteInfo>,
    sender: Sender,
    poller: TeamStatePoller,
    phase: Phase,
}

impl Tracer {
    pub fn new(config: Config, options: TracerOptions) -> Result<Self> {
        config.validate()?;

        let adapter: Box<dyn AgentAdapter> = match options.journal_root {
            Some(root) => Box::new(ClaudeCodeAdapter::with_root(root)),
            None => Box::new(ClaudeCodeAdapter::new()),
        };

        let store = StateStore::new();
        let state = store.load_state();
        let (rosters, git_cache) = store.load_cache();

        let sender = Sender::new(SenderParams::from_config(&config.tracer), &config.teams)?;
        let poller = TeamStatePoller::new(&config.teams)?;

        Ok(Self {
            config,
            adapter,
            store,
            state,
            accumulators: HashMap::new(),
            read_heads: HashMap::new(),
            rosters,
            git_cache,
            sender,
            poller,
            phase: Phase::Stopped,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the daemon until a termination signal arrives.
    pub async fn run(&mut self) -> Result<()> {
        self.phase = Phase::Starting;
        paths::write_pid_file()?;

        self.verify_teams().await;
        self.refresh_rosters(true).await;

        // Rebuild volatile session state from the durable table.
        for (path, tracked) in &self.state.tracked_files {
            self.accumulators
                .insert(path.clone(), SessionAccumulator::from_tracked(tracked));
            self.read_heads.insert(path.clone(), tracked.byte_offset);
        }

        // Catch up on journals that grew (or appeared) while we were down.
        for path in self.adapter.discover_files() {
            self.process_file(&path).await;
        }

        // Recursive directory watch, funneled through an mpsc channel. A
        // failing watch API degrades to scan-only operation (roster refreshes
        // still trigger re-scans).
        let (fs_tx, fs_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = fs_tx.send(res);
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "File watcher unavailable; running scan-only");
                None
            }
        };
        if let (Some(watcher), Some(dir)) = (watcher.as_mut(), self.adapter.watch_dir()) {
            if dir.exists() {
                match watcher.watch(&dir, RecursiveMode::Recursive) {
                    Ok(()) => tracing::info!(dir = %dir.display(), "Watching journal root"),
                    Err(e) => tracing::warn!(
                        dir = %dir.display(),
                        error = %Error::Watch(e.to_string()),
                        "Failed to watch journal root; running scan-only"
                    ),
                }
            } else {
                tracing::warn!(dir = %dir.display(), "Journal root does not exist yet");
            }
        }

        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        self.phase = Phase::Running;
        tracing::info!(
            teams = self.config.teams.len(),
            tracked = self.state.tracked_files.len(),
            "Tracer running"
        );

        loop {
            let exit = self
                .run_loop(&fs_rx, &mut hangup, &mut interrupt, &mut terminate)
                .await;
            match exit {
                LoopExit::Reload => {
                    self.reload().await;
                }
                LoopExit::Shutdown => break,
            }
        }

        self.shutdown(&mut interrupt, &mut terminate).await;
        Ok(())
    }

    /// One configuration epoch of the main loop. Returns on reload (so
    /// timers pick up new intervals) or on a termination signal.
    async fn run_loop(
        &mut self,
        fs_rx: &Receiver<notify::Result<notify::Event>>,
        hangup: &mut tokio::signal::unix::Signal,
        interrupt: &mut tokio::signal::unix::Signal,
        terminate: &mut tokio::signal::unix::Signal,
    ) -> LoopExit {
        let mut pending_watch: HashMap<PathBuf, Instant> = HashMap::new();

        let start = tokio::time::Instant::now();
        let mut tick = tokio::time::interval(LOOP_TICK);
        let mut state_flush =
            tokio::time::interval_at(start + STATE_FLUSH_INTERVAL, STATE_FLUSH_INTERVAL);
        let roster_period =
            Duration::from_millis(self.config.tracer.repo_sync_interval_ms.max(1000));
        let mut roster_refresh = tokio::time::interval_at(start + roster_period, roster_period);
        let mut team_poll = tokio::time::interval_at(start + POLL_INTERVAL, POLL_INTERVAL);
        let mut reload_poll =
            tokio::time::interval_at(start + RELOAD_POLL_INTERVAL, RELOAD_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    drain_watch_events(fs_rx, self.adapter.as_ref(), &mut pending_watch);
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending_watch
                        .iter()
                        .filter(|(_, at)| now.duration_since(**at) >= WATCH_DEBOUNCE)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        pending_watch.remove(&path);
                        self.process_file(&path).await;
                    }
                    let outcomes = self.sender.poll_due().await;
                    self.handle_flush_outcomes(outcomes).await;
                }
                _ = state_flush.tick() => {
                    self.commit_offsets();
                    self.save_all();
                }
                _ = roster_refresh.tick() => {
                    self.refresh_rosters(false).await;
                }
                _ = team_poll.tick() => {
                    let suspended: HashSet<String> =
                        self.sender.suspended_teams().into_iter().collect();
                    let outcomes = self.poller.poll_once(&suspended).await;
                    for outcome in outcomes {
                        if outcome.auth_failed {
                            self.suspend_team(&outcome.team_url).await;
                        }
                    }
                }
                _ = reload_poll.tick() => {
                    let flag = paths::reload_flag_path();
                    if flag.exists() {
                        let _ = std::fs::remove_file(&flag);
                        tracing::info!("Reload flag observed");
                        return LoopExit::Reload;
                    }
                }
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP received; reloading configuration");
                    return LoopExit::Reload;
                }
                _ = interrupt.recv() => return LoopExit::Shutdown,
                _ = terminate.recv() => return LoopExit::Shutdown,
            }
        }
    }

    /// Drain the sender (bounded), commit read heads, persist, clean up.
    /// Idempotent; a second termination signal forces exit without further
    /// flushing.
    async fn shutdown(
        &mut self,
        interrupt: &mut tokio::signal::unix::Signal,
        terminate: &mut tokio::signal::unix::Signal,
    ) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Draining;
        tracing::info!(pending = self.sender.pending_count(), "Draining sender");

        tokio::select! {
            outcomes = self.sender.flush_all(DRAIN_TIMEOUT) => {
                let sent: usize = outcomes.iter().map(|o| o.sent).sum();
                if sent > 0 {
                    tracing::info!(sent, "Final drain complete");
                }
            }
            _ = interrupt.recv() => tracing::warn!("Second signal; skipping drain"),
            _ = terminate.recv() => tracing::warn!("Second signal; skipping drain"),
        }

        if self.sender.has_pending() {
            tracing::warn!(
                dropped = self.sender.pending_count(),
                "Events still pending at shutdown were not delivered"
            );
        }

        // Best effort: commit everything we parsed, even if the last flush
        // failed — the loss has been logged above.
        for (path, head) in &self.read_heads {
            if let Some(tracked) = self.state.tracked_files.get_mut(path) {
                if *head > tracked.byte_offset {
                    tracked.byte_offset = *head;
                }
            }
        }
        self.save_all();
        paths::remove_pid_file_if_own();
        self.phase = Phase::Stopped;
        tracing::info!("Tracer stopped");
    }

    /// Advance durable offsets for files whose derived events have all been
    /// acknowledged.
    fn commit_offsets(&mut self) {
        for (path, head) in &self.read_heads {
            if let Some(tracked) = self.state.tracked_files.get_mut(path) {
                if *head > tracked.byte_offset && !self.sender.pending_for(Path::new(path)) {
                    tracked.byte_offset = *head;
                }
            }
        }
    }

    fn save_all(&self) {
        if let Err(e) = self.store.save_state(&self.state) {
            tracing::warn!(error = %e, "Failed to save state");
        }
        if let Err(e) = self.store.save_cache(&self.rosters, &self.git_cache) {
            tracing::warn!(error = %e, "Failed to save cache");
        }
    }

    /// Best-effort startup token check; logs who we are on each team.
    async fn verify_teams(&self) {
        let checks = self.config.teams.iter().map(|team| {
            let url = team.canonical_url();
            let token = team.user_token.clone();
            async move {
                match TeamClient::new(&url, &token) {
                    Ok(client) => (url, client.verify().await),
                    Err(e) => (url, Err(e)),
                }
            }
        });
        for (url, result) in futures::future::join_all(checks).await {
            match result {
                Ok(info) => tracing::info!(
                    team = %url,
                    user = %info.display_name,
                    team_name = %info.team_name,
                    "Token verified"
                ),
                Err(e) => tracing::warn!(team = %url, error = %e, "Token verification failed"),
            }
        }
    }

    /// Refresh every non-suspended team's roster; errors keep the cached
    /// roster. After a refresh the diff drives eviction and backfill.
    async fn refresh_rosters(&mut self, initial: bool) {
        let old_union = roster_union(&self.rosters);

        let fetches: Vec<_> = self
            .config
            .teams
            .iter()
            .map(|t| (t.canonical_url(), t.user_token.clone()))
            .filter(|(url, _)| !self.sender.is_suspended(url))
            .collect();

        let results = futures::future::join_all(fetches.into_iter().map(
            |(url, token)| async move {
                let result = match TeamClient::new(&url, &token) {
                    Ok(client) => client.fetch_repos().await,
                    Err(e) => Err(e),
                };
                (url, result)
            },
        ))
        .await;

        let mut auth_failures = Vec::new();
        for (url, result) in results {
            match result {
                Ok(names) => {
                    tracing::debug!(team = %url, repos = names.len(), "Roster refreshed");
                    self.rosters.insert(
                        url,
                        RepoRoster {
                            repos: names.into_iter().collect(),
                            fetched_at: Some(Utc::now()),
                        },
                    );
                }
                Err(Error::Auth(_)) => auth_failures.push(url),
                Err(e) => {
                    tracing::warn!(team = %url, error = %e, "Roster refresh failed; keeping cached roster");
                }
            }
        }
        for url in auth_failures {
            self.suspend_team(&url).await;
        }

        if !initial {
            let new_union = roster_union(&self.rosters);
            self.apply_roster_diff(&old_union, &new_union).await;
        }
    }

    /// Evict tracked files for removed repos; re-scan for added ones.
    async fn apply_roster_diff(&mut self, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        let removed: Vec<&String> = old.difference(new).collect();
        let added: Vec<&String> = new.difference(old).collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }

        if !removed.is_empty() {
            let removed: BTreeSet<&str> = removed.iter().map(|s| s.as_str()).collect();
            let evict: Vec<String> = self
                .state
                .tracked_files
                .iter()
                .filter(|(_, t)| removed.contains(t.matched_repo.as_str()))
                .map(|(path, _)| path.clone())
                .collect();
            for path in evict {
                tracing::info!(path = %path, "Evicting tracked file (repo unregistered)");
                self.state.tracked_files.remove(&path);
                self.accumulators.remove(&path);
                self.read_heads.remove(&path);
            }
        }

        if !added.is_empty() {
            tracing::info!(added = added.len(), "New repos registered; re-scanning journals");
            for path in self.adapter.discover_files() {
                self.process_file(&path).await;
            }
        }
    }

    async fn suspend_team(&mut self, team_url: &str) {
        if self.sender.is_suspended(team_url) {
            return;
        }
        self.sender.suspend(team_url);

        // Actionable remediation: a fresh login link when the instance will
        // hand one out, a generic pointer otherwise.
        let team = self
            .config
            .teams
            .iter()
            .find(|t| t.canonical_url() == team_url);
        let login_url = match team {
            Some(team) => match TeamClient::new(team_url, &team.user_token) {
                Ok(client) => client.login_link().await.ok(),
                Err(_) => None,
            },
            None => None,
        };
        match login_url {
            Some(url) => tracing::warn!(
                team = %team_url,
                "Token rejected; suspended this team. Re-authenticate at {} and update config.json",
                url
            ),
            None => tracing::warn!(
                team = %team_url,
                "Token rejected; suspended this team. Re-authenticate and update config.json"
            ),
        }
    }

    async fn handle_flush_outcomes(&mut self, outcomes: Vec<FlushOutcome>) {
        for outcome in outcomes {
            if outcome.auth_failed {
                self.suspend_team(&outcome.team_url).await;
            }
        }
    }

    async fn reload(&mut self) {
        match Config::load() {
            Ok(config) => {
                match Sender::new(SenderParams::from_config(&config.tracer), &config.teams) {
                    Ok(sender) => {
                        // Replacing the queues is acceptable: reload only
                        // happens after the user explicitly reconfigured.
                        self.sender = sender;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Reload: failed to rebuild sender");
                        return;
                    }
                }
                match TeamStatePoller::new(&config.teams) {
                    Ok(poller) => self.poller = poller,
                    Err(e) => {
                        tracing::warn!(error = %e, "Reload: failed to rebuild poller");
                        return;
                    }
                }
                self.config = config;
                self.refresh_rosters(true).await;
                tracing::info!(teams = self.config.teams.len(), "Configuration reloaded");
            }
            Err(e) => tracing::warn!(error = %e, "Reload failed; keeping previous configuration"),
        }
    }

    /// Ingest whatever is new in one journal file.
    pub async fn process_file(&mut self, path: &Path) {
        if !self.adapter.matches_path(path) {
            return;
        }
        let key = path.to_string_lossy().into_owned();

        if !self.state.tracked_files.contains_key(&key) && !self.bootstrap_file(path, &key).await {
            return;
        }

        let head = *self
            .read_heads
            .get(&key)
            .unwrap_or(&self.state.tracked_files[&key].byte_offset);

        let reader = JournalReader::new(path);
        let batch = match reader.read_from(head).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(path = %key, error = %e, "Journal read failed");
                return;
            }
        };

        if batch.truncated {
            // Logical reset: re-process from zero and let the server dedup.
            tracing::warn!(path = %key, "Journal shrank below committed offset; resetting");
            if let Some(tracked) = self.state.tracked_files.get_mut(&key) {
                tracked.byte_offset = 0;
                tracked.turn_number = 0;
                tracked.files_touched.clear();
            }
            self.accumulators
                .insert(key.clone(), SessionAccumulator::default());
        }

        if batch.records.is_empty() {
            self.read_heads.insert(key, batch.new_offset);
            return;
        }

        let tracked = self.state.tracked_files[&key].clone();
        let mut acc = self.accumulators.remove(&key).unwrap_or_default();

        let mut derived = Vec::new();
        for record in &batch.records {
            derived.extend(self.adapter.parse_line(record, &tracked.session_id, &mut acc));
        }

        for event in derived {
            self.route_event(event, &tracked, path);
        }

        self.read_heads.insert(key.clone(), batch.new_offset);

        if let Some(entry) = self.state.tracked_files.get_mut(&key) {
            entry.turn_number = acc.turn_number;
            entry.files_touched = acc.files_touched.iter().cloned().collect();
            if let Some(cwd) = &acc.cwd {
                entry.cwd = cwd.clone();
            }
        }
        self.accumulators.insert(key, acc);
    }

    /// First sight of a journal file: find its cwd, run the matcher, and
    /// create the tracked record. Returns false when the file should be
    /// skipped (no cwd yet, or no roster match).
    async fn bootstrap_file(&mut self, path: &Path, key: &str) -> bool {
        let reader = JournalReader::new(path);
        let batch = match reader.read_from(0).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(path = %key, error = %e, "Journal read failed");
                return false;
            }
        };

        let Some((cwd, record_session_id)) = first_session_info(&batch.records) else {
            // No cwd in any readable record yet; retried on the next event.
            tracing::debug!(path = %key, "No cwd seen yet; deferring");
            return false;
        };
        let session_id = record_session_id
            .or_else(|| self.adapter.extract_session_id(path))
            .unwrap_or_else(|| key.to_string());

        let matches =
            repos::match_repo(Path::new(&cwd), &self.rosters, &mut self.git_cache).await;
        if matches.is_empty() {
            tracing::debug!(path = %key, cwd = %cwd, "No roster match; skipping journal");
            return false;
        }

        let mut matched_teams = Vec::new();
        for m in &matches {
            if !matched_teams.contains(&m.team_url) {
                matched_teams.push(m.team_url.clone());
            }
        }
        let sub_dir_repos: BTreeMap<String, String> = matches
            .iter()
            .filter_map(|m| m.subdir.clone().map(|s| (s, m.repo_name.clone())))
            .collect();

        let tracked = TrackedFile {
            byte_offset: 0,
            session_id,
            matched_teams,
            matched_repo: matches[0].repo_name.clone(),
            sub_dir_repos: (!sub_dir_repos.is_empty()).then_some(sub_dir_repos),
            turn_number: 0,
            files_touched: Vec::new(),
            cwd,
        };
        tracing::info!(
            path = %key,
            repo = %tracked.matched_repo,
            teams = tracked.matched_teams.len(),
            subdirs = tracked.sub_dir_repos.as_ref().map(|m| m.len()).unwrap_or(0),
            "Tracking journal"
        );
        self.state.tracked_files.insert(key.to_string(), tracked);
        self.accumulators
            .insert(key.to_string(), SessionAccumulator::default());
        self.read_heads.insert(key.to_string(), 0);
        true
    }

    /// Enrich one event, relativize its paths, and enqueue it per team.
    fn route_event(&mut self, mut event: Event, tracked: &TrackedFile, source: &Path) {
        // Symbol enrichment for edits that carry the replaced text.
        if let EventKind::FileOp {
            file_path,
            old_string: Some(old_string),
            start_line,
            end_line,
            function_name,
            ..
        } = &mut event.kind
        {
            if !file_path.starts_with('(') {
                let abs = absolute_in(file_path, &tracked.cwd);
                if let Some(region) = symbols::resolve_region(&abs, old_string) {
                    *start_line = Some(region.start_line);
                    *end_line = Some(region.end_line);
                    *function_name = region.enclosing_symbol;
                }
            }
        }

        // SessionStarts pick up the remote URL once the matcher cached it.
        if let EventKind::SessionStart { git_remote_url, .. } = &mut event.kind {
            if git_remote_url.is_none() {
                *git_remote_url = self
                    .git_cache
                    .get(&tracked.cwd)
                    .map(|info| info.remote_url.clone());
            }
        }

        match &tracked.sub_dir_repos {
            Some(subdirs) if event.is_file_op() => {
                let EventKind::FileOp { file_path, .. } = &mut event.kind else {
                    unreachable!();
                };
                let Some((repo, rel)) = subdir_route(file_path, &tracked.cwd, subdirs) else {
                    // Outside every registered subrepo (or a sentinel op):
                    // nothing to attribute it to.
                    tracing::trace!(file = %file_path, "File op outside registered subrepos; dropped");
                    return;
                };
                *file_path = rel;
                event.session_id = format!("{}:{}", tracked.session_id, repo);
                event.repo_name = Some(repo.clone());

                let teams: Vec<String> = self
                    .rosters
                    .iter()
                    .filter(|(_, roster)| roster.contains(&repo))
                    .map(|(url, _)| url.clone())
                    .collect();
                for team in teams {
                    self.sender.add(&team, event.clone(), Some(source));
                }
            }
            _ => {
                if let EventKind::FileOp { file_path, .. } = &mut event.kind {
                    if !file_path.starts_with('(') {
                        *file_path = relativize(file_path, &tracked.cwd);
                    }
                }
                event.repo_name = Some(tracked.matched_repo.clone());
                for team in &tracked.matched_teams {
                    self.sender.add(team, event.clone(), Some(source));
                }
            }
        }
    }
}

/// Union of repo names across all team rosters.
fn roster_union(rosters: &BTreeMap<String, RepoRoster>) -> BTreeSet<String> {
    rosters
        .values()
        .flat_map(|r| r.repos.iter().cloned())
        .collect()
}

/// Pull Create/Modify file events out of notify callbacks into the debounce
/// map, keeping only paths that look like journal files.
fn drain_watch_events(
    fs_rx: &Receiver<notify::Result<notify::Event>>,
    adapter: &dyn AgentAdapter,
    pending: &mut HashMap<PathBuf, Instant>,
) {
    loop {
        match fs_rx.try_recv() {
            Ok(Ok(event)) => {
                if !matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    continue;
                }
                for path in event.paths {
                    if adapter.matches_path(&path) {
                        pending.insert(path, Instant::now());
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Watch error"),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                tracing::warn!("Watcher channel disconnected");
                break;
            }
        }
    }
}

/// Scan raw records for the first one carrying a `cwd`; also pick up the
/// session id when the record names one.
fn first_session_info(records: &[String]) -> Option<(String, Option<String>)> {
    for record in records {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(record) else {
            continue;
        };
        if let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()) {
            let session_id = value
                .get("sessionId")
                .or_else(|| value.get("session_id"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            return Some((cwd.to_string(), session_id));
        }
    }
    None
}

/// Make a tool-input path absolute against the session cwd.
fn absolute_in(file_path: &str, cwd: &str) -> PathBuf {
    let path = Path::new(file_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(cwd).join(path)
    }
}

/// Express a file path relative to the session cwd when it lies inside.
fn relativize(file_path: &str, cwd: &str) -> String {
    Path::new(file_path)
        .strip_prefix(cwd)
        .map(|rel| rel.to_string_lossy().into_owned())
        .unwrap_or_else(|_| file_path.to_string())
}

/// Route a file path through the subdir→repo map of a parent-directory
/// session: `{cwd}/a/x.ts` with `a → repo-a` becomes `(repo-a, x.ts)`.
/// Paths outside every registered subdir (and sentinel paths) route nowhere.
fn subdir_route(
    file_path: &str,
    cwd: &str,
    subdirs: &BTreeMap<String, String>,
) -> Option<(String, String)> {
    if file_path.starts_with('(') {
        return None;
    }
    let rel = Path::new(file_path).strip_prefix(cwd).ok()?;
    let mut components = rel.components();
    let first = components.next()?.as_os_str().to_string_lossy().into_owned();
    let repo = subdirs.get(&first)?.clone();
    let remainder = components.as_path().to_string_lossy().into_owned();
    if remainder.is_empty() {
        return None;
    }
    Some((repo, remainder))
}
