//! Batched event delivery with per-team queues.
//!
//! Each configured team gets an independent FIFO queue. Events flush when
//! the queue reaches the batch size or when the batch interval elapses,
//! whichever comes first. Transient failures back off exponentially and
//! requeue the batch at the head so per-team ordering holds; a 401 suspends
//! the team until the user re-authenticates. The supervisor drives the
//! queues by calling [`Sender::poll_due`] from its loop and consumes the
//! returned [`FlushOutcome`]s to advance durable offsets and react to auth
//! failures.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::client::TeamClient;
use crate::config::{TeamConfig, TracerConfig};
use crate::error::{Error, Result};
use crate::types::Event;

/// Queue bound; adds beyond this drop the incoming (newest) event.
pub const MAX_QUEUE_SIZE: usize = 500;
/// Transient-failure retries before a batch is abandoned.
pub const MAX_RETRIES: u32 = 5;
/// Ceiling on the exponential retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Sender tuning derived from the tracer config.
#[derive(Debug, Clone)]
pub struct SenderParams {
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub max_retry_delay: Duration,
}

impl SenderParams {
    pub fn from_config(tracer: &TracerConfig) -> Self {
        Self {
            batch_interval: Duration::from_millis(tracer.batch_interval_ms),
            max_batch_size: tracer.effective_batch_size(),
            max_queue_size: MAX_QUEUE_SIZE,
            max_retries: MAX_RETRIES,
            max_retry_delay: MAX_RETRY_DELAY,
        }
    }
}

/// Result of one completed flush, reported back to the supervisor.
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub team_url: String,
    /// Events acknowledged by the server in this flush.
    pub sent: usize,
    /// The team's token was rejected; the queue is now suspended.
    pub auth_failed: bool,
}

struct QueuedEvent {
    event: Event,
    /// Journal file the event was derived from, for offset durability.
    source: Option<PathBuf>,
}

struct TeamQueue {
    client: TeamClient,
    user_id: String,
    events: VecDeque<QueuedEvent>,
    flush_due: Option<Instant>,
    retry_at: Option<Instant>,
    retry_count: u32,
    inflight: bool,
    suspended: bool,
}

impl TeamQueue {
    fn clear_pending(&mut self) {
        self.events.clear();
        self.flush_due = None;
        self.retry_at = None;
        self.retry_count = 0;
    }
}

/// Per-team batched delivery.
pub struct Sender {
    params: SenderParams,
    queues: BTreeMap<String, TeamQueue>,
}

impl Sender {
    /// Build a sender with one queue per configured team, keyed by canonical
    /// instance URL.
    pub fn new(params: SenderParams, teams: &[TeamConfig]) -> Result<Self> {
        let mut queues = BTreeMap::new();
        for team in teams {
            let url = team.canonical_url();
            let client = TeamClient::new(&url, &team.user_token)?;
            queues.insert(
                url,
                TeamQueue {
                    client,
                    user_id: team.user_id.clone(),
                    events: VecDeque::new(),
                    flush_due: None,
                    retry_at: None,
                    retry_count: 0,
                    inflight: false,
                    suspended: false,
                },
            );
        }
        Ok(Self { params, queues })
    }

    /// Enqueue an event for one team.
    ///
    /// Suspended teams drop silently; a full queue drops the incoming event.
    pub fn add(&mut self, team_url: &str, event: Event, source: Option<&Path>) {
        let Some(queue) = self.queues.get_mut(team_url) else {
            tracing::debug!(team = team_url, "Dropping event for unknown team");
            return;
        };
        if queue.suspended {
            return;
        }
        if queue.events.len() >= self.params.max_queue_size {
            tracing::warn!(
                team = team_url,
                cap = self.params.max_queue_size,
                "Event queue full; dropping newest event"
            );
            return;
        }

        queue.events.push_back(QueuedEvent {
            event,
            source: source.map(Path::to_path_buf),
        });

        let now = Instant::now();
        if queue.events.len() >= self.params.max_batch_size {
            // Begin a flush at the next poll, unless one is inflight or a
            // retry timer owns the queue.
            if !queue.inflight && queue.retry_at.is_none() {
                queue.flush_due = Some(now);
            }
        } else if queue.flush_due.is_none() && queue.retry_at.is_none() {
            queue.flush_due = Some(now + self.params.batch_interval);
        }
    }

    /// Flush every queue whose flush or retry deadline has passed. Flushes
    /// for distinct teams run concurrently.
    pub async fn poll_due(&mut self) -> Vec<FlushOutcome> {
        let now = Instant::now();
        let params = &self.params;
        let due: Vec<_> = self
            .queues
            .iter_mut()
            .filter(|(_, q)| {
                !q.suspended
                    && !q.inflight
                    && !q.events.is_empty()
                    && (q.flush_due.is_some_and(|d| d <= now)
                        || q.retry_at.is_some_and(|d| d <= now))
            })
            .map(|(url, q)| flush_queue(params, url.clone(), q))
            .collect();

        futures::future::join_all(due)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Drain all queues, flushing teams in parallel rounds until everything
    /// is sent, a team's retry backoff kicks in, or `timeout` elapses.
    pub async fn flush_all(&mut self, timeout: Duration) -> Vec<FlushOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let params = &self.params;
            let round: Vec<_> = self
                .queues
                .iter_mut()
                .filter(|(_, q)| {
                    !q.suspended
                        && !q.inflight
                        && !q.events.is_empty()
                        && q.retry_at.map_or(true, |d| d <= now)
                })
                .map(|(url, q)| flush_queue(params, url.clone(), q))
                .collect();
            if round.is_empty() {
                break;
            }

            let budget = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(budget, futures::future::join_all(round)).await {
                Ok(results) => outcomes.extend(results.into_iter().flatten()),
                Err(_) => break,
            }
        }

        outcomes
    }

    /// Suspend a team: pending state is cleared and further adds drop.
    pub fn suspend(&mut self, team_url: &str) {
        if let Some(queue) = self.queues.get_mut(team_url) {
            queue.suspended = true;
            queue.clear_pending();
        }
    }

    pub fn unsuspend(&mut self, team_url: &str) {
        if let Some(queue) = self.queues.get_mut(team_url) {
            queue.suspended = false;
        }
    }

    pub fn is_suspended(&self, team_url: &str) -> bool {
        self.queues
            .get(team_url)
            .map(|q| q.suspended)
            .unwrap_or(false)
    }

    pub fn suspended_teams(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, q)| q.suspended)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Whether any queue still holds an event derived from `path`. Durable
    /// byte offsets only advance once this reports false.
    pub fn pending_for(&self, path: &Path) -> bool {
        self.queues.values().any(|q| {
            q.events
                .iter()
                .any(|qe| qe.source.as_deref() == Some(path))
        })
    }

    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|q| !q.events.is_empty())
    }

    pub fn pending_count(&self) -> usize {
        self.queues.values().map(|q| q.events.len()).sum()
    }

    #[cfg(test)]
    fn queue_len(&self, team_url: &str) -> usize {
        self.queues.get(team_url).map(|q| q.events.len()).unwrap_or(0)
    }
}

/// Flush one queue (reentrancy-guarded by `inflight`).
async fn flush_queue(
    params: &SenderParams,
    team_url: String,
    queue: &mut TeamQueue,
) -> Option<FlushOutcome> {
    if queue.suspended || queue.inflight || queue.events.is_empty() {
        return None;
    }
    queue.inflight = true;
    queue.flush_due = None;
    queue.retry_at = None;

    let count = queue.events.len().min(params.max_batch_size);
    let batch: Vec<QueuedEvent> = queue.events.drain(..count).collect();

    let wire: Vec<Event> = batch
        .iter()
        .map(|qe| {
            let mut event = qe.event.clone();
            event.redact_for_send();
            event.user_id = Some(queue.user_id.clone());
            event
        })
        .collect();

    let result = queue.client.ingest(&wire).await;
    queue.inflight = false;

    match result {
        Ok(summary) => {
            queue.retry_count = 0;
            if !summary.errors.is_empty() {
                tracing::warn!(
                    team = %team_url,
                    errors = ?summary.errors,
                    "Server reported per-event ingest errors (not retried)"
                );
            }
            tracing::debug!(
                team = %team_url,
                sent = batch.len(),
                processed = summary.processed,
                sessions_created = summary.sessions_created,
                file_ops_created = summary.file_ops_created,
                "Delivered event batch"
            );
            if !queue.events.is_empty() {
                queue.flush_due = Some(Instant::now() + params.batch_interval);
            }
            Some(FlushOutcome {
                team_url,
                sent: batch.len(),
                auth_failed: false,
            })
        }
        Err(Error::Auth(_)) => {
            tracing::warn!(
                team = %team_url,
                dropped = batch.len(),
                "Token rejected; suspending team"
            );
            queue.suspended = true;
            queue.clear_pending();
            Some(FlushOutcome {
                team_url,
                sent: 0,
                auth_failed: true,
            })
        }
        Err(e) => {
            queue.retry_count += 1;
            if queue.retry_count > params.max_retries {
                tracing::warn!(
                    team = %team_url,
                    dropped = batch.len(),
                    error = %e,
                    "Dropping batch after {} failed attempts",
                    params.max_retries
                );
                queue.retry_count = 0;
            } else {
                for qe in batch.into_iter().rev() {
                    queue.events.push_front(qe);
                }
                let delay = retry_delay(params, queue.retry_count);
                tracing::warn!(
                    team = %team_url,
                    attempt = queue.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient delivery failure; retrying"
                );
                queue.retry_at = Some(Instant::now() + delay);
            }
            None
        }
    }
}

/// `min(batch_interval × 2^retry_count, max_retry_delay)`.
fn retry_delay(params: &SenderParams, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count.min(16)).unwrap_or(u32::MAX);
    params
        .batch_interval
        .checked_mul(factor)
        .unwrap_or(params.max_retry_delay)
        .min(params.max_retry_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, ResponseType};
    use chrono::Utc;

    fn team(url: &str) -> TeamConfig {
        TeamConfig {
            name: "t".to_string(),
            instance_url: url.to_string(),
            user_token: "tok".to_string(),
            user_id: "u1".to_string(),
        }
    }

    fn params() -> SenderParams {
        SenderParams {
            batch_interval: Duration::from_millis(100),
            max_batch_size: 10,
            max_queue_size: MAX_QUEUE_SIZE,
            max_retries: MAX_RETRIES,
            max_retry_delay: MAX_RETRY_DELAY,
        }
    }

    fn event(n: u32) -> Event {
        Event {
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            user_id: None,
            repo_name: Some("widget".to_string()),
            agent_type: "claude-code".to_string(),
            kind: EventKind::AgentResponse {
                response_text: format!("r{}", n),
                response_type: ResponseType::Text,
                turn_number: n,
            },
        }
    }

    const TEAM: &str = "https://team.invalid";

    #[test]
    fn add_enqueues_in_fifo_order() {
        let mut sender = Sender::new(params(), &[team(TEAM)]).unwrap();
        sender.add(TEAM, event(1), None);
        sender.add(TEAM, event(2), None);
        assert_eq!(sender.queue_len(TEAM), 2);
        let queue = sender.queues.get(TEAM).unwrap();
        let turns: Vec<u32> = queue
            .events
            .iter()
            .map(|qe| match qe.event.kind {
                EventKind::AgentResponse { turn_number, .. } => turn_number,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(turns, vec![1, 2]);
    }

    #[test]
    fn queue_is_bounded_and_drops_newest() {
        let mut p = params();
        p.max_queue_size = 3;
        let mut sender = Sender::new(p, &[team(TEAM)]).unwrap();
        for n in 0..10 {
            sender.add(TEAM, event(n), None);
        }
        assert_eq!(sender.queue_len(TEAM), 3);
        // Oldest three survived.
        let queue = sender.queues.get(TEAM).unwrap();
        match &queue.events[0].event.kind {
            EventKind::AgentResponse { turn_number, .. } => assert_eq!(*turn_number, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn suspended_team_drops_adds_silently() {
        let mut sender = Sender::new(params(), &[team(TEAM)]).unwrap();
        sender.add(TEAM, event(1), None);
        sender.suspend(TEAM);
        assert_eq!(sender.queue_len(TEAM), 0, "suspend clears pending state");

        sender.add(TEAM, event(2), None);
        assert_eq!(sender.queue_len(TEAM), 0);
        assert!(sender.is_suspended(TEAM));
        assert_eq!(sender.suspended_teams(), vec![TEAM.to_string()]);

        sender.unsuspend(TEAM);
        sender.add(TEAM, event(3), None);
        assert_eq!(sender.queue_len(TEAM), 1);
    }

    #[test]
    fn filling_to_batch_size_arms_immediate_flush() {
        let mut p = params();
        p.max_batch_size = 3;
        let mut sender = Sender::new(p, &[team(TEAM)]).unwrap();

        sender.add(TEAM, event(1), None);
        let armed = sender.queues.get(TEAM).unwrap().flush_due.unwrap();
        assert!(armed > Instant::now(), "first add schedules a timed flush");

        sender.add(TEAM, event(2), None);
        sender.add(TEAM, event(3), None);
        let armed = sender.queues.get(TEAM).unwrap().flush_due.unwrap();
        assert!(armed <= Instant::now(), "queue fill arms an immediate flush");
    }

    #[test]
    fn retry_pending_inhibits_fill_flush() {
        let mut p = params();
        p.max_batch_size = 2;
        let mut sender = Sender::new(p, &[team(TEAM)]).unwrap();
        {
            let queue = sender.queues.get_mut(TEAM).unwrap();
            queue.retry_at = Some(Instant::now() + Duration::from_secs(30));
        }
        sender.add(TEAM, event(1), None);
        sender.add(TEAM, event(2), None);
        let queue = sender.queues.get(TEAM).unwrap();
        assert!(queue.flush_due.is_none());
        assert!(queue.retry_at.is_some());
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let p = params();
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(&p, 2), Duration::from_millis(400));
        assert_eq!(retry_delay(&p, 3), Duration::from_millis(800));
        // 100ms * 2^30 far exceeds the cap.
        assert_eq!(retry_delay(&p, 30), MAX_RETRY_DELAY);
    }

    #[test]
    fn pending_for_tracks_source_paths() {
        let mut sender = Sender::new(params(), &[team(TEAM)]).unwrap();
        let journal = Path::new("/w/.claude/projects/-w-widget/s1.jsonl");

        assert!(!sender.pending_for(journal));
        sender.add(TEAM, event(1), Some(journal));
        assert!(sender.pending_for(journal));
        assert!(!sender.pending_for(Path::new("/elsewhere.jsonl")));
        assert!(sender.has_pending());
        assert_eq!(sender.pending_count(), 1);
    }

    #[test]
    fn unknown_team_is_ignored() {
        let mut sender = Sender::new(params(), &[team(TEAM)]).unwrap();
        sender.add("https://other.invalid", event(1), None);
        assert!(!sender.has_pending());
    }
}
