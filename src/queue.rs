//! Priority- and delay-aware job queue with a bounded worker pool (C5).
//!
//! No direct teacher module (the teacher has no job queue); the in-memory
//! coordinator shape — one guard protecting the pending set, the processing
//! map, and history rings — is grounded in other corpus job-queue code,
//! adapted from a durable/SQL backing store to a single in-process
//! `tokio::sync::Mutex`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::idempotency::TerminalSuccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
}

/// The fields of a `Request` a job carries through its lifecycle.
#[derive(Debug, Clone)]
pub struct JobPayload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Internal, queueable representation of a `Request` (spec §3).
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub request_id: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub execute_not_before: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
    pub result: Option<TerminalSuccess>,
}

impl Job {
    pub fn new(
        request_id: String,
        payload: JobPayload,
        priority: i32,
        execute_not_before: DateTime<Utc>,
        max_attempts: u32,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request_id,
            payload,
            priority,
            execute_not_before,
            attempts: 0,
            max_attempts,
            status: JobStatus::Queued,
            submitted_at,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Retrying) && self.execute_not_before <= now
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub retry_base_delay: Duration,
    pub stuck_sweep_interval: Duration,
    pub history_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(1_000),
            job_timeout: Duration::from_millis(90_000),
            retry_base_delay: Duration::from_millis(5_000),
            stuck_sweep_interval: Duration::from_millis(60_000),
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub concurrency: usize,
    pub is_processing: bool,
}

struct Inner {
    active: HashMap<Uuid, Job>,
    history_completed: VecDeque<Job>,
    history_failed: VecDeque<Job>,
}

/// A single in-process priority-and-delay queue with bounded worker
/// concurrency (spec §4.5). Workers call [`JobQueue::claim_next`] in a loop;
/// [`JobQueue::notified`] lets an idle worker wake promptly on a fresh
/// submission instead of only on its poll interval.
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                history_completed: VecDeque::new(),
                history_failed: VecDeque::new(),
            }),
            notify: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, job: Job) {
        let mut guard = self.inner.lock().await;
        guard.active.insert(job.job_id, job);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Resolves once a new job is enqueued or a job transitions state,
    /// whichever comes first — used by idle workers instead of busy-polling.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Ordering rule (spec §4.5): among jobs with `execute_not_before <= now`,
    /// pick the highest priority, tie-broken by earliest `submitted_at`.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut guard = self.inner.lock().await;
        let candidate = guard
            .active
            .values()
            .filter(|job| job.is_ready(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            })
            .map(|job| job.job_id)?;

        let job = guard.active.get_mut(&candidate).unwrap();
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        Some(job.clone())
    }

    /// Finalizes `job_id` as `completed`, taking `attempts` from the caller
    /// since the engine's retry loop operates on its own `Job` clone (spec
    /// §3's `Job.attempts` must reflect every attempt actually made).
    pub async fn mark_completed(&self, job_id: Uuid, attempts: u32, result: TerminalSuccess, now: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        if let Some(mut job) = guard.active.remove(&job_id) {
            job.status = JobStatus::Completed;
            job.attempts = attempts;
            job.finished_at = Some(now);
            job.result = Some(result);
            push_bounded(&mut guard.history_completed, job, self.config.history_capacity);
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn mark_failed(&self, job_id: Uuid, attempts: u32, error_info: ErrorInfo, now: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        if let Some(mut job) = guard.active.remove(&job_id) {
            job.status = JobStatus::Failed;
            job.attempts = attempts;
            job.finished_at = Some(now);
            job.last_error = Some(error_info);
            push_bounded(&mut guard.history_failed, job, self.config.history_capacity);
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Re-queues a job for another attempt after `delay`, per the engine's
    /// own retry/backoff accounting (spec §4.6's "worker/engine contract" —
    /// this is JobQueue's bookkeeping of an engine-driven retry, not an
    /// independent retry decision).
    pub async fn mark_retrying(&self, job_id: Uuid, error_info: ErrorInfo, delay: Duration, now: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        if let Some(job) = guard.active.get_mut(&job_id) {
            job.status = JobStatus::Retrying;
            job.last_error = Some(error_info);
            job.execute_not_before = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Promotes any `processing` job whose watchdog deadline has passed to
    /// `failed` with `PROCESSING_TIMEOUT` — covers a worker that vanished
    /// without the watchdog itself catching it.
    pub async fn sweep_stuck(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.inner.lock().await;
        let timeout = chrono::Duration::from_std(self.config.job_timeout).unwrap_or(chrono::Duration::zero());
        let stuck: Vec<Uuid> = guard
            .active
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.started_at.map(|t| t + timeout < now).unwrap_or(false)
            })
            .map(|job| job.job_id)
            .collect();

        let count = stuck.len();
        for job_id in stuck {
            if let Some(mut job) = guard.active.remove(&job_id) {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(ErrorInfo::processing_timeout());
                push_bounded(&mut guard.history_failed, job, self.config.history_capacity);
            }
        }
        count
    }

    /// Prunes history entries older than 24h, independent of the capacity cap.
    pub async fn prune_history_older_than(&self, now: DateTime<Utc>, max_age: Duration) {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut guard = self.inner.lock().await;
        guard
            .history_completed
            .retain(|job| job.finished_at.map(|f| now - f < max_age).unwrap_or(true));
        guard
            .history_failed
            .retain(|job| job.finished_at.map(|f| now - f < max_age).unwrap_or(true));
    }

    /// Looks up the latest job for `request_id`, active or historical —
    /// status projection (spec §4.6) reads this to override the lifecycle
    /// record when a job exists.
    pub async fn latest_job_for(&self, request_id: &str) -> Option<Job> {
        let guard = self.inner.lock().await;
        if let Some(job) = guard.active.values().find(|j| j.request_id == request_id) {
            return Some(job.clone());
        }
        guard
            .history_completed
            .iter()
            .chain(guard.history_failed.iter())
            .filter(|j| j.request_id == request_id)
            .max_by_key(|j| j.finished_at)
            .cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let guard = self.inner.lock().await;
        let mut stats = QueueStats {
            concurrency: self.config.max_concurrency,
            completed: guard.history_completed.len(),
            failed: guard.history_failed.len(),
            ..Default::default()
        };
        for job in guard.active.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => {
                    stats.processing += 1;
                    stats.is_processing = true;
                }
                JobStatus::Retrying => stats.retrying += 1,
                _ => {}
            }
        }
        stats
    }
}

fn push_bounded(ring: &mut VecDeque<Job>, job: Job, capacity: usize) {
    ring.push_back(job);
    while ring.len() > capacity {
        ring.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload { to: "a@b.co".into(), subject: "s".into(), body: "x".into() }
    }

    #[tokio::test]
    async fn claim_next_picks_highest_priority_then_fifo() {
        let queue = JobQueue::new(QueueConfig::default());
        let now = Utc::now();
        let low = Job::new("low".into(), payload(), 0, now, 3, now);
        let high = Job::new("high".into(), payload(), 5, now, 3, now + chrono::Duration::milliseconds(1));
        queue.enqueue(low).await;
        queue.enqueue(high).await;

        let claimed = queue.claim_next(now).await.unwrap();
        assert_eq!(claimed.request_id, "high");
    }

    #[tokio::test]
    async fn claim_next_ties_break_by_submission_order() {
        let queue = JobQueue::new(QueueConfig::default());
        let now = Utc::now();
        let first = Job::new("first".into(), payload(), 1, now, 3, now);
        let second = Job::new("second".into(), payload(), 1, now, 3, now + chrono::Duration::milliseconds(5));
        queue.enqueue(second).await;
        queue.enqueue(first).await;

        let claimed = queue.claim_next(now).await.unwrap();
        assert_eq!(claimed.request_id, "first");
    }

    #[tokio::test]
    async fn delayed_job_is_not_ready_before_deadline() {
        let queue = JobQueue::new(QueueConfig::default());
        let now = Utc::now();
        let delayed = Job::new("delayed".into(), payload(), 0, now + chrono::Duration::seconds(10), 3, now);
        queue.enqueue(delayed).await;

        assert!(queue.claim_next(now).await.is_none());
        assert!(queue.claim_next(now + chrono::Duration::seconds(11)).await.is_some());
    }

    #[tokio::test]
    async fn sweep_stuck_fails_jobs_past_their_watchdog() {
        let queue = JobQueue::new(QueueConfig { job_timeout: Duration::from_millis(100), ..Default::default() });
        let now = Utc::now();
        let job = Job::new("stuck".into(), payload(), 0, now, 3, now);
        queue.enqueue(job).await;
        let claimed = queue.claim_next(now).await.unwrap();

        let later = now + chrono::Duration::milliseconds(500);
        let swept = queue.sweep_stuck(later).await;
        assert_eq!(swept, 1);

        let historical = queue.latest_job_for(&claimed.request_id).await.unwrap();
        assert_eq!(historical.status, JobStatus::Failed);
        assert_eq!(historical.last_error.unwrap().code, "PROCESSING_TIMEOUT");
    }

    #[tokio::test]
    async fn mark_retrying_reopens_the_job_at_a_later_deadline() {
        let queue = JobQueue::new(QueueConfig::default());
        let now = Utc::now();
        let job = Job::new("r1".into(), payload(), 0, now, 3, now);
        let job_id = job.job_id;
        queue.enqueue(job).await;
        queue.claim_next(now).await;

        let delay = Duration::from_millis(5_000);
        let error = ErrorInfo::new(crate::transport::FailureKind::Transient, "UPSTREAM_BUSY", "busy");
        queue.mark_retrying(job_id, error, delay, now).await;

        let retrying = queue.latest_job_for("r1").await.unwrap();
        assert_eq!(retrying.status, JobStatus::Retrying);
        assert_eq!(retrying.last_error.unwrap().code, "UPSTREAM_BUSY");
        assert_eq!(retrying.execute_not_before, now + chrono::Duration::milliseconds(5_000));

        // Not yet ready at `now`, but claimable once its new deadline passes.
        assert!(queue.claim_next(now).await.is_none());
        assert!(queue.claim_next(retrying.execute_not_before).await.is_some());
    }

    #[tokio::test]
    async fn stats_reflect_active_and_historical_counts() {
        let queue = JobQueue::new(QueueConfig::default());
        let now = Utc::now();
        let job = Job::new("r1".into(), payload(), 0, now, 3, now);
        let job_id = job.job_id;
        queue.enqueue(job).await;
        queue.claim_next(now).await;
        queue
            .mark_completed(
                job_id,
                1,
                TerminalSuccess { transport_name: "primary".into(), message_id: "m".into(), finished_at: now },
                now,
            )
            .await;

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 0);
    }
}
