//! DeliveryEngine (C6): orchestrates admit → dedupe → enqueue → worker →
//! retry → fallback → record (spec §4.6). The inner per-transport
//! retry/backoff loop is grounded in the teacher's `RetryPolicy::execute`
//! shape, specialized to the four `FailureKind`s and their fallback rules
//! instead of a generic `should_retry` predicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::circuit_breaker::{BreakerConfig, BreakerRegistry};
use crate::error::{ErrorInfo, ValidationError, ValidationErrors};
use crate::idempotency::{BeginOutcome, IdempotencyConfig, IdempotencyStore, LifecycleStatus, TerminalSuccess};
use crate::queue::{Job, JobPayload, JobQueue, JobStatus, QueueConfig, QueueStats};
use crate::rate_limit::store::InMemoryBucketStore;
use crate::rate_limit::strategies::WindowedTokenBucket;
use crate::rate_limit::{Decision, RateLimiter, RateLimiterConfig};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;
use crate::transport::{FailureKind, Payload, SendSuccess, Transport};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_attempts_per_transport: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_multiplier: f64,
    pub enable_breaker: bool,
    pub enable_queue: bool,
    pub default_job_max_attempts: u32,
    pub breaker: BreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub queue: QueueConfig,
    pub idempotency: IdempotencyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_transport: 3,
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            retry_multiplier: 2.0,
            enable_breaker: true,
            enable_queue: true,
            default_job_max_attempts: 3,
            breaker: BreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            queue: QueueConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

/// Caller input (spec §3 `Request`), before validation.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub request_id: String,
    pub priority: i32,
    pub delay_ms: i64,
    /// Rate-limiter key; defaults to `"anonymous"` when absent.
    pub submitter: Option<String>,
}

impl SubmitRequest {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            request_id: request_id.into(),
            priority: 0,
            delay_ms: 0,
            submitter: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

fn validate(request: &SubmitRequest) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    if !looks_like_email(&request.to) {
        errors.push(ValidationError::InvalidTo);
    }
    if !(1..=200).contains(&request.subject.chars().count()) {
        errors.push(ValidationError::SubjectLength(request.subject.chars().count()));
    }
    if !(1..=10_000).contains(&request.body.chars().count()) {
        errors.push(ValidationError::BodyLength(request.body.chars().count()));
    }
    if !(1..=100).contains(&request.request_id.chars().count()) {
        errors.push(ValidationError::RequestIdLength(request.request_id.chars().count()));
    }
    if !(0..=10).contains(&request.priority) {
        errors.push(ValidationError::PriorityOutOfRange(request.priority));
    }
    if !(0..=300_000).contains(&request.delay_ms) {
        errors.push(ValidationError::DelayOutOfRange(request.delay_ms));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

/// Externally-visible outcome of `submit` (spec §6).
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Queued { request_id: String, job_id: Uuid },
    Sent { request_id: String, transport: String, message_id: String },
    Pending { request_id: String },
    CompletedCached { request_id: String, transport: String, message_id: String },
    FailedCached { request_id: String, error: ErrorInfo },
    RateLimited { request_id: String, retry_after: Duration },
    Rejected { request_id: String, errors: ValidationErrors },
}

/// Externally-visible status (spec §4.6 projection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExternalStatus {
    Sent,
    Failed,
    Processing,
    Retrying,
    Queued,
    Pending,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub status: ExternalStatus,
    pub attempts: u32,
    pub current_transport: Option<String>,
    pub message_id: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusResult {
    fn not_found() -> Self {
        Self {
            status: ExternalStatus::NotFound,
            attempts: 0,
            current_transport: None,
            message_id: None,
            error_info: None,
            created_at: None,
            last_attempt_at: None,
            updated_at: None,
        }
    }
}

enum AttemptOutcome {
    Ok(SendSuccess),
    Terminal(ErrorInfo),
}

/// Orchestrates C1-C5 per spec §4.6.
pub struct DeliveryEngine {
    transports: Vec<Arc<dyn Transport>>,
    breakers: BreakerRegistry,
    rate_limiter: WindowedTokenBucket<InMemoryBucketStore>,
    idempotency: Arc<IdempotencyStore>,
    queue: Arc<JobQueue>,
    config: EngineConfig,
    sleeper: Arc<dyn Sleeper>,
    job_timeout: TimeoutPolicy,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: AtomicBool,
}

impl DeliveryEngine {
    pub fn new(transports: Vec<Arc<dyn Transport>>, config: EngineConfig) -> Arc<Self> {
        Self::with_sleeper(transports, config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        transports: Vec<Arc<dyn Transport>>,
        config: EngineConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Arc<Self> {
        assert!(!transports.is_empty(), "engine requires at least one transport");
        let job_timeout = TimeoutPolicy::new(config.queue.job_timeout).expect("job_timeout must be > 0");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::new(Self {
            transports,
            breakers: BreakerRegistry::new(),
            rate_limiter: WindowedTokenBucket::new(InMemoryBucketStore::new(), config.rate_limiter.clone()),
            idempotency: Arc::new(IdempotencyStore::new(config.idempotency.clone())),
            queue: Arc::new(JobQueue::new(config.queue.clone())),
            running: AtomicBool::new(true),
            config,
            sleeper,
            job_timeout,
            shutdown_tx,
            shutdown_rx,
        });
        if engine.config.enable_queue {
            engine.clone().spawn_background_tasks();
        }
        engine
    }

    fn spawn_background_tasks(self: Arc<Self>) {
        for worker_id in 0..self.config.queue.max_concurrency {
            let engine = self.clone();
            tokio::spawn(async move { engine.worker_loop(worker_id).await });
        }
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweeper_loop().await });
    }

    async fn worker_loop(self: Arc<Self>, _worker_id: usize) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let now = Utc::now();
            match self.queue.claim_next(now).await {
                Some(mut job) => self.run_job(&mut job).await,
                None => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(self.config.queue.poll_interval) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
        }
    }

    async fn run_job(&self, job: &mut Job) {
        let job_id = job.job_id;
        let outcome = self.job_timeout.execute(|| self.attempt(job)).await;
        let attempts = job.attempts;
        match outcome {
            Ok(AttemptOutcome::Ok(success)) => {
                self.queue
                    .mark_completed(
                        job_id,
                        attempts,
                        TerminalSuccess {
                            transport_name: success.transport_name,
                            message_id: success.message_id,
                            finished_at: success.finished_at,
                        },
                        Utc::now(),
                    )
                    .await;
            }
            Ok(AttemptOutcome::Terminal(error_info)) => {
                self.queue.mark_failed(job_id, attempts, error_info, Utc::now()).await;
            }
            Err(_elapsed) => {
                // Watchdog fired: worker-scoped timeout, not re-queued (spec §4.5).
                let now = Utc::now();
                let info = ErrorInfo::processing_timeout();
                self.queue.mark_failed(job_id, attempts, info, now).await;
            }
        }
    }

    async fn sweeper_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.queue.stuck_sweep_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => return,
            }
            let now = Utc::now();
            let stuck = self.queue.sweep_stuck(now).await;
            if stuck > 0 {
                tracing::warn!(stuck, "queue sweeper promoted stuck jobs to failed");
            }
            self.queue.prune_history_older_than(now, Duration::from_secs(24 * 60 * 60)).await;
            let expired = self.idempotency.sweep_expired(now);
            if expired > 0 {
                tracing::debug!(expired, "idempotency sweeper evicted expired records");
            }
            let evicted = self.rate_limiter.sweep_idle().await;
            if evicted > 0 {
                tracing::debug!(evicted, "rate limiter sweeper evicted idle buckets");
            }
        }
    }

    /// Stops admitting new work and signals background tasks to stop; leaves
    /// any `queued`/`retrying` jobs in place (durability is a non-goal).
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        if let Err(errors) = validate(&request) {
            return SubmitOutcome::Rejected { request_id: request.request_id, errors };
        }

        let key = request.submitter.clone().unwrap_or_else(|| "anonymous".to_string());
        if let Decision::Denied { retry_after } = self.rate_limiter.acquire(&key).await {
            return SubmitOutcome::RateLimited { request_id: request.request_id, retry_after };
        }

        let now = Utc::now();
        match self.idempotency.begin_or_get(&request.request_id, now) {
            BeginOutcome::Existing(record) => match record.status {
                LifecycleStatus::Pending => SubmitOutcome::Pending { request_id: request.request_id },
                LifecycleStatus::Completed => {
                    let result = record.result.expect("completed record carries a result");
                    SubmitOutcome::CompletedCached {
                        request_id: request.request_id,
                        transport: result.transport_name,
                        message_id: result.message_id,
                    }
                }
                LifecycleStatus::Failed => SubmitOutcome::FailedCached {
                    request_id: request.request_id,
                    error: record.error_info.expect("failed record carries error info"),
                },
            },
            BeginOutcome::Fresh(_) => self.admit_fresh(request, now).await,
        }
    }

    async fn admit_fresh(&self, request: SubmitRequest, now: DateTime<Utc>) -> SubmitOutcome {
        let payload = JobPayload { to: request.to, subject: request.subject, body: request.body };
        let execute_not_before = now + chrono::Duration::milliseconds(request.delay_ms);

        if self.config.enable_queue {
            let job = Job::new(
                request.request_id.clone(),
                payload,
                request.priority,
                execute_not_before,
                self.config.default_job_max_attempts,
                now,
            );
            let job_id = job.job_id;
            self.queue.enqueue(job).await;
            SubmitOutcome::Queued { request_id: request.request_id, job_id }
        } else {
            let mut job = Job::new(
                request.request_id.clone(),
                payload,
                request.priority,
                execute_not_before,
                self.config.default_job_max_attempts,
                now,
            );
            match self.attempt(&mut job).await {
                AttemptOutcome::Ok(success) => SubmitOutcome::Sent {
                    request_id: request.request_id,
                    transport: success.transport_name,
                    message_id: success.message_id,
                },
                AttemptOutcome::Terminal(error) => {
                    SubmitOutcome::FailedCached { request_id: request.request_id, error }
                }
            }
        }
    }

    /// The per-transport retry/fallback loop (spec §4.6).
    async fn attempt(&self, job: &mut Job) -> AttemptOutcome {
        let payload = Payload {
            to: job.payload.to.clone(),
            subject: job.payload.subject.clone(),
            body: job.payload.body.clone(),
        };
        let mut last_error = ErrorInfo::new(FailureKind::Transient, "NO_TRANSPORTS", "no transports configured");

        for transport in &self.transports {
            let backoff = Backoff::Exponential {
                base: self.config.initial_retry_delay,
                multiplier: self.config.retry_multiplier,
                max: Some(self.config.max_retry_delay),
            };
            let mut n = 0u32;

            while n < self.config.max_attempts_per_transport {
                n += 1;
                let now = Utc::now();
                self.idempotency.mark_attempt(&job.request_id, transport.name(), now);
                job.attempts += 1;

                let outcome = if self.config.enable_breaker {
                    let breaker = self.breakers.get_or_create(transport.name(), &self.config.breaker);
                    breaker.run(|| transport.send(&payload)).await
                } else {
                    transport.send(&payload).await
                };

                match outcome {
                    Ok(success) => {
                        self.idempotency.complete(
                            &job.request_id,
                            TerminalSuccess {
                                transport_name: success.transport_name.clone(),
                                message_id: success.message_id.clone(),
                                finished_at: success.finished_at,
                            },
                            Utc::now(),
                        );
                        return AttemptOutcome::Ok(success);
                    }
                    Err(failure) => {
                        let info = ErrorInfo::new(failure.kind, failure.code.clone(), failure.message.clone());
                        match failure.kind {
                            FailureKind::PermanentGlobal => {
                                self.idempotency.fail(&job.request_id, info.clone(), Utc::now());
                                return AttemptOutcome::Terminal(info);
                            }
                            FailureKind::PermanentLocal => {
                                last_error = info;
                                break;
                            }
                            FailureKind::Transient | FailureKind::RateLimited => {
                                last_error = info;
                                if n == self.config.max_attempts_per_transport {
                                    break;
                                }
                                let wait = failure.retry_after.unwrap_or_else(|| backoff.delay(n as usize));
                                self.sleeper.sleep(wait).await;
                            }
                        }
                    }
                }
            }
        }

        self.idempotency.fail(&job.request_id, last_error.clone(), Utc::now());
        AttemptOutcome::Terminal(last_error)
    }

    pub async fn get_status(&self, request_id: &str) -> StatusResult {
        let record = match self.idempotency.get(request_id) {
            Some(record) => record,
            None => return StatusResult::not_found(),
        };

        if self.config.enable_queue {
            if let Some(job) = self.queue.latest_job_for(request_id).await {
                let status = match job.status {
                    JobStatus::Completed => ExternalStatus::Sent,
                    JobStatus::Failed => ExternalStatus::Failed,
                    JobStatus::Processing => ExternalStatus::Processing,
                    JobStatus::Retrying => ExternalStatus::Retrying,
                    JobStatus::Queued => ExternalStatus::Queued,
                };
                return StatusResult {
                    status,
                    attempts: job.attempts,
                    current_transport: record.current_transport,
                    message_id: job.result.map(|r| r.message_id),
                    error_info: job.last_error,
                    created_at: Some(record.created_at),
                    last_attempt_at: record.last_attempt_at,
                    updated_at: Some(record.updated_at),
                };
            }
        }

        let status = match record.status {
            LifecycleStatus::Pending => ExternalStatus::Pending,
            LifecycleStatus::Completed => ExternalStatus::Sent,
            LifecycleStatus::Failed => ExternalStatus::Failed,
        };
        StatusResult {
            status,
            attempts: record.attempts,
            current_transport: record.current_transport,
            message_id: record.result.map(|r| r.message_id),
            error_info: record.error_info,
            created_at: Some(record.created_at),
            last_attempt_at: record.last_attempt_at,
            updated_at: Some(record.updated_at),
        }
    }

    // Admin interface (spec §6).

    pub fn reset_breaker(&self, transport_name: Option<&str>) {
        self.breakers.reset(transport_name);
    }

    pub fn force_open_breaker(&self, transport_name: &str) {
        self.breakers.force_open(transport_name);
    }

    pub fn clear_idempotency(&self) {
        self.idempotency.clear();
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Snapshot of every transport's breaker state, keyed by transport name
    /// (spec §7: admin queries must be able to show `state:open` and
    /// `openedUntil` for a short-circuiting transport).
    pub fn breaker_snapshot(&self) -> std::collections::HashMap<String, crate::circuit_breaker::BreakerStatus> {
        self.breakers.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::InstantSleeper;
    use crate::transport::{ScriptedOutcome, ScriptedTransport};

    fn engine(transports: Vec<Arc<dyn Transport>>, config: EngineConfig) -> Arc<DeliveryEngine> {
        DeliveryEngine::with_sleeper(transports, config, Arc::new(InstantSleeper))
    }

    fn request(request_id: &str) -> SubmitRequest {
        SubmitRequest::new("a@b.co", "subject", "body", request_id)
    }

    #[tokio::test]
    async fn rejects_invalid_email() {
        let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "primary",
            vec![ScriptedOutcome::Success { message_id: "m".into() }],
        ));
        let engine = engine(vec![primary], EngineConfig { enable_queue: false, ..Default::default() });
        let outcome = engine.submit(SubmitRequest::new("not-an-email", "s", "b", "r1")).await;
        assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn synchronous_happy_path_sends_on_primary() {
        let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "primary",
            vec![ScriptedOutcome::Success { message_id: "m-1".into() }],
        ));
        let engine = engine(vec![primary], EngineConfig { enable_queue: false, ..Default::default() });
        let outcome = engine.submit(request("r1")).await;
        match outcome {
            SubmitOutcome::Sent { transport, message_id, .. } => {
                assert_eq!(transport, "primary");
                assert_eq!(message_id, "m-1");
            }
            other => panic!("expected Sent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn falls_back_to_secondary_on_permanent_local() {
        let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "primary",
            vec![ScriptedOutcome::Failure(crate::transport::SendFailure::new(
                FailureKind::PermanentLocal,
                "INVALID_EMAIL",
                "bad address",
            ))],
        ));
        let secondary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "secondary",
            vec![ScriptedOutcome::Success { message_id: "m-2".into() }],
        ));
        let engine = engine(vec![primary, secondary], EngineConfig { enable_queue: false, ..Default::default() });
        let outcome = engine.submit(request("r2")).await;
        match outcome {
            SubmitOutcome::Sent { transport, message_id, .. } => {
                assert_eq!(transport, "secondary");
                assert_eq!(message_id, "m-2");
            }
            other => panic!("expected Sent via secondary, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn permanent_global_aborts_without_fallback() {
        let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "primary",
            vec![ScriptedOutcome::Failure(crate::transport::SendFailure::new(
                FailureKind::PermanentGlobal,
                "AUTHENTICATION_FAILED",
                "bad credentials",
            ))],
        ));
        let secondary_concrete = Arc::new(ScriptedTransport::new(
            "secondary",
            vec![ScriptedOutcome::Success { message_id: "should-not-be-used".into() }],
        ));
        let secondary: Arc<dyn Transport> = secondary_concrete.clone();
        let engine = engine(vec![primary, secondary], EngineConfig { enable_queue: false, ..Default::default() });
        let outcome = engine.submit(request("r3")).await;
        assert!(matches!(outcome, SubmitOutcome::FailedCached { .. }));
        let status = engine.get_status("r3").await;
        assert_eq!(status.status, ExternalStatus::Failed);
        assert_eq!(
            secondary_concrete.call_count(),
            0,
            "secondary must not be tried after a permanentGlobal failure"
        );
    }

    #[tokio::test]
    async fn duplicate_submission_while_pending_does_not_requeue() {
        let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
            "primary",
            vec![ScriptedOutcome::Success { message_id: "m-1".into() }],
        ));
        let engine = engine(vec![primary], EngineConfig::default());
        let first = engine.submit(request("r5")).await;
        assert!(matches!(first, SubmitOutcome::Queued { .. }));
        let second = engine.submit(request("r5")).await;
        assert!(matches!(second, SubmitOutcome::Pending { .. }));
        let stats = engine.queue_stats().await;
        assert_eq!(stats.queued + stats.processing + stats.retrying, 1);
        engine.shutdown();
    }
}
