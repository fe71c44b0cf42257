//! Transport contract (C1): one attempt at delivering a payload, classified
//! into a sum type instead of string error codes (see spec notes on
//! prototype-chain classes → tagged variants).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Classification of a transport failure. Only `Transient` and `RateLimited`
/// count against a circuit breaker (spec §4.2); `PermanentLocal` and
/// `PermanentGlobal` never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Retryable against the same transport, and eligible for fallback.
    Transient,
    /// Like `Transient`, but `retry_after` on the failure must be honored.
    RateLimited,
    /// Skip remaining retries on this transport; fallback is still allowed.
    PermanentLocal,
    /// Abort immediately: no retry, no fallback.
    PermanentGlobal,
}

/// The message body handed to a transport.
#[derive(Debug, Clone)]
pub struct Payload {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A successful send.
#[derive(Debug, Clone)]
pub struct SendSuccess {
    pub message_id: String,
    pub finished_at: DateTime<Utc>,
    pub transport_name: String,
}

/// A failed send.
#[derive(Debug, Clone)]
pub struct SendFailure {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
    /// Honored by the engine when present: overrides backoff for this attempt.
    pub retry_after: Option<Duration>,
}

impl SendFailure {
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, code: code.into(), message: message.into(), retry_after: None }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One pluggable downstream delivery capability. The core never invokes a
/// network itself; implementors own all side effects.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn send(&self, payload: &Payload) -> Result<SendSuccess, SendFailure>;

    /// Defaults to healthy; transports with a real health probe override this.
    async fn health_check(&self) -> bool {
        true
    }
}

/// One scripted outcome for [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success { message_id: String },
    Failure(SendFailure),
}

/// A transport whose outcomes are a fixed, deterministic sequence — grounded
/// in the `AlwaysFailProvider` / `FailNThenSucceedProvider` test doubles used
/// to exercise failover logic: each call advances through the script, and
/// the last entry repeats once the script is exhausted so tests don't need
/// to guess exactly how many attempts will occur.
#[derive(Debug)]
pub struct ScriptedTransport {
    name: String,
    script: Vec<ScriptedOutcome>,
    cursor: AtomicU64,
    calls: AtomicU64,
}

impl ScriptedTransport {
    pub fn new(name: impl Into<String>, script: Vec<ScriptedOutcome>) -> Self {
        assert!(!script.is_empty(), "ScriptedTransport requires at least one outcome");
        Self { name: name.into(), script, cursor: AtomicU64::new(0), calls: AtomicU64::new(0) }
    }

    /// Number of `send` calls observed so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _payload: &Payload) -> Result<SendSuccess, SendFailure> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel) as usize;
        let idx = idx.min(self.script.len() - 1);
        match &self.script[idx] {
            ScriptedOutcome::Success { message_id } => Ok(SendSuccess {
                message_id: message_id.clone(),
                finished_at: Utc::now(),
                transport_name: self.name.clone(),
            }),
            ScriptedOutcome::Failure(failure) => Err(failure.clone()),
        }
    }
}

/// A transport that fails a configurable fraction of the time with a mix of
/// failure kinds, for manual/demo exercise of the full retry/fallback path.
#[derive(Debug)]
pub struct StochasticTransport {
    name: String,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    outcomes: Mutex<VecDeque<&'static str>>,
}

impl StochasticTransport {
    pub fn new(name: impl Into<String>, failure_rate: f64, seed: u64) -> Self {
        Self {
            name: name.into(),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, outcome: &'static str) {
        let mut log = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
        log.push_back(outcome);
        if log.len() > 32 {
            log.pop_front();
        }
    }
}

#[async_trait]
impl Transport for StochasticTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _payload: &Payload) -> Result<SendSuccess, SendFailure> {
        let (roll_fail, roll_kind, roll_id) = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            (rng.random::<f64>(), rng.random::<f64>(), rng.random::<u64>())
        };
        if roll_fail < self.failure_rate {
            let failure = if roll_kind < 0.7 {
                SendFailure::new(FailureKind::Transient, "UPSTREAM_BUSY", "upstream temporarily busy")
            } else if roll_kind < 0.9 {
                SendFailure::new(FailureKind::RateLimited, "RATE_LIMITED", "upstream rate limit hit")
                    .with_retry_after(Duration::from_millis(250))
            } else {
                SendFailure::new(FailureKind::PermanentLocal, "INVALID_EMAIL", "recipient rejected")
            };
            self.record("failure");
            Err(failure)
        } else {
            self.record("success");
            Ok(SendSuccess {
                message_id: format!("{}-{:x}", self.name, roll_id),
                finished_at: Utc::now(),
                transport_name: self.name.clone(),
            })
        }
    }
}
