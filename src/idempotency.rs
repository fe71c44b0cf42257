//! Idempotency store (C4): maps `requestId` to a lifecycle record with TTL.
//!
//! Grounded in the `EnqueueResult::{Created, Duplicate}` atomic dedupe check
//! used by job queues that admit by idempotency key, generalized into the
//! full lifecycle state machine spec §4.4 requires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Pending,
    Completed,
    Failed,
}

/// Terminal success payload, mirrored onto the `LifecycleRecord`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSuccess {
    pub transport_name: String,
    pub message_id: String,
    pub finished_at: DateTime<Utc>,
}

/// The per-`requestId` entry in the idempotency store (spec §3).
#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub request_id: String,
    pub status: LifecycleStatus,
    pub attempts: u32,
    pub current_transport: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub result: Option<TerminalSuccess>,
    pub error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LifecycleRecord {
    fn fresh(request_id: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            request_id,
            status: LifecycleStatus::Pending,
            attempts: 0,
            current_transport: None,
            last_attempt_at: None,
            result: None,
            error_info: None,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, LifecycleStatus::Completed | LifecycleStatus::Failed)
    }
}

/// Outcome of [`IdempotencyStore::begin_or_get`] (I1: at most one live record
/// per `requestId`).
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    Fresh(LifecycleRecord),
    Existing(LifecycleRecord),
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(24 * 60 * 60) }
    }
}

/// Keyed by `requestId`; all mutations are serialized per key via a single
/// mutex guarding the whole map, matching the coarse-grained guard style the
/// teacher uses for its in-memory stores.
pub struct IdempotencyStore {
    records: Mutex<HashMap<String, LifecycleRecord>>,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self { records: Mutex::new(HashMap::new()), config }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LifecycleRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Atomic entry point: if no live record exists for `request_id`, creates
    /// one in `pending` and returns `Fresh`; otherwise returns the existing
    /// record untouched. This is the single point that prevents two
    /// concurrent submissions for the same `requestId` from both proceeding.
    pub fn begin_or_get(&self, request_id: &str, now: DateTime<Utc>) -> BeginOutcome {
        let mut guard = self.lock();
        if let Some(existing) = guard.get(request_id) {
            if existing.expires_at >= now {
                return BeginOutcome::Existing(existing.clone());
            }
        }
        let record = LifecycleRecord::fresh(request_id.to_string(), now, self.config.ttl);
        guard.insert(request_id.to_string(), record.clone());
        BeginOutcome::Fresh(record)
    }

    pub fn mark_attempt(&self, request_id: &str, transport: &str, now: DateTime<Utc>) {
        let mut guard = self.lock();
        if let Some(record) = guard.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.attempts += 1;
            record.current_transport = Some(transport.to_string());
            record.last_attempt_at = Some(now);
            record.updated_at = now;
        }
    }

    /// Terminal transition; idempotent — a second call keeps the first
    /// terminal value (I2).
    pub fn complete(&self, request_id: &str, result: TerminalSuccess, now: DateTime<Utc>) {
        let mut guard = self.lock();
        if let Some(record) = guard.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.status = LifecycleStatus::Completed;
            record.result = Some(result);
            record.updated_at = now;
        }
    }

    pub fn fail(&self, request_id: &str, error_info: ErrorInfo, now: DateTime<Utc>) {
        let mut guard = self.lock();
        if let Some(record) = guard.get_mut(request_id) {
            if record.is_terminal() {
                return;
            }
            record.status = LifecycleStatus::Failed;
            record.error_info = Some(error_info);
            record.updated_at = now;
        }
    }

    pub fn get(&self, request_id: &str) -> Option<LifecycleRecord> {
        self.lock().get(request_id).cloned()
    }

    /// Removes records with `expires_at < now`; returns the count removed (P7).
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, record| record.expires_at >= now);
        before - guard.len()
    }

    /// Admin test hook: drops every record unconditionally.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
