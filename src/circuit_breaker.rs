//! Circuit breaker guarding a single transport (C2), lock-free via atomics.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::transport::{FailureKind, SendFailure};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Breaker mode, mirrored from the internal atomic state for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_millis(30_000),
        }
    }
}

/// Point-in-time snapshot returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub mode: BreakerMode,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Millis on the breaker's clock at which `open` ends, if open.
    pub opened_until_millis: u64,
}

struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    opened_until_millis: AtomicU64,
    half_open_inflight: AtomicUsize,
}

/// Wraps one transport; short-circuits calls while `open` (spec §4.2).
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                consecutive_successes: AtomicUsize::new(0),
                opened_until_millis: AtomicU64::new(0),
                half_open_inflight: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Run `op` through the breaker: short-circuits with a synthetic
    /// `Transient` failure while open, otherwise executes `op` and feeds its
    /// outcome back into the state machine.
    pub async fn run<F, Fut>(&self, op: F) -> Result<crate::transport::SendSuccess, SendFailure>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<crate::transport::SendSuccess, SendFailure>>,
    {
        match self.try_acquire() {
            Ok(()) => {}
            Err(retry_after) => {
                return Err(SendFailure::new(
                    FailureKind::Transient,
                    "CIRCUIT_OPEN",
                    "circuit breaker is open",
                )
                .with_retry_after(retry_after));
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = op().await;

        if was_half_open {
            self.state.half_open_inflight.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(failure) => self.on_failure(failure.kind),
        }

        result
    }

    /// Returns `Ok(())` to proceed, or `Err(retry_after)` when short-circuiting.
    fn try_acquire(&self) -> Result<(), Duration> {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_until = self.state.opened_until_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    if now >= opened_until {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_inflight.store(1, Ordering::Release);
                                return Ok(());
                            }
                            Err(STATE_HALF_OPEN) | Err(STATE_CLOSED) => continue,
                            Err(_) => unreachable!("invalid breaker state"),
                        }
                    } else {
                        return Err(Duration::from_millis(opened_until - now));
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if current >= 1 {
                        self.state.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return Err(Duration::ZERO);
                    }
                    return Ok(());
                }
                STATE_CLOSED => return Ok(()),
                _ => unreachable!("invalid breaker state"),
            }
        }
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes =
                    self.state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.consecutive_successes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            STATE_CLOSED => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Only `Transient`/`RateLimited` failures count against the breaker
    /// (spec §4.2); `PermanentLocal`/`PermanentGlobal` never do.
    fn on_failure(&self, kind: FailureKind) {
        let current = self.state.state.load(Ordering::Acquire);

        if current == STATE_HALF_OPEN {
            self.open_from(current);
            return;
        }

        if !matches!(kind, FailureKind::Transient | FailureKind::RateLimited) {
            return;
        }

        if current == STATE_CLOSED {
            let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= self.config.failure_threshold {
                self.open_from(STATE_CLOSED);
            }
        }
    }

    fn open_from(&self, expected: u8) {
        if self
            .state
            .state
            .compare_exchange(expected, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let opened_until = self.now_millis() + self.config.open_duration.as_millis() as u64;
            self.state.opened_until_millis.store(opened_until, Ordering::Release);
            self.state.consecutive_successes.store(0, Ordering::Release);
            tracing::warn!(opened_until, "circuit breaker -> open");
        }
    }

    /// Point-in-time snapshot.
    pub fn status(&self) -> BreakerStatus {
        let mode = match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerMode::Closed,
            STATE_OPEN => BreakerMode::Open,
            STATE_HALF_OPEN => BreakerMode::HalfOpen,
            _ => unreachable!("invalid breaker state"),
        };
        BreakerStatus {
            mode,
            consecutive_failures: self.state.consecutive_failures.load(Ordering::Acquire),
            consecutive_successes: self.state.consecutive_successes.load(Ordering::Acquire),
            opened_until_millis: self.state.opened_until_millis.load(Ordering::Acquire),
        }
    }

    /// Forces `closed`, clearing all counters.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.consecutive_successes.store(0, Ordering::Release);
        self.state.opened_until_millis.store(0, Ordering::Release);
        self.state.half_open_inflight.store(0, Ordering::Release);
    }

    pub fn force_open(&self) {
        let opened_until = self.now_millis() + self.config.open_duration.as_millis() as u64;
        self.state.opened_until_millis.store(opened_until, Ordering::Release);
        self.state.state.store(STATE_OPEN, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// One breaker per transport name, keyed by `Transport::name()`.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<std::sync::Mutex<std::collections::HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` on first use.
    pub fn get_or_create(&self, name: &str, config: &BreakerConfig) -> CircuitBreaker {
        let mut guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(config.clone()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(name).cloned()
    }

    /// Resets a single named breaker, or all of them if `name` is `None`.
    pub fn reset(&self, name: Option<&str>) {
        let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        match name {
            Some(name) => {
                if let Some(b) = guard.get(name) {
                    b.reset();
                }
            }
            None => guard.values().for_each(CircuitBreaker::reset),
        }
    }

    pub fn force_open(&self, name: &str) {
        let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(b) = guard.get(name) {
            b.force_open();
        }
    }

    /// Snapshot of every registered breaker's status, keyed by transport name.
    pub fn snapshot(&self) -> std::collections::HashMap<String, BreakerStatus> {
        let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        guard.iter().map(|(name, b)| (name.clone(), b.status())).collect()
    }
}
