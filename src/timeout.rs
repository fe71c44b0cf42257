//! Timeout policy for bounding async operation duration.
//!
//! Semantics
//! - Wraps an async operation and returns [`TimeoutElapsed`] when the deadline elapses.
//! - Uses `tokio::time::timeout`; on timeout the inner future is dropped (not forcibly aborted),
//!   so cancellation-unsafe work may leave partial state.
//! - `elapsed` is measured from just before invoking the closure to timeout firing and can be
//!   slightly greater than the configured duration due to scheduling overhead.
//! - Requires a Tokio runtime.
//!
//! Invariants:
//! - Duration must be > 0 and <= configured maximum.
//! - Successful operations pass through untouched.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout duration (30 days), guarding against accidental
/// near-`u64::MAX` timeouts; override via [`TimeoutPolicy::new_with_max`].
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// Duration must be greater than zero.
    ZeroDuration,
    /// Duration exceeded configured maximum.
    ExceedsMaximum {
        /// Duration requested by caller.
        requested: Duration,
        /// Maximum allowed duration for this construction.
        limit: Duration,
    },
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::ZeroDuration => write!(f, "timeout duration must be > 0"),
            TimeoutError::ExceedsMaximum { requested, limit } => write!(
                f,
                "timeout duration {:?} exceeds maximum allowed {:?}; use new_with_max to override",
                requested, limit
            ),
        }
    }
}

impl std::error::Error for TimeoutError {}

/// Raised when an operation run through [`TimeoutPolicy::execute`] does not
/// finish before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutElapsed {
    pub elapsed: Duration,
    pub timeout: Duration,
}

impl std::fmt::Display for TimeoutElapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out after {:?} (limit {:?})", self.elapsed, self.timeout)
    }
}

impl std::error::Error for TimeoutElapsed {}

/// Policy that enforces a maximum duration on async operations. Used by the
/// job queue's per-attempt worker watchdog (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::ZeroDuration`] if `duration` is zero.
    /// Returns [`TimeoutError::ExceedsMaximum`] if `duration` exceeds [`MAX_TIMEOUT`].
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    /// Construct with a caller-specified maximum allowed timeout.
    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration })
    }

    /// Returns the configured timeout duration.
    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a timeout.
    ///
    /// - Returns `Ok(T)` when the operation finishes before the deadline.
    /// - Returns `Err(TimeoutElapsed)` when the deadline elapses; the inner
    ///   future is dropped, not forcibly aborted.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, TimeoutElapsed>
    where
        T: Send,
        Fut: Future<Output = T> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(value) => Ok(value),
            Err(_) => Err(TimeoutElapsed { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
