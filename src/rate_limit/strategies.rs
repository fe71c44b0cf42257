use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::store::BucketStore;
use crate::rate_limit::{Decision, RateLimiter, RateLimiterConfig};

/// Windowed full-refill token bucket: when an observed request arrives and
/// `now - window_start >= window`, the bucket refills to `capacity` in one
/// step and `window_start` resets to `now` (spec §4.3) — deliberately not
/// the teacher's continuous floating-point trickle refill, so a burst that
/// exhausts the bucket always recovers at a predictable window boundary.
pub struct WindowedTokenBucket<S> {
    store: Arc<S>,
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
}

impl<S> WindowedTokenBucket<S>
where
    S: BucketStore + Send + Sync + 'static,
{
    pub fn new(store: S, config: RateLimiterConfig) -> Self {
        Self { store: Arc::new(store), config, clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sweeps buckets idle for more than `2 * window` (spec §4.3).
    pub async fn sweep_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let idle_after = 2 * self.config.window.as_millis() as u64;
        self.store.sweep_idle(now, idle_after).await
    }
}

#[async_trait]
impl<S> RateLimiter for WindowedTokenBucket<S>
where
    S: BucketStore + Send + Sync + 'static,
{
    async fn acquire(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let window_millis = self.config.window.as_millis() as u64;

        let (tokens, window_start) = match self.store.get_state(key).await {
            Some((tokens, window_start)) if now.saturating_sub(window_start) < window_millis => {
                (tokens, window_start)
            }
            // Either unseen, or the window elapsed: full refill.
            _ => (self.config.capacity, now),
        };

        if tokens >= 1 {
            self.store.set_state(key, tokens - 1, window_start).await;
            Decision::Allowed { remaining: tokens - 1 }
        } else {
            let retry_after = window_start + window_millis - now;
            Decision::Denied { retry_after: Duration::from_millis(retry_after) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::InMemoryBucketStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock(Arc<AtomicU64>);
    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(AtomicU64::new(0)))
        }
        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn exhausts_then_refills_at_window_boundary() {
        let clock = ManualClock::new();
        let limiter = WindowedTokenBucket::new(
            InMemoryBucketStore::new(),
            RateLimiterConfig { capacity: 2, window: Duration::from_millis(1_000) },
        )
        .with_clock(clock.clone());

        assert!(limiter.acquire("k").await.is_allowed());
        assert!(limiter.acquire("k").await.is_allowed());
        let denied = limiter.acquire("k").await;
        assert!(!denied.is_allowed());

        clock.advance(1_000);
        assert!(limiter.acquire("k").await.is_allowed());
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let limiter = WindowedTokenBucket::new(
            InMemoryBucketStore::new(),
            RateLimiterConfig { capacity: 1, window: Duration::from_millis(1_000) },
        );
        assert!(limiter.acquire("a").await.is_allowed());
        assert!(limiter.acquire("b").await.is_allowed());
        assert!(!limiter.acquire("a").await.is_allowed());
    }
}
