//! Token-bucket admission rate limiting (C3), keyed per submitter.
//!
//! # Architecture
//!
//! - [`RateLimiter`]: the decision-making trait.
//! - [`store`]: the storage abstraction, in-memory today, swappable for a
//!   distributed backend without touching callers.
//! - [`strategies`]: the windowed token-bucket math.

use std::time::Duration;

pub mod store;
pub mod strategies;

pub use store::{BucketStore, InMemoryBucketStore};
pub use strategies::WindowedTokenBucket;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed; `remaining` tokens are left in the bucket.
    Allowed { remaining: u32 },
    /// The request is denied; wait at least `retry_after` before retrying.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for admission rate limiting, decoupled from storage.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempt to admit one request under `key`.
    async fn acquire(&self, key: &str) -> Decision;
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { capacity: 100, window: Duration::from_millis(60_000) }
    }
}
