use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Abstract storage for windowed token-bucket state, keyed by submitter.
///
/// Swappable for a distributed backend without touching [`crate::rate_limit::RateLimiter`]
/// callers, the way the teacher's `TokenStore` decouples math from storage.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Returns `(tokens, window_start_millis)` for `key`, if it exists.
    async fn get_state(&self, key: &str) -> Option<(u32, u64)>;

    /// Overwrites the state for `key`.
    async fn set_state(&self, key: &str, tokens: u32, window_start_millis: u64);

    /// Removes buckets whose window started more than `idle_after_millis` ago
    /// relative to `now_millis`; returns the number removed.
    async fn sweep_idle(&self, now_millis: u64, idle_after_millis: u64) -> usize;
}

/// Simple in-memory bucket store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStore {
    data: Arc<Mutex<HashMap<String, (u32, u64)>>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get_state(&self, key: &str) -> Option<(u32, u64)> {
        let guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(key).copied()
    }

    async fn set_state(&self, key: &str, tokens: u32, window_start_millis: u64) {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(key.to_string(), (tokens, window_start_millis));
    }

    async fn sweep_idle(&self, now_millis: u64, idle_after_millis: u64) -> usize {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let before = guard.len();
        guard.retain(|_, &mut (_, window_start)| {
            now_millis.saturating_sub(window_start) < idle_after_millis
        });
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_idle_removes_only_stale_buckets() {
        let store = InMemoryBucketStore::new();
        store.set_state("fresh", 10, 1_000).await;
        store.set_state("stale", 10, 0).await;

        let removed = store.sweep_idle(1_000, 500).await;
        assert_eq!(removed, 1);
        assert!(store.get_state("fresh").await.is_some());
        assert!(store.get_state("stale").await.is_none());
    }
}
