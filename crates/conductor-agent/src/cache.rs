use std::time::Duration;

use moka::future::Cache;
use tracing::warn;

/// Upper bound on cached scoring inputs per cache.
const MAX_ENTRIES: u64 = 10_000;

/// Scoring inputs keyed by string, expiring after a fixed TTL.
///
/// Shared by every run the engine drives; staleness within the TTL is accepted.
#[derive(Clone)]
pub struct ScoreCache<V> {
    inner: Cache<String, V>,
}

impl<V> ScoreCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(MAX_ENTRIES)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.inner.insert(key.into(), value).await;
    }

    pub async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let prefix = prefix.to_string();
        if let Err(e) = self
            .inner
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
        {
            warn!(error = %e, "Prefix invalidation rejected, clearing cache");
            self.inner.invalidate_all();
        }
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}
