use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    // Per-key gates so concurrent misses run the producer once.
    inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// TTL'd key/value cache over JSON values.
///
/// Strictly an optimization: a disabled cache (no `CACHE_URL`) turns every
/// call into a pass-through and nothing downstream may notice. Cache state
/// is allowed to lag the store by up to the TTL.
#[derive(Clone, Default)]
pub struct CacheLayer {
    inner: Option<Arc<CacheInner>>,
}

impl CacheLayer {
    pub fn enabled() -> Self {
        CacheLayer {
            inner: Some(Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                inflight: AsyncMutex::new(HashMap::new()),
            })),
        }
    }

    pub fn disabled() -> Self {
        CacheLayer { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.as_ref()?;
        let mut entries = inner.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn setex(&self, key: &str, value: Value, ttl: Duration) {
        if let Some(inner) = &self.inner {
            inner.entries.lock().expect("cache mutex poisoned").insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn del<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(inner) = &self.inner {
            let mut entries = inner.entries.lock().expect("cache mutex poisoned");
            for key in keys {
                entries.remove(key.as_ref());
            }
        }
    }

    /// O(keyspace); prefer targeted `del` on hot paths.
    pub fn del_prefix(&self, prefix: &str) {
        if let Some(inner) = &self.inner {
            let mut entries = inner.entries.lock().expect("cache mutex poisoned");
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            debug!(prefix, dropped = before - entries.len(), "cache prefix invalidated");
        }
    }

    /// Returns the cached value or runs `producer` once, caching its result.
    /// Concurrent callers on the same key within this instance share a
    /// single producer run. Producer errors propagate and cache nothing.
    pub async fn get_or_compute<E, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: impl FnOnce() -> Fut,
    ) -> Result<Value, E>
    where
        Fut: Future<Output = Result<Value, E>>,
    {
        let Some(inner) = &self.inner else {
            return producer().await;
        };
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let gate = {
            let mut inflight = inner.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // A peer may have filled the key while we waited at the gate.
        if let Some(value) = self.get(key) {
            inner.inflight.lock().await.remove(key);
            return Ok(value);
        }

        let result = producer().await;
        if let Ok(value) = &result {
            self.setex(key, value.clone(), ttl);
        }
        inner.inflight.lock().await.remove(key);
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.entries.lock().expect("cache mutex poisoned").len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn entries_expire_by_ttl() {
        let cache = CacheLayer::enabled();
        cache.setex("bal:user:alice", json!(1), Duration::from_millis(20));
        assert_eq!(cache.get("bal:user:alice"), Some(json!(1)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("bal:user:alice"), None);
    }

    #[tokio::test]
    async fn del_prefix_drops_exactly_the_prefixed_keys() {
        let cache = CacheLayer::enabled();
        cache.setex("bal:user:alice", json!(1), TTL);
        cache.setex("bal:user:bob", json!(2), TTL);
        cache.setex("set:user:alice", json!(3), TTL);
        cache.del_prefix("bal:user:");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("set:user:alice"), Some(json!(3)));
    }

    #[tokio::test]
    async fn single_flight_runs_the_producer_once() {
        let cache = CacheLayer::enabled();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("bal:scope:g1", TTL, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, Infallible>(json!({"b": {"a": 300}}))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"b": {"a": 300}}));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_errors_cache_nothing() {
        let cache = CacheLayer::enabled();
        let result: Result<Value, &str> = cache
            .get_or_compute("bal:user:alice", TTL, || async { Err("store down") })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);

        let result: Result<Value, &str> = cache
            .get_or_compute("bal:user:alice", TTL, || async { Ok(json!(5)) })
            .await;
        assert_eq!(result.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn disabled_cache_falls_through() {
        let cache = CacheLayer::disabled();
        cache.setex("k", json!(1), TTL);
        assert_eq!(cache.get("k"), None);
        let value: Result<Value, Infallible> = cache
            .get_or_compute("k", TTL, || async { Ok(json!(2)) })
            .await;
        assert_eq!(value.unwrap(), json!(2));
    }
}
