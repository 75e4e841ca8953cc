//! Side key-value store port and the read-through search cache built on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;

use crate::engine::EngineError;
use crate::model::StayRange;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend: {0}")]
    Backend(String),
    #[error("kv codec: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Backend(e.to_string())
    }
}

/// Persistent key-value side store with per-key TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError>;
}

// ── In-memory store ─────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Reads already ignore them.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        let (value, expires_at) = entry.value();
        if *expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(value.clone()))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        let mut removed = 0u64;
        self.entries.retain(|k, _| {
            let keep = !k.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

// ── Redis store ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        let _: () = conn.pset_ex(key, value, millis).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await?;
                removed += n;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

// ── Namespacing ─────────────────────────────────────────────────

/// Prefixes every key so tenants can share one backend.
pub struct NamespacedKv {
    inner: Arc<dyn KvStore>,
    namespace: String,
}

impl NamespacedKv {
    pub fn new(inner: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self { inner, namespace: format!("{namespace}:") }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }
}

#[async_trait]
impl KvStore for NamespacedKv {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        self.inner.set(&self.key(key), value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(&self.key(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        self.inner.delete_prefix(&self.key(prefix)).await
    }
}

// ── Search cache ────────────────────────────────────────────────

pub const NOT_FOUND_SENTINEL: &str = "NOT_FOUND";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Cache-aside layer for availability checks and listing search.
/// Never authoritative: every backend failure degrades to a recompute.
#[derive(Clone)]
pub struct SearchCache {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn availability_key(slug: &str, stay: &StayRange) -> String {
        format!("availability:{slug}:{}:{}", stay.check_in, stay.check_out)
    }

    /// `query` must serialize deterministically (structs, not hash maps).
    pub fn search_key<Q: Serialize>(query: &Q) -> Result<String, EngineError> {
        let body = serde_json::to_string(query)
            .map_err(|e| EngineError::validation(format!("unserializable search query: {e}")))?;
        Ok(format!("search:{body}"))
    }

    /// Return the cached value under `key`, or run `compute` and cache its
    /// result. `NotAvailable` outcomes are cached as a sentinel and replayed.
    pub async fn read_through<T, F, Fut>(
        &self,
        kind: &'static str,
        key: &str,
        use_cache: bool,
        compute: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if !use_cache {
            return compute().await;
        }

        match self.kv.get(key).await {
            Ok(Some(raw)) if raw == NOT_FOUND_SENTINEL => {
                metrics::counter!(crate::observability::CACHE_HITS_TOTAL, "kind" => kind).increment(1);
                return Err(EngineError::NotAvailable);
            }
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    metrics::counter!(crate::observability::CACHE_HITS_TOTAL, "kind" => kind).increment(1);
                    return Ok(value);
                }
                Err(e) => tracing::warn!(key, "discarding undecodable cache entry: {e}"),
            },
            Ok(None) => {
                tracing::debug!(key, "cache miss");
            }
            Err(e) => {
                metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL, "kind" => kind).increment(1);
                tracing::warn!(key, "cache read failed: {e}");
            }
        }
        metrics::counter!(crate::observability::CACHE_MISSES_TOTAL, "kind" => kind).increment(1);

        let result = compute().await;
        let stored = match &result {
            Ok(value) => serde_json::to_string(value).map_err(|e| KvError::Codec(e.to_string())),
            Err(EngineError::NotAvailable) => Ok(NOT_FOUND_SENTINEL.to_string()),
            Err(_) => return result,
        };
        let write = match stored {
            Ok(raw) => self.kv.set(key, raw, self.ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = write {
            metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL, "kind" => kind).increment(1);
            tracing::warn!(key, "cache write failed: {e}");
        }
        result
    }

    /// Drop cached answers that may mention `slug`. Runs in the background.
    pub fn invalidate_listing(&self, slug: &str) {
        let kv = self.kv.clone();
        let availability_prefix = format!("availability:{slug}:");
        tokio::spawn(async move {
            for prefix in [availability_prefix.as_str(), "search:"] {
                if let Err(e) = kv.delete_prefix(prefix).await {
                    metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL, "kind" => "invalidate")
                        .increment(1);
                    tracing::warn!(prefix, "cache invalidation failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenKv;

    #[async_trait]
    impl KvStore for BrokenKv {
        async fn set(&self, _: &str, _: String, _: Duration) -> Result<(), KvError> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Backend("connection refused".into()))
        }
        async fn delete_prefix(&self, _: &str) -> Result<u64, KvError> {
            Err(KvError::Backend("connection refused".into()))
        }
    }

    fn cache(kv: Arc<dyn KvStore>) -> SearchCache {
        SearchCache::new(kv, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn in_memory_entries_expire() {
        let kv = InMemoryKv::new();
        kv.set("k", "v".into(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[test]
    fn delete_prefix_only_touches_matching_keys() {
        let kv = InMemoryKv::new();
        let ttl = Duration::from_secs(60);
        tokio_test::block_on(async {
            kv.set("availability:a:1", "x".into(), ttl).await.unwrap();
            kv.set("availability:a:2", "x".into(), ttl).await.unwrap();
            kv.set("availability:ab:1", "x".into(), ttl).await.unwrap();
            assert_eq!(kv.delete_prefix("availability:a:").await.unwrap(), 2);
            assert!(kv.get("availability:ab:1").await.unwrap().is_some());
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_prefix_counts_only_its_own_removals() {
        let kv = Arc::new(InMemoryKv::new());
        let ttl = Duration::from_secs(60);
        for i in 0..200 {
            kv.set(&format!("availability:busy:{i}"), "x".into(), ttl).await.unwrap();
        }

        // Unrelated keys keep arriving while the prefix is swept.
        let writer = {
            let kv = kv.clone();
            tokio::spawn(async move {
                for i in 0..2_000 {
                    kv.set(&format!("search:{i}"), "x".into(), ttl).await.unwrap();
                }
            })
        };
        let removed = kv.delete_prefix("availability:busy:").await.unwrap();
        writer.await.unwrap();

        assert_eq!(removed, 200);
        assert_eq!(kv.delete_prefix("search:").await.unwrap(), 2_000);
    }

    #[tokio::test]
    async fn namespaces_isolate_tenants() {
        let shared: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let a = NamespacedKv::new(shared.clone(), "a");
        let b = NamespacedKv::new(shared.clone(), "b");
        a.set("k", "from-a".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
        assert_eq!(shared.get("a:k").await.unwrap().as_deref(), Some("from-a"));
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let cache = cache(Arc::new(InMemoryKv::new()));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: u32 = cache
                .read_through("test", "k", true, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_available_is_replayed_from_sentinel() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = cache(kv.clone());
        let first: Result<u32, _> = cache
            .read_through("test", "k", true, || async { Err(EngineError::NotAvailable) })
            .await;
        assert!(matches!(first, Err(EngineError::NotAvailable)));
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some(NOT_FOUND_SENTINEL));

        let second: Result<u32, _> = cache
            .read_through("test", "k", true, || async { Ok(1) })
            .await;
        assert!(matches!(second, Err(EngineError::NotAvailable)));
    }

    #[tokio::test]
    async fn other_errors_are_not_cached() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = cache(kv.clone());
        let r: Result<u32, _> = cache
            .read_through("test", "k", true, || async {
                Err(EngineError::validation("Start date must be before end date"))
            })
            .await;
        assert!(matches!(r, Err(EngineError::Validation(_))));
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bypass_skips_the_store() {
        let kv = Arc::new(InMemoryKv::new());
        let cache = cache(kv.clone());
        let _: u32 = cache.read_through("test", "k", false, || async { Ok(5) }).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn broken_backend_degrades_to_compute() {
        let cache = cache(Arc::new(BrokenKv));
        let v: u32 = cache.read_through("test", "k", true, || async { Ok(9) }).await.unwrap();
        assert_eq!(v, 9);
        // Invalidation failures are swallowed as well.
        cache.invalidate_listing("cabin");
    }
}
