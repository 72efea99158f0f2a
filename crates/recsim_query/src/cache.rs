//! Two cache tiers with different lifecycles.
//!
//! - [`ResourceCache`] holds loaded resources (the snapshot handle) for the
//!   whole process lifetime, keyed by reference. A failed load leaves no entry
//!   behind.
//! - [`ResultCache`] memoizes query outputs keyed by query name and parameters
//!   for a bounded time-to-live. Concurrent lookups for one key share a single
//!   execution.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use datafusion::error::DataFusionError;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{QueryError, QueryResult};
use crate::metrics::QueryMetrics;

/// Default result time-to-live.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(600);
/// Default bound on live result entries.
pub const DEFAULT_RESULT_MAX_ENTRIES: usize = 1024;

/// Process-lifetime cache of shared resources keyed by reference.
pub struct ResourceCache<R> {
    slots: Mutex<HashMap<String, Arc<OnceCell<Arc<R>>>>>,
}

impl<R> Default for ResourceCache<R> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Send + Sync> ResourceCache<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource for `reference`, running `load` at most once.
    ///
    /// Concurrent callers wait on the same load. When `load` fails the slot
    /// stays empty and the next caller retries.
    pub async fn get_or_load<F, Fut>(&self, reference: &str, load: F) -> QueryResult<Arc<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryResult<R>>,
    {
        let cell = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .entry(reference.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let resource = cell
            .get_or_try_init(|| {
                let fut = load();
                async move { fut.await.map(Arc::new) }
            })
            .await?;
        Ok(resource.clone())
    }

    /// Returns the resource when it has already been loaded.
    pub fn get(&self, reference: &str) -> Option<Arc<R>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(reference)
            .and_then(|cell| cell.get().cloned())
    }
}

/// Result-cache key: query name plus canonical JSON of its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: &'static str,
    params: String,
}

impl CacheKey {
    pub fn new<P: Serialize + ?Sized>(query: &'static str, params: &P) -> QueryResult<Self> {
        let params = serde_json::to_string(params).map_err(|err| {
            QueryError::invalid(format!("cannot derive cache key for {query}: {err}"))
        })?;
        Ok(Self { query, params })
    }

    pub fn query(&self) -> &'static str {
        self.query
    }

    pub fn params(&self) -> &str {
        &self.params
    }
}

/// Time-to-live and capacity of the result cache.
#[derive(Debug, Clone, Copy)]
pub struct ResultCachePolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for ResultCachePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_RESULT_TTL,
            max_entries: DEFAULT_RESULT_MAX_ENTRIES,
        }
    }
}

type CachedValue = Arc<dyn Any + Send + Sync>;

struct Slot {
    created_at: Instant,
    cell: Arc<OnceCell<CachedValue>>,
}

impl Slot {
    fn fresh() -> Self {
        Self {
            created_at: Instant::now(),
            cell: Arc::new(OnceCell::new()),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// TTL-bounded, single-flight memo of query results.
pub struct ResultCache {
    policy: ResultCachePolicy,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    metrics: Arc<QueryMetrics>,
}

impl ResultCache {
    pub fn new(policy: ResultCachePolicy, metrics: Arc<QueryMetrics>) -> Self {
        Self {
            policy: ResultCachePolicy {
                ttl: policy.ttl,
                max_entries: policy.max_entries.max(1),
            },
            slots: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn policy(&self) -> ResultCachePolicy {
        self.policy
    }

    /// Returns the cached value for `key` or runs `compute` to produce it.
    ///
    /// At most one `compute` runs per key per validity window; concurrent
    /// callers wait for it. Errors are not cached.
    pub async fn get_or_try_insert_with<T, F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> QueryResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryResult<T>>,
    {
        let cell = self.slot_for(&key);
        let mut executed = false;
        let value = cell
            .get_or_try_init(|| {
                executed = true;
                let fut = compute();
                async move { fut.await.map(|value| Arc::new(value) as CachedValue) }
            })
            .await?
            .clone();
        if executed {
            self.metrics.record_cache_miss();
        } else {
            self.metrics.record_cache_hit();
        }
        value.downcast::<T>().map_err(|_| {
            QueryError::Engine(DataFusionError::Internal(format!(
                "cached value for {} has an unexpected type",
                key.query()
            )))
        })
    }

    fn slot_for(&self, key: &CacheKey) -> Arc<OnceCell<CachedValue>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(key) {
            if !slot.is_expired(self.policy.ttl) {
                return slot.cell.clone();
            }
        }
        let mut evicted = 0u64;
        if slots.remove(key).is_some() {
            evicted += 1;
        }
        if slots.len() >= self.policy.max_entries {
            evicted += purge_expired_locked(&mut slots, self.policy.ttl) as u64;
        }
        while slots.len() >= self.policy.max_entries {
            let oldest = slots
                .iter()
                .min_by_key(|(_, slot)| slot.created_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    slots.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.metrics.record_cache_evictions(evicted);
        }
        let slot = Slot::fresh();
        let cell = slot.cell.clone();
        slots.insert(key.clone(), slot);
        cell
    }

    /// Drops every entry. Returns how many were removed.
    pub fn invalidate_all(&self) -> usize {
        let removed = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let removed = slots.len();
            slots.clear();
            removed
        };
        self.metrics.record_cache_evictions(removed as u64);
        debug!(removed, "result cache cleared");
        removed
    }

    /// Drops every entry of one query. Returns how many were removed.
    pub fn invalidate_query(&self, query: &str) -> usize {
        let removed = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = slots.len();
            slots.retain(|key, _| key.query() != query);
            before - slots.len()
        };
        self.metrics.record_cache_evictions(removed as u64);
        removed
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            purge_expired_locked(&mut slots, self.policy.ttl)
        };
        self.metrics.record_cache_evictions(removed as u64);
        removed
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge_expired_locked(slots: &mut HashMap<CacheKey, Slot>, ttl: Duration) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| !slot.is_expired(ttl));
    before - slots.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(ttl: Duration, max_entries: usize) -> (Arc<ResultCache>, Arc<QueryMetrics>) {
        let metrics = Arc::new(QueryMetrics::default());
        let cache = Arc::new(ResultCache::new(
            ResultCachePolicy { ttl, max_entries },
            metrics.clone(),
        ));
        (cache, metrics)
    }

    fn key(query: &'static str, param: u32) -> CacheKey {
        CacheKey::new(query, &param).expect("serializable key")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_execution() {
        let (cache, metrics) = cache(Duration::from_secs(60), 16);
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let executions = executions.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with(key("ranking", 1), || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, QueryError>(vec![1u64, 2, 3])
                    })
                    .await
            }));
        }
        for task in tasks {
            let value = task.await.expect("join").expect("cached value");
            assert_eq!(value.as_slice(), &[1, 2, 3]);
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let s = metrics.snapshot();
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.cache_hits, 7);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let (cache, _) = cache(Duration::from_millis(30), 16);
        let executions = AtomicUsize::new(0);
        let compute = || async {
            executions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, QueryError>(7u8)
        };

        cache.get_or_try_insert_with(key("top", 5), compute).await.expect("first");
        cache.get_or_try_insert_with(key("top", 5), compute).await.expect("cached");
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get_or_try_insert_with(key("top", 5), compute).await.expect("refreshed");
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (cache, _) = cache(Duration::from_secs(60), 16);
        let failed = cache
            .get_or_try_insert_with(key("rollup", 1), || async {
                Err::<u8, _>(QueryError::invalid("nope"))
            })
            .await;
        assert!(failed.is_err());

        let value = cache
            .get_or_try_insert_with(key("rollup", 1), || async { Ok::<_, QueryError>(3u8) })
            .await
            .expect("second attempt runs");
        assert_eq!(*value, 3);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_entry() {
        let (cache, metrics) = cache(Duration::from_secs(60), 2);
        for param in 0..3u32 {
            cache
                .get_or_try_insert_with(key("detail", param), || async move {
                    Ok::<_, QueryError>(param)
                })
                .await
                .expect("value");
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(metrics.snapshot().cache_evictions, 1);
    }

    #[tokio::test]
    async fn invalidation_hooks_remove_entries() {
        let (cache, _) = cache(Duration::from_secs(60), 16);
        for (query, param) in [("top", 1u32), ("top", 2), ("ranking", 1)] {
            cache
                .get_or_try_insert_with(key(query, param), || async move {
                    Ok::<_, QueryError>(param)
                })
                .await
                .expect("value");
        }
        assert_eq!(cache.invalidate_query("top"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn resource_cache_loads_once_and_retries_after_failure() {
        let resources = ResourceCache::<String>::new();
        let failed = resources
            .get_or_load("snapshot.parquet", || async {
                Err(QueryError::SnapshotUnavailable {
                    reference: "snapshot.parquet".to_string(),
                    reason: "missing".to_string(),
                })
            })
            .await;
        assert!(failed.is_err());
        assert!(resources.get("snapshot.parquet").is_none());

        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = resources
                .get_or_load("snapshot.parquet", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok("loaded".to_string())
                })
                .await
                .expect("loaded");
            assert_eq!(value.as_str(), "loaded");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(resources.get("snapshot.parquet").is_some());
    }
}
