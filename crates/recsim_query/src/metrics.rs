//! In-process counters for query execution, caching and snapshot fetches.
//!
//! Counters are lock-free atomics so they can be bumped on every request; the
//! per-query breakdown sits behind a mutex that is only touched once per
//! executed query.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Per-query execution aggregates.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryKindMetrics {
    /// Number of executions against the engine (cache hits excluded).
    pub executions: u64,
    /// Rows produced across executions.
    pub rows: u64,
    /// Sum of execution latency in nanoseconds.
    pub latency_ns: u64,
    /// Executions that failed.
    pub failures: u64,
}

/// Aggregated counters for the query service.
#[derive(Debug, Default)]
pub struct QueryMetrics {
    /// Queries executed against the engine.
    queries_executed: AtomicU64,
    /// Sum of execution latency in nanoseconds.
    query_latency_ns_total: AtomicU64,
    /// Rows produced by executed queries.
    rows_returned: AtomicU64,
    /// Executions that produced zero rows.
    empty_results: AtomicU64,
    /// Executions that failed inside the engine.
    query_failures: AtomicU64,
    /// Requests rejected by validation before reaching the engine.
    rejected_requests: AtomicU64,
    /// Result-cache lookups answered from a live entry.
    cache_hits: AtomicU64,
    /// Result-cache lookups that had to execute.
    cache_misses: AtomicU64,
    /// Entries dropped by TTL expiry, capacity pressure or invalidation.
    cache_evictions: AtomicU64,
    /// Snapshot download attempts.
    snapshot_fetch_attempts: AtomicU64,
    /// Snapshot download attempts that failed.
    snapshot_fetch_failures: AtomicU64,
    /// Per-query breakdown keyed by query name.
    by_query: Mutex<BTreeMap<&'static str, QueryKindMetrics>>,
}

/// Immutable snapshot view of [`QueryMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct QueryMetricsSnapshot {
    pub queries_executed: u64,
    pub query_latency_ns_total: u64,
    pub rows_returned: u64,
    pub empty_results: u64,
    pub query_failures: u64,
    pub rejected_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub snapshot_fetch_attempts: u64,
    pub snapshot_fetch_failures: u64,
}

impl QueryMetrics {
    /// Records one successful engine execution.
    pub fn record_execution(&self, query: &'static str, rows: u64, latency: Duration) {
        let latency_ns = latency.as_nanos() as u64;
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.query_latency_ns_total
            .fetch_add(latency_ns, Ordering::Relaxed);
        self.rows_returned.fetch_add(rows, Ordering::Relaxed);
        if rows == 0 {
            self.empty_results.fetch_add(1, Ordering::Relaxed);
        }
        let mut by_query = self
            .by_query
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = by_query.entry(query).or_default();
        entry.executions = entry.executions.saturating_add(1);
        entry.rows = entry.rows.saturating_add(rows);
        entry.latency_ns = entry.latency_ns.saturating_add(latency_ns);
    }

    /// Records one failed engine execution.
    pub fn record_failure(&self, query: &'static str) {
        self.query_failures.fetch_add(1, Ordering::Relaxed);
        let mut by_query = self
            .by_query
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = by_query.entry(query).or_default();
        entry.failures = entry.failures.saturating_add(1);
    }

    pub fn record_rejection(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Records one snapshot download attempt and whether it failed.
    pub fn record_fetch_attempt(&self, failed: bool) {
        self.snapshot_fetch_attempts.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.snapshot_fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the per-query aggregates for `query`, if it ever ran.
    pub fn query(&self, query: &str) -> Option<QueryKindMetrics> {
        self.by_query
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(query)
            .copied()
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        QueryMetricsSnapshot {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            query_latency_ns_total: self.query_latency_ns_total.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
            empty_results: self.empty_results.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            snapshot_fetch_attempts: self.snapshot_fetch_attempts.load(Ordering::Relaxed),
            snapshot_fetch_failures: self.snapshot_fetch_failures.load(Ordering::Relaxed),
        }
    }

    /// Renders metrics in a plain-text format suitable for `/metrics`.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            "queries_executed={}\nquery_latency_ns_total={}\nrows_returned={}\nempty_results={}\nquery_failures={}\nrejected_requests={}\ncache_hits={}\ncache_misses={}\ncache_evictions={}\nsnapshot_fetch_attempts={}\nsnapshot_fetch_failures={}\n",
            s.queries_executed,
            s.query_latency_ns_total,
            s.rows_returned,
            s.empty_results,
            s.query_failures,
            s.rejected_requests,
            s.cache_hits,
            s.cache_misses,
            s.cache_evictions,
            s.snapshot_fetch_attempts,
            s.snapshot_fetch_failures,
        );
        let by_query = self
            .by_query
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (query, metrics) in by_query.iter() {
            out.push_str(
                format!(
                    "query_{query}_executions={}\nquery_{query}_rows={}\nquery_{query}_latency_ns={}\nquery_{query}_failures={}\n",
                    metrics.executions, metrics.rows, metrics.latency_ns, metrics.failures,
                )
                .as_str(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_totals_and_per_query_lines() {
        let metrics = QueryMetrics::default();
        metrics.record_execution("top_recommendations", 3, Duration::from_millis(2));
        metrics.record_execution("top_recommendations", 0, Duration::from_millis(1));
        metrics.record_failure("municipal_ranking");
        metrics.record_cache_hit();
        metrics.record_rejection();

        let s = metrics.snapshot();
        assert_eq!(s.queries_executed, 2);
        assert_eq!(s.rows_returned, 3);
        assert_eq!(s.empty_results, 1);
        assert_eq!(s.query_failures, 1);

        let text = metrics.render_text();
        assert!(text.contains("cache_hits=1\n"));
        assert!(text.contains("rejected_requests=1\n"));
        assert!(text.contains("query_top_recommendations_executions=2\n"));
        assert!(text.contains("query_municipal_ranking_failures=1\n"));
        assert_eq!(
            metrics.query("top_recommendations").map(|m| m.rows),
            Some(3)
        );
    }
}
