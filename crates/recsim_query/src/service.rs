//! Boundary used by view renderers: validates caller input once, derives the
//! result-cache key and routes execution through the cache and the metrics.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ResourceCache, ResultCache, ResultCachePolicy};
use crate::error::{QueryError, QueryResult};
use crate::filter::FilterConfig;
use crate::metrics::QueryMetrics;
use crate::page::{Page, PageRequest};
use crate::queries::{
    DepartmentEntry, DepartmentOverviewRow, DepartmentRollupRow, DetailScope, MetadataSummary,
    MunicipalityEntry, MunicipalityRankingRow, ParagraphMatch, QueryCatalog, QueryName,
    QueryOutput, RecommendationCatalogEntry, RecommendationFrequencyRow,
    RecommendationTerritoryRow, SentenceMatch, MAX_ROW_LIMIT,
};
use crate::schema::TerritoryKind;
use crate::snapshot::{EngineSettings, Snapshot, SnapshotSource};

/// Validated, cached access to the query catalogue.
pub struct QueryService {
    catalog: QueryCatalog,
    results: ResultCache,
    metrics: Arc<QueryMetrics>,
    summary: OnceCell<Arc<MetadataSummary>>,
}

impl QueryService {
    pub fn new(
        snapshot: Arc<Snapshot>,
        policy: ResultCachePolicy,
        metrics: Arc<QueryMetrics>,
    ) -> Self {
        Self {
            catalog: QueryCatalog::new(snapshot),
            results: ResultCache::new(policy, metrics.clone()),
            metrics,
            summary: OnceCell::new(),
        }
    }

    /// Loads `source` through `snapshots` (at most once per reference) and
    /// builds a service over it.
    pub async fn open(
        source: SnapshotSource,
        settings: &EngineSettings,
        snapshots: &ResourceCache<Snapshot>,
        policy: ResultCachePolicy,
        metrics: Arc<QueryMetrics>,
    ) -> QueryResult<Self> {
        let reference = source.reference();
        let snapshot = snapshots
            .get_or_load(&reference, || Snapshot::load(source, settings, &metrics))
            .await?;
        Ok(Self::new(snapshot, policy, metrics))
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        self.catalog.snapshot()
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.results
    }

    /// Drops every cached result. The metadata summary is kept: the snapshot
    /// it describes cannot change.
    pub fn invalidate_results(&self) -> usize {
        let removed = self.results.invalidate_all();
        info!(removed, "query results invalidated");
        removed
    }

    pub fn invalidate_query(&self, query: QueryName) -> usize {
        let removed = self.results.invalidate_query(query.as_str());
        info!(query = %query, removed, "query results invalidated");
        removed
    }

    /// Unfiltered summary, computed once per service.
    pub async fn metadata_summary(&self) -> QueryResult<Arc<MetadataSummary>> {
        self.summary
            .get_or_try_init(|| async {
                self.execute(
                    QueryName::MetadataSummary,
                    self.catalog.metadata_summary(None),
                )
                .await
                .map(Arc::new)
            })
            .await
            .cloned()
    }

    pub async fn filtered_summary(&self, filter: FilterConfig) -> QueryResult<Arc<MetadataSummary>> {
        let filter = self.check(filter.validate())?;
        self.cached(QueryName::FilteredSummary, &filter, || async {
            self.catalog.metadata_summary(Some(&filter.compile())).await
        })
        .await
    }

    pub async fn department_rollup(
        &self,
        filter: FilterConfig,
    ) -> QueryResult<Arc<Vec<DepartmentRollupRow>>> {
        let filter = self.check(filter.validate())?;
        self.cached(QueryName::DepartmentRollup, &filter, || async {
            self.catalog.department_rollup(&filter.compile()).await
        })
        .await
    }

    /// Department statistics folded from municipality rows, whatever kind the
    /// filter names.
    pub async fn department_overview(
        &self,
        filter: FilterConfig,
    ) -> QueryResult<Arc<Vec<DepartmentOverviewRow>>> {
        let filter = self
            .check(filter.validate())?
            .for_kind(TerritoryKind::Municipality);
        self.cached(QueryName::DepartmentOverview, &filter, || async {
            self.catalog.department_overview(&filter.compile()).await
        })
        .await
    }

    pub async fn municipal_ranking(
        &self,
        filter: FilterConfig,
        limit: Option<usize>,
    ) -> QueryResult<Arc<Vec<MunicipalityRankingRow>>> {
        let filter = self.check(filter.validate())?;
        let limit = match limit {
            Some(limit) => Some(self.check(validate_limit(limit))?),
            None => None,
        };
        self.cached(QueryName::MunicipalRanking, &(&filter, limit), || async {
            self.catalog.municipal_ranking(&filter.compile(), limit).await
        })
        .await
    }

    pub async fn top_recommendations(
        &self,
        filter: FilterConfig,
        limit: usize,
    ) -> QueryResult<Arc<Vec<RecommendationFrequencyRow>>> {
        let filter = self.check(filter.validate())?;
        let limit = self.check(validate_limit(limit))?;
        self.cached(QueryName::TopRecommendations, &(&filter, limit), || async {
            self.catalog.top_recommendations(&filter.compile(), limit).await
        })
        .await
    }

    pub async fn recommendation_territories(
        &self,
        filter: FilterConfig,
        recommendation: &str,
        limit: usize,
    ) -> QueryResult<Arc<Vec<RecommendationTerritoryRow>>> {
        let filter = self.check(filter.validate())?;
        let limit = self.check(validate_limit(limit))?;
        let recommendation = recommendation.trim();
        if recommendation.is_empty() {
            return self.check(Err(QueryError::invalid("recommendation code is required")));
        }
        self.cached(
            QueryName::RecommendationTerritories,
            &(&filter, recommendation, limit),
            || async {
                self.catalog
                    .recommendation_territories(&filter.compile(), recommendation, limit)
                    .await
            },
        )
        .await
    }

    pub async fn sentence_matches(
        &self,
        filter: FilterConfig,
        scope: DetailScope,
        page: PageRequest,
    ) -> QueryResult<Arc<Page<SentenceMatch>>> {
        let filter = self.check(filter.validate())?;
        let scope = self.check(scope.validate(filter.territory_kind()))?;
        let page = self.check(page.validate())?;
        self.cached(QueryName::SentenceMatches, &(&filter, &scope, page), || async {
            self.catalog
                .sentence_matches(&filter.compile(), &scope, page)
                .await
        })
        .await
    }

    pub async fn paragraph_matches(
        &self,
        filter: FilterConfig,
        scope: DetailScope,
        page: PageRequest,
    ) -> QueryResult<Arc<Page<ParagraphMatch>>> {
        let filter = self.check(filter.validate())?;
        let scope = self.check(scope.validate(filter.territory_kind()))?;
        let page = self.check(page.validate())?;
        self.cached(QueryName::ParagraphMatches, &(&filter, &scope, page), || async {
            self.catalog
                .paragraph_matches(&filter.compile(), &scope, page)
                .await
        })
        .await
    }

    pub async fn recommendation_catalog(
        &self,
    ) -> QueryResult<Arc<Vec<RecommendationCatalogEntry>>> {
        self.cached(QueryName::RecommendationCatalog, &(), || {
            self.catalog.recommendation_catalog()
        })
        .await
    }

    pub async fn municipalities(&self) -> QueryResult<Arc<Vec<MunicipalityEntry>>> {
        self.cached(QueryName::MunicipalityList, &(), || self.catalog.municipalities())
            .await
    }

    pub async fn departments(&self) -> QueryResult<Arc<Vec<DepartmentEntry>>> {
        self.cached(QueryName::DepartmentList, &(), || self.catalog.departments())
            .await
    }

    /// Counts rejected input before it reaches the engine.
    fn check<T>(&self, result: QueryResult<T>) -> QueryResult<T> {
        if let Err(err) = &result {
            if err.is_rejection() {
                self.metrics.record_rejection();
                debug!(error = %err, "request rejected");
            }
        }
        result
    }

    async fn cached<P, T, F, Fut>(
        &self,
        query: QueryName,
        params: &P,
        compute: F,
    ) -> QueryResult<Arc<T>>
    where
        P: Serialize + ?Sized,
        T: QueryOutput + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryResult<T>>,
    {
        let key = CacheKey::new(query.as_str(), params)?;
        self.results
            .get_or_try_insert_with(key, || self.execute(query, compute()))
            .await
    }

    async fn execute<T, Fut>(&self, query: QueryName, run: Fut) -> QueryResult<T>
    where
        T: QueryOutput,
        Fut: Future<Output = QueryResult<T>>,
    {
        let started = Instant::now();
        match run.await {
            Ok(output) => {
                let elapsed = started.elapsed();
                let rows = output.row_count();
                self.metrics.record_execution(query.as_str(), rows, elapsed);
                debug!(
                    query = %query,
                    rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query executed"
                );
                Ok(output)
            }
            Err(err) => {
                self.metrics.record_failure(query.as_str());
                warn!(query = %query, error = %err, "query failed");
                Err(err)
            }
        }
    }
}

fn validate_limit(limit: usize) -> QueryResult<usize> {
    if limit == 0 || limit > MAX_ROW_LIMIT {
        return Err(QueryError::invalid(format!(
            "limit {limit} outside [1, {MAX_ROW_LIMIT}]"
        )));
    }
    Ok(limit)
}
