//! Query core for the recommendation-similarity explorer.
//!
//! A single read-only Parquet snapshot relates policy recommendations to
//! sentences and paragraphs extracted from territorial planning documents.
//! This crate:
//! - loads the snapshot once and exposes it as the normalized `sentences`
//!   view inside a DataFusion session,
//! - compiles typed filter options into DataFusion predicates,
//! - runs a fixed catalogue of aggregate and paginated detail queries,
//! - caches snapshot handles and query results.
//!
//! [`QueryService`] is the entry point for view renderers.

pub mod cache;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod page;
pub mod queries;
mod rows;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod testing;

pub use cache::{CacheKey, ResourceCache, ResultCache, ResultCachePolicy};
pub use error::{ErrorKind, QueryError, QueryResult};
pub use filter::{CompiledFilter, FilterConfig, PovertyRange, ProgramFilter, ValidFilter};
pub use metrics::{QueryMetrics, QueryMetricsSnapshot};
pub use page::{Page, PageRequest, ValidPage, DEFAULT_PAGE_SIZE};
pub use queries::{
    DepartmentEntry, DepartmentOverviewRow, DepartmentRollupRow, DetailScope, MetadataSummary,
    MunicipalityEntry, MunicipalityRankingRow, ParagraphMatch, QueryCatalog, QueryName,
    QueryOutput, RecommendationCatalogEntry, RecommendationFrequencyRow,
    RecommendationTerritoryRow, SentenceMatch, TerritoryCount,
};
pub use schema::TerritoryKind;
pub use service::QueryService;
pub use snapshot::{EngineSettings, Snapshot, SnapshotSource};
