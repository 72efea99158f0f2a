//! Catalogue of parameterized aggregate queries over the `sentences` view.
//!
//! Every query takes a [`CompiledFilter`] plus its own parameters and returns
//! typed rows. Orderings always end in a unique key so repeated runs return
//! identical sequences.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use datafusion::arrow::record_batch::RecordBatch;
use datafusion::dataframe::DataFrame;
use datafusion::functions::math::expr_fn::round;
use datafusion::functions_aggregate::expr_fn::{avg, count, count_distinct, max, min, sum};
use datafusion::logical_expr::{col, lit, when, Expr};
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};
use crate::filter::CompiledFilter;
use crate::page::{Page, ValidPage};
use crate::rows::{counts, floats, ints, strings, texts};
use crate::schema::{columns as c, pad_code, TerritoryKind};
use crate::snapshot::Snapshot;

/// Default number of territories returned per recommendation.
pub const DEFAULT_TERRITORIES_PER_RECOMMENDATION: usize = 100;
/// Default size of the top-recommendations list.
pub const DEFAULT_TOP_RECOMMENDATIONS: usize = 10;
/// Upper bound on any caller-supplied row limit.
pub const MAX_ROW_LIMIT: usize = 10_000;

const TOTAL_ROWS: &str = "total_rows";
const MUNICIPALITIES: &str = "municipalities";
const DEPARTMENTS: &str = "departments";
const RECOMMENDATIONS: &str = "recommendations";
const MATCHING_ROWS: &str = "matching_rows";
const MEAN_SIMILARITY: &str = "mean_similarity";
const MIN_SIMILARITY: &str = "min_similarity";
const MAX_SIMILARITY: &str = "max_similarity";
const PRIORITIZED: &str = "prioritized";
const TERRITORIES: &str = "territories";
const TEXT: &str = "text";
const TOPIC: &str = "topic";
const PRIORITY: &str = "priority";
const SENTENCES: &str = "sentences";
const DEPT: &str = "dept";
const MPIO: &str = "mpio";
const PARAGRAPH: &str = "paragraph";
const PAGE: &str = "page";
/// Decimal places kept on averages that take part in an ordering.
const MEAN_DECIMALS: i64 = 9;
const PARAGRAPH_SCORE: &str = "paragraph_score";

/// Names of the catalogue queries; used for metrics and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryName {
    MetadataSummary,
    FilteredSummary,
    DepartmentRollup,
    DepartmentOverview,
    MunicipalRanking,
    TopRecommendations,
    RecommendationTerritories,
    SentenceMatches,
    ParagraphMatches,
    RecommendationCatalog,
    MunicipalityList,
    DepartmentList,
}

impl QueryName {
    pub const ALL: [QueryName; 12] = [
        Self::MetadataSummary,
        Self::FilteredSummary,
        Self::DepartmentRollup,
        Self::DepartmentOverview,
        Self::MunicipalRanking,
        Self::TopRecommendations,
        Self::RecommendationTerritories,
        Self::SentenceMatches,
        Self::ParagraphMatches,
        Self::RecommendationCatalog,
        Self::MunicipalityList,
        Self::DepartmentList,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetadataSummary => "metadata_summary",
            Self::FilteredSummary => "filtered_summary",
            Self::DepartmentRollup => "department_rollup",
            Self::DepartmentOverview => "department_overview",
            Self::MunicipalRanking => "municipal_ranking",
            Self::TopRecommendations => "top_recommendations",
            Self::RecommendationTerritories => "recommendation_territories",
            Self::SentenceMatches => "sentence_matches",
            Self::ParagraphMatches => "paragraph_matches",
            Self::RecommendationCatalog => "recommendation_catalog",
            Self::MunicipalityList => "municipality_list",
            Self::DepartmentList => "department_list",
        }
    }
}

impl fmt::Display for QueryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryName {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == raw)
            .ok_or_else(|| QueryError::invalid(format!("unknown query '{raw}'")))
    }
}

/// Size of a query result, for metrics and the `empty` flag of responses.
pub trait QueryOutput {
    fn row_count(&self) -> u64;

    fn is_empty_result(&self) -> bool {
        self.row_count() == 0
    }
}

impl<T> QueryOutput for Vec<T> {
    fn row_count(&self) -> u64 {
        self.len() as u64
    }
}

impl<T> QueryOutput for Page<T> {
    fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataSummary {
    pub total_rows: u64,
    pub municipalities: u64,
    pub departments: u64,
    pub recommendations: u64,
    pub min_similarity: Option<f64>,
    pub max_similarity: Option<f64>,
    pub mean_similarity: Option<f64>,
}

impl QueryOutput for MetadataSummary {
    fn row_count(&self) -> u64 {
        self.total_rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentRollupRow {
    pub dept_code: String,
    pub dept_name: String,
    /// Distinct recommendations mentioned.
    pub recommendations: u64,
    pub matching_rows: u64,
    pub mean_similarity: Option<f64>,
    /// Matching rows that belong to prioritized recommendations.
    pub prioritized_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MunicipalityRankingRow {
    /// One-based position in the ranking.
    pub rank: u64,
    pub territory_code: String,
    pub territory_name: String,
    pub dept_code: String,
    pub dept_name: String,
    pub recommendations: u64,
    pub matching_rows: u64,
    /// `None` when the territory has no matching rows.
    pub mean_similarity: Option<f64>,
    pub prioritized_recommendations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerritoryCount {
    pub territory_code: String,
    pub territory_name: String,
    pub recommendations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentOverviewRow {
    pub dept_code: String,
    pub dept_name: String,
    pub municipalities_with_mentions: u64,
    pub mean_recommendations: f64,
    pub fewest: TerritoryCount,
    pub most: TerritoryCount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationFrequencyRow {
    pub recommendation_code: String,
    pub recommendation_text: String,
    pub recommendation_topic: Option<String>,
    pub prioritized: bool,
    pub matching_rows: u64,
    /// Distinct territories mentioning the recommendation.
    pub territories: u64,
    pub mean_similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationTerritoryRow {
    pub territory_code: String,
    pub territory_name: String,
    pub dept_name: String,
    pub matching_rows: u64,
    pub mean_similarity: Option<f64>,
    pub max_similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentenceMatch {
    pub territory_code: String,
    pub dept_name: String,
    pub mpio_name: Option<String>,
    pub recommendation_code: String,
    pub recommendation_text: String,
    pub paragraph_id: String,
    pub sentence_id: String,
    pub sentence_ordinal: Option<i64>,
    pub sentence_text: String,
    pub sentence_similarity: f64,
    pub page_number: Option<i64>,
    pub predicted_class: Option<String>,
    pub prediction_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParagraphMatch {
    pub territory_code: String,
    pub dept_name: String,
    pub mpio_name: Option<String>,
    pub recommendation_code: String,
    pub paragraph_id: String,
    pub paragraph_text: Option<String>,
    pub page_number: Option<i64>,
    pub paragraph_similarity: Option<f64>,
    /// Matching sentences inside the paragraph.
    pub sentences: u64,
    pub mean_sentence_similarity: Option<f64>,
    pub max_sentence_similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecommendationCatalogEntry {
    pub code: String,
    pub text: String,
    pub topic: Option<String>,
    pub prioritized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MunicipalityEntry {
    pub mpio_code: String,
    pub mpio_name: String,
    pub dept_code: String,
    pub dept_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentEntry {
    pub dept_code: String,
    pub dept_name: String,
}

/// Restriction for row-level detail: a recommendation, a territory, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailScope {
    pub recommendation: Option<String>,
    pub territory_code: Option<String>,
}

impl DetailScope {
    pub fn recommendation(code: impl Into<String>) -> Self {
        Self {
            recommendation: Some(code.into()),
            territory_code: None,
        }
    }

    pub fn territory(code: impl Into<String>) -> Self {
        Self {
            recommendation: None,
            territory_code: Some(code.into()),
        }
    }

    pub fn and_recommendation(mut self, code: impl Into<String>) -> Self {
        self.recommendation = Some(code.into());
        self
    }

    /// Trims both parts and pads numeric territory codes to the kind's width.
    pub fn validate(self, kind: TerritoryKind) -> QueryResult<Self> {
        let recommendation = self
            .recommendation
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty());
        let territory_code = self
            .territory_code
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty())
            .map(|code| {
                if code.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
                    pad_code(&code, kind.code_width())
                } else {
                    code
                }
            });
        if recommendation.is_none() && territory_code.is_none() {
            return Err(QueryError::invalid(
                "detail queries need a recommendation, a territory code, or both",
            ));
        }
        Ok(Self {
            recommendation,
            territory_code,
        })
    }

    fn predicate(&self) -> Expr {
        let mut clauses = Vec::with_capacity(2);
        if let Some(code) = &self.recommendation {
            clauses.push(col(c::RECOMMENDATION_CODE).eq(lit(code.as_str())));
        }
        if let Some(code) = &self.territory_code {
            clauses.push(col(c::TERRITORY_CODE).eq(lit(code.as_str())));
        }
        clauses.into_iter().reduce(Expr::and).unwrap_or_else(|| lit(true))
    }
}

/// Group keys identifying one territory of `kind`.
fn territory_group(kind: TerritoryKind) -> Vec<Expr> {
    let mut group = vec![col(c::TERRITORY_CODE), col(c::DEPT_CODE), col(c::DEPT_NAME)];
    if kind == TerritoryKind::Municipality {
        group.push(col(c::MPIO_NAME));
    }
    group
}

fn territory_name_column(kind: TerritoryKind) -> &'static str {
    match kind {
        TerritoryKind::Municipality => c::MPIO_NAME,
        TerritoryKind::Department => c::DEPT_NAME,
    }
}

fn is_prioritized() -> Expr {
    col(c::RECOMMENDATION_PRIORITY).eq(lit(1i64))
}

fn ones_where(predicate: Expr) -> QueryResult<Expr> {
    Ok(when(predicate, lit(1i64)).otherwise(lit(0i64))?)
}

/// Executes the fixed query catalogue against one loaded snapshot.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    snapshot: Arc<Snapshot>,
}

impl QueryCatalog {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    async fn sentences(&self) -> QueryResult<DataFrame> {
        self.snapshot.sentences().await
    }

    /// Row and distinct-value counts plus similarity bounds; `filter` narrows
    /// the rows when present.
    pub async fn metadata_summary(
        &self,
        filter: Option<&CompiledFilter>,
    ) -> QueryResult<MetadataSummary> {
        let mut df = self.sentences().await?;
        if let Some(filter) = filter {
            df = df.filter(filter.predicate())?;
        }
        let municipality = col(c::TERRITORY_KIND).eq(lit(TerritoryKind::Municipality.as_label()));
        let batches = df
            .aggregate(
                vec![],
                vec![
                    count(lit(1i64)).alias(TOTAL_ROWS),
                    count_distinct(when(municipality, col(c::MPIO_CODE)).end()?)
                        .alias(MUNICIPALITIES),
                    count_distinct(col(c::DEPT_CODE)).alias(DEPARTMENTS),
                    count_distinct(col(c::RECOMMENDATION_CODE)).alias(RECOMMENDATIONS),
                    min(col(c::SENTENCE_SIMILARITY)).alias(MIN_SIMILARITY),
                    max(col(c::SENTENCE_SIMILARITY)).alias(MAX_SIMILARITY),
                    avg(col(c::SENTENCE_SIMILARITY)).alias(MEAN_SIMILARITY),
                ],
            )?
            .collect()
            .await?;

        let mut summary = MetadataSummary {
            total_rows: 0,
            municipalities: 0,
            departments: 0,
            recommendations: 0,
            min_similarity: None,
            max_similarity: None,
            mean_similarity: None,
        };
        if let Some(batch) = batches.iter().find(|batch| batch.num_rows() > 0) {
            summary.total_rows = counts(batch, TOTAL_ROWS)?[0];
            summary.municipalities = counts(batch, MUNICIPALITIES)?[0];
            summary.departments = counts(batch, DEPARTMENTS)?[0];
            summary.recommendations = counts(batch, RECOMMENDATIONS)?[0];
            summary.min_similarity = floats(batch, MIN_SIMILARITY)?[0];
            summary.max_similarity = floats(batch, MAX_SIMILARITY)?[0];
            summary.mean_similarity = floats(batch, MEAN_SIMILARITY)?[0];
        }
        Ok(summary)
    }

    /// Per-department aggregates over rows passing the full predicate.
    pub async fn department_rollup(
        &self,
        filter: &CompiledFilter,
    ) -> QueryResult<Vec<DepartmentRollupRow>> {
        let batches = self
            .sentences()
            .await?
            .filter(filter.predicate())?
            .aggregate(
                vec![col(c::DEPT_CODE), col(c::DEPT_NAME)],
                vec![
                    count_distinct(col(c::RECOMMENDATION_CODE)).alias(RECOMMENDATIONS),
                    count(lit(1i64)).alias(MATCHING_ROWS),
                    avg(col(c::SENTENCE_SIMILARITY)).alias(MEAN_SIMILARITY),
                    sum(ones_where(is_prioritized())?).alias(PRIORITIZED),
                ],
            )?
            .with_column(MEAN_SIMILARITY, rounded(MEAN_SIMILARITY))?
            .sort(vec![
                col(RECOMMENDATIONS).sort(false, false),
                col(MEAN_SIMILARITY).sort(false, false),
                col(c::DEPT_CODE).sort(true, false),
                col(c::DEPT_NAME).sort(true, false),
            ])?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::DEPT_CODE)?;
            let names = texts(batch, c::DEPT_NAME)?;
            let recommendations = counts(batch, RECOMMENDATIONS)?;
            let matching = counts(batch, MATCHING_ROWS)?;
            let means = floats(batch, MEAN_SIMILARITY)?;
            let prioritized = counts(batch, PRIORITIZED)?;
            for i in 0..batch.num_rows() {
                rows.push(DepartmentRollupRow {
                    dept_code: codes[i].clone(),
                    dept_name: names[i].clone(),
                    recommendations: recommendations[i],
                    matching_rows: matching[i],
                    mean_similarity: means[i],
                    prioritized_rows: prioritized[i],
                });
            }
        }
        Ok(rows)
    }

    /// Ranks every territory in scope, including those with no matching rows.
    ///
    /// Matches are counted with conditional aggregates over the scope so a
    /// territory whose rows all fail the match clauses still gets a zero row.
    pub async fn municipal_ranking(
        &self,
        filter: &CompiledFilter,
        limit: Option<usize>,
    ) -> QueryResult<Vec<MunicipalityRankingRow>> {
        let kind = filter.territory_kind();
        let name_column = territory_name_column(kind);
        let matched = filter.match_predicate();
        let mut df = self
            .sentences()
            .await?
            .filter(filter.scope_predicate())?
            .aggregate(
                territory_group(kind),
                vec![
                    count_distinct(when(matched.clone(), col(c::RECOMMENDATION_CODE)).end()?)
                        .alias(RECOMMENDATIONS),
                    sum(ones_where(matched.clone())?).alias(MATCHING_ROWS),
                    avg(when(matched.clone(), col(c::SENTENCE_SIMILARITY)).end()?)
                        .alias(MEAN_SIMILARITY),
                    count_distinct(
                        when(matched.and(is_prioritized()), col(c::RECOMMENDATION_CODE)).end()?,
                    )
                    .alias(PRIORITIZED),
                ],
            )?
            .with_column(MEAN_SIMILARITY, rounded(MEAN_SIMILARITY))?
            .sort(vec![
                col(RECOMMENDATIONS).sort(false, false),
                col(MEAN_SIMILARITY).sort(false, false),
                col(c::TERRITORY_CODE).sort(true, false),
                col(name_column).sort(true, false),
            ])?;
        if let Some(limit) = limit {
            df = df.limit(0, Some(limit))?;
        }
        let batches = df.collect().await?;

        let mut rows: Vec<MunicipalityRankingRow> = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::TERRITORY_CODE)?;
            let names = texts(batch, name_column)?;
            let dept_codes = texts(batch, c::DEPT_CODE)?;
            let dept_names = texts(batch, c::DEPT_NAME)?;
            let recommendations = counts(batch, RECOMMENDATIONS)?;
            let matching = counts(batch, MATCHING_ROWS)?;
            let means = floats(batch, MEAN_SIMILARITY)?;
            let prioritized = counts(batch, PRIORITIZED)?;
            for i in 0..batch.num_rows() {
                rows.push(MunicipalityRankingRow {
                    rank: rows.len() as u64 + 1,
                    territory_code: codes[i].clone(),
                    territory_name: names[i].clone(),
                    dept_code: dept_codes[i].clone(),
                    dept_name: dept_names[i].clone(),
                    recommendations: recommendations[i],
                    matching_rows: matching[i],
                    mean_similarity: means[i],
                    prioritized_recommendations: prioritized[i],
                });
            }
        }
        Ok(rows)
    }

    /// Per-department view of the municipal ranking: municipalities with
    /// mentions, their mean recommendation count and the extremes.
    pub async fn department_overview(
        &self,
        filter: &CompiledFilter,
    ) -> QueryResult<Vec<DepartmentOverviewRow>> {
        let ranking = self.municipal_ranking(filter, None).await?;
        Ok(fold_department_overview(ranking))
    }

    /// The `limit` recommendations with the most matching rows.
    pub async fn top_recommendations(
        &self,
        filter: &CompiledFilter,
        limit: usize,
    ) -> QueryResult<Vec<RecommendationFrequencyRow>> {
        let batches = self
            .sentences()
            .await?
            .filter(filter.predicate())?
            .aggregate(
                vec![col(c::RECOMMENDATION_CODE)],
                vec![
                    min(col(c::RECOMMENDATION_TEXT)).alias(TEXT),
                    min(col(c::RECOMMENDATION_TOPIC)).alias(TOPIC),
                    max(col(c::RECOMMENDATION_PRIORITY)).alias(PRIORITY),
                    count(lit(1i64)).alias(MATCHING_ROWS),
                    count_distinct(col(c::TERRITORY_CODE)).alias(TERRITORIES),
                    avg(col(c::SENTENCE_SIMILARITY)).alias(MEAN_SIMILARITY),
                ],
            )?
            .sort(vec![
                col(MATCHING_ROWS).sort(false, false),
                col(c::RECOMMENDATION_CODE).sort(true, false),
            ])?
            .limit(0, Some(limit))?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::RECOMMENDATION_CODE)?;
            let text = texts(batch, TEXT)?;
            let topics = strings(batch, TOPIC)?;
            let priorities = ints(batch, PRIORITY)?;
            let matching = counts(batch, MATCHING_ROWS)?;
            let territories = counts(batch, TERRITORIES)?;
            let means = floats(batch, MEAN_SIMILARITY)?;
            for i in 0..batch.num_rows() {
                rows.push(RecommendationFrequencyRow {
                    recommendation_code: codes[i].clone(),
                    recommendation_text: text[i].clone(),
                    recommendation_topic: topics[i].clone(),
                    prioritized: priorities[i] == Some(1),
                    matching_rows: matching[i],
                    territories: territories[i],
                    mean_similarity: means[i],
                });
            }
        }
        Ok(rows)
    }

    /// Territories mentioning one recommendation, most mentions first.
    pub async fn recommendation_territories(
        &self,
        filter: &CompiledFilter,
        recommendation: &str,
        limit: usize,
    ) -> QueryResult<Vec<RecommendationTerritoryRow>> {
        let kind = filter.territory_kind();
        let name_column = territory_name_column(kind);
        let batches = self
            .sentences()
            .await?
            .filter(
                filter
                    .predicate()
                    .and(col(c::RECOMMENDATION_CODE).eq(lit(recommendation))),
            )?
            .aggregate(
                territory_group(kind),
                vec![
                    count(lit(1i64)).alias(MATCHING_ROWS),
                    avg(col(c::SENTENCE_SIMILARITY)).alias(MEAN_SIMILARITY),
                    max(col(c::SENTENCE_SIMILARITY)).alias(MAX_SIMILARITY),
                ],
            )?
            .with_column(MEAN_SIMILARITY, rounded(MEAN_SIMILARITY))?
            .sort(vec![
                col(MATCHING_ROWS).sort(false, false),
                col(MEAN_SIMILARITY).sort(false, false),
                col(c::TERRITORY_CODE).sort(true, false),
                col(name_column).sort(true, false),
            ])?
            .limit(0, Some(limit))?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::TERRITORY_CODE)?;
            let names = texts(batch, name_column)?;
            let dept_names = texts(batch, c::DEPT_NAME)?;
            let matching = counts(batch, MATCHING_ROWS)?;
            let means = floats(batch, MEAN_SIMILARITY)?;
            let maxima = floats(batch, MAX_SIMILARITY)?;
            for i in 0..batch.num_rows() {
                rows.push(RecommendationTerritoryRow {
                    territory_code: codes[i].clone(),
                    territory_name: names[i].clone(),
                    dept_name: dept_names[i].clone(),
                    matching_rows: matching[i],
                    mean_similarity: means[i],
                    max_similarity: maxima[i],
                });
            }
        }
        Ok(rows)
    }

    /// One page of matching sentences, best match first.
    pub async fn sentence_matches(
        &self,
        filter: &CompiledFilter,
        scope: &DetailScope,
        page: ValidPage,
    ) -> QueryResult<Page<SentenceMatch>> {
        let matching = self
            .sentences()
            .await?
            .filter(filter.predicate().and(scope.predicate()))?;
        let total_rows = matching.clone().count().await?;
        let batches = matching
            .sort(vec![
                col(c::SENTENCE_SIMILARITY).sort(false, false),
                col(c::TERRITORY_CODE).sort(true, false),
                col(c::RECOMMENDATION_CODE).sort(true, false),
                col(c::SENTENCE_ID).sort(true, false),
            ])?
            .limit(page.offset(), Some(page.page_size))?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(sentence_rows(batch)?);
        }
        Ok(Page::new(page, total_rows, rows))
    }

    /// One page of matching paragraphs with their sentence statistics.
    pub async fn paragraph_matches(
        &self,
        filter: &CompiledFilter,
        scope: &DetailScope,
        page: ValidPage,
    ) -> QueryResult<Page<ParagraphMatch>> {
        let grouped = self
            .sentences()
            .await?
            .filter(filter.predicate().and(scope.predicate()))?
            .aggregate(
                vec![
                    col(c::TERRITORY_CODE),
                    col(c::RECOMMENDATION_CODE),
                    col(c::PARAGRAPH_ID),
                ],
                vec![
                    min(col(c::DEPT_NAME)).alias(DEPT),
                    min(col(c::MPIO_NAME)).alias(MPIO),
                    min(col(c::PARAGRAPH_TEXT)).alias(PARAGRAPH),
                    min(col(c::PAGE_NUMBER)).alias(PAGE),
                    max(col(c::PARAGRAPH_SIMILARITY)).alias(PARAGRAPH_SCORE),
                    count(lit(1i64)).alias(SENTENCES),
                    avg(col(c::SENTENCE_SIMILARITY)).alias(MEAN_SIMILARITY),
                    max(col(c::SENTENCE_SIMILARITY)).alias(MAX_SIMILARITY),
                ],
            )?;
        let total_rows = grouped.clone().count().await?;
        let batches = grouped
            .sort(vec![
                col(MAX_SIMILARITY).sort(false, false),
                col(c::TERRITORY_CODE).sort(true, false),
                col(c::RECOMMENDATION_CODE).sort(true, false),
                col(c::PARAGRAPH_ID).sort(true, false),
            ])?
            .limit(page.offset(), Some(page.page_size))?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::TERRITORY_CODE)?;
            let recommendations = texts(batch, c::RECOMMENDATION_CODE)?;
            let paragraphs = texts(batch, c::PARAGRAPH_ID)?;
            let depts = texts(batch, DEPT)?;
            let mpios = strings(batch, MPIO)?;
            let paragraph_text = strings(batch, PARAGRAPH)?;
            let pages = ints(batch, PAGE)?;
            let scores = floats(batch, PARAGRAPH_SCORE)?;
            let sentences = counts(batch, SENTENCES)?;
            let means = floats(batch, MEAN_SIMILARITY)?;
            let maxima = floats(batch, MAX_SIMILARITY)?;
            for i in 0..batch.num_rows() {
                rows.push(ParagraphMatch {
                    territory_code: codes[i].clone(),
                    dept_name: depts[i].clone(),
                    mpio_name: mpios[i].clone(),
                    recommendation_code: recommendations[i].clone(),
                    paragraph_id: paragraphs[i].clone(),
                    paragraph_text: paragraph_text[i].clone(),
                    page_number: pages[i],
                    paragraph_similarity: scores[i],
                    sentences: sentences[i],
                    mean_sentence_similarity: means[i],
                    max_sentence_similarity: maxima[i],
                });
            }
        }
        Ok(Page::new(page, total_rows, rows))
    }

    /// Every recommendation in the snapshot, code ascending.
    pub async fn recommendation_catalog(&self) -> QueryResult<Vec<RecommendationCatalogEntry>> {
        let batches = self
            .sentences()
            .await?
            .aggregate(
                vec![col(c::RECOMMENDATION_CODE)],
                vec![
                    min(col(c::RECOMMENDATION_TEXT)).alias(TEXT),
                    min(col(c::RECOMMENDATION_TOPIC)).alias(TOPIC),
                    max(col(c::RECOMMENDATION_PRIORITY)).alias(PRIORITY),
                ],
            )?
            .sort(vec![col(c::RECOMMENDATION_CODE).sort(true, false)])?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::RECOMMENDATION_CODE)?;
            let text = texts(batch, TEXT)?;
            let topics = strings(batch, TOPIC)?;
            let priorities = ints(batch, PRIORITY)?;
            for i in 0..batch.num_rows() {
                rows.push(RecommendationCatalogEntry {
                    code: codes[i].clone(),
                    text: text[i].clone(),
                    topic: topics[i].clone(),
                    prioritized: priorities[i] == Some(1),
                });
            }
        }
        Ok(rows)
    }

    /// Distinct municipalities ordered by department then name.
    pub async fn municipalities(&self) -> QueryResult<Vec<MunicipalityEntry>> {
        let batches = self
            .sentences()
            .await?
            .filter(col(c::TERRITORY_KIND).eq(lit(TerritoryKind::Municipality.as_label())))?
            .select_columns(&[c::MPIO_CODE, c::MPIO_NAME, c::DEPT_CODE, c::DEPT_NAME])?
            .distinct()?
            .sort(vec![
                col(c::DEPT_NAME).sort(true, false),
                col(c::MPIO_NAME).sort(true, false),
                col(c::MPIO_CODE).sort(true, false),
            ])?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::MPIO_CODE)?;
            let names = texts(batch, c::MPIO_NAME)?;
            let dept_codes = texts(batch, c::DEPT_CODE)?;
            let dept_names = texts(batch, c::DEPT_NAME)?;
            for i in 0..batch.num_rows() {
                rows.push(MunicipalityEntry {
                    mpio_code: codes[i].clone(),
                    mpio_name: names[i].clone(),
                    dept_code: dept_codes[i].clone(),
                    dept_name: dept_names[i].clone(),
                });
            }
        }
        Ok(rows)
    }

    /// Distinct departments ordered by name.
    pub async fn departments(&self) -> QueryResult<Vec<DepartmentEntry>> {
        let batches = self
            .sentences()
            .await?
            .select_columns(&[c::DEPT_CODE, c::DEPT_NAME])?
            .distinct()?
            .sort(vec![
                col(c::DEPT_NAME).sort(true, false),
                col(c::DEPT_CODE).sort(true, false),
            ])?
            .collect()
            .await?;

        let mut rows = Vec::new();
        for batch in &batches {
            let codes = texts(batch, c::DEPT_CODE)?;
            let names = texts(batch, c::DEPT_NAME)?;
            for i in 0..batch.num_rows() {
                rows.push(DepartmentEntry {
                    dept_code: codes[i].clone(),
                    dept_name: names[i].clone(),
                });
            }
        }
        Ok(rows)
    }
}

/// Equal groups must compare equal whatever order the engine summed them in.
fn rounded(column: &str) -> Expr {
    round(vec![col(column), lit(MEAN_DECIMALS)])
}

fn sentence_rows(batch: &RecordBatch) -> QueryResult<Vec<SentenceMatch>> {
    let codes = texts(batch, c::TERRITORY_CODE)?;
    let depts = texts(batch, c::DEPT_NAME)?;
    let mpios = strings(batch, c::MPIO_NAME)?;
    let recommendations = texts(batch, c::RECOMMENDATION_CODE)?;
    let recommendation_text = texts(batch, c::RECOMMENDATION_TEXT)?;
    let paragraphs = texts(batch, c::PARAGRAPH_ID)?;
    let sentence_ids = texts(batch, c::SENTENCE_ID)?;
    let ordinals = ints(batch, c::SENTENCE_ORDINAL)?;
    let sentence_text = texts(batch, c::SENTENCE_TEXT)?;
    let similarities = floats(batch, c::SENTENCE_SIMILARITY)?;
    let pages = ints(batch, c::PAGE_NUMBER)?;
    let classes = strings(batch, c::PREDICTED_CLASS)?;
    let confidences = floats(batch, c::PREDICTION_CONFIDENCE)?;

    Ok((0..batch.num_rows())
        .map(|i| SentenceMatch {
            territory_code: codes[i].clone(),
            dept_name: depts[i].clone(),
            mpio_name: mpios[i].clone(),
            recommendation_code: recommendations[i].clone(),
            recommendation_text: recommendation_text[i].clone(),
            paragraph_id: paragraphs[i].clone(),
            sentence_id: sentence_ids[i].clone(),
            sentence_ordinal: ordinals[i],
            sentence_text: sentence_text[i].clone(),
            sentence_similarity: similarities[i].unwrap_or_default(),
            page_number: pages[i],
            predicted_class: classes[i].clone(),
            prediction_confidence: confidences[i],
        })
        .collect())
}

/// Folds a ranking into per-department statistics over territories with at
/// least one recommendation. Extremes break ties by territory code.
pub fn fold_department_overview(ranking: Vec<MunicipalityRankingRow>) -> Vec<DepartmentOverviewRow> {
    let mut by_department: BTreeMap<(String, String), Vec<MunicipalityRankingRow>> =
        BTreeMap::new();
    for row in ranking.into_iter().filter(|row| row.recommendations > 0) {
        by_department
            .entry((row.dept_code.clone(), row.dept_name.clone()))
            .or_default()
            .push(row);
    }

    let mut overview: Vec<DepartmentOverviewRow> = by_department
        .into_iter()
        .filter_map(|((dept_code, dept_name), rows)| {
            let fewest = rows.iter().min_by(|a, b| {
                a.recommendations
                    .cmp(&b.recommendations)
                    .then_with(|| a.territory_code.cmp(&b.territory_code))
            })?;
            let most = rows.iter().min_by(|a, b| {
                b.recommendations
                    .cmp(&a.recommendations)
                    .then_with(|| a.territory_code.cmp(&b.territory_code))
            })?;
            let total: u64 = rows.iter().map(|row| row.recommendations).sum();
            Some(DepartmentOverviewRow {
                municipalities_with_mentions: rows.len() as u64,
                mean_recommendations: total as f64 / rows.len() as f64,
                fewest: territory_count(fewest),
                most: territory_count(most),
                dept_code,
                dept_name,
            })
        })
        .collect();
    overview.sort_by(|a, b| {
        b.mean_recommendations
            .partial_cmp(&a.mean_recommendations)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.dept_code.cmp(&b.dept_code))
    });
    overview
}

fn territory_count(row: &MunicipalityRankingRow) -> TerritoryCount {
    TerritoryCount {
        territory_code: row.territory_code.clone(),
        territory_name: row.territory_name.clone(),
        recommendations: row.recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(code: &str, dept: &str, recommendations: u64) -> MunicipalityRankingRow {
        MunicipalityRankingRow {
            rank: 0,
            territory_code: code.to_string(),
            territory_name: format!("m{code}"),
            dept_code: dept.to_string(),
            dept_name: format!("d{dept}"),
            recommendations,
            matching_rows: recommendations * 2,
            mean_similarity: (recommendations > 0).then_some(0.7),
            prioritized_recommendations: 0,
        }
    }

    #[test]
    fn overview_skips_silent_municipalities_and_breaks_ties_by_code() {
        let overview = fold_department_overview(vec![
            ranked("05088", "05", 4),
            ranked("05001", "05", 4),
            ranked("05002", "05", 1),
            ranked("52001", "52", 3),
            ranked("52835", "52", 0),
        ]);
        assert_eq!(overview.len(), 2);

        let antioquia = &overview[0];
        assert_eq!(antioquia.dept_code, "05");
        assert_eq!(antioquia.municipalities_with_mentions, 3);
        assert_eq!(antioquia.most.territory_code, "05001");
        assert_eq!(antioquia.fewest.territory_code, "05002");
        assert!((antioquia.mean_recommendations - 3.0).abs() < 1e-9);

        let narino = &overview[1];
        assert_eq!(narino.municipalities_with_mentions, 1);
        assert_eq!(narino.fewest, narino.most);
    }

    #[test]
    fn detail_scope_requires_a_restriction_and_pads_codes() {
        assert!(DetailScope::default()
            .validate(TerritoryKind::Municipality)
            .expect_err("empty scope")
            .is_rejection());
        assert!(DetailScope::territory("  ")
            .validate(TerritoryKind::Municipality)
            .is_err());

        let scope = DetailScope::territory("5001")
            .and_recommendation(" MCV1 ")
            .validate(TerritoryKind::Municipality)
            .expect("valid scope");
        assert_eq!(scope.territory_code.as_deref(), Some("05001"));
        assert_eq!(scope.recommendation.as_deref(), Some("MCV1"));

        let department = DetailScope::territory("5")
            .validate(TerritoryKind::Department)
            .expect("valid scope");
        assert_eq!(department.territory_code.as_deref(), Some("05"));
    }

    #[test]
    fn query_names_round_trip() {
        for name in QueryName::ALL {
            assert_eq!(name.as_str().parse::<QueryName>().expect("known"), name);
        }
        assert!("drop_table".parse::<QueryName>().is_err());
    }
}
