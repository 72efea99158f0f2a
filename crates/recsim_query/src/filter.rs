//! Filter-to-predicate compiler.
//!
//! A [`FilterConfig`] is what a view collects from its controls. It is
//! validated exactly once into a [`ValidFilter`]; only a `ValidFilter` can be
//! compiled, so every query in the catalogue receives bounds-checked input.
//!
//! The compiled predicate is split in two groups of clauses:
//! - *scope* clauses decide which territories take part (kind, geography,
//!   socioeconomic attributes);
//! - *match* clauses decide which rows count as a mention (threshold,
//!   policy-only classification).
//!
//! Queries that must report territories with zero mentions aggregate over the
//! scope and count matches conditionally; all other queries apply the
//! conjunction of both groups.

use std::collections::BTreeSet;
use std::str::FromStr;

use datafusion::logical_expr::{col, lit, Expr};
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};
use crate::schema::{
    columns, TerritoryKind, POLICY_EXCLUDED_LABEL, POLICY_EXCLUSION_CONFIDENCE,
    POLICY_INCLUDED_LABEL,
};

/// Default minimum sentence similarity.
pub const DEFAULT_THRESHOLD: f64 = 0.65;
/// Lowest accepted similarity threshold.
pub const MIN_THRESHOLD: f64 = 0.5;
/// Highest accepted similarity threshold.
pub const MAX_THRESHOLD: f64 = 1.0;
/// Bounds of the poverty index; the full range means "no restriction".
pub const POVERTY_INDEX_BOUNDS: (f64, f64) = (0.0, 100.0);

/// Development-program participation filter (tri-state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramFilter {
    /// No restriction.
    #[default]
    Any,
    OnlyParticipating,
    OnlyNonParticipating,
}

impl FromStr for ProgramFilter {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "any" | "all" | "todos" => Ok(Self::Any),
            "only" | "participating" | "only_participating" | "solo pdet" => {
                Ok(Self::OnlyParticipating)
            }
            "exclude" | "non_participating" | "only_non_participating" | "solo no pdet" => {
                Ok(Self::OnlyNonParticipating)
            }
            other => Err(format!("unknown program filter '{other}'")),
        }
    }
}

/// Closed poverty-index interval; the default full range means "no restriction".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PovertyRange {
    pub min: f64,
    pub max: f64,
}

impl Default for PovertyRange {
    fn default() -> Self {
        Self {
            min: POVERTY_INDEX_BOUNDS.0,
            max: POVERTY_INDEX_BOUNDS.1,
        }
    }
}

impl PovertyRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `true` when the range covers every possible index value.
    pub fn is_unrestricted(&self) -> bool {
        self.min <= POVERTY_INDEX_BOUNDS.0 && self.max >= POVERTY_INDEX_BOUNDS.1
    }
}

/// Filter options collected from a view. Every field has a "no restriction" sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum sentence similarity, in `[0.5, 1.0]`.
    pub threshold: f64,
    pub territory_kind: TerritoryKind,
    /// Exact department name; `None`, blank or `Todos` means any.
    pub department: Option<String>,
    /// Exact municipality name; only applied to municipality rows.
    pub municipality: Option<String>,
    /// Keep only sentences classified as public-policy content.
    pub policy_only: bool,
    pub program: ProgramFilter,
    /// Allowed conflict-incidence categories; empty means any.
    pub conflict_categories: BTreeSet<String>,
    pub poverty_range: PovertyRange,
    /// Allowed capacity groups; empty means any.
    pub capacity_groups: BTreeSet<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            territory_kind: TerritoryKind::Municipality,
            department: None,
            municipality: None,
            policy_only: true,
            program: ProgramFilter::Any,
            conflict_categories: BTreeSet::new(),
            poverty_range: PovertyRange::default(),
            capacity_groups: BTreeSet::new(),
        }
    }
}

impl FilterConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_kind(mut self, kind: TerritoryKind) -> Self {
        self.territory_kind = kind;
        self
    }

    pub fn in_department(mut self, name: impl Into<String>) -> Self {
        self.department = Some(name.into());
        self
    }

    pub fn in_municipality(mut self, name: impl Into<String>) -> Self {
        self.municipality = Some(name.into());
        self
    }

    pub fn with_policy_only(mut self, policy_only: bool) -> Self {
        self.policy_only = policy_only;
        self
    }

    pub fn with_program(mut self, program: ProgramFilter) -> Self {
        self.program = program;
        self
    }

    pub fn with_conflict_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poverty_range(mut self, min: f64, max: f64) -> Self {
        self.poverty_range = PovertyRange::new(min, max);
        self
    }

    pub fn with_capacity_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capacity_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Checks bounds and canonicalizes sentinels.
    pub fn validate(self) -> QueryResult<ValidFilter> {
        if !self.threshold.is_finite()
            || self.threshold < MIN_THRESHOLD
            || self.threshold > MAX_THRESHOLD
        {
            return Err(QueryError::invalid(format!(
                "similarity threshold {} outside [{MIN_THRESHOLD}, {MAX_THRESHOLD}]",
                self.threshold
            )));
        }
        let PovertyRange { min, max } = self.poverty_range;
        if !min.is_finite()
            || !max.is_finite()
            || min < POVERTY_INDEX_BOUNDS.0
            || max > POVERTY_INDEX_BOUNDS.1
            || min > max
        {
            return Err(QueryError::invalid(format!(
                "poverty index range [{min}, {max}] must satisfy {} <= min <= max <= {}",
                POVERTY_INDEX_BOUNDS.0, POVERTY_INDEX_BOUNDS.1
            )));
        }

        Ok(ValidFilter(Self {
            department: normalize_name(self.department),
            municipality: normalize_name(self.municipality),
            conflict_categories: normalize_set(self.conflict_categories),
            capacity_groups: normalize_set(self.capacity_groups),
            ..self
        }))
    }
}

fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("todos"))
}

fn normalize_set(values: BTreeSet<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// A bounds-checked filter. Construct with [`FilterConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidFilter(FilterConfig);

impl ValidFilter {
    pub fn config(&self) -> &FilterConfig {
        &self.0
    }

    pub fn threshold(&self) -> f64 {
        self.0.threshold
    }

    pub fn territory_kind(&self) -> TerritoryKind {
        self.0.territory_kind
    }

    /// Same filter restricted to another territory kind.
    pub fn for_kind(&self, kind: TerritoryKind) -> Self {
        Self(FilterConfig {
            territory_kind: kind,
            ..self.0.clone()
        })
    }

    pub fn compile(&self) -> CompiledFilter {
        let config = &self.0;
        let kind = config.territory_kind;
        let mut scope = vec![Clause::new(
            columns::TERRITORY_KIND,
            col(columns::TERRITORY_KIND).eq(lit(kind.as_label())),
        )];

        if let Some(department) = &config.department {
            scope.push(Clause::new(
                columns::DEPT_NAME,
                col(columns::DEPT_NAME).eq(lit(department.as_str())),
            ));
        }

        // Decision: municipality-only options are inert for department rows.
        if kind == TerritoryKind::Municipality {
            if let Some(municipality) = &config.municipality {
                scope.push(Clause::new(
                    columns::MPIO_NAME,
                    col(columns::MPIO_NAME).eq(lit(municipality.as_str())),
                ));
            }
            match config.program {
                ProgramFilter::Any => {}
                ProgramFilter::OnlyParticipating => scope.push(Clause::new(
                    columns::PDET,
                    col(columns::PDET).eq(lit(1i64)),
                )),
                ProgramFilter::OnlyNonParticipating => scope.push(Clause::new(
                    columns::PDET,
                    col(columns::PDET).eq(lit(0i64)),
                )),
            }
            if !config.conflict_categories.is_empty() {
                scope.push(Clause::new(
                    columns::CONFLICT_CATEGORY,
                    col(columns::CONFLICT_CATEGORY).in_list(
                        config
                            .conflict_categories
                            .iter()
                            .map(|category| lit(category.as_str()))
                            .collect(),
                        false,
                    ),
                ));
            }
            if !config.poverty_range.is_unrestricted() {
                scope.push(Clause::new(
                    columns::POVERTY_INDEX,
                    col(columns::POVERTY_INDEX).between(
                        lit(config.poverty_range.min),
                        lit(config.poverty_range.max),
                    ),
                ));
            }
            if !config.capacity_groups.is_empty() {
                scope.push(Clause::new(
                    columns::CAPACITY_GROUP,
                    col(columns::CAPACITY_GROUP).in_list(
                        config
                            .capacity_groups
                            .iter()
                            .map(|group| lit(group.as_str()))
                            .collect(),
                        false,
                    ),
                ));
            }
        }

        let mut matching = vec![Clause::new(
            columns::SENTENCE_SIMILARITY,
            col(columns::SENTENCE_SIMILARITY).gt_eq(lit(config.threshold)),
        )];
        if config.policy_only {
            matching.push(Clause {
                columns: vec![columns::PREDICTED_CLASS, columns::PREDICTION_CONFIDENCE],
                expr: policy_content_expr(),
            });
        }

        CompiledFilter {
            kind,
            scope,
            matching,
        }
    }
}

/// Included sentences, plus exclusions the classifier was unsure about.
/// Unclassified rows (including snapshots without the classification
/// column) are kept.
fn policy_content_expr() -> Expr {
    col(columns::PREDICTED_CLASS)
        .is_null()
        .or(col(columns::PREDICTED_CLASS).eq(lit(POLICY_INCLUDED_LABEL)))
        .or(col(columns::PREDICTED_CLASS)
            .eq(lit(POLICY_EXCLUDED_LABEL))
            .and(col(columns::PREDICTION_CONFIDENCE).lt(lit(POLICY_EXCLUSION_CONFIDENCE))))
}

/// One conjunct of a compiled predicate plus the columns it reads.
#[derive(Debug, Clone)]
pub struct Clause {
    columns: Vec<&'static str>,
    expr: Expr,
}

impl Clause {
    fn new(column: &'static str, expr: Expr) -> Self {
        Self {
            columns: vec![column],
            expr,
        }
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

/// Compiled predicate shared by every aggregate query.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    kind: TerritoryKind,
    scope: Vec<Clause>,
    matching: Vec<Clause>,
}

impl CompiledFilter {
    pub fn territory_kind(&self) -> TerritoryKind {
        self.kind
    }

    pub fn scope_clauses(&self) -> &[Clause] {
        &self.scope
    }

    pub fn match_clauses(&self) -> &[Clause] {
        &self.matching
    }

    /// Conjunction of the scope clauses.
    pub fn scope_predicate(&self) -> Expr {
        conjunction(&self.scope)
    }

    /// Conjunction of the match clauses.
    pub fn match_predicate(&self) -> Expr {
        conjunction(&self.matching)
    }

    /// Full predicate: scope and match.
    pub fn predicate(&self) -> Expr {
        self.scope_predicate().and(self.match_predicate())
    }

    /// Every view column referenced by the predicate.
    pub fn referenced_columns(&self) -> BTreeSet<&'static str> {
        self.scope
            .iter()
            .chain(self.matching.iter())
            .flat_map(|clause| clause.columns.iter().copied())
            .collect()
    }
}

fn conjunction(clauses: &[Clause]) -> Expr {
    clauses
        .iter()
        .map(|clause| clause.expr.clone())
        .reduce(Expr::and)
        // Both groups always carry at least one clause (kind / threshold).
        .unwrap_or_else(|| lit(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SOCIOECONOMIC_COLUMNS;

    fn socio_heavy() -> FilterConfig {
        FilterConfig::default()
            .with_program(ProgramFilter::OnlyParticipating)
            .with_conflict_categories(["Alto", "Muy Alto"])
            .with_poverty_range(20.0, 80.0)
            .with_capacity_groups(["G1"])
            .in_municipality("Medellín")
    }

    #[test]
    fn default_filter_compiles_only_kind_threshold_and_policy() {
        let compiled = FilterConfig::default().validate().expect("valid").compile();
        assert_eq!(compiled.scope_clauses().len(), 1);
        assert_eq!(compiled.match_clauses().len(), 2);
        let referenced = compiled.referenced_columns();
        for column in SOCIOECONOMIC_COLUMNS {
            assert!(!referenced.contains(column), "{column} must be omitted");
        }
        assert!(!referenced.contains(columns::DEPT_NAME));
    }

    #[test]
    fn sentinel_values_produce_no_clause() {
        let compiled = FilterConfig::default()
            .with_program(ProgramFilter::Any)
            .with_poverty_range(0.0, 100.0)
            .with_conflict_categories(Vec::<String>::new())
            .in_department("Todos")
            .in_municipality("  ")
            .with_policy_only(false)
            .validate()
            .expect("valid")
            .compile();
        assert_eq!(compiled.scope_clauses().len(), 1);
        assert_eq!(compiled.match_clauses().len(), 1);
    }

    #[test]
    fn municipality_filters_compile_for_municipality_kind() {
        let compiled = socio_heavy().validate().expect("valid").compile();
        let referenced = compiled.referenced_columns();
        for column in SOCIOECONOMIC_COLUMNS {
            assert!(referenced.contains(column), "{column} should be referenced");
        }
        assert!(referenced.contains(columns::MPIO_NAME));
    }

    #[test]
    fn department_kind_never_references_socioeconomic_columns() {
        let configs = [
            socio_heavy(),
            socio_heavy().with_program(ProgramFilter::OnlyNonParticipating),
            socio_heavy().in_department("Antioquia").with_threshold(0.9),
            FilterConfig::default().with_poverty_range(10.0, 10.0),
        ];
        for config in configs {
            let compiled = config
                .with_kind(TerritoryKind::Department)
                .validate()
                .expect("valid")
                .compile();
            let referenced = compiled.referenced_columns();
            for column in SOCIOECONOMIC_COLUMNS {
                assert!(!referenced.contains(column), "{column} leaked into department predicate");
            }
            assert!(!referenced.contains(columns::MPIO_NAME));
        }
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        for threshold in [1.01, 0.49, f64::NAN, f64::INFINITY] {
            let err = FilterConfig::default()
                .with_threshold(threshold)
                .validate()
                .expect_err("threshold must be rejected");
            assert!(err.is_rejection());
        }
        for threshold in [0.5, 0.65, 1.0] {
            assert!(FilterConfig::default().with_threshold(threshold).validate().is_ok());
        }
    }

    #[test]
    fn rejects_inverted_or_out_of_bounds_poverty_ranges() {
        for (min, max) in [(60.0, 40.0), (-1.0, 50.0), (0.0, 100.5), (f64::NAN, 10.0)] {
            assert!(FilterConfig::default()
                .with_poverty_range(min, max)
                .validate()
                .is_err());
        }
    }

    #[test]
    fn validation_canonicalizes_names_and_sets() {
        let valid = FilterConfig::default()
            .in_department("  Antioquia ")
            .with_capacity_groups([" G2 ", ""])
            .validate()
            .expect("valid");
        assert_eq!(valid.config().department.as_deref(), Some("Antioquia"));
        assert_eq!(
            valid.config().capacity_groups.iter().collect::<Vec<_>>(),
            vec!["G2"]
        );
    }

    #[test]
    fn for_kind_keeps_other_options() {
        let valid = socio_heavy().validate().expect("valid");
        let department = valid.for_kind(TerritoryKind::Department);
        assert_eq!(department.territory_kind(), TerritoryKind::Department);
        assert_eq!(department.threshold(), valid.threshold());
        assert_eq!(department.config().program, ProgramFilter::OnlyParticipating);
    }

    #[test]
    fn parses_program_filter_labels() {
        assert_eq!("Solo PDET".parse::<ProgramFilter>(), Ok(ProgramFilter::OnlyParticipating));
        assert_eq!("exclude".parse::<ProgramFilter>(), Ok(ProgramFilter::OnlyNonParticipating));
        assert_eq!("Todos".parse::<ProgramFilter>(), Ok(ProgramFilter::Any));
        assert!("sometimes".parse::<ProgramFilter>().is_err());
    }
}
