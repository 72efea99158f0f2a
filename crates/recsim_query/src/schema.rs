//! Canonical relation layout and the raw-snapshot → `sentences` view mapping.
//!
//! Snapshots come from more than one export pipeline: column types drift
//! (codes stored as integers, categorical columns int-encoded by the
//! compression tooling) and the territory-kind column may be absent. Every
//! query in this crate reads the normalized `sentences` view built here, never
//! the raw table.

use std::fmt;
use std::str::FromStr;

use datafusion::arrow::datatypes::{DataType, Schema};
use serde::{Deserialize, Serialize};

/// Name under which the raw Parquet file is registered.
pub const RAW_TABLE: &str = "raw_snapshot";
/// Name of the normalized view every query reads.
pub const SENTENCES_VIEW: &str = "sentences";

/// Classification label for sentences kept as public-policy content.
pub const POLICY_INCLUDED_LABEL: &str = "Incluida";
/// Classification label for sentences the model excluded.
pub const POLICY_EXCLUDED_LABEL: &str = "Excluida";
/// Exclusions below this confidence are still treated as policy content.
pub const POLICY_EXCLUSION_CONFIDENCE: f64 = 0.8;

/// Width of zero-padded department codes.
pub const DEPARTMENT_CODE_WIDTH: usize = 2;
/// Width of zero-padded municipality codes.
pub const MUNICIPALITY_CODE_WIDTH: usize = 5;

/// Canonical column names of the `sentences` view.
pub mod columns {
    pub const TERRITORY_KIND: &str = "territory_kind";
    pub const TERRITORY_CODE: &str = "territory_code";
    pub const DEPT_CODE: &str = "dept_code";
    pub const DEPT_NAME: &str = "dept_name";
    pub const MPIO_CODE: &str = "mpio_code";
    pub const MPIO_NAME: &str = "mpio_name";
    pub const RECOMMENDATION_CODE: &str = "recommendation_code";
    pub const RECOMMENDATION_TEXT: &str = "recommendation_text";
    pub const RECOMMENDATION_TOPIC: &str = "recommendation_topic";
    pub const RECOMMENDATION_PRIORITY: &str = "recommendation_priority";
    pub const SENTENCE_ID: &str = "sentence_id";
    pub const SENTENCE_ORDINAL: &str = "sentence_ordinal";
    pub const SENTENCE_TEXT: &str = "sentence_text";
    pub const SENTENCE_SIMILARITY: &str = "sentence_similarity";
    pub const PARAGRAPH_ID: &str = "paragraph_id";
    pub const PARAGRAPH_TEXT: &str = "paragraph_text";
    pub const PARAGRAPH_SIMILARITY: &str = "paragraph_similarity";
    pub const PAGE_NUMBER: &str = "page_number";
    pub const PREDICTED_CLASS: &str = "predicted_class";
    pub const PREDICTION_CONFIDENCE: &str = "prediction_confidence";
    pub const PDET: &str = "pdet";
    pub const CONFLICT_CATEGORY: &str = "conflict_category";
    pub const POVERTY_INDEX: &str = "poverty_index";
    pub const CAPACITY_GROUP: &str = "capacity_group";
}

/// Municipality-only attributes; always NULL on department rows.
pub const SOCIOECONOMIC_COLUMNS: [&str; 4] = [
    columns::PDET,
    columns::CONFLICT_CATEGORY,
    columns::POVERTY_INDEX,
    columns::CAPACITY_GROUP,
];

/// Territory discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerritoryKind {
    #[default]
    Municipality,
    Department,
}

impl TerritoryKind {
    /// Value stored in the `territory_kind` view column.
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Municipality => "municipality",
            Self::Department => "department",
        }
    }

    /// Width of codes identifying territories of this kind.
    pub fn code_width(self) -> usize {
        match self {
            Self::Municipality => MUNICIPALITY_CODE_WIDTH,
            Self::Department => DEPARTMENT_CODE_WIDTH,
        }
    }
}

impl fmt::Display for TerritoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TerritoryKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "municipality" | "municipio" | "mpio" => Ok(Self::Municipality),
            "department" | "departamento" | "dpto" => Ok(Self::Department),
            other => Err(format!("unknown territory kind '{other}'")),
        }
    }
}

/// Left-pads a territory code with zeros to `width` characters.
///
/// Codes exported as numbers lose their leading zero (`5001` for Medellín);
/// the geometry companion file keys on the padded form.
pub fn pad_code(raw: &str, width: usize) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    format!("{trimmed:0>width$}")
}

/// How a raw column is normalized into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Text,
    Code(usize),
    Float,
    Integer,
    PredictedClass,
    ConflictCategory,
    CapacityGroup,
}

#[derive(Debug, Clone, Copy)]
struct RawColumn {
    raw: &'static str,
    canonical: &'static str,
    required: bool,
    shape: Shape,
}

const fn raw(raw: &'static str, canonical: &'static str, required: bool, shape: Shape) -> RawColumn {
    RawColumn {
        raw,
        canonical,
        required,
        shape,
    }
}

const RAW_TERRITORY_KIND: &str = "tipo_territorio";
const RAW_MPIO_CODE: &str = "mpio_cdpmp";

const RAW_COLUMNS: [RawColumn; 22] = [
    raw("dpto_cdpmp", columns::DEPT_CODE, true, Shape::Code(DEPARTMENT_CODE_WIDTH)),
    raw("dpto", columns::DEPT_NAME, true, Shape::Text),
    raw(RAW_MPIO_CODE, columns::MPIO_CODE, true, Shape::Code(MUNICIPALITY_CODE_WIDTH)),
    raw("mpio", columns::MPIO_NAME, true, Shape::Text),
    raw("recommendation_code", columns::RECOMMENDATION_CODE, true, Shape::Text),
    raw("recommendation_text", columns::RECOMMENDATION_TEXT, true, Shape::Text),
    raw("recommendation_topic", columns::RECOMMENDATION_TOPIC, false, Shape::Text),
    raw("recommendation_priority", columns::RECOMMENDATION_PRIORITY, false, Shape::Integer),
    raw("sentence_id", columns::SENTENCE_ID, true, Shape::Text),
    raw("sentence_id_paragraph", columns::SENTENCE_ORDINAL, false, Shape::Integer),
    raw("sentence_text", columns::SENTENCE_TEXT, true, Shape::Text),
    raw("sentence_similarity", columns::SENTENCE_SIMILARITY, true, Shape::Float),
    raw("paragraph_id", columns::PARAGRAPH_ID, true, Shape::Text),
    raw("paragraph_text", columns::PARAGRAPH_TEXT, false, Shape::Text),
    raw("paragraph_similarity", columns::PARAGRAPH_SIMILARITY, false, Shape::Float),
    raw("page_number", columns::PAGE_NUMBER, false, Shape::Integer),
    raw("predicted_class", columns::PREDICTED_CLASS, false, Shape::PredictedClass),
    raw("prediction_confidence", columns::PREDICTION_CONFIDENCE, false, Shape::Float),
    raw("PDET", columns::PDET, false, Shape::Integer),
    raw("Cat_IICA", columns::CONFLICT_CATEGORY, false, Shape::ConflictCategory),
    raw("IPM_2018", columns::POVERTY_INDEX, false, Shape::Float),
    raw("Grupo_MDM", columns::CAPACITY_GROUP, false, Shape::CapacityGroup),
];

/// Where the territory-kind discriminator comes from for a given snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindSource {
    /// Text labels (`Municipio` / `Departamento`), with fallback for unknown values.
    Labelled,
    /// Int-encoded labels (1 / 0), with fallback for unknown values.
    Encoded,
    /// Column absent; inferred from socioeconomic-column presence.
    Inferred,
}

/// Outcome of mapping a raw schema onto the canonical view.
#[derive(Debug, Clone)]
pub struct ViewPlan {
    /// `CREATE VIEW` statement for [`SENTENCES_VIEW`].
    pub sql: String,
    /// Optional raw columns absent from the snapshot (surfaced as NULLs).
    pub missing_optional: Vec<&'static str>,
    pub kind_source: KindSource,
}

/// Builds the normalized view for `schema`, or returns the missing required columns.
pub fn plan_sentences_view(schema: &Schema) -> Result<ViewPlan, Vec<&'static str>> {
    let missing_required: Vec<&'static str> = RAW_COLUMNS
        .iter()
        .filter(|column| column.required && schema.field_with_name(column.raw).is_err())
        .map(|column| column.raw)
        .collect();
    if !missing_required.is_empty() {
        return Err(missing_required);
    }

    let mut missing_optional = Vec::new();
    let mut inner = Vec::with_capacity(RAW_COLUMNS.len() + 1);
    for column in RAW_COLUMNS.iter() {
        let expr = match schema.field_with_name(column.raw) {
            Ok(field) => normalize_expr(column.raw, field.data_type(), column.shape),
            Err(_) => {
                missing_optional.push(column.raw);
                null_expr(column.shape).to_string()
            }
        };
        inner.push(format!("{expr} AS {}", column.canonical));
    }

    let (kind_expr, kind_source) = territory_kind_expr(schema);
    if kind_source == KindSource::Inferred {
        missing_optional.push(RAW_TERRITORY_KIND);
    }
    inner.push(format!("{kind_expr} AS {}", columns::TERRITORY_KIND));

    let municipality = TerritoryKind::Municipality.as_label();
    let mut outer = vec![
        columns::TERRITORY_KIND.to_string(),
        format!(
            "CASE WHEN {kind} = '{municipality}' THEN {mpio} ELSE {dept} END AS {code}",
            kind = columns::TERRITORY_KIND,
            mpio = columns::MPIO_CODE,
            dept = columns::DEPT_CODE,
            code = columns::TERRITORY_CODE,
        ),
    ];
    for column in RAW_COLUMNS.iter() {
        if SOCIOECONOMIC_COLUMNS.contains(&column.canonical) {
            outer.push(format!(
                "CASE WHEN {kind} = '{municipality}' THEN {name} END AS {name}",
                kind = columns::TERRITORY_KIND,
                name = column.canonical,
            ));
        } else {
            outer.push(column.canonical.to_string());
        }
    }

    let sql = format!(
        "CREATE VIEW {SENTENCES_VIEW} AS SELECT {} FROM (SELECT {} FROM {RAW_TABLE}) AS normalized",
        outer.join(", "),
        inner.join(", "),
    );
    Ok(ViewPlan {
        sql,
        missing_optional,
        kind_source,
    })
}

fn quote(raw: &str) -> String {
    format!("\"{raw}\"")
}

fn null_expr(shape: Shape) -> &'static str {
    match shape {
        Shape::Float => "CAST(NULL AS DOUBLE)",
        Shape::Integer => "CAST(NULL AS BIGINT)",
        _ => "CAST(NULL AS VARCHAR)",
    }
}

fn text_expr(raw: &str) -> String {
    format!("trim(CAST({} AS VARCHAR))", quote(raw))
}

fn normalize_expr(raw: &str, data_type: &DataType, shape: Shape) -> String {
    let quoted = quote(raw);
    match shape {
        Shape::Text => format!("CAST({quoted} AS VARCHAR)"),
        Shape::Float => format!("CAST({quoted} AS DOUBLE)"),
        Shape::Integer => format!("CAST({quoted} AS BIGINT)"),
        Shape::Code(width) => {
            let digits = if data_type.is_integer() {
                format!("CAST({quoted} AS VARCHAR)")
            } else if data_type.is_floating() {
                format!("CAST(CAST({quoted} AS BIGINT) AS VARCHAR)")
            } else {
                format!("regexp_replace({}, '[.]0$', '')", text_expr(raw))
            };
            pad_code_expr(&digits, width)
        }
        Shape::PredictedClass => decode_or_trim(
            raw,
            data_type,
            &[(1, POLICY_INCLUDED_LABEL), (0, POLICY_EXCLUDED_LABEL)],
        ),
        Shape::ConflictCategory => decode_or_trim(
            raw,
            data_type,
            &[
                (4, "Muy Alto"),
                (3, "Alto"),
                (2, "Medio"),
                (1, "Medio Bajo"),
                (0, "Bajo"),
            ],
        ),
        Shape::CapacityGroup => decode_or_trim(
            raw,
            data_type,
            &[
                (0, "C"),
                (1, "G1"),
                (2, "G2"),
                (3, "G3"),
                (4, "G4"),
                (5, "G5"),
            ],
        ),
    }
}

/// SQL form of [`pad_code`]. `lpad` alone would truncate codes longer than
/// `width`, so those pass through unchanged.
fn pad_code_expr(digits: &str, width: usize) -> String {
    format!(
        "CASE WHEN character_length({digits}) >= {width} THEN {digits} \
         ELSE lpad({digits}, {width}, '0') END"
    )
}

/// Decodes int-encoded categorical columns; text columns are trimmed.
fn decode_or_trim(raw: &str, data_type: &DataType, labels: &[(i64, &str)]) -> String {
    if !data_type.is_integer() {
        return text_expr(raw);
    }
    let arms: Vec<String> = labels
        .iter()
        .map(|(code, label)| format!("WHEN {code} THEN '{label}'"))
        .collect();
    format!("CASE CAST({} AS BIGINT) {} END", quote(raw), arms.join(" "))
}

/// Territory-kind expression with the socioeconomic-presence fallback.
fn territory_kind_expr(schema: &Schema) -> (String, KindSource) {
    let municipality = TerritoryKind::Municipality.as_label();
    let department = TerritoryKind::Department.as_label();

    let present_socio: Vec<String> = RAW_COLUMNS
        .iter()
        .filter(|column| SOCIOECONOMIC_COLUMNS.contains(&column.canonical))
        .filter(|column| schema.field_with_name(column.raw).is_ok())
        .map(|column| format!("{} IS NOT NULL", quote(column.raw)))
        .collect();
    let presence = if present_socio.is_empty() {
        format!("{} IS NOT NULL", quote(RAW_MPIO_CODE))
    } else {
        present_socio.join(" OR ")
    };
    let fallback = format!("CASE WHEN {presence} THEN '{municipality}' ELSE '{department}' END");

    match schema.field_with_name(RAW_TERRITORY_KIND) {
        Ok(field) if field.data_type().is_integer() => {
            let raw = quote(RAW_TERRITORY_KIND);
            (
                format!(
                    "CASE WHEN CAST({raw} AS BIGINT) = 1 THEN '{municipality}' \
                     WHEN CAST({raw} AS BIGINT) = 0 THEN '{department}' ELSE {fallback} END"
                ),
                KindSource::Encoded,
            )
        }
        Ok(_) => {
            let label = format!("lower({})", text_expr(RAW_TERRITORY_KIND));
            (
                format!(
                    "CASE WHEN {label} IN ('municipio', 'municipality') THEN '{municipality}' \
                     WHEN {label} IN ('departamento', 'department') THEN '{department}' \
                     ELSE {fallback} END"
                ),
                KindSource::Labelled,
            )
        }
        Err(_) => (fallback, KindSource::Inferred),
    }
}
