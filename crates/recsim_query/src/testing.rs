//! Deterministic fixture snapshots for tests and local demos.
//!
//! The fixture covers two departments with five municipalities and two
//! department-level documents, four recommendations and three sentences per
//! (territory, recommendation) pair. Similarities are laid out so that at the
//! default threshold:
//!
//! - Medellín (05001) mentions all four recommendations with the best scores;
//! - Abejorral (05002) and Bello (05088) tie exactly, so code order decides;
//! - Pasto (52001) mentions three recommendations;
//! - Tumaco (52835) never reaches the threshold.
//!
//! Sentence 0 of each pair is an `Incluida` classification, sentence 1 a
//! low-confidence `Excluida` (kept as policy content) and sentence 2 a
//! confident `Excluida` (dropped by the policy-only filter).

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use datafusion::arrow::array::{ArrayRef, Float64Array, Int64Array, Int8Array, StringArray};
use datafusion::arrow::datatypes::{Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::error::DataFusionError;
use datafusion::parquet::arrow::ArrowWriter;

use crate::error::QueryResult;

/// Rows written by [`write_fixture`].
pub const FIXTURE_ROW_COUNT: u64 = 84;
/// Territories of municipality kind in the fixture.
pub const FIXTURE_MUNICIPALITIES: u64 = 5;
pub const FIXTURE_DEPARTMENTS: u64 = 2;
pub const FIXTURE_RECOMMENDATIONS: u64 = 4;

/// How categorical and code columns are physically stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixtureEncoding {
    /// Text labels and zero-padded text codes.
    #[default]
    Labelled,
    /// Int8 categoricals and integer codes, as produced by the compression tooling.
    Encoded,
}

/// Fixture layout options.
#[derive(Debug, Clone, Default)]
pub struct FixtureOptions {
    pub encoding: FixtureEncoding,
    /// Raw columns to leave out.
    pub omit: Vec<&'static str>,
}

impl FixtureOptions {
    pub fn encoded() -> Self {
        Self {
            encoding: FixtureEncoding::Encoded,
            omit: Vec::new(),
        }
    }

    pub fn without(mut self, column: &'static str) -> Self {
        self.omit.push(column);
        self
    }
}

struct Territory {
    municipality: bool,
    dept_code: &'static str,
    dept_name: &'static str,
    mpio_code: Option<&'static str>,
    mpio_name: Option<&'static str>,
    pdet: i64,
    conflict: &'static str,
    poverty: f64,
    capacity: &'static str,
    /// Best sentence similarity in hundredths.
    base: i64,
}

#[allow(clippy::too_many_arguments)]
const fn municipality(
    dept_code: &'static str,
    dept_name: &'static str,
    mpio_code: &'static str,
    mpio_name: &'static str,
    pdet: i64,
    conflict: &'static str,
    poverty: f64,
    capacity: &'static str,
    base: i64,
) -> Territory {
    Territory {
        municipality: true,
        dept_code,
        dept_name,
        mpio_code: Some(mpio_code),
        mpio_name: Some(mpio_name),
        pdet,
        conflict,
        poverty,
        capacity,
        base,
    }
}

const fn department(dept_code: &'static str, dept_name: &'static str, base: i64) -> Territory {
    Territory {
        municipality: false,
        dept_code,
        dept_name,
        mpio_code: None,
        mpio_name: None,
        pdet: 0,
        conflict: "",
        poverty: 0.0,
        capacity: "",
        base,
    }
}

const TERRITORIES: [Territory; 7] = [
    municipality("05", "Antioquia", "05001", "Medellín", 0, "Bajo", 10.5, "C", 90),
    municipality("05", "Antioquia", "05002", "Abejorral", 1, "Medio", 45.0, "G3", 81),
    municipality("05", "Antioquia", "05088", "Bello", 0, "Medio Bajo", 20.0, "G1", 81),
    municipality("52", "Nariño", "52001", "Pasto", 0, "Medio", 30.0, "G2", 76),
    municipality("52", "Nariño", "52835", "Tumaco", 1, "Muy Alto", 70.0, "G5", 55),
    department("05", "Antioquia", 85),
    department("52", "Nariño", 71),
];

/// (code, text, topic, prioritized)
const RECOMMENDATIONS: [(&str, &str, &str, i64); 4] = [
    ("MCV1", "Garantizar la participación de las víctimas", "Paz", 1),
    ("MCV2", "Fortalecer la atención psicosocial", "Salud", 0),
    ("MCV3", "Ampliar la educación rural", "Educación", 1),
    ("MCV4", "Proteger los ecosistemas estratégicos", "Ambiente", 0),
];

const SENTENCES_PER_PAIR: i64 = 3;

#[derive(Default)]
struct Columns {
    dpto_cdpmp: Vec<String>,
    dpto: Vec<String>,
    mpio_cdpmp: Vec<Option<String>>,
    mpio: Vec<Option<String>>,
    recommendation_code: Vec<String>,
    recommendation_text: Vec<String>,
    recommendation_topic: Vec<String>,
    recommendation_priority: Vec<i64>,
    sentence_id: Vec<String>,
    sentence_id_paragraph: Vec<i64>,
    sentence_text: Vec<String>,
    sentence_similarity: Vec<f64>,
    paragraph_id: Vec<String>,
    paragraph_text: Vec<String>,
    paragraph_similarity: Vec<f64>,
    page_number: Vec<i64>,
    predicted_class: Vec<bool>,
    prediction_confidence: Vec<f64>,
    municipality: Vec<bool>,
    pdet: Vec<Option<i64>>,
    cat_iica: Vec<Option<&'static str>>,
    ipm: Vec<Option<f64>>,
    grupo_mdm: Vec<Option<&'static str>>,
}

fn generate() -> Columns {
    let mut cols = Columns::default();
    for territory in TERRITORIES.iter() {
        let code = territory.mpio_code.unwrap_or(territory.dept_code);
        for (r, (rec_code, rec_text, topic, priority)) in RECOMMENDATIONS.iter().enumerate() {
            let r = r as i64;
            let paragraph = format!("{code}-{rec_code}-p");
            for s in 0..SENTENCES_PER_PAIR {
                let hundredths = territory.base - 5 * r - 2 * s;
                cols.dpto_cdpmp.push(territory.dept_code.to_string());
                cols.dpto.push(territory.dept_name.to_string());
                cols.mpio_cdpmp.push(territory.mpio_code.map(str::to_string));
                cols.mpio.push(territory.mpio_name.map(str::to_string));
                cols.recommendation_code.push(rec_code.to_string());
                cols.recommendation_text.push(rec_text.to_string());
                cols.recommendation_topic.push(topic.to_string());
                cols.recommendation_priority.push(*priority);
                cols.sentence_id.push(format!("{code}-{rec_code}-{s}"));
                cols.sentence_id_paragraph.push(s);
                cols.sentence_text
                    .push(format!("{} menciona {rec_code} (oración {s})", territory.dept_name));
                cols.sentence_similarity.push(hundredths as f64 / 100.0);
                cols.paragraph_id.push(paragraph.clone());
                cols.paragraph_text
                    .push(format!("Párrafo del plan de {code} sobre {topic}"));
                cols.paragraph_similarity.push(territory.base as f64 / 100.0);
                cols.page_number.push(r + 1);
                cols.predicted_class.push(s == 0);
                cols.prediction_confidence
                    .push(if s == 1 { 0.6 } else { 0.9 });
                cols.municipality.push(territory.municipality);
                if territory.municipality {
                    cols.pdet.push(Some(territory.pdet));
                    cols.cat_iica.push(Some(territory.conflict));
                    cols.ipm.push(Some(territory.poverty));
                    cols.grupo_mdm.push(Some(territory.capacity));
                } else {
                    cols.pdet.push(None);
                    cols.cat_iica.push(None);
                    cols.ipm.push(None);
                    cols.grupo_mdm.push(None);
                }
            }
        }
    }
    cols
}

fn strings<S: AsRef<str>>(values: &[S]) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values.iter().map(|value| value.as_ref())))
}

fn optional_strings(values: &[Option<String>]) -> ArrayRef {
    Arc::new(StringArray::from(
        values.iter().map(Option::as_deref).collect::<Vec<_>>(),
    ))
}

fn int8(values: impl IntoIterator<Item = Option<i8>>) -> ArrayRef {
    Arc::new(values.into_iter().collect::<Int8Array>())
}

fn code_number(code: &str) -> Option<i64> {
    code.parse().ok()
}

fn conflict_code(label: &str) -> Option<i8> {
    ["Bajo", "Medio Bajo", "Medio", "Alto", "Muy Alto"]
        .iter()
        .position(|candidate| *candidate == label)
        .map(|index| index as i8)
}

fn capacity_code(label: &str) -> Option<i8> {
    ["C", "G1", "G2", "G3", "G4", "G5"]
        .iter()
        .position(|candidate| *candidate == label)
        .map(|index| index as i8)
}

/// Builds the fixture as one record batch.
pub fn fixture_batch(options: &FixtureOptions) -> QueryResult<RecordBatch> {
    let cols = generate();
    let encoded = options.encoding == FixtureEncoding::Encoded;
    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    let mut push = |name: &'static str, array: ArrayRef| {
        if !options.omit.contains(&name) {
            fields.push(Field::new(name, array.data_type().clone(), true));
            arrays.push(array);
        }
    };

    if encoded {
        push(
            "dpto_cdpmp",
            Arc::new(cols.dpto_cdpmp.iter().map(|c| code_number(c)).collect::<Int64Array>()),
        );
        push(
            "mpio_cdpmp",
            Arc::new(
                cols.mpio_cdpmp
                    .iter()
                    .map(|c| c.as_deref().and_then(code_number))
                    .collect::<Int64Array>(),
            ),
        );
    } else {
        push("dpto_cdpmp", strings(&cols.dpto_cdpmp));
        push("mpio_cdpmp", optional_strings(&cols.mpio_cdpmp));
    }
    push("dpto", strings(&cols.dpto));
    push("mpio", optional_strings(&cols.mpio));
    push("recommendation_code", strings(&cols.recommendation_code));
    push("recommendation_text", strings(&cols.recommendation_text));
    push("recommendation_topic", strings(&cols.recommendation_topic));
    push(
        "recommendation_priority",
        Arc::new(Int64Array::from(cols.recommendation_priority.clone())),
    );
    push("sentence_id", strings(&cols.sentence_id));
    push(
        "sentence_id_paragraph",
        Arc::new(Int64Array::from(cols.sentence_id_paragraph.clone())),
    );
    push("sentence_text", strings(&cols.sentence_text));
    push(
        "sentence_similarity",
        Arc::new(Float64Array::from(cols.sentence_similarity.clone())),
    );
    push("paragraph_id", strings(&cols.paragraph_id));
    push("paragraph_text", strings(&cols.paragraph_text));
    push(
        "paragraph_similarity",
        Arc::new(Float64Array::from(cols.paragraph_similarity.clone())),
    );
    push("page_number", Arc::new(Int64Array::from(cols.page_number.clone())));
    push(
        "prediction_confidence",
        Arc::new(Float64Array::from(cols.prediction_confidence.clone())),
    );
    push("IPM_2018", Arc::new(Float64Array::from(cols.ipm.clone())));

    if encoded {
        push(
            "predicted_class",
            int8(cols.predicted_class.iter().map(|included| Some(*included as i8))),
        );
        push(
            "tipo_territorio",
            int8(cols.municipality.iter().map(|m| Some(*m as i8))),
        );
        push("PDET", int8(cols.pdet.iter().map(|p| p.map(|p| p as i8))));
        push(
            "Cat_IICA",
            int8(cols.cat_iica.iter().map(|c| c.and_then(conflict_code))),
        );
        push(
            "Grupo_MDM",
            int8(cols.grupo_mdm.iter().map(|g| g.and_then(capacity_code))),
        );
    } else {
        let classes: Vec<&str> = cols
            .predicted_class
            .iter()
            .map(|included| if *included { "Incluida" } else { "Excluida" })
            .collect();
        let kinds: Vec<&str> = cols
            .municipality
            .iter()
            .map(|m| if *m { "Municipio" } else { "Departamento" })
            .collect();
        push("predicted_class", strings(&classes));
        push("tipo_territorio", strings(&kinds));
        push("PDET", Arc::new(Int64Array::from(cols.pdet.clone())));
        push("Cat_IICA", Arc::new(StringArray::from(cols.cat_iica.clone())));
        push("Grupo_MDM", Arc::new(StringArray::from(cols.grupo_mdm.clone())));
    }

    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays).map_err(DataFusionError::from)?)
}

/// Writes the fixture snapshot to `path` as Parquet.
pub fn write_fixture(path: &Path, options: &FixtureOptions) -> QueryResult<()> {
    let batch = fixture_batch(options)?;
    let file = File::create(path)?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).map_err(DataFusionError::from)?;
    writer.write(&batch).map_err(DataFusionError::from)?;
    writer.close().map_err(DataFusionError::from)?;
    Ok(())
}

/// Writes the labelled fixture.
pub fn write_default_fixture(path: &Path) -> QueryResult<()> {
    write_fixture(path, &FixtureOptions::default())
}
