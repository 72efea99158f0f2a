//! Column extraction from result batches.
//!
//! Parquet strings may arrive as `Utf8View` or dictionary arrays and counts
//! as `Int64` or `UInt64` depending on the plan, so every column is cast to
//! one canonical Arrow type before it is downcast.

use datafusion::arrow::array::{Array, ArrayRef};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::cast::{as_float64_array, as_int64_array, as_string_array};
use datafusion::error::DataFusionError;

use crate::error::QueryResult;

fn column_as(batch: &RecordBatch, name: &str, data_type: &DataType) -> QueryResult<ArrayRef> {
    let column = batch.column_by_name(name).ok_or_else(|| {
        DataFusionError::Internal(format!("result batch lacks column '{name}'"))
    })?;
    Ok(cast(column, data_type).map_err(DataFusionError::from)?)
}

pub(crate) fn strings(batch: &RecordBatch, name: &str) -> QueryResult<Vec<Option<String>>> {
    let array = column_as(batch, name, &DataType::Utf8)?;
    let values = as_string_array(&array)?;
    Ok((0..values.len())
        .map(|i| (!values.is_null(i)).then(|| values.value(i).to_string()))
        .collect())
}

pub(crate) fn floats(batch: &RecordBatch, name: &str) -> QueryResult<Vec<Option<f64>>> {
    let array = column_as(batch, name, &DataType::Float64)?;
    Ok(as_float64_array(&array)?.iter().collect())
}

pub(crate) fn ints(batch: &RecordBatch, name: &str) -> QueryResult<Vec<Option<i64>>> {
    let array = column_as(batch, name, &DataType::Int64)?;
    Ok(as_int64_array(&array)?.iter().collect())
}

/// Non-negative counters; NULL (no rows aggregated) reads as zero.
pub(crate) fn counts(batch: &RecordBatch, name: &str) -> QueryResult<Vec<u64>> {
    Ok(ints(batch, name)?
        .into_iter()
        .map(|value| value.unwrap_or(0).max(0) as u64)
        .collect())
}

/// Text columns that are part of a row's identity; NULL reads as empty.
pub(crate) fn texts(batch: &RecordBatch, name: &str) -> QueryResult<Vec<String>> {
    Ok(strings(batch, name)?
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Float32Array, StringViewArray, UInt64Array};
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn casts_view_and_unsigned_columns() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8View, true),
            Field::new("hits", DataType::UInt64, true),
            Field::new("score", DataType::Float32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringViewArray::from(vec![Some("Medellín"), None])),
                Arc::new(UInt64Array::from(vec![Some(3), None])),
                Arc::new(Float32Array::from(vec![Some(0.5), Some(0.25)])),
            ],
        )
        .expect("batch");

        assert_eq!(
            strings(&batch, "name").expect("strings"),
            vec![Some("Medellín".to_string()), None]
        );
        assert_eq!(texts(&batch, "name").expect("texts")[1], "");
        assert_eq!(counts(&batch, "hits").expect("counts"), vec![3, 0]);
        assert_eq!(floats(&batch, "score").expect("floats"), vec![Some(0.5), Some(0.25)]);
        assert!(ints(&batch, "missing").is_err());
    }
}
