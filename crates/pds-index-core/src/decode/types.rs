//! Numeric type inference for decoded text columns.

use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};
use log::{debug, warn};

use crate::decode::time::{self, TimeConversion, TimeTier};

/// Parse a number the way an index table spells one.
///
/// Rejects the textual specials (`inf`, `NaN`) that `f64::from_str` accepts,
/// so words never count as numeric.
pub fn parse_number(value: &str) -> Option<f64> {
    let v = value.trim();
    if !v.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    v.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// What the non-missing values of a text column look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnShape {
    /// No non-missing values.
    Empty,
    /// Every value is an `i64`.
    Integer,
    /// Every value is a finite number.
    Real,
    /// Some values are numeric, some are not.
    Mixed,
    /// No value is numeric.
    Text,
}

/// Classify `column`.
pub fn shape_of(column: &StringArray) -> ColumnShape {
    let mut seen = 0usize;
    let mut numeric = 0usize;
    let mut integer = true;
    for value in column.iter().flatten() {
        seen += 1;
        if value.trim().parse::<i64>().is_ok() {
            numeric += 1;
        } else if parse_number(value).is_some() {
            numeric += 1;
            integer = false;
        }
    }
    match (seen, numeric) {
        (0, _) => ColumnShape::Empty,
        (_, 0) => ColumnShape::Text,
        (s, n) if s == n && integer => ColumnShape::Integer,
        (s, n) if s == n => ColumnShape::Real,
        _ => ColumnShape::Mixed,
    }
}

fn as_text(column: &ArrayRef) -> Option<&StringArray> {
    column.as_any().downcast_ref::<StringArray>()
}

/// Names of text columns where some but not all non-missing values are
/// numeric.
pub fn find_mixed_type_columns(batch: &RecordBatch) -> Vec<String> {
    let schema = batch.schema();
    schema
        .fields()
        .iter()
        .zip(batch.columns())
        .filter_map(|(field, column)| {
            let text = as_text(column)?;
            (shape_of(text) == ColumnShape::Mixed).then(|| field.name().clone())
        })
        .collect()
}

fn to_int(column: &StringArray) -> ArrayRef {
    Arc::new(
        column
            .iter()
            .map(|v| v.and_then(|s| s.trim().parse::<i64>().ok()))
            .collect::<Int64Array>(),
    )
}

fn to_real(column: &StringArray) -> ArrayRef {
    Arc::new(
        column
            .iter()
            .map(|v| v.and_then(parse_number))
            .collect::<Float64Array>(),
    )
}

/// Options for [`apply_types`].
#[derive(Debug, Clone, Copy)]
pub struct TypingOptions {
    /// Keep mixed columns as text instead of nulling their non-numeric
    /// values.
    pub coerce_mixed_to_text: bool,
}

/// Convert time columns to UTC timestamps and infer numeric types for the
/// rest.
///
/// Every column of `batch` must be text (as produced by the decoder, after
/// pre-time fix-ups). A time-named column whose values are all numeric
/// holds durations, so it goes through numeric inference instead.
pub fn apply_types(batch: &RecordBatch, opts: TypingOptions) -> Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(batch.num_columns());

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let Some(text) = as_text(column) else {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
            continue;
        };
        let name = field.name();
        let shape = shape_of(text);

        if time::is_time_column(name) && !matches!(shape, ColumnShape::Integer | ColumnShape::Real) {
            match time::convert_time_column(text) {
                TimeConversion::Converted(array, tier) => {
                    if tier != TimeTier::SingleFormat {
                        debug!("column {name}: timestamps parsed with {tier:?} fallback");
                    }
                    fields.push(Field::new(name, array.data_type().clone(), true));
                    columns.push(array);
                }
                TimeConversion::Failed { sample } => {
                    warn!("column {name}: no time format matches {sample:?}; keeping text");
                    fields.push(field.as_ref().clone());
                    columns.push(column.clone());
                }
            }
            continue;
        }

        let (data_type, array) = match shape {
            ColumnShape::Integer => (DataType::Int64, to_int(text)),
            ColumnShape::Real => (DataType::Float64, to_real(text)),
            ColumnShape::Mixed if !opts.coerce_mixed_to_text => {
                let nulled = text
                    .iter()
                    .filter(|v| v.is_some_and(|s| parse_number(s).is_none()))
                    .count();
                warn!("column {name}: mixed types, {nulled} non-numeric values set to null");
                (DataType::Float64, to_real(text))
            }
            ColumnShape::Mixed => {
                warn!("column {name}: mixed numeric and text values; keeping text");
                (DataType::Utf8, column.clone())
            }
            ColumnShape::Empty | ColumnShape::Text => (DataType::Utf8, column.clone()),
        };
        fields.push(Field::new(name, data_type, true));
        columns.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::TimestampMicrosecondArray;

    fn batch(cols: Vec<(&str, Vec<Option<&str>>)>) -> RecordBatch {
        let fields: Vec<Field> = cols
            .iter()
            .map(|(n, _)| Field::new(*n, DataType::Utf8, true))
            .collect();
        let arrays: Vec<ArrayRef> = cols
            .into_iter()
            .map(|(_, v)| Arc::new(StringArray::from(v)) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
    }

    #[test]
    fn shapes() {
        let s = |v: Vec<Option<&str>>| shape_of(&StringArray::from(v));
        assert_eq!(s(vec![Some("1"), None, Some("-20")]), ColumnShape::Integer);
        assert_eq!(s(vec![Some("1"), Some("2.5E3")]), ColumnShape::Real);
        assert_eq!(s(vec![Some("1"), Some("TBD")]), ColumnShape::Mixed);
        assert_eq!(s(vec![Some("NaN"), Some("inf")]), ColumnShape::Text);
        assert_eq!(s(vec![None, None]), ColumnShape::Empty);
    }

    #[test]
    fn infers_numbers_and_times() {
        let b = batch(vec![
            ("LINES", vec![Some("1024"), Some("2048")]),
            ("EMISSION_ANGLE", vec![Some("1.5"), None]),
            ("START_TIME", vec![Some("2006-03-24T04:30:00"), Some("UNK")]),
            ("EXPOSURE_TIME", vec![Some("1.2"), Some("3")]),
            ("PRODUCT_ID", vec![Some("P01_001"), Some("P01_002")]),
        ]);
        let typed = apply_types(
            &b,
            TypingOptions {
                coerce_mixed_to_text: true,
            },
        )
        .unwrap();
        let schema = typed.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert!(matches!(
            schema.field(2).data_type(),
            DataType::Timestamp(_, Some(tz)) if tz.as_ref() == "UTC"
        ));
        assert_eq!(schema.field(3).data_type(), &DataType::Float64);
        assert_eq!(schema.field(4).data_type(), &DataType::Utf8);

        let times = typed
            .column(2)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert!(times.is_null(1));
    }

    #[test]
    fn mixed_columns_follow_policy() {
        let b = batch(vec![("RELEASE_ID", vec![Some("0001"), Some("TBD")])]);
        assert_eq!(find_mixed_type_columns(&b), vec!["RELEASE_ID".to_string()]);

        let kept = apply_types(&b, TypingOptions { coerce_mixed_to_text: true }).unwrap();
        assert_eq!(kept.schema().field(0).data_type(), &DataType::Utf8);

        let nulled = apply_types(&b, TypingOptions { coerce_mixed_to_text: false }).unwrap();
        let col = nulled
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(col.value(0), 1.0);
        assert!(col.is_null(1));
    }

    #[test]
    fn unparsable_time_column_stays_text() {
        let b = batch(vec![("STOP_TIME", vec![Some("soon"), Some("later")])]);
        let typed = apply_types(&b, TypingOptions { coerce_mixed_to_text: true }).unwrap();
        assert_eq!(typed.schema().field(0).data_type(), &DataType::Utf8);
    }
}
