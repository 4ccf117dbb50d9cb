//! Registered corrections for known data-quality defects in specific
//! indexes.
//!
//! Two hooks exist. Pre-decode fixes see each raw table line before it is
//! sliced. Pre-time fixes see the decoded, still text-typed batch before
//! numeric and time typing. The materializer calls both for every key; keys
//! without fixes pass through untouched. A failing fix is logged and the
//! input is kept as it was.

use std::{collections::HashMap, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, StringArray},
    record_batch::RecordBatch,
};
use log::{debug, warn};
use memchr::memmem;
use snafu::prelude::*;

use crate::{
    decode::{
        time::{is_placeholder, is_time_column},
        types::parse_number,
    },
    key::IndexKey,
};

/// A fix-up could not be applied.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct FixupError {
    message: String,
}

impl FixupError {
    /// Error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-line fix. `Ok(None)` means the line needs no change.
pub type LineFix = fn(&[u8]) -> Result<Option<Vec<u8>>, FixupError>;

/// Whole-batch fix on text columns.
pub type BatchFix = fn(&RecordBatch) -> Result<RecordBatch, FixupError>;

/// A fix-up tagged with the stage it runs at.
#[derive(Debug, Clone, Copy)]
pub enum FixUp {
    /// Runs on raw table lines.
    PreDecode(LineFix),
    /// Runs on the decoded text batch before typing.
    PreTimeConversion(BatchFix),
}

/// Key → fix-up lookup for both stages.
#[derive(Debug, Clone, Default)]
pub struct FixupRegistry {
    pre_decode: HashMap<IndexKey, LineFix>,
    pre_time: HashMap<IndexKey, BatchFix>,
}

impl FixupRegistry {
    /// Registry with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the known archive defects.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(
            IndexKey::from_static("go", "ssi", "index"),
            FixUp::PreDecode(go_ssi_stray_quote),
        );
        for rover in ["opportunity", "spirit"] {
            reg.register(
                IndexKey::from_static("mer", rover, "pancam_rdr"),
                FixUp::PreTimeConversion(mer_pancam_rdr),
            );
        }
        reg.register(
            IndexKey::from_static("lro", "lola", "rdr"),
            FixUp::PreTimeConversion(lola_rdr_creation_time),
        );
        reg
    }

    /// Add or replace the fix for `key` at the fix's stage.
    pub fn register(&mut self, key: IndexKey, fix: FixUp) {
        match fix {
            FixUp::PreDecode(f) => {
                self.pre_decode.insert(key, f);
            }
            FixUp::PreTimeConversion(f) => {
                self.pre_time.insert(key, f);
            }
        }
    }

    /// Pre-decode fix for `key`, if any.
    pub fn line_fix(&self, key: &IndexKey) -> Option<LineFix> {
        self.pre_decode.get(key).copied()
    }

    /// Run the pre-time fix for `key`. Returns `batch` unchanged when no fix
    /// is registered or the fix fails.
    pub fn apply_pre_time(&self, key: &IndexKey, batch: RecordBatch) -> RecordBatch {
        let Some(fix) = self.pre_time.get(key) else {
            return batch;
        };
        match fix(&batch) {
            Ok(fixed) => {
                debug!("{key}: applied pre-time fix-up");
                fixed
            }
            Err(e) => {
                warn!("{key}: pre-time fix-up failed, keeping data as decoded: {e}");
                batch
            }
        }
    }
}

const GO_SSI_BAD: &[u8] = b"-23.629\"";
const GO_SSI_GOOD: &[u8] = b"-23.629,";

fn go_ssi_stray_quote(line: &[u8]) -> Result<Option<Vec<u8>>, FixupError> {
    let finder = memmem::Finder::new(GO_SSI_BAD);
    if finder.find(line).is_none() {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = finder.find(rest) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(GO_SSI_GOOD);
        rest = &rest[pos + GO_SSI_BAD.len()..];
    }
    out.extend_from_slice(rest);
    Ok(Some(out))
}

/// Replace text column `name` by mapping each non-null value.
fn map_text_column(
    batch: &RecordBatch,
    name: &str,
    f: impl Fn(&str) -> Option<String>,
) -> Result<RecordBatch, FixupError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| FixupError::new(format!("column {name} missing")))?;
    let text = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| FixupError::new(format!("column {name} is not text")))?;
    let mapped: StringArray = text.iter().map(|v| v.and_then(&f)).collect();

    let mut columns = batch.columns().to_vec();
    columns[idx] = Arc::new(mapped) as ArrayRef;
    RecordBatch::try_new(batch.schema(), columns).map_err(|e| FixupError::new(e.to_string()))
}

fn mer_pancam_rdr(batch: &RecordBatch) -> Result<RecordBatch, FixupError> {
    let schema = batch.schema();
    let time_columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|n| is_time_column(n))
        .collect();

    let mut out = batch.clone();
    for name in &time_columns {
        out = map_text_column(&out, name, |v| {
            Some(if v.ends_with('Z') || is_placeholder(v) {
                v.to_string()
            } else {
                format!("{v}Z")
            })
        })?;
    }
    map_text_column(&out, "RELEASE_ID", |v| {
        parse_number(v).is_some().then(|| v.to_string())
    })
}

fn lola_rdr_creation_time(batch: &RecordBatch) -> Result<RecordBatch, FixupError> {
    map_text_column(batch, "PRODUCT_CREATION_TIME", |v| {
        Some(if v.len() == 10 && !v.contains('T') {
            format!("{v}T00:00:00")
        } else {
            v.to_string()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};

    fn text_batch(cols: Vec<(&str, Vec<Option<&str>>)>) -> RecordBatch {
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

    fn col(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    #[test]
    fn go_ssi_quote_replaced_everywhere() {
        let reg = FixupRegistry::with_builtins();
        let fix = reg.line_fix(&"go.ssi.index".parse().unwrap()).unwrap();
        let fixed = fix(b"\"A\",-23.629\"B\",-23.629\"").unwrap().unwrap();
        assert_eq!(fixed, b"\"A\",-23.629,B\",-23.629,".to_vec());
        assert_eq!(fix(b"clean line").unwrap(), None);
    }

    #[test]
    fn unregistered_key_is_a_no_op() {
        let reg = FixupRegistry::with_builtins();
        let key: IndexKey = "cassini.iss.index".parse().unwrap();
        assert!(reg.line_fix(&key).is_none());
        let batch = text_batch(vec![("A", vec![Some("x")])]);
        assert_eq!(reg.apply_pre_time(&key, batch.clone()), batch);
    }

    #[test]
    fn mer_fix_appends_zone_and_nulls_tbd_release() {
        let reg = FixupRegistry::with_builtins();
        let key: IndexKey = "mer.spirit.pancam_rdr".parse().unwrap();
        let batch = text_batch(vec![
            ("START_TIME", vec![Some("2004-01-05T01:02:03.5"), Some("2004-01-06T00:00:00Z")]),
            ("RELEASE_ID", vec![Some("0001"), Some("TBD")]),
            ("SPACECRAFT_CLOCK_START_COUNT", vec![Some("126000000"), None]),
        ]);
        let fixed = reg.apply_pre_time(&key, batch);
        assert_eq!(
            col(&fixed, "START_TIME"),
            vec![
                Some("2004-01-05T01:02:03.5Z".to_string()),
                Some("2004-01-06T00:00:00Z".to_string())
            ]
        );
        assert_eq!(col(&fixed, "RELEASE_ID"), vec![Some("0001".to_string()), None]);
        assert_eq!(
            col(&fixed, "SPACECRAFT_CLOCK_START_COUNT"),
            vec![Some("126000000".to_string()), None]
        );
    }

    #[test]
    fn mer_fix_leaves_placeholders_for_time_typing() {
        use crate::decode::types::{TypingOptions, apply_types};
        use arrow::datatypes::TimeUnit;

        let reg = FixupRegistry::with_builtins();
        let key: IndexKey = "mer.spirit.pancam_rdr".parse().unwrap();
        let batch = text_batch(vec![
            ("START_TIME", vec![Some("2004-01-05T01:02:03.5"), Some("UNK")]),
            ("RELEASE_ID", vec![Some("0001"), Some("0002")]),
        ]);
        let fixed = reg.apply_pre_time(&key, batch);
        assert_eq!(
            col(&fixed, "START_TIME"),
            vec![Some("2004-01-05T01:02:03.5Z".to_string()), Some("UNK".to_string())]
        );

        let typed = apply_types(
            &fixed,
            TypingOptions {
                coerce_mixed_to_text: false,
            },
        )
        .unwrap();
        let start = typed.column_by_name("START_TIME").unwrap();
        assert_eq!(
            start.data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert!(start.is_valid(0));
        assert!(start.is_null(1));
    }

    #[test]
    fn failing_fix_returns_input_unchanged() {
        let reg = FixupRegistry::with_builtins();
        let key: IndexKey = "mer.opportunity.pancam_rdr".parse().unwrap();
        let batch = text_batch(vec![("START_TIME", vec![Some("2004-01-05T01:02:03")])]);
        assert_eq!(reg.apply_pre_time(&key, batch.clone()), batch);
    }

    #[test]
    fn lola_pads_date_only_creation_time() {
        let reg = FixupRegistry::with_builtins();
        let key: IndexKey = "lro.lola.rdr".parse().unwrap();
        let batch = text_batch(vec![(
            "PRODUCT_CREATION_TIME",
            vec![Some("2010-03-15"), Some("2010-03-16T12:00:00"), None],
        )]);
        let fixed = reg.apply_pre_time(&key, batch);
        assert_eq!(
            col(&fixed, "PRODUCT_CREATION_TIME"),
            vec![
                Some("2010-03-15T00:00:00".to_string()),
                Some("2010-03-16T12:00:00".to_string()),
                None
            ]
        );
    }
}
