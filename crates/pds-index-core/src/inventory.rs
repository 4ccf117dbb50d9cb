//! Inventory-style indexes: CSV tables relating one product to many targets.
//!
//! Each physical row is `volume, file_path, observation_id, target...`. The
//! decoder emits one row per target; [`group_by_observation`] recovers the
//! one-to-many view.

use std::{collections::HashMap, fs::File, path::Path, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, ListBuilder, StringArray, StringBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use log::{info, warn};
use snafu::prelude::*;

use crate::decode::{ArrowSnafu, CsvSnafu, DecodeError, IoSnafu};

/// Column names of the expanded (one row per target) table.
pub const INVENTORY_COLUMNS: [&str; 4] = ["volume", "file_path", "observation_id", "target"];

fn expanded_schema() -> SchemaRef {
    Arc::new(Schema::new(
        INVENTORY_COLUMNS
            .iter()
            .map(|n| Field::new(*n, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ))
}

/// Read an inventory CSV, one output row per target.
///
/// Rows with fewer than three fields are skipped with a warning. Empty
/// target fields are ignored.
pub fn decode_inventory(path: &Path) -> Result<RecordBatch, DecodeError> {
    let path_str = path.display().to_string();
    let file = File::open(path).context(IoSnafu { path: path_str.clone() })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut cols: [StringBuilder; 4] = Default::default();
    let mut physical = 0usize;
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record.context(CsvSnafu { path: path_str.clone() })?;
        physical += 1;
        if record.len() < 3 {
            skipped += 1;
            continue;
        }
        let fixed = [record[0].trim(), record[1].trim(), record[2].trim()];
        for target in record.iter().skip(3).map(str::trim).filter(|t| !t.is_empty()) {
            for (builder, value) in cols.iter_mut().zip(fixed.iter().chain([&target])) {
                builder.append_value(value);
            }
        }
    }
    if skipped > 0 {
        warn!("{path_str}: skipped {skipped} rows with fewer than 3 fields");
    }

    let arrays: Vec<ArrayRef> = cols
        .iter_mut()
        .map(|b| Arc::new(b.finish()) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(expanded_schema(), arrays).context(ArrowSnafu)?;
    info!(
        "{path_str}: {physical} inventory rows expanded to {} target rows",
        batch.num_rows()
    );
    Ok(batch)
}

fn text_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, ArrowError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ArrowError::SchemaError(format!("missing text column {name}")))
}

/// Regroup an expanded inventory by `observation_id`.
///
/// Output columns: `observation_id, volume, file_path, targets`, where
/// `targets` is a list of strings. When an observation id repeats, the first
/// occurrence's volume and file path are kept and targets are appended in
/// encounter order. Groups appear in order of first appearance.
pub fn group_by_observation(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    let volume = text_column(batch, "volume")?;
    let file_path = text_column(batch, "file_path")?;
    let obs = text_column(batch, "observation_id")?;
    let target = text_column(batch, "target")?;

    let mut order: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut slot: HashMap<&str, usize> = HashMap::new();
    for row in 0..batch.num_rows() {
        if obs.is_null(row) {
            continue;
        }
        let idx = *slot.entry(obs.value(row)).or_insert_with(|| {
            order.push((row, Vec::new()));
            order.len() - 1
        });
        if target.is_valid(row) {
            order[idx].1.push(row);
        }
    }

    let mut obs_b = StringBuilder::new();
    let mut vol_b = StringBuilder::new();
    let mut path_b = StringBuilder::new();
    let mut targets_b = ListBuilder::new(StringBuilder::new());
    for (first, rows) in &order {
        obs_b.append_value(obs.value(*first));
        vol_b.append_option(volume.is_valid(*first).then(|| volume.value(*first)));
        path_b.append_option(file_path.is_valid(*first).then(|| file_path.value(*first)));
        for r in rows {
            targets_b.values().append_value(target.value(*r));
        }
        targets_b.append(true);
    }

    let targets = targets_b.finish();
    let schema = Schema::new(vec![
        Field::new("observation_id", DataType::Utf8, false),
        Field::new("volume", DataType::Utf8, true),
        Field::new("file_path", DataType::Utf8, true),
        Field::new("targets", targets.data_type().clone(), true),
    ]);
    RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(obs_b.finish()) as ArrayRef,
            Arc::new(vol_b.finish()),
            Arc::new(path_b.finish()),
            Arc::new(targets),
        ],
    )
}
