//! Label-driven decoding of fixed-width index tables.
//!
//! The table is streamed line by line through a bounded [`BufReader`]
//! straight into one set of column builders, so the decoded text is held once
//! and never concatenated from partial batches. Progress is reported every
//! `chunk_rows` rows. Every output column is `Utf8`; numeric
//! and time typing happens afterwards in [`types::apply_types`] so that
//! pre-time fix-ups see the raw text.

pub mod time;
pub mod types;

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, StringBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use log::{debug, info, warn};
use snafu::prelude::*;

use crate::{
    fixups::LineFix,
    label::{ByteRange, LabelError, TableLabel},
};

pub use types::{TypingOptions, apply_types, find_mixed_type_columns};

/// Errors from decoding a table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    /// The label's table file is not next to it.
    #[snafu(display("Table file {table} not found next to {label}"))]
    TableNotFound {
        /// Label path.
        label: String,
        /// Table file name from the label.
        table: String,
    },

    /// The label file does not exist.
    #[snafu(display("Label not found: {path}"))]
    LabelNotFound {
        /// Expected label path.
        path: String,
    },

    /// Reading the table failed.
    #[snafu(display("Failed to read {path}: {source}"))]
    Io {
        /// Table path.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Building Arrow arrays failed.
    #[snafu(display("Arrow error while decoding: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// An inventory table is not valid CSV.
    #[snafu(display("CSV error in {path}: {source}"))]
    Csv {
        /// Table path.
        path: String,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// The label could not be used.
    #[snafu(display("{source}"))]
    Label {
        /// Underlying label error.
        source: LabelError,
    },

    /// The blocking decode task did not complete.
    #[snafu(display("Decode task failed: {message}"))]
    Task {
        /// Join error text.
        message: String,
    },
}

/// Receives decode progress.
pub trait ProgressObserver: Send {
    /// Called after each chunk and once at the end.
    fn progress(&mut self, lines_done: usize, total_lines: usize);
}

/// Logs progress every `every` lines.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    every: usize,
    next: usize,
}

impl LogProgress {
    /// Observer labelled `name` that logs at most once per `every` lines.
    pub fn new(name: impl Into<String>, every: usize) -> Self {
        let every = every.max(1);
        Self {
            name: name.into(),
            every,
            next: every,
        }
    }
}

impl ProgressObserver for LogProgress {
    fn progress(&mut self, lines_done: usize, total_lines: usize) {
        if lines_done >= total_lines {
            info!("{}: decoded {lines_done} lines", self.name);
        } else if lines_done >= self.next {
            info!("{}: {lines_done}/{total_lines} lines", self.name);
            self.next = (lines_done / self.every + 1) * self.every;
        }
    }
}

impl<F> ProgressObserver for F
where
    F: FnMut(usize, usize) + Send,
{
    fn progress(&mut self, lines_done: usize, total_lines: usize) {
        self(lines_done, total_lines)
    }
}

/// Decoder knobs.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Rows between progress reports.
    pub chunk_rows: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { chunk_rows: 65_536 }
    }
}

/// Count newline-terminated lines (plus a trailing unterminated one).
pub fn count_lines(path: &Path) -> io::Result<usize> {
    let mut reader = File::open(path)?;
    let mut buf = vec![0u8; 1 << 16];
    let mut count = 0usize;
    let mut last = b'\n';
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        count += memchr::memchr_iter(b'\n', &buf[..n]).count();
        last = buf[n - 1];
    }
    if last != b'\n' {
        count += 1;
    }
    Ok(count)
}

/// Clean one sliced value: trim whitespace and one pair of surrounding
/// quotes. Empty means missing.
pub fn clean_value(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut v = text.trim();
    v = v.strip_prefix('"').unwrap_or(v);
    v = v.strip_suffix('"').unwrap_or(v);
    let v = v.trim();
    (!v.is_empty()).then(|| v.to_string())
}

fn text_schema(names: &[String]) -> SchemaRef {
    Arc::new(Schema::new(
        names
            .iter()
            .map(|n| Field::new(n, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

struct TextColumns {
    schema: SchemaRef,
    ranges: Vec<ByteRange>,
    builders: Vec<StringBuilder>,
    rows: usize,
}

impl TextColumns {
    fn new(schema: SchemaRef, ranges: Vec<ByteRange>) -> Self {
        let builders = ranges.iter().map(|_| StringBuilder::new()).collect();
        Self {
            schema,
            ranges,
            builders,
            rows: 0,
        }
    }

    fn push(&mut self, line: &[u8]) {
        for (range, builder) in self.ranges.iter().zip(self.builders.iter_mut()) {
            builder.append_option(clean_value(range.slice(line)));
        }
        self.rows += 1;
    }

    fn finish(self) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<ArrayRef> = self
            .builders
            .into_iter()
            .map(|mut b| Arc::new(b.finish()) as ArrayRef)
            .collect();
        RecordBatch::try_new(self.schema, columns)
    }
}

fn trim_line_end(line: &mut Vec<u8>) {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
}

/// Decode `table_path` into a text-typed batch using `label`'s layout.
///
/// `line_fix` runs on every raw line before slicing; a failing fix leaves
/// the line as read and is logged once per decode.
pub fn decode_table(
    label: &TableLabel,
    table_path: &Path,
    opts: DecodeOptions,
    line_fix: Option<LineFix>,
    observer: &mut dyn ProgressObserver,
) -> Result<RecordBatch, DecodeError> {
    let path_str = table_path.display().to_string();
    let total = count_lines(table_path).context(IoSnafu { path: path_str.clone() })?;

    let (names, ranges): (Vec<String>, Vec<ByteRange>) = label.output_columns().into_iter().unzip();
    let schema = text_schema(&names);
    let chunk_rows = opts.chunk_rows.max(1);

    let file = File::open(table_path).context(IoSnafu { path: path_str.clone() })?;
    let mut reader = BufReader::new(file);
    let mut columns = TextColumns::new(schema, ranges);
    let mut next_report = chunk_rows;
    let mut line = Vec::new();
    let mut lines_done = 0usize;
    let mut fix_failed = false;

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .context(IoSnafu { path: path_str.clone() })?;
        if n == 0 {
            break;
        }
        lines_done += 1;
        trim_line_end(&mut line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match line_fix.map(|fix| fix(&line)) {
            Some(Ok(Some(fixed))) => columns.push(&fixed),
            Some(Err(e)) => {
                if !fix_failed {
                    warn!("{path_str}: pre-decode fix-up failed on line {lines_done}: {e}");
                    fix_failed = true;
                }
                columns.push(&line);
            }
            Some(Ok(None)) | None => columns.push(&line),
        }

        if columns.rows >= next_report {
            observer.progress(lines_done, total);
            next_report += chunk_rows;
        }
    }
    observer.progress(total, total);

    let batch = columns.finish().context(ArrowSnafu)?;
    debug!(
        "{path_str}: {} rows x {} columns",
        batch.num_rows(),
        batch.num_columns()
    );
    Ok(batch)
}

/// Read the label at `label_path`, locate its table and decode it on a
/// blocking thread.
///
/// Returns the decoded batch together with the table path actually used.
pub async fn decode_label_table(
    label_path: &Path,
    opts: DecodeOptions,
    line_fix: Option<LineFix>,
    mut observer: Box<dyn ProgressObserver>,
) -> Result<(RecordBatch, PathBuf), DecodeError> {
    let label = match TableLabel::read(label_path).await {
        Ok(l) => l,
        Err(LabelError::LabelNotFound { path }) => return LabelNotFoundSnafu { path }.fail(),
        Err(source) => return Err(DecodeError::Label { source }),
    };
    let table_path = label
        .locate_table(label_path)
        .await
        .context(LabelSnafu)?
        .context(TableNotFoundSnafu {
            label: label_path.display().to_string(),
            table: label.table_file.clone(),
        })?;

    let path = table_path.clone();
    let batch = tokio::task::spawn_blocking(move || {
        decode_table(&label, &path, opts, line_fix, observer.as_mut())
    })
    .await
    .map_err(|e| DecodeError::Task {
        message: e.to_string(),
    })??;
    Ok((batch, table_path))
}
