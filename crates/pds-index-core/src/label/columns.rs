//! Byte-range layout of fixed-width table columns.

use snafu::prelude::*;

use crate::label::{InvalidColumnSnafu, LabelError, pvl::PvlBlock};

/// Half-open, 0-based byte range within one table line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    /// First byte.
    pub start: usize,
    /// One past the last byte.
    pub end: usize,
}

impl ByteRange {
    /// Width in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Slice `line`, clamped to its length.
    pub fn slice<'a>(&self, line: &'a [u8]) -> &'a [u8] {
        let end = self.end.min(line.len());
        let start = self.start.min(end);
        &line[start..end]
    }
}

/// One label column, possibly repeated (`ITEMS = n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name from the label.
    pub name: String,
    /// One range per item; a plain column has exactly one.
    pub ranges: Vec<ByteRange>,
    /// Whether the label declared `ITEMS` (names get `_1.._n` suffixes).
    pub repeated: bool,
}

impl ColumnSpec {
    /// Build from a `COLUMN` object.
    ///
    /// `START_BYTE` is 1-based. With `ITEMS = n`, item `i` starts at
    /// `START_BYTE - 1 + ITEM_OFFSET * i` and spans `ITEM_BYTES`;
    /// `ITEM_BYTES` defaults to `BYTES / ITEMS` and `ITEM_OFFSET` to
    /// `ITEM_BYTES`.
    pub fn from_block(block: &PvlBlock) -> Result<Self, LabelError> {
        let name = block
            .get("NAME")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .context(InvalidColumnSnafu {
                column: "<unnamed>",
                reason: "missing NAME",
            })?;

        let int = |field: &'static str| -> Result<Option<i64>, LabelError> {
            match block.get(field) {
                None => Ok(None),
                Some(v) => v.as_i64().map(Some).context(InvalidColumnSnafu {
                    column: name.clone(),
                    reason: format!("{field} is not an integer"),
                }),
            }
        };
        let positive = |field: &'static str, v: i64| -> Result<usize, LabelError> {
            ensure!(
                v > 0,
                InvalidColumnSnafu {
                    column: name.clone(),
                    reason: format!("{field} must be positive, got {v}"),
                }
            );
            Ok(v as usize)
        };

        let start_byte = int("START_BYTE")?.context(InvalidColumnSnafu {
            column: name.clone(),
            reason: "missing START_BYTE",
        })?;
        let start = positive("START_BYTE", start_byte)? - 1;
        let bytes = int("BYTES")?.map(|b| positive("BYTES", b)).transpose()?;

        let Some(items) = int("ITEMS")? else {
            let bytes = bytes.context(InvalidColumnSnafu {
                column: name.clone(),
                reason: "missing BYTES",
            })?;
            return Ok(Self {
                name,
                ranges: vec![ByteRange {
                    start,
                    end: start + bytes,
                }],
                repeated: false,
            });
        };

        let items = positive("ITEMS", items)?;
        let item_bytes = match int("ITEM_BYTES")? {
            Some(b) => positive("ITEM_BYTES", b)?,
            None => {
                let total = bytes.context(InvalidColumnSnafu {
                    column: name.clone(),
                    reason: "ITEMS without ITEM_BYTES or BYTES",
                })?;
                total / items
            }
        };
        ensure!(
            item_bytes > 0,
            InvalidColumnSnafu {
                column: name.clone(),
                reason: "item width is zero",
            }
        );
        let item_offset = match int("ITEM_OFFSET")? {
            Some(o) => positive("ITEM_OFFSET", o)?,
            None => item_bytes,
        };
        ensure!(
            item_offset >= item_bytes,
            InvalidColumnSnafu {
                column: name.clone(),
                reason: format!("ITEM_OFFSET {item_offset} < ITEM_BYTES {item_bytes}; items overlap"),
            }
        );

        let ranges = (0..items)
            .map(|i| {
                let s = start + item_offset * i;
                ByteRange {
                    start: s,
                    end: s + item_bytes,
                }
            })
            .collect();
        Ok(Self {
            name,
            ranges,
            repeated: true,
        })
    }

    /// Output column names: the name itself, or `NAME_1..NAME_n`.
    pub fn output_names(&self) -> Vec<String> {
        if self.repeated {
            (1..=self.ranges.len())
                .map(|i| format!("{}_{i}", self.name))
                .collect()
        } else {
            vec![self.name.clone()]
        }
    }

    /// Last byte (exclusive) this column touches.
    pub fn end(&self) -> usize {
        self.ranges.iter().map(|r| r.end).max().unwrap_or(0)
    }
}
