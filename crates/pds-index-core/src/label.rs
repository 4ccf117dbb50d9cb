//! PDS3 index labels: which file holds the table and how its lines are laid
//! out.
//!
//! A label names its table through a pointer statement
//! (`^INDEX_TABLE = "CUMINDEX.TAB"`); the object of the same name lists the
//! `COLUMN` objects in order. [`TableLabel`] is parsed fresh from disk for
//! every decode and never mutated.

mod columns;
pub mod pvl;

use std::path::{Path, PathBuf};

use snafu::prelude::*;

use crate::storage::{self, StorageError, StorageLocation};

pub use columns::{ByteRange, ColumnSpec};
pub use pvl::PvlError;

/// Errors from reading or interpreting a label.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LabelError {
    /// The label text is not valid PVL.
    #[snafu(display("Label syntax error: {source}"))]
    Syntax {
        /// Parser error with line number.
        source: PvlError,
    },

    /// The label has no usable table pointer.
    #[snafu(display("Malformed label: {reason}"))]
    MalformedLabel {
        /// What is missing or wrong.
        reason: String,
    },

    /// The pointer names a table object the label does not define.
    #[snafu(display("Label has no table object named {name}"))]
    MissingTable {
        /// Pointer name.
        name: String,
    },

    /// A `COLUMN` object cannot be turned into byte ranges.
    #[snafu(display("Invalid column {column}: {reason}"))]
    InvalidColumn {
        /// Column name (or `<unnamed>`).
        column: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The label file does not exist.
    #[snafu(display("Label not found: {path}"))]
    LabelNotFound {
        /// Expected label path.
        path: String,
    },

    /// The label (or its directory) could not be read.
    #[snafu(display("Failed to read label {path}: {source}"))]
    Io {
        /// Path being read.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Parsed layout of one index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLabel {
    /// Name of the table object (pointer name without `^`).
    pub table_name: String,
    /// Table file name as spelled in the label.
    pub table_file: String,
    /// Columns in label order.
    pub columns: Vec<ColumnSpec>,
    /// `ROW_BYTES`, when declared.
    pub row_bytes: Option<usize>,
    /// `ROWS`, when declared.
    pub rows: Option<usize>,
}

impl TableLabel {
    /// Parse label text.
    pub fn parse(text: &str) -> Result<Self, LabelError> {
        let root = pvl::parse(text).context(SyntaxSnafu)?;

        let (pointer, value) = pvl::first_pointer(&root).context(MalformedLabelSnafu {
            reason: "no table pointer (^NAME = ...) found",
        })?;
        let table_file = match value {
            pvl::PvlValue::Sequence(items) => items.first().and_then(pvl::PvlValue::as_str),
            other => other.as_str(),
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .context(MalformedLabelSnafu {
            reason: format!("pointer ^{pointer} does not name a table file"),
        })?
        .to_string();

        let table = root
            .child(pointer)
            .or_else(|| {
                root.children.iter().find(|c| {
                    c.name.to_ascii_uppercase().ends_with("TABLE") && c.child("COLUMN").is_some()
                })
            })
            .context(MissingTableSnafu { name: pointer })?;

        let columns = table
            .children_named("COLUMN")
            .map(ColumnSpec::from_block)
            .collect::<Result<Vec<_>, _>>()?;
        ensure!(
            !columns.is_empty(),
            MalformedLabelSnafu {
                reason: format!("table {} has no COLUMN objects", table.name),
            }
        );

        let as_usize = |field: &str| {
            table
                .get(field)
                .and_then(pvl::PvlValue::as_i64)
                .and_then(|v| usize::try_from(v).ok())
        };
        let row_bytes = as_usize("ROW_BYTES");
        if let Some(width) = row_bytes
            && let Some(col) = columns.iter().find(|c| c.end() > width)
        {
            return InvalidColumnSnafu {
                column: col.name.clone(),
                reason: format!("ends at byte {} beyond ROW_BYTES {width}", col.end()),
            }
            .fail();
        }

        Ok(Self {
            table_name: table.name.clone(),
            table_file,
            columns,
            row_bytes,
            rows: as_usize("ROWS"),
        })
    }

    /// Read and parse the label at `path`.
    pub async fn read(path: &Path) -> Result<Self, LabelError> {
        let (location, rel) = StorageLocation::for_file(path);
        let bytes = match storage::read_all_bytes(&location, &rel).await {
            Ok(b) => b,
            Err(e) if e.is_not_found() => {
                return LabelNotFoundSnafu {
                    path: path.display().to_string(),
                }
                .fail();
            }
            Err(source) => {
                return Err(LabelError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Self::parse(&String::from_utf8_lossy(&bytes))
    }

    /// Flattened `(name, range)` pairs for every output column, in order.
    pub fn output_columns(&self) -> Vec<(String, ByteRange)> {
        self.columns
            .iter()
            .flat_map(|c| c.output_names().into_iter().zip(c.ranges.iter().copied()))
            .collect()
    }

    /// Output column names in order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().flat_map(ColumnSpec::output_names).collect()
    }

    /// Find the table file next to `label_path`.
    ///
    /// Archives are inconsistent about casing, so the label's spelling is
    /// tried first, then lowercase, then uppercase.
    pub async fn locate_table(&self, label_path: &Path) -> Result<Option<PathBuf>, LabelError> {
        let dir = label_path.parent().unwrap_or_else(|| Path::new("."));
        let location = StorageLocation::local(dir);

        let mut candidates = vec![
            self.table_file.clone(),
            self.table_file.to_lowercase(),
            self.table_file.to_uppercase(),
        ];
        candidates.dedup();

        for name in candidates {
            let exists = storage::file_exists(&location, Path::new(&name))
                .await
                .context(IoSnafu {
                    path: dir.join(&name).display().to_string(),
                })?;
            if exists {
                return Ok(Some(dir.join(name)));
            }
        }
        Ok(None)
    }
}

/// Slice one raw table line per the label, for diagnosing misaligned rows.
pub fn decode_line(line: &str, label: &TableLabel) -> Vec<(String, String)> {
    let bytes = line.as_bytes();
    label
        .output_columns()
        .into_iter()
        .map(|(name, range)| {
            let raw = String::from_utf8_lossy(range.slice(bytes)).into_owned();
            (name, raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LABEL: &str = r#"PDS_VERSION_ID = PDS3
^INDEX_TABLE = "INDEX.TAB"
OBJECT = INDEX_TABLE
  ROWS = 2
  ROW_BYTES = 40
  OBJECT = COLUMN
    NAME = VOLUME_ID
    START_BYTE = 2
    BYTES = 8
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = SAMPLE
    START_BYTE = 13
    BYTES = 15
    ITEMS = 3
    ITEM_BYTES = 4
    ITEM_OFFSET = 5
  END_OBJECT = COLUMN
END_OBJECT = INDEX_TABLE
END
"#;

    #[test]
    fn parses_pointer_and_flattens_items() {
        let label = TableLabel::parse(LABEL).unwrap();
        assert_eq!(label.table_name, "INDEX_TABLE");
        assert_eq!(label.table_file, "INDEX.TAB");
        assert_eq!(label.rows, Some(2));
        assert_eq!(
            label.column_names(),
            vec!["VOLUME_ID", "SAMPLE_1", "SAMPLE_2", "SAMPLE_3"]
        );
    }

    #[test]
    fn missing_pointer_is_malformed() {
        let err = TableLabel::parse("OBJECT = TABLE\nEND_OBJECT\nEND").unwrap_err();
        assert!(matches!(err, LabelError::MalformedLabel { .. }));
    }

    #[test]
    fn pointer_to_undefined_object_is_reported() {
        let err = TableLabel::parse("^TABLE = \"X.TAB\"\nEND").unwrap_err();
        assert!(matches!(err, LabelError::MissingTable { .. }));
    }

    #[test]
    fn columns_must_fit_in_row() {
        let text = LABEL.replace("ROW_BYTES = 40", "ROW_BYTES = 20");
        let err = TableLabel::parse(&text).unwrap_err();
        assert!(matches!(err, LabelError::InvalidColumn { .. }), "{err}");
    }

    #[test]
    fn decode_line_slices_every_output_column() {
        let label = TableLabel::parse(LABEL).unwrap();
        let line = "\"VOL_0001\", 0001 0002 0003";
        let fields = decode_line(line, &label);
        assert_eq!(fields[0], ("VOLUME_ID".to_string(), "VOL_0001".to_string()));
        assert_eq!(fields[1].1, "0001");
        assert_eq!(fields[3], ("SAMPLE_3".to_string(), "0003".to_string()));
    }

    #[tokio::test]
    async fn locates_table_with_case_fallback() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = TempDir::new()?;
        let label_path = tmp.path().join("index.lbl");
        std::fs::write(&label_path, LABEL)?;

        let label = TableLabel::read(&label_path).await?;
        assert_eq!(label.locate_table(&label_path).await?, None);

        std::fs::write(tmp.path().join("index.tab"), "")?;
        assert_eq!(
            label.locate_table(&label_path).await?,
            Some(tmp.path().join("index.tab"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_label_file() {
        let err = TableLabel::read(Path::new("/definitely/not/here.lbl"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabelError::LabelNotFound { .. }));
    }
}
