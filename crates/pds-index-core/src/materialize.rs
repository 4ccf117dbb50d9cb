//! Turning a downloaded label and table into the columnar cache.
//!
//! The pipeline for one key is strictly sequential:
//!
//! 1. decode the table (fixed-width via the label, or inventory CSV), with
//!    the key's pre-decode fix-up applied per line,
//! 2. apply the key's pre-time fix-up to the text batch,
//! 3. type numeric and time columns,
//! 4. write parquet into a temporary sibling of the cache file, read it
//!    back to validate, and only then rename it over the old cache.
//!
//! A failure at any step leaves the previous cache file untouched.

use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use arrow::{compute::concat_batches, error::ArrowError, record_batch::RecordBatch};
use log::{debug, info};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::{Compression, ZstdLevel},
    errors::ParquetError,
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    decode::{
        self, DecodeError, DecodeOptions, LogProgress, TypingOptions, apply_types,
        find_mixed_type_columns,
    },
    fixups::FixupRegistry,
    inventory,
    key::IndexKey,
    layout::{CacheArtifact, INVENTORY_TABLE_EXT, TABLE_EXT},
    settings::IndexSettings,
    storage::{SinkWriter, StorageError, open_output_sink},
};

/// Errors from building or reading the columnar cache.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    /// Storage failure on a cache path.
    #[snafu(display("Cache storage error at {path}: {source}"))]
    Storage {
        /// Cache path.
        path: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Parquet encoding or decoding failed.
    #[snafu(display("Parquet error at {path}: {source}"))]
    Parquet {
        /// Cache path.
        path: String,
        /// Underlying parquet error.
        source: ParquetError,
    },

    /// Arrow failure while assembling batches.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Decoding the source table failed.
    #[snafu(display("{source}"))]
    Decode {
        /// Underlying decode error.
        source: DecodeError,
    },

    /// No cache file exists yet.
    #[snafu(display("No cache file at {path}"))]
    CacheMissing {
        /// Expected cache path.
        path: String,
    },

    /// The freshly written file does not read back as written.
    #[snafu(display("Cache validation failed for {path}: {reason}"))]
    Validation {
        /// Temporary cache path.
        path: String,
        /// What did not match.
        reason: String,
    },

    /// A blocking task did not complete.
    #[snafu(display("Cache task failed: {message}"))]
    Task {
        /// Join error text.
        message: String,
    },
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// How an index's table is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Fixed-width table described by a PDS3 label.
    FixedWidth,
    /// CSV rows of `volume, file_path, observation_id, target...`.
    Inventory,
}

impl IndexKind {
    /// Kind implied by the key name: `inventory` in the index name selects
    /// [`IndexKind::Inventory`].
    pub fn for_key(key: &IndexKey) -> Self {
        if key.indexname().to_ascii_lowercase().contains("inventory") {
            IndexKind::Inventory
        } else {
            IndexKind::FixedWidth
        }
    }

    /// Table file extension for this kind.
    pub fn table_ext(&self) -> &'static str {
        match self {
            IndexKind::FixedWidth => TABLE_EXT,
            IndexKind::Inventory => INVENTORY_TABLE_EXT,
        }
    }
}

/// Summary of one materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReport {
    /// Rows written.
    pub rows: usize,
    /// Columns written.
    pub columns: usize,
    /// Size of the cache file in bytes.
    pub bytes: u64,
}

fn join_error(e: tokio::task::JoinError) -> CacheError {
    CacheError::Task {
        message: e.to_string(),
    }
}

/// Runs the decode → fix-up → type → write pipeline.
#[derive(Debug, Clone)]
pub struct Materializer {
    fixups: Arc<FixupRegistry>,
    decode: DecodeOptions,
    typing: TypingOptions,
    progress_every: usize,
}

impl Materializer {
    /// Pipeline using `fixups` and the tuning knobs from `settings`.
    pub fn new(settings: &IndexSettings, fixups: Arc<FixupRegistry>) -> Self {
        Self {
            fixups,
            decode: DecodeOptions {
                chunk_rows: settings.chunk_rows,
            },
            typing: TypingOptions {
                coerce_mixed_to_text: settings.coerce_mixed_to_text,
            },
            progress_every: settings.progress_every,
        }
    }

    /// Fix-ups this pipeline applies.
    pub fn fixups(&self) -> &FixupRegistry {
        &self.fixups
    }

    /// Decode, fix and type the local table of `artifact`.
    pub async fn decode(
        &self,
        key: &IndexKey,
        artifact: &CacheArtifact,
        kind: IndexKind,
    ) -> CacheResult<RecordBatch> {
        let text = match kind {
            IndexKind::FixedWidth => {
                let progress = Box::new(LogProgress::new(key.to_string(), self.progress_every));
                let (batch, table) = decode::decode_label_table(
                    &artifact.label_path(),
                    self.decode,
                    self.fixups.line_fix(key),
                    progress,
                )
                .await
                .context(DecodeSnafu)?;
                debug!("{key}: decoded {}", table.display());
                batch
            }
            IndexKind::Inventory => {
                let path = artifact.table_path();
                tokio::task::spawn_blocking(move || inventory::decode_inventory(&path))
                    .await
                    .map_err(join_error)?
                    .context(DecodeSnafu)?
            }
        };

        let fixed = self.fixups.apply_pre_time(key, text);
        if kind == IndexKind::Inventory {
            return Ok(fixed);
        }

        let mixed = find_mixed_type_columns(&fixed);
        if !mixed.is_empty() {
            info!("{key}: mixed-type columns {mixed:?}");
        }
        let typing = self.typing;
        tokio::task::spawn_blocking(move || apply_types(&fixed, typing))
            .await
            .map_err(join_error)?
            .context(ArrowSnafu)
    }

    /// Decode `artifact`'s local files and replace its cache.
    pub async fn build(
        &self,
        key: &IndexKey,
        artifact: &CacheArtifact,
        kind: IndexKind,
    ) -> CacheResult<CacheReport> {
        let batch = self.decode(key, artifact, kind).await?;
        let bytes = write_cache(artifact, &batch).await?;
        info!(
            "{key}: cached {} rows x {} columns ({bytes} bytes) at {}",
            batch.num_rows(),
            batch.num_columns(),
            artifact.cache_path().display()
        );
        Ok(CacheReport {
            rows: batch.num_rows(),
            columns: batch.num_columns(),
            bytes,
        })
    }
}

fn validate(path: &Path, expected: &RecordBatch) -> CacheResult<()> {
    let path_str = path.display().to_string();
    let file = File::open(path)
        .map_err(|e| ParquetError::External(Box::new(e)))
        .context(ParquetSnafu { path: path_str.clone() })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context(ParquetSnafu { path: path_str.clone() })?;

    let rows = builder.metadata().file_metadata().num_rows();
    ensure!(
        usize::try_from(rows).ok() == Some(expected.num_rows()),
        ValidationSnafu {
            path: path_str.clone(),
            reason: format!("{rows} rows on disk, {} decoded", expected.num_rows()),
        }
    );
    let columns = builder.schema().fields().len();
    ensure!(
        columns == expected.num_columns(),
        ValidationSnafu {
            path: path_str,
            reason: format!("{columns} columns on disk, {} decoded", expected.num_columns()),
        }
    );
    Ok(())
}

/// Write `batch` as the cache of `artifact`. Returns the file size.
///
/// The file is encoded into a temporary sibling, validated by reading its
/// footer back, and renamed into place.
pub async fn write_cache(artifact: &CacheArtifact, batch: &RecordBatch) -> CacheResult<u64> {
    let rel = artifact.cache_rel();
    let path_str = artifact.cache_path().display().to_string();
    let sink = open_output_sink(artifact.location(), &rel)
        .await
        .context(StorageSnafu { path: path_str.clone() })?;

    let batch = batch.clone();
    let encode_path = path_str.clone();
    let sink = tokio::task::spawn_blocking(move || -> CacheResult<_> {
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();
        let mut writer = ArrowWriter::try_new(SinkWriter::new(sink), batch.schema(), Some(props))
            .context(ParquetSnafu { path: encode_path.clone() })?;
        writer
            .write(&batch)
            .context(ParquetSnafu { path: encode_path.clone() })?;
        let mut out = writer
            .into_inner()
            .context(ParquetSnafu { path: encode_path.clone() })?;
        out.flush()
            .map_err(|e| ParquetError::External(Box::new(e)))
            .context(ParquetSnafu { path: encode_path })?;
        let sink = out.into_sink();
        validate(sink.temp_path(), &batch)?;
        Ok(sink)
    })
    .await
    .map_err(join_error)??;

    sink.finish().await.context(StorageSnafu { path: path_str })
}

/// Read the whole cache of `artifact` into one batch.
///
/// The file is decoded straight from its handle in a single batch, so the
/// encoded bytes are never buffered alongside the decoded columns.
pub async fn read_cache(artifact: &CacheArtifact) -> CacheResult<RecordBatch> {
    let path = artifact.cache_path();
    let path_str = path.display().to_string();

    tokio::task::spawn_blocking(move || -> CacheResult<RecordBatch> {
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return CacheMissingSnafu { path: path_str }.fail();
            }
            Err(e) => {
                return Err(ParquetError::External(Box::new(e)))
                    .context(ParquetSnafu { path: path_str });
            }
        };
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .context(ParquetSnafu { path: path_str.clone() })?;
        let schema = builder.schema().clone();
        let rows = usize::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
        let reader = builder
            .with_batch_size(rows.max(1))
            .build()
            .context(ParquetSnafu { path: path_str })?;

        let mut batches = reader
            .collect::<Result<Vec<_>, ArrowError>>()
            .context(ArrowSnafu)?;
        match batches.len() {
            0 => Ok(RecordBatch::new_empty(schema)),
            1 => Ok(batches.remove(0)),
            _ => concat_batches(&schema, &batches).context(ArrowSnafu),
        }
    })
    .await
    .map_err(join_error)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::StorageLocation, test_util::TestResult};
    use arrow::{
        array::{Array, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray},
        datatypes::DataType,
    };
    use tempfile::TempDir;

    const LABEL: &str = r#"PDS_VERSION_ID = PDS3
^INDEX_TABLE = "INDEX.TAB"
OBJECT = INDEX_TABLE
  ROW_BYTES = 40
  OBJECT = COLUMN
    NAME = PRODUCT_ID
    START_BYTE = 2
    BYTES = 6
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = START_TIME
    START_BYTE = 10
    BYTES = 20
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = RELEASE_ID
    START_BYTE = 31
    BYTES = 4
  END_OBJECT = COLUMN
  OBJECT = COLUMN
    NAME = SCALE
    START_BYTE = 36
    BYTES = 3
  END_OBJECT = COLUMN
END_OBJECT = INDEX_TABLE
END
"#;

    const TABLE: &str = "\
\"P00001\",2004-01-05T01:02:03Z,0001,1.5
\"P00002\",2004-01-06T00:00:00 ,TBD ,2.0
";

    struct Fixture {
        _tmp: TempDir,
        artifact: CacheArtifact,
        materializer: Materializer,
    }

    fn fixture(index: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let key: IndexKey = index.parse().unwrap();
        let root = StorageLocation::local(tmp.path());
        let artifact = CacheArtifact::new(&root, &key, "INDEX.LBL");
        let dir = tmp.path().join(artifact.rel_dir());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("INDEX.LBL"), LABEL).unwrap();
        std::fs::write(dir.join("INDEX.TAB"), TABLE).unwrap();
        let settings = IndexSettings::with_root(tmp.path());
        Fixture {
            _tmp: tmp,
            artifact,
            materializer: Materializer::new(&settings, Arc::new(FixupRegistry::with_builtins())),
        }
    }

    #[tokio::test]
    async fn build_then_read_round_trips_shape() -> TestResult {
        let f = fixture("mer.spirit.pancam_rdr");
        let key: IndexKey = "mer.spirit.pancam_rdr".parse()?;

        let report = f.materializer.build(&key, &f.artifact, IndexKind::FixedWidth).await?;
        assert!(f.artifact.has_cache().await?);
        assert_eq!(report.rows, 2);

        let cached = read_cache(&f.artifact).await?;
        assert_eq!(cached.num_rows(), report.rows);
        assert_eq!(cached.num_columns(), report.columns);
        let schema = cached.schema();
        assert_eq!(schema.field_with_name("RELEASE_ID")?.data_type(), &DataType::Int64);
        assert_eq!(schema.field_with_name("SCALE")?.data_type(), &DataType::Float64);
        assert!(matches!(
            schema.field_with_name("START_TIME")?.data_type(),
            DataType::Timestamp(_, Some(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn tbd_in_numeric_column_becomes_missing() -> TestResult {
        let f = fixture("mer.spirit.pancam_rdr");
        let key: IndexKey = "mer.spirit.pancam_rdr".parse()?;
        let batch = f.materializer.decode(&key, &f.artifact, IndexKind::FixedWidth).await?;

        let release = batch
            .column_by_name("RELEASE_ID")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(release.value(0), 1);
        assert!(release.is_null(1));

        let times = batch
            .column_by_name("START_TIME")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(times.null_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn without_fixup_tbd_keeps_column_text() -> TestResult {
        let f = fixture("mer.other.pancam_rdr");
        let key: IndexKey = "mer.other.pancam_rdr".parse()?;
        let batch = f.materializer.decode(&key, &f.artifact, IndexKind::FixedWidth).await?;
        let release = batch
            .column_by_name("RELEASE_ID")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(release.value(1), "TBD");
        let scale = batch.column_by_name("SCALE").unwrap();
        assert!(scale.as_any().downcast_ref::<Float64Array>().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_cache() -> TestResult {
        let f = fixture("mer.spirit.pancam_rdr");
        let key: IndexKey = "mer.spirit.pancam_rdr".parse()?;
        f.materializer.build(&key, &f.artifact, IndexKind::FixedWidth).await?;
        let before = std::fs::read(f.artifact.cache_path())?;

        std::fs::remove_file(f.artifact.table_path())?;
        let err = f
            .materializer
            .build(&key, &f.artifact, IndexKind::FixedWidth)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Decode {
                source: DecodeError::TableNotFound { .. }
            }
        ));
        assert_eq!(std::fs::read(f.artifact.cache_path())?, before);
        Ok(())
    }

    #[tokio::test]
    async fn cache_with_many_row_groups_reads_as_one_batch() -> TestResult {
        let f = fixture("go.ssi.index");
        let ids: Vec<i64> = (0..10).collect();
        let batch = RecordBatch::try_from_iter([(
            "ID",
            Arc::new(Int64Array::from(ids.clone())) as arrow::array::ArrayRef,
        )])?;

        let path = f.artifact.cache_path();
        let props = WriterProperties::builder().set_max_row_group_size(3).build();
        let mut writer = ArrowWriter::try_new(File::create(&path)?, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        let cached = read_cache(&f.artifact).await?;
        assert_eq!(cached.num_rows(), 10);
        let read: Vec<i64> = cached
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec();
        assert_eq!(read, ids);
        Ok(())
    }

    #[tokio::test]
    async fn reading_absent_cache_is_cache_missing() -> TestResult {
        let f = fixture("go.ssi.index");
        let err = read_cache(&f.artifact).await.unwrap_err();
        assert!(matches!(err, CacheError::CacheMissing { .. }));
        Ok(())
    }

    #[test]
    fn kind_from_key_name() {
        let k: IndexKey = "cassini.iss.moon_inventory".parse().unwrap();
        assert_eq!(IndexKind::for_key(&k), IndexKind::Inventory);
        assert_eq!(IndexKind::for_key(&k).table_ext(), "csv");
        let k: IndexKey = "cassini.iss.index".parse().unwrap();
        assert_eq!(IndexKind::for_key(&k), IndexKind::FixedWidth);
    }
}
