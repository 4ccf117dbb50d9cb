//! Streaming writes that only become visible once committed.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use tokio::fs;

use crate::storage::{
    StorageLocation, StorageResult, TempFileGuard, create_parent_dir, join_local, local_io,
    tmp_sibling,
};

/// Temp file on the local disk, renamed over the target on finish.
struct LocalSink {
    tmp: PathBuf,
    target: PathBuf,
    // Blocking file: the parquet encoder needs `std::io::Write`.
    out: io::BufWriter<std::fs::File>,
    written: u64,
    guard: TempFileGuard,
}

impl LocalSink {
    async fn open(location: &StorageLocation, rel_path: &Path) -> StorageResult<Self> {
        let target = join_local(location, rel_path);
        create_parent_dir(&target).await?;

        let tmp = tmp_sibling(&target);
        let file = local_io(std::fs::File::create(&tmp), &tmp)?;
        Ok(Self {
            guard: TempFileGuard::new(tmp.clone()),
            tmp,
            target,
            out: io::BufWriter::new(file),
            written: 0,
        })
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn push_all(&mut self, buf: &[u8]) -> StorageResult<()> {
        local_io(self.out.write_all(buf), &self.tmp)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<u64> {
        local_io(self.out.flush(), &self.tmp)?;
        local_io(self.out.get_ref().sync_all(), &self.tmp)?;
        local_io(fs::rename(&self.tmp, &self.target).await, &self.target)?;
        self.guard.commit();
        Ok(self.written)
    }
}

/// Destination for a downloaded label or table, or an encoded cache file.
///
/// Nothing appears at the target path until [`OutputSink::finish`] succeeds.
/// Dropping an unfinished sink deletes the temp file, so an interrupted
/// download never leaves a truncated label or table behind.
pub struct OutputSink(LocalSink);

impl OutputSink {
    /// Append bytes.
    pub fn write_all(&mut self, buf: &[u8]) -> StorageResult<()> {
        self.0.push_all(buf)
    }

    /// Where the bytes currently go.
    pub fn temp_path(&self) -> &Path {
        &self.0.tmp
    }

    /// Flush, fsync and rename into place. Returns the byte count.
    pub async fn finish(mut self) -> StorageResult<u64> {
        self.0.commit().await
    }
}

/// Open a sink for `rel_path` under `location`, creating parent directories.
pub async fn open_output_sink(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<OutputSink> {
    LocalSink::open(location, rel_path).await.map(OutputSink)
}

/// [`std::io::Write`] view of an [`OutputSink`], for the parquet encoder.
pub struct SinkWriter {
    sink: OutputSink,
}

impl SinkWriter {
    /// Wrap an open sink.
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }

    /// Hand the sink back so it can be finished.
    pub fn into_sink(self) -> OutputSink {
        self.sink
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.0.push(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.0.out.flush()
    }
}
