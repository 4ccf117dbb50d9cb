//! Local storage primitives for index artifacts.
//!
//! Every durable file this crate produces (the freshness ledger, the static
//! URL document, downloaded label/table files and the columnar cache) is
//! written through this module. The rules are the same for all of them:
//!
//! - Writes go to a temporary sibling file, are fsynced, and are then renamed
//!   over the target. Readers therefore see either the previous content or
//!   the complete new content, never a partial file.
//! - Temporary files are removed on every error path.
//! - Missing files are reported as [`StorageError::NotFound`] so callers can
//!   distinguish "not there yet" from real I/O failures.
//!
//! Paths are expressed as a [`StorageLocation`] root plus a relative path so
//! layout code never concatenates strings by hand.

mod error;
mod output;

use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::IntoError;
use tokio::{fs, io::AsyncWriteExt};

pub use error::{BackendError, StorageError};
use error::{NotFoundSnafu, OtherIoSnafu};
pub use output::{OutputSink, SinkWriter, open_output_sink};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root directory that relative artifact paths are resolved against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// Split an absolute file path into its parent directory location and
    /// the file name, so single files (ledger, URL document) can use the same
    /// helpers as the cache tree.
    pub fn for_file(path: &Path) -> (Self, PathBuf) {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf());
        (StorageLocation::Local(parent), name)
    }

    /// Root directory of this location.
    pub fn root(&self) -> &Path {
        match self {
            StorageLocation::Local(root) => root,
        }
    }

    /// Absolute path of `rel` under this location.
    pub fn join(&self, rel: &Path) -> PathBuf {
        join_local(self, rel)
    }
}

pub(crate) fn join_local(location: &StorageLocation, rel: &Path) -> PathBuf {
    match location {
        StorageLocation::Local(root) => root.join(rel),
    }
}

/// Attach `path` to a filesystem result, classifying a missing file as
/// [`StorageError::NotFound`].
pub(crate) fn local_io<T>(res: io::Result<T>, path: &Path) -> StorageResult<T> {
    res.map_err(|e| {
        let path = path.display().to_string();
        if e.kind() == io::ErrorKind::NotFound {
            NotFoundSnafu { path }.into_error(BackendError::Local(e))
        } else {
            OtherIoSnafu { path }.into_error(BackendError::Local(e))
        }
    })
}

pub(crate) async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    match abs.parent() {
        Some(parent) => local_io(fs::create_dir_all(parent).await, parent),
        None => Ok(()),
    }
}

/// `<name>.tmp` next to `abs`, so the final rename stays on one filesystem.
pub(crate) fn tmp_sibling(abs: &Path) -> PathBuf {
    let mut name = abs
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    abs.with_file_name(name)
}

/// Deletes a half-written temp file unless the rename went through.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    pub(crate) fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace `rel_path` under `location` with `contents`.
///
/// Parent directories are created as needed. The bytes are fsynced in the
/// temp sibling before the rename.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let target = join_local(location, rel_path);
    create_parent_dir(&target).await?;

    let tmp = tmp_sibling(&target);
    let mut guard = TempFileGuard::new(tmp.clone());

    let mut file = local_io(fs::File::create(&tmp).await, &tmp)?;
    local_io(file.write_all(contents).await, &tmp)?;
    local_io(file.sync_all().await, &tmp)?;
    drop(file);

    local_io(fs::rename(&tmp, &target).await, &target)?;
    guard.commit();
    Ok(())
}

/// Read the file at `rel_path` as UTF-8 text.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = join_local(location, rel_path);
    local_io(fs::read_to_string(&abs).await, &abs)
}

/// Read the full contents of the file at `rel_path`.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = join_local(location, rel_path);
    local_io(fs::read(&abs).await, &abs)
}

/// Whether a regular file exists at `rel_path`.
///
/// Directories and other non-regular entries count as absent.
pub async fn file_exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    let abs = join_local(location, rel_path);
    match local_io(fs::metadata(&abs).await, &abs) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Sorted names of the regular files directly inside `rel_dir`.
///
/// A missing directory yields an empty list.
pub async fn list_file_names(
    location: &StorageLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<String>> {
    let abs = join_local(location, rel_dir);
    let mut entries = match local_io(fs::read_dir(&abs).await, &abs) {
        Ok(rd) => rd,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = local_io(entries.next_entry().await, &abs)? {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file && let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel_path = Path::new("mro/ctx/indexes/edr/cumindex.lbl");

        write_atomic(&location, rel_path, b"PDS_VERSION_ID = PDS3").await?;

        let read_back = tokio::fs::read_to_string(tmp.path().join(rel_path)).await?;
        assert_eq!(read_back, "PDS_VERSION_ID = PDS3");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_and_leaves_no_tmp_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel_path = Path::new("ledger.toml");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "updated");
        assert!(!tmp.path().join("ledger.toml.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn read_to_string_returns_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let err = read_to_string(&location, Path::new("missing.lbl"))
            .await
            .expect_err("expected NotFound");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn file_exists_ignores_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("edr.parq")).await?;
        tokio::fs::write(tmp.path().join("edr.lbl"), b"x").await?;

        assert!(!file_exists(&location, Path::new("edr.parq")).await?);
        assert!(file_exists(&location, Path::new("edr.lbl")).await?);
        assert!(!file_exists(&location, Path::new("edr.tab")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_file_names_is_sorted_and_tolerates_missing_dir() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        assert!(list_file_names(&location, Path::new("nope")).await?.is_empty());

        tokio::fs::write(tmp.path().join("b.tab"), b"").await?;
        tokio::fs::write(tmp.path().join("a.lbl"), b"").await?;
        tokio::fs::create_dir(tmp.path().join("sub")).await?;

        let names = list_file_names(&location, Path::new("")).await?;
        assert_eq!(names, vec!["a.lbl".to_string(), "b.tab".to_string()]);
        Ok(())
    }

    #[test]
    fn for_file_splits_parent_and_name() {
        let (loc, rel) = StorageLocation::for_file(Path::new("/home/user/.pds_index_ledger.toml"));
        assert_eq!(loc.root(), Path::new("/home/user"));
        assert_eq!(rel, PathBuf::from(".pds_index_ledger.toml"));
    }
}
