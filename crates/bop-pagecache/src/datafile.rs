//! Datafile I/O boundary.
//!
//! The flush path and the doublewrite stager only talk to [`Datafiles`]. The
//! bundled [`FileDatafiles`] keeps one file per tablespace under a root
//! directory.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::io::{IoError, IoFile, IoOpenOptions, SharedIoDriver, StdIoDriver};

#[derive(Debug, Error)]
pub enum DatafileError {
    #[error("tablespace {0} has no open datafile")]
    UnknownSpace(u32),
    #[error("datafile io error for space {space_id}: {source}")]
    Io {
        space_id: u32,
        #[source]
        source: IoError,
    },
}

/// Page-granular access to tablespace files.
///
/// Writes are assumed atomic per sector but not per page, which is why page
/// writes are staged through the doublewrite buffer first.
pub trait Datafiles: Send + Sync {
    /// Reads `len` bytes at `offset`; bytes past end of file read as zero.
    fn read(&self, space_id: u32, offset: u64, len: usize) -> Result<Vec<u8>, DatafileError>;

    /// Writes `data` at `offset`. Asynchronous writes are only guaranteed to be
    /// durable after [`Datafiles::fsync_all_pending_writes`].
    fn write(
        &self,
        space_id: u32,
        offset: u64,
        data: &[u8],
        asynchronous: bool,
    ) -> Result<(), DatafileError>;

    /// Makes every write issued to `space_id` durable.
    fn flush(&self, space_id: u32) -> Result<(), DatafileError>;

    /// Waits for outstanding asynchronous writes and syncs every touched file.
    fn fsync_all_pending_writes(&self) -> Result<(), DatafileError>;
}

struct OpenDatafile {
    file: Box<dyn IoFile>,
    pending_sync: AtomicBool,
}

/// [`Datafiles`] over real files.
pub struct FileDatafiles {
    root: PathBuf,
    driver: SharedIoDriver,
    files: DashMap<u32, Arc<OpenDatafile>>,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl FileDatafiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_driver(root, Arc::new(StdIoDriver::new()))
    }

    pub fn with_driver(root: impl Into<PathBuf>, driver: SharedIoDriver) -> Self {
        Self {
            root: root.into(),
            driver,
            files: DashMap::new(),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Opens (creating if needed) the datafile of `space_id`.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub fn open_space(&self, space_id: u32) -> Result<(), DatafileError> {
        if self.files.contains_key(&space_id) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.root).map_err(|e| DatafileError::Io {
            space_id,
            source: IoError::from(e),
        })?;
        let path = self.root.join(format!("space-{space_id:010}.ibd"));
        let file = self
            .driver
            .open(&path, &IoOpenOptions::read_write())
            .map_err(|source| DatafileError::Io { space_id, source })?;
        debug!(space_id, path = ?path, "datafile registered");
        self.files.entry(space_id).or_insert_with(|| {
            Arc::new(OpenDatafile {
                file,
                pending_sync: AtomicBool::new(false),
            })
        });
        Ok(())
    }

    /// Number of page writes issued so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of file syncs issued so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    fn file(&self, space_id: u32) -> Result<Arc<OpenDatafile>, DatafileError> {
        self.files
            .get(&space_id)
            .map(|entry| entry.value().clone())
            .ok_or(DatafileError::UnknownSpace(space_id))
    }

    fn sync(&self, space_id: u32, file: &OpenDatafile) -> Result<(), DatafileError> {
        file.pending_sync.store(false, Ordering::Release);
        file.file
            .flush()
            .map_err(|source| DatafileError::Io { space_id, source })?;
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Datafiles for FileDatafiles {
    fn read(&self, space_id: u32, offset: u64, len: usize) -> Result<Vec<u8>, DatafileError> {
        let file = self.file(space_id)?;
        let mut buf = vec![0u8; len];
        file.file
            .read_exact_or_zero(offset, &mut buf)
            .map_err(|source| DatafileError::Io { space_id, source })?;
        Ok(buf)
    }

    fn write(
        &self,
        space_id: u32,
        offset: u64,
        data: &[u8],
        asynchronous: bool,
    ) -> Result<(), DatafileError> {
        let file = self.file(space_id)?;
        file.file
            .write_at(offset, data)
            .map_err(|source| DatafileError::Io { space_id, source })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(space_id, offset, len = data.len(), asynchronous, "datafile write");
        if asynchronous {
            file.pending_sync.store(true, Ordering::Release);
            Ok(())
        } else {
            self.sync(space_id, &file)
        }
    }

    fn flush(&self, space_id: u32) -> Result<(), DatafileError> {
        let file = self.file(space_id)?;
        self.sync(space_id, &file)
    }

    fn fsync_all_pending_writes(&self) -> Result<(), DatafileError> {
        let pending: Vec<(u32, Arc<OpenDatafile>)> = self
            .files
            .iter()
            .filter(|entry| entry.value().pending_sync.load(Ordering::Acquire))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (space_id, file) in pending {
            self.sync(space_id, &file)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileDatafiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDatafiles")
            .field("root", &self.root)
            .field("open_files", &self.files.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileDatafiles::new(dir.path());
        files.open_space(3).expect("open");

        files.write(3, 8192, &[7u8; 16], false).expect("write");
        let data = files.read(3, 8192, 16).expect("read");
        assert_eq!(data, vec![7u8; 16]);
        assert_eq!(files.sync_count(), 1);
    }

    #[test]
    fn asynchronous_writes_are_synced_in_bulk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileDatafiles::new(dir.path());
        files.open_space(1).expect("open");
        files.open_space(2).expect("open");

        files.write(1, 0, &[1u8; 8], true).expect("write");
        files.write(2, 0, &[2u8; 8], true).expect("write");
        assert_eq!(files.sync_count(), 0);

        files.fsync_all_pending_writes().expect("fsync");
        assert_eq!(files.sync_count(), 2);

        files.fsync_all_pending_writes().expect("fsync");
        assert_eq!(files.sync_count(), 2);
    }

    #[test]
    fn unknown_space_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileDatafiles::new(dir.path());
        assert!(matches!(
            files.read(9, 0, 16),
            Err(DatafileError::UnknownSpace(9))
        ));
    }

    #[test]
    fn reads_past_end_are_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileDatafiles::new(dir.path());
        files.open_space(4).expect("open");
        let data = files.read(4, 1 << 20, 32).expect("read");
        assert!(data.iter().all(|b| *b == 0));
    }
}
