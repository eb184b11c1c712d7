//! Positional file I/O used by the datafile layer.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, instrument, trace};

/// Options used when opening a file through an [`IoDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl IoOpenOptions {
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IoResult<T> = Result<T, IoError>;

/// A file addressed by absolute offsets.
pub trait IoFile: Send + Sync {
    /// Reads into `buf` starting at `offset`, returning the bytes read.
    ///
    /// Fewer bytes than requested are returned only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize>;

    /// Writes all of `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> IoResult<()>;

    /// Makes previously written data durable.
    fn flush(&self) -> IoResult<()>;

    /// Reads exactly `buf.len()` bytes, treating a hole past end of file as zeros.
    fn read_exact_or_zero(&self, offset: u64, buf: &mut [u8]) -> IoResult<()> {
        let read = self.read_at(offset, buf)?;
        buf[read..].fill(0);
        Ok(())
    }
}

pub trait IoDriver: Send + Sync {
    fn open(&self, path: &Path, options: &IoOpenOptions) -> IoResult<Box<dyn IoFile>>;
}

pub type SharedIoDriver = Arc<dyn IoDriver>;

/// Driver backed by `std::fs::File` with `pread`/`pwrite` semantics.
#[derive(Clone, Default)]
pub struct StdIoDriver;

impl StdIoDriver {
    pub fn new() -> Self {
        Self
    }
}

impl std::fmt::Debug for StdIoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdIoDriver").finish()
    }
}

impl IoDriver for StdIoDriver {
    #[instrument(level = "debug", skip(self, options), fields(path = ?path))]
    fn open(&self, path: &Path, options: &IoOpenOptions) -> IoResult<Box<dyn IoFile>> {
        let mut std_options = std::fs::OpenOptions::new();
        std_options
            .read(options.read)
            .write(options.write)
            .create(options.create)
            .truncate(options.truncate);
        let file = std_options.open(path).map_err(|e| {
            error!(path = ?path, error = %e, "failed to open datafile");
            IoError::from(e)
        })?;
        debug!(path = ?path, "datafile opened");
        Ok(Box::new(StdIoFile {
            file: Arc::new(file),
        }))
    }
}

struct StdIoFile {
    file: Arc<File>,
}

impl IoFile for StdIoFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let read = read_at(self.file.as_ref(), &mut buf[total..], offset + total as u64)
                .map_err(|e| {
                    error!(offset, error = %e, "read failed");
                    IoError::from(e)
                })?;
            if read == 0 {
                break;
            }
            total += read;
        }
        trace!(offset, bytes = total, "read complete");
        Ok(total)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> IoResult<()> {
        use std::io::{Error, ErrorKind};

        let mut written = 0usize;
        while written < data.len() {
            let count = write_at(self.file.as_ref(), &data[written..], offset + written as u64)
                .map_err(|e| {
                    error!(offset, error = %e, "write failed");
                    IoError::from(e)
                })?;
            if count == 0 {
                return Err(IoError::Io(Error::new(
                    ErrorKind::WriteZero,
                    "write returned zero bytes",
                )));
            }
            written += count;
        }
        trace!(offset, bytes = written, "write complete");
        Ok(())
    }

    fn flush(&self) -> IoResult<()> {
        sync_file_data(self.file.as_ref()).map_err(|e| {
            error!(error = %e, "fdatasync failed");
            IoError::from(e)
        })
    }
}

fn sync_file_data(file: &File) -> std::io::Result<()> {
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        use std::os::unix::io::AsRawFd;

        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::ENOSYS || code == libc::EINVAL => file.sync_all(),
            _ => Err(err),
        }
    }

    #[cfg(any(not(unix), target_os = "macos"))]
    {
        file.sync_all()
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn std_driver_read_write_roundtrip() {
        let driver = StdIoDriver::new();
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("space.ibd");

        let file = driver
            .open(&path, &IoOpenOptions::read_write())
            .expect("open file");
        file.write_at(4096, &[1, 2, 3, 4]).expect("write");
        file.flush().expect("flush");

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(4096, &mut buf).expect("read"), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), 4100);
    }

    #[test]
    fn read_past_end_is_zero_filled() {
        let driver = StdIoDriver::new();
        let dir = tempdir().expect("tempdir");
        let file = driver
            .open(&dir.path().join("short.ibd"), &IoOpenOptions::read_write())
            .expect("open file");
        file.write_at(0, &[9u8; 10]).expect("write");

        let mut buf = [0xffu8; 16];
        file.read_exact_or_zero(4, &mut buf).expect("read");
        assert_eq!(&buf[..6], &[9u8; 6]);
        assert!(buf[6..].iter().all(|b| *b == 0));
    }
}
