//! Doublewrite buffer.
//!
//! Page images bound for their datafiles are first collected in memory, then
//! written as one sequential run into two reserved blocks of the system
//! tablespace and synced. Only after that are the images written to their
//! real locations. A page torn by a crash at its real location can then be
//! restored from its copy in the doublewrite blocks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::buffer_pool::{FlushClass, FrameId};
use crate::config::DoublewriteConfig;
use crate::datafile::{DatafileError, Datafiles};
use crate::log::Lsn;
use crate::page::{self, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID, PageId};
use crate::tablespace::{SYSTEM_SPACE_ID, TablespaceRegistry};

#[derive(Debug, Error)]
pub enum DoublewriteError {
    #[error("compressed page {page} changed checksum while staged")]
    ZipChecksumMismatch { page: PageId },
    #[error("page image of {len} bytes does not fit a {page_size} byte slot")]
    ImageTooLarge { len: usize, page_size: usize },
    #[error(transparent)]
    Datafile(#[from] DatafileError),
}

/// A page write handed to the stager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPage {
    pub frame: FrameId,
    pub id: PageId,
    pub class: FlushClass,
    pub zip_size: Option<usize>,
    pub lsn: Lsn,
}

/// Notified once a staged page has reached its real location, or once the
/// stager has given up on writing it.
pub trait WriteCompletion {
    fn write_complete(&self, page: &StagedPage);

    /// The page was not written and stays dirty. Called at most once per
    /// staged page, in place of [`WriteCompletion::write_complete`].
    fn write_failed(&self, page: &StagedPage);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoublewriteSnapshot {
    pub enabled: bool,
    pub capacity: usize,
    pub staged: usize,
    pub pages_staged: u64,
    pub drains: u64,
    pub pages_written: u64,
    pub lsn_mismatches: u64,
    pub pages_restored: u64,
}

#[derive(Debug, Default)]
struct DoublewriteMetrics {
    pages_staged: AtomicU64,
    drains: AtomicU64,
    pages_written: AtomicU64,
    lsn_mismatches: AtomicU64,
    pages_restored: AtomicU64,
}

struct StagingBuffer {
    /// `capacity` page-sized slots.
    slots: Vec<u8>,
    pages: Vec<StagedPage>,
}

pub struct DoublewriteStager {
    config: DoublewriteConfig,
    page_size: usize,
    datafiles: Arc<dyn Datafiles>,
    buffer: Mutex<StagingBuffer>,
    metrics: DoublewriteMetrics,
}

impl DoublewriteStager {
    pub fn new(config: DoublewriteConfig, page_size: usize, datafiles: Arc<dyn Datafiles>) -> Self {
        let capacity = if config.enabled { config.capacity() } else { 0 };
        Self {
            config,
            page_size,
            datafiles,
            buffer: Mutex::new(StagingBuffer {
                slots: vec![0u8; capacity * page_size],
                pages: Vec::with_capacity(capacity),
            }),
            metrics: DoublewriteMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// Whether `page_no` of the system tablespace lies in a doublewrite block.
    pub fn is_inside(&self, page_no: u32) -> bool {
        let block = self.config.block_size as u32;
        let in_block = |start: u32| page_no >= start && page_no < start + block;
        in_block(self.config.block1_page_no) || in_block(self.config.block2_page_no)
    }

    /// Copies `image` into the next free slot, draining first if the buffer
    /// is full and after if this page filled it.
    #[instrument(skip(self, image, completion), fields(page = %page.id))]
    pub fn stage(
        &self,
        page: StagedPage,
        image: &[u8],
        completion: &dyn WriteCompletion,
    ) -> Result<(), DoublewriteError> {
        if image.len() > self.page_size {
            completion.write_failed(&page);
            return Err(DoublewriteError::ImageTooLarge {
                len: image.len(),
                page_size: self.page_size,
            });
        }
        if !self.config.enabled {
            return self.write_direct(page, image, completion);
        }

        let capacity = self.capacity();
        loop {
            let mut buffer = self.buffer.lock();
            if buffer.pages.len() >= capacity {
                drop(buffer);
                if let Err(err) = self.drain(completion) {
                    completion.write_failed(&page);
                    return Err(err);
                }
                continue;
            }

            let slot = buffer.pages.len() * self.page_size;
            let target = &mut buffer.slots[slot..slot + self.page_size];
            target[..image.len()].copy_from_slice(image);
            target[image.len()..].fill(0);
            if let Some(zip_size) = page.zip_size {
                let staged_checksum = page::calc_zip_checksum(target, zip_size);
                if staged_checksum != page::read_u32(image, page::FIL_PAGE_SPACE_OR_CHKSUM) {
                    error!(page = %page.id, "compressed page corrupted while staged");
                    drop(buffer);
                    completion.write_failed(&page);
                    return Err(DoublewriteError::ZipChecksumMismatch { page: page.id });
                }
            }
            buffer.pages.push(page);
            self.metrics.pages_staged.fetch_add(1, Ordering::Relaxed);
            let full = buffer.pages.len() >= capacity;
            drop(buffer);

            if full {
                self.drain(completion)?;
            }
            return Ok(());
        }
    }

    /// Writes every staged page: doublewrite blocks first, a sync, then the
    /// real locations, another sync, and finally the completions.
    #[instrument(skip(self, completion))]
    pub fn drain(&self, completion: &dyn WriteCompletion) -> Result<(), DoublewriteError> {
        let mut buffer = self.buffer.lock();
        if buffer.pages.is_empty() {
            return Ok(());
        }
        let staged = buffer.pages.len();
        let page_size = self.page_size;

        for (i, page) in buffer.pages.iter().enumerate() {
            let slot = &buffer.slots[i * page_size..(i + 1) * page_size];
            if page.zip_size.is_none() && !page::lsn_markers_match(slot) {
                self.metrics.lsn_mismatches.fetch_add(1, Ordering::Relaxed);
                warn!(page = %page.id, "page LSN does not match the trailer LSN before write");
            }
        }

        if let Err(err) = self.write_staged(&buffer) {
            error!(pages = staged, error = %err, "doublewrite batch write failed");
            buffer.slots.fill(0);
            for page in buffer.pages.drain(..) {
                completion.write_failed(&page);
            }
            return Err(err.into());
        }

        buffer.slots.fill(0);
        for page in buffer.pages.drain(..) {
            completion.write_complete(&page);
        }

        self.metrics.drains.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .pages_written
            .fetch_add(staged as u64, Ordering::Relaxed);
        debug!(pages = staged, "doublewrite batch written");
        Ok(())
    }

    fn write_staged(&self, buffer: &StagingBuffer) -> Result<(), DatafileError> {
        let page_size = self.page_size;
        let staged = buffer.pages.len();
        let block_size = self.config.block_size;
        let first = staged.min(block_size);
        self.datafiles.write(
            SYSTEM_SPACE_ID,
            self.config.block1_page_no as u64 * page_size as u64,
            &buffer.slots[..first * page_size],
            true,
        )?;
        if staged > block_size {
            self.datafiles.write(
                SYSTEM_SPACE_ID,
                self.config.block2_page_no as u64 * page_size as u64,
                &buffer.slots[block_size * page_size..staged * page_size],
                true,
            )?;
        }
        self.datafiles.flush(SYSTEM_SPACE_ID)?;

        for (i, page) in buffer.pages.iter().enumerate() {
            let len = page.zip_size.unwrap_or(page_size);
            let slot = &buffer.slots[i * page_size..i * page_size + len];
            self.datafiles
                .write(page.id.space_id, page.id.page_no as u64 * len as u64, slot, true)?;
        }
        self.datafiles.fsync_all_pending_writes()
    }

    fn write_direct(
        &self,
        page: StagedPage,
        image: &[u8],
        completion: &dyn WriteCompletion,
    ) -> Result<(), DoublewriteError> {
        let len = page.zip_size.unwrap_or(self.page_size).min(image.len());
        if let Err(err) = self.datafiles.write(
            page.id.space_id,
            page.id.page_no as u64 * len as u64,
            &image[..len],
            false,
        ) {
            completion.write_failed(&page);
            return Err(err.into());
        }
        self.metrics.pages_written.fetch_add(1, Ordering::Relaxed);
        completion.write_complete(&page);
        Ok(())
    }

    /// Rewrites pages whose real copy is torn from their doublewrite copy.
    ///
    /// Run before any page is read, after all tablespaces are registered.
    #[instrument(skip(self, spaces))]
    pub fn restore_torn_pages(&self, spaces: &TablespaceRegistry) -> Result<usize, DoublewriteError> {
        if !self.config.enabled {
            return Ok(0);
        }
        let page_size = self.page_size;
        let block_bytes = self.config.block_size * page_size;
        let mut copies = self.datafiles.read(
            SYSTEM_SPACE_ID,
            self.config.block1_page_no as u64 * page_size as u64,
            block_bytes,
        )?;
        copies.extend(self.datafiles.read(
            SYSTEM_SPACE_ID,
            self.config.block2_page_no as u64 * page_size as u64,
            block_bytes,
        )?);

        let mut restored = 0;
        for copy in copies.chunks_exact(page_size) {
            if page::is_blank(copy) {
                continue;
            }
            let id = PageId::new(
                page::read_u32(copy, FIL_PAGE_SPACE_ID),
                page::read_u32(copy, FIL_PAGE_OFFSET),
            );
            let Some(space) = spaces.get(id.space_id) else {
                debug!(page = %id, "doublewrite copy of unknown tablespace ignored");
                continue;
            };
            let zip_size = space.zip_size();
            let len = zip_size.unwrap_or(page_size);
            if !page::verify_checksum(&copy[..len], zip_size) {
                debug!(page = %id, "torn doublewrite copy ignored");
                continue;
            }
            let offset = id.page_no as u64 * len as u64;
            let current = self.datafiles.read(id.space_id, offset, len)?;
            if page::verify_checksum(&current, zip_size) {
                continue;
            }
            warn!(page = %id, "restoring torn page from doublewrite buffer");
            self.datafiles.write(id.space_id, offset, &copy[..len], false)?;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "doublewrite recovery complete");
        }
        self.metrics
            .pages_restored
            .fetch_add(restored as u64, Ordering::Relaxed);
        Ok(restored)
    }

    pub fn staged_len(&self) -> usize {
        self.buffer.lock().pages.len()
    }

    pub fn snapshot(&self) -> DoublewriteSnapshot {
        DoublewriteSnapshot {
            enabled: self.config.enabled,
            capacity: self.capacity(),
            staged: self.staged_len(),
            pages_staged: self.metrics.pages_staged.load(Ordering::Relaxed),
            drains: self.metrics.drains.load(Ordering::Relaxed),
            pages_written: self.metrics.pages_written.load(Ordering::Relaxed),
            lsn_mismatches: self.metrics.lsn_mismatches.load(Ordering::Relaxed),
            pages_restored: self.metrics.pages_restored.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DoublewriteStager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoublewriteStager")
            .field("config", &self.config)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::FileDatafiles;
    use crate::page::{PAGE_TYPE_INDEX, init_for_writing, init_header};
    use crate::tablespace::{SpacePurpose, Tablespace};

    const PAGE: usize = 4096;

    #[derive(Default)]
    struct Completed(Mutex<Vec<PageId>>);

    impl WriteCompletion for Completed {
        fn write_complete(&self, page: &StagedPage) {
            self.0.lock().push(page.id);
        }

        fn write_failed(&self, page: &StagedPage) {
            panic!("write of {} failed", page.id);
        }
    }

    fn setup(block_size: usize) -> (tempfile::TempDir, Arc<FileDatafiles>, DoublewriteStager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = Arc::new(FileDatafiles::new(dir.path()));
        files.open_space(0).expect("open system");
        files.open_space(3).expect("open space");
        let config = DoublewriteConfig {
            enabled: true,
            block_size,
            block1_page_no: 8,
            block2_page_no: 8 + block_size as u32,
        };
        let stager = DoublewriteStager::new(config, PAGE, files.clone());
        (dir, files, stager)
    }

    fn image(page_no: u32, lsn: Lsn) -> Vec<u8> {
        let mut page = vec![0u8; PAGE];
        init_header(&mut page, PageId::new(3, page_no), PAGE_TYPE_INDEX);
        page[100] = page_no as u8;
        init_for_writing(&mut page, lsn, None);
        page
    }

    fn staged(page_no: u32, lsn: Lsn) -> StagedPage {
        StagedPage {
            frame: page_no as usize,
            id: PageId::new(3, page_no),
            class: FlushClass::Checkpoint,
            zip_size: None,
            lsn,
        }
    }

    #[test]
    fn filling_the_buffer_triggers_a_drain() {
        let (_dir, files, stager) = setup(2);
        let done = Completed::default();
        for page_no in 1..=4 {
            stager.stage(staged(page_no, 10), &image(page_no, 10), &done).expect("stage");
        }
        assert_eq!(done.0.lock().len(), 4);
        assert_eq!(stager.staged_len(), 0);

        let on_disk = files.read(3, 2 * PAGE as u64, PAGE).expect("read");
        assert_eq!(on_disk, image(2, 10));
        let copy = files.read(0, 9 * PAGE as u64, PAGE).expect("read copy");
        assert_eq!(copy, image(2, 10));
    }

    #[test]
    fn drain_of_empty_buffer_is_a_no_op() {
        let (_dir, files, stager) = setup(2);
        stager.drain(&Completed::default()).expect("drain");
        assert_eq!(files.write_count(), 0);
        assert_eq!(stager.snapshot().drains, 0);
    }

    #[test]
    fn torn_page_is_restored() {
        let (_dir, files, stager) = setup(2);
        let done = Completed::default();
        stager.stage(staged(5, 40), &image(5, 40), &done).expect("stage");
        stager.drain(&done).expect("drain");

        let mut torn = image(5, 40);
        torn[PAGE / 2..].fill(0xee);
        files.write(3, 5 * PAGE as u64, &torn, false).expect("tear");

        let spaces = TablespaceRegistry::new();
        spaces.register(Tablespace::new(3, "t", SpacePurpose::Tablespace, 16, 0));
        assert_eq!(stager.restore_torn_pages(&spaces).expect("restore"), 1);
        assert_eq!(files.read(3, 5 * PAGE as u64, PAGE).expect("read"), image(5, 40));
        assert_eq!(stager.restore_torn_pages(&spaces).expect("restore"), 0);
    }

    #[test]
    fn disabled_buffer_writes_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = Arc::new(FileDatafiles::new(dir.path()));
        files.open_space(3).expect("open space");
        let config = DoublewriteConfig {
            enabled: false,
            ..DoublewriteConfig::default()
        };
        let stager = DoublewriteStager::new(config, PAGE, files.clone());
        let done = Completed::default();
        stager.stage(staged(1, 5), &image(1, 5), &done).expect("stage");
        assert_eq!(*done.0.lock(), vec![PageId::new(3, 1)]);
        assert_eq!(files.read(3, PAGE as u64, PAGE).expect("read"), image(1, 5));
    }

    #[test]
    fn block_membership() {
        let (_dir, _files, stager) = setup(4);
        assert!(stager.is_inside(8));
        assert!(stager.is_inside(15));
        assert!(!stager.is_inside(16));
        assert!(!stager.is_inside(7));
    }
}
