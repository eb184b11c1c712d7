use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use crate::buffer_pool::{FlushClass, FrameId, IoFix, PoolCore};
use crate::crypt::{self, CryptError};
use crate::dirty_index::DirtyIndexError;
use crate::doublewrite::{DoublewriteError, DoublewriteStager, StagedPage, WriteCompletion};
use crate::error::ErrorCode;
use crate::log::{LogWaitMode, Lsn, RedoLog};
use crate::page::{self, FIL_PAGE_KEY_VERSION, FIL_PAGE_LSN, PageId};

/// Outcome of [`FlushController::flush_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushBatchResult {
    /// Pages handed to the doublewrite buffer, neighbours included.
    Flushed(usize),
    /// A batch of the same class was already running.
    Busy,
}

/// Errors surfaced while writing dirty pages. All of them are fatal to the
/// background cleaner.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error(transparent)]
    Doublewrite(#[from] DoublewriteError),
    #[error("page {page} could not be encrypted for writing: {source}")]
    Encrypt {
        page: PageId,
        #[source]
        source: CryptError,
    },
    #[error("flush list is inconsistent: {0}")]
    Index(#[from] DirtyIndexError),
    #[error("frame {frame} disagrees with the flush list: {reason}")]
    FrameMismatch { frame: FrameId, reason: String },
}

impl FlushError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FlushError::Doublewrite(DoublewriteError::Datafile(_)) => ErrorCode::IoFailure,
            FlushError::Doublewrite(_) => ErrorCode::DataCorruption,
            FlushError::Encrypt {
                source: CryptError::KeyUnavailable { .. },
                ..
            } => ErrorCode::KeyUnavailable,
            FlushError::Encrypt { .. } => ErrorCode::FlushFailure,
            FlushError::Index(_) | FlushError::FrameMismatch { .. } => ErrorCode::DataCorruption,
        }
    }
}

/// Snapshot of flush metrics for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushControllerSnapshot {
    pub dirty_pages: usize,
    pub oldest_modification: Option<Lsn>,
    /// Writes in flight, indexed by [`FlushClass::index`].
    pub in_flight: [usize; 2],
    pub batch_running: [bool; 2],
    pub batches: [u64; 2],
    pub pages_flushed: [u64; 2],
    pub busy: [u64; 2],
    /// Page writes abandoned after an I/O or staging failure.
    pub aborted: [u64; 2],
    pub neighbours: u64,
    pub evicted: u64,
    pub failures: u64,
    pub lru_flush_page_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct FlushMetrics {
    batches: [AtomicU64; 2],
    pages_flushed: [AtomicU64; 2],
    busy: [AtomicU64; 2],
    aborted: [AtomicU64; 2],
    neighbours: AtomicU64,
    evicted: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl FlushMetrics {
    fn record_batch(&self, class: FlushClass) {
        self.batches[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_busy(&self, class: FlushClass) {
        self.busy[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_written(&self, class: FlushClass) {
        self.pages_flushed[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_aborted(&self, class: FlushClass) {
        self.aborted[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_neighbour(&self) {
        self.neighbours.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evicted(&self, n: usize) {
        self.evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &FlushError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// Writes dirty pages through the doublewrite buffer.
///
/// Two flush classes run independently: at most one batch of each class is
/// in progress at a time, and a second request of the same class returns
/// [`FlushBatchResult::Busy`] rather than queueing.
pub struct FlushController {
    core: Arc<PoolCore>,
    doublewrite: Arc<DoublewriteStager>,
    log: Arc<dyn RedoLog>,
    metrics: FlushMetrics,
}

impl FlushController {
    pub fn new(core: Arc<PoolCore>, doublewrite: Arc<DoublewriteStager>, log: Arc<dyn RedoLog>) -> Self {
        Self {
            core,
            doublewrite,
            log,
            metrics: FlushMetrics::default(),
        }
    }

    pub fn doublewrite(&self) -> &Arc<DoublewriteStager> {
        &self.doublewrite
    }

    /// Runs one batch of `class`.
    ///
    /// Eviction batches walk the LRU from its tail, freeing clean frames and
    /// writing dirty ones until `min_n` frames were handled. Checkpoint
    /// batches write up to `min_n` pages from the flush list tail whose
    /// oldest modification is below `lsn_limit`. The doublewrite buffer is
    /// drained before the batch ends.
    #[instrument(skip(self), fields(class = class.as_str()))]
    pub fn flush_batch(&self, class: FlushClass, min_n: usize, lsn_limit: Lsn) -> Result<FlushBatchResult, FlushError> {
        let c = class.index();
        {
            let mut inner = self.core.inner.lock();
            if inner.n_flush[c] > 0 || inner.init_flush[c] {
                self.metrics.record_busy(class);
                trace!("flush batch of this class already running");
                return Ok(FlushBatchResult::Busy);
            }
            inner.init_flush[c] = true;
        }
        self.metrics.record_batch(class);

        let batch = match class {
            FlushClass::Eviction => self.flush_lru_batch(min_n),
            FlushClass::Checkpoint => self.flush_list_batch(min_n, lsn_limit),
        };
        // Pages staged before a failure still have to be written or released.
        let drained = self.doublewrite.drain(self);
        let result = match (batch, drained) {
            (Ok(count), Ok(())) => Ok(count),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
        };

        {
            let mut inner = self.core.inner.lock();
            inner.init_flush[c] = false;
            if let (FlushClass::Eviction, Ok(count)) = (class, &result) {
                inner.lru_flush_page_count += *count as u64;
            }
            if inner.n_flush[c] == 0 {
                self.core.no_flush[c].notify_all();
            }
        }

        match result {
            Ok(count) => {
                if count > 0 {
                    debug!(pages = count, "flush batch complete");
                }
                Ok(FlushBatchResult::Flushed(count))
            }
            Err(err) => {
                error!(error = %err, "flush batch failed");
                self.metrics.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Blocks until no batch of `class` is running and none of its writes
    /// are in flight.
    pub fn wait_for_batch_end(&self, class: FlushClass) {
        let c = class.index();
        let mut inner = self.core.inner.lock();
        while inner.n_flush[c] > 0 || inner.init_flush[c] {
            self.core.no_flush[c].wait(&mut inner);
        }
    }

    /// Frames an eviction batch should produce so that enough replaceable
    /// frames sit near the LRU tail; zero when there already are.
    pub fn lru_recommendation(&self) -> usize {
        let config = &self.core.flush_config;
        let wanted = config.free_block_margin + config.extra_margin;
        let inner = self.core.inner.lock();
        let mut replaceable = inner.free.len();
        for frame in inner.lru.iter_rev().take(config.lru_free_search_len) {
            if replaceable >= wanted {
                break;
            }
            if self.core.slot(frame).meta.lock().ready_for_replace() {
                replaceable += 1;
            }
        }
        if replaceable >= config.free_block_margin {
            0
        } else {
            wanted - replaceable
        }
    }

    /// Runs an eviction batch if too few replaceable frames are left.
    pub fn free_margin(&self) -> Result<(), FlushError> {
        let wanted = self.lru_recommendation();
        if wanted == 0 {
            return Ok(());
        }
        if self.flush_batch(FlushClass::Eviction, wanted, 0)? == FlushBatchResult::Busy {
            self.wait_for_batch_end(FlushClass::Eviction);
        }
        Ok(())
    }

    /// Writes every page whose oldest modification is at or below `lsn`.
    #[instrument(skip(self))]
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<(), FlushError> {
        loop {
            match self.core.oldest_modification() {
                Some(oldest) if oldest <= lsn => {}
                _ => return Ok(()),
            }
            match self.flush_batch(FlushClass::Checkpoint, usize::MAX, lsn.saturating_add(1))? {
                FlushBatchResult::Busy => self.wait_for_batch_end(FlushClass::Checkpoint),
                FlushBatchResult::Flushed(0) => {
                    // The remaining pages are being written by an eviction batch.
                    self.wait_for_batch_end(FlushClass::Eviction);
                    thread::sleep(Duration::from_millis(1));
                }
                FlushBatchResult::Flushed(_) => {}
            }
        }
    }

    /// Cross-checks the flush list against the frames it references.
    pub fn validate(&self) -> Result<(), FlushError> {
        let inner = self.core.inner.lock();
        inner.dirty.validate()?;
        for (frame, entry) in inner.dirty.iter_oldest_first() {
            let meta = self.core.slot(frame).meta.lock();
            let Some(file) = meta.file() else {
                return Err(FlushError::FrameMismatch {
                    frame,
                    reason: "listed frame holds no page".into(),
                });
            };
            if file.id != entry.id || file.oldest_modification != entry.oldest_modification {
                return Err(FlushError::FrameMismatch {
                    frame,
                    reason: format!(
                        "frame holds {} at lsn {}, list has {} at lsn {}",
                        file.id, file.oldest_modification, entry.id, entry.oldest_modification
                    ),
                });
            }
            if !file.in_flush_list {
                return Err(FlushError::FrameMismatch {
                    frame,
                    reason: "listed frame not marked in flush list".into(),
                });
            }
        }
        for frame in 0..self.core.frame_count() {
            let dirty = self.core.slot(frame).meta.lock().is_dirty();
            if dirty && !inner.dirty.contains(frame) {
                return Err(FlushError::FrameMismatch {
                    frame,
                    reason: "dirty frame missing from flush list".into(),
                });
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> FlushControllerSnapshot {
        let inner = self.core.inner.lock();
        let load = |counters: &[AtomicU64; 2]| {
            [
                counters[0].load(Ordering::Relaxed),
                counters[1].load(Ordering::Relaxed),
            ]
        };
        FlushControllerSnapshot {
            dirty_pages: inner.dirty.len(),
            oldest_modification: inner.dirty.oldest_lsn(),
            in_flight: inner.n_flush,
            batch_running: inner.init_flush,
            batches: load(&self.metrics.batches),
            pages_flushed: load(&self.metrics.pages_flushed),
            busy: load(&self.metrics.busy),
            aborted: load(&self.metrics.aborted),
            neighbours: self.metrics.neighbours.load(Ordering::Relaxed),
            evicted: self.metrics.evicted.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            lru_flush_page_count: inner.lru_flush_page_count,
            last_error: self.metrics.last_error(),
        }
    }

    fn flush_list_batch(&self, min_n: usize, lsn_limit: Lsn) -> Result<usize, FlushError> {
        let mut count = 0;
        let mut cursor: Option<FrameId> = None;
        let mut budget = self.core.frame_count() * 2 + 1;
        while count < min_n && budget > 0 {
            budget -= 1;
            let candidate = {
                let inner = self.core.inner.lock();
                let mut at = match cursor {
                    Some(frame) => inner.dirty.entry(frame).map(|entry| (frame, entry)),
                    None => None,
                }
                .or_else(|| inner.dirty.tail());

                let mut pick = None;
                while let Some((frame, entry)) = at {
                    if entry.oldest_modification >= lsn_limit {
                        break;
                    }
                    let newer = inner.dirty.prev(frame);
                    if self
                        .core
                        .slot(frame)
                        .meta
                        .lock()
                        .ready_for_flush(FlushClass::Checkpoint)
                    {
                        pick = Some((frame, entry.id, newer.map(|(next, _)| next)));
                        break;
                    }
                    at = newer;
                }
                pick
            };
            let Some((frame, id, newer)) = candidate else {
                break;
            };
            count += self.flush_page_and_neighbours(frame, id, FlushClass::Checkpoint, min_n - count)?;
            cursor = newer;
        }
        Ok(count)
    }

    fn flush_lru_batch(&self, min_n: usize) -> Result<usize, FlushError> {
        let mut flushed = 0;
        let mut freed = 0;
        let mut scanned = 0;
        let scan_limit = self.core.inner.lock().lru.len();
        // Next frame to look at, toward the LRU head.
        let mut cursor: Option<FrameId> = None;
        let mut started = false;

        while flushed + freed < min_n && scanned < scan_limit {
            let candidate = {
                let mut inner = self.core.inner.lock();
                let at = match cursor {
                    Some(frame) if inner.lru.contains(frame) => Some(frame),
                    Some(_) => inner.lru.back(),
                    None if !started => inner.lru.back(),
                    None => None,
                };
                started = true;
                let Some(frame) = at else { break };
                scanned += 1;
                cursor = inner.lru.prev(frame);

                if self.core.free_if_replaceable(&mut inner, frame) {
                    freed += 1;
                    None
                } else {
                    let meta = self.core.slot(frame).meta.lock();
                    match meta.id() {
                        Some(id) if meta.ready_for_flush(FlushClass::Eviction) => Some((frame, id)),
                        _ => None,
                    }
                }
            };
            if let Some((frame, id)) = candidate {
                let remaining = min_n - (flushed + freed);
                flushed += self.flush_page_and_neighbours(frame, id, FlushClass::Eviction, remaining)?;
            }
            if cursor.is_none() {
                break;
            }
        }
        self.metrics.record_evicted(freed);
        Ok(flushed)
    }

    /// Writes `id` and, when the LRU is long enough, the dirty pages around
    /// it in the same flush area. Eviction only takes neighbours from the old
    /// sublist. Returns the number of pages written.
    fn flush_page_and_neighbours(
        &self,
        frame: FrameId,
        id: PageId,
        class: FlushClass,
        limit: usize,
    ) -> Result<usize, FlushError> {
        let (low, high) = {
            let inner = self.core.inner.lock();
            if inner.lru_has_old_sublist() {
                let area = self.core.flush_config.flush_area(self.core.frame_count());
                let low = id.page_no / area * area;
                let size = self
                    .core
                    .spaces
                    .get(id.space_id)
                    .map_or(id.page_no + 1, |space| space.size());
                (low, (low + area).min(size).max(id.page_no + 1))
            } else {
                (id.page_no, id.page_no + 1)
            }
        };

        let mut count = 0;
        for page_no in low..high {
            let is_target = page_no == id.page_no;
            if !is_target && count >= limit {
                continue;
            }
            let target = if is_target {
                Some((frame, id))
            } else {
                let neighbour = PageId::new(id.space_id, page_no);
                let inner = self.core.inner.lock();
                inner
                    .page_hash
                    .get(&neighbour)
                    .copied()
                    .filter(|f| class != FlushClass::Eviction || inner.is_old(*f))
                    .map(|f| (f, neighbour))
            };
            let Some((frame, page)) = target else { continue };
            if self.flush_page(frame, page, class)? {
                count += 1;
                if !is_target {
                    self.metrics.record_neighbour();
                }
            }
        }
        Ok(count)
    }

    /// Starts the write of one page. Returns false if the page is no longer
    /// flushable or, for eviction, its latch is taken.
    fn flush_page(&self, frame: FrameId, id: PageId, class: FlushClass) -> Result<bool, FlushError> {
        let slot = self.core.slot(frame);
        let latched = {
            let mut inner = self.core.inner.lock();
            let mut meta = slot.meta.lock();
            if !meta.holds(id) || !meta.ready_for_flush(class) {
                return Ok(false);
            }
            let latched = slot.latch.try_s_lock();
            if !latched && class == FlushClass::Eviction {
                return Ok(false);
            }
            if let Some(file) = meta.file_mut() {
                file.io_fix = IoFix::Write;
                file.flush_type = Some(class);
            }
            inner.n_flush[class.index()] += 1;
            latched
        };

        if !latched {
            // The holder of the exclusive latch may be waiting on a page we
            // staged; write the staged pages before blocking.
            if let Err(err) = self.doublewrite.drain(self) {
                self.abort_write(frame, class, false);
                return Err(err.into());
            }
            slot.latch.s_lock();
        }

        let prepared = match self.prepare_image(frame, id) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.abort_write(frame, class, true);
                return Err(err);
            }
        };
        match prepared {
            Some((image, zip_size, lsn)) => {
                let staged = StagedPage {
                    frame,
                    id,
                    class,
                    zip_size,
                    lsn,
                };
                self.doublewrite.stage(staged, &image, self)?;
            }
            None => {
                debug!(page = %id, "tablespace dropped, discarding page write");
                self.write_complete(&StagedPage {
                    frame,
                    id,
                    class,
                    zip_size: None,
                    lsn: 0,
                });
            }
        }
        Ok(true)
    }

    /// Builds the on-disk image of a latched page: redo first, then the
    /// page LSN and key version, encryption and checksums.
    fn prepare_image(&self, frame: FrameId, id: PageId) -> Result<Option<(Vec<u8>, Option<usize>, Lsn)>, FlushError> {
        let slot = self.core.slot(frame);
        let newest = slot
            .meta
            .lock()
            .file()
            .map_or(0, |file| file.newest_modification);
        self.log.write_up_to(newest, LogWaitMode::Flushed);

        let Some(space) = self.core.spaces.get(id.space_id) else {
            return Ok(None);
        };
        let zip_size = space.zip_size();
        let encryption = crypt::encryption_for_write(&space, id.page_no);
        let physical = space.physical_page_size(self.core.page_size);
        let mut image = {
            let mut data = slot.data.write();
            page::write_u64(&mut data, FIL_PAGE_LSN, newest);
            page::write_u32(&mut data, FIL_PAGE_KEY_VERSION, encryption.key_version());
            data[..physical].to_vec()
        };
        crypt::encrypt_image(&space, self.core.keyring.as_ref(), &encryption, &mut image, id.page_no)
            .map_err(|source| FlushError::Encrypt { page: id, source })?;
        page::init_for_writing(&mut image, newest, zip_size);
        Ok(Some((image, zip_size, newest)))
    }

    /// Undoes [`FlushController::flush_page`] for a write that never reached
    /// the datafile. The page stays dirty and becomes flushable again.
    fn abort_write(&self, frame: FrameId, class: FlushClass, latched: bool) {
        let slot = self.core.slot(frame);
        {
            let mut inner = self.core.inner.lock();
            let mut meta = slot.meta.lock();
            if let Some(file) = meta.file_mut() {
                file.io_fix = IoFix::None;
                file.flush_type = None;
            }
            let c = class.index();
            inner.n_flush[c] -= 1;
            if inner.n_flush[c] == 0 && !inner.init_flush[c] {
                self.core.no_flush[c].notify_all();
            }
        }
        if latched {
            slot.latch.s_unlock();
        }
        self.metrics.record_aborted(class);
        warn!(frame, class = class.as_str(), "page write abandoned, page left dirty");
    }
}

impl WriteCompletion for FlushController {
    fn write_complete(&self, page: &StagedPage) {
        let slot = self.core.slot(page.frame);
        {
            let mut inner = self.core.inner.lock();
            let mut meta = slot.meta.lock();
            inner.dirty.remove(page.frame);
            meta.note_written();
            let in_lru = match meta.file_mut() {
                Some(file) => {
                    file.io_fix = IoFix::None;
                    file.flush_type = None;
                    file.in_lru
                }
                None => false,
            };
            if page.class == FlushClass::Eviction && in_lru {
                inner.lru_make_old(page.frame);
            }
            let c = page.class.index();
            inner.n_flush[c] -= 1;
            if inner.n_flush[c] == 0 && !inner.init_flush[c] {
                self.core.no_flush[c].notify_all();
            }
        }
        slot.latch.s_unlock();
        self.metrics.record_written(page.class);
        trace!(page = %page.id, lsn = page.lsn, "page write complete");
    }

    fn write_failed(&self, page: &StagedPage) {
        self.abort_write(page.frame, page.class, true);
    }
}

impl fmt::Debug for FlushController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushController")
            .field("doublewrite", &self.doublewrite)
            .finish()
    }
}
