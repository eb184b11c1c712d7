//! Buffer pool.
//!
//! A fixed arena of page-sized frames. Each frame has a state mutex, a page
//! latch and the page bytes. One pool mutex guards the LRU list, the flush
//! list, the page hash and the free list; it is always taken before a frame
//! mutex and is never held across I/O.
//!
//! The LRU keeps an old sublist at its tail, roughly `lru_old_ratio_pct`
//! percent of the list once it is at least `lru_old_min_len` long. Newly read
//! pages enter at the head of the old sublist and move to the young end when
//! they are touched again.

mod descriptor;
mod latch;

pub use descriptor::{FileFrame, FlushClass, FrameId, IoFix, PageDescriptor, PageState};
pub use latch::PageLatch;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::config::{FlushConfig, PageCacheConfig};
use crate::crypt::{self, CryptError};
use crate::datafile::{DatafileError, Datafiles};
use crate::dirty_index::DirtyPageIndex;
use crate::error::ErrorCode;
use crate::flush::{FlushBatchResult, FlushController, FlushError};
use crate::keyring::Keyring;
use crate::links::IndexList;
use crate::log::Lsn;
use crate::page::{self, PageId};
use crate::tablespace::{Tablespace, TablespaceRegistry};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no free frame after {0} attempts")]
    NoFreeFrame(usize),
    #[error("tablespace {0} is not open")]
    UnknownSpace(u32),
    #[error("page {0} is beyond the end of its tablespace")]
    OutOfRange(PageId),
    #[error("page {0} failed checksum verification")]
    Corrupted(PageId),
    #[error(transparent)]
    Datafile(#[from] DatafileError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Flush(#[from] FlushError),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::NoFreeFrame(_) => ErrorCode::ResourceExhaustion,
            PoolError::UnknownSpace(_) | PoolError::OutOfRange(_) => ErrorCode::OperationCancelled,
            PoolError::Corrupted(_) => ErrorCode::DataCorruption,
            PoolError::Datafile(_) => ErrorCode::IoFailure,
            PoolError::Crypt(CryptError::KeyUnavailable { .. }) => ErrorCode::KeyUnavailable,
            PoolError::Crypt(_) => ErrorCode::DataCorruption,
            PoolError::Flush(err) => err.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// One frame of the arena.
pub(crate) struct FrameSlot {
    pub(crate) meta: Mutex<PageDescriptor>,
    pub(crate) latch: PageLatch,
    pub(crate) data: RwLock<Box<[u8]>>,
}

/// State guarded by the pool mutex.
pub(crate) struct PoolInner {
    pub(crate) lru: IndexList,
    /// Young-most frame of the old sublist.
    lru_old: Option<FrameId>,
    lru_old_len: usize,
    old: Vec<bool>,
    old_min_len: usize,
    old_ratio_pct: usize,
    pub(crate) dirty: DirtyPageIndex,
    pub(crate) page_hash: HashMap<PageId, FrameId>,
    pub(crate) free: Vec<FrameId>,
    /// Writes in flight per flush class.
    pub(crate) n_flush: [usize; 2],
    /// Whether a batch of the class is running.
    pub(crate) init_flush: [bool; 2],
    /// Pages written by eviction batches since startup.
    pub(crate) lru_flush_page_count: u64,
}

impl PoolInner {
    fn new(frames: usize, flush: &FlushConfig) -> Self {
        Self {
            lru: IndexList::with_capacity(frames),
            lru_old: None,
            lru_old_len: 0,
            old: vec![false; frames],
            old_min_len: flush.lru_old_min_len,
            old_ratio_pct: flush.lru_old_ratio_pct,
            dirty: DirtyPageIndex::new(frames),
            page_hash: HashMap::with_capacity(frames),
            // Popped from the back, so frame 0 is handed out first.
            free: (0..frames).rev().collect(),
            n_flush: [0; 2],
            init_flush: [false; 2],
            lru_flush_page_count: 0,
        }
    }

    pub(crate) fn is_old(&self, frame: FrameId) -> bool {
        self.old[frame]
    }

    pub(crate) fn lru_old_len(&self) -> usize {
        self.lru_old_len
    }

    /// Whether the LRU is long enough for neighbour flushing.
    pub(crate) fn lru_has_old_sublist(&self) -> bool {
        self.lru.len() >= self.old_min_len
    }

    /// Adds a freshly loaded page at the head of the old sublist.
    fn lru_add(&mut self, frame: FrameId) {
        match self.lru_old {
            Some(boundary) => {
                match self.lru.prev(boundary) {
                    Some(younger) => self.lru.insert_after(younger, frame),
                    None => self.lru.push_front(frame),
                }
                self.old[frame] = true;
                self.lru_old = Some(frame);
                self.lru_old_len += 1;
            }
            None => self.lru.push_front(frame),
        }
        self.adjust_old();
    }

    fn lru_remove(&mut self, frame: FrameId) {
        if self.lru_old == Some(frame) {
            self.lru_old = self.lru.next(frame);
        }
        if self.old[frame] {
            self.old[frame] = false;
            self.lru_old_len -= 1;
        }
        self.lru.remove(frame);
        self.adjust_old();
    }

    fn lru_make_young(&mut self, frame: FrameId) {
        self.lru_remove(frame);
        self.lru.push_front(frame);
        self.adjust_old();
    }

    /// Moves a frame to the LRU tail, where it is evicted first.
    pub(crate) fn lru_make_old(&mut self, frame: FrameId) {
        self.lru_remove(frame);
        self.lru.push_back(frame);
        if self.lru_has_old_sublist() {
            self.old[frame] = true;
            self.lru_old_len += 1;
            if self.lru_old.is_none() {
                self.lru_old = Some(frame);
            }
        }
        self.adjust_old();
    }

    /// Hands the LRU position of `old`, old-sublist membership included, to
    /// `new`.
    fn lru_relocate(&mut self, old: FrameId, new: FrameId) {
        self.lru.replace(old, new);
        self.old[new] = std::mem::replace(&mut self.old[old], false);
        if self.lru_old == Some(old) {
            self.lru_old = Some(new);
        }
    }

    /// Keeps the old sublist contiguous at the tail at its target length.
    fn adjust_old(&mut self) {
        let len = self.lru.len();
        if len < self.old_min_len {
            let mut cursor = self.lru_old;
            while let Some(frame) = cursor {
                self.old[frame] = false;
                cursor = self.lru.next(frame);
            }
            self.lru_old = None;
            self.lru_old_len = 0;
            return;
        }

        let target = (len * self.old_ratio_pct / 100).max(1);
        while self.lru_old_len < target {
            let candidate = match self.lru_old {
                Some(frame) => self.lru.prev(frame),
                None => self.lru.back(),
            };
            let Some(frame) = candidate else { break };
            self.old[frame] = true;
            self.lru_old = Some(frame);
            self.lru_old_len += 1;
        }
        while self.lru_old_len > target {
            let Some(frame) = self.lru_old else { break };
            self.old[frame] = false;
            self.lru_old = self.lru.next(frame);
            self.lru_old_len -= 1;
        }
    }
}

#[derive(Debug, Default)]
struct PoolMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
    read_failures: AtomicU64,
    evictions: AtomicU64,
    created: AtomicU64,
}

impl PoolMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_read(&self, ok: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.read_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolSnapshot {
    pub frames: usize,
    pub free: usize,
    pub lru_len: usize,
    pub lru_old_len: usize,
    pub dirty: usize,
    pub oldest_modification: Option<Lsn>,
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub evictions: u64,
    pub created: u64,
}

/// Shared pool state used by the facade and the flush controller.
pub struct PoolCore {
    pub(crate) page_size: usize,
    pub(crate) flush_config: FlushConfig,
    pub(crate) frames: Box<[FrameSlot]>,
    pub(crate) inner: Mutex<PoolInner>,
    /// Signalled when the last write of a class completes outside a batch.
    pub(crate) no_flush: [Condvar; 2],
    pub(crate) spaces: Arc<TablespaceRegistry>,
    pub(crate) datafiles: Arc<dyn Datafiles>,
    pub(crate) keyring: Arc<dyn Keyring>,
    metrics: PoolMetrics,
}

impl PoolCore {
    pub fn new(
        config: &PageCacheConfig,
        spaces: Arc<TablespaceRegistry>,
        datafiles: Arc<dyn Datafiles>,
        keyring: Arc<dyn Keyring>,
    ) -> Self {
        let frames = (0..config.pool_frames)
            .map(|frame| FrameSlot {
                meta: Mutex::new(PageDescriptor::new(frame)),
                latch: PageLatch::new(),
                data: RwLock::new(vec![0u8; config.page_size].into_boxed_slice()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            page_size: config.page_size,
            flush_config: config.flush,
            inner: Mutex::new(PoolInner::new(config.pool_frames, &config.flush)),
            frames,
            no_flush: [Condvar::new(), Condvar::new()],
            spaces,
            datafiles,
            keyring,
            metrics: PoolMetrics::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn spaces(&self) -> &Arc<TablespaceRegistry> {
        &self.spaces
    }

    pub(crate) fn slot(&self, frame: FrameId) -> &FrameSlot {
        &self.frames[frame]
    }

    pub fn dirty_len(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.inner.lock().dirty.oldest_lsn()
    }

    pub fn lru_flush_page_count(&self) -> u64 {
        self.inner.lock().lru_flush_page_count
    }

    /// Switches the dirty index to sorted insertion while redo is applied
    /// out of LSN order.
    pub fn set_recovery_order(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        if enabled {
            inner.dirty.enable_recovery_order();
        } else {
            inner.dirty.disable_recovery_order();
        }
    }

    pub fn recovery_order_enabled(&self) -> bool {
        self.inner.lock().dirty.recovery_order_enabled()
    }

    /// Drops the cached pages of `space_id` from the page hash and LRU.
    ///
    /// Unfixed frames go straight to the free list; fixed ones follow on
    /// their last unfix. Dirty pages and pages under I/O are left cached.
    /// Returns how many of those remain.
    #[instrument(skip(self))]
    pub fn evict_space(&self, space_id: u32) -> usize {
        let mut inner = self.inner.lock();
        let frames: Vec<FrameId> = inner
            .page_hash
            .iter()
            .filter(|(id, _)| id.space_id == space_id)
            .map(|(_, frame)| *frame)
            .collect();
        let mut evicted = 0;
        let mut left = 0;
        for frame in frames {
            let mut meta = self.frames[frame].meta.lock();
            let (busy, fixed) = match meta.file() {
                Some(file) => (
                    file.is_dirty() || file.io_fix != IoFix::None,
                    file.buf_fix_count > 0,
                ),
                None => continue,
            };
            if busy {
                left += 1;
                continue;
            }
            self.detach_locked(&mut inner, &mut meta);
            if !fixed {
                meta.state = PageState::NotUsed;
                inner.free.push(frame);
            }
            self.metrics.record_eviction();
            evicted += 1;
        }
        debug!(evicted, left, "tablespace pages evicted");
        left
    }

    /// Dirty pages with their `oldest_modification`, oldest first.
    pub fn dirty_pages(&self) -> Vec<(PageId, Lsn)> {
        self.inner
            .lock()
            .dirty
            .iter_oldest_first()
            .map(|(_, entry)| (entry.id, entry.oldest_modification))
            .collect()
    }

    /// Copy of the descriptor of the frame holding `id`, if cached.
    pub fn descriptor(&self, id: PageId) -> Option<PageDescriptor> {
        let inner = self.inner.lock();
        let frame = *inner.page_hash.get(&id)?;
        let meta = self.frames[frame].meta.lock();
        Some(meta.clone())
    }

    pub fn snapshot(&self) -> BufferPoolSnapshot {
        let inner = self.inner.lock();
        BufferPoolSnapshot {
            frames: self.frames.len(),
            free: inner.free.len(),
            lru_len: inner.lru.len(),
            lru_old_len: inner.lru_old_len(),
            dirty: inner.dirty.len(),
            oldest_modification: inner.dirty.oldest_lsn(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            reads: self.metrics.reads.load(Ordering::Relaxed),
            read_failures: self.metrics.read_failures.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            created: self.metrics.created.load(Ordering::Relaxed),
        }
    }

    /// Takes a frame off the free list, or reclaims a replaceable frame near
    /// the LRU tail. The returned frame is in [`PageState::ReadyForUse`].
    fn try_take_free_frame(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.free.pop() {
            self.frames[frame].meta.lock().state = PageState::ReadyForUse;
            return Some(frame);
        }

        let candidates: Vec<FrameId> = inner
            .lru
            .iter_rev()
            .take(self.flush_config.lru_free_search_len)
            .collect();
        for frame in candidates {
            let mut meta = self.frames[frame].meta.lock();
            if meta.ready_for_replace() {
                self.detach_locked(&mut inner, &mut meta);
                meta.state = PageState::ReadyForUse;
                self.metrics.record_eviction();
                return Some(frame);
            }
        }
        None
    }

    /// Evicts `frame` to the free list if it is replaceable.
    pub(crate) fn free_if_replaceable(&self, inner: &mut PoolInner, frame: FrameId) -> bool {
        let mut meta = self.frames[frame].meta.lock();
        if !meta.ready_for_replace() {
            return false;
        }
        self.detach_locked(inner, &mut meta);
        meta.state = PageState::NotUsed;
        inner.free.push(frame);
        self.metrics.record_eviction();
        true
    }

    /// Unlinks a frame from the LRU and page hash.
    fn detach_locked(&self, inner: &mut PoolInner, meta: &mut PageDescriptor) {
        let frame = meta.frame;
        if let Some(file) = meta.file_mut() {
            if file.in_page_hash {
                inner.page_hash.remove(&file.id);
                file.in_page_hash = false;
            }
            if file.in_lru {
                inner.lru_remove(frame);
                file.in_lru = false;
            }
        }
    }

    fn release_frame(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        self.frames[frame].meta.lock().state = PageState::NotUsed;
        inner.free.push(frame);
    }

    /// Buffer-fixes the frame holding `id` and latches it.
    fn fix_cached(self: &Arc<Self>, id: PageId, mode: LatchMode) -> Option<PageGuard> {
        let frame = {
            let mut inner = self.inner.lock();
            let frame = *inner.page_hash.get(&id)?;
            {
                let mut meta = self.frames[frame].meta.lock();
                meta.file_mut()?.buf_fix_count += 1;
            }
            if inner.is_old(frame) {
                inner.lru_make_young(frame);
            }
            frame
        };

        let slot = &self.frames[frame];
        match mode {
            LatchMode::Shared => slot.latch.s_lock(),
            LatchMode::Exclusive => slot.latch.x_lock(),
        }
        // A failed read may have dropped the page while we waited.
        if !slot.meta.lock().holds(id) {
            match mode {
                LatchMode::Shared => slot.latch.s_unlock(),
                LatchMode::Exclusive => slot.latch.x_unlock(),
            }
            self.unfix(frame);
            return None;
        }
        Some(PageGuard {
            core: self.clone(),
            frame,
            id,
            mode,
        })
    }

    /// Publishes `id` in `frame`, exclusively latched and buffer-fixed.
    ///
    /// Returns false, and frees the frame, if another thread got there first.
    fn install(&self, frame: FrameId, id: PageId, zip_size: Option<usize>, io_fix: IoFix) -> bool {
        let mut inner = self.inner.lock();
        let mut meta = self.frames[frame].meta.lock();
        if inner.page_hash.contains_key(&id) {
            meta.state = PageState::NotUsed;
            inner.free.push(frame);
            return false;
        }
        let latched = self.frames[frame].latch.try_x_lock();
        debug_assert!(latched, "free frame {frame} is latched");

        let mut file = FileFrame::new(id, zip_size);
        file.io_fix = io_fix;
        file.buf_fix_count = 1;
        file.in_page_hash = true;
        file.in_lru = true;
        meta.assign(file);
        inner.page_hash.insert(id, frame);
        drop(meta);
        inner.lru_add(frame);
        true
    }

    /// Reads, verifies and decrypts `id` into `frame`.
    fn read_into(&self, frame: FrameId, space: &Tablespace, id: PageId) -> Result<(), PoolError> {
        let physical = space.physical_page_size(self.page_size);
        let offset = id.page_no as u64 * physical as u64;
        let mut image = self.datafiles.read(id.space_id, offset, physical)?;
        if !page::verify_checksum(&image, space.zip_size()) {
            space.mark_corrupted();
            return Err(PoolError::Corrupted(id));
        }
        if let Err(err) = crypt::decrypt_image(space, self.keyring.as_ref(), &mut image, id.page_no) {
            space.mark_corrupted();
            return Err(err.into());
        }
        let mut data = self.frames[frame].data.write();
        data[..physical].copy_from_slice(&image);
        data[physical..].fill(0);
        Ok(())
    }

    /// Clears the read fix after a successful read.
    fn complete_read(&self, frame: FrameId) {
        if let Some(file) = self.frames[frame].meta.lock().file_mut() {
            file.io_fix = IoFix::None;
        }
    }

    /// Unpublishes a page whose read failed. Waiters see the page gone and
    /// the last one to unfix returns the frame.
    fn abort_read(&self, frame: FrameId) {
        let slot = &self.frames[frame];
        {
            let mut inner = self.inner.lock();
            let mut meta = slot.meta.lock();
            self.detach_locked(&mut inner, &mut meta);
            let mut orphaned = false;
            if let Some(file) = meta.file_mut() {
                file.io_fix = IoFix::None;
                file.buf_fix_count -= 1;
                orphaned = file.buf_fix_count == 0;
            }
            if orphaned {
                meta.state = PageState::NotUsed;
                inner.free.push(frame);
            }
        }
        slot.latch.x_unlock();
    }

    fn unfix(&self, frame: FrameId) {
        let slot = &self.frames[frame];
        let orphaned = {
            let mut meta = slot.meta.lock();
            match meta.file_mut() {
                Some(file) => {
                    debug_assert!(file.buf_fix_count > 0, "frame {frame} not fixed");
                    file.buf_fix_count = file.buf_fix_count.saturating_sub(1);
                    file.buf_fix_count == 0 && !file.in_page_hash
                }
                None => false,
            }
        };
        if orphaned {
            let mut inner = self.inner.lock();
            let mut meta = slot.meta.lock();
            let still_orphaned = meta
                .file()
                .is_some_and(|file| file.buf_fix_count == 0 && !file.in_page_hash);
            if still_orphaned {
                meta.state = PageState::NotUsed;
                inner.free.push(frame);
            }
        }
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("page_size", &self.page_size)
            .field("frames", &self.frames.len())
            .finish()
    }
}

/// A buffer-fixed, latched page. Dropping it releases both.
pub struct PageGuard {
    core: Arc<PoolCore>,
    frame: FrameId,
    id: PageId,
    mode: LatchMode,
}

impl PageGuard {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.core.frames[self.frame].data.read()
    }

    /// Mutable page bytes; the guard must hold the exclusive latch.
    pub fn data_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        debug_assert_eq!(self.mode, LatchMode::Exclusive, "page {} not x-latched", self.id);
        self.core.frames[self.frame].data.write()
    }

    /// Records a change made under the exclusive latch, committed at `lsn`.
    pub fn mark_dirty(&self, lsn: Lsn) {
        debug_assert_eq!(self.mode, LatchMode::Exclusive, "page {} not x-latched", self.id);
        let mut inner = self.core.inner.lock();
        let mut meta = self.core.frames[self.frame].meta.lock();
        if meta.note_modification(lsn) {
            inner.dirty.insert(self.frame, self.id, lsn);
        }
    }

    pub fn oldest_modification(&self) -> Lsn {
        let meta = self.core.frames[self.frame].meta.lock();
        meta.file().map_or(0, |file| file.oldest_modification)
    }

    pub fn newest_modification(&self) -> Lsn {
        let meta = self.core.frames[self.frame].meta.lock();
        meta.file().map_or(0, |file| file.newest_modification)
    }

    pub fn is_dirty(&self) -> bool {
        self.core.frames[self.frame].meta.lock().is_dirty()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let slot = &self.core.frames[self.frame];
        match self.mode {
            LatchMode::Shared => slot.latch.s_unlock(),
            LatchMode::Exclusive => slot.latch.x_unlock(),
        }
        self.core.unfix(self.frame);
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("id", &self.id)
            .field("frame", &self.frame)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A frame lent out as scratch memory; returned to the free list on drop.
pub struct ScratchFrame {
    core: Arc<PoolCore>,
    frame: FrameId,
}

impl ScratchFrame {
    pub fn data_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.core.frames[self.frame].data.write()
    }
}

impl Drop for ScratchFrame {
    fn drop(&mut self) {
        self.core.frames[self.frame].data.write().fill(0);
        self.core.release_frame(self.frame);
    }
}

impl fmt::Debug for ScratchFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchFrame").field("frame", &self.frame).finish()
    }
}

/// Page access facade.
pub struct BufferPool {
    core: Arc<PoolCore>,
    flusher: Arc<FlushController>,
}

impl BufferPool {
    pub fn new(core: Arc<PoolCore>, flusher: Arc<FlushController>) -> Self {
        Self { core, flusher }
    }

    pub fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }

    pub fn flusher(&self) -> &Arc<FlushController> {
        &self.flusher
    }

    /// Returns the page latched in `mode`, reading it from disk on a miss.
    #[instrument(skip(self), fields(page = %id))]
    pub fn get_page(&self, id: PageId, mode: LatchMode) -> Result<PageGuard, PoolError> {
        loop {
            if let Some(guard) = self.core.fix_cached(id, mode) {
                self.core.metrics.record_hit();
                return Ok(guard);
            }

            let space = self
                .core
                .spaces
                .get(id.space_id)
                .ok_or(PoolError::UnknownSpace(id.space_id))?;
            if id.page_no >= space.size() {
                return Err(PoolError::OutOfRange(id));
            }

            let frame = self.free_frame()?;
            if !self.core.install(frame, id, space.zip_size(), IoFix::Read) {
                continue;
            }
            self.core.metrics.record_miss();

            if let Err(err) = self.core.read_into(frame, &space, id) {
                warn!(page = %id, error = %err, "page read failed");
                self.core.metrics.record_read(false);
                self.core.abort_read(frame);
                return Err(err);
            }
            self.core.metrics.record_read(true);
            self.core.complete_read(frame);

            let slot = self.core.slot(frame);
            if mode == LatchMode::Shared {
                slot.latch.x_unlock();
                slot.latch.s_lock();
            }
            trace!(frame, "page read into pool");
            return Ok(PageGuard {
                core: self.core.clone(),
                frame,
                id,
                mode,
            });
        }
    }

    /// Returns the page only if it is already cached.
    pub fn peek_page(&self, id: PageId, mode: LatchMode) -> Option<PageGuard> {
        self.core.fix_cached(id, mode)
    }

    /// Like [`BufferPool::get_page`], but `None` for pages past the end of
    /// the tablespace, which may have been freed by truncation.
    pub fn get_page_possibly_freed(&self, id: PageId, mode: LatchMode) -> Result<Option<PageGuard>, PoolError> {
        let space = self
            .core
            .spaces
            .get(id.space_id)
            .ok_or(PoolError::UnknownSpace(id.space_id))?;
        if id.page_no >= space.size() {
            return Ok(None);
        }
        match self.get_page(id, mode) {
            Ok(guard) => Ok(Some(guard)),
            Err(PoolError::OutOfRange(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Creates a page in the pool without reading it, x-latched and zeroed
    /// apart from its header.
    #[instrument(skip(self), fields(page = %id))]
    pub fn create_page(&self, id: PageId, page_type: u16) -> Result<PageGuard, PoolError> {
        let space = self
            .core
            .spaces
            .get(id.space_id)
            .ok_or(PoolError::UnknownSpace(id.space_id))?;
        if id.page_no >= space.size() {
            space.set_size(id.page_no + 1);
            space.set_free_limit(id.page_no + 1);
        }

        let mut guard = loop {
            if let Some(guard) = self.core.fix_cached(id, LatchMode::Exclusive) {
                break guard;
            }
            let frame = self.free_frame()?;
            if self.core.install(frame, id, space.zip_size(), IoFix::None) {
                break PageGuard {
                    core: self.core.clone(),
                    frame,
                    id,
                    mode: LatchMode::Exclusive,
                };
            }
        };
        {
            let mut data = guard.data_mut();
            data.fill(0);
            page::init_header(&mut data, id, page_type);
        }
        self.core.metrics.record_created();
        Ok(guard)
    }

    /// Lends a frame out as scratch memory.
    pub fn scratch_frame(&self) -> Result<ScratchFrame, PoolError> {
        let frame = self.free_frame()?;
        self.core.slot(frame).meta.lock().state = PageState::Memory;
        Ok(ScratchFrame {
            core: self.core.clone(),
            frame,
        })
    }

    /// Moves a cached page to another frame. The page keeps its place in the
    /// LRU and in the dirty index.
    ///
    /// Returns `None` if the page is not cached, or is fixed, latched or
    /// under I/O.
    #[instrument(skip(self), fields(page = %id))]
    pub fn relocate_page(&self, id: PageId) -> Result<Option<FrameId>, PoolError> {
        let new = self.free_frame()?;
        let mut inner = self.core.inner.lock();
        let Some(old) = inner.page_hash.get(&id).copied() else {
            drop(inner);
            self.core.release_frame(new);
            return Ok(None);
        };
        let old_slot = self.core.slot(old);
        let new_slot = self.core.slot(new);
        let mut old_meta = old_slot.meta.lock();
        let movable = old_meta
            .file()
            .is_some_and(|file| file.io_fix == IoFix::None && file.buf_fix_count == 0);
        if !movable || !old_slot.latch.try_x_lock() {
            drop(old_meta);
            drop(inner);
            self.core.release_frame(new);
            return Ok(None);
        }

        new_slot.data.write().copy_from_slice(&old_slot.data.read());
        let mut new_meta = new_slot.meta.lock();
        new_meta.state = std::mem::take(&mut old_meta.state);
        let dirty = new_meta.is_dirty();
        drop(new_meta);
        drop(old_meta);

        inner.page_hash.insert(id, new);
        inner.lru_relocate(old, new);
        if dirty {
            inner.dirty.relocate(old, new);
        }
        inner.free.push(old);
        old_slot.latch.x_unlock();
        drop(inner);
        trace!(from = old, to = new, dirty, "page relocated");
        Ok(Some(new))
    }

    /// Obtains a free frame, running eviction batches when none is left.
    fn free_frame(&self) -> Result<FrameId, PoolError> {
        let retries = self.core.flush_config.free_frame_retries;
        let wanted = self.core.flush_config.free_block_margin + self.core.flush_config.extra_margin;
        for attempt in 0..retries {
            if let Some(frame) = self.core.try_take_free_frame() {
                return Ok(frame);
            }
            if attempt == 0 {
                debug!("no free frame, running an eviction batch");
            } else {
                thread::sleep(Duration::from_millis(10));
            }
            match self.flusher.flush_batch(FlushClass::Eviction, wanted, 0)? {
                FlushBatchResult::Busy => self.flusher.wait_for_batch_end(FlushClass::Eviction),
                FlushBatchResult::Flushed(_) => {}
            }
        }
        warn!(retries, "buffer pool has no replaceable frame");
        Err(PoolError::NoFreeFrame(retries))
    }

    pub fn snapshot(&self) -> BufferPoolSnapshot {
        self.core.snapshot()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool").field("core", &self.core).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(frames: usize, old_min_len: usize) -> PoolInner {
        let flush = FlushConfig {
            lru_old_min_len: old_min_len,
            lru_old_ratio_pct: 50,
            ..FlushConfig::default()
        };
        PoolInner::new(frames, &flush)
    }

    fn old_frames(inner: &PoolInner) -> Vec<FrameId> {
        inner.lru.iter().filter(|frame| inner.is_old(*frame)).collect()
    }

    #[test]
    fn short_lru_has_no_old_sublist() {
        let mut inner = inner(8, 4);
        inner.lru_add(0);
        inner.lru_add(1);
        assert_eq!(inner.lru_old_len(), 0);
        assert!(old_frames(&inner).is_empty());
    }

    #[test]
    fn old_sublist_forms_at_the_tail() {
        let mut inner = inner(8, 4);
        for frame in 0..6 {
            inner.lru_add(frame);
        }
        assert_eq!(inner.lru_old_len(), 3);
        let lru: Vec<_> = inner.lru.iter().collect();
        assert_eq!(old_frames(&inner), lru[3..].to_vec());
    }

    #[test]
    fn new_pages_enter_at_the_old_boundary() {
        let mut inner = inner(16, 4);
        for frame in 0..8 {
            inner.lru_add(frame);
        }
        inner.lru_add(8);
        assert!(inner.is_old(8) || inner.lru.front() != Some(8));

        inner.lru_make_young(8);
        assert_eq!(inner.lru.front(), Some(8));
        assert!(!inner.is_old(8));
    }

    #[test]
    fn make_old_moves_to_tail() {
        let mut inner = inner(16, 4);
        for frame in 0..8 {
            inner.lru_add(frame);
        }
        let head = inner.lru.front().expect("head");
        inner.lru_make_old(head);
        assert_eq!(inner.lru.back(), Some(head));
        assert!(inner.is_old(head));
        assert_eq!(inner.lru_old_len(), 4);

        let lru: Vec<_> = inner.lru.iter().collect();
        assert_eq!(old_frames(&inner), lru[4..].to_vec());
    }

    #[test]
    fn removal_keeps_old_sublist_contiguous() {
        let mut inner = inner(16, 4);
        for frame in 0..10 {
            inner.lru_add(frame);
        }
        let old = old_frames(&inner);
        inner.lru_remove(old[0]);
        inner.lru_remove(old[old.len() - 1]);
        let lru: Vec<_> = inner.lru.iter().collect();
        let expected_old = lru.len() / 2;
        assert_eq!(old_frames(&inner), lru[lru.len() - expected_old..].to_vec());

        while let Some(frame) = inner.lru.front() {
            inner.lru_remove(frame);
        }
        assert_eq!(inner.lru_old_len(), 0);
    }
}
