use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::buffer_pool::{BufferPool, BufferPoolSnapshot, PoolCore, PoolError};
use crate::config::PageCacheConfig;
use crate::crypt::{self, CryptError};
use crate::datafile::{DatafileError, Datafiles};
use crate::dictionary::DataDictionary;
use crate::doublewrite::{DoublewriteError, DoublewriteSnapshot, DoublewriteStager};
use crate::error::ErrorCode;
use crate::flush::{FlushController, FlushControllerSnapshot, FlushError};
use crate::flush_rate::{FlushRateSnapshot, PageCleaner};
use crate::keyring::Keyring;
use crate::log::RedoLog;
use crate::page;
use crate::rotation::{CryptSpaceStatus, KeyRotationScheduler, KeyRotationSnapshot, RotationError};
use crate::tablespace::{Tablespace, TablespaceRegistry};

const CLOSE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager is closed")]
    Closed,
    #[error("tablespace already open: {0}")]
    SpaceAlreadyOpen(u32),
    #[error("tablespace not found: {0}")]
    SpaceNotFound(u32),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Doublewrite(#[from] DoublewriteError),
    #[error(transparent)]
    Datafile(#[from] DatafileError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Rotation(#[from] RotationError),
    #[error("failed to spawn background thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::Closed => ErrorCode::OperationCancelled,
            ManagerError::SpaceAlreadyOpen(_) | ManagerError::SpaceNotFound(_) => {
                ErrorCode::ConfigurationError
            }
            ManagerError::Pool(err) => err.code(),
            ManagerError::Flush(err) => err.code(),
            ManagerError::Doublewrite(DoublewriteError::Datafile(_)) | ManagerError::Datafile(_) => {
                ErrorCode::IoFailure
            }
            ManagerError::Doublewrite(_) => ErrorCode::DataCorruption,
            ManagerError::Crypt(CryptError::KeyUnavailable { .. }) => ErrorCode::KeyUnavailable,
            ManagerError::Crypt(_) => ErrorCode::DataCorruption,
            ManagerError::Rotation(err) => err.code(),
            ManagerError::Spawn(_) => ErrorCode::ConfigurationError,
        }
    }
}

/// External services the page cache is built on.
#[derive(Clone)]
pub struct ManagerServices {
    pub datafiles: Arc<dyn Datafiles>,
    pub log: Arc<dyn RedoLog>,
    pub keyring: Arc<dyn Keyring>,
    pub dictionary: Arc<dyn DataDictionary>,
}

#[derive(Debug, Clone)]
pub struct ManagerDiagnostics {
    pub open_spaces: usize,
    pub pool: BufferPoolSnapshot,
    pub flush: FlushControllerSnapshot,
    pub doublewrite: DoublewriteSnapshot,
    pub flush_rate: FlushRateSnapshot,
    pub cleaner_ticks: u64,
    pub rotation: KeyRotationSnapshot,
    pub crypt: Vec<CryptSpaceStatus>,
}

/// Owns the buffer pool and every background component around it.
///
/// Expected start-up order: [`Manager::new`], [`Manager::open_tablespace`] for
/// every tablespace, [`Manager::recover`], then [`Manager::start`].
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: PageCacheConfig,
    spaces: Arc<TablespaceRegistry>,
    datafiles: Arc<dyn Datafiles>,
    log: Arc<dyn RedoLog>,
    pool: Arc<BufferPool>,
    cleaner: PageCleaner,
    rotation: KeyRotationScheduler,
    closed: AtomicBool,
}

impl Manager {
    /// Builds the pool, flush path, page cleaner and rotation scheduler. No
    /// background thread runs until [`Manager::start`].
    pub fn new(config: PageCacheConfig, services: ManagerServices) -> Self {
        let config = config.normalized();
        let spaces = Arc::new(TablespaceRegistry::new());
        let core = Arc::new(PoolCore::new(
            &config,
            spaces.clone(),
            services.datafiles.clone(),
            services.keyring.clone(),
        ));
        let doublewrite = Arc::new(DoublewriteStager::new(
            config.doublewrite,
            config.page_size,
            services.datafiles.clone(),
        ));
        let flusher = Arc::new(FlushController::new(
            core.clone(),
            doublewrite,
            services.log.clone(),
        ));
        let pool = Arc::new(BufferPool::new(core.clone(), flusher.clone()));
        let cleaner = PageCleaner::new(flusher, core, services.log.clone(), config.cleaner);
        let rotation = KeyRotationScheduler::new(
            spaces.clone(),
            pool.clone(),
            services.log.clone(),
            services.keyring,
            services.dictionary,
            config.rotation,
        );
        debug!(
            page_size = config.page_size,
            frames = config.pool_frames,
            "page cache created"
        );
        Self {
            inner: Arc::new(ManagerInner {
                config,
                spaces,
                datafiles: services.datafiles,
                log: services.log,
                pool,
                cleaner,
                rotation,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PageCacheConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    pub fn spaces(&self) -> &Arc<TablespaceRegistry> {
        &self.inner.spaces
    }

    pub fn rotation(&self) -> &KeyRotationScheduler {
        &self.inner.rotation
    }

    pub fn cleaner(&self) -> &PageCleaner {
        &self.inner.cleaner
    }

    /// Registers a tablespace and loads its crypto metadata from page 0.
    #[instrument(skip(self, space), fields(space_id = space.id()))]
    pub fn open_tablespace(&self, space: Tablespace) -> Result<Arc<Tablespace>, ManagerError> {
        if self.inner.is_closed() {
            return Err(ManagerError::Closed);
        }
        if self.inner.spaces.get(space.id()).is_some() {
            return Err(ManagerError::SpaceAlreadyOpen(space.id()));
        }
        let space = self.inner.spaces.register(space);
        self.inner.load_crypt_data(&space)?;
        Ok(space)
    }

    /// Restores torn pages from the doublewrite buffer. Run after every
    /// tablespace is open and before any page is read.
    ///
    /// Until [`Manager::start`], pages may be dirtied out of LSN order while
    /// redo is applied.
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<usize, ManagerError> {
        self.inner.pool.core().set_recovery_order(true);
        let restored = self
            .inner
            .pool
            .flusher()
            .doublewrite()
            .restore_torn_pages(&self.inner.spaces)?;
        if restored > 0 {
            // Page 0 may have been torn when the tablespace was opened.
            for space_id in self.inner.spaces.ids() {
                if let Some(space) = self.inner.spaces.get(space_id) {
                    self.inner.load_crypt_data(&space)?;
                }
            }
        }
        Ok(restored)
    }

    /// Starts the page cleaner and the rotation workers.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), ManagerError> {
        if self.inner.is_closed() {
            return Err(ManagerError::Closed);
        }
        self.inner.pool.core().set_recovery_order(false);
        if self.inner.config.cleaner.enabled {
            self.inner.cleaner.start()?;
        }
        self.inner.rotation.start()?;
        info!(
            rotation_threads = self.inner.config.rotation.threads,
            cleaner = self.inner.config.cleaner.enabled,
            "page cache started"
        );
        Ok(())
    }

    /// Stops rotation on the tablespace, writes its dirty pages and
    /// unregisters it.
    #[instrument(skip(self))]
    pub fn close_tablespace(&self, space_id: u32) -> Result<(), ManagerError> {
        let space = self
            .inner
            .spaces
            .get(space_id)
            .ok_or(ManagerError::SpaceNotFound(space_id))?;
        space.set_stopping();
        self.inner.rotation.close_tablespace(&space);
        let core = self.inner.pool.core();
        loop {
            self.inner
                .pool
                .flusher()
                .flush_up_to(self.inner.log.current_lsn())?;
            if core.evict_space(space_id) == 0 {
                break;
            }
            // Pages still under I/O or dirtied after the flush.
            thread::sleep(CLOSE_RETRY_INTERVAL);
        }
        self.inner.datafiles.flush(space_id)?;
        self.inner.spaces.remove(space_id);
        // Pages read between the last eviction and the removal.
        let left = core.evict_space(space_id);
        if left > 0 {
            warn!(space_id, left, "pages of a closed tablespace are still cached");
        }
        debug!(pending_ops = space.pending_ops(), "tablespace closed");
        Ok(())
    }

    /// Flushes every dirty page and syncs all datafiles.
    #[instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<(), ManagerError> {
        self.inner.checkpoint()
    }

    /// Stops background threads and makes every dirty page durable.
    pub fn shutdown(&self) -> Result<(), ManagerError> {
        self.inner.shutdown()
    }

    pub fn diagnostics(&self) -> ManagerDiagnostics {
        let inner = &self.inner;
        let flusher = inner.pool.flusher();
        let crypt = inner
            .spaces
            .ids()
            .into_iter()
            .filter_map(|space_id| inner.rotation.space_status(space_id))
            .collect();
        ManagerDiagnostics {
            open_spaces: inner.spaces.len(),
            pool: inner.pool.snapshot(),
            flush: flusher.snapshot(),
            doublewrite: flusher.doublewrite().snapshot(),
            flush_rate: inner.cleaner.estimator_snapshot(),
            cleaner_ticks: inner.cleaner.ticks(),
            rotation: inner.rotation.snapshot(),
            crypt,
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("spaces", &self.inner.spaces)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl ManagerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reads page 0 straight from the datafile; pages are not cached before
    /// recovery.
    fn load_crypt_data(&self, space: &Tablespace) -> Result<(), ManagerError> {
        if space.size() == 0 || space.crypt_data().is_some() {
            return Ok(());
        }
        let physical = space.physical_page_size(self.config.page_size);
        let image = self.datafiles.read(space.id(), 0, physical)?;
        if page::is_blank(&image) {
            return Ok(());
        }
        if !page::verify_checksum(&image, space.zip_size()) {
            warn!(space_id = space.id(), "page 0 fails its checksum, crypto metadata not loaded");
            return Ok(());
        }
        match crypt::read_page0(&image) {
            Ok(Some(crypt)) => {
                let crypt = space.install_crypt_data(Arc::new(crypt));
                debug!(
                    space_id = space.id(),
                    key_id = crypt.key_id(),
                    min_key_version = crypt.min_key_version(),
                    "crypto metadata loaded"
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(space_id = space.id(), error = %err, "malformed page 0 crypto header");
                space.exclude_from_rotation();
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), ManagerError> {
        self.pool.flusher().flush_up_to(self.log.current_lsn())?;
        self.datafiles.fsync_all_pending_writes()?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ManagerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let rotation = self.rotation.shutdown();
        self.cleaner.shutdown();
        self.checkpoint()?;
        rotation?;
        info!("page cache shut down");
        Ok(())
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, code = %err.code(), "page cache shutdown failed");
        }
    }
}
