//! Background key rotation.
//!
//! Worker threads walk every tablespace and force pages whose key version is
//! too old (or, when decrypting, any key version at all) to be rewritten by
//! dirtying them; the normal flush path then writes them with the key the
//! tablespace currently encrypts with. Per tablespace the pass moves through
//!
//! ```text
//! IDLE -> STARTING -> ROTATING -> FLUSHING -> IDLE
//! ```
//!
//! STARTING only happens when an unencrypted tablespace is encrypted for the
//! first time: page 0 gets its crypto header and is flushed before any page
//! may use the new key. ROTATING hands out page batches to any number of
//! workers. The last worker to finish runs FLUSHING alone: it flushes every
//! page the pass dirtied, records the encryption flag in the data
//! dictionary, rewrites page 0 and only then publishes the new minimum key
//! version.
//!
//! A tablespace whose keys cannot be fetched, whose pages cannot be read or
//! whose dictionary record cannot be updated is excluded from rotation; the
//! other tablespaces carry on.

pub mod iops;
mod worker;

pub use iops::{IoBudget, RotationStats, WorkerBudget};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::buffer_pool::{BufferPool, LatchMode, PoolError};
use crate::config::{EncryptTables, RotationConfig};
use crate::crypt::{
    self, CryptError, CryptScheme, CryptoMetadata, EncryptionMode, INVALID_KEY_VERSION,
    NOT_ENCRYPTED, RotationMarker,
};
use crate::dictionary::{DataDictionary, DictionaryError, ExclusiveTxn};
use crate::error::ErrorCode;
use crate::flush::FlushError;
use crate::keyring::Keyring;
use crate::log::{Lsn, RedoLog};
use crate::page::{self, FIL_PAGE_KEY_VERSION, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID, TRX_SYS_PAGE_NO};
use crate::tablespace::{
    FSP_FLAGS_ENCRYPTION, SYSTEM_SPACE_ID, SpacePurpose, SpaceRef, Tablespace, TablespaceRegistry,
};

use worker::RotationWorker;

/// Redo charged for the dummy write that forces a page to be rewritten.
const ROTATE_RECORD_LEN: u64 = 16;

/// Redo charged for rewriting the page-0 crypto header.
const PAGE0_RECORD_LEN: u64 = crypt::page0::PAGE0_HEADER_LEN as u64;

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CLOSE_WARN_INTERVAL: Duration = Duration::from_secs(30);

const DICTIONARY_RETRY_MIN: Duration = Duration::from_millis(1);
const DICTIONARY_RETRY_MAX: Duration = Duration::from_millis(100);

const THREAD_SETTLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error("failed to spawn rotation worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("rotation worker {thread} panicked: {message}")]
    WorkerPanic { thread: String, message: String },
}

impl RotationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RotationError::Pool(err) => err.code(),
            RotationError::Flush(err) => err.code(),
            RotationError::Crypt(CryptError::KeyUnavailable { .. }) => ErrorCode::KeyUnavailable,
            RotationError::Crypt(_) => ErrorCode::DataCorruption,
            RotationError::Spawn(_) => ErrorCode::ConfigurationError,
            RotationError::WorkerPanic { .. } => ErrorCode::WorkerPanic,
        }
    }

    /// Errors after which pages can no longer be persisted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RotationError::Flush(_) | RotationError::Pool(PoolError::Flush(_) | PoolError::Datafile(_))
        )
    }
}

/// Whether data at `key_version` must be rewritten, given the latest key
/// version and the allowed key age.
///
/// Unencrypted to encrypted always rotates. Encrypted to unencrypted only for
/// tablespaces that follow the global policy. Between key versions only when
/// `rotate_key_age` is non-zero and the version is at least that old.
pub fn needs_rotation(
    encryption: EncryptionMode,
    key_version: u32,
    latest_key_version: u32,
    rotate_key_age: u32,
) -> bool {
    if key_version == INVALID_KEY_VERSION {
        return false;
    }
    if key_version == NOT_ENCRYPTED && latest_key_version != NOT_ENCRYPTED {
        return true;
    }
    if latest_key_version == NOT_ENCRYPTED && key_version != NOT_ENCRYPTED {
        return encryption == EncryptionMode::Default;
    }
    rotate_key_age > 0 && u64::from(key_version) + u64::from(rotate_key_age) <= u64::from(latest_key_version)
}

/// Key version a pass rotates to and the age that triggers it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KeyState {
    /// Key the state was computed for; `None` forces a refresh.
    pub key_id: Option<u32>,
    pub key_version: u32,
    pub rotate_key_age: u32,
}

/// Rotation view of one tablespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptSpaceStatus {
    pub space_id: u32,
    pub scheme: CryptScheme,
    pub encryption: EncryptionMode,
    pub key_id: u32,
    pub min_key_version: u32,
    /// Latest key version seen at the keyring.
    pub current_key_version: u32,
    pub encrypting_with_key_version: u32,
    pub keyserver_requests: u64,
    pub rotating: bool,
    pub flushing: bool,
    pub rotate_next_page: u32,
    pub rotate_max_page: u32,
    pub excluded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRotationSnapshot {
    pub threads: usize,
    pub threads_running: usize,
    pub iops: u32,
    pub iops_allocated: u32,
    pub passes: u64,
    pub spaces_rotated: u64,
    pub spaces_excluded: u64,
    /// Busy replies to metadata lock requests.
    pub lock_contention: u64,
    pub worker_panics: u64,
    pub stats: RotationStats,
}

/// Wake-up signal that does not lose notifications sent between reading
/// the generation and waiting.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.cv.notify_all();
    }

    /// Waits until notified after `seen` or until `timeout`; true if
    /// notified.
    pub(crate) fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cv.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct ThreadCounts {
    target: usize,
    started: usize,
}

#[derive(Debug, Default)]
struct RotationMetrics {
    passes: AtomicU64,
    spaces_rotated: AtomicU64,
    spaces_excluded: AtomicU64,
    lock_contention: AtomicU64,
    worker_panics: AtomicU64,
}

/// State shared by the scheduler handle and its workers.
pub(crate) struct RotationShared {
    spaces: Arc<TablespaceRegistry>,
    pool: Arc<BufferPool>,
    log: Arc<dyn RedoLog>,
    keyring: Arc<dyn Keyring>,
    dictionary: Arc<dyn DataDictionary>,
    config: RwLock<RotationConfig>,
    pub(crate) budget: IoBudget,
    /// Set while one worker moves a tablespace through STARTING.
    converting: Mutex<bool>,
    pub(crate) wake: Signal,
    threads: Mutex<ThreadCounts>,
    threads_changed: Condvar,
    shutdown: AtomicBool,
    metrics: RotationMetrics,
}

/// Resets the STARTING markers however the start ends.
struct StartingGuard<'a> {
    converting: &'a Mutex<bool>,
    crypt: Arc<CryptoMetadata>,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.crypt.state();
            state.rotate.active_threads = 0;
            state.rotate.starting = false;
        }
        *self.converting.lock() = false;
    }
}

impl RotationShared {
    pub(crate) fn config(&self) -> RotationConfig {
        *self.config.read()
    }

    pub(crate) fn spaces(&self) -> &TablespaceRegistry {
        &self.spaces
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn target_threads(&self) -> usize {
        self.threads.lock().target
    }

    /// Whether the worker numbered `thread_no` should exit; `None` is a
    /// caller-driven pass that only stops on shutdown.
    pub(crate) fn should_stop(&self, thread_no: Option<usize>) -> bool {
        self.is_shutdown() || thread_no.is_some_and(|n| n >= self.target_threads())
    }

    pub(crate) fn thread_started(&self) {
        self.threads.lock().started += 1;
        self.threads_changed.notify_all();
    }

    pub(crate) fn thread_stopped(&self) {
        let mut counts = self.threads.lock();
        counts.started = counts.started.saturating_sub(1);
        self.threads_changed.notify_all();
    }

    pub(crate) fn record_pass(&self) {
        self.metrics.passes.fetch_add(1, Ordering::Relaxed);
    }

    fn exclude(&self, space: &Tablespace, reason: &str) {
        space.exclude_from_rotation();
        self.metrics.spaces_excluded.fetch_add(1, Ordering::Relaxed);
        error!(space_id = space.id(), name = space.name(), reason, "tablespace excluded from key rotation");
    }

    /// Key version to rotate `crypt` to under the current policy.
    fn key_state(&self, crypt: &CryptoMetadata, config: &RotationConfig) -> KeyState {
        match config.encrypt_tables {
            EncryptTables::OnlineFromKeyringToUnencrypted => KeyState {
                key_id: Some(crypt.key_id()),
                key_version: NOT_ENCRYPTED,
                rotate_key_age: 0,
            },
            mode => KeyState {
                key_id: Some(crypt.key_id()),
                key_version: crypt.key_get_latest_version(
                    self.keyring.as_ref(),
                    mode == EncryptTables::OnlineToKeyring,
                ),
                rotate_key_age: config.rotate_key_age,
            },
        }
    }

    /// Loads the crypto metadata from page 0 if it is not cached yet.
    pub(crate) fn read_crypt_data(&self, space: &SpaceRef) -> Result<(), RotationError> {
        if space.crypt_data().is_some() || space.size() == 0 {
            return Ok(());
        }
        let guard = match self.pool.get_page(space.page_id(0), LatchMode::Shared) {
            Ok(guard) => guard,
            Err(err) => {
                let err = RotationError::from(err);
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(space_id = space.id(), error = %err, "cannot read page 0");
                return Ok(());
            }
        };
        let parsed = crypt::read_page0(&guard.data());
        drop(guard);
        match parsed {
            Ok(Some(crypt)) => {
                space.install_crypt_data(Arc::new(crypt));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(space_id = space.id(), error = %err, "malformed page 0 crypto header");
                self.exclude(space, "malformed page 0 crypto header");
            }
        }
        Ok(())
    }

    /// Rewrites the crypto header of page 0 and returns the LSN of the
    /// change.
    fn write_crypt_header(
        &self,
        space: &Tablespace,
        crypt: &CryptoMetadata,
        min_key_version: u32,
        scheme: CryptScheme,
        rotation: RotationMarker,
    ) -> Result<Lsn, RotationError> {
        let mut guard = self.pool.get_page(space.page_id(0), LatchMode::Exclusive)?;
        {
            let mut data = guard.data_mut();
            crypt.write_page0(space, &mut data[..], min_key_version, scheme, rotation)?;
        }
        let lsn = self.log.append(PAGE0_RECORD_LEN);
        guard.mark_dirty(lsn);
        Ok(lsn)
    }

    /// STARTING: gives an unencrypted tablespace crypto metadata, writes and
    /// flushes page 0, then lets workers rotate it. Returns true when another
    /// worker is starting a tablespace and this one should be rechecked.
    #[instrument(skip(self, space), fields(space_id = space.id()))]
    pub(crate) fn start_encrypting_space(&self, space: &SpaceRef) -> Result<bool, RotationError> {
        let config = self.config();
        let crypt = {
            let mut converting = self.converting.lock();
            if space.crypt_data().is_some() || *converting {
                return Ok(*converting);
            }
            if space.is_stopping() || !config.encrypt_tables.is_online_encryption_on() {
                return Ok(false);
            }

            let page_size = space.physical_page_size(self.pool.core().page_size());
            let crypt = Arc::new(CryptoMetadata::new(
                config.default_key_id,
                EncryptionMode::Default,
                page_size,
            ));
            let latest = crypt.key_get_latest_version(self.keyring.as_ref(), true);
            if latest == NOT_ENCRYPTED || latest == INVALID_KEY_VERSION {
                self.exclude(space, "no key version available to encrypt with");
                return Ok(false);
            }
            if let Err(err) = crypt.load_needed_keys(self.keyring.as_ref(), latest) {
                warn!(error = %err, "cannot load encryption key");
                self.exclude(space, "encryption key unavailable");
                return Ok(false);
            }
            {
                let mut state = crypt.state();
                state.rotate.start_time = Some(Instant::now());
                state.rotate.starting = true;
                state.rotate.active_threads = 1;
                if let Some(master) = space.master_key() {
                    state.rotation = RotationMarker::MasterKeyToRotatedKey;
                    state.tablespace_key = Some(master.key);
                    state.tablespace_iv = Some(master.iv);
                }
                state.encrypting_with_key_version = latest;
            }
            let installed = space.install_crypt_data(crypt.clone());
            if !Arc::ptr_eq(&installed, &crypt) {
                return Ok(false);
            }
            *converting = true;
            crypt
        };
        let _starting = StartingGuard {
            converting: &self.converting,
            crypt: crypt.clone(),
        };

        let (min_key_version, rotation) = {
            let mut state = crypt.state();
            state.scheme = CryptScheme::Scheme1;
            (state.min_key_version, state.rotation)
        };
        info!(
            key_id = crypt.key_id(),
            key_version = crypt.state().encrypting_with_key_version,
            ?rotation,
            "encrypting tablespace"
        );
        let end_lsn = match self.write_crypt_header(space, &crypt, min_key_version, CryptScheme::Scheme1, rotation) {
            Ok(lsn) => lsn,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(error = %err, "cannot write page 0 crypto header");
                self.exclude(space, "page 0 crypto header could not be written");
                return Ok(false);
            }
        };
        self.pool.flusher().flush_up_to(end_lsn)?;
        debug!(end_lsn, "page 0 crypto header durable");
        Ok(false)
    }

    /// Whether `space` has pages to rotate under `key_state`; refreshes the
    /// key state when the tablespace uses another key.
    pub(crate) fn space_needs_rotation(
        &self,
        space: &SpaceRef,
        key_state: &mut KeyState,
        recheck: &mut bool,
    ) -> Result<bool, RotationError> {
        if !matches!(space.purpose(), SpacePurpose::Tablespace | SpacePurpose::Temporary) {
            return Ok(false);
        }
        let config = self.config();
        let crypt = match space.crypt_data() {
            Some(crypt) => crypt,
            None => {
                key_state.key_id = Some(config.default_key_id);
                *recheck |= self.start_encrypting_space(space)?;
                let Some(crypt) = space.crypt_data() else {
                    return Ok(false);
                };
                key_state.key_version = crypt.state().encrypting_with_key_version;
                crypt
            }
        };

        {
            let state = crypt.state();
            if state.key_found == INVALID_KEY_VERSION {
                return Ok(false);
            }
            if state.rotate.starting {
                *recheck = true;
                return Ok(false);
            }
            if space.is_stopping() || state.rotate.flushing || state.encryption == EncryptionMode::Off {
                return Ok(false);
            }
        }

        if key_state.key_id != Some(crypt.key_id()) {
            *key_state = self.key_state(&crypt, &config);
            if key_state.key_version == INVALID_KEY_VERSION {
                key_state.key_id = None;
                self.exclude(space, "latest key version unavailable");
                return Ok(false);
            }
        }

        let state = crypt.state();
        if state.rotate.starting || state.rotate.flushing {
            return Ok(false);
        }
        if config.encrypt_tables == EncryptTables::Off
            && state.encryption == EncryptionMode::Default
            && state.min_key_version == NOT_ENCRYPTED
        {
            return Ok(false);
        }
        let need = needs_rotation(
            state.encryption,
            state.min_key_version,
            key_state.key_version,
            key_state.rotate_key_age,
        );
        if need && state.rotate.active_threads > 0 && state.rotate.next_offset > state.rotate.max_offset {
            // Every page is already claimed by running workers.
            return Ok(false);
        }
        trace!(
            space_id = space.id(),
            min_key_version = state.min_key_version,
            latest = key_state.key_version,
            need,
            "checked tablespace for rotation"
        );
        Ok(need)
    }

    /// Joins the rotation of `space`; the first worker in sets up the pass.
    pub(crate) fn start_rotate_space(&self, space: &SpaceRef, key_state: &KeyState, worker: &mut RotationWorker) -> bool {
        let Some(crypt) = space.crypt_data() else {
            return false;
        };
        if let Err(err) = crypt.load_needed_keys(self.keyring.as_ref(), key_state.key_version) {
            warn!(space_id = space.id(), error = %err, "cannot load rotation key");
            self.exclude(space, "rotation key unavailable");
            return false;
        }

        let mut state = crypt.state();
        if state.rotate.active_threads == 0 {
            state.encrypting_with_key_version = key_state.key_version;
            // Page 0 carries the header and is rewritten last.
            state.rotate.next_offset = 1;
            // Pages added later are written with the new key anyway.
            state.rotate.max_offset = space.size();
            state.rotate.end_lsn = 0;
            state.rotate.min_key_version_found = key_state.key_version;
            state.rotate.start_time = Some(Instant::now());
            if state.scheme == CryptScheme::Unencrypted
                && state.encryption != EncryptionMode::Off
                && key_state.key_version != NOT_ENCRYPTED
            {
                state.scheme = CryptScheme::Scheme1;
            }
            debug!(
                space_id = space.id(),
                key_version = key_state.key_version,
                max_offset = state.rotate.max_offset,
                "rotation pass started"
            );
        }
        state.rotate.active_threads += 1;
        worker.active = true;
        worker.end_lsn = state.rotate.end_lsn;
        worker.min_key_version_found = state.rotate.min_key_version_found;
        true
    }

    /// Claims the next batch of pages of the pass.
    pub(crate) fn find_page_to_rotate(&self, space: &SpaceRef, worker: &mut RotationWorker) -> bool {
        if space.is_stopping() {
            return false;
        }
        let Some(crypt) = space.crypt_data() else {
            return false;
        };
        let batch = self
            .config()
            .alloc_time_secs
            .saturating_mul(worker.budget.allocated)
            .max(1);

        let mut state = crypt.state();
        let rotate = &mut state.rotate;
        let found = rotate.max_offset >= rotate.next_offset;
        if found {
            worker.offset = rotate.next_offset;
            worker.batch = batch.min(rotate.max_offset - rotate.next_offset);
        }
        rotate.next_offset = rotate.next_offset.saturating_add(batch);
        found
    }

    /// Rotates the claimed batch. Returns true when the tablespace had to be
    /// abandoned.
    pub(crate) fn rotate_pages(
        &self,
        space: &SpaceRef,
        key_state: &KeyState,
        worker: &mut RotationWorker,
    ) -> Result<bool, RotationError> {
        let Some(crypt) = space.crypt_data() else {
            return Ok(false);
        };
        let (encryption, migrating) = {
            let state = crypt.state();
            (state.encryption, state.rotation == RotationMarker::MasterKeyToRotatedKey)
        };
        let end = worker
            .offset
            .saturating_add(worker.batch)
            .min(space.free_limit());
        let doublewrite = self.pool.flusher().doublewrite().clone();

        while worker.offset < end {
            let page_no = worker.offset;
            worker.offset += 1;
            // Staged copies are refreshed whenever their page is written.
            if space.id() == SYSTEM_SPACE_ID && doublewrite.is_inside(page_no) {
                continue;
            }
            if !self.rotate_page(space, page_no, encryption, migrating, key_state, worker)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Dirties `page_no` if its key version needs rotation. Returns false
    /// when the page cannot be read and the tablespace was excluded.
    fn rotate_page(
        &self,
        space: &SpaceRef,
        page_no: u32,
        encryption: EncryptionMode,
        migrating: bool,
        key_state: &KeyState,
        worker: &mut RotationWorker,
    ) -> Result<bool, RotationError> {
        if space.is_stopping() {
            return Ok(true);
        }
        // The transaction system page holds the doublewrite location.
        if space.id() == SYSTEM_SPACE_ID && page_no == TRX_SYS_PAGE_NO {
            return Ok(true);
        }

        let id = space.page_id(page_no);
        let mut sleep_ms = 0;
        let mut guard = match self.pool.peek_page(id, LatchMode::Exclusive) {
            Some(guard) => {
                worker.budget.stats.pages_read_from_cache += 1;
                guard
            }
            None => {
                if space.is_stopping() {
                    return Ok(true);
                }
                worker.budget.stats.pages_read_from_disk += 1;
                let started = Instant::now();
                let fetched = self.pool.get_page_possibly_freed(id, LatchMode::Exclusive);
                worker.budget.record_wait(started.elapsed());
                sleep_ms = worker.budget.throttle_ms();
                match fetched {
                    Ok(Some(guard)) => guard,
                    Ok(None) | Err(PoolError::UnknownSpace(_)) => return Ok(true),
                    Err(err @ (PoolError::Corrupted(_) | PoolError::Crypt(_))) => {
                        warn!(page = %id, error = %err, "page cannot be read for rotation");
                        self.exclude(space, "pages cannot be decrypted");
                        return Ok(false);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let block_lsn = guard.newest_modification();
        let (key_version, allocated) = {
            let data = guard.data();
            let key_version = if migrating {
                NOT_ENCRYPTED
            } else {
                page::read_u32(&data, FIL_PAGE_KEY_VERSION)
            };
            (key_version, page::read_u32(&data, FIL_PAGE_OFFSET) != 0)
        };

        let mut modified = false;
        if space.is_stopping() || !allocated {
            // Never allocated pages need no rotation.
        } else if needs_rotation(encryption, key_version, key_state.key_version, key_state.rotate_key_age) {
            {
                let mut data = guard.data_mut();
                page::write_u32(&mut data, FIL_PAGE_SPACE_ID, space.id());
                if key_state.key_version == NOT_ENCRYPTED {
                    page::write_u32(&mut data, FIL_PAGE_KEY_VERSION, NOT_ENCRYPTED);
                }
            }
            let lsn = self.log.append(ROTATE_RECORD_LEN);
            guard.mark_dirty(lsn);
            worker.end_lsn = worker.end_lsn.max(lsn);
            worker.budget.stats.pages_modified += 1;
            modified = true;
            trace!(page = %id, from = key_version, to = key_state.key_version, lsn, "page dirtied for rotation");
        } else if encryption != EncryptionMode::Off
            && (key_version == NOT_ENCRYPTED || key_version < worker.min_key_version_found)
        {
            worker.min_key_version_found = key_version;
        }
        if !modified {
            worker.end_lsn = worker.end_lsn.max(block_lsn);
        }
        drop(guard);

        if sleep_ms > 0 {
            self.wake.wait_since(self.wake.generation(), Duration::from_millis(sleep_ms));
        }
        Ok(true)
    }

    /// Leaves the rotation of `space`. The last worker of a finished pass
    /// runs FLUSHING; returns true when it committed the new key version.
    pub(crate) fn complete_rotate_space(
        &self,
        space: &SpaceRef,
        worker: &mut RotationWorker,
        aborted: bool,
    ) -> Result<bool, RotationError> {
        let Some(crypt) = space.crypt_data() else {
            return Ok(false);
        };

        let mut outcome = Ok(false);
        if !space.is_stopping() && !aborted {
            let (should_flush, migrating) = {
                let mut state = crypt.state();
                let rotate = &mut state.rotate;
                if worker.min_key_version_found == NOT_ENCRYPTED
                    || worker.min_key_version_found < rotate.min_key_version_found
                {
                    rotate.min_key_version_found = worker.min_key_version_found;
                }
                rotate.end_lsn = rotate.end_lsn.max(worker.end_lsn);

                let last = rotate.active_threads == 1;
                // Workers that stop early leave unclaimed pages behind.
                let done = rotate.next_offset >= rotate.max_offset;
                let should_flush = last && done;
                let migrating = state.rotation == RotationMarker::MasterKeyToRotatedKey;
                if should_flush {
                    state.rotate.flushing = true;
                    state.tablespace_key = None;
                    state.tablespace_iv = None;
                    state.rotation = RotationMarker::NoRotation;
                }
                (should_flush, migrating)
            };

            if should_flush {
                outcome = self.flush_space(space, &crypt, worker);
                let committed = matches!(outcome, Ok(true));
                let (min_key_version, scheme) = {
                    let mut state = crypt.state();
                    if committed {
                        let min = state.rotate.min_key_version_found;
                        state.min_key_version = min;
                        if min == NOT_ENCRYPTED {
                            state.scheme = CryptScheme::Unencrypted;
                        }
                        state.rotate.next_offset = 0;
                        state.rotate.max_offset = 0;
                    }
                    state.rotate.flushing = false;
                    (state.min_key_version, state.scheme)
                };
                if committed {
                    if migrating {
                        space.clear_master_key();
                    }
                    self.metrics.spaces_rotated.fetch_add(1, Ordering::Relaxed);
                    info!(space_id = space.id(), min_key_version, ?scheme, "tablespace rotation complete");
                }
            }
        }

        {
            let mut state = crypt.state();
            debug_assert!(state.rotate.active_threads > 0);
            state.rotate.active_threads = state.rotate.active_threads.saturating_sub(1);
        }
        worker.active = false;
        outcome
    }

    /// Withdraws a worker that panicked mid-pass from its tablespace, so
    /// FLUSHING and `close_tablespace` do not wait on it.
    pub(crate) fn abandon_rotation(&self, worker: &mut RotationWorker) {
        if !std::mem::take(&mut worker.active) {
            return;
        }
        let Some(crypt) = worker.space.as_ref().and_then(|space| space.crypt_data()) else {
            return;
        };
        let mut state = crypt.state();
        if state.rotate.active_threads == 1 {
            state.rotate.flushing = false;
        }
        state.rotate.active_threads = state.rotate.active_threads.saturating_sub(1);
        warn!(
            space_id = worker.space.as_ref().map(|space| space.id()),
            "rotation share of a panicked worker released"
        );
    }

    /// FLUSHING: makes the pass durable. Returns false when the tablespace
    /// stopped, the scheduler shut down or the tablespace was excluded.
    fn flush_space(
        &self,
        space: &SpaceRef,
        crypt: &CryptoMetadata,
        worker: &mut RotationWorker,
    ) -> Result<bool, RotationError> {
        let (end_lsn, min_key_version, scheme) = {
            let state = crypt.state();
            (state.rotate.end_lsn, state.rotate.min_key_version_found, state.scheme)
        };

        if end_lsn > 0 && !space.is_stopping() {
            let flusher = self.pool.flusher();
            let before: u64 = flusher.snapshot().pages_flushed.iter().sum();
            let started = Instant::now();
            flusher.flush_up_to(end_lsn)?;
            let flushed = flusher.snapshot().pages_flushed.iter().sum::<u64>().saturating_sub(before);
            if flushed > 0 {
                worker.budget.cnt_waited += flushed;
                worker.budget.sum_waited_us += started.elapsed().as_micros() as u64;
                worker.budget.stats.pages_flushed += flushed;
            }
            debug!(space_id = space.id(), end_lsn, flushed, "rotated pages flushed");
        }

        let scheme = if min_key_version == NOT_ENCRYPTED {
            CryptScheme::Unencrypted
        } else {
            scheme
        };
        let encrypted = scheme != CryptScheme::Unencrypted;

        if space.id() != SYSTEM_SPACE_ID {
            if !self.update_encrypted_flag(space, encrypted) {
                return Ok(false);
            }
            let flags = space.flags();
            space.set_flags(if encrypted {
                flags | FSP_FLAGS_ENCRYPTION
            } else {
                flags & !FSP_FLAGS_ENCRYPTION
            });
        }

        match self.write_crypt_header(space, crypt, min_key_version, scheme, RotationMarker::NoRotation) {
            Ok(_) => Ok(true),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(space_id = space.id(), error = %err, "cannot rewrite page 0 crypto header");
                self.exclude(space, "page 0 crypto header could not be rewritten");
                Ok(false)
            }
        }
    }

    /// Records the encryption flag in the data dictionary, retrying while
    /// the metadata lock is busy.
    fn update_encrypted_flag(&self, space: &SpaceRef, encrypted: bool) -> bool {
        let mut backoff = DICTIONARY_RETRY_MIN;
        let txn = loop {
            if space.is_stopping() || self.is_shutdown() {
                return false;
            }
            match ExclusiveTxn::begin(self.dictionary.as_ref(), space.id()) {
                Ok(txn) => break txn,
                Err(err @ DictionaryError::Busy(_)) => {
                    self.metrics.lock_contention.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        space_id = space.id(),
                        code = %err.code(),
                        backoff_ms = backoff.as_millis() as u64,
                        "metadata lock busy"
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(DICTIONARY_RETRY_MAX);
                }
                Err(err) => {
                    warn!(space_id = space.id(), code = %err.code(), error = %err, "cannot lock tablespace metadata");
                    self.exclude(space, "data dictionary refused the encryption flag update");
                    return false;
                }
            }
        };
        if let Err(err) = txn.set_encryption_flag(encrypted) {
            warn!(space_id = space.id(), error = %err, "cannot update encryption flag");
            self.exclude(space, "data dictionary refused the encryption flag update");
            return false;
        }
        if let Err(err) = txn.commit() {
            warn!(space_id = space.id(), error = %err, "cannot commit encryption flag");
            self.exclude(space, "data dictionary refused the encryption flag update");
            return false;
        }
        debug!(space_id = space.id(), encrypted, "encryption flag recorded");
        true
    }
}

/// Runs the rotation workers and exposes their controls.
pub struct KeyRotationScheduler {
    shared: Arc<RotationShared>,
    workers: Mutex<Vec<(usize, JoinHandle<()>)>>,
}

impl KeyRotationScheduler {
    /// Creates a scheduler; no worker runs until [`Self::start`] or
    /// [`Self::set_thread_cnt`].
    pub fn new(
        spaces: Arc<TablespaceRegistry>,
        pool: Arc<BufferPool>,
        log: Arc<dyn RedoLog>,
        keyring: Arc<dyn Keyring>,
        dictionary: Arc<dyn DataDictionary>,
        config: RotationConfig,
    ) -> Self {
        Self {
            shared: Arc::new(RotationShared {
                spaces,
                pool,
                log,
                keyring,
                dictionary,
                budget: IoBudget::new(config.iops),
                config: RwLock::new(config),
                converting: Mutex::new(false),
                wake: Signal::default(),
                threads: Mutex::new(ThreadCounts::default()),
                threads_changed: Condvar::new(),
                shutdown: AtomicBool::new(false),
                metrics: RotationMetrics::default(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts the configured number of workers.
    pub fn start(&self) -> Result<(), RotationError> {
        self.set_thread_cnt(self.shared.config().threads)
    }

    pub fn config(&self) -> RotationConfig {
        self.shared.config()
    }

    /// Grows or shrinks the worker pool and waits until it has the new size.
    #[instrument(skip(self))]
    pub fn set_thread_cnt(&self, new_cnt: usize) -> Result<(), RotationError> {
        let mut workers = self.workers.lock();
        if self.shared.is_shutdown() {
            return Ok(());
        }
        let mut counts = self.shared.threads.lock();
        while counts.started != counts.target {
            self.reap_workers(&mut workers, counts.target)?;
            self.shared.threads_changed.wait_for(&mut counts, THREAD_SETTLE_INTERVAL);
        }
        self.reap_workers(&mut workers, counts.target)?;
        let current = counts.target;
        self.shared.config.write().threads = new_cnt;
        if new_cnt > current {
            counts.target = new_cnt;
            for thread_no in current..new_cnt {
                match self.spawn_worker(thread_no) {
                    Ok(handle) => {
                        info!(thread_no, total = new_cnt, "key rotation worker created");
                        workers.push((thread_no, handle));
                    }
                    Err(err) => {
                        counts.target = thread_no;
                        self.shared.config.write().threads = thread_no;
                        error!(thread_no, error = %err, "cannot spawn key rotation worker");
                        return Err(err.into());
                    }
                }
            }
        } else if new_cnt < current {
            counts.target = new_cnt;
        }

        while counts.started != counts.target {
            self.shared.wake.notify();
            self.shared.budget.notify();
            self.reap_workers(&mut workers, counts.target)?;
            self.shared.threads_changed.wait_for(&mut counts, THREAD_SETTLE_INTERVAL);
        }
        drop(counts);
        if new_cnt > 0 {
            self.shared.wake.notify();
        }
        Ok(())
    }

    pub fn set_rotate_key_age(&self, rotate_key_age: u32) {
        self.shared.config.write().rotate_key_age = rotate_key_age;
        self.shared.wake.notify();
    }

    pub fn set_rotation_iops(&self, iops: u32) {
        self.shared.config.write().iops = iops;
        self.shared.budget.set_total(iops);
        self.shared.wake.notify();
    }

    pub fn set_encrypt_tables(&self, encrypt_tables: EncryptTables) {
        self.shared.config.write().encrypt_tables = encrypt_tables;
        self.shared.wake.notify();
    }

    /// Wakes the workers after a new key version was created.
    pub fn notify_key_state_changed(&self) {
        self.shared.wake.notify();
    }

    /// Runs one full scheduler pass on the calling thread and returns the
    /// number of tablespaces whose rotation completed.
    #[instrument(skip(self))]
    pub fn run_pass(&self) -> Result<usize, RotationError> {
        let mut worker = RotationWorker::new(None);
        let mut recheck = false;
        let outcome = worker::rotate_spaces(&self.shared, &mut worker, &mut recheck);
        self.shared.budget.release(&mut worker.budget);
        self.shared.record_pass();
        outcome
    }

    /// Waits until no worker rotates or flushes `space`. The caller marks
    /// the tablespace stopping first.
    #[instrument(skip(self, space), fields(space_id = space.id()))]
    pub fn close_tablespace(&self, space: &Tablespace) {
        let Some(crypt) = space.crypt_data() else {
            return;
        };
        let started = Instant::now();
        let mut last_warning = started;
        loop {
            let (active_threads, flushing) = {
                let state = crypt.state();
                (state.rotate.active_threads, state.rotate.flushing)
            };
            if active_threads == 0 && !flushing {
                break;
            }
            self.shared.wake.notify();
            self.shared.budget.notify();
            thread::sleep(CLOSE_POLL_INTERVAL);
            if last_warning.elapsed() >= CLOSE_WARN_INTERVAL {
                warn!(
                    waited_secs = started.elapsed().as_secs(),
                    active_threads,
                    flushing,
                    "still waiting for key rotation to release tablespace"
                );
                last_warning = Instant::now();
            }
        }
    }

    pub fn space_status(&self, space_id: u32) -> Option<CryptSpaceStatus> {
        let space = self.shared.spaces.get(space_id)?;
        let crypt = space.crypt_data()?;
        let state = crypt.state();
        Some(CryptSpaceStatus {
            space_id,
            scheme: state.scheme,
            encryption: state.encryption,
            key_id: crypt.key_id(),
            min_key_version: state.min_key_version,
            current_key_version: state.key_found,
            encrypting_with_key_version: state.encrypting_with_key_version,
            keyserver_requests: state.keyserver_requests,
            rotating: state.rotate.active_threads > 0,
            flushing: state.rotate.flushing,
            rotate_next_page: state.rotate.next_offset,
            rotate_max_page: state.rotate.max_offset,
            excluded: space.is_excluded_from_rotation(),
        })
    }

    pub fn total_stats(&self) -> RotationStats {
        self.shared.budget.totals()
    }

    pub fn snapshot(&self) -> KeyRotationSnapshot {
        let counts = self.shared.threads.lock();
        KeyRotationSnapshot {
            threads: counts.target,
            threads_running: counts.started,
            iops: self.shared.budget.total(),
            iops_allocated: self.shared.budget.allocated(),
            passes: self.shared.metrics.passes.load(Ordering::Relaxed),
            spaces_rotated: self.shared.metrics.spaces_rotated.load(Ordering::Relaxed),
            spaces_excluded: self.shared.metrics.spaces_excluded.load(Ordering::Relaxed),
            lock_contention: self.shared.metrics.lock_contention.load(Ordering::Relaxed),
            worker_panics: self.shared.metrics.worker_panics.load(Ordering::Relaxed),
            stats: self.shared.budget.totals(),
        }
    }

    /// Stops and joins every worker. Reports the first worker that panicked.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), RotationError> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.wake.notify();
        self.shared.budget.notify();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let mut result = Ok(());
        for (_, handle) in handles {
            if let Err(err) = join_worker(handle) {
                self.shared.metrics.worker_panics.fetch_add(1, Ordering::Relaxed);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        debug!("key rotation stopped");
        result
    }
}

impl Drop for KeyRotationScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl KeyRotationScheduler {
    /// Joins finished workers and replaces those that panicked below
    /// `target`, since a panicked worker has left the started count.
    fn reap_workers(
        &self,
        workers: &mut Vec<(usize, JoinHandle<()>)>,
        target: usize,
    ) -> Result<(), RotationError> {
        let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|(_, handle)| handle.is_finished());
        *workers = running;
        for (thread_no, handle) in finished {
            if join_worker(handle).is_err() {
                self.shared.metrics.worker_panics.fetch_add(1, Ordering::Relaxed);
                if thread_no < target {
                    workers.push((thread_no, self.spawn_worker(thread_no)?));
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, thread_no: usize) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("bop-crypt-{thread_no}"))
            .spawn(move || worker::run(shared, thread_no))
    }
}

fn join_worker(handle: JoinHandle<()>) -> Result<(), RotationError> {
    let thread = handle.thread().name().unwrap_or("bop-crypt").to_string();
    handle.join().map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let err = RotationError::WorkerPanic { thread, message };
        error!(code = %err.code(), error = %err, "key rotation worker joined after a panic");
        err
    })
}

impl fmt::Debug for KeyRotationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotationScheduler")
            .field("config", &self.shared.config())
            .field("shutdown", &self.shared.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_panic_has_its_own_code() {
        let err = RotationError::WorkerPanic {
            thread: "bop-crypt-0".into(),
            message: "boom".into(),
        };
        assert_eq!(err.code(), ErrorCode::WorkerPanic);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "rotation worker bop-crypt-0 panicked: boom");
    }

    #[test]
    fn unencrypted_to_encrypted_ignores_age() {
        assert!(needs_rotation(EncryptionMode::Default, NOT_ENCRYPTED, 7, 0));
        assert!(needs_rotation(EncryptionMode::On, NOT_ENCRYPTED, 1, 100));
    }

    #[test]
    fn encrypted_to_unencrypted_only_under_default_policy() {
        assert!(needs_rotation(EncryptionMode::Default, 4, NOT_ENCRYPTED, 1));
        assert!(!needs_rotation(EncryptionMode::On, 4, NOT_ENCRYPTED, 1));
    }

    #[test]
    fn rekeying_waits_for_the_key_age() {
        assert!(!needs_rotation(EncryptionMode::Default, 3, 4, 2));
        assert!(needs_rotation(EncryptionMode::Default, 3, 5, 2));
        assert!(!needs_rotation(EncryptionMode::Default, 3, 9, 0));
        assert!(!needs_rotation(EncryptionMode::Default, 5, 5, 1));
    }

    #[test]
    fn invalid_versions_never_rotate() {
        assert!(!needs_rotation(EncryptionMode::Default, INVALID_KEY_VERSION, 3, 1));
        assert!(!needs_rotation(EncryptionMode::Default, u32::MAX - 1, u32::MAX - 1, 1));
    }

    #[test]
    fn signal_wakes_only_after_the_seen_generation() {
        let signal = Signal::default();
        let seen = signal.generation();
        assert!(!signal.wait_since(seen, Duration::from_millis(5)));
        signal.notify();
        assert!(signal.wait_since(seen, Duration::from_millis(5)));
    }

    #[test]
    fn fatal_errors_are_flush_path_errors() {
        let io = RotationError::Pool(PoolError::Datafile(crate::datafile::DatafileError::UnknownSpace(3)));
        assert!(io.is_fatal());
        assert!(!RotationError::Pool(PoolError::NoFreeFrame(2)).is_fatal());
        assert_eq!(RotationError::Pool(PoolError::NoFreeFrame(2)).code(), ErrorCode::ResourceExhaustion);
    }
}
