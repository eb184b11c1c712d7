#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bop_pagecache::datafile::{DatafileError, Datafiles};
use bop_pagecache::dictionary::{DataDictionary, DictionaryError, DictionaryTxn, InMemoryDictionary};
use bop_pagecache::page::{self, PAGE_TYPE_INDEX};
use bop_pagecache::{
    EncryptTables, InMemoryKeyring, InMemoryRedoLog, IoError, Keyring, LatchMode, Manager,
    ManagerServices, PageCacheConfig, PageId, RedoLog, SpacePurpose, Tablespace,
};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const PAGE_SIZE: usize = 4096;

/// Byte offset of the payload the tests stamp into data pages.
pub const PAYLOAD_OFFSET: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatafileEvent {
    Write {
        space_id: u32,
        offset: u64,
        len: usize,
        asynchronous: bool,
    },
    Flush(u32),
    FsyncAll,
}

/// In-memory datafiles that log every write and sync.
#[derive(Default)]
pub struct RecordingDatafiles {
    files: Mutex<HashMap<u32, Vec<u8>>>,
    events: Mutex<Vec<DatafileEvent>>,
    fail_writes: AtomicBool,
}

impl RecordingDatafiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write fail with an I/O error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DatafileEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn page(&self, space_id: u32, page_no: u32) -> Vec<u8> {
        self.read(space_id, page_no as u64 * PAGE_SIZE as u64, PAGE_SIZE)
            .unwrap_or_default()
    }

    /// Overwrites bytes without logging an event.
    pub fn poke(&self, space_id: u32, offset: u64, data: &[u8]) {
        let mut files = self.files.lock();
        let file = files.entry(space_id).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
    }
}

impl Datafiles for RecordingDatafiles {
    fn read(&self, space_id: u32, offset: u64, len: usize) -> Result<Vec<u8>, DatafileError> {
        let files = self.files.lock();
        let mut out = vec![0u8; len];
        if let Some(file) = files.get(&space_id) {
            let start = (offset as usize).min(file.len());
            let end = (offset as usize + len).min(file.len());
            out[..end - start].copy_from_slice(&file[start..end]);
        }
        Ok(out)
    }

    fn write(
        &self,
        space_id: u32,
        offset: u64,
        data: &[u8],
        asynchronous: bool,
    ) -> Result<(), DatafileError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DatafileError::Io {
                space_id,
                source: IoError::from(std::io::Error::other("injected write failure")),
            });
        }
        self.poke(space_id, offset, data);
        self.events.lock().push(DatafileEvent::Write {
            space_id,
            offset,
            len: data.len(),
            asynchronous,
        });
        Ok(())
    }

    fn flush(&self, space_id: u32) -> Result<(), DatafileError> {
        self.events.lock().push(DatafileEvent::Flush(space_id));
        Ok(())
    }

    fn fsync_all_pending_writes(&self) -> Result<(), DatafileError> {
        self.events.lock().push(DatafileEvent::FsyncAll);
        Ok(())
    }
}

/// Adds a fixed delay to every read of the wrapped datafiles.
pub struct LatencyDatafiles {
    inner: Arc<dyn Datafiles>,
    read_latency: Duration,
    reads: AtomicU64,
}

impl LatencyDatafiles {
    pub fn new(inner: Arc<dyn Datafiles>, read_latency: Duration) -> Self {
        Self {
            inner,
            read_latency,
            reads: AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Datafiles for LatencyDatafiles {
    fn read(&self, space_id: u32, offset: u64, len: usize) -> Result<Vec<u8>, DatafileError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        thread::sleep(self.read_latency);
        self.inner.read(space_id, offset, len)
    }

    fn write(
        &self,
        space_id: u32,
        offset: u64,
        data: &[u8],
        asynchronous: bool,
    ) -> Result<(), DatafileError> {
        self.inner.write(space_id, offset, data, asynchronous)
    }

    fn flush(&self, space_id: u32) -> Result<(), DatafileError> {
        self.inner.flush(space_id)
    }

    fn fsync_all_pending_writes(&self) -> Result<(), DatafileError> {
        self.inner.fsync_all_pending_writes()
    }
}

/// Dictionary whose metadata lock stays busy until `release` is called.
pub struct ContendedDictionary {
    inner: Arc<InMemoryDictionary>,
    held: Mutex<bool>,
    busy_replies: AtomicU32,
}

impl ContendedDictionary {
    pub fn new(inner: Arc<InMemoryDictionary>) -> Self {
        Self {
            inner,
            held: Mutex::new(true),
            busy_replies: AtomicU32::new(0),
        }
    }

    pub fn release(&self) {
        *self.held.lock() = false;
    }

    pub fn busy_replies(&self) -> u32 {
        self.busy_replies.load(Ordering::Relaxed)
    }
}

impl DataDictionary for ContendedDictionary {
    fn begin_exclusive_metadata_txn(&self, space_id: u32) -> Result<DictionaryTxn, DictionaryError> {
        if *self.held.lock() {
            self.busy_replies.fetch_add(1, Ordering::Relaxed);
            return Err(DictionaryError::Busy(space_id));
        }
        self.inner.begin_exclusive_metadata_txn(space_id)
    }

    fn set_tablespace_encryption_flag(
        &self,
        txn: &DictionaryTxn,
        encrypted: bool,
    ) -> Result<(), DictionaryError> {
        self.inner.set_tablespace_encryption_flag(txn, encrypted)
    }

    fn commit(&self, txn: DictionaryTxn) -> Result<(), DictionaryError> {
        self.inner.commit(txn)
    }

    fn rollback(&self, txn: DictionaryTxn) {
        self.inner.rollback(txn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

/// Tracing layer that keeps every event it sees.
#[derive(Clone, Default)]
pub struct RecordingLayer {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingLayer {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, level: Level, message: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level && event.message.contains(message))
            .count()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

impl<S: Subscriber> Layer<S> for RecordingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(RecordedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn test_config() -> PageCacheConfig {
    let mut config = PageCacheConfig::default();
    config.page_size = PAGE_SIZE;
    config.pool_frames = 64;
    config.doublewrite.block_size = 4;
    config.doublewrite.block1_page_no = 8;
    config.doublewrite.block2_page_no = 12;
    config.cleaner.enabled = false;
    config.rotation.threads = 0;
    config.rotation.encrypt_tables = EncryptTables::OnlineToKeyring;
    config.rotation.default_key_id = 1;
    config.rotation.rotate_key_age = 1;
    config
}

/// A manager over recording datafiles and in-memory services.
pub struct Harness {
    pub datafiles: Arc<RecordingDatafiles>,
    pub log: Arc<InMemoryRedoLog>,
    pub keyring: Arc<InMemoryKeyring>,
    pub dictionary: Arc<InMemoryDictionary>,
    pub manager: Manager,
}

impl Harness {
    pub fn new(config: PageCacheConfig) -> Self {
        let datafiles = Arc::new(RecordingDatafiles::new());
        let keyring = Arc::new(InMemoryKeyring::new());
        let dictionary = Arc::new(InMemoryDictionary::new());
        Self::with_services(config, datafiles, keyring, dictionary.clone(), dictionary)
    }

    pub fn with_services(
        config: PageCacheConfig,
        datafiles: Arc<RecordingDatafiles>,
        keyring: Arc<InMemoryKeyring>,
        dictionary: Arc<InMemoryDictionary>,
        dictionary_service: Arc<dyn DataDictionary>,
    ) -> Self {
        let log = Arc::new(InMemoryRedoLog::new(1 << 24));
        let manager = Manager::new(
            config,
            ManagerServices {
                datafiles: datafiles.clone(),
                log: log.clone(),
                keyring: keyring.clone(),
                dictionary: dictionary_service,
            },
        );
        Self {
            datafiles,
            log,
            keyring,
            dictionary,
            manager,
        }
    }

    /// Mints key versions of `key_id` until `version` exists.
    pub fn create_key_versions(&self, key_id: u32, version: u32) {
        while self.keyring.latest_version(key_id).unwrap_or(0) < version {
            self.keyring.create_new_version(key_id).unwrap();
        }
    }

    /// Opens tablespace `space_id` with `pages` pages and writes pages
    /// `1..pages`, each stamped with its page number.
    pub fn create_space(&self, space_id: u32, pages: u32) -> Arc<Tablespace> {
        let space = self
            .manager
            .open_tablespace(Tablespace::new(
                space_id,
                format!("space{space_id}"),
                SpacePurpose::Tablespace,
                pages,
                0,
            ))
            .unwrap();
        self.dictionary.register_space(space_id, false);
        let pool = self.manager.pool();
        for page_no in 1..pages {
            let mut guard = pool
                .create_page(PageId::new(space_id, page_no), PAGE_TYPE_INDEX)
                .unwrap();
            {
                let mut data = guard.data_mut();
                page::write_u32(&mut data, PAYLOAD_OFFSET, page_no * 1000 + space_id);
            }
            guard.mark_dirty(self.log.append(32));
        }
        self.manager.checkpoint().unwrap();
        space
    }

    /// Key version stored in the on-disk image of a page.
    pub fn disk_key_version(&self, space_id: u32, page_no: u32) -> u32 {
        page::read_u32(&self.datafiles.page(space_id, page_no), page::FIL_PAGE_KEY_VERSION)
    }

    /// Payload of a page as seen through the buffer pool.
    pub fn payload(&self, space_id: u32, page_no: u32) -> u32 {
        let guard = self
            .manager
            .pool()
            .get_page(PageId::new(space_id, page_no), LatchMode::Shared)
            .unwrap();
        page::read_u32(&guard.data(), PAYLOAD_OFFSET)
    }
}
