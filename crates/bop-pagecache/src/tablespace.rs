//! Tablespaces and the registry that hands them out.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::crypt::CryptoMetadata;
use crate::keyring::KeyBytes;
use crate::page::PageId;

/// Id of the system tablespace, which holds the doublewrite blocks.
pub const SYSTEM_SPACE_ID: u32 = 0;

/// Space flag bit recording that the tablespace is encrypted.
pub const FSP_FLAGS_ENCRYPTION: u32 = 1 << 13;
const FSP_FLAGS_ZIP_SSIZE_SHIFT: u32 = 1;
const FSP_FLAGS_ZIP_SSIZE_MASK: u32 = 0xf << FSP_FLAGS_ZIP_SSIZE_SHIFT;

/// Compressed page size encoded in `flags`, if the space is compressed.
pub fn flags_zip_size(flags: u32) -> Option<usize> {
    match (flags & FSP_FLAGS_ZIP_SSIZE_MASK) >> FSP_FLAGS_ZIP_SSIZE_SHIFT {
        0 => None,
        ssize => Some(512usize << ssize),
    }
}

/// Flags for a space compressed to `zip_size` bytes per page.
pub fn flags_with_zip_size(flags: u32, zip_size: Option<usize>) -> u32 {
    let ssize = match zip_size {
        Some(size) => size.trailing_zeros().saturating_sub(9),
        None => 0,
    };
    (flags & !FSP_FLAGS_ZIP_SSIZE_MASK) | ((ssize << FSP_FLAGS_ZIP_SSIZE_SHIFT) & FSP_FLAGS_ZIP_SSIZE_MASK)
}

pub fn flags_is_encrypted(flags: u32) -> bool {
    flags & FSP_FLAGS_ENCRYPTION != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacePurpose {
    Tablespace,
    Temporary,
    Log,
}

/// Master key and iv of a tablespace encrypted before rotated keys existed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MasterKey {
    pub key: KeyBytes,
    pub iv: [u8; 32],
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").field("key", &"<redacted>").finish()
    }
}

pub struct Tablespace {
    id: u32,
    name: String,
    purpose: SpacePurpose,
    flags: AtomicU32,
    size: AtomicU32,
    free_limit: AtomicU32,
    stopping: AtomicBool,
    corrupted: AtomicBool,
    exclude_from_rotation: AtomicBool,
    pending_ops: AtomicU32,
    crypt: RwLock<Option<Arc<CryptoMetadata>>>,
    master_key: Mutex<Option<MasterKey>>,
}

impl Tablespace {
    /// A tablespace of `size` pages, all of them allocated.
    pub fn new(id: u32, name: impl Into<String>, purpose: SpacePurpose, size: u32, flags: u32) -> Self {
        Self {
            id,
            name: name.into(),
            purpose,
            flags: AtomicU32::new(flags),
            size: AtomicU32::new(size),
            free_limit: AtomicU32::new(size),
            stopping: AtomicBool::new(false),
            corrupted: AtomicBool::new(false),
            exclude_from_rotation: AtomicBool::new(false),
            pending_ops: AtomicU32::new(0),
            crypt: RwLock::new(None),
            master_key: Mutex::new(None),
        }
    }

    pub fn with_master_key(self, master_key: MasterKey) -> Self {
        *self.master_key.lock() = Some(master_key);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn purpose(&self) -> SpacePurpose {
        self.purpose
    }

    pub fn page_id(&self, page_no: u32) -> PageId {
        PageId::new(self.id, page_no)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    pub fn zip_size(&self) -> Option<usize> {
        flags_zip_size(self.flags())
    }

    /// Bytes per page on disk.
    pub fn physical_page_size(&self, page_size: usize) -> usize {
        self.zip_size().unwrap_or(page_size)
    }

    /// Size in pages.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Release);
    }

    /// First page that has never been allocated.
    pub fn free_limit(&self) -> u32 {
        self.free_limit.load(Ordering::Acquire)
    }

    pub fn set_free_limit(&self, free_limit: u32) {
        self.free_limit.store(free_limit, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn mark_corrupted(&self) {
        if !self.corrupted.swap(true, Ordering::AcqRel) {
            warn!(space_id = self.id, name = %self.name, "tablespace marked corrupted");
        }
    }

    pub fn is_excluded_from_rotation(&self) -> bool {
        self.exclude_from_rotation.load(Ordering::Acquire)
    }

    pub fn exclude_from_rotation(&self) {
        self.exclude_from_rotation.store(true, Ordering::Release);
    }

    pub fn pending_ops(&self) -> u32 {
        self.pending_ops.load(Ordering::Acquire)
    }

    pub fn crypt_data(&self) -> Option<Arc<CryptoMetadata>> {
        self.crypt.read().clone()
    }

    /// Publishes crypto metadata unless some is already present; returns the
    /// metadata in effect.
    pub fn install_crypt_data(&self, crypt: Arc<CryptoMetadata>) -> Arc<CryptoMetadata> {
        let mut guard = self.crypt.write();
        match guard.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                *guard = Some(crypt.clone());
                crypt
            }
        }
    }

    pub fn master_key(&self) -> Option<MasterKey> {
        *self.master_key.lock()
    }

    pub fn clear_master_key(&self) {
        self.master_key.lock().take();
    }
}

impl fmt::Debug for Tablespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tablespace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("purpose", &self.purpose)
            .field("size", &self.size())
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Counted reference that keeps a tablespace from being closed underneath.
pub struct SpaceRef {
    space: Arc<Tablespace>,
}

impl SpaceRef {
    fn new(space: Arc<Tablespace>) -> Self {
        space.pending_ops.fetch_add(1, Ordering::AcqRel);
        Self { space }
    }

}

impl Clone for SpaceRef {
    fn clone(&self) -> Self {
        Self::new(self.space.clone())
    }
}

impl Deref for SpaceRef {
    type Target = Tablespace;

    fn deref(&self) -> &Tablespace {
        &self.space
    }
}

impl Drop for SpaceRef {
    fn drop(&mut self) {
        self.space.pending_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpaceRef").field(&self.space.id).finish()
    }
}

/// All open tablespaces, keyed by id.
#[derive(Default)]
pub struct TablespaceRegistry {
    spaces: DashMap<u32, Arc<Tablespace>>,
}

impl TablespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, space: Tablespace) -> Arc<Tablespace> {
        let space = Arc::new(space);
        debug!(space_id = space.id, name = %space.name, size = space.size(), "tablespace registered");
        self.spaces.insert(space.id, space.clone());
        space
    }

    pub fn get(&self, space_id: u32) -> Option<Arc<Tablespace>> {
        self.spaces.get(&space_id).map(|entry| entry.value().clone())
    }

    /// A counted reference, unless the space is unknown or stopping.
    pub fn acquire(&self, space_id: u32) -> Option<SpaceRef> {
        let space = self.get(space_id)?;
        if space.is_stopping() {
            return None;
        }
        Some(SpaceRef::new(space))
    }

    pub fn remove(&self, space_id: u32) -> Option<Arc<Tablespace>> {
        self.spaces.remove(&space_id).map(|(_, space)| space)
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.spaces.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// The first live tablespace with an id above `after`, in id order.
    pub fn next_after(&self, after: Option<u32>) -> Option<SpaceRef> {
        self.ids()
            .into_iter()
            .filter(|id| after.is_none_or(|after| *id > after))
            .find_map(|id| self.acquire(id))
    }
}

impl fmt::Debug for TablespaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablespaceRegistry")
            .field("spaces", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_size_flags_round_trip() {
        for zip in [1024usize, 2048, 4096, 8192, 16384] {
            let flags = flags_with_zip_size(FSP_FLAGS_ENCRYPTION, Some(zip));
            assert_eq!(flags_zip_size(flags), Some(zip));
            assert!(flags_is_encrypted(flags));
        }
        assert_eq!(flags_zip_size(flags_with_zip_size(0, None)), None);
    }

    #[test]
    fn space_refs_count_pending_ops() {
        let registry = TablespaceRegistry::new();
        let space = registry.register(Tablespace::new(4, "t4", SpacePurpose::Tablespace, 64, 0));
        {
            let first = registry.acquire(4).expect("acquire");
            let _second = first.clone();
            assert_eq!(space.pending_ops(), 2);
        }
        assert_eq!(space.pending_ops(), 0);

        space.set_stopping();
        assert!(registry.acquire(4).is_none());
    }

    #[test]
    fn next_after_walks_in_id_order() {
        let registry = TablespaceRegistry::new();
        for id in [9u32, 2, 5] {
            registry.register(Tablespace::new(id, format!("t{id}"), SpacePurpose::Tablespace, 8, 0));
        }
        registry.get(5).expect("space").set_stopping();

        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(space) = registry.next_after(cursor) {
            seen.push(space.id());
            cursor = Some(space.id());
        }
        assert_eq!(seen, vec![2, 9]);
    }
}
