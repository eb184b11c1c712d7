//! Per-tablespace encryption state.
//!
//! [`CryptoMetadata`] carries the scheme, key id, iv and rotation progress of
//! one tablespace together with a small cache of key versions. The page-0
//! codec lives in [`page0`] and the page cipher in [`cipher`].

pub mod cipher;
pub mod page0;

use std::fmt;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::keyring::{KeyBytes, Keyring, KeyringError};
use crate::log::Lsn;
use crate::page::{self, PAGE_TYPE_ENCRYPTED, PageId, TRX_SYS_PAGE_NO};
use crate::tablespace::{MasterKey, SYSTEM_SPACE_ID, Tablespace};

pub use page0::{CRYPT_IV_LEN, Page0Error, Page0Header, TABLESPACE_IV_LEN, page0_offset};

/// Key version recorded for data that is not encrypted.
pub const NOT_ENCRYPTED: u32 = 0;

/// Key version that could not be determined.
pub const INVALID_KEY_VERSION: u32 = u32::MAX;

/// Key versions kept in each tablespace's cache.
pub const KEY_CACHE_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CryptScheme {
    Unencrypted = 0,
    Scheme1 = 1,
}

impl CryptScheme {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CryptScheme::Unencrypted),
            1 => Some(CryptScheme::Scheme1),
            _ => None,
        }
    }
}

/// Per-tablespace encryption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptionMode {
    /// Follow the global online-encryption policy.
    Default = 0,
    /// Always encrypted.
    On = 1,
    /// Never encrypted by online encryption.
    Off = 2,
}

impl EncryptionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EncryptionMode::Default),
            1 => Some(EncryptionMode::On),
            2 => Some(EncryptionMode::Off),
            _ => None,
        }
    }
}

/// Whether page 0 records an unfinished master-key migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RotationMarker {
    NoRotation = 0,
    MasterKeyToRotatedKey = 1,
}

impl RotationMarker {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(RotationMarker::NoRotation),
            1 => Some(RotationMarker::MasterKeyToRotatedKey),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("key {key_id} version {version} unavailable: {source}")]
    KeyUnavailable {
        key_id: u32,
        version: u32,
        #[source]
        source: KeyringError,
    },
    #[error("page {page} failed to encrypt")]
    Encrypt { page: PageId },
    #[error("page {page} failed to decrypt")]
    Decrypt { page: PageId },
    #[error("page {page} is encrypted but tablespace has no key material")]
    NoKeyMaterial { page: PageId },
    #[error(transparent)]
    Page0(#[from] Page0Error),
}

/// Progress of a rotation pass over one tablespace.
#[derive(Debug, Clone, Default)]
pub struct RotateState {
    /// First page not yet handed to a worker.
    pub next_offset: u32,
    /// Pages at or past this offset are not part of the pass.
    pub max_offset: u32,
    pub active_threads: u32,
    /// Oldest key version still seen on a page during this pass.
    pub min_key_version_found: u32,
    /// LSN up to which pages dirtied by the pass must be flushed.
    pub end_lsn: Lsn,
    pub starting: bool,
    pub flushing: bool,
    pub start_time: Option<Instant>,
}

/// Mutable part of [`CryptoMetadata`], guarded by the crypto mutex.
#[derive(Clone)]
pub struct CryptState {
    pub scheme: CryptScheme,
    /// Oldest key version needed to read any page on disk.
    pub min_key_version: u32,
    pub encryption: EncryptionMode,
    /// Key version new page writes use.
    pub encrypting_with_key_version: u32,
    pub rotation: RotationMarker,
    /// Master key and iv carried through a master-key migration.
    pub tablespace_key: Option<KeyBytes>,
    pub tablespace_iv: Option<[u8; TABLESPACE_IV_LEN]>,
    /// Latest key version seen at the keyring.
    pub key_found: u32,
    pub keyserver_requests: u64,
    pub rotate: RotateState,
}

impl fmt::Debug for CryptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptState")
            .field("scheme", &self.scheme)
            .field("min_key_version", &self.min_key_version)
            .field("encryption", &self.encryption)
            .field("encrypting_with_key_version", &self.encrypting_with_key_version)
            .field("rotation", &self.rotation)
            .field("key_found", &self.key_found)
            .field("rotate", &self.rotate)
            .finish()
    }
}

#[derive(Default)]
struct KeyCache {
    slots: [Option<(u32, KeyBytes)>; KEY_CACHE_SLOTS],
}

impl KeyCache {
    fn get(&self, version: u32) -> Option<KeyBytes> {
        self.slots
            .iter()
            .flatten()
            .find(|(cached, _)| *cached == version)
            .map(|(_, key)| *key)
    }

    /// Evicts the last slot and puts `(version, key)` at the front.
    fn insert_front(&mut self, version: u32, key: KeyBytes) {
        self.slots.rotate_right(1);
        self.slots[0] = Some((version, key));
    }

    fn versions(&self) -> Vec<u32> {
        self.slots.iter().flatten().map(|(version, _)| *version).collect()
    }
}

/// Encryption configuration of one tablespace.
pub struct CryptoMetadata {
    key_id: u32,
    iv: [u8; CRYPT_IV_LEN],
    page0_offset: usize,
    state: Mutex<CryptState>,
    keys: Mutex<KeyCache>,
}

impl CryptoMetadata {
    /// Fresh metadata with a random iv for a tablespace of `page_size` pages.
    pub fn new(key_id: u32, encryption: EncryptionMode, page_size: usize) -> Self {
        let mut iv = [0u8; CRYPT_IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        Self::with_state(
            key_id,
            iv,
            page_size,
            CryptState {
                scheme: CryptScheme::Unencrypted,
                min_key_version: NOT_ENCRYPTED,
                encryption,
                encrypting_with_key_version: NOT_ENCRYPTED,
                rotation: RotationMarker::NoRotation,
                tablespace_key: None,
                tablespace_iv: None,
                key_found: NOT_ENCRYPTED,
                keyserver_requests: 0,
                rotate: RotateState::default(),
            },
        )
    }

    /// Metadata recovered from a page-0 header.
    pub fn from_header(header: &Page0Header, page_size: usize) -> Self {
        Self::with_state(
            header.key_id,
            header.iv,
            page_size,
            CryptState {
                scheme: header.scheme,
                min_key_version: header.min_key_version,
                encryption: header.encryption,
                encrypting_with_key_version: header.min_key_version,
                rotation: header.rotation,
                tablespace_key: header.tablespace_key,
                tablespace_iv: header.tablespace_iv,
                key_found: header.min_key_version,
                keyserver_requests: 0,
                rotate: RotateState::default(),
            },
        )
    }

    fn with_state(key_id: u32, iv: [u8; CRYPT_IV_LEN], page_size: usize, state: CryptState) -> Self {
        Self {
            key_id,
            iv,
            page0_offset: page0_offset(page_size),
            state: Mutex::new(state),
            keys: Mutex::new(KeyCache::default()),
        }
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn iv(&self) -> &[u8; CRYPT_IV_LEN] {
        &self.iv
    }

    pub fn page0_offset(&self) -> usize {
        self.page0_offset
    }

    /// Locks the crypto mutex.
    pub fn state(&self) -> MutexGuard<'_, CryptState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> CryptState {
        self.state.lock().clone()
    }

    pub fn scheme(&self) -> CryptScheme {
        self.state.lock().scheme
    }

    pub fn min_key_version(&self) -> u32 {
        self.state.lock().min_key_version
    }

    pub fn cached_key_versions(&self) -> Vec<u32> {
        self.keys.lock().versions()
    }

    /// Key material of `version`, from the cache or the keyring.
    pub fn get_key(&self, keyring: &dyn Keyring, version: u32) -> Result<KeyBytes, CryptError> {
        if let Some(key) = self.keys.lock().get(version) {
            return Ok(key);
        }
        self.state.lock().keyserver_requests += 1;
        let key = keyring
            .fetch_key(self.key_id, version)
            .map_err(|source| CryptError::KeyUnavailable {
                key_id: self.key_id,
                version,
                source,
            })?;
        let mut cache = self.keys.lock();
        if cache.get(version).is_none() {
            cache.insert_front(version, key);
        }
        trace!(key_id = self.key_id, version, "key version cached");
        Ok(key)
    }

    /// Like [`Self::get_key`], but `None` asks for the latest version and
    /// `create_if_missing` lets the keyring mint the first version.
    pub fn get_key_or_create(
        &self,
        keyring: &dyn Keyring,
        version_hint: Option<u32>,
        create_if_missing: bool,
    ) -> Result<(u32, KeyBytes), CryptError> {
        if let Some(version) = version_hint {
            return self.get_key(keyring, version).map(|key| (version, key));
        }
        self.state.lock().keyserver_requests += 1;
        match keyring.latest_version(self.key_id) {
            Ok(version) => self.get_key(keyring, version).map(|key| (version, key)),
            Err(KeyringError::NotFound { .. }) if create_if_missing => {
                let (version, key) = keyring.create_new_version(self.key_id).map_err(|source| {
                    CryptError::KeyUnavailable {
                        key_id: self.key_id,
                        version: NOT_ENCRYPTED,
                        source,
                    }
                })?;
                debug!(key_id = self.key_id, version, "created first key version");
                self.keys.lock().insert_front(version, key);
                Ok((version, key))
            }
            Err(source) => Err(CryptError::KeyUnavailable {
                key_id: self.key_id,
                version: NOT_ENCRYPTED,
                source,
            }),
        }
    }

    /// Latest key version at the keyring, or [`INVALID_KEY_VERSION`].
    ///
    /// With `create_if_missing` a first version is minted when the key does
    /// not exist yet.
    pub fn key_get_latest_version(&self, keyring: &dyn Keyring, create_if_missing: bool) -> u32 {
        match self.get_key_or_create(keyring, None, create_if_missing) {
            Ok((version, _)) => {
                self.state.lock().key_found = version;
                version
            }
            Err(err) => {
                warn!(key_id = self.key_id, error = %err, "latest key version unavailable");
                self.state.lock().key_found = INVALID_KEY_VERSION;
                INVALID_KEY_VERSION
            }
        }
    }

    /// Makes sure the key of `version` is cached before pages need it.
    pub fn load_needed_keys(&self, keyring: &dyn Keyring, version: u32) -> Result<(), CryptError> {
        if version == NOT_ENCRYPTED {
            return Ok(());
        }
        self.get_key(keyring, version).map(|_| ())
    }

    /// Writes the crypto header into page 0 of `space`.
    ///
    /// The migration key and iv are written only while `rotation` is
    /// [`RotationMarker::MasterKeyToRotatedKey`]. Must not be called with the
    /// crypto mutex held.
    pub fn write_page0(
        &self,
        space: &Tablespace,
        frame: &mut [u8],
        min_key_version: u32,
        scheme: CryptScheme,
        rotation: RotationMarker,
    ) -> Result<(), CryptError> {
        let (encryption, tablespace_key, tablespace_iv) = {
            let state = self.state.lock();
            (state.encryption, state.tablespace_key, state.tablespace_iv)
        };
        let migrating = rotation == RotationMarker::MasterKeyToRotatedKey;
        let header = Page0Header {
            space_id: space.id(),
            scheme,
            min_key_version,
            key_id: self.key_id,
            encryption,
            iv: self.iv,
            rotation,
            tablespace_key: tablespace_key.filter(|_| migrating),
            tablespace_iv: tablespace_iv.filter(|_| migrating),
        };
        page0::encode(frame, &header, space.flags())?;
        trace!(space_id = space.id(), min_key_version, ?scheme, ?rotation, "page 0 crypto header written");
        Ok(())
    }

    /// Master key usable to read master-key encrypted pages of `space`.
    pub fn migration_master_key(&self) -> Option<MasterKey> {
        let state = self.state.lock();
        match (state.tablespace_key, state.tablespace_iv) {
            (Some(key), Some(iv)) => Some(MasterKey { key, iv }),
            _ => None,
        }
    }
}

impl fmt::Debug for CryptoMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoMetadata")
            .field("key_id", &self.key_id)
            .field("page0_offset", &self.page0_offset)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Parses the crypto header of page 0, `Ok(None)` if there is none.
pub fn read_page0(frame: &[u8]) -> Result<Option<CryptoMetadata>, CryptError> {
    Ok(page0::decode(frame)?.map(|header| CryptoMetadata::from_header(&header, frame.len())))
}

/// How a page write is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEncryption {
    None,
    Rotated { key_version: u32 },
    MasterKey(MasterKey),
}

impl PageEncryption {
    /// Key version to record in the page header.
    pub fn key_version(&self) -> u32 {
        match self {
            PageEncryption::Rotated { key_version } => *key_version,
            _ => NOT_ENCRYPTED,
        }
    }
}

/// Pages that always stay in plaintext.
pub fn is_plaintext_page(id: PageId) -> bool {
    id.page_no == 0 || (id.space_id == SYSTEM_SPACE_ID && id.page_no == TRX_SYS_PAGE_NO)
}

/// Chooses the encryption for a write of page `page_no` of `space`.
pub fn encryption_for_write(space: &Tablespace, page_no: u32) -> PageEncryption {
    if is_plaintext_page(space.page_id(page_no)) {
        return PageEncryption::None;
    }
    if let Some(crypt) = space.crypt_data() {
        let state = crypt.state();
        if state.scheme == CryptScheme::Scheme1 {
            return match state.encrypting_with_key_version {
                NOT_ENCRYPTED | INVALID_KEY_VERSION => PageEncryption::None,
                key_version => PageEncryption::Rotated { key_version },
            };
        }
    }
    match space.master_key() {
        Some(master) => PageEncryption::MasterKey(master),
        None => PageEncryption::None,
    }
}

/// Encrypts a page image that already carries its LSN.
pub fn encrypt_image(
    space: &Tablespace,
    keyring: &dyn Keyring,
    encryption: &PageEncryption,
    image: &mut [u8],
    page_no: u32,
) -> Result<(), CryptError> {
    let id = space.page_id(page_no);
    let zip_size = space.zip_size();
    match encryption {
        PageEncryption::None => {
            page::write_u32(image, page::FIL_PAGE_KEY_VERSION, NOT_ENCRYPTED);
            Ok(())
        }
        PageEncryption::Rotated { key_version } => {
            let crypt = space.crypt_data().ok_or(CryptError::NoKeyMaterial { page: id })?;
            let key = crypt.get_key(keyring, *key_version)?;
            cipher::encrypt_page(image, id, *key_version, &key, crypt.iv(), zip_size)
        }
        PageEncryption::MasterKey(master) => cipher::encrypt_page_master_key(image, id, master, zip_size),
    }
}

/// Decrypts a page image read from disk, in place.
pub fn decrypt_image(
    space: &Tablespace,
    keyring: &dyn Keyring,
    image: &mut [u8],
    page_no: u32,
) -> Result<(), CryptError> {
    let id = space.page_id(page_no);
    if is_plaintext_page(id) || page::is_blank(image) {
        return Ok(());
    }
    let zip_size = space.zip_size();
    let crypt = space.crypt_data();
    if page::page_type(image) == PAGE_TYPE_ENCRYPTED {
        let master = space
            .master_key()
            .or_else(|| crypt.as_ref().and_then(|c| c.migration_master_key()))
            .ok_or(CryptError::NoKeyMaterial { page: id })?;
        return cipher::decrypt_page_master_key(image, id, &master, zip_size);
    }
    let key_version = page::read_u32(image, page::FIL_PAGE_KEY_VERSION);
    if key_version == NOT_ENCRYPTED {
        return Ok(());
    }
    let crypt = crypt.ok_or(CryptError::NoKeyMaterial { page: id })?;
    let key = crypt.get_key(keyring, key_version)?;
    cipher::decrypt_page(image, id, &key, crypt.iv(), zip_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::InMemoryKeyring;
    use crate::tablespace::SpacePurpose;

    #[test]
    fn key_cache_evicts_oldest_slot() {
        let keyring = InMemoryKeyring::new();
        for _ in 0..5 {
            keyring.create_new_version(1).expect("create");
        }
        let crypt = CryptoMetadata::new(1, EncryptionMode::Default, 4096);
        for version in 1..=4 {
            crypt.get_key(&keyring, version).expect("key");
        }
        assert_eq!(crypt.cached_key_versions(), vec![4, 3, 2]);

        let fetches = keyring.fetch_count();
        crypt.get_key(&keyring, 3).expect("cached");
        assert_eq!(keyring.fetch_count(), fetches);
    }

    #[test]
    fn get_key_or_create_mints_first_version() {
        let keyring = InMemoryKeyring::new();
        let crypt = CryptoMetadata::new(9, EncryptionMode::Default, 4096);
        assert!(crypt.get_key_or_create(&keyring, None, false).is_err());
        let (version, key) = crypt.get_key_or_create(&keyring, None, true).expect("create");
        assert_eq!(version, 1);
        assert_eq!(keyring.fetch_key(9, 1).expect("fetch"), key);
        assert_eq!(crypt.key_get_latest_version(&keyring, false), 1);
    }

    #[test]
    fn unavailable_key_reports_invalid_version() {
        let keyring = InMemoryKeyring::new();
        let crypt = CryptoMetadata::new(2, EncryptionMode::Default, 4096);
        assert_eq!(crypt.key_get_latest_version(&keyring, false), INVALID_KEY_VERSION);
    }

    #[test]
    fn page0_round_trip_through_metadata() {
        let space = Tablespace::new(12, "t12", SpacePurpose::Tablespace, 32, 0);
        let crypt = CryptoMetadata::new(4, EncryptionMode::On, 4096);
        let mut frame = vec![0u8; 4096];
        crypt
            .write_page0(&space, &mut frame, 6, CryptScheme::Scheme1, RotationMarker::NoRotation)
            .expect("write");

        let decoded = read_page0(&frame).expect("read").expect("present");
        assert_eq!(decoded.key_id(), 4);
        assert_eq!(decoded.iv(), crypt.iv());
        assert_eq!(decoded.min_key_version(), 6);
        assert_eq!(decoded.scheme(), CryptScheme::Scheme1);
        assert_eq!(decoded.state().encryption, EncryptionMode::On);
    }

    #[test]
    fn plaintext_pages_are_never_encrypted() {
        let space = Tablespace::new(0, "system", SpacePurpose::Tablespace, 32, 0).with_master_key(MasterKey {
            key: [1u8; 32],
            iv: [2u8; 32],
        });
        assert_eq!(encryption_for_write(&space, 0), PageEncryption::None);
        assert_eq!(encryption_for_write(&space, TRX_SYS_PAGE_NO), PageEncryption::None);
        assert!(matches!(encryption_for_write(&space, 6), PageEncryption::MasterKey(_)));
    }

    #[test]
    fn rotated_pages_decrypt_with_cached_key() {
        let keyring = InMemoryKeyring::new();
        keyring.create_new_version(1).expect("create");
        let space = Tablespace::new(3, "t3", SpacePurpose::Tablespace, 32, 0);
        let crypt = std::sync::Arc::new(CryptoMetadata::new(1, EncryptionMode::Default, 4096));
        {
            let mut state = crypt.state();
            state.scheme = CryptScheme::Scheme1;
            state.encrypting_with_key_version = 1;
        }
        space.install_crypt_data(crypt);

        let mut image = vec![0u8; 4096];
        page::init_header(&mut image, PageId::new(3, 4), page::PAGE_TYPE_INDEX);
        image[100] = 0xab;
        let encryption = encryption_for_write(&space, 4);
        assert_eq!(encryption, PageEncryption::Rotated { key_version: 1 });
        encrypt_image(&space, &keyring, &encryption, &mut image, 4).expect("encrypt");
        assert_ne!(image[100], 0xab);

        decrypt_image(&space, &keyring, &mut image, 4).expect("decrypt");
        assert_eq!(image[100], 0xab);
    }
}
