//! Key-provider boundary.
//!
//! A key is identified by `(key_id, version)`. Versions start at 1 and only
//! grow; version 0 is reserved for "not encrypted".

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;

/// Raw AES-256 key material.
pub type KeyBytes = [u8; KEY_LEN];

pub const KEY_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyringError {
    #[error("key {key_id} version {version} not found")]
    NotFound { key_id: u32, version: u32 },
    #[error("keyring unavailable: {0}")]
    Unavailable(String),
}

pub trait Keyring: Send + Sync {
    fn fetch_key(&self, key_id: u32, version: u32) -> Result<KeyBytes, KeyringError>;

    /// Mints the next version of `key_id`, creating the key if needed.
    fn create_new_version(&self, key_id: u32) -> Result<(u32, KeyBytes), KeyringError>;

    /// Latest version of `key_id`, or `NotFound` if the key does not exist.
    fn latest_version(&self, key_id: u32) -> Result<u32, KeyringError>;
}

#[derive(Default)]
struct KeyringState {
    keys: HashMap<u32, Vec<KeyBytes>>,
    unavailable: bool,
    fetches: u64,
}

/// Keyring that keeps randomly generated keys in memory.
#[derive(Default)]
pub struct InMemoryKeyring {
    state: Mutex<KeyringState>,
}

impl InMemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` until called with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of `fetch_key` calls served so far.
    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetches
    }

    fn check_available(state: &KeyringState) -> Result<(), KeyringError> {
        if state.unavailable {
            return Err(KeyringError::Unavailable("keyring disabled".into()));
        }
        Ok(())
    }
}

impl Keyring for InMemoryKeyring {
    fn fetch_key(&self, key_id: u32, version: u32) -> Result<KeyBytes, KeyringError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.fetches += 1;
        let not_found = KeyringError::NotFound { key_id, version };
        if version == 0 {
            return Err(not_found);
        }
        state
            .keys
            .get(&key_id)
            .and_then(|versions| versions.get(version as usize - 1))
            .copied()
            .ok_or(not_found)
    }

    fn create_new_version(&self, key_id: u32) -> Result<(u32, KeyBytes), KeyringError> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        let versions = state.keys.entry(key_id).or_default();
        versions.push(key);
        let version = versions.len() as u32;
        debug!(key_id, version, "created key version");
        Ok((version, key))
    }

    fn latest_version(&self, key_id: u32) -> Result<u32, KeyringError> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        match state.keys.get(&key_id) {
            Some(versions) if !versions.is_empty() => Ok(versions.len() as u32),
            _ => Err(KeyringError::NotFound { key_id, version: 0 }),
        }
    }
}

impl fmt::Debug for InMemoryKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryKeyring")
            .field("keys", &state.keys.len())
            .field("unavailable", &state.unavailable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_sequential() {
        let keyring = InMemoryKeyring::new();
        let (v1, k1) = keyring.create_new_version(4).expect("create");
        let (v2, k2) = keyring.create_new_version(4).expect("create");
        assert_eq!((v1, v2), (1, 2));
        assert_ne!(k1, k2);
        assert_eq!(keyring.latest_version(4).expect("latest"), 2);
        assert_eq!(keyring.fetch_key(4, 1).expect("fetch"), k1);
    }

    #[test]
    fn missing_keys_are_reported() {
        let keyring = InMemoryKeyring::new();
        assert_eq!(
            keyring.latest_version(1),
            Err(KeyringError::NotFound { key_id: 1, version: 0 })
        );
        keyring.create_new_version(1).expect("create");
        assert!(matches!(
            keyring.fetch_key(1, 5),
            Err(KeyringError::NotFound { version: 5, .. })
        ));
    }

    #[test]
    fn unavailable_keyring_fails_every_call() {
        let keyring = InMemoryKeyring::new();
        keyring.create_new_version(1).expect("create");
        keyring.set_unavailable(true);
        assert!(matches!(
            keyring.fetch_key(1, 1),
            Err(KeyringError::Unavailable(_))
        ));
        keyring.set_unavailable(false);
        assert!(keyring.fetch_key(1, 1).is_ok());
    }
}
