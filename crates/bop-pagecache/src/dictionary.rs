//! Data-dictionary boundary.
//!
//! Only the FLUSHING phase of key rotation touches the dictionary: it takes
//! an exclusive metadata lock on the tablespace, records the new encryption
//! flag and commits.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ErrorCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DictionaryError {
    /// The exclusive metadata lock is held elsewhere; retry later.
    #[error("metadata lock on space {0} is busy")]
    Busy(u32),
    #[error("tablespace {0} is unknown to the data dictionary")]
    UnknownSpace(u32),
    #[error("data dictionary failure: {0}")]
    Failed(String),
}

impl DictionaryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DictionaryError::Busy(_) => ErrorCode::MetadataLockContention,
            DictionaryError::UnknownSpace(_) => ErrorCode::ConfigurationError,
            DictionaryError::Failed(_) => ErrorCode::Unknown,
        }
    }
}

/// Handle to an open exclusive metadata transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct DictionaryTxn {
    pub id: u64,
    pub space_id: u32,
}

pub trait DataDictionary: Send + Sync {
    fn begin_exclusive_metadata_txn(&self, space_id: u32) -> Result<DictionaryTxn, DictionaryError>;

    fn set_tablespace_encryption_flag(
        &self,
        txn: &DictionaryTxn,
        encrypted: bool,
    ) -> Result<(), DictionaryError>;

    fn commit(&self, txn: DictionaryTxn) -> Result<(), DictionaryError>;

    fn rollback(&self, txn: DictionaryTxn);
}

/// Exclusive transaction that rolls back on drop unless committed.
pub struct ExclusiveTxn<'a> {
    dictionary: &'a dyn DataDictionary,
    txn: Option<DictionaryTxn>,
}

impl<'a> ExclusiveTxn<'a> {
    pub fn begin(dictionary: &'a dyn DataDictionary, space_id: u32) -> Result<Self, DictionaryError> {
        let txn = dictionary.begin_exclusive_metadata_txn(space_id)?;
        Ok(Self {
            dictionary,
            txn: Some(txn),
        })
    }

    pub fn set_encryption_flag(&self, encrypted: bool) -> Result<(), DictionaryError> {
        match &self.txn {
            Some(txn) => self.dictionary.set_tablespace_encryption_flag(txn, encrypted),
            None => Err(DictionaryError::Failed("transaction already finished".into())),
        }
    }

    pub fn commit(mut self) -> Result<(), DictionaryError> {
        match self.txn.take() {
            Some(txn) => self.dictionary.commit(txn),
            None => Ok(()),
        }
    }
}

impl Drop for ExclusiveTxn<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            trace!(txn = txn.id, space_id = txn.space_id, "rolling back metadata txn");
            self.dictionary.rollback(txn);
        }
    }
}

#[derive(Default)]
struct DictionaryState {
    encrypted: HashMap<u32, bool>,
    locked: HashMap<u32, u64>,
    pending: HashMap<u64, bool>,
    next_txn: u64,
    busy_attempts: u32,
    commits: u64,
    rollbacks: u64,
}

/// Dictionary that keeps the per-tablespace encryption flag in memory.
///
/// Tablespaces are known once registered; `set_busy_attempts` makes the next
/// `n` lock attempts fail with [`DictionaryError::Busy`].
#[derive(Default)]
pub struct InMemoryDictionary {
    state: Mutex<DictionaryState>,
}

impl InMemoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_space(&self, space_id: u32, encrypted: bool) {
        self.state.lock().encrypted.insert(space_id, encrypted);
    }

    pub fn forget_space(&self, space_id: u32) {
        self.state.lock().encrypted.remove(&space_id);
    }

    pub fn is_encrypted(&self, space_id: u32) -> Option<bool> {
        self.state.lock().encrypted.get(&space_id).copied()
    }

    pub fn set_busy_attempts(&self, attempts: u32) {
        self.state.lock().busy_attempts = attempts;
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }
}

impl DataDictionary for InMemoryDictionary {
    fn begin_exclusive_metadata_txn(&self, space_id: u32) -> Result<DictionaryTxn, DictionaryError> {
        let mut state = self.state.lock();
        if !state.encrypted.contains_key(&space_id) {
            return Err(DictionaryError::UnknownSpace(space_id));
        }
        if state.busy_attempts > 0 {
            state.busy_attempts -= 1;
            return Err(DictionaryError::Busy(space_id));
        }
        if state.locked.contains_key(&space_id) {
            return Err(DictionaryError::Busy(space_id));
        }
        state.next_txn += 1;
        let id = state.next_txn;
        state.locked.insert(space_id, id);
        Ok(DictionaryTxn { id, space_id })
    }

    fn set_tablespace_encryption_flag(
        &self,
        txn: &DictionaryTxn,
        encrypted: bool,
    ) -> Result<(), DictionaryError> {
        let mut state = self.state.lock();
        if state.locked.get(&txn.space_id) != Some(&txn.id) {
            return Err(DictionaryError::Failed(format!(
                "txn {} does not hold the lock on space {}",
                txn.id, txn.space_id
            )));
        }
        state.pending.insert(txn.id, encrypted);
        Ok(())
    }

    fn commit(&self, txn: DictionaryTxn) -> Result<(), DictionaryError> {
        let mut state = self.state.lock();
        state.locked.remove(&txn.space_id);
        if let Some(encrypted) = state.pending.remove(&txn.id) {
            state.encrypted.insert(txn.space_id, encrypted);
        }
        state.commits += 1;
        debug!(space_id = txn.space_id, txn = txn.id, "metadata txn committed");
        Ok(())
    }

    fn rollback(&self, txn: DictionaryTxn) {
        let mut state = self.state.lock();
        state.locked.remove(&txn.space_id);
        state.pending.remove(&txn.id);
        state.rollbacks += 1;
    }
}

impl fmt::Debug for InMemoryDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryDictionary")
            .field("spaces", &state.encrypted.len())
            .field("locked", &state.locked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_lock_is_classified_as_contention() {
        assert_eq!(DictionaryError::Busy(4).code(), ErrorCode::MetadataLockContention);
        assert_eq!(DictionaryError::UnknownSpace(4).code(), ErrorCode::ConfigurationError);
        assert!(!DictionaryError::Busy(4).code().is_fatal());
    }

    #[test]
    fn committed_flag_is_visible() {
        let dict = InMemoryDictionary::new();
        dict.register_space(7, false);

        let txn = ExclusiveTxn::begin(&dict, 7).expect("begin");
        txn.set_encryption_flag(true).expect("set");
        txn.commit().expect("commit");

        assert_eq!(dict.is_encrypted(7), Some(true));
        assert_eq!(dict.commit_count(), 1);
    }

    #[test]
    fn dropped_txn_rolls_back() {
        let dict = InMemoryDictionary::new();
        dict.register_space(7, false);
        {
            let txn = ExclusiveTxn::begin(&dict, 7).expect("begin");
            txn.set_encryption_flag(true).expect("set");
        }
        assert_eq!(dict.is_encrypted(7), Some(false));
        assert_eq!(dict.rollback_count(), 1);
        assert!(ExclusiveTxn::begin(&dict, 7).is_ok());
    }

    #[test]
    fn lock_is_exclusive() {
        let dict = InMemoryDictionary::new();
        dict.register_space(1, false);
        let _held = ExclusiveTxn::begin(&dict, 1).expect("begin");
        assert!(matches!(
            ExclusiveTxn::begin(&dict, 1),
            Err(DictionaryError::Busy(1))
        ));
    }

    #[test]
    fn injected_contention_expires() {
        let dict = InMemoryDictionary::new();
        dict.register_space(2, true);
        dict.set_busy_attempts(2);
        assert!(ExclusiveTxn::begin(&dict, 2).is_err());
        assert!(ExclusiveTxn::begin(&dict, 2).is_err());
        assert!(ExclusiveTxn::begin(&dict, 2).is_ok());
    }
}
