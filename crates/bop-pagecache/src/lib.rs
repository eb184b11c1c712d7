//! Buffer-pool flushing, doublewrite staging and online tablespace key
//! rotation.
//!
//! The [`Manager`] wires the pieces together: a [`BufferPool`] whose dirty
//! pages are written by the [`FlushController`] through the
//! [`DoublewriteStager`], a [`PageCleaner`] pacing checkpoint flushes with the
//! [`FlushRateEstimator`], and a [`KeyRotationScheduler`] re-encrypting
//! tablespaces in the background. Datafiles, the redo log, the keyring and
//! the data dictionary are external services reached through traits.

pub mod buffer_pool;
pub mod config;
pub mod crypt;
pub mod datafile;
pub mod dictionary;
mod dirty_index;
pub mod doublewrite;
mod error;
pub mod flush;
pub mod flush_rate;
pub mod io;
pub mod keyring;
mod links;
pub mod log;
mod manager;
pub mod page;
pub mod rotation;
pub mod tablespace;

pub use buffer_pool::{BufferPool, BufferPoolSnapshot, LatchMode, PageGuard, PoolCore, PoolError};
pub use config::{
    DoublewriteConfig, EncryptTables, FlushConfig, PageCacheConfig, PageCleanerConfig,
    RotationConfig,
};
pub use crypt::{CryptError, CryptScheme, CryptoMetadata, EncryptionMode, RotationMarker};
pub use datafile::{DatafileError, Datafiles, FileDatafiles};
pub use dictionary::{DataDictionary, DictionaryError, InMemoryDictionary};
pub use dirty_index::{DirtyEntry, DirtyIndexError, DirtyPageIndex};
pub use doublewrite::{DoublewriteError, DoublewriteSnapshot, DoublewriteStager};
pub use error::{ErrorCode, ErrorWithContext, ResultExt};
pub use flush::{FlushBatchResult, FlushController, FlushControllerSnapshot, FlushError};
pub use flush_rate::{FlushRateEstimator, FlushRateSnapshot, PageCleaner};
pub use io::{IoDriver, IoError, IoFile, IoOpenOptions, IoResult, SharedIoDriver, StdIoDriver};
pub use keyring::{InMemoryKeyring, Keyring, KeyringError};
pub use log::{InMemoryRedoLog, LogWaitMode, Lsn, RedoLog};
pub use manager::{Manager, ManagerDiagnostics, ManagerError, ManagerServices};
pub use page::PageId;
pub use rotation::{
    CryptSpaceStatus, KeyRotationScheduler, KeyRotationSnapshot, RotationError, RotationStats,
    needs_rotation,
};
pub use tablespace::{MasterKey, SpacePurpose, SpaceRef, Tablespace, TablespaceRegistry};
