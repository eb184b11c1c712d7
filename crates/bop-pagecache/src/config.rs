//! Configuration for the page cache.
//!
//! All structs deserialize with `#[serde(default)]`, so a partial document
//! only overrides the fields it names. Call [`PageCacheConfig::normalized`]
//! before handing a configuration to [`crate::Manager`].

use serde::{Deserialize, Serialize};

/// Default physical page size (16 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 4 * 1024;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Default number of frames in the buffer pool.
pub const DEFAULT_POOL_FRAMES: usize = 1024;

/// Pages per doublewrite block.
///
/// The staging buffer holds two blocks, so a single drain writes at most
/// `2 * DEFAULT_DOUBLEWRITE_BLOCK_SIZE` pages.
pub const DEFAULT_DOUBLEWRITE_BLOCK_SIZE: usize = 64;

/// First page of doublewrite block 1 inside the system tablespace.
pub const DEFAULT_DOUBLEWRITE_BLOCK1: u32 = 64;

/// First page of doublewrite block 2 inside the system tablespace.
pub const DEFAULT_DOUBLEWRITE_BLOCK2: u32 = 128;

/// Width of the read-ahead area; also bounds the neighbour flush window.
pub const DEFAULT_READ_AHEAD_AREA: u32 = 64;

/// Below this LRU length there is no old sublist and neighbours are not flushed.
pub const DEFAULT_LRU_OLD_MIN_LEN: usize = 512;

/// Share of the LRU kept in the old sublist, in percent.
pub const DEFAULT_LRU_OLD_RATIO_PCT: usize = 37;

/// Replaceable frames wanted near the LRU tail and in the free list.
pub const DEFAULT_FREE_BLOCK_MARGIN: usize = 5;

/// Attempts to obtain a free frame before giving up.
pub const DEFAULT_FREE_FRAME_RETRIES: usize = 16;

/// Page cleaner tick interval (milliseconds).
pub const DEFAULT_CLEANER_INTERVAL_MS: u64 = 1_000;

/// Number of one-interval samples in the flush-rate window.
pub const DEFAULT_STAT_INTERVALS: usize = 20;

/// Dirty-page percentage above which the cleaner flushes at full capacity.
pub const DEFAULT_MAX_DIRTY_PAGES_PCT: u64 = 75;

/// Pages per tick the cleaner may write when over the dirty limit.
pub const DEFAULT_IO_CAPACITY: usize = 200;

/// Total I/O operations per second shared by all rotation workers.
pub const DEFAULT_ROTATION_IOPS: u32 = 100;

/// Seconds of budget a worker allocates at a time.
pub const DEFAULT_ROTATION_ALLOC_TIME_SECS: u32 = 3;

/// Key versions a tablespace may fall behind before it is re-keyed.
pub const DEFAULT_ROTATE_KEY_AGE: u32 = 1;

/// Global policy for online encryption of tablespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptTables {
    /// No online conversion; existing rotated-key tablespaces keep their keys.
    #[default]
    Off,
    /// Encrypt every tablespace with keyring keys and keep them rotated.
    OnlineToKeyring,
    /// Decrypt every tablespace that uses keyring keys.
    OnlineFromKeyringToUnencrypted,
}

impl EncryptTables {
    pub fn is_online_encryption_on(&self) -> bool {
        matches!(self, EncryptTables::OnlineToKeyring)
    }
}

/// Doublewrite buffer placement and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoublewriteConfig {
    /// When disabled, page writes go straight to their datafiles.
    pub enabled: bool,
    /// Pages per block. The buffer holds two blocks.
    pub block_size: usize,
    /// First page number of block 1 in the system tablespace.
    pub block1_page_no: u32,
    /// First page number of block 2 in the system tablespace.
    pub block2_page_no: u32,
}

impl DoublewriteConfig {
    pub fn capacity(&self) -> usize {
        self.block_size * 2
    }
}

impl Default for DoublewriteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_size: DEFAULT_DOUBLEWRITE_BLOCK_SIZE,
            block1_page_no: DEFAULT_DOUBLEWRITE_BLOCK1,
            block2_page_no: DEFAULT_DOUBLEWRITE_BLOCK2,
        }
    }
}

/// Flush batch and LRU tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Neighbour flush window upper bound, in pages.
    ///
    /// The effective window is `min(read_ahead_area, pool_frames / 16)`.
    pub read_ahead_area: u32,
    /// LRU length at which the old sublist is maintained.
    pub lru_old_min_len: usize,
    /// Target share of the LRU in the old sublist, in percent.
    pub lru_old_ratio_pct: usize,
    /// Replaceable frames below which an eviction flush is recommended.
    pub free_block_margin: usize,
    /// Extra frames flushed beyond the margin once a flush is recommended.
    pub extra_margin: usize,
    /// How far from the LRU tail to look for replaceable frames.
    pub lru_free_search_len: usize,
    /// Attempts to obtain a free frame before `PoolError::NoFreeFrame`.
    pub free_frame_retries: usize,
}

impl FlushConfig {
    /// Neighbour window for a pool of `pool_frames` frames.
    pub fn flush_area(&self, pool_frames: usize) -> u32 {
        let by_pool = (pool_frames / 16).max(1) as u32;
        self.read_ahead_area.min(by_pool).max(1)
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            read_ahead_area: DEFAULT_READ_AHEAD_AREA,
            lru_old_min_len: DEFAULT_LRU_OLD_MIN_LEN,
            lru_old_ratio_pct: DEFAULT_LRU_OLD_RATIO_PCT,
            free_block_margin: DEFAULT_FREE_BLOCK_MARGIN,
            extra_margin: DEFAULT_FREE_BLOCK_MARGIN / 4 + 100,
            lru_free_search_len: 5 + 2 * DEFAULT_READ_AHEAD_AREA as usize,
            free_frame_retries: DEFAULT_FREE_FRAME_RETRIES,
        }
    }
}

/// Background page cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCleanerConfig {
    pub enabled: bool,
    /// Tick interval (milliseconds); also the flush-rate sample length.
    pub interval_ms: u64,
    /// Number of samples in the flush-rate window.
    pub stat_intervals: usize,
    /// Dirty-page percentage that triggers a full-capacity flush.
    pub max_dirty_pages_pct: u64,
    /// Pages flushed per tick when over the dirty limit.
    pub io_capacity: usize,
}

impl Default for PageCleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_CLEANER_INTERVAL_MS,
            stat_intervals: DEFAULT_STAT_INTERVALS,
            max_dirty_pages_pct: DEFAULT_MAX_DIRTY_PAGES_PCT,
            io_capacity: DEFAULT_IO_CAPACITY,
        }
    }
}

/// Key rotation scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Number of rotation worker threads; zero disables rotation.
    pub threads: usize,
    /// Key versions a tablespace may lag before it is re-keyed; zero disables
    /// encrypted-to-encrypted re-keying.
    pub rotate_key_age: u32,
    /// Shared I/O budget, in page operations per second.
    pub iops: u32,
    /// Seconds of budget a worker claims at a time; batch = iops * alloc time.
    pub alloc_time_secs: u32,
    pub encrypt_tables: EncryptTables,
    /// Keyring key id assigned to newly encrypted tablespaces.
    pub default_key_id: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            rotate_key_age: DEFAULT_ROTATE_KEY_AGE,
            iops: DEFAULT_ROTATION_IOPS,
            alloc_time_secs: DEFAULT_ROTATION_ALLOC_TIME_SECS,
            encrypt_tables: EncryptTables::Off,
            default_key_id: 0,
        }
    }
}

/// Top-level configuration.
///
/// # Example
///
/// ```rust
/// use bop_pagecache::{EncryptTables, PageCacheConfig};
///
/// let mut config = PageCacheConfig::default();
/// config.page_size = 4096;
/// config.rotation.threads = 2;
/// config.rotation.encrypt_tables = EncryptTables::OnlineToKeyring;
/// let config = config.normalized();
/// assert_eq!(config.page_size, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCacheConfig {
    /// Physical page size of uncompressed pages; a power of two.
    pub page_size: usize,
    /// Number of frames in the buffer pool.
    pub pool_frames: usize,
    pub doublewrite: DoublewriteConfig,
    pub flush: FlushConfig,
    pub cleaner: PageCleanerConfig,
    pub rotation: RotationConfig,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_frames: DEFAULT_POOL_FRAMES,
            doublewrite: DoublewriteConfig::default(),
            flush: FlushConfig::default(),
            cleaner: PageCleanerConfig::default(),
            rotation: RotationConfig::default(),
        }
    }
}

impl PageCacheConfig {
    /// Clamps every field into its valid range.
    pub fn normalized(mut self) -> Self {
        self.page_size = self
            .page_size
            .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
            .next_power_of_two()
            .min(MAX_PAGE_SIZE);
        self.pool_frames = self.pool_frames.max(8);

        let dw = &mut self.doublewrite;
        dw.block_size = dw.block_size.max(1);
        if dw.block1_page_no == 0 {
            dw.block1_page_no = DEFAULT_DOUBLEWRITE_BLOCK1;
        }
        let block1_end = dw.block1_page_no + dw.block_size as u32;
        if dw.block2_page_no < block1_end
            && dw.block2_page_no + dw.block_size as u32 > dw.block1_page_no
        {
            dw.block2_page_no = block1_end;
        }

        self.flush.read_ahead_area = self.flush.read_ahead_area.max(1);
        self.flush.lru_old_ratio_pct = self.flush.lru_old_ratio_pct.clamp(5, 95);
        self.flush.free_frame_retries = self.flush.free_frame_retries.max(1);

        self.cleaner.interval_ms = self.cleaner.interval_ms.max(1);
        self.cleaner.stat_intervals = self.cleaner.stat_intervals.max(1);
        self.cleaner.max_dirty_pages_pct = self.cleaner.max_dirty_pages_pct.min(100);
        self.cleaner.io_capacity = self.cleaner.io_capacity.max(1);

        self.rotation.alloc_time_secs = self.rotation.alloc_time_secs.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = PageCacheConfig::default();
        assert!(cfg.page_size.is_power_of_two());
        assert_eq!(cfg.doublewrite.capacity(), 128);
        assert!(cfg.doublewrite.block2_page_no >= cfg.doublewrite.block1_page_no + 64);
        assert_eq!(cfg.flush.flush_area(cfg.pool_frames), 64);
        assert_eq!(cfg.cleaner.stat_intervals, 20);
        assert_eq!(cfg.rotation.iops, 100);
    }

    #[test]
    fn normalized_clamps_ranges() {
        let mut cfg = PageCacheConfig::default();
        cfg.page_size = 5000;
        cfg.doublewrite.block_size = 16;
        cfg.doublewrite.block1_page_no = 10;
        cfg.doublewrite.block2_page_no = 20;
        cfg.cleaner.stat_intervals = 0;
        let cfg = cfg.normalized();

        assert_eq!(cfg.page_size, 8192);
        assert_eq!(cfg.doublewrite.block2_page_no, 26);
        assert_eq!(cfg.cleaner.stat_intervals, 1);
    }

    #[test]
    fn flush_area_shrinks_with_small_pools() {
        let cfg = FlushConfig::default();
        assert_eq!(cfg.flush_area(160), 10);
        assert_eq!(cfg.flush_area(4), 1);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = PageCacheConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: PageCacheConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn partial_document_uses_defaults() {
        let json = r#"{"page_size": 4096, "rotation": {"encrypt_tables": "online_to_keyring"}}"#;
        let cfg: PageCacheConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.rotation.encrypt_tables, EncryptTables::OnlineToKeyring);
        assert_eq!(cfg.rotation.iops, DEFAULT_ROTATION_IOPS);
        assert_eq!(cfg.doublewrite, DoublewriteConfig::default());
    }
}
