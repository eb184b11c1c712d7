//! Checkpoint flush pacing.
//!
//! [`FlushRateEstimator`] keeps a sliding window of per-interval redo
//! generation and eviction-flush counts. From it the page cleaner derives
//! how many pages a checkpoint batch must write per interval so that the
//! dirty pages keep pace with the redo log, minus what eviction flushing
//! already writes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace};

use crate::buffer_pool::{FlushClass, PoolCore};
use crate::config::PageCleanerConfig;
use crate::error::{ErrorCode, ResultExt};
use crate::flush::{FlushBatchResult, FlushController, FlushError};
use crate::log::{Lsn, RedoLog};

/// Redo bytes generated and eviction pages flushed in one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushRateSample {
    pub redo: u64,
    pub n_flushed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushRateSnapshot {
    pub intervals: usize,
    pub ticks: u64,
    pub sum: FlushRateSample,
    pub last_lsn: Lsn,
    pub last_lru_flush_count: u64,
}

/// Pages to flush per interval for `n_dirty` dirty pages, given the average
/// redo generated per interval, the log capacity and the average eviction
/// flush count per interval.
pub fn compute_desired_rate(n_dirty: u64, redo_avg: u64, log_capacity: u64, lru_flush_avg: u64) -> u64 {
    if log_capacity == 0 {
        return 0;
    }
    let required = (n_dirty as u128 * redo_avg as u128) / log_capacity as u128;
    u64::try_from(required)
        .unwrap_or(u64::MAX)
        .saturating_sub(lru_flush_avg)
}

#[derive(Debug)]
pub struct FlushRateEstimator {
    samples: Vec<FlushRateSample>,
    sum: FlushRateSample,
    index: usize,
    /// LSN and eviction flush count at the previous tick, `None` before the
    /// first one.
    current: Option<FlushRateSample>,
    ticks: u64,
}

impl FlushRateEstimator {
    pub fn new(intervals: usize) -> Self {
        Self {
            samples: vec![FlushRateSample::default(); intervals.max(1)],
            sum: FlushRateSample::default(),
            index: 0,
            current: None,
            ticks: 0,
        }
    }

    pub fn intervals(&self) -> usize {
        self.samples.len()
    }

    /// Closes the current interval at `lsn` with `lru_flush_page_count`
    /// eviction-flushed pages since startup.
    pub fn sample_tick(&mut self, lsn: Lsn, lru_flush_page_count: u64) {
        self.ticks += 1;
        let now = FlushRateSample {
            redo: lsn,
            n_flushed: lru_flush_page_count,
        };
        // The first tick only records the starting point.
        let Some(previous) = self.current.replace(now) else {
            return;
        };

        let item = FlushRateSample {
            redo: lsn.saturating_sub(previous.redo),
            n_flushed: lru_flush_page_count.saturating_sub(previous.n_flushed),
        };
        let evicted = self.samples[self.index];
        self.sum.redo = self.sum.redo - evicted.redo + item.redo;
        self.sum.n_flushed = self.sum.n_flushed - evicted.n_flushed + item.n_flushed;
        self.samples[self.index] = item;
        self.index = (self.index + 1) % self.samples.len();
    }

    /// Checkpoint pages to flush this interval.
    pub fn desired_flush_rate(
        &self,
        n_dirty: usize,
        lsn: Lsn,
        log_capacity: u64,
        lru_flush_page_count: u64,
    ) -> u64 {
        let n = self.samples.len() as u64;
        let current = self.current.unwrap_or_default();
        let redo_avg = self.sum.redo / n + lsn.saturating_sub(current.redo);
        let lru_flush_avg =
            self.sum.n_flushed / n + lru_flush_page_count.saturating_sub(current.n_flushed);
        compute_desired_rate(n_dirty as u64, redo_avg, log_capacity, lru_flush_avg)
    }

    pub fn snapshot(&self) -> FlushRateSnapshot {
        let current = self.current.unwrap_or_default();
        FlushRateSnapshot {
            intervals: self.samples.len(),
            ticks: self.ticks,
            sum: self.sum,
            last_lsn: current.redo,
            last_lru_flush_count: current.n_flushed,
        }
    }
}

struct CleanerShared {
    flusher: Arc<FlushController>,
    core: Arc<PoolCore>,
    log: Arc<dyn RedoLog>,
    config: PageCleanerConfig,
    estimator: Mutex<FlushRateEstimator>,
    ticks: AtomicU64,
    pages_flushed: AtomicU64,
}

impl CleanerShared {
    fn tick(&self) -> Result<usize, FlushError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let lsn = self.log.current_lsn();
        let lru_flushed = self.core.lru_flush_page_count();
        let n_dirty = self.core.dirty_len();

        let desired = {
            let mut estimator = self.estimator.lock();
            estimator.sample_tick(lsn, lru_flushed);
            estimator.desired_flush_rate(n_dirty, lsn, self.log.capacity_bytes(), lru_flushed)
        };

        let dirty_pct = (n_dirty * 100 / self.core.frame_count().max(1)) as u64;
        let n_pages = if dirty_pct > self.config.max_dirty_pages_pct {
            self.config.io_capacity
        } else {
            usize::try_from(desired).unwrap_or(usize::MAX)
        };

        let mut flushed = 0;
        if n_pages > 0 {
            if let FlushBatchResult::Flushed(n) =
                self.flusher.flush_batch(FlushClass::Checkpoint, n_pages, Lsn::MAX)?
            {
                flushed = n;
            }
        }
        self.flusher.free_margin()?;
        self.pages_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
        trace!(n_dirty, dirty_pct, desired, flushed, "page cleaner tick");
        Ok(flushed)
    }
}

/// Background thread pacing checkpoint flushes.
pub struct PageCleaner {
    shared: Arc<CleanerShared>,
    stop: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl PageCleaner {
    /// Creates a cleaner; `start` launches its thread.
    pub fn new(
        flusher: Arc<FlushController>,
        core: Arc<PoolCore>,
        log: Arc<dyn RedoLog>,
        config: PageCleanerConfig,
    ) -> Self {
        let shared = Arc::new(CleanerShared {
            flusher,
            core,
            log,
            estimator: Mutex::new(FlushRateEstimator::new(config.stat_intervals)),
            config,
            ticks: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
        });
        Self {
            shared,
            stop: Mutex::new(None),
            worker: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        let interval = Duration::from_millis(shared.config.interval_ms);
        let handle = thread::Builder::new()
            .name("bop-page-cleaner".into())
            .spawn(move || cleaner_loop(shared, receiver, interval))?;
        *self.stop.lock() = Some(sender);
        *worker = Some(handle);
        Ok(())
    }

    /// Runs one cleaner tick on the calling thread.
    #[instrument(skip(self))]
    pub fn tick(&self) -> Result<usize, FlushError> {
        self.shared.tick()
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    pub fn pages_flushed(&self) -> u64 {
        self.shared.pages_flushed.load(Ordering::Relaxed)
    }

    pub fn estimator_snapshot(&self) -> FlushRateSnapshot {
        self.shared.estimator.lock().snapshot()
    }

    fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if !self.request_shutdown() {
            return;
        }
        if let Some(sender) = self.stop.lock().take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(code = %ErrorCode::WorkerPanic, "page cleaner thread panicked");
            }
        }
        debug!("page cleaner stopped");
    }
}

impl Drop for PageCleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PageCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCleaner")
            .field("config", &self.shared.config)
            .field("ticks", &self.ticks())
            .field("shutdown", &self.shutdown.load(Ordering::Acquire))
            .finish()
    }
}

fn cleaner_loop(shared: Arc<CleanerShared>, receiver: mpsc::Receiver<()>, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "page cleaner started");
    loop {
        match receiver.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let outcome = shared.tick();
                let code = outcome
                    .as_ref()
                    .err()
                    .map_or(ErrorCode::Unknown, FlushError::code);
                if let Err(err) = outcome.with_error_context(code, "page cleaner flush") {
                    error!(error = %err, "page cleaner cannot continue, aborting");
                    std::process::abort();
                }
            }
        }
    }
    info!("page cleaner exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_rate_is_the_shortfall() {
        assert_eq!(compute_desired_rate(1000, 100, 10_000, 5), 5);
        assert_eq!(compute_desired_rate(1000, 100, 10_000, 50), 0);
        assert_eq!(compute_desired_rate(1000, 100, 0, 0), 0);
    }

    #[test]
    fn first_tick_only_records_the_origin() {
        let mut estimator = FlushRateEstimator::new(4);
        estimator.sample_tick(1_000, 7);
        let snapshot = estimator.snapshot();
        assert_eq!(snapshot.sum, FlushRateSample::default());
        assert_eq!((snapshot.last_lsn, snapshot.last_lru_flush_count), (1_000, 7));
    }

    #[test]
    fn log_starting_at_lsn_zero_is_sampled_from_the_second_tick() {
        let mut estimator = FlushRateEstimator::new(4);
        estimator.sample_tick(0, 0);
        estimator.sample_tick(0, 2);
        estimator.sample_tick(500, 2);
        let snapshot = estimator.snapshot();
        assert_eq!(snapshot.ticks, 3);
        assert_eq!(snapshot.sum, FlushRateSample { redo: 500, n_flushed: 2 });
        assert_eq!(snapshot.last_lsn, 500);
    }

    #[test]
    fn window_drops_the_oldest_sample() {
        let mut estimator = FlushRateEstimator::new(2);
        estimator.sample_tick(100, 0);
        estimator.sample_tick(200, 1);
        estimator.sample_tick(400, 3);
        assert_eq!(estimator.snapshot().sum, FlushRateSample { redo: 300, n_flushed: 3 });

        estimator.sample_tick(500, 3);
        assert_eq!(estimator.snapshot().sum, FlushRateSample { redo: 300, n_flushed: 2 });
    }

    #[test]
    fn desired_rate_uses_window_average_and_current_interval() {
        let mut estimator = FlushRateEstimator::new(2);
        estimator.sample_tick(1, 0);
        estimator.sample_tick(201, 0);
        estimator.sample_tick(401, 0);
        // Average 200 redo bytes per interval, nothing since the last tick.
        assert_eq!(estimator.desired_flush_rate(100, 401, 1_000, 0), 20);
        // Eviction flushing already covers part of it.
        assert_eq!(estimator.desired_flush_rate(100, 401, 1_000, 15), 5);
    }
}
