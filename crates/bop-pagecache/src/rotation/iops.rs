//! I/O budget shared by the rotation workers.
//!
//! The budget is a pool of page operations per second. A worker claims part
//! of it before it starts on a tablespace, re-estimates its share after every
//! batch from the read latency it observed, and hands everything back when
//! it runs out of work.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Estimate a worker starts with before it has timed any read.
pub const INITIAL_ESTIMATED_IOPS: u32 = 20;

/// How long an allocation waits for returned budget before rechecking.
pub const ALLOC_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Page counters of the rotation workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationStats {
    pub pages_read_from_cache: u64,
    pub pages_read_from_disk: u64,
    pub pages_modified: u64,
    pub pages_flushed: u64,
    /// Sum of the workers' current iops estimates.
    pub estimated_iops: u64,
}

/// A worker's share of the budget and its read-latency bookkeeping.
#[derive(Debug, Clone)]
pub struct WorkerBudget {
    pub estimated_max_iops: u32,
    pub allocated: u32,
    /// Synchronous reads (and flushed pages) since the last re-estimate.
    pub cnt_waited: u64,
    pub sum_waited_us: u64,
    /// Counters not yet folded into the totals.
    pub stats: RotationStats,
}

impl Default for WorkerBudget {
    fn default() -> Self {
        Self {
            estimated_max_iops: INITIAL_ESTIMATED_IOPS,
            allocated: 0,
            cnt_waited: 0,
            sum_waited_us: 0,
            stats: RotationStats::default(),
        }
    }
}

impl WorkerBudget {
    /// Records one synchronous read that took `waited`.
    pub fn record_wait(&mut self, waited: Duration) {
        self.cnt_waited += 1;
        self.sum_waited_us += waited.as_micros() as u64;
    }

    /// Milliseconds to sleep after a read so the worker stays within its
    /// allocation.
    pub fn throttle_ms(&self) -> u64 {
        if self.cnt_waited == 0 || self.allocated == 0 {
            return 0;
        }
        let avg_wait_us = self.sum_waited_us / self.cnt_waited;
        let alloc_wait_us = 1_000_000 / u64::from(self.allocated);
        alloc_wait_us.saturating_sub(avg_wait_us) / 1000
    }
}

#[derive(Debug)]
struct BudgetState {
    total: u32,
    allocated: u32,
    totals: RotationStats,
}

/// The shared pool of rotation iops.
#[derive(Debug)]
pub struct IoBudget {
    state: Mutex<BudgetState>,
    returned: Condvar,
}

impl IoBudget {
    pub fn new(total: u32) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                total,
                allocated: 0,
                totals: RotationStats::default(),
            }),
            returned: Condvar::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.state.lock().total
    }

    pub fn allocated(&self) -> u32 {
        self.state.lock().allocated
    }

    /// Changes the budget; workers holding more than the new total keep it
    /// until they return it.
    pub fn set_total(&self, total: u32) {
        self.state.lock().total = total;
        self.returned.notify_all();
    }

    /// Wakes workers waiting for budget.
    pub fn notify(&self) {
        self.returned.notify_all();
    }

    /// Claims up to the worker's estimate; false when nothing is left.
    pub fn try_alloc(&self, worker: &mut WorkerBudget) -> bool {
        debug_assert_eq!(worker.allocated, 0);
        let mut state = self.state.lock();
        if state.allocated >= state.total {
            return false;
        }
        let alloc = (state.total - state.allocated).min(worker.estimated_max_iops);
        state.allocated += alloc;
        worker.allocated = alloc;
        alloc > 0
    }

    /// Claims budget, waiting for other workers to return some, until
    /// `should_stop` says otherwise.
    pub fn alloc(&self, worker: &mut WorkerBudget, should_stop: impl Fn() -> bool) -> bool {
        loop {
            if should_stop() {
                return false;
            }
            if self.try_alloc(worker) {
                return true;
            }
            let mut state = self.state.lock();
            if state.allocated >= state.total {
                self.returned.wait_for(&mut state, ALLOC_RETRY_INTERVAL);
            }
        }
    }

    /// Adjusts the worker's share after a batch of `batch` pages.
    ///
    /// When synchronous reads made up more than a tenth of the batch the
    /// estimate is recomputed from their average latency. Surplus budget is
    /// returned, never dropping below one; a worker below its estimate takes
    /// what is free.
    pub fn realloc(&self, worker: &mut WorkerBudget, batch: u32) {
        debug_assert!(worker.allocated > 0);
        if 10 * worker.cnt_waited > u64::from(batch) {
            let avg_wait_us = (worker.sum_waited_us / worker.cnt_waited).max(1);
            let estimate = u32::try_from(1_000_000 / avg_wait_us).unwrap_or(u32::MAX);
            trace!(from = worker.estimated_max_iops, to = estimate, "re-estimated rotation iops");
            worker.estimated_max_iops = estimate;
            worker.cnt_waited = 0;
            worker.sum_waited_us = 0;
        }

        {
            let mut state = self.state.lock();
            if worker.estimated_max_iops <= worker.allocated {
                let extra = worker.allocated - worker.estimated_max_iops;
                if extra > 0 {
                    let extra = extra.min(state.allocated);
                    state.allocated -= extra;
                    worker.allocated -= extra;
                    if worker.allocated == 0 {
                        worker.allocated = 1;
                        state.allocated += 1;
                    }
                    self.returned.notify_all();
                }
            } else if state.allocated < state.total {
                let extra = (state.total - state.allocated)
                    .min(worker.estimated_max_iops - worker.allocated);
                state.allocated += extra;
                worker.allocated += extra;
            }
        }
        self.update_totals(worker);
    }

    /// Returns the worker's whole share.
    pub fn release(&self, worker: &mut WorkerBudget) {
        if worker.allocated > 0 {
            let mut state = self.state.lock();
            let iops = worker.allocated.min(state.allocated);
            state.allocated -= iops;
            worker.allocated = 0;
            self.returned.notify_all();
        }
        self.update_totals(worker);
    }

    /// Folds the worker's counters into the totals.
    fn update_totals(&self, worker: &mut WorkerBudget) {
        let mut state = self.state.lock();
        let totals = &mut state.totals;
        let pending = worker.stats;
        totals.pages_read_from_cache += pending.pages_read_from_cache;
        totals.pages_read_from_disk += pending.pages_read_from_disk;
        totals.pages_modified += pending.pages_modified;
        totals.pages_flushed += pending.pages_flushed;
        totals.estimated_iops = totals
            .estimated_iops
            .saturating_sub(pending.estimated_iops)
            + u64::from(worker.estimated_max_iops);
        worker.stats = RotationStats {
            estimated_iops: u64::from(worker.estimated_max_iops),
            ..RotationStats::default()
        };
    }

    pub fn totals(&self) -> RotationStats {
        self.state.lock().totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_capped_by_estimate_and_total() {
        let budget = IoBudget::new(30);
        let mut first = WorkerBudget::default();
        let mut second = WorkerBudget::default();
        assert!(budget.try_alloc(&mut first));
        assert_eq!(first.allocated, INITIAL_ESTIMATED_IOPS);
        assert!(budget.try_alloc(&mut second));
        assert_eq!(second.allocated, 10);

        let mut third = WorkerBudget::default();
        assert!(!budget.try_alloc(&mut third));
        budget.release(&mut first);
        assert_eq!(budget.allocated(), 10);
        assert!(budget.try_alloc(&mut third));
    }

    #[test]
    fn alloc_gives_up_when_told_to_stop() {
        let budget = IoBudget::new(0);
        let mut worker = WorkerBudget::default();
        assert!(!budget.alloc(&mut worker, || true));
        assert_eq!(worker.allocated, 0);
    }

    #[test]
    fn slow_reads_shrink_the_share_but_never_to_zero() {
        let budget = IoBudget::new(100);
        let mut worker = WorkerBudget::default();
        assert!(budget.try_alloc(&mut worker));

        // Two reads of 200ms in a batch of 10: 20% of the batch waited.
        worker.record_wait(Duration::from_millis(200));
        worker.record_wait(Duration::from_millis(200));
        budget.realloc(&mut worker, 10);
        assert_eq!(worker.estimated_max_iops, 5);
        assert_eq!(worker.allocated, 5);
        assert_eq!(budget.allocated(), 5);

        worker.record_wait(Duration::from_secs(2));
        worker.record_wait(Duration::from_secs(2));
        budget.realloc(&mut worker, 10);
        assert_eq!(worker.estimated_max_iops, 0);
        assert_eq!(worker.allocated, 1);
        assert_eq!(budget.allocated(), 1);
    }

    #[test]
    fn fast_reads_grow_the_share_up_to_the_total() {
        let budget = IoBudget::new(50);
        let mut worker = WorkerBudget::default();
        assert!(budget.try_alloc(&mut worker));
        worker.record_wait(Duration::from_micros(100));
        worker.record_wait(Duration::from_micros(100));
        budget.realloc(&mut worker, 10);
        assert_eq!(worker.estimated_max_iops, 10_000);
        assert_eq!(worker.allocated, 50);
    }

    #[test]
    fn few_waits_keep_the_estimate() {
        let budget = IoBudget::new(100);
        let mut worker = WorkerBudget::default();
        assert!(budget.try_alloc(&mut worker));
        worker.record_wait(Duration::from_millis(500));
        budget.realloc(&mut worker, 60);
        assert_eq!(worker.estimated_max_iops, INITIAL_ESTIMATED_IOPS);
        assert_eq!(worker.cnt_waited, 1);
    }

    #[test]
    fn totals_track_worker_counters() {
        let budget = IoBudget::new(100);
        let mut worker = WorkerBudget::default();
        assert!(budget.try_alloc(&mut worker));
        worker.stats.pages_modified = 4;
        worker.stats.pages_read_from_cache = 6;
        budget.release(&mut worker);
        budget.release(&mut worker);

        let totals = budget.totals();
        assert_eq!(totals.pages_modified, 4);
        assert_eq!(totals.pages_read_from_cache, 6);
        assert_eq!(totals.estimated_iops, u64::from(INITIAL_ESTIMATED_IOPS));
    }

    #[test]
    fn throttle_sleeps_off_the_unused_allocation() {
        let mut worker = WorkerBudget {
            allocated: 20,
            ..WorkerBudget::default()
        };
        worker.record_wait(Duration::from_millis(10));
        // 50ms per page allowed, 10ms spent.
        assert_eq!(worker.throttle_ms(), 40);
        worker.record_wait(Duration::from_millis(190));
        assert_eq!(worker.throttle_ms(), 0);
    }
}
