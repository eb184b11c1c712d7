use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::{ErrorCode, ResultExt};
use crate::log::Lsn;
use crate::tablespace::SpaceRef;

use super::iops::WorkerBudget;
use super::{KeyState, RotationError, RotationShared};

/// Longest a worker sleeps before rechecking for shutdown.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Per-thread state of one rotation worker.
#[derive(Debug)]
pub(crate) struct RotationWorker {
    /// `None` for passes driven by the caller's thread.
    pub thread_no: Option<usize>,
    /// Restart the tablespace scan from the lowest id.
    pub first: bool,
    pub space: Option<SpaceRef>,
    /// Next page of the claimed batch.
    pub offset: u32,
    pub batch: u32,
    pub min_key_version_found: u32,
    pub end_lsn: Lsn,
    /// Counted in the `active_threads` of `space`.
    pub active: bool,
    pub budget: WorkerBudget,
}

impl RotationWorker {
    pub(crate) fn new(thread_no: Option<usize>) -> Self {
        Self {
            thread_no,
            first: true,
            space: None,
            offset: 0,
            batch: 0,
            min_key_version_found: 0,
            end_lsn: 0,
            active: false,
            budget: WorkerBudget::default(),
        }
    }
}

/// Finds the next tablespace that needs rotation, after claiming budget.
/// Leaves `worker.space` empty when the scan is exhausted.
fn find_space_to_rotate(
    shared: &RotationShared,
    worker: &mut RotationWorker,
    key_state: &mut KeyState,
    recheck: &mut bool,
) -> Result<bool, RotationError> {
    let thread_no = worker.thread_no;
    if !shared.budget.alloc(&mut worker.budget, || shared.should_stop(thread_no)) {
        return Ok(false);
    }
    if worker.first {
        worker.first = false;
        worker.space = None;
    }

    let mut after = worker.space.take().map(|space| space.id());
    while !shared.should_stop(thread_no) {
        let Some(space) = shared.spaces().next_after(after) else {
            break;
        };
        after = Some(space.id());
        shared.read_crypt_data(&space)?;
        if space.is_excluded_from_rotation() || space.is_corrupted() {
            continue;
        }
        if shared.space_needs_rotation(&space, key_state, recheck)? {
            worker.min_key_version_found = key_state.key_version;
            trace!(space_id = space.id(), "tablespace selected for rotation");
            worker.space = Some(space);
            return Ok(true);
        }
    }

    shared.budget.release(&mut worker.budget);
    Ok(false)
}

/// Rotates one tablespace's pages batch by batch until none are left.
/// Returns whether the pass over the tablespace committed.
fn rotate_space(
    shared: &RotationShared,
    worker: &mut RotationWorker,
    space: &SpaceRef,
    key_state: &KeyState,
) -> Result<bool, RotationError> {
    let mut aborted = false;
    let mut outcome = Ok(());
    while !shared.should_stop(worker.thread_no) && shared.find_page_to_rotate(space, worker) {
        let batch = worker.batch;
        match shared.rotate_pages(space, key_state, worker) {
            Ok(false) => {}
            Ok(true) => {
                aborted = true;
                break;
            }
            Err(err) => {
                aborted = true;
                outcome = Err(err);
                break;
            }
        }
        if worker.budget.allocated > 0 {
            shared.budget.realloc(&mut worker.budget, batch);
        }
    }

    // Always leaves the tablespace so its active count stays balanced.
    let completed = shared.complete_rotate_space(space, worker, aborted);
    outcome?;
    completed
}

/// One scan over all tablespaces. Returns the number of tablespaces whose
/// rotation this worker committed.
pub(crate) fn rotate_spaces(
    shared: &RotationShared,
    worker: &mut RotationWorker,
    recheck: &mut bool,
) -> Result<usize, RotationError> {
    worker.first = true;
    let mut key_state = KeyState::default();
    let mut rotated = 0;

    while !shared.should_stop(worker.thread_no) {
        if !find_space_to_rotate(shared, worker, &mut key_state, recheck)? {
            break;
        }
        let Some(space) = worker.space.clone() else {
            break;
        };
        if shared.start_rotate_space(&space, &key_state, worker)
            && rotate_space(shared, worker, &space, &key_state)?
        {
            rotated += 1;
        }
        // The next tablespace may use another key.
        key_state.key_id = None;
        shared.budget.release(&mut worker.budget);
        if space.is_stopping() {
            worker.space = None;
            worker.first = true;
        }
    }
    Ok(rotated)
}

/// Body of a `bop-crypt-N` thread.
pub(super) fn run(shared: Arc<RotationShared>, thread_no: usize) {
    shared.thread_started();
    info!(thread_no, "key rotation worker started");

    let mut worker = RotationWorker::new(Some(thread_no));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        work_loop(&shared, &mut worker, thread_no)
    }));

    if outcome.is_err() {
        shared.abandon_rotation(&mut worker);
    }
    shared.budget.release(&mut worker.budget);
    shared.thread_stopped();
    if let Err(payload) = outcome {
        error!(
            thread_no,
            code = %ErrorCode::WorkerPanic,
            "key rotation worker panicked"
        );
        panic::resume_unwind(payload);
    }
    info!(thread_no, "key rotation worker exiting");
}

fn work_loop(shared: &RotationShared, worker: &mut RotationWorker, thread_no: usize) {
    let mut recheck = false;
    let mut first_pass = true;
    while !shared.should_stop(Some(thread_no)) {
        if !first_pass && !recheck {
            let seen = shared.wake.generation();
            while !shared.wake.wait_since(seen, IDLE_WAIT) {
                if shared.should_stop(Some(thread_no)) {
                    break;
                }
            }
            if shared.should_stop(Some(thread_no)) {
                break;
            }
        }
        first_pass = false;
        recheck = false;

        let outcome = rotate_spaces(shared, worker, &mut recheck);
        shared.budget.release(&mut worker.budget);
        shared.record_pass();
        let code = outcome
            .as_ref()
            .err()
            .map_or(ErrorCode::Unknown, RotationError::code);
        match outcome.with_error_context(code, "key rotation pass") {
            Ok(rotated) => {
                if rotated > 0 {
                    debug!(thread_no, rotated, "rotation pass finished");
                }
            }
            Err(err) if err.source.is_fatal() => {
                error!(thread_no, error = %err, "key rotation cannot continue, aborting");
                std::process::abort();
            }
            Err(err) => {
                warn!(thread_no, error = %err, "rotation pass failed");
            }
        }
    }
}
