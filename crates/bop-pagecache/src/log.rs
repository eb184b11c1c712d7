//! Redo-log boundary.
//!
//! The flush path forces the log up to a page's newest modification before
//! the page image leaves the pool, and the rotation scheduler appends a
//! record for every page it dirties.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

/// Log sequence number.
pub type Lsn = u64;

/// How [`RedoLog::write_up_to`] should wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWaitMode {
    /// Return once the log is written to the OS.
    Written,
    /// Return once the log is durable.
    Flushed,
}

pub trait RedoLog: Send + Sync {
    /// LSN of the next byte to be appended.
    fn current_lsn(&self) -> Lsn;

    /// Usable log capacity in bytes; drives the checkpoint flush rate.
    fn capacity_bytes(&self) -> u64;

    /// Blocks until every record below `lsn` satisfies `mode`.
    fn write_up_to(&self, lsn: Lsn, mode: LogWaitMode);

    /// Appends a mini-transaction record and returns its end LSN.
    fn append(&self, len: u64) -> Lsn;

    /// Highest LSN known durable.
    fn flushed_lsn(&self) -> Lsn;
}

#[derive(Debug)]
struct LogState {
    current: Lsn,
    flushed: Lsn,
    write_requests: u64,
}

/// In-process redo log that only tracks LSNs.
pub struct InMemoryRedoLog {
    capacity: u64,
    state: Mutex<LogState>,
}

impl InMemoryRedoLog {
    /// LSNs start at 8 so that 0 can mean "never modified".
    pub const START_LSN: Lsn = 8;

    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LogState {
                current: Self::START_LSN,
                flushed: Self::START_LSN,
                write_requests: 0,
            }),
        }
    }

    /// Moves the current LSN forward by `bytes` without a record.
    pub fn advance(&self, bytes: u64) -> Lsn {
        let mut state = self.state.lock();
        state.current += bytes;
        state.current
    }

    /// Number of `write_up_to` calls served so far.
    pub fn write_requests(&self) -> u64 {
        self.state.lock().write_requests
    }
}

impl RedoLog for InMemoryRedoLog {
    fn current_lsn(&self) -> Lsn {
        self.state.lock().current
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn write_up_to(&self, lsn: Lsn, mode: LogWaitMode) {
        let mut state = self.state.lock();
        state.write_requests += 1;
        let target = lsn.min(state.current);
        if state.flushed < target {
            state.flushed = target;
        }
        trace!(lsn, ?mode, flushed = state.flushed, "log write up to");
    }

    fn append(&self, len: u64) -> Lsn {
        let mut state = self.state.lock();
        state.current += len.max(1);
        state.current
    }

    fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }
}

impl fmt::Debug for InMemoryRedoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryRedoLog")
            .field("capacity", &self.capacity)
            .field("current", &state.current)
            .field("flushed", &state.flushed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_lsn() {
        let log = InMemoryRedoLog::new(1 << 20);
        let start = log.current_lsn();
        let end = log.append(100);
        assert_eq!(end, start + 100);
        assert_eq!(log.current_lsn(), end);
    }

    #[test]
    fn write_up_to_never_passes_current() {
        let log = InMemoryRedoLog::new(1 << 20);
        let end = log.append(10);
        log.write_up_to(end + 1_000, LogWaitMode::Flushed);
        assert_eq!(log.flushed_lsn(), end);
        assert_eq!(log.write_requests(), 1);
    }
}
