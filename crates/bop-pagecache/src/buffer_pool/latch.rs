//! Page latch.
//!
//! A reader-writer lock that is not tied to the locking thread: the flush
//! path takes a shared latch before handing a page to the doublewrite buffer
//! and the write completion, possibly on another thread, releases it.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    writer: bool,
}

#[derive(Debug, Default)]
pub struct PageLatch {
    state: Mutex<LatchState>,
    released: Condvar,
}

impl PageLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn s_lock(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.released.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn try_s_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn s_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "shared latch not held");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    pub fn x_lock(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.released.wait(&mut state);
        }
        state.writer = true;
    }

    pub fn try_x_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    pub fn x_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "exclusive latch not held");
        state.writer = false;
        self.released.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer || state.readers > 0
    }
}
