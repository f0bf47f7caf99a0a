//! Stream events.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct EventState {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Marker recorded into a stream. Completes once every command enqueued
/// before it on that stream has finished (or been skipped after a fault).
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(EventState {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn complete(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.cv.notify_all();
    }

    /// Non-blocking completion check.
    #[must_use]
    pub fn query(&self) -> bool {
        *self.state.done.lock()
    }

    /// Blocks until the event completes.
    pub fn synchronize(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.cv.wait(&mut done);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.query())
            .finish()
    }
}
