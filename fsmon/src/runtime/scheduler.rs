use std::{collections::VecDeque, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::Blocker;

static GLOBAL: Lazy<Scheduler> = Lazy::new(Scheduler::new);

/// FIFO of suspension points waiting to be signaled by a pump.
///
/// Sessions opened through [`crate::WatchSession::open`] all share
/// [`Scheduler::global`], so pumping one session may resume another
/// session's monitoring loop. Separate instances exist for callers that want
/// isolated scheduling.
#[derive(Clone, Default)]
pub struct Scheduler {
    queue: Arc<Mutex<VecDeque<Blocker>>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// The process-wide queue.
    pub fn global() -> Scheduler {
        GLOBAL.clone()
    }

    pub fn push(&self, blocker: Blocker) {
        self.queue.lock().push_back(blocker);
    }

    pub fn pop(&self) -> Option<Blocker> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Signals the front suspension point, whoever owns it. Returns `false`
    /// when the queue was empty.
    pub fn run_next(&self) -> bool {
        // Popped under the lock, signaled outside it: the resumed computation
        // may push itself straight back.
        let Some(blocker) = self.pop() else {
            return false;
        };

        if let Err(e) = blocker.unblock() {
            debug!(?blocker, "dropping stale suspension point: {e}");
        }
        true
    }

    /// Removes every queued entry for `blocker`.
    pub fn forget(&self, blocker: &Blocker) {
        self.queue.lock().retain(|queued| !queued.same_as(blocker));
    }
}
