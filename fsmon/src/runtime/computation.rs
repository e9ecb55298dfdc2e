use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::Context,
};

use futures::{
    future::BoxFuture,
    task::{waker_ref, ArcWake},
    FutureExt,
};
use parking_lot::Mutex;
use tracing::trace;

/// A resumable computation: the suspended future plus a pending wake-up. The
/// slot is emptied once the future completes or its runner drops it, after
/// which wake-ups are ignored.
struct Computation {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    notified: AtomicBool,
}

impl Computation {
    /// Polls the future on the caller's stack. A wake-up that lands while
    /// another thread is polling is left in `notified`; whoever holds the
    /// slot polls again before letting go of it.
    fn resume(self: &Arc<Self>) {
        self.notified.store(true, Ordering::SeqCst);

        loop {
            let Some(mut slot) = self.future.try_lock() else {
                return;
            };

            while self.notified.swap(false, Ordering::SeqCst) {
                let Some(future) = slot.as_mut() else {
                    trace!("ignoring wake-up of a finished computation");
                    return;
                };

                let waker = waker_ref(self);
                let mut cx = Context::from_waker(&waker);
                if future.as_mut().poll(&mut cx).is_ready() {
                    *slot = None;
                    return;
                }
            }

            drop(slot);
            if !self.notified.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl ArcWake for Computation {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.resume();
    }
}

/// Exclusive owner of one resumable computation.
///
/// Construction runs the computation synchronously up to its first
/// suspension (or completion). Dropping the runner discards the computation
/// wherever it is parked; none of its remaining code runs.
pub struct ComputationRunner {
    computation: Arc<Computation>,
}

impl ComputationRunner {
    pub fn start<F>(future: F) -> ComputationRunner
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let computation = Arc::new(Computation {
            future: Mutex::new(Some(future.boxed())),
            notified: AtomicBool::new(false),
        });
        computation.resume();

        ComputationRunner { computation }
    }

    pub fn is_finished(&self) -> bool {
        self.computation.future.lock().is_none()
    }
}

impl Drop for ComputationRunner {
    fn drop(&mut self) {
        let abandoned = self.computation.future.lock().take();
        drop(abandoned);
    }
}
