use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

use super::Scheduler;
use crate::FsMonitorError;

#[derive(Default)]
struct Slot {
    waker: Option<Waker>,
    signaled: bool,
}

/// One-shot suspension point.
///
/// A computation parks itself with `blocker.wait().await`; a later
/// [`Blocker::unblock`] resumes it synchronously, on the caller's stack.
/// Clones share identity, so a clone can sit in a [`super::Scheduler`] while
/// the owner keeps its own handle.
#[derive(Clone, Default)]
pub struct Blocker {
    slot: Arc<Mutex<Slot>>,
}

impl Blocker {
    pub fn new() -> Blocker {
        Blocker::default()
    }

    pub fn wait(&self) -> Wait<'_> {
        Wait {
            blocker: self,
            scheduler: None,
            parked: false,
        }
    }

    /// Like [`Blocker::wait`], but the blocker is queued on `scheduler` once
    /// the waker is in place, so a pump on another thread can never pop it
    /// before there is something to resume.
    pub fn wait_on<'a>(&'a self, scheduler: &'a Scheduler) -> Wait<'a> {
        Wait {
            blocker: self,
            scheduler: Some(scheduler),
            parked: false,
        }
    }

    /// Whether a computation is currently parked here.
    pub fn is_parked(&self) -> bool {
        self.slot.lock().waker.is_some()
    }

    /// Resumes the parked computation and returns once it has suspended
    /// again or finished.
    pub fn unblock(&self) -> Result<(), FsMonitorError> {
        let waker = {
            let mut slot = self.slot.lock();
            let waker = slot.waker.take().ok_or(FsMonitorError::NothingParked)?;
            slot.signaled = true;
            waker
        };

        // The slot lock must be released here, the woken computation polls
        // its `Wait` again before `wake` returns.
        waker.wake();
        Ok(())
    }

    pub fn same_as(&self, other: &Blocker) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocker")
            .field("id", &Arc::as_ptr(&self.slot))
            .field("parked", &self.is_parked())
            .finish()
    }
}

/// Future returned by [`Blocker::wait`].
pub struct Wait<'a> {
    blocker: &'a Blocker,
    scheduler: Option<&'a Scheduler>,
    parked: bool,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut slot = this.blocker.slot.lock();

        if this.parked && slot.signaled {
            slot.signaled = false;
            return Poll::Ready(());
        }

        slot.waker = Some(cx.waker().clone());
        drop(slot);

        if !this.parked {
            this.parked = true;
            if let Some(scheduler) = this.scheduler {
                scheduler.push(this.blocker.clone());
            }
        }
        Poll::Pending
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.parked {
            let mut slot = self.blocker.slot.lock();
            slot.waker = None;
            slot.signaled = false;
        }
    }
}
