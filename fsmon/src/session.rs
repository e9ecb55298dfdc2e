use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    platforms, Blocker, ComputationRunner, FileSystemEvent, FsMonitorError, NativeWatch,
    Scheduler, WatchOptions,
};

/// Where a session's monitoring loop currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Idle,
    RequestIssued,
    Pending,
    Ready,
    /// Terminal. The loop has stopped and every pump reports the stored error.
    Failed,
}

struct SessionState {
    native: Box<dyn NativeWatch>,
    phase: SessionPhase,
    // Shared so a peeked event outlives the lock and keeps its address while
    // queued; the C boundary hands out pointers to the front event.
    events: VecDeque<Arc<FileSystemEvent>>,
    error: Option<FsMonitorError>,
}

/// One watched directory tree.
///
/// A session keeps one native read outstanding and is advanced only by
/// [`WatchSession::pump`]. Decoded events queue up until popped.
pub struct WatchSession {
    root: PathBuf,
    state: Arc<Mutex<SessionState>>,
    blocker: Blocker,
    scheduler: Scheduler,
    runner: Option<ComputationRunner>,
}

impl WatchSession {
    /// Opens `root` with default options on the process-wide scheduler.
    pub fn open(root: impl AsRef<Path>) -> Result<WatchSession, FsMonitorError> {
        WatchSession::open_with(root, WatchOptions::default())
    }

    pub fn open_with(
        root: impl AsRef<Path>,
        opts: WatchOptions,
    ) -> Result<WatchSession, FsMonitorError> {
        let root = root.as_ref();
        let native = platforms::open(root, &opts)?;
        Ok(WatchSession::with_native(root, native, Scheduler::global()))
    }

    /// Builds a session over an already opened native watch and starts its
    /// monitoring loop, which submits the first request before this returns.
    pub fn with_native(
        root: impl Into<PathBuf>,
        native: Box<dyn NativeWatch>,
        scheduler: Scheduler,
    ) -> WatchSession {
        let root = root.into();
        debug!(root = %root.display(), "starting watch session");

        let state = Arc::new(Mutex::new(SessionState {
            native,
            phase: SessionPhase::Idle,
            events: VecDeque::new(),
            error: None,
        }));
        let blocker = Blocker::new();

        let runner = ComputationRunner::start(monitor(
            root.clone(),
            state.clone(),
            blocker.clone(),
            scheduler.clone(),
        ));

        WatchSession {
            root,
            state,
            blocker,
            scheduler,
            runner: Some(runner),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resumes the oldest parked monitoring loop on this session's scheduler
    /// (not necessarily this session's), then reports this session's sticky
    /// error if it has one.
    pub fn pump(&self) -> Result<(), FsMonitorError> {
        self.scheduler.run_next();

        match &self.state.lock().error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// The oldest queued event, without removing it. The session is not
    /// locked while the returned handle is held.
    pub fn peek(&self) -> Option<Arc<FileSystemEvent>> {
        self.state.lock().events.front().cloned()
    }

    pub fn pop(&self) -> Option<FileSystemEvent> {
        let event = self.state.lock().events.pop_front()?;
        Some(Arc::try_unwrap(event).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn last_error(&self) -> Option<FsMonitorError> {
        self.state.lock().error.clone()
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        debug!(root = %self.root.display(), "closing watch session");

        // Native resources go first; the loop is then discarded where it is
        // parked without being resumed.
        self.state.lock().native.close();
        self.scheduler.forget(&self.blocker);
        drop(self.runner.take());
    }
}

async fn monitor(
    root: PathBuf,
    state: Arc<Mutex<SessionState>>,
    blocker: Blocker,
    scheduler: Scheduler,
) {
    loop {
        let transferred = match next_batch(&state, &blocker, &scheduler).await {
            Ok(transferred) => transferred,
            Err(err) => return fail(&root, &state, err),
        };

        if transferred == 0 {
            warn!(root = %root.display(), "notification buffer overflowed, changes were dropped");
            continue;
        }

        let mut guard = state.lock();
        let session = &mut *guard;

        match session.native.decode(transferred) {
            Ok(events) => {
                trace!(root = %root.display(), count = events.len(), "decoded batch");
                session.events.extend(events.into_iter().map(Arc::new));
            }
            Err(err) => {
                drop(guard);
                return fail(&root, &state, err);
            }
        }
    }
}

/// Submits a request and waits, one pump at a time, for it to complete.
async fn next_batch(
    state: &Mutex<SessionState>,
    blocker: &Blocker,
    scheduler: &Scheduler,
) -> Result<usize, FsMonitorError> {
    {
        let mut session = state.lock();
        session.native.submit()?;
        session.phase = SessionPhase::RequestIssued;
    }

    loop {
        let polled = {
            let mut session = state.lock();
            let polled = session.native.poll_complete()?;
            session.phase = match polled {
                Some(_) => SessionPhase::Ready,
                None => SessionPhase::Pending,
            };
            polled
        };

        match polled {
            Some(transferred) => return Ok(transferred),
            None => blocker.wait_on(scheduler).await,
        }
    }
}

fn fail(root: &Path, state: &Mutex<SessionState>, err: FsMonitorError) {
    error!(root = %root.display(), "watch session failed: {err}");

    let mut session = state.lock();
    session.phase = SessionPhase::Failed;
    session.error = Some(err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{encode_notify_batch, ScriptedWatch, Step},
        FileSystemAction,
    };

    fn session(steps: Vec<Step>) -> (WatchSession, Arc<Mutex<crate::testing::Tally>>) {
        let (native, tally) = ScriptedWatch::new(steps);
        let session = WatchSession::with_native("C:/watched", Box::new(native), Scheduler::new());
        (session, tally)
    }

    #[test]
    fn construction_submits_and_parks() {
        let (session, tally) = session(vec![]);

        assert_eq!(session.phase(), SessionPhase::Pending);
        assert_eq!(session.scheduler.len(), 1);
        let tally = tally.lock();
        assert_eq!(tally.submits, 1);
        assert_eq!(tally.polls, 1);
        assert!(tally.outstanding);
    }

    #[test]
    fn pump_until_completion_queues_events_and_resubmits() {
        let (session, tally) = session(vec![
            Step::Pending,
            Step::Pending,
            Step::Batch(encode_notify_batch(&[(1, "a.txt")])),
        ]);

        session.pump().unwrap();
        assert!(session.peek().is_none());

        session.pump().unwrap();
        {
            let event = session.peek().unwrap();
            assert_eq!(event.action(), FileSystemAction::Added);
            assert_eq!(event.path(), "a.txt");
        }

        assert_eq!(tally.lock().submits, 2);
        assert_eq!(session.phase(), SessionPhase::Pending);

        assert_eq!(
            session.pop(),
            Some(FileSystemEvent::new(FileSystemAction::Added, "a.txt"))
        );
        assert!(session.peek().is_none());
    }

    #[test]
    fn exactly_one_scheduler_entry_per_pending_pump() {
        let (session, _tally) = session(vec![]);
        for _ in 0..5 {
            session.pump().unwrap();
            assert_eq!(session.scheduler.len(), 1);
        }
    }

    #[test]
    fn never_more_than_one_request_in_flight() {
        let batch = encode_notify_batch(&[(1, "x")]);
        let (session, tally) = session(vec![
            Step::Batch(batch.clone()),
            Step::Pending,
            Step::Batch(batch.clone()),
            Step::Batch(batch),
            Step::Pending,
        ]);

        for _ in 0..6 {
            session.pump().unwrap();
        }

        let tally = tally.lock();
        assert_eq!(tally.overlapping_submits, 0);
        assert_eq!(tally.submits, 4);
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn pump_without_changes_leaves_state_alone() {
        let (session, tally) = session(vec![Step::Batch(encode_notify_batch(&[(2, "old")]))]);
        let submits = tally.lock().submits;

        for _ in 0..10 {
            session.pump().unwrap();
        }

        assert_eq!(session.len(), 1);
        assert_eq!(session.last_error(), None);
        assert_eq!(session.phase(), SessionPhase::Pending);
        let tally = tally.lock();
        assert_eq!(tally.submits, submits);
        assert!(tally.outstanding);
    }

    #[test]
    fn events_are_consumed_in_fifo_order() {
        let (session, _tally) = session(vec![
            Step::Batch(encode_notify_batch(&[(1, "e1"), (3, "e2")])),
            Step::Batch(encode_notify_batch(&[(2, "e3")])),
        ]);

        assert_eq!(session.peek().unwrap().path(), "e1");
        assert_eq!(session.peek().unwrap().path(), "e1");
        assert_eq!(session.len(), 3);

        let order: Vec<String> = std::iter::from_fn(|| session.pop())
            .map(|e| e.path().to_owned())
            .collect();
        assert_eq!(order, ["e1", "e2", "e3"]);

        assert_eq!(session.pop(), None);
        assert!(session.is_empty());
    }

    #[test]
    fn overflowed_batch_decodes_nothing_and_keeps_watching() {
        let (session, tally) = session(vec![Step::Batch(Vec::new())]);

        assert!(session.is_empty());
        assert_eq!(session.last_error(), None);
        assert_eq!(tally.lock().submits, 2);
    }

    #[test]
    fn completion_error_is_sticky() {
        let (session, tally) = session(vec![
            Step::Pending,
            Step::Pending,
            Step::Fail("The network name is no longer available.".to_owned()),
        ]);

        session.pump().unwrap();
        let expected = FsMonitorError::Monitor("The network name is no longer available.".to_owned());
        for _ in 0..5 {
            assert_eq!(session.pump(), Err(expected.clone()));
        }

        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(tally.lock().submits, 1);
        assert!(session.scheduler.is_empty());
    }

    #[test]
    fn submit_error_is_sticky_and_not_retried() {
        let (native, tally) = ScriptedWatch::new(vec![Step::Batch(encode_notify_batch(&[(1, "a")]))]);
        tally.lock().fail_submit = Some("Access is denied.".to_owned());
        let session = WatchSession::with_native("C:/denied", Box::new(native), Scheduler::new());

        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(
            session.pump(),
            Err(FsMonitorError::Monitor("Access is denied.".to_owned()))
        );
        assert_eq!(
            session.pump(),
            Err(FsMonitorError::Monitor("Access is denied.".to_owned()))
        );
        assert_eq!(tally.lock().submits, 0);
        assert!(session.is_empty());
    }

    #[test]
    fn malformed_batch_fails_the_session_but_keeps_earlier_events() {
        let mut bad = encode_notify_batch(&[(1, "abc")]);
        bad[0..4].copy_from_slice(&4u32.to_le_bytes());
        let (session, _tally) = session(vec![
            Step::Batch(encode_notify_batch(&[(1, "kept")])),
            Step::Batch(bad),
        ]);

        assert!(matches!(session.pump(), Err(FsMonitorError::MalformedBatch(_))));
        assert_eq!(session.pop().unwrap().path(), "kept");
    }

    #[test]
    fn teardown_mid_suspension_releases_native_and_never_resumes() {
        let scheduler = Scheduler::new();
        let (native, tally) = ScriptedWatch::new(vec![Step::Batch(encode_notify_batch(&[(1, "late")]))]);
        let session = WatchSession::with_native("C:/watched", Box::new(native), scheduler.clone());

        // The loop is parked on its second read, which is still outstanding.
        assert_eq!(session.len(), 1);
        assert!(tally.lock().outstanding);
        let polls = tally.lock().polls;

        drop(session);

        let tally_state = tally.lock();
        assert!(tally_state.closed);
        assert_eq!(tally_state.polls, polls);
        drop(tally_state);

        assert!(scheduler.is_empty());
        assert!(!scheduler.run_next());
    }

    #[test]
    fn shared_scheduler_resumes_other_sessions() {
        let scheduler = Scheduler::new();
        let (a_native, a_tally) = ScriptedWatch::new(vec![Step::Pending, Step::Pending]);
        let (b_native, b_tally) = ScriptedWatch::new(vec![
            Step::Pending,
            Step::Batch(encode_notify_batch(&[(1, "b.txt")])),
        ]);

        let a = WatchSession::with_native("A", Box::new(a_native), scheduler.clone());
        let b = WatchSession::with_native("B", Box::new(b_native), scheduler.clone());
        assert_eq!(scheduler.len(), 2);

        // The front entry is A's: pumping B resumes A.
        b.pump().unwrap();
        assert_eq!(a_tally.lock().polls, 2);
        assert_eq!(b_tally.lock().polls, 1);

        // Now B is at the front: pumping A resumes B, whose read completes.
        a.pump().unwrap();
        assert_eq!(b_tally.lock().polls, 3);
        assert_eq!(b.pop().unwrap().path(), "b.txt");
        assert!(a.is_empty());
    }

    #[test]
    fn concurrent_pumps_keep_every_session_queued() {
        let scheduler = Scheduler::new();
        let sessions: Vec<_> = (0..8)
            .map(|n| {
                let (native, tally) = ScriptedWatch::new(vec![]);
                let session =
                    WatchSession::with_native(format!("C:/watched/{n}"), Box::new(native), scheduler.clone());
                (session, tally)
            })
            .collect();
        assert_eq!(scheduler.len(), 8);

        std::thread::scope(|scope| {
            for (session, _) in &sessions {
                scope.spawn(move || {
                    for _ in 0..2_000 {
                        session.pump().unwrap();
                    }
                });
            }
        });

        assert_eq!(scheduler.len(), 8);
        for (session, tally) in &sessions {
            assert_eq!(session.phase(), SessionPhase::Pending);
            assert!(session.blocker.is_parked());
            let tally = tally.lock();
            assert_eq!(tally.submits, 1);
            assert_eq!(tally.overlapping_submits, 0);
        }
    }

    #[test]
    fn held_peek_does_not_block_a_pump_that_resumes_its_session() {
        let scheduler = Scheduler::new();
        let (a_native, a_tally) = ScriptedWatch::new(vec![Step::Batch(encode_notify_batch(&[(1, "a.txt")]))]);
        let (b_native, _) = ScriptedWatch::new(vec![]);

        let a = WatchSession::with_native("A", Box::new(a_native), scheduler.clone());
        let b = WatchSession::with_native("B", Box::new(b_native), scheduler.clone());

        // A is parked at the front, so pumping B resumes A while A's event is
        // still held.
        let held = a.peek().unwrap();
        b.pump().unwrap();

        assert_eq!(a_tally.lock().polls, 3);
        assert_eq!(held.path(), "a.txt");
        assert_eq!(a.len(), 1);
        drop(held);
        assert_eq!(a.pop().unwrap().path(), "a.txt");
    }

    #[test]
    fn pump_reports_only_its_own_sticky_error() {
        let scheduler = Scheduler::new();
        let (a_native, _) = ScriptedWatch::new(vec![Step::Pending, Step::Fail("boom".to_owned())]);
        let (b_native, _) = ScriptedWatch::new(vec![]);

        let a = WatchSession::with_native("A", Box::new(a_native), scheduler.clone());
        let b = WatchSession::with_native("B", Box::new(b_native), scheduler.clone());

        // B's pump resumes A, which fails; B itself is still healthy.
        b.pump().unwrap();
        assert_eq!(a.phase(), SessionPhase::Failed);
        assert_eq!(a.pump(), Err(FsMonitorError::Monitor("boom".to_owned())));
        assert!(b.pump().is_ok());
    }
}
