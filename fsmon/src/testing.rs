//! Test doubles shared by the unit tests.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{decode::HEADER_LEN, decode_notify_batch, FileSystemEvent, FsMonitorError, NativeWatch};

/// Builds a `FILE_NOTIFY_INFORMATION` chain, records padded to 4 bytes.
pub(crate) fn encode_notify_batch(records: &[(u32, &str)]) -> Vec<u8> {
    let mut batch = Vec::new();

    for (idx, (action, name)) in records.iter().enumerate() {
        let name: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let len = (HEADER_LEN + name.len()).next_multiple_of(4);
        let next = if idx + 1 == records.len() { 0 } else { len };

        let start = batch.len();
        batch.extend_from_slice(&(next as u32).to_le_bytes());
        batch.extend_from_slice(&action.to_le_bytes());
        batch.extend_from_slice(&(name.len() as u32).to_le_bytes());
        batch.extend_from_slice(&name);
        batch.resize(start + len, 0);
    }

    batch
}

pub(crate) enum Step {
    Pending,
    Batch(Vec<u8>),
    Fail(String),
}

#[derive(Default)]
pub(crate) struct Tally {
    pub steps: VecDeque<Step>,
    pub fail_submit: Option<String>,
    pub submits: usize,
    pub polls: usize,
    pub outstanding: bool,
    pub overlapping_submits: usize,
    pub closed: bool,
    last_batch: Vec<u8>,
}

/// A [`NativeWatch`] that replays scripted completions. Once the script runs
/// out every poll reports the request as still pending.
pub(crate) struct ScriptedWatch {
    tally: Arc<Mutex<Tally>>,
}

impl ScriptedWatch {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> (ScriptedWatch, Arc<Mutex<Tally>>) {
        let tally = Arc::new(Mutex::new(Tally {
            steps: steps.into_iter().collect(),
            ..Tally::default()
        }));
        (
            ScriptedWatch {
                tally: tally.clone(),
            },
            tally,
        )
    }
}

impl NativeWatch for ScriptedWatch {
    fn submit(&mut self) -> Result<(), FsMonitorError> {
        let mut tally = self.tally.lock();
        if let Some(msg) = tally.fail_submit.take() {
            return Err(FsMonitorError::Monitor(msg));
        }
        if tally.outstanding {
            tally.overlapping_submits += 1;
        }
        tally.submits += 1;
        tally.outstanding = true;
        Ok(())
    }

    fn poll_complete(&mut self) -> Result<Option<usize>, FsMonitorError> {
        let mut tally = self.tally.lock();
        tally.polls += 1;
        match tally.steps.pop_front() {
            None | Some(Step::Pending) => Ok(None),
            Some(Step::Batch(batch)) => {
                tally.outstanding = false;
                let transferred = batch.len();
                tally.last_batch = batch;
                Ok(Some(transferred))
            }
            Some(Step::Fail(msg)) => Err(FsMonitorError::Monitor(msg)),
        }
    }

    fn decode(&mut self, transferred: usize) -> Result<Vec<FileSystemEvent>, FsMonitorError> {
        let tally = self.tally.lock();
        decode_notify_batch(&tally.last_batch[..transferred])
    }

    fn close(&mut self) {
        self.tally.lock().closed = true;
    }
}
