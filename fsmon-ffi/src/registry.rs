use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    sync::Arc,
};

use fsmon::{FileSystemEvent, FsMonitorError, WatchOptions, WatchSession};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub(crate) static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// Live sessions keyed by the exact bytes the caller booted them with. No
/// path normalisation happens here, so two spellings of one directory are
/// two sessions.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<Vec<u8>, WatchSession>,
    last_error: CString,
}

fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

impl Registry {
    /// Opens a session for `key`, replacing (and closing) any session that
    /// was already registered under it. Nothing is registered on failure.
    pub fn boot(&mut self, key: &[u8], opts: WatchOptions) -> Result<(), FsMonitorError> {
        let root = std::str::from_utf8(key).map_err(|e| {
            FsMonitorError::InvalidParameter(format!("directory path is not UTF-8: {e}"))
        })?;

        let session = WatchSession::open_with(root, opts)?;
        if self.sessions.insert(key.to_vec(), session).is_some() {
            debug!(root, "replaced existing session");
        }
        Ok(())
    }

    pub fn tick(&mut self, key: &[u8]) -> Result<(), FsMonitorError> {
        self.sessions
            .get(key)
            .ok_or_else(|| FsMonitorError::UnknownSession(display_key(key)))?
            .pump()
    }

    /// Address of the oldest queued event. The session's queue keeps its own
    /// reference, so the address holds until that event is popped or the
    /// session is shut down.
    pub fn peek(&self, key: &[u8]) -> Option<*const FileSystemEvent> {
        let session = self.sessions.get(key)?;
        Some(Arc::as_ptr(&session.peek()?))
    }

    pub fn pop(&mut self, key: &[u8]) {
        if let Some(session) = self.sessions.get(key) {
            session.pop();
        }
    }

    pub fn shutdown(&mut self, key: &[u8]) {
        if let Some(session) = self.sessions.remove(key) {
            debug!(root = %session.root().display(), "shutting down session");
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn record(&mut self, err: &FsMonitorError) {
        warn!("{err}");
        self.last_error = CString::new(err.to_string()).unwrap_or_default();
    }

    /// The message of the most recent failure, empty if there was none.
    pub fn last_error(&self) -> &CStr {
        &self.last_error
    }
}
