mod decode;
mod options;
mod platforms;
mod runtime;
mod session;
mod stream;

#[cfg(test)]
mod testing;

use std::{fmt, io};

#[cfg(unix)]
use nix::errno::Errno;
use thiserror::Error;

pub use decode::decode_notify_batch;
pub use options::{ChangeFilter, WatchOptions};
pub use runtime::{Blocker, ComputationRunner, Scheduler, Wait};
pub use session::{SessionPhase, WatchSession};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsMonitorError {
    #[error("unable to open directory for monitoring: {0}")]
    Open(String),

    #[error("{0}")]
    Monitor(String),

    #[error("malformed notification batch: {0}")]
    MalformedBatch(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("suspension point signaled with no computation parked on it")]
    NothingParked,

    #[error("Dir Monitor not found: {0}")]
    UnknownSession(String),

    #[error("directory monitoring is not supported on this platform")]
    Unsupported,
}

impl From<io::Error> for FsMonitorError {
    fn from(value: io::Error) -> Self {
        FsMonitorError::Monitor(value.to_string())
    }
}

#[cfg(unix)]
impl From<Errno> for FsMonitorError {
    fn from(value: Errno) -> Self {
        FsMonitorError::Monitor(value.desc().to_owned())
    }
}

/// Kind of change carried by a [`FileSystemEvent`].
///
/// The discriminants are the action codes used on the wire by the native
/// record format and by the C boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum FileSystemAction {
    Added = 1,
    Removed = 2,
    Modified = 3,
    RenamedOldName = 4,
    RenamedNewName = 5,
}

impl FileSystemAction {
    pub fn from_code(code: u32) -> Option<FileSystemAction> {
        match code {
            1 => Some(FileSystemAction::Added),
            2 => Some(FileSystemAction::Removed),
            3 => Some(FileSystemAction::Modified),
            4 => Some(FileSystemAction::RenamedOldName),
            5 => Some(FileSystemAction::RenamedNewName),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for FileSystemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileSystemAction::Added => "added",
            FileSystemAction::Removed => "removed",
            FileSystemAction::Modified => "modified",
            FileSystemAction::RenamedOldName => "renamed_old_name",
            FileSystemAction::RenamedNewName => "renamed_new_name",
        };
        f.write_str(name)
    }
}

/// A single decoded change. `path` is relative to the watched root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileSystemEvent {
    action: FileSystemAction,
    path: String,
}

impl FileSystemEvent {
    pub fn new(action: FileSystemAction, path: impl Into<String>) -> FileSystemEvent {
        FileSystemEvent {
            action,
            path: path.into(),
        }
    }

    pub fn action(&self) -> FileSystemAction {
        self.action
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// The narrow interface over a platform's asynchronous directory-change
/// primitive. A watch session keeps at most one request outstanding and
/// drives it only through these calls.
pub trait NativeWatch: Send {
    /// Clears the receive buffer, resets the completion signal and submits
    /// the next asynchronous read.
    fn submit(&mut self) -> Result<(), FsMonitorError>;

    /// Checks the outstanding read without blocking. `None` while it is
    /// still in flight, otherwise how much the kernel delivered (bytes, or
    /// records for backends that read whole records). Zero means the
    /// kernel dropped changes.
    fn poll_complete(&mut self) -> Result<Option<usize>, FsMonitorError>;

    /// Turns the first `transferred` bytes of the last completed read into
    /// events, in the order the kernel reported them.
    fn decode(&mut self, transferred: usize) -> Result<Vec<FileSystemEvent>, FsMonitorError>;

    /// Releases the directory handle and completion signal. Must tolerate
    /// being called again; the session calls it before discarding the
    /// monitoring computation.
    fn close(&mut self);
}
