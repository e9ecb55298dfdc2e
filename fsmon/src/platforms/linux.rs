use std::path::Path;

use crate::{FsMonitorError, NativeWatch, WatchOptions};

pub mod inotify;

pub use inotify::InotifyWatch;

pub fn open(root: &Path, opts: &WatchOptions) -> Result<Box<dyn NativeWatch>, FsMonitorError> {
    Ok(Box::new(InotifyWatch::open(root, opts)?))
}
