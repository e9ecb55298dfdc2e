use std::path::Path;

use crate::{FsMonitorError, NativeWatch, WatchOptions};

mod readdirectorychangesw;

pub use readdirectorychangesw::ReadDirectoryChangesWatch;

pub fn open(root: &Path, opts: &WatchOptions) -> Result<Box<dyn NativeWatch>, FsMonitorError> {
    Ok(Box::new(ReadDirectoryChangesWatch::open(root, opts)?))
}
