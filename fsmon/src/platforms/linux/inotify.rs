use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use tracing::{debug, trace, warn};

use crate::{
    ChangeFilter, FileSystemAction, FileSystemEvent, FsMonitorError, NativeWatch, WatchOptions,
};

fn watch_mask(filter: ChangeFilter, recursive: bool) -> AddWatchFlags {
    let mut mask = AddWatchFlags::empty();
    // New directories have to be seen to be watched, whatever the filter.
    if recursive || filter.intersects(ChangeFilter::FILE_NAME | ChangeFilter::DIR_NAME) {
        mask |= AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_FROM
            | AddWatchFlags::IN_MOVED_TO;
    }
    if filter.intersects(ChangeFilter::SIZE | ChangeFilter::LAST_WRITE) {
        mask |= AddWatchFlags::IN_MODIFY;
    }
    if filter.contains(ChangeFilter::ATTRIBUTES) {
        mask |= AddWatchFlags::IN_ATTRIB;
    }
    mask
}

fn classify(mask: AddWatchFlags) -> Option<FileSystemAction> {
    match mask {
        x if x.contains(AddWatchFlags::IN_CREATE) => Some(FileSystemAction::Added),
        x if x.contains(AddWatchFlags::IN_DELETE) => Some(FileSystemAction::Removed),
        x if x.contains(AddWatchFlags::IN_MOVED_FROM) => Some(FileSystemAction::RenamedOldName),
        x if x.contains(AddWatchFlags::IN_MOVED_TO) => Some(FileSystemAction::RenamedNewName),
        x if x.intersects(AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_ATTRIB) => {
            Some(FileSystemAction::Modified)
        }
        _ => None,
    }
}

fn reports(filter: ChangeFilter, action: FileSystemAction, is_dir: bool) -> bool {
    match action {
        FileSystemAction::Modified => filter
            .intersects(ChangeFilter::ATTRIBUTES | ChangeFilter::SIZE | ChangeFilter::LAST_WRITE),
        _ if is_dir => filter.contains(ChangeFilter::DIR_NAME),
        _ => filter.contains(ChangeFilter::FILE_NAME),
    }
}

/// `inotify` backed watch. The descriptor is non-blocking, so a "request"
/// is simply the next read and `EAGAIN` means it is still pending. The
/// transferred count it reports is the number of records read.
///
/// inotify watches are per directory: the subtree is marked when the watch
/// opens and directories that appear later are marked as their creation is
/// decoded.
pub struct InotifyWatch {
    root: PathBuf,
    inotify: Option<Inotify>,
    mask: AddWatchFlags,
    filter: ChangeFilter,
    recursive: bool,
    watches: HashMap<WatchDescriptor, PathBuf>,
    records: Vec<InotifyEvent>,
}

impl InotifyWatch {
    pub fn open(root: &Path, opts: &WatchOptions) -> Result<InotifyWatch, FsMonitorError> {
        let metadata = fs::metadata(root)
            .map_err(|e| FsMonitorError::Open(format!("{}: {e}", root.display())))?;
        if !metadata.is_dir() {
            return Err(FsMonitorError::Open(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| FsMonitorError::Open(e.desc().to_owned()))?;

        let mut watch = InotifyWatch {
            root: root.to_path_buf(),
            inotify: Some(inotify),
            mask: watch_mask(opts.filter, opts.recursive),
            filter: opts.filter,
            recursive: opts.recursive,
            watches: HashMap::new(),
            records: Vec::new(),
        };

        watch
            .mark(Path::new(""))
            .map_err(|e| FsMonitorError::Open(e.to_string()))?;
        if watch.recursive {
            watch.mark_subtree(Path::new(""));
        }

        debug!(root = %root.display(), watches = watch.watches.len(), "inotify watch opened");
        Ok(watch)
    }

    fn inotify(&self) -> Result<&Inotify, FsMonitorError> {
        self.inotify
            .as_ref()
            .ok_or_else(|| FsMonitorError::Monitor("inotify descriptor is closed".to_owned()))
    }

    fn mark(&mut self, relative: &Path) -> Result<(), FsMonitorError> {
        let full = self.root.join(relative);
        let wd = self.inotify()?.add_watch(&full, self.mask)?;
        self.watches.insert(wd, relative.to_path_buf());
        Ok(())
    }

    fn mark_subtree(&mut self, relative: &Path) {
        let mut traversal_queue = VecDeque::from([relative.to_path_buf()]);
        let mut visited = HashSet::<u64>::new();

        while let Some(dir) = traversal_queue.pop_front() {
            let Ok(entries) = fs::read_dir(self.root.join(&dir)) else {
                continue;
            };

            for entry in entries.flatten() {
                // file_type does not follow symlinks, so linked directories
                // are left alone.
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if !visited.insert(metadata.ino()) {
                    continue;
                }

                let child = dir.join(entry.file_name());
                if let Err(e) = self.mark(&child) {
                    warn!(path = %child.display(), "unable to watch subdirectory: {e}");
                    continue;
                }
                traversal_queue.push_back(child);
            }
        }
    }

    fn unmark_subtree(&mut self, relative: &Path) {
        let stale: Vec<WatchDescriptor> = self
            .watches
            .iter()
            .filter(|(_, path)| path.starts_with(relative))
            .map(|(wd, _)| *wd)
            .collect();

        for wd in stale {
            self.watches.remove(&wd);
            if let Some(inotify) = &self.inotify {
                // Fails harmlessly if the kernel already dropped the watch.
                let _ = inotify.rm_watch(wd);
            }
        }
    }
}

impl NativeWatch for InotifyWatch {
    fn submit(&mut self) -> Result<(), FsMonitorError> {
        self.inotify()?;
        self.records.clear();
        Ok(())
    }

    fn poll_complete(&mut self) -> Result<Option<usize>, FsMonitorError> {
        match self.inotify()?.read_events() {
            Ok(records) => {
                self.records = records;
                Ok(Some(self.records.len()))
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(&mut self, transferred: usize) -> Result<Vec<FileSystemEvent>, FsMonitorError> {
        if transferred > self.records.len() {
            return Err(FsMonitorError::MalformedBatch(format!(
                "{transferred} records reported, {} read",
                self.records.len()
            )));
        }

        let records = std::mem::take(&mut self.records);
        let mut events = Vec::with_capacity(transferred);
        for record in records.into_iter().take(transferred) {
            if record.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                warn!(root = %self.root.display(), "inotify queue overflowed, changes were dropped");
                continue;
            }
            if record.mask.contains(AddWatchFlags::IN_IGNORED) {
                self.watches.remove(&record.wd);
                continue;
            }

            let Some(dir) = self.watches.get(&record.wd) else {
                continue;
            };
            let relative = match &record.name {
                Some(name) => dir.join(name),
                None => dir.clone(),
            };
            let Some(action) = classify(record.mask) else {
                continue;
            };
            let is_dir = record.mask.contains(AddWatchFlags::IN_ISDIR);

            if is_dir && self.recursive {
                match action {
                    FileSystemAction::Added | FileSystemAction::RenamedNewName => {
                        match self.mark(&relative) {
                            Ok(()) => self.mark_subtree(&relative),
                            Err(e) => {
                                warn!(path = %relative.display(), "unable to watch new directory: {e}")
                            }
                        }
                    }
                    FileSystemAction::RenamedOldName => self.unmark_subtree(&relative),
                    _ => {}
                }
            }

            if !reports(self.filter, action, is_dir) {
                continue;
            }

            trace!(%action, cookie = record.cookie, path = %relative.display(), "inotify record");
            events.push(FileSystemEvent::new(action, relative.to_string_lossy()));
        }

        Ok(events)
    }

    fn close(&mut self) {
        self.watches.clear();
        self.records.clear();
        // Dropping the descriptor closes it and every watch on it.
        if self.inotify.take().is_some() {
            debug!(root = %self.root.display(), "inotify watch closed");
        }
    }
}
