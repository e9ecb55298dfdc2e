use std::{io, iter, mem, os::windows::ffi::OsStrExt, path::Path, ptr};

use tracing::debug;
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
    },
    Storage::FileSystem::{
        CreateFileW, ReadDirectoryChangesW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
        FILE_LIST_DIRECTORY, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        Threading::{CreateEventW, ResetEvent, WaitForSingleObject},
        IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
    },
};

use crate::{decode_notify_batch, FileSystemEvent, FsMonitorError, NativeWatch, WatchOptions};

// Header plus a MAX_PATH name in UTF-16.
const MIN_BUFFER_LEN: usize = 12 + 260 * 2;

fn last_error() -> String {
    io::Error::last_os_error().to_string()
}

/// Overlapped `ReadDirectoryChangesW` on a directory handle, completion
/// signalled through a manual-reset event that is polled with a zero
/// timeout.
pub struct ReadDirectoryChangesWatch {
    directory: HANDLE,
    event: HANDLE,
    // Both must stay put while a read is outstanding; the kernel writes
    // into them on completion.
    overlapped: Box<OVERLAPPED>,
    buffer: Box<[u32]>,
    recursive: bool,
    filter: u32,
    outstanding: bool,
}

// The handles are only touched from whichever thread pumps the session.
unsafe impl Send for ReadDirectoryChangesWatch {}

impl ReadDirectoryChangesWatch {
    pub fn open(root: &Path, opts: &WatchOptions) -> Result<ReadDirectoryChangesWatch, FsMonitorError> {
        let wide: Vec<u16> = root.as_os_str().encode_wide().chain(iter::once(0)).collect();

        let directory = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if directory == INVALID_HANDLE_VALUE {
            return Err(FsMonitorError::Open(last_error()));
        }

        let event = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
        if event.is_null() {
            let err = last_error();
            unsafe { CloseHandle(directory) };
            return Err(FsMonitorError::Open(err));
        }

        // SAFETY: OVERLAPPED is plain data; all zeroes is its documented
        // initial state.
        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        overlapped.hEvent = event;

        let words = opts.buffer_size.max(MIN_BUFFER_LEN).div_ceil(mem::size_of::<u32>());
        debug!(root = %root.display(), bytes = words * 4, "directory handle opened");

        Ok(ReadDirectoryChangesWatch {
            directory,
            event,
            overlapped,
            buffer: vec![0u32; words].into_boxed_slice(),
            recursive: opts.recursive,
            filter: opts.filter.bits(),
            outstanding: false,
        })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: a u32 slice viewed as bytes, same allocation and length.
        unsafe {
            std::slice::from_raw_parts(
                self.buffer.as_ptr().cast::<u8>(),
                self.buffer.len() * mem::size_of::<u32>(),
            )
        }
    }

    fn is_closed(&self) -> bool {
        self.directory == INVALID_HANDLE_VALUE
    }
}

impl NativeWatch for ReadDirectoryChangesWatch {
    fn submit(&mut self) -> Result<(), FsMonitorError> {
        if self.is_closed() {
            return Err(FsMonitorError::Monitor("directory handle is closed".to_owned()));
        }

        self.buffer.fill(0);
        unsafe { ResetEvent(self.event) };
        *self.overlapped = unsafe { mem::zeroed() };
        self.overlapped.hEvent = self.event;

        let submitted = unsafe {
            ReadDirectoryChangesW(
                self.directory,
                self.buffer.as_mut_ptr().cast(),
                (self.buffer.len() * mem::size_of::<u32>()) as u32,
                if self.recursive { TRUE } else { FALSE },
                self.filter,
                ptr::null_mut(),
                &mut *self.overlapped,
                None,
            )
        };
        if submitted == 0 {
            return Err(FsMonitorError::Monitor(last_error()));
        }

        self.outstanding = true;
        Ok(())
    }

    fn poll_complete(&mut self) -> Result<Option<usize>, FsMonitorError> {
        match unsafe { WaitForSingleObject(self.event, 0) } {
            WAIT_TIMEOUT => Ok(None),
            WAIT_OBJECT_0 => {
                let mut transferred = 0u32;
                let ok = unsafe {
                    GetOverlappedResult(self.directory, &*self.overlapped, &mut transferred, FALSE)
                };
                self.outstanding = false;
                if ok == 0 {
                    return Err(FsMonitorError::Monitor(last_error()));
                }
                Ok(Some(transferred as usize))
            }
            _ => Err(FsMonitorError::Monitor(last_error())),
        }
    }

    fn decode(&mut self, transferred: usize) -> Result<Vec<FileSystemEvent>, FsMonitorError> {
        let bytes = self.bytes();
        let batch = bytes.get(..transferred).ok_or_else(|| {
            FsMonitorError::MalformedBatch(format!(
                "{transferred} bytes reported for a {} byte buffer",
                bytes.len()
            ))
        })?;
        decode_notify_batch(batch)
    }

    fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        if self.outstanding {
            // The read is abandoned, but the kernel must be done with the
            // buffer before it is freed.
            let mut transferred = 0u32;
            unsafe {
                CancelIoEx(self.directory, &*self.overlapped);
                GetOverlappedResult(self.directory, &*self.overlapped, &mut transferred, TRUE);
            }
            self.outstanding = false;
        }

        unsafe {
            CloseHandle(self.event);
            CloseHandle(self.directory);
        }
        self.event = ptr::null_mut();
        self.directory = INVALID_HANDLE_VALUE;
        debug!("directory handle closed");
    }
}

impl Drop for ReadDirectoryChangesWatch {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::FileSystemAction;

    #[test]
    fn reports_a_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch =
            ReadDirectoryChangesWatch::open(dir.path(), &WatchOptions::default()).unwrap();
        watch.submit().unwrap();
        assert_eq!(watch.poll_complete().unwrap(), None);

        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let transferred = loop {
            if let Some(transferred) = watch.poll_complete().unwrap() {
                break transferred;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        let events = watch.decode(transferred).unwrap();
        assert_eq!(events[0], FileSystemEvent::new(FileSystemAction::Added, "a.txt"));

        watch.close();
        assert!(watch.is_closed());
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReadDirectoryChangesWatch::open(&dir.path().join("missing"), &WatchOptions::default()),
            Err(FsMonitorError::Open(_))
        ));
    }
}
