use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use fsmon::FsMonitorError;
use once_cell::sync::OnceCell;
use tracing::debug;

pub const INSTANCE_SLOT_NAME: &str = "f5ffc881-ba69-452d-973e-dd3408932068";

const SLOT_LEN: usize = std::mem::size_of::<u32>();

static INSTANCE: OnceCell<InstanceSlot> = OnceCell::new();

/// Claims the process-wide instance slot for this process. Returns 0 when
/// the claim succeeded, otherwise the id of the process that holds it. The
/// mapping stays open until the process exits.
pub fn running_instance() -> Result<u32, FsMonitorError> {
    let slot = INSTANCE.get_or_try_init(|| InstanceSlot::open(INSTANCE_SLOT_NAME))?;
    Ok(slot.claim())
}

/// One `u32` of named shared memory holding the owning process id, zero
/// while unclaimed.
pub struct InstanceSlot {
    owner: NonNull<AtomicU32>,
    #[cfg(windows)]
    mapping: windows_sys::Win32::Foundation::HANDLE,
}

// The slot is only ever accessed atomically.
unsafe impl Send for InstanceSlot {}
unsafe impl Sync for InstanceSlot {}

impl InstanceSlot {
    fn owner(&self) -> &AtomicU32 {
        // SAFETY: the view stays mapped for as long as `self` lives.
        unsafe { self.owner.as_ref() }
    }

    /// Claims the slot for this process. Returns 0 on success, otherwise the
    /// id of the live process holding it. A slot left behind by a process
    /// that has exited counts as free.
    pub fn claim(&self) -> u32 {
        let me = std::process::id();
        let mut expected = 0;

        loop {
            match self
                .owner()
                .compare_exchange(expected, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return 0,
                Err(0) => expected = 0,
                Err(existing) if existing != me && !imp::process_alive(existing) => {
                    debug!(pid = existing, "reclaiming instance slot from an exited process");
                    expected = existing;
                }
                Err(existing) => return existing,
            }
        }
    }

    /// Gives the slot back if this process holds it.
    fn release(&self) {
        let me = std::process::id();
        if self
            .owner()
            .compare_exchange(me, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("instance slot released");
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::{
        ffi::CString,
        io,
        os::fd::{AsRawFd, FromRawFd, OwnedFd},
        ptr,
    };

    use super::*;

    // `shm_open` is variadic on Apple targets, where the mode travels
    // promoted to an unsigned int.
    #[cfg(target_vendor = "apple")]
    const SHM_MODE: libc::c_uint = 0o600;
    #[cfg(not(target_vendor = "apple"))]
    const SHM_MODE: libc::mode_t = 0o600;

    pub(super) fn process_alive(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks that the process exists; EPERM means it does
        // but belongs to someone else.
        (unsafe { libc::kill(pid, 0) == 0 })
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub(super) fn object_name(name: &str) -> Result<CString, FsMonitorError> {
        CString::new(format!("/{name}")).map_err(|_| {
            FsMonitorError::InvalidParameter(format!("shared memory name {name} contains a NUL byte"))
        })
    }

    impl InstanceSlot {
        pub fn open(name: &str) -> Result<InstanceSlot, FsMonitorError> {
            let c_name = object_name(name)?;

            let raw = unsafe {
                libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT, SHM_MODE)
            };
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            // SAFETY: shm_open just handed us this descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // Growing a fresh object zero-fills it; an existing one already
            // has this length and keeps its contents.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), SLOT_LEN as libc::off_t) } < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let view = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    SLOT_LEN,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if view == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }

            debug!(name, "instance slot mapped");
            Ok(InstanceSlot {
                owner: NonNull::new(view.cast()).ok_or_else(|| {
                    FsMonitorError::Monitor("shared memory mapped at null".to_owned())
                })?,
            })
        }
    }

    impl Drop for InstanceSlot {
        fn drop(&mut self) {
            self.release();
            unsafe { libc::munmap(self.owner.as_ptr().cast(), SLOT_LEN) };
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::{io, iter, ptr};

    use windows_sys::Win32::{
        Foundation::{CloseHandle, ERROR_ACCESS_DENIED, INVALID_HANDLE_VALUE, STILL_ACTIVE},
        System::{
            Memory::{
                CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_WRITE,
                MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
            },
            Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
        },
    };

    use super::*;

    pub(super) fn process_alive(pid: u32) -> bool {
        let process = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
        if process.is_null() {
            return io::Error::last_os_error().raw_os_error() == Some(ERROR_ACCESS_DENIED as i32);
        }

        let mut code = 0u32;
        let queried = unsafe { GetExitCodeProcess(process, &mut code) };
        unsafe { CloseHandle(process) };
        // An unreadable exit code is taken as still running.
        queried == 0 || code == STILL_ACTIVE as u32
    }

    impl InstanceSlot {
        pub fn open(name: &str) -> Result<InstanceSlot, FsMonitorError> {
            let wide: Vec<u16> = name.encode_utf16().chain(iter::once(0)).collect();

            // Pagefile-backed mappings start out zeroed.
            let mapping = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE,
                    0,
                    SLOT_LEN as u32,
                    wide.as_ptr(),
                )
            };
            if mapping.is_null() {
                return Err(io::Error::last_os_error().into());
            }

            let view = unsafe { MapViewOfFile(mapping, FILE_MAP_WRITE, 0, 0, 0) };
            let Some(owner) = NonNull::new(view.Value.cast::<AtomicU32>()) else {
                let err = io::Error::last_os_error();
                unsafe { CloseHandle(mapping) };
                return Err(err.into());
            };

            debug!(name, "instance slot mapped");
            Ok(InstanceSlot { owner, mapping })
        }
    }

    impl Drop for InstanceSlot {
        fn drop(&mut self) {
            self.release();
            unsafe {
                UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.owner.as_ptr().cast(),
                });
                CloseHandle(self.mapping);
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use super::*;

    pub(super) fn process_alive(_pid: u32) -> bool {
        true
    }

    impl InstanceSlot {
        pub fn open(_name: &str) -> Result<InstanceSlot, FsMonitorError> {
            Err(FsMonitorError::Unsupported)
        }
    }
}
