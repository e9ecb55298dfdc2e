//! C ABI over `fsmon`: one watch session per directory key, pumped by the
//! host. Nothing here panics or unwinds across the boundary; failures come
//! back as `false` or null and the message is fetched with [`GetLastErr`].
#![allow(non_snake_case)]

mod instance;
mod registry;

use std::{
    ffi::CStr,
    os::raw::{c_char, c_int},
    ptr,
};

use fsmon::{FileSystemEvent, FsMonitorError, WatchOptions};
use once_cell::sync::Lazy;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use instance::{running_instance, InstanceSlot, INSTANCE_SLOT_NAME};
pub use registry::Registry;

use registry::REGISTRY;

/// Directives for the stderr logger installed on first [`Boot`].
pub const LOG_ENV: &str = "FSMON_LOG";

static LOGGING: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // The host may already have installed a subscriber of its own.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
});

unsafe fn key<'a>(dir: *const c_char) -> Result<&'a [u8], FsMonitorError> {
    if dir.is_null() {
        return Err(FsMonitorError::InvalidParameter("directory path is null".to_owned()));
    }
    Ok(CStr::from_ptr(dir).to_bytes())
}

fn succeeded(registry: &mut Registry, result: Result<(), FsMonitorError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            registry.record(&err);
            false
        }
    }
}

/// Opens `dir` (NUL-terminated UTF-8) for monitoring and registers the
/// session under those exact bytes.
///
/// # Safety
/// `dir` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "system" fn Boot(dir: *const c_char) -> bool {
    Lazy::force(&LOGGING);

    let mut registry = REGISTRY.lock();
    let result = key(dir).and_then(|key| {
        let opts = WatchOptions::from_env()?;
        registry.boot(key, opts)
    });
    succeeded(&mut registry, result)
}

/// Pumps the session registered under `dir` once.
///
/// # Safety
/// `dir` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "system" fn Tick(dir: *const c_char) -> bool {
    let mut registry = REGISTRY.lock();
    let result = key(dir).and_then(|key| registry.tick(key));
    succeeded(&mut registry, result)
}

/// The oldest queued event, or null. The handle stays valid until the next
/// `Pop`, `Tick` or `Shutdown` for the same directory.
///
/// # Safety
/// `dir` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "system" fn Peek(dir: *const c_char) -> *const FileSystemEvent {
    let Ok(key) = key(dir) else {
        return ptr::null();
    };
    REGISTRY.lock().peek(key).unwrap_or(ptr::null())
}

/// # Safety
/// `dir` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "system" fn Pop(dir: *const c_char) {
    if let Ok(key) = key(dir) {
        REGISTRY.lock().pop(key);
    }
}

/// Closes the session for `dir`, releasing its native handles before
/// returning.
///
/// # Safety
/// `dir` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "system" fn Shutdown(dir: *const c_char) {
    if let Ok(key) = key(dir) {
        REGISTRY.lock().shutdown(key);
    }
}

/// The most recent failure message, NUL-terminated, with its length in bytes
/// written to `len`. Valid until the next failure is recorded.
///
/// # Safety
/// `len` must be null or valid for a write.
#[no_mangle]
pub unsafe extern "system" fn GetLastErr(len: *mut c_int) -> *const c_char {
    let registry = REGISTRY.lock();
    let message = registry.last_error();
    if !len.is_null() {
        *len = message.to_bytes().len() as c_int;
    }
    message.as_ptr()
}

/// The action code of `event`, 0 for a null handle.
///
/// # Safety
/// `event` must be null or a live handle from [`Peek`].
#[no_mangle]
pub unsafe extern "system" fn GetAction(event: *const FileSystemEvent) -> c_int {
    match event.as_ref() {
        Some(event) => event.action().code(),
        None => 0,
    }
}

/// The UTF-8 path of `event` relative to the watched directory. The bytes
/// are not NUL-terminated; their length is written to `size`.
///
/// # Safety
/// `event` must be null or a live handle from [`Peek`]; `size` must be null
/// or valid for a write.
#[no_mangle]
pub unsafe extern "system" fn GetFile(
    event: *const FileSystemEvent,
    size: *mut c_int,
) -> *const c_char {
    let (data, len) = match event.as_ref() {
        Some(event) => (event.path().as_ptr().cast(), event.path().len()),
        None => (ptr::null(), 0),
    };
    if !size.is_null() {
        *size = len as c_int;
    }
    data
}

/// 0 if this process now owns the named instance slot, otherwise the owner's
/// process id. If the slot cannot be mapped the failure is recorded and 0 is
/// returned.
#[no_mangle]
pub extern "system" fn GetRunningInstance() -> u32 {
    match running_instance() {
        Ok(owner) => owner,
        Err(err) => {
            REGISTRY.lock().record(&err);
            0
        }
    }
}
