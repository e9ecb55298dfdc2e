#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::open;

#[cfg(windows)]
pub mod windows;

#[cfg(windows)]
pub use windows::open;

#[cfg(not(any(target_os = "linux", windows)))]
pub fn open(
    _root: &std::path::Path,
    _opts: &crate::WatchOptions,
) -> Result<Box<dyn crate::NativeWatch>, crate::FsMonitorError> {
    Err(crate::FsMonitorError::Unsupported)
}
