use std::env;

use bitflags::bitflags;

use crate::FsMonitorError;

bitflags! {
    /// Which kinds of change a session asks the kernel for. The bit values
    /// are the `FILE_NOTIFY_CHANGE_*` constants.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChangeFilter: u32 {
        const FILE_NAME = 0x0000_0001;
        const DIR_NAME = 0x0000_0002;
        const ATTRIBUTES = 0x0000_0004;
        const SIZE = 0x0000_0008;
        const LAST_WRITE = 0x0000_0010;
    }
}

impl ChangeFilter {
    /// Parses a comma separated list such as `"file_name,dir_name"`.
    pub fn from_names(names: &str) -> Result<ChangeFilter, FsMonitorError> {
        let mut filter = ChangeFilter::empty();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            filter |= match name.to_ascii_lowercase().as_str() {
                "file_name" => ChangeFilter::FILE_NAME,
                "dir_name" => ChangeFilter::DIR_NAME,
                "attributes" => ChangeFilter::ATTRIBUTES,
                "size" => ChangeFilter::SIZE,
                "last_write" => ChangeFilter::LAST_WRITE,
                _ => {
                    return Err(FsMonitorError::InvalidParameter(format!(
                        "unknown change filter '{name}'. Allowed values are: 'file_name', \
                         'dir_name', 'attributes', 'size', 'last_write'."
                    )))
                }
            };
        }

        if filter.is_empty() {
            return Err(FsMonitorError::InvalidParameter(
                "change filter must name at least one kind of change".to_owned(),
            ));
        }
        Ok(filter)
    }
}

impl Default for ChangeFilter {
    fn default() -> Self {
        ChangeFilter::FILE_NAME | ChangeFilter::DIR_NAME
    }
}

pub const FILTER_ENV: &str = "FSMON_FILTER";
pub const BUFFER_SIZE_ENV: &str = "FSMON_BUFFER_SIZE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Receive buffer size in bytes, rounded up to whatever a single maximal
    /// record needs. inotify reads go through nix's own buffer instead.
    pub buffer_size: usize,
    pub recursive: bool,
    pub filter: ChangeFilter,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            buffer_size: 16 * 1024,
            recursive: true,
            filter: ChangeFilter::default(),
        }
    }
}

impl WatchOptions {
    /// Defaults, overridden by `FSMON_FILTER` and `FSMON_BUFFER_SIZE` when
    /// they are set.
    pub fn from_env() -> Result<WatchOptions, FsMonitorError> {
        let mut opts = WatchOptions::default();

        if let Ok(filter) = env::var(FILTER_ENV) {
            opts.filter = ChangeFilter::from_names(&filter)?;
        }

        if let Ok(size) = env::var(BUFFER_SIZE_ENV) {
            opts.buffer_size = size.trim().parse().map_err(|_| {
                FsMonitorError::InvalidParameter(format!(
                    "{BUFFER_SIZE_ENV} must be a byte count, got '{size}'"
                ))
            })?;
        }

        Ok(opts)
    }
}
