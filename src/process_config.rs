use crate::{
    address_space::memory_range::MemoryRange,
    error::ConfigError,
    flags::MonitorFlags,
    preload_interface::{RD_PAGE_ADDR, RD_PAGE_LIB_FILENAME, RD_PAGE_LIB_FILENAME_32, RD_PAGE_SIZE},
    remote_ptr::{RemotePtr, Void},
    util::{ceil_page_size, checked_ceil_page_size, is_page_aligned},
};
use libc::pid_t;
use std::{ffi::OsString, os::unix::ffi::OsStrExt};

/// The range where the rd page support library is always mapped. Fixed when
/// the tracee is attached and read-only from then on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservedPage {
    range: MemoryRange,
}

impl ReservedPage {
    pub fn new(addr: usize, size: usize) -> Result<ReservedPage, ConfigError> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(ConfigError::UnalignedAddress(addr));
        }
        if size == 0 {
            return Err(ConfigError::EmptyReservation(size));
        }
        let size =
            checked_ceil_page_size(size).ok_or(ConfigError::AddressOverflow { addr, size })?;
        let end = RemotePtr::<Void>::from(addr)
            .checked_add(size)
            .ok_or(ConfigError::AddressOverflow { addr, size })?;
        Ok(ReservedPage {
            range: MemoryRange::from_range(addr.into(), end),
        })
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.range.start()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }
}

impl Default for ReservedPage {
    fn default() -> Self {
        let start: RemotePtr<Void> = RD_PAGE_ADDR.into();
        ReservedPage {
            range: MemoryRange::new_range(start, ceil_page_size(RD_PAGE_SIZE)),
        }
    }
}

/// Per-tracee configuration, computed once at attach time and threaded into
/// everything that needs it.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub pid: pid_t,
    pub reserved_page: ReservedPage,
    pub rd_page_lib: OsString,
    /// The 32-bit build of the library, which 32-bit tracees load instead.
    /// Only known for the built-in library name.
    pub rd_page_lib_32: Option<OsString>,
    pub monitor_mmapped_files: bool,
}

impl ProcessConfig {
    pub fn new(pid: pid_t, flags: &MonitorFlags) -> Result<ProcessConfig, ConfigError> {
        let lib = flags.rd_page_lib.as_bytes();
        if lib.is_empty() || lib.contains(&b'/') {
            return Err(ConfigError::BadLibraryName(
                flags.rd_page_lib.to_string_lossy().into_owned(),
            ));
        }
        let reserved_page = ReservedPage::new(flags.rd_page_addr, flags.rd_page_size)?;
        log!(
            crate::log::LogDebug,
            "tracee {}: rd page reserved at {}",
            pid,
            reserved_page.range()
        );
        Ok(ProcessConfig {
            pid,
            reserved_page,
            rd_page_lib: flags.rd_page_lib.clone(),
            rd_page_lib_32: if flags.rd_page_lib == RD_PAGE_LIB_FILENAME {
                Some(OsString::from(RD_PAGE_LIB_FILENAME_32))
            } else {
                None
            },
            monitor_mmapped_files: !flags.no_mmapped_file_monitoring,
        })
    }

    pub fn is_rd_page_lib_name(&self, file_name: &[u8]) -> bool {
        file_name == self.rd_page_lib.as_bytes()
            || self
                .rd_page_lib_32
                .as_ref()
                .map_or(false, |lib| file_name == lib.as_bytes())
    }
}
