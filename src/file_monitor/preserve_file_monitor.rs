use crate::file_monitor::{FileMonitor, FileMonitorType};

/// A FileMonitor that does no monitoring of I/O itself, but prevents the file
/// descriptor from being closed or replaced by the tracee.
///
/// The dispatcher checks `is_rd_fd()` before close() and dup2()-style
/// syscalls and fails them with EBADF.
pub struct PreserveFileMonitor;

impl FileMonitor for PreserveFileMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Preserve
    }

    fn is_rd_fd(&self) -> bool {
        true
    }
}

impl PreserveFileMonitor {
    pub fn new() -> PreserveFileMonitor {
        PreserveFileMonitor
    }
}
