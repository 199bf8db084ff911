use crate::file_monitor::{FileMonitor, FileMonitorType, IoContext, Switchable};

/// A FileMonitor to track writes to rd's stdout/stderr fds.
pub struct StdioMonitor {
    original_fd: i32,
}

impl StdioMonitor {
    pub fn new(original_fd: i32) -> StdioMonitor {
        StdioMonitor { original_fd }
    }

    pub fn original_fd(&self) -> i32 {
        self.original_fd
    }
}

impl FileMonitor for StdioMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Stdio
    }

    /// Make writes to stdout/stderr blocking, to avoid nondeterminism in the
    /// order in which the kernel actually performs such writes.
    /// This theoretically introduces the possibility of deadlock between rd's
    /// tracee and some external program reading rd's output
    /// via a pipe ... but that seems unlikely to bite in practice.
    fn will_write(&self, _ctx: &IoContext) -> Switchable {
        Switchable::PreventSwitch
    }
}
