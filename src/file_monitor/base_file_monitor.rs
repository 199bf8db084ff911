use super::{FileMonitor, FileMonitorType};

/// Marks a descriptor as monitored without applying any policy to it.
pub struct BaseFileMonitor;

impl FileMonitor for BaseFileMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Base
    }
}

impl BaseFileMonitor {
    pub fn new() -> BaseFileMonitor {
        BaseFileMonitor
    }
}
