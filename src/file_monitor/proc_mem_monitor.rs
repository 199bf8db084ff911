use crate::{
    address_space::memory_range::MemoryRange,
    file_monitor::{FileMonitor, FileMonitorType, IoContext, Switchable},
    log::LogWarn,
    util::parse_proc_path,
};
use libc::pid_t;
use std::{mem, path::Path};

/// Watches writes through /proc/<tid>/mem. Such writes change another
/// task's memory behind the kernel's back, so the written ranges have to be
/// recorded.
pub struct ProcMemMonitor {
    /// None if the path did not name a specific task
    target_tid: Option<pid_t>,
    written: Vec<MemoryRange>,
}

impl ProcMemMonitor {
    pub fn new(pathname: &Path) -> ProcMemMonitor {
        ProcMemMonitor {
            target_tid: parse_proc_path(pathname, "mem"),
            written: Vec::new(),
        }
    }

    pub fn target_tid(&self) -> Option<pid_t> {
        self.target_tid
    }

    /// Ranges of the target's memory written since the last call.
    pub fn take_written_ranges(&mut self) -> Vec<MemoryRange> {
        mem::take(&mut self.written)
    }
}

impl FileMonitor for ProcMemMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::ProcMem
    }

    fn as_proc_mem_monitor_mut(&mut self) -> Option<&mut ProcMemMonitor> {
        Some(self)
    }

    /// We need to PreventSwitch, since the timing of the write is otherwise
    /// unpredictable from our perspective.
    fn will_write(&self, _ctx: &IoContext) -> Switchable {
        Switchable::PreventSwitch
    }

    fn on_write(&mut self, ctx: &IoContext) {
        if self.target_tid.is_none() || ctx.ranges.is_empty() {
            return;
        }
        // For /proc/<tid>/mem the file offset is the target address.
        let mut offset = match ctx.offset {
            Some(offset) => offset as usize,
            None => {
                log!(LogWarn, "Write to /proc/<tid>/mem fd {} with unknown offset", ctx.fd);
                return;
            }
        };
        for r in ctx.ranges {
            self.written
                .push(MemoryRange::new_range(offset.into(), r.length));
            offset += r.length;
        }
    }
}
