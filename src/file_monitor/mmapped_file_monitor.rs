use crate::{
    address_space::{kernel_mapping::FileId, memory_range::MemoryRange},
    file_monitor::{FileMonitor, FileMonitorType, IoContext, MappedRegion, Switchable},
    log::LogWarn,
};
use std::{
    cmp::{max, min},
    mem,
};

/// A FileMonitor to track writes to files that are mmapped in so they can be
/// replayed.
pub struct MmappedFileMonitor {
    /// Whether this monitor is still actively monitoring
    dead: bool,
    file: FileId,
    affected: Vec<MemoryRange>,
}

impl MmappedFileMonitor {
    pub fn new(file: FileId) -> MmappedFileMonitor {
        MmappedFileMonitor {
            dead: false,
            file,
            affected: Vec::new(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Mapped memory changed by writes to the file since the last call.
    pub fn take_affected_ranges(&mut self) -> Vec<MemoryRange> {
        mem::take(&mut self.affected)
    }
}

impl FileMonitor for MmappedFileMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Mmapped
    }

    fn as_mmapped_file_monitor(&self) -> Option<&MmappedFileMonitor> {
        Some(self)
    }

    fn as_mmapped_file_monitor_mut(&mut self) -> Option<&mut MmappedFileMonitor> {
        Some(self)
    }

    fn will_write(&self, _ctx: &IoContext) -> Switchable {
        if self.dead {
            Switchable::AllowSwitch
        } else {
            Switchable::PreventSwitch
        }
    }

    fn on_mapping_completed(&mut self, region: &MappedRegion) {
        if region.flags.contains(nix::sys::mman::MapFlags::MAP_SHARED) {
            self.dead = false;
        }
    }

    fn on_write(&mut self, ctx: &IoContext) {
        // If there are no remaining mappings that we care about, those can't reappear
        // without going through mmap again, at which point this will be reset to
        // false.
        if self.dead || ctx.ranges.is_empty() {
            return;
        }

        // Dead until proven otherwise
        self.dead = true;
        for m in ctx.vm.iter() {
            let km = &m.map;
            if km.file_id() != Some(self.file) {
                continue;
            }
            // If the mapping is MAP_PRIVATE then this write is dangerous
            // because it's unpredictable what will be seen in the mapping.
            // However, it could be OK if the application doesn't read from
            // this part of the mapping. Just optimistically assume this mapping
            // is not affected.
            if !km.is_shared() {
                log!(LogWarn, "MAP_PRIVATE mapping affected by write");
                continue;
            }
            self.dead = false;

            let mut local_offset = match ctx.offset {
                Some(offset) => offset,
                None => {
                    log!(LogWarn, "Write to mmapped fd {} with unknown offset", ctx.fd);
                    return;
                }
            };
            let mapping_start = km.file_offset_bytes();
            let mapping_end = mapping_start + km.len() as u64;
            for r in ctx.ranges {
                let write_end = local_offset + r.length as u64;
                let file_start = max(local_offset, mapping_start);
                let file_end = min(write_end, mapping_end);
                if file_start < file_end {
                    let addr = km.start() + (file_start - mapping_start) as usize;
                    self.affected
                        .push(MemoryRange::new_range(addr, (file_end - file_start) as usize));
                }
                local_offset = write_end;
            }
        }
    }
}
