use crate::{
    address_space::{kernel_mapping::FileId, memory_range::MemoryRange, AddressSpace, MappingFlags},
    error::MonitorError,
    remote_ptr::{RemotePtr, Void},
};
use mmapped_file_monitor::MmappedFileMonitor;
use nix::{
    fcntl::OFlag,
    sys::mman::{MapFlags, ProtFlags},
};
use proc_mem_monitor::ProcMemMonitor;
use rd_page_monitor::RdPageMonitor;
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    fmt::{self, Display, Formatter},
    path::Path,
    rc::Rc,
};

pub mod base_file_monitor;
pub mod mmapped_file_monitor;
pub mod preserve_file_monitor;
pub mod proc_mem_monitor;
pub mod rd_page_monitor;
pub mod stdio_monitor;

/// Monitors are shared by every descriptor that refers to the same open file
/// description, i.e. dup()ed descriptors alias the same monitor.
pub type FileMonitorSharedPtr = Rc<RefCell<Box<dyn FileMonitor>>>;

pub fn new_shared(monitor: impl FileMonitor + 'static) -> FileMonitorSharedPtr {
    Rc::new(RefCell::new(Box::new(monitor)))
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum FileMonitorType {
    Base,
    Mmapped,
    Preserve,
    ProcMem,
    RdPage,
    Stdio,
}

impl Display for FileMonitorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileMonitorType::Base => "Base",
            FileMonitorType::Mmapped => "Mmapped",
            FileMonitorType::Preserve => "Preserve",
            FileMonitorType::ProcMem => "ProcMem",
            FileMonitorType::RdPage => "RdPage",
            FileMonitorType::Stdio => "Stdio",
        };
        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switchable {
    PreventSwitch,
    AllowSwitch,
}

/// A chunk of tracee memory that was read into or written from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Range {
    pub data: RemotePtr<Void>,
    pub length: usize,
}

impl Range {
    pub fn new(data: RemotePtr<Void>, length: usize) -> Range {
        Range { data, length }
    }
}

pub struct OpenContext<'a> {
    pub fd: i32,
    pub path: &'a Path,
    pub flags: OFlag,
    /// From fstat() on the new descriptor, when the interception layer has it.
    pub file_id: Option<FileId>,
}

/// The tracee's mmap arguments.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MappingRequest {
    pub addr: RemotePtr<Void>,
    pub length: usize,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    pub offset: u64,
}

impl MappingRequest {
    pub fn new(
        addr: RemotePtr<Void>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> MappingRequest {
        MappingRequest {
            addr,
            length,
            prot,
            flags,
            offset,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.flags.contains(MapFlags::MAP_FIXED)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MappingDirective {
    NoChange,
    /// Map exactly here (MAP_FIXED) or not at all.
    OverrideAddress(RemotePtr<Void>),
}

/// Where the kernel actually put a mapping.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MappedRegion {
    pub range: MemoryRange,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    pub offset: u64,
}

pub struct IoContext<'a> {
    pub fd: i32,
    pub ranges: &'a [Range],
    /// File offset of the transfer. None when it isn't known (e.g. implicit
    /// offset without a recording to look it up in).
    pub offset: Option<u64>,
    pub vm: &'a AddressSpace,
}

pub struct CloseContext<'a> {
    pub fd: i32,
    pub path: &'a Path,
}

/// Every hook is a no-op by default; variants override only what their
/// policy needs.
pub trait FileMonitor {
    /// You have to provide a type if you implement this trait
    fn file_monitor_type(&self) -> FileMonitorType;

    fn as_rd_page_monitor(&self) -> Option<&RdPageMonitor> {
        None
    }

    fn as_mmapped_file_monitor(&self) -> Option<&MmappedFileMonitor> {
        None
    }

    fn as_mmapped_file_monitor_mut(&mut self) -> Option<&mut MmappedFileMonitor> {
        None
    }

    fn as_proc_mem_monitor_mut(&mut self) -> Option<&mut ProcMemMonitor> {
        None
    }

    /// Overriding this to return true will cause close() (and related
    /// fd-smashing operations such as dup2) to fail with EBADF.
    fn is_rd_fd(&self) -> bool {
        false
    }

    fn on_open(&mut self, _ctx: &OpenContext) {}

    /// Called before the kernel sees the mmap. An `Err` fails the syscall.
    fn on_mapping_request(
        &mut self,
        _req: &MappingRequest,
        _vm: &AddressSpace,
    ) -> Result<MappingDirective, MonitorError> {
        Ok(MappingDirective::NoChange)
    }

    /// Flags to record on mappings of this descriptor.
    fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::empty()
    }

    fn on_mapping_completed(&mut self, _region: &MappedRegion) {}

    /// Notification that the tracee is about to write to the file.
    /// In general writes can block, and concurrent blocking writes to the same
    /// file may race so that the kernel performs writes out of order
    /// with respect to will_write notifications.
    /// If it is known that the write cannot block (or that blocking all of rd
    /// on it is OK), this notification can return PreventSwitch to make the
    /// write a blocking write.
    fn will_write(&self, _ctx: &IoContext) -> Switchable {
        Switchable::AllowSwitch
    }

    fn on_read(&mut self, _ctx: &IoContext) {}

    /// Due to races, if will_write did not return PreventSwitch, the data in
    /// the buffers may not be what was actually written.
    fn on_write(&mut self, _ctx: &IoContext) {}

    fn on_close(&mut self, _ctx: &CloseContext) {}
}

#[cfg(test)]
mod test {
    use super::{base_file_monitor::BaseFileMonitor, *};

    #[test]
    fn default_hooks_do_nothing() {
        let vm = AddressSpace::new();
        let mut m = BaseFileMonitor::new();
        let req = MappingRequest::new(
            0x1000usize.into(),
            4096,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
        );
        assert_eq!(m.on_mapping_request(&req, &vm), Ok(MappingDirective::NoChange));
        let ctx = IoContext {
            fd: 3,
            ranges: &[],
            offset: None,
            vm: &vm,
        };
        assert_eq!(m.will_write(&ctx), Switchable::AllowSwitch);
        assert!(!m.is_rd_fd());
        assert!(m.mapping_flags().is_empty());
        assert!(m.as_rd_page_monitor().is_none());
    }

    #[test]
    fn type_serializes_by_name() {
        let json = serde_json::to_string(&FileMonitorType::RdPage).unwrap();
        assert_eq!(json, "\"RdPage\"");
        assert_eq!(FileMonitorType::ProcMem.to_string(), "ProcMem");
    }
}
