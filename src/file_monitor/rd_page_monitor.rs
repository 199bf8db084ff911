use crate::{
    address_space::{
        kernel_mapping::FileId, memory_range::MemoryRange, AddressSpace, Mapping, MappingFlags,
    },
    error::MonitorError,
    file_monitor::{
        FileMonitor, FileMonitorType, MappedRegion, MappingDirective, MappingRequest, OpenContext,
    },
    log::LogDebug,
    process_config::ReservedPage,
    util::{checked_ceil_page_size, file_name_bytes},
};
use std::{ffi::OsString, os::unix::ffi::OsStrExt, path::Path};

/// RdPageMonitor gets installed upon any open of the rd page preload library.
/// If this file gets mmapped, it is forced to the fixed reserved location for
/// the rd page so every recording and replay has the same layout.
pub struct RdPageMonitor {
    reserved: ReservedPage,
    path: Option<OsString>,
    file_id: Option<FileId>,
    completed_mappings: usize,
}

impl RdPageMonitor {
    pub fn new(reserved: ReservedPage) -> RdPageMonitor {
        RdPageMonitor {
            reserved,
            path: None,
            file_id: None,
            completed_mappings: 0,
        }
    }

    pub fn reserved_page(&self) -> &ReservedPage {
        &self.reserved
    }

    pub fn completed_mappings(&self) -> usize {
        self.completed_mappings
    }

    /// Remapping over an earlier mapping of the same library is fine, anything
    /// else in the way is not.
    fn is_previous_instance(&self, m: &Mapping) -> bool {
        if !m.is_rd_page() {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (self.file_id, m.map.file_id()) {
            return ours == theirs;
        }
        match &self.path {
            Some(path) => {
                file_name_bytes(Path::new(path)) == file_name_bytes(Path::new(m.map.fsname()))
            }
            None => true,
        }
    }
}

impl FileMonitor for RdPageMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::RdPage
    }

    fn as_rd_page_monitor(&self) -> Option<&RdPageMonitor> {
        Some(self)
    }

    fn on_open(&mut self, ctx: &OpenContext) {
        self.path = Some(ctx.path.as_os_str().to_owned());
        self.file_id = ctx.file_id;
    }

    /// The tracee's address hint is irrelevant; MAP_FIXED at the reserved
    /// address is the only acceptable placement.
    fn on_mapping_request(
        &mut self,
        req: &MappingRequest,
        vm: &AddressSpace,
    ) -> Result<MappingDirective, MonitorError> {
        let length = match checked_ceil_page_size(req.length) {
            Some(length) if length <= self.reserved.len() => length,
            _ => {
                return Err(MonitorError::ReservedRangeTooSmall {
                    range: self.reserved.range(),
                    length: req.length,
                })
            }
        };

        let target = MemoryRange::new_range(self.reserved.start(), length);
        if let Some(m) = vm.mappings_in(target).find(|m| !self.is_previous_instance(m)) {
            let name = m.map.fsname();
            return Err(MonitorError::ReservedRangeOccupied {
                range: self.reserved.range(),
                occupied: *m.map,
                occupant: if name.is_empty() {
                    "[anonymous]".to_owned()
                } else {
                    String::from_utf8_lossy(name.as_bytes()).into_owned()
                },
            });
        }

        log!(
            LogDebug,
            "rd page requested at {}, placing at {}",
            req.addr,
            self.reserved.start()
        );
        Ok(MappingDirective::OverrideAddress(self.reserved.start()))
    }

    fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::IS_RD_PAGE
    }

    fn on_mapping_completed(&mut self, region: &MappedRegion) {
        self.completed_mappings += 1;
        log!(LogDebug, "rd page mapped at {}", region.range);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        address_space::kernel_mapping::KernelMapping,
        remote_ptr::{RemotePtr, Void},
        util::page_size,
    };
    use nix::{
        fcntl::OFlag,
        sys::mman::{MapFlags, ProtFlags},
    };
    use std::ffi::OsStr;

    const LIB: &str = "/usr/lib/rd/librdpage.so";

    fn opened_monitor() -> RdPageMonitor {
        let mut m = RdPageMonitor::new(ReservedPage::default());
        m.on_open(&OpenContext {
            fd: 5,
            path: Path::new(LIB),
            flags: OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            file_id: None,
        });
        m
    }

    fn request(hint: usize, length: usize) -> MappingRequest {
        MappingRequest::new(
            hint.into(),
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE,
            0,
        )
    }

    fn mapping_at(start: RemotePtr<Void>, name: &str) -> KernelMapping {
        KernelMapping::new_with_opts(
            start,
            start + page_size(),
            OsStr::new(name),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
        )
    }

    #[test]
    fn hint_is_ignored() {
        let vm = AddressSpace::new();
        let mut m = opened_monitor();
        for hint in &[0usize, 0x1000, 0x7fff_0000_0000] {
            assert_eq!(
                m.on_mapping_request(&request(*hint, 4096), &vm),
                Ok(MappingDirective::OverrideAddress(
                    ReservedPage::default().start()
                ))
            );
        }
    }

    #[test]
    fn foreign_mapping_in_reserved_range_fails() {
        let reserved = ReservedPage::default();
        let mut vm = AddressSpace::new();
        vm.map(mapping_at(reserved.start(), "[heap]"), MappingFlags::empty());
        let mut m = opened_monitor();
        match m.on_mapping_request(&request(0x1000, 4096), &vm) {
            Err(MonitorError::ReservedRangeOccupied { occupant, .. }) => {
                assert_eq!(occupant, "[heap]")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn anonymous_occupant_is_named() {
        let reserved = ReservedPage::default();
        let mut vm = AddressSpace::new();
        vm.map(mapping_at(reserved.start(), ""), MappingFlags::empty());
        let mut m = opened_monitor();
        let err = m.on_mapping_request(&request(0, 4096), &vm).unwrap_err();
        assert!(err.to_string().contains("[anonymous]"));
    }

    #[test]
    fn remapping_previous_instance_is_allowed() {
        let reserved = ReservedPage::default();
        let mut vm = AddressSpace::new();
        vm.map(mapping_at(reserved.start(), LIB), MappingFlags::IS_RD_PAGE);
        let mut m = opened_monitor();
        assert!(m.on_mapping_request(&request(0, 4096), &vm).is_ok());
    }

    #[test]
    fn rd_page_of_another_file_is_foreign() {
        let reserved = ReservedPage::default();
        let mut vm = AddressSpace::new();
        vm.map(
            mapping_at(reserved.start(), "/tmp/other.so"),
            MappingFlags::IS_RD_PAGE,
        );
        let mut m = opened_monitor();
        assert!(m.on_mapping_request(&request(0, 4096), &vm).is_err());
    }

    #[test]
    fn oversized_request_fails() {
        let vm = AddressSpace::new();
        let mut m = opened_monitor();
        let too_big = ReservedPage::default().len() + 1;
        assert_eq!(
            m.on_mapping_request(&request(0, too_big), &vm),
            Err(MonitorError::ReservedRangeTooSmall {
                range: ReservedPage::default().range(),
                length: too_big,
            })
        );
    }

    #[test]
    fn length_near_usize_max_does_not_fit() {
        let vm = AddressSpace::new();
        let mut m = opened_monitor();
        for length in &[usize::MAX, usize::MAX - 10] {
            assert_eq!(
                m.on_mapping_request(&request(0x1000, *length), &vm),
                Err(MonitorError::ReservedRangeTooSmall {
                    range: ReservedPage::default().range(),
                    length: *length,
                })
            );
        }
    }

    #[test]
    fn mapping_next_to_reservation_is_not_in_the_way() {
        let reserved = ReservedPage::default();
        let mut vm = AddressSpace::new();
        vm.map(
            mapping_at(reserved.start() + reserved.len(), "[heap]"),
            MappingFlags::empty(),
        );
        let mut m = opened_monitor();
        assert!(m.on_mapping_request(&request(0, 4096), &vm).is_ok());
    }
}
