pub mod kernel_map_iterator;
pub mod kernel_mapping;
pub mod memory_range;

use crate::{
    process_config::ReservedPage,
    remote_ptr::{RemotePtr, Void},
};
use kernel_mapping::KernelMapping;
use memory_range::MemoryRange;
use std::{collections::BTreeMap, io, ops::Bound::Excluded};

bitflags! {
    pub struct MappingFlags: u32 {
        /// This mapping was placed under an rd page directive.
        const IS_RD_PAGE = 0x1;
        /// The descriptor this mapping came from carried at least one monitor.
        const IS_MONITORED = 0x2;
    }
}

#[derive(Clone, Debug)]
pub struct Mapping {
    pub map: KernelMapping,
    pub flags: MappingFlags,
}

impl Mapping {
    pub fn new(map: KernelMapping, flags: MappingFlags) -> Mapping {
        Mapping { map, flags }
    }

    pub fn is_rd_page(&self) -> bool {
        self.flags.contains(MappingFlags::IS_RD_PAGE)
    }
}

/// Our record of one tracee's memory mappings. Mappings never overlap.
#[derive(Default)]
pub struct AddressSpace {
    /// Keyed by start address.
    mem: BTreeMap<RemotePtr<Void>, Mapping>,
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace::default()
    }

    /// Record a new mapping. Like MAP_FIXED, anything already mapped in the
    /// same range is replaced.
    pub fn map(&mut self, map: KernelMapping, flags: MappingFlags) {
        if map.is_empty() {
            return;
        }
        self.unmap(*map);
        log!(crate::log::LogDebug, "map {} {:?}", map, flags);
        self.mem.insert(map.start(), Mapping::new(map, flags));
    }

    /// Remove [range.start, range.end) splitting mappings that straddle
    /// either boundary.
    pub fn unmap(&mut self, range: MemoryRange) {
        let overlapping: Vec<RemotePtr<Void>> = self
            .mappings_in(range)
            .map(|m| m.map.start())
            .collect();
        for start in overlapping {
            let m = match self.mem.remove(&start) {
                Some(m) => m,
                None => continue,
            };
            if m.map.start() < range.start() {
                let left = m.map.subrange(m.map.start(), range.start());
                self.mem.insert(left.start(), Mapping::new(left, m.flags));
            }
            if range.end() < m.map.end() {
                let right = m.map.subrange(range.end(), m.map.end());
                self.mem.insert(right.start(), Mapping::new(right, m.flags));
            }
        }
    }

    /// All mappings that intersect `range`, in address order.
    pub fn mappings_in(&self, range: MemoryRange) -> impl Iterator<Item = &Mapping> {
        // At most one mapping starting before range.start can reach into it.
        let before = self
            .mem
            .range(..range.start())
            .next_back()
            .map(|(_, m)| m)
            .filter(move |m| m.map.intersects(&range));
        let inside = self
            .mem
            .range((
                std::ops::Bound::Included(range.start()),
                Excluded(range.end()),
            ))
            .map(|(_, m)| m);
        before.into_iter().chain(inside)
    }

    /// The mapping containing the byte at `addr`.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<&Mapping> {
        self.mem
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.map.contains_ptr(addr))
    }

    /// Return true if the rd page is mapped at its expected address.
    pub fn has_rd_page(&self, reserved: &ReservedPage) -> bool {
        self.mapping_of(reserved.start())
            .map_or(false, |m| m.is_rd_page())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mem.values()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn clear(&mut self) {
        self.mem.clear();
    }

    /// Replace our view with what the kernel reports, e.g. after an exec.
    /// Pre-existing file mappings of `rd_page_name` at the reserved address
    /// are recognized as the rd page.
    pub fn populate<I>(&mut self, maps: I, reserved: &ReservedPage, rd_page_name: &[u8]) -> io::Result<()>
    where
        I: IntoIterator<Item = io::Result<KernelMapping>>,
    {
        self.clear();
        for km in maps {
            let km = km?;
            let mut flags = MappingFlags::empty();
            if reserved.range().contains(&km)
                && crate::util::file_name_bytes(std::path::Path::new(km.fsname()))
                    == Some(rd_page_name)
            {
                flags |= MappingFlags::IS_RD_PAGE;
            }
            self.map(km, flags);
        }
        Ok(())
    }
}
