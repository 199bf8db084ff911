use super::memory_range::MemoryRange;
use crate::{
    remote_ptr::{RemotePtr, Void},
    util::page_size,
};
use libc::{
    dev_t, ino_t, MAP_ANONYMOUS, MAP_GROWSDOWN, MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MAP_STACK,
};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::{major, minor},
};
use std::{
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result},
    ops::Deref,
};

/// Identity of a mapped file as reported by fstat().
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FileId {
    pub device: dev_t,
    pub inode: ino_t,
}

/// One mapping as the kernel sees it, i.e. one line of /proc/<pid>/maps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelMapping {
    mr: MemoryRange,
    /// The kernel's name for the mapping, as per /proc/<pid>/maps. This must
    /// be exactly correct.
    fsname_: OsString,
    /// btrfs can show a different device number in /proc/.../maps than
    /// fstat() does. We store the fstat() one when we have it.
    device_: dev_t,
    inode_: ino_t,
    prot_: ProtFlags,
    flags_: MapFlags,
    offset: u64,
}

impl KernelMapping {
    pub const NO_DEVICE: dev_t = 0;
    pub const NO_INODE: ino_t = 0;

    /// These are the flags we track internally to distinguish
    /// between adjacent segments.  For example, the kernel
    /// considers a NORESERVE anonymous mapping that's adjacent to
    /// a non-NORESERVE mapping distinct, even if all other
    /// metadata are the same.
    pub const MAP_FLAGS_MASK: MapFlags = MapFlags::from_bits_truncate(
        MAP_ANONYMOUS | MAP_NORESERVE | MAP_PRIVATE | MAP_SHARED | MAP_STACK | MAP_GROWSDOWN,
    );

    pub fn new_with_opts(
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        fsname: &OsStr,
        device: dev_t,
        inode: ino_t,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> KernelMapping {
        let result = KernelMapping {
            device_: device,
            inode_: inode,
            prot_: prot,
            flags_: flags & Self::MAP_FLAGS_MASK,
            offset,
            fsname_: fsname.into(),
            mr: MemoryRange::from_range(start, end),
        };
        result.assert_valid();
        result
    }

    pub fn assert_valid(&self) {
        debug_assert!(self.end() >= self.start());
        debug_assert_eq!(self.len() % page_size(), 0);
        debug_assert!((self.flags_ & !KernelMapping::MAP_FLAGS_MASK).is_empty());
    }

    /// The part of this mapping covering [start, end), with the file offset
    /// advanced to match.
    pub fn subrange(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> KernelMapping {
        debug_assert!(start >= self.start() && end <= self.end());
        let delta: u64 = if self.is_real_device() || !self.is_anonymous() {
            (start - self.start()) as u64
        } else {
            0
        };
        KernelMapping::new_with_opts(
            start,
            end,
            &self.fsname_,
            self.device_,
            self.inode_,
            self.prot_,
            self.flags_,
            self.offset + delta,
        )
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname_
    }

    pub fn device(&self) -> dev_t {
        self.device_
    }

    pub fn inode(&self) -> ino_t {
        self.inode_
    }

    pub fn file_id(&self) -> Option<FileId> {
        if self.inode_ == Self::NO_INODE {
            None
        } else {
            Some(FileId {
                device: self.device_,
                inode: self.inode_,
            })
        }
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot_
    }

    pub fn flags(&self) -> MapFlags {
        self.flags_
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags_.contains(MapFlags::MAP_ANONYMOUS)
    }

    pub fn is_shared(&self) -> bool {
        self.flags_.contains(MapFlags::MAP_SHARED)
    }

    /// Return true if this file is/was backed by an external
    /// device, as opposed to a transient RAM mapping.
    pub fn is_real_device(&self) -> bool {
        self.device() > Self::NO_DEVICE
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(if self.prot_.contains(ProtFlags::PROT_READ) {
            'r'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_WRITE) {
            'w'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_EXEC) {
            'x'
        } else {
            '-'
        });
        s
    }
}

impl Deref for KernelMapping {
    type Target = MemoryRange;
    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

/// A representation similar to a line of /proc/[tid]/maps.
impl Display for KernelMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let map_shared = if self.is_shared() { 's' } else { 'p' };
        write!(
            f,
            "{:08x}-{:08x} {}{} {:08x} {:02x}:{:02x} {:<10} {}",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot_string(),
            map_shared,
            self.offset,
            major(self.device()),
            minor(self.device()),
            self.inode(),
            self.fsname_.to_string_lossy()
        )
    }
}
