use nix::unistd::{sysconf, SysconfVar::PAGE_SIZE};
use std::{
    convert::TryInto,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Component, Path},
};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

fn page_size_init() -> usize {
    match sysconf(PAGE_SIZE) {
        Ok(Some(sz)) => sz.try_into().unwrap_or(4096),
        _ => {
            log!(crate::log::LogWarn, "sysconf(PAGE_SIZE) failed, assuming 4096");
            4096
        }
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

/// Only for sizes known to be sane. Anything the tracee controls goes
/// through `checked_ceil_page_size`.
pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

/// None if rounding up would wrap past the end of the address space.
pub fn checked_ceil_page_size(size: usize) -> Option<usize> {
    size.checked_add(page_size() - 1)
        .map(|sz| sz & !(page_size() - 1))
}

pub fn is_page_aligned(addr: usize) -> bool {
    addr & (page_size() - 1) == 0
}

/// The final path component as raw bytes, if there is one.
pub fn file_name_bytes(path: &Path) -> Option<&[u8]> {
    path.file_name().map(|name| name.as_bytes())
}

/// Matches exactly `/proc/<number>/<leaf>` and returns `<number>`.
pub fn parse_proc_path(path: &Path, leaf: &str) -> Option<i32> {
    let mut components = path.components();
    let rootdir = components.next();
    let proc_dir = components.next();
    let tid_component = components.next();
    let leaf_component = components.next();
    if components.next().is_some() {
        return None;
    }
    if (rootdir, proc_dir, leaf_component)
        != (
            Some(Component::RootDir),
            Some(Component::Normal(OsStr::new("proc"))),
            Some(Component::Normal(OsStr::new(leaf))),
        )
    {
        return None;
    }
    match tid_component {
        Some(Component::Normal(tid_os_str)) => {
            String::from_utf8_lossy(tid_os_str.as_bytes()).parse().ok()
        }
        _ => None,
    }
}
