use crate::{
    address_space::kernel_mapping::FileId,
    file_monitor::{FileMonitorSharedPtr, FileMonitorType},
    log::{LogDebug, LogWarn},
};
use libc::pid_t;
use nix::fcntl::OFlag;
use serde::Serialize;
use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
};

/// What we know about one open descriptor of the tracee.
pub struct FdEntry {
    path: OsString,
    flags: OFlag,
    file_id: Option<FileId>,
    /// Bumped every time the fd number gets a new entry, so a stale
    /// reference to a closed or reused fd can be told apart from a live one.
    generation: u64,
    /// In attachment order, which is also dispatch order.
    monitors: Vec<FileMonitorSharedPtr>,
}

impl FdEntry {
    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }

    pub fn flags(&self) -> OFlag {
        self.flags
    }

    pub fn file_id(&self) -> Option<FileId> {
        self.file_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn monitors(&self) -> &[FileMonitorSharedPtr] {
        &self.monitors
    }
}

/// Per-descriptor summary for consumers that do not know about concrete
/// monitor variants, e.g. the session log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FdDescription {
    pub fd: i32,
    pub path: PathBuf,
    pub monitors: Vec<FileMonitorType>,
}

/// The descriptor table of one tracee process. Monitors attached here are
/// owned by the table; nothing else keeps them once they are detached.
pub struct FdTable {
    pid: pid_t,
    fds: HashMap<i32, FdEntry>,
    next_generation: u64,
}

impl FdTable {
    pub fn new(pid: pid_t) -> FdTable {
        FdTable {
            pid,
            fds: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    fn new_entry(&mut self, path: OsString, flags: OFlag, file_id: Option<FileId>) -> FdEntry {
        let generation = self.next_generation;
        self.next_generation += 1;
        FdEntry {
            path,
            flags,
            file_id,
            generation,
            monitors: Vec::new(),
        }
    }

    /// Start tracking `fd`. A still-tracked entry for the same number means we
    /// missed its close; its monitors are dropped.
    pub fn did_open(&mut self, fd: i32, path: &Path, flags: OFlag, file_id: Option<FileId>) {
        let entry = self.new_entry(path.as_os_str().to_owned(), flags, file_id);
        if let Some(old) = self.fds.insert(fd, entry) {
            log!(
                LogWarn,
                "tracee {}: fd {} reopened as {:?} while still tracked as {:?}",
                self.pid,
                fd,
                path,
                old.path()
            );
        }
    }

    pub fn is_open(&self, fd: i32) -> bool {
        self.fds.contains_key(&fd)
    }

    pub fn entry(&self, fd: i32) -> Option<&FdEntry> {
        self.fds.get(&fd)
    }

    pub fn generation(&self, fd: i32) -> Option<u64> {
        self.fds.get(&fd).map(|e| e.generation)
    }

    pub fn attach(&mut self, fd: i32, monitor: FileMonitorSharedPtr) {
        let pid = self.pid;
        let monitor_type = monitor.borrow().file_monitor_type();
        match self.fds.get_mut(&fd) {
            Some(entry) => {
                log!(
                    LogDebug,
                    "tracee {}: attaching {} monitor to fd {}",
                    pid,
                    monitor_type,
                    fd
                );
                entry.monitors.push(monitor);
            }
            None => {
                tracee_assert!(
                    pid,
                    false,
                    "Attaching {} monitor to fd {} which is not open",
                    monitor_type,
                    fd
                );
            }
        }
    }

    /// Empty for unmonitored (or unknown) descriptors.
    pub fn lookup(&self, fd: i32) -> &[FileMonitorSharedPtr] {
        match self.fds.get(&fd) {
            Some(entry) => &entry.monitors,
            None => &[],
        }
    }

    pub fn has_monitor(&self, fd: i32, monitor_type: FileMonitorType) -> bool {
        self.lookup(fd)
            .iter()
            .any(|m| m.borrow().file_monitor_type() == monitor_type)
    }

    pub fn is_rd_fd(&self, fd: i32) -> bool {
        self.lookup(fd).iter().any(|m| m.borrow().is_rd_fd())
    }

    /// Forget `fd` and everything attached to it. Returns the entry so the
    /// caller can run close hooks; it is dropped right after.
    pub fn detach_all(&mut self, fd: i32) -> Option<FdEntry> {
        let removed = self.fds.remove(&fd);
        if removed.is_some() {
            log!(LogDebug, "tracee {}: fd {} detached", self.pid, fd);
        }
        removed
    }

    /// `new_fd` now refers to the same open file description as `old_fd`.
    /// Monitors are shared, not copied. Whatever was at `new_fd` before is
    /// returned for the caller to close.
    pub fn duplicate(&mut self, old_fd: i32, new_fd: i32, cloexec: bool) -> Option<FdEntry> {
        if old_fd == new_fd {
            return None;
        }
        let (path, flags, file_id, monitors) = match self.fds.get(&old_fd) {
            Some(old) => (old.path.clone(), old.flags, old.file_id, old.monitors.clone()),
            None => {
                tracee_assert!(
                    self.pid,
                    false,
                    "Duplicating fd {} which is not open",
                    old_fd
                );
                unreachable!()
            }
        };
        // Descriptor flags are not shared between duplicates.
        let mut flags = flags - OFlag::O_CLOEXEC;
        if cloexec {
            flags |= OFlag::O_CLOEXEC;
        }
        let mut entry = self.new_entry(path, flags, file_id);
        entry.monitors = monitors;
        self.fds.insert(new_fd, entry)
    }

    /// Descriptors that an exec will close, lowest first.
    pub fn cloexec_fds(&self) -> Vec<i32> {
        let mut fds: Vec<i32> = self
            .fds
            .iter()
            .filter(|(_, e)| e.flags.contains(OFlag::O_CLOEXEC))
            .map(|(fd, _)| *fd)
            .collect();
        fds.sort_unstable();
        fds
    }

    pub fn describe(&self) -> Vec<FdDescription> {
        let mut result: Vec<FdDescription> = self
            .fds
            .iter()
            .map(|(fd, e)| FdDescription {
                fd: *fd,
                path: e.path().to_owned(),
                monitors: e
                    .monitors
                    .iter()
                    .map(|m| m.borrow().file_monitor_type())
                    .collect(),
            })
            .collect();
        result.sort_by_key(|d| d.fd);
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_monitor::{
        base_file_monitor::BaseFileMonitor, new_shared, preserve_file_monitor::PreserveFileMonitor,
    };
    use std::rc::Rc;

    fn table_with_open(fds: &[i32]) -> FdTable {
        let mut table = FdTable::new(1000);
        for fd in fds {
            table.did_open(*fd, Path::new("/tmp/f"), OFlag::O_RDWR, None);
        }
        table
    }

    #[test]
    fn lookup_of_unmonitored_is_empty() {
        let table = table_with_open(&[3]);
        assert!(table.lookup(3).is_empty());
        assert!(table.lookup(42).is_empty());
    }

    #[test]
    fn attach_keeps_order() {
        let mut table = table_with_open(&[3]);
        table.attach(3, new_shared(BaseFileMonitor::new()));
        table.attach(3, new_shared(PreserveFileMonitor::new()));
        let types: Vec<FileMonitorType> = table
            .lookup(3)
            .iter()
            .map(|m| m.borrow().file_monitor_type())
            .collect();
        assert_eq!(types, vec![FileMonitorType::Base, FileMonitorType::Preserve]);
        assert!(table.is_rd_fd(3));
    }

    #[test]
    #[should_panic(expected = "which is not open")]
    fn attach_to_closed_fd_is_fatal() {
        let mut table = table_with_open(&[3]);
        table.attach(4, new_shared(BaseFileMonitor::new()));
    }

    #[test]
    fn detach_all_forgets_monitors() {
        let mut table = table_with_open(&[3]);
        let monitor = new_shared(BaseFileMonitor::new());
        table.attach(3, monitor.clone());
        assert_eq!(Rc::strong_count(&monitor), 2);
        drop(table.detach_all(3));
        assert!(!table.is_open(3));
        assert!(table.lookup(3).is_empty());
        assert_eq!(Rc::strong_count(&monitor), 1);
    }

    #[test]
    fn duplicate_shares_monitors() {
        let mut table = table_with_open(&[3]);
        table.attach(3, new_shared(BaseFileMonitor::new()));
        assert!(table.duplicate(3, 10, true).is_none());
        assert!(Rc::ptr_eq(&table.lookup(3)[0], &table.lookup(10)[0]));
        assert_ne!(table.generation(3), table.generation(10));
        assert_eq!(table.cloexec_fds(), vec![10]);

        // Closing the original leaves the duplicate monitored.
        drop(table.detach_all(3));
        assert_eq!(table.lookup(10).len(), 1);
    }

    #[test]
    fn duplicate_onto_open_fd_returns_old_entry() {
        let mut table = table_with_open(&[3, 4]);
        table.attach(4, new_shared(PreserveFileMonitor::new()));
        let old = table.duplicate(3, 4, false).unwrap();
        assert_eq!(old.monitors().len(), 1);
        assert!(table.lookup(4).is_empty());
    }

    #[test]
    fn reopen_gets_new_generation() {
        let mut table = table_with_open(&[3]);
        let first = table.generation(3).unwrap();
        table.did_open(3, Path::new("/tmp/g"), OFlag::O_RDONLY, None);
        assert!(table.generation(3).unwrap() > first);
        assert_eq!(table.entry(3).unwrap().path(), Path::new("/tmp/g"));
    }

    #[test]
    fn describe_lists_monitor_types() {
        let mut table = table_with_open(&[5, 3]);
        table.attach(5, new_shared(PreserveFileMonitor::new()));
        let json = serde_json::to_value(table.describe()).unwrap();
        assert_eq!(json[0]["fd"], 3);
        assert_eq!(json[1]["monitors"][0], "Preserve");
    }
}
