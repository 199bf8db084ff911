//! The entry points the syscall interception layer calls around every
//! descriptor-scoped syscall of one tracee.
//!
//! Calls for a tracee are strictly serialized: `notify()` before the syscall
//! runs, then `notify_complete()` once its result is known. Between the two
//! there is exactly one pending operation.

use crate::{
    address_space::{
        kernel_map_iterator::KernelMapIterator,
        kernel_mapping::{FileId, KernelMapping},
        memory_range::MemoryRange,
        AddressSpace, MappingFlags,
    },
    error::{ConfigError, MonitorError},
    fd_table::{FdDescription, FdEntry, FdTable},
    file_monitor::{
        mmapped_file_monitor::MmappedFileMonitor, new_shared, proc_mem_monitor::ProcMemMonitor,
        rd_page_monitor::RdPageMonitor, CloseContext, FileMonitorSharedPtr, FileMonitorType,
        IoContext, MappedRegion, MappingDirective, MappingRequest, OpenContext, Range, Switchable,
    },
    flags::MonitorFlags,
    log::{LogDebug, LogWarn},
    process_config::ProcessConfig,
    remote_ptr::{RemotePtr, Void},
    util::{ceil_page_size, checked_ceil_page_size, file_name_bytes, parse_proc_path},
};
use libc::pid_t;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::mman::MapFlags,
};
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    io,
    os::unix::ffi::OsStrExt,
    path::Path,
};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum OperationKind {
    Open,
    Mmap,
    Read,
    Write,
    Close,
    Dup,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Open => "open",
            OperationKind::Mmap => "mmap",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Close => "close",
            OperationKind::Dup => "dup",
        };
        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DupContext {
    /// The requested target for dup2()/dup3(), None for dup().
    pub new_fd: Option<i32>,
    pub cloexec: bool,
}

/// A descriptor-scoped syscall together with the parameters monitors care
/// about.
#[derive(Copy, Clone, Debug)]
pub enum FileOperation<'a> {
    Open {
        path: &'a Path,
        flags: OFlag,
        file_id: Option<FileId>,
    },
    Mmap(MappingRequest),
    Read {
        ranges: &'a [Range],
        offset: Option<u64>,
    },
    Write {
        ranges: &'a [Range],
        offset: Option<u64>,
    },
    Close,
    Dup(DupContext),
}

impl<'a> FileOperation<'a> {
    pub fn kind(&self) -> OperationKind {
        match self {
            FileOperation::Open { .. } => OperationKind::Open,
            FileOperation::Mmap(_) => OperationKind::Mmap,
            FileOperation::Read { .. } => OperationKind::Read,
            FileOperation::Write { .. } => OperationKind::Write,
            FileOperation::Close => OperationKind::Close,
            FileOperation::Dup(_) => OperationKind::Dup,
        }
    }
}

/// What the interception layer must do with the syscall.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Directive {
    /// Run it as the tracee asked.
    Proceed,
    /// Run it as asked, but as a blocking operation: no other task may be
    /// scheduled until it completes.
    PreventSwitch,
    /// Run the mmap with these parameters instead of the tracee's.
    Mapping(MappingRequest),
}

#[derive(Debug)]
struct PendingOperation {
    fd: i32,
    kind: OperationKind,
    generation: Option<u64>,
    /// The mmap parameters actually handed to the kernel.
    request: Option<MappingRequest>,
    /// Set when a monitor forced the mapping address.
    directed_to: Option<RemotePtr<Void>>,
}

pub struct MonitorDispatcher {
    config: ProcessConfig,
    fd_table: FdTable,
    vm: AddressSpace,
    pending: Option<PendingOperation>,
}

impl MonitorDispatcher {
    pub fn new(config: ProcessConfig) -> MonitorDispatcher {
        MonitorDispatcher {
            fd_table: FdTable::new(config.pid),
            config,
            vm: AddressSpace::new(),
            pending: None,
        }
    }

    /// Set up monitoring for a freshly attached tracee.
    pub fn attach_process(pid: pid_t, flags: &MonitorFlags) -> Result<MonitorDispatcher, ConfigError> {
        Ok(MonitorDispatcher::new(ProcessConfig::new(pid, flags)?))
    }

    pub fn pid(&self) -> pid_t {
        self.config.pid
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn fd_table(&self) -> &FdTable {
        &self.fd_table
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.vm
    }

    /// Attach `monitor` to the open descriptor `fd`. Its `on_open` hook runs
    /// right away.
    pub fn attach(&mut self, fd: i32, monitor: FileMonitorSharedPtr) {
        self.fd_table.attach(fd, monitor.clone());
        if let Some(entry) = self.fd_table.entry(fd) {
            let ctx = OpenContext {
                fd,
                path: entry.path(),
                flags: entry.flags(),
                file_id: entry.file_id(),
            };
            monitor.borrow_mut().on_open(&ctx);
        }
    }

    pub fn lookup(&self, fd: i32) -> &[FileMonitorSharedPtr] {
        self.fd_table.lookup(fd)
    }

    /// Detach everything from `fd`, running close hooks.
    pub fn detach_all(&mut self, fd: i32) {
        if let Some(entry) = self.fd_table.detach_all(fd) {
            run_close_hooks(fd, &entry);
        }
    }

    /// An `old_fd` we never saw opened (e.g. inherited stdio) carries no
    /// monitors, but whatever was at `new_fd` is still closed.
    pub fn duplicate(&mut self, old_fd: i32, new_fd: i32, cloexec: bool) {
        if old_fd == new_fd {
            return;
        }
        if !self.fd_table.is_open(old_fd) {
            self.detach_all(new_fd);
            return;
        }
        if let Some(replaced) = self.fd_table.duplicate(old_fd, new_fd, cloexec) {
            run_close_hooks(new_fd, &replaced);
        }
    }

    pub fn describe(&self) -> Vec<FdDescription> {
        self.fd_table.describe()
    }

    /// Pre-syscall hook. `Err` means the syscall must fail with
    /// `err.errno()` without reaching the kernel.
    ///
    /// An fd with no entry, including one that was closed and detached, has
    /// no monitors and gets `Proceed`: the kernel answers the tracee with
    /// EBADF itself, and nothing detached can be reached. A detach that
    /// happens between `notify` and `notify_complete` is the invariant
    /// violation, caught by the generation check there.
    pub fn notify(&mut self, fd: i32, op: &FileOperation) -> Result<Directive, MonitorError> {
        if let Some(abandoned) = self.pending.take() {
            log!(
                LogWarn,
                "tracee {}: {} on fd {} never completed",
                self.pid(),
                abandoned.kind,
                abandoned.fd
            );
        }

        let mut pending = PendingOperation {
            fd,
            kind: op.kind(),
            generation: self.fd_table.generation(fd),
            request: None,
            directed_to: None,
        };
        let directive = match op {
            FileOperation::Open { .. } | FileOperation::Read { .. } => Directive::Proceed,
            FileOperation::Mmap(req) => {
                let (resolved, directed_to) = self.prepare_mmap(fd, req)?;
                pending.request = Some(resolved);
                pending.directed_to = directed_to;
                if directed_to.is_some() || resolved != *req {
                    Directive::Mapping(resolved)
                } else {
                    Directive::Proceed
                }
            }
            FileOperation::Write { ranges, offset } => {
                let ctx = IoContext {
                    fd,
                    ranges: *ranges,
                    offset: *offset,
                    vm: &self.vm,
                };
                let prevent = self
                    .fd_table
                    .lookup(fd)
                    .iter()
                    .any(|m| m.borrow().will_write(&ctx) == Switchable::PreventSwitch);
                if prevent {
                    Directive::PreventSwitch
                } else {
                    Directive::Proceed
                }
            }
            FileOperation::Close => {
                if self.fd_table.is_rd_fd(fd) {
                    return Err(MonitorError::ProtectedFd { fd });
                }
                Directive::Proceed
            }
            FileOperation::Dup(ctx) => {
                if let Some(new_fd) = ctx.new_fd {
                    if new_fd != fd && self.fd_table.is_rd_fd(new_fd) {
                        return Err(MonitorError::ProtectedFd { fd: new_fd });
                    }
                }
                Directive::Proceed
            }
        };
        self.pending = Some(pending);
        Ok(directive)
    }

    /// Ask every monitor on `fd`, in attachment order, about the mapping.
    fn prepare_mmap(
        &self,
        fd: i32,
        req: &MappingRequest,
    ) -> Result<(MappingRequest, Option<RemotePtr<Void>>), MonitorError> {
        let mut directed: Option<(RemotePtr<Void>, FileMonitorType)> = None;
        for m in self.fd_table.lookup(fd) {
            let mut monitor = m.borrow_mut();
            match monitor.on_mapping_request(req, &self.vm)? {
                MappingDirective::NoChange => (),
                MappingDirective::OverrideAddress(addr) => {
                    let monitor_type = monitor.file_monitor_type();
                    if let Some((prev_addr, prev_type)) = directed {
                        tracee_assert!(
                            self.pid(),
                            false,
                            "Conflicting mapping directives for fd {}: {} monitor wants {}, {} monitor wants {}",
                            fd,
                            prev_type,
                            prev_addr,
                            monitor_type,
                            addr
                        );
                    }
                    directed = Some((addr, monitor_type));
                }
            }
        }

        match directed {
            Some((addr, _)) => Ok((
                MappingRequest {
                    addr,
                    flags: req.flags | MapFlags::MAP_FIXED,
                    ..*req
                },
                Some(addr),
            )),
            None => {
                // Nothing else may ever be placed in the reserved range.
                let reserved = self.config.reserved_page.range();
                let end = checked_ceil_page_size(req.length)
                    .and_then(|len| req.addr.checked_add(len));
                let requested = match end {
                    Some(end) => MemoryRange::from_range(req.addr, end),
                    // The kernel rejects a length this large.
                    None => return Ok((*req, None)),
                };
                if !requested.intersects(&reserved) {
                    return Ok((*req, None));
                }
                if req.is_fixed() {
                    return Err(MonitorError::ReservedRangeIntrusion {
                        range: reserved,
                        requested,
                    });
                }
                if req.addr.is_null() {
                    return Ok((*req, None));
                }
                // While the reserved range is free the kernel would honor the
                // hint, so drop it.
                log!(
                    LogDebug,
                    "tracee {}: dropping mmap hint {} inside reserved range {}",
                    self.pid(),
                    req.addr,
                    reserved
                );
                Ok((
                    MappingRequest {
                        addr: RemotePtr::null(),
                        ..*req
                    },
                    None,
                ))
            }
        }
    }

    /// Post-syscall hook. `result` is the syscall's return value (the new fd
    /// for open and dup, the address for mmap, the byte count for read and
    /// write) or the errno it failed with. For `Open`, `fd` is the new
    /// descriptor.
    pub fn notify_complete(&mut self, fd: i32, op: &FileOperation, result: Result<u64, Errno>) {
        let kind = op.kind();
        let pending = self.pending.take();
        if kind != OperationKind::Open {
            match &pending {
                Some(p) if p.fd == fd && p.kind == kind => {
                    tracee_assert_eq!(
                        self.pid(),
                        self.fd_table.generation(fd),
                        p.generation,
                        "fd {} was detached or replaced during {}",
                        fd,
                        kind
                    );
                }
                _ => {
                    tracee_assert!(
                        self.pid(),
                        false,
                        "{} on fd {} completed without a matching notification, pending: {:?}",
                        kind,
                        fd,
                        pending
                    );
                }
            }
        }

        let value = match result {
            Ok(value) => value,
            Err(errno) => {
                log!(LogDebug, "{} on fd {} failed with {}", kind, fd, errno);
                return;
            }
        };

        match *op {
            FileOperation::Open {
                path,
                flags,
                file_id,
            } => self.did_open(fd, path, flags, file_id),
            FileOperation::Mmap(_) => {
                if let Some(p) = pending {
                    self.did_mmap(fd, &p, value);
                }
            }
            FileOperation::Read { ranges, offset } => self.did_io(fd, ranges, offset, value, false),
            FileOperation::Write { ranges, offset } => self.did_io(fd, ranges, offset, value, true),
            FileOperation::Close => self.detach_all(fd),
            FileOperation::Dup(ctx) => {
                let new_fd = match i32::try_from(value) {
                    Ok(new_fd) => new_fd,
                    Err(_) => {
                        tracee_assert!(
                            self.pid(),
                            false,
                            "dup of fd {} returned {} which is not a descriptor",
                            fd,
                            value
                        );
                        return;
                    }
                };
                if let Some(requested) = ctx.new_fd {
                    tracee_assert_eq!(self.pid(), new_fd, requested);
                }
                self.duplicate(fd, new_fd, ctx.cloexec);
            }
        }

        if is_logging!(LogDebug) {
            if let Ok(fds) = serde_json::to_string(&self.fd_table.describe()) {
                log!(LogDebug, "tracee {} fds after {}: {}", self.pid(), kind, fds);
            }
        }
    }

    fn did_open(&mut self, fd: i32, path: &Path, flags: OFlag, file_id: Option<FileId>) {
        self.fd_table.did_open(fd, path, flags, file_id);
        let is_rd_page_lib = file_name_bytes(path)
            .map_or(false, |name| self.config.is_rd_page_lib_name(name));
        if is_rd_page_lib {
            let reserved = self.config.reserved_page;
            self.attach(fd, new_shared(RdPageMonitor::new(reserved)));
        }
        if parse_proc_path(path, "mem").is_some() {
            self.attach(fd, new_shared(ProcMemMonitor::new(path)));
        }
    }

    fn did_mmap(&mut self, fd: i32, pending: &PendingOperation, value: u64) {
        let request = match pending.request {
            Some(request) => request,
            None => return,
        };
        let start: RemotePtr<Void> = (value as usize).into();
        if let Some(directed) = pending.directed_to {
            tracee_assert_eq!(
                self.pid(),
                start,
                directed,
                "Kernel didn't place the fixed mapping of fd {} where directed",
                fd
            );
        }

        let anonymous = request.flags.contains(MapFlags::MAP_ANONYMOUS);
        let entry = if anonymous {
            None
        } else {
            self.fd_table.entry(fd)
        };
        let mut flags = MappingFlags::empty();
        if let Some(e) = entry {
            if !e.monitors().is_empty() {
                flags |= MappingFlags::IS_MONITORED;
            }
            for m in e.monitors() {
                flags |= m.borrow().mapping_flags();
            }
        }
        let fsname = entry.map_or(OsStr::new(""), |e| e.path().as_os_str());
        let file_id = entry.and_then(|e| e.file_id());
        let length = ceil_page_size(request.length);
        let km = KernelMapping::new_with_opts(
            start,
            start + length,
            fsname,
            file_id.map_or(KernelMapping::NO_DEVICE, |f| f.device),
            file_id.map_or(KernelMapping::NO_INODE, |f| f.inode),
            request.prot,
            request.flags,
            if anonymous { 0 } else { request.offset },
        );
        let region = MappedRegion {
            range: *km,
            prot: request.prot,
            flags: request.flags,
            offset: request.offset,
        };
        self.vm.map(km, flags);

        for m in self.fd_table.lookup(fd) {
            m.borrow_mut().on_mapping_completed(&region);
        }

        if self.config.monitor_mmapped_files && !anonymous && request.flags.contains(MapFlags::MAP_SHARED) {
            if let Some(file) = file_id {
                self.monitor_mmapped_file(file);
            }
        }
    }

    /// Every descriptor for `file` gets the same MmappedFileMonitor so writes
    /// through any of them are seen.
    fn monitor_mmapped_file(&mut self, file: FileId) {
        let unmonitored: Vec<i32> = self
            .fd_table
            .describe()
            .iter()
            .map(|d| d.fd)
            .filter(|fd| {
                self.fd_table.entry(*fd).and_then(FdEntry::file_id) == Some(file)
                    && !self.fd_table.has_monitor(*fd, FileMonitorType::Mmapped)
            })
            .collect();
        if unmonitored.is_empty() {
            return;
        }
        let monitor = new_shared(MmappedFileMonitor::new(file));
        for fd in unmonitored {
            self.attach(fd, monitor.clone());
        }
    }

    fn did_io(&mut self, fd: i32, ranges: &[Range], offset: Option<u64>, value: u64, write: bool) {
        let monitors = self.fd_table.lookup(fd);
        if monitors.is_empty() {
            return;
        }
        // Only the bytes actually transferred.
        let mut remaining = value as usize;
        let mut transferred: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if remaining == 0 {
                break;
            }
            let length = r.length.min(remaining);
            transferred.push(Range::new(r.data, length));
            remaining -= length;
        }
        let ctx = IoContext {
            fd,
            ranges: &transferred,
            offset,
            vm: &self.vm,
        };
        for m in monitors {
            if write {
                m.borrow_mut().on_write(&ctx);
            } else {
                m.borrow_mut().on_read(&ctx);
            }
        }
    }

    pub fn did_unmap(&mut self, addr: RemotePtr<Void>, length: usize) {
        let end = checked_ceil_page_size(length).and_then(|len| addr.checked_add(len));
        match end {
            Some(end) => self.vm.unmap(MemoryRange::from_range(addr, end)),
            None => log!(LogWarn, "munmap of {} bytes at {} can't have succeeded", length, addr),
        }
    }

    /// The tracee exec()ed: O_CLOEXEC descriptors are gone and the address
    /// space starts over from `maps`. The reserved page does not change.
    pub fn did_exec<I>(&mut self, maps: I) -> io::Result<()>
    where
        I: IntoIterator<Item = io::Result<KernelMapping>>,
    {
        self.pending = None;
        for fd in self.fd_table.cloexec_fds() {
            self.detach_all(fd);
        }
        self.vm.populate(
            maps,
            &self.config.reserved_page,
            self.config.rd_page_lib.as_bytes(),
        )
    }

    /// Sync our view of the address space with /proc/<pid>/maps.
    pub fn populate_address_space(&mut self) -> io::Result<()> {
        let maps = KernelMapIterator::new_from_tid(self.pid())?;
        self.vm.populate(
            maps,
            &self.config.reserved_page,
            self.config.rd_page_lib.as_bytes(),
        )
    }
}

fn run_close_hooks(fd: i32, entry: &FdEntry) {
    let ctx = CloseContext {
        fd,
        path: entry.path(),
    };
    for m in entry.monitors() {
        m.borrow_mut().on_close(&ctx);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        file_monitor::{
            preserve_file_monitor::PreserveFileMonitor, stdio_monitor::StdioMonitor, FileMonitor,
        },
        preload_interface::RD_PAGE_ADDR,
        util::page_size,
    };
    use nix::sys::mman::ProtFlags;
    use std::{cell::RefCell, rc::Rc};

    const LIB: &str = "/usr/lib/rd/librdpage.so";
    const LIB_ID: FileId = FileId {
        device: 0x801,
        inode: 4242,
    };

    /// Records which hooks ran and how many bytes it saw written.
    struct RecordingMonitor {
        calls: Rc<RefCell<Vec<&'static str>>>,
        written: Rc<RefCell<usize>>,
    }

    impl FileMonitor for RecordingMonitor {
        fn file_monitor_type(&self) -> FileMonitorType {
            FileMonitorType::Base
        }

        fn on_open(&mut self, _ctx: &OpenContext) {
            self.calls.borrow_mut().push("open");
        }

        fn on_mapping_request(
            &mut self,
            _req: &MappingRequest,
            _vm: &AddressSpace,
        ) -> Result<MappingDirective, MonitorError> {
            self.calls.borrow_mut().push("mapping_request");
            Ok(MappingDirective::NoChange)
        }

        fn on_read(&mut self, _ctx: &IoContext) {
            self.calls.borrow_mut().push("read");
        }

        fn on_write(&mut self, ctx: &IoContext) {
            self.calls.borrow_mut().push("write");
            *self.written.borrow_mut() += ctx.ranges.iter().map(|r| r.length).sum::<usize>();
        }

        fn on_close(&mut self, _ctx: &CloseContext) {
            self.calls.borrow_mut().push("close");
        }
    }

    fn recording_monitor() -> (FileMonitorSharedPtr, Rc<RefCell<Vec<&'static str>>>, Rc<RefCell<usize>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let written = Rc::new(RefCell::new(0));
        let monitor = new_shared(RecordingMonitor {
            calls: calls.clone(),
            written: written.clone(),
        });
        (monitor, calls, written)
    }

    fn dispatcher(pid: pid_t) -> MonitorDispatcher {
        MonitorDispatcher::attach_process(pid, &MonitorFlags::default()).unwrap()
    }

    fn open(d: &mut MonitorDispatcher, fd: i32, path: &str, file_id: Option<FileId>) {
        let op = FileOperation::Open {
            path: Path::new(path),
            flags: OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            file_id,
        };
        assert_eq!(d.notify(-1, &op), Ok(Directive::Proceed));
        d.notify_complete(fd, &op, Ok(fd as u64));
    }

    fn lib_request(hint: usize) -> MappingRequest {
        MappingRequest::new(
            hint.into(),
            4096,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE,
            0,
        )
    }

    fn reserved_start() -> RemotePtr<Void> {
        RD_PAGE_ADDR.into()
    }

    fn map_rd_page(d: &mut MonitorDispatcher, fd: i32) -> RemotePtr<Void> {
        let op = FileOperation::Mmap(lib_request(0x1000));
        let resolved = match d.notify(fd, &op) {
            Ok(Directive::Mapping(resolved)) => resolved,
            other => panic!("unexpected {:?}", other),
        };
        assert!(resolved.is_fixed());
        d.notify_complete(fd, &op, Ok(resolved.addr.as_usize() as u64));
        resolved.addr
    }

    fn write_op(ranges: &[Range], offset: Option<u64>) -> FileOperation {
        FileOperation::Write { ranges, offset }
    }

    #[test]
    fn rd_page_lands_at_reserved_address() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, Some(LIB_ID));
        assert!(d.fd_table().has_monitor(5, FileMonitorType::RdPage));

        assert_eq!(map_rd_page(&mut d, 5), reserved_start());
        assert!(d.address_space().has_rd_page(&d.config().reserved_page));
        let monitor = d.lookup(5)[0].borrow();
        assert_eq!(monitor.as_rd_page_monitor().unwrap().completed_mappings(), 1);
    }

    #[test]
    fn every_session_gets_the_same_address() {
        let addrs: Vec<RemotePtr<Void>> = (0..3)
            .map(|i| {
                let mut d = dispatcher(200 + i);
                open(&mut d, 3 + i, LIB, None);
                map_rd_page(&mut d, 3 + i)
            })
            .collect();
        assert!(addrs.iter().all(|a| *a == reserved_start()));
    }

    #[test]
    fn occupied_reservation_fails_without_fallback() {
        let mut d = dispatcher(100);
        let squatter = KernelMapping::new_with_opts(
            reserved_start(),
            reserved_start() + page_size(),
            OsStr::new(""),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
        );
        d.did_exec(vec![Ok(squatter)]).unwrap();
        open(&mut d, 5, LIB, None);

        let err = d
            .notify(5, &FileOperation::Mmap(lib_request(0x1000)))
            .unwrap_err();
        assert!(matches!(err, MonitorError::ReservedRangeOccupied { .. }));
        assert_eq!(err.errno(), Errno::EEXIST);
        assert!(!d.address_space().has_rd_page(&d.config().reserved_page));
    }

    #[test]
    #[should_panic(expected = "Conflicting mapping directives")]
    fn two_address_overrides_are_fatal() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        d.attach(5, new_shared(RdPageMonitor::new(d.config().reserved_page)));
        let _ = d.notify(5, &FileOperation::Mmap(lib_request(0)));
    }

    #[test]
    fn unmonitored_fd_runs_no_hooks() {
        let mut d = dispatcher(100);
        open(&mut d, 3, "/tmp/plain", None);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(4, monitor);

        let ranges = [Range::new(0x1000usize.into(), 8)];
        let op = write_op(&ranges, Some(0));
        assert_eq!(d.notify(3, &op), Ok(Directive::Proceed));
        d.notify_complete(3, &op, Ok(8));
        let mmap = FileOperation::Mmap(lib_request(0));
        assert_eq!(d.notify(3, &mmap), Ok(Directive::Proceed));
        d.notify_complete(3, &mmap, Ok(0x5000_0000));

        assert_eq!(*calls.borrow(), vec!["open"]);
        let mapping = d.address_space().mapping_of(0x5000_0000usize.into()).unwrap();
        assert!(mapping.flags.is_empty());
    }

    #[test]
    fn closed_fd_no_longer_reaches_its_monitors() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(4, monitor.clone());

        assert_eq!(d.notify(4, &FileOperation::Close), Ok(Directive::Proceed));
        d.notify_complete(4, &FileOperation::Close, Ok(0));
        assert_eq!(Rc::strong_count(&monitor), 1);

        let ranges = [Range::new(0x1000usize.into(), 8)];
        let read = FileOperation::Read {
            ranges: &ranges,
            offset: None,
        };
        assert_eq!(d.notify(4, &read), Ok(Directive::Proceed));
        d.notify_complete(4, &read, Ok(8));
        assert_eq!(*calls.borrow(), vec!["open", "close"]);
    }

    #[test]
    fn failed_syscall_runs_no_post_hooks() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(4, monitor);
        let ranges = [Range::new(0x1000usize.into(), 8)];
        let op = write_op(&ranges, None);
        d.notify(4, &op).unwrap();
        d.notify_complete(4, &op, Err(Errno::EAGAIN));
        assert_eq!(*calls.borrow(), vec!["open"]);
    }

    #[test]
    fn writes_are_truncated_to_transferred_bytes() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, _, written) = recording_monitor();
        d.attach(4, monitor);
        let ranges = [
            Range::new(0x1000usize.into(), 10),
            Range::new(0x2000usize.into(), 10),
        ];
        let op = write_op(&ranges, Some(0));
        d.notify(4, &op).unwrap();
        d.notify_complete(4, &op, Ok(15));
        assert_eq!(*written.borrow(), 15);
    }

    #[test]
    fn any_prevent_switch_wins() {
        let mut d = dispatcher(100);
        open(&mut d, 1, "/dev/pts/0", None);
        let (monitor, _, _) = recording_monitor();
        d.attach(1, monitor);
        let ranges = [Range::new(0x1000usize.into(), 4)];
        assert_eq!(d.notify(1, &write_op(&ranges, None)), Ok(Directive::Proceed));
        d.attach(1, new_shared(StdioMonitor::new(1)));
        assert_eq!(
            d.notify(1, &write_op(&ranges, None)),
            Ok(Directive::PreventSwitch)
        );
    }

    #[test]
    fn preserved_fd_cannot_be_closed_or_clobbered() {
        let mut d = dispatcher(100);
        open(&mut d, 3, "/tmp/plain", None);
        open(&mut d, 999, "/tmp/rd-private", None);
        d.attach(999, new_shared(PreserveFileMonitor::new()));

        let err = d.notify(999, &FileOperation::Close).unwrap_err();
        assert_eq!(err, MonitorError::ProtectedFd { fd: 999 });
        assert_eq!(err.errno(), Errno::EBADF);

        let dup2 = FileOperation::Dup(DupContext {
            new_fd: Some(999),
            cloexec: false,
        });
        assert_eq!(
            d.notify(3, &dup2),
            Err(MonitorError::ProtectedFd { fd: 999 })
        );
        assert!(d.fd_table().is_rd_fd(999));
    }

    #[test]
    fn dup_shares_rd_page_monitor() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        let dup = FileOperation::Dup(DupContext {
            new_fd: None,
            cloexec: false,
        });
        d.notify(5, &dup).unwrap();
        d.notify_complete(5, &dup, Ok(8));
        assert!(Rc::ptr_eq(&d.lookup(5)[0], &d.lookup(8)[0]));

        // Closing the original keeps the alias working.
        d.notify(5, &FileOperation::Close).unwrap();
        d.notify_complete(5, &FileOperation::Close, Ok(0));
        assert_eq!(map_rd_page(&mut d, 8), reserved_start());
    }

    #[test]
    fn dup2_over_open_fd_closes_it() {
        let mut d = dispatcher(100);
        open(&mut d, 3, "/tmp/plain", None);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(4, monitor);
        let dup2 = FileOperation::Dup(DupContext {
            new_fd: Some(4),
            cloexec: false,
        });
        d.notify(3, &dup2).unwrap();
        d.notify_complete(3, &dup2, Ok(4));
        assert_eq!(*calls.borrow(), vec!["open", "close"]);
        assert!(d.lookup(4).is_empty());
    }

    #[test]
    fn fixed_mapping_into_reservation_is_refused() {
        let mut d = dispatcher(100);
        let req = MappingRequest::new(
            reserved_start(),
            page_size(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
            0,
        );
        match d.notify(-1, &FileOperation::Mmap(req)) {
            Err(MonitorError::ReservedRangeIntrusion { .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hint_into_reservation_is_dropped() {
        let mut d = dispatcher(100);
        let hinted = MappingRequest::new(
            reserved_start(),
            page_size(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
        );
        let op = FileOperation::Mmap(hinted);
        let resolved = match d.notify(-1, &op) {
            Ok(Directive::Mapping(resolved)) => resolved,
            other => panic!("unexpected {:?}", other),
        };
        assert!(resolved.addr.is_null());
        assert!(!resolved.is_fixed());
        assert_eq!(resolved.length, hinted.length);
        d.notify_complete(-1, &op, Ok(0x5000_0000));

        // The reservation is still free for the rd page.
        open(&mut d, 5, LIB, None);
        assert_eq!(map_rd_page(&mut d, 5), reserved_start());
    }

    #[test]
    fn hint_outside_reservation_is_kept() {
        let mut d = dispatcher(100);
        let hinted = MappingRequest::new(
            reserved_start() + 16 * page_size(),
            page_size(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
        );
        assert_eq!(
            d.notify(-1, &FileOperation::Mmap(hinted)),
            Ok(Directive::Proceed)
        );
    }

    #[test]
    fn huge_lengths_reach_the_kernel_or_fail_cleanly() {
        let mut d = dispatcher(100);
        let fixed = MappingRequest::new(
            reserved_start(),
            usize::MAX,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
            0,
        );
        assert_eq!(
            d.notify(-1, &FileOperation::Mmap(fixed)),
            Ok(Directive::Proceed)
        );

        open(&mut d, 5, LIB, None);
        let lib = MappingRequest {
            length: usize::MAX - 10,
            ..lib_request(0x1000)
        };
        let err = d.notify(5, &FileOperation::Mmap(lib)).unwrap_err();
        assert!(matches!(err, MonitorError::ReservedRangeTooSmall { .. }));
        assert_eq!(err.errno(), Errno::ENOMEM);
    }

    #[test]
    fn dup_of_untracked_fd_tracks_nothing() {
        let mut d = dispatcher(100);
        let dup = FileOperation::Dup(DupContext {
            new_fd: None,
            cloexec: false,
        });
        assert_eq!(d.notify(0, &dup), Ok(Directive::Proceed));
        d.notify_complete(0, &dup, Ok(7));
        assert!(!d.fd_table().is_open(7));
        assert!(d.lookup(7).is_empty());
    }

    #[test]
    fn dup2_of_untracked_fd_closes_target() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(4, monitor.clone());
        let dup2 = FileOperation::Dup(DupContext {
            new_fd: Some(4),
            cloexec: false,
        });
        assert_eq!(d.notify(1, &dup2), Ok(Directive::Proceed));
        d.notify_complete(1, &dup2, Ok(4));
        assert_eq!(*calls.borrow(), vec!["open", "close"]);
        assert!(!d.fd_table().is_open(4));
        assert_eq!(Rc::strong_count(&monitor), 1);
    }

    #[test]
    #[should_panic(expected = "which is not a descriptor")]
    fn dup_result_out_of_fd_range_is_fatal() {
        let mut d = dispatcher(100);
        open(&mut d, 3, "/tmp/plain", None);
        let dup = FileOperation::Dup(DupContext {
            new_fd: None,
            cloexec: false,
        });
        d.notify(3, &dup).unwrap();
        d.notify_complete(3, &dup, Ok(u64::from(u32::MAX) + 1));
    }

    #[test]
    fn huge_unmap_is_ignored() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        let addr = map_rd_page(&mut d, 5);
        d.did_unmap(addr, usize::MAX);
        assert!(d.address_space().has_rd_page(&d.config().reserved_page));
    }

    #[test]
    #[should_panic(expected = "without a matching notification")]
    fn completion_without_notification_is_fatal() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        d.notify_complete(4, &FileOperation::Close, Ok(0));
    }

    #[test]
    #[should_panic(expected = "detached or replaced")]
    fn detach_between_hooks_is_fatal() {
        let mut d = dispatcher(100);
        open(&mut d, 4, "/tmp/watched", None);
        let ranges = [Range::new(0x1000usize.into(), 4)];
        let op = write_op(&ranges, None);
        d.notify(4, &op).unwrap();
        d.detach_all(4);
        d.notify_complete(4, &op, Ok(4));
    }

    #[test]
    #[should_panic(expected = "where directed")]
    fn rd_page_placed_elsewhere_is_fatal() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        let op = FileOperation::Mmap(lib_request(0));
        d.notify(5, &op).unwrap();
        d.notify_complete(5, &op, Ok(0x1000));
    }

    #[test]
    fn shared_file_mapping_gets_monitored() {
        let file = FileId {
            device: 0x802,
            inode: 77,
        };
        let mut d = dispatcher(100);
        open(&mut d, 6, "/tmp/shared.dat", Some(file));
        open(&mut d, 7, "/tmp/shared.dat", Some(file));
        let req = MappingRequest::new(
            0usize.into(),
            page_size(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            0,
        );
        let mmap = FileOperation::Mmap(req);
        d.notify(6, &mmap).unwrap();
        d.notify_complete(6, &mmap, Ok(0x6000_0000));
        assert!(d.fd_table().has_monitor(6, FileMonitorType::Mmapped));
        assert!(Rc::ptr_eq(&d.lookup(6)[0], &d.lookup(7)[0]));

        let ranges = [Range::new(0x1000usize.into(), 32)];
        let op = write_op(&ranges, Some(16));
        assert_eq!(d.notify(7, &op), Ok(Directive::PreventSwitch));
        d.notify_complete(7, &op, Ok(32));
        let mut monitor = d.lookup(7)[0].borrow_mut();
        let affected = monitor
            .as_mmapped_file_monitor_mut()
            .unwrap()
            .take_affected_ranges();
        assert_eq!(
            affected,
            vec![MemoryRange::new_range(0x6000_0010usize.into(), 32)]
        );
    }

    #[test]
    fn mmapped_file_monitoring_can_be_turned_off() {
        let flags = MonitorFlags {
            no_mmapped_file_monitoring: true,
            ..MonitorFlags::default()
        };
        let mut d = MonitorDispatcher::attach_process(100, &flags).unwrap();
        open(&mut d, 6, "/tmp/shared.dat", Some(LIB_ID));
        let mmap = FileOperation::Mmap(MappingRequest::new(
            0usize.into(),
            page_size(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            0,
        ));
        d.notify(6, &mmap).unwrap();
        d.notify_complete(6, &mmap, Ok(0x6000_0000));
        assert!(d.lookup(6).is_empty());
    }

    #[test]
    fn proc_mem_gets_monitored() {
        let mut d = dispatcher(100);
        open(&mut d, 9, "/proc/101/mem", None);
        let ranges = [Range::new(0x1000usize.into(), 8)];
        let op = write_op(&ranges, Some(0x40_0000));
        assert_eq!(d.notify(9, &op), Ok(Directive::PreventSwitch));
        d.notify_complete(9, &op, Ok(8));
        let mut monitor = d.lookup(9)[0].borrow_mut();
        let m = monitor.as_proc_mem_monitor_mut().unwrap();
        assert_eq!(m.target_tid(), Some(101));
        assert_eq!(
            m.take_written_ranges(),
            vec![MemoryRange::new_range(0x40_0000usize.into(), 8)]
        );
    }

    #[test]
    fn exec_closes_cloexec_fds() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        map_rd_page(&mut d, 5);
        d.fd_table.did_open(6, Path::new("/tmp/kept"), OFlag::O_RDWR, None);
        let (monitor, calls, _) = recording_monitor();
        d.attach(6, monitor);

        d.did_exec(Vec::new()).unwrap();
        assert!(!d.fd_table().is_open(5));
        assert!(d.fd_table().is_open(6));
        assert!(d.address_space().is_empty());
        assert_eq!(d.config().reserved_page.start(), reserved_start());
        assert_eq!(*calls.borrow(), vec!["open"]);
    }

    #[test]
    fn unmap_forgets_rd_page() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        let addr = map_rd_page(&mut d, 5);
        d.did_unmap(addr, 4096);
        assert!(!d.address_space().has_rd_page(&d.config().reserved_page));
    }

    #[test]
    fn describe_reports_attached_types() {
        let mut d = dispatcher(100);
        open(&mut d, 5, LIB, None);
        let fds = d.describe();
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].monitors, vec![FileMonitorType::RdPage]);
    }

    #[test]
    fn populate_reads_own_maps() {
        let mut d = MonitorDispatcher::attach_process(
            nix::unistd::getpid().as_raw(),
            &MonitorFlags::default(),
        )
        .unwrap();
        d.populate_address_space().unwrap();
        assert!(!d.address_space().is_empty());
    }
}
