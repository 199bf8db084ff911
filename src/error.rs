use crate::address_space::memory_range::MemoryRange;
use nix::errno::Errno;
use thiserror::Error;

/// A monitor decided that the operation must fail, and fail the same way in
/// every replay. The interception layer turns this into whatever the tracee
/// should observe.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MonitorError {
    #[error("reserved rd page range {range} is already occupied by `{occupant}' at {occupied}")]
    ReservedRangeOccupied {
        range: MemoryRange,
        occupied: MemoryRange,
        occupant: String,
    },
    #[error("mapping of {length} bytes does not fit in the reserved rd page range {range}")]
    ReservedRangeTooSmall { range: MemoryRange, length: usize },
    #[error("fixed mapping {requested} would overlap the reserved rd page range {range}")]
    ReservedRangeIntrusion {
        range: MemoryRange,
        requested: MemoryRange,
    },
    #[error("fd {fd} belongs to rd and can't be closed or replaced by the tracee")]
    ProtectedFd { fd: i32 },
}

impl MonitorError {
    /// What the tracee sees when the syscall is failed.
    pub fn errno(&self) -> Errno {
        match self {
            MonitorError::ReservedRangeOccupied { .. } => Errno::EEXIST,
            MonitorError::ReservedRangeTooSmall { .. } => Errno::ENOMEM,
            MonitorError::ReservedRangeIntrusion { .. } => Errno::EEXIST,
            MonitorError::ProtectedFd { .. } => Errno::EBADF,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("rd page address {0:#x} is null or not page aligned")]
    UnalignedAddress(usize),
    #[error("rd page size {0} is zero")]
    EmptyReservation(usize),
    #[error("rd page range starting at {addr:#x} of {size} bytes wraps the address space")]
    AddressOverflow { addr: usize, size: usize },
    #[error("rd page library name `{0}' must be a plain file name")]
    BadLibraryName(String),
}
