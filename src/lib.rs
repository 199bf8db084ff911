#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod address_space;
pub mod dispatch;
pub mod error;
pub mod fd_table;
pub mod file_monitor;
pub mod flags;
pub mod preload_interface;
pub mod process_config;
pub mod remote_ptr;
pub mod util;

pub use dispatch::{Directive, DupContext, FileOperation, MonitorDispatcher, OperationKind};
pub use error::{ConfigError, MonitorError};
pub use file_monitor::{FileMonitor, FileMonitorSharedPtr, FileMonitorType};
pub use flags::MonitorFlags;
pub use process_config::{ProcessConfig, ReservedPage};
