use crate::preload_interface::{RD_PAGE_ADDR, RD_PAGE_LIB_FILENAME, RD_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::{error::Error, ffi::OsString};
use structopt::{clap, StructOpt};

/// Options controlling file monitoring. Tools embed these with
/// `#[structopt(flatten)]`; sessions persist them as json so replay uses the
/// same values as the recording did.
#[derive(Clone, Debug, Eq, PartialEq, StructOpt, Serialize, Deserialize)]
pub struct MonitorFlags {
    /// Address at which the rd page support library must always be mapped.
    #[structopt(long, parse(try_from_str = parse_address), default_value = "0x70000000")]
    pub rd_page_addr: usize,

    /// Bytes reserved at <rd-page-addr>. Rounded up to the system page size.
    #[structopt(long, default_value = "4096")]
    pub rd_page_size: usize,

    /// File name (not path) of the rd page support library.
    #[structopt(long, parse(from_os_str), default_value = "librdpage.so")]
    pub rd_page_lib: OsString,

    #[structopt(
        long,
        help = "Don't install monitors for files that are mapped MAP_SHARED."
    )]
    pub no_mmapped_file_monitoring: bool,
}

impl Default for MonitorFlags {
    fn default() -> Self {
        MonitorFlags {
            rd_page_addr: RD_PAGE_ADDR,
            rd_page_size: RD_PAGE_SIZE,
            rd_page_lib: OsString::from(RD_PAGE_LIB_FILENAME),
            no_mmapped_file_monitoring: false,
        }
    }
}

impl MonitorFlags {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<MonitorFlags> {
        serde_json::from_str(json)
    }
}

fn parse_address(addr_s: &str) -> Result<usize, Box<dyn Error>> {
    let trimmed = addr_s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Ok(usize::from_str_radix(hex, 16)?)
    } else if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        Ok(trimmed.parse::<usize>()?)
    } else {
        Err(Box::new(clap::Error::with_description(
            "Only a decimal or 0x-prefixed hexadecimal address is valid here",
            clap::ErrorKind::InvalidValue,
        )))
    }
}
