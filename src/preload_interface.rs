//! Constants shared with the rd page support library. Changing any of these
//! changes the memory layout of every recorded tracee, so old traces would no
//! longer replay.

/// Must match generate_rd_page.py
pub const RD_PAGE_ADDR: usize = 0x70000000;

/// This might not be the length of an actual system page, but we reserve at
/// least this much space.
pub const RD_PAGE_SIZE: usize = 4096;

pub const RD_PAGE_LIB_FILENAME: &str = "librdpage.so";
pub const RD_PAGE_LIB_FILENAME_32: &str = "librdpage_32.so";

const_assert_eq!(RD_PAGE_ADDR % RD_PAGE_SIZE, 0);
const_assert!(RD_PAGE_ADDR + RD_PAGE_SIZE <= 0xffff_ffff);
