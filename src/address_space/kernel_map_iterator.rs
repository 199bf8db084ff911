use crate::address_space::kernel_mapping::KernelMapping;
use crate::remote_ptr::{RemotePtr, Void};
use libc::{ino_t, pid_t};
use nix::sys::{
    mman::{MapFlags, ProtFlags},
    stat::makedev,
};
use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufRead, BufReader, ErrorKind},
    os::unix::ffi::OsStringExt,
};

/// Iterates over the lines of a /proc/<tid>/maps style listing.
pub struct KernelMapIterator<R: BufRead> {
    reader: R,
}

impl KernelMapIterator<BufReader<File>> {
    pub fn new_from_tid(tid: pid_t) -> io::Result<Self> {
        let maps_path = format!("/proc/{}/maps", tid);
        let file = File::open(&maps_path)?;
        Ok(KernelMapIterator {
            reader: BufReader::new(file),
        })
    }
}

impl<R: BufRead> KernelMapIterator<R> {
    pub fn new(reader: R) -> Self {
        KernelMapIterator { reader }
    }
}

impl<R: BufRead> Iterator for KernelMapIterator<R> {
    type Item = io::Result<KernelMapping>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut raw_line: Vec<u8> = Vec::new();
        match self.reader.read_until(b'\n', &mut raw_line) {
            Ok(0) => None,
            Ok(_) => Some(parse_rawline(&raw_line)),
            Err(e) => Some(Err(e)),
        }
    }
}

fn invalid(raw_line: &[u8]) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidData,
        format!(
            "Malformed maps line: `{}'",
            String::from_utf8_lossy(raw_line).trim_end()
        ),
    )
}

fn parse_rawline(raw_line: &[u8]) -> io::Result<KernelMapping> {
    let line = raw_line.strip_suffix(b"\n").unwrap_or(raw_line);
    let mut iter = line.splitn(6, |c| *c == b' ');
    let addr_range = next_field(&mut iter, raw_line)?;
    let perms_s = next_field(&mut iter, raw_line)?;
    let offset_s = next_field(&mut iter, raw_line)?;
    let device = next_field(&mut iter, raw_line)?;
    let inode_s = next_field(&mut iter, raw_line)?;
    // The pathname may be absent and is padded with leading spaces.
    let filename_escaped: &[u8] = match iter.next() {
        Some(f) => {
            let start = f.iter().position(|c| *c != b' ').unwrap_or(f.len());
            &f[start..]
        }
        None => b"",
    };

    let (addr_low_s, addr_high_s) = split_pair(addr_range, '-').ok_or_else(|| invalid(raw_line))?;
    let (dev_major_s, dev_minor_s) = split_pair(device, ':').ok_or_else(|| invalid(raw_line))?;
    let hex = |s: &str| u64::from_str_radix(s, 16).map_err(|_| invalid(raw_line));

    let addr_low: RemotePtr<Void> = (hex(addr_low_s)? as usize).into();
    let addr_high: RemotePtr<Void> = (hex(addr_high_s)? as usize).into();
    if addr_high < addr_low {
        return Err(invalid(raw_line));
    }
    let offset = hex(offset_s)?;
    let dev_major = hex(dev_major_s)?;
    let dev_minor = hex(dev_minor_s)?;
    let inode: ino_t = inode_s.parse::<ino_t>().map_err(|_| invalid(raw_line))?;

    let (prot, flags) = parse_perms(perms_s);
    let filename = OsString::from_vec(unescape_filename(filename_escaped));
    Ok(KernelMapping::new_with_opts(
        addr_low,
        addr_high,
        &filename,
        makedev(dev_major, dev_minor),
        inode,
        prot,
        flags,
        offset,
    ))
}

fn next_field<'a, I: Iterator<Item = &'a [u8]>>(iter: &mut I, raw_line: &[u8]) -> io::Result<&'a str> {
    iter.next()
        .and_then(|f| std::str::from_utf8(f).ok())
        .ok_or_else(|| invalid(raw_line))
}

fn split_pair(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut it = s.splitn(2, sep);
    Some((it.next()?, it.next()?))
}

/// The kernel escapes newlines in file names as `\012`.
fn unescape_filename(escaped: &[u8]) -> Vec<u8> {
    let mut filename = Vec::with_capacity(escaped.len());
    let mut i = 0;
    while i < escaped.len() {
        if escaped[i..].starts_with(b"\\012") {
            filename.push(b'\n');
            i += 4;
        } else {
            filename.push(escaped[i]);
            i += 1;
        }
    }
    filename
}

fn parse_perms(perms_s: &str) -> (ProtFlags, MapFlags) {
    let mut prot = ProtFlags::empty();
    let mut flags = MapFlags::empty();
    for c in perms_s.chars() {
        match c {
            'r' => prot |= ProtFlags::PROT_READ,
            'w' => prot |= ProtFlags::PROT_WRITE,
            'x' => prot |= ProtFlags::PROT_EXEC,
            'p' => flags |= MapFlags::MAP_PRIVATE,
            's' => flags |= MapFlags::MAP_SHARED,
            _ => (),
        }
    }
    (prot, flags)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{ffi::OsStr, io::Cursor, io::Write};

    const MAPS: &str = "\
55d1c8a00000-55d1c8a02000 r--p 00000000 08:01 1311 /usr/bin/cat
70000000-70001000 r-xp 00000000 fd:00 77 /usr/lib/rd/librdpage.so
7ffd1d0f0000-7ffd1d111000 rw-p 00000000 00:00 0                          [stack]
7f0000000000-7f0000001000 rw-s 00001000 08:01 99 /tmp/odd\\012name
";

    #[test]
    fn parse_maps() {
        let maps: Vec<KernelMapping> = KernelMapIterator::new(Cursor::new(MAPS))
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(maps.len(), 4);

        assert_eq!(maps[0].fsname(), OsStr::new("/usr/bin/cat"));
        assert_eq!(maps[0].prot(), ProtFlags::PROT_READ);

        assert_eq!(maps[1].start().as_usize(), 0x70000000);
        assert_eq!(maps[1].device(), makedev(0xfd, 0));
        assert_eq!(maps[1].inode(), 77);
        assert_eq!(maps[1].prot(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);

        assert_eq!(maps[2].fsname(), OsStr::new("[stack]"));
        assert_eq!(maps[2].flags(), MapFlags::MAP_PRIVATE);

        assert_eq!(maps[3].fsname(), OsStr::new("/tmp/odd\nname"));
        assert!(maps[3].is_shared());
        assert_eq!(maps[3].file_offset_bytes(), 0x1000);
    }

    #[test]
    fn malformed_line_is_invalid_data() {
        let mut it = KernelMapIterator::new(Cursor::new("70000000 r-xp\n"));
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn parse_maps_file_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(MAPS.as_bytes()).unwrap();
        let file = File::open(f.path()).unwrap();
        let count = KernelMapIterator::new(BufReader::new(file))
            .filter_map(Result::ok)
            .count();
        assert_eq!(count, 4);
    }

    #[test]
    fn own_maps_are_readable() {
        let it = KernelMapIterator::new_from_tid(nix::unistd::getpid().as_raw()).unwrap();
        assert!(it.filter_map(Result::ok).count() > 0);
    }
}
