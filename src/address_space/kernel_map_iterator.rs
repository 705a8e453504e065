use crate::address_space::kernel_mapping::KernelMapping;
use crate::remote_ptr::RemotePtr;
use crate::util::proc_maps_path;
use libc::pid_t;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::makedev;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;

/// Iterates the kernel's view of a tracee's memory map by parsing
/// /proc/<tid>/maps. The file is snapshotted up front: the kernel's seq_file
/// iteration has odd behavior if the map mutates mid-read, and callers
/// (verify in particular) want a consistent snapshot anyway.
pub struct KernelMapIterator {
    tid: pid_t,
    lines: Vec<String>,
    next: usize,
}

impl KernelMapIterator {
    pub fn new(tid: pid_t) -> KernelMapIterator {
        let path = proc_maps_path(tid);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                fatal!(
                    "Failed to read {:?} (tracee dead or not ours?): {}",
                    path,
                    e
                );
            }
        };
        KernelMapIterator {
            tid,
            lines: content.lines().map(|l| l.to_owned()).collect(),
            next: 0,
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    fn parse_line(line: &str) -> KernelMapping {
        // 7f1b8c20a000-7f1b8c22c000 r-xp 00000000 08:01 1835274  /lib/ld.so
        let mut fields = line.splitn(6, ' ');
        let range = fields.next().unwrap_or("");
        let perms = fields.next().unwrap_or("");
        let offset = fields.next().unwrap_or("0");
        let dev = fields.next().unwrap_or("0:0");
        let inode = fields.next().unwrap_or("0");
        let fsname = fields.next().unwrap_or("").trim_start();

        let mut addrs = range.splitn(2, '-');
        let start = usize::from_str_radix(addrs.next().unwrap_or("0"), 16).unwrap_or(0);
        let end = usize::from_str_radix(addrs.next().unwrap_or("0"), 16).unwrap_or(0);

        let perms_bytes = perms.as_bytes();
        let mut prot = ProtFlags::empty();
        if perms_bytes.first() == Some(&b'r') {
            prot |= ProtFlags::PROT_READ;
        }
        if perms_bytes.get(1) == Some(&b'w') {
            prot |= ProtFlags::PROT_WRITE;
        }
        if perms_bytes.get(2) == Some(&b'x') {
            prot |= ProtFlags::PROT_EXEC;
        }
        let mut flags = if perms_bytes.get(3) == Some(&b's') {
            MapFlags::MAP_SHARED
        } else {
            MapFlags::MAP_PRIVATE
        };

        let offset = u64::from_str_radix(offset, 16).unwrap_or(0);
        let mut dev_parts = dev.splitn(2, ':');
        let dev_major = u64::from_str_radix(dev_parts.next().unwrap_or("0"), 16).unwrap_or(0);
        let dev_minor = u64::from_str_radix(dev_parts.next().unwrap_or("0"), 16).unwrap_or(0);
        let inode = inode.trim().parse::<u64>().unwrap_or(0);

        if inode == 0 && fsname.is_empty() {
            flags |= MapFlags::MAP_ANONYMOUS;
        }

        KernelMapping::new(
            RemotePtr::from_val(start),
            RemotePtr::from_val(end),
            OsStr::from_bytes(fsname.as_bytes()),
            makedev(dev_major, dev_minor),
            inode,
            prot,
            flags,
            offset,
        )
    }
}

impl Iterator for KernelMapIterator {
    type Item = KernelMapping;

    fn next(&mut self) -> Option<KernelMapping> {
        if self.next >= self.lines.len() {
            return None;
        }
        let line = &self.lines[self.next];
        self.next += 1;
        Some(Self::parse_line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn parses_file_backed_line() {
        let km = KernelMapIterator::parse_line(
            "7f1b8c20a000-7f1b8c22c000 r-xp 00001000 08:01 1835274    /lib/x86_64/ld-2.31.so",
        );
        assert_eq!(km.start().as_usize(), 0x7f1b_8c20_a000);
        assert_eq!(km.end().as_usize(), 0x7f1b_8c22_c000);
        assert!(km.prot().contains(ProtFlags::PROT_READ | ProtFlags::PROT_EXEC));
        assert!(!km.prot().contains(ProtFlags::PROT_WRITE));
        assert_eq!(km.file_offset_bytes(), 0x1000);
        assert_eq!(km.inode(), 1835274);
        assert_eq!(km.fsname(), "/lib/x86_64/ld-2.31.so");
        assert!(!km.is_anonymous());
    }

    #[test]
    fn parses_anonymous_line() {
        let km =
            KernelMapIterator::parse_line("7ffd1a000000-7ffd1a021000 rw-p 00000000 00:00 0 ");
        assert!(km.is_anonymous());
        assert!(!km.is_shared());
        assert_eq!(km.inode(), 0);
    }

    #[test]
    fn reads_own_map() {
        // Our own process must have a stack and at least one executable
        // mapping.
        let me = getpid().as_raw();
        let maps: Vec<_> = KernelMapIterator::new(me).collect();
        assert!(!maps.is_empty());
        assert!(maps.iter().any(|m| m.is_stack()));
        assert!(maps
            .iter()
            .any(|m| m.prot().contains(ProtFlags::PROT_EXEC)));
        // Address-ordered, non-overlapping.
        for w in maps.windows(2) {
            assert!(w[0].end() <= w[1].start());
        }
    }
}
