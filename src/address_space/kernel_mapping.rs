use crate::address_space::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use crate::util::page_size;
use libc::{dev_t, ino_t};
use libc::{MAP_ANONYMOUS, MAP_GROWSDOWN, MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED, MAP_STACK};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::{major, minor};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::ops::Deref;
use std::os::unix::ffi::OsStrExt;

/// One row of a tracee memory map: a range plus the identity of what backs
/// it, exactly as the kernel would report it in /proc/<tid>/maps.
///
/// The device number stored here comes from fstat()ing the mapped file, not
/// from the maps file; btrfs reports different numbers through the two paths
/// and the fstat one is the stable choice.
#[derive(Debug)]
pub struct KernelMapping {
    mr: MemoryRange,
    fsname: OsString,
    device: dev_t,
    inode: ino_t,
    prot: ProtFlags,
    flags: MapFlags,
    /// File offset in bytes.
    offset: u64,
}

impl KernelMapping {
    pub const NO_DEVICE: dev_t = 0;
    pub const NO_INODE: ino_t = 0;

    /// The flags that distinguish adjacent segments for coalescing: the
    /// kernel keeps a NORESERVE anonymous mapping distinct from an adjacent
    /// plain one even when all other metadata agree.
    pub const MAP_FLAGS_MASK: MapFlags = MapFlags::from_bits_truncate(
        MAP_ANONYMOUS | MAP_NORESERVE | MAP_PRIVATE | MAP_SHARED | MAP_STACK | MAP_GROWSDOWN,
    );
    pub const CHECKABLE_FLAGS_MASK: MapFlags =
        MapFlags::from_bits_truncate(MAP_PRIVATE | MAP_SHARED);

    pub fn new(
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
            mr: MemoryRange::from_range(start, end),
            fsname: fsname.to_owned(),
            device,
            inode,
            prot,
            flags: flags & Self::MAP_FLAGS_MASK,
            offset,
        };
        result.assert_valid();
        result
    }

    pub fn new_anonymous(
        start: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> KernelMapping {
        KernelMapping::new(
            start,
            start.byte_add(num_bytes),
            OsStr::new(""),
            Self::NO_DEVICE,
            Self::NO_INODE,
            prot,
            flags | MapFlags::MAP_ANONYMOUS,
            0,
        )
    }

    fn assert_valid(&self) {
        debug_assert!(self.end() >= self.start());
        debug_assert_eq!(self.size() % page_size(), 0);
        debug_assert!((self.flags & !Self::MAP_FLAGS_MASK).is_empty());
        debug_assert_eq!(self.offset % page_size() as u64, 0);
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname
    }
    pub fn device(&self) -> dev_t {
        self.device
    }
    pub fn inode(&self) -> ino_t {
        self.inode
    }
    pub fn prot(&self) -> ProtFlags {
        self.prot
    }
    pub fn flags(&self) -> MapFlags {
        self.flags
    }
    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn range(&self) -> MemoryRange {
        self.mr
    }

    /// A copy of self covering `[start, end)` with the file offset slid to
    /// match.
    pub fn subrange(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> KernelMapping {
        debug_assert!(start >= self.start() && end <= self.end());
        let offset_delta = if self.is_real_device() {
            (start - self.start()) as u64
        } else {
            0
        };
        KernelMapping::new(
            start,
            end,
            &self.fsname,
            self.device,
            self.inode,
            self.prot,
            self.flags,
            self.offset + offset_delta,
        )
    }

    pub fn extend(&self, end: RemotePtr<Void>) -> KernelMapping {
        debug_assert!(end >= self.end());
        KernelMapping::new(
            self.start(),
            end,
            &self.fsname,
            self.device,
            self.inode,
            self.prot,
            self.flags,
            self.offset,
        )
    }

    pub fn set_range(&self, start: RemotePtr<Void>, end: RemotePtr<Void>) -> KernelMapping {
        KernelMapping::new(
            start,
            end,
            &self.fsname,
            self.device,
            self.inode,
            self.prot,
            self.flags,
            self.offset,
        )
    }

    pub fn set_prot(&self, prot: ProtFlags) -> KernelMapping {
        KernelMapping::new(
            self.start(),
            self.end(),
            &self.fsname,
            self.device,
            self.inode,
            prot,
            self.flags,
            self.offset,
        )
    }

    /// Whether two mappings are the kernel's idea of "the same thing split
    /// at a page boundary", i.e. candidates for coalescing.
    pub fn is_adjacent_continuation_of(&self, prev: &KernelMapping) -> bool {
        if prev.end() != self.start() {
            return false;
        }
        if prev.flags != self.flags
            || prev.prot != self.prot
            || prev.fsname != self.fsname
            || prev.device != self.device
            || prev.inode != self.inode
        {
            return false;
        }
        if self.is_real_device()
            && self.offset != prev.offset + prev.size() as u64
        {
            return false;
        }
        true
    }

    /// Backed by an external device, as opposed to a transient RAM mapping.
    pub fn is_real_device(&self) -> bool {
        self.device > Self::NO_DEVICE
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags.contains(MapFlags::MAP_ANONYMOUS)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::MAP_SHARED)
    }

    pub fn is_vdso(&self) -> bool {
        self.fsname() == "[vdso]"
    }

    pub fn is_heap(&self) -> bool {
        self.fsname() == "[heap]"
    }

    pub fn is_stack(&self) -> bool {
        // "[stack" without the closing bracket: thread stacks render as
        // "[stack:<tid>]".
        self.fsname().as_bytes().starts_with(b"[stack")
    }

    pub fn is_vsyscall(&self) -> bool {
        self.fsname() == "[vsyscall]"
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(4);
        s.push(if self.prot.contains(ProtFlags::PROT_READ) {
            'r'
        } else {
            '-'
        });
        s.push(if self.prot.contains(ProtFlags::PROT_WRITE) {
            'w'
        } else {
            '-'
        });
        s.push(if self.prot.contains(ProtFlags::PROT_EXEC) {
            'x'
        } else {
            '-'
        });
        s.push(if self.flags.contains(MapFlags::MAP_SHARED) {
            's'
        } else {
            'p'
        });
        s
    }
}

impl Clone for KernelMapping {
    fn clone(&self) -> Self {
        KernelMapping {
            mr: self.mr,
            fsname: self.fsname.clone(),
            device: self.device,
            inode: self.inode,
            prot: self.prot,
            flags: self.flags,
            offset: self.offset,
        }
    }
}

impl Deref for KernelMapping {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

impl fmt::Display for KernelMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {:<10} {:?}",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot_string(),
            self.offset,
            major(self.device),
            minor(self.device),
            self.inode,
            self.fsname()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> usize {
        page_size()
    }

    fn file_map(start: usize, pages: usize, offset: u64) -> KernelMapping {
        KernelMapping::new(
            RemotePtr::from_val(start),
            RemotePtr::from_val(start + pages * page()),
            OsStr::new("/lib/lib.so"),
            8,
            1234,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            offset,
        )
    }

    #[test]
    fn subrange_slides_offset() {
        let p = page();
        let m = file_map(4 * p, 4, 0);
        let sub = m.subrange(
            RemotePtr::from_val(5 * p),
            RemotePtr::from_val(7 * p),
        );
        assert_eq!(sub.file_offset_bytes(), p as u64);
        assert_eq!(sub.size(), 2 * p);
    }

    #[test]
    fn adjacency_requires_contiguous_offsets() {
        let p = page();
        let a = file_map(4 * p, 1, 0);
        let b = file_map(5 * p, 1, p as u64);
        let c = file_map(5 * p, 1, 4 * p as u64);
        assert!(b.is_adjacent_continuation_of(&a));
        assert!(!c.is_adjacent_continuation_of(&a));
    }

    #[test]
    fn anonymous_adjacency_ignores_offset() {
        let p = page();
        let a = KernelMapping::new_anonymous(
            RemotePtr::from_val(4 * p),
            p,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        );
        let b = KernelMapping::new_anonymous(
            RemotePtr::from_val(5 * p),
            p,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        );
        assert!(b.is_adjacent_continuation_of(&a));
    }

    #[test]
    fn special_names() {
        let p = page();
        let m = KernelMapping::new(
            RemotePtr::from_val(p),
            RemotePtr::from_val(2 * p),
            OsStr::new("[stack:123]"),
            0,
            0,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
        );
        assert!(m.is_stack());
        assert!(!m.is_vdso());
    }
}
