//! The emulated file system: files that were mmap'd shared during
//! recording. Their recorded contents only exist as snapshots in the trace,
//! and every replayed mapping of one must alias the same backing object so
//! writes through one mapping are visible through the others. Each emulated
//! file is an anonymous memfd owned by the replay session.
//!
//! Files are identified by the recorded `(device, inode)` pair. Inode
//! recycling is safe: a recycled inode implies every mapping of the old
//! file was torn down first, and an emulated file is garbage-collected when
//! its last mapping goes away, so the two lifetimes cannot overlap.

use crate::scoped_fd::ScopedFd;
use crate::util::resize_shmem_segment;
use libc::{dev_t, ino_t};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::getpid;
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};

pub type EmuFileId = (dev_t, ino_t);

pub struct EmuFile {
    orig_path: OsString,
    file: ScopedFd,
    size: u64,
    device: dev_t,
    inode: ino_t,
}

impl EmuFile {
    const COPY_BUF_SIZE: usize = 65536;

    fn create(orig_path: &OsStr, device: dev_t, inode: ino_t, size: u64) -> EmuFile {
        let name = CString::new(format!(
            "retrace-emufs-{}-dev{}-ino{}",
            getpid(),
            device,
            inode
        ))
        .unwrap();
        let fd = match memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(e) => fatal!("Failed to create emulated file: {}", e),
        };
        resize_shmem_segment(&fd, size as usize);
        EmuFile {
            orig_path: orig_path.to_owned(),
            file: fd,
            size,
            device,
            inode,
        }
    }

    pub fn fd(&self) -> &ScopedFd {
        &self.file
    }

    /// A path naming this file in the tracer, usable by a tracee open():
    /// our /proc fd link.
    pub fn proc_path(&self) -> String {
        format!("/proc/{}/fd/{}", getpid(), self.file.as_raw())
    }

    /// The recorded path this file stands in for.
    pub fn emu_path(&self) -> &OsStr {
        &self.orig_path
    }

    pub fn id(&self) -> EmuFileId {
        (self.device, self.inode)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn ensure_size(&mut self, size: u64) {
        if self.size < size {
            resize_shmem_segment(&self.file, size as usize);
            self.size = size;
        }
    }

    /// Byte-for-byte copy, for checkpoint cloning.
    fn clone_contents(&self) -> EmuFile {
        let new_file = EmuFile::create(&self.orig_path, self.device, self.inode, self.size);
        let mut buf = vec![0u8; Self::COPY_BUF_SIZE];
        let mut offset: u64 = 0;
        while offset < self.size {
            let wanted = std::cmp::min((self.size - offset) as usize, buf.len());
            let got = unsafe {
                libc::pread64(
                    self.file.as_raw(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    wanted,
                    offset as i64,
                )
            };
            if got <= 0 {
                fatal!("Couldn't read emulated file {:?}", self.orig_path);
            }
            let mut written = 0usize;
            while written < got as usize {
                let w = unsafe {
                    libc::pwrite64(
                        new_file.file.as_raw(),
                        buf[written..].as_ptr() as *const libc::c_void,
                        got as usize - written,
                        (offset + written as u64) as i64,
                    )
                };
                if w <= 0 {
                    fatal!("Couldn't write emulated file clone");
                }
                written += w as usize;
            }
            offset += got as u64;
        }
        new_file
    }
}

/// The set of emulated files for one replay session.
#[derive(Default)]
pub struct EmuFs {
    files: HashMap<EmuFileId, EmuFile>,
}

impl EmuFs {
    pub fn new() -> EmuFs {
        EmuFs {
            files: HashMap::new(),
        }
    }

    pub fn find(&self, id: EmuFileId) -> Option<&EmuFile> {
        self.files.get(&id)
    }

    pub fn find_mut(&mut self, id: EmuFileId) -> Option<&mut EmuFile> {
        self.files.get_mut(&id)
    }

    /// Get or create the emulated file for a recorded mapping, grown to
    /// cover at least `[offset, offset+len)`.
    pub fn get_or_create(
        &mut self,
        orig_path: &OsStr,
        device: dev_t,
        inode: ino_t,
        min_size: u64,
    ) -> &mut EmuFile {
        let id = (device, inode);
        let f = self
            .files
            .entry(id)
            .or_insert_with(|| EmuFile::create(orig_path, device, inode, min_size));
        f.ensure_size(min_size);
        f
    }

    /// Drop emulated files with no remaining mapping. `live` enumerates the
    /// ids still mapped by some task; this must run at every munmap that
    /// could drop a file's last mapping, or inode recycling breaks.
    pub fn gc(&mut self, live: &dyn Fn(EmuFileId) -> bool) {
        let dead: Vec<EmuFileId> = self
            .files
            .keys()
            .copied()
            .filter(|id| !live(*id))
            .collect();
        for id in dead {
            log!(
                crate::log::LogDebug,
                "emufs gc: dropping dev {} inode {}",
                id.0,
                id.1
            );
            self.files.remove(&id);
        }
    }

    /// Deep copy for checkpoints.
    pub fn clone_all(&self) -> EmuFs {
        EmuFs {
            files: self
                .files
                .iter()
                .map(|(id, f)| (*id, f.clone_contents()))
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_gc() {
        let mut fs = EmuFs::new();
        let id = {
            let f = fs.get_or_create(OsStr::new("/tmp/shared"), 8, 42, 4096);
            assert!(f.fd().is_open());
            assert_eq!(f.size(), 4096);
            f.id()
        };
        assert!(fs.find(id).is_some());

        // Growing only ever grows.
        fs.get_or_create(OsStr::new("/tmp/shared"), 8, 42, 1024);
        assert_eq!(fs.find(id).unwrap().size(), 4096);
        fs.get_or_create(OsStr::new("/tmp/shared"), 8, 42, 8192);
        assert_eq!(fs.find(id).unwrap().size(), 8192);

        fs.gc(&|_| false);
        assert!(fs.find(id).is_none());
    }

    #[test]
    fn clone_copies_contents() {
        let mut fs = EmuFs::new();
        let id = (8u64, 77u64);
        {
            let f = fs.get_or_create(OsStr::new("/tmp/x"), id.0, id.1, 64);
            let data = b"deterministic";
            let ret = unsafe {
                libc::pwrite64(
                    f.fd().as_raw(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    0,
                )
            };
            assert_eq!(ret, data.len() as isize);
        }
        let cloned = fs.clone_all();
        let f2 = cloned.find(id).unwrap();
        let mut back = [0u8; 13];
        let ret = unsafe {
            libc::pread64(
                f2.fd().as_raw(),
                back.as_mut_ptr() as *mut libc::c_void,
                back.len(),
                0,
            )
        };
        assert_eq!(ret, 13);
        assert_eq!(&back, b"deterministic");
    }
}
