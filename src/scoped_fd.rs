use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// An fd that is closed when it goes out of scope. The engine holds long
/// lived fds (trace files, /proc/pid/mem, sockets) whose leak would exhaust
/// the reserved fd range, so raw fds never escape this wrapper unmoved.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    /// Take ownership of `fd`.
    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> ScopedFd {
        let fd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn open_path_with_mode<P: ?Sized + NixPath>(
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> ScopedFd {
        let fd = open(path, oflag, mode).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Relinquish ownership; the caller must close the returned fd.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // The close may fail with EINTR; the fd is gone either way.
            let _ = close(self.fd);
        }
        self.fd = -1;
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(fd.as_raw(), -1);
    }

    #[test]
    fn extract_disowns() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(fd.is_open());
        let raw = fd.extract();
        assert!(!fd.is_open());
        assert!(raw >= 0);
        let _ = nix::unistd::close(raw);
    }
}
