use crate::scoped_fd::ScopedFd;
use libc::{c_long, syscall, SYS_gettid, _SC_PAGESIZE};
use nix::sys::stat::stat;
use nix::unistd::{ftruncate, sysconf, SysconfVar};
use std::env;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const KILO: usize = 1024;
pub const MEGA: usize = KILO * KILO;

/// Returns true if the process is itself being supervised by an engine
/// instance. Nesting is refused at startup.
pub fn running_under_retrace() -> bool {
    env::var_os("RUNNING_UNDER_RETRACE").is_some()
}

pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) => sz as usize,
        _ => unsafe { libc::sysconf(_SC_PAGESIZE) as usize },
    }
}

pub fn floor_page_size(sz: usize) -> usize {
    let page_mask = !(page_size() - 1);
    sz & page_mask
}

pub fn ceil_page_size(sz: usize) -> usize {
    floor_page_size(sz + page_size() - 1)
}

pub fn is_page_aligned(sz: usize) -> bool {
    sz == floor_page_size(sz)
}

/// Seconds since the epoch as a double, used to stamp trace frames.
/// The value is only compared for human consumption, never for replay
/// decisions.
pub fn monotonic_now_sec() -> f64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    now.as_secs() as f64 + f64::from(now.subsec_nanos()) * 1e-9
}

pub fn gettid() -> libc::pid_t {
    unsafe { syscall(SYS_gettid) as libc::pid_t }
}

/// Write all of `buf` to `fd`, retrying on short writes and EINTR.
/// Any other error is fatal; the trace is unusable after a lost write.
pub fn write_all(fd: i32, buf: &[u8]) {
    let mut written: usize = 0;
    while written < buf.len() {
        let ret = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if ret < 0 {
            let err = nix::errno::errno();
            if err == libc::EINTR {
                continue;
            }
            fatal!("Can't write {} bytes: errno {}", buf.len() - written, err);
        }
        written += ret as usize;
    }
}

/// Read up to `buf.len()` bytes. Returns the number actually read,
/// which is smaller only at end-of-file.
pub fn read_to_fill(fd: i32, buf: &mut [u8]) -> usize {
    let mut done: usize = 0;
    while done < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if ret < 0 {
            let err = nix::errno::errno();
            if err == libc::EINTR {
                continue;
            }
            fatal!("Can't read {} bytes: errno {}", buf.len() - done, err);
        }
        if ret == 0 {
            break;
        }
        done += ret as usize;
    }
    done
}

pub fn pwrite_all_fallible(fd: i32, buf_initial: &[u8], offset: isize) -> Result<usize, i32> {
    let mut buf = buf_initial;
    let mut written: usize = 0;
    let mut cur_offset = offset;
    while !buf.is_empty() {
        let ret = unsafe {
            libc::pwrite64(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                cur_offset as i64,
            )
        };
        if ret < 0 {
            let err = nix::errno::errno();
            if err == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            break;
        }
        written += ret as usize;
        cur_offset += ret as isize;
        buf = &buf[ret as usize..];
    }
    Ok(written)
}

pub fn resize_shmem_segment(fd: &ScopedFd, num_bytes: usize) {
    if ftruncate(fd.as_raw(), num_bytes as libc::off_t).is_err() {
        fatal!("Failed to resize shmem to {} bytes", num_bytes);
    }
}

/// The directory for engine-private temporary files: sockets for fd
/// retrieval, emulated files, scratch. Honors $TMPDIR.
pub fn tmp_dir() -> OsString {
    let mut dir = env::var_os("TMPDIR").unwrap_or_else(|| OsString::from("/tmp"));
    if stat(dir.as_os_str()).is_err() {
        dir = OsString::from("/tmp");
    }
    dir
}

/// Find `needle` in `haystack`, byte-wise.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let mut from = 0;
    while let Some(pos) = memchr::memchr(needle[0], &haystack[from..]) {
        let at = from + pos;
        if at + needle.len() > haystack.len() {
            return None;
        }
        if &haystack[at..at + needle.len()] == needle {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

pub fn u8_slice<T>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub fn u8_slice_mut<T>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

/// Interpret si_code for SIGTRAP: values <= 0 are user- or tkill-generated,
/// positive values come from the kernel trap machinery.
pub fn is_kernel_trap(si_code: i32) -> bool {
    si_code > 0
}

pub fn signal_bit(sig: i32) -> u64 {
    1u64 << (sig - 1)
}

pub fn proc_mem_path(tid: libc::pid_t) -> OsString {
    OsString::from(format!("/proc/{}/mem", tid))
}

pub fn proc_maps_path(tid: libc::pid_t) -> OsString {
    OsString::from(format!("/proc/{}/maps", tid))
}

pub fn os_str_from_bytes(bytes: &[u8]) -> &OsStr {
    OsStr::from_bytes(bytes)
}

/// Retry `f` a bounded number of times while it reports EINTR or ESRCH.
/// Used around PTRACE_DETACH and friends during shutdown, where the
/// tracee may be mid-exit.
pub fn retry_transient<F>(attempts: usize, mut f: F) -> nix::Result<()>
where
    F: FnMut() -> nix::Result<()>,
{
    let mut last = Ok(());
    for _ in 0..attempts {
        last = f();
        match last {
            Ok(()) => return Ok(()),
            Err(e) => {
                let errno = e.as_errno();
                if errno != Some(nix::errno::Errno::EINTR)
                    && errno != Some(nix::errno::Errno::ESRCH)
                {
                    return last;
                }
            }
        }
    }
    last
}

pub fn c_long_size() -> usize {
    std::mem::size_of::<c_long>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let p = page_size();
        assert_eq!(floor_page_size(0), 0);
        assert_eq!(floor_page_size(p - 1), 0);
        assert_eq!(floor_page_size(p), p);
        assert_eq!(ceil_page_size(1), p);
        assert_eq!(ceil_page_size(p), p);
        assert_eq!(ceil_page_size(p + 1), 2 * p);
        assert!(is_page_aligned(2 * p));
        assert!(!is_page_aligned(p + 7));
    }

    #[test]
    fn find_bytes_basic() {
        let hay = b"cmp $-4095,%rax; jae x";
        assert_eq!(find_bytes(hay, b"-4095"), Some(5));
        assert_eq!(find_bytes(hay, b"jbe"), None);
        assert_eq!(find_bytes(hay, b""), None);
    }

    #[test]
    fn signal_bits() {
        assert_eq!(signal_bit(1), 1);
        assert_eq!(signal_bit(libc::SIGSEGV), 1 << (libc::SIGSEGV - 1));
    }
}
