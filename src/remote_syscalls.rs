use crate::kernel_abi::{
    syscall_number_for_close, syscall_number_for_connect, syscall_number_for_sendmsg,
    syscall_number_for_socket, SupportedArch,
};
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::{ResumeRequest, Task, WaitRequest};
use crate::util::tmp_dir;
use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, ControlMessageOwned, MsgFlags, SockAddr,
    SockFlag, SockType, UnixAddr,
};
use nix::sys::uio::IoVec;
use nix::unistd::getpid;
use std::mem::size_of;
use std::path::PathBuf;

/// Scratch placement rule: the region below the tracee's stack pointer must
/// be private, writable, and leave this much headroom before we park
/// parameters there.
pub const SCRATCH_HEADROOM: usize = 2048;

/// Check whether a mapping with the given properties can host remote-syscall
/// parameters at `sp`.
pub fn is_usable_area(
    map_private: bool,
    prot_writable: bool,
    map_start: RemotePtr<Void>,
    sp: RemotePtr<Void>,
) -> bool {
    map_private && prot_writable && map_start.byte_add(SCRATCH_HEADROOM) <= sp
}

/// Runs syscalls chosen by the tracer inside a stopped tracee.
///
/// On construction the task's registers are saved; every mutation this type
/// makes (ip moved to the syscall instruction, argument registers, scratch
/// bytes on the stack) is undone on drop, in LIFO order, so the tracee
/// cannot observe that anything happened. Dropping during a panic still
/// restores; a divergent tracee is worse than a lost panic message.
pub struct RemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    /// IP of a known traced-syscall instruction, normally in the stub page.
    syscall_ip: RemoteCodePtr,
    /// Stack of (addr, original bytes) to restore, innermost last.
    saved_mem: Vec<(RemotePtr<Void>, Vec<u8>)>,
    /// Bytes of scratch currently allocated below the initial sp.
    scratch_used: usize,
}

impl<'a> RemoteSyscalls<'a> {
    /// Prepare `t` for remote syscalls. The caller must ensure no signal
    /// can be delivered to `t` while this exists, and must pass the
    /// address-space's traced-syscall IP.
    pub fn new(t: &'a mut Task, syscall_ip: RemoteCodePtr) -> RemoteSyscalls<'a> {
        let initial_regs = *t.regs();
        RemoteSyscalls {
            t,
            initial_regs,
            syscall_ip,
            saved_mem: Vec::new(),
            scratch_used: 0,
        }
    }

    pub fn task(&mut self) -> &mut Task {
        self.t
    }

    pub fn initial_regs(&self) -> &Registers {
        &self.initial_regs
    }

    pub fn arch(&self) -> SupportedArch {
        self.initial_regs.arch()
    }

    /// Reserve `len` bytes of tracee stack, saving the original contents
    /// for restore. Returns the address of the reservation.
    fn reserve_stack(&mut self, len: usize) -> RemotePtr<Void> {
        let sp = self.initial_regs.sp();
        let aligned = (len + 15) & !15;
        let addr = RemotePtr::from_val(
            sp.as_usize() - SCRATCH_HEADROOM - self.scratch_used - aligned,
        );
        let saved = self.t.read_mem_vec(addr, aligned);
        self.saved_mem.push((addr, saved));
        self.scratch_used += aligned;
        addr
    }

    /// Write `data` into reserved stack space; the bytes are restored when
    /// this scope ends.
    pub fn push_bytes(&mut self, data: &[u8]) -> RemotePtr<Void> {
        let addr = self.reserve_stack(data.len());
        self.t.write_bytes(addr, data);
        addr
    }

    pub fn push_cstr(&mut self, s: &[u8]) -> RemotePtr<Void> {
        let mut with_nul = s.to_vec();
        with_nul.push(0);
        self.push_bytes(&with_nul)
    }

    /// Execute `syscallno` with the given arguments. Returns the raw kernel
    /// result; negative values in the errno window are failures.
    /// Err(ESRCH) if the task died mid-call.
    pub fn syscall(&mut self, syscallno: i32, args: &[usize]) -> Result<isize, i32> {
        debug_assert!(args.len() <= 6);
        let mut callregs = self.initial_regs;
        callregs.set_ip(self.syscall_ip);
        callregs.set_syscallno(i64::from(syscallno));
        callregs.set_original_syscallno(i64::from(syscallno));
        for (i, arg) in args.iter().enumerate() {
            callregs.set_arg(i + 1, *arg);
        }
        self.t.set_regs(callregs);

        // First stop: syscall entry.
        self.t.resume_execution(
            ResumeRequest::Syscall,
            WaitRequest::ResumeAndWait,
            0,
            None,
        );
        if self.t.status().ptrace_event() == Some(libc::PTRACE_EVENT_EXIT) {
            return Err(libc::ESRCH);
        }
        if !self.t.status().is_syscall() {
            fatal!(
                "Expected syscall entry in tid {}, got {}",
                self.t.tid,
                self.t.status()
            );
        }
        let entered = self.t.regs().original_syscallno();
        ed_assert!(
            self.t,
            entered == i64::from(syscallno),
            "entered syscall {} instead of {}",
            entered,
            syscallno
        );

        // Second stop: syscall exit.
        self.t.resume_execution(
            ResumeRequest::Syscall,
            WaitRequest::ResumeAndWait,
            0,
            None,
        );
        if self.t.status().ptrace_event() == Some(libc::PTRACE_EVENT_EXIT) {
            return Err(libc::ESRCH);
        }
        Ok(self.t.regs().syscall_result_signed() as isize)
    }

    /// `syscall` that treats a failure return as fatal; for calls the
    /// engine cannot proceed without.
    pub fn infallible_syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        match self.syscall(syscallno, args) {
            Ok(ret) if !crate::kernel_abi::syscall_result_is_error(ret as i64) => ret,
            other => {
                fatal!(
                    "Remote syscall {} in tid {} failed: {:?}",
                    syscallno,
                    self.t.tid,
                    other
                );
            }
        }
    }

    /// Have the tracee send us its fd `remote_fd` over an AF_UNIX socket in
    /// the engine's tmp directory, SCM_RIGHTS carrying the descriptor.
    pub fn retrieve_fd(&mut self, remote_fd: i32) -> ScopedFd {
        let arch = self.arch();
        let mut path = PathBuf::from(tmp_dir());
        path.push(format!("retrace-fd-{}-{}", getpid(), self.t.tid));
        let path_bytes = path.as_os_str().to_os_string();

        // Tracer side: listen.
        let listen_fd = match socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(e) => fatal!("Failed to create fd-transfer socket: {}", e),
        };
        let _ = std::fs::remove_file(&path);
        let addr = UnixAddr::new(path.as_path()).unwrap();
        if bind(listen_fd.as_raw(), &SockAddr::Unix(addr)).is_err()
            || listen(listen_fd.as_raw(), 1).is_err()
        {
            fatal!("Failed to bind fd-transfer socket at {:?}", path);
        }

        // Tracee side: socket(); connect(); sendmsg() with SCM_RIGHTS.
        let child_sock = self.infallible_syscall(
            syscall_number_for_socket(arch),
            &[
                libc::AF_UNIX as usize,
                libc::SOCK_STREAM as usize,
                0,
            ],
        ) as i32;

        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = std::os::unix::ffi::OsStrExt::as_bytes(path_bytes.as_os_str());
        for (i, b) in bytes.iter().enumerate() {
            sun.sun_path[i] = *b as libc::c_char;
        }
        let remote_sun = self.push_bytes(crate::util::u8_slice(&sun));
        self.infallible_syscall(
            syscall_number_for_connect(arch),
            &[
                child_sock as usize,
                remote_sun.as_usize(),
                size_of::<libc::sockaddr_un>(),
            ],
        );

        let accepted = match accept(listen_fd.as_raw()) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(e) => fatal!("accept() on fd-transfer socket failed: {}", e),
        };

        // Build the tracee's msghdr: 1 dummy byte of payload, one cmsg
        // carrying the fd.
        let dummy = self.push_bytes(b"F");
        let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<i32>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];
        {
            let hdr = cmsg_buf.as_mut_ptr() as *mut libc::cmsghdr;
            unsafe {
                (*hdr).cmsg_len = libc::CMSG_LEN(size_of::<i32>() as u32) as usize;
                (*hdr).cmsg_level = libc::SOL_SOCKET;
                (*hdr).cmsg_type = libc::SCM_RIGHTS;
                let data = libc::CMSG_DATA(hdr) as *mut u8;
                let fd_bytes = remote_fd.to_ne_bytes();
                std::ptr::copy_nonoverlapping(fd_bytes.as_ptr(), data, size_of::<i32>());
            }
        }
        let remote_cmsg = self.push_bytes(&cmsg_buf);

        let iov = libc::iovec {
            iov_base: dummy.as_usize() as *mut libc::c_void,
            iov_len: 1,
        };
        let remote_iov = self.push_bytes(crate::util::u8_slice(&iov));

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = remote_iov.as_usize() as *mut libc::iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = remote_cmsg.as_usize() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space;
        let remote_msg = self.push_bytes(crate::util::u8_slice(&msg));

        self.infallible_syscall(
            syscall_number_for_sendmsg(arch),
            &[child_sock as usize, remote_msg.as_usize(), 0],
        );

        // Tracer side: receive the fd.
        let mut byte_buf = [0u8; 1];
        let iov_recv = [IoVec::from_mut_slice(&mut byte_buf)];
        let mut cmsgspace = nix::cmsg_space!(i32);
        let received = match nix::sys::socket::recvmsg(
            accepted.as_raw(),
            &iov_recv,
            Some(&mut cmsgspace),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let mut fd = -1;
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(f) = fds.first() {
                            fd = *f;
                        }
                    }
                }
                fd
            }
            Err(e) => fatal!("recvmsg() for fd transfer failed: {}", e),
        };
        if received < 0 {
            fatal!("Tracee sent no fd over the transfer socket");
        }

        // Close the tracee's temporary socket and clean the path.
        self.infallible_syscall(syscall_number_for_close(arch), &[child_sock as usize]);
        let _ = std::fs::remove_file(&path);

        ScopedFd::from_raw(received)
    }

    fn restore_state(&mut self) {
        // LIFO: later saves may overlap earlier reservations.
        while let Some((addr, bytes)) = self.saved_mem.pop() {
            if self.t.write_bytes_fallible(addr, &bytes).is_err() {
                log!(
                    crate::log::LogWarn,
                    "Couldn't restore scratch at {} in dead tid {}",
                    addr,
                    self.t.tid
                );
            }
        }
        self.t.set_regs(self.initial_regs);
        self.t.flush_regs();
    }
}

impl<'a> Drop for RemoteSyscalls<'a> {
    fn drop(&mut self) {
        self.restore_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_area_headroom() {
        let start = RemotePtr::from_val(0x1000);
        let sp_good = RemotePtr::from_val(0x1000 + SCRATCH_HEADROOM);
        let sp_bad = RemotePtr::from_val(0x1000 + SCRATCH_HEADROOM - 1);
        assert!(is_usable_area(true, true, start, sp_good));
        assert!(!is_usable_area(true, true, start, sp_bad));
        assert!(!is_usable_area(false, true, start, sp_good));
        assert!(!is_usable_area(true, false, start, sp_good));
    }
}
