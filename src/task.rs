use crate::event::Event;
use crate::extra_registers::ExtraRegisters;
use crate::kernel_abi::{syscall_number_for_exit, SupportedArch, NATIVE_ARCH};
use crate::kernel_supplement::{PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP};
use crate::perf_counters::{PerfCounters, TicksSemantics};
use crate::preload_interface::{preload_globals, syscallbuf_hdr};
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::sig::Sig;
use crate::ticks::Ticks;
use crate::uid::{AddressSpaceUid, TaskUid, ThreadGroupUid};
use crate::util::{proc_mem_path, u8_slice, u8_slice_mut};
use crate::wait_status::WaitStatus;
use libc::{pid_t, ESRCH, __WALL};
use nix::errno::errno;
use nix::fcntl::OFlag;
use std::ffi::OsString;
use std::mem::size_of;

/// How to resume a stopped tracee.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeRequest {
    Cont,
    Singlestep,
    /// Run to the next syscall boundary.
    Syscall,
    /// Stop at syscall entry without letting the kernel execute the
    /// syscall. Replay's workhorse.
    Sysemu,
    SysemuSinglestep,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitRequest {
    /// Resume and wait for the next stop.
    ResumeAndWait,
    /// Resume only; the caller will wait.
    ResumeNonblocking,
}

/// How many ticks to let the counter run before interrupting, 0 for
/// unbounded.
pub type TicksRequest = Ticks;

/// One tracee thread. All tracer-side knowledge about the thread lives
/// here: ptrace status, cached registers, tick count, syscallbuf plumbing
/// and the /proc/<tid>/mem handle.
///
/// A Task refers to its address space and thread group by uid; the owning
/// session resolves them. (Tasks sharing a vm or group are common, so the
/// entities cannot own one another.)
pub struct Task {
    pub tid: pid_t,
    /// The tid during recording. Differs from `tid` in replay sessions.
    pub rec_tid: pid_t,
    pub serial: u32,
    pub vm_uid: AddressSpaceUid,
    pub tg_uid: ThreadGroupUid,

    registers: Registers,
    extra_registers: ExtraRegisters,
    registers_known: bool,
    registers_dirty: bool,

    ticks: Ticks,
    pub hpc: PerfCounters,

    status: WaitStatus,
    is_stopped: bool,
    pub seen_ptrace_exit_event: bool,
    /// Set when the task is dying without a clean detach; consistency
    /// checks relax.
    pub unstable: bool,

    pub pending_siginfo: libc::siginfo_t,

    /// Memory access handle; reopened after each exec.
    child_mem_fd: ScopedFd,

    /// The task's scratch region, carved out at creation time.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// Syscall-buffer plumbing, null until rtcall_init_buffers.
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    pub syscallbuf_size: usize,
    pub preload_globals_child: RemotePtr<preload_globals>,
    pub desched_fd_child: i32,

    /// The event the task is currently in, record-side.
    pub ev: Event,

    /// Name of the executable, for diagnostics.
    pub exe_name: OsString,
}

impl Task {
    pub fn new(tid: pid_t, rec_tid: pid_t, serial: u32) -> Task {
        Task {
            tid,
            rec_tid: if rec_tid > 0 { rec_tid } else { tid },
            serial,
            vm_uid: AddressSpaceUid::default(),
            tg_uid: ThreadGroupUid::default(),
            registers: Registers::default(),
            extra_registers: ExtraRegisters::default(),
            registers_known: false,
            registers_dirty: false,
            ticks: 0,
            hpc: PerfCounters::new(tid, TicksSemantics::RetiredConditionalBranches),
            status: WaitStatus::default(),
            is_stopped: false,
            seen_ptrace_exit_event: false,
            unstable: false,
            pending_siginfo: unsafe { std::mem::zeroed() },
            child_mem_fd: ScopedFd::new(),
            scratch_ptr: RemotePtr::null(),
            scratch_size: 0,
            syscallbuf_child: RemotePtr::null(),
            syscallbuf_size: 0,
            preload_globals_child: RemotePtr::null(),
            desched_fd_child: -1,
            ev: Event::default(),
            exe_name: OsString::new(),
        }
    }

    pub fn uid(&self) -> TaskUid {
        TaskUid::new(self.rec_tid, self.serial)
    }

    pub fn arch(&self) -> SupportedArch {
        // Replay of 32-bit traces on a 64-bit host keeps the recorded arch
        // in the registers.
        if self.registers_known {
            self.registers.arch()
        } else {
            NATIVE_ARCH
        }
    }

    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    pub fn set_tick_count(&mut self, ticks: Ticks) {
        self.ticks = ticks;
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    pub fn status(&self) -> WaitStatus {
        self.status
    }

    pub fn set_status_for_test(&mut self, status: WaitStatus) {
        self.status = status;
        self.is_stopped = true;
    }

    // --- ptrace plumbing ---

    fn ptrace(
        &self,
        request: libc::c_uint,
        addr: usize,
        data: usize,
    ) -> Result<libc::c_long, i32> {
        let ret = unsafe {
            libc::ptrace(
                request,
                self.tid,
                addr as *mut libc::c_void,
                data as *mut libc::c_void,
            )
        };
        if ret == -1 && errno() != 0 {
            Err(errno())
        } else {
            Ok(ret)
        }
    }

    fn ptrace_or_die(&self, request: libc::c_uint, addr: usize, data: usize) -> libc::c_long {
        // errno must be clear to distinguish -1 results from failures.
        unsafe { nix::errno::Errno::clear() };
        match self.ptrace(request, addr, data) {
            Ok(ret) => ret,
            Err(err) => {
                fatal!(
                    "ptrace({}) on tid {} failed: errno {}",
                    request,
                    self.tid,
                    err
                );
            }
        }
    }

    /// Ptrace that tolerates the task having died: ESRCH is swallowed.
    pub fn ptrace_if_alive(&self, request: libc::c_uint, addr: usize, data: usize) -> bool {
        unsafe { nix::errno::Errno::clear() };
        match self.ptrace(request, addr, data) {
            Ok(_) => true,
            Err(err) if err == ESRCH => false,
            Err(err) => {
                fatal!(
                    "ptrace({}) on tid {} failed: errno {}",
                    request,
                    self.tid,
                    err
                );
            }
        }
    }

    pub fn set_ptrace_options(&self) {
        let options = libc::PTRACE_O_TRACESYSGOOD
            | libc::PTRACE_O_TRACEFORK
            | libc::PTRACE_O_TRACEVFORK
            | libc::PTRACE_O_TRACECLONE
            | libc::PTRACE_O_TRACEEXEC
            | libc::PTRACE_O_TRACEEXIT;
        self.ptrace_or_die(libc::PTRACE_SETOPTIONS, 0, options as usize);
    }

    // --- registers ---

    pub fn regs(&mut self) -> &Registers {
        self.ensure_regs();
        &self.registers
    }

    /// The cached registers without a fetch; only valid at a stop after
    /// `regs()` or `did_waitpid`.
    pub fn regs_known(&self) -> &Registers {
        debug_assert!(self.registers_known);
        &self.registers
    }

    fn ensure_regs(&mut self) {
        if self.registers_known {
            return;
        }
        debug_assert!(self.is_stopped, "register read while tracee is running");
        let mut raw = [0u8; 27 * 8];
        unsafe { nix::errno::Errno::clear() };
        match self.ptrace(libc::PTRACE_GETREGS, 0, raw.as_mut_ptr() as usize) {
            Ok(_) => {
                self.registers = Registers::set_from_raw_bytes(NATIVE_ARCH, &raw);
            }
            Err(err) if err == ESRCH => {
                // The task died under us (exit status in hand, registers
                // gone); the last-known values stand in.
            }
            Err(err) => {
                fatal!("PTRACE_GETREGS on tid {} failed: errno {}", self.tid, err);
            }
        }
        self.registers_known = true;
    }

    pub fn set_regs(&mut self, regs: Registers) {
        debug_assert!(self.is_stopped);
        self.registers = regs;
        self.registers_known = true;
        self.registers_dirty = true;
    }

    pub fn flush_regs(&mut self) {
        if !self.registers_dirty {
            return;
        }
        let raw = self.registers.raw_bytes();
        self.ptrace_or_die(libc::PTRACE_SETREGS, 0, raw.as_ptr() as usize);
        self.registers_dirty = false;
    }

    pub fn ip(&mut self) -> RemoteCodePtr {
        self.regs().ip()
    }

    pub fn set_ip(&mut self, ip: RemoteCodePtr) {
        let mut r = *self.regs();
        r.set_ip(ip);
        self.set_regs(r);
    }

    pub fn extra_regs(&mut self) -> &ExtraRegisters {
        // Fetched on demand; the engine only needs these for marks and for
        // the debugger, both rare relative to stops.
        if self.extra_registers.is_empty() && self.is_stopped {
            let mut buf = vec![0u8; 4096];
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            const NT_X86_XSTATE: usize = 0x202;
            if self
                .ptrace(
                    libc::PTRACE_GETREGSET,
                    NT_X86_XSTATE,
                    &mut iov as *mut libc::iovec as usize,
                )
                .is_ok()
            {
                buf.truncate(iov.iov_len);
                self.extra_registers = ExtraRegisters::from_xsave(self.arch(), buf);
            }
        }
        &self.extra_registers
    }

    pub fn set_extra_regs(&mut self, regs: ExtraRegisters) {
        if regs.is_empty() {
            return;
        }
        let mut iov = libc::iovec {
            iov_base: regs.data().as_ptr() as *mut libc::c_void,
            iov_len: regs.data().len(),
        };
        const NT_X86_XSTATE: usize = 0x202;
        let _ = self.ptrace(
            libc::PTRACE_SETREGSET,
            NT_X86_XSTATE,
            &mut iov as *mut libc::iovec as usize,
        );
        self.extra_registers = regs;
    }

    pub fn siginfo(&self) -> &libc::siginfo_t {
        &self.pending_siginfo
    }

    // --- resume / wait ---

    /// Resume the tracee. Register changes are flushed first; a nonzero
    /// `tick_period` programs the counter interrupt that bounds the
    /// timeslice.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait: WaitRequest,
        tick_period: TicksRequest,
        sig: Option<Sig>,
    ) {
        debug_assert!(self.is_stopped);
        self.flush_regs();
        self.hpc.reset(tick_period);

        let request = match how {
            ResumeRequest::Cont => libc::PTRACE_CONT,
            ResumeRequest::Singlestep => libc::PTRACE_SINGLESTEP,
            ResumeRequest::Syscall => libc::PTRACE_SYSCALL,
            ResumeRequest::Sysemu => PTRACE_SYSEMU,
            ResumeRequest::SysemuSinglestep => PTRACE_SYSEMU_SINGLESTEP,
        };
        let sig_data = sig.map(|s| s.as_raw() as usize).unwrap_or(0);
        if !self.ptrace_if_alive(request, 0, sig_data) {
            // Task died under us; synthesize the exit status.
            self.status = WaitStatus::for_fatal_sig(libc::SIGKILL);
            return;
        }
        self.is_stopped = false;
        self.registers_known = false;
        self.extra_registers = ExtraRegisters::default();

        if wait == WaitRequest::ResumeAndWait {
            self.wait();
        }
    }

    /// Block until the next stop. EINTR re-polls; the caller's interrupt
    /// flag is checked at safe points above this layer.
    pub fn wait(&mut self) {
        debug_assert!(!self.is_stopped);
        let mut raw_status: i32 = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
            if ret == self.tid {
                break;
            }
            if ret < 0 {
                let err = errno();
                if err == libc::EINTR {
                    continue;
                }
                if err == libc::ECHILD {
                    // Reaped elsewhere; treat as exit.
                    raw_status = 0;
                    break;
                }
                fatal!("waitpid({}) failed: errno {}", self.tid, err);
            }
        }
        self.did_waitpid(WaitStatus::new(raw_status));
    }

    /// Fold a wait status into the task: account ticks, cache the stop
    /// signal's siginfo, note ptrace-exit.
    pub fn did_waitpid(&mut self, status: WaitStatus) {
        self.status = status;
        self.is_stopped = true;
        self.registers_known = false;
        self.registers_dirty = false;

        self.ticks += self.hpc.read_ticks();
        self.hpc.stop();

        if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXIT) {
            self.seen_ptrace_exit_event = true;
        }
        if let Some(_sig) = status.stop_sig() {
            let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
            if self
                .ptrace(
                    libc::PTRACE_GETSIGINFO,
                    0,
                    &mut si as *mut libc::siginfo_t as usize,
                )
                .is_ok()
            {
                self.pending_siginfo = si;
            }
        }
    }

    // --- memory access ---

    pub fn open_mem_fd(&mut self) {
        self.child_mem_fd = ScopedFd::open_path(
            proc_mem_path(self.tid).as_os_str(),
            OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_LARGEFILE,
        );
        if !self.child_mem_fd.is_open() {
            log!(
                crate::log::LogWarn,
                "Can't open /proc/{}/mem; falling back to ptrace transfers",
                self.tid
            );
        }
    }

    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, i32> {
        debug_assert!(self.is_stopped, "memory read while tracee is running");
        if buf.is_empty() {
            return Ok(0);
        }
        if self.child_mem_fd.is_open() {
            let ret = unsafe {
                libc::pread64(
                    self.child_mem_fd.as_raw(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    addr.as_usize() as i64,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
        }
        self.read_bytes_ptrace(addr, buf)
    }

    pub fn read_bytes(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) {
        match self.read_bytes_fallible(addr, buf) {
            Ok(n) if n == buf.len() => {}
            other => {
                fatal!(
                    "Failed to read {} bytes at {} from tid {}: {:?}",
                    buf.len(),
                    addr,
                    self.tid,
                    other
                );
            }
        }
    }

    fn read_bytes_ptrace(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, i32> {
        let word = size_of::<libc::c_long>();
        let mut read = 0;
        while read < buf.len() {
            let word_addr = (addr.as_usize() + read) & !(word - 1);
            let offset = addr.as_usize() + read - word_addr;
            unsafe { nix::errno::Errno::clear() };
            let val = self.ptrace(libc::PTRACE_PEEKDATA, word_addr, 0)?;
            let bytes = val.to_ne_bytes();
            let n = std::cmp::min(word - offset, buf.len() - read);
            buf[read..read + n].copy_from_slice(&bytes[offset..offset + n]);
            read += n;
        }
        Ok(read)
    }

    pub fn write_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
    ) -> Result<usize, i32> {
        debug_assert!(self.is_stopped, "memory write while tracee is running");
        if buf.is_empty() {
            return Ok(0);
        }
        if self.child_mem_fd.is_open() {
            let ret = unsafe {
                libc::pwrite64(
                    self.child_mem_fd.as_raw(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    addr.as_usize() as i64,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
        }
        self.write_bytes_ptrace(addr, buf)
    }

    pub fn write_bytes(&mut self, addr: RemotePtr<Void>, buf: &[u8]) {
        match self.write_bytes_fallible(addr, buf) {
            Ok(n) if n == buf.len() => {}
            other => {
                fatal!(
                    "Failed to write {} bytes at {} to tid {}: {:?}",
                    buf.len(),
                    addr,
                    self.tid,
                    other
                );
            }
        }
    }

    fn write_bytes_ptrace(&mut self, addr: RemotePtr<Void>, buf: &[u8]) -> Result<usize, i32> {
        let word = size_of::<libc::c_long>();
        let mut written = 0;
        while written < buf.len() {
            let word_addr = (addr.as_usize() + written) & !(word - 1);
            let offset = addr.as_usize() + written - word_addr;
            let n = std::cmp::min(word - offset, buf.len() - written);
            let mut bytes;
            if n == word {
                bytes = [0u8; size_of::<libc::c_long>()];
            } else {
                // Partial word: read-modify-write.
                unsafe { nix::errno::Errno::clear() };
                let val = self.ptrace(libc::PTRACE_PEEKDATA, word_addr, 0)?;
                bytes = val.to_ne_bytes();
            }
            bytes[offset..offset + n].copy_from_slice(&buf[written..written + n]);
            let val = libc::c_long::from_ne_bytes(bytes);
            self.ptrace(libc::PTRACE_POKEDATA, word_addr, val as usize)?;
            written += n;
        }
        Ok(written)
    }

    pub fn read_val_mem<T: Copy + Default>(&mut self, addr: RemotePtr<T>) -> T {
        let mut val = T::default();
        let addr_v: RemotePtr<Void> = addr.cast();
        // Safe: T is plain data by the Copy bound and we fill every byte.
        self.read_bytes(addr_v, u8_slice_mut(&mut val));
        val
    }

    pub fn write_val_mem<T: Copy>(&mut self, addr: RemotePtr<T>, val: &T) {
        let addr_v: RemotePtr<Void> = addr.cast();
        self.write_bytes(addr_v, u8_slice(val));
    }

    pub fn read_mem_vec(&mut self, addr: RemotePtr<Void>, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf);
        buf
    }

    /// Read a NUL-terminated string, page by page so an unmapped tail page
    /// after the NUL doesn't fault.
    pub fn read_c_str(&mut self, addr: RemotePtr<u8>) -> Vec<u8> {
        let mut result = Vec::new();
        let mut p: RemotePtr<Void> = addr.cast();
        loop {
            let page_end = crate::util::floor_page_size(p.as_usize()) + crate::util::page_size();
            let chunk = page_end - p.as_usize();
            let mut buf = vec![0u8; chunk];
            self.read_bytes(p, &mut buf);
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                result.extend_from_slice(&buf[..nul]);
                return result;
            }
            result.extend_from_slice(&buf);
            p = RemotePtr::from_val(page_end);
        }
    }

    // --- lifecycle ---

    /// Write an exit syscall into the tracee at its current ip and detach,
    /// so the task unwinds cleanly without running more user code. Used by
    /// kill_all_tasks.
    pub fn try_graceful_exit(&mut self) -> bool {
        if !self.is_stopped {
            return false;
        }
        let arch = self.arch();
        let mut r = *self.regs();
        r.set_syscallno(i64::from(syscall_number_for_exit(arch)));
        r.set_arg1(0);
        self.set_regs(r);
        self.flush_regs();
        self.detach(None)
    }

    pub fn detach(&mut self, sig: Option<Sig>) -> bool {
        let data = sig.map(|s| s.as_raw() as usize).unwrap_or(0);
        crate::util::retry_transient(3, || {
            unsafe { nix::errno::Errno::clear() };
            match self.ptrace(libc::PTRACE_DETACH, 0, data) {
                Ok(_) => Ok(()),
                Err(e) => Err(nix::Error::from_errno(
                    nix::errno::Errno::from_i32(e),
                )),
            }
        })
        .is_ok()
    }

    pub fn kill(&self) {
        unsafe {
            libc::kill(self.tid, libc::SIGKILL);
        }
    }

    pub fn tgkill(&self, tgid: pid_t, sig: i32) {
        unsafe {
            libc::syscall(libc::SYS_tgkill, tgid, self.tid, sig);
        }
    }

    /// Must run after every exec: the old mem fd refers to the torn-down
    /// address space.
    pub fn post_exec(&mut self, exe_name: &std::ffi::OsStr) {
        self.open_mem_fd();
        self.exe_name = exe_name.to_owned();
        self.syscallbuf_child = RemotePtr::null();
        self.preload_globals_child = RemotePtr::null();
        self.desched_fd_child = -1;
    }
}
