use crate::address_space::AddressSpace;
use crate::event::{Event, SignalDeterministic, SignalEventData, SyscallEventData, SyscallState};
use crate::kernel_abi::{
    is_clone_syscall, is_execve_syscall, is_sched_yield_syscall, SupportedArch,
};
use crate::patcher::Patcher;
use crate::perf_counters::TIME_SLICE_SIGNAL;
use crate::preload_interface::{
    rtcall_init_buffers_params, rtcall_init_preload_params, syscall_patch_hook,
    SYSCALLBUF_DEFAULT_SIZE, SYS_rtcall_init_buffers, SYS_rtcall_init_preload,
    SYS_rtcall_notify_syscall_hook_exit,
};
use crate::remote_ptr::{RemotePtr, Void};
use crate::scheduler::{Scheduler, DEFAULT_MAX_TICKS};
use crate::session::{spawn_tracee, wait_for_exec, Session};
use crate::sig::Sig;
use crate::task::{ResumeRequest, Task, WaitRequest};
use crate::trace::frame::TraceFrame;
use crate::trace::task_event::{TimedTaskEvent, TraceTaskEvent};
use crate::trace::writer::{CloseStatus, TraceWriter};
use crate::uid::TaskUid;
use crate::util::monotonic_now_sec;
use crate::wait_status::{WaitStatus, WaitType};
use libc::pid_t;
use std::collections::HashSet;
use std::convert::TryFrom;
use std::ffi::{OsStr, OsString};

/// The signal the desched counter delivers. Linux doesn't use SIGPWR for
/// anything a typical tracee cares about.
pub const DESCHED_SIGNAL: i32 = libc::SIGPWR;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordStatus {
    /// Some execution was recorded; call record_step again.
    StepContinue,
    /// All tracees are gone; `i32` is the initial process's exit code.
    StepExited(i32),
}

/// Records one execution of a command into a trace directory.
///
/// Tracees are multiplexed with waitpid(-1): at most one task is resumed by
/// us at a time, but a task blocked inside a syscall stays running in the
/// kernel while we schedule others, which is what the desched machinery
/// exists to make safe.
pub struct RecordSession {
    pub session: Session,
    trace_writer: TraceWriter,
    pub scheduler: Scheduler,
    pub patcher: Patcher,
    /// Tasks between syscall-entry and syscall-exit stops.
    in_syscall: HashSet<TaskUid>,
    /// Tasks whose next syscall exit is the tail of an aborted, patched
    /// syscall and must not be recorded.
    skip_next_syscall_exit: HashSet<TaskUid>,
    /// Signals to inject at the task's next resume.
    pending_deliveries: Vec<(TaskUid, i32)>,
    initial_thread_group_exit: Option<i32>,
    closed: bool,
}

impl RecordSession {
    pub fn create(
        argv: &[OsString],
        envp: &[OsString],
        cwd: &OsStr,
        bind_to_cpu: i32,
        chaos: bool,
    ) -> RecordSession {
        if argv.is_empty() {
            clean_fatal!("Nothing to record: empty command line");
        }
        let mut trace_writer = TraceWriter::new(&argv[0], bind_to_cpu);
        trace_writer.write_args_env(cwd, argv, envp);

        let mut session = Session::new();
        let tid = spawn_tracee(&argv[0], argv, envp, cwd);
        let serial = session.next_task_serial();
        let mut t = Task::new(tid, tid, serial);
        t.did_waitpid(WaitStatus::for_stop_sig(libc::SIGSTOP));
        wait_for_exec(&mut t);
        t.exe_name = argv[0].clone();

        let tg_uid = session.create_thread_group(tid, None);
        t.tg_uid = tg_uid;
        let vm = AddressSpace::new_after_exec(&mut t, &argv[0], 0);
        t.vm_uid = vm.uid();
        session.vms.insert(vm.uid(), vm);
        let tuid = t.uid();
        session.tasks.insert(tuid, t);

        let mut scheduler = Scheduler::new(DEFAULT_MAX_TICKS, chaos, false);
        scheduler.on_create(tuid, 0);

        let exec_event = TimedTaskEvent {
            time: trace_writer.time(),
            event: TraceTaskEvent::Exec {
                tid,
                file_name: argv[0].clone(),
                cmd_line: argv.to_vec(),
            },
        };
        trace_writer.write_task_event(&exec_event);

        RecordSession {
            session,
            trace_writer,
            scheduler,
            patcher: Patcher::new(),
            in_syscall: HashSet::new(),
            skip_next_syscall_exit: HashSet::new(),
            pending_deliveries: Vec::new(),
            initial_thread_group_exit: None,
            closed: false,
        }
    }

    pub fn trace_dir(&self) -> &OsStr {
        self.trace_writer.dir()
    }

    fn write_frame(&mut self, tuid: TaskUid, event: Event) {
        let (time, monotonic) = (self.trace_writer.time(), monotonic_now_sec());
        let t = self.session.task_mut(tuid);
        let mut frame = TraceFrame::new_with(time, t.rec_tid, event, t.tick_count(), monotonic);
        if frame.event().record_regs() {
            frame.set_regs(*t.regs());
            frame.set_extra_regs(t.extra_regs().clone());
        }
        self.trace_writer.write_frame(&frame);
    }

    fn record_remote_data(&mut self, tuid: TaskUid, addr: RemotePtr<Void>, len: usize) {
        if addr.is_null() || len == 0 {
            return;
        }
        let t = self.session.task_mut(tuid);
        let mut buf = vec![0u8; len];
        if let Ok(n) = t.read_bytes_fallible(addr, &mut buf) {
            buf.truncate(n);
            let rec_tid = t.rec_tid;
            self.trace_writer.write_raw(rec_tid, &buf, addr);
        }
    }

    /// Record output buffers for syscalls whose effects replay must
    /// reproduce by writing memory. The full per-syscall table lives
    /// outside the core; this covers the common memory-writing calls, and
    /// everything buffered goes through the syscallbuf flush path instead.
    fn record_syscall_outputs(&mut self, tuid: TaskUid) {
        let (arch, regs) = {
            let t = self.session.task_mut(tuid);
            (t.arch(), *t.regs())
        };
        let result = regs.syscall_result_signed();
        if crate::kernel_abi::syscall_result_is_error(result) {
            return;
        }
        let number = regs.original_syscallno() as i32;
        let no = |f: fn(SupportedArch) -> i32| f(arch);

        if number == no(crate::kernel_abi::syscall_number_for_read) {
            self.record_remote_data(tuid, RemotePtr::from_val(regs.arg2()), result as usize);
        } else if number == no(crate::kernel_abi::syscall_number_for_clock_gettime) {
            self.record_remote_data(
                tuid,
                RemotePtr::from_val(regs.arg2()),
                std::mem::size_of::<libc::timespec>(),
            );
        } else if number == no(crate::kernel_abi::syscall_number_for_poll) {
            let nfds = regs.arg2();
            self.record_remote_data(
                tuid,
                RemotePtr::from_val(regs.arg1()),
                nfds * std::mem::size_of::<libc::pollfd>(),
            );
        } else if number == no(crate::kernel_abi::syscall_number_for_ioctl)
            || number == no(crate::kernel_abi::syscall_number_for_fcntl)
        {
            // Value-returning commands only; out-parameter commands are
            // carried by the buffered path during normal operation.
        }
    }

    /// Flush the task's committed syscallbuf records into the trace, as one
    /// flush event followed (later) by a reset event.
    fn maybe_flush_syscallbuf(&mut self, tuid: TaskUid) {
        let (hdr_addr, total, record_count) = {
            let t = self.session.task_mut(tuid);
            if t.syscallbuf_child.is_null() {
                return;
            }
            let committed = crate::syscallbuf::committed_bytes(t);
            if committed == 0 {
                return;
            }
            // Parse before capturing: a record straddling the commit
            // watermark is a preload bug and must fail here, not at replay.
            let records = crate::syscallbuf::read_and_parse(t);
            (
                t.syscallbuf_child.cast::<Void>(),
                crate::preload_interface::SYSCALLBUF_HDR_SIZE + committed as usize,
                records.len(),
            )
        };
        log!(
            crate::log::LogDebug,
            "flushing {} syscallbuf records for {:?}",
            record_count,
            tuid
        );
        self.write_frame(tuid, Event::SyscallbufFlush);
        self.record_remote_data(tuid, hdr_addr, total);
        self.write_frame(tuid, Event::SyscallbufReset);
        let t = self.session.task_mut(tuid);
        crate::syscallbuf::reset_buffer(t);
    }

    /// One step of recording: resume the scheduled task if it's stopped,
    /// wait for any tracee to stop, and record what happened.
    pub fn record_step(&mut self) -> RecordStatus {
        if self.session.tasks.is_empty() {
            return RecordStatus::StepExited(self.initial_thread_group_exit.unwrap_or(0));
        }

        // Pick and resume a stopped task, if any.
        let stopped: Vec<TaskUid> = self
            .session
            .tasks
            .values()
            .filter(|t| t.is_stopped())
            .map(|t| t.uid())
            .collect();
        if !stopped.is_empty() {
            let stopped_set: HashSet<TaskUid> = stopped.iter().copied().collect();
            let current_ticks = self
                .scheduler
                .current()
                .and_then(|uid| self.session.tasks.get(&uid))
                .map(|t| t.tick_count())
                .unwrap_or(0);
            let choice = self.scheduler.choose_next(monotonic_now_sec(), current_ticks, &|uid| {
                stopped_set.contains(&uid)
            });
            if let Some((uid, _switch)) = choice {
                let pending_sig = self
                    .pending_deliveries
                    .iter()
                    .position(|(u, _)| *u == uid)
                    .map(|i| self.pending_deliveries.remove(i).1);
                let remaining = self
                    .scheduler
                    .current_timeslice_end()
                    .saturating_sub(self.session.task(uid).tick_count());
                let t = self.session.task_mut(uid);
                t.resume_execution(
                    ResumeRequest::Syscall,
                    WaitRequest::ResumeNonblocking,
                    remaining.max(1),
                    pending_sig.and_then(|s| Sig::try_from(s).ok()),
                );
            }
        }

        // Wait for any tracee.
        let (tuid, status) = match self.wait_any() {
            Some(pair) => pair,
            None => {
                return RecordStatus::StepExited(self.initial_thread_group_exit.unwrap_or(0));
            }
        };
        self.handle_stop(tuid, status)
    }

    fn wait_any(&mut self) -> Option<(TaskUid, WaitStatus)> {
        loop {
            let mut raw: i32 = 0;
            let tid = unsafe { libc::waitpid(-1, &mut raw, libc::__WALL) };
            if tid < 0 {
                let err = nix::errno::errno();
                if err == libc::EINTR {
                    if self.session.interrupted {
                        return None;
                    }
                    continue;
                }
                if err == libc::ECHILD {
                    return None;
                }
                fatal!("waitpid(-1) failed: errno {}", err);
            }
            let status = WaitStatus::new(raw);
            let uid = self
                .session
                .tasks
                .values()
                .find(|t| t.tid == tid)
                .map(|t| t.uid());
            match uid {
                Some(uid) => {
                    let t = self.session.task_mut(uid);
                    t.did_waitpid(status);
                    return Some((uid, status));
                }
                None => {
                    // A brand-new clone child stopping before we've
                    // processed its parent's clone event; hold it.
                    log!(
                        crate::log::LogDebug,
                        "wait() returned unknown tid {}; leaving it stopped",
                        tid
                    );
                    continue;
                }
            }
        }
    }

    fn handle_stop(&mut self, tuid: TaskUid, status: WaitStatus) -> RecordStatus {
        match status.wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                self.record_task_death(tuid, status);
            }
            WaitType::SyscallStop => {
                if self.in_syscall.remove(&tuid) {
                    self.handle_syscall_exit(tuid);
                } else {
                    self.handle_syscall_entry(tuid);
                }
            }
            WaitType::SignalStop => {
                let sig = status.stop_sig().unwrap();
                self.handle_signal(tuid, sig);
            }
            WaitType::PtraceEvent => {
                let event = status.ptrace_event().unwrap();
                self.handle_ptrace_event(tuid, event);
            }
            WaitType::GroupStop => {
                // Let the group stop happen; the task stays stopped for the
                // scheduler.
            }
        }
        if self.session.tasks.is_empty() {
            self.finish();
            return RecordStatus::StepExited(self.initial_thread_group_exit.unwrap_or(0));
        }
        RecordStatus::StepContinue
    }

    fn handle_syscall_entry(&mut self, tuid: TaskUid) {
        let (arch, number) = {
            let t = self.session.task_mut(tuid);
            let regs = *t.regs();
            (t.arch(), regs.original_syscallno() as i32)
        };

        if self.try_handle_rtcall(tuid, number) {
            // Engine calls are recorded as ordinary syscall events (the
            // kernel fails them with ENOSYS; the result is overwritten at
            // exit), so replay passes through the same entry/exit stops.
            let mut data = SyscallEventData::new(number, arch);
            data.state = SyscallState::EnteringSyscall;
            self.write_frame(tuid, Event::Syscall(data));
            self.in_syscall.insert(tuid);
            return;
        }

        if is_sched_yield_syscall(number, arch) {
            self.scheduler.schedule_one_round_robin(tuid);
        }

        // A blocking syscall boundary flushes buffered records first so the
        // trace orders them before the syscall's own event.
        self.maybe_flush_syscallbuf(tuid);

        if self.patcher.has_hooks() {
            let t = self.session.task_mut(tuid);
            if self.patcher.try_patch_syscall(t) {
                // Abort the in-flight syscall and resume at the patch site;
                // execution re-enters through the trampoline, which is what
                // the recorded event tells replay to reproduce.
                let insn_len = crate::kernel_abi::syscall_instruction_length(arch);
                let patch_ip = t.ip().rewind_to_syscall(insn_len);
                let mut regs = *t.regs();
                regs.set_original_syscallno(-1);
                regs.set_ip(patch_ip);
                t.set_regs(regs);
                t.flush_regs();
                self.write_frame(tuid, Event::PatchSyscall);
                self.in_syscall.insert(tuid);
                self.skip_next_syscall_exit.insert(tuid);
                return;
            }
        }

        let mut data = SyscallEventData::new(number, arch);
        data.state = SyscallState::EnteringSyscall;
        self.write_frame(tuid, Event::Syscall(data));
        self.in_syscall.insert(tuid);
    }

    fn handle_syscall_exit(&mut self, tuid: TaskUid) {
        if self.skip_next_syscall_exit.remove(&tuid) {
            return;
        }
        let (arch, number, mut regs) = {
            let t = self.session.task_mut(tuid);
            let regs = *t.regs();
            (t.arch(), regs.original_syscallno() as i32, regs)
        };

        // Engine calls: install the real result the library expects in
        // place of the kernel's ENOSYS.
        if number == SYS_rtcall_init_preload || number == SYS_rtcall_notify_syscall_hook_exit {
            let t = self.session.task_mut(tuid);
            regs.set_syscall_result(0);
            t.set_regs(regs);
            t.flush_regs();
        } else if number == SYS_rtcall_init_buffers {
            let t = self.session.task_mut(tuid);
            regs.set_syscall_result(t.syscallbuf_child.as_usize());
            t.set_regs(regs);
            t.flush_regs();
        }

        // The memory-map syscalls mutate the address space; track before
        // recording so verify() can run at the event boundary.
        self.track_memory_syscall(tuid, number, arch, &regs);
        self.record_syscall_outputs(tuid);

        if is_execve_syscall(number, arch)
            && !crate::kernel_abi::syscall_result_is_error(regs.syscall_result_signed())
        {
            self.handle_exec(tuid);
        }

        let mut data = SyscallEventData::new(number, arch);
        data.state = SyscallState::ExitingSyscall;
        self.write_frame(tuid, Event::Syscall(data));

        if crate::flags::Flags::get().check_cached_maps {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            vm.verify(t);
        }
    }

    fn track_memory_syscall(
        &mut self,
        tuid: TaskUid,
        number: i32,
        arch: SupportedArch,
        regs: &crate::registers::Registers,
    ) {
        use crate::kernel_abi::*;
        let result = regs.syscall_result_signed();
        if syscall_result_is_error(result) {
            return;
        }
        let vm = self.session.vm_of_mut(tuid);
        if is_mmap_syscall(number, arch) {
            let addr = RemotePtr::from_val(result as usize);
            let prot = nix::sys::mman::ProtFlags::from_bits_truncate(regs.arg3() as i32);
            let flags = nix::sys::mman::MapFlags::from_bits_truncate(regs.arg4() as i32);
            let km = vm.map(
                addr,
                regs.arg2(),
                prot,
                flags,
                (regs.arg6() as u64) * if arch == SupportedArch::X86 { 4096 } else { 1 },
                OsStr::new(""),
                crate::address_space::kernel_mapping::KernelMapping::NO_DEVICE,
                crate::address_space::kernel_mapping::KernelMapping::NO_INODE,
                None,
                None,
            );
            let meta = Default::default();
            let record = self.trace_writer.write_mapped_region(
                &km,
                &meta,
                crate::trace::writer::MappingOrigin::SyscallMapping,
            );
            if record == crate::trace::writer::RecordInTrace::RecordInTrace {
                self.record_remote_data(tuid, km.start(), km.size());
            }
        } else if number == syscall_number_for_munmap(arch) {
            vm.unmap(RemotePtr::from_val(regs.arg1()), regs.arg2());
        } else if number == syscall_number_for_mprotect(arch) {
            vm.protect(
                RemotePtr::from_val(regs.arg1()),
                regs.arg2(),
                nix::sys::mman::ProtFlags::from_bits_truncate(regs.arg3() as i32),
            );
        } else if number == syscall_number_for_mremap(arch) {
            vm.remap(
                RemotePtr::from_val(regs.arg1()),
                regs.arg2(),
                RemotePtr::from_val(result as usize),
                regs.arg3(),
            );
        } else if number == syscall_number_for_brk(arch) {
            vm.brk(
                RemotePtr::from_val(regs.syscall_result()),
                nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
            );
        }
    }

    /// Engine calls from the preload library. Returns true if `number` was
    /// one (the kernel will fail it with ENOSYS; the result is overwritten
    /// at exit).
    fn try_handle_rtcall(&mut self, tuid: TaskUid, number: i32) -> bool {
        match number {
            SYS_rtcall_init_preload => {
                let params_ptr = {
                    let t = self.session.task_mut(tuid);
                    RemotePtr::<rtcall_init_preload_params>::from_val(t.regs().arg1())
                };
                let t = self.session.task_mut(tuid);
                let params = t.read_val_mem(params_ptr);
                t.preload_globals_child = RemotePtr::from_val(params.globals as usize);
                let count = params.syscall_patch_hook_count as usize;
                let mut hooks = Vec::with_capacity(count);
                let hooks_ptr =
                    RemotePtr::<syscall_patch_hook>::from_val(params.syscall_patch_hooks as usize);
                for i in 0..count {
                    hooks.push(t.read_val_mem(hooks_ptr + i));
                }
                self.patcher.set_hooks(hooks);
                let vm = self.session.vm_of_mut(tuid);
                vm.set_syscallbuf_enabled(true);
                log!(
                    crate::log::LogDebug,
                    "preload library initialized ({} hooks)",
                    count
                );
                true
            }
            SYS_rtcall_init_buffers => {
                self.init_buffers(tuid);
                true
            }
            SYS_rtcall_notify_syscall_hook_exit => {
                let t = self.session.task_mut(tuid);
                if !t.syscallbuf_child.is_null() {
                    let hdr_addr = t.syscallbuf_child;
                    let mut hdr = t.read_val_mem(hdr_addr);
                    hdr.notify_on_syscall_hook_exit = 0;
                    t.write_val_mem(hdr_addr, &hdr);
                }
                true
            }
            _ => false,
        }
    }

    /// Allocate the per-thread syscall buffer in the tracee and fill in the
    /// params struct the library passed.
    fn init_buffers(&mut self, tuid: TaskUid) {
        let (params_ptr, syscall_ip) = {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            let p = RemotePtr::<rtcall_init_buffers_params>::from_val(t.regs().arg1());
            let ip = vm.find_syscall_instruction(t);
            (p, ip)
        };
        let arch = self.session.task(tuid).arch();
        let child_map_addr = {
            let t = self.session.task_mut(tuid);
            let mut remote = crate::remote_syscalls::RemoteSyscalls::new(t, syscall_ip);
            remote.infallible_syscall(
                crate::kernel_abi::syscall_number_for_mmap(arch),
                &[
                    0,
                    SYSCALLBUF_DEFAULT_SIZE,
                    (libc::PROT_READ | libc::PROT_WRITE) as usize,
                    (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as usize,
                    (-1i64) as usize,
                    0,
                ],
            ) as usize
        };
        {
            let t = self.session.task_mut(tuid);
            t.syscallbuf_child = RemotePtr::from_val(child_map_addr);
            t.syscallbuf_size = SYSCALLBUF_DEFAULT_SIZE;
            let mut params = t.read_val_mem(params_ptr);
            params.syscallbuf_ptr = child_map_addr as u64;
            params.syscallbuf_size = SYSCALLBUF_DEFAULT_SIZE as u32;
            t.write_val_mem(params_ptr, &params);
        }
        let vm = self.session.vm_of_mut(tuid);
        let km = vm.map(
            RemotePtr::from_val(child_map_addr),
            SYSCALLBUF_DEFAULT_SIZE,
            nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
            nix::sys::mman::MapFlags::MAP_PRIVATE | nix::sys::mman::MapFlags::MAP_ANONYMOUS,
            0,
            OsStr::new(""),
            crate::address_space::kernel_mapping::KernelMapping::NO_DEVICE,
            crate::address_space::kernel_mapping::KernelMapping::NO_INODE,
            None,
            None,
        );
        vm.set_mapping_flags(km.start(), crate::address_space::MappingFlags::IS_SYSCALLBUF);
        let meta = Default::default();
        self.trace_writer.write_mapped_region(
            &km,
            &meta,
            crate::trace::writer::MappingOrigin::EngineInternalMapping,
        );
    }

    fn handle_signal(&mut self, tuid: TaskUid, sig: i32) {
        if sig == TIME_SLICE_SIGNAL {
            // Timeslice expired: record the preemption point so replay can
            // reproduce the context switch at this exact tick count.
            self.maybe_flush_syscallbuf(tuid);
            self.write_frame(tuid, Event::Sched);
            self.scheduler.expire_timeslice();
            return;
        }
        if sig == DESCHED_SIGNAL {
            let relevant = {
                let t = self.session.task_mut(tuid);
                crate::syscallbuf::desched_signal_may_be_relevant(t)
            };
            if relevant {
                // The tracee blocked inside an untraced buffered syscall;
                // flush what's committed so other tasks can run against a
                // consistent trace.
                self.maybe_flush_syscallbuf(tuid);
                self.scheduler.expire_timeslice();
            }
            // The signal itself is never delivered to the tracee.
            return;
        }

        let deterministic = {
            let t = self.session.task_mut(tuid);
            let si = *t.siginfo();
            let is_fault_sig = matches!(
                sig,
                libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGTRAP
            );
            if is_fault_sig && crate::util::is_kernel_trap(si.si_code) {
                SignalDeterministic::DeterministicSig
            } else {
                SignalDeterministic::NondeterministicSig
            }
        };
        let si = *self.session.task(tuid).siginfo();
        self.maybe_flush_syscallbuf(tuid);
        self.write_frame(
            tuid,
            Event::Signal(SignalEventData::new(si, deterministic)),
        );
        self.write_frame(
            tuid,
            Event::SignalDelivery(SignalEventData::new(si, deterministic)),
        );
        // Deliver for real at the next resume.
        self.pending_deliveries.push((tuid, sig));
    }

    fn handle_ptrace_event(&mut self, tuid: TaskUid, event: i32) {
        match event {
            libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                self.handle_clone(tuid, event);
            }
            libc::PTRACE_EVENT_EXEC => {
                // handled at the execve syscall exit; nothing extra here.
            }
            libc::PTRACE_EVENT_EXIT => {
                let status = self.session.task(tuid).status();
                self.record_task_death(tuid, status);
            }
            libc::PTRACE_EVENT_SECCOMP => {
                // Treated as a syscall entry; the next syscall stop carries
                // the state.
            }
            other => {
                log!(
                    crate::log::LogWarn,
                    "Unhandled ptrace event {} for task {:?}",
                    other,
                    tuid
                );
            }
        }
    }

    fn handle_clone(&mut self, parent_uid: TaskUid, ptrace_event: i32) {
        let new_tid = {
            let t = self.session.task_mut(parent_uid);
            let mut msg: libc::c_ulong = 0;
            if !t.ptrace_if_alive(
                libc::PTRACE_GETEVENTMSG,
                0,
                &mut msg as *mut libc::c_ulong as usize,
            ) {
                return;
            }
            msg as pid_t
        };

        // The child arrives in a SIGSTOP-ish stop; sync with it.
        let mut raw: i32 = 0;
        let ret = unsafe { libc::waitpid(new_tid, &mut raw, libc::__WALL) };
        if ret != new_tid {
            fatal!("Couldn't wait for clone child {}", new_tid);
        }

        let serial = self.session.next_task_serial();
        let mut child = Task::new(new_tid, new_tid, serial);
        child.did_waitpid(WaitStatus::new(raw));
        child.open_mem_fd();

        let (parent_vm_uid, parent_tg_uid, clone_flags) = {
            let t = self.session.task_mut(parent_uid);
            let flags = if ptrace_event == libc::PTRACE_EVENT_CLONE {
                t.regs().arg1() as u64
            } else {
                0
            };
            (t.vm_uid, t.tg_uid, flags)
        };

        let shares_vm = clone_flags & (libc::CLONE_VM as u64) != 0;
        let shares_tg = clone_flags & (libc::CLONE_THREAD as u64) != 0;
        if shares_vm {
            child.vm_uid = parent_vm_uid;
        } else {
            let vm = self.session.vms[&parent_vm_uid].clone_for_fork(new_tid, serial);
            child.vm_uid = vm.uid();
            self.session.vms.insert(vm.uid(), vm);
        }
        if shares_tg {
            child.tg_uid = parent_tg_uid;
        } else {
            let tg_uid = self.session.create_thread_group(new_tid, Some(parent_tg_uid));
            child.tg_uid = tg_uid;
        }

        let child_uid = child.uid();
        self.session.tasks.insert(child_uid, child);
        self.scheduler.on_create(child_uid, 0);

        let parent_rec_tid = self.session.task(parent_uid).rec_tid;
        let task_event = TimedTaskEvent {
            time: self.trace_writer.time(),
            event: TraceTaskEvent::Clone {
                tid: new_tid,
                parent_tid: parent_rec_tid,
                clone_flags,
            },
        };
        self.trace_writer.write_task_event(&task_event);
    }

    fn handle_exec(&mut self, tuid: TaskUid) {
        let (old_vm_uid, serial, exec_count, rec_tid, exe) = {
            let t = self.session.task_mut(tuid);
            t.post_exec(OsStr::new(""));
            (
                t.vm_uid,
                t.serial,
                t.vm_uid.exec_count() + 1,
                t.rec_tid,
                t.exe_name.clone(),
            )
        };
        let vm = {
            let t = self.session.task_mut(tuid);
            AddressSpace::new_after_exec(t, &exe, exec_count)
        };
        let new_uid = vm.uid();
        self.session.vms.insert(new_uid, vm);
        {
            let t = self.session.task_mut(tuid);
            t.vm_uid = new_uid;
        }
        if !self
            .session
            .tasks
            .values()
            .any(|t| t.vm_uid == old_vm_uid)
        {
            self.session.vms.remove(&old_vm_uid);
        }
        let _ = serial;

        let task_event = TimedTaskEvent {
            time: self.trace_writer.time(),
            event: TraceTaskEvent::Exec {
                tid: rec_tid,
                file_name: exe.clone(),
                cmd_line: vec![exe],
            },
        };
        self.trace_writer.write_task_event(&task_event);
    }

    fn record_task_death(&mut self, tuid: TaskUid, status: WaitStatus) {
        let (rec_tid, tg_uid, clean) = {
            let t = self.session.task(tuid);
            (t.rec_tid, t.tg_uid, !t.unstable)
        };
        let exit_status = status
            .exit_code()
            .or_else(|| status.fatal_sig().map(|s| 128 + s))
            .unwrap_or(0);

        self.write_frame(tuid, if clean { Event::Exit } else { Event::UnstableExit });
        let task_event = TimedTaskEvent {
            time: self.trace_writer.time(),
            event: TraceTaskEvent::Exit {
                tid: rec_tid,
                exit_status,
            },
        };
        self.trace_writer.write_task_event(&task_event);

        if let Some(tg) = self.session.thread_groups.get_mut(&tg_uid) {
            tg.exit_status = exit_status;
            if tg.parent.is_none() && self.initial_thread_group_exit.is_none() {
                self.initial_thread_group_exit = Some(exit_status);
            }
        }
        // The task was stopped at PTRACE_EVENT_EXIT or is already gone; let
        // it finish dying.
        {
            let t = self.session.task_mut(tuid);
            let _ = t.ptrace_if_alive(libc::PTRACE_CONT, 0, 0);
        }
        self.scheduler.on_destroy(tuid);
        self.session.destroy_task(tuid);
    }

    /// Commit the trace. Idempotent.
    pub fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.trace_writer.close(CloseStatus::CloseOk);
    }

    /// Abort recording, kill everything, leave the trace uncommitted.
    pub fn abort(&mut self) {
        self.session.kill_all_tasks();
        if !self.closed {
            self.closed = true;
            self.trace_writer.close(CloseStatus::CloseError);
        }
    }
}
