use crate::address_space::{AddressSpace, BreakpointType};
use crate::emu_fs::EmuFs;
use crate::event::{Event, SignalDeterministic, SyscallState};
use crate::kernel_abi::{
    is_mmap_syscall, syscall_number_for_brk, syscall_number_for_close, syscall_number_for_mprotect,
    syscall_number_for_mremap, syscall_number_for_munmap, syscall_number_for_openat,
};
use crate::patcher::Patcher;
use crate::perf_counters::{SKID_SIZE, TIME_SLICE_SIGNAL};
use crate::registers::{MismatchBehavior, Registers};
use crate::remote_ptr::{RemotePtr, Void};
use crate::remote_syscalls::RemoteSyscalls;
use crate::session::{
    is_breakpoint_trap, spawn_tracee, wait_for_exec, BreakStatus, RunCommand, Session,
};
use crate::task::{ResumeRequest, Task, WaitRequest};
use crate::ticks::Ticks;
use crate::trace::frame::{FrameTime, TraceFrame};
use crate::trace::reader::TraceReader;
use crate::trace::writer::MappedDataSource;
use crate::uid::TaskUid;
use crate::wait_status::WaitType;
use libc::{MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, MREMAP_FIXED, MREMAP_MAYMOVE};
use nix::sys::mman::ProtFlags;
use std::ffi::OsStr;

/// What the current frame requires of the step engine.
#[derive(Clone, Debug)]
pub enum StepAction {
    None,
    EnterSyscall { number: i32 },
    ExitSyscall { number: i32 },
    DeterministicSignal { signo: i32 },
    /// Advance until tick and ip targets are both met, then the signal (0
    /// for a plain scheduling preemption) is considered delivered.
    ProgramAsyncSignalInterrupt { target_ticks: Ticks, signo: i32 },
    DeliverSignal { signo: i32 },
    FlushSyscallbuf,
    PatchSyscall,
    ExitTask,
    /// Frame consumed; advance to the next one.
    Retire,
}

impl StepAction {
    fn ordinal(&self) -> u8 {
        match self {
            StepAction::None => 0,
            StepAction::EnterSyscall { .. } => 1,
            StepAction::ExitSyscall { .. } => 2,
            StepAction::DeterministicSignal { .. } => 3,
            StepAction::ProgramAsyncSignalInterrupt { .. } => 4,
            StepAction::DeliverSignal { .. } => 5,
            StepAction::FlushSyscallbuf => 6,
            StepAction::PatchSyscall => 7,
            StepAction::ExitTask => 8,
            StepAction::Retire => 9,
        }
    }
}

/// Progress indicator within a (time, ticks) pair, for ordering marks that
/// share both.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
pub struct ReplayStepKey(u8);

impl ReplayStepKey {
    pub fn in_execution(self) -> bool {
        self.0 != 0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReplayStatus {
    /// Progress was made; call replay_step again.
    Continue,
    /// All tracees are dead; the trace is fully consumed.
    Exited,
}

#[derive(Clone)]
pub struct ReplayResult {
    pub status: ReplayStatus,
    pub break_status: BreakStatus,
    /// A fast-forward retired more than one instruction; a "single step"
    /// completion may cover a whole string-instruction loop.
    pub did_fast_forward: bool,
}

impl ReplayResult {
    fn new(status: ReplayStatus) -> ReplayResult {
        ReplayResult {
            status,
            break_status: BreakStatus::new(),
            did_fast_forward: false,
        }
    }
}

/// Bounds on one replay_step call.
#[derive(Clone, Default)]
pub struct StepConstraints {
    pub command: Option<RunCommand>,
    /// Don't start work on a frame at or beyond this time (0 = unbounded).
    pub stop_at_time: FrameTime,
    /// Report approaching_ticks_target within SKID_SIZE of this (0 = none).
    pub ticks_target: Ticks,
    /// For fast-forward: register states to stop before reaching.
    pub stop_before_states: Vec<Registers>,
}

impl StepConstraints {
    pub fn with_command(command: RunCommand) -> StepConstraints {
        StepConstraints {
            command: Some(command),
            ..Default::default()
        }
    }

    fn is_singlestep(&self) -> bool {
        matches!(
            self.command,
            Some(RunCommand::Singlestep) | Some(RunCommand::SinglestepFastForward)
        )
    }
}

/// Outcome of driving the tracee toward the current frame's target.
enum Advance {
    Completed,
    /// Stopped for a reason the caller must surface (breakpoint,
    /// watchpoint, single-step completion).
    Interrupted(BreakStatus),
}

/// A session replaying one recorded trace. Forward progress happens in
/// `replay_step`; each trace frame is consumed by a little state machine
/// whose current state is `current_step`.
pub struct ReplaySession {
    pub session: Session,
    trace_reader: TraceReader,
    pub emu_fs: EmuFs,
    pub patcher: Patcher,
    current_frame: TraceFrame,
    current_step: StepAction,
    ticks_at_start_of_event: Ticks,
    last_step_did_fast_forward: bool,
    trace_start_time: FrameTime,
    done: bool,
}

impl ReplaySession {
    /// Open the trace, spawn the initial tracee and leave it stopped at its
    /// exec, ready for the first replay_step.
    pub fn create(trace_dir: Option<&OsStr>) -> ReplaySession {
        let mut trace_reader = TraceReader::new(trace_dir);
        let trace_start_time = trace_reader.time();

        let first_frame = match trace_reader.peek_frame() {
            Some(f) => f,
            None => clean_fatal!("Trace contains no frames"),
        };

        let argv = trace_reader.argv().to_vec();
        let envp = trace_reader.envp().to_vec();
        let cwd = trace_reader.cwd().to_owned();
        if argv.is_empty() {
            clean_fatal!("Trace has an empty command line");
        }

        let mut session = Session::new();
        let tid = spawn_tracee(&argv[0], &argv, &envp, &cwd);
        let serial = session.next_task_serial();
        let mut t = Task::new(tid, first_frame.tid(), serial);
        t.did_waitpid(crate::wait_status::WaitStatus::for_stop_sig(libc::SIGSTOP));
        wait_for_exec(&mut t);
        t.exe_name = argv[0].clone();

        let tg_uid = session.create_thread_group(first_frame.tid(), None);
        t.tg_uid = tg_uid;

        let vm = AddressSpace::new_after_exec(&mut t, &argv[0], 0);
        t.vm_uid = vm.uid();
        session.vms.insert(vm.uid(), vm);
        session.tasks.insert(t.uid(), t);

        ReplaySession {
            session,
            trace_reader,
            emu_fs: EmuFs::new(),
            patcher: Patcher::new(),
            current_frame: TraceFrame::new(),
            current_step: StepAction::None,
            ticks_at_start_of_event: 0,
            last_step_did_fast_forward: false,
            trace_start_time,
            done: false,
        }
    }

    /// Recreate a session positioned at `(time, ticks)` by replaying a
    /// fresh session forward. This is how checkpoints restore: a checkpoint
    /// stores replay metadata sufficient for reconstruction rather than
    /// live forked tracees.
    pub fn create_at(trace_dir: Option<&OsStr>, time: FrameTime, ticks: Ticks) -> ReplaySession {
        let mut session = ReplaySession::create(trace_dir);
        while !session.done
            && (session.current_frame_time() < time
                || (session.current_frame_time() == time
                    && session
                        .current_task_uid()
                        .map(|uid| session.session.task(uid).tick_count() < ticks)
                        .unwrap_or(false)))
        {
            let mut constraints = StepConstraints::default();
            constraints.stop_at_time = time.saturating_add(1);
            let result = session.replay_step(&constraints);
            if result.status == ReplayStatus::Exited {
                break;
            }
            if session.current_frame_time() >= time {
                // Close enough in frame terms; tick alignment within the
                // frame is the caller's business via forward stepping.
                break;
            }
        }
        session
    }

    pub fn trace_dir(&self) -> &OsStr {
        self.trace_reader.dir()
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Time of the frame currently being replayed (the one in progress or
    /// about to start).
    pub fn current_frame_time(&self) -> FrameTime {
        if matches!(self.current_step, StepAction::None) {
            self.trace_reader.time()
        } else {
            self.current_frame.time()
        }
    }

    pub fn trace_start_time(&self) -> FrameTime {
        self.trace_start_time
    }

    pub fn current_frame(&self) -> &TraceFrame {
        &self.current_frame
    }

    pub fn current_task_uid(&self) -> Option<TaskUid> {
        // Between frames the last frame's task is still current; the frame
        // counter only moves once the next frame is loaded.
        let tid = self.current_frame.tid();
        let by_frame = self.session.find_task_by_rec_tid(tid);
        by_frame.or_else(|| self.session.tasks.keys().next().copied())
    }

    pub fn current_step_key(&self) -> ReplayStepKey {
        ReplayStepKey(self.current_step.ordinal())
    }

    pub fn ticks_at_start_of_current_event(&self) -> Ticks {
        self.ticks_at_start_of_event
    }

    /// Apply this frame's recorded memory writes into the tracee.
    fn apply_raw_data_records(&mut self, tuid: TaskUid) {
        let time = self.current_frame.time();
        loop {
            let rec = match self.trace_reader.read_raw_data_for_time(time) {
                Some(r) => r,
                None => break,
            };
            let t = self.session.task_mut(tuid);
            t.write_bytes(rec.addr, &rec.data);
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            vm.notify_written(t, rec.addr, rec.data.len());
        }
    }

    /// Replay a recorded syscallbuf flush. The flushed ring contents are
    /// replayed record by record, dispatched by syscall number into the
    /// tracee's ring, with the commit watermark advanced last; the
    /// library's conditional-move commit path then selects each record's
    /// recorded `ret`. Raw records outside the ring (buffered syscalls'
    /// out-parameters) apply as plain memory writes.
    fn flush_syscallbuf(&mut self, tuid: TaskUid) {
        use crate::preload_interface::{syscallbuf_hdr, SYSCALLBUF_HDR_SIZE};

        let time = self.current_frame.time();
        loop {
            let rec = match self.trace_reader.read_raw_data_for_time(time) {
                Some(r) => r,
                None => break,
            };
            let is_ring = {
                let t = self.session.task(tuid);
                !t.syscallbuf_child.is_null() && rec.addr == t.syscallbuf_child.cast()
            };
            if is_ring {
                let records = crate::syscallbuf::parse_buffer(&rec.data);
                let mut hdr = syscallbuf_hdr::default();
                crate::util::u8_slice_mut(&mut hdr)
                    .copy_from_slice(&rec.data[..SYSCALLBUF_HDR_SIZE]);
                let t = self.session.task_mut(tuid);
                for r in &records {
                    crate::syscallbuf::write_record_to_child(t, r);
                }
                crate::syscallbuf::write_commit_watermark(t, hdr.num_rec_bytes);
            } else {
                let t = self.session.task_mut(tuid);
                t.write_bytes(rec.addr, &rec.data);
            }
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            vm.notify_written(t, rec.addr, rec.data.len());
        }
    }

    fn validate_registers(&mut self, tuid: TaskUid) {
        if !self.current_frame.event().record_regs() {
            return;
        }
        let recorded = *self.current_frame.regs_ref();
        let t = self.session.task_mut(tuid);
        let live = *t.regs();
        if !live.compare_with("live", &recorded, "recorded", MismatchBehavior::LogMismatches) {
            let frame_time = self.current_frame.time();
            let ticks = t.tick_count();
            fatal!(
                "Replay divergence at event {} (ticks {}): register mismatch",
                frame_time,
                ticks
            );
        }
    }

    /// One step of replay. Advances the current task toward the state the
    /// current frame requires; returns when the frame completes or
    /// something the caller cares about happens (per the constraints).
    pub fn replay_step(&mut self, constraints: &StepConstraints) -> ReplayResult {
        if self.done {
            return ReplayResult::new(ReplayStatus::Exited);
        }

        // Between frames: load the next frame and decide what it needs.
        if matches!(self.current_step, StepAction::None) {
            if constraints.stop_at_time != 0 && self.trace_reader.time() >= constraints.stop_at_time
            {
                return ReplayResult::new(ReplayStatus::Continue);
            }
            if !self.setup_next_frame() {
                return ReplayResult::new(ReplayStatus::Exited);
            }
        }

        let tuid = match self.current_task_uid() {
            Some(uid) => uid,
            None => {
                self.done = true;
                return ReplayResult::new(ReplayStatus::Exited);
            }
        };

        self.last_step_did_fast_forward = false;
        let mut result = ReplayResult::new(ReplayStatus::Continue);
        let advance = match self.current_step.clone() {
            StepAction::None | StepAction::Retire => Advance::Completed,
            StepAction::EnterSyscall { number } => self.enter_syscall(tuid, number, constraints),
            StepAction::ExitSyscall { number } => self.exit_syscall(tuid, number),
            StepAction::DeterministicSignal { signo } => {
                self.emulate_deterministic_signal(tuid, signo, constraints)
            }
            StepAction::ProgramAsyncSignalInterrupt { target_ticks, signo } => {
                let r = self.emulate_async_signal(tuid, target_ticks, constraints);
                if let Advance::Completed = r {
                    if signo != 0 {
                        result.break_status.signal = Some(signo);
                    }
                }
                r
            }
            StepAction::DeliverSignal { signo } => self.deliver_signal(tuid, signo),
            StepAction::FlushSyscallbuf => {
                self.flush_syscallbuf(tuid);
                Advance::Completed
            }
            StepAction::PatchSyscall => self.patch_syscall(tuid, constraints),
            StepAction::ExitTask => {
                let r = self.exit_task(tuid);
                result.break_status.task_exit = true;
                r
            }
        };

        match advance {
            Advance::Completed => {
                result.break_status.task = Some(tuid);
                self.retire_frame(tuid);
                if constraints.is_singlestep() {
                    result.break_status.singlestep_complete = true;
                }
            }
            Advance::Interrupted(bs) => {
                result.break_status = bs;
                result.break_status.task = Some(tuid);
            }
        }
        result.did_fast_forward = self.last_step_did_fast_forward;

        if constraints.ticks_target != 0 {
            if let Some(uid) = self.current_task_uid() {
                if self.session.tasks.contains_key(&uid) {
                    let now = self.session.task(uid).tick_count();
                    if now + SKID_SIZE >= constraints.ticks_target {
                        result.break_status.approaching_ticks_target = true;
                    }
                }
            }
        }
        result
    }

    /// Read the next frame and prime `current_step`. False at trace end.
    fn setup_next_frame(&mut self) -> bool {
        let frame = match self.trace_reader.read_frame() {
            Some(f) => f,
            None => {
                self.done = true;
                return false;
            }
        };
        self.current_frame = frame;

        if let Some(uid) = self.current_task_uid() {
            self.ticks_at_start_of_event = self.session.task(uid).tick_count();
            let time = self.current_frame.time();
            self.session
                .vm_of_mut(uid)
                .set_first_run_event(time);
        }

        self.current_step = match self.current_frame.event().clone() {
            Event::Syscall(s) => match s.state {
                SyscallState::EnteringSyscall => StepAction::EnterSyscall { number: s.number },
                _ => StepAction::ExitSyscall { number: s.number },
            },
            Event::Signal(sig) => {
                if sig.deterministic == SignalDeterministic::DeterministicSig {
                    StepAction::DeterministicSignal {
                        signo: sig.signo(),
                    }
                } else {
                    StepAction::ProgramAsyncSignalInterrupt {
                        target_ticks: self.current_frame.ticks(),
                        signo: sig.signo(),
                    }
                }
            }
            Event::SignalDelivery(sig) | Event::SignalHandler(sig) => StepAction::DeliverSignal {
                signo: sig.signo(),
            },
            Event::Sched => StepAction::ProgramAsyncSignalInterrupt {
                target_ticks: self.current_frame.ticks(),
                signo: 0,
            },
            Event::InstructionTrap => StepAction::DeterministicSignal {
                signo: libc::SIGSEGV,
            },
            Event::SyscallbufFlush => StepAction::FlushSyscallbuf,
            Event::SyscallbufReset => {
                if let Some(uid) = self.current_task_uid() {
                    let t = self.session.task_mut(uid);
                    crate::syscallbuf::reset_buffer(t);
                }
                StepAction::Retire
            }
            Event::SyscallbufAbortCommit => {
                if let Some(uid) = self.current_task_uid() {
                    let t = self.session.task_mut(uid);
                    if !t.syscallbuf_child.is_null() {
                        let hdr_addr = t.syscallbuf_child;
                        let mut hdr = t.read_val_mem(hdr_addr);
                        hdr.abort_commit = 1;
                        t.write_val_mem(hdr_addr, &hdr);
                    }
                }
                StepAction::Retire
            }
            Event::PatchSyscall => StepAction::PatchSyscall,
            Event::GrowMap => {
                let _ = self.replay_one_mapped_region();
                StepAction::Retire
            }
            Event::Exit | Event::UnstableExit => StepAction::ExitTask,
            Event::ExitSighandler | Event::InterruptedSyscallNotRestarted => {
                // Bookkeeping-only frames: apply recorded state and move on.
                if let Some(uid) = self.current_task_uid() {
                    self.apply_raw_data_records(uid);
                }
                StepAction::Retire
            }
            Event::TraceTermination => {
                self.done = true;
                StepAction::Retire
            }
            other => {
                fatal!("Event {:?} should not appear in a trace", other.kind());
            }
        };
        true
    }

    fn retire_frame(&mut self, tuid: TaskUid) {
        if self.session.tasks.contains_key(&tuid) {
            // Per-task tick counters snap to the recorded value at frame
            // boundaries; PMU skid within a frame must not accumulate.
            if self.current_frame.event().record_regs() {
                let recorded_ticks = self.current_frame.ticks();
                self.session.task_mut(tuid).set_tick_count(recorded_ticks);
            }
        }
        self.current_step = StepAction::None;
    }

    // --- execution helpers ---

    /// Classify a stop that happened while driving toward a target.
    /// Returns Some(break) when the stop must interrupt the step.
    fn check_incidental_stop(&mut self, tuid: TaskUid) -> Option<BreakStatus> {
        let (t, vm) = self.session.task_and_vm_mut(tuid);
        match t.status().wait_type() {
            WaitType::SignalStop => {}
            _ => return None,
        }
        let sig = t.status().stop_sig().unwrap();
        if sig == libc::SIGTRAP {
            if let Some(bp_ip) = is_breakpoint_trap(t, vm) {
                // Put the ip back on the breakpoint so resuming re-executes
                // the displaced instruction.
                t.set_ip(bp_ip);
                let mut bs = BreakStatus::new();
                bs.breakpoint_hit =
                    vm.get_breakpoint_type_at_addr(bp_ip) == BreakpointType::User;
                return Some(bs);
            }
            // Not our trap: could be a watchpoint or a single-step trap.
            let debug_status = crate::session::read_debug_status(t);
            if vm.notify_watchpoint_fired(t, debug_status) {
                let hits = vm.consume_watchpoint_changes();
                if !hits.is_empty() {
                    let mut bs = BreakStatus::new();
                    bs.watchpoints_hit = hits;
                    return Some(bs);
                }
            }
            return None;
        }
        if sig == TIME_SLICE_SIGNAL {
            // Counter interrupt; purely internal.
            return None;
        }
        // Any other signal at this point is recorded context (e.g. the
        // desched signal) and is consumed silently by replay.
        None
    }

    /// Resume until the next syscall boundary stop, swallowing incidental
    /// stops. Uses SYSEMU so the kernel never executes the tracee's
    /// syscalls during replay, except for the few syscalls that must run
    /// for real (clone family, execve), which go through PTRACE_SYSCALL.
    fn cont_syscall_boundary(
        &mut self,
        tuid: TaskUid,
        constraints: &StepConstraints,
        execute_for_real: bool,
    ) -> Advance {
        loop {
            let singlestep = constraints.is_singlestep();
            {
                let t = self.session.task_mut(tuid);
                let how = if execute_for_real {
                    ResumeRequest::Syscall
                } else if singlestep {
                    ResumeRequest::SysemuSinglestep
                } else {
                    ResumeRequest::Sysemu
                };
                t.resume_execution(how, WaitRequest::ResumeAndWait, 0, None);
            }
            let status = self.session.task(tuid).status();
            if status.is_syscall() {
                return Advance::Completed;
            }
            match status.wait_type() {
                WaitType::Exit | WaitType::FatalSignal => {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                _ => {}
            }
            if let Some(bs) = self.check_incidental_stop(tuid) {
                return Advance::Interrupted(bs);
            }
            if singlestep {
                let mut bs = BreakStatus::new();
                bs.singlestep_complete = true;
                return Advance::Interrupted(bs);
            }
        }
    }

    /// Syscalls whose kernel-side effects cannot be emulated: they create
    /// or replace tasks and must really execute during replay.
    fn syscall_executes_for_real(&self, tuid: TaskUid, number: i32) -> bool {
        let arch = self.session.task(tuid).arch();
        crate::kernel_abi::is_clone_syscall(number, arch)
            || crate::kernel_abi::is_execve_syscall(number, arch)
    }

    fn enter_syscall(
        &mut self,
        tuid: TaskUid,
        number: i32,
        constraints: &StepConstraints,
    ) -> Advance {
        let for_real = self.syscall_executes_for_real(tuid, number);
        match self.cont_syscall_boundary(tuid, constraints, for_real) {
            Advance::Completed => {
                self.validate_registers(tuid);
                Advance::Completed
            }
            other => other,
        }
    }

    /// Complete a syscall: perform memory-map effects remotely (the kernel
    /// never saw the syscall under SYSEMU), write recorded data, install
    /// recorded registers.
    fn exit_syscall(&mut self, tuid: TaskUid, number: i32) -> Advance {
        let arch = {
            let t = self.session.task_mut(tuid);
            t.arch()
        };

        if number == crate::preload_interface::SYS_rtcall_init_preload {
            // The library re-announced its hook table; mirror it so
            // recorded patches can be re-applied at the same sites.
            let params_ptr = RemotePtr::<crate::preload_interface::rtcall_init_preload_params>::from_val(
                self.current_frame.regs_ref().arg1(),
            );
            let t = self.session.task_mut(tuid);
            let params = t.read_val_mem(params_ptr);
            let count = params.syscall_patch_hook_count as usize;
            let hooks_ptr = RemotePtr::<crate::preload_interface::syscall_patch_hook>::from_val(
                params.syscall_patch_hooks as usize,
            );
            let mut hooks = Vec::with_capacity(count);
            for i in 0..count {
                hooks.push(t.read_val_mem(hooks_ptr + i));
            }
            t.preload_globals_child = RemotePtr::from_val(params.globals as usize);
            self.patcher.set_hooks(hooks);
        } else if number == crate::preload_interface::SYS_rtcall_init_buffers {
            // The recording allocated this thread's syscall buffer here;
            // re-create the mapping and aim the task's plumbing at it. The
            // params-struct write arrives with this frame's raw records.
            if let Some(addr) = self.replay_one_mapped_region() {
                let t = self.session.task_mut(tuid);
                t.syscallbuf_child = addr.cast();
                t.syscallbuf_size = crate::preload_interface::SYSCALLBUF_DEFAULT_SIZE;
            }
        } else if crate::kernel_abi::is_clone_syscall(number, arch) {
            if let Advance::Interrupted(bs) = self.replay_clone(tuid) {
                return Advance::Interrupted(bs);
            }
        } else if crate::kernel_abi::is_execve_syscall(number, arch) {
            self.replay_exec(tuid);
        } else if is_mmap_syscall(number, arch) {
            self.replay_mmap(tuid);
        } else if number == syscall_number_for_munmap(arch) {
            self.replay_munmap(tuid);
        } else if number == syscall_number_for_mprotect(arch) {
            self.replay_mprotect(tuid);
        } else if number == syscall_number_for_mremap(arch) {
            self.replay_mremap(tuid);
        } else if number == syscall_number_for_brk(arch) {
            self.replay_brk(tuid);
        }

        self.apply_raw_data_records(tuid);
        {
            let recorded = *self.current_frame.regs_ref();
            let t = self.session.task_mut(tuid);
            t.set_regs(recorded);
            t.flush_regs();
        }
        Advance::Completed
    }

    /// The recorded mmap result: re-create the mapping in the tracee at the
    /// recorded address, backed per the trace's mmaps record.
    fn replay_mmap(&mut self, tuid: TaskUid) {
        let recorded_regs = *self.current_frame.regs_ref();
        let result = recorded_regs.syscall_result_signed();
        if crate::kernel_abi::syscall_result_is_error(result) {
            return;
        }
        let _ = self.replay_one_mapped_region();
    }

    /// Materialise the next recorded mapping into the current task.
    /// Returns the mapped start address.
    fn replay_one_mapped_region(&mut self) -> Option<RemotePtr<Void>> {
        let tuid = match self.current_task_uid() {
            Some(uid) => uid,
            None => return None,
        };
        let (km, data) = match self.trace_reader.read_mapped_region() {
            Some(pair) => pair,
            None => fatal!(
                "Trace frame {} needs a mapping but the mmaps substream is exhausted",
                self.current_frame.time()
            ),
        };

        let arch;
        let syscall_ip;
        {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            arch = t.arch();
            syscall_ip = vm.find_syscall_instruction(t);
        }

        let addr = km.start();
        let length = km.size();
        let prot = km.prot().bits() as usize;
        let is_shared = km.is_shared();

        let mut emu_id = None;
        match data.source {
            MappedDataSource::SourceZero => {
                let t = self.session.task_mut(tuid);
                let mut remote = RemoteSyscalls::new(t, syscall_ip);
                remote.infallible_syscall(
                    crate::kernel_abi::syscall_number_for_mmap(arch),
                    &[
                        addr.as_usize(),
                        length,
                        prot,
                        (MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED) as usize,
                        (-1i64) as usize,
                        0,
                    ],
                );
            }
            MappedDataSource::SourceFile => {
                self.map_remote_file(
                    tuid,
                    syscall_ip,
                    &data.file_name,
                    addr.as_usize(),
                    length,
                    prot,
                    is_shared,
                    km.file_offset_bytes(),
                );
            }
            MappedDataSource::SourceTrace => {
                if is_shared {
                    // Writable shared mapping: the backing object must be
                    // shared by every mapping of it, so it lives in EmuFs.
                    let min_size = km.file_offset_bytes() + length as u64;
                    let proc_path = {
                        let f = self.emu_fs.get_or_create(
                            km.fsname(),
                            km.device(),
                            km.inode(),
                            min_size,
                        );
                        f.proc_path()
                    };
                    emu_id = Some((km.device(), km.inode()));
                    self.map_remote_file(
                        tuid,
                        syscall_ip,
                        OsStr::new(&proc_path),
                        addr.as_usize(),
                        length,
                        prot,
                        true,
                        km.file_offset_bytes(),
                    );
                } else {
                    // Private data from the trace: anonymous map now,
                    // contents arrive via this frame's raw-data records.
                    let t = self.session.task_mut(tuid);
                    let mut remote = RemoteSyscalls::new(t, syscall_ip);
                    remote.infallible_syscall(
                        crate::kernel_abi::syscall_number_for_mmap(arch),
                        &[
                            addr.as_usize(),
                            length,
                            (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).bits() as usize,
                            (MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED) as usize,
                            (-1i64) as usize,
                            0,
                        ],
                    );
                    drop(remote);
                    // Raw records applied by exit_syscall fill it; restore
                    // the real protection afterwards if it differs.
                    if !km.prot().contains(ProtFlags::PROT_WRITE) {
                        let t = self.session.task_mut(tuid);
                        let mut remote = RemoteSyscalls::new(t, syscall_ip);
                        remote.infallible_syscall(
                            syscall_number_for_mprotect(arch),
                            &[addr.as_usize(), length, prot],
                        );
                    }
                }
            }
        }

        let vm = self.session.vm_of_mut(tuid);
        vm.map(
            addr,
            length,
            km.prot(),
            km.flags(),
            km.file_offset_bytes(),
            km.fsname(),
            km.device(),
            km.inode(),
            Some(km.clone()),
            emu_id,
        );
        Some(addr)
    }

    /// Remote open+mmap+close of a file path.
    #[allow(clippy::too_many_arguments)]
    fn map_remote_file(
        &mut self,
        tuid: TaskUid,
        syscall_ip: crate::remote_code_ptr::RemoteCodePtr,
        path: &OsStr,
        addr: usize,
        length: usize,
        prot: usize,
        shared: bool,
        offset: u64,
    ) {
        let arch = self.session.task(tuid).arch();
        let t = self.session.task_mut(tuid);
        let mut remote = RemoteSyscalls::new(t, syscall_ip);
        let path_bytes = std::os::unix::ffi::OsStrExt::as_bytes(path);
        let remote_path = remote.push_cstr(path_bytes);
        let fd = remote.infallible_syscall(
            syscall_number_for_openat(arch),
            &[
                (-100i64) as usize, // AT_FDCWD
                remote_path.as_usize(),
                libc::O_RDWR as usize,
                0,
            ],
        ) as i32;
        let flags = if shared { MAP_SHARED } else { MAP_PRIVATE } | MAP_FIXED;
        remote.infallible_syscall(
            crate::kernel_abi::syscall_number_for_mmap(arch),
            &[
                addr,
                length,
                prot,
                flags as usize,
                fd as usize,
                offset as usize,
            ],
        );
        remote.infallible_syscall(syscall_number_for_close(arch), &[fd as usize]);
    }

    fn replay_munmap(&mut self, tuid: TaskUid) {
        let regs = *self.current_frame.regs_ref();
        if crate::kernel_abi::syscall_result_is_error(regs.syscall_result_signed()) {
            return;
        }
        let addr = RemotePtr::<Void>::from_val(regs.arg1());
        let length = regs.arg2();
        let (arch, syscall_ip) = {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            (t.arch(), vm.find_syscall_instruction(t))
        };
        {
            let t = self.session.task_mut(tuid);
            let mut remote = RemoteSyscalls::new(t, syscall_ip);
            remote.infallible_syscall(
                syscall_number_for_munmap(arch),
                &[addr.as_usize(), length],
            );
        }
        let vm = self.session.vm_of_mut(tuid);
        vm.unmap(addr, length);
        let session_vms = &self.session.vms;
        self.emu_fs.gc(&|id| {
            session_vms
                .values()
                .any(|vm| vm.maps().any(|(_, m)| m.emu_file == Some(id)))
        });
    }

    fn replay_mprotect(&mut self, tuid: TaskUid) {
        let regs = *self.current_frame.regs_ref();
        if crate::kernel_abi::syscall_result_is_error(regs.syscall_result_signed()) {
            return;
        }
        let addr = RemotePtr::<Void>::from_val(regs.arg1());
        let length = regs.arg2();
        let prot = regs.arg3();
        let (arch, syscall_ip) = {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            (t.arch(), vm.find_syscall_instruction(t))
        };
        {
            let t = self.session.task_mut(tuid);
            let mut remote = RemoteSyscalls::new(t, syscall_ip);
            remote.infallible_syscall(
                syscall_number_for_mprotect(arch),
                &[addr.as_usize(), length, prot],
            );
        }
        self.session.vm_of_mut(tuid).protect(
            addr,
            length,
            ProtFlags::from_bits_truncate(prot as i32),
        );
    }

    fn replay_mremap(&mut self, tuid: TaskUid) {
        let regs = *self.current_frame.regs_ref();
        let result = regs.syscall_result_signed();
        if crate::kernel_abi::syscall_result_is_error(result) {
            return;
        }
        let old_addr = RemotePtr::<Void>::from_val(regs.arg1());
        let old_len = regs.arg2();
        let new_len = regs.arg3();
        let new_addr = RemotePtr::<Void>::from_val(result as usize);
        let (arch, syscall_ip) = {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            (t.arch(), vm.find_syscall_instruction(t))
        };
        {
            let t = self.session.task_mut(tuid);
            let mut remote = RemoteSyscalls::new(t, syscall_ip);
            // Forcing the recorded destination keeps replay addresses equal
            // to recording even where the kernel would have chosen
            // differently.
            remote.infallible_syscall(
                syscall_number_for_mremap(arch),
                &[
                    old_addr.as_usize(),
                    old_len,
                    new_len,
                    (MREMAP_MAYMOVE | MREMAP_FIXED) as usize,
                    new_addr.as_usize(),
                ],
            );
        }
        self.session
            .vm_of_mut(tuid)
            .remap(old_addr, old_len, new_addr, new_len);
    }

    fn replay_brk(&mut self, tuid: TaskUid) {
        let regs = *self.current_frame.regs_ref();
        let new_brk = regs.syscall_result();
        let (arch, syscall_ip) = {
            let (t, vm) = self.session.task_and_vm_mut(tuid);
            (t.arch(), vm.find_syscall_instruction(t))
        };
        {
            let t = self.session.task_mut(tuid);
            let mut remote = RemoteSyscalls::new(t, syscall_ip);
            remote.infallible_syscall(syscall_number_for_brk(arch), &[new_brk]);
        }
        self.session.vm_of_mut(tuid).brk(
            RemotePtr::from_val(new_brk),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        );
    }

    /// Execute a recorded clone/fork for real: run the parent into the
    /// kernel, pick up the new tracee from the resulting ptrace event, and
    /// register it under the tid the recording used for it.
    fn replay_clone(&mut self, parent_uid: TaskUid) -> Advance {
        let recorded_regs = *self.current_frame.regs_ref();
        let recorded_child_tid = recorded_regs.syscall_result_signed();
        if crate::kernel_abi::syscall_result_is_error(recorded_child_tid) {
            // The recorded clone failed; nothing was created.
            return Advance::Completed;
        }

        // The parent sits at syscall entry (really entered). Let the clone
        // happen; the ptrace event fires before syscall exit.
        let new_tid = loop {
            {
                let t = self.session.task_mut(parent_uid);
                t.resume_execution(ResumeRequest::Syscall, WaitRequest::ResumeAndWait, 0, None);
            }
            let status = self.session.task(parent_uid).status();
            if matches!(
                status.ptrace_event(),
                Some(libc::PTRACE_EVENT_CLONE)
                    | Some(libc::PTRACE_EVENT_FORK)
                    | Some(libc::PTRACE_EVENT_VFORK)
            ) {
                let t = self.session.task_mut(parent_uid);
                let mut msg: libc::c_ulong = 0;
                if !t.ptrace_if_alive(
                    libc::PTRACE_GETEVENTMSG,
                    0,
                    &mut msg as *mut libc::c_ulong as usize,
                ) {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                break msg as libc::pid_t;
            }
            match status.wait_type() {
                WaitType::Exit | WaitType::FatalSignal => {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                _ => {}
            }
        };

        // Sync with the child's initial stop.
        let mut raw: i32 = 0;
        let ret = unsafe { libc::waitpid(new_tid, &mut raw, libc::__WALL) };
        if ret != new_tid {
            fatal!("Couldn't wait for replayed clone child {}", new_tid);
        }

        let serial = self.session.next_task_serial();
        let mut child = Task::new(new_tid, recorded_child_tid as libc::pid_t, serial);
        child.did_waitpid(crate::wait_status::WaitStatus::new(raw));
        child.open_mem_fd();

        let clone_flags = recorded_regs.arg1() as u64;
        let (parent_vm_uid, parent_tg_uid) = {
            let t = self.session.task(parent_uid);
            (t.vm_uid, t.tg_uid)
        };
        if clone_flags & (libc::CLONE_VM as u64) != 0 {
            child.vm_uid = parent_vm_uid;
        } else {
            let vm = self.session.vms[&parent_vm_uid]
                .clone_for_fork(child.rec_tid, serial);
            child.vm_uid = vm.uid();
            self.session.vms.insert(vm.uid(), vm);
        }
        if clone_flags & (libc::CLONE_THREAD as u64) != 0 {
            child.tg_uid = parent_tg_uid;
        } else {
            let tg_uid = self
                .session
                .create_thread_group(child.rec_tid, Some(parent_tg_uid));
            child.tg_uid = tg_uid;
        }
        // The recorded frame ticks belong to the parent; the child starts
        // at zero like it did during recording.
        self.session.tasks.insert(child.uid(), child);

        // Finish the parent's syscall exit; recorded registers are applied
        // by the caller.
        loop {
            {
                let t = self.session.task_mut(parent_uid);
                t.resume_execution(ResumeRequest::Syscall, WaitRequest::ResumeAndWait, 0, None);
            }
            let status = self.session.task(parent_uid).status();
            if status.is_syscall() {
                break;
            }
            match status.wait_type() {
                WaitType::Exit | WaitType::FatalSignal => {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                _ => {}
            }
        }
        Advance::Completed
    }

    /// Execute a recorded exec for real and rebuild the address-space model
    /// from the fresh kernel map.
    fn replay_exec(&mut self, tuid: TaskUid) {
        let recorded_regs = *self.current_frame.regs_ref();
        if crate::kernel_abi::syscall_result_is_error(recorded_regs.syscall_result_signed()) {
            return;
        }
        // Run through the exec event to the post-exec stop.
        loop {
            {
                let t = self.session.task_mut(tuid);
                t.resume_execution(ResumeRequest::Syscall, WaitRequest::ResumeAndWait, 0, None);
            }
            let status = self.session.task(tuid).status();
            if status.ptrace_event() == Some(libc::PTRACE_EVENT_EXEC) {
                continue;
            }
            if status.is_syscall() {
                break;
            }
            if matches!(status.wait_type(), WaitType::Exit | WaitType::FatalSignal) {
                return;
            }
        }
        let (old_vm_uid, exec_count, exe) = {
            let t = self.session.task_mut(tuid);
            let exe = t.exe_name.clone();
            t.post_exec(&exe);
            (t.vm_uid, t.vm_uid.exec_count() + 1, exe)
        };
        let vm = {
            let t = self.session.task_mut(tuid);
            crate::address_space::AddressSpace::new_after_exec(t, &exe, exec_count)
        };
        let new_uid = vm.uid();
        self.session.vms.insert(new_uid, vm);
        self.session.task_mut(tuid).vm_uid = new_uid;
        if !self.session.tasks.values().any(|t| t.vm_uid == old_vm_uid) {
            self.session.vms.remove(&old_vm_uid);
        }
    }

    /// Run to the instruction that deterministically raises `signo`, then
    /// treat the signal as delivered and install the recorded post-signal
    /// state.
    fn emulate_deterministic_signal(
        &mut self,
        tuid: TaskUid,
        signo: i32,
        constraints: &StepConstraints,
    ) -> Advance {
        loop {
            {
                let t = self.session.task_mut(tuid);
                let how = if constraints.is_singlestep() {
                    ResumeRequest::Singlestep
                } else {
                    ResumeRequest::Cont
                };
                t.resume_execution(how, WaitRequest::ResumeAndWait, 0, None);
            }
            let status = self.session.task(tuid).status();
            if status.stop_sig() == Some(signo) {
                break;
            }
            match status.wait_type() {
                WaitType::Exit | WaitType::FatalSignal => {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                _ => {}
            }
            if let Some(bs) = self.check_incidental_stop(tuid) {
                return Advance::Interrupted(bs);
            }
            if constraints.is_singlestep() {
                let mut bs = BreakStatus::new();
                bs.singlestep_complete = true;
                return Advance::Interrupted(bs);
            }
        }
        // The faulting instruction retired at the recorded coordinate;
        // registers must agree before we emulate the signal's effect.
        self.validate_registers(tuid);
        self.apply_raw_data_records(tuid);
        {
            let recorded = *self.current_frame.regs_ref();
            let t = self.session.task_mut(tuid);
            t.set_regs(recorded);
            t.flush_regs();
        }
        Advance::Completed
    }

    /// Advance to ticks == target AND ip == recorded ip. The counter
    /// interrupt lands within SKID_SIZE before the target; the remainder is
    /// single-stepped, with fast-forward over single-instruction loops.
    fn emulate_async_signal(
        &mut self,
        tuid: TaskUid,
        target_ticks: Ticks,
        constraints: &StepConstraints,
    ) -> Advance {
        let target_regs = *self.current_frame.regs_ref();
        let target_ip = target_regs.ip();
        let mut did_fast_forward = false;

        loop {
            let now = self.session.task(tuid).tick_count();
            if now > target_ticks {
                let frame_time = self.current_frame.time();
                fatal!(
                    "Replay overshot tick target at event {}: {} > {}",
                    frame_time,
                    now,
                    target_ticks
                );
            }

            if now + SKID_SIZE < target_ticks {
                // Fast path: run with the counter programmed to interrupt
                // a skid-margin early.
                let period = target_ticks - now - SKID_SIZE;
                {
                    let t = self.session.task_mut(tuid);
                    t.resume_execution(
                        ResumeRequest::Cont,
                        WaitRequest::ResumeAndWait,
                        period,
                        None,
                    );
                }
                let status = self.session.task(tuid).status();
                match status.wait_type() {
                    WaitType::Exit | WaitType::FatalSignal => {
                        let mut bs = BreakStatus::new();
                        bs.task_exit = true;
                        return Advance::Interrupted(bs);
                    }
                    _ => {}
                }
                if let Some(bs) = self.check_incidental_stop(tuid) {
                    return Advance::Interrupted(bs);
                }
                continue;
            }

            // Close: single-step the rest, watching for the target state.
            {
                let t = self.session.task_mut(tuid);
                if t.tick_count() == target_ticks && t.ip() == target_ip {
                    let live = *t.regs();
                    if live.matches(&target_regs) {
                        break;
                    }
                }
            }
            let use_fast_forward = {
                let t = self.session.task_mut(tuid);
                constraints.command != Some(RunCommand::Singlestep)
                    && crate::fast_forward::maybe_at_fast_forwardable_instruction(t)
            };
            if use_fast_forward {
                let t = self.session.task_mut(tuid);
                let mut stop_states: Vec<&Registers> = Vec::new();
                stop_states.push(&target_regs);
                for s in &constraints.stop_before_states {
                    stop_states.push(s);
                }
                let st = crate::fast_forward::fast_forward_through_instruction(t, &stop_states);
                did_fast_forward |= st.did_fast_forward;
                self.last_step_did_fast_forward |= st.did_fast_forward;
            } else {
                let t = self.session.task_mut(tuid);
                t.resume_execution(
                    ResumeRequest::Singlestep,
                    WaitRequest::ResumeAndWait,
                    0,
                    None,
                );
            }
            let status = self.session.task(tuid).status();
            match status.wait_type() {
                WaitType::Exit | WaitType::FatalSignal => {
                    let mut bs = BreakStatus::new();
                    bs.task_exit = true;
                    return Advance::Interrupted(bs);
                }
                _ => {}
            }
            if let Some(bs) = self.check_incidental_stop(tuid) {
                return Advance::Interrupted(bs);
            }
            if constraints.is_singlestep() {
                let mut bs = BreakStatus::new();
                bs.singlestep_complete = true;
                return Advance::Interrupted(bs);
            }
            let _ = did_fast_forward;
        }

        self.apply_raw_data_records(tuid);
        Advance::Completed
    }

    /// A recorded signal delivery (or handler entry): install the recorded
    /// state directly. The kernel's signal-frame setup is data the
    /// recording captured.
    fn deliver_signal(&mut self, tuid: TaskUid, _signo: i32) -> Advance {
        self.apply_raw_data_records(tuid);
        let recorded = *self.current_frame.regs_ref();
        let t = self.session.task_mut(tuid);
        t.set_regs(recorded);
        t.flush_regs();
        Advance::Completed
    }

    /// Advance to the syscall entry and redo the recorded instruction
    /// patch, leaving the task to re-execute through the trampoline.
    fn patch_syscall(&mut self, tuid: TaskUid, constraints: &StepConstraints) -> Advance {
        match self.cont_syscall_boundary(tuid, constraints, false) {
            Advance::Completed => {}
            other => return other,
        }
        let arch = self.session.task(tuid).arch();
        let insn_len = crate::kernel_abi::syscall_instruction_length(arch);
        let (t, _vm) = self.session.task_and_vm_mut(tuid);
        let syscall_ip = t.ip().rewind_to_syscall(insn_len);
        self.patcher.reapply_patch(t, syscall_ip);
        // Resume from the patch site so the trampoline executes, exactly as
        // it did after patching during recording.
        let t = self.session.task_mut(tuid);
        t.set_ip(syscall_ip);
        let recorded = *self.current_frame.regs_ref();
        t.set_regs(recorded);
        t.flush_regs();
        Advance::Completed
    }

    fn exit_task(&mut self, tuid: TaskUid) -> Advance {
        {
            let t = self.session.task_mut(tuid);
            // Let the task run to its ptrace-exit notification, then let it
            // die for real.
            if !t.seen_ptrace_exit_event {
                t.resume_execution(ResumeRequest::Cont, WaitRequest::ResumeAndWait, 0, None);
            }
            if t.status().ptrace_event() == Some(libc::PTRACE_EVENT_EXIT) {
                let _ = t.ptrace_if_alive(libc::PTRACE_CONT, 0, 0);
            }
        }
        self.session.destroy_task(tuid);
        if self.session.tasks.is_empty() {
            self.done = true;
        }
        Advance::Completed
    }
}
