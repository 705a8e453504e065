use crate::address_space::WatchType;
use crate::extra_registers::ExtraRegisters;
use crate::gdb_connection::{
    BreakpointKind, GdbConnection, GdbRequest, ResumeAction,
};
use crate::gdb_expression::GdbExpression;
use crate::gdb_register::{get_reg, GdbRegisterValue, DREG_NUM_X64};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::diversion::{DiversionSession, DiversionStatus};
use crate::session::replay::{ReplaySession, ReplayStatus};
use crate::session::{BreakStatus, RunCommand};
use crate::timeline::{Mark, ReplayTimeline};
use crate::trace::frame::FrameTime;
use crate::uid::TaskUid;
use libc::pid_t;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

/// Options the replay command resolves before serving.
#[derive(Clone, Default)]
pub struct GdbServerFlags {
    pub dbg_port: Option<u16>,
    pub goto_event: FrameTime,
    pub autopilot: bool,
    pub debugger_binary: Option<PathBuf>,
    pub command_file: Option<PathBuf>,
}

const DEFAULT_PORT_SEED: u16 = 21800;

struct Checkpoint {
    mark: Mark,
    where_: String,
}

/// Serves the replay as a remote debugging target, mapping wire requests to
/// timeline operations, including reverse execution and diversions.
pub struct GdbServer {
    timeline: ReplayTimeline,
    /// Conditions per breakpoint address; a stop is suppressed when every
    /// condition evaluates to zero.
    conditions: HashMap<usize, Vec<GdbExpression>>,
    checkpoints: HashMap<u32, Checkpoint>,
    next_checkpoint_id: u32,
    /// Where `restart` with no argument goes back to.
    debugger_restart_mark: Option<Mark>,
    diversion: Option<DiversionSession>,
    diversion_refcount: u32,
    final_exit_code: i32,
}

impl GdbServer {
    pub fn new(session: ReplaySession) -> GdbServer {
        GdbServer {
            timeline: ReplayTimeline::new(session),
            conditions: HashMap::new(),
            checkpoints: HashMap::new(),
            next_checkpoint_id: 1,
            debugger_restart_mark: None,
            diversion: None,
            diversion_refcount: 0,
            final_exit_code: 0,
        }
    }

    /// Run replay to completion with no debugger attached.
    pub fn serve_autopilot(mut self) -> i32 {
        loop {
            let result = self
                .timeline
                .replay_step_forward(RunCommand::Continue, 0);
            if result.status == ReplayStatus::Exited {
                break;
            }
        }
        self.final_exit_code
    }

    /// Advance to `goto_event` before the client attaches, so startup cost
    /// is paid without a debugger round trip.
    pub fn seek_to_event(&mut self, event: FrameTime) {
        while self.timeline.current_session().current_frame_time() < event {
            let result = self.timeline.current_session_mut().replay_step(
                &crate::session::replay::StepConstraints {
                    stop_at_time: event,
                    ..Default::default()
                },
            );
            if result.status == ReplayStatus::Exited {
                break;
            }
        }
    }

    /// Accept one debugger client and serve it until detach/kill.
    pub fn serve(mut self, flags: &GdbServerFlags) -> i32 {
        if flags.goto_event > 0 {
            self.seek_to_event(flags.goto_event);
        }
        if flags.autopilot {
            return self.serve_autopilot();
        }

        let (port_seed, probe) = match flags.dbg_port {
            Some(p) => (p, false),
            None => (DEFAULT_PORT_SEED, true),
        };
        // With a fixed port the client can be launched before we accept;
        // with probing the user connects by hand using the printed port.
        if let (Some(port), Some(binary)) = (flags.dbg_port, &flags.debugger_binary) {
            if let Ok(script) = write_launch_script(&self.exe_name(), port, flags) {
                let _ = std::process::Command::new(binary)
                    .arg("-x")
                    .arg(&script)
                    .spawn();
            }
        }
        let (mut dbg, port) = GdbConnection::await_client(port_seed, probe);
        if flags.debugger_binary.is_none() {
            let _ = write_launch_script(&self.exe_name(), port, flags);
        }

        self.debugger_restart_mark = Some(self.timeline.mark());

        while dbg.connection_alive() {
            let req = dbg.get_request();
            if !self.dispatch(&mut dbg, req) {
                break;
            }
        }
        self.timeline
            .current_session_mut()
            .session
            .kill_all_tasks();
        self.final_exit_code
    }

    fn exe_name(&self) -> String {
        self.timeline
            .current_session()
            .current_task_uid()
            .map(|uid| {
                self.timeline.current_session().session.task(uid).exe_name
                    .to_string_lossy()
                    .into_owned()
            })
            .unwrap_or_default()
    }

    fn current_tuid(&self, dbg: &GdbConnection) -> Option<TaskUid> {
        if dbg.query_thread > 0 {
            if let Some(uid) = self
                .current_replay()
                .session
                .find_task_by_rec_tid(dbg.query_thread)
            {
                return Some(uid);
            }
        }
        self.current_replay().current_task_uid()
    }

    fn current_replay(&self) -> &ReplaySession {
        match &self.diversion {
            Some(d) => &d.replay,
            None => self.timeline.current_session(),
        }
    }

    fn current_replay_mut(&mut self) -> &mut ReplaySession {
        match &mut self.diversion {
            Some(d) => &mut d.replay,
            None => self.timeline.current_session_mut(),
        }
    }

    fn in_diversion(&self) -> bool {
        self.diversion.is_some()
    }

    fn teardown_diversion(&mut self) {
        if let Some(d) = self.diversion.take() {
            let mut replay = d.into_inner();
            replay.session.kill_all_tasks();
        }
        self.diversion_refcount = 0;
    }

    /// Handle one request. False ends the serve loop.
    fn dispatch(&mut self, dbg: &mut GdbConnection, req: GdbRequest) -> bool {
        match req {
            GdbRequest::None => true,
            GdbRequest::Unsupported => {
                dbg.write_unsupported();
                true
            }
            GdbRequest::Interrupt => {
                // Stop-the-world is implicit: tracees only run inside a
                // request. Just tell the client where we are.
                self.notify_current_stop(dbg, 0, None);
                true
            }
            GdbRequest::GetRegs => {
                match self.read_regs(dbg) {
                    Some(values) => dbg.reply_get_regs(&values),
                    None => dbg.write_error(1),
                }
                true
            }
            GdbRequest::GetReg(regno) => {
                let v = self
                    .with_current_task(dbg, |t| {
                        get_reg(t.regs(), &ExtraRegisters::default(), regno)
                    })
                    .unwrap_or_else(|| GdbRegisterValue {
                        regno,
                        value: [0; 16],
                        defined: false,
                        size: 8,
                    });
                dbg.reply_get_reg(&v);
                true
            }
            GdbRequest::SetRegs(_bytes) => {
                // Whole-file writes arrive from clients we don't support;
                // per-register writes are the real path.
                dbg.write_error(1);
                true
            }
            GdbRequest::SetReg(regno, value) => {
                if !self.in_diversion() {
                    // Register writes would diverge the canonical replay.
                    dbg.write_error(1);
                    return true;
                }
                let ok = self
                    .with_current_task(dbg, |t| {
                        let mut regs = *t.regs();
                        match regno {
                            crate::gdb_register::DREG_RIP => {
                                regs.set_ip(RemoteCodePtr::from_val(value as usize))
                            }
                            crate::gdb_register::DREG_RSP => {
                                regs.set_sp(RemotePtr::from_val(value as usize))
                            }
                            crate::gdb_register::DREG_RAX => regs.set_syscallno(value as i64),
                            crate::gdb_register::DREG_RDI => regs.set_arg1(value as usize),
                            crate::gdb_register::DREG_RSI => regs.set_arg2(value as usize),
                            crate::gdb_register::DREG_RDX => regs.set_arg3(value as usize),
                            _ => return false,
                        }
                        t.set_regs(regs);
                        t.flush_regs();
                        true
                    })
                    .unwrap_or(false);
                if ok {
                    dbg.write_ok();
                } else {
                    dbg.write_error(1);
                }
                true
            }
            GdbRequest::GetMem { addr, len } => {
                let result = self.read_mem(dbg, addr, len);
                match result {
                    Some(bytes) => dbg.reply_get_mem(&bytes),
                    None => dbg.write_error(1),
                }
                true
            }
            GdbRequest::SetMem { addr, bytes } => {
                if !self.in_diversion() {
                    dbg.write_error(1);
                    return true;
                }
                let ok = self
                    .with_current_task(dbg, |t| {
                        t.write_bytes_fallible(RemotePtr::from_val(addr), &bytes)
                            .map(|n| n == bytes.len())
                            == Ok(true)
                    })
                    .unwrap_or(false);
                if ok {
                    dbg.write_ok();
                } else {
                    dbg.write_error(1);
                }
                true
            }
            GdbRequest::SearchMem { addr, len, needle } => {
                match self.read_mem(dbg, addr, len) {
                    Some(hay) => match crate::util::find_bytes(&hay, &needle) {
                        Some(offset) => {
                            dbg.write_packet(&format!("1,{:x}", addr + offset));
                        }
                        None => dbg.write_packet("0"),
                    },
                    None => dbg.write_packet("0"),
                }
                true
            }
            GdbRequest::SetBreakpoint {
                kind,
                addr,
                len,
                conditions,
            } => {
                let ok = match kind {
                    BreakpointKind::Software | BreakpointKind::Hardware => {
                        if !conditions.is_empty() {
                            let exprs = conditions
                                .iter()
                                .map(|b| GdbExpression::new(b))
                                .collect();
                            self.conditions.insert(addr, exprs);
                        }
                        self.timeline.add_breakpoint(RemoteCodePtr::from_val(addr))
                    }
                    BreakpointKind::WriteWatch => self.timeline.add_watchpoint(
                        RemotePtr::from_val(addr),
                        len,
                        WatchType::Write,
                    ),
                    BreakpointKind::ReadWatch | BreakpointKind::AccessWatch => self
                        .timeline
                        .add_watchpoint(RemotePtr::from_val(addr), len, WatchType::ReadWrite),
                };
                if ok {
                    dbg.write_ok();
                } else {
                    dbg.write_error(1);
                }
                true
            }
            GdbRequest::RemoveBreakpoint { kind, addr, len } => {
                match kind {
                    BreakpointKind::Software | BreakpointKind::Hardware => {
                        self.conditions.remove(&addr);
                        self.timeline.remove_breakpoint(RemoteCodePtr::from_val(addr));
                    }
                    BreakpointKind::WriteWatch => self.timeline.remove_watchpoint(
                        RemotePtr::from_val(addr),
                        len,
                        WatchType::Write,
                    ),
                    BreakpointKind::ReadWatch | BreakpointKind::AccessWatch => self
                        .timeline
                        .remove_watchpoint(RemotePtr::from_val(addr), len, WatchType::ReadWrite),
                }
                dbg.write_ok();
                true
            }
            GdbRequest::Resume { action, reverse } => {
                self.handle_resume(dbg, action, reverse);
                true
            }
            GdbRequest::QueryThreadList => {
                let tids: Vec<pid_t> = self
                    .current_replay()
                    .session
                    .tasks
                    .values()
                    .map(|t| t.rec_tid)
                    .collect();
                dbg.reply_thread_list(&tids);
                true
            }
            GdbRequest::GetCurrentThread => {
                let tid = self
                    .current_tuid(dbg)
                    .map(|uid| self.current_replay().session.task(uid).rec_tid)
                    .unwrap_or(1);
                dbg.reply_current_thread(tid);
                true
            }
            GdbRequest::SetQueryThread(tid) => {
                dbg.query_thread = tid;
                dbg.write_ok();
                true
            }
            GdbRequest::SetResumeThread(tid) => {
                dbg.resume_thread = tid;
                dbg.write_ok();
                true
            }
            GdbRequest::ThreadAlive(tid) => {
                if self
                    .current_replay()
                    .session
                    .find_task_by_rec_tid(tid)
                    .is_some()
                {
                    dbg.write_ok();
                } else {
                    dbg.write_error(1);
                }
                true
            }
            GdbRequest::GetStopReason => {
                self.notify_current_stop(dbg, libc::SIGTRAP, None);
                true
            }
            GdbRequest::ReadSiginfo => {
                self.enter_diversion();
                let si = self
                    .with_current_task(dbg, |t| *t.siginfo())
                    .unwrap_or_else(|| unsafe { std::mem::zeroed() });
                dbg.write_hex_bytes_packet(crate::util::u8_slice(&si));
                true
            }
            GdbRequest::WriteSiginfo => {
                if self.diversion_refcount > 0 {
                    self.diversion_refcount -= 1;
                    if self.diversion_refcount == 0 {
                        self.teardown_diversion();
                    }
                }
                dbg.write_ok();
                true
            }
            GdbRequest::Detach => {
                self.teardown_diversion();
                dbg.write_ok();
                false
            }
            GdbRequest::Kill => {
                self.teardown_diversion();
                dbg.write_ok();
                false
            }
            GdbRequest::Restart { param } => {
                self.teardown_diversion();
                self.handle_restart(dbg, &param);
                true
            }
            GdbRequest::EngineCmd(cmd) => {
                let result = self.handle_engine_cmd(&cmd);
                dbg.reply_engine_cmd(&result);
                true
            }
        }
    }

    fn with_current_task<R>(
        &mut self,
        dbg: &GdbConnection,
        f: impl FnOnce(&mut crate::task::Task) -> R,
    ) -> Option<R> {
        let tuid = self.current_tuid(dbg)?;
        if !self.current_replay().session.tasks.contains_key(&tuid) {
            return None;
        }
        let t = self.current_replay_mut().session.task_mut(tuid);
        Some(f(t))
    }

    fn read_regs(&mut self, dbg: &GdbConnection) -> Option<Vec<GdbRegisterValue>> {
        self.with_current_task(dbg, |t| {
            let regs = *t.regs();
            let extra = t.extra_regs().clone();
            (0..DREG_NUM_X64)
                .map(|i| get_reg(&regs, &extra, i))
                .collect()
        })
    }

    /// Read tracee memory for the client, with installed breakpoint bytes
    /// replaced by the original instruction bytes.
    fn read_mem(&mut self, dbg: &GdbConnection, addr: usize, len: usize) -> Option<Vec<u8>> {
        let tuid = self.current_tuid(dbg)?;
        if !self.current_replay().session.tasks.contains_key(&tuid) {
            return None;
        }
        let replay = self.current_replay_mut();
        let (t, vm) = replay.session.task_and_vm_mut(tuid);
        let mut buf = vec![0u8; len];
        let n = t
            .read_bytes_fallible(RemotePtr::from_val(addr), &mut buf)
            .ok()?;
        buf.truncate(n);
        vm.replace_breakpoints_with_original_values(&mut buf, RemotePtr::from_val(addr));
        Some(buf)
    }

    fn enter_diversion(&mut self) {
        self.diversion_refcount += 1;
        if self.diversion.is_some() {
            return;
        }
        // Branch off the canonical replay: an equivalent session at the
        // same coordinate whose tracees are free to diverge.
        let dir = self.timeline.current_session().trace_dir().to_owned();
        let time = self.timeline.current_session().current_frame_time();
        let ticks = self
            .timeline
            .current_session()
            .current_task_uid()
            .map(|uid| {
                self.timeline
                    .current_session()
                    .session
                    .task(uid)
                    .tick_count()
            })
            .unwrap_or(0);
        let mut branched = ReplaySession::create_at(Some(dir.as_os_str()), time, ticks);
        self.timeline.mirror_into(&mut branched);
        self.diversion = Some(DiversionSession::new(branched));
    }

    /// A conditional breakpoint stop is real only if some condition
    /// evaluates nonzero (or evaluation fails).
    fn breakpoint_condition_holds(&mut self, tuid: TaskUid) -> bool {
        let ip = {
            let t = self.current_replay_mut().session.task_mut(tuid);
            t.ip().as_usize()
        };
        let exprs = match self.conditions.get(&ip) {
            Some(e) if !e.is_empty() => e,
            _ => return true,
        };
        // Clone the expressions out so the borrow on self.conditions ends
        // before the task borrow starts.
        let exprs = exprs.clone();
        let t = self.current_replay_mut().session.task_mut(tuid);
        let mut any = false;
        for e in exprs.iter() {
            match e.evaluate(t) {
                Some(0) => {}
                _ => {
                    any = true;
                    break;
                }
            }
        }
        any
    }

    fn handle_resume(&mut self, dbg: &mut GdbConnection, action: ResumeAction, reverse: bool) {
        if self.in_diversion() {
            if reverse {
                // Reverse execution makes no sense in a diversion.
                self.teardown_diversion();
            } else {
                self.diversion_resume(dbg, action);
                return;
            }
        }

        let command = match action {
            ResumeAction::Step | ResumeAction::StepWithSignal(_) => RunCommand::Singlestep,
            _ => RunCommand::Continue,
        };

        if reverse {
            let mut interrupted = false;
            let result = if command == RunCommand::Singlestep {
                let tuid = self.current_tuid(dbg).unwrap_or_else(|| {
                    self.timeline
                        .current_session()
                        .session
                        .tasks
                        .keys()
                        .next()
                        .copied()
                        .unwrap()
                });
                self.timeline
                    .reverse_singlestep(tuid, &mut || interrupted)
            } else {
                self.timeline.reverse_continue(&mut || interrupted)
            };
            self.report_break(dbg, &result.break_status, libc::SIGTRAP);
            return;
        }

        loop {
            let result = self.timeline.replay_step_forward(command, 0);
            if result.status == ReplayStatus::Exited {
                dbg.notify_exit_code(self.final_exit_code);
                return;
            }
            let bs = result.break_status.clone();
            if bs.breakpoint_hit {
                if let Some(tuid) = bs.task {
                    if !self.breakpoint_condition_holds(tuid) {
                        continue;
                    }
                }
                self.report_break(dbg, &bs, libc::SIGTRAP);
                return;
            }
            if !bs.watchpoints_hit.is_empty() || bs.singlestep_complete {
                self.report_break(dbg, &bs, libc::SIGTRAP);
                return;
            }
            if let Some(sig) = bs.signal {
                self.report_break(dbg, &bs, sig);
                return;
            }
            if command == RunCommand::Singlestep {
                self.report_break(dbg, &bs, libc::SIGTRAP);
                return;
            }
        }
    }

    fn diversion_resume(&mut self, dbg: &mut GdbConnection, action: ResumeAction) {
        let command = match action {
            ResumeAction::Step | ResumeAction::StepWithSignal(_) => RunCommand::Singlestep,
            _ => RunCommand::Continue,
        };
        let tuid = match self.current_tuid(dbg) {
            Some(uid) => uid,
            None => {
                dbg.write_error(1);
                return;
            }
        };
        loop {
            let d = self.diversion.as_mut().unwrap();
            let result = d.diversion_step(tuid, command);
            if result.status == DiversionStatus::DiversionExited {
                self.teardown_diversion();
                self.notify_current_stop(dbg, libc::SIGTRAP, None);
                return;
            }
            let bs = result.break_status;
            if bs.breakpoint_hit || bs.singlestep_complete || !bs.watchpoints_hit.is_empty() {
                self.report_break(dbg, &bs, libc::SIGTRAP);
                return;
            }
            if let Some(sig) = bs.signal {
                self.report_break(dbg, &bs, sig);
                return;
            }
        }
    }

    fn report_break(&self, dbg: &mut GdbConnection, bs: &BreakStatus, sig: i32) {
        let tid = bs
            .task
            .filter(|uid| self.current_replay().session.tasks.contains_key(uid))
            .map(|uid| self.current_replay().session.task(uid).rec_tid)
            .unwrap_or(1);
        let watch = bs.watchpoints_hit.first().map(|w| w.addr.as_usize());
        dbg.notify_stop(tid, sig, watch);
    }

    fn notify_current_stop(&self, dbg: &mut GdbConnection, sig: i32, watch: Option<usize>) {
        let tid = self
            .current_replay()
            .current_task_uid()
            .filter(|uid| self.current_replay().session.tasks.contains_key(uid))
            .map(|uid| self.current_replay().session.task(uid).rec_tid)
            .unwrap_or(1);
        dbg.notify_stop(tid, sig, watch);
    }

    /// Restart targets: empty (previous), `c<id>` (checkpoint), decimal
    /// event number.
    fn handle_restart(&mut self, dbg: &mut GdbConnection, param: &str) {
        if let Some(id_str) = param.strip_prefix('c') {
            if let Ok(id) = id_str.parse::<u32>() {
                if let Some(cp) = self.checkpoints.get(&id) {
                    let mark = cp.mark.clone();
                    self.timeline.seek_to_mark(&mark);
                    self.notify_current_stop(dbg, libc::SIGTRAP, None);
                    return;
                }
            }
            dbg.write_error(1);
            return;
        }
        if !param.is_empty() {
            if let Ok(event) = param.parse::<FrameTime>() {
                let dir = self.timeline.current_session().trace_dir().to_owned();
                let fresh = ReplaySession::create(Some(dir.as_os_str()));
                self.timeline = ReplayTimeline::new(fresh);
                self.seek_to_event(event);
                self.debugger_restart_mark = Some(self.timeline.mark());
                self.notify_current_stop(dbg, libc::SIGTRAP, None);
                return;
            }
        }
        match self.debugger_restart_mark.clone() {
            Some(mark) => {
                self.timeline.seek_to_mark(&mark);
            }
            None => {
                let dir = self.timeline.current_session().trace_dir().to_owned();
                let fresh = ReplaySession::create(Some(dir.as_os_str()));
                self.timeline = ReplayTimeline::new(fresh);
            }
        }
        self.notify_current_stop(dbg, libc::SIGTRAP, None);
    }

    /// The custom command channel: `when`, `when-ticks`, `when-tid`,
    /// `checkpoint`, `delete checkpoint`, `info checkpoints`.
    fn handle_engine_cmd(&mut self, cmd: &str) -> String {
        let mut words = cmd.split_whitespace();
        match words.next() {
            Some("when") => format!(
                "Current event: {}",
                self.timeline.current_session().current_frame_time()
            ),
            Some("when-ticks") => {
                let ticks = self
                    .timeline
                    .current_session()
                    .current_task_uid()
                    .map(|uid| {
                        self.timeline
                            .current_session()
                            .session
                            .task(uid)
                            .tick_count()
                    })
                    .unwrap_or(0);
                format!("Current tick: {}", ticks)
            }
            Some("when-tid") => {
                let tid = self
                    .timeline
                    .current_session()
                    .current_task_uid()
                    .map(|uid| self.timeline.current_session().session.task(uid).rec_tid)
                    .unwrap_or(0);
                format!("Current tid: {}", tid)
            }
            Some("checkpoint") => {
                if !self.timeline.can_add_checkpoint() {
                    return "Cannot create checkpoint: budget exhausted. \
                            Delete one with `delete checkpoint'."
                        .to_owned();
                }
                let where_: String = words.collect::<Vec<_>>().join(" ");
                let mark = self.timeline.add_explicit_checkpoint();
                let id = self.next_checkpoint_id;
                self.next_checkpoint_id += 1;
                self.checkpoints.insert(id, Checkpoint { mark, where_ });
                format!("Checkpoint {} at event {}", id, self
                    .timeline
                    .current_session()
                    .current_frame_time())
            }
            Some("delete") => match (words.next(), words.next().and_then(|w| w.parse().ok())) {
                (Some("checkpoint"), Some(id)) => match self.checkpoints.remove(&id) {
                    Some(cp) => {
                        self.timeline.remove_explicit_checkpoint(&cp.mark);
                        String::new()
                    }
                    None => format!("No checkpoint {}", id),
                },
                _ => "Usage: delete checkpoint <id>".to_owned(),
            },
            Some("info") => {
                if words.next() == Some("checkpoints") {
                    if self.checkpoints.is_empty() {
                        return "No checkpoints.".to_owned();
                    }
                    let mut ids: Vec<&u32> = self.checkpoints.keys().collect();
                    ids.sort();
                    let mut out = String::from("ID\tWHEN\tWHERE\n");
                    for id in ids {
                        let cp = &self.checkpoints[id];
                        out.push_str(&format!(
                            "{}\t{}\t{}\n",
                            id,
                            cp.mark.time(),
                            cp.where_
                        ));
                    }
                    out
                } else {
                    "Unknown info request".to_owned()
                }
            }
            _ => format!("Unknown command `{}'", cmd),
        }
    }
}

/// Write the client launch script: connect, define the custom commands, and
/// install the resume-alias hook that works around clients which require a
/// resume-like command before the first breakpoint stop.
pub fn write_launch_script(
    exe: &str,
    port: u16,
    flags: &GdbServerFlags,
) -> std::io::Result<PathBuf> {
    let mut path = PathBuf::from(crate::util::tmp_dir());
    path.push(format!("retrace-launch-{}", std::process::id()));
    let mut script = String::new();
    script.push_str(&format!("target extended-remote 127.0.0.1:{}\n", port));
    if !exe.is_empty() {
        script.push_str(&format!("file {}\n", exe));
    }
    for (name, body) in [
        ("restart", "run"),
        (
            "checkpoint",
            "python gdb.execute('maintenance packet qRetraceCmd:checkpoint')",
        ),
        (
            "when",
            "python gdb.execute('maintenance packet qRetraceCmd:when')",
        ),
        (
            "when-ticks",
            "python gdb.execute('maintenance packet qRetraceCmd:when-ticks')",
        ),
        (
            "when-tid",
            "python gdb.execute('maintenance packet qRetraceCmd:when-tid')",
        ),
    ]
    .iter()
    {
        script.push_str(&format!("define {}\n{}\nend\n", name, body));
    }
    if let Some(cf) = &flags.command_file {
        script.push_str(&format!("source {}\n", cf.display()));
    }
    let mut f = fs::File::create(&path)?;
    f.write_all(script.as_bytes())?;
    Ok(path)
}
