use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::address_space::{BreakpointType, WatchType};
use crate::session::replay::{ReplaySession, ReplayStatus, StepConstraints};
use crate::session::{BreakStatus, RunCommand};
use crate::ticks::Ticks;
use crate::trace::frame::FrameTime;
use crate::uid::TaskUid;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::rc::Rc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunDirection {
    Forward,
    Backward,
}

/// Totally ordered coordinate of replay progress. Different program states
/// can share a key (same frame, same tick count, same step phase); the
/// marks-vector order resolves those.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
pub struct MarkKey {
    pub trace_time: FrameTime,
    pub ticks: Ticks,
    pub step_key: crate::session::replay::ReplayStepKey,
}

impl MarkKey {
    fn new(
        trace_time: FrameTime,
        ticks: Ticks,
        step_key: crate::session::replay::ReplayStepKey,
    ) -> MarkKey {
        MarkKey {
            trace_time,
            ticks,
            step_key,
        }
    }
}

/// Everything known about the tracee state at a mark. The key alone cannot
/// order two marks that share it; position in the owning vector does.
struct InternalMark {
    key: MarkKey,
    regs: Registers,
    extra_regs_hash: u64,
    tuid: Option<TaskUid>,
    /// Marks with a checkpoint can be restored without replaying from an
    /// earlier point.
    checkpoint: bool,
    checkpoint_refcount: u32,
    /// Single-stepping from this mark reaches the next mark in the vector
    /// with no signal reported; lets reverse-singlestep skip a replay.
    singlestep_to_next_mark_no_signal: bool,
}

/// An opaque, cheap handle on a reachable replay state.
#[derive(Clone)]
pub struct Mark {
    ptr: Rc<std::cell::RefCell<InternalMark>>,
}

impl Mark {
    pub fn key(&self) -> MarkKey {
        self.ptr.borrow().key
    }

    pub fn regs(&self) -> Registers {
        self.ptr.borrow().regs
    }

    pub fn time(&self) -> FrameTime {
        self.ptr.borrow().key.trace_time
    }

    pub fn tuid(&self) -> Option<TaskUid> {
        self.ptr.borrow().tuid
    }
}

impl PartialEq for Mark {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.ptr, &other.ptr)
    }
}
impl Eq for Mark {}

impl fmt::Debug for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.ptr.borrow();
        write!(
            f,
            "Mark(time:{} ticks:{} ip:{})",
            m.key.trace_time,
            m.key.ticks,
            m.regs.ip()
        )
    }
}

/// Budget of simultaneously retained checkpoints. A checkpoint's restore
/// cost is bounded but its retention cost (here, replay metadata; in a
/// fork-based implementation, frozen tracees and EmuFs copies) is not free.
const MAX_CHECKPOINTS: usize = 32;

/// How often the reverse-execution machinery drops a heuristic checkpoint
/// while scanning forward, in trace frames.
const CHECKPOINT_INTERVAL_EVENTS: FrameTime = 5000;

/// Manages forward and reverse navigation over one recording, on top of a
/// ReplaySession. Reverse execution is "restore an earlier state, replay
/// forward, remember where the interesting thing last happened".
pub struct ReplayTimeline {
    current: ReplaySession,
    trace_dir: OsString,
    /// For each key, marks in execution order.
    marks: BTreeMap<MarkKey, Vec<Rc<std::cell::RefCell<InternalMark>>>>,
    /// Number of checkpoints per key.
    marks_with_checkpoints: BTreeMap<MarkKey, u32>,
    checkpoint_count: usize,
    /// Breakpoints/watchpoints requested by the debugger, applied to
    /// whichever session is current.
    breakpoints: Vec<RemoteCodePtr>,
    watchpoints: Vec<(RemotePtr<Void>, usize, WatchType)>,
    breakpoints_applied: bool,
    /// Set while navigating so mark() during internal replay doesn't
    /// recurse into checkpoint policy.
    reverse_execution_barrier_event: FrameTime,
}

impl ReplayTimeline {
    pub fn new(session: ReplaySession) -> ReplayTimeline {
        let trace_dir = session.trace_dir().to_owned();
        ReplayTimeline {
            current: session,
            trace_dir,
            marks: BTreeMap::new(),
            marks_with_checkpoints: BTreeMap::new(),
            checkpoint_count: 0,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            breakpoints_applied: false,
            reverse_execution_barrier_event: 0,
        }
    }

    pub fn current_session(&self) -> &ReplaySession {
        &self.current
    }

    pub fn current_session_mut(&mut self) -> &mut ReplaySession {
        &mut self.current
    }

    fn current_mark_key(&self) -> MarkKey {
        let ticks = self
            .current
            .current_task_uid()
            .map(|uid| self.current.session.task(uid).tick_count())
            .unwrap_or(0);
        MarkKey::new(
            self.current.current_frame_time(),
            ticks,
            self.current.current_step_key(),
        )
    }

    /// Return (creating if needed) a mark for the current state.
    pub fn mark(&mut self) -> Mark {
        let key = self.current_mark_key();
        let (regs, extra_hash, tuid) = match self.current.current_task_uid() {
            Some(uid) => {
                let t = self.current.session.task_mut(uid);
                let regs = *t.regs();
                let hash = t.extra_regs().content_hash();
                (regs, hash, Some(uid))
            }
            None => (Registers::default(), 0, None),
        };

        // An existing equivalent mark is reused: marks are identities, and
        // their vector position encodes execution order.
        if let Some(existing) = self.marks.get(&key) {
            for m in existing {
                let mb = m.borrow();
                if mb.regs.matches(&regs) && mb.extra_regs_hash == extra_hash {
                    drop(mb);
                    return Mark { ptr: m.clone() };
                }
            }
        }

        let internal = Rc::new(std::cell::RefCell::new(InternalMark {
            key,
            regs,
            extra_regs_hash: extra_hash,
            tuid,
            checkpoint: false,
            checkpoint_refcount: 0,
            singlestep_to_next_mark_no_signal: false,
        }));
        self.marks.entry(key).or_default().push(internal.clone());
        Mark { ptr: internal }
    }

    pub fn can_add_checkpoint(&self) -> bool {
        self.checkpoint_count < MAX_CHECKPOINTS
    }

    /// Pin the current state as an explicit checkpoint. The mark's state
    /// becomes directly restorable and is charged against the global
    /// budget.
    pub fn add_explicit_checkpoint(&mut self) -> Mark {
        debug_assert!(self.can_add_checkpoint());
        let mark = self.mark();
        {
            let mut m = mark.ptr.borrow_mut();
            if !m.checkpoint {
                m.checkpoint = true;
                self.checkpoint_count += 1;
                *self.marks_with_checkpoints.entry(m.key).or_insert(0) += 1;
            }
            m.checkpoint_refcount += 1;
        }
        mark
    }

    pub fn remove_explicit_checkpoint(&mut self, mark: &Mark) {
        let mut m = mark.ptr.borrow_mut();
        debug_assert!(m.checkpoint_refcount > 0);
        m.checkpoint_refcount -= 1;
        if m.checkpoint_refcount == 0 && m.checkpoint {
            m.checkpoint = false;
            self.checkpoint_count -= 1;
            if let Some(count) = self.marks_with_checkpoints.get_mut(&m.key) {
                *count -= 1;
                if *count == 0 {
                    let key = m.key;
                    self.marks_with_checkpoints.remove(&key);
                }
            }
        }
    }

    /// Apply the debugger's breakpoints and watchpoints to the current
    /// session's tracees.
    pub fn apply_breakpoints_and_watchpoints(&mut self) {
        if self.breakpoints_applied {
            return;
        }
        self.breakpoints_applied = true;
        let uids: Vec<TaskUid> = self.current.session.tasks.keys().copied().collect();
        for uid in uids {
            let (t, vm) = self.current.session.task_and_vm_mut(uid);
            for bp in &self.breakpoints {
                vm.add_breakpoint(t, *bp, BreakpointType::User);
            }
            for (addr, len, kind) in &self.watchpoints {
                vm.add_watchpoint(t, *addr, *len, *kind);
            }
        }
    }

    pub fn unapply_breakpoints_and_watchpoints(&mut self) {
        if !self.breakpoints_applied {
            return;
        }
        self.breakpoints_applied = false;
        let uids: Vec<TaskUid> = self.current.session.tasks.keys().copied().collect();
        for uid in uids {
            let (t, vm) = self.current.session.task_and_vm_mut(uid);
            for bp in &self.breakpoints {
                vm.remove_breakpoint(t, *bp, BreakpointType::User);
            }
            for (addr, len, kind) in &self.watchpoints {
                vm.remove_watchpoint(*addr, *len, *kind);
            }
        }
    }

    pub fn add_breakpoint(&mut self, addr: RemoteCodePtr) -> bool {
        self.unapply_breakpoints_and_watchpoints();
        if !self.breakpoints.contains(&addr) {
            self.breakpoints.push(addr);
        }
        self.apply_breakpoints_and_watchpoints();
        true
    }

    pub fn remove_breakpoint(&mut self, addr: RemoteCodePtr) {
        self.unapply_breakpoints_and_watchpoints();
        self.breakpoints.retain(|a| *a != addr);
        self.apply_breakpoints_and_watchpoints();
    }

    pub fn add_watchpoint(&mut self, addr: RemotePtr<Void>, len: usize, kind: WatchType) -> bool {
        self.unapply_breakpoints_and_watchpoints();
        if !self.watchpoints.iter().any(|(a, l, k)| *a == addr && *l == len && *k == kind) {
            self.watchpoints.push((addr, len, kind));
        }
        self.apply_breakpoints_and_watchpoints();
        true
    }

    pub fn remove_watchpoint(&mut self, addr: RemotePtr<Void>, len: usize, kind: WatchType) {
        self.unapply_breakpoints_and_watchpoints();
        self.watchpoints
            .retain(|(a, l, k)| !(*a == addr && *l == len && *k == kind));
        self.apply_breakpoints_and_watchpoints();
    }

    pub fn remove_all_breakpoints_and_watchpoints(&mut self) {
        self.unapply_breakpoints_and_watchpoints();
        self.breakpoints.clear();
        self.watchpoints.clear();
    }

    /// Install this timeline's breakpoints and watchpoints into another
    /// session's tracees; a diversion branched off the timeline inherits
    /// them on entry.
    pub fn mirror_into(&self, replay: &mut ReplaySession) {
        let uids: Vec<TaskUid> = replay.session.tasks.keys().copied().collect();
        for uid in uids {
            let (t, vm) = replay.session.task_and_vm_mut(uid);
            for bp in &self.breakpoints {
                vm.add_breakpoint(t, *bp, BreakpointType::User);
            }
            for (addr, len, kind) in &self.watchpoints {
                vm.add_watchpoint(t, *addr, *len, *kind);
            }
        }
    }

    /// Restore the state `mark` describes. Checkpoints restore from replay
    /// metadata: a fresh session is replayed forward to the mark
    /// coordinate. (A fork-based engine restores by cloning frozen
    /// tracees; the coordinates and semantics are identical, only cost
    /// differs.)
    pub fn seek_to_mark(&mut self, mark: &Mark) {
        let key = mark.key();
        self.unapply_breakpoints_and_watchpoints();
        let trace_dir = self.trace_dir.clone();
        let session =
            ReplaySession::create_at(Some(trace_dir.as_os_str()), key.trace_time, key.ticks);
        self.current = session;
        // Frame-level positioning done; advance tick-precisely to the mark.
        self.run_to_mark_state(mark);
        self.apply_breakpoints_and_watchpoints();
    }

    /// Advance the (already frame-positioned) current session until its
    /// state equals the mark's.
    fn run_to_mark_state(&mut self, mark: &Mark) {
        let key = mark.key();
        let target_regs = mark.regs();
        for _ in 0..0x4000_0000u64 {
            if self.current.done() {
                return;
            }
            let now_key = self.current_mark_key();
            if now_key >= key {
                if let Some(uid) = self.current.current_task_uid() {
                    let t = self.current.session.task_mut(uid);
                    if t.regs().matches(&target_regs) {
                        return;
                    }
                }
                if now_key > key {
                    // Overshot: the mark described a state inside a frame
                    // we've completed. Frame-boundary equality is the best
                    // the reconstruction offers.
                    return;
                }
            }
            let mut constraints = StepConstraints::default();
            constraints.stop_at_time = key.trace_time + 1;
            constraints.ticks_target = key.ticks;
            let result = self.current.replay_step(&constraints);
            if result.status == ReplayStatus::Exited {
                return;
            }
        }
    }

    /// One forward step (or continue) of the current session, with
    /// breakpoints applied.
    pub fn replay_step_forward(
        &mut self,
        command: RunCommand,
        stop_at_time: FrameTime,
    ) -> crate::session::replay::ReplayResult {
        self.apply_breakpoints_and_watchpoints();
        let mut constraints = StepConstraints::with_command(command);
        constraints.stop_at_time = stop_at_time;
        let result = self.current.replay_step(&constraints);
        self.maybe_add_heuristic_checkpoint();
        result
    }

    fn maybe_add_heuristic_checkpoint(&mut self) {
        let time = self.current.current_frame_time();
        if time < self.reverse_execution_barrier_event {
            return;
        }
        if time % CHECKPOINT_INTERVAL_EVENTS == 0 && self.can_add_checkpoint() {
            let _ = self.add_explicit_checkpoint();
        }
    }

    /// The latest checkpointed mark strictly before `key`, if any.
    fn find_checkpoint_before(&self, key: MarkKey) -> Option<Mark> {
        let mut best: Option<Mark> = None;
        for (k, _count) in self.marks_with_checkpoints.range(..key) {
            if let Some(v) = self.marks.get(k) {
                for m in v {
                    if m.borrow().checkpoint {
                        best = Some(Mark { ptr: m.clone() });
                    }
                }
            }
        }
        best
    }

    /// Run backward until a breakpoint/watchpoint fires (per the installed
    /// sets), or the beginning of the trace. `interrupt_check` is polled
    /// between bounded forward scans.
    pub fn reverse_continue(
        &mut self,
        interrupt_check: &mut dyn FnMut() -> bool,
    ) -> crate::session::replay::ReplayResult {
        use crate::session::replay::ReplayResult;

        let end_mark = self.mark();
        let end_key = end_mark.key();

        // Scan window: from the nearest checkpoint (or trace start) up to
        // the current position, remembering the LAST stop before the end.
        let start = self.find_checkpoint_before(end_key);
        match start {
            Some(ref m) => self.seek_to_mark(m),
            None => {
                self.unapply_breakpoints_and_watchpoints();
                let trace_dir = self.trace_dir.clone();
                self.current = ReplaySession::create(Some(trace_dir.as_os_str()));
                self.apply_breakpoints_and_watchpoints();
            }
        }

        let mut last_hit: Option<(Mark, BreakStatus)> = None;
        loop {
            if interrupt_check() {
                break;
            }
            if self.current_mark_key() >= end_key || self.current.done() {
                break;
            }
            let result = self.replay_step_forward(RunCommand::Continue, end_key.trace_time + 1);
            if result.status == ReplayStatus::Exited {
                break;
            }
            if result.break_status.breakpoint_hit
                || !result.break_status.watchpoints_hit.is_empty()
            {
                let here = self.mark();
                if here.key() < end_key {
                    last_hit = Some((here, result.break_status.clone()));
                } else {
                    break;
                }
            }
        }

        match last_hit {
            Some((mark, bs)) => {
                self.seek_to_mark(&mark);
                let mut r = ReplayResult {
                    status: ReplayStatus::Continue,
                    break_status: bs,
                    did_fast_forward: false,
                };
                r.break_status.task = self.current.current_task_uid();
                r
            }
            None => {
                // Nothing fired: rest at the beginning of the window.
                let start_of_trace = ReplayResult {
                    status: ReplayStatus::Continue,
                    break_status: BreakStatus::new(),
                    did_fast_forward: false,
                };
                start_of_trace
            }
        }
    }

    /// Step one instruction backward on `tuid`: land on the state whose
    /// single-step successor is the current state.
    ///
    /// The lazy path: when the previous call (or a forward step) recorded
    /// the predecessor mark and the window is known signal-free, return it
    /// without replaying.
    pub fn reverse_singlestep(
        &mut self,
        tuid: TaskUid,
        interrupt_check: &mut dyn FnMut() -> bool,
    ) -> crate::session::replay::ReplayResult {
        use crate::session::replay::ReplayResult;

        let end_mark = self.mark();
        let end_key = end_mark.key();

        // Lazy shortcut: a known predecessor with a clean single-step edge.
        if let Some(prev) = self.known_predecessor(&end_mark) {
            self.seek_to_mark(&prev);
            let mut r = ReplayResult {
                status: ReplayStatus::Continue,
                break_status: BreakStatus::new(),
                did_fast_forward: false,
            };
            r.break_status.task = Some(tuid);
            r.break_status.singlestep_complete = true;
            return r;
        }

        // Replay from an earlier point, single-stepping, keeping the
        // previous mark until the current state reappears.
        let start = self.find_checkpoint_before(end_key);
        match start {
            Some(ref m) => self.seek_to_mark(m),
            None => {
                self.unapply_breakpoints_and_watchpoints();
                let trace_dir = self.trace_dir.clone();
                self.current = ReplaySession::create(Some(trace_dir.as_os_str()));
                self.apply_breakpoints_and_watchpoints();
            }
        }

        let mut prev_mark: Option<Mark> = None;
        loop {
            if interrupt_check() {
                break;
            }
            let here = self.mark();
            if here.key() >= end_key || self.current.done() {
                break;
            }
            let result =
                self.replay_step_forward(RunCommand::Singlestep, end_key.trace_time + 1);
            if result.status == ReplayStatus::Exited {
                break;
            }
            let now = self.mark();
            if now.key() >= end_key {
                break;
            }
            // Chain the marks for the lazy path next time.
            if let Some(ref p) = prev_mark {
                if result.break_status.signal.is_none() {
                    p.ptr.borrow_mut().singlestep_to_next_mark_no_signal = true;
                }
            }
            prev_mark = Some(now);
        }

        let mut r = ReplayResult {
            status: ReplayStatus::Continue,
            break_status: BreakStatus::new(),
            did_fast_forward: false,
        };
        if let Some(mark) = prev_mark {
            self.seek_to_mark(&mark);
        }
        r.break_status.task = self
            .current
            .current_task_uid()
            .or(Some(tuid));
        r.break_status.singlestep_complete = true;
        r
    }

    /// The stored predecessor of `mark` in its key-vector chain, when the
    /// single-step edge between them is known clean.
    fn known_predecessor(&self, mark: &Mark) -> Option<Mark> {
        let key = mark.key();
        // Search this key's vector and the nearest earlier key.
        let mut prev: Option<Mark> = None;
        for (_k, v) in self.marks.range(..=key) {
            for m in v {
                if Rc::ptr_eq(m, &mark.ptr) {
                    return prev.filter(|p| {
                        p.ptr.borrow().singlestep_to_next_mark_no_signal
                    });
                }
                prev = Some(Mark { ptr: m.clone() });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_keys_order_by_time_then_ticks() {
        let a = MarkKey::new(5, 100, Default::default());
        let b = MarkKey::new(5, 200, Default::default());
        let c = MarkKey::new(6, 0, Default::default());
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }
}
