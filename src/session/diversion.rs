use crate::session::replay::ReplaySession;
use crate::session::{is_breakpoint_trap, BreakStatus, RunCommand};
use crate::task::{ResumeRequest, WaitRequest};
use crate::uid::TaskUid;
use crate::wait_status::WaitType;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DiversionStatus {
    /// Some execution was done.
    DiversionContinue,
    /// The diversion is over; the tracee exited or did something only the
    /// canonical replay may do.
    DiversionExited,
}

#[derive(Clone)]
pub struct DiversionResult {
    pub status: DiversionStatus,
    pub break_status: BreakStatus,
}

/// A branched execution for the debugger: the tracee runs arbitrary
/// (divergent) code, typically an inferior function call, against the
/// replayed state. Memory and register writes that replay forbids are legal
/// here. The diversion is reference counted by the debugger server and torn
/// down when the last reference drops or the client asks for anything that
/// only makes sense on the canonical timeline.
///
/// This implementation diverts in place: the watchpoint/breakpoint state of
/// the underlying session is saved on entry and restored on teardown, and
/// the timeline seeks back to the entry mark, discarding everything the
/// diverted tracee did.
pub struct DiversionSession {
    pub replay: ReplaySession,
    ref_count: u32,
}

impl DiversionSession {
    /// Enter a diversion over `replay`. Breakpoints and watchpoints are
    /// inherited (mirrored) from the session as it stands.
    pub fn new(mut replay: ReplaySession) -> DiversionSession {
        for vm in replay.session.vms.values_mut() {
            vm.save_watchpoints();
        }
        DiversionSession {
            replay,
            ref_count: 1,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Returns true when the last reference dropped and the diversion must
    /// be torn down.
    pub fn dec_ref(&mut self) -> bool {
        debug_assert!(self.ref_count > 0);
        self.ref_count -= 1;
        self.ref_count == 0
    }

    /// Dissolve the diversion, restoring the saved watchpoint state, and
    /// hand back the underlying session (whose tracee state the timeline
    /// will discard by seeking).
    pub fn into_inner(mut self) -> ReplaySession {
        for vm in self.replay.session.vms.values_mut() {
            vm.restore_watchpoints();
        }
        self.replay
    }

    /// Run the diverted tracee. No trace frames constrain execution here;
    /// the tracee really executes, syscalls included.
    pub fn diversion_step(&mut self, tuid: TaskUid, command: RunCommand) -> DiversionResult {
        let mut result = DiversionResult {
            status: DiversionStatus::DiversionContinue,
            break_status: BreakStatus::new(),
        };
        result.break_status.task = Some(tuid);

        let how = match command {
            RunCommand::Continue => ResumeRequest::Cont,
            _ => ResumeRequest::Singlestep,
        };
        {
            let t = self.replay.session.task_mut(tuid);
            t.resume_execution(how, WaitRequest::ResumeAndWait, 0, None);
        }

        let status = self.replay.session.task(tuid).status();
        match status.wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                result.status = DiversionStatus::DiversionExited;
                result.break_status.task_exit = true;
            }
            WaitType::SignalStop => {
                let sig = status.stop_sig().unwrap();
                let (t, vm) = self.replay.session.task_and_vm_mut(tuid);
                if sig == libc::SIGTRAP {
                    if let Some(bp_ip) = is_breakpoint_trap(t, vm) {
                        t.set_ip(bp_ip);
                        result.break_status.breakpoint_hit = true;
                    } else if vm.notify_watchpoint_fired(t, 0) {
                        result.break_status.watchpoints_hit = vm.consume_watchpoint_changes();
                    } else if command != RunCommand::Continue {
                        result.break_status.singlestep_complete = true;
                    } else {
                        result.break_status.signal = Some(sig);
                    }
                } else {
                    // Signals raised by diverted code go to the debugger,
                    // never to the tracee's handlers.
                    result.break_status.signal = Some(sig);
                }
            }
            WaitType::SyscallStop => {
                // Diverted syscalls execute for real; nothing to report.
            }
            _ => {}
        }
        result
    }
}
