use crate::kernel_metadata::{ptrace_event_name, signal_name};
use libc::{SIGSTOP, SIGTRAP};
use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt;

pub const PTRACE_EVENT_STOP: i32 = 128;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. Requires PTRACE_SEIZE; with PTRACE_ATTACH
    /// these statuses read as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop under PTRACE_SYSCALL with
    /// PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop other than PTRACE_EVENT_STOP.
    PtraceEvent,
}

/// The raw `wait*` status word, decoded lazily. Every stop classification in
/// the engine goes through this one type so the (subtle) bit tests live in
/// exactly one place.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }
        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }
        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }
        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }
        if self.is_syscall() {
            return WaitType::SyscallStop;
        }
        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }
        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        if WIFSIGNALED(self.status) {
            let termsig = WTERMSIG(self.status);
            if termsig > 0 {
                return Some(termsig);
            }
        }
        None
    }

    /// Stop signal if wait_type() == SignalStop, otherwise None. A zero
    /// signal (observed rarely via PTRACE_INTERRUPT) reads as SIGSTOP.
    pub fn stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status) || (self.status >> 16) & 0xff != 0 {
            return None;
        }
        let mut sig = WSTOPSIG(self.status);
        if sig == (SIGTRAP | 0x80) {
            // Syscall-stop under PTRACE_O_TRACESYSGOOD.
            return None;
        }
        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn group_stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status) || (self.status >> 16) & 0xff != PTRACE_EVENT_STOP {
            return None;
        }
        let mut sig = WSTOPSIG(self.status);
        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        if !WIFSTOPPED(self.status) || self.ptrace_event().is_some() {
            return false;
        }
        WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    /// The PTRACE_EVENT_* number, if any (PTRACE_EVENT_STOP excluded; that
    /// reads as a group stop).
    pub fn ptrace_event(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status) {
            return None;
        }
        let event = (self.status >> 16) & 0xff;
        if event == 0 || event == PTRACE_EVENT_STOP {
            None
        } else {
            Some(event)
        }
    }

    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    pub fn for_exit_code(code: i32) -> WaitStatus {
        WaitStatus {
            status: code << 8,
        }
    }

    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        WaitStatus { status: sig }
    }

    pub fn for_syscall_stop() -> WaitStatus {
        WaitStatus {
            status: ((SIGTRAP | 0x80) << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(event: i32) -> WaitStatus {
        WaitStatus {
            status: (event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => {
                write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap()))
            }
            WaitType::GroupStop => write!(
                f,
                " (GROUP-STOP-{})",
                signal_name(self.group_stop_sig().unwrap())
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

impl fmt::Debug for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status() {
        let ws = WaitStatus::for_exit_code(77);
        assert_eq!(ws.wait_type(), WaitType::Exit);
        assert_eq!(ws.exit_code(), Some(77));
        assert_eq!(ws.stop_sig(), None);
    }

    #[test]
    fn fatal_signal() {
        let ws = WaitStatus::for_fatal_sig(libc::SIGKILL);
        assert_eq!(ws.wait_type(), WaitType::FatalSignal);
        assert_eq!(ws.fatal_sig(), Some(libc::SIGKILL));
    }

    #[test]
    fn signal_stop() {
        let ws = WaitStatus::for_stop_sig(libc::SIGSEGV);
        assert_eq!(ws.wait_type(), WaitType::SignalStop);
        assert_eq!(ws.stop_sig(), Some(libc::SIGSEGV));
        assert_eq!(ws.exit_code(), None);
    }

    #[test]
    fn syscall_stop() {
        let ws = WaitStatus::for_syscall_stop();
        assert_eq!(ws.wait_type(), WaitType::SyscallStop);
        assert!(ws.is_syscall());
        assert_eq!(ws.stop_sig(), None);
    }

    #[test]
    fn ptrace_event_stop() {
        let ws = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXEC);
        assert_eq!(ws.wait_type(), WaitType::PtraceEvent);
        assert_eq!(ws.ptrace_event(), Some(libc::PTRACE_EVENT_EXEC));
        assert!(!ws.is_syscall());
    }
}
