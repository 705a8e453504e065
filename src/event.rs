use crate::kernel_abi::SupportedArch;
use crate::kernel_metadata::{signal_name, syscall_name};
use crate::preload_interface::syscallbuf_record;
use crate::remote_ptr::RemotePtr;
use crate::sig::Sig;
use std::convert::TryFrom;
use std::fmt;

/// Whether the scheduler may switch away from a task while it is inside the
/// current event. Entering a potentially blocking syscall must allow a
/// switch or the whole recording deadlocks; syscalls whose effects must be
/// replayed before a woken task runs (FUTEX_WAKE_OP and friends) must
/// prevent one.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switchable {
    PreventSwitch,
    AllowSwitch,
}

/// Event kinds, in trace-encoding order. The discriminants are the wire
/// values; renumbering breaks every existing trace.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum EventKind {
    Unassigned = 0,
    Sentinel,
    /// Recording-internal glue; never stored in traces.
    Noop,
    Desched,
    SyscallInterruption,
    /// Synthesized when the trace ends; not stored.
    TraceTermination,

    /// Trace-visible kinds:
    /// Task exit, no associated data.
    Exit,
    /// Return from a signal handler.
    ExitSighandler,
    /// A syscall interrupted by a signal was not restarted by the tracee.
    InterruptedSyscallNotRestarted,
    /// A scheduling signal interrupted execution.
    Sched,
    /// A disabled RDTSC (or similar trapped instruction) retired.
    InstructionTrap,
    /// Recorded syscallbuf data for one or more buffered syscalls.
    SyscallbufFlush,
    SyscallbufAbortCommit,
    /// The syscallbuf was reset to empty. Recorded later than it happens:
    /// replay must pass the flush first so preload code is done with the
    /// data.
    SyscallbufReset,
    /// A syscall instruction was rewritten to the buffering trampoline.
    PatchSyscall,
    /// Map pages ahead of a future access; paired with an mmaps record.
    GrowMap,
    /// Task exited without a clean ptrace detach; consistency checks relax.
    UnstableExit,
    Signal,
    SignalDelivery,
    SignalHandler,
    Syscall,
}

const EVENT_KIND_MAX: u8 = EventKind::Syscall as u8;
static_assertions::const_assert!((EVENT_KIND_MAX as u32) < (1 << 5));

impl TryFrom<u8> for EventKind {
    type Error = ();

    fn try_from(v: u8) -> Result<EventKind, ()> {
        if v > EVENT_KIND_MAX {
            return Err(());
        }
        // Discriminants are dense from 0.
        Ok(unsafe { std::mem::transmute(v) })
    }
}

/// Syscall events track a syscall through entry and exit. Interrupted
/// syscalls are also modelled here: descheduled buffered syscalls push an
/// interruption during recording, all others are detected at exit and
/// transformed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    NoSyscall,
    EnteringSyscall,
    ProcessingSyscall,
    ExitingSyscall,
}

#[derive(Copy, Clone, Debug)]
pub struct SyscallEventData {
    pub arch: SupportedArch,
    pub number: i32,
    pub state: SyscallState,
}

impl SyscallEventData {
    pub fn new(number: i32, arch: SupportedArch) -> SyscallEventData {
        SyscallEventData {
            arch,
            number,
            state: SyscallState::NoSyscall,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum SignalDeterministic {
    NondeterministicSig = 0,
    /// Raised as the side effect of retiring a specific instruction; replay
    /// reproduces it by running to that instruction, not by injection.
    DeterministicSig = 1,
}

#[derive(Copy, Clone)]
pub struct SignalEventData {
    pub siginfo: libc::siginfo_t,
    pub deterministic: SignalDeterministic,
}

impl SignalEventData {
    pub fn new(siginfo: libc::siginfo_t, deterministic: SignalDeterministic) -> SignalEventData {
        SignalEventData {
            siginfo,
            deterministic,
        }
    }

    pub fn maybe_sig(&self) -> Option<Sig> {
        Sig::try_from(self.siginfo.si_signo).ok()
    }

    pub fn signo(&self) -> i32 {
        self.siginfo.si_signo
    }
}

impl fmt::Debug for SignalEventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:?})",
            signal_name(self.siginfo.si_signo),
            self.deterministic
        )
    }
}

/// A desched notification fired during a may-block buffered syscall, which
/// the engine reads as "the syscall blocked". `rec` is only valid while the
/// desched is in flight: the record is allocated but not yet committed.
#[derive(Copy, Clone, Debug)]
pub struct DeschedEventData {
    pub rec: RemotePtr<syscallbuf_record>,
}

/// What happened on a task between two tick observations. Also the tag
/// stored per trace frame to drive replay.
#[derive(Clone, Debug)]
pub enum Event {
    Unassigned,
    Sentinel,
    Noop,
    TraceTermination,
    Exit,
    ExitSighandler,
    InterruptedSyscallNotRestarted,
    Sched,
    InstructionTrap,
    SyscallbufFlush,
    SyscallbufAbortCommit,
    SyscallbufReset,
    PatchSyscall,
    GrowMap,
    UnstableExit,
    Desched(DeschedEventData),
    Signal(SignalEventData),
    SignalDelivery(SignalEventData),
    SignalHandler(SignalEventData),
    Syscall(SyscallEventData),
    SyscallInterruption(SyscallEventData),
}

impl Default for Event {
    fn default() -> Self {
        Event::Unassigned
    }
}

/// Deterministic signals are encoded as (signum | DET_SIGNAL_BIT) in the
/// 24-bit payload.
const DET_SIGNAL_BIT: i32 = 0x80;

/// The 32-bit on-disk form: 5-bit kind, 1-bit syscall-entry, 1-bit
/// exec-info, 1-bit arch, 24-bit payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EncodedEvent {
    pub kind: EventKind,
    pub is_syscall_entry: bool,
    pub has_exec_info: bool,
    pub arch: SupportedArch,
    pub data: i32,
}

impl EncodedEvent {
    pub fn to_u32(self) -> u32 {
        debug_assert!(self.data >= 0 && self.data < (1 << 24));
        (self.kind as u32)
            | (u32::from(self.is_syscall_entry) << 5)
            | (u32::from(self.has_exec_info) << 6)
            | ((self.arch as u32) << 7)
            | ((self.data as u32) << 8)
    }

    pub fn from_u32(raw: u32) -> Option<EncodedEvent> {
        let kind = EventKind::try_from((raw & 0x1f) as u8).ok()?;
        let arch = if (raw >> 7) & 1 == 0 {
            SupportedArch::X86
        } else {
            SupportedArch::X64
        };
        Some(EncodedEvent {
            kind,
            is_syscall_entry: (raw >> 5) & 1 != 0,
            has_exec_info: (raw >> 6) & 1 != 0,
            arch,
            data: (raw >> 8) as i32,
        })
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Unassigned => EventKind::Unassigned,
            Event::Sentinel => EventKind::Sentinel,
            Event::Noop => EventKind::Noop,
            Event::TraceTermination => EventKind::TraceTermination,
            Event::Exit => EventKind::Exit,
            Event::ExitSighandler => EventKind::ExitSighandler,
            Event::InterruptedSyscallNotRestarted => EventKind::InterruptedSyscallNotRestarted,
            Event::Sched => EventKind::Sched,
            Event::InstructionTrap => EventKind::InstructionTrap,
            Event::SyscallbufFlush => EventKind::SyscallbufFlush,
            Event::SyscallbufAbortCommit => EventKind::SyscallbufAbortCommit,
            Event::SyscallbufReset => EventKind::SyscallbufReset,
            Event::PatchSyscall => EventKind::PatchSyscall,
            Event::GrowMap => EventKind::GrowMap,
            Event::UnstableExit => EventKind::UnstableExit,
            Event::Desched(_) => EventKind::Desched,
            Event::Signal(_) => EventKind::Signal,
            Event::SignalDelivery(_) => EventKind::SignalDelivery,
            Event::SignalHandler(_) => EventKind::SignalHandler,
            Event::Syscall(_) => EventKind::Syscall,
            Event::SyscallInterruption(_) => EventKind::SyscallInterruption,
        }
    }

    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall(_) | Event::SyscallInterruption(_))
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(
            self,
            Event::Signal(_) | Event::SignalDelivery(_) | Event::SignalHandler(_)
        )
    }

    pub fn syscall(&self) -> &SyscallEventData {
        match self {
            Event::Syscall(s) | Event::SyscallInterruption(s) => s,
            _ => panic!("not a syscall event: {:?}", self),
        }
    }

    pub fn syscall_mut(&mut self) -> &mut SyscallEventData {
        match self {
            Event::Syscall(s) | Event::SyscallInterruption(s) => s,
            _ => panic!("not a syscall event"),
        }
    }

    pub fn signal(&self) -> &SignalEventData {
        match self {
            Event::Signal(s) | Event::SignalDelivery(s) | Event::SignalHandler(s) => s,
            _ => panic!("not a signal event: {:?}", self),
        }
    }

    pub fn desched(&self) -> &DeschedEventData {
        match self {
            Event::Desched(d) => d,
            _ => panic!("not a desched event: {:?}", self),
        }
    }

    /// Whether frames for this event carry registers and tick counts.
    pub fn record_regs(&self) -> bool {
        !matches!(
            self,
            Event::Unassigned
                | Event::Sentinel
                | Event::Noop
                | Event::TraceTermination
                | Event::SyscallbufFlush
                | Event::SyscallbufAbortCommit
                | Event::SyscallbufReset
        )
    }

    /// Events that may be stored in a trace.
    pub fn is_trace_event(&self) -> bool {
        !matches!(
            self,
            Event::Unassigned
                | Event::Sentinel
                | Event::Noop
                | Event::Desched(_)
                | Event::SyscallInterruption(_)
                | Event::TraceTermination
        )
    }

    /// Restricted variant transitions: the recorder turns an in-flight event
    /// into its successor in place, and only these pairs are legal.
    pub fn transform(&mut self, new_kind: EventKind) {
        let old = std::mem::replace(self, Event::Unassigned);
        *self = match (old, new_kind) {
            (Event::Signal(d), EventKind::SignalDelivery) => Event::SignalDelivery(d),
            (Event::SignalDelivery(d), EventKind::SignalHandler) => Event::SignalHandler(d),
            (Event::Syscall(s), EventKind::SyscallInterruption) => Event::SyscallInterruption(s),
            (Event::SyscallInterruption(s), EventKind::Syscall) => Event::Syscall(s),
            (old, _) => {
                fatal!("Bad event transformation: {:?} -> {:?}", old.kind(), new_kind);
            }
        };
    }

    pub fn encode(&self) -> EncodedEvent {
        let kind = self.kind();
        match self {
            Event::Syscall(s) | Event::SyscallInterruption(s) => EncodedEvent {
                kind,
                is_syscall_entry: s.state == SyscallState::EnteringSyscall,
                has_exec_info: self.record_regs(),
                arch: s.arch,
                data: s.number,
            },
            Event::Signal(s) | Event::SignalDelivery(s) | Event::SignalHandler(s) => {
                let det = if s.deterministic == SignalDeterministic::DeterministicSig {
                    DET_SIGNAL_BIT
                } else {
                    0
                };
                EncodedEvent {
                    kind,
                    is_syscall_entry: false,
                    has_exec_info: self.record_regs(),
                    arch: crate::kernel_abi::NATIVE_ARCH,
                    data: s.siginfo.si_signo | det,
                }
            }
            _ => EncodedEvent {
                kind,
                is_syscall_entry: false,
                has_exec_info: self.record_regs(),
                arch: crate::kernel_abi::NATIVE_ARCH,
                data: 0,
            },
        }
    }

    /// Reconstruct the event from its encoded form. Signal payloads carry
    /// only the signo here; the full siginfo is stored separately in the
    /// frame and patched in by the reader.
    pub fn decode(enc: EncodedEvent) -> Event {
        match enc.kind {
            EventKind::Unassigned => Event::Unassigned,
            EventKind::Sentinel => Event::Sentinel,
            EventKind::Noop => Event::Noop,
            EventKind::TraceTermination => Event::TraceTermination,
            EventKind::Exit => Event::Exit,
            EventKind::ExitSighandler => Event::ExitSighandler,
            EventKind::InterruptedSyscallNotRestarted => Event::InterruptedSyscallNotRestarted,
            EventKind::Sched => Event::Sched,
            EventKind::InstructionTrap => Event::InstructionTrap,
            EventKind::SyscallbufFlush => Event::SyscallbufFlush,
            EventKind::SyscallbufAbortCommit => Event::SyscallbufAbortCommit,
            EventKind::SyscallbufReset => Event::SyscallbufReset,
            EventKind::PatchSyscall => Event::PatchSyscall,
            EventKind::GrowMap => Event::GrowMap,
            EventKind::UnstableExit => Event::UnstableExit,
            EventKind::Desched => Event::Desched(DeschedEventData {
                rec: RemotePtr::null(),
            }),
            EventKind::Signal | EventKind::SignalDelivery | EventKind::SignalHandler => {
                let deterministic = if enc.data & DET_SIGNAL_BIT != 0 {
                    SignalDeterministic::DeterministicSig
                } else {
                    SignalDeterministic::NondeterministicSig
                };
                let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
                siginfo.si_signo = enc.data & !DET_SIGNAL_BIT;
                let data = SignalEventData::new(siginfo, deterministic);
                match enc.kind {
                    EventKind::Signal => Event::Signal(data),
                    EventKind::SignalDelivery => Event::SignalDelivery(data),
                    _ => Event::SignalHandler(data),
                }
            }
            EventKind::Syscall | EventKind::SyscallInterruption => {
                let mut data = SyscallEventData::new(enc.data, enc.arch);
                data.state = if enc.is_syscall_entry {
                    SyscallState::EnteringSyscall
                } else {
                    SyscallState::ExitingSyscall
                };
                if enc.kind == EventKind::Syscall {
                    Event::Syscall(data)
                } else {
                    Event::SyscallInterruption(data)
                }
            }
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Syscall(s) => write!(
                f,
                "SYSCALL: {} ({:?})",
                syscall_name(s.number, s.arch),
                s.state
            ),
            Event::SyscallInterruption(s) => write!(
                f,
                "INTERRUPTED-SYSCALL: {}",
                syscall_name(s.number, s.arch)
            ),
            Event::Signal(s) => write!(f, "SIGNAL: {}", signal_name(s.signo())),
            Event::SignalDelivery(s) => write!(f, "SIGNAL-DELIVERY: {}", signal_name(s.signo())),
            Event::SignalHandler(s) => write!(f, "SIGNAL-HANDLER: {}", signal_name(s.signo())),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_syscall() {
        let mut data = SyscallEventData::new(9, SupportedArch::X64);
        data.state = SyscallState::EnteringSyscall;
        let ev = Event::Syscall(data);
        let enc = ev.encode();
        assert_eq!(enc.kind, EventKind::Syscall);
        assert!(enc.is_syscall_entry);
        let raw = enc.to_u32();
        let dec = Event::decode(EncodedEvent::from_u32(raw).unwrap());
        let s = dec.syscall();
        assert_eq!(s.number, 9);
        assert_eq!(s.arch, SupportedArch::X64);
        assert_eq!(s.state, SyscallState::EnteringSyscall);
    }

    #[test]
    fn encode_decode_deterministic_signal() {
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        si.si_signo = libc::SIGSEGV;
        let ev = Event::Signal(SignalEventData::new(
            si,
            SignalDeterministic::DeterministicSig,
        ));
        let raw = ev.encode().to_u32();
        let dec = Event::decode(EncodedEvent::from_u32(raw).unwrap());
        let s = dec.signal();
        assert_eq!(s.signo(), libc::SIGSEGV);
        assert_eq!(s.deterministic, SignalDeterministic::DeterministicSig);
    }

    #[test]
    fn encode_round_trips_all_plain_kinds() {
        for ev in [
            Event::Exit,
            Event::ExitSighandler,
            Event::InterruptedSyscallNotRestarted,
            Event::Sched,
            Event::InstructionTrap,
            Event::SyscallbufFlush,
            Event::SyscallbufAbortCommit,
            Event::SyscallbufReset,
            Event::PatchSyscall,
            Event::GrowMap,
            Event::UnstableExit,
        ]
        .iter()
        {
            let raw = ev.encode().to_u32();
            let dec = Event::decode(EncodedEvent::from_u32(raw).unwrap());
            assert_eq!(dec.kind(), ev.kind());
        }
    }

    #[test]
    fn rejects_out_of_range_kind() {
        assert!(EncodedEvent::from_u32(0x1f).is_none());
    }

    #[test]
    fn transform_legal_pairs_only() {
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        si.si_signo = libc::SIGUSR1;
        let mut ev = Event::Signal(SignalEventData::new(
            si,
            SignalDeterministic::NondeterministicSig,
        ));
        ev.transform(EventKind::SignalDelivery);
        assert_eq!(ev.kind(), EventKind::SignalDelivery);
        ev.transform(EventKind::SignalHandler);
        assert_eq!(ev.kind(), EventKind::SignalHandler);

        let mut sys = Event::Syscall(SyscallEventData::new(0, SupportedArch::X64));
        sys.transform(EventKind::SyscallInterruption);
        sys.transform(EventKind::Syscall);
        assert_eq!(sys.kind(), EventKind::Syscall);
    }
}
