use crate::perf_event::*;
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use crate::util::read_to_fill;
use libc::{c_int, c_ulong, pid_t, F_SETFL, O_ASYNC};
use std::mem::size_of;

// Not exposed by the `libc` crate for this target; values are fixed by the
// Linux ABI (see bits/fcntl-linux.h) and identical across architectures.
const F_SETSIG: c_int = 10;
const F_SETOWN_EX: c_int = 15;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
struct f_owner_ex {
    type_: c_int,
    pid: pid_t,
}

/// Delivered to the tracer (via fcntl ownership of the counter fd) when the
/// tracee's tick counter passes its programmed period. Linux itself doesn't
/// use SIGSTKFLT, so tracees are unlikely to.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

/// How far before a tick target the counter interrupt is programmed. The
/// PMU interrupt can skid past the requested period; landing early and
/// single-stepping the rest is the only safe approach.
pub const SKID_SIZE: Ticks = 1000;

/// The counter config for retired conditional branches. The full
/// microarchitecture table lives outside the engine; one canonical raw
/// attribute stands in for it (EventSel 0xC4, umask 0x01, cmask/inv per the
/// family convention).
const RCB_RAW_CONFIG: u64 = 0x51_01c4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksSemantics {
    RetiredConditionalBranches,
}

fn ticks_attr(semantics: TicksSemantics) -> perf_event_attr {
    let TicksSemantics::RetiredConditionalBranches = semantics;
    let mut attr = perf_event_attr::default();
    attr.size = PERF_EVENT_ATTR_SIZE_VER5;
    attr.type_ = PERF_TYPE_RAW;
    attr.config = RCB_RAW_CONFIG;
    attr.flags = PERF_ATTR_FLAG_DISABLED
        | PERF_ATTR_FLAG_EXCLUDE_KERNEL
        | PERF_ATTR_FLAG_EXCLUDE_HV
        | PERF_ATTR_FLAG_PINNED;
    attr
}

/// The attribute for the tracee-armed desched counter: one software
/// context-switch-out event fires the desched signal.
pub fn desched_attr() -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.size = PERF_EVENT_ATTR_SIZE_VER5;
    attr.type_ = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CONTEXT_SWITCHES;
    attr.flags = PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_EXCLUDE_KERNEL | PERF_ATTR_FLAG_EXCLUDE_HV;
    attr.sample_period = 1;
    attr.wakeup_events = 1;
    attr
}

fn start_counter(tid: pid_t, attr: &perf_event_attr) -> ScopedFd {
    let fd = perf_event_open(attr, tid, -1, -1, 0);
    if fd < 0 {
        fatal!(
            "Failed to initialize counter for tid {}: errno {}",
            tid,
            nix::errno::errno()
        );
    }
    ScopedFd::from_raw(fd)
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut val: u64 = 0;
    let nread = read_to_fill(fd.as_raw(), crate::util::u8_slice_mut(&mut val));
    debug_assert_eq!(nread, size_of::<u64>());
    val
}

fn ioctl_counter(fd: &ScopedFd, request: c_ulong, arg: c_ulong) {
    let ret = unsafe { libc::ioctl(fd.as_raw(), request, arg) };
    if ret != 0 {
        fatal!("ioctl({:#x}) on counter failed", request);
    }
}

/// The per-task tick counter. One instance per Task; counting starts on
/// `reset` and the accumulated value is folded into the task's tick count on
/// `read_ticks`/`stop`.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks: ScopedFd,
    semantics: TicksSemantics,
    started: bool,
    counting_period: Ticks,
}

impl PerfCounters {
    pub fn new(tid: pid_t, semantics: TicksSemantics) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks: ScopedFd::new(),
            semantics,
            started: false,
            counting_period: 0,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        // A new tid means the old counter (if any) refers to a dead task.
        self.stop();
        self.tid = tid;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn semantics(&self) -> TicksSemantics {
        self.semantics
    }

    /// (Re)start the tick counter. When `ticks_period` is nonzero, the
    /// counter is programmed to deliver TIME_SLICE_SIGNAL to the tracee's fd
    /// owner after that many ticks; the step engine relies on the signal
    /// landing no later than SKID_SIZE past the period.
    pub fn reset(&mut self, ticks_period: Ticks) {
        let period = if ticks_period == 0 {
            // Counting only; pick a period the counter can't reach so the
            // interrupt machinery stays cold.
            1u64 << 60
        } else {
            ticks_period
        };

        if !self.fd_ticks.is_open() {
            let mut attr = ticks_attr(self.semantics);
            attr.sample_period = period;
            self.fd_ticks = start_counter(self.tid, &attr);

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            unsafe {
                if libc::fcntl(self.fd_ticks.as_raw(), F_SETOWN_EX, &own) != 0 {
                    fatal!("Failed to SETOWN_EX counter fd for tid {}", self.tid);
                }
                if libc::fcntl(self.fd_ticks.as_raw(), F_SETFL, O_ASYNC) != 0
                    || libc::fcntl(self.fd_ticks.as_raw(), F_SETSIG, TIME_SLICE_SIGNAL) != 0
                {
                    fatal!("Failed to make counter fd ASYNC for tid {}", self.tid);
                }
            }
        } else {
            ioctl_counter(&self.fd_ticks, PERF_EVENT_IOC_RESET, 0);
            ioctl_counter(
                &self.fd_ticks,
                PERF_EVENT_IOC_PERIOD,
                &period as *const u64 as c_ulong,
            );
        }
        ioctl_counter(&self.fd_ticks, PERF_EVENT_IOC_ENABLE, 0);
        self.started = true;
        self.counting_period = period;
    }

    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        ioctl_counter(&self.fd_ticks, PERF_EVENT_IOC_DISABLE, 0);
        self.started = false;
    }

    /// Ticks accumulated since the last `reset`.
    pub fn read_ticks(&self) -> Ticks {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_ticks)
    }
}
