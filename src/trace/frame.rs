use crate::event::Event;
use crate::extra_registers::ExtraRegisters;
use crate::registers::Registers;
use crate::ticks::Ticks;
use libc::pid_t;
use std::io::{self, Write};

/// The monotonic sequence number of trace frames; "event time" in user
/// facing output.
pub type FrameTime = u64;

/// One recorded event: what happened, to which task, at which tick count.
/// Frames are monotonic in time per trace and in ticks per task.
#[derive(Clone)]
pub struct TraceFrame {
    pub(super) global_time: FrameTime,
    pub(super) tid: pid_t,
    pub(super) ev: Event,
    pub(super) ticks: Ticks,
    pub(super) monotonic_time: f64,
    pub(super) recorded_regs: Registers,
    /// Usually absent; variable length, stored out of line from the fixed
    /// part of the frame.
    pub(super) recorded_extra_regs: ExtraRegisters,
}

impl TraceFrame {
    pub fn new_with(
        global_time: FrameTime,
        tid: pid_t,
        event: Event,
        tick_count: Ticks,
        monotonic_time: f64,
    ) -> TraceFrame {
        TraceFrame {
            global_time,
            tid,
            ev: event,
            ticks: tick_count,
            monotonic_time,
            recorded_regs: Registers::default(),
            recorded_extra_regs: ExtraRegisters::default(),
        }
    }

    pub fn new() -> TraceFrame {
        TraceFrame::new_with(0, 0, Event::default(), 0, 0.0)
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }
    pub fn tid(&self) -> pid_t {
        self.tid
    }
    pub fn event(&self) -> &Event {
        &self.ev
    }
    pub fn ticks(&self) -> Ticks {
        self.ticks
    }
    pub fn monotonic_time(&self) -> f64 {
        self.monotonic_time
    }
    pub fn regs_ref(&self) -> &Registers {
        &self.recorded_regs
    }
    pub fn extra_regs_ref(&self) -> &ExtraRegisters {
        &self.recorded_extra_regs
    }

    pub fn set_regs(&mut self, regs: Registers) {
        self.recorded_regs = regs;
    }

    pub fn set_extra_regs(&mut self, regs: ExtraRegisters) {
        self.recorded_extra_regs = regs;
    }

    /// Log a human-readable representation, including a newline.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{{\n  real_time:{:.6} global_time:{}, event:`{}' ",
            self.monotonic_time(),
            self.time(),
            self.event()
        )?;
        writeln!(out, "tid:{}, ticks:{}", self.tid(), self.ticks())?;
        if !self.event().record_regs() {
            return writeln!(out, "}}");
        }
        write!(out, "  ")?;
        self.regs_ref().write_register_file_compact(out)?;
        writeln!(out, "\n}}")
    }

    /// A machine-parseable single line.
    pub fn dump_raw(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            " {} {} {} {}",
            self.time(),
            self.tid(),
            self.event().encode().to_u32(),
            self.ticks()
        )
    }
}

impl Default for TraceFrame {
    fn default() -> Self {
        TraceFrame::new()
    }
}
