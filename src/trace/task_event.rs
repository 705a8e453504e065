use crate::trace::frame::FrameTime;
use libc::pid_t;
use std::ffi::OsString;

/// Task lifetime events, stored in the `tasks` substream. These let replay
/// know the shape of the task tree before it reaches the frames that created
/// it, and let tools enumerate processes cheaply.
#[derive(Clone, Debug)]
pub enum TraceTaskEvent {
    Clone {
        tid: pid_t,
        parent_tid: pid_t,
        /// The raw clone(2) flags; replay re-creates the same sharing.
        clone_flags: u64,
    },
    Exec {
        tid: pid_t,
        file_name: OsString,
        cmd_line: Vec<OsString>,
    },
    Exit {
        tid: pid_t,
        exit_status: i32,
    },
}

impl TraceTaskEvent {
    pub fn tid(&self) -> pid_t {
        match *self {
            TraceTaskEvent::Clone { tid, .. }
            | TraceTaskEvent::Exec { tid, .. }
            | TraceTaskEvent::Exit { tid, .. } => tid,
        }
    }
}

/// A task event joined with the frame time it was recorded at.
#[derive(Clone, Debug)]
pub struct TimedTaskEvent {
    pub time: FrameTime,
    pub event: TraceTaskEvent,
}
