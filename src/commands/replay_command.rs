use crate::commands::exit_result::ExitResult;
use crate::commands::options::ReplayOptions;
use crate::gdb_server::{GdbServer, GdbServerFlags};
use crate::session::replay::ReplaySession;
use crate::trace::reader::TraceReader;
use crate::trace::task_event::TraceTaskEvent;
use crate::util::running_under_retrace;
use std::ffi::OsStr;

pub fn replay(options: &ReplayOptions) -> ExitResult {
    if running_under_retrace() {
        return ExitResult::ConfigError(
            "Cannot replay while running under the engine itself.".to_owned(),
        );
    }

    // Resolve --onprocess/--onfork against the trace's task events before
    // spending any time replaying.
    if let Some(spec) = &options.onprocess {
        if !trace_has_process(options.trace_dir.as_deref(), spec) {
            return ExitResult::NoSuchProcess(format!(
                "No process `{}' found in the trace.",
                spec
            ));
        }
    }
    if let Some(pid) = options.onfork {
        if !trace_has_tid(options.trace_dir.as_deref(), pid) {
            return ExitResult::NoSuchProcess(format!(
                "No fork child with pid {} found in the trace.",
                pid
            ));
        }
    }

    let session = ReplaySession::create(options.trace_dir.as_deref());
    let server = GdbServer::new(session);
    let flags = GdbServerFlags {
        dbg_port: options.dbg_port,
        goto_event: options.goto_event,
        autopilot: options.autopilot,
        debugger_binary: options.debugger_binary.clone(),
        command_file: options.command_file.clone(),
    };
    let code = server.serve(&flags);
    if code == 0 {
        ExitResult::Ok
    } else {
        ExitResult::Code(code)
    }
}

/// Does the trace contain a process matching `spec` (a pid or a command
/// basename)?
fn trace_has_process(trace_dir: Option<&OsStr>, spec: &str) -> bool {
    let mut reader = TraceReader::new(trace_dir);
    let wanted_pid = spec.parse::<libc::pid_t>().ok();
    loop {
        let te = match reader.read_task_event() {
            Some(te) => te,
            None => return false,
        };
        match &te.event {
            TraceTaskEvent::Exec {
                tid, file_name, ..
            } => {
                if wanted_pid == Some(*tid) {
                    return true;
                }
                let base = std::path::Path::new(file_name)
                    .file_name()
                    .map(|b| b.to_string_lossy().into_owned());
                if base.as_deref() == Some(spec) {
                    return true;
                }
            }
            TraceTaskEvent::Clone { tid, .. } => {
                if wanted_pid == Some(*tid) {
                    return true;
                }
            }
            TraceTaskEvent::Exit { .. } => {}
        }
    }
}

fn trace_has_tid(trace_dir: Option<&OsStr>, tid: libc::pid_t) -> bool {
    let mut reader = TraceReader::new(trace_dir);
    while let Some(te) = reader.read_task_event() {
        if te.event.tid() == tid {
            return true;
        }
    }
    false
}
