use crate::commands::exit_result::ExitResult;
use crate::commands::options::RecordOptions;
use crate::session::record::{RecordSession, RecordStatus};
use crate::util::running_under_retrace;
use std::env;
use std::ffi::OsString;

pub fn record(options: &RecordOptions) -> ExitResult {
    if running_under_retrace() {
        return ExitResult::ConfigError(
            "Recording inside a recording is not supported.".to_owned(),
        );
    }
    if options.args.is_empty() {
        return ExitResult::ConfigError("Nothing to record.".to_owned());
    }

    let cwd = env::current_dir()
        .map(|p| p.into_os_string())
        .unwrap_or_else(|_| OsString::from("/"));
    let envp: Vec<OsString> = env::vars_os()
        .map(|(k, v)| {
            let mut e = k;
            e.push("=");
            e.push(v);
            e
        })
        .collect();

    let mut session = RecordSession::create(
        &options.args,
        &envp,
        &cwd,
        options.bind_to_cpu,
        options.chaos,
    );
    session
        .scheduler
        .set_pretend_num_cores(options.num_cores);

    let exit_code = loop {
        match session.record_step() {
            RecordStatus::StepContinue => continue,
            RecordStatus::StepExited(code) => break code,
        }
    };
    session.finish();
    eprintln!(
        "retrace: saved recording to `{}'.",
        std::path::Path::new(session.trace_dir()).display()
    );
    if exit_code == 0 {
        ExitResult::Ok
    } else {
        ExitResult::Code(exit_code)
    }
}
