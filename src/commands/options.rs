use std::ffi::OsString;
use std::path::PathBuf;
use structopt::clap::AppSettings;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "retrace",
    about = "Deterministic record-and-replay for x86/x86-64 Linux programs.",
    global_settings = &[AppSettings::UnifiedHelpMessage, AppSettings::VersionlessSubcommands]
)]
pub struct RetraceOptions {
    /// Check that the cached memory map matches /proc/<tid>/maps at every
    /// event. Slow.
    #[structopt(long = "check-cached-maps")]
    pub check_cached_maps: bool,

    /// Suppress warnings about the environment (missing kernel features,
    /// changed backing files).
    #[structopt(long = "suppress-environment-warnings")]
    pub suppress_environment_warnings: bool,

    /// Treat all warnings as fatal.
    #[structopt(long = "fatal-errors")]
    pub fatal_errors: bool,

    /// Mark trace event times on tracee stdio output.
    #[structopt(long = "mark-stdio")]
    pub mark_stdio: bool,

    /// Location of the preload library and other resources.
    #[structopt(long = "resource-path", parse(from_os_str))]
    pub resource_path: Option<PathBuf>,

    #[structopt(subcommand)]
    pub cmd: RetraceSubcommand,
}

#[derive(StructOpt, Debug)]
pub enum RetraceSubcommand {
    /// Record the execution of a command into a trace directory.
    #[structopt(name = "record")]
    Record(RecordOptions),
    /// Replay a recorded trace, optionally under an interactive debugger.
    #[structopt(name = "replay")]
    Replay(ReplayOptions),
    /// Dump the frames of a recorded trace in human-readable form.
    #[structopt(name = "dump")]
    Dump(DumpOptions),
}

#[derive(StructOpt, Debug)]
pub struct RecordOptions {
    /// Randomise scheduling decisions to shake out races.
    #[structopt(short = "h", long = "chaos")]
    pub chaos: bool,

    /// Bind tracees to this CPU (-1 for unbound).
    #[structopt(long = "bind-to-cpu", default_value = "-1")]
    pub bind_to_cpu: i32,

    /// Pretend this many cores to the tracees.
    #[structopt(long = "num-cores", default_value = "1")]
    pub num_cores: u32,

    /// The command to record.
    #[structopt(parse(from_os_str), required = true)]
    pub args: Vec<OsString>,
}

#[derive(StructOpt, Debug)]
pub struct ReplayOptions {
    /// Replay to completion with no debugger attached.
    #[structopt(short = "a", long = "autopilot")]
    pub autopilot: bool,

    /// Pause at this event number before accepting a debugger connection.
    #[structopt(short = "g", long = "goto", default_value = "0")]
    pub goto_event: u64,

    /// Wait for a debugger on the fork child with this pid.
    #[structopt(long = "onfork")]
    pub onfork: Option<libc::pid_t>,

    /// Wait for a debugger on the process with this pid, or the first exec
    /// of this command name.
    #[structopt(short = "p", long = "onprocess")]
    pub onprocess: Option<String>,

    /// Debugger client binary to launch against the server.
    #[structopt(short = "d", long = "debugger", parse(from_os_str))]
    pub debugger_binary: Option<PathBuf>,

    /// Extra command file sourced by the launched debugger client.
    #[structopt(short = "x", long = "command-file", parse(from_os_str))]
    pub command_file: Option<PathBuf>,

    /// Don't replay writes to stdout/stderr.
    #[structopt(long = "no-redirect-output")]
    pub no_redirect_output: bool,

    /// Listen for the debugger on this port instead of probing.
    #[structopt(short = "s", long = "dbgport")]
    pub dbg_port: Option<u16>,

    /// Start emitting (dump-style) trace information at this event.
    #[structopt(long = "trace-from-event", default_value = "0")]
    pub trace_from_event: u64,

    /// Trace directory; defaults to the latest trace.
    #[structopt(parse(from_os_str))]
    pub trace_dir: Option<OsString>,
}

#[derive(StructOpt, Debug)]
pub struct DumpOptions {
    /// Dump in a raw machine-parseable format.
    #[structopt(short = "r", long = "raw")]
    pub raw: bool,

    /// First event to dump.
    #[structopt(long = "from", default_value = "0")]
    pub from_event: u64,

    /// Last event to dump (0 = end of trace).
    #[structopt(long = "to", default_value = "0")]
    pub to_event: u64,

    /// Trace directory; defaults to the latest trace.
    #[structopt(parse(from_os_str))]
    pub trace_dir: Option<OsString>,
}
