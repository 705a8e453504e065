#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;

#[macro_use]
mod log;

mod address_space;
mod commands;
mod emu_fs;
mod event;
mod extra_registers;
mod fast_forward;
mod flags;
mod gdb_connection;
mod gdb_expression;
mod gdb_register;
mod gdb_server;
mod kernel_abi;
mod kernel_metadata;
mod kernel_supplement;
mod patcher;
mod perf_counters;
mod perf_event;
mod preload_interface;
mod registers;
mod remote_code_ptr;
mod remote_ptr;
mod remote_syscalls;
mod scheduler;
mod scoped_fd;
mod session;
mod sig;
mod syscallbuf;
mod task;
mod ticks;
mod timeline;
mod trace;
mod uid;
mod util;
mod wait_status;

use commands::options::{RetraceOptions, RetraceSubcommand};
use flags::Flags;
use structopt::StructOpt;

fn main() {
    let options = RetraceOptions::from_args();

    Flags::set(Flags {
        check_cached_maps: options.check_cached_maps,
        suppress_environment_warnings: options.suppress_environment_warnings,
        fatal_errors_and_warnings: options.fatal_errors,
        mark_stdio: options.mark_stdio,
        resource_path: options.resource_path.clone(),
    });

    let result = match &options.cmd {
        RetraceSubcommand::Record(opts) => commands::record_command::record(opts),
        RetraceSubcommand::Replay(opts) => commands::replay_command::replay(opts),
        RetraceSubcommand::Dump(opts) => commands::dump_command::dump(opts),
    };
    result.report();
    std::process::exit(result.exit_code());
}
