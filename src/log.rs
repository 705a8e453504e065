use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    module_cache: HashMap<String, LogModule>,
    /// Possibly buffered.
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = match env::var_os("RETRACE_LOG_FILE") {
            Some(filename) => Box::new(File::create(&filename).unwrap()),
            None => match env::var_os("RETRACE_APPEND_LOG_FILE") {
                Some(filename) => Box::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .unwrap(),
                ),
                None => Box::new(io::stderr()),
            },
        };
        if let Ok(buf_size) = env::var("RETRACE_LOG_BUFFER") {
            let n = buf_size.parse::<usize>().unwrap_or(0);
            if n > 0 {
                f = Box::new(BufWriter::with_capacity(n, f));
            }
        }

        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        let mut default_level = LogWarn;
        // RETRACE_LOG=all:warn,scheduler:debug,timeline:info
        if let Ok(spec) = env::var("RETRACE_LOG") {
            for clause in spec.split(',') {
                let mut it = clause.splitn(2, ':');
                let name = it.next().unwrap_or("").trim();
                let level = parse_level(it.next().unwrap_or("debug").trim());
                if name == "all" || name.is_empty() {
                    default_level = level;
                } else {
                    level_map.insert(name.to_owned(), level);
                }
            }
        }

        Mutex::new(LogGlobals {
            level_map,
            module_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn parse_level(s: &str) -> LogLevel {
    match s {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        _ => LogDebug,
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Module names are file stems; filenames are case sensitive on Linux so no
/// case folding happens anywhere here.
fn filename_to_module_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(m) = l.module_cache.get(filename) {
        return m.clone();
    }
    let name = filename_to_module_name(filename);
    let level = l
        .level_map
        .get(&name)
        .copied()
        .unwrap_or(l.default_level);
    let m = LogModule { name, level };
    l.module_cache.insert(filename.to_owned(), m.clone());
    m
}

/// A log line under construction. Appends a newline and flushes on drop so a
/// panic mid-line still leaves the file terminated.
pub struct LogLine {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl LogLine {
    fn new(level: LogLevel, filename: &str, line: u32, always_enabled: bool) -> LogLine {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = LogLine {
            enabled,
            message: Vec::new(),
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line);
            }
        }
        this
    }
}

impl Drop for LogLine {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for LogLine {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Pretend disabled bytes were written so write! never sees WriteZero.
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, "errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(level: LogLevel, filename: &str, line: u32, always_enabled: bool) -> LogLine {
    LogLine::new(level, filename, line, always_enabled)
}

/// Dump the stack and abort. Divergence failures come through here so the
/// trace coordinates in the preceding log line are the last thing printed.
pub fn notifying_abort(bt: Backtrace) {
    let mut err = io::stderr();
    write!(err, "=== Start retrace backtrace:\n{:?}=== End retrace backtrace\n", bt).unwrap();
    std::process::abort();
}

/// Log at `level` to the log file (stderr by default), subject to the
/// per-module filter in RETRACE_LOG.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log($log_level, file!(), line!(), false);
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log unconditionally, print a backtrace, abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(LogFatal, file!(), line!(), true);
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
            unreachable!()
        }
    };
}

/// Fatal error in a human-caused configuration: print to stderr without a
/// backtrace and exit with the configuration-error code.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::Write;
            use crate::log::LogFatal;
            let stderr_ = &mut std::io::stderr();
            crate::log::write_prefix(stderr_, LogFatal, file!(), line!());
            write!(stderr_, $($args)+).unwrap();
            write!(stderr_, "\n").unwrap();
            std::process::exit(1)
        }
    };
}

/// Assert a condition about tracee state. Failure is a divergence: the
/// message is tagged with the task's tid and tick count before aborting.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        ed_assert!($task, $cond, "(no details)")
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(LogFatal, file!(), line!(), true);
                    write!(
                        stream,
                        "Assertion `{}' failed for tid {} at ticks {}: ",
                        stringify!($cond),
                        $task.tid,
                        $task.tick_count()
                    )
                    .unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
}
