use std::path::PathBuf;
use std::sync::Mutex;

/// Global flags resolved once from the command line. Command modules fill
/// this in before any session is created; everything else reads it through
/// `Flags::get()`.
#[derive(Clone, Default)]
pub struct Flags {
    /// Check that the cached address-space map matches /proc/<tid>/maps at
    /// every event boundary. Slow; invaluable.
    pub check_cached_maps: bool,
    /// Suppress warnings about environmental conditions outside the
    /// engine's control.
    pub suppress_environment_warnings: bool,
    /// Treat any warning as fatal.
    pub fatal_errors_and_warnings: bool,
    /// Mark trace event times on tracee stdio output.
    pub mark_stdio: bool,
    /// User override for the resource directory (preload library location).
    pub resource_path: Option<PathBuf>,
}

lazy_static! {
    static ref FLAGS: Mutex<Flags> = Mutex::new(Flags::default());
}

impl Flags {
    pub fn get() -> Flags {
        FLAGS.lock().unwrap().clone()
    }

    pub fn set(flags: Flags) {
        *FLAGS.lock().unwrap() = flags;
    }
}
