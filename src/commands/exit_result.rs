use std::fmt;

/// What a subcommand hands back to main. Exit codes: 0 on a clean finish,
/// 1 on a configuration error, 2 when a requested process does not exist in
/// the trace.
pub enum ExitResult {
    Ok,
    /// Clean finish propagating a specific code (e.g. the tracee's own
    /// exit status).
    Code(i32),
    ConfigError(String),
    NoSuchProcess(String),
}

impl ExitResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitResult::Ok => 0,
            ExitResult::Code(code) => *code,
            ExitResult::ConfigError(_) => 1,
            ExitResult::NoSuchProcess(_) => 2,
        }
    }

    pub fn report(&self) {
        match self {
            ExitResult::ConfigError(msg) | ExitResult::NoSuchProcess(msg) => {
                eprintln!("retrace: {}", msg);
            }
            _ => {}
        }
    }
}

impl fmt::Debug for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::Ok => write!(f, "Ok"),
            ExitResult::Code(c) => write!(f, "Code({})", c),
            ExitResult::ConfigError(m) => write!(f, "ConfigError({})", m),
            ExitResult::NoSuchProcess(m) => write!(f, "NoSuchProcess({})", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitResult::Ok.exit_code(), 0);
        assert_eq!(ExitResult::Code(77).exit_code(), 77);
        assert_eq!(ExitResult::ConfigError("x".into()).exit_code(), 1);
        assert_eq!(ExitResult::NoSuchProcess("y".into()).exit_code(), 2);
    }
}
