use crate::kernel_abi::SupportedArch;
use nix::errno::Errno;

/// Human-readable syscall name for diagnostics. The engine's behavior never
/// depends on these strings; unknown numbers format as `syscall(N)`.
pub fn syscall_name(syscallno: i32, arch: SupportedArch) -> String {
    let name = match arch {
        SupportedArch::X64 => x64_syscall_name(syscallno),
        SupportedArch::X86 => x86_syscall_name(syscallno),
    };
    match name {
        Some(n) => n.to_owned(),
        None => format!("syscall({})", syscallno),
    }
}

fn x64_syscall_name(no: i32) -> Option<&'static str> {
    Some(match no {
        0 => "read",
        1 => "write",
        2 => "open",
        3 => "close",
        4 => "stat",
        5 => "fstat",
        6 => "lstat",
        7 => "poll",
        8 => "lseek",
        9 => "mmap",
        10 => "mprotect",
        11 => "munmap",
        12 => "brk",
        13 => "rt_sigaction",
        14 => "rt_sigprocmask",
        15 => "rt_sigreturn",
        16 => "ioctl",
        17 => "pread64",
        18 => "pwrite64",
        19 => "readv",
        20 => "writev",
        21 => "access",
        22 => "pipe",
        23 => "select",
        24 => "sched_yield",
        25 => "mremap",
        28 => "madvise",
        29 => "shmget",
        30 => "shmat",
        31 => "shmctl",
        32 => "dup",
        33 => "dup2",
        35 => "nanosleep",
        39 => "getpid",
        41 => "socket",
        42 => "connect",
        43 => "accept",
        44 => "sendto",
        45 => "recvfrom",
        46 => "sendmsg",
        47 => "recvmsg",
        56 => "clone",
        57 => "fork",
        58 => "vfork",
        59 => "execve",
        60 => "exit",
        61 => "wait4",
        62 => "kill",
        67 => "shmdt",
        72 => "fcntl",
        78 => "getdents",
        79 => "getcwd",
        87 => "unlink",
        89 => "readlink",
        96 => "gettimeofday",
        102 => "getuid",
        131 => "sigaltstack",
        158 => "arch_prctl",
        186 => "gettid",
        200 => "tkill",
        201 => "time",
        202 => "futex",
        218 => "set_tid_address",
        228 => "clock_gettime",
        231 => "exit_group",
        234 => "tgkill",
        257 => "openat",
        262 => "newfstatat",
        273 => "set_robust_list",
        292 => "dup3",
        293 => "pipe2",
        298 => "perf_event_open",
        _ => return None,
    })
}

fn x86_syscall_name(no: i32) -> Option<&'static str> {
    Some(match no {
        1 => "exit",
        2 => "fork",
        3 => "read",
        4 => "write",
        5 => "open",
        6 => "close",
        11 => "execve",
        13 => "time",
        19 => "lseek",
        20 => "getpid",
        37 => "kill",
        41 => "dup",
        42 => "pipe",
        45 => "brk",
        54 => "ioctl",
        90 => "mmap",
        91 => "munmap",
        119 => "sigreturn",
        120 => "clone",
        125 => "mprotect",
        146 => "writev",
        163 => "mremap",
        173 => "rt_sigreturn",
        174 => "rt_sigaction",
        175 => "rt_sigprocmask",
        192 => "mmap2",
        224 => "gettid",
        240 => "futex",
        252 => "exit_group",
        _ => return None,
    })
}

pub fn is_sigreturn(syscallno: i32, arch: SupportedArch) -> bool {
    match arch {
        SupportedArch::X64 => syscallno == 15,
        SupportedArch::X86 => syscallno == 119 || syscallno == 173,
    }
}

pub fn signal_name(sig: i32) -> String {
    // strsignal is neither thread safe nor names them the way the kernel
    // headers do.
    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSTKFLT => "SIGSTKFLT",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGPWR => "SIGPWR",
        libc::SIGSYS => "SIGSYS",
        _ => {
            if sig >= libc::SIGRTMIN() && sig <= libc::SIGRTMAX() {
                return format!("SIGRT{}", sig - libc::SIGRTMIN());
            }
            return format!("signal({})", sig);
        }
    };
    name.to_owned()
}

pub fn errno_name(err: i32) -> String {
    let e = Errno::from_i32(err);
    if e == Errno::UnknownErrno {
        format!("errno({})", err)
    } else {
        format!("{:?}", e)
    }
}

pub fn ptrace_event_name(event: i32) -> String {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".to_owned(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".to_owned(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".to_owned(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".to_owned(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".to_owned(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".to_owned(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".to_owned(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(syscall_name(0, SupportedArch::X64), "read");
        assert_eq!(syscall_name(120, SupportedArch::X86), "clone");
        assert_eq!(syscall_name(99999, SupportedArch::X64), "syscall(99999)");
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert!(is_sigreturn(15, SupportedArch::X64));
        assert!(!is_sigreturn(15, SupportedArch::X86));
    }
}
