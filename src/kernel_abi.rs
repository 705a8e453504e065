/// The architectures a trace can be recorded on. A trace records the arch of
/// every frame; replay refuses traces whose arch family differs from the
/// host's.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[repr(u8)]
pub enum SupportedArch {
    X86 = 0,
    X64 = 1,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;
#[cfg(target_arch = "x86")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X86;

impl SupportedArch {
    pub fn word_size(self) -> usize {
        match self {
            SupportedArch::X86 => 4,
            SupportedArch::X64 => 8,
        }
    }
}

/// The syscall instruction bytes for `arch`. These are what the stub page
/// hosts and what the patcher and vdso scanner search for.
pub fn syscall_instruction(arch: SupportedArch) -> &'static [u8] {
    match arch {
        // int $0x80
        SupportedArch::X86 => &[0xcd, 0x80],
        // syscall
        SupportedArch::X64 => &[0x0f, 0x05],
    }
}

pub fn syscall_instruction_length(arch: SupportedArch) -> usize {
    syscall_instruction(arch).len()
}

/// The 1-byte trap instruction written over a target byte when a software
/// breakpoint is installed (int3).
pub const BREAKPOINT_INSN: u8 = 0xcc;
pub const BREAKPOINT_INSN_LEN: usize = 1;

macro_rules! arch_syscall {
    ($fname:ident, $x86:expr, $x64:expr) => {
        pub fn $fname(arch: SupportedArch) -> i32 {
            match arch {
                SupportedArch::X86 => $x86,
                SupportedArch::X64 => $x64,
            }
        }
    };
}

arch_syscall!(syscall_number_for_read, 3, 0);
arch_syscall!(syscall_number_for_write, 4, 1);
arch_syscall!(syscall_number_for_open, 5, 2);
arch_syscall!(syscall_number_for_close, 6, 3);
arch_syscall!(syscall_number_for_poll, 168, 7);
arch_syscall!(syscall_number_for_mmap, 192, 9);
arch_syscall!(syscall_number_for_mprotect, 125, 10);
arch_syscall!(syscall_number_for_munmap, 91, 11);
arch_syscall!(syscall_number_for_brk, 45, 12);
arch_syscall!(syscall_number_for_rt_sigreturn, 173, 15);
arch_syscall!(syscall_number_for_ioctl, 54, 16);
arch_syscall!(syscall_number_for_sched_yield, 158, 24);
arch_syscall!(syscall_number_for_mremap, 163, 25);
arch_syscall!(syscall_number_for_dup2, 63, 33);
arch_syscall!(syscall_number_for_socket, 359, 41);
arch_syscall!(syscall_number_for_connect, 362, 42);
arch_syscall!(syscall_number_for_sendmsg, 370, 46);
arch_syscall!(syscall_number_for_clone, 120, 56);
arch_syscall!(syscall_number_for_fork, 2, 57);
arch_syscall!(syscall_number_for_vfork, 190, 58);
arch_syscall!(syscall_number_for_execve, 11, 59);
arch_syscall!(syscall_number_for_exit, 1, 60);
arch_syscall!(syscall_number_for_kill, 37, 62);
arch_syscall!(syscall_number_for_fcntl, 55, 72);
arch_syscall!(syscall_number_for_gettid, 224, 186);
arch_syscall!(syscall_number_for_futex, 240, 202);
arch_syscall!(syscall_number_for_exit_group, 252, 231);
arch_syscall!(syscall_number_for_tgkill, 270, 234);
arch_syscall!(syscall_number_for_openat, 295, 257);
arch_syscall!(syscall_number_for_restart_syscall, 0, 219);
arch_syscall!(syscall_number_for_clock_gettime, 265, 228);
arch_syscall!(syscall_number_for_rt_sigprocmask, 175, 14);

pub fn is_execve_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_execve(arch)
}

pub fn is_exit_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_exit(arch)
}

pub fn is_exit_group_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_exit_group(arch)
}

pub fn is_clone_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_clone(arch)
        || syscallno == syscall_number_for_fork(arch)
        || syscallno == syscall_number_for_vfork(arch)
}

pub fn is_mmap_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_mmap(arch)
}

pub fn is_sched_yield_syscall(syscallno: i32, arch: SupportedArch) -> bool {
    syscallno == syscall_number_for_sched_yield(arch)
}

/// The kernel's "syscall was interrupted, will restart" sentinels. Results in
/// this range never escape to userspace as final return values.
pub const ERESTARTSYS: i32 = 512;
pub const ERESTARTNOINTR: i32 = 513;
pub const ERESTARTNOHAND: i32 = 514;
pub const ERESTART_RESTARTBLOCK: i32 = 516;

pub fn is_restart_errno(errno_val: i32) -> bool {
    matches!(
        errno_val,
        ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
    )
}

/// Max number of bytes a syscall result can legally be negative by; used to
/// distinguish failure returns (-4095..-1) from valid pointers.
pub const MAX_ERRNO: i64 = 4095;

pub fn syscall_result_is_error(result: i64) -> bool {
    result < 0 && result >= -MAX_ERRNO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_tables() {
        assert_eq!(syscall_number_for_mmap(SupportedArch::X64), 9);
        assert_eq!(syscall_number_for_mmap(SupportedArch::X86), 192);
        assert!(is_execve_syscall(59, SupportedArch::X64));
        assert!(is_clone_syscall(57, SupportedArch::X64));
        assert_eq!(syscall_instruction(SupportedArch::X64), &[0x0f, 0x05]);
    }

    #[test]
    fn error_window() {
        assert!(syscall_result_is_error(-1));
        assert!(syscall_result_is_error(-4095));
        assert!(!syscall_result_is_error(-4096));
        assert!(!syscall_result_is_error(0));
        assert!(!syscall_result_is_error(0x7f00_0000_0000));
    }
}
