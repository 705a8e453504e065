//! Kernel ABI constants libc doesn't export.

/// x86-only ptrace requests: stop at syscall entry without executing the
/// syscall. The backbone of syscall result injection during replay.
pub const PTRACE_SYSEMU: libc::c_uint = 31;
pub const PTRACE_SYSEMU_SINGLESTEP: libc::c_uint = 32;

/// The debug-status register (DR6) layout bits the engine inspects.
pub const DS_WATCHPOINT_ANY: usize = 0xf;
pub const DS_SINGLESTEP: usize = 1 << 14;

/// Offset of u_debugreg[] in the x86-64 `user` area, for
/// PTRACE_PEEKUSER/POKEUSER access to DR0-DR7.
pub const DEBUG_REG_USER_OFFSET: usize = 848;

pub fn dr_offset(regno: usize) -> usize {
    DEBUG_REG_USER_OFFSET + regno * std::mem::size_of::<usize>()
}

/// DR7 encoding helpers: each of DR0-DR3 has an enable bit pair and a 4-bit
/// condition/size field.
pub fn dr7_enable_bit(regno: usize) -> usize {
    1 << (regno * 2)
}

pub fn dr7_type_field(regno: usize, type_: usize, len_field: usize) -> usize {
    (type_ | (len_field << 2)) << (16 + 4 * regno)
}

/// Watchpoint length encoding for DR7: 1, 2, 4 or 8 bytes.
pub fn dr7_len_field(num_bytes: usize) -> usize {
    match num_bytes {
        1 => 0,
        2 => 1,
        8 => 2,
        4 => 3,
        _ => panic!("unsupported hardware watchpoint length {}", num_bytes),
    }
}
