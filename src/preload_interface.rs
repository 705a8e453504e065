//! The shared-memory interface between the tracer and the injected preload
//! library. Everything here is `#[repr(C)]` and layout-asserted: the library
//! is built separately and the trace format depends on these layouts.
//!
//! The library's hot path runs inside the tracee at addresses the tracer
//! recognises by IP. It must not call into arbitrary runtime code (no
//! allocator, no TLS helpers), so every structure here is plain data the
//! library can manipulate with raw loads and stores.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Bump whenever the interface between the syscall buffer and the engine
/// changes in a way replay can observe. The value is stored in the trace
/// header so replay always knows the recording's protocol.
pub const SYSCALLBUF_PROTOCOL_VERSION: u16 = 0;

pub const SYSCALLBUF_LIB_FILENAME: &str = "libretrace_preload.so";
pub const SYSCALLBUF_LIB_FILENAME_32: &str = "libretrace_preload_32.so";

/// Exported into the tracee environment to let the library decide whether to
/// activate buffering.
pub const SYSCALLBUF_ENABLED_ENV_VAR: &str = "_RETRACE_USE_SYSCALLBUF";

/// Size of the table mapping fd numbers to buffering-disabled flags. fds at
/// or above this range never use the buffer.
pub const SYSCALLBUF_FDS_DISABLED_SIZE: usize = 1024;

/// The stub page: a fixed-address page mapped into every tracee holding the
/// syscall instructions the tracer recognises by IP, plus eight 0xFF
/// constant bytes the library loads through.
pub const STUB_PAGE_ADDR: usize = 0x7000_0000;
pub const STUB_PAGE_SYSCALL_STUB_SIZE: usize = 3;
pub const STUB_PAGE_SYSCALL_INSTRUCTION_END: usize = 2;

pub const fn stub_page_syscall_addr(index: usize) -> usize {
    STUB_PAGE_ADDR + STUB_PAGE_SYSCALL_STUB_SIZE * index
}

pub const STUB_SYSCALL_TRACED: usize = stub_page_syscall_addr(0);
pub const STUB_SYSCALL_PRIVILEGED_TRACED: usize = stub_page_syscall_addr(1);
pub const STUB_SYSCALL_UNTRACED: usize = stub_page_syscall_addr(2);
pub const STUB_SYSCALL_UNTRACED_REPLAY_ONLY: usize = stub_page_syscall_addr(3);
pub const STUB_SYSCALL_UNTRACED_RECORDING_ONLY: usize = stub_page_syscall_addr(4);
pub const STUB_SYSCALL_PRIVILEGED_UNTRACED: usize = stub_page_syscall_addr(5);
pub const STUB_SYSCALL_PRIVILEGED_UNTRACED_REPLAY_ONLY: usize = stub_page_syscall_addr(6);
pub const STUB_SYSCALL_PRIVILEGED_UNTRACED_RECORDING_ONLY: usize = stub_page_syscall_addr(7);
pub const STUB_PAGE_FF_BYTES: usize = stub_page_syscall_addr(8);
pub const STUB_PAGE_FF_BYTES_LEN: usize = 8;

/// Engine calls: syscall numbers beyond the arch's range, intercepted by the
/// tracer and never passed to the kernel.
///
/// The library announces its hook table and globals page during
/// initialization.
pub const SYS_rtcall_init_preload: i32 = 442;
/// Each new thread (including the first) asks the tracer to allocate its
/// per-thread buffer; the buffer pointer comes back in the syscall result.
pub const SYS_rtcall_init_buffers: i32 = 443;
/// The library signals completion of a buffered-syscall transaction when
/// `notify_on_syscall_hook_exit` was set, giving the tracer a safe point to
/// deliver a signal or reset the buffer.
pub const SYS_rtcall_notify_syscall_hook_exit: i32 = 444;

/// Describes one instruction that can follow a syscall instruction, and the
/// library hook to patch with. Recording-only; never consulted at replay.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct syscall_patch_hook {
    pub next_instruction_length: u8,
    pub next_instruction_bytes: [u8; 14],
    pub hook_address: u64,
}

pub const NEXT_INSTRUCTION_BYTES_LEN: usize = 14;

/// Parameters passed by the library with SYS_rtcall_init_preload.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct rtcall_init_preload_params {
    /// Address of the preload globals page in the tracee.
    pub globals: u64,
    pub syscall_patch_hook_count: u32,
    pub _padding: u32,
    pub syscall_patch_hooks: u64,
    /// Address of a library-internal symbol the patcher jumps through.
    pub syscallhook_vsyscall_entry: u64,
}

/// Parameters passed with SYS_rtcall_init_buffers.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct rtcall_init_buffers_params {
    /// The fd the library wants its desched counter on; the tracer arranges
    /// the perf fd into this slot.
    pub desched_counter_fd: i32,
    pub _padding: i32,
    /// Written by the tracer: start of the thread's syscall buffer.
    pub syscallbuf_ptr: u64,
    /// Written by the tracer: usable byte size of the buffer.
    pub syscallbuf_size: u32,
    pub _padding2: u32,
}

/// Variables shared between the library and the tracer, one page per address
/// space.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct preload_globals {
    /// 0 during recording, 1 during replay. MUST only feed conditional
    /// moves, never branches: control flow during replay has to retrace the
    /// recording exactly.
    pub in_replay: u8,
    /// 1 while a diversion session is running the tracee.
    pub in_diversion: u8,
    /// The signal the desched counter delivers.
    pub desched_sig: u8,
    pub _padding: u8,
    /// Number of cores to pretend the machine has; 0 reads as 1.
    pub pretend_num_cores: i32,
    /// Nonzero entries force the corresponding fd down the traced path. The
    /// final entry stands in for every fd at or beyond the table.
    pub syscallbuf_fds_disabled: [u8; SYSCALLBUF_FDS_DISABLED_SIZE],
}

/// One buffered syscall. The record header is followed inline by the
/// syscall's recorded out-parameter bytes, then padding to 8-byte alignment.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct syscallbuf_record {
    /// Return value; can be a pointer, so pointer width everywhere.
    pub ret: i64,
    pub syscallno: u16,
    /// Did the tracee arm the desched notification for this syscall?
    pub desched: u8,
    pub _padding: u8,
    /// Size of this struct plus the inline data, excluding padding.
    pub size: u32,
}

pub const SYSCALLBUF_RECORD_HEADER_SIZE: usize = std::mem::size_of::<syscallbuf_record>();
const_assert_eq!(SYSCALLBUF_RECORD_HEADER_SIZE, 16);

pub fn record_extra_data_size(rec: &syscallbuf_record) -> usize {
    rec.size as usize - SYSCALLBUF_RECORD_HEADER_SIZE
}

/// Bytes a record of `size` occupies in the ring, including alignment
/// padding.
pub fn stored_record_size(size: u32) -> u32 {
    (size + 7) & !7
}

/// Why the buffer is locked. The buffer may be used only when all bits are
/// clear.
pub const SYSCALLBUF_LOCKED_TRACEE: u8 = 0x1;
pub const SYSCALLBUF_LOCKED_TRACER: u8 = 0x2;

/// State of the syscall buffer, located at the start of the buffer mapping.
///
/// Commit protocol (the tracer depends on this ordering):
/// - `locked` is set before any record-area write and cleared only after the
///   record's `size` and `ret` are stored.
/// - `num_rec_bytes` advances last, after the record body is complete; a
///   racing reader sees either "no record yet" or a fully formed record.
/// - `desched_signal_may_be_relevant` is set before the desched counter is
///   armed and cleared after it is disarmed, so flag-then-armed reads as one
///   consistent arming state.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct syscallbuf_hdr {
    /// Bytes of valid records in the buffer, not counting this header.
    pub num_rec_bytes: u32,
    /// True if the current syscall should not be committed, likely because a
    /// desched interrupted it. Set by the tracer.
    pub abort_commit: u8,
    /// True if the library should issue SYS_rtcall_notify_syscall_hook_exit
    /// when it next leaves the hook.
    pub notify_on_syscall_hook_exit: u8,
    /// See SYSCALLBUF_LOCKED_*.
    pub locked: u8,
    /// Nonzero while the desched signal could fire for this thread. When
    /// zero the tracer discards stray desched signals.
    pub desched_signal_may_be_relevant: u8,
}

pub const SYSCALLBUF_HDR_SIZE: usize = std::mem::size_of::<syscallbuf_hdr>();
const_assert_eq!(SYSCALLBUF_HDR_SIZE, 8);

/// Default per-thread buffer size. Must hold at least one maximal record.
pub const SYSCALLBUF_DEFAULT_SIZE: usize = 1 << 20;
const_assert!(SYSCALLBUF_DEFAULT_SIZE > SYSCALLBUF_HDR_SIZE + SYSCALLBUF_RECORD_HEADER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_size_alignment() {
        assert_eq!(stored_record_size(16), 16);
        assert_eq!(stored_record_size(17), 24);
        assert_eq!(stored_record_size(23), 24);
        assert_eq!(stored_record_size(24), 24);
    }

    #[test]
    fn stub_page_layout() {
        assert_eq!(STUB_SYSCALL_TRACED, STUB_PAGE_ADDR);
        assert_eq!(
            STUB_SYSCALL_UNTRACED,
            STUB_PAGE_ADDR + 2 * STUB_PAGE_SYSCALL_STUB_SIZE
        );
        // The constant bytes sit after the eight syscall slots.
        assert_eq!(STUB_PAGE_FF_BYTES, STUB_PAGE_ADDR + 24);
    }
}
