//! The subset of the perf_event_open UAPI the engine programs. libc does not
//! export these; the layout below matches linux/perf_event.h with the
//! bitfield word collapsed into `flags`.

#![allow(non_camel_case_types)]

use static_assertions::const_assert_eq;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;

pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;

/// Bit positions in the collapsed bitfield word.
pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const PERF_ATTR_FLAG_PINNED: u64 = 1 << 2;
pub const PERF_ATTR_FLAG_EXCLUSIVE: u64 = 1 << 3;
pub const PERF_ATTR_FLAG_EXCLUDE_USER: u64 = 1 << 4;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;

pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: libc::c_ulong = 0x4008_2404;

pub const PERF_EVENT_ATTR_SIZE_VER5: u32 = 112;

#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// sample_period / sample_freq union.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// The packed bitfield word; use the PERF_ATTR_FLAG_* bits.
    pub flags: u64,
    /// wakeup_events / wakeup_watermark union.
    pub wakeup_events: u32,
    pub bp_type: u32,
    /// bp_addr / config1 union.
    pub bp_addr: u64,
    /// bp_len / config2 union.
    pub bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

const_assert_eq!(std::mem::size_of::<perf_event_attr>(), 112);

pub fn perf_event_open(
    attr: &perf_event_attr,
    pid: libc::pid_t,
    cpu: i32,
    group_fd: i32,
    flags: libc::c_ulong,
) -> i32 {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        ) as i32
    }
}
