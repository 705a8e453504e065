use crate::kernel_abi::SupportedArch;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use std::fmt;
use std::io::{self, Write};

/// x86 flags bits excluded from record/replay comparison. RF is set
/// transiently by the cpu around restartable instructions, IF is under
/// kernel control at signal delivery, ID flips with CPUID probing, and bit 1
/// is documented reserved-as-1 but kernels differ. Shrinking this mask has
/// broken replay on specific kernel versions before; do not narrow it
/// without empirical evidence.
const X86_RESERVED_FLAG: u64 = 1 << 1;
const X86_IF_FLAG: u64 = 1 << 9;
const X86_RF_FLAG: u64 = 1 << 16;
const X86_ID_FLAG: u64 = 1 << 21;
const FLAGS_COMPARE_MASK: u64 = !(X86_RESERVED_FLAG | X86_IF_FLAG | X86_RF_FLAG | X86_ID_FLAG);

/// Segment registers hold a 16-bit selector; the upper bytes of the
/// ptrace-visible slot are noise.
const SEGMENT_COMPARE_MASK: u64 = 0xffff;

pub const MAX_REG_SIZE_BYTES: usize = 16;

/// The 64-bit general register file as the kernel exposes it via
/// PTRACE_GETREGS, field for field.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq)]
pub struct X64Regs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// The 32-bit register file as PTRACE_GETREGS returns it for an ia32 tracee.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq)]
pub struct X86Regs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

#[derive(Copy, Clone, PartialEq)]
enum RegsRepr {
    X64(X64Regs),
    X86(X86Regs),
}

/// How loudly `compare_with` reports mismatches.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MismatchBehavior {
    ExpectMismatches,
    LogMismatches,
}

/// Arch-tagged general registers with arch-neutral accessors. Copies from a
/// narrower register file sign-extend exactly the way the kernel's compat
/// layer does, so a 32-bit trace replayed through 64-bit accessors compares
/// clean.
#[derive(Copy, Clone)]
pub struct Registers {
    repr: RegsRepr,
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new(crate::kernel_abi::NATIVE_ARCH)
    }
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        let repr = match arch {
            SupportedArch::X64 => RegsRepr::X64(X64Regs::default()),
            SupportedArch::X86 => RegsRepr::X86(X86Regs::default()),
        };
        Registers { repr }
    }

    pub fn from_x64(regs: X64Regs) -> Registers {
        Registers {
            repr: RegsRepr::X64(regs),
        }
    }

    pub fn from_x86(regs: X86Regs) -> Registers {
        Registers {
            repr: RegsRepr::X86(regs),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        match self.repr {
            RegsRepr::X64(_) => SupportedArch::X64,
            RegsRepr::X86(_) => SupportedArch::X86,
        }
    }

    /// The raw bytes of the active register file, for ptrace SETREGS and for
    /// the trace.
    pub fn raw_bytes(&self) -> &[u8] {
        match &self.repr {
            RegsRepr::X64(r) => crate::util::u8_slice(r),
            RegsRepr::X86(r) => crate::util::u8_slice(r),
        }
    }

    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.repr {
            RegsRepr::X64(r) => crate::util::u8_slice_mut(r),
            RegsRepr::X86(r) => crate::util::u8_slice_mut(r),
        }
    }

    pub fn set_from_raw_bytes(arch: SupportedArch, bytes: &[u8]) -> Registers {
        let mut result = Registers::new(arch);
        let dest = result.raw_bytes_mut();
        let n = std::cmp::min(dest.len(), bytes.len());
        dest[..n].copy_from_slice(&bytes[..n]);
        result
    }

    pub fn ip(&self) -> RemoteCodePtr {
        match &self.repr {
            RegsRepr::X64(r) => RemoteCodePtr::from_val(r.rip as usize),
            RegsRepr::X86(r) => RemoteCodePtr::from_val(r.eip as usize),
        }
    }

    pub fn set_ip(&mut self, ip: RemoteCodePtr) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rip = ip.as_usize() as u64,
            RegsRepr::X86(r) => r.eip = ip.as_usize() as u32,
        }
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        match &self.repr {
            RegsRepr::X64(r) => RemotePtr::from_val(r.rsp as usize),
            RegsRepr::X86(r) => RemotePtr::from_val(r.esp as usize),
        }
    }

    pub fn set_sp(&mut self, sp: RemotePtr<Void>) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rsp = sp.as_usize() as u64,
            RegsRepr::X86(r) => r.esp = sp.as_usize() as u32,
        }
    }

    /// The syscall number in effect at a syscall-stop.
    pub fn syscallno(&self) -> i64 {
        match &self.repr {
            RegsRepr::X64(r) => r.rax as i64,
            RegsRepr::X86(r) => r.eax as i32 as i64,
        }
    }

    pub fn set_syscallno(&mut self, no: i64) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rax = no as u64,
            RegsRepr::X86(r) => r.eax = no as u32,
        }
    }

    /// The syscall the kernel believes is being restarted; mutated by the
    /// kernel during scheduler signals, hence the special comparison rule.
    pub fn original_syscallno(&self) -> i64 {
        match &self.repr {
            RegsRepr::X64(r) => r.orig_rax as i64,
            RegsRepr::X86(r) => r.orig_eax as i32 as i64,
        }
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.orig_rax = no as u64,
            RegsRepr::X86(r) => r.orig_eax = no as u32,
        }
    }

    pub fn syscall_result(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.rax as usize,
            RegsRepr::X86(r) => r.eax as usize,
        }
    }

    pub fn syscall_result_signed(&self) -> i64 {
        match &self.repr {
            RegsRepr::X64(r) => r.rax as i64,
            RegsRepr::X86(r) => r.eax as i32 as i64,
        }
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rax = result as u64,
            RegsRepr::X86(r) => r.eax = result as u32,
        }
    }

    pub fn set_syscall_result_signed(&mut self, result: i64) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rax = result as u64,
            RegsRepr::X86(r) => r.eax = result as u32,
        }
    }

    /// True if the result is in the kernel's failure window (-4095..-1).
    pub fn syscall_failed(&self) -> bool {
        crate::kernel_abi::syscall_result_is_error(self.syscall_result_signed())
    }

    pub fn arg(&self, index: usize) -> usize {
        match index {
            1 => self.arg1(),
            2 => self.arg2(),
            3 => self.arg3(),
            4 => self.arg4(),
            5 => self.arg5(),
            6 => self.arg6(),
            _ => panic!("syscall arg index {} out of range", index),
        }
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        match index {
            1 => self.set_arg1(value),
            2 => self.set_arg2(value),
            3 => self.set_arg3(value),
            4 => self.set_arg4(value),
            5 => self.set_arg5(value),
            6 => self.set_arg6(value),
            _ => panic!("syscall arg index {} out of range", index),
        }
    }

    pub fn arg1(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.rdi as usize,
            RegsRepr::X86(r) => r.ebx as usize,
        }
    }
    pub fn arg2(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.rsi as usize,
            RegsRepr::X86(r) => r.ecx as usize,
        }
    }
    pub fn arg3(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.rdx as usize,
            RegsRepr::X86(r) => r.edx as usize,
        }
    }
    pub fn arg4(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.r10 as usize,
            RegsRepr::X86(r) => r.esi as usize,
        }
    }
    pub fn arg5(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.r8 as usize,
            RegsRepr::X86(r) => r.edi as usize,
        }
    }
    pub fn arg6(&self) -> usize {
        match &self.repr {
            RegsRepr::X64(r) => r.r9 as usize,
            RegsRepr::X86(r) => r.ebp as usize,
        }
    }

    pub fn set_arg1(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rdi = v as u64,
            RegsRepr::X86(r) => r.ebx = v as u32,
        }
    }
    pub fn set_arg2(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rsi = v as u64,
            RegsRepr::X86(r) => r.ecx = v as u32,
        }
    }
    pub fn set_arg3(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.rdx = v as u64,
            RegsRepr::X86(r) => r.edx = v as u32,
        }
    }
    pub fn set_arg4(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.r10 = v as u64,
            RegsRepr::X86(r) => r.esi = v as u32,
        }
    }
    pub fn set_arg5(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.r8 = v as u64,
            RegsRepr::X86(r) => r.edi = v as u32,
        }
    }
    pub fn set_arg6(&mut self, v: usize) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.r9 = v as u64,
            RegsRepr::X86(r) => r.ebp = v as u32,
        }
    }

    pub fn flags(&self) -> u64 {
        match &self.repr {
            RegsRepr::X64(r) => r.eflags,
            RegsRepr::X86(r) => u64::from(r.eflags),
        }
    }

    pub fn set_flags(&mut self, flags: u64) {
        match &mut self.repr {
            RegsRepr::X64(r) => r.eflags = flags,
            RegsRepr::X86(r) => r.eflags = flags as u32,
        }
    }

    /// Compare two register files under the recording/replay masks. Returns
    /// true when they match. With LogMismatches every differing register is
    /// logged with both values.
    pub fn compare_with(
        &self,
        name1: &str,
        other: &Registers,
        name2: &str,
        behavior: MismatchBehavior,
    ) -> bool {
        if self.arch() != other.arch() {
            if behavior == MismatchBehavior::LogMismatches {
                log!(
                    crate::log::LogError,
                    "arch differs: {} vs {}: {:?} vs {:?}",
                    name1,
                    name2,
                    self.arch(),
                    other.arch()
                );
            }
            return false;
        }
        let mut ok = true;
        for (reg, v1, v2, mask) in self.comparable_values(other) {
            if (v1 & mask) != (v2 & mask) {
                ok = false;
                if behavior == MismatchBehavior::LogMismatches {
                    log!(
                        crate::log::LogError,
                        "{} {:#x} != {:#x} ({} vs {})",
                        reg,
                        v1,
                        v2,
                        name1,
                        name2
                    );
                }
            }
        }
        ok
    }

    pub fn matches(&self, other: &Registers) -> bool {
        self.compare_with("live", other, "recorded", MismatchBehavior::ExpectMismatches)
    }

    fn comparable_values(&self, other: &Registers) -> Vec<(&'static str, u64, u64, u64)> {
        match (&self.repr, &other.repr) {
            (RegsRepr::X64(a), RegsRepr::X64(b)) => {
                let mut v = vec![
                    ("r15", a.r15, b.r15, !0),
                    ("r14", a.r14, b.r14, !0),
                    ("r13", a.r13, b.r13, !0),
                    ("r12", a.r12, b.r12, !0),
                    ("rbp", a.rbp, b.rbp, !0),
                    ("rbx", a.rbx, b.rbx, !0),
                    ("r11", a.r11, b.r11, !0),
                    ("r10", a.r10, b.r10, !0),
                    ("r9", a.r9, b.r9, !0),
                    ("r8", a.r8, b.r8, !0),
                    ("rax", a.rax, b.rax, !0),
                    ("rcx", a.rcx, b.rcx, !0),
                    ("rdx", a.rdx, b.rdx, !0),
                    ("rsi", a.rsi, b.rsi, !0),
                    ("rdi", a.rdi, b.rdi, !0),
                    ("rip", a.rip, b.rip, !0),
                    ("eflags", a.eflags, b.eflags, FLAGS_COMPARE_MASK),
                    ("rsp", a.rsp, b.rsp, !0),
                    ("cs", a.cs, b.cs, SEGMENT_COMPARE_MASK),
                    ("ss", a.ss, b.ss, SEGMENT_COMPARE_MASK),
                    ("ds", a.ds, b.ds, SEGMENT_COMPARE_MASK),
                    ("es", a.es, b.es, SEGMENT_COMPARE_MASK),
                    ("fs", a.fs, b.fs, SEGMENT_COMPARE_MASK),
                    ("gs", a.gs, b.gs, SEGMENT_COMPARE_MASK),
                    ("fs_base", a.fs_base, b.fs_base, !0),
                    ("gs_base", a.gs_base, b.gs_base, !0),
                ];
                // orig_rax is scribbled on by the kernel during restarts;
                // only comparable when both sides are non-negative.
                if (a.orig_rax as i64) >= 0 && (b.orig_rax as i64) >= 0 {
                    v.push(("orig_rax", a.orig_rax, b.orig_rax, !0));
                }
                v
            }
            (RegsRepr::X86(a), RegsRepr::X86(b)) => {
                let mut v = vec![
                    ("ebx", a.ebx.into(), b.ebx.into(), !0),
                    ("ecx", a.ecx.into(), b.ecx.into(), !0),
                    ("edx", a.edx.into(), b.edx.into(), !0),
                    ("esi", a.esi.into(), b.esi.into(), !0),
                    ("edi", a.edi.into(), b.edi.into(), !0),
                    ("ebp", a.ebp.into(), b.ebp.into(), !0),
                    ("eax", a.eax.into(), b.eax.into(), !0),
                    ("eip", a.eip.into(), b.eip.into(), !0),
                    ("eflags", a.eflags.into(), b.eflags.into(), FLAGS_COMPARE_MASK),
                    ("esp", a.esp.into(), b.esp.into(), !0),
                    ("xds", a.xds.into(), b.xds.into(), SEGMENT_COMPARE_MASK),
                    ("xes", a.xes.into(), b.xes.into(), SEGMENT_COMPARE_MASK),
                    ("xfs", a.xfs.into(), b.xfs.into(), SEGMENT_COMPARE_MASK),
                    ("xgs", a.xgs.into(), b.xgs.into(), SEGMENT_COMPARE_MASK),
                    ("xcs", a.xcs.into(), b.xcs.into(), SEGMENT_COMPARE_MASK),
                    ("xss", a.xss.into(), b.xss.into(), SEGMENT_COMPARE_MASK),
                ];
                if (a.orig_eax as i32) >= 0 && (b.orig_eax as i32) >= 0 {
                    v.push(("orig_eax", a.orig_eax.into(), b.orig_eax.into(), !0));
                }
                v
            }
            _ => unreachable!("arch mismatch is checked before value comparison"),
        }
    }

    /// Emulate what the kernel does to the register file at syscall entry:
    /// the result slot reads as -ENOSYS until the syscall completes.
    pub fn emulate_syscall_entry(&mut self) {
        self.set_syscall_result_signed(-i64::from(libc::ENOSYS));
    }

    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.repr {
            RegsRepr::X64(r) => write!(
                out,
                "rip:{:#x} rsp:{:#x} rax:{:#x} rbx:{:#x} rcx:{:#x} rdx:{:#x} rsi:{:#x} rdi:{:#x} \
                 rbp:{:#x} r8:{:#x} r9:{:#x} r10:{:#x} r11:{:#x} r12:{:#x} r13:{:#x} r14:{:#x} \
                 r15:{:#x} orig_rax:{:#x} eflags:{:#x}",
                r.rip,
                r.rsp,
                r.rax,
                r.rbx,
                r.rcx,
                r.rdx,
                r.rsi,
                r.rdi,
                r.rbp,
                r.r8,
                r.r9,
                r.r10,
                r.r11,
                r.r12,
                r.r13,
                r.r14,
                r.r15,
                r.orig_rax,
                r.eflags
            ),
            RegsRepr::X86(r) => write!(
                out,
                "eip:{:#x} esp:{:#x} eax:{:#x} ebx:{:#x} ecx:{:#x} edx:{:#x} esi:{:#x} edi:{:#x} \
                 ebp:{:#x} orig_eax:{:#x} eflags:{:#x}",
                r.eip,
                r.esp,
                r.eax,
                r.ebx,
                r.ecx,
                r.edx,
                r.esi,
                r.edi,
                r.ebp,
                r.orig_eax,
                r.eflags
            ),
        }
    }
}

impl PartialEq for Registers {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf: Vec<u8> = Vec::new();
        self.write_register_file_compact(&mut buf).unwrap();
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x64_with(f: impl FnOnce(&mut X64Regs)) -> Registers {
        let mut r = X64Regs::default();
        f(&mut r);
        Registers::from_x64(r)
    }

    #[test]
    fn flags_mask_ignored_bits() {
        let a = x64_with(|r| r.eflags = 0x246);
        let b = x64_with(|r| r.eflags = 0x246 | X86_RF_FLAG | X86_IF_FLAG | X86_ID_FLAG);
        assert!(a.matches(&b));
        let c = x64_with(|r| r.eflags = 0x247);
        assert!(!a.matches(&c));
    }

    #[test]
    fn segment_regs_compare_low_16() {
        let a = x64_with(|r| r.cs = 0x33);
        let b = x64_with(|r| r.cs = 0xdead_0000_0033);
        assert!(a.matches(&b));
        let c = x64_with(|r| r.cs = 0x2b);
        assert!(!a.matches(&c));
    }

    #[test]
    fn orig_rax_not_compared_when_negative() {
        let a = x64_with(|r| r.orig_rax = (-1i64) as u64);
        let b = x64_with(|r| r.orig_rax = 9);
        assert!(a.matches(&b));
        let c = x64_with(|r| r.orig_rax = 10);
        let d = x64_with(|r| r.orig_rax = 9);
        assert!(!c.matches(&d));
    }

    #[test]
    fn x86_results_sign_extend() {
        let mut r = Registers::new(SupportedArch::X86);
        r.set_syscall_result_signed(-libc::ENOENT as i64);
        assert_eq!(r.syscall_result_signed(), -libc::ENOENT as i64);
        assert!(r.syscall_failed());
    }

    #[test]
    fn raw_round_trip() {
        let a = x64_with(|r| {
            r.rip = 0x7000_0010;
            r.rsp = 0x7fff_f000;
            r.rax = 42;
        });
        let b = Registers::set_from_raw_bytes(SupportedArch::X64, a.raw_bytes());
        assert!(a.matches(&b));
        assert_eq!(b.ip().as_usize(), 0x7000_0010);
    }

    #[test]
    fn syscall_entry_emulation() {
        let mut r = Registers::new(SupportedArch::X64);
        r.emulate_syscall_entry();
        assert_eq!(r.syscall_result_signed(), -i64::from(libc::ENOSYS));
    }
}
