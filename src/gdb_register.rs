use crate::extra_registers::ExtraRegisters;
use crate::kernel_abi::SupportedArch;
use crate::registers::Registers;

/// Register numbering used on the remote-debug wire for x86-64 targets.
/// The order is fixed by the client's target description, not by us.
pub const DREG_RAX: usize = 0;
pub const DREG_RBX: usize = 1;
pub const DREG_RCX: usize = 2;
pub const DREG_RDX: usize = 3;
pub const DREG_RSI: usize = 4;
pub const DREG_RDI: usize = 5;
pub const DREG_RBP: usize = 6;
pub const DREG_RSP: usize = 7;
pub const DREG_R8: usize = 8;
pub const DREG_R15: usize = 15;
pub const DREG_RIP: usize = 16;
pub const DREG_EFLAGS: usize = 17;
pub const DREG_CS: usize = 18;
pub const DREG_SS: usize = 19;
pub const DREG_DS: usize = 20;
pub const DREG_ES: usize = 21;
pub const DREG_FS: usize = 22;
pub const DREG_GS: usize = 23;
/// FP/vector registers occupy 24..=55; served from the XSAVE blob.
pub const DREG_FIRST_FP: usize = 24;
pub const DREG_LAST_FP: usize = 55;
pub const DREG_ORIG_RAX: usize = 57;
pub const DREG_FS_BASE: usize = 58;
pub const DREG_GS_BASE: usize = 59;

pub const DREG_NUM_X64: usize = 60;

/// A possibly-undefined register value for the wire: `size` bytes of
/// `value` are meaningful when `defined`.
#[derive(Clone, Debug)]
pub struct GdbRegisterValue {
    pub regno: usize,
    pub value: [u8; 16],
    pub defined: bool,
    pub size: usize,
}

impl GdbRegisterValue {
    fn undefined(regno: usize, size: usize) -> GdbRegisterValue {
        GdbRegisterValue {
            regno,
            value: [0; 16],
            defined: false,
            size,
        }
    }

    fn from_u64(regno: usize, v: u64) -> GdbRegisterValue {
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&v.to_le_bytes());
        GdbRegisterValue {
            regno,
            value,
            defined: true,
            size: 8,
        }
    }
}

/// Read one wire-numbered register out of the engine's register models.
pub fn get_reg(
    regs: &Registers,
    _extra: &ExtraRegisters,
    regno: usize,
) -> GdbRegisterValue {
    debug_assert_eq!(regs.arch(), SupportedArch::X64);
    let raw = regs.raw_bytes();
    let field = |index: usize| -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[index * 8..index * 8 + 8]);
        u64::from_le_bytes(b)
    };
    // Field order within the ptrace register file.
    const F_R15: usize = 0;
    const F_R14: usize = 1;
    const F_R13: usize = 2;
    const F_R12: usize = 3;
    const F_RBP: usize = 4;
    const F_RBX: usize = 5;
    const F_R11: usize = 6;
    const F_R10: usize = 7;
    const F_R9: usize = 8;
    const F_R8: usize = 9;
    const F_RAX: usize = 10;
    const F_RCX: usize = 11;
    const F_RDX: usize = 12;
    const F_RSI: usize = 13;
    const F_RDI: usize = 14;
    const F_ORIG_RAX: usize = 15;
    const F_RIP: usize = 16;
    const F_CS: usize = 17;
    const F_EFLAGS: usize = 18;
    const F_RSP: usize = 19;
    const F_SS: usize = 20;
    const F_FS_BASE: usize = 21;
    const F_GS_BASE: usize = 22;
    const F_DS: usize = 23;
    const F_ES: usize = 24;
    const F_FS: usize = 25;
    const F_GS: usize = 26;

    match regno {
        DREG_RAX => GdbRegisterValue::from_u64(regno, field(F_RAX)),
        DREG_RBX => GdbRegisterValue::from_u64(regno, field(F_RBX)),
        DREG_RCX => GdbRegisterValue::from_u64(regno, field(F_RCX)),
        DREG_RDX => GdbRegisterValue::from_u64(regno, field(F_RDX)),
        DREG_RSI => GdbRegisterValue::from_u64(regno, field(F_RSI)),
        DREG_RDI => GdbRegisterValue::from_u64(regno, field(F_RDI)),
        DREG_RBP => GdbRegisterValue::from_u64(regno, field(F_RBP)),
        DREG_RSP => GdbRegisterValue::from_u64(regno, field(F_RSP)),
        8 => GdbRegisterValue::from_u64(regno, field(F_R8)),
        9 => GdbRegisterValue::from_u64(regno, field(F_R9)),
        10 => GdbRegisterValue::from_u64(regno, field(F_R10)),
        11 => GdbRegisterValue::from_u64(regno, field(F_R11)),
        12 => GdbRegisterValue::from_u64(regno, field(F_R12)),
        13 => GdbRegisterValue::from_u64(regno, field(F_R13)),
        14 => GdbRegisterValue::from_u64(regno, field(F_R14)),
        DREG_R15 => GdbRegisterValue::from_u64(regno, field(F_R15)),
        DREG_RIP => GdbRegisterValue::from_u64(regno, field(F_RIP)),
        DREG_EFLAGS => {
            let mut v = GdbRegisterValue::from_u64(regno, field(F_EFLAGS));
            v.size = 4;
            v
        }
        DREG_CS | DREG_SS | DREG_DS | DREG_ES | DREG_FS | DREG_GS => {
            let f = match regno {
                DREG_CS => F_CS,
                DREG_SS => F_SS,
                DREG_DS => F_DS,
                DREG_ES => F_ES,
                DREG_FS => F_FS,
                _ => F_GS,
            };
            let mut v = GdbRegisterValue::from_u64(regno, field(f));
            v.size = 4;
            v
        }
        DREG_ORIG_RAX => GdbRegisterValue::from_u64(regno, field(F_ORIG_RAX)),
        DREG_FS_BASE => GdbRegisterValue::from_u64(regno, field(F_FS_BASE)),
        DREG_GS_BASE => GdbRegisterValue::from_u64(regno, field(F_GS_BASE)),
        DREG_FIRST_FP..=DREG_LAST_FP => {
            // Vector state is opaque here; the client tolerates
            // undefined values for registers we don't serve.
            GdbRegisterValue::undefined(regno, 16)
        }
        _ => GdbRegisterValue::undefined(regno, 8),
    }
}

/// Read a wire-numbered register as a plain u64, for the expression
/// evaluator.
pub fn get_reg_u64(regs: &Registers, regno: usize) -> u64 {
    let v = get_reg(regs, &ExtraRegisters::default(), regno);
    let mut b = [0u8; 8];
    b.copy_from_slice(&v.value[..8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::X64Regs;

    #[test]
    fn wire_numbering_matches_fields() {
        let mut r = X64Regs::default();
        r.rax = 0x1111;
        r.rsp = 0x2222;
        r.rip = 0x3333;
        r.eflags = 0x246;
        r.r15 = 0x4444;
        let regs = Registers::from_x64(r);
        assert_eq!(get_reg_u64(&regs, DREG_RAX), 0x1111);
        assert_eq!(get_reg_u64(&regs, DREG_RSP), 0x2222);
        assert_eq!(get_reg_u64(&regs, DREG_RIP), 0x3333);
        assert_eq!(get_reg_u64(&regs, DREG_EFLAGS), 0x246);
        assert_eq!(get_reg_u64(&regs, DREG_R15), 0x4444);
    }
}
