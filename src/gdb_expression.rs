//! Evaluator for the debugger's agent-expression bytecode, used for
//! breakpoint and watchpoint conditions. The condition runs against tracee
//! state at every hit; a zero result suppresses the stop.

use crate::gdb_register::get_reg_u64;
use crate::remote_ptr::RemotePtr;
use crate::task::Task;

const OP_ADD: u8 = 0x02;
const OP_SUB: u8 = 0x03;
const OP_MUL: u8 = 0x04;
const OP_DIV_SIGNED: u8 = 0x05;
const OP_DIV_UNSIGNED: u8 = 0x06;
const OP_REM_SIGNED: u8 = 0x07;
const OP_REM_UNSIGNED: u8 = 0x08;
const OP_LSH: u8 = 0x09;
const OP_RSH_SIGNED: u8 = 0x0a;
const OP_RSH_UNSIGNED: u8 = 0x0b;
const OP_LOG_NOT: u8 = 0x0e;
const OP_BIT_AND: u8 = 0x0f;
const OP_BIT_OR: u8 = 0x10;
const OP_BIT_XOR: u8 = 0x11;
const OP_BIT_NOT: u8 = 0x12;
const OP_EQUAL: u8 = 0x13;
const OP_LESS_SIGNED: u8 = 0x14;
const OP_LESS_UNSIGNED: u8 = 0x15;
const OP_EXT: u8 = 0x16;
const OP_REF8: u8 = 0x17;
const OP_REF16: u8 = 0x18;
const OP_REF32: u8 = 0x19;
const OP_REF64: u8 = 0x1a;
const OP_IF_GOTO: u8 = 0x20;
const OP_GOTO: u8 = 0x21;
const OP_CONST8: u8 = 0x22;
const OP_CONST16: u8 = 0x23;
const OP_CONST32: u8 = 0x24;
const OP_CONST64: u8 = 0x25;
const OP_REG: u8 = 0x26;
const OP_END: u8 = 0x27;
const OP_DUP: u8 = 0x28;
const OP_POP: u8 = 0x29;
const OP_ZERO_EXT: u8 = 0x2a;
const OP_SWAP: u8 = 0x2b;

/// Evaluation is bounded: a malicious or buggy expression must not hang the
/// replay.
const MAX_STEPS: usize = 10_000;

#[derive(Clone)]
pub struct GdbExpression {
    bytecode: Vec<u8>,
}

impl GdbExpression {
    pub fn new(bytecode: &[u8]) -> GdbExpression {
        GdbExpression {
            bytecode: bytecode.to_vec(),
        }
    }

    /// Run the expression against `t`'s state. None on any malformed
    /// program (stack underflow, pc out of range, division by zero), which
    /// callers treat as "condition true" so a broken condition doesn't
    /// silently skip stops.
    pub fn evaluate(&self, t: &mut Task) -> Option<i64> {
        let code = &self.bytecode;
        let mut stack: Vec<i64> = Vec::new();
        let mut pc = 0usize;
        let mut steps = 0usize;

        macro_rules! pop {
            () => {
                match stack.pop() {
                    Some(v) => v,
                    None => return None,
                }
            };
        }
        macro_rules! binop {
            ($f:expr) => {{
                let b = pop!();
                let a = pop!();
                let f: fn(i64, i64) -> Option<i64> = $f;
                match f(a, b) {
                    Some(v) => stack.push(v),
                    None => return None,
                }
            }};
        }

        while pc < code.len() {
            steps += 1;
            if steps > MAX_STEPS {
                return None;
            }
            let op = code[pc];
            pc += 1;
            match op {
                OP_ADD => binop!(|a, b| Some(a.wrapping_add(b))),
                OP_SUB => binop!(|a, b| Some(a.wrapping_sub(b))),
                OP_MUL => binop!(|a, b| Some(a.wrapping_mul(b))),
                OP_DIV_SIGNED => binop!(|a, b| if b == 0 { None } else { Some(a.wrapping_div(b)) }),
                OP_DIV_UNSIGNED => binop!(|a, b| {
                    if b == 0 {
                        None
                    } else {
                        Some(((a as u64) / (b as u64)) as i64)
                    }
                }),
                OP_REM_SIGNED => binop!(|a, b| if b == 0 { None } else { Some(a.wrapping_rem(b)) }),
                OP_REM_UNSIGNED => binop!(|a, b| {
                    if b == 0 {
                        None
                    } else {
                        Some(((a as u64) % (b as u64)) as i64)
                    }
                }),
                OP_LSH => binop!(|a, b| Some(a.wrapping_shl(b as u32))),
                OP_RSH_SIGNED => binop!(|a, b| Some(a.wrapping_shr(b as u32))),
                OP_RSH_UNSIGNED => binop!(|a, b| Some(((a as u64).wrapping_shr(b as u32)) as i64)),
                OP_LOG_NOT => {
                    let a = pop!();
                    stack.push((a == 0) as i64);
                }
                OP_BIT_AND => binop!(|a, b| Some(a & b)),
                OP_BIT_OR => binop!(|a, b| Some(a | b)),
                OP_BIT_XOR => binop!(|a, b| Some(a ^ b)),
                OP_BIT_NOT => {
                    let a = pop!();
                    stack.push(!a);
                }
                OP_EQUAL => binop!(|a, b| Some((a == b) as i64)),
                OP_LESS_SIGNED => binop!(|a, b| Some((a < b) as i64)),
                OP_LESS_UNSIGNED => binop!(|a, b| Some(((a as u64) < (b as u64)) as i64)),
                OP_EXT => {
                    let n = *code.get(pc)? as u32;
                    pc += 1;
                    let a = pop!();
                    if n == 0 || n > 64 {
                        return None;
                    }
                    let shift = 64 - n;
                    stack.push(a.wrapping_shl(shift).wrapping_shr(shift));
                }
                OP_ZERO_EXT => {
                    let n = *code.get(pc)? as u32;
                    pc += 1;
                    let a = pop!();
                    if n == 0 || n > 64 {
                        return None;
                    }
                    if n == 64 {
                        stack.push(a);
                    } else {
                        stack.push((a as u64 & ((1u64 << n) - 1)) as i64);
                    }
                }
                OP_REF8 | OP_REF16 | OP_REF32 | OP_REF64 => {
                    let size = match op {
                        OP_REF8 => 1,
                        OP_REF16 => 2,
                        OP_REF32 => 4,
                        _ => 8,
                    };
                    let addr = pop!() as u64 as usize;
                    let mut buf = [0u8; 8];
                    if t
                        .read_bytes_fallible(RemotePtr::from_val(addr), &mut buf[..size])
                        .map(|n| n == size)
                        != Ok(true)
                    {
                        return None;
                    }
                    stack.push(i64::from_le_bytes(buf));
                }
                OP_IF_GOTO => {
                    let target = self.read_u16_be(&mut pc)?;
                    let cond = pop!();
                    if cond != 0 {
                        pc = target;
                    }
                }
                OP_GOTO => {
                    pc = self.read_u16_be(&mut pc)?;
                }
                OP_CONST8 => {
                    let v = *code.get(pc)?;
                    pc += 1;
                    stack.push(i64::from(v));
                }
                OP_CONST16 => {
                    let v = self.read_u16_be(&mut pc)?;
                    stack.push(v as i64);
                }
                OP_CONST32 => {
                    let mut v: u64 = 0;
                    for _ in 0..4 {
                        v = (v << 8) | u64::from(*code.get(pc)?);
                        pc += 1;
                    }
                    stack.push(v as i64);
                }
                OP_CONST64 => {
                    let mut v: u64 = 0;
                    for _ in 0..8 {
                        v = (v << 8) | u64::from(*code.get(pc)?);
                        pc += 1;
                    }
                    stack.push(v as i64);
                }
                OP_REG => {
                    let regno = self.read_u16_be(&mut pc)?;
                    let v = get_reg_u64(t.regs(), regno);
                    stack.push(v as i64);
                }
                OP_END => {
                    return stack.pop();
                }
                OP_DUP => {
                    let top = *stack.last()?;
                    stack.push(top);
                }
                OP_POP => {
                    let _ = pop!();
                }
                OP_SWAP => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(b);
                    stack.push(a);
                }
                _ => {
                    // Unknown opcode: unsupported expression.
                    return None;
                }
            }
        }
        stack.pop()
    }

    fn read_u16_be(&self, pc: &mut usize) -> Option<usize> {
        let hi = *self.bytecode.get(*pc)?;
        let lo = *self.bytecode.get(*pc + 1)?;
        *pc += 2;
        Some(((hi as usize) << 8) | lo as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pure-arithmetic expressions never touch the task, so a dangling Task
    // value is fine for these.
    fn dummy_task() -> Task {
        Task::new(0, 0, 0)
    }

    #[test]
    fn const_arithmetic() {
        // (5 + 3) * 2 == 16
        let code = [
            OP_CONST8, 5, OP_CONST8, 3, OP_ADD, OP_CONST8, 2, OP_MUL, OP_END,
        ];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), Some(16));
    }

    #[test]
    fn comparison_and_logic() {
        // !(4 < 3) == 1
        let code = [
            OP_CONST8, 4, OP_CONST8, 3, OP_LESS_SIGNED, OP_LOG_NOT, OP_END,
        ];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), Some(1));
    }

    #[test]
    fn division_by_zero_is_error() {
        let code = [OP_CONST8, 4, OP_CONST8, 0, OP_DIV_SIGNED, OP_END];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), None);
    }

    #[test]
    fn stack_underflow_is_error() {
        let code = [OP_ADD, OP_END];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), None);
    }

    #[test]
    fn goto_terminates() {
        // An infinite loop trips the step bound rather than hanging.
        let code = [OP_GOTO, 0, 0];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), None);
    }

    #[test]
    fn sign_extension() {
        // 0xff ext(8) == -1
        let code = [OP_CONST8, 0xff, OP_EXT, 8, OP_END];
        let e = GdbExpression::new(&code);
        assert_eq!(e.evaluate(&mut dummy_task()), Some(-1));
    }
}
