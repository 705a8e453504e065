use crate::registers::Registers;
use crate::task::{ResumeRequest, Task, WaitRequest};

/// Result of a fast-forward request.
#[derive(Copy, Clone, Default, Debug)]
pub struct FastForwardStatus {
    /// More than one instruction may have retired.
    pub did_fast_forward: bool,
    /// The loop was abandoned before the instruction changed (bound hit or
    /// the tracee stopped for another reason).
    pub incomplete_fast_forward: bool,
}

/// Upper bound on instructions retired per fast-forward call. Replay
/// correctness doesn't depend on this (ticks are still counted); it bounds
/// the work done between interrupt-flag checks.
const MAX_FAST_FORWARD_STEPS: usize = 0x10000;

/// How many instruction bytes are compared to decide "same instruction".
const INSN_COMPARE_BYTES: usize = 16;

/// Single-step `t` repeatedly while it keeps executing the same
/// instruction, stopping before any register state in `stop_before`.
///
/// This exists for single-instruction loops (REP-prefixed string
/// instructions and spin loops): replay's instruction-by-instruction path
/// through such a loop may differ from the recording's (interrupt
/// placement differs), but tick counts still align because each iteration
/// retires the same conditional branches. Stepping the whole loop as one
/// unit keeps replay tick-equivalent without single-step overhead per
/// iteration.
pub fn fast_forward_through_instruction(
    t: &mut Task,
    stop_before: &[&Registers],
) -> FastForwardStatus {
    let mut status = FastForwardStatus::default();

    let ip = t.ip();
    let mut insn = [0u8; INSN_COMPARE_BYTES];
    if t
        .read_bytes_fallible(ip.to_data_ptr(), &mut insn)
        .is_err()
    {
        // Unreadable instruction; plain single-step and let the caller
        // classify the stop.
        t.resume_execution(ResumeRequest::Singlestep, WaitRequest::ResumeAndWait, 0, None);
        return status;
    }

    for step in 0..MAX_FAST_FORWARD_STEPS {
        for state in stop_before {
            if state.matches(t.regs()) {
                status.incomplete_fast_forward = step == 0;
                return status;
            }
        }

        t.resume_execution(ResumeRequest::Singlestep, WaitRequest::ResumeAndWait, 0, None);
        if step > 0 {
            status.did_fast_forward = true;
        }

        // Any stop other than a plain single-step trap ends the loop; the
        // caller owns signal/exit classification.
        match t.status().stop_sig() {
            Some(sig) if sig == libc::SIGTRAP => {}
            _ => {
                status.incomplete_fast_forward = true;
                return status;
            }
        }

        let new_ip = t.ip();
        if new_ip != ip {
            return status;
        }
        let mut now = [0u8; INSN_COMPARE_BYTES];
        if t.read_bytes_fallible(new_ip.to_data_ptr(), &mut now).is_err() || now != insn {
            return status;
        }
    }
    status.incomplete_fast_forward = true;
    status
}

/// True when the instruction at `ip` is one that can retire many times at
/// the same address (REP-prefixed string instructions); the step engine
/// offers those to the fast-forward path.
pub fn maybe_at_fast_forwardable_instruction(t: &mut Task) -> bool {
    let ip = t.ip();
    let mut bytes = [0u8; 3];
    if t
        .read_bytes_fallible(ip.to_data_ptr(), &mut bytes)
        .is_err()
    {
        return false;
    }
    // REP/REPNE prefixes, possibly after an operand-size prefix.
    matches!(bytes[0], 0xf2 | 0xf3) || (bytes[0] == 0x66 && matches!(bytes[1], 0xf2 | 0xf3))
}
