//! Syscall-instruction patching. When a traced syscall's following bytes
//! match a known hook signature, the instruction (and the matched tail) is
//! rewritten into a jump to the preload library's buffering hook, so later
//! executions bypass ptrace entirely. The transformation is recorded as a
//! patch event and re-applied deterministically at the same point in
//! replay.

use crate::kernel_abi::syscall_instruction_length;
use crate::preload_interface::{syscall_patch_hook, NEXT_INSTRUCTION_BYTES_LEN};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::task::Task;

/// x86 jmp rel32.
const JMP_INSN: u8 = 0xe9;
const JMP_INSN_LEN: usize = 5;

pub struct Patcher {
    hooks: Vec<syscall_patch_hook>,
    /// Addresses already patched, so replay bookkeeping and re-entry both
    /// skip them.
    patched: Vec<RemoteCodePtr>,
    /// Addresses that failed to match; never retried.
    failed: Vec<RemoteCodePtr>,
}

impl Default for Patcher {
    fn default() -> Self {
        Patcher::new()
    }
}

impl Patcher {
    pub fn new() -> Patcher {
        Patcher {
            hooks: Vec::new(),
            patched: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Install the hook table announced by the preload library's init call.
    pub fn set_hooks(&mut self, hooks: Vec<syscall_patch_hook>) {
        self.hooks = hooks;
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    pub fn is_patched(&self, ip: RemoteCodePtr) -> bool {
        self.patched.contains(&ip)
    }

    /// Attempt to patch the syscall whose instruction ends at the task's
    /// current ip (i.e. the task is at a syscall entry stop). Returns true
    /// if the rewrite happened; the caller records the patch event and
    /// backs the task up to re-execute through the trampoline.
    pub fn try_patch_syscall(&mut self, t: &mut Task) -> bool {
        if self.hooks.is_empty() {
            return false;
        }
        let arch = t.arch();
        let insn_len = syscall_instruction_length(arch);
        let syscall_ip = t.ip().rewind_to_syscall(insn_len);
        if self.patched.contains(&syscall_ip) || self.failed.contains(&syscall_ip) {
            return false;
        }

        let mut following = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        let ip_data_ptr = t.ip().to_data_ptr();
        if t.read_bytes_fallible(ip_data_ptr, &mut following).is_err() {
            self.failed.push(syscall_ip);
            return false;
        }

        let hook = match self.find_hook(&following) {
            Some(h) => h,
            None => {
                self.failed.push(syscall_ip);
                return false;
            }
        };

        if self.apply_jump(t, syscall_ip, hook.hook_address, insn_len, hook.next_instruction_length as usize) {
            log!(
                crate::log::LogDebug,
                "patched syscall at {} to hook {:#x}",
                syscall_ip,
                hook.hook_address
            );
            self.patched.push(syscall_ip);
            true
        } else {
            self.failed.push(syscall_ip);
            false
        }
    }

    /// Replay-side: re-perform a recorded patch at `syscall_ip`. The hook
    /// table was re-announced by the replayed init call, so the same match
    /// must succeed; a mismatch means the preload library differs from
    /// recording, which is fatal elsewhere.
    pub fn reapply_patch(&mut self, t: &mut Task, syscall_ip: RemoteCodePtr) {
        if self.patched.contains(&syscall_ip) {
            return;
        }
        let arch = t.arch();
        let insn_len = syscall_instruction_length(arch);
        let after = syscall_ip.advance_past_syscall(insn_len);
        let mut following = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        if t
            .read_bytes_fallible(after.to_data_ptr(), &mut following)
            .is_err()
        {
            fatal!("Can't read instruction bytes to replay patch at {}", syscall_ip);
        }
        let hook = match self.find_hook(&following) {
            Some(h) => h,
            None => fatal!("Recorded patch at {} no longer matches any hook", syscall_ip),
        };
        if !self.apply_jump(
            t,
            syscall_ip,
            hook.hook_address,
            insn_len,
            hook.next_instruction_length as usize,
        ) {
            fatal!("Failed to replay patch at {}", syscall_ip);
        }
        self.patched.push(syscall_ip);
    }

    fn find_hook(&self, following: &[u8; NEXT_INSTRUCTION_BYTES_LEN]) -> Option<syscall_patch_hook> {
        for hook in &self.hooks {
            let n = hook.next_instruction_length as usize;
            if n <= NEXT_INSTRUCTION_BYTES_LEN
                && following[..n] == hook.next_instruction_bytes[..n]
            {
                return Some(*hook);
            }
        }
        None
    }

    /// Overwrite [syscall_ip, syscall_ip + insn_len + tail_len) with a
    /// rel32 jump to `target` plus NOP fill. The tail instructions are
    /// folded into the hook, which ends by jumping back past them.
    fn apply_jump(
        &self,
        t: &mut Task,
        syscall_ip: RemoteCodePtr,
        target: u64,
        insn_len: usize,
        tail_len: usize,
    ) -> bool {
        let patch_len = insn_len + tail_len;
        if patch_len < JMP_INSN_LEN {
            return false;
        }
        let jump_src_end = syscall_ip.as_usize() as i64 + JMP_INSN_LEN as i64;
        let offset = target as i64 - jump_src_end;
        if offset > i64::from(i32::MAX) || offset < i64::from(i32::MIN) {
            // Hook out of rel32 range; would need a stub page near the
            // patch site.
            return false;
        }
        let mut patch = Vec::with_capacity(patch_len);
        patch.push(JMP_INSN);
        patch.extend_from_slice(&(offset as i32).to_le_bytes());
        while patch.len() < patch_len {
            patch.push(0x90);
        }
        t.write_bytes_fallible(syscall_ip.to_data_ptr(), &patch)
            .map(|n| n == patch.len())
            == Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_with(bytes: &[u8], addr: u64) -> syscall_patch_hook {
        let mut h = syscall_patch_hook {
            next_instruction_length: bytes.len() as u8,
            next_instruction_bytes: [0; NEXT_INSTRUCTION_BYTES_LEN],
            hook_address: addr,
        };
        h.next_instruction_bytes[..bytes.len()].copy_from_slice(bytes);
        h
    }

    #[test]
    fn hook_matching_prefers_first_match() {
        let mut p = Patcher::new();
        // The canonical glibc epilogue: cmp $-4095, %rax.
        p.set_hooks(vec![
            hook_with(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff], 0x1000),
            hook_with(&[0x48, 0x89, 0xc2], 0x2000),
        ]);
        let mut following = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        following[..6].copy_from_slice(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff]);
        assert_eq!(p.find_hook(&following).unwrap().hook_address, 0x1000);

        let mut other = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        other[..3].copy_from_slice(&[0x48, 0x89, 0xc2]);
        assert_eq!(p.find_hook(&other).unwrap().hook_address, 0x2000);

        let unmatched = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        // All-zero bytes match nothing in this table.
        assert!(p.find_hook(&unmatched).is_none());
    }
}
