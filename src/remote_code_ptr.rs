use crate::kernel_abi::BREAKPOINT_INSN_LEN;
use crate::remote_ptr::{RemotePtr, Void};
use std::fmt;
use std::ops::{Add, Sub};

/// An instruction address in a tracee. Kept distinct from RemotePtr so code
/// arithmetic (skipping over an installed breakpoint byte, rewinding to a
/// syscall instruction) cannot be confused with data pointer arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn from_val(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::from_val(self.ptr)
    }

    pub fn from_data_ptr(p: RemotePtr<Void>) -> RemoteCodePtr {
        RemoteCodePtr { ptr: p.as_usize() }
    }

    /// The address the cpu reports after executing the trap byte at `self`.
    pub fn advance_past_breakpoint(self) -> RemoteCodePtr {
        RemoteCodePtr {
            ptr: self.ptr + BREAKPOINT_INSN_LEN,
        }
    }

    /// Where a breakpoint must have been installed if a SIGTRAP retired at
    /// `self`.
    pub fn undo_executed_breakpoint(self) -> RemoteCodePtr {
        RemoteCodePtr {
            ptr: self.ptr - BREAKPOINT_INSN_LEN,
        }
    }

    pub fn advance_past_syscall(self, insn_len: usize) -> RemoteCodePtr {
        RemoteCodePtr {
            ptr: self.ptr + insn_len,
        }
    }

    pub fn rewind_to_syscall(self, insn_len: usize) -> RemoteCodePtr {
        RemoteCodePtr {
            ptr: self.ptr - insn_len,
        }
    }
}

impl fmt::Display for RemoteCodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl fmt::Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::from_val(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::from_val(self.ptr - delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_arithmetic() {
        let p = RemoteCodePtr::from_val(0x1000);
        assert_eq!(p.advance_past_breakpoint().as_usize(), 0x1001);
        assert_eq!(
            p.advance_past_breakpoint().undo_executed_breakpoint(),
            p
        );
    }

    #[test]
    fn data_round_trip() {
        let p = RemoteCodePtr::from_val(0x7000_0000);
        assert_eq!(
            RemoteCodePtr::from_data_ptr(p.to_data_ptr::<crate::remote_ptr::Void>()),
            p
        );
    }
}
