use crate::kernel_abi::SupportedArch;
use std::fmt;

/// Format tag for the extended register blob. XSave covers the FP/SSE/AVX
/// area as PTRACE_GETREGSET(NT_X86_XSTATE) returns it; the layout within is
/// cpu-dependent and the engine treats it as opaque bytes bound to the
/// recording machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Format {
    None = 0,
    XSave = 1,
}

/// Extended (floating point / vector) registers. Unlike `Registers` this is
/// variable length and usually absent from trace frames; comparison is
/// byte-wise because no field here is kernel-mutated.
#[derive(Clone)]
pub struct ExtraRegisters {
    format: Format,
    arch: SupportedArch,
    data: Vec<u8>,
}

impl Default for ExtraRegisters {
    fn default() -> Self {
        ExtraRegisters {
            format: Format::None,
            arch: crate::kernel_abi::NATIVE_ARCH,
            data: Vec::new(),
        }
    }
}

impl ExtraRegisters {
    pub fn new(arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format: Format::None,
            arch,
            data: Vec::new(),
        }
    }

    pub fn from_xsave(arch: SupportedArch, data: Vec<u8>) -> ExtraRegisters {
        ExtraRegisters {
            format: Format::XSave,
            arch,
            data,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch
    }

    pub fn is_empty(&self) -> bool {
        self.format == Format::None
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn matches(&self, other: &ExtraRegisters) -> bool {
        self.format == other.format && self.data == other.data
    }

    /// A cheap content hash used in mark identities, where storing the whole
    /// blob per mark would defeat the point of marks being lightweight.
    pub fn content_hash(&self) -> u64 {
        // FNV-1a.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        h = h.wrapping_mul(0x100_0000_01b3) ^ (self.format as u64);
        for &b in &self.data {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x100_0000_01b3);
        }
        h
    }
}

impl fmt::Debug for ExtraRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExtraRegisters({:?}, {} bytes)",
            self.format,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_by_default() {
        let e = ExtraRegisters::default();
        assert!(e.is_empty());
        assert_eq!(e.format(), Format::None);
    }

    #[test]
    fn hash_distinguishes_content() {
        let a = ExtraRegisters::from_xsave(SupportedArch::X64, vec![1, 2, 3]);
        let b = ExtraRegisters::from_xsave(SupportedArch::X64, vec![1, 2, 4]);
        assert_ne!(a.content_hash(), b.content_hash());
        assert!(a.matches(&a.clone()));
        assert!(!a.matches(&b));
    }
}
