use crate::kernel_metadata::signal_name;
use std::convert::TryFrom;
use std::fmt;

/// A signal number known to be in the valid range [1, _NSIG). Keeping the
/// range check at the boundary means signal arithmetic inside the engine
/// never has to re-validate.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sig(i32);

pub const _NSIG: i32 = 65;

impl Sig {
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub fn as_str(self) -> String {
        signal_name(self.0)
    }

    /// Bit position in a kernel sigset.
    pub fn bit(self) -> u64 {
        1u64 << (self.0 - 1)
    }
}

impl TryFrom<i32> for Sig {
    type Error = ();

    fn try_from(signo: i32) -> Result<Sig, ()> {
        if signo >= 1 && signo < _NSIG {
            Ok(Sig(signo))
        } else {
            Err(())
        }
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.0)
    }
}

pub mod sig {
    use super::Sig;

    pub const SIGILL: Sig = Sig(libc::SIGILL);
    pub const SIGTRAP: Sig = Sig(libc::SIGTRAP);
    pub const SIGBUS: Sig = Sig(libc::SIGBUS);
    pub const SIGFPE: Sig = Sig(libc::SIGFPE);
    pub const SIGKILL: Sig = Sig(libc::SIGKILL);
    pub const SIGSEGV: Sig = Sig(libc::SIGSEGV);
    pub const SIGSTKFLT: Sig = Sig(libc::SIGSTKFLT);
    pub const SIGCHLD: Sig = Sig(libc::SIGCHLD);
    pub const SIGSTOP: Sig = Sig(libc::SIGSTOP);
    pub const SIGPWR: Sig = Sig(libc::SIGPWR);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check() {
        assert!(Sig::try_from(0).is_err());
        assert!(Sig::try_from(-3).is_err());
        assert!(Sig::try_from(_NSIG).is_err());
        assert_eq!(Sig::try_from(libc::SIGSEGV).unwrap().as_raw(), libc::SIGSEGV);
    }

    #[test]
    fn sigset_bit() {
        assert_eq!(Sig::try_from(1).unwrap().bit(), 1);
        assert_eq!(
            Sig::try_from(libc::SIGTRAP).unwrap().bit(),
            1 << (libc::SIGTRAP - 1)
        );
    }
}
