//! Bring-up error codes.

use core::fmt;

/// Fatal outcomes of MP bring-up.
///
/// A census in which some processors stay silent is not an error; the roster
/// simply omits them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpError {
    /// The page reservation service could not satisfy the combined
    /// stack/state/backup allocation.
    AllocationFailure,
    /// No free, unprotected system-memory range below 1 MiB fits the
    /// wakeup buffer.
    NoWakeupBuffer,
    /// `MpConfig::validate` rejected the configuration.
    InvalidConfig(&'static str),
    /// Dispatch targeted the boot processor or an index outside the roster.
    InvalidProcessor(usize),
    /// The trampoline image plus exchange area exceeds one real-mode segment.
    TrampolineTooLarge(usize),
}

impl MpError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MpError::AllocationFailure => "MP data allocation failed",
            MpError::NoWakeupBuffer => "no wakeup buffer below 1MiB",
            MpError::InvalidConfig(reason) => *reason,
            MpError::InvalidProcessor(_) => "processor number not dispatchable",
            MpError::TrampolineTooLarge(_) => "AP trampoline exceeds wakeup buffer limit",
        }
    }
}

impl fmt::Display for MpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MpError::InvalidProcessor(index) => write!(f, "{} ({})", self.as_str(), index),
            MpError::TrampolineTooLarge(size) => {
                write!(f, "{} ({} bytes)", self.as_str(), size)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}
