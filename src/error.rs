//! Error taxonomy shared by every subsystem.

use core::fmt;

use crate::addr::VirtAddr;

/// The kinds of failure a core operation can report. Allocation paths
/// return `Option` for plain exhaustion; everything that can fail for a
/// caller-visible reason returns `Result<_, MemError>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemError {
    /// No memory available after reclaim was attempted.
    OutOfMemory,
    /// Bad magic, bad canary, out-of-range pointer or double-free pattern.
    /// Logged at the detection site; the offending operation is aborted.
    Corruption,
    /// Zero size, oversized request, malformed address.
    InvalidArgument,
    /// Translate of an unmapped address or swap-in of an unknown handle.
    NotPresent,
    /// Swap device still holds live slots.
    DeviceBusy,
    /// Unhandled page fault outside all known ranges.
    FatalFault,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemError::OutOfMemory => "out of memory",
            MemError::Corruption => "memory corruption detected",
            MemError::InvalidArgument => "invalid argument",
            MemError::NotPresent => "address not present",
            MemError::DeviceBusy => "device busy",
            MemError::FatalFault => "fatal page fault",
        };
        f.write_str(msg)
    }
}

/// A fault the core could not handle, escalated to the scheduler. The
/// scheduler terminates the offending task (or halts, in kernel context).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FatalFault {
    pub vaddr: VirtAddr,
    pub error_code: u32,
}
