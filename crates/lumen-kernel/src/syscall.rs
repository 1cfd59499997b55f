//! Process syscalls
//!
//! Canonical numbers for the process-control subset of the syscall ABI and
//! a typed decoding of the raw register values. Dispatch happens in
//! [`crate::Kernel::handle_syscall`].

// ============================================================================
// Canonical Syscall Numbers (ABI)
// ============================================================================

/// Terminate the calling process (arg1 = exit status)
pub const SYS_EXIT: u64 = 0;
/// Return the caller's pid (0 when no process is current)
pub const SYS_GETPID: u64 = 8;
/// Block the caller for arg1 ticks
pub const SYS_SLEEP: u64 = 9;
/// Give up the rest of the time slice
pub const SYS_YIELD: u64 = 10;

/// Value returned for unknown syscall numbers
pub const SYSCALL_ERROR: u64 = u64::MAX;

/// Decoded syscall request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Exit process (SYS_EXIT 0)
    Exit { status: i32 },
    /// Get current pid (SYS_GETPID 8)
    GetPid,
    /// Sleep for a number of ticks (SYS_SLEEP 9)
    Sleep { ticks: u64 },
    /// Yield CPU (SYS_YIELD 10)
    Yield,
}

impl Syscall {
    /// Decode a raw syscall number and its first argument
    pub fn decode(num: u64, arg1: u64) -> Option<Self> {
        match num {
            // The status travels in the low 32 bits.
            SYS_EXIT => Some(Syscall::Exit {
                status: arg1 as u32 as i32,
            }),
            SYS_GETPID => Some(Syscall::GetPid),
            SYS_SLEEP => Some(Syscall::Sleep { ticks: arg1 }),
            SYS_YIELD => Some(Syscall::Yield),
            _ => None,
        }
    }

    /// The ABI number of this syscall
    pub fn number(&self) -> u64 {
        match self {
            Syscall::Exit { .. } => SYS_EXIT,
            Syscall::GetPid => SYS_GETPID,
            Syscall::Sleep { .. } => SYS_SLEEP,
            Syscall::Yield => SYS_YIELD,
        }
    }
}
