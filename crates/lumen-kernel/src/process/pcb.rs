//! Process control blocks

use alloc::string::String;

use crate::memory::{AddressSpace, HeapBlock};

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pid(pub u32);

/// Process lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessState {
    /// Waiting in the run queue for the CPU
    Ready,
    /// Owns the CPU
    Running,
    /// Sleeping until its wake tick
    Blocked,
    /// Exited; resources held until reaped
    Terminated,
}

/// Register snapshot saved and restored by the context-switch routine
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    /// Page table root
    pub cr3: u64,
}

impl CpuContext {
    /// Reserved bit 1 plus IF: interrupts enabled
    pub const INITIAL_RFLAGS: u64 = 0x202;

    /// Fresh context that starts executing `entry` on `stack_top`
    pub fn new(entry: u64, stack_top: u64, cr3: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            rflags: Self::INITIAL_RFLAGS,
            cr3,
            ..Self::default()
        }
    }
}

/// Saves the running registers into `old` and resumes `new`.
///
/// Implemented in assembly by the platform layer.
pub type ContextSwitchFn = unsafe extern "C" fn(old: *mut CpuContext, new: *const CpuContext);

/// Kernel stack carved out of the kernel heap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelStack {
    pub(crate) block: HeapBlock,
    /// One past the highest usable byte; the stack grows down from here
    pub top: u64,
}

/// Process control block
#[derive(Debug)]
pub struct Pcb {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    pub(crate) state: ProcessState,
    pub(crate) context: CpuContext,
    pub(crate) space: AddressSpace,
    pub(crate) stack: KernelStack,
    pub(crate) priority: u32,
    pub(crate) time_slice: u64,
    /// Tick at which a Blocked process becomes Ready again
    pub(crate) wake_at: Option<u64>,
    pub(crate) exit_status: Option<i32>,
    /// Run queue link (slab index)
    pub(crate) next: Option<usize>,
    pub(crate) queued: bool,
}

impl Pcb {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn stack(&self) -> KernelStack {
        self.stack
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Ticks left before preemption
    pub fn time_slice(&self) -> u64 {
        self.time_slice
    }

    pub fn wake_at(&self) -> Option<u64> {
        self.wake_at
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Whether the PCB is linked into the run queue
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            time_slice: self.time_slice,
            wake_at: self.wake_at,
            exit_status: self.exit_status,
            stack_top: self.stack.top,
            root: self.space.root().as_u64(),
        }
    }
}

/// Snapshot of a process for listings
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: u32,
    pub time_slice: u64,
    pub wake_at: Option<u64>,
    pub exit_status: Option<i32>,
    pub stack_top: u64,
    /// Physical address of the PML4
    pub root: u64,
}

/// Cut `name` to at most `max` bytes without splitting a character
pub(crate) fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        assert_eq!(core::mem::size_of::<CpuContext>(), 19 * 8);
        assert_eq!(core::mem::offset_of!(CpuContext, rsp), 7 * 8);
        assert_eq!(core::mem::offset_of!(CpuContext, rip), 16 * 8);
        assert_eq!(core::mem::offset_of!(CpuContext, cr3), 18 * 8);
    }

    #[test]
    fn test_new_context() {
        let ctx = CpuContext::new(0x10_0000, 0x20_0000, 0x3000);
        assert_eq!(ctx.rip, 0x10_0000);
        assert_eq!(ctx.rsp, 0x20_0000);
        assert_eq!(ctx.rflags, 0x202);
        assert_eq!(ctx.cr3, 0x3000);
        assert_eq!(ctx.rax, 0);
        assert_eq!(ctx.r15, 0);
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("init", 63), "init");
        let long = "x".repeat(100);
        assert_eq!(truncate_name(&long, 63).len(), 63);
        // 'é' is two bytes; never cut through it
        assert_eq!(truncate_name("aé", 2), "a");
    }
}
