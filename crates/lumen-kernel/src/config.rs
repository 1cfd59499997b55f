//! Central kernel configuration.
//!
//! Compile-time constants shared by every subsystem, plus the runtime
//! [`KernelConfig`] handed to [`crate::Kernel::new`].

use crate::log::LogLevel;

/// Page / frame size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table at every level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Low physical memory identity-mapped into the kernel address space (16 MiB).
pub const IDENTITY_MAP_LIMIT: u64 = 16 * 1024 * 1024;

/// Size of the static kernel heap arena used on bare metal (16 MiB).
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Heap payload alignment; every request is rounded up to this.
pub const HEAP_ALIGN: usize = 16;

/// Kernel stack allocated per process (8 KiB).
pub const KERNEL_STACK_SIZE: usize = 8 * 1024;

/// Default time slice in ticks (10ms at 1000Hz).
pub const DEFAULT_TIME_SLICE: u64 = 10;

/// Timer interrupt frequency driving [`crate::Kernel::timer_tick`].
pub const TIMER_FREQUENCY_HZ: u32 = 1000;

/// Longest process name kept in a PCB, in bytes.
pub const MAX_PROCESS_NAME: usize = 63;

/// Runtime kernel configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    /// Ticks a process may run before it is preempted
    pub time_slice: u64,
    /// Bytes of low memory identity-mapped by [`crate::Kernel::init_paging`]
    pub identity_map_limit: u64,
    /// Messages below this level are dropped
    pub log_level: LogLevel,
    /// Copy the upper-half PML4 entries of the active (bootloader) page
    /// table into the kernel address space before switching to it
    pub inherit_upper_half: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            time_slice: DEFAULT_TIME_SLICE,
            identity_map_limit: IDENTITY_MAP_LIMIT,
            log_level: LogLevel::Info,
            inherit_upper_half: false,
        }
    }
}
