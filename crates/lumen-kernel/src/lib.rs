//! Lumen OS Kernel Core
//!
//! This crate implements the memory and process core of the kernel:
//! - Physical frame allocation
//! - 4-level page tables and per-process address spaces
//! - The kernel heap (also usable as the global allocator)
//! - Process control blocks and round-robin scheduling
//! - Process syscall dispatch
//!
//! # Module Organization
//!
//! - `config` - Compile-time constants and runtime `KernelConfig`
//! - `error` - Kernel error types
//! - `log` - Level-filtered kernel log with in-memory history
//! - `memory` - Frame allocator, page tables, VMM and heap
//! - `process` - PCBs and the scheduler
//! - `syscall` - Syscall numbers and decoding
//! - `kernel` - `Kernel` facade tying the subsystems together (internal)
//!
//! All hardware access goes through the [`HAL`] trait, so the whole crate
//! is tested on the host against a mock HAL.

#![no_std]
extern crate alloc;

pub mod config;
pub mod error;
pub mod log;
pub mod memory;
pub mod process;
pub mod syscall;

mod kernel;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use error::{KernelError, MemoryError};
pub use kernel::{ContextSwitch, Kernel};
pub use log::{LogLevel, Logger};
pub use memory::{
    AddressSpace, FrameAllocator, HeapBlock, KernelHeap, LockedHeap, MemoryRegionDescriptor,
    MemoryRegionKind, MemoryStats, Vmm,
};
pub use process::{ContextSwitchFn, CpuContext, Pid, ProcessInfo, ProcessState, Scheduler};
pub use syscall::{Syscall, SYS_EXIT, SYS_GETPID, SYS_SLEEP, SYS_YIELD};

// Re-export HAL types
pub use lumen_hal::{HalError, PhysAddr, VirtAddr, HAL};
