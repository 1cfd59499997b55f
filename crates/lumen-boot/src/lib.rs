//! Lumen OS Boot Crate
//!
//! Bare-metal entry point for x86_64 (QEMU and real hardware).
//!
//! # Boot Process
//!
//! 1. **Bootloader**: the `bootloader` crate enters long mode, maps all of
//!    physical memory at a dynamic upper-half offset and jumps to
//!    `kernel_main` with the memory map.
//!
//! 2. **Rust Initialization** (`main.rs`):
//!    - Brings up the HAL (COM1 serial) for the mapped physical window
//!    - Hands the static arena to the global kernel heap
//!    - Seeds the frame allocator from the memory map
//!    - Builds the kernel address space and switches to it
//!    - Idles, reaping terminated processes
//!
//! Everything past the entry point lives in `lumen-kernel`.

#![no_std]

use lumen_kernel::{MemoryRegionDescriptor, MemoryRegionKind};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "Lumen OS";

/// Bootloader-independent descriptor for one memory map entry
pub fn region_descriptor(start: u64, end: u64, kind: MemoryRegionKind) -> MemoryRegionDescriptor {
    MemoryRegionDescriptor {
        start,
        size: end.saturating_sub(start),
        kind,
    }
}
