//! Memory management
//!
//! - [`frame_allocator`]: bitmap allocator for 4 KiB physical frames
//! - [`page_table`]: 4-level x86-64 page table entries and walks
//! - [`vmm`]: address spaces built on the two above
//! - [`heap`]: first-fit kernel heap over a fixed arena

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vmm;

pub use frame_allocator::FrameAllocator;
pub use heap::{BlockInfo, HeapBlock, KernelHeap, LockedHeap};
pub use page_table::{PageFlags, PageTable, PageTableEntry};
pub use vmm::{AddressSpace, Vmm};

/// Descriptor for a memory region from the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    /// Physical start address
    pub start: u64,
    /// Region size in bytes
    pub size: u64,
    /// Region type
    pub kind: MemoryRegionKind,
}

/// Types of memory regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Usable RAM
    Usable,
    /// Reserved by firmware
    Reserved,
    /// Bootloader data still in use (page tables, boot info)
    Bootloader,
    /// Kernel image
    Kernel,
    /// Anything the boot protocol could not classify
    Unknown,
}

/// Point-in-time memory usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub phys_free_bytes: u64,
    pub phys_used_bytes: u64,
    pub heap_free_bytes: usize,
    pub heap_used_bytes: usize,
    /// Largest single allocation the heap could satisfy right now
    pub heap_largest_free: usize,
}
