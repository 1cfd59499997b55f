//! Lumen OS Hardware Abstraction Layer
//!
//! The kernel core never touches the CPU directly. Everything that would
//! otherwise be inline assembly or a raw physical-memory cast goes through
//! the [`HAL`] trait:
//!
//! - diagnostic output (serial on x86_64)
//! - TLB invalidation and CR3 loads
//! - interrupt masking around allocator / scheduler mutation
//! - the physical-memory window used to reach page-table frames
//!
//! # Features
//!
//! - `x86_64` - the bare-metal implementation ([`x86_64::X86_64Hal`]),
//!   COM1 serial output and real interrupt masking in [`IrqMutex`].
//!
//! Without the feature the crate still provides the trait and a lock that
//! does no interrupt masking, which is what the host-side kernel tests use.

#![no_std]

pub mod lock;

#[cfg(feature = "x86_64")]
pub mod x86_64;

pub use ::x86_64::{PhysAddr, VirtAddr};
pub use lock::{IrqMutex, IrqMutexGuard};

/// Errors reported by the hardware layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Physical address is outside the window the kernel can reach
    PhysicalOutOfRange,
    /// Physical address is not aligned to the requested structure
    Misaligned,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HalError::PhysicalOutOfRange => write!(f, "physical address outside mapped window"),
            HalError::Misaligned => write!(f, "physical address misaligned"),
        }
    }
}

/// Hardware operations the kernel core depends on.
///
/// A single logical processor is assumed. Implementations must make
/// [`HAL::without_interrupts`] mask the timer for the whole closure.
pub trait HAL {
    /// Write one line of diagnostic output
    fn debug_write(&self, msg: &str);

    /// Invalidate any cached translation for the page containing `vaddr`
    fn flush_tlb(&self, vaddr: VirtAddr);

    /// Load `root` as the active top-level page table.
    ///
    /// # Safety
    /// `root` must be the physical address of a valid PML4 that maps the
    /// currently executing code and stack.
    unsafe fn activate_address_space(&self, root: PhysAddr);

    /// Physical address of the top-level table currently loaded
    fn active_address_space(&self) -> PhysAddr;

    /// Kernel-virtual address through which `phys` can be accessed
    fn phys_to_virt(&self, phys: PhysAddr) -> Result<VirtAddr, HalError>;

    /// Run `f` with interrupts masked, restoring the previous state afterwards
    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R;
}
