//! TLB (Translation Lookaside Buffer) and CR3 management
//!
//! The TLB caches virtual-to-physical address translations.
//! It must be flushed when page table mappings change.

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

/// Flush a single page from the TLB (INVLPG)
#[inline]
pub fn flush_page(vaddr: VirtAddr) {
    x86_64::instructions::tlb::flush(vaddr);
}

/// Switch to a new address space by loading CR3
///
/// This automatically flushes non-global TLB entries.
///
/// # Safety
/// The physical address must point to a valid PML4 table that maps the
/// code currently executing.
#[inline]
pub unsafe fn switch_address_space(pml4_phys: PhysAddr) {
    let (_, flags) = Cr3::read();
    Cr3::write(PhysFrame::containing_address(pml4_phys), flags);
}

/// Get the current CR3 value (current address space)
#[inline]
pub fn current_cr3() -> PhysAddr {
    Cr3::read().0.start_address()
}
