//! x86_64 platform implementation of the HAL
//!
//! The bootloader maps all of physical memory at a fixed virtual offset;
//! page-table frames are reached through that window.

pub mod serial;
pub mod tlb;

use x86_64::instructions::interrupts;
use x86_64::{PhysAddr, VirtAddr};

use crate::{HalError, HAL};

/// Bare-metal HAL for a single x86_64 processor
pub struct X86_64Hal {
    /// Virtual address where physical address 0 is mapped
    phys_offset: u64,
    /// First physical address past the mapped window
    phys_limit: u64,
}

impl X86_64Hal {
    /// Create the HAL for a physical-memory window of `phys_limit` bytes
    /// mapped at `phys_offset`.
    ///
    /// Also brings up the COM1 serial port used by [`HAL::debug_write`].
    pub fn new(phys_offset: u64, phys_limit: u64) -> Self {
        serial::init();
        Self {
            phys_offset,
            phys_limit,
        }
    }

    /// Virtual address where physical memory starts
    pub fn phys_offset(&self) -> u64 {
        self.phys_offset
    }
}

impl HAL for X86_64Hal {
    fn debug_write(&self, msg: &str) {
        serial::write_str(msg);
        serial::write_str("\n");
    }

    fn flush_tlb(&self, vaddr: VirtAddr) {
        tlb::flush_page(vaddr);
    }

    unsafe fn activate_address_space(&self, root: PhysAddr) {
        tlb::switch_address_space(root);
    }

    fn active_address_space(&self) -> PhysAddr {
        tlb::current_cr3()
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> Result<VirtAddr, HalError> {
        if phys.as_u64() >= self.phys_limit {
            return Err(HalError::PhysicalOutOfRange);
        }
        VirtAddr::try_new(phys.as_u64() + self.phys_offset).map_err(|_| HalError::PhysicalOutOfRange)
    }

    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R {
        interrupts::without_interrupts(f)
    }
}
