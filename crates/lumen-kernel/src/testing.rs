//! Host-side HAL used by the unit tests.
//!
//! "Physical memory" is a zeroed, page-aligned host allocation of `frames`
//! pages; physical address `p` lives at `base + p`.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use lumen_hal::{HalError, PhysAddr, VirtAddr, HAL};

use crate::config::PAGE_SIZE;

pub struct MockHal {
    base: *mut u8,
    frames: usize,
    debug: RefCell<Vec<String>>,
    flushed: RefCell<Vec<VirtAddr>>,
    active: Cell<PhysAddr>,
    activations: Cell<usize>,
    masked_depth: Cell<usize>,
    masked_sections: Cell<usize>,
}

impl MockHal {
    pub fn new(frames: usize) -> Self {
        let base = unsafe { alloc_zeroed(Self::layout(frames)) };
        assert!(!base.is_null());
        Self {
            base,
            frames,
            debug: RefCell::new(Vec::new()),
            flushed: RefCell::new(Vec::new()),
            active: Cell::new(PhysAddr::new(0)),
            activations: Cell::new(0),
            masked_depth: Cell::new(0),
            masked_sections: Cell::new(0),
        }
    }

    fn layout(frames: usize) -> Layout {
        Layout::from_size_align(frames.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    /// Total bytes of simulated physical memory
    pub fn memory_size(&self) -> u64 {
        (self.frames * PAGE_SIZE) as u64
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.debug.borrow().clone()
    }

    pub fn flushed(&self) -> Vec<VirtAddr> {
        self.flushed.borrow().clone()
    }

    pub fn activations(&self) -> usize {
        self.activations.get()
    }

    pub fn masked_sections(&self) -> usize {
        self.masked_sections.get()
    }

    pub fn interrupts_masked(&self) -> bool {
        self.masked_depth.get() > 0
    }

    /// Read a u64 straight out of simulated physical memory
    pub fn read_u64(&self, phys: u64) -> u64 {
        assert!(phys + 8 <= self.memory_size());
        unsafe { core::ptr::read(self.base.add(phys as usize) as *const u64) }
    }
}

impl Drop for MockHal {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, Self::layout(self.frames)) };
    }
}

impl HAL for MockHal {
    fn debug_write(&self, msg: &str) {
        self.debug.borrow_mut().push(msg.to_string());
    }

    fn flush_tlb(&self, vaddr: VirtAddr) {
        self.flushed.borrow_mut().push(vaddr);
    }

    unsafe fn activate_address_space(&self, root: PhysAddr) {
        self.active.set(root);
        self.activations.set(self.activations.get() + 1);
    }

    fn active_address_space(&self) -> PhysAddr {
        self.active.get()
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> Result<VirtAddr, HalError> {
        if phys.as_u64() >= self.memory_size() {
            return Err(HalError::PhysicalOutOfRange);
        }
        Ok(VirtAddr::new(self.base as u64 + phys.as_u64()))
    }

    fn without_interrupts<R, F: FnOnce() -> R>(&self, f: F) -> R {
        self.masked_depth.set(self.masked_depth.get() + 1);
        self.masked_sections.set(self.masked_sections.get() + 1);
        let result = f();
        self.masked_depth.set(self.masked_depth.get() - 1);
        result
    }
}
