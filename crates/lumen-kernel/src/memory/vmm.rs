//! Virtual Memory Manager
//!
//! Address spaces are PML4 roots plus every intermediate table frame the
//! manager allocated for them. Leaf frames belong to whoever mapped them.

use alloc::vec::Vec;
use lumen_hal::HAL;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use super::frame_allocator::FrameAllocator;
use super::page_table::{self, pd_index, pdpt_index, pml4_index, PageFlags, PageTable, PageTableEntry};
use crate::config::{KernelConfig, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::error::MemoryError;

/// First PML4 slot of the kernel (upper) half
const UPPER_HALF_START: usize = PAGE_TABLE_ENTRIES / 2;

/// One bit per PML4 slot
const SLOT_WORDS: usize = PAGE_TABLE_ENTRIES / 64;

type SlotMask = [u64; SLOT_WORDS];

/// An owned 4-level page table hierarchy
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    /// PML4 frame (loaded into CR3)
    root: PhysFrame,
    /// Frames allocated for PDPT/PD/PT tables (for cleanup)
    table_frames: Vec<PhysFrame>,
    /// PML4 slots that link to kernel-owned tables
    shared: SlotMask,
}

impl AddressSpace {
    /// Physical address of the PML4 table
    pub fn root(&self) -> PhysAddr {
        self.root.start_address()
    }

    /// Number of frames this space holds, root included
    pub fn frame_count(&self) -> usize {
        1 + self.table_frames.len()
    }

    /// Whether PML4 slot `slot` was filled by [`Vmm::share_kernel_mappings`]
    pub fn is_shared(&self, slot: usize) -> bool {
        self.shared[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn owns(&self, table: PhysAddr) -> bool {
        table == self.root() || self.table_frames.iter().any(|f| f.start_address() == table)
    }
}

/// Virtual memory manager state
#[derive(Debug, Default)]
pub struct Vmm {
    kernel_space: Option<AddressSpace>,
    active: Option<PhysAddr>,
}

impl Vmm {
    pub const fn new() -> Self {
        Self {
            kernel_space: None,
            active: None,
        }
    }

    /// Build the kernel address space and switch to it.
    ///
    /// Low memory up to `config.identity_map_limit` is identity-mapped
    /// read/write. With `config.inherit_upper_half` the upper-half PML4
    /// entries of the currently active tables are copied first. Calling this
    /// again once initialized does nothing.
    pub fn init<H: HAL>(
        &mut self,
        hal: &H,
        frames: &mut FrameAllocator,
        config: &KernelConfig,
    ) -> Result<(), MemoryError> {
        if self.kernel_space.is_some() {
            return Ok(());
        }

        let template = hal.active_address_space();
        let mut space = self.create_address_space(hal, frames)?;

        if let Err(e) = self.populate_kernel_space(hal, frames, &mut space, template, config) {
            self.destroy_address_space(frames, space);
            return Err(e);
        }

        self.switch_address_space(hal, &space);
        self.kernel_space = Some(space);
        Ok(())
    }

    fn populate_kernel_space<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        template: PhysAddr,
        config: &KernelConfig,
    ) -> Result<(), MemoryError> {
        if config.inherit_upper_half && template != space.root() {
            self.copy_entries(hal, template, space, UPPER_HALF_START..PAGE_TABLE_ENTRIES)?;
        }

        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        for addr in (0..config.identity_map_limit).step_by(PAGE_SIZE) {
            self.try_map(hal, frames, space, VirtAddr::new(addr), PhysAddr::new(addr), flags)?;
        }
        Ok(())
    }

    /// The kernel address space, once [`Vmm::init`] succeeded
    pub fn kernel_space(&self) -> Option<&AddressSpace> {
        self.kernel_space.as_ref()
    }

    /// Root most recently loaded through [`Vmm::switch_address_space`]
    pub fn active(&self) -> Option<PhysAddr> {
        self.active
    }

    /// Allocate and zero a fresh PML4
    pub fn create_address_space<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpace, MemoryError> {
        let root = frames.allocate_frame().ok_or(MemoryError::OutOfFrames)?;
        match unsafe { PageTable::at(hal, root.start_address()) } {
            Ok(table) => table.clear(),
            Err(e) => {
                frames.free_frame(root);
                return Err(e);
            }
        }

        Ok(AddressSpace {
            root,
            table_frames: Vec::new(),
            shared: [0; SLOT_WORDS],
        })
    }

    /// Share the kernel's lower-level tables with `space`.
    ///
    /// Every present PML4 entry of the kernel space is copied, so code
    /// running on `space` sees the kernel mappings. The shared tables stay
    /// owned by the kernel space and are never written through `space`:
    /// mapping inside a shared slot first gives `space` its own copy of
    /// the tables on the path. Does nothing before [`Vmm::init`].
    pub fn share_kernel_mappings<H: HAL>(
        &self,
        hal: &H,
        space: &mut AddressSpace,
    ) -> Result<(), MemoryError> {
        let Some(kernel) = &self.kernel_space else {
            return Ok(());
        };
        let copied = self.copy_entries(hal, kernel.root(), space, 0..PAGE_TABLE_ENTRIES)?;
        for (word, bits) in space.shared.iter_mut().zip(copied) {
            *word |= bits;
        }
        Ok(())
    }

    /// Copy the present PML4 entries in `range`; returns the copied slots
    fn copy_entries<H: HAL>(
        &self,
        hal: &H,
        from: PhysAddr,
        space: &AddressSpace,
        range: core::ops::Range<usize>,
    ) -> Result<SlotMask, MemoryError> {
        hal.without_interrupts(|| -> Result<SlotMask, MemoryError> {
            let source = unsafe { PageTable::at(hal, from)? };
            let mut entries = [PageTableEntry::empty(); PAGE_TABLE_ENTRIES];
            for (index, entry) in source.iter().enumerate().filter(|(i, _)| range.contains(i)) {
                entries[index] = *entry;
            }

            let target = unsafe { PageTable::at(hal, space.root())? };
            let mut copied = [0; SLOT_WORDS];
            for index in range.filter(|&i| entries[i].is_present()) {
                *target.entry_mut(index) = entries[index];
                copied[index / 64] |= 1 << (index % 64);
            }
            Ok(copied)
        })
    }

    /// Swap every kernel-owned table on the path to `vaddr` for a copy
    /// owned by `space`.
    fn privatize_path<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
    ) -> Result<(), MemoryError> {
        if !space.is_shared(pml4_index(vaddr)) {
            return Ok(());
        }

        let mut parent = space.root();
        for index in [pml4_index(vaddr), pdpt_index(vaddr), pd_index(vaddr)] {
            let table = unsafe { PageTable::at(hal, parent)? };
            let entry = *table.entry(index);
            if !entry.is_present() || entry.is_huge() {
                break;
            }
            let mut child = entry.phys_addr();
            if !space.owns(child) {
                child = self.copy_table(hal, frames, space, child)?;
                table.entry_mut(index).set(child, entry.flags());
            }
            parent = child;
        }
        Ok(())
    }

    fn copy_table<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        source: PhysAddr,
    ) -> Result<PhysAddr, MemoryError> {
        space.table_frames.try_reserve(1).map_err(|_| MemoryError::OutOfFrames)?;
        let frame = frames.allocate_frame().ok_or(MemoryError::OutOfFrames)?;
        space.table_frames.push(frame);

        let mut entries = [PageTableEntry::empty(); PAGE_TABLE_ENTRIES];
        for (slot, entry) in entries.iter_mut().zip(unsafe { PageTable::at(hal, source)? }.iter()) {
            *slot = *entry;
        }
        let table = unsafe { PageTable::at(hal, frame.start_address())? };
        for (index, entry) in entries.into_iter().enumerate() {
            *table.entry_mut(index) = entry;
        }
        Ok(frame.start_address())
    }

    /// Whether the walk to `vaddr` passes through a kernel-owned table
    fn borrows_path<H: HAL>(&self, hal: &H, space: &AddressSpace, vaddr: VirtAddr) -> bool {
        if !space.is_shared(pml4_index(vaddr)) {
            return false;
        }

        let mut parent = space.root();
        for index in [pml4_index(vaddr), pdpt_index(vaddr), pd_index(vaddr)] {
            let Ok(table) = (unsafe { PageTable::at(hal, parent) }) else {
                return true;
            };
            let entry = table.entry(index);
            if !entry.is_present() || entry.is_huge() {
                return false;
            }
            parent = entry.phys_addr();
            if !space.owns(parent) {
                return true;
            }
        }
        false
    }

    /// Release the root and every table frame the space allocated.
    ///
    /// Frames mapped as leaves are not touched.
    pub fn destroy_address_space(&mut self, frames: &mut FrameAllocator, space: AddressSpace) {
        if self.active == Some(space.root()) {
            self.active = None;
        }
        for frame in space.table_frames {
            frames.free_frame(frame);
        }
        frames.free_frame(space.root);
    }

    /// Map `vaddr` to `paddr` with `flags`.
    ///
    /// Returns `false` if a table could not be allocated or reached. Tables
    /// created before the failure stay in place and are released with the
    /// space.
    pub fn map_page<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: u64,
    ) -> bool {
        self.try_map(hal, frames, space, vaddr, paddr, flags).is_ok()
    }

    fn try_map<H: HAL>(
        &self,
        hal: &H,
        frames: &mut FrameAllocator,
        space: &mut AddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: u64,
    ) -> Result<(), MemoryError> {
        hal.without_interrupts(|| -> Result<(), MemoryError> {
            self.privatize_path(hal, frames, space, vaddr)?;

            let root = space.root();
            let table_frames = &mut space.table_frames;
            unsafe {
                page_table::map_page(hal, root, vaddr, paddr, flags, || {
                    table_frames.try_reserve(1).ok()?;
                    let frame = frames.allocate_frame()?;
                    table_frames.push(frame);
                    Some(frame.start_address())
                })?;
            }
            hal.flush_tlb(vaddr);
            Ok(())
        })
    }

    /// Clear the leaf for `vaddr`; a no-op when nothing is mapped there.
    ///
    /// Kernel mappings seen through shared tables are left alone.
    pub fn unmap_page<H: HAL>(&self, hal: &H, space: &mut AddressSpace, vaddr: VirtAddr) {
        hal.without_interrupts(|| {
            if self.borrows_path(hal, space, vaddr) {
                return;
            }
            if unsafe { page_table::unmap_page(hal, space.root(), vaddr) }.is_some() {
                hal.flush_tlb(vaddr);
            }
        })
    }

    /// Physical address `vaddr` maps to in `space`, page offset included
    pub fn translate<H: HAL>(&self, hal: &H, space: &AddressSpace, vaddr: VirtAddr) -> Option<PhysAddr> {
        unsafe { page_table::translate(hal, space.root(), vaddr) }
    }

    /// Load `space` into CR3
    pub fn switch_address_space<H: HAL>(&mut self, hal: &H, space: &AddressSpace) {
        let root = space.root();
        hal.without_interrupts(|| unsafe { hal.activate_address_space(root) });
        self.active = Some(root);
    }

    /// Load the kernel address space; `false` before [`Vmm::init`]
    pub fn switch_to_kernel<H: HAL>(&mut self, hal: &H) -> bool {
        let Some(root) = self.kernel_space.as_ref().map(AddressSpace::root) else {
            return false;
        };
        hal.without_interrupts(|| unsafe { hal.activate_address_space(root) });
        self.active = Some(root);
        true
    }
}
