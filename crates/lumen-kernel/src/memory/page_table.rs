//! Page Table structures and operations for x86_64
//!
//! 4-level page tables with 4 KiB pages. Tables are reached through the
//! HAL's physical-memory window, and [`PageTable::at`] is the only place a
//! physical table address becomes a reference.

use lumen_hal::{HalError, HAL};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::error::MemoryError;

/// Page table entry flags
#[allow(non_snake_case)]
pub mod PageFlags {
    /// Page is present in memory
    pub const PRESENT: u64 = 1 << 0;
    /// Page is writable
    pub const WRITABLE: u64 = 1 << 1;
    /// Page is accessible from user mode
    pub const USER: u64 = 1 << 2;
    /// Write-through caching
    pub const WRITE_THROUGH: u64 = 1 << 3;
    /// Disable caching
    pub const NO_CACHE: u64 = 1 << 4;
    /// Page has been accessed
    pub const ACCESSED: u64 = 1 << 5;
    /// Page has been written to
    pub const DIRTY: u64 = 1 << 6;
    /// Huge page (2 MiB or 1 GiB)
    pub const HUGE_PAGE: u64 = 1 << 7;
    /// Global page
    pub const GLOBAL: u64 = 1 << 8;
    /// Disable execution
    pub const NO_EXECUTE: u64 = 1 << 63;

    /// Physical address bits of an entry (12-51)
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

/// A page table entry (8 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(phys_addr: PhysAddr, flags: u64) -> Self {
        Self((phys_addr.as_u64() & PageFlags::ADDR_MASK) | flags)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & PageFlags::WRITABLE != 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & PageFlags::USER != 0
    }

    pub fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE_PAGE != 0
    }

    /// Physical address this entry points to
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & PageFlags::ADDR_MASK)
    }

    pub fn flags(&self) -> u64 {
        self.0 & !PageFlags::ADDR_MASK
    }

    pub fn set(&mut self, phys_addr: PhysAddr, flags: u64) {
        *self = Self::new(phys_addr, flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({:?}, flags=0x{:X})", self.phys_addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// A page table (512 entries of 8 bytes, one frame)
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    /// Reference the table stored in the physical frame at `phys`.
    ///
    /// Fails if `phys` is not frame aligned or the frame is not fully inside
    /// the HAL's physical-memory window.
    ///
    /// # Safety
    /// `phys` must hold a page table (or a frame about to become one) and no
    /// other reference to that frame may be used while the returned one lives.
    pub unsafe fn at<'a, H: HAL>(hal: &'a H, phys: PhysAddr) -> Result<&'a mut PageTable, MemoryError> {
        if phys.as_u64() % PAGE_SIZE as u64 != 0 {
            return Err(HalError::Misaligned.into());
        }
        let virt = hal.phys_to_virt(phys)?;
        hal.phys_to_virt(PhysAddr::new(phys.as_u64() + (PAGE_SIZE as u64 - 1)))?;
        Ok(&mut *virt.as_mut_ptr::<PageTable>())
    }

    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Zero out the page table
    pub fn clear(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// PML4 index (bits 47-39)
pub fn pml4_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 39) & 0x1FF) as usize
}

/// PDPT index (bits 38-30)
pub fn pdpt_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 30) & 0x1FF) as usize
}

/// PD index (bits 29-21)
pub fn pd_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 21) & 0x1FF) as usize
}

/// PT index (bits 20-12)
pub fn pt_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u64() >> 12) & 0x1FF) as usize
}

/// Offset inside the page (bits 11-0)
pub fn page_offset(vaddr: VirtAddr) -> u64 {
    vaddr.as_u64() & 0xFFF
}

/// Walk the page tables to translate a virtual address.
///
/// Returns `None` if any level on the path is not present.
///
/// # Safety
/// `root` must be the PML4 of a well-formed hierarchy.
pub unsafe fn translate<H: HAL>(hal: &H, root: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
    let pml4 = PageTable::at(hal, root).ok()?;
    let pml4e = pml4.entry(pml4_index(vaddr));
    if !pml4e.is_present() {
        return None;
    }

    let pdpt = PageTable::at(hal, pml4e.phys_addr()).ok()?;
    let pdpte = pdpt.entry(pdpt_index(vaddr));
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_huge() {
        let offset = vaddr.as_u64() & 0x3FFF_FFFF;
        return Some(PhysAddr::new(pdpte.phys_addr().as_u64() + offset));
    }

    let pd = PageTable::at(hal, pdpte.phys_addr()).ok()?;
    let pde = pd.entry(pd_index(vaddr));
    if !pde.is_present() {
        return None;
    }
    if pde.is_huge() {
        let offset = vaddr.as_u64() & 0x1F_FFFF;
        return Some(PhysAddr::new(pde.phys_addr().as_u64() + offset));
    }

    let pt = PageTable::at(hal, pde.phys_addr()).ok()?;
    let pte = pt.entry(pt_index(vaddr));
    if !pte.is_present() {
        return None;
    }

    Some(PhysAddr::new(pte.phys_addr().as_u64() + page_offset(vaddr)))
}

/// Map `vaddr` to `paddr`, creating intermediate tables as needed.
///
/// The leaf is written as `paddr | flags`. New intermediate tables come
/// from `allocate_table`, are zeroed and linked with
/// `PRESENT | WRITABLE | (flags & USER)`. Tables created before a failed
/// allocation stay linked.
///
/// # Safety
/// `root` must be the PML4 of a well-formed hierarchy and `allocate_table`
/// must hand out frames nothing else uses.
pub unsafe fn map_page<H, F>(
    hal: &H,
    root: PhysAddr,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: u64,
    mut allocate_table: F,
) -> Result<(), MemoryError>
where
    H: HAL,
    F: FnMut() -> Option<PhysAddr>,
{
    let link_flags = PageFlags::PRESENT | PageFlags::WRITABLE | (flags & PageFlags::USER);
    let mut table = PageTable::at(hal, root)?;

    for index in [pml4_index(vaddr), pdpt_index(vaddr), pd_index(vaddr)] {
        let entry = table.entry_mut(index);
        let next = if entry.is_present() {
            if entry.is_huge() {
                return Err(MemoryError::HugePageInPath);
            }
            entry.phys_addr()
        } else {
            let frame = allocate_table().ok_or(MemoryError::OutOfFrames)?;
            PageTable::at(hal, frame)?.clear();
            entry.set(frame, link_flags);
            frame
        };
        table = PageTable::at(hal, next)?;
    }

    table.entry_mut(pt_index(vaddr)).set(paddr, flags);
    Ok(())
}

/// Clear the leaf entry for `vaddr`.
///
/// Only the leaf is touched; emptied tables stay linked. Returns the
/// previously mapped frame, or `None` when the path is incomplete.
///
/// # Safety
/// `root` must be the PML4 of a well-formed hierarchy.
pub unsafe fn unmap_page<H: HAL>(hal: &H, root: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
    let mut table = PageTable::at(hal, root).ok()?;
    for index in [pml4_index(vaddr), pdpt_index(vaddr), pd_index(vaddr)] {
        let entry = table.entry(index);
        if !entry.is_present() || entry.is_huge() {
            return None;
        }
        table = PageTable::at(hal, entry.phys_addr()).ok()?;
    }

    let pte = table.entry_mut(pt_index(vaddr));
    if !pte.is_present() {
        return None;
    }
    let phys = pte.phys_addr();
    pte.clear();
    Some(phys)
}
