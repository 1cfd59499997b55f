//! Physical Frame Allocator
//!
//! Manages physical memory frames using a bitmap allocator.
//! Frame `i` covers physical addresses `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`.
//!
//! Every frame starts out allocated. Frames only become available once the
//! boot code hands over the usable ranges of the memory map through
//! [`FrameAllocator::seed`] or [`FrameAllocator::release_region`].

use alloc::vec::Vec;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::{MemoryRegionDescriptor, MemoryRegionKind};
use crate::config::PAGE_SIZE;
use crate::error::MemoryError;

/// Physical frame allocator using a bitmap
pub struct FrameAllocator {
    /// Bitmap of frames (1 = allocated, 0 = free)
    bitmap: Vec<u64>,
    /// Total number of frames
    total_frames: usize,
    /// Number of free frames
    free_frames: usize,
}

impl FrameAllocator {
    /// Create an allocator over `total_memory` bytes using `bitmap` as storage.
    ///
    /// The storage needs one bit per frame. Every frame is marked allocated.
    pub fn new(mut bitmap: Vec<u64>, total_memory: u64) -> Result<Self, MemoryError> {
        let total_frames = (total_memory / PAGE_SIZE as u64) as usize;
        let words = total_frames.div_ceil(64);
        if bitmap.len() < words {
            return Err(MemoryError::BitmapTooSmall);
        }
        bitmap.truncate(words);
        bitmap.fill(u64::MAX);

        Ok(Self {
            bitmap,
            total_frames,
            free_frames: 0,
        })
    }

    /// Create an allocator over `total_memory` bytes with its own bitmap storage
    pub fn with_memory(total_memory: u64) -> Self {
        let total_frames = (total_memory / PAGE_SIZE as u64) as usize;
        Self {
            bitmap: alloc::vec![u64::MAX; total_frames.div_ceil(64)],
            total_frames,
            free_frames: 0,
        }
    }

    /// Hand the usable regions of a boot memory map to the allocator.
    ///
    /// Usable regions are released first, then every other region is
    /// reserved again, so a frame reported both ways stays allocated.
    pub fn seed(&mut self, regions: &[MemoryRegionDescriptor]) {
        for region in regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
            self.release_region(region.start, region.size);
        }
        for region in regions.iter().filter(|r| r.kind != MemoryRegionKind::Usable) {
            self.reserve_region(region.start, region.size);
        }
    }

    /// Mark every frame lying entirely inside `[start, start + size)` as free.
    ///
    /// Returns the number of frames that changed state.
    pub fn release_region(&mut self, start: u64, size: u64) -> usize {
        let page = PAGE_SIZE as u64;
        let first = start.div_ceil(page) as usize;
        let end = (start.saturating_add(size) / page) as usize;
        let end = end.min(self.total_frames);

        let mut released = 0;
        for idx in first..end {
            if self.test(idx) {
                self.clear(idx);
                self.free_frames += 1;
                released += 1;
            }
        }
        released
    }

    /// Mark every frame touching `[start, start + size)` as allocated.
    ///
    /// Returns the number of frames that changed state.
    pub fn reserve_region(&mut self, start: u64, size: u64) -> usize {
        let page = PAGE_SIZE as u64;
        let first = (start / page) as usize;
        let end = start.saturating_add(size).div_ceil(page) as usize;
        let end = end.min(self.total_frames);

        let mut reserved = 0;
        for idx in first..end {
            if !self.test(idx) {
                self.set(idx);
                self.free_frames -= 1;
                reserved += 1;
            }
        }
        reserved
    }

    /// Allocate a single physical frame (lowest free index first)
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit_idx = (!*word).trailing_zeros() as usize;
            let frame_idx = word_idx * 64 + bit_idx;
            if frame_idx >= self.total_frames {
                break;
            }

            *word |= 1 << bit_idx;
            self.free_frames -= 1;

            let phys_addr = (frame_idx * PAGE_SIZE) as u64;
            return Some(PhysFrame::containing_address(PhysAddr::new(phys_addr)));
        }

        None
    }

    /// Free a physical frame.
    ///
    /// Out-of-range or already-free frames are ignored. Returns whether the
    /// frame was actually released.
    pub fn free_frame(&mut self, frame: PhysFrame) -> bool {
        let frame_idx = (frame.start_address().as_u64() / PAGE_SIZE as u64) as usize;
        if frame_idx >= self.total_frames || !self.test(frame_idx) {
            return false;
        }
        self.clear(frame_idx);
        self.free_frames += 1;
        true
    }

    /// Check whether the frame containing `phys` is allocated
    pub fn is_allocated(&self, phys: PhysAddr) -> bool {
        let frame_idx = (phys.as_u64() / PAGE_SIZE as u64) as usize;
        frame_idx < self.total_frames && self.test(frame_idx)
    }

    /// Get the number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Get the total number of frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> u64 {
        (self.free_frames * PAGE_SIZE) as u64
    }

    /// Bytes currently allocated
    pub fn used_bytes(&self) -> u64 {
        ((self.total_frames - self.free_frames) * PAGE_SIZE) as u64
    }

    #[inline]
    fn test(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    fn frame(idx: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(idx * PAGE_SIZE as u64))
    }

    fn fully_free(frames: u64) -> FrameAllocator {
        let bytes = frames * PAGE_SIZE as u64;
        let mut allocator = FrameAllocator::with_memory(bytes);
        allocator.release_region(0, bytes);
        allocator
    }

    #[test]
    fn test_starts_fully_allocated() {
        let mut allocator = FrameAllocator::with_memory(0x10000);
        assert_eq!(allocator.total_frames(), 16);
        assert_eq!(allocator.free_frames(), 0);
        assert_eq!(allocator.used_bytes(), 0x10000);
        assert!(allocator.allocate_frame().is_none());
    }

    #[test]
    fn test_bitmap_too_small() {
        // 65 frames need two words
        let result = FrameAllocator::new(alloc::vec![0u64; 1], 65 * PAGE_SIZE as u64);
        assert_eq!(result.err(), Some(MemoryError::BitmapTooSmall));

        let allocator = FrameAllocator::new(alloc::vec![0u64; 2], 65 * PAGE_SIZE as u64).unwrap();
        assert_eq!(allocator.total_frames(), 65);
        assert_eq!(allocator.free_frames(), 0);
    }

    #[test]
    fn test_four_frames_exhaust_and_reuse() {
        let mut allocator = fully_free(4);

        for idx in 0..4 {
            assert_eq!(allocator.allocate_frame(), Some(frame(idx)));
        }
        assert!(allocator.allocate_frame().is_none());

        assert!(allocator.free_frame(frame(2)));
        assert_eq!(allocator.allocate_frame(), Some(frame(2)));
    }

    #[test]
    fn test_free_invalid_is_noop() {
        let mut allocator = fully_free(4);
        let a = allocator.allocate_frame().unwrap();

        assert!(allocator.free_frame(a));
        // Double free
        assert!(!allocator.free_frame(a));
        // Out of range
        assert!(!allocator.free_frame(frame(100)));
        assert_eq!(allocator.free_frames(), 4);
    }

    #[test]
    fn test_conservation_and_no_double_allocation() {
        let total = 130u64;
        let mut allocator = fully_free(total);
        let total_bytes = total * PAGE_SIZE as u64;
        let mut live = BTreeSet::new();
        let mut seed = 0x2545_F491u64;

        for _ in 0..2000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if seed >> 62 != 0 {
                if let Some(f) = allocator.allocate_frame() {
                    assert!(live.insert(f.start_address().as_u64()), "frame handed out twice");
                }
            } else if let Some(&addr) = live.iter().nth((seed as usize >> 8) % live.len().max(1)) {
                live.remove(&addr);
                assert!(allocator.free_frame(frame(addr / PAGE_SIZE as u64)));
            }
            assert_eq!(allocator.free_bytes() + allocator.used_bytes(), total_bytes);
            assert_eq!(allocator.total_frames() - allocator.free_frames(), live.len());
        }
    }

    #[test]
    fn test_seed_from_memory_map() {
        let mut allocator = FrameAllocator::with_memory(64 * PAGE_SIZE as u64);
        let regions = [
            MemoryRegionDescriptor {
                start: 0,
                size: 32 * PAGE_SIZE as u64,
                kind: MemoryRegionKind::Usable,
            },
            // Unaligned usable range: only whole frames 41..=43 qualify
            MemoryRegionDescriptor {
                start: 40 * PAGE_SIZE as u64 + 1,
                size: 4 * PAGE_SIZE as u64,
                kind: MemoryRegionKind::Usable,
            },
            // Kernel image overlapping the first usable range
            MemoryRegionDescriptor {
                start: 8 * PAGE_SIZE as u64,
                size: 2 * PAGE_SIZE as u64 + 1,
                kind: MemoryRegionKind::Kernel,
            },
        ];

        allocator.seed(&regions);

        assert_eq!(allocator.free_frames(), 32 - 3 + 3);
        assert!(allocator.is_allocated(PhysAddr::new(8 * PAGE_SIZE as u64)));
        assert!(allocator.is_allocated(PhysAddr::new(10 * PAGE_SIZE as u64)));
        assert!(!allocator.is_allocated(PhysAddr::new(11 * PAGE_SIZE as u64)));
        assert!(allocator.is_allocated(PhysAddr::new(40 * PAGE_SIZE as u64)));
        assert!(!allocator.is_allocated(PhysAddr::new(41 * PAGE_SIZE as u64)));
        assert!(allocator.is_allocated(PhysAddr::new(44 * PAGE_SIZE as u64)));
    }
}
