//! Kernel heap
//!
//! First-fit allocator over one fixed arena. Each block is a 32-byte header
//! followed by its payload; headers are chained in ascending address order
//! and together with their payloads cover the arena exactly.
//!
//! Header layout (little-endian):
//!
//! | Offset | Field |
//! |--------|-------|
//! | +0  | magic `0xDEADBEEF` (u32) |
//! | +4  | free flag (u32) |
//! | +8  | payload size (u64) |
//! | +16 | next header offset (u64, `u64::MAX` = none) |
//! | +24 | reserved |
//!
//! Blocks are named by [`HeapBlock`], the payload's offset in the arena.

use core::alloc::{GlobalAlloc, Layout};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use lumen_hal::IrqMutex;

use crate::config::HEAP_ALIGN;
use crate::error::MemoryError;

/// Bytes of header in front of every payload
pub const HEADER_SIZE: usize = 32;

const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// Smallest payload a split may leave behind
const MIN_SPLIT: usize = 16;

const NO_NEXT: u64 = u64::MAX;

/// Handle to an allocated payload (its byte offset in the arena)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapBlock(usize);

impl HeapBlock {
    /// Payload offset from the start of the arena
    pub fn offset(&self) -> usize {
        self.0
    }
}

/// One block as seen by [`KernelHeap::blocks`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub block: HeapBlock,
    /// Payload capacity in bytes
    pub size: usize,
    pub free: bool,
}

#[derive(Clone, Copy)]
struct Header {
    magic: u32,
    free: bool,
    size: usize,
    next: Option<usize>,
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

/// First-fit heap over a borrowed arena
pub struct KernelHeap<'a> {
    base: NonNull<u8>,
    len: usize,
    _arena: PhantomData<&'a mut [u8]>,
}

// The heap has exclusive use of its arena.
unsafe impl Send for KernelHeap<'_> {}

impl<'a> KernelHeap<'a> {
    /// Format `arena` as a single free block.
    ///
    /// The usable length is rounded down to a multiple of 16. An arena
    /// shorter than one header holds no blocks.
    pub fn new(arena: &'a mut [u8]) -> Self {
        let len = arena.len() & !(HEAP_ALIGN - 1);
        let mut heap = Self {
            base: NonNull::from(arena).cast(),
            len,
            _arena: PhantomData,
        };
        if len >= HEADER_SIZE {
            heap.write_header(
                0,
                &Header {
                    magic: HEAP_MAGIC,
                    free: true,
                    size: len - HEADER_SIZE,
                    next: None,
                },
            );
        }
        heap
    }

    /// Usable arena size in bytes
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Allocate `size` bytes (rounded up to 16).
    ///
    /// Zero-size requests return `Ok(None)` without touching the list.
    pub fn allocate(&mut self, size: usize) -> Result<Option<HeapBlock>, MemoryError> {
        if size == 0 {
            return Ok(None);
        }
        let size = size
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or(MemoryError::HeapExhausted)?;

        let mut cursor = self.first();
        while let Some(offset) = cursor {
            let mut header = self.read_header(offset);
            if header.free && header.size >= size {
                if header.size >= size + HEADER_SIZE + MIN_SPLIT {
                    let split = offset + HEADER_SIZE + size;
                    self.write_header(
                        split,
                        &Header {
                            magic: HEAP_MAGIC,
                            free: true,
                            size: header.size - size - HEADER_SIZE,
                            next: header.next,
                        },
                    );
                    header.size = size;
                    header.next = Some(split);
                }
                header.free = false;
                self.write_header(offset, &header);
                return Ok(Some(HeapBlock(offset + HEADER_SIZE)));
            }
            cursor = header.next;
        }

        Err(MemoryError::HeapExhausted)
    }

    /// Release `block` and merge it with free neighbours.
    ///
    /// Handles that do not name a live allocated block (bad tag, out of
    /// range, already free) are ignored.
    pub fn free(&mut self, block: HeapBlock) {
        let Some((offset, mut header)) = self.find(block) else {
            return;
        };
        if header.free {
            return;
        }
        header.free = true;
        self.write_header(offset, &header);
        self.coalesce();
    }

    /// Payload bytes of a live allocation
    pub fn payload(&self, block: HeapBlock) -> Option<&[u8]> {
        let (_, header) = self.find(block).filter(|(_, h)| !h.free)?;
        Some(unsafe { core::slice::from_raw_parts(self.payload_ptr(block), header.size) })
    }

    /// Mutable payload bytes of a live allocation
    pub fn payload_mut(&mut self, block: HeapBlock) -> Option<&mut [u8]> {
        let (_, header) = self.find(block).filter(|(_, h)| !h.free)?;
        Some(unsafe { core::slice::from_raw_parts_mut(self.payload_ptr(block), header.size) })
    }

    /// Address of the payload in the kernel's address space
    pub fn address_of(&self, block: HeapBlock) -> usize {
        self.base.as_ptr() as usize + block.0
    }

    /// Handle for a payload pointer previously produced by this heap
    pub fn block_at(&self, ptr: *const u8) -> Option<HeapBlock> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (offset < self.len).then_some(HeapBlock(offset))
    }

    fn payload_ptr(&self, block: HeapBlock) -> *mut u8 {
        self.base.as_ptr().wrapping_add(block.0)
    }

    /// Every block in address order
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cursor = self.first();
        core::iter::from_fn(move || {
            let offset = cursor?;
            let header = self.read_header(offset);
            cursor = header.next;
            Some(BlockInfo {
                block: HeapBlock(offset + HEADER_SIZE),
                size: header.size,
                free: header.free,
            })
        })
    }

    /// Payload bytes available across all free blocks
    pub fn free_bytes(&self) -> usize {
        self.blocks().filter(|b| b.free).map(|b| b.size).sum()
    }

    /// Payload bytes held by allocations
    pub fn used_bytes(&self) -> usize {
        self.blocks().filter(|b| !b.free).map(|b| b.size).sum()
    }

    /// Largest request that would currently succeed
    pub fn largest_free(&self) -> usize {
        self.blocks().filter(|b| b.free).map(|b| b.size).max().unwrap_or(0)
    }

    fn first(&self) -> Option<usize> {
        (self.len >= HEADER_SIZE).then_some(0)
    }

    /// Read the header in front of `block`.
    ///
    /// Besides the tag, the header must agree with the chain: its payload
    /// ends where its `next` link starts, or at the end of the arena.
    fn find(&self, block: HeapBlock) -> Option<(usize, Header)> {
        let target = block.0.checked_sub(HEADER_SIZE)?;
        if target % HEAP_ALIGN != 0 || block.0 > self.len {
            return None;
        }
        let header = self.read_header(target);
        if header.magic != HEAP_MAGIC {
            return None;
        }
        let end = block.0.checked_add(header.size)?;
        let linked = match header.next {
            Some(next) => next == end,
            None => end == self.len,
        };
        linked.then_some((target, header))
    }

    fn coalesce(&mut self) {
        let mut cursor = self.first();
        while let Some(offset) = cursor {
            let mut header = self.read_header(offset);
            let Some(next_offset) = header.next else {
                break;
            };
            let next = self.read_header(next_offset);
            if header.free && next.free && offset + HEADER_SIZE + header.size == next_offset {
                header.size += HEADER_SIZE + next.size;
                header.next = next.next;
                self.write_header(offset, &header);
                // The absorbed header must not validate again.
                self.wipe_header(next_offset);
                continue;
            }
            cursor = Some(next_offset);
        }
    }

    fn read_header(&self, offset: usize) -> Header {
        debug_assert!(offset + HEADER_SIZE <= self.len);
        let raw = unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<[u8; HEADER_SIZE]>()
                .read_unaligned()
        };

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&raw[0..4]);
        let next = le_u64(&raw[16..]);
        // A link must move forward and stay inside the arena.
        let next = usize::try_from(next)
            .ok()
            .filter(|&n| {
                next != NO_NEXT
                    && n > offset
                    && n.checked_add(HEADER_SIZE).is_some_and(|end| end <= self.len)
            });

        Header {
            magic: u32::from_le_bytes(magic),
            free: raw[4] != 0,
            size: le_u64(&raw[8..]) as usize,
            next,
        }
    }

    fn write_header(&mut self, offset: usize, header: &Header) {
        debug_assert!(offset + HEADER_SIZE <= self.len);
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&header.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&(header.free as u32).to_le_bytes());
        raw[8..16].copy_from_slice(&(header.size as u64).to_le_bytes());
        let next = header.next.map_or(NO_NEXT, |n| n as u64);
        raw[16..24].copy_from_slice(&next.to_le_bytes());
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<[u8; HEADER_SIZE]>()
                .write_unaligned(raw)
        };
    }

    fn wipe_header(&mut self, offset: usize) {
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), 0, HEADER_SIZE) };
    }
}

/// The kernel heap behind an interrupt-masking lock.
///
/// Serves both explicit kernel allocations (process stacks) and, when
/// installed as `#[global_allocator]`, everything in `alloc`.
pub struct LockedHeap {
    heap: IrqMutex<Option<KernelHeap<'static>>>,
}

impl LockedHeap {
    /// A heap with no arena yet; every allocation fails until [`LockedHeap::init`]
    pub const fn empty() -> Self {
        Self {
            heap: IrqMutex::new(None),
        }
    }

    /// Hand `arena` to the heap.
    ///
    /// The start is moved up to a 16-byte boundary so every payload is
    /// 16-byte aligned. A second call is ignored.
    pub fn init(&self, arena: &'static mut [u8]) {
        let mut heap = self.heap.lock();
        if heap.is_some() {
            return;
        }
        let skip = arena.as_ptr().align_offset(HEAP_ALIGN).min(arena.len());
        *heap = Some(KernelHeap::new(&mut arena[skip..]));
    }

    /// Run `f` on the heap with the lock held
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelHeap<'static>) -> R) -> Option<R> {
        self.heap.lock().as_mut().map(f)
    }

    pub fn allocate(&self, size: usize) -> Result<Option<HeapBlock>, MemoryError> {
        self.with(|heap| heap.allocate(size))
            .unwrap_or(Err(MemoryError::HeapExhausted))
    }

    pub fn free(&self, block: HeapBlock) {
        self.with(|heap| heap.free(block));
    }

    pub fn address_of(&self, block: HeapBlock) -> Option<usize> {
        self.with(|heap| heap.address_of(block))
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        self.with(|heap| match heap.allocate(layout.size()) {
            Ok(Some(block)) => heap.payload_ptr(block),
            _ => ptr::null_mut(),
        })
        .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with(|heap| {
            if let Some(block) = heap.block_at(ptr) {
                heap.free(block);
            }
        });
    }
}

#[cfg(test)]
#[path = "heap_tests.rs"]
mod heap_tests;
