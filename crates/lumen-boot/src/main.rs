//! Lumen OS kernel binary

#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::panic::PanicInfo;
use core::ptr::addr_of_mut;

use bootloader_api::config::Mapping;
use bootloader_api::info::MemoryRegionKind as BootRegionKind;
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use lumen_boot::{region_descriptor, NAME, VERSION};
use lumen_hal::serial_println;
use lumen_hal::x86_64::X86_64Hal;
use lumen_kernel::config::{HEAP_SIZE, PAGE_SIZE, TIMER_FREQUENCY_HZ};
use lumen_kernel::{FrameAllocator, Kernel, KernelConfig, LockedHeap, MemoryRegionKind};

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

#[repr(C, align(16))]
struct HeapArena([u8; HEAP_SIZE]);

static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_SIZE]);

/// Physical memory window and every other dynamic mapping go to the upper
/// half, so the kernel address space can inherit them wholesale.
const BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.mappings.dynamic_range_start = Some(0xFFFF_8000_0000_0000);
    config.kernel_stack_size = 128 * 1024;
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let regions = &boot_info.memory_regions;
    let phys_limit = regions.iter().map(|r| r.end).max().unwrap_or(0);
    let Some(phys_offset) = boot_info.physical_memory_offset.into_option() else {
        halt();
    };

    let hal = X86_64Hal::new(phys_offset, phys_limit);
    serial_println!("{} v{}", NAME, VERSION);
    serial_println!("[boot] physical memory at {:#x}, {} MiB", hal.phys_offset(), phys_limit >> 20);

    // Only reference ever taken to the arena.
    HEAP.init(unsafe { &mut (*addr_of_mut!(HEAP_ARENA)).0 });

    let map: Vec<_> = regions
        .iter()
        .map(|r| region_descriptor(r.start, r.end, region_kind(r.kind)))
        .collect();
    let mut frames = FrameAllocator::with_memory(phys_limit);
    frames.seed(&map);
    // Never hand out physical address 0.
    frames.reserve_region(0, PAGE_SIZE as u64);

    let config = KernelConfig {
        inherit_upper_half: true,
        ..KernelConfig::default()
    };
    let mut kernel = Kernel::new(hal, frames, &HEAP, config);
    if let Err(e) = kernel.init_paging() {
        serial_println!("[boot] {}", e);
        halt();
    }

    let stats = kernel.memory_stats();
    serial_println!(
        "[boot] {} KiB physical free, {} KiB heap free, timer at {} Hz",
        stats.phys_free_bytes / 1024,
        stats.heap_free_bytes / 1024,
        TIMER_FREQUENCY_HZ
    );

    loop {
        kernel.reap();
        x86_64::instructions::hlt();
    }
}

fn region_kind(kind: BootRegionKind) -> MemoryRegionKind {
    match kind {
        BootRegionKind::Usable => MemoryRegionKind::Usable,
        BootRegionKind::Bootloader => MemoryRegionKind::Bootloader,
        BootRegionKind::UnknownBios(_) | BootRegionKind::UnknownUefi(_) => MemoryRegionKind::Reserved,
        _ => MemoryRegionKind::Unknown,
    }
}

fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[boot] PANIC: {}", info);
    halt();
}
