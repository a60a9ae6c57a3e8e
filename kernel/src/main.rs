#![no_std]
#![no_main]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use limine::{
    request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker},
    BaseRevision,
};
use x86_64::{registers::control::Cr3, VirtAddr};

use maxos::{
    debug_println, idle_loop, logging,
    memory::{
        self,
        boot_memory_map::BootMemoryMap,
        heap::{self, Heap},
    },
    serial_println,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

#[no_mangle]
extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    logging::init(0);
    serial_println!("Booting MaxOS...");

    let memory_map_response = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let hhdm_response = HHDM_REQUEST.get_response().expect("HHDM request failed");

    let memory_map = BootMemoryMap::from_limine(memory_map_response);
    let hhdm_offset = VirtAddr::new(hhdm_response.offset());
    let (pml4_frame, _) = Cr3::read();

    let kernel_heap = unsafe { memory::init(&memory_map, hhdm_offset, pml4_frame.start_address()) }
        .expect("Failed to initialize memory management");

    heap_self_check();
    log::info!("Kernel heap in use: {} bytes", kernel_heap.memory_used());

    serial_println!("BSP entering idle loop");
    idle_loop();
}

/// Exercises the global allocator and the kernel heap once at boot.
fn heap_self_check() {
    let boxed = Box::new(0xC0FF_EE00_u64);
    let numbers: Vec<u64> = (0..1024).collect();
    debug_println!("Heap object allocated at: {:p}", Box::as_ref(&boxed) as *const u64);
    assert_eq!(numbers.iter().sum::<u64>(), 1023 * 1024 / 2);

    let block = heap::kmalloc(256).expect("kmalloc failed");
    heap::kfree(block).expect("kfree failed");
    log::info!("Heap self-check passed");
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}
