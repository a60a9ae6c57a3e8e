//! The kernel and process heaps.
//!
//! A [`MemoryManager`] carves byte-granular allocations out of page-sized
//! ranges it gets from a [`HeapSource`], normally an address space's
//! [`VirtualMemoryManager`](crate::memory::virtual_memory::VirtualMemoryManager).
//! Chunks form one address-ordered doubly linked list, each preceded by a
//! [`MemoryChunk`] header. Allocation is first fit with splitting; freeing
//! merges with physically adjacent free neighbours.
//!
//! The module also keeps track of the kernel heap and of the heap that
//! [`malloc`] currently serves, and provides the kernel's global allocator.

use core::{
    alloc::{GlobalAlloc, Layout},
    marker::PhantomData,
    mem::size_of,
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard, Once};
use x86_64::VirtAddr;

use crate::{
    constants::memory::{CHUNK_ALIGNMENT, HEAP_GROWTH},
    memory::{
        address::checked_align_to_page, error::MemoryError,
        virtual_memory::VirtualMemoryManager, without_interrupts,
    },
};

/// Where a heap gets more memory from.
pub trait HeapSource {
    /// Returns a fresh, writable range of `size` bytes, a multiple of the page size.
    fn grow(&mut self, size: usize) -> Result<VirtAddr, MemoryError>;
}

const ALLOCATED: usize = 1;
/// Chunk sizes live in the low 48 bits of the size word.
const SIZE_MASK: usize = (1 << 48) - 1;
/// Top bits of the size word of a live header. Cleared when a merge absorbs the header.
const CHUNK_MAGIC: usize = 0xC4A1 << 48;

/// Header in front of every heap chunk. The low bit of `size` marks the chunk
/// as allocated and the top bits carry [`CHUNK_MAGIC`]; sizes are always
/// multiples of [`CHUNK_ALIGNMENT`].
#[repr(C)]
pub struct MemoryChunk {
    prev: *mut MemoryChunk,
    next: *mut MemoryChunk,
    size: usize,
}

pub const HEADER_SIZE: usize = size_of::<MemoryChunk>();

impl MemoryChunk {
    fn new(prev: *mut MemoryChunk, next: *mut MemoryChunk, size: usize) -> Self {
        Self {
            prev,
            next,
            size: CHUNK_MAGIC | size,
        }
    }

    fn is_valid(&self) -> bool {
        self.size & !SIZE_MASK == CHUNK_MAGIC
    }

    fn size(&self) -> usize {
        self.size & SIZE_MASK & !ALLOCATED
    }

    fn set_size(&mut self, size: usize) {
        self.size = CHUNK_MAGIC | size | (self.size & ALLOCATED);
    }

    fn is_allocated(&self) -> bool {
        self.size & ALLOCATED != 0
    }

    fn set_allocated(&mut self, allocated: bool) {
        if allocated {
            self.size |= ALLOCATED;
        } else {
            self.size &= !ALLOCATED;
        }
    }

    fn data(&mut self) -> *mut u8 {
        (self as *mut Self as usize + HEADER_SIZE) as *mut u8
    }
}

/// A snapshot of one chunk, as seen by [`MemoryManager::chunks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Address of the chunk's first usable byte.
    pub address: usize,
    pub size: usize,
    pub allocated: bool,
}

pub struct MemoryManager<S: HeapSource> {
    first: *mut MemoryChunk,
    last: *mut MemoryChunk,
    source: S,
    /// Bounds of every range obtained from `source`.
    lowest: usize,
    highest: usize,
    memory_used: usize,
    growth: usize,
}

// The chunk list lives in memory owned by `source` and is only reached through `&mut self`.
unsafe impl<S: HeapSource + Send> Send for MemoryManager<S> {}

impl<S: HeapSource> MemoryManager<S> {
    /// An empty heap. Memory is requested from `source` on first use.
    pub const fn new(source: S) -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            source,
            lowest: usize::MAX,
            highest: 0,
            memory_used: 0,
            growth: HEAP_GROWTH,
        }
    }

    /// Rounds a request up to [`CHUNK_ALIGNMENT`].
    pub const fn align(size: usize) -> Option<usize> {
        match size.checked_add(CHUNK_ALIGNMENT - 1) {
            Some(padded) => Some(padded & !(CHUNK_ALIGNMENT - 1)),
            None => None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Gives the source back. Every chunk becomes unreachable.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Bytes currently handed out, headers excluded.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    /// Whether `pointer` lies in memory this heap obtained.
    pub fn owns(&self, pointer: *const u8) -> bool {
        (self.lowest..self.highest).contains(&(pointer as usize))
    }

    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            chunk: self.first,
            _marker: PhantomData,
        }
    }

    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let size = Self::align(size)
            .filter(|&size| size <= SIZE_MASK)
            .ok_or(MemoryError::OutOfMemory)?;

        if let Some(chunk) = self.find_fit(size) {
            return Ok(self.claim(chunk, size));
        }

        self.expand_heap(size)?;
        match self.find_fit(size) {
            Some(chunk) => Ok(self.claim(chunk, size)),
            None => Err(MemoryError::OutOfMemory),
        }
    }

    pub fn free(&mut self, pointer: NonNull<u8>) -> Result<(), MemoryError> {
        let address = pointer.as_ptr() as usize;
        if address % CHUNK_ALIGNMENT != 0
            || address < self.lowest.saturating_add(HEADER_SIZE)
            || address >= self.highest
        {
            return Err(MemoryError::InvalidFree);
        }

        let mut chunk = (address - HEADER_SIZE) as *mut MemoryChunk;
        // SAFETY: the header candidate lies inside memory this heap obtained.
        if !unsafe { (*chunk).is_valid() } {
            log::error!("Free of {:#x}: no chunk header", address);
            return Err(MemoryError::InvalidFree);
        }
        if cfg!(debug_assertions) && !self.chunks_raw().any(|known| known == chunk) {
            return Err(MemoryError::InvalidFree);
        }

        // SAFETY: `chunk` carries a live header of this heap.
        unsafe {
            if !(*chunk).is_allocated() {
                return Err(MemoryError::InvalidFree);
            }
            (*chunk).set_allocated(false);
            self.memory_used -= (*chunk).size();

            let prev = (*chunk).prev;
            if !prev.is_null() && !(*prev).is_allocated() && Self::adjacent(prev, chunk) {
                self.merge_with_next(prev);
                chunk = prev;
            }

            let next = (*chunk).next;
            if !next.is_null() && !(*next).is_allocated() && Self::adjacent(chunk, next) {
                self.merge_with_next(chunk);
            }
        }
        Ok(())
    }

    /// First chunk that is free and strictly larger than `size`.
    fn find_fit(&self, size: usize) -> Option<*mut MemoryChunk> {
        // SAFETY: the walk only visits headers of this heap.
        self.chunks_raw()
            .find(|&chunk| unsafe { !(*chunk).is_allocated() && (*chunk).size() > size })
    }

    /// Marks `chunk` allocated, splitting off the tail when it can hold
    /// another header and at least one byte.
    fn claim(&mut self, chunk: *mut MemoryChunk, size: usize) -> NonNull<u8> {
        // SAFETY: `chunk` is a free header of this heap that is larger than `size`.
        unsafe {
            let current = &mut *chunk;
            if current.size() >= size + HEADER_SIZE + 1 {
                let rest = (chunk as usize + HEADER_SIZE + size) as *mut MemoryChunk;
                rest.write(MemoryChunk::new(
                    chunk,
                    current.next,
                    current.size() - size - HEADER_SIZE,
                ));

                if current.next.is_null() {
                    self.last = rest;
                } else {
                    (*current.next).prev = rest;
                }
                current.next = rest;
                current.set_size(size);
            }

            current.set_allocated(true);
            self.memory_used += current.size();
            NonNull::new_unchecked(current.data())
        }
    }

    /// Gets enough memory from the source for a `size` byte chunk.
    fn expand_heap(&mut self, size: usize) -> Result<(), MemoryError> {
        let request = size
            .checked_add(HEADER_SIZE + CHUNK_ALIGNMENT)
            .and_then(checked_align_to_page)
            .ok_or(MemoryError::OutOfMemory)?
            .max(self.growth);

        let start = self.source.grow(request)?.as_u64() as usize;
        log::trace!("Heap grew by {:#x} bytes at {:#x}", request, start);

        // SAFETY: the source just handed this range over exclusively.
        unsafe { self.add_range(start, request) };
        Ok(())
    }

    /// Links [start, start + length) into the list as one free chunk, keeping
    /// the list address ordered and merging with adjacent free chunks.
    unsafe fn add_range(&mut self, start: usize, length: usize) {
        let chunk = start as *mut MemoryChunk;

        let mut prev = self.last;
        while !prev.is_null() && prev as usize > start {
            prev = (*prev).prev;
        }
        let next = if prev.is_null() {
            self.first
        } else {
            (*prev).next
        };

        chunk.write(MemoryChunk::new(prev, next, length - HEADER_SIZE));
        if prev.is_null() {
            self.first = chunk;
        } else {
            (*prev).next = chunk;
        }
        if next.is_null() {
            self.last = chunk;
        } else {
            (*next).prev = chunk;
        }

        if !next.is_null() && !(*next).is_allocated() && Self::adjacent(chunk, next) {
            self.merge_with_next(chunk);
        }
        if !prev.is_null() && !(*prev).is_allocated() && Self::adjacent(prev, chunk) {
            self.merge_with_next(prev);
        }

        self.lowest = self.lowest.min(start);
        self.highest = self.highest.max(start + length);
    }

    /// Whether `second` starts right where `first` ends.
    unsafe fn adjacent(first: *mut MemoryChunk, second: *mut MemoryChunk) -> bool {
        first as usize + HEADER_SIZE + (*first).size() == second as usize
    }

    /// Absorbs the chunk after `chunk` into it.
    unsafe fn merge_with_next(&mut self, chunk: *mut MemoryChunk) {
        let next = (*chunk).next;
        (*chunk).set_size((*chunk).size() + HEADER_SIZE + (*next).size());
        (*chunk).next = (*next).next;
        if (*next).next.is_null() {
            self.last = chunk;
        } else {
            (*(*next).next).prev = chunk;
        }
        (*next).size = 0;
    }

    fn chunks_raw(&self) -> impl Iterator<Item = *mut MemoryChunk> + '_ {
        let mut chunk = self.first;
        core::iter::from_fn(move || {
            if chunk.is_null() {
                return None;
            }
            let current = chunk;
            // SAFETY: non-null list links point at headers of this heap.
            chunk = unsafe { (*chunk).next };
            Some(current)
        })
    }
}

pub struct Chunks<'a> {
    chunk: *mut MemoryChunk,
    _marker: PhantomData<&'a MemoryChunk>,
}

impl Iterator for Chunks<'_> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<ChunkInfo> {
        if self.chunk.is_null() {
            return None;
        }

        // SAFETY: the iterator borrows the heap, so the list cannot change.
        let chunk = unsafe { &mut *self.chunk };
        self.chunk = chunk.next;
        Some(ChunkInfo {
            address: chunk.data() as usize,
            size: chunk.size(),
            allocated: chunk.is_allocated(),
        })
    }
}

/// A heap that can be shared between cores and registered globally.
pub trait Heap: Sync {
    fn malloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError>;
    fn free(&self, pointer: NonNull<u8>) -> Result<(), MemoryError>;
    fn owns(&self, pointer: *const u8) -> bool;
    fn memory_used(&self) -> usize;
}

/// A [`MemoryManager`] behind a spinlock, taken with interrupts masked.
pub struct LockedMemoryManager<S: HeapSource>(Mutex<MemoryManager<S>>);

impl<S: HeapSource> LockedMemoryManager<S> {
    pub const fn new(manager: MemoryManager<S>) -> Self {
        Self(Mutex::new(manager))
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryManager<S>> {
        self.0.lock()
    }

    pub fn into_inner(self) -> MemoryManager<S> {
        self.0.into_inner()
    }
}

impl<S: HeapSource + Send> Heap for LockedMemoryManager<S> {
    fn malloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        without_interrupts(|| self.0.lock().malloc(size))
    }

    fn free(&self, pointer: NonNull<u8>) -> Result<(), MemoryError> {
        without_interrupts(|| self.0.lock().free(pointer))
    }

    fn owns(&self, pointer: *const u8) -> bool {
        without_interrupts(|| self.0.lock().owns(pointer))
    }

    fn memory_used(&self) -> usize {
        without_interrupts(|| self.0.lock().memory_used())
    }
}

pub type KernelHeap = LockedMemoryManager<VirtualMemoryManager>;

#[derive(Clone, Copy)]
struct HeapHandle(NonNull<dyn Heap>);

// Registered heaps are `Sync` and outlive their registration.
unsafe impl Send for HeapHandle {}

impl HeapHandle {
    fn new(heap: &(dyn Heap + 'static)) -> Self {
        Self(NonNull::from(heap))
    }

    fn get(&self) -> &dyn Heap {
        // SAFETY: a handle is only reachable while its heap is registered.
        unsafe { self.0.as_ref() }
    }

    fn is(&self, heap: &dyn Heap) -> bool {
        ptr::addr_eq(self.0.as_ptr() as *const dyn Heap, heap as *const dyn Heap)
    }
}

static KERNEL_HEAP: Once<KernelHeap> = Once::new();
static KERNEL_MEMORY_MANAGER: Mutex<Option<HeapHandle>> = Mutex::new(None);
static ACTIVE_MEMORY_MANAGER: Mutex<Option<HeapHandle>> = Mutex::new(None);

/// Builds the kernel heap on top of the kernel address space and makes it
/// both the kernel and the active heap.
pub fn init_kernel_heap(vmm: VirtualMemoryManager) -> &'static KernelHeap {
    if KERNEL_HEAP.is_completed() {
        log::warn!("Kernel heap already initialized");
    }

    let heap = KERNEL_HEAP.call_once(|| LockedMemoryManager::new(MemoryManager::new(vmm)));
    // SAFETY: the kernel heap lives for the rest of the kernel's lifetime.
    unsafe { set_kernel_memory_manager(heap) };
    log::info!("Kernel heap initialized");
    heap
}

/// The heap built by [`init_kernel_heap`].
pub fn kernel_heap() -> Option<&'static KernelHeap> {
    KERNEL_HEAP.get()
}

/// Registers `manager` as the kernel heap, and as the active one if there is none.
///
/// # Safety
/// `manager` must stay alive and in place for as long as it is registered.
pub unsafe fn set_kernel_memory_manager(manager: &(dyn Heap + 'static)) {
    let handle = HeapHandle::new(manager);
    without_interrupts(|| {
        *KERNEL_MEMORY_MANAGER.lock() = Some(handle);
        ACTIVE_MEMORY_MANAGER.lock().get_or_insert(handle);
    });
}

/// Makes `manager` the heap [`malloc`] serves, or falls back to the kernel
/// heap when `None`.
///
/// # Safety
/// `manager` must stay alive and in place for as long as it is active.
pub unsafe fn set_active_memory_manager(manager: Option<&(dyn Heap + 'static)>) {
    let handle = manager.map(HeapHandle::new);
    without_interrupts(|| *ACTIVE_MEMORY_MANAGER.lock() = handle);
}

/// Whether `manager` is the heap [`malloc`] currently serves.
pub fn is_active_memory_manager(manager: &dyn Heap) -> bool {
    active_memory_manager().is_some_and(|handle| handle.is(manager))
}

/// Restores the previously active heap when dropped.
#[must_use]
pub struct ActiveMemoryManagerGuard<'a> {
    previous: Option<HeapHandle>,
    _heap: PhantomData<&'a dyn Heap>,
}

impl Drop for ActiveMemoryManagerGuard<'_> {
    fn drop(&mut self) {
        let previous = self.previous;
        without_interrupts(|| *ACTIVE_MEMORY_MANAGER.lock() = previous);
    }
}

/// Makes `manager` active until the returned guard is dropped.
///
/// # Safety
/// The guard must be dropped, not leaked, before `manager` goes away.
pub unsafe fn switch_active_memory_manager<'a>(
    manager: &'a (dyn Heap + 'static),
) -> ActiveMemoryManagerGuard<'a> {
    let handle = HeapHandle::new(manager);
    let previous =
        without_interrupts(|| ACTIVE_MEMORY_MANAGER.lock().replace(handle));
    ActiveMemoryManagerGuard {
        previous,
        _heap: PhantomData,
    }
}

/// Runs `f` with `manager` as the active heap.
pub fn with_memory_manager<R>(manager: &(dyn Heap + 'static), f: impl FnOnce() -> R) -> R {
    // SAFETY: the guard is dropped at the end of this scope, inside the borrow of `manager`.
    let _guard = unsafe { switch_active_memory_manager(manager) };
    f()
}

fn active_memory_manager() -> Option<HeapHandle> {
    without_interrupts(|| {
        let active = *ACTIVE_MEMORY_MANAGER.lock();
        active.or_else(|| *KERNEL_MEMORY_MANAGER.lock())
    })
}

fn kernel_memory_manager() -> Option<HeapHandle> {
    without_interrupts(|| *KERNEL_MEMORY_MANAGER.lock())
}

/// Allocates from the active heap.
pub fn malloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    active_memory_manager()
        .ok_or(MemoryError::OutOfMemory)?
        .get()
        .malloc(size)
}

/// Frees memory from whichever registered heap owns it.
pub fn free(pointer: NonNull<u8>) -> Result<(), MemoryError> {
    let candidates = [active_memory_manager(), kernel_memory_manager()];
    for handle in candidates.into_iter().flatten() {
        if handle.get().owns(pointer.as_ptr()) {
            return handle.get().free(pointer);
        }
    }
    Err(MemoryError::InvalidFree)
}

/// Allocates from the kernel heap, whichever heap is active.
pub fn kmalloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
    kernel_memory_manager()
        .ok_or(MemoryError::OutOfMemory)?
        .get()
        .malloc(size)
}

pub fn kfree(pointer: NonNull<u8>) -> Result<(), MemoryError> {
    kernel_memory_manager()
        .ok_or(MemoryError::InvalidFree)?
        .get()
        .free(pointer)
}

/// Global allocator routing through [`malloc`] and [`free`].
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= CHUNK_ALIGNMENT {
            return malloc(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate and keep the chunk's own address just below the aligned block.
        let Some(padded) = layout
            .size()
            .checked_add(layout.align() + size_of::<usize>())
        else {
            return ptr::null_mut();
        };
        let Ok(raw) = malloc(padded) else {
            return ptr::null_mut();
        };

        let raw = raw.as_ptr() as usize;
        let aligned = (raw + size_of::<usize>()).next_multiple_of(layout.align());
        ((aligned - size_of::<usize>()) as *mut usize).write(raw);
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, pointer: *mut u8, layout: Layout) {
        let raw = if layout.align() <= CHUNK_ALIGNMENT {
            pointer
        } else {
            ((pointer as usize - size_of::<usize>()) as *const usize).read() as *mut u8
        };

        if let Some(raw) = NonNull::new(raw) {
            if let Err(err) = free(raw) {
                log::error!("Dealloc of {:p} failed: {}", pointer, err);
            }
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
pub(crate) fn clear_registry() {
    *KERNEL_MEMORY_MANAGER.lock() = None;
    *ACTIVE_MEMORY_MANAGER.lock() = None;
}
