//! Kernel heap: a size-class slab allocator behind `kmalloc`/`kfree`.
//!
//! Requests up to 2 KiB are served from single-page slabs, one size class
//! per slab. Each slab page starts with a [`SlabHeader`] followed by
//! class-aligned slots carrying an intrusive free list, so the owning
//! slab of any pointer is found by masking off the page offset. Larger
//! requests get whole pages of their own with the header in the first
//! page and the data at a fixed offset.
//!
//! Backing pages come through [`PageOps`] function pointers so the heap
//! works identically over the kernel window and over `std::alloc` in host
//! tests. The heap lock is dropped around every page-level call: those
//! calls re-enter the mapping path, which must not deadlock against us.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use baryon_core::sync::SpinLock;

use crate::{PAGE_MASK, PAGE_SIZE};

/// Slot sizes served from slabs. Larger requests get whole pages.
const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest slab-served allocation.
const MAX_CLASS: usize = 2048;

/// Class marker for whole-page allocations.
const LARGE_CLASS: u32 = u32::MAX;

/// Offset of large-allocation data within the first page. Also the
/// strongest alignment the large path guarantees.
const LARGE_DATA_OFFSET: usize = 256;

/// Free-list terminator.
const NO_SLOT: u32 = u32::MAX;

/// Empty slabs kept per size class instead of being returned.
const EMPTY_RETAIN: usize = 4;

const SLAB_MAGIC: u32 = 0x51AB_B10C;

/// Header at the start of every heap page run.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    /// Index into [`SIZE_CLASSES`], or [`LARGE_CLASS`].
    class: u32,
    /// Allocated slots in this slab.
    used: u32,
    /// Total slots in this slab.
    total: u32,
    /// Head of the intrusive free list, [`NO_SLOT`] when full.
    free_head: u32,
    _pad: u32,
    /// Pages in this run (1 for slabs).
    pages: usize,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
}

impl SlabHeader {
    /// Byte offset of slot 0: the header rounded up to the class size, so
    /// every slot is class-aligned within the page.
    fn slot0_offset(class_size: usize) -> usize {
        core::mem::size_of::<Self>().next_multiple_of(class_size)
    }

    fn slot_ptr(&mut self, class_size: usize, idx: u32) -> *mut u8 {
        let base = ptr::from_mut(self).cast::<u8>();
        // SAFETY: idx < total, which was derived from the page size.
        unsafe { base.add(Self::slot0_offset(class_size) + idx as usize * class_size) }
    }

    fn slot_index(&mut self, class_size: usize, p: *mut u8) -> u32 {
        let base = ptr::from_mut(self) as usize;
        let off = p as usize - base - Self::slot0_offset(class_size);
        debug_assert_eq!(off % class_size, 0, "pointer not on a slot boundary");
        (off / class_size) as u32
    }
}

/// Page-level backing operations, wired at boot ([`init`]) or per-test.
#[derive(Clone, Copy)]
pub struct PageOps {
    /// Allocates `pages` contiguous, writable, page-aligned pages.
    pub alloc: fn(pages: usize) -> Option<*mut u8>,
    /// Returns pages from `alloc`.
    pub free: fn(ptr: *mut u8, pages: usize),
}

/// Per-size-class state: a doubly-linked list of slabs with free slots
/// (empty slabs included), and a count of the empty ones.
struct Bucket {
    partial: *mut SlabHeader,
    empty: usize,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            partial: ptr::null_mut(),
            empty: 0,
        }
    }
}

struct HeapInner {
    buckets: [Bucket; SIZE_CLASSES.len()],
    page_ops: Option<PageOps>,
    /// Usable bytes currently handed out.
    allocated_bytes: usize,
}

// Raw slab pointers are only ever dereferenced under the heap lock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    const fn new() -> Self {
        Self {
            buckets: [
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
                Bucket::new(),
            ],
            page_ops: None,
            allocated_bytes: 0,
        }
    }

    fn link(&mut self, class: usize, slab: *mut SlabHeader) {
        let head = self.buckets[class].partial;
        // SAFETY: slab is a live header owned by this heap.
        unsafe {
            (*slab).prev = ptr::null_mut();
            (*slab).next = head;
            if !head.is_null() {
                (*head).prev = slab;
            }
        }
        self.buckets[class].partial = slab;
    }

    fn unlink(&mut self, class: usize, slab: *mut SlabHeader) {
        // SAFETY: slab is linked into this bucket's list.
        unsafe {
            let prev = (*slab).prev;
            let next = (*slab).next;
            if prev.is_null() {
                self.buckets[class].partial = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
        }
    }

    /// Carves a slot from the first partial slab, unlinking it when it
    /// fills up. `None` means a new slab page is needed.
    fn alloc_from_partial(&mut self, class: usize) -> Option<*mut u8> {
        let slab = self.buckets[class].partial;
        if slab.is_null() {
            return None;
        }
        let class_size = SIZE_CLASSES[class];
        // SAFETY: linked slabs are live headers with at least one free slot.
        unsafe {
            debug_assert_eq!((*slab).magic, SLAB_MAGIC);
            if (*slab).used == 0 {
                self.buckets[class].empty -= 1;
            }
            let idx = (*slab).free_head;
            debug_assert_ne!(idx, NO_SLOT);
            let slot = (*slab).slot_ptr(class_size, idx);
            (*slab).free_head = slot.cast::<u32>().read();
            (*slab).used += 1;
            if (*slab).free_head == NO_SLOT {
                self.unlink(class, slab);
            }
            self.allocated_bytes += class_size;
            Some(slot)
        }
    }

    /// Initializes a fresh page as a slab for `class` and carves the
    /// first slot.
    fn add_slab(&mut self, class: usize, page: *mut u8) -> *mut u8 {
        let class_size = SIZE_CLASSES[class];
        let slot0 = SlabHeader::slot0_offset(class_size);
        let total = ((PAGE_SIZE - slot0) / class_size) as u32;
        debug_assert!(total >= 1);

        let slab = page.cast::<SlabHeader>();
        // SAFETY: page is a fresh writable page of PAGE_SIZE bytes.
        unsafe {
            slab.write(SlabHeader {
                magic: SLAB_MAGIC,
                class: class as u32,
                used: 1,
                total,
                free_head: if total > 1 { 1 } else { NO_SLOT },
                _pad: 0,
                pages: 1,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            // Thread slots 1.. into the free list; slot 0 is handed out.
            for idx in 1..total {
                let next = if idx + 1 < total { idx + 1 } else { NO_SLOT };
                (*slab).slot_ptr(class_size, idx).cast::<u32>().write(next);
            }
            if total > 1 {
                self.link(class, slab);
            }
            self.allocated_bytes += class_size;
            (*slab).slot_ptr(class_size, 0)
        }
    }
}

/// The kernel heap. One instance is the `#[global_allocator]`; tests
/// build their own with host-backed [`PageOps`].
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

impl KernelHeap {
    /// Creates a heap with no backing pages; every allocation fails until
    /// [`set_page_ops`](Self::set_page_ops) is called.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner::new()),
        }
    }

    /// Wires the page-level backing.
    pub fn set_page_ops(&self, ops: PageOps) {
        self.inner.lock().page_ops = Some(ops);
    }

    /// Allocates `size` bytes, 16-byte aligned (class-aligned for class
    /// sizes, 256-byte aligned for whole-page allocations). Returns null
    /// on `size == 0` or failure.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if size <= MAX_CLASS {
            self.allocate_class(class_index(size))
        } else {
            self.allocate_large(size)
        }
    }

    fn allocate_class(&self, class: usize) -> *mut u8 {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.alloc_from_partial(class) {
            return slot;
        }
        let Some(ops) = inner.page_ops else {
            return ptr::null_mut();
        };
        drop(inner);

        let Some(page) = (ops.alloc)(1) else {
            return ptr::null_mut();
        };
        self.inner.lock().add_slab(class, page)
    }

    fn allocate_large(&self, size: usize) -> *mut u8 {
        let pages = (LARGE_DATA_OFFSET + size).div_ceil(PAGE_SIZE);
        let ops = {
            let inner = self.inner.lock();
            let Some(ops) = inner.page_ops else {
                return ptr::null_mut();
            };
            ops
        };
        let Some(base) = (ops.alloc)(pages) else {
            return ptr::null_mut();
        };

        let header = base.cast::<SlabHeader>();
        // SAFETY: base is a fresh writable run of `pages` pages.
        unsafe {
            header.write(SlabHeader {
                magic: SLAB_MAGIC,
                class: LARGE_CLASS,
                used: 1,
                total: 1,
                free_head: NO_SLOT,
                _pad: 0,
                pages,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
        }
        self.inner.lock().allocated_bytes += pages * PAGE_SIZE - LARGE_DATA_OFFSET;
        // SAFETY: the run is at least LARGE_DATA_OFFSET + size bytes.
        unsafe { base.add(LARGE_DATA_OFFSET) }
    }

    /// Frees a pointer from [`allocate`](Self::allocate). Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap, freed at
    /// most once.
    pub unsafe fn free(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let slab = ((p as usize) & !PAGE_MASK) as *mut SlabHeader;
        let mut inner = self.inner.lock();
        // SAFETY: caller passes a live allocation, so the page holds our
        // header.
        unsafe {
            assert_eq!((*slab).magic, SLAB_MAGIC, "kfree of a foreign pointer");
            if (*slab).class == LARGE_CLASS {
                let pages = (*slab).pages;
                let ops = inner.page_ops.expect("large allocation without page ops");
                inner.allocated_bytes -= pages * PAGE_SIZE - LARGE_DATA_OFFSET;
                (*slab).magic = 0;
                drop(inner);
                (ops.free)(slab.cast::<u8>(), pages);
                return;
            }

            let class = (*slab).class as usize;
            let class_size = SIZE_CLASSES[class];
            let idx = (*slab).slot_index(class_size, p);
            debug_assert!(idx < (*slab).total);

            p.cast::<u32>().write((*slab).free_head);
            let was_full = (*slab).free_head == NO_SLOT;
            (*slab).free_head = idx;
            (*slab).used -= 1;
            inner.allocated_bytes -= class_size;

            if was_full {
                inner.link(class, slab);
            } else if (*slab).used > 0 {
                // The freed slab moves to the bucket head and serves the
                // next allocation.
                inner.unlink(class, slab);
                inner.link(class, slab);
            }
            if (*slab).used == 0 {
                if inner.buckets[class].empty < EMPTY_RETAIN {
                    inner.buckets[class].empty += 1;
                } else {
                    let ops = inner.page_ops.expect("slab without page ops");
                    inner.unlink(class, slab);
                    (*slab).magic = 0;
                    drop(inner);
                    (ops.free)(slab.cast::<u8>(), 1);
                }
            }
        }
    }

    /// Returns the usable size of an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn alloc_size(&self, p: *mut u8) -> usize {
        let slab = ((p as usize) & !PAGE_MASK) as *mut SlabHeader;
        let _inner = self.inner.lock();
        // SAFETY: caller passes a live allocation.
        unsafe {
            debug_assert_eq!((*slab).magic, SLAB_MAGIC);
            if (*slab).class == LARGE_CLASS {
                (*slab).pages * PAGE_SIZE - LARGE_DATA_OFFSET
            } else {
                SIZE_CLASSES[(*slab).class as usize]
            }
        }
    }

    /// Resizes an allocation, preserving its contents.
    ///
    /// Null grows from nothing; `new_size == 0` frees and returns null.
    /// The pointer is unchanged whenever the existing block already fits.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap. On success
    /// with a different pointer, the old pointer is freed.
    pub unsafe fn realloc(&self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            // SAFETY: forwarded from the caller.
            unsafe { self.free(p) };
            return ptr::null_mut();
        }
        // SAFETY: forwarded from the caller.
        let usable = unsafe { self.alloc_size(p) };
        if new_size <= usable {
            return p;
        }

        let fresh = self.allocate(new_size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both blocks are live and at least `usable` bytes.
        unsafe {
            ptr::copy_nonoverlapping(p, fresh, usable);
            self.free(p);
        }
        fresh
    }

    /// Usable bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated_bytes
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a request size to its class index. `size` must be in
/// `1..=MAX_CLASS`.
fn class_index(size: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&c| c >= size)
        .expect("size fits a class")
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Classes are powers of two and slots are class-aligned, so
        // rounding the size up to the alignment satisfies any alignment a
        // class can hold. The large path only guarantees
        // LARGE_DATA_OFFSET alignment.
        let size = layout.size().max(layout.align());
        if layout.align() > MAX_CLASS {
            return ptr::null_mut();
        }
        if size > MAX_CLASS && layout.align() > LARGE_DATA_OFFSET {
            return ptr::null_mut();
        }
        self.allocate(size)
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        // SAFETY: forwarded from the caller.
        unsafe { self.free(p) };
    }
}

// ---------------------------------------------------------------------------
// Global heap and the kmalloc family
// ---------------------------------------------------------------------------

/// The global kernel heap.
#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelHeap = KernelHeap::new();

/// Wires the global heap to the kernel virtual window. Requires
/// [`crate::kvspace::init`] and [`crate::pmm::init`] to have run.
pub fn init() {
    HEAP.set_page_ops(PageOps {
        alloc: window_page_alloc,
        free: window_page_free,
    });
}

fn window_page_alloc(pages: usize) -> Option<*mut u8> {
    let virt = crate::kvspace::kvirtual_alloc(pages * PAGE_SIZE, crate::mapper::MapFlags::WRITABLE);
    Some(virt.as_mut_ptr())
}

fn window_page_free(p: *mut u8, pages: usize) {
    crate::kvspace::kvirtual_free(baryon_core::addr::VirtAddr::new(p as u64), pages * PAGE_SIZE);
}

/// Allocates `size` bytes from the kernel heap. Returns null for
/// `size == 0` or on failure.
pub fn kmalloc(size: usize) -> *mut u8 {
    HEAP.allocate(size)
}

/// Allocates `size` zeroed bytes from the kernel heap.
pub fn kzmalloc(size: usize) -> *mut u8 {
    let p = HEAP.allocate(size);
    if !p.is_null() {
        // SAFETY: p points at least `size` writable bytes.
        unsafe { ptr::write_bytes(p, 0, size) };
    }
    p
}

/// Allocates a zeroed array of `count` elements of `size` bytes each.
/// Returns null on multiplication overflow.
pub fn kcalloc(count: usize, size: usize) -> *mut u8 {
    match count.checked_mul(size) {
        Some(total) => kzmalloc(total),
        None => ptr::null_mut(),
    }
}

/// Resizes a heap allocation. See [`KernelHeap::realloc`].
///
/// # Safety
///
/// `ptr` must be null or a live allocation from [`kmalloc`] and friends.
pub unsafe fn krealloc(p: *mut u8, new_size: usize) -> *mut u8 {
    // SAFETY: forwarded from the caller.
    unsafe { HEAP.realloc(p, new_size) }
}

/// Frees a pointer from [`kmalloc`] and friends. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this heap, freed at most
/// once.
pub unsafe fn kfree(p: *mut u8) {
    // SAFETY: forwarded from the caller.
    unsafe { HEAP.free(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_page_alloc(pages: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let p = unsafe { std::alloc::alloc(layout) };
        (!p.is_null()).then_some(p)
    }

    fn host_page_free(p: *mut u8, pages: usize) {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: p came from host_page_alloc with the same layout.
        unsafe { std::alloc::dealloc(p, layout) };
    }

    const HOST_OPS: PageOps = PageOps {
        alloc: host_page_alloc,
        free: host_page_free,
    };

    fn host_heap() -> KernelHeap {
        let heap = KernelHeap::new();
        heap.set_page_ops(HOST_OPS);
        heap
    }

    #[test]
    fn zero_size_returns_null() {
        let heap = host_heap();
        assert!(heap.allocate(0).is_null());
    }

    #[test]
    fn allocation_fails_without_page_ops() {
        let heap = KernelHeap::new();
        assert!(heap.allocate(16).is_null());
        assert!(heap.allocate(10_000).is_null());
    }

    #[test]
    fn sizes_round_up_to_classes() {
        let heap = host_heap();
        for (req, class) in [(1, 16), (16, 16), (17, 32), (100, 128), (2048, 2048)] {
            let p = heap.allocate(req);
            assert!(!p.is_null());
            assert_eq!(unsafe { heap.alloc_size(p) }, class, "request {req}");
            assert_eq!(p as usize % class, 0, "slot not class-aligned");
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn slots_are_distinct_and_hold_data() {
        let heap = host_heap();
        let mut ptrs = Vec::new();
        for i in 0..300u32 {
            let p = heap.allocate(24);
            assert!(!p.is_null());
            unsafe { p.cast::<u32>().write(i) };
            ptrs.push(p);
        }
        for (i, &p) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { p.cast::<u32>().read() }, i as u32);
        }
        for p in ptrs {
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let heap = host_heap();
        let a = heap.allocate(64);
        let _b = heap.allocate(64);
        unsafe { heap.free(a) };
        assert_eq!(heap.allocate(64), a);
    }

    #[test]
    fn freeing_moves_the_slab_to_the_bucket_head() {
        let heap = host_heap();
        let slab_of = |p: *mut u8| (p as usize) & !PAGE_MASK;

        // Fill one 1024-class slab (3 slots), then start a second.
        let a: Vec<_> = (0..3).map(|_| heap.allocate(1024)).collect();
        let b0 = heap.allocate(1024);
        let b1 = heap.allocate(1024);
        assert_eq!(slab_of(b0), slab_of(b1));
        assert_ne!(slab_of(a[0]), slab_of(b0));

        // Freeing into the full first slab relinks it at the head;
        // freeing into the second moves it back in front.
        unsafe { heap.free(a[0]) };
        unsafe { heap.free(b1) };
        let next = heap.allocate(1024);
        assert_eq!(slab_of(next), slab_of(b0));

        unsafe {
            heap.free(next);
            heap.free(b0);
            for p in &a[1..] {
                heap.free(*p);
            }
        }
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn large_allocations_use_whole_pages() {
        let heap = host_heap();
        let size = 3 * PAGE_SIZE;
        let p = heap.allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % LARGE_DATA_OFFSET, 0);
        let usable = unsafe { heap.alloc_size(p) };
        assert!(usable >= size);

        // The whole span is writable.
        unsafe {
            ptr::write_bytes(p, 0xA5, size);
            assert_eq!(p.add(size - 1).read(), 0xA5);
            heap.free(p);
        }
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn realloc_keeps_pointer_when_block_fits() {
        let heap = host_heap();
        let p = heap.allocate(40);
        unsafe {
            // 40 lands in the 64 class; 60 still fits.
            assert_eq!(heap.realloc(p, 60), p);
            heap.free(p);
        }
    }

    #[test]
    fn realloc_grow_copies_contents() {
        let heap = host_heap();
        let p = heap.allocate(32);
        unsafe {
            for i in 0..32 {
                p.add(i).write(i as u8);
            }
            let q = heap.realloc(p, 3000);
            assert!(!q.is_null());
            for i in 0..32 {
                assert_eq!(q.add(i).read(), i as u8);
            }
            heap.free(q);
        }
    }

    #[test]
    fn realloc_null_and_zero_edges() {
        let heap = host_heap();
        let p = unsafe { heap.realloc(ptr::null_mut(), 100) };
        assert!(!p.is_null());
        assert!(unsafe { heap.realloc(p, 0) }.is_null());
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn global_alloc_respects_alignment() {
        let heap = host_heap();
        unsafe {
            let layout = Layout::from_size_align(24, 512).unwrap();
            let p = heap.alloc(layout);
            assert_eq!(p as usize % 512, 0);
            heap.dealloc(p, layout);

            // Unsatisfiable alignments fail instead of lying.
            assert!(heap.alloc(Layout::from_size_align(8, 4096).unwrap()).is_null());
            assert!(
                heap.alloc(Layout::from_size_align(10_000, 512).unwrap())
                    .is_null()
            );
        }
    }

    #[test]
    fn empty_slabs_are_retained_then_released() {
        let heap = host_heap();
        // Fill and free several whole slabs of the 2048 class (1 slot per
        // slab), pushing past the retain limit.
        let mut ptrs = Vec::new();
        for _ in 0..(EMPTY_RETAIN + 3) {
            ptrs.push(heap.allocate(2048));
        }
        for p in &ptrs {
            unsafe { heap.free(*p) };
        }
        // Retained slabs serve the next allocations without new pages.
        let again = heap.allocate(2048);
        assert!(ptrs.contains(&again));
        unsafe { heap.free(again) };
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn kmalloc_family_edges() {
        HEAP.set_page_ops(HOST_OPS);

        assert!(kmalloc(0).is_null());
        unsafe { kfree(ptr::null_mut()) };

        let z = kzmalloc(100);
        assert!(!z.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(z, 100) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert!(kcalloc(usize::MAX, 2).is_null());
        let c = kcalloc(10, 10);
        assert!(!c.is_null());

        unsafe {
            let grown = krealloc(z, 5000);
            assert!(!grown.is_null());
            kfree(grown);
            kfree(c);
        }
    }
}
