//! Kernel virtual window allocator.
//!
//! Hands out page-granular ranges from the fixed kernel window defined in
//! [`crate::layout`], backs them with physical frames, and maps them into
//! the kernel root table. Also maps arbitrary physical ranges (MMIO) into
//! the window without touching the frame allocator.
//!
//! The range allocator is a downward bump pointer with a fixed-capacity
//! free list and no coalescing: freed ranges are remembered verbatim and
//! reused first-fit. When the free list overflows, the range is leaked
//! with a warning rather than corrupting the list.

use core::fmt;

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_core::kwarn;
use baryon_core::paging::{Page, PhysFrame, Size4KiB};
use baryon_core::sync::SpinLock;
use planck_noalloc::vec::ArrayVec;

use crate::layout::{self, VirtRegion};
use crate::mapper::{MapFlags, PageWalker, map_pages};
use crate::pmm::GlobalFrames;
use crate::{FrameAllocator, FrameDeallocator, NativeWalker, PAGE_MASK, PAGE_SIZE};

/// Error from returning a range to the window allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    /// The free list is at capacity; the range was not recorded.
    FreeListFull,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeListFull => write!(f, "kernel window free list is full"),
        }
    }
}

/// A freed range awaiting reuse.
#[derive(Debug, Clone, Copy)]
struct FreeRange {
    start: VirtAddr,
    pages: u64,
}

/// Page-granular range allocator over a fixed virtual region.
///
/// New ranges are carved downward from the top of the region so the bump
/// pointer never collides with anything mapped early at the region base.
#[derive(Debug)]
pub struct WindowAllocator<const N: usize> {
    region: VirtRegion,
    /// Lowest address carved so far; the next bump allocation ends here.
    next: u64,
    free: ArrayVec<FreeRange, N>,
}

impl<const N: usize> WindowAllocator<N> {
    /// Creates an allocator covering `region`, initially fully free.
    pub fn new(region: VirtRegion) -> Self {
        Self {
            next: region.end().as_u64(),
            free: ArrayVec::new(),
            region,
        }
    }

    /// Allocates `pages` contiguous pages, reusing freed ranges first-fit
    /// before bumping. Returns `None` when `pages` is zero or the window
    /// is exhausted.
    pub fn allocate(&mut self, pages: u64) -> Option<VirtAddr> {
        if pages == 0 {
            return None;
        }

        for i in 0..self.free.len() {
            let entry = self.free[i];
            if entry.pages >= pages {
                if entry.pages == pages {
                    self.free.remove(i);
                } else {
                    self.free[i] = FreeRange {
                        start: entry.start + pages * PAGE_SIZE as u64,
                        pages: entry.pages - pages,
                    };
                }
                return Some(entry.start);
            }
        }

        let bytes = pages * PAGE_SIZE as u64;
        if self.next - self.region.start().as_u64() < bytes {
            return None;
        }
        self.next -= bytes;
        Some(VirtAddr::new(self.next))
    }

    /// Returns a range to the allocator. Ranges are recorded verbatim,
    /// never merged with neighbours.
    ///
    /// # Errors
    ///
    /// [`KvError::FreeListFull`] when the list is at capacity; the range
    /// stays allocated.
    pub fn free(&mut self, start: VirtAddr, pages: u64) -> Result<(), KvError> {
        debug_assert!(self.region.contains(start));
        debug_assert!(start.as_u64() >= self.next);
        if self.free.is_full() {
            return Err(KvError::FreeListFull);
        }
        self.free.push(FreeRange { start, pages });
        Ok(())
    }
}

/// Entries in the kernel window free list. Enough for transient MMIO and
/// DMA windows; overflow leaks address space, not memory safety.
const FREE_LIST_LEN: usize = 64;

/// The kernel's half of the address space: root table, walker, and the
/// window allocator for kernel virtual allocations.
pub struct KernelSpace<W: PageWalker> {
    root: PhysAddr,
    walker: W,
    phys_base: u64,
    window: WindowAllocator<FREE_LIST_LEN>,
}

impl<W: PageWalker> KernelSpace<W> {
    /// Creates a kernel space over an existing root table.
    ///
    /// # Safety
    ///
    /// - `root` must be the physical address of a valid root table that
    ///   stays live for the life of this value.
    /// - `phys_base` must be the direct-map offset, covering all frames
    ///   the walker and allocations will touch.
    /// - No page within `window` may be mapped in `root`.
    pub unsafe fn new(root: PhysAddr, walker: W, phys_base: u64, window: VirtRegion) -> Self {
        Self {
            root,
            walker,
            phys_base,
            window: WindowAllocator::new(window),
        }
    }

    /// Allocates `size` bytes of zeroed, page-backed kernel memory.
    ///
    /// `size == 0` returns the zero address. `size` is rounded up to whole
    /// pages.
    ///
    /// # Panics
    ///
    /// Panics when the kernel window or physical memory is exhausted.
    pub fn alloc(
        &mut self,
        size: usize,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> VirtAddr {
        if size == 0 {
            return VirtAddr::zero();
        }
        let pages = size.div_ceil(PAGE_SIZE) as u64;
        let virt = self
            .window
            .allocate(pages)
            .expect("kernel virtual window exhausted");

        for i in 0..pages {
            let frame = alloc
                .allocate_frame()
                .expect("out of physical memory for kernel allocation");
            // SAFETY: the frame is fresh and direct-mapped at phys_base.
            unsafe {
                core::ptr::write_bytes(
                    (self.phys_base + frame.start_address().as_u64()) as *mut u8,
                    0,
                    PAGE_SIZE,
                );
            }
            let page = Page::containing_address(virt + i * PAGE_SIZE as u64);
            // SAFETY: root is valid per the constructor contract and the
            // window allocator hands out unmapped ranges.
            let flush = unsafe {
                self.walker
                    .map(self.root, page, frame, flags, &mut || {
                        alloc
                            .allocate_frame()
                            .expect("out of physical memory for page tables")
                    })
                    .expect("kernel window page already mapped")
            };
            flush.ignore();
        }
        virt
    }

    /// Frees a range from [`alloc`](Self::alloc), unmapping it and
    /// returning the frames.
    pub fn free(
        &mut self,
        addr: VirtAddr,
        size: usize,
        dealloc: &mut impl FrameDeallocator<Size4KiB>,
    ) {
        if size == 0 {
            return;
        }
        let pages = size.div_ceil(PAGE_SIZE) as u64;
        // SAFETY: root is valid; the frames were exclusively owned by this
        // allocation.
        unsafe {
            crate::mapper::unmap_pages(
                &self.walker,
                self.root,
                Page::containing_address(addr),
                pages,
                dealloc,
            );
        }
        if let Err(err) = self.window.free(addr, pages) {
            kwarn!("kvspace: leaking {} pages at {:#x}: {}", pages, addr, err);
        }
    }

    /// Maps `size` bytes of physical memory into the window and returns a
    /// virtual address with the same in-page offset as `phys`.
    /// `size == 0` maps nothing and returns the zero address.
    ///
    /// Used for MMIO and firmware tables; the frames are not owned by the
    /// frame allocator and are left alone on unmap.
    ///
    /// # Panics
    ///
    /// Panics when the kernel window or physical memory (for page tables)
    /// is exhausted.
    pub fn map_phys(
        &mut self,
        phys: PhysAddr,
        size: usize,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> VirtAddr {
        if size == 0 {
            return VirtAddr::zero();
        }
        let offset = phys.as_u64() & PAGE_MASK as u64;
        let first = phys.align_down(PAGE_SIZE as u64);
        let pages = (offset as usize + size).div_ceil(PAGE_SIZE) as u64;
        let virt = self
            .window
            .allocate(pages)
            .expect("kernel virtual window exhausted");

        // SAFETY: root is valid and the window range is unmapped.
        unsafe {
            map_pages(
                &self.walker,
                self.root,
                Page::containing_address(virt),
                PhysFrame::containing_address(first),
                pages,
                flags,
                alloc,
            )
            .expect("kernel window page already mapped");
        }
        virt + offset
    }

    /// Unmaps a range from [`map_phys`](Self::map_phys). The underlying
    /// frames are not freed.
    pub fn unmap_phys(&mut self, virt: VirtAddr, size: usize) {
        if size == 0 {
            return;
        }
        let offset = virt.page_offset() as usize;
        let base = virt.align_down(PAGE_SIZE as u64);
        let pages = (offset + size).div_ceil(PAGE_SIZE) as u64;
        for i in 0..pages {
            let page = Page::containing_address(base + i * PAGE_SIZE as u64);
            // SAFETY: root is valid per the constructor contract.
            if let Ok((_frame, flush)) = unsafe { self.walker.unmap(self.root, page) } {
                flush.flush();
            }
        }
        if let Err(err) = self.window.free(base, pages) {
            kwarn!("kvspace: leaking {} pages at {:#x}: {}", pages, base, err);
        }
    }

    /// Translates a kernel virtual address through the root table.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: root is valid per the constructor contract.
        unsafe { self.walker.translate(self.root, virt) }
    }
}

// ---------------------------------------------------------------------------
// Global kernel space
// ---------------------------------------------------------------------------

/// The global kernel address space, set up once at boot.
static KVSPACE: SpinLock<Option<KernelSpace<NativeWalker>>> = SpinLock::new(None);

/// Initializes the global kernel space over the boot root table.
///
/// # Safety
///
/// Same contract as [`KernelSpace::new`] with the window from
/// [`layout::kernel_window`].
///
/// # Panics
///
/// Panics if called twice.
pub unsafe fn init(root: PhysAddr, phys_base: u64) {
    crate::mapper::register_tlb_flush(baryon_core::arch::tlb::flush);
    // SAFETY: forwarded from the caller.
    let space = unsafe {
        KernelSpace::new(
            root,
            NativeWalker::new(phys_base),
            phys_base,
            layout::kernel_window(),
        )
    };
    let mut kvspace = KVSPACE.lock();
    assert!(kvspace.is_none(), "kernel space already initialized");
    *kvspace = Some(space);
}

fn with<R>(f: impl FnOnce(&mut KernelSpace<NativeWalker>) -> R) -> R {
    let mut kvspace = KVSPACE.lock();
    f(kvspace.as_mut().expect("kernel space not initialized"))
}

/// Allocates `size` bytes of zeroed kernel memory, page-granular.
///
/// # Panics
///
/// Panics when the kernel window or physical memory is exhausted.
pub fn kvirtual_alloc(size: usize, flags: MapFlags) -> VirtAddr {
    with(|space| space.alloc(size, flags, &mut GlobalFrames))
}

/// Frees a range from [`kvirtual_alloc`].
pub fn kvirtual_free(addr: VirtAddr, size: usize) {
    with(|space| space.free(addr, size, &mut GlobalFrames));
}

/// Maps physical memory (MMIO, firmware tables) into the kernel window.
pub fn map_phys(phys: PhysAddr, size: usize, flags: MapFlags) -> VirtAddr {
    with(|space| space.map_phys(phys, size, flags, &mut GlobalFrames))
}

/// Unmaps a range from [`map_phys`] without freeing the frames.
pub fn unmap_phys(virt: VirtAddr, size: usize) {
    with(|space| space.unmap_phys(virt, size));
}

/// Translates a kernel virtual address to its physical address.
pub fn get_physaddr(virt: VirtAddr) -> Option<PhysAddr> {
    with(|space| space.translate(virt))
}
