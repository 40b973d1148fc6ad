//! Architecture-independent page mapping interface.
//!
//! [`PageWalker`] is the seam between policy code (kernel window, fault
//! handler) and the concrete page table formats in [`crate::walk4`] and
//! [`crate::walk2`]. Mapping an already-present page is an error: callers
//! that want to replace a mapping must unmap first.
//!
//! # TLB flush decoupling
//!
//! The architecture's single-page invalidation is registered at boot with
//! [`register_tlb_flush`]. Until then flushes are no-ops, which is also
//! what host tests want.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_core::paging::{Page, PhysFrame, Size4KiB};

use crate::{FrameAllocator, FrameDeallocator};

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable. On 2-level x86 this is advisory: there is
        /// no NX bit, so every mapped page is executable.
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (kept across address space switches).
        const GLOBAL        = 1 << 3;
        /// Caching disabled (MMIO).
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Error from map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page already has a present mapping.
    AlreadyMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "page is already mapped"),
        }
    }
}

/// Error from unmap and translate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page has no present mapping.
    NotMapped,
}

impl fmt::Display for UnmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "page is not mapped"),
        }
    }
}

/// Registered TLB flush function. No-op until boot registers the real one.
static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture's single-page TLB invalidation.
///
/// Must be called before any page table modification whose stale entry
/// could already be cached. On x86 this is `invlpg`.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: only valid `fn(VirtAddr)` pointers are stored in TLB_FLUSH_FN.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// A pending TLB flush for a single page.
///
/// Produced by page table modifications. Flushes on drop unless
/// [`.flush()`](Self::flush) or [`.ignore()`](Self::ignore) is called
/// first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    pending: bool,
}

impl MapFlush {
    /// Creates a pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            pending: true,
        }
    }

    /// Flushes the TLB entry now.
    pub fn flush(mut self) {
        self.pending = false;
        arch_flush_page(self.virt);
    }

    /// Skips the flush. Correct for fresh mappings of previously
    /// non-present pages, which can never be cached.
    pub fn ignore(mut self) {
        self.pending = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.pending {
            arch_flush_page(self.virt);
        }
    }
}

/// A page table walker for one paging mode.
///
/// The walker is stateless apart from the physical-map offset it reads
/// tables through, so one instance can serve any number of address spaces
/// identified by their root table's physical address.
///
/// # Safety
///
/// Implementations must manipulate the hardware page table format
/// correctly and must never write outside the tables reachable from
/// `root`.
pub unsafe trait PageWalker {
    /// Maps `page` to `frame` with the given flags.
    ///
    /// Intermediate tables are allocated from `alloc` and zeroed. Returns
    /// [`MapError::AlreadyMapped`] if the page already has a present leaf
    /// entry; the existing mapping is left untouched.
    ///
    /// # Safety
    ///
    /// - `root` must be the physical address of a valid root table
    ///   reachable through the walker's physical-map offset.
    /// - `alloc` must hand out unused frames.
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> Result<MapFlush, MapError>;

    /// Unmaps `page` and returns the frame that was mapped.
    ///
    /// Intermediate tables are left in place even when they become empty.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid root table.
    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError>;

    /// Translates a virtual address, returning `None` if not mapped.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid root table.
    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr>;
}

/// Maps `count` consecutive pages starting at `page` to consecutive
/// frames starting at `frame`.
///
/// Not transactional: on [`MapError::AlreadyMapped`] the pages mapped so
/// far stay mapped and the error names nothing about them. Fresh mappings
/// are never TLB-cached, so no flushes are issued.
///
/// # Safety
///
/// Same contract as [`PageWalker::map`], for every page in the range.
pub unsafe fn map_pages<W: PageWalker, A: FrameAllocator<Size4KiB>>(
    walker: &W,
    root: PhysAddr,
    page: Page<Size4KiB>,
    frame: PhysFrame<Size4KiB>,
    count: u64,
    flags: MapFlags,
    alloc: &mut A,
) -> Result<(), MapError> {
    for i in 0..count {
        // SAFETY: forwarded from the caller.
        let flush = unsafe {
            walker.map(root, page + i, frame + i, flags, &mut || {
                alloc
                    .allocate_frame()
                    .expect("out of physical memory for page tables")
            })?
        };
        flush.ignore();
    }
    Ok(())
}

/// Unmaps `count` consecutive pages starting at `page`, returning each
/// frame to `dealloc` and flushing each TLB entry.
///
/// Holes in the range are skipped; this makes teardown of partially
/// populated regions a single call.
///
/// # Safety
///
/// Same contract as [`PageWalker::unmap`]. The frames must be unused by
/// the time they reach `dealloc`.
pub unsafe fn unmap_pages<W: PageWalker, D: FrameDeallocator<Size4KiB>>(
    walker: &W,
    root: PhysAddr,
    page: Page<Size4KiB>,
    count: u64,
    dealloc: &mut D,
) {
    for i in 0..count {
        // SAFETY: forwarded from the caller.
        match unsafe { walker.unmap(root, page + i) } {
            Ok((frame, flush)) => {
                flush.flush();
                // SAFETY: the frame was just unmapped and is unused.
                unsafe { dealloc.deallocate_frame(frame) };
            }
            Err(UnmapError::NotMapped) => {}
        }
    }
}
