//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame (1 = allocated or reserved, 0 = free), scanned
//! word-at-a-time with `trailing_zeros()`. Next to the bitmap lives a
//! [`PageInfo`] array with a reference count per frame, so several
//! mappings can share a frame and it is only returned to the pool when
//! the last reference drops.
//!
//! Both arrays are carved out of the first usable region large enough to
//! hold them, reached through the physical direct map.

use baryon_core::addr::PhysAddr;
use baryon_core::paging::{PhysFrame, Size4KiB};
use baryon_core::sync::IrqSpinLock;
use baryon_core::{kdebug, kinfo};

use crate::{FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

/// Per-frame bookkeeping.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageInfo {
    /// Number of live references to this frame. 0 for free frames.
    refcount: u16,
}

/// The physical frame allocator.
///
/// Mutation goes through `&mut self`; thread safety comes from the outer
/// `PMM: IrqSpinLock<Option<..>>`. The lock disables interrupts because
/// the page fault handler allocates frames.
pub struct BitmapAllocator {
    /// One bit per frame, in direct-mapped memory.
    bitmap: &'static mut [u64],
    /// One entry per frame, right after the bitmap.
    info: &'static mut [PageInfo],
    /// Number of frames tracked.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index where the next search starts.
    search_hint: usize,
}

impl BitmapAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// # Safety
    ///
    /// - `phys_base` must be the direct-map offset.
    /// - `regions` must accurately describe physical memory, with the
    ///   kernel image and boot structures excluded from usable regions
    ///   (or reserved afterwards with [`reserve_range`](Self::reserve_range)).
    /// - Must be called once during boot.
    pub unsafe fn new(
        regions: &[PhysMemoryRegion],
        phys_base: u64,
    ) -> Result<Self, PmmError> {
        let max_phys = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.start.as_u64() + r.size)
            .max()
            .unwrap_or(0);
        if max_phys == 0 {
            return Err(PmmError::OutOfMemory);
        }

        let total_frames = (max_phys / FRAME_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = bitmap_words * 8;
        let info_bytes = total_frames * core::mem::size_of::<PageInfo>();
        let meta_bytes = (bitmap_bytes + info_bytes) as u64;
        let meta_frames = meta_bytes.div_ceil(FRAME_SIZE);

        let meta_start = regions
            .iter()
            .filter(|r| r.is_usable() && r.size >= meta_bytes)
            .map(|r| r.start)
            .next()
            .ok_or(PmmError::NoMetadataRegion)?;

        // SAFETY: the region is usable, large enough, and unaliased during
        // boot; the bitmap and info array are laid out back to back. The
        // info array's 2-byte alignment is satisfied because the bitmap
        // length is a multiple of 8.
        let (bitmap, info) = unsafe {
            let base = (phys_base + meta_start.as_u64()) as *mut u8;
            let bitmap = core::slice::from_raw_parts_mut(base.cast::<u64>(), bitmap_words);
            let info = core::slice::from_raw_parts_mut(
                base.add(bitmap_bytes).cast::<PageInfo>(),
                total_frames,
            );
            (bitmap, info)
        };

        bitmap.fill(u64::MAX);
        info.fill(PageInfo { refcount: 0 });

        let mut this = Self {
            bitmap,
            info,
            total_frames,
            free_count: 0,
            search_hint: 0,
        };

        // Free the usable regions, then re-reserve our own metadata.
        for region in regions.iter().filter(|r| r.is_usable()) {
            let first = (region.start.as_u64() / FRAME_SIZE) as usize;
            let count = (region.size / FRAME_SIZE) as usize;
            for idx in first..(first + count).min(this.total_frames) {
                if this.is_allocated(idx) {
                    this.clear(idx);
                    this.free_count += 1;
                }
            }
        }
        this.reserve_range(meta_start, meta_frames * FRAME_SIZE);

        Ok(this)
    }

    #[inline]
    fn is_allocated(&self, idx: usize) -> bool {
        self.bitmap[idx / BITS_PER_WORD] & (1u64 << (idx % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        self.bitmap[idx / BITS_PER_WORD] |= 1u64 << (idx % BITS_PER_WORD);
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        self.bitmap[idx / BITS_PER_WORD] &= !(1u64 << (idx % BITS_PER_WORD));
    }

    fn frame_index(&self, addr: PhysAddr) -> Result<usize, PmmError> {
        let idx = (addr.as_u64() / FRAME_SIZE) as usize;
        if idx >= self.total_frames {
            return Err(PmmError::InvalidFrame);
        }
        Ok(idx)
    }

    /// Marks `bytes` of physical memory starting at `start` as reserved.
    ///
    /// Used for the kernel image and boot structures that the memory map
    /// reports as usable. Frames already allocated are left alone.
    pub fn reserve_range(&mut self, start: PhysAddr, bytes: u64) {
        let first = (start.as_u64() / FRAME_SIZE) as usize;
        let count = bytes.div_ceil(FRAME_SIZE) as usize;
        for idx in first..(first + count).min(self.total_frames) {
            if !self.is_allocated(idx) {
                self.set(idx);
                self.free_count -= 1;
            }
        }
    }

    /// Allocates a single frame. The frame starts with a reference count
    /// of one.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if self.free_count == 0 {
            return None;
        }

        let words = self.bitmap.len();
        for offset in 0..words {
            let word_idx = (self.search_hint + offset) % words;
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let idx = word_idx * BITS_PER_WORD + bit;
            if idx >= self.total_frames {
                continue;
            }

            self.set(idx);
            self.info[idx].refcount = 1;
            self.free_count -= 1;
            self.search_hint = word_idx;
            return Some(PhysFrame::containing_address(PhysAddr::new(
                idx as u64 * FRAME_SIZE,
            )));
        }

        None
    }

    /// Allocates `count` physically contiguous frames and returns the
    /// first one. Each frame starts with a reference count of one.
    ///
    /// Returns `None` for `count == 0` or when no run is long enough.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysFrame<Size4KiB>> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.allocate_frame();
        }
        if self.free_count < count {
            return None;
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        let mut idx = 0usize;
        while idx < self.total_frames {
            // Skip fully allocated words.
            if idx % BITS_PER_WORD == 0 && self.bitmap[idx / BITS_PER_WORD] == u64::MAX {
                run_len = 0;
                idx += BITS_PER_WORD;
                run_start = idx;
                continue;
            }

            if self.is_allocated(idx) {
                run_len = 0;
                run_start = idx + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    break;
                }
            }
            idx += 1;
        }

        if run_len < count {
            return None;
        }

        for i in run_start..run_start + count {
            self.set(i);
            self.info[i].refcount = 1;
        }
        self.free_count -= count;
        self.search_hint = (run_start + count) / BITS_PER_WORD;
        Some(PhysFrame::containing_address(PhysAddr::new(
            run_start as u64 * FRAME_SIZE,
        )))
    }

    /// Drops the caller's reference to a frame. Shared frames stay
    /// allocated until their last reference; the common singly-owned
    /// frame is freed immediately.
    ///
    /// # Safety
    ///
    /// The frame must have been allocated by this allocator and the
    /// caller's mapping of it must be gone.
    pub unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) -> Result<(), PmmError> {
        self.frame_unref(frame.start_address()).map(|_| ())
    }

    /// Frees `count` contiguous frames starting at `frame`.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate_frame`](Self::deallocate_frame) for
    /// every frame in the range.
    pub unsafe fn deallocate_frames(
        &mut self,
        frame: PhysFrame<Size4KiB>,
        count: usize,
    ) -> Result<(), PmmError> {
        let start = self.frame_index(frame.start_address())?;
        if start + count > self.total_frames {
            return Err(PmmError::InvalidFrame);
        }
        for i in 0..count {
            // SAFETY: forwarded from the caller.
            unsafe {
                self.deallocate_frame(PhysFrame::containing_address(PhysAddr::new(
                    (start + i) as u64 * FRAME_SIZE,
                )))?;
            }
        }
        Ok(())
    }

    /// Takes an additional reference on an allocated frame.
    pub fn frame_ref(&mut self, addr: PhysAddr) -> Result<(), PmmError> {
        let idx = self.frame_index(addr)?;
        debug_assert!(self.is_allocated(idx), "ref on free frame");
        self.info[idx].refcount += 1;
        Ok(())
    }

    /// Drops a reference on an allocated frame, freeing it when the count
    /// reaches zero. Returns the remaining count.
    pub fn frame_unref(&mut self, addr: PhysAddr) -> Result<u16, PmmError> {
        let idx = self.frame_index(addr)?;
        debug_assert!(self.is_allocated(idx), "unref on free frame");
        debug_assert!(self.info[idx].refcount > 0, "unref below zero");
        self.info[idx].refcount -= 1;
        let remaining = self.info[idx].refcount;
        if remaining == 0 {
            self.clear(idx);
            self.free_count += 1;
            if idx / BITS_PER_WORD < self.search_hint {
                self.search_hint = idx / BITS_PER_WORD;
            }
        }
        Ok(remaining)
    }

    /// Returns the reference count of a frame, 0 if free.
    pub fn refcount(&self, addr: PhysAddr) -> Result<u16, PmmError> {
        let idx = self.frame_index(addr)?;
        Ok(self.info[idx].refcount)
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Returns the total number of tracked frames.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

/// Global physical frame allocator.
///
/// Interrupt-safe lock: the page fault handler takes it from interrupt
/// context.
static PMM: IrqSpinLock<Option<BitmapAllocator>> = IrqSpinLock::new(None);

/// Initializes the global frame allocator from the boot memory map.
///
/// # Panics
///
/// Panics if called twice or if no usable memory is found.
pub fn init(regions: &[PhysMemoryRegion], phys_base: u64) {
    // SAFETY: boot code passes the authoritative memory map and direct-map
    // offset, once.
    let allocator = unsafe {
        BitmapAllocator::new(regions, phys_base).expect("failed to initialize frame allocator")
    };
    kinfo!(
        "pmm: tracking {} frames, {} free",
        allocator.total_frames(),
        allocator.free_frames()
    );

    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "frame allocator already initialized");
    *pmm = Some(allocator);
}

/// Runs a closure with exclusive access to the global frame allocator.
///
/// # Panics
///
/// Panics if [`init`] has not been called.
pub fn with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("frame allocator not initialized"))
}

/// Like [`with`], but returns `None` instead of blocking or panicking if
/// the lock is held or the allocator is not up yet.
pub fn try_with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> Option<R> {
    let mut pmm = PMM.try_lock()?;
    Some(f(pmm.as_mut()?))
}

/// Allocates `count` physically contiguous frames and returns the first
/// frame's address. `count == 0` is a no-op returning the zero address.
///
/// # Panics
///
/// Panics when physical memory is exhausted. Running out of frames leaves
/// the kernel nothing sensible to do.
pub fn alloc_frames(count: usize) -> PhysAddr {
    if count == 0 {
        return PhysAddr::zero();
    }
    with(|pmm| pmm.allocate_frames(count))
        .map(|frame| frame.start_address())
        .unwrap_or_else(|| panic!("out of physical memory ({count} contiguous frames requested)"))
}

/// Drops a reference on each of `count` contiguous frames starting at
/// `addr`; frames with no remaining references are freed. `count == 0`
/// is a no-op.
pub fn free_frames(addr: PhysAddr, count: usize) {
    if count == 0 {
        return;
    }
    let result = with(|pmm| {
        // SAFETY: the public contract of free_frames mirrors
        // deallocate_frames; callers pass frames from alloc_frames.
        unsafe { pmm.deallocate_frames(PhysFrame::containing_address(addr), count) }
    });
    if let Err(err) = result {
        kdebug!("pmm: free_frames({:#x}, {}) failed: {}", addr, count, err);
    }
}

/// Takes an additional reference on a frame through the global allocator.
pub fn frame_ref(addr: PhysAddr) -> Result<(), PmmError> {
    with(|pmm| pmm.frame_ref(addr))
}

/// Drops a reference on a frame through the global allocator.
pub fn frame_unref(addr: PhysAddr) -> Result<u16, PmmError> {
    with(|pmm| pmm.frame_unref(addr))
}

/// [`FrameAllocator`] / [`FrameDeallocator`] views of the global
/// allocator, taking the PMM lock per call.
pub struct GlobalFrames;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        with(BitmapAllocator::allocate_frame)
    }
}

unsafe impl FrameDeallocator<Size4KiB> for GlobalFrames {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = with(|pmm| {
            // SAFETY: forwarded from the caller.
            unsafe { pmm.deallocate_frame(frame) }
        });
    }
}
