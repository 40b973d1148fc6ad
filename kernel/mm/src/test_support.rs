//! Shared test helpers: a simulated bank of physical memory.
//!
//! Frames are identified by their byte offset into an aligned heap buffer,
//! and the buffer's base address doubles as the physical-map offset, so
//! `phys_base + phys` lands inside the buffer exactly like the direct map
//! does on real hardware.

use core::alloc::Layout;

use baryon_core::addr::PhysAddr;
use baryon_core::paging::{PhysFrame, Size4KiB};

use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE};

pub(crate) struct TestPhys {
    base: *mut u8,
    layout: Layout,
    frames: usize,
    next: usize,
    freed: Vec<u64>,
}

impl TestPhys {
    /// Allocates a zeroed bank of `frames` 4 KiB frames.
    pub(crate) fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            base,
            layout,
            frames,
            next: 0,
            freed: Vec::new(),
        }
    }

    /// The physical-map offset: adding a frame offset yields a host pointer.
    pub(crate) fn phys_base(&self) -> u64 {
        self.base as u64
    }

    /// Host pointer for a simulated physical address.
    pub(crate) fn ptr_at(&self, phys: PhysAddr) -> *mut u8 {
        assert!((phys.as_u64() as usize) < self.frames * PAGE_SIZE);
        // SAFETY: checked to be inside the buffer.
        unsafe { self.base.add(phys.as_u64() as usize) }
    }

    /// Number of frames handed out and not yet returned.
    pub(crate) fn in_use(&self) -> usize {
        self.next - self.freed.len()
    }
}

unsafe impl FrameAllocator<Size4KiB> for TestPhys {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let offset = if let Some(offset) = self.freed.pop() {
            // Re-zero recycled frames; callers expect zeroed table frames.
            // SAFETY: the offset was previously handed out from this bank.
            unsafe {
                core::ptr::write_bytes(self.base.add(offset as usize), 0, PAGE_SIZE);
            }
            offset
        } else {
            if self.next >= self.frames {
                return None;
            }
            let offset = (self.next * PAGE_SIZE) as u64;
            self.next += 1;
            offset
        };
        Some(PhysFrame::containing_address(PhysAddr::new(offset)))
    }
}

unsafe impl FrameDeallocator<Size4KiB> for TestPhys {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let offset = frame.start_address().as_u64();
        assert!((offset as usize) < self.frames * PAGE_SIZE);
        assert!(!self.freed.contains(&offset), "double free of test frame");
        self.freed.push(offset);
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the stored layout.
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}
