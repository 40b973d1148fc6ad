//! Kernel virtual address space layout.
//!
//! Fixed carve-up of the kernel half of the address space. The 64-bit
//! layout follows the usual higher-half scheme: a direct map of all
//! physical memory, a 1 TiB window for kernel virtual allocations, and the
//! kernel image at the top 2 GiB. The 32-bit layout squeezes the same
//! regions into the 3 GiB+ quarter.

use baryon_core::addr::VirtAddr;

/// Base of the physical direct map (all of RAM, offset-mapped).
#[cfg(target_pointer_width = "64")]
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel virtual allocation window.
#[cfg(target_pointer_width = "64")]
pub const KERNEL_WINDOW_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Size of the kernel virtual allocation window: 1 TiB.
#[cfg(target_pointer_width = "64")]
pub const KERNEL_WINDOW_SIZE: u64 = 1 << 40;

/// Virtual base of the kernel image.
#[cfg(target_pointer_width = "64")]
pub const KERNEL_IMAGE_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Lowest user-space address (the null page is never mapped).
#[cfg(target_pointer_width = "64")]
pub const USER_BASE: u64 = 0x1000;

/// One past the highest user-space address.
#[cfg(target_pointer_width = "64")]
pub const USER_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Base of the physical direct map (all of RAM, offset-mapped).
#[cfg(target_pointer_width = "32")]
pub const PHYS_MAP_BASE: u64 = 0xC000_0000;

/// Base of the kernel virtual allocation window.
#[cfg(target_pointer_width = "32")]
pub const KERNEL_WINDOW_BASE: u64 = 0xE000_0000;

/// Size of the kernel virtual allocation window: 256 MiB.
#[cfg(target_pointer_width = "32")]
pub const KERNEL_WINDOW_SIZE: u64 = 0x1000_0000;

/// Virtual base of the kernel image.
#[cfg(target_pointer_width = "32")]
pub const KERNEL_IMAGE_BASE: u64 = 0xC010_0000;

/// Lowest user-space address (the null page is never mapped).
#[cfg(target_pointer_width = "32")]
pub const USER_BASE: u64 = 0x1000;

/// One past the highest user-space address.
#[cfg(target_pointer_width = "32")]
pub const USER_TOP: u64 = 0xC000_0000;

/// A contiguous virtual address region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtRegion {
    start: VirtAddr,
    size: u64,
}

impl VirtRegion {
    /// Creates a region from a start address and a size in bytes.
    pub const fn new(start: VirtAddr, size: u64) -> Self {
        Self { start, size }
    }

    /// Returns the start address.
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns one past the last address.
    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    /// Returns `true` if `addr` falls inside the region.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// The kernel virtual allocation window as a [`VirtRegion`].
pub fn kernel_window() -> VirtRegion {
    VirtRegion::new(
        VirtAddr::new_truncate(KERNEL_WINDOW_BASE),
        KERNEL_WINDOW_SIZE,
    )
}
