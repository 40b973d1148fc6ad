//! Memory management for the Baryon kernel.
//!
//! This crate implements the whole memory stack above the boot memory map:
//!
//! - [`pmm`]: bitmap-based physical frame allocator with per-frame
//!   reference counts.
//! - [`walk4`] / [`walk2`]: 4-level (x86_64) and 2-level (32-bit x86) page
//!   table walkers behind the common [`mapper::PageWalker`] trait.
//! - [`kvspace`]: kernel virtual window allocator and page mapping for
//!   kernel allocations and physical (MMIO) windows.
//! - [`heap`]: size-class slab allocator backing `kmalloc` and
//!   `#[global_allocator]`.
//! - [`vma`] / [`fault`]: per-process region lists and the demand-paging
//!   page fault handler.
//!
//! Everything is written to be exercised from host tests: page tables and
//! frame contents are reached through a physical-map offset, which tests
//! point at an ordinary heap buffer.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fault;
pub mod heap;
pub mod kvspace;
pub mod layout;
pub mod mapper;
pub mod pmm;
pub mod vma;
pub mod walk2;
pub mod walk4;

#[cfg(test)]
pub(crate) mod test_support;

use core::fmt;

use baryon_core::addr::PhysAddr;
use baryon_core::paging::{PageSize, PhysFrame};

/// Size of a page / physical frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Mask covering the in-page offset bits.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// The page table walker for the compilation target's paging mode.
#[cfg(target_pointer_width = "64")]
pub type NativeWalker = walk4::FourLevelWalker;

/// The page table walker for the compilation target's paging mode.
#[cfg(target_pointer_width = "32")]
pub type NativeWalker = walk2::TwoLevelWalker;

/// Classification of a physical memory region from the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Free RAM, available to the frame allocator.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables; reclaimable after they have been parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM reported by the firmware.
    BadRam,
}

/// A physical memory region described by the bootloader.
///
/// The boot code converts the multiboot2 memory map into a slice of these
/// before handing it to [`pmm::init`].
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// What the region holds.
    pub kind: RegionKind,
}

impl PhysMemoryRegion {
    /// Returns `true` if the frame allocator may hand out frames from this
    /// region.
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}

/// Errors from the physical frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No usable physical memory was described by the boot memory map.
    OutOfMemory,
    /// No usable region was large enough to hold the allocator metadata.
    NoMetadataRegion,
    /// A frame address is outside the tracked physical range.
    InvalidFrame,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::NoMetadataRegion => {
                write!(f, "no usable region large enough for allocator metadata")
            }
            Self::InvalidFrame => write!(f, "frame address outside tracked physical range"),
        }
    }
}

/// A source of physical frames.
///
/// # Safety
///
/// Implementations must return frames that are unused, tracked, and not
/// handed out twice without an intervening deallocation.
pub unsafe trait FrameAllocator<S: PageSize> {
    /// Allocates a single frame, or `None` if physical memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysFrame<S>>;
}

/// A sink for physical frames.
///
/// # Safety
///
/// Implementations must only be given frames previously produced by the
/// paired allocator.
pub unsafe trait FrameDeallocator<S: PageSize> {
    /// Returns a frame to the allocator.
    ///
    /// # Safety
    ///
    /// The frame must be unused and must have been allocated by the paired
    /// [`FrameAllocator`].
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<S>);
}
