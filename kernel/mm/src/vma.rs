//! Virtual memory areas: the per-process record of what an address space
//! should contain.
//!
//! An address space is a sorted, non-overlapping list of [`VmArea`]s.
//! Nothing here touches page tables except [`MmInfo::unmap_range`]; the
//! areas describe intent, and the page fault handler in [`crate::fault`]
//! populates pages on first touch.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_core::paging::{Page, Size4KiB};

use crate::layout::{USER_BASE, USER_TOP};
use crate::mapper::{MapFlags, PageWalker};
use crate::{FrameDeallocator, PAGE_SIZE};

bitflags::bitflags! {
    /// Access rights of a virtual memory area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// Readable.
        const READ   = 1 << 0;
        /// Writable.
        const WRITE  = 1 << 1;
        /// Executable.
        const EXEC   = 1 << 2;
        /// Shared between address spaces (not copied on fork).
        const SHARED = 1 << 3;
    }
}

impl VmFlags {
    /// The page table flags for a user mapping with these rights.
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.contains(Self::WRITE) {
            flags |= MapFlags::WRITABLE;
        }
        if self.contains(Self::EXEC) {
            flags |= MapFlags::EXECUTABLE;
        }
        flags
    }
}

/// Error from a backing file read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFileError {
    /// The read failed.
    Io,
}

impl fmt::Display for VmFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "backing file read failed"),
        }
    }
}

/// A file that can back a memory area.
pub trait VmFile: Send + Sync {
    /// Reads at `offset` into `buf`, returning the bytes read. Short
    /// reads past end of file are not errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmFileError>;
}

/// File contents behind part of an area, ELF-segment style: `len` bytes
/// from `offset` are file data, anything past that is zero-filled.
#[derive(Clone)]
pub struct FileBacking {
    /// The backing file.
    pub file: Arc<dyn VmFile>,
    /// Byte offset of this area's data within the file.
    pub offset: u64,
    /// Bytes of file data; the rest of the area reads as zeros.
    pub len: u64,
}

impl FileBacking {
    /// Moves the window forward, for trimming an area's front.
    fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
        self.len = self.len.saturating_sub(bytes);
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// One contiguous region of a user address space. `start` and `end` are
/// page-aligned and `start < end`.
#[derive(Debug, Clone)]
pub struct VmArea {
    /// First address of the area.
    pub start: VirtAddr,
    /// One past the last address.
    pub end: VirtAddr,
    /// Access rights.
    pub flags: VmFlags,
    /// File contents, or `None` for anonymous zero-filled memory.
    pub backing: Option<FileBacking>,
}

impl VmArea {
    /// Creates an anonymous area.
    pub fn anonymous(start: VirtAddr, end: VirtAddr, flags: VmFlags) -> Self {
        Self {
            start,
            end,
            flags,
            backing: None,
        }
    }

    /// Creates a file-backed area.
    pub fn file_backed(start: VirtAddr, end: VirtAddr, flags: VmFlags, backing: FileBacking) -> Self {
        Self {
            start,
            end,
            flags,
            backing: Some(backing),
        }
    }

    /// Whether `addr` lies inside the area.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Size of the area in bytes.
    pub fn len(&self) -> usize {
        (self.end.as_u64() - self.start.as_u64()) as usize
    }

    /// Whether the area is empty. Never true for a validly inserted area.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Error from address space modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// The new area overlaps an existing one.
    Overlap,
    /// Start or end is unaligned, reversed, or outside user space.
    BadRange,
    /// No free range of the requested size exists.
    NoSpace,
}

impl fmt::Display for VmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap => write!(f, "area overlaps an existing mapping"),
            Self::BadRange => write!(f, "invalid area range"),
            Self::NoSpace => write!(f, "no free range large enough"),
        }
    }
}

/// Bounds of the classic program segments. The area list is
/// authoritative; these are bookkeeping for the loader and the syscall
/// layer (`brk`, stack growth).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    /// Program text.
    pub start_code: VirtAddr,
    /// One past the program text.
    pub end_code: VirtAddr,
    /// Initialized data.
    pub start_data: VirtAddr,
    /// One past the initialized data.
    pub end_data: VirtAddr,
    /// Bottom of the heap.
    pub start_brk: VirtAddr,
    /// Current program break.
    pub brk: VirtAddr,
    /// Initial stack top.
    pub start_stack: VirtAddr,
}

impl SegmentBounds {
    const fn zeroed() -> Self {
        Self {
            start_code: VirtAddr::zero(),
            end_code: VirtAddr::zero(),
            start_data: VirtAddr::zero(),
            end_data: VirtAddr::zero(),
            start_brk: VirtAddr::zero(),
            brk: VirtAddr::zero(),
            start_stack: VirtAddr::zero(),
        }
    }
}

/// A user address space: its root table and the sorted area list.
pub struct MmInfo {
    /// Physical address of the root page table.
    pub root: PhysAddr,
    /// Areas sorted by start address, non-overlapping.
    vmas: Vec<VmArea>,
    /// Program segment bounds.
    pub segments: SegmentBounds,
    /// Bytes reserved by areas, accumulated by [`insert`](Self::insert)
    /// and released by [`unmap_range`](Self::unmap_range).
    pub total_mapped: usize,
    /// Bytes currently backed by frames, maintained by the fault handler
    /// and [`unmap_range`](Self::unmap_range).
    pub total_resident: usize,
}

impl MmInfo {
    /// Creates an empty address space over `root`.
    pub fn new(root: PhysAddr) -> Self {
        Self {
            root,
            vmas: Vec::new(),
            segments: SegmentBounds::zeroed(),
            total_mapped: 0,
            total_resident: 0,
        }
    }

    /// Index of the first area with `start > addr`.
    fn upper_bound(&self, addr: VirtAddr) -> usize {
        self.vmas.partition_point(|vma| vma.start <= addr)
    }

    /// Returns the area containing `addr`.
    pub fn find_vma(&self, addr: VirtAddr) -> Option<&VmArea> {
        let idx = self.upper_bound(addr).checked_sub(1)?;
        let vma = &self.vmas[idx];
        vma.contains(addr).then_some(vma)
    }

    /// Returns the closest area that ends at or before `addr`.
    pub fn find_prev_vma(&self, addr: VirtAddr) -> Option<&VmArea> {
        self.vmas
            .iter()
            .rev()
            .find(|vma| vma.end.as_u64() <= addr.as_u64())
    }

    /// Inserts a new area, keeping the list sorted and accumulating its
    /// size into [`total_mapped`](Self::total_mapped).
    pub fn insert(&mut self, vma: VmArea) -> Result<(), VmaError> {
        let start = vma.start.as_u64();
        let end = vma.end.as_u64();
        if start >= end
            || start % PAGE_SIZE as u64 != 0
            || end % PAGE_SIZE as u64 != 0
            || start < USER_BASE
            || end > USER_TOP
        {
            return Err(VmaError::BadRange);
        }

        let idx = self.upper_bound(vma.start);
        if idx > 0 && self.vmas[idx - 1].end.as_u64() > start {
            return Err(VmaError::Overlap);
        }
        if idx < self.vmas.len() && self.vmas[idx].start.as_u64() < end {
            return Err(VmaError::Overlap);
        }
        self.total_mapped += vma.len();
        self.vmas.insert(idx, vma);
        Ok(())
    }

    /// Finds an unused range of `len` bytes at or above `hint`.
    pub fn find_free_range(&self, hint: VirtAddr, len: usize) -> Option<VirtAddr> {
        let len = len.next_multiple_of(PAGE_SIZE) as u64;
        if len == 0 {
            return None;
        }
        let mut candidate = hint.as_u64().max(USER_BASE).next_multiple_of(PAGE_SIZE as u64);
        for vma in &self.vmas {
            if vma.end.as_u64() <= candidate {
                continue;
            }
            if candidate + len <= vma.start.as_u64() {
                break;
            }
            candidate = vma.end.as_u64();
        }
        (candidate + len <= USER_TOP).then(|| VirtAddr::new(candidate))
    }

    /// Reserves exactly `[start, start + len)`, with `len` rounded up to
    /// whole pages.
    pub fn reserve_at(
        &mut self,
        start: VirtAddr,
        len: usize,
        flags: VmFlags,
        backing: Option<FileBacking>,
    ) -> Result<VirtAddr, VmaError> {
        let len = len.next_multiple_of(PAGE_SIZE);
        if len == 0 {
            return Err(VmaError::BadRange);
        }
        self.insert(VmArea {
            start,
            end: start + len as u64,
            flags,
            backing,
        })?;
        Ok(start)
    }

    /// Reserves `len` bytes at the first free range at or after `hint`.
    pub fn reserve_after(
        &mut self,
        hint: VirtAddr,
        len: usize,
        flags: VmFlags,
        backing: Option<FileBacking>,
    ) -> Result<VirtAddr, VmaError> {
        let start = self.find_free_range(hint, len).ok_or(VmaError::NoSpace)?;
        self.reserve_at(start, len, flags, backing)
    }

    /// Number of areas, for diagnostics and tests.
    pub fn area_count(&self) -> usize {
        self.vmas.len()
    }

    /// Iterates the areas in address order.
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.vmas.iter()
    }

    /// Removes `[start, start + len)` from the address space: present
    /// pages are unmapped and their frames returned, and intersecting
    /// areas are trimmed, removed, or split.
    ///
    /// # Safety
    ///
    /// `walker` must be valid for this address space's root table, and the
    /// frames mapped in the range must be exclusively owned by it.
    pub unsafe fn unmap_range<W, D>(
        &mut self,
        walker: &W,
        start: VirtAddr,
        len: usize,
        dealloc: &mut D,
    ) where
        W: PageWalker,
        D: FrameDeallocator<Size4KiB>,
    {
        let start = start.align_down(PAGE_SIZE as u64);
        let len = len.next_multiple_of(PAGE_SIZE);
        let end = start + len as u64;

        let pages = (len / PAGE_SIZE) as u64;
        for i in 0..pages {
            let page = Page::containing_address(start + i * PAGE_SIZE as u64);
            // SAFETY: forwarded from the caller. Holes from never-faulted
            // pages are expected and skipped.
            if let Ok((frame, flush)) = unsafe { walker.unmap(self.root, page) } {
                flush.flush();
                // SAFETY: the frame belonged to this address space alone.
                unsafe { dealloc.deallocate_frame(frame) };
                self.total_resident -= PAGE_SIZE;
            }
        }

        let mut i = 0;
        while i < self.vmas.len() {
            let (vma_start, vma_end) = (self.vmas[i].start, self.vmas[i].end);
            if vma_end <= start || vma_start >= end {
                i += 1;
                continue;
            }
            let cut = vma_end.as_u64().min(end.as_u64()) - vma_start.as_u64().max(start.as_u64());
            self.total_mapped -= cut as usize;
            let vma = &mut self.vmas[i];
            if vma.start >= start && vma.end <= end {
                self.vmas.remove(i);
                continue;
            }
            if vma.start < start && vma.end > end {
                // The range is strictly inside one area: split it.
                let mut tail = vma.clone();
                tail.start = end;
                if let Some(backing) = &mut tail.backing {
                    backing.advance(end.as_u64() - vma.start.as_u64());
                }
                vma.end = start;
                self.vmas.insert(i + 1, tail);
                return;
            }
            if vma.start < start {
                vma.end = start;
            } else {
                if let Some(backing) = &mut vma.backing {
                    backing.advance(end.as_u64() - vma.start.as_u64());
                }
                vma.start = end;
            }
            i += 1;
        }
    }
}
