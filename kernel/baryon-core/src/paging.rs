//! Typed page and frame abstractions.
//!
//! [`Page<S>`] and [`PhysFrame<S>`] wrap aligned virtual and physical
//! addresses, parameterised over a [`PageSize`]. Baryon maps everything with
//! 4 KiB pages, but the size parameter keeps alignment guarantees explicit in
//! signatures.

use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::ops::{Add, Sub};

use crate::addr::{PhysAddr, VirtAddr};

/// Trait for page sizes.
pub trait PageSize: Copy + Eq + PartialOrd + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const SIZE_AS_DEBUG_STR: &'static str;
}

/// 4 KiB page size, the only size Baryon maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 4096;
    const SIZE_AS_DEBUG_STR: &'static str = "4KiB";
}

/// Error type returned when an address is not aligned to the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

/// A virtual memory page of size `S`.
///
/// The contained [`VirtAddr`] is always aligned to `S::SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page<S: PageSize> {
    start: VirtAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> Page<S> {
    /// Returns the page containing the given virtual address (aligns down).
    #[inline]
    pub fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a page from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this page.
    #[inline]
    pub const fn start_address(&self) -> VirtAddr {
        self.start
    }

    /// Returns the page size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }

    /// Creates an iterator over the half-open page range `[start, end)`.
    #[inline]
    pub fn range(start: Page<S>, end: Page<S>) -> PageRange<S> {
        PageRange { start, end }
    }

    /// Creates an iterator over `count` consecutive pages starting at `start`.
    #[inline]
    pub fn range_length(start: Page<S>, count: u64) -> PageRange<S> {
        PageRange {
            start,
            end: start + count,
        }
    }
}

impl<S: PageSize> Add<u64> for Page<S> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Page::containing_address(self.start + rhs * S::SIZE)
    }
}

impl<S: PageSize> Sub<u64> for Page<S> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Page::containing_address(self.start - rhs * S::SIZE)
    }
}

impl<S: PageSize> fmt::Debug for Page<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

/// A physical memory frame of size `S`.
///
/// The contained [`PhysAddr`] is always aligned to `S::SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame<S: PageSize> {
    start: PhysAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> PhysFrame<S> {
    /// Returns the frame containing the given physical address (aligns down).
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a frame from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Returns the frame size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }

    /// Creates an iterator over the half-open frame range `[start, end)`.
    #[inline]
    pub fn range(start: PhysFrame<S>, end: PhysFrame<S>) -> PhysFrameRange<S> {
        PhysFrameRange { start, end }
    }

    /// Creates an iterator over `count` consecutive frames starting at
    /// `start`.
    #[inline]
    pub fn range_length(start: PhysFrame<S>, count: u64) -> PhysFrameRange<S> {
        PhysFrameRange {
            start,
            end: start + count,
        }
    }
}

impl<S: PageSize> Add<u64> for PhysFrame<S> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start + rhs * S::SIZE)
    }
}

impl<S: PageSize> Sub<u64> for PhysFrame<S> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start - rhs * S::SIZE)
    }
}

impl<S: PageSize> fmt::Debug for PhysFrame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysFrame[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

/// An iterator over a range of [`Page`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageRange<S: PageSize> {
    start: Page<S>,
    end: Page<S>,
}

impl<S: PageSize> Iterator for PageRange<S> {
    type Item = Page<S>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start.as_u64() < self.end.start.as_u64() {
            let page = self.start;
            self.start = self.start + 1;
            Some(page)
        } else {
            None
        }
    }
}

impl<S: PageSize> FusedIterator for PageRange<S> {}

/// An iterator over a range of [`PhysFrame`]s.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysFrameRange<S: PageSize> {
    start: PhysFrame<S>,
    end: PhysFrame<S>,
}

impl<S: PageSize> Iterator for PhysFrameRange<S> {
    type Item = PhysFrame<S>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start.as_u64() < self.end.start.as_u64() {
            let frame = self.start;
            self.start = self.start + 1;
            Some(frame)
        } else {
            None
        }
    }
}

impl<S: PageSize> FusedIterator for PhysFrameRange<S> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_address() {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1234));
        assert_eq!(page.start_address().as_u64(), 0x1000);
        assert_eq!(page.size(), 4096);
    }

    #[test]
    fn page_from_start_address() {
        assert!(Page::<Size4KiB>::from_start_address(VirtAddr::new(0x2000)).is_ok());
        assert_eq!(
            Page::<Size4KiB>::from_start_address(VirtAddr::new(0x2001)).unwrap_err(),
            AddressNotAligned
        );
    }

    #[test]
    fn page_add_sub() {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1000));
        assert_eq!((page + 3).start_address().as_u64(), 0x4000);
        assert_eq!((page + 3 - 1).start_address().as_u64(), 0x3000);
    }

    #[test]
    fn frame_containing_address() {
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x5678));
        assert_eq!(frame.start_address().as_u64(), 0x5000);
    }

    #[test]
    fn frame_from_start_address() {
        assert!(PhysFrame::<Size4KiB>::from_start_address(PhysAddr::new(0x3000)).is_ok());
        assert_eq!(
            PhysFrame::<Size4KiB>::from_start_address(PhysAddr::new(0x3001)).unwrap_err(),
            AddressNotAligned
        );
    }

    #[test]
    fn page_range_length() {
        let start = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1000));
        let pages: Vec<_> = Page::range_length(start, 3).collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].start_address().as_u64(), 0x1000);
        assert_eq!(pages[2].start_address().as_u64(), 0x3000);
    }

    #[test]
    fn frame_range_iterator() {
        let start = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x0));
        let end = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x2000));
        let frames: Vec<_> = PhysFrame::range(start, end).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].start_address().as_u64(), 0x1000);
    }

    #[test]
    fn empty_range() {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1000));
        assert!(Page::range(page, page).next().is_none());
        assert!(Page::range_length(page, 0).next().is_none());
    }
}
