//! Demand paging: page faults turn address-space intent into mappings.
//!
//! Areas inserted into an [`MmInfo`] are not mapped up front. The first
//! access faults, and [`mm_fault`] allocates a frame, fills it (zeros or
//! file contents), and maps it with the area's rights. A fault that no
//! area covers, or that the area's rights forbid, is reported back as a
//! signal for the caller to deliver.

use core::fmt;

use baryon_core::addr::VirtAddr;
use baryon_core::paging::{Page, Size4KiB};

use crate::mapper::PageWalker;
use crate::vma::{MmInfo, VmFlags};
use crate::{FrameAllocator, FrameDeallocator, PAGE_SIZE};

/// What the faulting instruction was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Execute,
}

impl AccessKind {
    /// The area right this access requires.
    fn required(self) -> VmFlags {
        match self {
            Self::Read => VmFlags::READ,
            Self::Write => VmFlags::WRITE,
            Self::Execute => VmFlags::EXEC,
        }
    }
}

/// An unrecoverable fault, to be delivered to the faulting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    /// No area covers the address, or the area forbids the access.
    SegmentationFault,
    /// The backing file could not be read.
    BusError,
}

impl fmt::Display for FaultSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentationFault => write!(f, "segmentation fault"),
            Self::BusError => write!(f, "bus error"),
        }
    }
}

/// Handles a page fault at `addr` in address space `mm`.
///
/// On success the faulting page is mapped and the access can be retried.
/// Permissions are checked before any allocation, so a denied fault has
/// no side effects.
///
/// # Panics
///
/// - When physical memory is exhausted.
/// - When the faulting page already has a present mapping: the hardware
///   only raises such faults for permission violations, which the area
///   check has already passed, so a present entry means corrupted state.
///
/// # Safety
///
/// - `walker` must be valid for `mm.root`.
/// - `phys_base` must be the direct-map offset covering every allocated
///   frame.
pub unsafe fn mm_fault<W, A>(
    mm: &mut MmInfo,
    walker: &W,
    phys_base: u64,
    addr: VirtAddr,
    access: AccessKind,
    alloc: &mut A,
) -> Result<(), FaultSignal>
where
    W: PageWalker,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let page_addr = addr.align_down(PAGE_SIZE as u64);

    let (flags, area_start, backing) = {
        let vma = mm.find_vma(addr).ok_or(FaultSignal::SegmentationFault)?;
        if !vma.flags.contains(access.required()) {
            return Err(FaultSignal::SegmentationFault);
        }
        (vma.flags, vma.start, vma.backing.clone())
    };

    let frame = alloc
        .allocate_frame()
        .expect("out of physical memory handling a page fault");
    let frame_ptr = (phys_base + frame.start_address().as_u64()) as *mut u8;
    // SAFETY: the frame is fresh and direct-mapped at phys_base.
    unsafe { core::ptr::write_bytes(frame_ptr, 0, PAGE_SIZE) };

    if let Some(backing) = backing {
        let page_off = page_addr.as_u64() - area_start.as_u64();
        if page_off < backing.len {
            let to_read = PAGE_SIZE.min((backing.len - page_off) as usize);
            // SAFETY: the frame is private until mapped below.
            let buf = unsafe { core::slice::from_raw_parts_mut(frame_ptr, to_read) };
            // Short reads leave the zeroed tail in place.
            if backing.file.read_at(backing.offset + page_off, buf).is_err() {
                // SAFETY: the frame was never mapped.
                unsafe { alloc.deallocate_frame(frame) };
                return Err(FaultSignal::BusError);
            }
        }
    }

    // SAFETY: root validity forwarded from the caller; alloc hands out
    // fresh frames.
    let flush = unsafe {
        walker
            .map(
                mm.root,
                Page::containing_address(page_addr),
                frame,
                flags.map_flags(),
                &mut || {
                    alloc
                        .allocate_frame()
                        .expect("out of physical memory for page tables")
                },
            )
            .unwrap_or_else(|_| {
                panic!("page fault on present mapping at {page_addr:#x}")
            })
    };
    // The entry was non-present, so nothing stale can be cached.
    flush.ignore();

    mm.total_resident += PAGE_SIZE;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPhys;
    use crate::vma::{FileBacking, VmArea, VmFile, VmFileError};
    use crate::walk4::FourLevelWalker;
    use std::sync::Arc;

    fn page(n: u64) -> VirtAddr {
        VirtAddr::new(n * PAGE_SIZE as u64)
    }

    struct Fixture {
        phys: TestPhys,
        walker: FourLevelWalker,
        mm: MmInfo,
    }

    impl Fixture {
        fn new() -> Self {
            let mut phys = TestPhys::new(64);
            let walker = FourLevelWalker::new(phys.phys_base());
            let root = phys.allocate_frame().unwrap().start_address();
            let mm = MmInfo::new(root);
            Self { phys, walker, mm }
        }

        fn fault(&mut self, addr: VirtAddr, access: AccessKind) -> Result<(), FaultSignal> {
            let phys_base = self.phys.phys_base();
            unsafe {
                mm_fault(
                    &mut self.mm,
                    &self.walker,
                    phys_base,
                    addr,
                    access,
                    &mut self.phys,
                )
            }
        }

        fn byte_at(&self, addr: VirtAddr) -> u8 {
            let phys = unsafe { self.walker.translate(self.mm.root, addr) }.unwrap();
            unsafe { *self.phys.ptr_at(phys) }
        }
    }

    #[test]
    fn anonymous_fault_maps_a_zeroed_page() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::anonymous(
                page(2),
                page(4),
                VmFlags::READ | VmFlags::WRITE,
            ))
            .unwrap();

        fx.fault(page(2) + 0x40u64, AccessKind::Write).unwrap();
        assert_eq!(fx.mm.total_resident, PAGE_SIZE);
        assert_eq!(fx.byte_at(page(2) + 0x40u64), 0);
        // Only the touched page was populated.
        assert!(unsafe { fx.walker.translate(fx.mm.root, page(3)) }.is_none());
    }

    #[test]
    fn fault_outside_any_area_is_a_segfault() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.fault(page(9), AccessKind::Read),
            Err(FaultSignal::SegmentationFault)
        );
    }

    #[test]
    fn denied_access_allocates_nothing() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::anonymous(page(2), page(3), VmFlags::READ))
            .unwrap();

        let in_use = fx.phys.in_use();
        assert_eq!(
            fx.fault(page(2), AccessKind::Write),
            Err(FaultSignal::SegmentationFault)
        );
        assert_eq!(
            fx.fault(page(2), AccessKind::Execute),
            Err(FaultSignal::SegmentationFault)
        );
        assert_eq!(fx.phys.in_use(), in_use);
        assert_eq!(fx.mm.total_resident, 0);
    }

    #[test]
    fn fault_then_unmap_round_trips_an_area() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::anonymous(
                page(2),
                page(5),
                VmFlags::READ | VmFlags::WRITE,
            ))
            .unwrap();
        assert_eq!(fx.mm.total_mapped, 3 * PAGE_SIZE);

        for i in 0..3u64 {
            fx.fault(page(2 + i), AccessKind::Write).unwrap();
        }
        assert_eq!(fx.mm.total_resident, 3 * PAGE_SIZE);

        // Three distinct zero-filled frames.
        let frames: Vec<_> = (0..3u64)
            .map(|i| unsafe { fx.walker.translate(fx.mm.root, page(2 + i)) }.unwrap())
            .collect();
        assert_ne!(frames[0], frames[1]);
        assert_ne!(frames[1], frames[2]);
        assert_ne!(frames[0], frames[2]);
        for i in 0..3u64 {
            assert_eq!(fx.byte_at(page(2 + i)), 0);
        }

        let in_use_mapped = fx.phys.in_use();
        unsafe { fx.mm.unmap_range(&fx.walker, page(2), 3 * PAGE_SIZE, &mut fx.phys) };

        assert_eq!(fx.mm.total_resident, 0);
        assert_eq!(fx.mm.total_mapped, 0);
        assert_eq!(fx.mm.area_count(), 0);
        for i in 0..3u64 {
            assert!(unsafe { fx.walker.translate(fx.mm.root, page(2 + i)) }.is_none());
        }
        // The three leaf frames come back; intermediate tables stay.
        assert_eq!(fx.phys.in_use(), in_use_mapped - 3);
    }

    /// Serves `(offset + i) % 251` at every byte, up to a fixed length.
    struct PatternFile {
        len: u64,
    }

    impl VmFile for PatternFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmFileError> {
            let available = self.len.saturating_sub(offset) as usize;
            let n = buf.len().min(available);
            for (i, b) in buf[..n].iter_mut().enumerate() {
                *b = ((offset + i as u64) % 251) as u8;
            }
            Ok(n)
        }
    }

    #[test]
    fn file_backed_fault_reads_the_file() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::file_backed(
                page(4),
                page(6),
                VmFlags::READ,
                FileBacking {
                    file: Arc::new(PatternFile { len: 1 << 20 }),
                    offset: 0x80,
                    len: 2 * PAGE_SIZE as u64,
                },
            ))
            .unwrap();

        // Second page of the area: file offset 0x80 + PAGE_SIZE.
        fx.fault(page(5), AccessKind::Read).unwrap();
        let expected = (0x80 + PAGE_SIZE as u64) % 251;
        assert_eq!(fx.byte_at(page(5)), expected as u8);
    }

    #[test]
    fn data_past_the_file_window_is_zero() {
        let mut fx = Fixture::new();
        // One page of file data, one page of zero fill (ELF-style BSS).
        fx.mm
            .insert(VmArea::file_backed(
                page(4),
                page(6),
                VmFlags::READ,
                FileBacking {
                    file: Arc::new(PatternFile { len: 1 << 20 }),
                    offset: 0,
                    len: PAGE_SIZE as u64 + 16,
                },
            ))
            .unwrap();

        fx.fault(page(5), AccessKind::Read).unwrap();
        // First 16 bytes come from the file, the rest is zero.
        assert_eq!(fx.byte_at(page(5)), (PAGE_SIZE as u64 % 251) as u8);
        assert_eq!(fx.byte_at(page(5) + 16u64), 0);
        assert_eq!(fx.byte_at(page(5) + 0x800u64), 0);
    }

    struct BrokenFile;

    impl VmFile for BrokenFile {
        fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, VmFileError> {
            Err(VmFileError::Io)
        }
    }

    #[test]
    fn failed_file_read_is_a_bus_error_and_frees_the_frame() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::file_backed(
                page(4),
                page(5),
                VmFlags::READ,
                FileBacking {
                    file: Arc::new(BrokenFile),
                    offset: 0,
                    len: PAGE_SIZE as u64,
                },
            ))
            .unwrap();

        let in_use = fx.phys.in_use();
        assert_eq!(fx.fault(page(4), AccessKind::Read), Err(FaultSignal::BusError));
        assert_eq!(fx.phys.in_use(), in_use);
        assert!(unsafe { fx.walker.translate(fx.mm.root, page(4)) }.is_none());
    }

    #[test]
    #[should_panic(expected = "present mapping")]
    fn fault_on_a_present_page_panics() {
        let mut fx = Fixture::new();
        fx.mm
            .insert(VmArea::anonymous(
                page(2),
                page(3),
                VmFlags::READ | VmFlags::WRITE,
            ))
            .unwrap();

        fx.fault(page(2), AccessKind::Write).unwrap();
        // A second hardware fault on the same present page means the
        // fault reporting is broken; there is no copy-on-write to do.
        let _ = fx.fault(page(2), AccessKind::Write);
    }
}
