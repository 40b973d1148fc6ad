//! 2-level page table walker (32-bit x86: PD -> PT).
//!
//! Entries are 32 bits wide and each table holds 1024 of them, so one
//! page directory covers the full 4 GiB address space with 4 MiB per page
//! table. There is no NX bit: [`crate::mapper::MapFlags::EXECUTABLE`] is
//! accepted and ignored. Physical addresses are limited to 32 bits (no
//! PAE).

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_core::paging::{Page, PhysFrame, Size4KiB};

use crate::mapper::{MapError, MapFlags, MapFlush, PageWalker, UnmapError};
use crate::PAGE_SIZE;

/// Physical address mask of a 32-bit page table entry: bits 12..31.
pub const ENTRY_ADDR_MASK: u32 = 0xFFFF_F000;

bitflags::bitflags! {
    /// 32-bit x86 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY         = 1 << 6;
        /// Global page (requires CR4.PGE).
        const GLOBAL        = 1 << 8;
    }
}

/// A single 32-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys` with the given flags.
    ///
    /// `phys` must fit in 32 bits; higher bits are unrepresentable
    /// without PAE.
    pub const fn new(phys: PhysAddr, flags: EntryFlags) -> Self {
        debug_assert!(phys.as_u64() <= u32::MAX as u64);
        Self((phys.as_u64() as u32 & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        // SAFETY: a 32-bit value always fits in the physical space.
        unsafe { PhysAddr::new_unchecked((self.0 & ENTRY_ADDR_MASK) as u64) }
    }

    /// Returns the flag bits of this entry.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !ENTRY_ADDR_MASK)
    }
}

/// A 4 KiB page table holding 1024 entries.
#[repr(C, align(4096))]
pub struct Table {
    /// The entries of this table.
    pub entries: [Entry; 1024],
}

/// The 2-level page table walker.
pub struct TwoLevelWalker {
    phys_base: u64,
}

impl TwoLevelWalker {
    /// Creates a walker that reads tables at `phys_base + phys`.
    pub const fn new(phys_base: u64) -> Self {
        Self { phys_base }
    }

    /// Returns a mutable reference to the table at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point to a 4 KiB-aligned page table frame reachable
    /// through the direct map.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut Table {
        unsafe { &mut *((self.phys_base + phys.as_u64()) as *mut Table) }
    }

    /// Walks to the page table entry for `virt` without allocating.
    ///
    /// # Safety
    ///
    /// `root` must be a valid page directory frame.
    unsafe fn leaf_entry(&self, root: PhysAddr, virt: VirtAddr) -> Option<&mut Entry> {
        let pd = unsafe { self.table_at(root) };
        let pde = pd.entries[virt.pd32_index()];
        if !pde.is_present() {
            return None;
        }
        let pt = unsafe { self.table_at(pde.address()) };
        Some(&mut pt.entries[virt.pt32_index()])
    }

    fn leaf_flags(flags: MapFlags) -> EntryFlags {
        let mut native = EntryFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            native |= EntryFlags::WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            native |= EntryFlags::USER;
        }
        if flags.contains(MapFlags::GLOBAL) {
            native |= EntryFlags::GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            native |= EntryFlags::CACHE_DISABLE;
        }
        native
    }

    fn intermediate_flags(leaf: EntryFlags) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if leaf.contains(EntryFlags::USER) {
            flags |= EntryFlags::USER;
        }
        flags
    }
}

// SAFETY: the walker writes only the 2-level tables reachable from `root`
// through the direct map, in the hardware entry format.
unsafe impl PageWalker for TwoLevelWalker {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> Result<MapFlush, MapError> {
        let virt = page.start_address();
        let native = Self::leaf_flags(flags);
        let intermediate = Self::intermediate_flags(native);

        // SAFETY: caller guarantees root is valid.
        let pd = unsafe { self.table_at(root) };
        let pde = pd.entries[virt.pd32_index()];
        let pt_phys = if pde.is_present() {
            let combined = pde.flags() | intermediate;
            if combined != pde.flags() {
                pd.entries[virt.pd32_index()] = Entry::new(pde.address(), combined);
            }
            pde.address()
        } else {
            let pt_frame = alloc().start_address();
            // SAFETY: the frame was just allocated; zeroing it prevents
            // stale data being read as present entries.
            unsafe {
                core::ptr::write_bytes(
                    (self.phys_base + pt_frame.as_u64()) as *mut u8,
                    0,
                    PAGE_SIZE,
                );
            }
            pd.entries[virt.pd32_index()] = Entry::new(pt_frame, intermediate);
            pt_frame
        };

        let pt = unsafe { self.table_at(pt_phys) };
        let entry = &mut pt.entries[virt.pt32_index()];
        if entry.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        *entry = Entry::new(frame.start_address(), native);
        Ok(MapFlush::new(virt))
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError> {
        let virt = page.start_address();
        // SAFETY: caller guarantees root is valid.
        let entry = unsafe { self.leaf_entry(root, virt) }.ok_or(UnmapError::NotMapped)?;
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }
        let frame = PhysFrame::containing_address(entry.address());
        *entry = Entry::empty();
        Ok((frame, MapFlush::new(virt)))
    }

    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: caller guarantees root is valid.
        let entry = unsafe { self.leaf_entry(root, virt) }?;
        if !entry.is_present() {
            return None;
        }
        Some(entry.address() + virt.page_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPhys;
    use crate::FrameAllocator;

    fn page(addr: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(addr))
    }

    #[test]
    fn map_then_translate() {
        let mut bank = TestPhys::new(16);
        let walker = TwoLevelWalker::new(bank.phys_base());
        let root = bank.allocate_frame().unwrap().start_address();
        let frame = bank.allocate_frame().unwrap();

        unsafe {
            walker
                .map(root, page(0xC010_0000), frame, MapFlags::WRITABLE, &mut || {
                    bank.allocate_frame().unwrap()
                })
                .unwrap()
                .ignore();
        }

        let phys = unsafe { walker.translate(root, VirtAddr::new(0xC010_0ABC)) };
        assert_eq!(phys, Some(frame.start_address() + 0xABC));
    }

    #[test]
    fn one_intermediate_table_per_4mib() {
        let mut bank = TestPhys::new(16);
        let walker = TwoLevelWalker::new(bank.phys_base());
        let root = bank.allocate_frame().unwrap().start_address();
        let f1 = bank.allocate_frame().unwrap();
        let f2 = bank.allocate_frame().unwrap();
        let before = bank.in_use();

        unsafe {
            walker
                .map(root, page(0x40_0000), f1, MapFlags::WRITABLE, &mut || {
                    bank.allocate_frame().unwrap()
                })
                .unwrap()
                .ignore();
            walker
                .map(root, page(0x40_1000), f2, MapFlags::WRITABLE, &mut || {
                    bank.allocate_frame().unwrap()
                })
                .unwrap()
                .ignore();
        }
        // Both pages sit in the same 4 MiB slot: one page table.
        assert_eq!(bank.in_use(), before + 1);
    }

    #[test]
    fn double_map_is_rejected() {
        let mut bank = TestPhys::new(16);
        let walker = TwoLevelWalker::new(bank.phys_base());
        let root = bank.allocate_frame().unwrap().start_address();
        let f1 = bank.allocate_frame().unwrap();
        let f2 = bank.allocate_frame().unwrap();

        unsafe {
            walker
                .map(root, page(0x2000), f1, MapFlags::WRITABLE, &mut || {
                    bank.allocate_frame().unwrap()
                })
                .unwrap()
                .ignore();
        }

        assert!(matches!(
            unsafe {
                walker.map(root, page(0x2000), f2, MapFlags::WRITABLE, &mut || bank
                    .allocate_frame()
                    .unwrap())
            },
            Err(MapError::AlreadyMapped)
        ));
    }

    #[test]
    fn unmap_round_trip() {
        let mut bank = TestPhys::new(16);
        let walker = TwoLevelWalker::new(bank.phys_base());
        let root = bank.allocate_frame().unwrap().start_address();
        let frame = bank.allocate_frame().unwrap();

        unsafe {
            walker
                .map(root, page(0x5000), frame, MapFlags::WRITABLE, &mut || {
                    bank.allocate_frame().unwrap()
                })
                .unwrap()
                .ignore();
        }

        let (unmapped, flush) = unsafe { walker.unmap(root, page(0x5000)) }.unwrap();
        flush.ignore();
        assert_eq!(unmapped, frame);
        assert!(unsafe { walker.translate(root, VirtAddr::new(0x5000)) }.is_none());
        assert!(matches!(
            unsafe { walker.unmap(root, page(0x5000)) },
            Err(UnmapError::NotMapped)
        ));
    }

    #[test]
    fn user_flag_reaches_directory_entry() {
        let mut bank = TestPhys::new(16);
        let walker = TwoLevelWalker::new(bank.phys_base());
        let root = bank.allocate_frame().unwrap().start_address();
        let frame = bank.allocate_frame().unwrap();
        let virt = VirtAddr::new(0x80_0000);

        unsafe {
            walker
                .map(
                    root,
                    page(virt.as_u64()),
                    frame,
                    MapFlags::WRITABLE | MapFlags::USER,
                    &mut || bank.allocate_frame().unwrap(),
                )
                .unwrap()
                .ignore();
        }

        let pd = unsafe { walker.table_at(root) };
        assert!(pd.entries[virt.pd32_index()]
            .flags()
            .contains(EntryFlags::USER));
    }
}
