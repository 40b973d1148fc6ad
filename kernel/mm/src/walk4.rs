//! 4-level page table walker (x86_64: PML4 -> PDPT -> PD -> PT).
//!
//! Tables are reached through the physical direct map: the walker adds its
//! configured offset to a table's physical address and reads it in place.
//! Only 4 KiB leaf mappings are produced.

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_core::paging::{Page, PhysFrame, Size4KiB};

use crate::mapper::{MapError, MapFlags, MapFlush, PageWalker, UnmapError};
use crate::PAGE_SIZE;

/// Physical address mask of a page table entry: bits 12..51.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// x86_64 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
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
        /// Global page (kept in the TLB across CR3 loads).
        const GLOBAL        = 1 << 8;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single 64-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys` with the given flags.
    pub const fn new(phys: PhysAddr, flags: EntryFlags) -> Self {
        Self((phys.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        // SAFETY: the masked value fits in 52 bits.
        unsafe { PhysAddr::new_unchecked(self.0 & ENTRY_ADDR_MASK) }
    }

    /// Returns the flag bits of this entry.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !ENTRY_ADDR_MASK)
    }
}

/// A 4 KiB page table holding 512 entries.
#[repr(C, align(4096))]
pub struct Table {
    /// The entries of this table.
    pub entries: [Entry; 512],
}

/// The 4-level page table walker.
///
/// Stateless apart from the direct-map offset; one walker serves every
/// address space.
pub struct FourLevelWalker {
    phys_base: u64,
}

impl FourLevelWalker {
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

    /// Resolves `table[index]` to a next-level table, allocating and
    /// zeroing a fresh frame if the entry is not present.
    ///
    /// Present entries get any missing `intermediate` flags OR'd in, so a
    /// user mapping can share a subtree with earlier kernel mappings.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table frame.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: EntryFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> PhysAddr {
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = Entry::new(entry.address(), combined);
            }
            entry.address()
        } else {
            let frame = alloc().start_address();
            // SAFETY: the frame was just allocated; zeroing it prevents
            // stale data being read as present entries.
            unsafe {
                core::ptr::write_bytes((self.phys_base + frame.as_u64()) as *mut u8, 0, PAGE_SIZE);
            }
            table.entries[index] = Entry::new(frame, intermediate);
            frame
        }
    }

    /// Walks to the page table entry for `virt` without allocating.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 frame.
    unsafe fn leaf_entry(&self, root: PhysAddr, virt: VirtAddr) -> Option<&mut Entry> {
        let pml4 = unsafe { self.table_at(root) };
        let pml4e = pml4.entries[virt.pml4_index()];
        if !pml4e.is_present() {
            return None;
        }

        let pdpt = unsafe { self.table_at(pml4e.address()) };
        let pdpte = pdpt.entries[virt.pdpt_index()];
        if !pdpte.is_present() {
            return None;
        }

        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt.pd_index()];
        if !pde.is_present() {
            return None;
        }

        let pt = unsafe { self.table_at(pde.address()) };
        Some(&mut pt.entries[virt.pt_index()])
    }

    fn leaf_flags(flags: MapFlags) -> EntryFlags {
        let mut native = EntryFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            native |= EntryFlags::WRITABLE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            native |= EntryFlags::NO_EXECUTE;
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

    /// Intermediate entries are PRESENT | WRITABLE, with USER added when
    /// the leaf is user-accessible so ring 3 can traverse the walk.
    fn intermediate_flags(leaf: EntryFlags) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if leaf.contains(EntryFlags::USER) {
            flags |= EntryFlags::USER;
        }
        flags
    }
}

// SAFETY: the walker writes only the 4-level tables reachable from `root`
// through the direct map, in the hardware entry format.
unsafe impl PageWalker for FourLevelWalker {
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
        let pdpt = unsafe { self.ensure_table(root, virt.pml4_index(), intermediate, alloc) };
        let pd = unsafe { self.ensure_table(pdpt, virt.pdpt_index(), intermediate, alloc) };
        let pt = unsafe { self.ensure_table(pd, virt.pd_index(), intermediate, alloc) };

        let table = unsafe { self.table_at(pt) };
        let entry = &mut table.entries[virt.pt_index()];
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
