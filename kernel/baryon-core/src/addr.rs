//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] are newtypes that keep virtual and physical
//! addresses apart at the type level. Virtual addresses are stored in
//! canonical form (sign-extended from bit 47); physical addresses are masked
//! to the 52-bit physical address space.

use core::fmt;
use core::ops::{Add, Sub};

/// A canonical virtual address.
///
/// With 4-level paging, bits 48..63 must be a sign-extension of bit 47; the
/// constructors enforce that. 32-bit virtual addresses fit trivially.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A physical address, masked to 52 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

/// Physical address space mask: bits 0..51.
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

/// Mask for the 12-bit page offset.
const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// Mask for a 9-bit table index (4-level paging).
const INDEX9_MASK: usize = 0x1FF;

/// Mask for a 10-bit table index (2-level paging).
const INDEX10_MASK: usize = 0x3FF;

impl VirtAddr {
    /// Creates a new `VirtAddr`. Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(
            canonical.0 == addr,
            "VirtAddr::new: address is not canonical"
        );
        canonical
    }

    /// Creates a new `VirtAddr`, forcing canonical form by sign-extending
    /// from bit 47.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Creates a new `VirtAddr` without validation.
    ///
    /// # Safety
    ///
    /// `addr` must be canonical.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    /// The zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this address to a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self::new_truncate(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self::new_truncate((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    // 4-level (x86_64) index math: 9 bits per level.

    /// PML4 index (bits 39..47).
    #[inline]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) as usize) & INDEX9_MASK
    }

    /// Page Directory Pointer Table index (bits 30..38).
    #[inline]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) as usize) & INDEX9_MASK
    }

    /// Page Directory index (bits 21..29).
    #[inline]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) as usize) & INDEX9_MASK
    }

    /// Page Table index (bits 12..20).
    #[inline]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) as usize) & INDEX9_MASK
    }

    // 2-level (32-bit x86) index math: 10 bits per level.

    /// 2-level Page Directory index (bits 22..31).
    #[inline]
    pub const fn pd32_index(self) -> usize {
        ((self.0 >> 22) as usize) & INDEX10_MASK
    }

    /// 2-level Page Table index (bits 12..21).
    #[inline]
    pub const fn pt32_index(self) -> usize {
        ((self.0 >> 12) as usize) & INDEX10_MASK
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`. Panics in debug builds if bits above 51 are
    /// set.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let masked = addr & PHYS_ADDR_MASK;
        debug_assert!(
            masked == addr,
            "PhysAddr::new: address exceeds the 52-bit physical space"
        );
        Self(masked)
    }

    /// Creates a new `PhysAddr`, truncating to 52 bits.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Creates a new `PhysAddr` without validation.
    ///
    /// # Safety
    ///
    /// `addr` must fit in the 52-bit physical address space.
    #[inline]
    pub const unsafe fn new_unchecked(addr: u64) -> Self {
        Self(addr)
    }

    /// The zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_low_half_is_canonical() {
        let addr = VirtAddr::new(0x0000_1234_5678_9ABC);
        assert_eq!(addr.as_u64(), 0x0000_1234_5678_9ABC);
    }

    #[test]
    fn virt_truncate_sign_extends() {
        let addr = VirtAddr::new_truncate(0x0000_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn virt_alignment_helpers() {
        let addr = VirtAddr::new(0x1234);
        assert_eq!(addr.align_down(4096).as_u64(), 0x1000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x2000);
        assert!(VirtAddr::new(0x2000).is_aligned(4096));
    }

    #[test]
    fn virt_four_level_indices() {
        // 0xFFFF_8000_0020_1000: pml4 256, pdpt 0, pd 1, pt 1.
        let addr = VirtAddr::new(0xFFFF_8000_0020_1000);
        assert_eq!(addr.pml4_index(), 256);
        assert_eq!(addr.pdpt_index(), 0);
        assert_eq!(addr.pd_index(), 1);
        assert_eq!(addr.pt_index(), 1);
        assert_eq!(addr.page_offset(), 0);
    }

    #[test]
    fn virt_two_level_indices() {
        // 0x0040_3123: pd 1, pt 3, offset 0x123.
        let addr = VirtAddr::new(0x0040_3123);
        assert_eq!(addr.pd32_index(), 1);
        assert_eq!(addr.pt32_index(), 3);
        assert_eq!(addr.page_offset(), 0x123);
    }

    #[test]
    fn virt_arithmetic() {
        let addr = VirtAddr::new(0x1000);
        assert_eq!((addr + 0x500).as_u64(), 0x1500);
        assert_eq!((addr - 0x500).as_u64(), 0x0B00);
        assert_eq!(VirtAddr::new(0x2000) - addr, 0x1000);
    }

    #[test]
    fn phys_masked_to_52_bits() {
        let addr = PhysAddr::new_truncate(0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(addr.as_u64(), 0x000F_FFFF_FFFF_FFFF);
    }

    #[test]
    fn phys_alignment_helpers() {
        let addr = PhysAddr::new(0x3456);
        assert!(!addr.is_aligned(4096));
        assert_eq!(addr.align_down(4096).as_u64(), 0x3000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x4000);
        assert_eq!(addr.page_offset(), 0x456);
    }

    #[test]
    fn phys_arithmetic() {
        let addr = PhysAddr::new(0x2000);
        assert_eq!((addr + 0x100).as_u64(), 0x2100);
        assert_eq!((addr - 0x100).as_u64(), 0x1F00);
        assert_eq!(addr - PhysAddr::new(0x1000), 0x1000);
    }
}
