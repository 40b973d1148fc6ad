//! Minimal architecture surface: interrupt flag control and TLB maintenance.
//!
//! All functions compile to no-ops on hosted targets so the rest of the
//! crate can run under `cargo test`.

/// Local interrupt flag control.
pub mod interrupts {
    /// Returns whether interrupts are currently enabled on this CPU.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub fn enabled() -> bool {
        let rflags: u64;
        // SAFETY: pushfq/pop only reads RFLAGS.
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) rflags, options(nomem));
        }
        rflags & (1 << 9) != 0
    }

    /// Returns whether interrupts are currently enabled on this CPU.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    #[inline]
    pub fn enabled() -> bool {
        let eflags: u32;
        // SAFETY: pushfd/pop only reads EFLAGS.
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) eflags, options(nomem));
        }
        eflags & (1 << 9) != 0
    }

    /// Returns whether interrupts are currently enabled on this CPU.
    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
    #[inline]
    pub fn enabled() -> bool {
        false
    }

    /// Disables interrupts and returns whether they were enabled before.
    #[inline]
    pub fn save_and_disable() -> bool {
        let was_enabled = enabled();
        #[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
        // SAFETY: CLI only clears the interrupt flag.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
        was_enabled
    }

    /// Re-enables interrupts if `was_enabled` is set.
    #[inline]
    pub fn restore(was_enabled: bool) {
        if was_enabled {
            #[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
            // SAFETY: STI only sets the interrupt flag.
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack));
            }
        }
    }
}

/// TLB (Translation Lookaside Buffer) maintenance.
pub mod tlb {
    use crate::addr::VirtAddr;

    /// Invalidates the TLB entry for the given virtual address (INVLPG).
    #[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
    #[inline]
    pub fn flush(addr: VirtAddr) {
        // SAFETY: INVLPG only invalidates a single TLB entry.
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) addr.as_u64() as usize,
                options(nostack, preserves_flags),
            );
        }
    }

    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
    #[inline]
    pub fn flush(_addr: VirtAddr) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;

    #[test]
    fn interrupt_shims_are_inert_on_host() {
        assert!(!interrupts::enabled());
        let state = interrupts::save_and_disable();
        assert!(!state);
        interrupts::restore(state);
    }

    #[test]
    fn tlb_flush_is_inert_on_host() {
        tlb::flush(VirtAddr::new(0x1000));
    }
}
