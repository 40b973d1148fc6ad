//! Interrupt-safe spin lock.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use super::{SpinLock, SpinLockGuard};
use crate::arch::interrupts;

/// A [`SpinLock`] that disables local interrupts while held.
///
/// Required for data touched from interrupt context (the physical frame
/// allocator, which the page-fault handler calls into): taking a plain spin
/// lock there would deadlock if the interrupt arrived while the same CPU
/// already held it.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Disables interrupts, then acquires the lock.
    ///
    /// The previous interrupt state is restored when the guard is dropped.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq_was_enabled = interrupts::save_and_disable();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq_was_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Interrupts are only left disabled if the lock was acquired.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts::save_and_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinLockGuard {
                guard: ManuallyDrop::new(guard),
                irq_was_enabled,
            }),
            None => {
                interrupts::restore(irq_was_enabled);
                None
            }
        }
    }

    /// Returns a mutable reference to the contained value, bypassing the
    /// lock.
    ///
    /// # Safety
    ///
    /// See [`SpinLock::force_get`].
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { self.inner.force_get() }
    }
}

/// RAII guard for [`IrqSpinLock`].
///
/// Dropping the guard releases the lock and then restores the saved
/// interrupt state, in that order.
pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<SpinLockGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        // SAFETY: the guard is never touched again after this drop.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::restore(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lock = IrqSpinLock::new(13);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 13);
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqSpinLock::new(());
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = IrqSpinLock::new(0u32);
        *lock.lock() = 5;
        assert_eq!(*lock.lock(), 5);
    }
}
