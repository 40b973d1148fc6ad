//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] and [`IrqSpinLock`], both const-constructable so
//! they can live in `static` items and usable before any allocator exists.

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
