//! Core support library for the Baryon kernel: typed addresses, page/frame
//! abstractions, spin locks, logging, and the minimal arch surface the
//! memory-management stack needs.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod arch;
pub mod log;
pub mod paging;
pub mod sync;
