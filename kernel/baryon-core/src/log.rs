//! Kernel logging.
//!
//! [`kprint!`] / [`kprintln!`] emit raw text; [`klog!`] and the per-level
//! shorthands (`kinfo!`, `kdebug!`, ...) emit leveled records. Both dispatch
//! through function pointers installed at boot with [`set_print_fn`] and
//! [`set_log_fn`]; until then output is discarded, so the memory-management
//! code can log from the earliest init paths without caring whether a
//! console exists yet.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Kernel log severity. Lower values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Something failed; the system may or may not recover.
    Error = 0,
    /// Unexpected but tolerable condition.
    Warn = 1,
    /// High-level progress messages.
    Info = 2,
    /// Detailed diagnostics.
    Debug = 3,
    /// Very verbose low-level tracing.
    Trace = 4,
}

impl LogLevel {
    /// Fixed-width name for aligned output.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// The signature of the global raw print function.
pub type PrintFn = fn(fmt::Arguments<'_>);

/// The signature of the global leveled log function.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn discard_print(_args: fmt::Arguments<'_>) {}

fn discard_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static PRINT_FN: AtomicPtr<()> = AtomicPtr::new(discard_print as PrintFn as *mut ());
static LOG_FN: AtomicPtr<()> = AtomicPtr::new(discard_log as LogFn as *mut ());

/// Installs the global raw print function.
///
/// # Safety
///
/// `f` must be callable from any context, including with locks held and
/// interrupts disabled. May be called again to swap sinks.
pub unsafe fn set_print_fn(f: PrintFn) {
    PRINT_FN.store(f as *mut (), Ordering::Release);
}

/// Installs the global leveled log function.
///
/// # Safety
///
/// Same contract as [`set_print_fn`].
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Implementation detail for [`kprint!`]. Not public API.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    let ptr = PRINT_FN.load(Ordering::Acquire);
    // SAFETY: only valid `PrintFn` pointers are ever stored into PRINT_FN.
    let f: PrintFn = unsafe { core::mem::transmute(ptr) };
    f(args);
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: only valid `LogFn` pointers are ever stored into LOG_FN.
    let f: LogFn = unsafe { core::mem::transmute(ptr) };
    f(level, args);
}

/// Prints to the kernel console (raw, no level).
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => { $crate::log::_print(format_args!($($arg)*)) };
}

/// Prints to the kernel console with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => { $crate::kprint!("{}\n", format_args!($($arg)*)) };
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
