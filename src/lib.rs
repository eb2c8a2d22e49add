//! NexaOS secondary-processor bring-up.
//!
//! Runs in the pre-kernel boot phase on the boot processor (BSP): finds a
//! wakeup buffer below 1 MiB, wakes every application processor (AP) with an
//! INIT/STARTUP sequence, lets each AP report its APIC ID and BIST result, and
//! hands later boot stages a sorted processor roster.
//!
//! No heap and no locks on the bring-up path. Hardware access goes through
//! the [`mp::Platform`] trait so the whole protocol can also run against a
//! simulated machine.

#![no_std]

pub mod config;
pub mod error;
#[cfg(target_arch = "x86_64")]
pub mod lapic;
pub mod logger;
pub mod mp;
pub mod serial;

pub use config::MpConfig;
pub use error::MpError;

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
