//! Multi-Processor (MP) Bring-up
//!
//! The boot processor reserves a wakeup buffer below 1 MiB, copies the
//! mode-transition stub into it, broadcasts INIT/STARTUP/STARTUP and gives
//! APs a fixed time budget to check in. Each AP that makes it records its
//! APIC ID and BIST word, syncs MTRRs and microcode with the BSP, and bumps a
//! finished counter. The BSP then sorts the roster by APIC ID.
//!
//! ## Layout
//!
//! - `wakeup`: low-memory buffer search, backup/restore, combined allocation
//! - `ipi`: exchange area population and startup signals
//! - `ap_entry`: the long-mode handshake each AP runs
//! - `census`: the first-pass count and later procedure dispatch
//! - `sort`: roster ordering
//! - `gdt`: transition descriptor table
//! - `hw`: x86-64 `Platform` implementation

pub mod ap_entry;
pub mod census;
pub mod exchange;
pub mod gdt;
#[cfg(target_arch = "x86_64")]
pub mod hw;
pub mod init;
pub mod ipi;
pub mod memory;
pub mod platform;
pub mod sort;
pub mod state;
pub mod timer;
pub mod types;
pub mod wakeup;

pub use ap_entry::ap_handshake;
pub use census::WaitPolicy;
pub use exchange::{ApEntryFn, ExchangeInfo};
pub use gdt::{install_gdt, transition_gdtr, TRANSITION_GDT};
#[cfg(target_arch = "x86_64")]
pub use hw::X86Platform;
pub use init::init;
pub use memory::{
    MapServices, MemoryDescriptor, MemoryMap, MemoryType, Reservation, ResourceAttributes,
    ResourceType,
};
pub use platform::{BootServices, Platform};
pub use sort::sort_roster;
pub use state::{CpuMp, DiscoverySlot, MpState};
#[cfg(target_arch = "x86_64")]
pub use timer::TscClock;
pub use timer::{busy_wait, poll_until, Clock, Deadline};
pub use types::{
    ApProcedure, HealthFlags, IpiTarget, MtrrSettings, ProcessorRecord, TrampolineMap,
    VariableMtrr,
};
pub use wakeup::{find_wakeup_buffer, prepare_startup_vector, MpLayout};
