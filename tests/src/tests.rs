//! MP bring-up tests
//!
//! - Wakeup buffer search, backup/restore and the combined allocation
//! - Census: counting, timeout exclusion, clamping, BIST, MTRR sync
//! - Concurrent handshake: one writer per roster slot
//! - Procedure dispatch with each wait policy
//! - Roster sort, transition GDT, timing, configuration, logging

mod dispatch;
mod sort;

use nexa_mp::MpConfig;

/// Small stacks keep the combined allocation well inside the arena.
pub(crate) fn test_config(max_processors: u32) -> MpConfig {
    MpConfig {
        max_processors,
        ap_stack_size: 0x1000,
        ap_init_timeout_us: 50_000,
    }
}

pub(crate) fn apic_ids(records: &[nexa_mp::mp::ProcessorRecord]) -> Vec<u32> {
    records.iter().map(|r| r.apic_id).collect()
}
