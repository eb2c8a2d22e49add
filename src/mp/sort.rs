//! Roster ordering.

use super::types::ProcessorRecord;

/// Order `records` by APIC ID and return where `boot_apic_id` ended up.
///
/// Selection sort: the roster is bounded by configuration and small, and
/// this keeps the code fixed-size with no recursion. Returns 0 when the boot
/// processor is absent.
pub fn sort_roster(records: &mut [ProcessorRecord], boot_apic_id: u32) -> usize {
    sort_by_apic_id(records);
    find_boot_index(records, boot_apic_id).unwrap_or(0)
}

pub fn sort_by_apic_id(records: &mut [ProcessorRecord]) {
    let len = records.len();
    if len < 2 {
        return;
    }

    for i in 0..len - 1 {
        let mut lowest = i;
        for j in i + 1..len {
            if records[j].apic_id < records[lowest].apic_id {
                lowest = j;
            }
        }
        if lowest != i {
            records.swap(i, lowest);
        }
    }
}

pub fn find_boot_index(records: &[ProcessorRecord], boot_apic_id: u32) -> Option<usize> {
    records.iter().position(|r| r.apic_id == boot_apic_id)
}
