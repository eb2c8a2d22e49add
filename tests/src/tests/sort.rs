//! Roster ordering.

use nexa_mp::mp::sort::{find_boot_index, sort_by_apic_id};
use nexa_mp::mp::{sort_roster, HealthFlags, ProcessorRecord};

use super::apic_ids;

fn roster(ids: &[u32]) -> Vec<ProcessorRecord> {
    ids.iter()
        .map(|&id| ProcessorRecord::new(id, HealthFlags::HEALTHY))
        .collect()
}

#[test]
fn test_sort_places_boot_processor() {
    let mut records = roster(&[7, 2, 5, 0]);

    let boot = sort_roster(&mut records, 5);

    assert_eq!(apic_ids(&records), vec![0, 2, 5, 7]);
    assert_eq!(boot, 2);
}

#[test]
fn test_sort_missing_boot_processor_defaults_to_zero() {
    let mut records = roster(&[3, 1]);
    assert_eq!(sort_roster(&mut records, 42), 0);
    assert_eq!(apic_ids(&records), vec![1, 3]);
}

#[test]
fn test_sort_trivial_rosters() {
    let mut empty: Vec<ProcessorRecord> = Vec::new();
    assert_eq!(sort_roster(&mut empty, 0), 0);

    let mut single = roster(&[9]);
    assert_eq!(sort_roster(&mut single, 9), 0);
    assert_eq!(apic_ids(&single), vec![9]);
}

#[test]
fn test_sort_is_idempotent() {
    let mut records = roster(&[12, 4, 8, 0, 16]);
    sort_by_apic_id(&mut records);
    let once = records.clone();
    sort_by_apic_id(&mut records);
    assert_eq!(records, once);
}

#[test]
fn test_sort_reverse_order() {
    let ids: Vec<u32> = (0..32).rev().collect();
    let mut records = roster(&ids);

    let boot = sort_roster(&mut records, 31);

    assert_eq!(apic_ids(&records), (0..32).collect::<Vec<_>>());
    assert_eq!(boot, 31);
}

#[test]
fn test_sort_keeps_health_with_apic_id() {
    let mut records = vec![
        ProcessorRecord::new(6, HealthFlags(0x6)),
        ProcessorRecord::new(2, HealthFlags::HEALTHY),
        ProcessorRecord::new(4, HealthFlags(0x4)),
    ];

    sort_by_apic_id(&mut records);

    for record in &records {
        assert_eq!(record.health.bist(), if record.apic_id == 2 { 0 } else { record.apic_id });
    }
}

#[test]
fn test_find_boot_index() {
    let records = roster(&[0, 2, 5, 7]);
    assert_eq!(find_boot_index(&records, 7), Some(3));
    assert_eq!(find_boot_index(&records, 6), None);
}

/// Every ordering of `ids`, by Heap's algorithm.
fn permutations(ids: &[u32]) -> Vec<Vec<u32>> {
    fn generate(k: usize, ids: &mut Vec<u32>, out: &mut Vec<Vec<u32>>) {
        if k <= 1 {
            out.push(ids.clone());
            return;
        }
        for i in 0..k - 1 {
            generate(k - 1, ids, out);
            if k % 2 == 0 {
                ids.swap(i, k - 1);
            } else {
                ids.swap(0, k - 1);
            }
        }
        generate(k - 1, ids, out);
    }

    let mut ids = ids.to_vec();
    let mut out = Vec::new();
    generate(ids.len(), &mut ids, &mut out);
    out
}

#[test]
fn test_sort_every_arrival_order_and_boot_processor() {
    let ids = [0x20, 3, 0, 17, 6];
    let mut expected = ids.to_vec();
    expected.sort_unstable();

    let orders = permutations(&ids);
    assert_eq!(orders.len(), 120);

    for order in &orders {
        for &boot in &ids {
            let mut records: Vec<ProcessorRecord> = order
                .iter()
                .map(|&id| ProcessorRecord::new(id, HealthFlags(id + 1)))
                .collect();

            let index = sort_roster(&mut records, boot);

            assert_eq!(apic_ids(&records), expected, "order {:?}", order);
            assert_eq!(records[index].apic_id, boot, "order {:?}, boot {}", order, boot);
            assert_eq!(index, expected.iter().position(|&id| id == boot).unwrap());
            assert!(records.iter().all(|r| r.health == HealthFlags(r.apic_id + 1)));
        }
    }
}
