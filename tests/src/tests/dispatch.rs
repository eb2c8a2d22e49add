//! Running procedures on APs after the census.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use nexa_mp::mp::{prepare_startup_vector, Clock, CpuMp, IpiTarget, WaitPolicy};
use nexa_mp::MpError;

use super::test_config;
use crate::mock::{SimAp, SimMachine, SimServices};

extern "C" fn count_visit(argument: *mut c_void) {
    // SAFETY: every caller passes a pointer to a live AtomicU32.
    let visits = unsafe { &*(argument as *const AtomicU32) };
    visits.fetch_add(1, Ordering::SeqCst);
}

fn counter_arg(visits: &AtomicU32) -> *mut c_void {
    visits as *const AtomicU32 as *mut c_void
}

fn booted<'m>(machine: &'m SimMachine) -> CpuMp<'m, SimMachine> {
    let mut services = SimServices::new(machine.memory());
    let mut mp = prepare_startup_vector(machine, &mut services, &test_config(8)).unwrap();
    mp.count_processors(machine, 50_000);
    mp
}

// =========================================================================
// startup_all_aps
// =========================================================================

#[test]
fn test_all_aps_until_finished() {
    let machine = SimMachine::new(0).with_aps(&[1, 2, 3]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let microcode_before = machine.microcode_loads();
    let mtrr_before = machine.applied_mtrrs().len();

    let finished = mp.startup_all_aps(
        &machine,
        count_visit,
        counter_arg(&visits),
        WaitPolicy::UntilFinished {
            expected: 3,
            timeout_us: 10_000,
        },
    );

    assert_eq!(finished, 3);
    assert_eq!(visits.load(Ordering::SeqCst), 3);
    // Later passes run the procedure only.
    assert_eq!(machine.microcode_loads(), microcode_before);
    assert_eq!(machine.applied_mtrrs().len(), mtrr_before);
    assert_eq!(mp.processor_count(), 4);
}

#[test]
fn test_all_aps_until_finished_stops_early() {
    let machine = SimMachine::new(0).with_aps(&[1, 2]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let start = machine.now_us();

    mp.startup_all_aps(
        &machine,
        count_visit,
        counter_arg(&visits),
        WaitPolicy::UntilFinished {
            expected: 2,
            timeout_us: 1_000_000,
        },
    );

    assert!(machine.now_us() - start < 1_000);
}

#[test]
fn test_all_aps_until_finished_times_out() {
    let machine = SimMachine::new(0).with_aps(&[1, 2]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let start = machine.now_us();

    let finished = mp.startup_all_aps(
        &machine,
        count_visit,
        counter_arg(&visits),
        WaitPolicy::UntilFinished {
            expected: 3,
            timeout_us: 5_000,
        },
    );

    assert_eq!(finished, 2);
    assert!(machine.now_us() - start >= 5_000);
}

#[test]
fn test_all_aps_no_wait() {
    let machine = SimMachine::new(0).with_aps(&[1, 2, 3]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);

    let finished = mp.startup_all_aps(&machine, count_visit, counter_arg(&visits), WaitPolicy::NoWait);

    assert_eq!(finished, 0);
    assert_eq!(visits.load(Ordering::SeqCst), 0);
    assert_eq!(machine.pending_count(), 3);

    machine.drain_pending();

    assert_eq!(visits.load(Ordering::SeqCst), 3);
    assert_eq!(mp.finished_count(), 3);
}

#[test]
fn test_all_aps_fixed_wait() {
    let machine = SimMachine::new(0)
        .with_aps(&[1, 2])
        .with_ap(SimAp::new(3).arriving_after(5_000));
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);

    let finished = mp.startup_all_aps(
        &machine,
        count_visit,
        counter_arg(&visits),
        WaitPolicy::Fixed { micros: 1_000 },
    );

    assert_eq!(finished, 2);
    assert_eq!(visits.load(Ordering::SeqCst), 2);

    machine.drain_pending();
    assert_eq!(visits.load(Ordering::SeqCst), 3);
}

#[test]
fn test_dispatch_resets_counters() {
    let machine = SimMachine::new(0).with_aps(&[1, 2]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let wait = WaitPolicy::UntilFinished {
        expected: 2,
        timeout_us: 10_000,
    };

    assert_eq!(mp.startup_all_aps(&machine, count_visit, counter_arg(&visits), wait), 2);
    assert_eq!(mp.startup_all_aps(&machine, count_visit, counter_arg(&visits), wait), 2);

    assert_eq!(visits.load(Ordering::SeqCst), 4);
    assert_eq!(mp.responded_count(), 2);
}

// =========================================================================
// startup_this_ap
// =========================================================================

#[test]
fn test_this_ap_targets_one_apic() {
    let machine = SimMachine::new(0).with_aps(&[8, 4]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let target = mp.record(1).unwrap().apic_id;
    assert_eq!(target, 4);

    let finished = mp
        .startup_this_ap(
            &machine,
            1,
            count_visit,
            counter_arg(&visits),
            WaitPolicy::UntilFinished {
                expected: 1,
                timeout_us: 10_000,
            },
        )
        .unwrap();

    assert_eq!(finished, 1);
    assert_eq!(visits.load(Ordering::SeqCst), 1);
    assert_eq!(
        machine.signals().last(),
        Some(&(IpiTarget::Apic(4), mp.wakeup_buffer() as u32))
    );
}

#[test]
fn test_this_ap_rejects_boot_processor() {
    let machine = SimMachine::new(5).with_aps(&[1, 9]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);
    let signals_before = machine.signals().len();
    assert_eq!(mp.boot_index(), 1);

    let result = mp.startup_this_ap(&machine, 1, count_visit, counter_arg(&visits), WaitPolicy::NoWait);

    assert_eq!(result, Err(MpError::InvalidProcessor(1)));
    assert_eq!(machine.signals().len(), signals_before);
}

#[test]
fn test_this_ap_rejects_out_of_range() {
    let machine = SimMachine::new(0).with_aps(&[1, 2]);
    let mut mp = booted(&machine);
    let visits = AtomicU32::new(0);

    let result = mp.startup_this_ap(&machine, 3, count_visit, counter_arg(&visits), WaitPolicy::NoWait);

    assert_eq!(result, Err(MpError::InvalidProcessor(3)));
    assert_eq!(visits.load(Ordering::SeqCst), 0);
}
