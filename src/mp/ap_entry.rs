//! AP Handshake Routine
//!
//! Runs on each AP, in parallel, once the stub has switched to long mode and
//! claimed an index. Nothing here takes a lock; the only shared writes are
//! the AP's own discovery slot and one atomic increment.

use core::sync::atomic::Ordering;

use super::exchange::ExchangeInfo;
use super::platform::Platform;
use super::types::{HealthFlags, ProcessorRecord};

/// Handshake entry stored in `ExchangeInfo::c_function`.
///
/// On the census pass the AP records its APIC ID and BIST word, syncs MTRRs
/// with the BSP and loads microcode. On later passes it runs the dispatched
/// procedure instead. Either way it finishes by bumping `finished_count`.
///
/// # Safety
/// `exchange` must be the exchange area filled by `wake_up_ap::<P>`, and
/// `index` the value this AP obtained from `num_aps_executing`.
pub unsafe extern "C" fn ap_handshake<P: Platform>(exchange: *const ExchangeInfo, index: usize) {
    let exchange = &*exchange;
    let state = &*exchange.mp_state;
    let platform = &*(exchange.platform as *const P);

    if state.first_pass.load(Ordering::Acquire) {
        // Index 0 is the BSP; indices past the roster limit only sync state.
        if index != 0 && index < state.max_processors as usize {
            let bist = state.bist_slot(index).read_volatile();
            let record = ProcessorRecord::new(platform.apic_id(), HealthFlags(bist as u32));
            (*state.slots.add(index)).publish(record);
        }
        platform.apply_mtrrs(&state.mtrrs);
        platform.load_microcode();
    } else if let Some(procedure) = state.procedure {
        procedure(state.procedure_argument);
    }

    state.finished_count.fetch_add(1, Ordering::AcqRel);
}
