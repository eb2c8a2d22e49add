//! Startup Signal Transmitter
//!
//! Fills the exchange area and fires INIT/STARTUP/STARTUP. Waiting for the
//! result belongs to the caller.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use super::ap_entry::ap_handshake;
use super::exchange::ExchangeInfo;
use super::gdt::transition_gdtr;
use super::platform::Platform;
use super::state::MpState;
use super::types::{ApProcedure, IpiTarget};

/// Wake `target` at the wakeup buffer, optionally with work for it to run.
///
/// Resets both the finished counter and the responded counter, so the caller
/// must not signal again until it is done with the previous pass.
///
/// # Safety
/// `state` must come from `prepare_startup_vector` and no AP may be inside
/// the stub or handshake when this runs.
pub(crate) unsafe fn wake_up_ap<P: Platform>(
    state: *mut MpState,
    platform: &P,
    target: IpiTarget,
    procedure: Option<(ApProcedure, *mut c_void)>,
) {
    let (function, argument) = match procedure {
        Some((function, argument)) => (Some(function), argument),
        None => (None, ptr::null_mut()),
    };
    (*state).procedure = function;
    (*state).procedure_argument = argument;
    (*state).finished_count.store(0, Ordering::Release);

    let exchange = (*state).exchange;
    exchange.write_volatile(ExchangeInfo {
        lock: 0,
        stack_start: (*state).buffer,
        stack_size: (*state).ap_stack_size as u64,
        buffer_start: (*state).wakeup_buffer,
        pmode_offset: (*state).trampoline.pmode_entry_offset as u64,
        lmode_offset: (*state).trampoline.lmode_entry_offset as u64,
        cr3: platform.read_cr3(),
        gdtr_profile: transition_gdtr(),
        idtr_profile: platform.read_idtr(),
        c_function: ap_handshake::<P>,
        platform: platform as *const P as *const (),
        num_aps_executing: AtomicU32::new(0),
        mp_state: state,
    });

    #[cfg(feature = "debug_verbose")]
    dump_exchange(&*exchange);

    // Everything above must be visible before any AP leaves reset.
    fence(Ordering::SeqCst);

    let start = (*state).wakeup_buffer as u32;
    match target {
        IpiTarget::AllExcludingSelf => {
            crate::ktrace!("MP: Broadcast INIT-SIPI-SIPI, vector {:#x}", start >> 12)
        }
        IpiTarget::Apic(apic_id) => crate::ktrace!(
            "MP: INIT-SIPI-SIPI to APIC {:#x}, vector {:#x}",
            apic_id,
            start >> 12
        ),
    }
    platform.send_init_sipi_sipi(target, start);
}

#[cfg(feature = "debug_verbose")]
fn dump_exchange(exchange: &ExchangeInfo) {
    let gdtr = exchange.gdtr_profile;
    let idtr = exchange.idtr_profile;
    crate::ktrace!(
        "MP: exchange stack={:#x}+{:#x} buffer={:#x} pmode={:#x} lmode={:#x} cr3={:#x}",
        exchange.stack_start,
        exchange.stack_size,
        exchange.buffer_start,
        exchange.pmode_offset,
        exchange.lmode_offset,
        exchange.cr3
    );
    crate::ktrace!(
        "MP: exchange gdtr={:#x}/{:#x} idtr={:#x}/{:#x}",
        gdtr.base.as_u64(),
        { gdtr.limit },
        idtr.base.as_u64(),
        { idtr.limit }
    );
}
