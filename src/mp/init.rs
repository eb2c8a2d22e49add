//! Bring-up entry point.

use crate::config::MpConfig;
use crate::error::MpError;

use super::gdt::install_gdt;
use super::platform::{BootServices, Platform};
use super::state::CpuMp;
use super::timer::Clock;
use super::wakeup::prepare_startup_vector;

/// Bring up every AP that answers within the configured timeout.
///
/// Loads the transition GDT on the BSP, installs the stub, runs the census
/// and returns the handle holding the sorted roster. The wakeup buffer is
/// left in place for later dispatches; see
/// [`CpuMp::restore_wakeup_buffer`].
pub fn init<'p, P, B, C>(
    platform: &'p P,
    services: &mut B,
    clock: &C,
    config: &MpConfig,
) -> Result<CpuMp<'p, P>, MpError>
where
    P: Platform,
    B: BootServices + ?Sized,
    C: Clock + ?Sized,
{
    crate::kinfo!(
        "MP: Initializing (max {} processors, {:#x} byte stacks, {}us timeout)",
        config.max_processors,
        config.ap_stack_size,
        config.ap_init_timeout_us
    );
    config.validate()?;

    install_gdt(platform);

    let mut mp = prepare_startup_vector(platform, services, config).map_err(|err| {
        crate::kerror!("MP: Failed to prepare startup vector: {}", err);
        err
    })?;

    mp.count_processors(clock, config.ap_init_timeout_us as u64);

    for (index, record) in mp.records().iter().enumerate() {
        crate::kdebug!(
            "MP: CPU {}: APIC {:#x}{}",
            index,
            record.apic_id,
            if index == mp.boot_index() { " (BSP)" } else { "" }
        );
    }

    Ok(mp)
}
