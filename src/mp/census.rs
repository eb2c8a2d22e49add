//! Bring-up Coordinator
//!
//! One first-pass census per boot: signal every AP, wait a fixed budget,
//! give APs that already claimed an index a bounded grace period to publish,
//! then copy the settled discovery slots into the roster and sort it. Later passes reuse the same signal path to
//! run a procedure on APs with a caller-chosen wait.

use core::ffi::c_void;
use core::slice;
use core::sync::atomic::{fence, Ordering};

use crate::error::MpError;

use super::ipi::wake_up_ap;
use super::platform::Platform;
use super::sort::sort_roster;
use super::state::CpuMp;
use super::timer::{busy_wait, poll_until, Clock};
use super::types::{ApProcedure, HealthFlags, IpiTarget, ProcessorRecord};

/// How long a dispatch waits for APs after signalling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return right after the signal.
    NoWait,
    /// Spin for a fixed number of microseconds.
    Fixed { micros: u64 },
    /// Spin until `expected` handshakes finished or `timeout_us` passed.
    UntilFinished { expected: u32, timeout_us: u64 },
}

impl<'p, P: Platform> CpuMp<'p, P> {
    /// Discover APs and build the sorted roster.
    ///
    /// APs that have not entered the stub when `timeout_us` runs out are left
    /// out of the roster. An AP that entered but has not published by the end
    /// of a second `timeout_us` window is left out too; it may still finish
    /// later, but only into its own discovery slot. Returns the processor
    /// count, BSP included.
    pub fn count_processors<C: Clock + ?Sized>(&mut self, clock: &C, timeout_us: u64) -> usize {
        let platform = self.platform;
        let state = self.state.as_ptr();

        platform.load_microcode();

        // SAFETY: no AP runs the handshake before the broadcast below, and
        // the state outlives the handle.
        unsafe {
            let max = (*state).max_processors as usize;
            for index in 0..max {
                (*(*state).slots.add(index)).clear();
            }
            (*state)
                .records
                .write(ProcessorRecord::new(platform.apic_id(), HealthFlags::HEALTHY));
            (*state).cpu_count = 1;
            (*state).bsp_number = 0;

            (*state).mtrrs = platform.save_mtrrs();
            (*state).first_pass.store(true, Ordering::Release);
            wake_up_ap(state, platform, IpiTarget::AllExcludingSelf, None);
        }

        busy_wait(clock, timeout_us);

        let responded = self.responded_count();
        if self.finished_count() < responded
            && !poll_until(clock, timeout_us, || self.finished_count() >= responded)
        {
            crate::kdebug!(
                "MP: {} of {} APs finished the handshake after the grace period",
                self.finished_count(),
                responded
            );
        }
        fence(Ordering::Acquire);
        let responded = responded as usize;

        let mut unsettled = 0;
        // SAFETY: only the BSP writes the roster; APs still in the handshake
        // touch only their own discovery slot and finished_count.
        unsafe {
            (*state).first_pass.store(false, Ordering::Release);

            let max = (*state).max_processors as usize;
            if 1 + responded > max {
                crate::kwarn!(
                    "MP: Limiting processor count to {} ({} APs responded)",
                    max,
                    responded
                );
            }

            let mut total = 1;
            for index in 1..=responded.min(max - 1) {
                match (*(*state).slots.add(index)).load() {
                    Some(record) => {
                        (*state).records.add(total).write(record);
                        total += 1;
                    }
                    None => unsettled += 1,
                }
            }
            (*state).cpu_count = total as u32;

            let records = slice::from_raw_parts_mut((*state).records, total);
            (*state).bsp_number = sort_roster(records, platform.apic_id()) as u32;
        }

        let count = self.processor_count();
        crate::kinfo!("MP: Found {} processors in system", count);
        if unsettled > 0 {
            crate::kinfo!(
                "MP: {} of {} APs still inside the handshake at the deadline",
                unsettled,
                responded
            );
        }
        for (index, record) in self.records().iter().enumerate() {
            if !record.health.is_healthy() {
                crate::kwarn!(
                    "MP: Processor {} (APIC {:#x}) reported BIST {:#x}",
                    index,
                    record.apic_id,
                    record.health.bist()
                );
            }
        }
        count
    }

    /// Run `procedure` on every AP.
    ///
    /// Returns the number of APs that finished before the wait ended.
    pub fn startup_all_aps<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        procedure: ApProcedure,
        argument: *mut c_void,
        wait: WaitPolicy,
    ) -> u32 {
        crate::kdebug!("MP: Dispatching procedure to all APs ({:?})", wait);
        // SAFETY: the census finished, so every AP is parked.
        unsafe {
            wake_up_ap(
                self.state.as_ptr(),
                self.platform,
                IpiTarget::AllExcludingSelf,
                Some((procedure, argument)),
            );
        }
        self.wait_for_aps(clock, wait)
    }

    /// Run `procedure` on the AP at roster `index`.
    pub fn startup_this_ap<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        index: usize,
        procedure: ApProcedure,
        argument: *mut c_void,
        wait: WaitPolicy,
    ) -> Result<u32, MpError> {
        if index == self.boot_index() {
            return Err(MpError::InvalidProcessor(index));
        }
        let record = self.record(index).ok_or(MpError::InvalidProcessor(index))?;

        crate::kdebug!(
            "MP: Dispatching procedure to processor {} (APIC {:#x})",
            index,
            record.apic_id
        );
        // SAFETY: as in startup_all_aps.
        unsafe {
            wake_up_ap(
                self.state.as_ptr(),
                self.platform,
                IpiTarget::Apic(record.apic_id),
                Some((procedure, argument)),
            );
        }
        Ok(self.wait_for_aps(clock, wait))
    }

    /// APs other than the boot processor in the roster.
    pub fn ap_count(&self) -> u32 {
        self.processor_count().saturating_sub(1) as u32
    }

    fn wait_for_aps<C: Clock + ?Sized>(&self, clock: &C, wait: WaitPolicy) -> u32 {
        match wait {
            WaitPolicy::NoWait => {}
            WaitPolicy::Fixed { micros } => busy_wait(clock, micros),
            WaitPolicy::UntilFinished {
                expected,
                timeout_us,
            } => {
                if !poll_until(clock, timeout_us, || self.finished_count() >= expected) {
                    crate::kwarn!(
                        "MP: {} of {} APs finished within {}us",
                        self.finished_count(),
                        expected,
                        timeout_us
                    );
                }
            }
        }
        self.finished_count()
    }
}
