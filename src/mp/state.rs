//! Shared bring-up state and the handle later boot stages hold.
//!
//! `MpState` sits in the combined page allocation next to the AP stacks. The
//! BSP owns every field except `finished_count`, which APs increment, and the
//! discovery slots, each written by the single AP that claimed its index.
//! The roster itself is assembled from settled slots and only ever written by
//! the BSP, so a handshake that finishes after the deadline cannot disturb it.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::NonNull;
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::exchange::ExchangeInfo;
use super::platform::Platform;
use super::types::{ApProcedure, HealthFlags, MtrrSettings, ProcessorRecord, TrampolineMap};

#[repr(C)]
pub struct MpState {
    /// Physical base of the AP stack region.
    pub(crate) buffer: u64,
    /// The same region as seen by the BSP.
    pub(crate) stacks: *mut u8,
    pub(crate) ap_stack_size: usize,
    pub(crate) wakeup_buffer: u64,
    pub(crate) wakeup_buffer_size: usize,
    pub(crate) wakeup_ptr: *mut u8,
    pub(crate) backup_buffer: *mut u8,
    pub(crate) backup_buffer_size: usize,
    pub(crate) exchange: *mut ExchangeInfo,
    /// Sorted roster, BSP-written.
    pub(crate) records: *mut ProcessorRecord,
    /// One mailbox per census index, AP-written.
    pub(crate) slots: *const DiscoverySlot,
    pub(crate) max_processors: u32,
    pub(crate) cpu_count: u32,
    pub(crate) bsp_number: u32,
    pub(crate) finished_count: AtomicU32,
    pub(crate) first_pass: AtomicBool,
    pub(crate) procedure: Option<ApProcedure>,
    pub(crate) procedure_argument: *mut c_void,
    pub(crate) trampoline: TrampolineMap,
    pub(crate) mtrrs: MtrrSettings,
}

impl MpState {
    /// Word the stub stores at the top of AP `index`'s stack slot.
    ///
    /// # Safety
    /// `index` must be in `1..=max_processors`.
    pub(crate) unsafe fn bist_slot(&self, index: usize) -> *const u64 {
        self.stacks
            .add(index * self.ap_stack_size - size_of::<u64>())
            .cast::<u64>()
    }
}

/// Mailbox an AP fills during the census, indexed by its claimed number.
///
/// The APIC ID doubles as the publish flag: it is stored last with release
/// ordering, and `VACANT` means nothing has been published yet.
#[repr(C)]
pub struct DiscoverySlot {
    apic_id: AtomicU32,
    health: AtomicU32,
}

impl DiscoverySlot {
    /// x2APIC broadcast ID; never a real processor.
    pub const VACANT: u32 = u32::MAX;

    pub const fn vacant() -> Self {
        Self {
            apic_id: AtomicU32::new(Self::VACANT),
            health: AtomicU32::new(0),
        }
    }

    pub(crate) fn publish(&self, record: ProcessorRecord) {
        self.health.store(record.health.0, Ordering::Relaxed);
        self.apic_id.store(record.apic_id, Ordering::Release);
    }

    pub(crate) fn load(&self) -> Option<ProcessorRecord> {
        let apic_id = self.apic_id.load(Ordering::Acquire);
        if apic_id == Self::VACANT {
            return None;
        }
        Some(ProcessorRecord::new(
            apic_id,
            HealthFlags(self.health.load(Ordering::Relaxed)),
        ))
    }

    pub(crate) fn clear(&self) {
        self.apic_id.store(Self::VACANT, Ordering::Relaxed);
        self.health.store(0, Ordering::Relaxed);
    }
}

/// Bring-up results plus the ability to dispatch work to APs again.
pub struct CpuMp<'p, P: Platform> {
    pub(crate) state: NonNull<MpState>,
    pub(crate) platform: &'p P,
}

impl<'p, P: Platform> CpuMp<'p, P> {
    /// # Safety
    /// `state` must point to an initialised `MpState` that outlives the
    /// handle, with its buffers laid out by `prepare_startup_vector`.
    pub(crate) unsafe fn from_raw(state: NonNull<MpState>, platform: &'p P) -> Self {
        Self { state, platform }
    }

    pub(crate) fn state(&self) -> &MpState {
        // SAFETY: from_raw guarantees a live, initialised state.
        unsafe { self.state.as_ref() }
    }

    pub fn platform(&self) -> &'p P {
        self.platform
    }

    /// Processors in the roster, boot processor included.
    pub fn processor_count(&self) -> usize {
        self.state().cpu_count as usize
    }

    /// Roster index of the boot processor.
    pub fn boot_index(&self) -> usize {
        self.state().bsp_number as usize
    }

    pub fn max_processors(&self) -> usize {
        self.state().max_processors as usize
    }

    pub fn records(&self) -> &[ProcessorRecord] {
        let state = self.state();
        // SAFETY: entries 0..cpu_count were written by the BSP during the
        // census and only the BSP writes the roster.
        unsafe { slice::from_raw_parts(state.records, state.cpu_count as usize) }
    }

    pub fn record(&self, index: usize) -> Option<ProcessorRecord> {
        self.records().get(index).copied()
    }

    pub fn boot_record(&self) -> ProcessorRecord {
        self.records()[self.boot_index()]
    }

    /// Handshakes completed since the last startup signal.
    pub fn finished_count(&self) -> u32 {
        self.state().finished_count.load(Ordering::Acquire)
    }

    /// Processors that entered the stub since the last startup signal.
    pub fn responded_count(&self) -> u32 {
        self.exchange_info().num_aps_executing.load(Ordering::Acquire)
    }

    pub fn exchange_info(&self) -> &ExchangeInfo {
        // SAFETY: the exchange area is initialised before the handle exists.
        unsafe { &*self.state().exchange }
    }

    pub fn wakeup_buffer(&self) -> u64 {
        self.state().wakeup_buffer
    }

    pub fn wakeup_buffer_size(&self) -> usize {
        self.state().wakeup_buffer_size
    }

    pub fn stack_base(&self) -> u64 {
        self.state().buffer
    }

    pub fn ap_stack_size(&self) -> usize {
        self.state().ap_stack_size
    }

    pub fn is_first_pass(&self) -> bool {
        self.state().first_pass.load(Ordering::Acquire)
    }

    pub fn mtrr_snapshot(&self) -> &MtrrSettings {
        &self.state().mtrrs
    }
}
