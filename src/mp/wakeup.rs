//! Wakeup Buffer Management
//!
//! Finds a 4 KiB-aligned range below 1 MiB for the AP stub, saves whatever
//! was there, copies the stub in, and lays out the single allocation that
//! holds AP stacks, the shared state, the backup copy, the roster and the
//! discovery slots.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU32};

use crate::config::MpConfig;
use crate::error::MpError;

use super::exchange::ExchangeInfo;
use super::memory::{align_down, align_up, MemoryType};
use super::platform::{BootServices, Platform};
use super::state::{CpuMp, DiscoverySlot, MpState};
use super::types::{
    HealthFlags, MtrrSettings, ProcessorRecord, BASE_1MB, SIZE_4KB, WAKEUP_BUFFER_MAX_SIZE,
};

/// Reserve `size` bytes of low memory for the AP stub.
///
/// Descriptors are visited in list order; the first free, unprotected
/// system-memory descriptor starting below 1 MiB that can hold `size` bytes
/// at a 4 KiB-aligned address wins, and the highest such address inside it
/// is used. Fails if the range cannot be recorded as reserved, since an
/// unrecorded range could be handed out again while the stub runs.
pub fn find_wakeup_buffer<B: BootServices + ?Sized>(
    services: &mut B,
    size: usize,
) -> Result<u64, MpError> {
    let size = size as u64;
    let mut found = None;

    for descriptor in services.memory_descriptors() {
        if !descriptor.is_usable_low_memory() {
            continue;
        }

        let end = descriptor.end().min(BASE_1MB);
        let Some(start) = end.checked_sub(size).map(|top| align_down(top, SIZE_4KB)) else {
            continue;
        };
        if start < descriptor.start {
            continue;
        }

        found = Some(start);
        break;
    }

    let start = found.ok_or(MpError::NoWakeupBuffer)?;
    if !services.record_allocation(start, size, MemoryType::BootServicesData) {
        crate::kerror!("MP: Could not reserve wakeup buffer at {:#x}", start);
        return Err(MpError::AllocationFailure);
    }
    Ok(start)
}

/// Save the buffer's current contents, then copy the stub image over it.
///
/// # Safety
/// The state's wakeup, backup and image pointers must be valid for their
/// recorded sizes and must not overlap.
pub(crate) unsafe fn backup_and_prepare(state: &MpState) {
    ptr::copy_nonoverlapping(
        state.wakeup_ptr as *const u8,
        state.backup_buffer,
        state.backup_buffer_size,
    );
    ptr::copy_nonoverlapping(
        state.trampoline.image_address as usize as *const u8,
        state.wakeup_ptr,
        state.trampoline.image_size,
    );
}

/// Offsets inside the combined allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpLayout {
    pub stacks_size: usize,
    pub state_offset: usize,
    pub backup_offset: usize,
    pub records_offset: usize,
    pub slots_offset: usize,
    pub total_size: usize,
}

impl MpLayout {
    /// `None` if any region size overflows `usize`.
    pub fn new(
        ap_stack_size: usize,
        max_processors: usize,
        wakeup_buffer_size: usize,
    ) -> Option<Self> {
        let stacks_size = ap_stack_size.checked_mul(max_processors)?;
        let state_offset = checked_align(stacks_size, align_of::<MpState>())?;
        let backup_offset = state_offset.checked_add(size_of::<MpState>())?;
        let records_offset = checked_align(
            backup_offset.checked_add(wakeup_buffer_size)?,
            align_of::<ProcessorRecord>(),
        )?;
        let slots_offset = checked_align(
            size_of::<ProcessorRecord>()
                .checked_mul(max_processors)?
                .checked_add(records_offset)?,
            align_of::<DiscoverySlot>(),
        )?;
        let total_size = size_of::<DiscoverySlot>()
            .checked_mul(max_processors)?
            .checked_add(slots_offset)?;
        // Page rounding must not wrap either.
        total_size.checked_add(SIZE_4KB as usize - 1)?;
        Some(Self {
            stacks_size,
            state_offset,
            backup_offset,
            records_offset,
            slots_offset,
            total_size,
        })
    }

    pub fn pages(&self) -> usize {
        self.total_size.div_ceil(SIZE_4KB as usize)
    }
}

fn checked_align(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Reserve everything the census needs and install the AP stub.
///
/// Record 0 is the calling processor; the roster count starts at 1.
pub fn prepare_startup_vector<'p, P, B>(
    platform: &'p P,
    services: &mut B,
    config: &MpConfig,
) -> Result<CpuMp<'p, P>, MpError>
where
    P: Platform,
    B: BootServices + ?Sized,
{
    config.validate()?;

    let trampoline = platform.trampoline();
    let wakeup_buffer_size = ExchangeInfo::wakeup_buffer_size(trampoline.image_size);
    let reserved_size = align_up(wakeup_buffer_size as u64, SIZE_4KB) as usize;
    if reserved_size > WAKEUP_BUFFER_MAX_SIZE {
        return Err(MpError::TrampolineTooLarge(wakeup_buffer_size));
    }

    let wakeup_buffer = find_wakeup_buffer(services, reserved_size)?;
    crate::kinfo!("MP: WakeupBuffer = {:#x}", wakeup_buffer);

    let max_processors = config.max_processors as usize;
    let layout = MpLayout::new(config.ap_stack_size, max_processors, wakeup_buffer_size)
        .ok_or(MpError::InvalidConfig("AP stack region too large"))?;
    let buffer = services
        .allocate_pages(MemoryType::BootServicesData, layout.pages())
        .ok_or(MpError::AllocationFailure)?;
    crate::kdebug!(
        "MP: Data buffer {:#x} ({} pages, stacks {:#x} x {})",
        buffer,
        layout.pages(),
        config.ap_stack_size,
        max_processors
    );

    let base = NonNull::new(services.phys_to_ptr(buffer)).ok_or(MpError::AllocationFailure)?;
    let wakeup_ptr = services.phys_to_ptr(wakeup_buffer);
    if wakeup_ptr.is_null() {
        return Err(MpError::NoWakeupBuffer);
    }

    // SAFETY: every offset lies inside the `layout.total_size` bytes just
    // allocated, and the exchange area inside the reserved wakeup buffer.
    unsafe {
        let base = base.as_ptr();
        let state = base.add(layout.state_offset).cast::<MpState>();
        let records = base.add(layout.records_offset).cast::<ProcessorRecord>();
        let slots = base.add(layout.slots_offset).cast::<DiscoverySlot>();
        let exchange = wakeup_ptr
            .add(ExchangeInfo::offset_in_buffer(trampoline.image_size))
            .cast::<ExchangeInfo>();

        ptr::write_bytes(records, 0, max_processors);
        for index in 0..max_processors {
            slots.add(index).write(DiscoverySlot::vacant());
        }
        state.write(MpState {
            buffer,
            stacks: base,
            ap_stack_size: config.ap_stack_size,
            wakeup_buffer,
            wakeup_buffer_size,
            wakeup_ptr,
            backup_buffer: base.add(layout.backup_offset),
            backup_buffer_size: wakeup_buffer_size,
            exchange,
            records,
            slots,
            max_processors: config.max_processors,
            cpu_count: 1,
            bsp_number: 0,
            finished_count: AtomicU32::new(0),
            first_pass: AtomicBool::new(false),
            procedure: None,
            procedure_argument: ptr::null_mut(),
            trampoline,
            mtrrs: MtrrSettings::default(),
        });
        records.write(ProcessorRecord::new(platform.apic_id(), HealthFlags::HEALTHY));

        backup_and_prepare(&*state);

        Ok(CpuMp::from_raw(NonNull::new_unchecked(state), platform))
    }
}

impl<'p, P: Platform> CpuMp<'p, P> {
    /// Put the wakeup buffer's original contents back.
    ///
    /// Call once no AP will execute the stub again; a later startup signal
    /// would land in whatever the buffer held before.
    pub fn restore_wakeup_buffer(&mut self) {
        let state = self.state();
        crate::kdebug!(
            "MP: Restoring {} bytes at wakeup buffer {:#x}",
            state.backup_buffer_size,
            state.wakeup_buffer
        );
        // SAFETY: both regions were sized by prepare_startup_vector.
        unsafe {
            ptr::copy_nonoverlapping(
                state.backup_buffer as *const u8,
                state.wakeup_ptr,
                state.backup_buffer_size,
            );
        }
    }
}
