//! MP Type Definitions
//!
//! Processor records, the transition address map, the MTRR snapshot shared
//! with every AP, and the constants that bound the wakeup buffer.

use core::ffi::c_void;

/// The wakeup buffer must end at or below this physical address.
pub const BASE_1MB: u64 = 0x10_0000;

/// Wakeup buffer alignment (a STARTUP IPI vector names a 4 KiB page).
pub const SIZE_4KB: u64 = 0x1000;

/// Largest wakeup buffer a real-mode segment can address.
pub const WAKEUP_BUFFER_MAX_SIZE: usize = 0x1_0000;

/// Fixed-range MTRR MSR count (one 64K, two 16K, eight 4K).
pub const FIXED_MTRR_COUNT: usize = 11;

/// Variable-range MTRR pairs kept in a snapshot.
pub const MAX_VARIABLE_MTRRS: usize = 10;

/// Procedure run by APs on a non-census dispatch.
pub type ApProcedure = extern "C" fn(argument: *mut c_void);

/// Built-in self-test result reported by a processor; zero means healthy.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthFlags(pub u32);

impl HealthFlags {
    pub const HEALTHY: Self = Self(0);

    pub const fn is_healthy(self) -> bool {
        self.0 == 0
    }

    pub const fn bist(self) -> u32 {
        self.0
    }
}

/// Identity and self-test status of one logical processor.
///
/// Written once by the processor that claimed the slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessorRecord {
    pub apic_id: u32,
    pub health: HealthFlags,
}

impl ProcessorRecord {
    pub const fn new(apic_id: u32, health: HealthFlags) -> Self {
        Self { apic_id, health }
    }
}

/// Where the mode-transition stub lives and where it switches modes.
///
/// Produced by the assembly side; the image is copied verbatim into the
/// wakeup buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrampolineMap {
    /// Address of the stub image in the current address space.
    pub image_address: u64,
    pub image_size: usize,
    /// Offset of the 32-bit protected-mode entry inside the image.
    pub pmode_entry_offset: usize,
    /// Offset of the 64-bit long-mode entry inside the image.
    pub lmode_entry_offset: usize,
}

impl TrampolineMap {
    /// Map an in-memory stub image.
    pub fn from_image(image: &'static [u8], pmode_entry_offset: usize, lmode_entry_offset: usize) -> Self {
        Self {
            image_address: image.as_ptr() as u64,
            image_size: image.len(),
            pmode_entry_offset,
            lmode_entry_offset,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VariableMtrr {
    pub base: u64,
    pub mask: u64,
}

/// Memory-type-range register contents captured on the BSP.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MtrrSettings {
    pub fixed: [u64; FIXED_MTRR_COUNT],
    pub variable: [VariableMtrr; MAX_VARIABLE_MTRRS],
    /// Number of valid entries in `variable`.
    pub variable_count: u32,
    pub default_type: u64,
}

/// Who receives a startup signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiTarget {
    /// Every processor except the sender.
    AllExcludingSelf,
    /// One processor by APIC ID.
    Apic(u32),
}
