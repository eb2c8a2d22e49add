//! Capabilities the bring-up code consumes.
//!
//! `Platform` is the processor-facing side (registers, IPIs, MTRRs,
//! microcode) and must be usable from every AP at once. `BootServices` is the
//! boot-phase memory side and is only ever touched by the BSP.

use x86_64::structures::DescriptorTablePointer;

use super::memory::{MemoryDescriptor, MemoryType};
use super::types::{IpiTarget, MtrrSettings, TrampolineMap};

pub trait Platform: Sync {
    /// Initial APIC ID of the calling processor.
    fn apic_id(&self) -> u32;

    /// Load `gdtr` on the calling processor and reload segment registers.
    ///
    /// # Safety
    /// `gdtr` must describe a valid GDT containing the selectors the
    /// implementation reloads, and must outlive its use.
    unsafe fn load_gdt(&self, gdtr: &DescriptorTablePointer);

    fn read_idtr(&self) -> DescriptorTablePointer;

    /// Physical address of the active top-level page table.
    fn read_cr3(&self) -> u64;

    /// INIT, STARTUP, STARTUP at the page containing `start_address`.
    fn send_init_sipi_sipi(&self, target: IpiTarget, start_address: u32);

    fn save_mtrrs(&self) -> MtrrSettings;

    fn apply_mtrrs(&self, settings: &MtrrSettings);

    /// Detect and apply a microcode update on the calling processor.
    fn load_microcode(&self);

    /// Location of the mode-transition stub image.
    fn trampoline(&self) -> TrampolineMap;
}

pub trait BootServices {
    fn memory_descriptors(&self) -> &[MemoryDescriptor];

    /// Reserve `pages` contiguous 4 KiB pages, returning the physical base.
    fn allocate_pages(&mut self, memory_type: MemoryType, pages: usize) -> Option<u64>;

    /// Mark `[base, base + length)` as taken for later boot stages.
    ///
    /// Returns `false` if the reservation could not be kept.
    fn record_allocation(&mut self, base: u64, length: u64, memory_type: MemoryType) -> bool;

    /// Pointer through which the BSP reaches physical `address`.
    fn phys_to_ptr(&self, address: u64) -> *mut u8 {
        address as usize as *mut u8
    }
}
