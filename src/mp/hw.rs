//! Hardware-backed `Platform` for x86-64 firmware.
//!
//! Register reads use CPUID/CR3/SIDT, startup signals go through the local
//! APIC, and MTRRs are read and programmed directly. The mode-transition stub
//! and any microcode loader are supplied by the integrator.

use core::arch::asm;
use core::arch::x86_64::__cpuid;

use x86_64::instructions::tables::{lgdt, sidt};
use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr3, Cr4, Cr4Flags};
use x86_64::registers::model_specific::Msr;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::DescriptorTablePointer;
use x86_64::PrivilegeLevel;

use crate::lapic;

use super::gdt::{SYS_CODE64_SELECTOR, SYS_DATA64_SELECTOR};
use super::platform::Platform;
use super::timer::TscClock;
use super::types::{
    IpiTarget, MtrrSettings, TrampolineMap, VariableMtrr, FIXED_MTRR_COUNT, MAX_VARIABLE_MTRRS,
};

const IA32_MTRRCAP: u32 = 0xFE;
const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;

const MTRRCAP_VCNT_MASK: u64 = 0xFF;
const MTRR_DEF_TYPE_ENABLE: u64 = 1 << 11;
const MTRR_DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;

const FIXED_MTRR_MSRS: [u32; FIXED_MTRR_COUNT] = [
    0x250, // 64K_00000
    0x258, // 16K_80000
    0x259, // 16K_A0000
    0x268, 0x269, 0x26A, 0x26B, 0x26C, 0x26D, 0x26E, 0x26F, // 4K_C0000..4K_F8000
];

pub struct X86Platform {
    trampoline: TrampolineMap,
    clock: TscClock,
    microcode_loader: Option<fn()>,
}

impl X86Platform {
    /// Enable the BSP's local APIC at `lapic_base` and wrap the stub image.
    pub fn new(trampoline: TrampolineMap, lapic_base: u64) -> Self {
        lapic::init(lapic_base);
        Self {
            trampoline,
            clock: TscClock::new(),
            microcode_loader: None,
        }
    }

    pub fn with_microcode_loader(mut self, loader: fn()) -> Self {
        self.microcode_loader = Some(loader);
        self
    }

    pub fn clock(&self) -> &TscClock {
        &self.clock
    }
}

impl Platform for X86Platform {
    fn apic_id(&self) -> u32 {
        // SAFETY: CPUID leaf 1 exists on every x86-64 processor.
        unsafe { __cpuid(1).ebx >> 24 }
    }

    unsafe fn load_gdt(&self, gdtr: &DescriptorTablePointer) {
        lgdt(gdtr);
        CS::set_reg(SegmentSelector::new(SYS_CODE64_SELECTOR >> 3, PrivilegeLevel::Ring0));
        let data = SegmentSelector::new(SYS_DATA64_SELECTOR >> 3, PrivilegeLevel::Ring0);
        DS::set_reg(data);
        ES::set_reg(data);
        SS::set_reg(data);
    }

    fn read_idtr(&self) -> DescriptorTablePointer {
        sidt()
    }

    fn read_cr3(&self) -> u64 {
        Cr3::read().0.start_address().as_u64()
    }

    fn send_init_sipi_sipi(&self, target: IpiTarget, start_address: u32) {
        lapic::send_init_sipi_sipi(target, (start_address >> 12) as u8, &self.clock);
    }

    fn save_mtrrs(&self) -> MtrrSettings {
        let mut settings = MtrrSettings::default();
        // SAFETY: MTRR MSRs are architectural on every x86-64 processor.
        unsafe {
            for (slot, msr) in settings.fixed.iter_mut().zip(FIXED_MTRR_MSRS) {
                *slot = Msr::new(msr).read();
            }

            let count = variable_mtrr_count();
            for (i, pair) in settings.variable.iter_mut().take(count).enumerate() {
                *pair = VariableMtrr {
                    base: Msr::new(IA32_MTRR_PHYSBASE0 + 2 * i as u32).read(),
                    mask: Msr::new(IA32_MTRR_PHYSBASE0 + 2 * i as u32 + 1).read(),
                };
            }
            settings.variable_count = count as u32;
            settings.default_type = Msr::new(IA32_MTRR_DEF_TYPE).read();
        }
        settings
    }

    fn apply_mtrrs(&self, settings: &MtrrSettings) {
        // SAFETY: follows the SDM MTRR update sequence with caches disabled
        // and global pages flushed; runs on the calling processor only.
        unsafe {
            let saved_cr0 = Cr0::read();
            let saved_cr4 = Cr4::read();

            Cr0::update(|cr0| {
                cr0.insert(Cr0Flags::CACHE_DISABLE);
                cr0.remove(Cr0Flags::NOT_WRITE_THROUGH);
            });
            asm!("wbinvd", options(nostack, preserves_flags));
            if saved_cr4.contains(Cr4Flags::PAGE_GLOBAL) {
                Cr4::write(saved_cr4 - Cr4Flags::PAGE_GLOBAL);
            }
            tlb::flush_all();

            let mut def_type = Msr::new(IA32_MTRR_DEF_TYPE);
            def_type.write(settings.default_type & !(MTRR_DEF_TYPE_ENABLE | MTRR_DEF_TYPE_FIXED_ENABLE));

            for (value, msr) in settings.fixed.iter().zip(FIXED_MTRR_MSRS) {
                Msr::new(msr).write(*value);
            }
            let count = (settings.variable_count as usize)
                .min(variable_mtrr_count())
                .min(MAX_VARIABLE_MTRRS);
            for (i, pair) in settings.variable.iter().take(count).enumerate() {
                Msr::new(IA32_MTRR_PHYSBASE0 + 2 * i as u32).write(pair.base);
                Msr::new(IA32_MTRR_PHYSBASE0 + 2 * i as u32 + 1).write(pair.mask);
            }

            def_type.write(settings.default_type);

            asm!("wbinvd", options(nostack, preserves_flags));
            tlb::flush_all();
            Cr0::write(saved_cr0);
            Cr4::write(saved_cr4);
        }
    }

    fn load_microcode(&self) {
        if let Some(loader) = self.microcode_loader {
            loader();
        }
    }

    fn trampoline(&self) -> TrampolineMap {
        self.trampoline
    }
}

unsafe fn variable_mtrr_count() -> usize {
    ((Msr::new(IA32_MTRRCAP).read() & MTRRCAP_VCNT_MASK) as usize).min(MAX_VARIABLE_MTRRS)
}
