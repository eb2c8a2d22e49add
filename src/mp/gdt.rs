//! Transition GDT
//!
//! APs leave real mode through this table, and the BSP switches to it before
//! the census so both sides agree on selectors. The table is immutable; only
//! its pointer is handed around.

use core::mem::size_of;

use x86_64::structures::gdt::DescriptorFlags as F;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::platform::Platform;

pub const GDT_ENTRY_COUNT: usize = 9;

pub const LINEAR_DATA_SELECTOR: u16 = 0x08;
pub const LINEAR_CODE_SELECTOR: u16 = 0x10;
pub const SYS_DATA_SELECTOR: u16 = 0x18;
pub const SYS_CODE_SELECTOR: u16 = 0x20;
pub const SYS_DATA64_SELECTOR: u16 = 0x30;
pub const SYS_CODE64_SELECTOR: u16 = 0x38;

const FLAT_4G: u64 = F::LIMIT_0_15.bits()
    | F::LIMIT_16_19.bits()
    | F::USER_SEGMENT.bits()
    | F::PRESENT.bits()
    | F::GRANULARITY.bits();

const DATA_RW: u64 = FLAT_4G | F::DEFAULT_SIZE.bits() | F::WRITABLE.bits();
const DATA_RW_ACCESSED: u64 = DATA_RW | F::ACCESSED.bits();
const CODE_RX: u64 = FLAT_4G | F::DEFAULT_SIZE.bits() | F::EXECUTABLE.bits() | F::WRITABLE.bits();
const CODE_RX_CONFORMING: u64 = CODE_RX | F::CONFORMING.bits() | F::ACCESSED.bits();
const CODE64_RX: u64 = FLAT_4G | F::LONG_MODE.bits() | F::EXECUTABLE.bits() | F::WRITABLE.bits();

#[repr(C, align(8))]
pub struct TransitionGdt(pub [u64; GDT_ENTRY_COUNT]);

pub static TRANSITION_GDT: TransitionGdt = TransitionGdt([
    0,                  // 0x00 null
    DATA_RW,            // 0x08 linear data
    CODE_RX_CONFORMING, // 0x10 linear code
    DATA_RW_ACCESSED,   // 0x18 system data
    CODE_RX,            // 0x20 system code
    0,                  // 0x28 spare
    DATA_RW,            // 0x30 system data
    CODE64_RX,          // 0x38 64-bit system code
    0,                  // 0x40 spare
]);

/// GDTR value describing `TRANSITION_GDT`.
pub fn transition_gdtr() -> DescriptorTablePointer {
    DescriptorTablePointer {
        limit: (size_of::<TransitionGdt>() - 1) as u16,
        base: VirtAddr::from_ptr(TRANSITION_GDT.0.as_ptr()),
    }
}

/// Switch the calling processor to the transition GDT.
pub fn install_gdt<P: Platform + ?Sized>(platform: &P) {
    let gdtr = transition_gdtr();
    crate::kdebug!(
        "MP: Loading transition GDT at {:#x} (limit {:#x})",
        gdtr.base.as_u64(),
        gdtr.limit
    );
    // SAFETY: TRANSITION_GDT is static and holds every selector reloaded.
    unsafe { platform.load_gdt(&gdtr) };
}
