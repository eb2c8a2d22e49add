//! Local APIC access for the BSP (xAPIC MMIO mode).

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::mp::timer::{busy_wait, Clock};
use crate::mp::IpiTarget;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = 0xFFFFF000;
const DEFAULT_SPURIOUS_VECTOR: u8 = 0xFF;

const REG_ID: u32 = 0x20;
const REG_SVR: u32 = 0x0F0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;

const ICR_DELIVERY_INIT: u32 = 0x500;
const ICR_DELIVERY_STARTUP: u32 = 0x600;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_SEND_PENDING: u32 = 1 << 12;
const ICR_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

/// Delay after INIT before the first STARTUP.
pub const INIT_DELAY_US: u64 = 10_000;
/// Delay between the two STARTUP IPIs.
pub const SIPI_DELAY_US: u64 = 200;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

pub fn init(lapic_base: u64) {
    LAPIC_BASE.store(lapic_base & APIC_BASE_MASK, Ordering::SeqCst);
    enable_apic();
    crate::kinfo!(
        "LAPIC: Enabled local APIC at {:#x} (ID {:#x})",
        lapic_base,
        current_apic_id()
    );
}

pub fn current_apic_id() -> u32 {
    unsafe { read_register(REG_ID) >> 24 }
}

/// INIT, wait, STARTUP, wait, STARTUP; the target starts in real mode at
/// `vector << 12`.
pub fn send_init_sipi_sipi<C: Clock + ?Sized>(target: IpiTarget, vector: u8, clock: &C) {
    let (apic_id, shorthand) = match target {
        IpiTarget::AllExcludingSelf => (0, ICR_ALL_EXCLUDING_SELF),
        IpiTarget::Apic(apic_id) => (apic_id, 0),
    };

    send_ipi(apic_id, shorthand | ICR_LEVEL_ASSERT | ICR_DELIVERY_INIT);
    busy_wait(clock, INIT_DELAY_US);

    let startup = shorthand | ICR_LEVEL_ASSERT | ICR_DELIVERY_STARTUP | vector as u32;
    send_ipi(apic_id, startup);
    busy_wait(clock, SIPI_DELAY_US);
    send_ipi(apic_id, startup);
    busy_wait(clock, SIPI_DELAY_US);
}

fn send_ipi(apic_id: u32, command: u32) {
    unsafe {
        wait_for_icr();
        write_register(REG_ICR_HIGH, apic_id << 24);
        write_register(REG_ICR_LOW, command);
        wait_for_icr();
    }
}

unsafe fn wait_for_icr() {
    while (read_register(REG_ICR_LOW) & ICR_SEND_PENDING) != 0 {
        core::hint::spin_loop();
    }
}

unsafe fn read_register(offset: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    let ptr = (base + offset as u64) as *const u32;
    read_volatile(ptr)
}

unsafe fn write_register(offset: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    let ptr = (base + offset as u64) as *mut u32;
    write_volatile(ptr, value);
}

fn enable_apic() {
    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let mut value = msr.read();
        let base = LAPIC_BASE.load(Ordering::SeqCst);
        value &= !APIC_BASE_MASK;
        value |= base & APIC_BASE_MASK;
        value |= APIC_ENABLE;
        msr.write(value);

        let mut svr = read_register(REG_SVR);
        svr &= !0xFF;
        svr |= DEFAULT_SPURIOUS_VECTOR as u32;
        svr |= 1 << 8; // APIC software enable
        write_register(REG_SVR, svr);
    }
}
