//! Virtual Multi-Processor Machine
//!
//! Implements `Platform` and `Clock` for the bring-up code. The BSP's view
//! (CR3, IDTR, MTRRs) is fixed at construction. Each simulated AP, once its
//! startup signal is due, does what the real-mode stub does before calling
//! into Rust:
//!
//! 1. locate the exchange area behind the stub image
//! 2. claim an index with `num_aps_executing.fetch_add(1) + 1`
//! 3. store its BIST word at the top of stack slot `index - 1`
//! 4. call `c_function(exchange, index)` with its own APIC ID current
//!
//! An AP may also be stalled inside the handshake: it claims its index on
//! time, then blocks in its first `apic_id()` read on a thread of its own
//! until virtual time reaches its release point or the test lets it go.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use nexa_mp::mp::{
    Clock, ExchangeInfo, IpiTarget, MtrrSettings, Platform, TrampolineMap, VariableMtrr,
};
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::memory::{PhysMemory, DEFAULT_MEMORY_SIZE};

pub const STUB_IMAGE_SIZE: usize = 0x200;
pub const STUB_PMODE_OFFSET: usize = 0x100;
pub const STUB_LMODE_OFFSET: usize = 0x180;

/// Stand-in for the assembled stub; never executed.
pub static STUB_IMAGE: [u8; STUB_IMAGE_SIZE] = [0xF4; STUB_IMAGE_SIZE];

pub const SIM_CR3: u64 = 0x0030_0000;
pub const DEFAULT_ARRIVAL_US: u64 = 20;
pub const DEFAULT_TICK_US: u64 = 10;

thread_local! {
    static CURRENT_APIC_ID: Cell<Option<u32>> = const { Cell::new(None) };
    static STALL_GATE: RefCell<Option<Arc<Gate>>> = const { RefCell::new(None) };
}

/// Where a stalled AP waits for the test to let it continue.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

/// How long an AP sits inside the handshake after claiming its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stall {
    None,
    /// Virtual microseconds after stub entry.
    For(u64),
    /// Until `SimMachine::release_stalled`.
    UntilReleased,
}

struct StalledAp {
    release_at: Option<u64>,
    gate: Arc<Gate>,
    handle: JoinHandle<()>,
}

/// Exchange pointer handed to a stalled AP's thread.
struct ExchangePtr(*const ExchangeInfo);

// SAFETY: the exchange area lives in the arena, which outlives every AP
// thread because `SimMachine` joins them before dropping it.
unsafe impl Send for ExchangePtr {}

/// One application processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimAp {
    pub apic_id: u32,
    /// Microseconds from the startup signal to stub entry; `None` never
    /// answers.
    pub arrival_us: Option<u64>,
    pub bist: u32,
    pub stall: Stall,
}

impl SimAp {
    pub fn new(apic_id: u32) -> Self {
        Self {
            apic_id,
            arrival_us: Some(DEFAULT_ARRIVAL_US),
            bist: 0,
            stall: Stall::None,
        }
    }

    /// Claim an index on arrival, then block until released by the test.
    pub fn stalled_in_handshake(mut self) -> Self {
        self.stall = Stall::UntilReleased;
        self
    }

    /// Claim an index on arrival, then block for `micros` of virtual time.
    pub fn stalled_in_handshake_for(mut self, micros: u64) -> Self {
        self.stall = Stall::For(micros);
        self
    }

    pub fn arriving_after(mut self, micros: u64) -> Self {
        self.arrival_us = Some(micros);
        self
    }

    pub fn silent(mut self) -> Self {
        self.arrival_us = None;
        self
    }

    pub fn with_bist(mut self, bist: u32) -> Self {
        self.bist = bist;
        self
    }
}

/// How signalled APs get to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// On the BSP's thread, from `Clock::relax`, once virtual time reaches
    /// their arrival.
    Virtual,
    /// On one OS thread each, released together, before the signal returns.
    Concurrent,
}

#[derive(Clone, Copy, Debug)]
struct PendingAp {
    ap: SimAp,
    start: u64,
    due_us: u64,
}

pub struct SimMachine {
    memory: Arc<PhysMemory>,
    bsp_apic_id: u32,
    aps: Vec<SimAp>,
    delivery: Delivery,
    trampoline: TrampolineMap,
    tick_us: u64,
    now_us: AtomicU64,
    pending: Mutex<Vec<PendingAp>>,
    signals: Mutex<Vec<(IpiTarget, u32)>>,
    gdt_loads: Mutex<Vec<DescriptorTablePointer>>,
    idtr: DescriptorTablePointer,
    mtrrs: MtrrSettings,
    applied_mtrrs: Mutex<Vec<(u32, MtrrSettings)>>,
    microcode_loads: AtomicU32,
    stalled: Mutex<Vec<StalledAp>>,
}

impl SimMachine {
    pub fn new(bsp_apic_id: u32) -> Self {
        Self {
            memory: PhysMemory::new(DEFAULT_MEMORY_SIZE),
            bsp_apic_id,
            aps: Vec::new(),
            delivery: Delivery::Virtual,
            trampoline: TrampolineMap::from_image(&STUB_IMAGE, STUB_PMODE_OFFSET, STUB_LMODE_OFFSET),
            tick_us: DEFAULT_TICK_US,
            now_us: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            gdt_loads: Mutex::new(Vec::new()),
            idtr: DescriptorTablePointer {
                limit: 0xFFF,
                base: VirtAddr::new(0xFFFF_8000_0010_0000),
            },
            mtrrs: sample_mtrrs(),
            applied_mtrrs: Mutex::new(Vec::new()),
            microcode_loads: AtomicU32::new(0),
            stalled: Mutex::new(Vec::new()),
        }
    }

    /// Add APs with default timing and a passing BIST.
    pub fn with_aps(mut self, apic_ids: &[u32]) -> Self {
        self.aps.extend(apic_ids.iter().copied().map(SimAp::new));
        self
    }

    pub fn with_ap(mut self, ap: SimAp) -> Self {
        self.aps.push(ap);
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Replace the stub image the machine reports.
    pub fn with_stub_image(mut self, image: &'static [u8]) -> Self {
        self.trampoline = TrampolineMap::from_image(image, STUB_PMODE_OFFSET, STUB_LMODE_OFFSET);
        self
    }

    pub fn with_tick(mut self, tick_us: u64) -> Self {
        self.tick_us = tick_us.max(1);
        self
    }

    pub fn memory(&self) -> Arc<PhysMemory> {
        Arc::clone(&self.memory)
    }

    pub fn bsp_apic_id(&self) -> u32 {
        self.bsp_apic_id
    }

    pub fn idtr(&self) -> DescriptorTablePointer {
        self.idtr
    }

    pub fn mtrrs(&self) -> MtrrSettings {
        self.mtrrs
    }

    pub fn signals(&self) -> Vec<(IpiTarget, u32)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn gdt_loads(&self) -> Vec<DescriptorTablePointer> {
        self.gdt_loads.lock().unwrap().clone()
    }

    /// `(apic_id, settings)` for every `apply_mtrrs` call, in call order.
    pub fn applied_mtrrs(&self) -> Vec<(u32, MtrrSettings)> {
        self.applied_mtrrs.lock().unwrap().clone()
    }

    pub fn microcode_loads(&self) -> u32 {
        self.microcode_loads.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// APs that claimed an index and are still blocked in the handshake.
    pub fn stalled_count(&self) -> usize {
        self.stalled.lock().unwrap().len()
    }

    pub fn advance(&self, micros: u64) {
        let now = self.now_us.fetch_add(micros, Ordering::SeqCst) + micros;
        self.deliver_due(now);
        self.release_due(now);
    }

    /// Let every stalled AP finish its handshake, and wait until it has.
    pub fn release_stalled(&self) {
        // Also runs from Drop, possibly while a failed test unwinds.
        let mut stalled = self.stalled.lock().unwrap_or_else(|e| e.into_inner());
        finish(std::mem::take(&mut *stalled));
    }

    fn release_due(&self, now: u64) {
        let due = {
            let mut stalled = self.stalled.lock().unwrap();
            let (due, waiting): (Vec<_>, Vec<_>) = stalled
                .drain(..)
                .partition(|ap| ap.release_at.is_some_and(|at| at <= now));
            *stalled = waiting;
            due
        };
        finish(due);
    }

    /// Run every signalled AP that has not arrived yet, regardless of time.
    pub fn drain_pending(&self) {
        let mut due = std::mem::take(&mut *self.pending.lock().unwrap());
        due.sort_by_key(|p| p.due_us);
        if let Some(last) = due.last() {
            self.now_us.fetch_max(last.due_us, Ordering::SeqCst);
        }
        for pending in due {
            self.enter_stub(pending.ap, pending.start);
        }
    }

    fn deliver_due(&self, now: u64) {
        let mut due = {
            let mut pending = self.pending.lock().unwrap();
            let (due, waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.due_us <= now);
            *pending = waiting;
            due
        };
        due.sort_by_key(|p| p.due_us);
        for pending in due {
            self.enter_stub(pending.ap, pending.start);
        }
    }

    fn enter_stub(&self, ap: SimAp, start: u64) {
        let (exchange, index) = self.claim_index(ap, start);
        match ap.stall {
            Stall::None => {
                CURRENT_APIC_ID.with(|current| current.set(Some(ap.apic_id)));
                // SAFETY: claim_index located an exchange area the bring-up
                // code filled before signalling.
                unsafe { ((*exchange).c_function)(exchange, index) };
                CURRENT_APIC_ID.with(|current| current.set(None));
            }
            Stall::For(micros) => {
                let release_at = self.now_us.load(Ordering::SeqCst) + micros;
                self.spawn_stalled(ap, exchange, index, Some(release_at));
            }
            Stall::UntilReleased => self.spawn_stalled(ap, exchange, index, None),
        }
    }

    /// Steps 1 to 3 of the stub: find the exchange area, take an index,
    /// push the BIST word.
    fn claim_index(&self, ap: SimAp, start: u64) -> (*const ExchangeInfo, usize) {
        let offset = ExchangeInfo::offset_in_buffer(self.trampoline.image_size) as u64;
        let exchange = self.memory.ptr(start + offset).cast::<ExchangeInfo>() as *const ExchangeInfo;

        // SAFETY: the bring-up code filled the exchange area at this offset
        // before signalling, and the stack region lives in the arena.
        unsafe {
            let index = (*exchange).num_aps_executing.fetch_add(1, Ordering::AcqRel) as usize + 1;
            let bist_slot = self.memory.ptr((*exchange).stack_top(index) - 8).cast::<u64>();
            bist_slot.write_volatile(ap.bist as u64);
            (exchange, index)
        }
    }

    fn spawn_stalled(
        &self,
        ap: SimAp,
        exchange: *const ExchangeInfo,
        index: usize,
        release_at: Option<u64>,
    ) {
        let gate = Arc::new(Gate::default());
        let ap_gate = Arc::clone(&gate);
        let exchange = ExchangePtr(exchange);
        let handle = thread::spawn(move || {
            let exchange = exchange;
            CURRENT_APIC_ID.with(|current| current.set(Some(ap.apic_id)));
            STALL_GATE.with(|slot| *slot.borrow_mut() = Some(ap_gate));
            // SAFETY: as in enter_stub; the machine joins this thread before
            // the arena goes away.
            unsafe { ((*exchange.0).c_function)(exchange.0, index) };
        });
        self.stalled.lock().unwrap().push(StalledAp {
            release_at,
            gate,
            handle,
        });
    }

    fn run_concurrently(&self, aps: &[SimAp], start: u64) {
        let barrier = Barrier::new(aps.len());
        thread::scope(|scope| {
            for ap in aps {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    self.enter_stub(*ap, start);
                });
            }
        });
    }
}

fn finish(stalled: Vec<StalledAp>) {
    for ap in stalled {
        ap.gate.open();
        ap.handle.join().unwrap();
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        self.release_stalled();
    }
}

impl Platform for SimMachine {
    fn apic_id(&self) -> u32 {
        if let Some(gate) = STALL_GATE.with(|slot| slot.borrow_mut().take()) {
            gate.wait();
        }
        CURRENT_APIC_ID
            .with(|current| current.get())
            .unwrap_or(self.bsp_apic_id)
    }

    unsafe fn load_gdt(&self, gdtr: &DescriptorTablePointer) {
        self.gdt_loads.lock().unwrap().push(*gdtr);
    }

    fn read_idtr(&self) -> DescriptorTablePointer {
        self.idtr
    }

    fn read_cr3(&self) -> u64 {
        SIM_CR3
    }

    fn send_init_sipi_sipi(&self, target: IpiTarget, start_address: u32) {
        self.signals.lock().unwrap().push((target, start_address));

        let answering: Vec<SimAp> = self
            .aps
            .iter()
            .filter(|ap| match target {
                IpiTarget::AllExcludingSelf => true,
                IpiTarget::Apic(apic_id) => ap.apic_id == apic_id,
            })
            .filter(|ap| ap.arrival_us.is_some())
            .copied()
            .collect();

        match self.delivery {
            Delivery::Virtual => {
                let now = self.now_us.load(Ordering::SeqCst);
                let mut pending = self.pending.lock().unwrap();
                for ap in answering {
                    pending.push(PendingAp {
                        ap,
                        start: start_address as u64,
                        due_us: now + ap.arrival_us.unwrap_or_default(),
                    });
                }
            }
            Delivery::Concurrent => self.run_concurrently(&answering, start_address as u64),
        }
    }

    fn save_mtrrs(&self) -> MtrrSettings {
        self.mtrrs
    }

    fn apply_mtrrs(&self, settings: &MtrrSettings) {
        let apic_id = self.apic_id();
        self.applied_mtrrs.lock().unwrap().push((apic_id, *settings));
    }

    fn load_microcode(&self) {
        self.microcode_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn trampoline(&self) -> TrampolineMap {
        self.trampoline
    }
}

impl Clock for SimMachine {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn relax(&self) {
        self.advance(self.tick_us);
    }
}

/// Write-back below 640K, uncached hole, one WB variable range.
pub fn sample_mtrrs() -> MtrrSettings {
    let mut settings = MtrrSettings::default();
    settings.fixed = [0x0606_0606_0606_0606; 11];
    settings.fixed[2] = 0; // A0000..BFFFF uncacheable
    settings.variable[0] = VariableMtrr {
        base: 0x0000_0000_0000_0006,
        mask: 0x000F_FFFF_8000_0800,
    };
    settings.variable_count = 1;
    settings.default_type = 0xC00;
    settings
}
