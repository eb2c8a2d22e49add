//! Busy-wait timing.
//!
//! A deadline on an injected clock is the only way the BSP ever waits for
//! APs. Tests drive a manual clock; firmware uses the TSC.

/// Monotonic microsecond time source.
pub trait Clock {
    fn now_us(&self) -> u64;

    /// Called once per polling iteration.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_at_us: u64,
}

impl Deadline {
    pub fn after<C: Clock + ?Sized>(clock: &C, micros: u64) -> Self {
        Self {
            expires_at_us: clock.now_us().saturating_add(micros),
        }
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now_us() >= self.expires_at_us
    }

    pub fn expires_at_us(&self) -> u64 {
        self.expires_at_us
    }
}

/// Spin for `micros` microseconds.
pub fn busy_wait<C: Clock + ?Sized>(clock: &C, micros: u64) {
    let deadline = Deadline::after(clock, micros);
    while !deadline.expired(clock) {
        clock.relax();
    }
}

/// Spin until `done` holds or `micros` elapse; returns whether `done` held.
pub fn poll_until<C, F>(clock: &C, micros: u64, mut done: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let deadline = Deadline::after(clock, micros);
    loop {
        if done() {
            return true;
        }
        if deadline.expired(clock) {
            return done();
        }
        clock.relax();
    }
}

/// TSC-backed clock, calibrated by `logger::init`.
#[cfg(target_arch = "x86_64")]
#[derive(Clone, Copy, Debug)]
pub struct TscClock {
    frequency_hz: u64,
}

#[cfg(target_arch = "x86_64")]
impl TscClock {
    pub fn new() -> Self {
        Self {
            frequency_hz: crate::logger::tsc_frequency_hz().max(1),
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for TscClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
impl Clock for TscClock {
    fn now_us(&self) -> u64 {
        let ticks = crate::logger::read_tsc() as u128;
        (ticks * 1_000_000 / self.frequency_hz as u128) as u64
    }
}
