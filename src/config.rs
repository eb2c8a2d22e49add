//! MP bring-up configuration.
//!
//! Defaults mirror the platform build settings; a boot command line may
//! override them with `mp.max_cpus=`, `mp.stack_size=` and `mp.timeout_us=`.

use crate::error::MpError;

pub const DEFAULT_MAX_PROCESSORS: u32 = 64;
pub const DEFAULT_AP_STACK_SIZE: usize = 0x8000;
pub const DEFAULT_AP_INIT_TIMEOUT_US: u32 = 50_000;

/// Smallest stack an AP may run the handshake on.
pub const MIN_AP_STACK_SIZE: usize = 4096;
/// Largest per-AP stack accepted.
pub const MAX_AP_STACK_SIZE: usize = 0x10_0000;
/// Largest roster accepted; the x2APIC ID space is far wider but nothing
/// this allocator serves has more.
pub const MAX_PROCESSORS_LIMIT: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpConfig {
    /// Upper bound on the roster, boot processor included.
    ///
    /// Also sizes the AP stack region: responder `n` runs on stack slot
    /// `n - 1`, so at most `max_processors` responders have a stack of their
    /// own. A platform with more processors than this value must not be
    /// brought up with it; the extra responders push their BIST word and
    /// stack frames past the stack region into the shared bring-up state.
    pub max_processors: u32,
    /// Bytes of stack handed to each AP.
    pub ap_stack_size: usize,
    /// How long the first-pass census waits for APs to answer.
    pub ap_init_timeout_us: u32,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            max_processors: DEFAULT_MAX_PROCESSORS,
            ap_stack_size: DEFAULT_AP_STACK_SIZE,
            ap_init_timeout_us: DEFAULT_AP_INIT_TIMEOUT_US,
        }
    }
}

impl MpConfig {
    /// Apply `mp.*` directives from a boot command line on top of `self`.
    ///
    /// Unknown keys and unparsable values are ignored.
    pub fn parse_cmdline(mut self, cmdline: &str) -> Self {
        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "mp.max_cpus" => {
                    if let Some(v) = parse_number(value).and_then(|v| u32::try_from(v).ok()) {
                        self.max_processors = v;
                    }
                }
                "mp.stack_size" => {
                    if let Some(v) = parse_number(value).and_then(|v| usize::try_from(v).ok()) {
                        self.ap_stack_size = v;
                    }
                }
                "mp.timeout_us" => {
                    if let Some(v) = parse_number(value).and_then(|v| u32::try_from(v).ok()) {
                        self.ap_init_timeout_us = v;
                    }
                }
                _ => {}
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), MpError> {
        if self.max_processors == 0 {
            return Err(MpError::InvalidConfig("max processor count must be at least 1"));
        }
        if self.max_processors > MAX_PROCESSORS_LIMIT {
            return Err(MpError::InvalidConfig("max processor count above 4096"));
        }
        if self.ap_stack_size < MIN_AP_STACK_SIZE {
            return Err(MpError::InvalidConfig("AP stack size below 4KiB"));
        }
        if self.ap_stack_size > MAX_AP_STACK_SIZE {
            return Err(MpError::InvalidConfig("AP stack size above 1MiB"));
        }
        if self.ap_stack_size % 16 != 0 {
            return Err(MpError::InvalidConfig("AP stack size not 16-byte aligned"));
        }
        Ok(())
    }
}

fn parse_number(value: &str) -> Option<u64> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}
