//! Exchange area shared with the mode-transition stub.
//!
//! Lives inside the wakeup buffer directly after the stub image (rounded up
//! to the structure's alignment), so real-mode code can reach it with
//! segment-relative addressing. The stub reads stack, mode-switch and
//! page-table fields from here, claims an index by incrementing
//! `num_aps_executing`, and calls `c_function` in long mode.

use core::mem::{align_of, size_of};
use core::sync::atomic::AtomicU32;

use x86_64::structures::DescriptorTablePointer;

use super::state::MpState;

/// Long-mode handshake entry: exchange pointer and the claimed index.
pub type ApEntryFn = unsafe extern "C" fn(exchange: *const ExchangeInfo, index: usize);

#[repr(C)]
pub struct ExchangeInfo {
    pub lock: u64,
    /// Physical base of the AP stack region; AP `n` uses slot `n - 1`.
    pub stack_start: u64,
    pub stack_size: u64,
    /// Physical address of the wakeup buffer (start of the stub image).
    pub buffer_start: u64,
    pub pmode_offset: u64,
    pub lmode_offset: u64,
    pub cr3: u64,
    pub gdtr_profile: DescriptorTablePointer,
    pub idtr_profile: DescriptorTablePointer,
    pub c_function: ApEntryFn,
    /// Erased `&P` for the `Platform` the handshake was instantiated with.
    pub platform: *const (),
    /// Processors that have entered the stub this pass. Each AP's index is
    /// the value after its own increment, so APs occupy 1..=count.
    pub num_aps_executing: AtomicU32,
    pub mp_state: *mut MpState,
}

impl ExchangeInfo {
    /// Offset of the exchange area inside a wakeup buffer whose stub image is
    /// `image_size` bytes.
    pub const fn offset_in_buffer(image_size: usize) -> usize {
        let align = align_of::<ExchangeInfo>();
        (image_size + align - 1) & !(align - 1)
    }

    /// Bytes the wakeup buffer needs for the image plus this structure.
    pub const fn wakeup_buffer_size(image_size: usize) -> usize {
        Self::offset_in_buffer(image_size) + size_of::<ExchangeInfo>()
    }

    /// Stack top (physical) the stub loads for AP `index`.
    pub fn stack_top(&self, index: usize) -> u64 {
        self.stack_start + index as u64 * self.stack_size
    }
}
