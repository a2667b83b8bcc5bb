//! Program loader
//!
//! Turns a flat program image into a READY process: one contiguous region
//! holding the image followed by the stack reserve.
//!
//! ```text
//! 0                image.len()              size - kernel_stack   size
//! ├─ image ──────────┼─ user stack (grows down) ◀─ esp ─┼─ kernel stack ─┤
//! ```

use core::fmt;

use sos_hal::{HalError, HAL};
use sos_kernel_core::{CpuContext, KernelState, Process, ProcessId};

use crate::config::KernelConfig;

/// Why a program could not be loaded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// The process table is full
    TooManyProcesses,
    /// Nothing to load
    EmptyImage,
    /// Image plus stack reserve does not fit a 32-bit segment
    ImageTooLarge,
    /// The HAL could not provide or fill the address space
    AddressSpace(HalError),
}

impl From<HalError> for LoadError {
    fn from(e: HalError) -> Self {
        LoadError::AddressSpace(e)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::TooManyProcesses => write!(f, "too many processes"),
            LoadError::EmptyImage => write!(f, "empty program image"),
            LoadError::ImageTooLarge => write!(f, "program image too large"),
            LoadError::AddressSpace(e) => write!(f, "address space: {}", e),
        }
    }
}

/// Allocate, fill and link a new process.
///
/// On failure nothing stays allocated and the ring is unchanged.
pub(crate) fn load<H: HAL>(
    hal: &H,
    state: &mut KernelState,
    config: &KernelConfig,
    entry: u32,
    image: &[u8],
    epoch: u64,
) -> Result<ProcessId, LoadError> {
    if image.is_empty() {
        return Err(LoadError::EmptyImage);
    }
    if state.ring_len() >= config.max_processes {
        return Err(LoadError::TooManyProcesses);
    }

    let size = u32::try_from(image.len())
        .ok()
        .and_then(|n| n.checked_add(config.stack_reserve))
        .ok_or(LoadError::ImageTooLarge)?;

    let pid = state.alloc_pid();
    let space = hal.alloc_address_space(pid, size)?;
    if let Err(e) = hal.load_image(&space, image) {
        hal.free_address_space(&space);
        return Err(e.into());
    }

    let stack_top = size - config.kernel_stack_size - 4;
    let context = CpuContext::new_user(entry, stack_top);
    state.ring.insert(Process::new(pid, context, Some(space), epoch));

    Ok(pid)
}
