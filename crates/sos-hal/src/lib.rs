//! Hardware Abstraction Layer trait for the SOS kernel
//!
//! This crate defines the HAL trait that lets the scheduler run on real
//! hardware (a 32-bit protected-mode trampoline) or against a host mock by
//! abstracting everything the kernel does not own:
//!
//! - **Trampoline**: restore a saved register file, drop to ring 3, and come
//!   back with the reason for re-entry
//! - **Address spaces**: allocate, fill and release a process's storage
//! - **Wall clock**: the monotonically increasing timer epoch
//! - **Interrupt flag**: read, clear and set IF
//! - **Debug console**: kernel messages

#![no_std]

use core::fmt;

use sos_kernel_core::{AddressSpace, CpuContext, ProcessId};

/// Hardware Abstraction Layer trait
///
/// Every method takes `&self`; implementations use interior mutability for
/// their bookkeeping so the kernel can hold the HAL while it mutates its own
/// state.
pub trait HAL: Send + Sync + 'static {
    // === Context Switching ===

    /// Resume a user process until it traps back into the kernel.
    ///
    /// The trampoline loads `context` (segment selectors and EFLAGS
    /// included) inside `space`, and on re-entry writes the saved registers
    /// back into `context` before returning the cause.
    fn resume_user(&self, pid: ProcessId, context: &mut CpuContext, space: &AddressSpace) -> Trap;

    /// Resume the idle/console process in kernel mode until the next trap.
    fn resume_idle(&self, context: &mut CpuContext) -> Trap;

    // === Address Spaces ===

    /// Allocate `size` bytes of process storage.
    ///
    /// # Returns
    /// * `Ok(AddressSpace)` - Handle, base and size of the new region
    /// * `Err(HalError::OutOfMemory)` - No region of that size is free
    fn alloc_address_space(&self, pid: ProcessId, size: u32) -> Result<AddressSpace, HalError>;

    /// Copy a program image to the start of `space`.
    ///
    /// # Returns
    /// * `Ok(())` - Image copied
    /// * `Err(HalError::InvalidAddressSpace)` - Unknown handle or image too large
    fn load_image(&self, space: &AddressSpace, image: &[u8]) -> Result<(), HalError>;

    /// Release storage obtained from `alloc_address_space`.
    fn free_address_space(&self, space: &AddressSpace);

    // === Time ===

    /// Current timer epoch; advances once per timer tick
    fn epoch(&self) -> u64;

    // === Interrupts ===

    /// Whether maskable interrupts are currently enabled
    fn interrupts_enabled(&self) -> bool;

    /// Clear the interrupt flag
    fn disable_interrupts(&self);

    /// Set the interrupt flag
    fn enable_interrupts(&self);

    // === Debug ===

    /// Write a message to the debug console
    fn debug_write(&self, msg: &str);
}

/// Why control came back to the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    /// Timer interrupt; the time slice is over
    Timer,
    /// Software interrupt with the syscall number and register arguments
    Syscall { num: u32, args: [u32; 4] },
    /// The process returned from its entry point
    Exit { code: i32 },
    /// CPU exception raised in user mode
    Fault { vector: u8 },
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Not enough memory available
    OutOfMemory,
    /// Handle does not name a live region, or the data does not fit
    InvalidAddressSpace,
    /// Operation not supported on this platform
    NotSupported,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::OutOfMemory => write!(f, "out of memory"),
            HalError::InvalidAddressSpace => write!(f, "invalid address space"),
            HalError::NotSupported => write!(f, "not supported"),
        }
    }
}
