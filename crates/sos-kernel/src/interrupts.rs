//! Interrupt-disabled critical sections
//!
//! Every ring, queue and registry mutation runs while an [`InterruptGuard`]
//! is alive. Guards nest: only the outermost one re-enables interrupts, and
//! only if they were enabled when it was taken.

use sos_hal::HAL;

/// Clears the interrupt flag for its lifetime and restores it on drop
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct InterruptGuard<'a, H: HAL> {
    hal: &'a H,
    were_enabled: bool,
}

impl<'a, H: HAL> InterruptGuard<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        let were_enabled = hal.interrupts_enabled();
        hal.disable_interrupts();
        Self { hal, were_enabled }
    }

    /// Whether interrupts were enabled when the guard was taken
    pub fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl<H: HAL> Drop for InterruptGuard<'_, H> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.hal.enable_interrupts();
        }
    }
}
