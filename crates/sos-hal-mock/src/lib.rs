//! Mock HAL implementation for testing the SOS kernel
//!
//! This provides a mock implementation of the HAL trait that can be used
//! for testing the scheduler without a trampoline or real memory.
//!
//! Each process gets a script of traps. When the kernel resumes a process the
//! mock pops the next trap from its script (or reports a timer interrupt once
//! the script runs dry) and records what the kernel handed it.

#![no_std]
extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use sos_hal::{HalError, Trap, HAL};
use sos_kernel_core::{AddressSpace, CpuContext, ProcessId, IDLE_PID};

/// Base address of the first simulated region
const REGION_BASE: u32 = 0x0040_0000;

/// One resume of a process, as seen by the trampoline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRecord {
    /// Process resumed (`IDLE_PID` for the idle process)
    pub pid: ProcessId,
    /// Registers the kernel restored
    pub context: CpuContext,
    /// Interrupt flag at the moment of the switch
    pub interrupts_enabled: bool,
}

/// Simulated address space
struct MockRegion {
    pid: ProcessId,
    data: Vec<u8>,
}

/// Mock HAL for unit testing
///
/// Provides scripted traps, a settable epoch, an allocation ledger and a
/// simulated interrupt flag.
pub struct MockHal {
    /// Simulated timer epoch
    epoch: AtomicU64,
    /// Whether a `Timer` trap advances the epoch by one
    auto_tick: AtomicBool,
    /// Simulated interrupt flag
    interrupts: AtomicBool,
    /// Number of times the flag was cleared
    disable_count: AtomicU64,
    /// Captured debug messages
    debug_log: RefCell<Vec<String>>,
    /// Pending traps per process
    scripts: RefCell<BTreeMap<ProcessId, VecDeque<Trap>>>,
    /// Every resume, in order
    dispatches: RefCell<Vec<ResumeRecord>>,
    /// Live regions by handle
    regions: RefCell<BTreeMap<u64, MockRegion>>,
    /// Handles released so far, in order
    freed: RefCell<Vec<u64>>,
    /// Next region handle
    next_handle: AtomicU64,
    /// Total bytes that may be live at once
    memory_limit: AtomicU64,
    /// Make the next `load_image` fail
    fail_next_load: AtomicBool,
}

impl MockHal {
    /// Create a new mock HAL at epoch 0 with interrupts enabled
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            auto_tick: AtomicBool::new(true),
            interrupts: AtomicBool::new(true),
            disable_count: AtomicU64::new(0),
            debug_log: RefCell::new(Vec::new()),
            scripts: RefCell::new(BTreeMap::new()),
            dispatches: RefCell::new(Vec::new()),
            regions: RefCell::new(BTreeMap::new()),
            freed: RefCell::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            memory_limit: AtomicU64::new(u64::MAX),
            fail_next_load: AtomicBool::new(false),
        }
    }

    // === Time ===

    /// Advance the simulated epoch
    pub fn advance_epoch(&self, ticks: u64) {
        self.epoch.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Set the simulated epoch to a specific value
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    /// Choose whether timer traps advance the epoch (on by default)
    pub fn set_auto_tick(&self, enabled: bool) {
        self.auto_tick.store(enabled, Ordering::SeqCst);
    }

    // === Trap scripts ===

    /// Queue a trap for the next resume of `pid`
    pub fn push_trap(&self, pid: ProcessId, trap: Trap) {
        self.scripts
            .borrow_mut()
            .entry(pid)
            .or_default()
            .push_back(trap);
    }

    /// Queue a syscall trap for the next resume of `pid`
    pub fn push_syscall(&self, pid: ProcessId, num: u32, arg: u32) {
        self.push_trap(
            pid,
            Trap::Syscall {
                num,
                args: [arg, 0, 0, 0],
            },
        );
    }

    /// Traps still queued for `pid`
    pub fn pending_traps(&self, pid: ProcessId) -> usize {
        self.scripts.borrow().get(&pid).map(|q| q.len()).unwrap_or(0)
    }

    // === Dispatch history ===

    /// Every resume so far
    pub fn get_dispatches(&self) -> Vec<ResumeRecord> {
        self.dispatches.borrow().clone()
    }

    /// Pids in resume order
    pub fn dispatch_order(&self) -> Vec<ProcessId> {
        self.dispatches.borrow().iter().map(|d| d.pid).collect()
    }

    /// The most recent resume
    pub fn last_dispatch(&self) -> Option<ResumeRecord> {
        self.dispatches.borrow().last().copied()
    }

    /// Clear the dispatch history
    pub fn clear_dispatches(&self) {
        self.dispatches.borrow_mut().clear();
    }

    // === Interrupts ===

    /// Number of times the kernel cleared the interrupt flag
    pub fn disable_count(&self) -> u64 {
        self.disable_count.load(Ordering::SeqCst)
    }

    // === Memory ===

    /// Limit the total bytes that may be allocated at once
    pub fn set_memory_limit(&self, bytes: u64) {
        self.memory_limit.store(bytes, Ordering::SeqCst);
    }

    /// Make the next image copy fail
    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// Number of live regions
    pub fn live_regions(&self) -> usize {
        self.regions.borrow().len()
    }

    /// Whether `pid` still owns a region
    pub fn has_region_for(&self, pid: ProcessId) -> bool {
        self.regions.borrow().values().any(|r| r.pid == pid)
    }

    /// Handles released so far, in order
    pub fn freed_handles(&self) -> Vec<u64> {
        self.freed.borrow().clone()
    }

    /// Contents of a live region
    pub fn region_contents(&self, handle: u64) -> Option<Vec<u8>> {
        self.regions.borrow().get(&handle).map(|r| r.data.clone())
    }

    // === Debug log ===

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.borrow().clone()
    }

    /// Clear the debug log
    pub fn clear_debug_log(&self) {
        self.debug_log.borrow_mut().clear();
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log
            .borrow()
            .iter()
            .any(|msg| msg.contains(substr))
    }

    /// Count messages containing `substr`
    pub fn count_log_containing(&self, substr: &str) -> usize {
        self.debug_log
            .borrow()
            .iter()
            .filter(|msg| msg.contains(substr))
            .count()
    }

    fn resume(&self, pid: ProcessId, context: &CpuContext) -> Trap {
        self.dispatches.borrow_mut().push(ResumeRecord {
            pid,
            context: *context,
            interrupts_enabled: self.interrupts.load(Ordering::SeqCst),
        });

        let trap = self
            .scripts
            .borrow_mut()
            .get_mut(&pid)
            .and_then(|q| q.pop_front())
            .unwrap_or(Trap::Timer);

        if trap == Trap::Timer && self.auto_tick.load(Ordering::SeqCst) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        trap
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

// MockHal is Send + Sync because it uses atomic operations and RefCell
// is only accessed in single-threaded test contexts
unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl HAL for MockHal {
    fn resume_user(&self, pid: ProcessId, context: &mut CpuContext, space: &AddressSpace) -> Trap {
        if !self.regions.borrow().contains_key(&space.handle) {
            self.debug_log.borrow_mut().push(alloc::format!(
                "[mock-hal] pid {} resumed in freed region {}",
                pid.0,
                space.handle
            ));
        }
        self.resume(pid, context)
    }

    fn resume_idle(&self, context: &mut CpuContext) -> Trap {
        self.resume(IDLE_PID, context)
    }

    fn alloc_address_space(&self, pid: ProcessId, size: u32) -> Result<AddressSpace, HalError> {
        let mut regions = self.regions.borrow_mut();
        let live: u64 = regions.values().map(|r| r.data.len() as u64).sum();
        if live + size as u64 > self.memory_limit.load(Ordering::SeqCst) {
            return Err(HalError::OutOfMemory);
        }

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        regions.insert(
            handle,
            MockRegion {
                pid,
                data: alloc::vec![0; size as usize],
            },
        );
        self.debug_log.borrow_mut().push(alloc::format!(
            "[mock-hal] Allocated region {} ({} bytes) for pid {}",
            handle,
            size,
            pid.0
        ));

        Ok(AddressSpace {
            handle,
            base: REGION_BASE.wrapping_add((handle as u32).wrapping_mul(0x0010_0000)),
            size,
        })
    }

    fn load_image(&self, space: &AddressSpace, image: &[u8]) -> Result<(), HalError> {
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(HalError::InvalidAddressSpace);
        }

        let mut regions = self.regions.borrow_mut();
        let region = regions
            .get_mut(&space.handle)
            .ok_or(HalError::InvalidAddressSpace)?;
        if image.len() > region.data.len() {
            return Err(HalError::InvalidAddressSpace);
        }
        region.data[..image.len()].copy_from_slice(image);
        Ok(())
    }

    fn free_address_space(&self, space: &AddressSpace) {
        if self.regions.borrow_mut().remove(&space.handle).is_some() {
            self.freed.borrow_mut().push(space.handle);
            self.debug_log
                .borrow_mut()
                .push(alloc::format!("[mock-hal] Freed region {}", space.handle));
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.disable_count.fetch_add(1, Ordering::SeqCst);
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }
}
