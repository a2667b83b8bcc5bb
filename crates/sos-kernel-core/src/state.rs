//! Kernel state - the explicit context every operation runs against
//!
//! `KernelState` owns the process ring, the idle process, the mutex and
//! semaphore registries and the "current process" designation. Nothing in
//! this crate is global; the runtime owns exactly one `KernelState` per
//! kernel instance.

use alloc::vec::Vec;

use crate::mutex::{Mutex, MutexTable};
use crate::ring::ProcessRing;
use crate::semaphore::{Semaphore, SemaphoreTable};
use crate::types::{
    AddressSpace, CpuContext, MutexKey, Process, ProcessId, ProcessState, SemaphoreKey, IDLE_PID,
};

/// Default registry size (8-bit keys, slot 0 reserved)
pub const DEFAULT_SYNC_SLOTS: usize = 256;

/// Default timer tick length in milliseconds
pub const DEFAULT_TICK_MS: u32 = 10;

/// The pure kernel state - no HAL, no I/O.
#[derive(Debug)]
pub struct KernelState {
    /// Every unreaped user process
    pub ring: ProcessRing,
    /// Idle/console process; outside the ring, never reaped
    pub idle: Process,
    /// Exclusive locks
    pub mutexes: MutexTable,
    /// Counting semaphores
    pub semaphores: SemaphoreTable,
    /// The process that owns (or last owned) the CPU
    pub current: ProcessId,
    /// Milliseconds per epoch, for sleep conversion
    pub tick_ms: u32,
    /// Next process ID to allocate
    pub next_pid: u64,
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_SLOTS, DEFAULT_SYNC_SLOTS, DEFAULT_TICK_MS)
    }
}

impl KernelState {
    /// Create an empty kernel state with the given registry sizes.
    pub fn new(mutex_slots: usize, semaphore_slots: usize, tick_ms: u32) -> Self {
        let mut idle = Process::new(IDLE_PID, CpuContext::default(), None, 0);
        idle.state = ProcessState::Running;

        Self {
            ring: ProcessRing::new(),
            idle,
            mutexes: MutexTable::new(mutex_slots),
            semaphores: SemaphoreTable::new(semaphore_slots),
            current: IDLE_PID,
            tick_ms: tick_ms.max(1),
            next_pid: 1,
        }
    }

    /// Generate next process ID
    pub fn alloc_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Create a READY process and link it into the ring.
    pub fn add_process(
        &mut self,
        context: CpuContext,
        address_space: Option<AddressSpace>,
        epoch: u64,
    ) -> ProcessId {
        let pid = self.alloc_pid();
        self.ring.insert(Process::new(pid, context, address_space, epoch));
        pid
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Any process record, the idle process included
    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        if pid == IDLE_PID {
            Some(&self.idle)
        } else {
            self.ring.get(pid)
        }
    }

    /// Mutable access to any process record
    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        if pid == IDLE_PID {
            Some(&mut self.idle)
        } else {
            self.ring.get_mut(pid)
        }
    }

    /// The process currently designated as owning the CPU
    pub fn current(&self) -> ProcessId {
        self.current
    }

    /// The RUNNING process, if any
    pub fn running(&self) -> Option<ProcessId> {
        self.process(self.current)
            .filter(|p| p.state == ProcessState::Running)
            .map(|p| p.pid)
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Ring members in rotation order, starting at the anchor
    pub fn processes_in_ring_order(&self) -> Vec<ProcessId> {
        self.ring.ids_from_anchor()
    }

    pub fn mutex(&self, key: MutexKey) -> Option<&Mutex> {
        self.mutexes.get(key)
    }

    pub fn semaphore(&self, key: SemaphoreKey) -> Option<&Semaphore> {
        self.semaphores.get(key)
    }

    // ========================================================================
    // State mutation helpers
    // ========================================================================

    /// Mark a user process TERMINATED. It stays in the ring until reaped.
    ///
    /// Returns false for the idle process and unknown pids.
    pub fn terminate(&mut self, pid: ProcessId) -> bool {
        if pid == IDLE_PID {
            return false;
        }
        match self.ring.get_mut(pid) {
            Some(p) => {
                p.state = ProcessState::Terminated;
                p.sleep_end = None;
                true
            }
            None => false,
        }
    }

    /// Put a process to sleep until `epoch >= until`.
    pub fn sleep_until(&mut self, pid: ProcessId, until: u64) -> bool {
        match self.ring.get_mut(pid) {
            Some(p) if p.state != ProcessState::Terminated => {
                p.state = ProcessState::Waiting;
                p.sleep_end = Some(until);
                true
            }
            _ => false,
        }
    }

    /// Return a still-RUNNING current process to READY.
    pub fn preempt_current(&mut self) {
        let current = self.current;
        if let Some(p) = self.process_mut(current) {
            if p.state == ProcessState::Running {
                p.state = ProcessState::Ready;
            }
        }
    }

    /// Convert a sleep length in milliseconds to epochs, rounding up.
    pub fn ms_to_epochs(&self, ms: u32) -> u64 {
        (ms as u64).div_ceil(self.tick_ms as u64)
    }
}
