//! Semaphore registry
//!
//! Counting semaphores with the same slot discipline as the mutex registry:
//! slot 0 reserved, creator-only destroy, forced termination of waiters when
//! a semaphore disappears under them.
//!
//! `up` with waiters queued performs the head waiter's `down` on its behalf in
//! the same call. The unit goes straight to the woken process, so the count
//! is left unchanged. With nobody queued the count grows; an `up` that would
//! overflow it is refused.

use alloc::vec::Vec;

use crate::ring::ProcessRing;
use crate::types::{BlockedOn, ProcessId, ProcessState, SemaphoreKey, SyncError, SyncObject};
use crate::waitq::WaitQueue;

/// One semaphore slot
#[derive(Clone, Debug)]
pub struct Semaphore {
    /// Slot key
    pub key: SemaphoreKey,
    /// Free for `create`
    pub available: bool,
    /// Process that created the semaphore
    pub creator: Option<ProcessId>,
    /// Units available
    pub count: u32,
    /// Parked downers
    pub waitq: WaitQueue,
}

impl Semaphore {
    fn vacant(key: SemaphoreKey) -> Self {
        Self {
            key,
            available: true,
            creator: None,
            count: 0,
            waitq: WaitQueue::new(),
        }
    }
}

/// Result of a down attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownOutcome {
    /// A unit was taken
    Acquired,
    /// Count was zero; caller was parked
    Blocked,
}

/// What reaping a process did to the semaphore table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreCleanup {
    /// Semaphores destroyed because the reaped process created them
    pub destroyed: Vec<SemaphoreKey>,
    /// Waiters force-terminated by those destructions
    pub terminated: Vec<ProcessId>,
}

/// The semaphore registry
#[derive(Clone, Debug)]
pub struct SemaphoreTable {
    slots: Vec<Semaphore>,
}

impl SemaphoreTable {
    /// Create a table with `capacity` slots, slot 0 included.
    pub fn new(capacity: usize) -> Self {
        let mut slots: Vec<Semaphore> = (0..capacity)
            .map(|i| Semaphore::vacant(SemaphoreKey(i as u32)))
            .collect();
        if let Some(reserved) = slots.first_mut() {
            reserved.available = false;
        }
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live semaphore for `key`
    pub fn get(&self, key: SemaphoreKey) -> Option<&Semaphore> {
        self.index_of(key).ok().map(|i| &self.slots[i])
    }

    /// Keys of all live semaphores
    pub fn live_keys(&self) -> impl Iterator<Item = SemaphoreKey> + '_ {
        self.slots.iter().skip(1).filter(|s| !s.available).map(|s| s.key)
    }

    /// Allocate the first free slot with `initial_value` units.
    pub fn create(&mut self, initial_value: u32, creator: ProcessId) -> Result<SemaphoreKey, SyncError> {
        let slot = self
            .slots
            .iter_mut()
            .skip(1)
            .find(|s| s.available)
            .ok_or(SyncError::NoFreeSlot)?;

        slot.available = false;
        slot.creator = Some(creator);
        slot.count = initial_value;
        slot.waitq.clear();

        log::debug!(
            "semaphore {} created by pid {} with value {}",
            slot.key.0,
            creator.0,
            initial_value
        );
        Ok(slot.key)
    }

    /// Take a unit, or park `pid` when none is left.
    pub fn down(
        &mut self,
        key: SemaphoreKey,
        pid: ProcessId,
        procs: &mut ProcessRing,
    ) -> Result<DownOutcome, SyncError> {
        let idx = self.index_of(key)?;
        let sem = &mut self.slots[idx];

        if sem.count > 0 {
            sem.count -= 1;
            return Ok(DownOutcome::Acquired);
        }

        let queue_index = sem.waitq.push_back(pid);
        if let Some(p) = procs.get_mut(pid) {
            p.state = ProcessState::Waiting;
            p.blocked_on = Some(BlockedOn {
                object: SyncObject::Semaphore(key),
                queue_index,
            });
        }
        log::trace!("semaphore {}: pid {} parked at {}", key.0, pid.0, queue_index);
        Ok(DownOutcome::Blocked)
    }

    /// Return a unit. If anyone is queued, the head waiter takes it and
    /// becomes READY; its pid is returned.
    ///
    /// Fails with `CountOverflow`, leaving the count untouched, when nobody
    /// is queued and the count is already `u32::MAX`.
    pub fn up(
        &mut self,
        key: SemaphoreKey,
        procs: &mut ProcessRing,
    ) -> Result<Option<ProcessId>, SyncError> {
        let idx = self.index_of(key)?;
        let sem = &mut self.slots[idx];

        while let Some(next) = sem.waitq.pop_front() {
            let Some(p) = procs.get_mut(next) else {
                continue;
            };
            p.blocked_on = None;
            if p.state == ProcessState::Terminated {
                continue;
            }

            p.state = ProcessState::Ready;
            p.context.set_return(1);
            log::trace!("semaphore {}: unit handed to pid {}", key.0, next.0);
            return Ok(Some(next));
        }

        sem.count = sem.count.checked_add(1).ok_or(SyncError::CountOverflow)?;
        Ok(None)
    }

    /// Destroy a semaphore. Only its creator may do this.
    ///
    /// Every process still queued is terminated; their pids are returned.
    pub fn destroy(
        &mut self,
        key: SemaphoreKey,
        pid: ProcessId,
        procs: &mut ProcessRing,
    ) -> Result<Vec<ProcessId>, SyncError> {
        let idx = self.index_of(key)?;
        if self.slots[idx].creator != Some(pid) {
            return Err(SyncError::NotCreator);
        }

        Ok(self.force_destroy(idx, procs))
    }

    /// Destroy the semaphores a reaped process created and pull it out of any
    /// wait queue by its recorded position.
    pub fn cleanup(&mut self, pid: ProcessId, procs: &mut ProcessRing) -> SemaphoreCleanup {
        let mut report = SemaphoreCleanup::default();

        for idx in 1..self.slots.len() {
            let sem = &self.slots[idx];
            if !sem.available && sem.creator == Some(pid) {
                report.destroyed.push(sem.key);
                let terminated = self.force_destroy(idx, procs);
                report.terminated.extend(terminated.into_iter().filter(|&w| w != pid));
            }
        }

        let blocked_on = procs.get(pid).and_then(|p| p.blocked_on);
        if let Some(BlockedOn {
            object: SyncObject::Semaphore(key),
            queue_index,
        }) = blocked_on
        {
            if let Ok(idx) = self.index_of(key) {
                self.slots[idx].waitq.remove(queue_index);
            }
            if let Some(p) = procs.get_mut(pid) {
                p.blocked_on = None;
            }
        }

        report
    }

    fn index_of(&self, key: SemaphoreKey) -> Result<usize, SyncError> {
        let idx = key.0 as usize;
        if idx == 0 || idx >= self.slots.len() || self.slots[idx].available {
            return Err(SyncError::InvalidKey);
        }
        Ok(idx)
    }

    fn force_destroy(&mut self, idx: usize, procs: &mut ProcessRing) -> Vec<ProcessId> {
        let sem = &mut self.slots[idx];
        let mut terminated = Vec::new();

        for waiter in sem.waitq.drain() {
            if let Some(p) = procs.get_mut(waiter) {
                p.state = ProcessState::Terminated;
                p.blocked_on = None;
            }
            terminated.push(waiter);
        }

        log::debug!(
            "semaphore {} destroyed, {} waiter(s) terminated",
            sem.key.0,
            terminated.len()
        );
        sem.available = true;
        sem.creator = None;
        sem.count = 0;
        terminated
    }
}
