//! Mutex registry
//!
//! A fixed table of exclusive locks. Slot 0 is reserved. Each live mutex has a
//! creator, at most one owner and a FIFO queue of parked processes.
//!
//! Unlock hands the lock straight to the head waiter inside the same call:
//! ownership never becomes observable as free while someone is queued.
//!
//! Locks are not reentrant. An owner locking its own mutex again is parked
//! behind itself and stays there until the mutex is destroyed.

use alloc::vec::Vec;

use crate::ring::ProcessRing;
use crate::types::{BlockedOn, MutexKey, ProcessId, ProcessState, SyncError, SyncObject};
use crate::waitq::WaitQueue;

/// One mutex slot
#[derive(Clone, Debug)]
pub struct Mutex {
    /// Slot key
    pub key: MutexKey,
    /// Free for `create`
    pub available: bool,
    /// Process that created the mutex
    pub creator: Option<ProcessId>,
    /// Current holder
    pub owner: Option<ProcessId>,
    /// Parked lockers
    pub waitq: WaitQueue,
}

impl Mutex {
    fn vacant(key: MutexKey) -> Self {
        Self {
            key,
            available: true,
            creator: None,
            owner: None,
            waitq: WaitQueue::new(),
        }
    }
}

/// Result of a lock attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Caller now owns the mutex
    Acquired,
    /// Caller was parked in the wait queue
    Blocked,
}

/// What reaping a process did to the mutex table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutexCleanup {
    /// Mutexes destroyed because the reaped process created them
    pub destroyed: Vec<MutexKey>,
    /// Waiters force-terminated by those destructions
    pub terminated: Vec<ProcessId>,
    /// Mutexes the reaped process still held, and who received them
    pub handed_off: Vec<(MutexKey, ProcessId)>,
}

/// The mutex registry
#[derive(Clone, Debug)]
pub struct MutexTable {
    slots: Vec<Mutex>,
}

impl MutexTable {
    /// Create a table with `capacity` slots, slot 0 included.
    pub fn new(capacity: usize) -> Self {
        let mut slots: Vec<Mutex> = (0..capacity).map(|i| Mutex::vacant(MutexKey(i as u32))).collect();
        if let Some(reserved) = slots.first_mut() {
            reserved.available = false;
        }
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live mutex for `key`
    pub fn get(&self, key: MutexKey) -> Option<&Mutex> {
        self.index_of(key).ok().map(|i| &self.slots[i])
    }

    /// Keys of all live mutexes
    pub fn live_keys(&self) -> impl Iterator<Item = MutexKey> + '_ {
        self.slots.iter().skip(1).filter(|m| !m.available).map(|m| m.key)
    }

    /// Allocate the first free slot for `creator`.
    pub fn create(&mut self, creator: ProcessId) -> Result<MutexKey, SyncError> {
        let slot = self
            .slots
            .iter_mut()
            .skip(1)
            .find(|m| m.available)
            .ok_or(SyncError::NoFreeSlot)?;

        slot.available = false;
        slot.creator = Some(creator);
        slot.owner = None;
        slot.waitq.clear();

        log::debug!("mutex {} created by pid {}", slot.key.0, creator.0);
        Ok(slot.key)
    }

    /// Take the lock, or park `pid` at the tail of the wait queue.
    pub fn lock(
        &mut self,
        key: MutexKey,
        pid: ProcessId,
        procs: &mut ProcessRing,
    ) -> Result<LockOutcome, SyncError> {
        let idx = self.index_of(key)?;
        let mutex = &mut self.slots[idx];

        if mutex.owner.is_none() {
            mutex.owner = Some(pid);
            log::trace!("mutex {}: acquired by pid {}", key.0, pid.0);
            return Ok(LockOutcome::Acquired);
        }

        let queue_index = mutex.waitq.push_back(pid);
        if let Some(p) = procs.get_mut(pid) {
            p.state = ProcessState::Waiting;
            p.blocked_on = Some(BlockedOn {
                object: SyncObject::Mutex(key),
                queue_index,
            });
        }
        log::trace!("mutex {}: pid {} parked at {}", key.0, pid.0, queue_index);
        Ok(LockOutcome::Blocked)
    }

    /// Release the lock held by `pid`.
    ///
    /// If anyone is queued, the head waiter becomes the owner and READY in
    /// the same call; its pid is returned.
    pub fn unlock(
        &mut self,
        key: MutexKey,
        pid: ProcessId,
        procs: &mut ProcessRing,
    ) -> Result<Option<ProcessId>, SyncError> {
        let idx = self.index_of(key)?;
        if self.slots[idx].owner != Some(pid) {
            return Err(SyncError::NotOwner);
        }

        Ok(self.release(idx, procs))
    }

    /// Destroy a mutex. Only its creator may do this.
    ///
    /// Every process still queued is terminated; their pids are returned.
    pub fn destroy(
        &mut self,
        key: MutexKey,
        pid: ProcessId,
        procs: &mut ProcessRing,
    ) -> Result<Vec<ProcessId>, SyncError> {
        let idx = self.index_of(key)?;
        if self.slots[idx].creator != Some(pid) {
            return Err(SyncError::NotCreator);
        }

        Ok(self.force_destroy(idx, procs))
    }

    /// Release everything a process being reaped still ties up.
    ///
    /// Destroys the mutexes it created, pulls it out of any wait queue by its
    /// recorded position, and hands off locks it still owns.
    pub fn cleanup(&mut self, pid: ProcessId, procs: &mut ProcessRing) -> MutexCleanup {
        let mut report = MutexCleanup::default();

        for idx in 1..self.slots.len() {
            let mutex = &self.slots[idx];
            if !mutex.available && mutex.creator == Some(pid) {
                report.destroyed.push(mutex.key);
                let terminated = self.force_destroy(idx, procs);
                report.terminated.extend(terminated.into_iter().filter(|&w| w != pid));
            }
        }

        let blocked_on = procs.get(pid).and_then(|p| p.blocked_on);
        if let Some(BlockedOn {
            object: SyncObject::Mutex(key),
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

        for idx in 1..self.slots.len() {
            if !self.slots[idx].available && self.slots[idx].owner == Some(pid) {
                let key = self.slots[idx].key;
                if let Some(next) = self.release(idx, procs) {
                    report.handed_off.push((key, next));
                }
            }
        }

        report
    }

    fn index_of(&self, key: MutexKey) -> Result<usize, SyncError> {
        let idx = key.0 as usize;
        if idx == 0 || idx >= self.slots.len() || self.slots[idx].available {
            return Err(SyncError::InvalidKey);
        }
        Ok(idx)
    }

    /// Clear the owner and hand the lock to the first live waiter.
    fn release(&mut self, idx: usize, procs: &mut ProcessRing) -> Option<ProcessId> {
        let mutex = &mut self.slots[idx];
        mutex.owner = None;

        while let Some(next) = mutex.waitq.pop_front() {
            let Some(p) = procs.get_mut(next) else {
                continue;
            };
            p.blocked_on = None;
            if p.state == ProcessState::Terminated {
                continue;
            }

            p.state = ProcessState::Ready;
            p.context.set_return(1);
            mutex.owner = Some(next);
            log::trace!("mutex {}: handed to pid {}", mutex.key.0, next.0);
            return Some(next);
        }

        log::trace!("mutex {}: released", mutex.key.0);
        None
    }

    fn force_destroy(&mut self, idx: usize, procs: &mut ProcessRing) -> Vec<ProcessId> {
        let mutex = &mut self.slots[idx];
        let mut terminated = Vec::new();

        for waiter in mutex.waitq.drain() {
            if let Some(p) = procs.get_mut(waiter) {
                p.state = ProcessState::Terminated;
                p.blocked_on = None;
            }
            terminated.push(waiter);
        }

        log::debug!(
            "mutex {} destroyed, {} waiter(s) terminated",
            mutex.key.0,
            terminated.len()
        );
        mutex.available = true;
        mutex.creator = None;
        mutex.owner = None;
        terminated
    }
}
