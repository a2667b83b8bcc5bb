//! FIFO wait queue
//!
//! Each entry carries a `queue_index` that stays valid until the entry leaves
//! the queue. The index is recorded in the parked process's [`BlockedOn`] so
//! reaping can pull the process out directly, without going through unlock.
//!
//! [`BlockedOn`]: crate::types::BlockedOn

use alloc::collections::VecDeque;

use crate::types::ProcessId;

/// First-in-first-out queue of parked processes.
#[derive(Clone, Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<(u64, ProcessId)>,
    next_index: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_index: 0,
        }
    }

    /// Append a process, returning its queue index.
    pub fn push_back(&mut self, pid: ProcessId) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.entries.push_back((index, pid));
        index
    }

    /// Remove the head.
    pub fn pop_front(&mut self) -> Option<ProcessId> {
        self.entries.pop_front().map(|(_, pid)| pid)
    }

    /// Remove the entry with the given queue index, keeping the others in order.
    pub fn remove(&mut self, index: u64) -> Option<ProcessId> {
        let pos = self.entries.iter().position(|&(i, _)| i == index)?;
        self.entries.remove(pos).map(|(_, pid)| pid)
    }

    /// Empty the queue, yielding waiters in FIFO order.
    pub fn drain(&mut self) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.drain(..).map(|(_, pid)| pid)
    }

    /// Forget all entries; indices keep increasing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Waiters in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.iter().map(|&(_, pid)| pid)
    }

    /// Waiters with their queue indices.
    pub fn entries(&self) -> impl Iterator<Item = (u64, ProcessId)> + '_ {
        self.entries.iter().copied()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.entries.iter().any(|&(_, p)| p == pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
