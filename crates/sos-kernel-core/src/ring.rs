//! Ready/wait ring
//!
//! Every user process that has not been reaped is a member of one circular
//! doubly linked ring. Records live in a table keyed by [`ProcessId`]; the
//! `next`/`prev` links are stored as ids, so insert and remove touch only the
//! two neighbors.
//!
//! A floating anchor marks where the next scheduling scan starts. New members
//! are spliced in immediately before the anchor, i.e. they run last in the
//! current rotation.
//!
//! Callers must hold interrupts off across every mutation; the runtime does
//! this with its interrupt guard.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::{Links, Process, ProcessId};

/// Process table plus ring structure.
#[derive(Debug, Default)]
pub struct ProcessRing {
    processes: BTreeMap<ProcessId, Process>,
    anchor: Option<ProcessId>,
}

impl ProcessRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            anchor: None,
        }
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Where the next scan begins
    pub fn anchor(&self) -> Option<ProcessId> {
        self.anchor
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// All records in pid order (not ring order).
    pub fn records(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Link a new process into the ring just before the anchor.
    ///
    /// An empty ring makes it the sole member and the anchor.
    pub fn insert(&mut self, mut process: Process) {
        let pid = process.pid;
        debug_assert!(!self.processes.contains_key(&pid), "pid {} already in ring", pid.0);

        match self.anchor {
            None => {
                process.links = Some(Links { next: pid, prev: pid });
                self.anchor = Some(pid);
                self.processes.insert(pid, process);
            }
            Some(anchor) => {
                let before = self.links_of(anchor).prev;
                process.links = Some(Links {
                    next: anchor,
                    prev: before,
                });
                self.processes.insert(pid, process);
                self.set_next(before, pid);
                self.set_prev(anchor, pid);
            }
        }

        log::trace!("ring: inserted pid {} (len {})", pid.0, self.len());
    }

    /// Unlink a process and hand back its record.
    ///
    /// If it was the anchor, the anchor moves to its successor first.
    pub fn remove(&mut self, pid: ProcessId) -> Option<Process> {
        if !self.processes.contains_key(&pid) {
            return None;
        }

        let links = self.links_of(pid);
        if links.next == pid {
            self.anchor = None;
        } else {
            if self.anchor == Some(pid) {
                self.anchor = Some(links.next);
            }
            self.set_next(links.prev, links.next);
            self.set_prev(links.next, links.prev);
        }

        let mut process = self.processes.remove(&pid)?;
        process.links = None;
        log::trace!("ring: removed pid {} (len {})", pid.0, self.len());
        Some(process)
    }

    /// Move the anchor to the successor of `pid`.
    pub fn advance_anchor_past(&mut self, pid: ProcessId) {
        let next = self.links_of(pid).next;
        self.anchor = Some(next);
    }

    /// Member ids in ring order, starting at the anchor.
    ///
    /// Returns a snapshot, so the ring may be mutated while walking it.
    pub fn ids_from_anchor(&self) -> Vec<ProcessId> {
        let mut ids = Vec::with_capacity(self.len());
        let Some(start) = self.anchor else {
            return ids;
        };

        let mut cursor = start;
        for _ in 0..self.len() {
            ids.push(cursor);
            cursor = self.links_of(cursor).next;
        }
        ids
    }

    fn links_of(&self, pid: ProcessId) -> Links {
        match self.processes.get(&pid).and_then(|p| p.links) {
            Some(links) => links,
            None => panic!("ring corrupted: pid {} has no links", pid.0),
        }
    }

    fn set_next(&mut self, pid: ProcessId, next: ProcessId) {
        match self.processes.get_mut(&pid).and_then(|p| p.links.as_mut()) {
            Some(links) => links.next = next,
            None => panic!("ring corrupted: pid {} has no links", pid.0),
        }
    }

    fn set_prev(&mut self, pid: ProcessId, prev: ProcessId) {
        match self.processes.get_mut(&pid).and_then(|p| p.links.as_mut()) {
            Some(links) => links.prev = prev,
            None => panic!("ring corrupted: pid {} has no links", pid.0),
        }
    }
}
