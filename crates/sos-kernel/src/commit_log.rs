//! Commit log
//!
//! Bounded, append-only record of every state mutation the kernel made.
//! Sequence numbers keep increasing after old entries are dropped, so a
//! reader can tell when it has missed commits.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use sos_kernel_core::Commit;

/// Bounded commit log
#[derive(Debug)]
pub struct CommitLog {
    /// Most recent commits, oldest first
    commits: VecDeque<Commit>,
    /// Sequence number for the next commit
    next_seq: u64,
    /// Entries kept in memory
    capacity: usize,
}

impl CommitLog {
    /// Create an empty log that keeps at most `capacity` commits
    pub fn new(capacity: usize) -> Self {
        Self {
            commits: VecDeque::new(),
            next_seq: 0,
            capacity,
        }
    }

    /// Append a commit, assigning its sequence number.
    pub fn append(&mut self, mut commit: Commit) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        commit.seq = seq;
        self.commits.push_back(commit);
        self.trim_if_needed();
        seq
    }

    /// Append several commits in order
    pub fn extend(&mut self, commits: impl IntoIterator<Item = Commit>) {
        for commit in commits {
            self.append(commit);
        }
    }

    /// Commits still in memory, oldest first
    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.commits.iter()
    }

    /// The `count` most recent commits, oldest first
    pub fn recent(&self, count: usize) -> Vec<&Commit> {
        let skip = self.commits.len().saturating_sub(count);
        self.commits.iter().skip(skip).collect()
    }

    /// Commits with `start <= seq < end` that are still in memory
    pub fn get_range(&self, start: u64, end: u64) -> Vec<&Commit> {
        self.commits
            .iter()
            .filter(|c| c.seq >= start && c.seq < end)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Sequence number the next commit will get
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Serialize the commits in memory as a JSON array
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.commits)
    }

    fn trim_if_needed(&mut self) {
        while self.commits.len() > self.capacity {
            self.commits.pop_front();
        }
    }
}
