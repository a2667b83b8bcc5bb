//! Round-robin scheduling decision
//!
//! One call to [`schedule`] per kernel re-entry:
//!
//! 1. Return a still-RUNNING current process to READY
//! 2. Reap every TERMINATED ring member (sync cleanup, unlink, hand the
//!    record back so the runtime can free its address space)
//! 3. Wake every sleeper whose deadline has passed (`epoch >= sleep_end`)
//! 4. From the anchor, pick the first READY process within one revolution,
//!    mark it RUNNING and move the anchor past it
//! 5. Otherwise fall back to the idle process
//!
//! Reaping and waking run before the pick so a process that just became
//! eligible can be chosen in the same round. There are no priorities.

use alloc::vec;
use alloc::vec::Vec;

use crate::state::KernelState;
use crate::step::{waiter_commits, Commit, CommitType};
use crate::types::{MutexKey, Process, ProcessId, ProcessState, IDLE_PID};

/// Who gets the CPU next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A user process from the ring
    Process(ProcessId),
    /// Nothing is READY; run the idle/console process
    Idle,
}

/// Everything one scheduling round did
#[derive(Debug)]
pub struct ScheduleOutcome {
    /// Process to resume
    pub dispatch: Dispatch,
    /// Records unlinked this round; their address spaces are still allocated
    pub reaped: Vec<Process>,
    /// Sleepers moved to READY
    pub woken: Vec<ProcessId>,
    /// Waiters terminated because a reaped process's objects were destroyed
    pub terminated_waiters: Vec<ProcessId>,
    /// Mutexes held by reaped processes and the waiters that received them
    pub handed_off: Vec<(MutexKey, ProcessId)>,
    /// Audit records
    pub commits: Vec<Commit>,
}

/// Run one scheduling round.
///
/// The caller must hold interrupts off for the whole call.
pub fn schedule(state: &mut KernelState, epoch: u64) -> ScheduleOutcome {
    state.preempt_current();

    let mut outcome = ScheduleOutcome {
        dispatch: Dispatch::Idle,
        reaped: vec![],
        woken: vec![],
        terminated_waiters: vec![],
        handed_off: vec![],
        commits: vec![],
    };

    reap_terminated(state, epoch, &mut outcome);
    wake_sleepers(state, epoch, &mut outcome);
    outcome.dispatch = pick_next(state);

    if let Dispatch::Process(pid) = outcome.dispatch {
        outcome
            .commits
            .push(Commit::new(CommitType::ProcessDispatched { pid: pid.0 }, epoch));
    }

    outcome
}

/// Unlink and hand back every TERMINATED process.
///
/// Walks a snapshot of the ring, so unlinking (including the anchor) does not
/// disturb the walk. Waiters terminated by a reap are reaped too if the walk
/// has not passed them yet; otherwise they go next round.
fn reap_terminated(state: &mut KernelState, epoch: u64, outcome: &mut ScheduleOutcome) {
    for pid in state.ring.ids_from_anchor() {
        let terminated = state
            .ring
            .get(pid)
            .map(|p| p.state == ProcessState::Terminated)
            .unwrap_or(false);
        if !terminated {
            continue;
        }

        let mutexes = state.mutexes.cleanup(pid, &mut state.ring);
        let semaphores = state.semaphores.cleanup(pid, &mut state.ring);

        outcome.commits.extend(
            mutexes
                .destroyed
                .iter()
                .map(|k| Commit::new(CommitType::MutexDestroyed { key: k.0 }, epoch)),
        );
        outcome.commits.extend(
            semaphores
                .destroyed
                .iter()
                .map(|k| Commit::new(CommitType::SemaphoreDestroyed { key: k.0 }, epoch)),
        );
        outcome.commits.extend(waiter_commits(&mutexes.terminated, epoch));
        outcome.commits.extend(waiter_commits(&semaphores.terminated, epoch));
        outcome.commits.extend(mutexes.handed_off.iter().map(|(k, next)| {
            Commit::new(
                CommitType::MutexAcquired {
                    key: k.0,
                    pid: next.0,
                },
                epoch,
            )
        }));

        outcome.terminated_waiters.extend(mutexes.terminated);
        outcome.terminated_waiters.extend(semaphores.terminated);
        outcome.handed_off.extend(mutexes.handed_off);

        if let Some(record) = state.ring.remove(pid) {
            if state.current == pid {
                state.current = IDLE_PID;
            }
            log::debug!("reaped pid {}", pid.0);
            outcome
                .commits
                .push(Commit::new(CommitType::ProcessReaped { pid: pid.0 }, epoch));
            outcome.reaped.push(record);
        }
    }
}

/// Move every sleeper whose deadline has passed back to READY.
fn wake_sleepers(state: &mut KernelState, epoch: u64, outcome: &mut ScheduleOutcome) {
    for pid in state.ring.ids_from_anchor() {
        let Some(p) = state.ring.get_mut(pid) else {
            continue;
        };
        if !p.is_sleeping() {
            continue;
        }
        if matches!(p.sleep_end, Some(end) if epoch >= end) {
            p.state = ProcessState::Ready;
            p.sleep_end = None;
            outcome.woken.push(pid);
            outcome
                .commits
                .push(Commit::new(CommitType::ProcessWoken { pid: pid.0 }, epoch));
        }
    }
}

/// Select the first READY process at or after the anchor.
fn pick_next(state: &mut KernelState) -> Dispatch {
    let candidate = state.ring.ids_from_anchor().into_iter().find(|&pid| {
        state
            .ring
            .get(pid)
            .map(|p| p.state == ProcessState::Ready)
            .unwrap_or(false)
    });

    match candidate {
        Some(pid) => {
            if let Some(p) = state.ring.get_mut(pid) {
                p.state = ProcessState::Running;
            }
            state.ring.advance_anchor_past(pid);
            state.current = pid;
            Dispatch::Process(pid)
        }
        None => {
            state.idle.state = ProcessState::Running;
            state.current = IDLE_PID;
            Dispatch::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::check_all_invariants;
    use crate::step::{step, Syscall};
    use crate::types::{AddressSpace, CpuContext, SemaphoreKey};

    fn state_with(n: usize) -> (KernelState, Vec<ProcessId>) {
        let mut state = KernelState::new(8, 8, 10);
        let pids = (0..n)
            .map(|i| {
                let space = AddressSpace {
                    handle: i as u64,
                    base: 0,
                    size: 4096,
                };
                state.add_process(CpuContext::default(), Some(space), 0)
            })
            .collect();
        (state, pids)
    }

    #[test]
    fn test_empty_ring_dispatches_idle() {
        let (mut state, _) = state_with(0);
        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.dispatch, Dispatch::Idle);
        assert_eq!(state.running(), Some(IDLE_PID));
    }

    #[test]
    fn test_round_robin_rotation() {
        let (mut state, pids) = state_with(3);
        let mut order = Vec::new();
        for _ in 0..6 {
            match schedule(&mut state, 0).dispatch {
                Dispatch::Process(pid) => order.push(pid),
                Dispatch::Idle => panic!("expected a user process"),
            }
        }
        assert_eq!(
            order,
            vec![pids[0], pids[1], pids[2], pids[0], pids[1], pids[2]]
        );
    }

    #[test]
    fn test_at_most_one_running() {
        let (mut state, _) = state_with(4);
        for _ in 0..5 {
            schedule(&mut state, 0);
            let running = state
                .ring
                .records()
                .filter(|p| p.state == ProcessState::Running)
                .count();
            assert_eq!(running, 1);
            assert_ne!(state.idle.state, ProcessState::Running);
        }
    }

    #[test]
    fn test_terminated_is_reaped_in_one_round() {
        let (mut state, pids) = state_with(3);
        state.terminate(pids[1]);

        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.reaped.len(), 1);
        assert_eq!(outcome.reaped[0].pid, pids[1]);
        assert_eq!(outcome.reaped[0].address_space.unwrap().handle, 1);
        assert!(!state.ring.contains(pids[1]));
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_reaping_the_anchor() {
        let (mut state, pids) = state_with(3);
        state.terminate(pids[0]);
        state.terminate(pids[2]);

        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.reaped.len(), 2);
        assert_eq!(outcome.dispatch, Dispatch::Process(pids[1]));
        assert_eq!(state.ring_len(), 1);
    }

    #[test]
    fn test_reap_everything_falls_back_to_idle() {
        let (mut state, pids) = state_with(2);
        for pid in &pids {
            state.terminate(*pid);
        }
        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.dispatch, Dispatch::Idle);
        assert!(state.ring.is_empty());
    }

    #[test]
    fn test_running_process_reaped_clears_current() {
        let (mut state, pids) = state_with(1);
        schedule(&mut state, 0);
        assert_eq!(state.current(), pids[0]);
        state.terminate(pids[0]);

        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.dispatch, Dispatch::Idle);
        assert_eq!(state.current(), IDLE_PID);
    }

    #[test]
    fn test_sleeper_wakes_at_deadline_not_before() {
        let (mut state, pids) = state_with(1);
        state.sleep_until(pids[0], 10);

        let outcome = schedule(&mut state, 9);
        assert_eq!(outcome.dispatch, Dispatch::Idle);
        assert_eq!(state.process(pids[0]).unwrap().state, ProcessState::Waiting);

        let outcome = schedule(&mut state, 10);
        assert_eq!(outcome.woken, vec![pids[0]]);
        assert_eq!(outcome.dispatch, Dispatch::Process(pids[0]));
    }

    #[test]
    fn test_sync_waiter_not_woken_by_clock() {
        let (mut state, pids) = state_with(2);
        step(&mut state, pids[0], Syscall::SemCreate { value: 0 }, 0);
        step(&mut state, pids[1], Syscall::SemDown { key: SemaphoreKey(1) }, 0);

        schedule(&mut state, 1_000);
        assert_eq!(state.process(pids[1]).unwrap().state, ProcessState::Waiting);
    }

    #[test]
    fn test_waiting_processes_are_skipped() {
        let (mut state, pids) = state_with(3);
        state.sleep_until(pids[0], 100);

        let first = schedule(&mut state, 0).dispatch;
        let second = schedule(&mut state, 0).dispatch;
        let third = schedule(&mut state, 0).dispatch;
        assert_eq!(first, Dispatch::Process(pids[1]));
        assert_eq!(second, Dispatch::Process(pids[2]));
        assert_eq!(third, Dispatch::Process(pids[1]));
    }

    #[test]
    fn test_reaping_creator_terminates_waiters() {
        let (mut state, pids) = state_with(3);
        step(&mut state, pids[0], Syscall::MutexCreate, 0);
        let key = MutexKey(1);
        step(&mut state, pids[0], Syscall::MutexLock { key }, 0);
        step(&mut state, pids[1], Syscall::MutexLock { key }, 0);
        state.terminate(pids[0]);

        let outcome = schedule(&mut state, 0);
        assert_eq!(outcome.terminated_waiters, vec![pids[1]]);
        // pids[1] sits after pids[0] in the walk, so it goes in the same round
        assert_eq!(outcome.reaped.len(), 2);
        assert!(state.mutex(key).is_none());
        assert_eq!(outcome.dispatch, Dispatch::Process(pids[2]));
    }
}
