//! Formal invariants for kernel verification
//!
//! Runtime-checkable properties of a [`KernelState`]. The runtime checks them
//! after every scheduling round in debug builds; the Kani harnesses at the
//! bottom check them symbolically.
//!
//! # Invariants
//!
//! 1. **Ring Structure**: links are symmetric and one revolution from the
//!    anchor visits every member exactly once
//! 2. **Single Runner**: at most one process is RUNNING, and it is `current`
//! 3. **Idle Outside Ring**: the idle process is never linked or terminated
//! 4. **Wait Queue Consistency**: a process is parked in a queue exactly when
//!    its `blocked_on` points at that queue position
//! 5. **Mutex Handoff**: a mutex with waiters always has an owner
//! 6. **Semaphore Handoff**: a semaphore with waiters has a zero count
//! 7. **ID Monotonicity**: every pid is below `next_pid`

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

use crate::state::KernelState;
use crate::types::{BlockedOn, ProcessId, ProcessState, SyncObject, IDLE_PID};
use crate::waitq::WaitQueue;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_ring_structure(state));
    violations.extend(check_single_runner(state));
    violations.extend(check_idle_outside_ring(state));
    violations.extend(check_wait_queue_consistency(state));
    violations.extend(check_mutex_handoff(state));
    violations.extend(check_semaphore_handoff(state));
    violations.extend(check_id_monotonicity(state));

    violations
}

/// Invariant 1: links are symmetric and the ring is a single cycle
fn check_ring_structure(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let ring = &state.ring;

    if ring.is_empty() != ring.anchor().is_none() {
        violations.push(InvariantViolation {
            invariant: "ring_structure",
            description: alloc::format!(
                "Ring has {} members but anchor is {:?}",
                ring.len(),
                ring.anchor()
            ),
        });
        return violations;
    }

    for p in ring.records() {
        let (Some(next), Some(prev)) = (p.next(), p.prev()) else {
            violations.push(InvariantViolation {
                invariant: "ring_structure",
                description: alloc::format!("Process {} is in the table but unlinked", p.pid.0),
            });
            continue;
        };

        if ring.get(next).and_then(|n| n.prev()) != Some(p.pid) {
            violations.push(InvariantViolation {
                invariant: "ring_structure",
                description: alloc::format!(
                    "Process {}: next {} does not link back",
                    p.pid.0,
                    next.0
                ),
            });
        }
        if ring.get(prev).and_then(|n| n.next()) != Some(p.pid) {
            violations.push(InvariantViolation {
                invariant: "ring_structure",
                description: alloc::format!(
                    "Process {}: prev {} does not link forward",
                    p.pid.0,
                    prev.0
                ),
            });
        }
    }

    // Walk one revolution by hand; ids_from_anchor assumes a sound ring
    if let Some(anchor) = ring.anchor() {
        let mut seen = BTreeSet::new();
        let mut cursor = anchor;
        loop {
            if !seen.insert(cursor) {
                break;
            }
            match ring.get(cursor).and_then(|p| p.next()) {
                Some(next) if next != anchor => cursor = next,
                _ => break,
            }
        }
        if seen.len() != ring.len() {
            violations.push(InvariantViolation {
                invariant: "ring_structure",
                description: alloc::format!(
                    "Walk from anchor {} visits {} of {} members",
                    anchor.0,
                    seen.len(),
                    ring.len()
                ),
            });
        }
    }

    violations
}

/// Invariant 2: at most one RUNNING process, and it is `current`
fn check_single_runner(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let running: Vec<ProcessId> = state
        .ring
        .records()
        .chain(core::iter::once(&state.idle))
        .filter(|p| p.state == ProcessState::Running)
        .map(|p| p.pid)
        .collect();

    if running.len() > 1 {
        violations.push(InvariantViolation {
            invariant: "single_runner",
            description: alloc::format!("{} processes are RUNNING", running.len()),
        });
    }
    if let Some(pid) = running.first() {
        if *pid != state.current {
            violations.push(InvariantViolation {
                invariant: "single_runner",
                description: alloc::format!(
                    "Process {} is RUNNING but current is {}",
                    pid.0,
                    state.current.0
                ),
            });
        }
    }

    violations
}

/// Invariant 3: the idle process is never linked or terminated
fn check_idle_outside_ring(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if state.ring.contains(IDLE_PID) || state.idle.in_ring() {
        violations.push(InvariantViolation {
            invariant: "idle_outside_ring",
            description: String::from("Idle process is linked into the ring"),
        });
    }
    if state.idle.state == ProcessState::Terminated {
        violations.push(InvariantViolation {
            invariant: "idle_outside_ring",
            description: String::from("Idle process is terminated"),
        });
    }

    violations
}

/// Invariant 4: queue entries and `blocked_on` agree in both directions
fn check_wait_queue_consistency(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let queues = state
        .mutexes
        .live_keys()
        .filter_map(|k| state.mutexes.get(k))
        .map(|m| (SyncObject::Mutex(m.key), &m.waitq))
        .chain(
            state
                .semaphores
                .live_keys()
                .filter_map(|k| state.semaphores.get(k))
                .map(|s| (SyncObject::Semaphore(s.key), &s.waitq)),
        );

    let mut parked = 0usize;
    for (object, waitq) in queues {
        for (queue_index, pid) in waitq.entries() {
            parked += 1;
            let expected = Some(BlockedOn {
                object,
                queue_index,
            });
            match state.ring.get(pid) {
                None => violations.push(InvariantViolation {
                    invariant: "wait_queue_consistency",
                    description: alloc::format!(
                        "{:?} queues process {} which is not in the ring",
                        object,
                        pid.0
                    ),
                }),
                Some(p) if p.blocked_on != expected => violations.push(InvariantViolation {
                    invariant: "wait_queue_consistency",
                    description: alloc::format!(
                        "{:?} queues process {} at {} but it records {:?}",
                        object,
                        pid.0,
                        queue_index,
                        p.blocked_on
                    ),
                }),
                Some(p) if p.state == ProcessState::Ready || p.state == ProcessState::Running => {
                    violations.push(InvariantViolation {
                        invariant: "wait_queue_consistency",
                        description: alloc::format!(
                            "Process {} is parked on {:?} but {:?}",
                            pid.0,
                            object,
                            p.state
                        ),
                    })
                }
                Some(_) => {}
            }
        }
    }

    let blocked = state
        .ring
        .records()
        .filter(|p| p.blocked_on.is_some())
        .count();
    if blocked != parked {
        violations.push(InvariantViolation {
            invariant: "wait_queue_consistency",
            description: alloc::format!(
                "{} processes record a wait but {} queue entries exist",
                blocked,
                parked
            ),
        });
    }

    violations
}

/// Invariant 5: a mutex with waiters always has an owner
fn check_mutex_handoff(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for key in state.mutexes.live_keys() {
        let Some(mutex) = state.mutexes.get(key) else {
            continue;
        };
        if mutex.owner.is_none() && has_live_waiter(state, &mutex.waitq) {
            violations.push(InvariantViolation {
                invariant: "mutex_handoff",
                description: alloc::format!("Mutex {} is free with processes queued", key.0),
            });
        }
        if let Some(owner) = mutex.owner {
            if state.ring.get(owner).is_none() {
                violations.push(InvariantViolation {
                    invariant: "mutex_handoff",
                    description: alloc::format!(
                        "Mutex {} is owned by reaped process {}",
                        key.0,
                        owner.0
                    ),
                });
            }
        }
    }

    violations
}

/// Invariant 6: a semaphore with waiters has no units left
fn check_semaphore_handoff(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for key in state.semaphores.live_keys() {
        let Some(sem) = state.semaphores.get(key) else {
            continue;
        };
        if sem.count > 0 && has_live_waiter(state, &sem.waitq) {
            violations.push(InvariantViolation {
                invariant: "semaphore_handoff",
                description: alloc::format!(
                    "Semaphore {} has count {} with processes queued",
                    key.0,
                    sem.count
                ),
            });
        }
    }

    violations
}

/// Invariant 7: every pid is below `next_pid`
fn check_id_monotonicity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for p in state.ring.records() {
        if p.pid.0 >= state.next_pid {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Process {} exists but next_pid is {}",
                    p.pid.0,
                    state.next_pid
                ),
            });
        }
    }

    violations
}

/// Killed waiters stay queued until reaped; only the others count
fn has_live_waiter(state: &KernelState, waitq: &WaitQueue) -> bool {
    waitq.iter().any(|pid| {
        state
            .ring
            .get(pid)
            .map(|p| p.state != ProcessState::Terminated)
            .unwrap_or(false)
    })
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(state: &KernelState) {
    let violations = check_all_invariants(state);
    if let Some(v) = violations.first() {
        panic!("Invariant violated: {} ({})", v.invariant, v.description);
    }
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::scheduler::schedule;
    use crate::step::{step, Syscall};
    use crate::types::{CpuContext, MutexKey};

    /// Proof: adding processes and scheduling keeps the ring sound
    #[kani::proof]
    #[kani::unwind(6)]
    fn schedule_maintains_invariants() {
        let mut state = KernelState::new(2, 2, 10);
        let n: u8 = kani::any();
        kani::assume(n <= 3);
        for _ in 0..n {
            state.add_process(CpuContext::default(), None, 0);
        }

        schedule(&mut state, kani::any());

        kani::assert(
            check_all_invariants(&state).is_empty(),
            "Scheduling should maintain invariants",
        );
    }

    /// Proof: reaping any one member keeps the ring sound
    #[kani::proof]
    #[kani::unwind(6)]
    fn reap_maintains_invariants() {
        let mut state = KernelState::new(2, 2, 10);
        let pids = [
            state.add_process(CpuContext::default(), None, 0),
            state.add_process(CpuContext::default(), None, 0),
            state.add_process(CpuContext::default(), None, 0),
        ];
        let victim: usize = kani::any();
        kani::assume(victim < pids.len());
        state.terminate(pids[victim]);

        schedule(&mut state, 0);

        kani::assert(!state.ring.contains(pids[victim]), "Terminated process is reaped");
        kani::assert(
            check_all_invariants(&state).is_empty(),
            "Reaping should maintain invariants",
        );
    }

    /// Proof: contended lock and unlock keep queue and owner consistent
    #[kani::proof]
    #[kani::unwind(6)]
    fn mutex_contention_maintains_invariants() {
        let mut state = KernelState::new(2, 2, 10);
        let a = state.add_process(CpuContext::default(), None, 0);
        let b = state.add_process(CpuContext::default(), None, 0);
        let key = MutexKey(1);

        step(&mut state, a, Syscall::MutexCreate, 0);
        step(&mut state, a, Syscall::MutexLock { key }, 0);
        step(&mut state, b, Syscall::MutexLock { key }, 0);
        if kani::any::<bool>() {
            step(&mut state, a, Syscall::MutexUnlock { key }, 0);
            kani::assert(state.mutex(key).and_then(|m| m.owner) == Some(b), "Handoff to b");
        }

        kani::assert(
            check_all_invariants(&state).is_empty(),
            "Mutex contention should maintain invariants",
        );
    }
}
