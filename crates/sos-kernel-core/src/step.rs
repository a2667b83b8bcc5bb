//! Syscall step function
//!
//! Decodes the raw syscall number and arguments captured by the trampoline
//! and applies the call to the [`KernelState`]. All process-visible effects of
//! the mutex, semaphore, sleep and exit calls happen here.
//!
//! # Design
//!
//! `step` takes:
//! - Current kernel state
//! - The calling process
//! - A decoded syscall
//! - The current epoch
//!
//! And returns:
//! - The syscall result (written to the caller's `eax` by the runtime)
//! - A list of commits describing the state mutations, for the audit log

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::mutex::LockOutcome;
use crate::semaphore::DownOutcome;
use crate::state::KernelState;
use crate::types::{MutexKey, ProcessId, SemaphoreKey, SyncError};

// ============================================================================
// Syscall definitions
// ============================================================================

pub const SYS_YIELD: u32 = 0x01;
pub const SYS_EXIT: u32 = 0x02;
pub const SYS_SLEEP: u32 = 0x03;
pub const SYS_GET_EPOCH: u32 = 0x04;
pub const SYS_MUTEX_CREATE: u32 = 0x10;
pub const SYS_MUTEX_DESTROY: u32 = 0x11;
pub const SYS_MUTEX_LOCK: u32 = 0x12;
pub const SYS_MUTEX_UNLOCK: u32 = 0x13;
pub const SYS_SEM_CREATE: u32 = 0x20;
pub const SYS_SEM_DESTROY: u32 = 0x21;
pub const SYS_SEM_DOWN: u32 = 0x22;
pub const SYS_SEM_UP: u32 = 0x23;

/// Syscall variants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Give up the rest of the time slice
    Yield,
    /// Terminate the caller
    Exit { code: i32 },
    /// Sleep for at least `ms` milliseconds
    Sleep { ms: u32 },
    /// Read the epoch counter (low 32 bits)
    GetEpoch,
    MutexCreate,
    MutexDestroy { key: MutexKey },
    MutexLock { key: MutexKey },
    MutexUnlock { key: MutexKey },
    SemCreate { value: u32 },
    SemDestroy { key: SemaphoreKey },
    SemDown { key: SemaphoreKey },
    SemUp { key: SemaphoreKey },
}

impl Syscall {
    /// Decode a syscall number and its register arguments.
    pub fn decode(num: u32, args: [u32; 4]) -> Option<Self> {
        let syscall = match num {
            SYS_YIELD => Syscall::Yield,
            SYS_EXIT => Syscall::Exit { code: args[0] as i32 },
            SYS_SLEEP => Syscall::Sleep { ms: args[0] },
            SYS_GET_EPOCH => Syscall::GetEpoch,
            SYS_MUTEX_CREATE => Syscall::MutexCreate,
            SYS_MUTEX_DESTROY => Syscall::MutexDestroy { key: MutexKey(args[0]) },
            SYS_MUTEX_LOCK => Syscall::MutexLock { key: MutexKey(args[0]) },
            SYS_MUTEX_UNLOCK => Syscall::MutexUnlock { key: MutexKey(args[0]) },
            SYS_SEM_CREATE => Syscall::SemCreate { value: args[0] },
            SYS_SEM_DESTROY => Syscall::SemDestroy { key: SemaphoreKey(args[0]) },
            SYS_SEM_DOWN => Syscall::SemDown { key: SemaphoreKey(args[0]) },
            SYS_SEM_UP => Syscall::SemUp { key: SemaphoreKey(args[0]) },
            _ => return None,
        };
        Some(syscall)
    }

    /// Whether the caller gives up the CPU even when the call succeeds
    pub fn yields(&self) -> bool {
        matches!(self, Syscall::Yield | Syscall::Exit { .. } | Syscall::Sleep { .. })
    }
}

// ============================================================================
// Syscall results
// ============================================================================

/// Syscall result - what the kernel returns to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Success with value
    Ok(u32),
    /// Caller was parked; the value is written when it is granted
    Blocked,
    /// Failure
    Err(KernelError),
}

impl SyscallResult {
    /// Value to place in the caller's `eax`, if any.
    ///
    /// Failures read as 0 at the ABI: `FALSE` for boolean calls and the
    /// reserved key for the create calls.
    pub fn register_value(&self) -> Option<u32> {
        match self {
            SyscallResult::Ok(v) => Some(*v),
            SyscallResult::Blocked => None,
            SyscallResult::Err(_) => Some(0),
        }
    }
}

/// Kernel errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Mutex or semaphore operation refused
    Sync(SyncError),
    /// Syscall number not recognised
    UnknownSyscall,
    /// Caller is not a live process
    ProcessNotFound,
}

impl From<SyncError> for KernelError {
    fn from(e: SyncError) -> Self {
        KernelError::Sync(e)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Sync(e) => write!(f, "{}", e),
            KernelError::UnknownSyscall => write!(f, "unknown syscall"),
            KernelError::ProcessNotFound => write!(f, "process not found"),
        }
    }
}

// ============================================================================
// Commit types for audit log
// ============================================================================

/// Commit types - describe state mutations for audit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    ProcessCreated { pid: u64 },
    ProcessDispatched { pid: u64 },
    ProcessTerminated { pid: u64, code: i32 },
    ProcessReaped { pid: u64 },
    ProcessSlept { pid: u64, until: u64 },
    ProcessWoken { pid: u64 },
    MutexCreated { key: u32, creator: u64 },
    MutexDestroyed { key: u32 },
    MutexAcquired { key: u32, pid: u64 },
    MutexReleased { key: u32, pid: u64 },
    SemaphoreCreated { key: u32, creator: u64, value: u32 },
    SemaphoreDestroyed { key: u32 },
    SemaphoreSignalled { key: u32, pid: u64 },
    /// A waiter terminated because its object was destroyed
    WaiterTerminated { pid: u64 },
}

/// A commit record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Sequence number, assigned by the commit log
    pub seq: u64,
    /// Epoch at which the mutation happened
    pub epoch: u64,
    /// Type of mutation
    pub commit_type: CommitType,
}

impl Commit {
    /// Create a new commit (sequence number assigned by the log)
    pub fn new(commit_type: CommitType, epoch: u64) -> Self {
        Self {
            seq: 0,
            epoch,
            commit_type,
        }
    }
}

/// Result of a step operation
#[derive(Clone, Debug)]
pub struct StepResult {
    /// The syscall result
    pub result: SyscallResult,
    /// Commits generated by this step
    pub commits: Vec<Commit>,
}

impl StepResult {
    fn ok(value: u32, commits: Vec<Commit>) -> Self {
        Self {
            result: SyscallResult::Ok(value),
            commits,
        }
    }

    fn err(e: impl Into<KernelError>) -> Self {
        Self {
            result: SyscallResult::Err(e.into()),
            commits: vec![],
        }
    }
}

// ============================================================================
// The step function
// ============================================================================

/// Execute a syscall on behalf of `from_pid`.
///
/// The caller must hold interrupts off for the whole call.
pub fn step(state: &mut KernelState, from_pid: ProcessId, syscall: Syscall, epoch: u64) -> StepResult {
    if !state.ring.contains(from_pid) {
        return StepResult::err(KernelError::ProcessNotFound);
    }

    match syscall {
        Syscall::Yield => StepResult::ok(0, vec![]),
        Syscall::GetEpoch => StepResult::ok(epoch as u32, vec![]),
        Syscall::Exit { code } => step_exit(state, from_pid, code, epoch),
        Syscall::Sleep { ms } => step_sleep(state, from_pid, ms, epoch),
        Syscall::MutexCreate => step_mutex_create(state, from_pid, epoch),
        Syscall::MutexDestroy { key } => step_mutex_destroy(state, from_pid, key, epoch),
        Syscall::MutexLock { key } => step_mutex_lock(state, from_pid, key, epoch),
        Syscall::MutexUnlock { key } => step_mutex_unlock(state, from_pid, key, epoch),
        Syscall::SemCreate { value } => step_sem_create(state, from_pid, value, epoch),
        Syscall::SemDestroy { key } => step_sem_destroy(state, from_pid, key, epoch),
        Syscall::SemDown { key } => step_sem_down(state, from_pid, key, epoch),
        Syscall::SemUp { key } => step_sem_up(state, key, epoch),
    }
}

// ============================================================================
// Syscall handlers
// ============================================================================

fn step_exit(state: &mut KernelState, from_pid: ProcessId, code: i32, epoch: u64) -> StepResult {
    state.terminate(from_pid);
    StepResult::ok(
        code as u32,
        vec![Commit::new(
            CommitType::ProcessTerminated {
                pid: from_pid.0,
                code,
            },
            epoch,
        )],
    )
}

fn step_sleep(state: &mut KernelState, from_pid: ProcessId, ms: u32, epoch: u64) -> StepResult {
    if ms == 0 {
        return StepResult::ok(0, vec![]);
    }

    let until = epoch + state.ms_to_epochs(ms);
    state.sleep_until(from_pid, until);
    StepResult::ok(
        0,
        vec![Commit::new(
            CommitType::ProcessSlept {
                pid: from_pid.0,
                until,
            },
            epoch,
        )],
    )
}

fn step_mutex_create(state: &mut KernelState, from_pid: ProcessId, epoch: u64) -> StepResult {
    match state.mutexes.create(from_pid) {
        Ok(key) => StepResult::ok(
            key.0,
            vec![Commit::new(
                CommitType::MutexCreated {
                    key: key.0,
                    creator: from_pid.0,
                },
                epoch,
            )],
        ),
        Err(e) => StepResult::err(e),
    }
}

fn step_mutex_destroy(
    state: &mut KernelState,
    from_pid: ProcessId,
    key: MutexKey,
    epoch: u64,
) -> StepResult {
    match state.mutexes.destroy(key, from_pid, &mut state.ring) {
        Ok(terminated) => {
            let mut commits = vec![Commit::new(CommitType::MutexDestroyed { key: key.0 }, epoch)];
            commits.extend(waiter_commits(&terminated, epoch));
            StepResult::ok(1, commits)
        }
        Err(e) => StepResult::err(e),
    }
}

fn step_mutex_lock(state: &mut KernelState, from_pid: ProcessId, key: MutexKey, epoch: u64) -> StepResult {
    match state.mutexes.lock(key, from_pid, &mut state.ring) {
        Ok(LockOutcome::Acquired) => StepResult::ok(
            1,
            vec![Commit::new(
                CommitType::MutexAcquired {
                    key: key.0,
                    pid: from_pid.0,
                },
                epoch,
            )],
        ),
        Ok(LockOutcome::Blocked) => StepResult {
            result: SyscallResult::Blocked,
            commits: vec![],
        },
        Err(e) => StepResult::err(e),
    }
}

fn step_mutex_unlock(
    state: &mut KernelState,
    from_pid: ProcessId,
    key: MutexKey,
    epoch: u64,
) -> StepResult {
    match state.mutexes.unlock(key, from_pid, &mut state.ring) {
        Ok(next) => {
            let mut commits = vec![Commit::new(
                CommitType::MutexReleased {
                    key: key.0,
                    pid: from_pid.0,
                },
                epoch,
            )];
            if let Some(next) = next {
                commits.push(Commit::new(
                    CommitType::MutexAcquired {
                        key: key.0,
                        pid: next.0,
                    },
                    epoch,
                ));
            }
            StepResult::ok(1, commits)
        }
        Err(e) => StepResult::err(e),
    }
}

fn step_sem_create(state: &mut KernelState, from_pid: ProcessId, value: u32, epoch: u64) -> StepResult {
    match state.semaphores.create(value, from_pid) {
        Ok(key) => StepResult::ok(
            key.0,
            vec![Commit::new(
                CommitType::SemaphoreCreated {
                    key: key.0,
                    creator: from_pid.0,
                    value,
                },
                epoch,
            )],
        ),
        Err(e) => StepResult::err(e),
    }
}

fn step_sem_destroy(
    state: &mut KernelState,
    from_pid: ProcessId,
    key: SemaphoreKey,
    epoch: u64,
) -> StepResult {
    match state.semaphores.destroy(key, from_pid, &mut state.ring) {
        Ok(terminated) => {
            let mut commits = vec![Commit::new(CommitType::SemaphoreDestroyed { key: key.0 }, epoch)];
            commits.extend(waiter_commits(&terminated, epoch));
            StepResult::ok(1, commits)
        }
        Err(e) => StepResult::err(e),
    }
}

fn step_sem_down(
    state: &mut KernelState,
    from_pid: ProcessId,
    key: SemaphoreKey,
    _epoch: u64,
) -> StepResult {
    match state.semaphores.down(key, from_pid, &mut state.ring) {
        Ok(DownOutcome::Acquired) => StepResult::ok(1, vec![]),
        Ok(DownOutcome::Blocked) => StepResult {
            result: SyscallResult::Blocked,
            commits: vec![],
        },
        Err(e) => StepResult::err(e),
    }
}

fn step_sem_up(state: &mut KernelState, key: SemaphoreKey, epoch: u64) -> StepResult {
    match state.semaphores.up(key, &mut state.ring) {
        Ok(Some(woken)) => StepResult::ok(
            1,
            vec![Commit::new(
                CommitType::SemaphoreSignalled {
                    key: key.0,
                    pid: woken.0,
                },
                epoch,
            )],
        ),
        Ok(None) => StepResult::ok(1, vec![]),
        Err(e) => StepResult::err(e),
    }
}

pub(crate) fn waiter_commits(terminated: &[ProcessId], epoch: u64) -> impl Iterator<Item = Commit> + '_ {
    terminated
        .iter()
        .map(move |pid| Commit::new(CommitType::WaiterTerminated { pid: pid.0 }, epoch))
}
