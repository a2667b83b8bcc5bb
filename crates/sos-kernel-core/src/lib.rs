//! SOS Kernel Core - Scheduling and Synchronization State Machine
//!
//! This crate contains the **pure, HAL-free** part of the SOS kernel: the
//! process ring, the round-robin scheduling decision and the mutex and
//! semaphore registries that park and wake processes.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: context switching, address spaces and the clock
//!    live behind `sos-hal` and are driven by `sos-kernel`
//! 2. **Explicit context**: every operation takes the [`KernelState`] it acts
//!    on, so several kernels can coexist in one test binary
//! 3. **Deterministic**: the same state, epoch and syscall always produce the
//!    same result
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    sos-kernel-core                          │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  KernelState  │    │  schedule()   │                    │
//! │   │  - ring       │───▶│  reap / wake  │                    │
//! │   │  - mutexes    │    │  / pick next  │                    │
//! │   │  - semaphores │    └───────────────┘                    │
//! │   └───────────────┘    ┌───────────────┐                    │
//! │           │            │    step()     │                    │
//! │           └───────────▶│ syscall logic │                    │
//! │                        └───────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       sos-kernel                            │
//! │   - interrupt guard, trampoline dispatch, program loader    │
//! │   - address-space reclamation, commit log                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Process records, keys, CPU context, errors
//! - `ring` - Circular doubly linked ring over the process table
//! - `waitq` - FIFO wait queue with stable positions
//! - `mutex` - Exclusive locks with direct handoff
//! - `semaphore` - Counting semaphores with direct handoff
//! - `scheduler` - Per-tick reap / wake / dispatch decision
//! - `state` - `KernelState` tying the above together
//! - `step` - Syscall decoding and the `step` function
//! - `invariants` - Runtime-checkable structural invariants

#![no_std]
extern crate alloc;

pub mod invariants;
pub mod mutex;
pub mod ring;
pub mod scheduler;
pub mod semaphore;
pub mod state;
pub mod step;
pub mod types;
pub mod waitq;

pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use mutex::{LockOutcome, Mutex, MutexTable};
pub use ring::ProcessRing;
pub use scheduler::{schedule, Dispatch, ScheduleOutcome};
pub use semaphore::{DownOutcome, Semaphore, SemaphoreTable};
pub use state::KernelState;
pub use step::{step, Commit, CommitType, KernelError, StepResult, Syscall, SyscallResult};
pub use types::{
    AddressSpace, BlockedOn, CpuContext, MutexKey, Process, ProcessId, ProcessState,
    SemaphoreKey, SyncError, SyncObject, IDLE_PID,
};
pub use waitq::WaitQueue;
