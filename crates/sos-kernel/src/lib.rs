//! SOS Kernel Runtime
//!
//! This crate drives the pure state machine in `sos-kernel-core` against a
//! [`HAL`]:
//! - Program loading into fresh address spaces
//! - The dispatch loop: schedule, resume, handle the trap
//! - Reclaiming the address spaces of reaped processes
//! - Interrupt-disabled critical sections around every state mutation
//! - The bounded commit log
//!
//! # Control flow of one round
//!
//! ```text
//!   run_once()
//!     │ InterruptGuard
//!     ├─▶ schedule()      preempt, reap (free address spaces), wake, pick
//!     ├─▶ resume()        HAL trampoline runs the process until it traps
//!     └─▶ handle_trap()   timer / syscall / exit / fault
//!           │
//!           └─ a syscall that neither blocks nor yields resumes the caller
//!              again without a new scheduling round
//! ```

#![no_std]
extern crate alloc;

pub mod commit_log;
pub mod config;
pub mod interrupts;
pub mod loader;

use alloc::vec::Vec;

use sos_hal::HAL;
use sos_kernel_core::{
    schedule, step, Commit, CommitType, CpuContext, KernelError, KernelState, Process, ProcessId,
    ProcessState, Syscall, SyscallResult, IDLE_PID,
};

pub use commit_log::CommitLog;
pub use config::{ConfigError, KernelConfig};
pub use interrupts::InterruptGuard;
pub use loader::LoadError;
pub use sos_hal::{HalError, Trap};
pub use sos_kernel_core::Dispatch;

/// The kernel: a HAL plus everything it schedules
pub struct Kernel<H: HAL> {
    hal: H,
    core: KernelCore,
}

/// HAL-free half of the kernel, so a guard can borrow the HAL while the
/// state is mutated
struct KernelCore {
    state: KernelState,
    config: KernelConfig,
    commits: CommitLog,
}

// ============================================================================
// Kernel Implementation - Thin Wrapper
// ============================================================================

impl<H: HAL> Kernel<H> {
    /// Create a kernel with the default configuration
    pub fn new(hal: H) -> Self {
        Self::build(hal, KernelConfig::default())
    }

    /// Create a kernel with a validated configuration
    pub fn with_config(hal: H, config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(hal, config))
    }

    fn build(hal: H, config: KernelConfig) -> Self {
        let state = KernelState::new(config.max_mutexes, config.max_semaphores, config.tick_ms);
        let commits = CommitLog::new(config.commit_log_capacity);
        hal.debug_write(&alloc::format!(
            "[sched] kernel up: {} process slots, {} mutexes, {} semaphores, {} ms tick",
            config.max_processes,
            config.max_mutexes - 1,
            config.max_semaphores - 1,
            config.tick_ms
        ));
        Self {
            hal,
            core: KernelCore {
                state,
                config,
                commits,
            },
        }
    }

    /// Get the HAL
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Read-only view of the scheduling state
    pub fn state(&self) -> &KernelState {
        &self.core.state
    }

    pub fn config(&self) -> &KernelConfig {
        &self.core.config
    }

    /// State mutations recorded so far
    pub fn commit_log(&self) -> &CommitLog {
        &self.core.commits
    }

    // ========================================================================
    // Read-only accessors (delegate to state)
    // ========================================================================

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.core.state.process(pid)
    }

    pub fn current(&self) -> ProcessId {
        self.core.state.current()
    }

    pub fn running(&self) -> Option<ProcessId> {
        self.core.state.running()
    }

    pub fn ring_len(&self) -> usize {
        self.core.state.ring_len()
    }

    pub fn processes_in_ring_order(&self) -> Vec<ProcessId> {
        self.core.state.processes_in_ring_order()
    }

    /// Registers of the idle process
    pub fn idle_context(&self) -> &CpuContext {
        &self.core.state.idle.context
    }

    /// Whether `pid` has been reaped (or never existed)
    pub fn is_reaped(&self, pid: ProcessId) -> bool {
        pid != IDLE_PID && self.core.state.process(pid).is_none()
    }

    // ========================================================================
    // Operations (each runs with interrupts disabled)
    // ========================================================================

    /// Load a program image and make it READY.
    pub fn create_process(&mut self, entry: u32, image: &[u8]) -> Result<ProcessId, LoadError> {
        let _guard = InterruptGuard::new(&self.hal);
        self.core.create_process(&self.hal, entry, image)
    }

    /// Mark a process TERMINATED; it is reaped at the next scheduling round.
    pub fn kill(&mut self, pid: ProcessId) -> bool {
        let _guard = InterruptGuard::new(&self.hal);
        self.core.terminate(&self.hal, pid, -1, "killed")
    }

    /// Run one scheduling round and return the decision.
    pub fn schedule(&mut self) -> Dispatch {
        let _guard = InterruptGuard::new(&self.hal);
        self.core.schedule(&self.hal)
    }

    /// Hand the CPU to `dispatch` until it traps back.
    pub fn resume(&mut self, dispatch: Dispatch) -> Trap {
        let _guard = InterruptGuard::new(&self.hal);
        self.core.resume(&self.hal, dispatch)
    }

    /// Apply a trap to the process it came from.
    ///
    /// Returns true when that process keeps the CPU.
    pub fn handle_trap(&mut self, dispatch: Dispatch, trap: Trap) -> bool {
        let _guard = InterruptGuard::new(&self.hal);
        self.core.handle_trap(&self.hal, dispatch, trap)
    }

    /// One full round: schedule, then run the chosen process until it gives
    /// up the CPU.
    pub fn run_once(&mut self) -> Dispatch {
        let _guard = InterruptGuard::new(&self.hal);
        let dispatch = self.core.schedule(&self.hal);
        loop {
            let trap = self.core.resume(&self.hal, dispatch);
            if !self.core.handle_trap(&self.hal, dispatch, trap) {
                break;
            }
        }
        dispatch
    }

    /// Run `rounds` full rounds
    pub fn run(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.run_once();
        }
    }
}

// ============================================================================
// KernelCore - state transitions with the HAL passed in
// ============================================================================

impl KernelCore {
    fn record(&mut self, commits: impl IntoIterator<Item = Commit>) {
        self.commits.extend(commits);
    }

    fn create_process<H: HAL>(
        &mut self,
        hal: &H,
        entry: u32,
        image: &[u8],
    ) -> Result<ProcessId, LoadError> {
        let epoch = hal.epoch();
        match loader::load(hal, &mut self.state, &self.config, entry, image, epoch) {
            Ok(pid) => {
                hal.debug_write(&alloc::format!(
                    "[loader] pid {} loaded: {} bytes, entry {:#x}",
                    pid.0,
                    image.len(),
                    entry
                ));
                self.record([Commit::new(CommitType::ProcessCreated { pid: pid.0 }, epoch)]);
                Ok(pid)
            }
            Err(e) => {
                hal.debug_write(&alloc::format!("[loader] load failed: {}", e));
                Err(e)
            }
        }
    }

    fn terminate<H: HAL>(&mut self, hal: &H, pid: ProcessId, code: i32, why: &str) -> bool {
        if !self.state.terminate(pid) {
            return false;
        }
        hal.debug_write(&alloc::format!("[sched] pid {} {} (code {})", pid.0, why, code));
        self.record([Commit::new(
            CommitType::ProcessTerminated { pid: pid.0, code },
            hal.epoch(),
        )]);
        true
    }

    fn schedule<H: HAL>(&mut self, hal: &H) -> Dispatch {
        let epoch = hal.epoch();
        let outcome = schedule(&mut self.state, epoch);

        for waiter in &outcome.terminated_waiters {
            hal.debug_write(&alloc::format!(
                "[sched] pid {} terminated: the object it waited on died with its creator",
                waiter.0
            ));
        }
        for (key, next) in &outcome.handed_off {
            hal.debug_write(&alloc::format!(
                "[mutex] mutex {} handed to pid {} after its owner exited",
                key.0,
                next.0
            ));
        }
        for process in &outcome.reaped {
            if let Some(space) = &process.address_space {
                hal.free_address_space(space);
            }
            hal.debug_write(&alloc::format!("[sched] reaped pid {}", process.pid.0));
        }

        self.record(outcome.commits);

        #[cfg(debug_assertions)]
        sos_kernel_core::assert_invariants(&self.state);

        outcome.dispatch
    }

    fn resume<H: HAL>(&mut self, hal: &H, dispatch: Dispatch) -> Trap {
        match dispatch {
            Dispatch::Idle => hal.resume_idle(&mut self.state.idle.context),
            Dispatch::Process(pid) => {
                let Some(process) = self.state.ring.get_mut(pid) else {
                    return Trap::Exit { code: -1 };
                };
                match process.address_space {
                    Some(space) => hal.resume_user(pid, &mut process.context, &space),
                    // Only the loader creates processes, and it always
                    // attaches an address space
                    None => Trap::Exit { code: -1 },
                }
            }
        }
    }

    fn handle_trap<H: HAL>(&mut self, hal: &H, dispatch: Dispatch, trap: Trap) -> bool {
        let pid = match dispatch {
            Dispatch::Process(pid) => pid,
            Dispatch::Idle => {
                if let Trap::Syscall { num, .. } = trap {
                    hal.debug_write(&alloc::format!("[sched] idle issued syscall {:#x}", num));
                }
                return false;
            }
        };

        match trap {
            Trap::Timer => false,
            Trap::Exit { code } => {
                self.terminate(hal, pid, code, "exited");
                false
            }
            Trap::Fault { vector } => {
                self.terminate(hal, pid, -1, &alloc::format!("faulted on vector {}", vector));
                false
            }
            Trap::Syscall { num, args } => self.handle_syscall(hal, pid, num, args),
        }
    }

    fn handle_syscall<H: HAL>(&mut self, hal: &H, pid: ProcessId, num: u32, args: [u32; 4]) -> bool {
        let epoch = hal.epoch();

        let Some(syscall) = Syscall::decode(num, args) else {
            hal.debug_write(&alloc::format!(
                "[sched] pid {} made unknown syscall {:#x}",
                pid.0,
                num
            ));
            self.write_result(pid, SyscallResult::Err(KernelError::UnknownSyscall));
            return true;
        };

        let result = step(&mut self.state, pid, syscall, epoch);
        log::trace!("pid {} {:?} -> {:?}", pid.0, syscall, result.result);

        let forced = result
            .commits
            .iter()
            .filter(|c| matches!(c.commit_type, CommitType::WaiterTerminated { .. }))
            .count();
        for _ in 0..forced {
            match syscall {
                Syscall::MutexDestroy { .. } => hal.debug_write(
                    "[mutex] A process was terminated because a mutex was destroyed!",
                ),
                _ => hal.debug_write(
                    "[sem] A process was terminated because a semaphore was destroyed!",
                ),
            }
        }
        if let Syscall::Exit { code } = syscall {
            hal.debug_write(&alloc::format!("[sched] pid {} exited (code {})", pid.0, code));
        }

        self.write_result(pid, result.result);
        self.record(result.commits);

        let still_running = self
            .state
            .process(pid)
            .map(|p| p.state == ProcessState::Running)
            .unwrap_or(false);
        still_running && !syscall.yields() && result.result != SyscallResult::Blocked
    }

    fn write_result(&mut self, pid: ProcessId, result: SyscallResult) {
        if let (Some(value), Some(process)) = (result.register_value(), self.state.ring.get_mut(pid)) {
            process.context.set_return(value);
        }
    }
}
