//! Kernel integration tests
//!
//! Drive the full schedule / resume / trap loop against `MockHal`. Each
//! process's behaviour is a script of traps queued on the mock; an empty
//! script reads as a timer interrupt.

use sos_hal::HAL;
use sos_hal_mock::MockHal;
use sos_kernel::{Dispatch, Kernel, KernelConfig, LoadError, Trap};
use sos_kernel_core::step::{
    SYS_EXIT, SYS_GET_EPOCH, SYS_MUTEX_CREATE, SYS_MUTEX_DESTROY, SYS_MUTEX_LOCK,
    SYS_MUTEX_UNLOCK, SYS_SEM_CREATE, SYS_SEM_DESTROY, SYS_SEM_DOWN, SYS_SEM_UP, SYS_SLEEP,
    SYS_YIELD,
};
use sos_kernel_core::{check_all_invariants, CommitType, MutexKey, ProcessId, ProcessState, SemaphoreKey, IDLE_PID};

const IMAGE: &[u8] = &[0x90; 64];

fn kernel_with(n: usize) -> (Kernel<MockHal>, Vec<ProcessId>) {
    let mut kernel = Kernel::new(MockHal::new());
    let pids = (0..n)
        .map(|i| kernel.create_process(0x10 * i as u32, IMAGE).unwrap())
        .collect();
    (kernel, pids)
}

fn eax(kernel: &Kernel<MockHal>, pid: ProcessId) -> u32 {
    kernel.process(pid).unwrap().context.eax
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_idle_runs_when_ring_is_empty() {
    let (mut kernel, _) = kernel_with(0);
    assert_eq!(kernel.run_once(), Dispatch::Idle);
    assert_eq!(kernel.hal().dispatch_order(), vec![IDLE_PID]);
    assert_eq!(kernel.running(), Some(IDLE_PID));
}

#[test]
fn test_round_robin_dispatch_order() {
    let (mut kernel, pids) = kernel_with(3);
    kernel.run(6);

    assert_eq!(
        kernel.hal().dispatch_order(),
        vec![pids[0], pids[1], pids[2], pids[0], pids[1], pids[2]]
    );
}

#[test]
fn test_newcomer_joins_at_end_of_rotation() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.run(1);
    let late = kernel.create_process(0, IMAGE).unwrap();
    kernel.run(3);

    assert_eq!(
        kernel.hal().dispatch_order(),
        vec![pids[0], pids[1], pids[0], late]
    );
}

#[test]
fn test_interrupts_disabled_during_dispatch_and_restored() {
    let (mut kernel, _) = kernel_with(2);
    kernel.run(4);

    assert!(kernel
        .hal()
        .get_dispatches()
        .iter()
        .all(|d| !d.interrupts_enabled));
    assert!(kernel.hal().interrupts_enabled());
    assert!(kernel.hal().disable_count() >= 4);
}

#[test]
fn test_user_context_reaches_trampoline() {
    let (mut kernel, pids) = kernel_with(1);
    kernel.run_once();

    let resumed = kernel.hal().last_dispatch().unwrap();
    assert_eq!(resumed.pid, pids[0]);
    assert_eq!(resumed.context.cs, 0x1b);
    assert_eq!(resumed.context.ss, 0x23);
    assert_eq!(resumed.context.esp, 64 + 16384 - 4096 - 4);
}

// ============================================================================
// Termination and reaping
// ============================================================================

#[test]
fn test_exit_trap_reaps_and_frees_address_space() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().push_trap(pids[0], Trap::Exit { code: 0 });

    kernel.run_once();
    assert_eq!(
        kernel.process(pids[0]).unwrap().state,
        ProcessState::Terminated
    );
    assert!(kernel.hal().has_region_for(pids[0]));

    kernel.run_once();
    assert!(kernel.is_reaped(pids[0]));
    assert!(!kernel.hal().has_region_for(pids[0]));
    assert_eq!(kernel.ring_len(), 1);
    assert!(kernel.hal().has_log_containing("reaped pid 1"));
}

#[test]
fn test_exit_syscall_terminates_caller() {
    let (mut kernel, pids) = kernel_with(1);
    kernel.hal().push_syscall(pids[0], SYS_EXIT, 7);

    kernel.run_once();
    assert_eq!(
        kernel.process(pids[0]).unwrap().state,
        ProcessState::Terminated
    );

    assert_eq!(kernel.run_once(), Dispatch::Idle);
    assert!(kernel.is_reaped(pids[0]));
}

#[test]
fn test_fault_terminates_process() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().push_trap(pids[0], Trap::Fault { vector: 13 });

    kernel.run(2);
    assert!(kernel.is_reaped(pids[0]));
    assert!(kernel.hal().has_log_containing("faulted on vector 13"));
}

#[test]
fn test_last_process_exit_falls_back_to_idle() {
    let (mut kernel, pids) = kernel_with(1);
    kernel.hal().push_trap(pids[0], Trap::Exit { code: 0 });
    kernel.run_once();

    assert_eq!(kernel.run_once(), Dispatch::Idle);
    assert_eq!(kernel.ring_len(), 0);
    assert_eq!(kernel.hal().live_regions(), 0);
}

#[test]
fn test_commit_log_records_lifecycle() {
    let (mut kernel, pids) = kernel_with(1);
    kernel.hal().push_trap(pids[0], Trap::Exit { code: 3 });
    kernel.run(2);

    let types: Vec<CommitType> = kernel
        .commit_log()
        .commits()
        .map(|c| c.commit_type.clone())
        .collect();
    let pid = pids[0].0;
    assert!(types.contains(&CommitType::ProcessCreated { pid }));
    assert!(types.contains(&CommitType::ProcessDispatched { pid }));
    assert!(types.contains(&CommitType::ProcessTerminated { pid, code: 3 }));
    assert!(types.contains(&CommitType::ProcessReaped { pid }));
}

// ============================================================================
// Syscalls
// ============================================================================

#[test]
fn test_nonblocking_syscall_keeps_the_cpu() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().set_epoch(41);
    kernel.hal().push_syscall(pids[0], SYS_GET_EPOCH, 0);

    kernel.run_once();
    // Syscall, then the timer on the second resume
    assert_eq!(kernel.hal().dispatch_order(), vec![pids[0], pids[0]]);
    assert_eq!(eax(&kernel, pids[0]), 41);
}

#[test]
fn test_yield_gives_up_the_cpu() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().push_syscall(pids[0], SYS_YIELD, 0);

    kernel.run(2);
    assert_eq!(kernel.hal().dispatch_order(), vec![pids[0], pids[1]]);
}

#[test]
fn test_unknown_syscall_returns_zero() {
    let (mut kernel, pids) = kernel_with(1);
    kernel.hal().push_syscall(pids[0], SYS_MUTEX_CREATE, 0);
    kernel.hal().push_syscall(pids[0], 0xEE, 0);

    kernel.run_once();
    let resumes = kernel.hal().get_dispatches();
    assert_eq!(resumes[1].context.eax, 1);
    assert_eq!(resumes[2].context.eax, 0);
    assert!(kernel.hal().has_log_containing("unknown syscall 0xee"));
}

#[test]
fn test_sleep_wakes_after_deadline() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().set_auto_tick(false);
    kernel.hal().push_syscall(pids[0], SYS_SLEEP, 30);

    kernel.run_once();
    let p = kernel.process(pids[0]).unwrap();
    assert_eq!(p.state, ProcessState::Waiting);
    assert_eq!(p.sleep_end, Some(3));

    kernel.hal().set_epoch(1);
    assert_eq!(kernel.run_once(), Dispatch::Process(pids[1]));
    kernel.hal().set_epoch(2);
    assert_eq!(kernel.run_once(), Dispatch::Process(pids[1]));

    kernel.hal().set_epoch(3);
    assert_eq!(kernel.run_once(), Dispatch::Process(pids[0]));
}

#[test]
fn test_sleep_zero_acts_as_yield() {
    let (mut kernel, pids) = kernel_with(2);
    kernel.hal().push_syscall(pids[0], SYS_SLEEP, 0);

    kernel.run(2);
    assert_eq!(kernel.hal().dispatch_order(), vec![pids[0], pids[1]]);
    assert_eq!(kernel.process(pids[0]).unwrap().state, ProcessState::Ready);
}

#[test]
fn test_config_from_json_sets_tick_length() {
    let config = KernelConfig::from_json(r#"{ "tick_ms": 5 }"#).unwrap();
    let mut kernel = Kernel::with_config(MockHal::new(), config).unwrap();
    let pid = kernel.create_process(0, IMAGE).unwrap();
    kernel.hal().push_syscall(pid, SYS_SLEEP, 12);

    kernel.run_once();
    assert_eq!(kernel.process(pid).unwrap().sleep_end, Some(3));
}

// ============================================================================
// Mutexes
// ============================================================================

#[test]
fn test_mutex_contention_hands_off_on_unlock() {
    let (mut kernel, pids) = kernel_with(2);
    let (a, b) = (pids[0], pids[1]);
    let key = MutexKey(1);

    let hal = kernel.hal();
    hal.push_syscall(a, SYS_MUTEX_CREATE, 0);
    hal.push_syscall(a, SYS_MUTEX_LOCK, key.0);
    hal.push_trap(a, Trap::Timer);
    hal.push_syscall(a, SYS_MUTEX_UNLOCK, key.0);
    hal.push_syscall(b, SYS_MUTEX_LOCK, key.0);

    kernel.run(2);
    assert_eq!(kernel.state().mutex(key).unwrap().owner, Some(a));
    assert_eq!(kernel.process(b).unwrap().state, ProcessState::Waiting);

    kernel.run_once();
    assert_eq!(kernel.state().mutex(key).unwrap().owner, Some(b));
    assert_eq!(kernel.process(b).unwrap().state, ProcessState::Ready);
    assert_eq!(eax(&kernel, b), 1);

    assert_eq!(kernel.run_once(), Dispatch::Process(b));
    assert!(check_all_invariants(kernel.state()).is_empty());
}

#[test]
fn test_unlock_by_non_owner_returns_false() {
    let (mut kernel, pids) = kernel_with(2);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_MUTEX_CREATE, 0);
    hal.push_syscall(pids[0], SYS_MUTEX_LOCK, 1);
    hal.push_syscall(pids[1], SYS_MUTEX_UNLOCK, 1);
    hal.push_trap(pids[1], Trap::Timer);

    kernel.run(2);
    assert_eq!(eax(&kernel, pids[1]), 0);
    assert_eq!(
        kernel.state().mutex(MutexKey(1)).unwrap().owner,
        Some(pids[0])
    );
}

#[test]
fn test_owner_exit_hands_mutex_to_waiter() {
    let (mut kernel, pids) = kernel_with(3);
    let (creator, a, b) = (pids[0], pids[1], pids[2]);
    let key = MutexKey(1);

    let hal = kernel.hal();
    hal.push_syscall(creator, SYS_MUTEX_CREATE, 0);
    hal.push_syscall(a, SYS_MUTEX_LOCK, key.0);
    hal.push_trap(a, Trap::Timer);
    hal.push_trap(a, Trap::Exit { code: 0 });
    hal.push_syscall(b, SYS_MUTEX_LOCK, key.0);

    kernel.run(3);
    assert_eq!(kernel.process(b).unwrap().state, ProcessState::Waiting);
    assert_eq!(kernel.state().mutex(key).unwrap().owner, Some(a));

    // creator idles, a exits, then the reap hands the lock to b who runs
    kernel.run(3);
    assert!(kernel.is_reaped(a));
    assert_eq!(kernel.state().mutex(key).unwrap().owner, Some(b));
    assert_eq!(kernel.process(b).unwrap().state, ProcessState::Running);
    assert_eq!(eax(&kernel, b), 1);
    assert!(kernel.hal().has_log_containing("handed to pid 3"));
}

#[test]
fn test_killed_waiter_is_removed_from_queue() {
    let (mut kernel, pids) = kernel_with(2);
    let key = MutexKey(1);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_MUTEX_CREATE, 0);
    hal.push_syscall(pids[0], SYS_MUTEX_LOCK, key.0);
    hal.push_syscall(pids[1], SYS_MUTEX_LOCK, key.0);

    kernel.run(2);
    assert!(kernel.state().mutex(key).unwrap().waitq.contains(pids[1]));

    assert!(kernel.kill(pids[1]));
    kernel.run_once();
    assert!(kernel.is_reaped(pids[1]));
    assert!(kernel.state().mutex(key).unwrap().waitq.is_empty());
    assert!(check_all_invariants(kernel.state()).is_empty());
}

#[test]
fn test_creator_exit_destroys_mutex_and_terminates_waiters() {
    let (mut kernel, pids) = kernel_with(3);
    let key = MutexKey(1);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_MUTEX_CREATE, 0);
    hal.push_syscall(pids[0], SYS_MUTEX_LOCK, key.0);
    hal.push_trap(pids[0], Trap::Timer);
    hal.push_trap(pids[0], Trap::Exit { code: 0 });
    hal.push_syscall(pids[1], SYS_MUTEX_LOCK, key.0);

    kernel.run(4);
    assert_eq!(kernel.process(pids[1]).unwrap().state, ProcessState::Waiting);
    assert_eq!(
        kernel.process(pids[0]).unwrap().state,
        ProcessState::Terminated
    );

    // The waiter was already passed in this round's walk
    kernel.run_once();
    assert!(kernel.state().mutex(key).is_none());
    assert!(kernel.is_reaped(pids[0]));
    assert_eq!(
        kernel.process(pids[1]).unwrap().state,
        ProcessState::Terminated
    );
    assert!(kernel
        .hal()
        .has_log_containing("pid 2 terminated: the object it waited on died with its creator"));

    kernel.run_once();
    assert!(kernel.is_reaped(pids[1]));
    assert_eq!(kernel.ring_len(), 1);
}

#[test]
fn test_mutex_destroy_terminates_waiters() {
    let (mut kernel, pids) = kernel_with(3);
    let key = MutexKey(1);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_MUTEX_CREATE, 0);
    hal.push_syscall(pids[0], SYS_MUTEX_LOCK, key.0);
    hal.push_trap(pids[0], Trap::Timer);
    hal.push_syscall(pids[0], SYS_MUTEX_DESTROY, key.0);
    hal.push_syscall(pids[1], SYS_MUTEX_LOCK, key.0);
    hal.push_syscall(pids[2], SYS_MUTEX_LOCK, key.0);

    kernel.run(3);
    assert_eq!(kernel.state().mutex(key).unwrap().waitq.len(), 2);

    kernel.run_once();
    assert_eq!(
        kernel
            .hal()
            .count_log_containing("[mutex] A process was terminated because a mutex was destroyed!"),
        2
    );
    assert_eq!(eax(&kernel, pids[0]), 1);
    assert!(kernel.state().mutex(key).is_none());
    assert_eq!(
        kernel.process(pids[1]).unwrap().state,
        ProcessState::Terminated
    );

    kernel.run_once();
    assert!(kernel.is_reaped(pids[1]));
    assert!(kernel.is_reaped(pids[2]));
    assert_eq!(kernel.hal().live_regions(), 1);
    assert!(check_all_invariants(kernel.state()).is_empty());
}

// ============================================================================
// Semaphores
// ============================================================================

#[test]
fn test_semaphore_up_wakes_waiter() {
    let (mut kernel, pids) = kernel_with(2);
    let (creator, x) = (pids[0], pids[1]);
    let key = SemaphoreKey(1);

    let hal = kernel.hal();
    hal.push_syscall(creator, SYS_SEM_CREATE, 0);
    hal.push_trap(creator, Trap::Timer);
    hal.push_syscall(creator, SYS_SEM_UP, key.0);
    hal.push_syscall(x, SYS_SEM_DOWN, key.0);

    kernel.run(2);
    assert_eq!(kernel.process(x).unwrap().state, ProcessState::Waiting);

    kernel.run_once();
    assert_eq!(kernel.process(x).unwrap().state, ProcessState::Ready);
    assert_eq!(kernel.state().semaphore(key).unwrap().count, 0);
    assert_eq!(eax(&kernel, x), 1);
}

#[test]
fn test_semaphore_counts_units() {
    let (mut kernel, pids) = kernel_with(1);
    let key = SemaphoreKey(1);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_SEM_CREATE, 2);
    hal.push_syscall(pids[0], SYS_SEM_DOWN, key.0);
    hal.push_syscall(pids[0], SYS_SEM_DOWN, key.0);
    hal.push_syscall(pids[0], SYS_SEM_UP, key.0);

    kernel.run_once();
    assert_eq!(kernel.state().semaphore(key).unwrap().count, 1);
    assert_eq!(kernel.process(pids[0]).unwrap().state, ProcessState::Running);
}

#[test]
fn test_semaphore_destroy_terminates_waiters() {
    let (mut kernel, pids) = kernel_with(3);
    let key = SemaphoreKey(1);
    let hal = kernel.hal();
    hal.push_syscall(pids[0], SYS_SEM_CREATE, 0);
    hal.push_trap(pids[0], Trap::Timer);
    hal.push_syscall(pids[0], SYS_SEM_DESTROY, key.0);
    hal.push_syscall(pids[1], SYS_SEM_DOWN, key.0);
    hal.push_syscall(pids[2], SYS_SEM_DOWN, key.0);

    kernel.run(4);
    assert_eq!(
        kernel
            .hal()
            .count_log_containing("A process was terminated because a semaphore was destroyed!"),
        2
    );
    assert_eq!(eax(&kernel, pids[0]), 1);
    assert!(kernel.state().semaphore(key).is_none());

    kernel.run_once();
    assert!(kernel.is_reaped(pids[1]));
    assert!(kernel.is_reaped(pids[2]));
    assert_eq!(kernel.hal().live_regions(), 1);
}

// ============================================================================
// Loader
// ============================================================================

#[test]
fn test_create_process_rejects_empty_image() {
    let (mut kernel, _) = kernel_with(0);
    assert_eq!(kernel.create_process(0, &[]), Err(LoadError::EmptyImage));
    assert!(kernel.hal().has_log_containing("[loader] load failed"));
}

#[test]
fn test_create_process_respects_table_size() {
    let config = KernelConfig {
        max_processes: 2,
        ..KernelConfig::default()
    };
    let mut kernel = Kernel::with_config(MockHal::new(), config).unwrap();
    kernel.create_process(0, IMAGE).unwrap();
    let second = kernel.create_process(0, IMAGE).unwrap();
    assert_eq!(
        kernel.create_process(0, IMAGE),
        Err(LoadError::TooManyProcesses)
    );

    // A reaped slot can be reused
    kernel.hal().push_trap(second, Trap::Exit { code: 0 });
    kernel.run(3);
    assert!(kernel.create_process(0, IMAGE).is_ok());
}

#[test]
fn test_with_config_rejects_invalid() {
    let config = KernelConfig {
        tick_ms: 0,
        ..KernelConfig::default()
    };
    assert!(Kernel::with_config(MockHal::new(), config).is_err());
}
