//! Core kernel types
//!
//! This module contains the fundamental types used throughout the kernel core.
//! All types here are pure data - no behavior that depends on HAL.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

/// The idle/console process. It lives outside the ring and is never reaped.
pub const IDLE_PID: ProcessId = ProcessId(0);

/// Mutex registry key. Key 0 is reserved and never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutexKey(pub u32);

/// Semaphore registry key. Key 0 is reserved and never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SemaphoreKey(pub u32);

/// Process state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Eligible for dispatch
    Ready,
    /// Currently owns the CPU
    Running,
    /// Sleeping or parked on a sync object
    Waiting,
    /// Exited; absorbing until reaped
    Terminated,
}

/// The sync object a process is parked on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncObject {
    Mutex(MutexKey),
    Semaphore(SemaphoreKey),
}

/// Where a blocked process sits: which object, and its position in that
/// object's wait queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedOn {
    /// Object whose wait queue holds the process
    pub object: SyncObject,
    /// Stable position handed out by the wait queue
    pub queue_index: u64,
}

// ============================================================================
// CPU context
// ============================================================================

/// User code segment selector (GDT entry 3, RPL 3)
pub const USER_CODE_SELECTOR: u32 = 0x1b;

/// User data/stack segment selector (GDT entry 4, RPL 3)
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// EFLAGS bit 9: interrupts enabled
pub const EFLAGS_IF: u32 = 1 << 9;

/// EFLAGS bit 1: reserved, always set
pub const EFLAGS_RESERVED: u32 = 1 << 1;

/// Saved register file of a process.
///
/// The scheduling core never interprets it; the trampoline saves and restores
/// it. The kernel only writes syscall results into `eax`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuContext {
    pub edi: u32,
    pub esi: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
}

impl CpuContext {
    /// Initial context of a freshly loaded user program.
    pub fn new_user(entry: u32, stack_top: u32) -> Self {
        Self {
            esp: stack_top,
            ebp: stack_top,
            eip: entry,
            eflags: EFLAGS_IF | EFLAGS_RESERVED,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            ..Default::default()
        }
    }

    /// Store a syscall return value
    pub fn set_return(&mut self, value: u32) {
        self.eax = value;
    }
}

/// Address space handed out by the HAL at process creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    /// Opaque HAL handle
    pub handle: u64,
    /// Base of the region in the kernel's view
    pub base: u32,
    /// Size in bytes
    pub size: u32,
}

// ============================================================================
// Process record
// ============================================================================

/// Ring neighbors. Present only while the process is a ring member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Links {
    pub next: ProcessId,
    pub prev: ProcessId,
}

/// Process record
#[derive(Clone, Debug)]
pub struct Process {
    /// Process ID
    pub pid: ProcessId,
    /// Current state
    pub state: ProcessState,
    /// Saved registers
    pub context: CpuContext,
    /// Backing storage; `None` for the idle process
    pub address_space: Option<AddressSpace>,
    /// Wake deadline of a timed sleep
    pub sleep_end: Option<u64>,
    /// Sync object wait; `None` unless parked in a wait queue
    pub blocked_on: Option<BlockedOn>,
    /// Epoch at creation
    pub created_at: u64,
    pub(crate) links: Option<Links>,
}

impl Process {
    /// Create a READY process record that is not yet in any ring.
    pub fn new(
        pid: ProcessId,
        context: CpuContext,
        address_space: Option<AddressSpace>,
        created_at: u64,
    ) -> Self {
        Self {
            pid,
            state: ProcessState::Ready,
            context,
            address_space,
            sleep_end: None,
            blocked_on: None,
            created_at,
            links: None,
        }
    }

    /// Successor in the ring
    pub fn next(&self) -> Option<ProcessId> {
        self.links.map(|l| l.next)
    }

    /// Predecessor in the ring
    pub fn prev(&self) -> Option<ProcessId> {
        self.links.map(|l| l.prev)
    }

    /// Whether the process is currently linked into a ring
    pub fn in_ring(&self) -> bool {
        self.links.is_some()
    }

    /// Whether the process is parked on a timed sleep (not on a sync object)
    pub fn is_sleeping(&self) -> bool {
        self.state == ProcessState::Waiting && self.blocked_on.is_none() && self.sleep_end.is_some()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures reported by the mutex and semaphore registries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    /// Key is 0, out of range, or names a slot that was never created
    InvalidKey,
    /// Every slot is in use
    NoFreeSlot,
    /// Unlock attempted by a process that does not own the mutex
    NotOwner,
    /// Destroy attempted by a process that did not create the object
    NotCreator,
    /// Semaphore count is already at its maximum
    CountOverflow,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidKey => write!(f, "invalid sync object key"),
            SyncError::NoFreeSlot => write!(f, "no free sync object slot"),
            SyncError::NotOwner => write!(f, "caller does not own the lock"),
            SyncError::NotCreator => write!(f, "caller did not create the object"),
            SyncError::CountOverflow => write!(f, "semaphore count overflow"),
        }
    }
}
