/*
 * Scheduler Type Definitions
 *
 * Identifiers, the thread status tag, wait results and the recoverable error
 * type shared by every scheduler module. All lightweight and Copy.
 */

use core::fmt;

use bitflags::bitflags;

/// CPU identifier
///
/// Index into the scheduler's per-CPU array, 0 being the bootstrap processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Bootstrap processor (CPU 0)
    pub const BSP: CpuId = CpuId(0);

    /// Get the CPU ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Thread identifier, unique within its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub usize);

impl ProcessId {
    /// The kernel process, owner of the idle threads and of orphans
    pub const KERNEL: ProcessId = ProcessId(0);

    /// Get the raw ID value
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.0)
    }
}

/// Thread status
///
/// `Ready`: queued on a CPU (or created and not yet queued).
/// `Running`: the running thread of exactly one CPU.
/// `Blocked`: listening on at least one event, in no ready queue.
/// `Killed`: terminal, waiting for dispatch to reclaim it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Killed = 3,
}

impl ThreadStatus {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ThreadStatus::Ready,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Blocked,
            _ => ThreadStatus::Killed,
        }
    }
}

bitflags! {
    /// Per-thread attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Per-CPU idle thread: never queued, never killed, no FPU save
        const IDLE = 1 << 0;
        /// Created with a user-mode entry
        const USER = 1 << 1;
        /// Has been trapped out of user mode at least once
        const USER_TOUCHED = 1 << 2;
        /// Currently sitting in a ready queue
        const QUEUED = 1 << 3;
    }
}

/// Outcome of waiting on one or more events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The event at this index of the awaited set fired
    Signaled(usize),
    /// The timeout elapsed first
    TimedOut,
    /// Non-blocking poll found nothing pending
    NotReady,
}

/// Recoverable scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Every process ID up to the configured maximum is in use
    NoFreePids,
    /// Kernel stack or FPU area could not be allocated
    StackAllocFailed,
    /// No process with the given ID exists
    NoSuchProcess,
    /// The process exists but is not a child of the caller
    NotAChild,
    /// Nothing to reap yet (non-blocking reap)
    WouldBlock,
    /// The caller has no children at all
    NoChildren,
    /// More events in one wait than the per-thread listener capacity
    TooManyEvents,
    /// The waiting thread was killed
    ThreadKilled,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NoFreePids => write!(f, "No free process IDs"),
            SchedError::StackAllocFailed => write!(f, "Kernel stack allocation failed"),
            SchedError::NoSuchProcess => write!(f, "No such process"),
            SchedError::NotAChild => write!(f, "Process is not a child of the caller"),
            SchedError::WouldBlock => write!(f, "Operation would block"),
            SchedError::NoChildren => write!(f, "No child processes"),
            SchedError::TooManyEvents => write!(f, "Too many events in one wait"),
            SchedError::ThreadKilled => write!(f, "Thread was killed"),
        }
    }
}
