/*
 * Thread Management
 *
 * A Thread owns everything needed to resume it at the point it trapped:
 * the saved register frame, the FPU/extended state area, TLS segment bases,
 * a kernel stack and a separate page-fault stack.
 *
 * Status transitions are compare-and-swap on an atomic tag so that a
 * concurrent `kill` can never be overwritten by a late wake-up. The
 * transitions Blocked -> Ready and Running -> Blocked additionally happen
 * under the lock of the thread's CPU, which is what closes the lost wake-up
 * window between "decide to sleep" and "actually sleep".
 */

use alloc::{string::String, sync::Weak};
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use super::event::EventRef;
use super::process::Process;
use super::types::{CpuId, ProcessId, ThreadFlags, ThreadId, ThreadStatus};
use crate::arch::{SegmentBases, StackTops, TrapFrame};
use crate::memory::{FpuArea, KernelStack};
use crate::sync::IrqLock;

/// Upper bound on events in one multi-event wait
pub const MAX_WAIT_EVENTS: usize = 8;

const OUTCOME_DISARMED: usize = usize::MAX;
const OUTCOME_WAITING: usize = usize::MAX - 1;
const OUTCOME_TIMED_OUT: usize = usize::MAX - 2;
const OUTCOME_CANCELLED: usize = usize::MAX - 3;

/// How an armed wait was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Nothing armed
    Disarmed,
    /// Armed and not yet claimed
    Waiting,
    /// Claimed by the event at this slot
    Signaled(usize),
    TimedOut,
    /// Thread was killed while waiting
    Cancelled,
}

impl WaitOutcome {
    fn from_raw(raw: usize) -> Self {
        match raw {
            OUTCOME_DISARMED => WaitOutcome::Disarmed,
            OUTCOME_WAITING => WaitOutcome::Waiting,
            OUTCOME_TIMED_OUT => WaitOutcome::TimedOut,
            OUTCOME_CANCELLED => WaitOutcome::Cancelled,
            slot => WaitOutcome::Signaled(slot),
        }
    }
}

/// Single-shot resolution slot of a thread's current wait
///
/// Every party that can end a wait (a trigger on any of the awaited events,
/// the timeout, a kill) races to move the cell out of `Waiting`. Exactly one
/// wins; everyone else sees the claim fail and backs off.
pub(crate) struct WaitCell(AtomicUsize);

impl WaitCell {
    const fn new() -> Self {
        Self(AtomicUsize::new(OUTCOME_DISARMED))
    }

    /// Start a wait. Fails if a kill already cancelled the thread.
    pub(crate) fn arm(&self) -> bool {
        self.0
            .compare_exchange(
                OUTCOME_DISARMED,
                OUTCOME_WAITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn claim_raw(&self, value: usize) -> bool {
        self.0
            .compare_exchange(OUTCOME_WAITING, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resolve the wait as signaled by the event at `slot`
    pub(crate) fn claim_signal(&self, slot: usize) -> bool {
        debug_assert!(slot < MAX_WAIT_EVENTS);
        self.claim_raw(slot)
    }

    pub(crate) fn claim_timeout(&self) -> bool {
        self.claim_raw(OUTCOME_TIMED_OUT)
    }

    /// Mark the thread killed, whether or not a wait is in progress
    pub(crate) fn cancel(&self) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            match raw {
                OUTCOME_DISARMED | OUTCOME_WAITING => Some(OUTCOME_CANCELLED),
                _ => None,
            }
        });
    }

    /// Whether the current wait has been resolved by someone
    pub(crate) fn is_claimed(&self) -> bool {
        !matches!(
            self.outcome(),
            WaitOutcome::Waiting | WaitOutcome::Disarmed
        )
    }

    pub(crate) fn outcome(&self) -> WaitOutcome {
        WaitOutcome::from_raw(self.0.load(Ordering::Acquire))
    }

    /// End the wait and return how it was resolved
    ///
    /// A cancellation is sticky: it survives disarming so that any later
    /// wait attempt by the killed thread fails immediately.
    pub(crate) fn disarm(&self) -> WaitOutcome {
        let mut raw = self.0.load(Ordering::Acquire);
        loop {
            let next = if raw == OUTCOME_CANCELLED {
                OUTCOME_CANCELLED
            } else {
                OUTCOME_DISARMED
            };
            match self
                .0
                .compare_exchange_weak(raw, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return WaitOutcome::from_raw(raw),
                Err(current) => raw = current,
            }
        }
    }
}

/// Register state saved across a suspension
///
/// Resuming a thread is exactly: copy `frame` into the trap frame, hand
/// `fpu` and `bases` to the architecture load hook.
pub(crate) struct ThreadContext {
    pub(crate) frame: TrapFrame,
    pub(crate) bases: SegmentBases,
    pub(crate) fpu: Option<FpuArea>,
}

/// Kernel and page-fault stacks, released together on reclaim
pub(crate) struct ThreadStacks {
    pub(crate) kernel: KernelStack,
    pub(crate) page_fault: KernelStack,
}

/// Thread structure
///
/// Threads belong to a Process and share that process's address space. The
/// process owns the thread (`Arc`); the thread only keeps a weak reference
/// back.
pub struct Thread {
    id: ThreadId,
    name: String,
    pid: ProcessId,
    process: Weak<Process>,
    status: AtomicU8,
    flags: AtomicU32,
    last_cpu: AtomicU32,

    pub(crate) wait: WaitCell,
    pub(crate) context: IrqLock<ThreadContext>,
    pub(crate) stacks: IrqLock<Option<ThreadStacks>>,
    /// Events this thread is registered on (non-empty only while waiting)
    pub(crate) waiting_on: IrqLock<heapless::Vec<EventRef, MAX_WAIT_EVENTS>>,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        process: &alloc::sync::Arc<Process>,
        cpu: CpuId,
        flags: ThreadFlags,
        context: ThreadContext,
        stacks: ThreadStacks,
    ) -> Self {
        Self {
            id,
            name,
            pid: process.id(),
            process: alloc::sync::Arc::downgrade(process),
            status: AtomicU8::new(ThreadStatus::Ready as u8),
            flags: AtomicU32::new(flags.bits()),
            last_cpu: AtomicU32::new(cpu.0),
            wait: WaitCell::new(),
            context: IrqLock::new(context),
            stacks: IrqLock::new(Some(stacks)),
            waiting_on: IrqLock::new(heapless::Vec::new()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// ID of the owning process (valid even after the process is gone)
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn process(&self) -> Option<alloc::sync::Arc<Process>> {
        self.process.upgrade()
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the thread was not in `from`
    pub(crate) fn transition(&self, from: ThreadStatus, to: ThreadStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter the terminal state, returning the previous status
    pub(crate) fn mark_killed(&self) -> ThreadStatus {
        ThreadStatus::from_raw(
            self.status
                .swap(ThreadStatus::Killed as u8, Ordering::AcqRel),
        )
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    pub fn is_queued(&self) -> bool {
        self.flags().contains(ThreadFlags::QUEUED)
    }

    /// CPU whose queue this thread belongs to
    pub fn last_cpu(&self) -> CpuId {
        CpuId(self.last_cpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_cpu(&self, cpu: CpuId) {
        self.last_cpu.store(cpu.0, Ordering::Release);
    }

    /// Snapshot of the saved register frame
    pub fn saved_frame(&self) -> TrapFrame {
        self.context.lock().frame
    }

    /// Kernel and page-fault stack tops, zero once reclaimed
    pub(crate) fn stack_tops(&self) -> StackTops {
        match self.stacks.lock().as_ref() {
            Some(stacks) => StackTops {
                kernel: stacks.kernel.top(),
                page_fault: stacks.page_fault.top(),
            },
            None => StackTops::default(),
        }
    }

    /// Free stacks and FPU area; the thread must never run again
    pub(crate) fn release_resources(&self) {
        let stacks = self.stacks.lock().take();
        let fpu = self.context.lock().fpu.take();
        self.waiting_on.lock().clear();
        drop(stacks);
        drop(fpu);
    }

    pub(crate) fn has_resources(&self) -> bool {
        self.stacks.lock().is_some()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("flags", &self.flags())
            .field("last_cpu", &self.last_cpu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_cell_single_claim() {
        let cell = WaitCell::new();
        assert!(!cell.claim_signal(0));
        assert!(cell.arm());
        assert!(!cell.is_claimed());
        assert!(cell.claim_signal(1));
        assert!(!cell.claim_timeout());
        assert!(cell.is_claimed());
        assert_eq!(cell.disarm(), WaitOutcome::Signaled(1));
        assert_eq!(cell.outcome(), WaitOutcome::Disarmed);
    }

    #[test]
    fn test_timeout_beats_late_signal() {
        let cell = WaitCell::new();
        assert!(cell.arm());
        assert!(cell.claim_timeout());
        assert!(!cell.claim_signal(0));
        assert_eq!(cell.disarm(), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let cell = WaitCell::new();
        cell.cancel();
        assert!(!cell.arm());
        assert_eq!(cell.disarm(), WaitOutcome::Cancelled);
        assert_eq!(cell.outcome(), WaitOutcome::Cancelled);
        assert!(!cell.arm());
    }

    #[test]
    fn test_cancel_does_not_override_claim() {
        let cell = WaitCell::new();
        assert!(cell.arm());
        assert!(cell.claim_signal(2));
        cell.cancel();
        assert_eq!(cell.outcome(), WaitOutcome::Signaled(2));
    }
}
