/*
 * Per-CPU Scheduling State
 *
 * Each CPU owns a FIFO ready queue, the identity of its running thread and
 * its idle thread, all behind one interrupt-safe lock. Every core runs the
 * same dispatch logic against its own state; there is no global run queue.
 *
 * The dispatch path additionally serializes on a ticket lock holding the
 * CPU's graveyard: threads reclaimed in one dispatch whose stacks are only
 * freed during the next one, because the outgoing thread's kernel stack is
 * the stack dispatch itself runs on.
 */

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::thread::Thread;
use super::types::{CpuId, ThreadFlags};
use crate::sync::{IrqLock, TicketMutex};

/// Queue and running-thread state of one CPU
pub(crate) struct CpuQueue {
    pub(crate) ready: VecDeque<Arc<Thread>>,
    pub(crate) running: Option<Arc<Thread>>,
    pub(crate) idle: Option<Arc<Thread>>,
}

impl CpuQueue {
    /// Append `thread` unless it already sits in a queue
    pub(crate) fn push(&mut self, thread: Arc<Thread>, queued: &AtomicUsize) -> bool {
        if thread.is_queued() {
            return false;
        }
        thread.insert_flags(ThreadFlags::QUEUED);
        self.ready.push_back(thread);
        queued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the thread at the head of the queue
    pub(crate) fn pop(&mut self, queued: &AtomicUsize) -> Option<Arc<Thread>> {
        let thread = self.ready.pop_front()?;
        thread.remove_flags(ThreadFlags::QUEUED);
        queued.fetch_sub(1, Ordering::Relaxed);
        Some(thread)
    }

    /// Unlink `thread` from the queue, wherever it is
    pub(crate) fn remove(&mut self, thread: &Arc<Thread>, queued: &AtomicUsize) -> bool {
        if !thread.is_queued() {
            return false;
        }
        match self.ready.iter().position(|t| Arc::ptr_eq(t, thread)) {
            Some(index) => {
                self.ready.remove(index);
                thread.remove_flags(ThreadFlags::QUEUED);
                queued.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self, thread: &Arc<Thread>) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(running, thread))
    }

    pub(crate) fn running_idle(&self) -> bool {
        self.running.as_ref().is_none_or(|running| running.is_idle())
    }
}

/// Dispatch counters of one CPU
#[derive(Debug, Default)]
pub struct CpuStats {
    dispatches: AtomicU64,
    switches: AtomicU64,
    idle_dispatches: AtomicU64,
}

/// Point-in-time copy of `CpuStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    /// Dispatch passes run on this CPU
    pub dispatches: u64,
    /// Dispatches that resumed a different thread than they suspended
    pub switches: u64,
    /// Dispatches that fell back to the idle thread
    pub idle_dispatches: u64,
}

impl CpuStats {
    pub(crate) fn record(&self, switched: bool, idle: bool) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        if switched {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
        if idle {
            self.idle_dispatches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            idle_dispatches: self.idle_dispatches.load(Ordering::Relaxed),
        }
    }
}

/// All scheduler state of one CPU
pub(crate) struct PerCpu {
    pub(crate) id: CpuId,
    pub(crate) queue: IrqLock<CpuQueue>,
    /// Number of threads in `queue.ready`, readable without the lock
    pub(crate) queued: AtomicUsize,
    /// Held for the whole dispatch pass; holds threads awaiting stack release
    pub(crate) dispatch: TicketMutex<Vec<Arc<Thread>>>,
    /// Serial of the process whose address space is loaded on this CPU
    pub(crate) loaded_space: AtomicU64,
    pub(crate) stats: CpuStats,
}

impl PerCpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            queue: IrqLock::new(CpuQueue {
                ready: VecDeque::new(),
                running: None,
                idle: None,
            }),
            queued: AtomicUsize::new(0),
            dispatch: TicketMutex::new(Vec::new()),
            loaded_space: AtomicU64::new(u64::MAX),
            stats: CpuStats::default(),
        }
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}
