/*
 * Event - the blocking/wake primitive
 *
 * An Event is a counter plus a FIFO of listening threads:
 *
 * - `trigger` wakes exactly one listener, or, if nobody listens, records a
 *   pending signal (unless the trigger is a best-effort "drop" trigger)
 * - waiting consumes a pending signal immediately, otherwise registers the
 *   thread as a listener and suspends it
 *
 * A thread may wait on several events at once. It then sits in the listener
 * list of each of them; the first party to claim the thread's `WaitCell` (a
 * trigger, the timeout, a kill) wins and unlinks the thread from every other
 * event of the set before making it runnable. A listener that some other
 * party has claimed but not yet unlinked is skipped and left in place for
 * that party to remove.
 *
 * Locking: listener-list mutation happens with the event's lock held. The
 * sibling events are unlinked and the woken thread is made runnable only
 * after that lock is released, so no two event locks nest and the event lock
 * is never held while a per-CPU queue lock is taken.
 */

use alloc::{collections::VecDeque, sync::Arc};
use core::ptr::NonNull;
use core::time::Duration;

use super::Scheduler;
use super::thread::Thread;
use super::types::{SchedError, WaitResult};
use crate::sync::IrqLock;

struct Listener {
    thread: Arc<Thread>,
    /// Index of this event in the listener's awaited set
    slot: usize,
}

struct EventInner {
    pending: usize,
    listeners: VecDeque<Listener>,
}

pub struct Event {
    inner: IrqLock<EventInner>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub const fn new() -> Self {
        Self {
            inner: IrqLock::new(EventInner {
                pending: 0,
                listeners: VecDeque::new(),
            }),
        }
    }

    /// Signals delivered while nobody was listening
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Registered listeners, including claimed ones not yet unlinked
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_listening(&self, thread: &Arc<Thread>) -> bool {
        self.inner
            .lock()
            .listeners
            .iter()
            .any(|listener| Arc::ptr_eq(&listener.thread, thread))
    }

    /// Wake one waiter through the global scheduler
    ///
    /// With `drop` set, a trigger that finds no listener is discarded instead
    /// of being counted as pending.
    pub fn trigger(&self, drop: bool) -> bool {
        match super::try_get() {
            Some(sched) => self.trigger_on(sched, drop),
            None => {
                if !drop {
                    self.inner.lock().pending += 1;
                }
                false
            }
        }
    }

    /// Wake one waiter; returns whether a thread was woken
    pub fn trigger_on(&self, sched: &Scheduler, drop: bool) -> bool {
        let woken = {
            let mut inner = self.inner.lock();
            let claimed = inner
                .listeners
                .iter()
                .position(|listener| listener.thread.wait.claim_signal(listener.slot));
            match claimed {
                Some(index) => inner.listeners.remove(index).map(|listener| listener.thread),
                None => {
                    if !drop {
                        inner.pending += 1;
                    }
                    None
                }
            }
        };

        match woken {
            Some(thread) => {
                log::debug!("event: waking {} of {}", thread.id(), thread.pid());
                sched.detach_events(&thread);
                sched.unblock(&thread);
                true
            }
            None => false,
        }
    }

    /// Block the current thread until triggered or `timeout` elapses
    ///
    /// `Some(Duration::ZERO)` polls without blocking; `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<WaitResult, SchedError> {
        super::get().wait_events(&[self], timeout)
    }

    /// Consume one pending signal if there is one
    pub(crate) fn try_consume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending > 0 {
            inner.pending -= 1;
            true
        } else {
            false
        }
    }

    /// Consume a pending signal on behalf of `thread`, or register it as listener
    ///
    /// Returns true if the wait is resolved (either by a pending signal or
    /// because another event of the set already claimed the thread).
    pub(crate) fn consume_or_listen(&self, thread: &Arc<Thread>, slot: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending > 0 {
            if thread.wait.claim_signal(slot) {
                inner.pending -= 1;
            }
            return true;
        }
        if thread.wait.is_claimed() {
            return true;
        }
        inner.listeners.push_back(Listener {
            thread: thread.clone(),
            slot,
        });
        false
    }

    pub(crate) fn remove_listener(&self, thread: &Arc<Thread>) {
        self.inner
            .lock()
            .listeners
            .retain(|listener| !Arc::ptr_eq(&listener.thread, thread));
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let listeners = core::mem::take(&mut self.inner.lock().listeners);
        let me = EventRef::new(self);
        for listener in listeners {
            listener
                .thread
                .waiting_on
                .lock()
                .retain(|event| *event != me);
        }
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("pending", &inner.pending)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Non-owning handle on an event a thread is registered with
///
/// Valid while the registration exists: the waiter borrows the event for
/// the whole wait, and a dropped event scrubs itself from its listeners.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventRef(NonNull<Event>);

// Only dereferenced while the event is alive (see above); Event is Sync.
unsafe impl Send for EventRef {}
unsafe impl Sync for EventRef {}

impl EventRef {
    pub(crate) fn new(event: &Event) -> Self {
        Self(NonNull::from(event))
    }

    /// # Safety
    /// The referenced event must still be alive.
    pub(crate) unsafe fn get(&self) -> &Event {
        unsafe { self.0.as_ref() }
    }
}
