/*
 * Blocking Waits
 *
 * A wait runs in three phases:
 *
 * 1. `arm_wait`: arm the thread's WaitCell, register on every awaited event
 *    (consuming a pending signal instead if one exists), register the
 *    timeout, then mark the thread blocked unless something already claimed
 *    the wait
 * 2. suspension: the thread traps into dispatch, which leaves it off every
 *    ready queue until `unblock` puts it back
 * 3. `finish_wait`: drop the timeout and any registration still left, then
 *    report which party claimed the wait
 *
 * Whoever claims the WaitCell first (a trigger, the timeout, a kill) decides
 * the result and unlinks the thread from all awaited events before it can
 * run again; every later claimant fails its CAS and does nothing.
 */

use alloc::sync::Arc;
use core::time::Duration;

use super::Scheduler;
use super::event::{Event, EventRef};
use super::thread::{Thread, WaitOutcome};
use super::types::{SchedError, ThreadStatus, WaitResult};

impl Scheduler {
    /// Block the current thread until one of `events` fires or `timeout` elapses
    ///
    /// `Some(Duration::ZERO)` polls without blocking. The returned index in
    /// `WaitResult::Signaled` refers to the position in `events`.
    ///
    /// # Errors
    /// `TooManyEvents` if more events are given than a thread can listen on,
    /// `ThreadKilled` if the caller is killed before or during the wait.
    pub fn wait_events(
        &self,
        events: &[&Event],
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SchedError> {
        let Some(thread) = self.current_thread() else {
            self.fatal(format_args!("wait outside of thread context"));
        };
        if thread.is_idle() {
            self.fatal(format_args!("idle thread attempted to block"));
        }
        self.wait_events_as(&thread, events, timeout)
    }

    pub(crate) fn wait_events_as(
        &self,
        thread: &Arc<Thread>,
        events: &[&Event],
        timeout: Option<Duration>,
    ) -> Result<WaitResult, SchedError> {
        if let Some(result) = self.arm_wait(thread, events, timeout)? {
            return Ok(result);
        }
        // Traps into dispatch; returns once the thread has been woken and
        // selected again.
        self.arch.request_dispatch(self.vector());
        self.finish_wait(thread)
    }

    /// Suspend the current thread for at least `duration`
    pub fn sleep(&self, duration: Duration) -> Result<(), SchedError> {
        if duration.is_zero() {
            self.yield_now();
            return Ok(());
        }
        let alarm = Event::new();
        self.wait_events(&[&alarm], Some(duration)).map(|_| ())
    }

    /// Register `thread` as a waiter and block it
    ///
    /// Returns `Some` if the wait resolved without suspending (pending
    /// signal, or a poll), `None` if the thread must now trap into dispatch.
    pub(crate) fn arm_wait(
        &self,
        thread: &Arc<Thread>,
        events: &[&Event],
        timeout: Option<Duration>,
    ) -> Result<Option<WaitResult>, SchedError> {
        if events.len() > self.config.max_wait_events {
            return Err(SchedError::TooManyEvents);
        }
        if thread.status() == ThreadStatus::Killed {
            return Err(SchedError::ThreadKilled);
        }

        if timeout == Some(Duration::ZERO) {
            let fired = events.iter().position(|event| event.try_consume());
            return Ok(Some(match fired {
                Some(slot) => WaitResult::Signaled(slot),
                None => WaitResult::NotReady,
            }));
        }

        if !thread.wait.arm() {
            // Either a kill cancelled the thread or a stale wait was never
            // finished; only the former is fatal to the wait.
            if thread.wait.disarm() == WaitOutcome::Cancelled || !thread.wait.arm() {
                return Err(SchedError::ThreadKilled);
            }
        }

        {
            let mut waiting_on = thread.waiting_on.lock();
            waiting_on.clear();
            for event in events {
                if waiting_on.push(EventRef::new(event)).is_err() {
                    drop(waiting_on);
                    self.finish_wait(thread)?;
                    return Err(SchedError::TooManyEvents);
                }
            }
        }

        let resolved = events
            .iter()
            .enumerate()
            .any(|(slot, event)| event.consume_or_listen(thread, slot));
        if resolved {
            return self.finish_wait(thread).map(Some);
        }

        if let Some(timeout) = timeout {
            let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
            let deadline = self.arch.now_ns().saturating_add(nanos);
            self.register_timeout(thread, deadline);
        }

        self.block_waiter(thread);
        Ok(None)
    }

    /// Running -> Blocked, unless the wait was claimed in the meantime
    ///
    /// Done under the CPU lock, the same lock `unblock` takes for
    /// Blocked -> Ready, so a claim either happens before this check (and the
    /// thread never blocks) or after it (and `unblock` sees Blocked).
    fn block_waiter(&self, thread: &Arc<Thread>) -> bool {
        let cpu = self.cpu(thread.last_cpu());
        let mut queue = cpu.queue.lock();
        if thread.wait.is_claimed() {
            return false;
        }
        queue.remove(thread, &cpu.queued);
        thread.transition(ThreadStatus::Running, ThreadStatus::Blocked)
            || thread.transition(ThreadStatus::Ready, ThreadStatus::Blocked)
    }

    /// Tear down a wait and report how it ended
    pub(crate) fn finish_wait(&self, thread: &Arc<Thread>) -> Result<WaitResult, SchedError> {
        self.cancel_timeout(thread);
        self.detach_events(thread);
        match thread.wait.disarm() {
            WaitOutcome::Signaled(slot) => Ok(WaitResult::Signaled(slot)),
            WaitOutcome::TimedOut => Ok(WaitResult::TimedOut),
            WaitOutcome::Cancelled => Err(SchedError::ThreadKilled),
            // Woken by a direct `unblock`; callers re-check their condition.
            WaitOutcome::Waiting | WaitOutcome::Disarmed => {
                log::trace!("scheduler: {} woke without a claim", thread.id());
                Ok(WaitResult::NotReady)
            }
        }
    }

    /// Remove `thread` from the listener list of every event it registered on
    ///
    /// The registration list stays locked until every event is unlinked, so a
    /// concurrent `finish_wait` (after which the waiter may free its events)
    /// cannot return while another CPU still holds one of these references.
    pub(crate) fn detach_events(&self, thread: &Arc<Thread>) {
        let mut waiting_on = thread.waiting_on.lock();
        for event in waiting_on.iter() {
            // SAFETY: an event leaves this list before it is freed (its Drop
            // scrubs itself under this lock), and the list is held.
            unsafe { event.get() }.remove_listener(thread);
        }
        waiting_on.clear();
    }
}
