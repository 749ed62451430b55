/*
 * Ticket Spin Lock
 *
 * A lock taker atomically draws a ticket from `next_ticket` and spins until
 * `serving_ticket` reaches it. Release advances `serving_ticket` by one, so
 * waiters are served strictly in arrival order.
 *
 * The served ticket doubles as the proof of ownership: `unlock` takes it back
 * and refuses any ticket other than the one currently being served.
 */

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Raw ticket lock without protected data
pub struct TicketLock {
    next_ticket: AtomicUsize,
    serving_ticket: AtomicUsize,
}

impl TicketLock {
    /// Create a new unlocked ticket lock
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            serving_ticket: AtomicUsize::new(0),
        }
    }

    /// Take a ticket and spin until it is being served
    ///
    /// Returns the ticket that was served.
    pub fn lock(&self) -> usize {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.serving_ticket.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        ticket
    }

    /// Acquire the lock only if nobody holds it or waits for it
    ///
    /// Returns the served ticket on success.
    pub fn try_lock(&self) -> Option<usize> {
        let serving = self.serving_ticket.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
    }

    /// Release the lock held under `ticket` and serve the next one
    ///
    /// # Panics
    /// Releasing a lock that is not held, or with a ticket other than the
    /// one being served, is a kernel bug and panics.
    pub fn unlock(&self, ticket: usize) {
        let serving = self.serving_ticket.load(Ordering::Relaxed);
        if self.next_ticket.load(Ordering::Relaxed) == serving {
            panic!("ticket lock released while not held");
        }
        if ticket != serving {
            panic!(
                "ticket lock released by non-owner (ticket {}, serving {})",
                ticket, serving
            );
        }
        self.serving_ticket
            .store(serving.wrapping_add(1), Ordering::Release);
    }

    /// Check whether some CPU holds the lock
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.serving_ticket.load(Ordering::Relaxed)
    }

    /// Number of CPUs currently spinning for the lock (holder excluded)
    pub fn waiters(&self) -> usize {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.serving_ticket.load(Ordering::Relaxed);
        next.wrapping_sub(serving).saturating_sub(1)
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticket lock protecting a value of type `T`
pub struct TicketMutex<T> {
    lock: TicketLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`
unsafe impl<T: Send> Sync for TicketMutex<T> {}
unsafe impl<T: Send> Send for TicketMutex<T> {}

impl<T> TicketMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: TicketLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning in FIFO order
    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let ticket = self.lock.lock();
        TicketMutexGuard {
            mutex: self,
            ticket,
        }
    }

    pub fn try_lock(&self) -> Option<TicketMutexGuard<'_, T>> {
        let ticket = self.lock.try_lock()?;
        Some(TicketMutexGuard {
            mutex: self,
            ticket,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// RAII guard for TicketMutex
pub struct TicketMutexGuard<'a, T> {
    mutex: &'a TicketMutex<T>,
    ticket: usize,
}

impl<T> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for TicketMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for TicketMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock(self.ticket);
    }
}
