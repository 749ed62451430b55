/*
 * Interrupt-Safe Lock
 *
 * `lock()` records whether local interrupts were enabled, disables them, and
 * only then takes the underlying ticket lock. Dropping the guard releases the
 * ticket lock first and restores the recorded interrupt flag last.
 *
 * Code holding an IrqLock cannot be re-entered by a local interrupt, so an
 * interrupt handler can never spin on a lock held by the context it
 * interrupted. Locks nest: the inner guard sees interrupts already disabled and
 * restores "disabled", the outer guard restores the original state.
 */

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use super::TicketLock;
use crate::arch;

/// Interrupt-safe lock protecting a value of type `T`
pub struct IrqLock<T> {
    lock: TicketLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`
unsafe impl<T: Send> Sync for IrqLock<T> {}
unsafe impl<T: Send> Send for IrqLock<T> {}

impl<T> IrqLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: TicketLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Disable local interrupts and acquire the lock
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let irq_was_enabled = arch::interrupts_enabled();
        arch::set_interrupts(false);
        let ticket = self.lock.lock();
        IrqLockGuard {
            lock: self,
            ticket,
            irq_was_enabled,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without spinning
    ///
    /// On failure the interrupt flag is restored before returning.
    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let irq_was_enabled = arch::interrupts_enabled();
        arch::set_interrupts(false);
        match self.lock.try_lock() {
            Some(ticket) => Some(IrqLockGuard {
                lock: self,
                ticket,
                irq_was_enabled,
                _not_send: PhantomData,
            }),
            None => {
                if irq_was_enabled {
                    arch::set_interrupts(true);
                }
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<T: Default> Default for IrqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for IrqLock
///
/// Not `Send`: the saved interrupt flag belongs to the CPU that took the lock.
pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
    ticket: usize,
    irq_was_enabled: bool,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.unlock(self.ticket);
        if self.irq_was_enabled {
            arch::set_interrupts(true);
        }
    }
}
