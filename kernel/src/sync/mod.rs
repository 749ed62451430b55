/*
 * Kernel Lock Primitives
 *
 * Two locks that the scheduler's own critical sections are built on. Neither
 * depends on the scheduler being initialized:
 *
 * - TicketLock / TicketMutex: FIFO-fair spin lock with `next_ticket` and
 *   `serving_ticket` counters. Used where sleeping is not legal, e.g. to
 *   serialize a CPU's dispatch path.
 * - IrqLock: saves the local interrupt flag, disables interrupts, then takes a
 *   ticket lock. Restores the saved flag on release. Any lock reachable from an
 *   interrupt handler must be an IrqLock, otherwise a handler can spin forever
 *   on a lock its own CPU already holds.
 */

pub mod irq_lock;
pub mod ticket;

pub use irq_lock::{IrqLock, IrqLockGuard};
pub use ticket::{TicketLock, TicketMutex, TicketMutexGuard};
