/*
 * CLUU SMP Scheduling Core
 *
 * This crate is the multiprocessor scheduler and concurrency core of the CLUU
 * kernel. It owns per-CPU ready queues, the thread/process lifecycle, context
 * switching at trap boundaries, preemption timing, cross-CPU reschedule
 * signaling and the Event blocking primitive used throughout the kernel.
 *
 * Why this is important:
 * - Every other subsystem blocks and wakes through Event
 * - Every hardware trap that can switch threads funnels into one dispatch path
 * - Per-CPU state lets each core schedule independently without a global lock
 *
 * Collaborators the core does not implement itself (memory management, the
 * interrupt controller, architecture bring-up) are consumed through the narrow
 * traits in `arch` and `memory`, injected once at boot via `scheduler::init`.
 *
 * The crate is `no_std`; under `cargo test` it links std so the scheduling
 * logic can be exercised on the host against mock collaborators.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use scheduler::{
    CpuId, Event, Process, ProcessId, SchedConfig, SchedError, Scheduler, Thread, ThreadEntry,
    ThreadId, ThreadStatus, WaitResult,
};
