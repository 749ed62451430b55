/*
 * Preemptive SMP Scheduler
 *
 * This module implements the multiprocessor scheduler of the CLUU kernel.
 * Every CPU runs the same dispatch logic against its own FIFO ready queue;
 * there is no scheduler thread and no global run queue.
 *
 * PREEMPTIVE SCHEDULING:
 * ======================
 *
 * Each CPU arms a one-shot timer for one quantum (10 ms by default). When it
 * fires, the dispatch vector traps into `dispatch_from_trap`, which saves the
 * outgoing thread, picks the next one and returns into it. Voluntary yields,
 * blocking waits and cross-CPU wake-ups raise the very same vector, so there
 * is exactly one context switch path.
 *
 * THREAD LIFECYCLE:
 * =================
 *
 *   created --enqueue--> Ready --dispatch--> Running --preempt--> Ready
 *                          ^                    |
 *                          |                    +--wait--> Blocked
 *                          +------trigger/timeout-------------+
 *
 *   any state --exit/kill--> Killed --(two dispatches later)--> freed
 *
 * BLOCKING:
 * =========
 *
 * Threads block only on `Event`s (see event.rs). `block` / `unblock` are the
 * low-level primitives Event is built on, exported for collaborators with
 * their own wait conditions.
 *
 * INITIALIZATION:
 * ===============
 *
 * `init` installs the architecture backend and builds the global scheduler
 * (kernel process PID 0 plus one idle thread per CPU). Each CPU then calls
 * `start` to enter its first dispatch.
 */

pub mod event;
pub mod lifecycle;
pub mod percpu;
pub mod process;
pub mod sched_core;
pub mod thread;
pub mod types;
pub mod wait;

use alloc::{boxed::Box, string::String, sync::Arc};
use core::time::Duration;

use spin::Once;

use crate::arch::{self, Arch, TrapFrame};
use crate::memory::{AddressSpace, StackAllocator};

pub use event::Event;
pub use lifecycle::ThreadEntry;
pub use percpu::{CpuStats, CpuStatsSnapshot};
pub use process::{Process, ProcessRegistry, ProcessState};
pub use sched_core::Scheduler;
pub use thread::{MAX_WAIT_EVENTS, Thread};
pub use types::{CpuId, ProcessId, SchedError, ThreadFlags, ThreadId, ThreadStatus, WaitResult};

/// Scheduler tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Preemption quantum in milliseconds
    pub quantum_ms: u64,
    /// Kernel stack size per thread
    pub kernel_stack_size: usize,
    /// Page-fault stack size per thread
    pub page_fault_stack_size: usize,
    /// Highest process ID handed out
    pub max_pid: usize,
    /// Preferred vector for the dispatch trap
    pub vector_hint: u8,
    /// Most events a single wait may listen on (at most `MAX_WAIT_EVENTS`)
    pub max_wait_events: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            quantum_ms: 10,
            kernel_stack_size: 64 * 1024,
            page_fault_stack_size: 16 * 1024,
            max_pid: 32768,
            vector_hint: 0x81,
            max_wait_events: MAX_WAIT_EVENTS,
        }
    }
}

impl SchedConfig {
    /// Clamp fields to what the implementation supports
    pub fn sanitized(mut self) -> Self {
        self.quantum_ms = self.quantum_ms.max(1);
        self.max_wait_events = self.max_wait_events.clamp(1, MAX_WAIT_EVENTS);
        self
    }

    pub fn quantum_ns(&self) -> u64 {
        self.quantum_ms.saturating_mul(1_000_000)
    }
}

/// Global scheduler instance
static SCHEDULER: Once<Scheduler> = Once::new();

/// Install the architecture backend and build the global scheduler
///
/// Must run once on the bootstrap processor before any other CPU calls
/// `start`. A second call returns the existing instance.
pub fn init(
    arch: &'static dyn Arch,
    stacks: &'static dyn StackAllocator,
    kernel_space: Box<dyn AddressSpace>,
    config: SchedConfig,
) -> Result<&'static Scheduler, SchedError> {
    if let Some(sched) = SCHEDULER.get() {
        log::warn!("scheduler: already initialized");
        return Ok(sched);
    }
    let arch = arch::install(arch);
    let sched = Scheduler::new(arch, stacks, kernel_space, config)?;
    Ok(SCHEDULER.call_once(|| sched))
}

pub fn try_get() -> Option<&'static Scheduler> {
    SCHEDULER.get()
}

/// The global scheduler
///
/// # Panics
/// Panics if `init` has not run.
pub fn get() -> &'static Scheduler {
    match SCHEDULER.get() {
        Some(sched) => sched,
        None => {
            arch::halt_others();
            panic!("scheduler used before init")
        }
    }
}

/// Body of every CPU's idle thread
pub extern "C" fn idle_main(cpu: usize) -> ! {
    log::debug!("scheduler: idle thread of cpu{} running", cpu);
    let arch = arch::get();
    loop {
        arch.halt();
    }
}

/// Dispatch entry, called by the architecture trap stub with the trapped frame
pub fn dispatch_from_trap(frame: &mut TrapFrame) {
    let Some(sched) = try_get() else {
        return;
    };
    if !sched.arch.acknowledge() {
        return;
    }
    let cpu = sched.arch.current_cpu();
    sched.schedule(cpu, frame);
    sched.arch.eoi(sched.vector());
}

/// Enter the scheduler on the executing CPU; never returns
pub fn start() -> ! {
    let sched = get();
    let cpu = sched.arch.current_cpu();
    log::info!("scheduler: starting on {}", cpu);
    sched.arch.set_interrupts(true);
    sched.reschedule(0);
    idle_main(cpu.as_usize())
}

// ============================================================================
// GLOBAL API
// ============================================================================

/// Give up the rest of the current timeslice
pub fn yield_now() {
    get().yield_now();
}

/// Block the current thread; it runs again only after `unblock`
pub fn block() -> bool {
    let sched = get();
    match sched.current_thread() {
        Some(thread) if !thread.is_idle() => sched.block(&thread),
        _ => false,
    }
}

pub fn block_thread(thread: &Arc<Thread>) -> bool {
    get().block(thread)
}

pub fn unblock(thread: &Arc<Thread>) -> bool {
    get().unblock(thread)
}

pub fn enqueue(thread: &Arc<Thread>) -> bool {
    get().enqueue(thread)
}

/// Take the current thread off its ready queue without switching away
pub fn dequeue() -> bool {
    let sched = get();
    match sched.current_thread() {
        Some(thread) => sched.dequeue(&thread),
        None => false,
    }
}

pub fn dequeue_thread(thread: &Arc<Thread>) -> bool {
    get().dequeue(thread)
}

/// Terminate the current thread
pub fn exit() {
    let sched = get();
    if let Some(thread) = sched.current_thread() {
        sched.exit_thread(&thread);
    }
}

pub fn exit_thread(thread: &Arc<Thread>) {
    get().exit_thread(thread);
}

/// Terminate the current process with `code`
pub fn pexit(code: i32) {
    let sched = get();
    if let Some(process) = sched.current_thread().and_then(|thread| thread.process()) {
        sched.pexit(&process, code);
    }
}

pub fn pexit_process(process: &Arc<Process>, code: i32) {
    get().pexit(process, code);
}

/// IDs of the current process and thread
pub fn pid() -> Option<(ProcessId, ThreadId)> {
    try_get()?
        .current_thread()
        .map(|thread| (thread.pid(), thread.id()))
}

/// Name, process ID and thread ID of the current thread
pub fn pid_name() -> Option<(String, ProcessId, ThreadId)> {
    try_get()?
        .current_thread()
        .map(|thread| (String::from(thread.name()), thread.pid(), thread.id()))
}

pub fn current_thread() -> Option<Arc<Thread>> {
    try_get()?.current_thread()
}

pub fn sleep(duration: Duration) -> Result<(), SchedError> {
    get().sleep(duration)
}

pub fn wake_up(cpu: CpuId, everyone: bool) {
    get().wake_up(cpu, everyone);
}

/// Re-arm the local preemption timer for `ms`, or dispatch now if zero
pub fn reschedule(ms: u64) {
    get().reschedule(ms.saturating_mul(1_000_000));
}

/// Stop all other CPUs (fatal error path)
pub fn halt_others() {
    arch::halt_others();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedConfig::default();
        assert_eq!(config.quantum_ns(), 10_000_000);
        assert_eq!(config.kernel_stack_size, 64 * 1024);
        assert_eq!(config.vector_hint, 0x81);
    }

    #[test]
    fn test_config_sanitized() {
        let config = SchedConfig {
            quantum_ms: 0,
            max_wait_events: 64,
            ..SchedConfig::default()
        }
        .sanitized();
        assert_eq!(config.quantum_ms, 1);
        assert_eq!(config.max_wait_events, MAX_WAIT_EVENTS);

        let config = SchedConfig {
            max_wait_events: 0,
            ..SchedConfig::default()
        }
        .sanitized();
        assert_eq!(config.max_wait_events, 1);
    }

    #[test]
    fn test_global_api() {
        use crate::testing::{HeapStacks, MockSpace, install_global_arch};

        let mock = install_global_arch();
        let stacks = HeapStacks::leaked();
        let sched = init(mock, stacks, Box::new(MockSpace::default()), SchedConfig::default())
            .expect("init");
        assert!(core::ptr::eq(sched, get()));
        let again = init(mock, stacks, Box::new(MockSpace::default()), SchedConfig::default())
            .expect("init");
        assert!(core::ptr::eq(sched, again));
        assert_eq!(pid(), None);

        let process = sched
            .create_process(None, "init", Box::new(MockSpace::default()))
            .expect("process");
        let thread = sched
            .create_thread(&process, "main", 0x1000, ThreadEntry::Kernel { arg: 3 })
            .expect("thread");
        assert!(enqueue(&thread));

        // A spurious interrupt leaves the frame alone.
        let mut frame = TrapFrame::default();
        mock.set_spurious(true);
        dispatch_from_trap(&mut frame);
        mock.set_spurious(false);
        assert_eq!(frame, TrapFrame::default());
        assert_eq!(pid(), None);

        dispatch_from_trap(&mut frame);
        assert_eq!(frame.ip(), 0x1000);
        assert_eq!(frame.arg(0), Some(3));
        assert_eq!(pid(), Some((process.id(), thread.id())));
        assert_eq!(
            pid_name(),
            Some((String::from("main"), process.id(), thread.id()))
        );
        assert!(current_thread().is_some_and(|current| Arc::ptr_eq(&current, &thread)));

        exit();
        assert!(process.is_zombie());
        dispatch_from_trap(&mut frame);
        assert!(current_thread().is_some_and(|current| current.is_idle()));
        assert_eq!(
            sched.try_reap(sched.kernel_process(), Some(process.id())),
            Ok((process.id(), 0))
        );
    }
}
