/*
 * Scheduler Core - Dispatch and Queue Mechanism
 *
 * The `Scheduler` object owns every CPU's state, the process registry and
 * the kernel process. All scheduling entry points funnel into a handful of
 * operations here:
 *
 * - `schedule`: the dispatch algorithm, run on a CPU with its trapped frame
 * - `enqueue` / `dequeue` / `block` / `unblock`: queue membership
 * - `wake_up` / `reschedule`: cross-CPU and timer-driven dispatch requests
 *
 * DISPATCH ALGORITHM:
 * ===================
 *
 * 1. Expire wait timeouts that are due (may make threads ready on any CPU)
 * 2. Save the outgoing thread: trapped frame, then FPU and segment bases
 *    through the architecture hook (skipped for the idle thread)
 * 3. Put it back at the tail of the ready queue if it was still running;
 *    blocked threads stay off the queue, killed ones go to the graveyard
 * 4. Pop ready threads until one can run; fall back to the idle thread
 * 5. Load its frame into the trap frame, run the architecture load hook
 *    (FPU, segment bases, kernel and page-fault stack tops), switch the
 *    address space if the process changed
 * 6. Arm the one-shot timer for the next quantum
 *
 * Threads sent to the graveyard in one dispatch have their stacks freed in
 * the next dispatch on that CPU: the outgoing thread's kernel stack is the
 * stack this code is running on.
 */

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::Ordering;

use super::SchedConfig;
use super::lifecycle::ThreadEntry;
use super::percpu::{CpuQueue, CpuStatsSnapshot, PerCpu};
use super::process::{Process, ProcessRegistry};
use super::thread::Thread;
use super::types::{CpuId, ProcessId, SchedError, ThreadFlags, ThreadStatus};
use crate::arch::{Arch, IpiTarget, TrapFrame};
use crate::memory::{AddressSpace, StackAllocator};
use crate::sync::IrqLock;

/// A pending wait deadline
struct Timeout {
    deadline_ns: u64,
    thread: Arc<Thread>,
}

/// The SMP scheduler
pub struct Scheduler {
    pub(crate) arch: &'static dyn Arch,
    pub(crate) stacks: &'static dyn StackAllocator,
    pub(crate) config: SchedConfig,
    pub(crate) cpus: Box<[PerCpu]>,
    pub(crate) registry: ProcessRegistry,
    pub(crate) kernel_process: Arc<Process>,
    timeouts: IrqLock<Vec<Timeout>>,
    vector: u8,
}

impl Scheduler {
    /// Build the scheduler: kernel process, one idle thread per CPU, dispatch vector
    ///
    /// # Arguments
    /// * `arch` - Installed architecture backend
    /// * `stacks` - Kernel stack allocator
    /// * `kernel_space` - Address space of the kernel process (PID 0)
    /// * `config` - Tunables
    pub fn new(
        arch: &'static dyn Arch,
        stacks: &'static dyn StackAllocator,
        kernel_space: Box<dyn AddressSpace>,
        config: SchedConfig,
    ) -> Result<Self, SchedError> {
        let config = config.sanitized();
        let cpu_count = arch.cpu_count().max(1);
        let registry = ProcessRegistry::new(config.max_pid);
        let kernel_process = registry.create("kernel", kernel_space)?;
        debug_assert_eq!(kernel_process.id(), ProcessId::KERNEL);

        let vector = match arch.install_dispatch_vector(config.vector_hint) {
            Some(vector) => vector,
            None => {
                log::warn!(
                    "scheduler: no dispatch vector routed, assuming {:#x}",
                    config.vector_hint
                );
                config.vector_hint
            }
        };

        let cpus = (0..cpu_count)
            .map(|i| PerCpu::new(CpuId(i as u32)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let sched = Self {
            arch,
            stacks,
            config,
            cpus,
            registry,
            kernel_process,
            timeouts: IrqLock::new(Vec::new()),
            vector,
        };

        for cpu in sched.cpus.iter() {
            let idle = sched.build_thread(
                &sched.kernel_process,
                "idle",
                super::idle_main as usize,
                ThreadEntry::Kernel { arg: cpu.id.as_usize() },
                cpu.id,
                ThreadFlags::IDLE,
            )?;
            cpu.queue.lock().idle = Some(idle);
        }

        log::info!(
            "scheduler: {} on {} cpu(s), dispatch vector {:#x}, quantum {} ms",
            arch.name(),
            cpu_count,
            vector,
            sched.config.quantum_ms
        );
        Ok(sched)
    }

    pub fn arch(&self) -> &'static dyn Arch {
        self.arch
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Vector that enters dispatch (timer, IPIs, explicit yield)
    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn kernel_process(&self) -> &Arc<Process> {
        &self.kernel_process
    }

    pub(crate) fn cpu(&self, id: CpuId) -> &PerCpu {
        match self.cpus.get(id.as_usize()) {
            Some(cpu) => cpu,
            None => self.fatal(format_args!("no such cpu {}", id)),
        }
    }

    /// Halt the machine on a broken scheduler invariant
    pub(crate) fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        self.arch.halt_others();
        log::error!("scheduler: fatal: {}", args);
        panic!("scheduler: {}", args)
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// Thread currently running on `cpu`
    pub fn current(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.cpu(cpu).queue.lock().running.clone()
    }

    /// Thread running on the executing CPU
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current(self.arch.current_cpu())
    }

    /// Like `current`, but gives up instead of spinning if the queue is locked
    ///
    /// For diagnostics that may run inside the dispatch critical section.
    pub fn try_current(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.cpus
            .get(cpu.as_usize())?
            .queue
            .try_lock()?
            .running
            .clone()
    }

    pub fn idle_thread(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.cpu(cpu).queue.lock().idle.clone()
    }

    /// Number of threads in `cpu`'s ready queue
    pub fn queue_len(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).queued_len()
    }

    /// Whether `thread` currently sits in `cpu`'s ready queue
    pub fn is_queued_on(&self, cpu: CpuId, thread: &Arc<Thread>) -> bool {
        self.cpu(cpu)
            .queue
            .lock()
            .ready
            .iter()
            .any(|t| Arc::ptr_eq(t, thread))
    }

    pub fn stats(&self, cpu: CpuId) -> CpuStatsSnapshot {
        self.cpu(cpu).stats.snapshot()
    }

    /// CPU with the fewest queued threads (lowest index on ties)
    pub(crate) fn pick_cpu(&self) -> CpuId {
        self.cpus
            .iter()
            .min_by_key(|cpu| cpu.queued_len())
            .map(|cpu| cpu.id)
            .unwrap_or(CpuId::BSP)
    }

    // ========================================================================
    // QUEUE OPERATIONS
    // ========================================================================

    /// Make a thread eligible to run on its assigned CPU
    ///
    /// A running thread is downgraded to ready first. Returns false if the
    /// thread is already queued or blocked.
    pub fn enqueue(&self, thread: &Arc<Thread>) -> bool {
        if thread.is_idle() {
            return false;
        }
        let cpu_id = thread.last_cpu();
        let cpu = self.cpu(cpu_id);
        let (pushed, idle_running) = {
            let mut queue = cpu.queue.lock();
            thread.transition(ThreadStatus::Running, ThreadStatus::Ready);
            match thread.status() {
                ThreadStatus::Ready | ThreadStatus::Killed => {}
                status => {
                    log::warn!(
                        "scheduler: enqueue of {} in {:?} state ignored",
                        thread.id(),
                        status
                    );
                    return false;
                }
            }
            (queue.push(thread.clone(), &cpu.queued), queue.running_idle())
        };
        if pushed && idle_running {
            self.kick_remote(cpu_id);
        }
        pushed
    }

    /// Take a thread off the ready queue and mark it blocked
    ///
    /// Does not switch away; see `block`.
    pub fn dequeue(&self, thread: &Arc<Thread>) -> bool {
        if thread.is_idle() {
            return false;
        }
        let cpu = self.cpu(thread.last_cpu());
        let mut queue = cpu.queue.lock();
        queue.remove(thread, &cpu.queued);
        thread.transition(ThreadStatus::Ready, ThreadStatus::Blocked)
            || thread.transition(ThreadStatus::Running, ThreadStatus::Blocked)
    }

    /// Block a thread and make sure it stops running
    pub fn block(&self, thread: &Arc<Thread>) -> bool {
        if !self.dequeue(thread) {
            return false;
        }
        let cpu_id = thread.last_cpu();
        let running_there = self.cpu(cpu_id).queue.lock().is_running(thread);
        if running_there {
            self.wake_up(cpu_id, false);
        }
        true
    }

    /// Move a blocked thread back to its CPU's ready queue
    ///
    /// A no-op (returning false) for threads that are not blocked, which is
    /// what makes a wake-up racing a timeout harmless.
    pub fn unblock(&self, thread: &Arc<Thread>) -> bool {
        let cpu_id = thread.last_cpu();
        let cpu = self.cpu(cpu_id);
        let idle_running = {
            let mut queue = cpu.queue.lock();
            if !thread.transition(ThreadStatus::Blocked, ThreadStatus::Ready) {
                return false;
            }
            queue.push(thread.clone(), &cpu.queued);
            queue.running_idle()
        };
        log::debug!("scheduler: {} of {} ready on {}", thread.id(), thread.pid(), cpu_id);
        if idle_running {
            self.kick_remote(cpu_id);
        }
        true
    }

    /// IPI `cpu` if it is not the executing CPU
    fn kick_remote(&self, cpu: CpuId) {
        if cpu != self.arch.current_cpu() {
            self.wake_up(cpu, false);
        }
    }

    // ========================================================================
    // CROSS-CPU SIGNALING
    // ========================================================================

    /// Force a dispatch on `cpu`, or on every other CPU if `everyone`
    pub fn wake_up(&self, cpu: CpuId, everyone: bool) {
        if everyone {
            self.arch.send_ipi(IpiTarget::AllButSelf, self.vector);
        } else if cpu == self.arch.current_cpu() {
            self.arch.request_dispatch(self.vector);
        } else {
            self.arch.send_ipi(IpiTarget::Cpu(cpu), self.vector);
        }
    }

    /// Dispatch on the executing CPU after `ns`, or right now if zero
    pub fn reschedule(&self, ns: u64) {
        if ns == 0 {
            self.arch.request_dispatch(self.vector);
        } else {
            self.arch
                .arm_timer(self.arch.current_cpu(), ns, self.vector);
        }
    }

    /// Give up the rest of the timeslice
    pub fn yield_now(&self) {
        self.arch.request_dispatch(self.vector);
    }

    // ========================================================================
    // TIMEOUTS
    // ========================================================================

    pub(crate) fn register_timeout(&self, thread: &Arc<Thread>, deadline_ns: u64) {
        self.timeouts.lock().push(Timeout {
            deadline_ns,
            thread: thread.clone(),
        });
    }

    pub(crate) fn cancel_timeout(&self, thread: &Arc<Thread>) {
        self.timeouts
            .lock()
            .retain(|timeout| !Arc::ptr_eq(&timeout.thread, thread));
    }

    pub(crate) fn has_timeout(&self, thread: &Arc<Thread>) -> bool {
        self.timeouts
            .lock()
            .iter()
            .any(|timeout| Arc::ptr_eq(&timeout.thread, thread))
    }

    /// Resolve every wait whose deadline is at or before `now_ns`
    ///
    /// A waiter that was already claimed by a trigger is left alone.
    pub fn expire_timeouts(&self, now_ns: u64) -> usize {
        let expired: Vec<Arc<Thread>> = {
            let mut timeouts = self.timeouts.lock();
            let mut expired = Vec::new();
            timeouts.retain(|timeout| {
                if timeout.deadline_ns <= now_ns {
                    expired.push(timeout.thread.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };

        let mut woken = 0;
        for thread in expired {
            if thread.wait.claim_timeout() {
                log::debug!("scheduler: wait of {} timed out", thread.id());
                self.detach_events(&thread);
                self.unblock(&thread);
                woken += 1;
            }
        }
        woken
    }

    fn next_deadline(&self) -> Option<u64> {
        self.timeouts
            .lock()
            .iter()
            .map(|timeout| timeout.deadline_ns)
            .min()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Run the dispatch algorithm on `cpu` against its trapped register frame
    ///
    /// On return `frame` holds the context of the thread to resume, which is
    /// also returned.
    pub fn schedule(&self, cpu_id: CpuId, frame: &mut TrapFrame) -> Arc<Thread> {
        let cpu = self.cpu(cpu_id);
        let now = self.arch.now_ns();
        self.expire_timeouts(now);

        let mut graveyard = cpu.dispatch.lock();
        let reclaimable = core::mem::take(&mut *graveyard);

        let (next, switched) = {
            let mut queue = cpu.queue.lock();
            let outgoing = queue.running.take();

            if let Some(out) = outgoing.as_ref() {
                self.save_outgoing(out, frame);

                if out.is_idle() {
                    out.transition(ThreadStatus::Running, ThreadStatus::Ready);
                } else if out.transition(ThreadStatus::Running, ThreadStatus::Ready) {
                    queue.push(out.clone(), &cpu.queued);
                } else if out.status() == ThreadStatus::Killed && !out.is_queued() {
                    graveyard.push(out.clone());
                }
            }

            let next = self.next_thread(cpu, &mut queue, &mut graveyard);
            next.set_last_cpu(cpu_id);
            queue.running = Some(next.clone());
            self.load_incoming(cpu_id, &next, frame);

            let switched = outgoing.as_ref().is_none_or(|out| !Arc::ptr_eq(out, &next));
            (next, switched)
        };

        cpu.stats.record(switched, next.is_idle());
        self.switch_address_space(cpu, &next);
        self.arm_quantum(cpu_id, now);

        for thread in reclaimable {
            log::debug!("scheduler: reclaiming {} of {}", thread.id(), thread.pid());
            thread.release_resources();
        }
        drop(graveyard);

        next
    }

    /// Pop the first runnable thread of `cpu`'s queue, or its idle thread
    ///
    /// Killed threads met on the way go to the graveyard.
    fn next_thread(
        &self,
        cpu: &PerCpu,
        queue: &mut CpuQueue,
        graveyard: &mut Vec<Arc<Thread>>,
    ) -> Arc<Thread> {
        while let Some(thread) = queue.pop(&cpu.queued) {
            if thread.transition(ThreadStatus::Ready, ThreadStatus::Running) {
                return thread;
            }
            if thread.status() == ThreadStatus::Killed {
                graveyard.push(thread);
            } else {
                log::warn!(
                    "scheduler: dropping {} in {:?} state from {} queue",
                    thread.id(),
                    thread.status(),
                    cpu.id
                );
            }
        }

        let Some(idle) = queue.idle.clone() else {
            self.fatal(format_args!("{} has no idle thread", cpu.id));
        };
        if !idle.transition(ThreadStatus::Ready, ThreadStatus::Running) {
            self.fatal(format_args!(
                "{} idle thread in {:?} state",
                cpu.id,
                idle.status()
            ));
        }
        idle
    }

    fn save_outgoing(&self, thread: &Arc<Thread>, frame: &TrapFrame) {
        if frame.is_user() {
            thread.insert_flags(ThreadFlags::USER_TOUCHED);
        }
        let user = thread.flags().contains(ThreadFlags::USER_TOUCHED);
        let mut context = thread.context.lock();
        context.frame = *frame;
        if !thread.is_idle() {
            let context = &mut *context;
            if let Some(fpu) = context.fpu.as_mut() {
                self.arch
                    .save_extended(fpu.as_mut_slice(), &mut context.bases, user);
            }
        }
    }

    fn load_incoming(&self, cpu_id: CpuId, thread: &Arc<Thread>, frame: &mut TrapFrame) {
        let stacks = thread.stack_tops();
        let user = thread.flags().contains(ThreadFlags::USER_TOUCHED)
            || thread.flags().contains(ThreadFlags::USER);
        let context = thread.context.lock();
        *frame = context.frame;
        let fpu = if thread.is_idle() {
            None
        } else {
            context.fpu.as_ref().map(|area| area.as_slice())
        };
        self.arch
            .load_extended(cpu_id, fpu, &context.bases, stacks, user);
    }

    fn switch_address_space(&self, cpu: &PerCpu, thread: &Arc<Thread>) {
        let process = thread
            .process()
            .unwrap_or_else(|| self.kernel_process.clone());
        let serial = process.serial();
        if cpu.loaded_space.swap(serial, Ordering::AcqRel) == serial {
            return;
        }
        process.address_space().load(process.is_kernel());
    }

    fn arm_quantum(&self, cpu_id: CpuId, now: u64) {
        let quantum = self.config.quantum_ns();
        let slice = match self.next_deadline() {
            Some(deadline) => quantum.min(deadline.saturating_sub(now).max(1)),
            None => quantum,
        };
        self.arch.arm_timer(cpu_id, slice, self.vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRig;

    #[test]
    fn test_fifo_then_idle() {
        let rig = TestRig::new(1);
        let cpu = CpuId(0);
        let threads: Vec<_> = (0..4)
            .map(|i| rig.spawn_kernel_thread("worker", ThreadEntry::Kernel { arg: i }))
            .collect();
        for thread in &threads {
            assert!(rig.sched.enqueue(thread));
        }

        let mut frame = TrapFrame::default();
        for expected in &threads {
            let next = rig.sched.schedule(cpu, &mut frame);
            assert!(Arc::ptr_eq(&next, expected));
            // Keep it off the queue so only the original order is observed.
            assert!(rig.sched.block(&next));
        }
        let next = rig.sched.schedule(cpu, &mut frame);
        assert!(next.is_idle());
        assert_eq!(rig.sched.stats(cpu).idle_dispatches, 1);
    }

    #[test]
    fn test_dispatch_loads_entry_point() {
        extern "C" fn entry() {}

        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        let thread = rig
            .sched
            .create_thread(&process, "main", entry as usize, ThreadEntry::Kernel { arg: 7 })
            .expect("thread");
        assert!(rig.sched.enqueue(&thread));

        let mut frame = TrapFrame::default();
        let next = rig.sched.schedule(CpuId(0), &mut frame);
        assert!(Arc::ptr_eq(&next, &thread));
        assert_eq!(frame.ip(), entry as usize);
        assert_eq!(frame.arg(0), Some(7));
        assert_eq!(thread.status(), ThreadStatus::Running);
        assert_eq!(rig.arch.timers().last().map(|t| t.0), Some(CpuId(0)));
        assert_eq!(rig.arch.loaded_extended(), 1);
    }

    #[test]
    fn test_preempted_thread_goes_to_tail() {
        let rig = TestRig::new(1);
        let a = rig.spawn_kernel_thread("a", ThreadEntry::Kernel { arg: 0 });
        let b = rig.spawn_kernel_thread("b", ThreadEntry::Kernel { arg: 0 });
        rig.sched.enqueue(&a);
        rig.sched.enqueue(&b);

        let mut frame = TrapFrame::default();
        let first = rig.sched.schedule(CpuId(0), &mut frame);
        frame.set_ip(0x1234);
        let second = rig.sched.schedule(CpuId(0), &mut frame);
        let third = rig.sched.schedule(CpuId(0), &mut frame);

        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &b));
        assert!(Arc::ptr_eq(&third, &a));
        assert_eq!(frame.ip(), 0x1234);
        assert_eq!(a.status(), ThreadStatus::Running);
        assert_eq!(b.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_one_running_thread_per_cpu() {
        let rig = TestRig::new(2);
        let threads: Vec<_> = (0..6)
            .map(|i| {
                let thread = rig.spawn_kernel_thread("t", ThreadEntry::Kernel { arg: i });
                rig.sched.enqueue(&thread);
                thread
            })
            .collect();
        // Shortest-queue placement alternates between the two CPUs.
        assert_eq!(rig.sched.queue_len(CpuId(0)), 3);
        assert_eq!(rig.sched.queue_len(CpuId(1)), 3);

        let mut frames = [TrapFrame::default(), TrapFrame::default()];
        for round in 0..10 {
            let cpu = CpuId(round % 2);
            rig.sched.schedule(cpu, &mut frames[cpu.as_usize()]);
            for id in [CpuId(0), CpuId(1)] {
                let running = threads
                    .iter()
                    .filter(|t| t.status() == ThreadStatus::Running && t.last_cpu() == id)
                    .count();
                assert!(running <= 1);
                for thread in &threads {
                    if thread.status() == ThreadStatus::Running {
                        assert!(!rig.sched.is_queued_on(id, thread));
                    }
                }
            }
        }
    }

    #[test]
    fn test_address_space_switch_on_process_change() {
        let rig = TestRig::new(1);
        let (p1, s1) = rig.new_process_with_space("p1");
        let (p2, s2) = rig.new_process_with_space("p2");
        let t1 = rig
            .sched
            .create_thread(&p1, "t1", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("t1");
        let t2 = rig
            .sched
            .create_thread(&p1, "t2", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("t2");
        let t3 = rig
            .sched
            .create_thread(&p2, "t3", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("t3");
        for t in [&t1, &t2, &t3] {
            rig.sched.enqueue(t);
        }

        let mut frame = TrapFrame::default();
        rig.sched.schedule(CpuId(0), &mut frame);
        rig.sched.schedule(CpuId(0), &mut frame);
        assert_eq!(s1.loads(), 1);
        rig.sched.schedule(CpuId(0), &mut frame);
        assert_eq!(s2.loads(), 1);
    }

    #[test]
    fn test_reused_pid_still_switches_address_space() {
        let rig = TestRig::new(1);
        let (old, old_space) = rig.new_process_with_space("old");
        let old_thread = rig
            .sched
            .create_thread(&old, "t", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("old thread");
        rig.sched.enqueue(&old_thread);

        let mut frame = TrapFrame::default();
        assert!(Arc::ptr_eq(&rig.sched.schedule(CpuId(0), &mut frame), &old_thread));
        assert_eq!(old_space.loads(), 1);

        // Exit and reap while the old thread is still the outgoing one here.
        let pid = old.id();
        rig.sched.pexit(&old, 0);
        assert_eq!(
            rig.sched.try_reap(rig.sched.kernel_process(), Some(pid)),
            Ok((pid, 0))
        );

        let (new, new_space) = rig.new_process_with_space("new");
        assert_eq!(new.id(), pid);
        let new_thread = rig
            .sched
            .create_thread(&new, "t", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("new thread");
        rig.sched.enqueue(&new_thread);

        assert!(Arc::ptr_eq(&rig.sched.schedule(CpuId(0), &mut frame), &new_thread));
        assert_eq!(new_space.loads(), 1);
    }

    #[test]
    fn test_user_frame_marks_thread_touched() {
        let rig = TestRig::new(1);
        let process = rig.new_process("user");
        let thread = rig
            .sched
            .create_thread(
                &process,
                "main",
                0x40_0000,
                ThreadEntry::User {
                    stack_top: 0x7fff_0000,
                    argv: 1,
                    envp: 2,
                    auxv: 3,
                },
            )
            .expect("thread");
        rig.sched.enqueue(&thread);

        let mut frame = TrapFrame::default();
        rig.sched.schedule(CpuId(0), &mut frame);
        assert!(frame.is_user());
        assert!(!thread.flags().contains(ThreadFlags::USER_TOUCHED));

        rig.sched.schedule(CpuId(0), &mut frame);
        assert!(thread.flags().contains(ThreadFlags::USER_TOUCHED));
        assert!(rig.arch.saved_extended() >= 1);
    }

    #[test]
    fn test_enqueue_twice_is_rejected() {
        let rig = TestRig::new(1);
        let thread = rig.spawn_kernel_thread("t", ThreadEntry::Kernel { arg: 0 });
        assert!(rig.sched.enqueue(&thread));
        assert!(!rig.sched.enqueue(&thread));
        assert_eq!(rig.sched.queue_len(CpuId(0)), 1);
    }

    #[test]
    fn test_unblock_onto_idle_remote_cpu_sends_ipi() {
        let rig = TestRig::new(2);
        let mut frames = [TrapFrame::default(), TrapFrame::default()];
        rig.sched.schedule(CpuId(1), &mut frames[1]);

        let thread = rig.spawn_kernel_thread("t", ThreadEntry::Kernel { arg: 0 });
        thread.set_last_cpu(CpuId(1));
        assert!(rig.sched.dequeue(&thread));
        assert_eq!(thread.status(), ThreadStatus::Blocked);

        rig.arch.set_current_cpu(CpuId(0));
        assert!(rig.sched.unblock(&thread));
        assert_eq!(thread.status(), ThreadStatus::Ready);
        assert!(rig.sched.is_queued_on(CpuId(1), &thread));
        assert!(
            rig.arch
                .ipis()
                .contains(&(IpiTarget::Cpu(CpuId(1)), rig.sched.vector()))
        );
        assert!(!rig.sched.unblock(&thread));
    }

    #[test]
    fn test_quantum_shortened_by_nearby_deadline() {
        let rig = TestRig::new(1);
        let thread = rig.running_kernel_thread(0);
        rig.sched.register_timeout(&thread, 2_000_000);
        let mut frame = TrapFrame::default();
        rig.sched.schedule(CpuId(0), &mut frame);
        let (_, ns) = *rig.arch.timers().last().expect("timer armed");
        assert_eq!(ns, 2_000_000);
    }
}
