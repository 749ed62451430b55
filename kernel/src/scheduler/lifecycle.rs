/*
 * Thread and Process Lifecycle
 *
 * Creation, termination and reaping. Termination never frees anything
 * synchronously: a killed thread is left for dispatch to reclaim, and a
 * process becomes a zombie that stays in its parent's zombie set until the
 * parent reaps it. Reaping releases the thread table and returns the ID to
 * the pool.
 *
 * PROCESS LIFECYCLE:
 * ==================
 *
 *   create_process -> Running --(pexit / last thread exits)--> Zombie --(reap)--> gone
 *
 * Children of an exiting process are handed to the kernel process so they
 * keep an owner.
 */

use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};

use super::Scheduler;
use super::process::{Process, ProcessState};
use super::thread::{Thread, ThreadContext, ThreadStacks};
use super::types::{CpuId, ProcessId, SchedError, ThreadFlags, ThreadStatus};
use crate::arch::{EntryMode, SegmentBases, TrapFrame};
use crate::memory::{AddressSpace, FpuArea, KernelStack};

/// How a new thread starts executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEntry {
    /// Kernel mode on the thread's own kernel stack, `arg` in the first
    /// argument register
    Kernel { arg: usize },
    /// User mode on a caller-provided stack, with pointers to the argument,
    /// environment and auxiliary vectors in the first three argument registers
    User {
        stack_top: usize,
        argv: usize,
        envp: usize,
        auxv: usize,
    },
}

impl Scheduler {
    // ========================================================================
    // CREATION
    // ========================================================================

    /// Create a process
    ///
    /// # Arguments
    /// * `parent` - Owning parent; the kernel process if `None`
    /// * `name` - Human-readable name (for debugging)
    /// * `address_space` - The process's page tables
    ///
    /// # Errors
    /// `NoFreePids` when the ID space is exhausted, `NoSuchProcess` if the
    /// parent has already exited.
    pub fn create_process(
        &self,
        parent: Option<&Arc<Process>>,
        name: &str,
        address_space: Box<dyn AddressSpace>,
    ) -> Result<Arc<Process>, SchedError> {
        let parent = parent.unwrap_or(&self.kernel_process).clone();
        let process = self.registry.create(name, address_space)?;
        *process.parent.lock() = Arc::downgrade(&parent);

        let linked = {
            let mut inner = parent.inner.lock();
            if inner.state == ProcessState::Zombie {
                false
            } else {
                inner.children.insert(process.id(), process.clone());
                true
            }
        };
        if !linked {
            self.registry.release(process.id());
            return Err(SchedError::NoSuchProcess);
        }

        log::info!(
            "process: created {} '{}' (parent {})",
            process.id(),
            name,
            parent.id()
        );
        Ok(process)
    }

    /// Create a thread in `process`, assigned to the CPU with the shortest queue
    ///
    /// The thread is linked into the process but not enqueued.
    ///
    /// # Errors
    /// `StackAllocFailed` if a stack or the FPU area cannot be allocated,
    /// `NoSuchProcess` if the process has exited.
    pub fn create_thread(
        &self,
        process: &Arc<Process>,
        name: &str,
        entry_point: usize,
        entry: ThreadEntry,
    ) -> Result<Arc<Thread>, SchedError> {
        let cpu = self.pick_cpu();
        self.build_thread(process, name, entry_point, entry, cpu, ThreadFlags::empty())
    }

    pub(crate) fn build_thread(
        &self,
        process: &Arc<Process>,
        name: &str,
        entry_point: usize,
        entry: ThreadEntry,
        cpu: CpuId,
        mut flags: ThreadFlags,
    ) -> Result<Arc<Thread>, SchedError> {
        if process.is_zombie() {
            return Err(SchedError::NoSuchProcess);
        }

        let kernel_stack = KernelStack::allocate(self.stacks, self.config.kernel_stack_size)
            .ok_or(SchedError::StackAllocFailed)?;
        let page_fault_stack =
            KernelStack::allocate(self.stacks, self.config.page_fault_stack_size)
                .ok_or(SchedError::StackAllocFailed)?;

        let mut fpu = None;
        let fpu_size = self.arch.fpu_area_size();
        if !flags.contains(ThreadFlags::IDLE) && fpu_size > 0 {
            fpu = Some(FpuArea::zeroed(fpu_size).ok_or(SchedError::StackAllocFailed)?);
        }

        let mut frame = TrapFrame::default();
        match entry {
            ThreadEntry::Kernel { arg } => {
                self.arch.prepare_frame(
                    &mut frame,
                    entry_point,
                    kernel_stack.top(),
                    &[arg],
                    EntryMode::Kernel,
                );
            }
            ThreadEntry::User {
                stack_top,
                argv,
                envp,
                auxv,
            } => {
                flags |= ThreadFlags::USER;
                if let Some(area) = fpu.as_mut() {
                    self.arch.init_fpu_area(area.as_mut_slice());
                }
                self.arch.prepare_frame(
                    &mut frame,
                    entry_point,
                    stack_top,
                    &[argv, envp, auxv],
                    EntryMode::User,
                );
            }
        }

        let tid = process.alloc_tid();
        let thread = Arc::new(Thread::new(
            tid,
            String::from(name),
            process,
            cpu,
            flags,
            ThreadContext {
                frame,
                bases: SegmentBases::default(),
                fpu,
            },
            ThreadStacks {
                kernel: kernel_stack,
                page_fault: page_fault_stack,
            },
        ));

        {
            let mut inner = process.inner.lock();
            if inner.state == ProcessState::Zombie {
                return Err(SchedError::NoSuchProcess);
            }
            inner.threads.insert(tid, thread.clone());
        }

        log::debug!(
            "thread: created {} '{}' in {} on {}",
            tid,
            name,
            process.id(),
            cpu
        );
        Ok(thread)
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Mark a thread killed and detach it from everything it waits on
    ///
    /// The thread stops at its next dispatch; its stacks are released by the
    /// dispatch after that. A thread running on another CPU gets an IPI so
    /// this happens promptly.
    pub fn kill_thread(&self, thread: &Arc<Thread>) {
        if thread.is_idle() {
            self.fatal(format_args!("attempt to kill idle thread of {}", thread.last_cpu()));
        }
        if thread.mark_killed() == ThreadStatus::Killed {
            return;
        }

        thread.wait.cancel();
        self.cancel_timeout(thread);
        self.detach_events(thread);

        let cpu_id = thread.last_cpu();
        let cpu = self.cpu(cpu_id);
        let kick = {
            let mut queue = cpu.queue.lock();
            let running = queue.is_running(thread);
            if !running {
                // Off-CPU: park it in its queue so dispatch reclaims it
                queue.push(thread.clone(), &cpu.queued);
            }
            (running || queue.running_idle()) && cpu_id != self.arch.current_cpu()
        };
        if kick {
            self.wake_up(cpu_id, false);
        }
        log::debug!("thread: killed {} of {}", thread.id(), thread.pid());
    }

    /// Terminate a thread; the last thread out terminates its process with code 0
    pub fn exit_thread(&self, thread: &Arc<Thread>) {
        self.kill_thread(thread);

        if let Some(process) = thread.process() {
            let last = {
                let mut inner = process.inner.lock();
                inner.threads.remove(&thread.id());
                inner.threads.is_empty() && inner.state == ProcessState::Running
            };
            if last {
                self.pexit(&process, 0);
            }
        }

        self.leave_if_current(thread);
    }

    /// Terminate a process: kill its threads, hand its children to the
    /// kernel process and move it to its parent's zombie set
    ///
    /// Only the first call has an effect; the exit code is recorded once.
    pub fn pexit(&self, process: &Arc<Process>, code: i32) {
        if process.is_kernel() {
            self.fatal(format_args!("kernel process exited with code {}", code));
        }

        let (threads, children, zombies) = {
            let mut inner = process.inner.lock();
            if inner.state == ProcessState::Zombie {
                return;
            }
            inner.state = ProcessState::Zombie;
            inner.exit_code = Some(code);
            // The thread table stays until the process is reaped.
            let threads: Vec<Arc<Thread>> = inner.threads.values().cloned().collect();
            (
                threads,
                core::mem::take(&mut inner.children),
                core::mem::take(&mut inner.zombies),
            )
        };

        let mut current_killed = None;
        for thread in threads.iter() {
            self.kill_thread(thread);
            if self.is_current(thread) {
                current_killed = Some(thread.clone());
            }
        }

        self.adopt_orphans(children, zombies);
        self.notify_parent(process);

        log::info!("process: {} '{}' exited with code {}", process.id(), process.name(), code);

        if let Some(thread) = current_killed {
            self.leave_if_current(&thread);
        }
    }

    /// Move `process` from its parent's children to its zombies and wake the parent
    fn notify_parent(&self, process: &Arc<Process>) {
        // The parent can change under us if it is exiting concurrently and
        // handing its children to the kernel process; follow it.
        loop {
            let Some(parent) = process.parent() else {
                return;
            };
            let settled = {
                let mut inner = parent.inner.lock();
                if let Some(child) = inner.children.remove(&process.id()) {
                    inner.zombies.insert(process.id(), child);
                    true
                } else {
                    inner.zombies.contains_key(&process.id())
                }
            };
            if settled {
                parent.child_exited.trigger_on(self, false);
                return;
            }
            let moved = process
                .parent()
                .is_some_and(|now| !Arc::ptr_eq(&now, &parent));
            if !moved {
                return;
            }
        }
    }

    /// Re-parent live children and unreaped zombies to the kernel process
    fn adopt_orphans(
        &self,
        children: BTreeMap<ProcessId, Arc<Process>>,
        zombies: BTreeMap<ProcessId, Arc<Process>>,
    ) {
        if children.is_empty() && zombies.is_empty() {
            return;
        }
        let kernel = &self.kernel_process;
        let mut new_zombies = 0;
        {
            let mut inner = kernel.inner.lock();
            for (pid, child) in children.into_iter().chain(zombies) {
                *child.parent.lock() = Arc::downgrade(kernel);
                if child.is_zombie() {
                    inner.zombies.insert(pid, child);
                    new_zombies += 1;
                } else {
                    inner.children.insert(pid, child);
                }
            }
        }
        for _ in 0..new_zombies {
            kernel.child_exited.trigger_on(self, false);
        }
    }

    fn is_current(&self, thread: &Arc<Thread>) -> bool {
        self.current(self.arch.current_cpu())
            .is_some_and(|current| Arc::ptr_eq(&current, thread))
    }

    /// Switch away right now if `thread` is the caller
    fn leave_if_current(&self, thread: &Arc<Thread>) {
        if self.is_current(thread) {
            self.arch.request_dispatch(self.vector());
        }
    }

    // ========================================================================
    // REAPING
    // ========================================================================

    /// Collect the exit code of a zombie child without blocking
    ///
    /// # Arguments
    /// * `parent` - The reaping process
    /// * `pid` - A specific child, or any zombie child if `None`
    ///
    /// # Errors
    /// * `WouldBlock` - the child (or some child) is still running
    /// * `NoChildren` - `parent` has no children at all
    /// * `NotAChild` - `pid` exists but belongs to someone else
    /// * `NoSuchProcess` - `pid` does not exist (or was already reaped)
    pub fn try_reap(
        &self,
        parent: &Arc<Process>,
        pid: Option<ProcessId>,
    ) -> Result<(ProcessId, i32), SchedError> {
        let zombie = {
            let mut inner = parent.inner.lock();
            match pid {
                Some(pid) => match inner.zombies.remove(&pid) {
                    Some(zombie) => zombie,
                    None if inner.children.contains_key(&pid) => {
                        return Err(SchedError::WouldBlock);
                    }
                    None => {
                        drop(inner);
                        return Err(if self.registry.contains(pid) {
                            SchedError::NotAChild
                        } else {
                            SchedError::NoSuchProcess
                        });
                    }
                },
                None => match inner.zombies.pop_first() {
                    Some((_, zombie)) => zombie,
                    None if inner.children.is_empty() => return Err(SchedError::NoChildren),
                    None => return Err(SchedError::WouldBlock),
                },
            }
        };

        let code = zombie.exit_code().unwrap_or(0);
        let threads = core::mem::take(&mut zombie.inner.lock().threads);
        drop(threads);
        self.registry.release(zombie.id());
        log::info!("process: reaped {} with code {}", zombie.id(), code);
        Ok((zombie.id(), code))
    }

    /// Wait for a child to exit and reap it
    pub fn wait_child(
        &self,
        parent: &Arc<Process>,
        pid: Option<ProcessId>,
    ) -> Result<(ProcessId, i32), SchedError> {
        loop {
            match self.try_reap(parent, pid) {
                Err(SchedError::WouldBlock) => {
                    self.wait_events(&[&parent.child_exited], None)?;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::IpiTarget;
    use crate::scheduler::ProcessState;
    use crate::testing::TestRig;

    #[test]
    fn test_create_thread_is_not_enqueued() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        let thread = rig
            .sched
            .create_thread(&process, "t", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("thread");
        assert_eq!(thread.status(), ThreadStatus::Ready);
        assert!(!thread.is_queued());
        assert_eq!(rig.sched.queue_len(CpuId(0)), 0);
        assert_eq!(process.thread_count(), 1);
        assert_eq!(rig.stacks.live(), 2 + 2);
    }

    #[test]
    fn test_user_thread_frame_and_fpu_defaults() {
        let rig = TestRig::new(1);
        let process = rig.new_process("init");
        let thread = rig
            .sched
            .create_thread(
                &process,
                "main",
                0x40_1000,
                ThreadEntry::User {
                    stack_top: 0x7fff_f000,
                    argv: 0x10,
                    envp: 0x20,
                    auxv: 0x30,
                },
            )
            .expect("thread");
        let frame = thread.saved_frame();
        assert!(frame.is_user());
        assert!(frame.interrupts_enabled());
        assert_eq!(frame.ip(), 0x40_1000);
        assert_eq!(frame.sp(), 0x7fff_f000);
        assert_eq!((frame.arg(0), frame.arg(1), frame.arg(2)), (Some(0x10), Some(0x20), Some(0x30)));
        assert!(thread.flags().contains(ThreadFlags::USER));
        assert_eq!(rig.arch.fpu_inits(), 1);
    }

    #[test]
    fn test_stack_exhaustion_is_an_error() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        rig.stacks.fail_after(1);
        let result = rig
            .sched
            .create_thread(&process, "t", 0x1000, ThreadEntry::Kernel { arg: 0 });
        assert_eq!(result.map(|t| t.id()), Err(SchedError::StackAllocFailed));
        assert_eq!(process.thread_count(), 0);
        // The kernel stack that did succeed went back to the allocator.
        assert_eq!(rig.stacks.live(), 2);
    }

    #[test]
    fn test_pid_exhaustion_is_an_error() {
        let rig = TestRig::with_max_pid(1, 2);
        let _a = rig.new_process("a");
        let _b = rig.new_process("b");
        let result = rig.sched.create_process(None, "c", rig.space());
        assert_eq!(result.map(|p| p.id()), Err(SchedError::NoFreePids));
    }

    #[test]
    fn test_killed_thread_is_reclaimed_by_dispatch() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        let thread = rig
            .sched
            .create_thread(&process, "t", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("thread");
        let live_before = rig.stacks.live();

        rig.sched.kill_thread(&thread);
        assert_eq!(thread.status(), ThreadStatus::Killed);
        assert!(thread.is_queued());

        let mut frame = TrapFrame::default();
        let next = rig.sched.schedule(CpuId(0), &mut frame);
        assert!(next.is_idle());
        assert!(thread.has_resources());

        rig.sched.schedule(CpuId(0), &mut frame);
        assert!(!thread.has_resources());
        assert_eq!(rig.stacks.live(), live_before - 2);
    }

    #[test]
    fn test_running_thread_killed_leaves_at_dispatch() {
        let rig = TestRig::new(1);
        let thread = rig.running_kernel_thread(0);
        rig.sched.kill_thread(&thread);
        assert!(!thread.is_queued());

        let mut frame = TrapFrame::default();
        let next = rig.sched.schedule(CpuId(0), &mut frame);
        assert!(next.is_idle());
        assert!(!rig.sched.is_queued_on(CpuId(0), &thread));
        rig.sched.schedule(CpuId(0), &mut frame);
        assert!(!thread.has_resources());
    }

    #[test]
    fn test_kill_remote_running_thread_sends_ipi() {
        let rig = TestRig::new(2);
        let thread = rig.running_kernel_thread(1);
        rig.arch.set_current_cpu(CpuId(0));
        rig.sched.kill_thread(&thread);
        assert!(
            rig.arch
                .ipis()
                .contains(&(IpiTarget::Cpu(CpuId(1)), rig.sched.vector()))
        );
    }

    #[test]
    fn test_exit_of_running_thread_switches_away() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        let thread = rig
            .sched
            .create_thread(&process, "main", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("thread");
        rig.force_running(&thread);

        rig.sched.exit_thread(&thread);
        assert_eq!(rig.arch.dispatch_requests(), 1);
        assert!(process.is_zombie());
        assert_eq!(process.thread_count(), 0);
        assert!(thread.has_resources());
    }

    #[test]
    #[should_panic(expected = "idle thread")]
    fn test_killing_idle_thread_is_fatal() {
        let rig = TestRig::new(1);
        let idle = rig.sched.idle_thread(CpuId(0)).expect("idle");
        rig.sched.kill_thread(&idle);
    }

    #[test]
    fn test_last_thread_exit_makes_zombie_once() {
        let rig = TestRig::new(1);
        let parent = rig.new_process("parent");
        let child = rig
            .sched
            .create_process(Some(&parent), "child", rig.space())
            .expect("child");
        let t1 = rig
            .sched
            .create_thread(&child, "t1", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("t1");
        let t2 = rig
            .sched
            .create_thread(&child, "t2", 0x1000, ThreadEntry::Kernel { arg: 0 })
            .expect("t2");
        assert!(parent.has_child(child.id()));

        rig.sched.exit_thread(&t1);
        assert_eq!(child.state(), ProcessState::Running);
        assert!(parent.has_child(child.id()));

        rig.sched.exit_thread(&t2);
        assert_eq!(child.state(), ProcessState::Zombie);
        assert!(!parent.has_child(child.id()));
        assert!(parent.has_zombie(child.id()));
        assert_eq!(parent.child_exited.pending(), 1);

        // A second exit request changes nothing.
        rig.sched.pexit(&child, 9);
        assert_eq!(child.exit_code(), Some(0));
        assert_eq!(parent.child_exited.pending(), 1);

        assert_eq!(rig.sched.try_reap(&parent, None), Ok((child.id(), 0)));
        assert!(!parent.has_zombie(child.id()));
    }

    #[test]
    fn test_thread_table_kept_until_reap() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        let threads: Vec<_> = (0..2)
            .map(|i| {
                rig.sched
                    .create_thread(&process, "t", 0x1000, ThreadEntry::Kernel { arg: i })
                    .expect("thread")
            })
            .collect();

        rig.sched.pexit(&process, 5);
        assert!(process.is_zombie());
        assert_eq!(process.thread_count(), 2);
        assert!(threads.iter().all(|t| t.status() == ThreadStatus::Killed));

        let kernel = rig.sched.kernel_process().clone();
        assert_eq!(rig.sched.try_reap(&kernel, Some(process.id())), Ok((process.id(), 5)));
        assert_eq!(process.thread_count(), 0);
    }

    #[test]
    fn test_reap_is_idempotent() {
        let rig = TestRig::new(1);
        let parent = rig.new_process("parent");
        let child = rig
            .sched
            .create_process(Some(&parent), "child", rig.space())
            .expect("child");
        let pid = child.id();

        assert_eq!(rig.sched.try_reap(&parent, Some(pid)), Err(SchedError::WouldBlock));
        rig.sched.pexit(&child, 42);
        assert_eq!(rig.sched.try_reap(&parent, Some(pid)), Ok((pid, 42)));
        assert_eq!(rig.sched.try_reap(&parent, Some(pid)), Err(SchedError::NoSuchProcess));
        assert!(rig.sched.registry().lookup(pid).is_none());
        assert_eq!(rig.sched.try_reap(&parent, None), Err(SchedError::NoChildren));
    }

    #[test]
    fn test_reap_of_foreign_process() {
        let rig = TestRig::new(1);
        let a = rig.new_process("a");
        let b = rig.new_process("b");
        assert_eq!(rig.sched.try_reap(&a, Some(b.id())), Err(SchedError::NotAChild));
    }

    #[test]
    fn test_orphans_go_to_kernel_process() {
        let rig = TestRig::new(1);
        let parent = rig.new_process("parent");
        let live = rig
            .sched
            .create_process(Some(&parent), "live", rig.space())
            .expect("live");
        let dead = rig
            .sched
            .create_process(Some(&parent), "dead", rig.space())
            .expect("dead");
        rig.sched.pexit(&dead, 3);
        rig.sched.pexit(&parent, 1);

        let kernel = rig.sched.kernel_process().clone();
        assert!(kernel.has_child(live.id()));
        assert!(kernel.has_zombie(dead.id()));
        assert!(kernel.has_zombie(parent.id()));
        assert!(Arc::ptr_eq(&live.parent().expect("parent"), &kernel));
        assert_eq!(rig.sched.try_reap(&kernel, Some(dead.id())), Ok((dead.id(), 3)));
    }

    #[test]
    fn test_thread_creation_in_dead_process_fails() {
        let rig = TestRig::new(1);
        let process = rig.new_process("p");
        rig.sched.pexit(&process, 0);
        let result = rig
            .sched
            .create_thread(&process, "late", 0x1000, ThreadEntry::Kernel { arg: 0 });
        assert_eq!(result.map(|t| t.id()), Err(SchedError::NoSuchProcess));
    }
}
