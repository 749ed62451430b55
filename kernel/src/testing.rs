/*
 * Host test doubles
 *
 * The scheduling logic runs unchanged on the host; only the collaborators
 * are replaced:
 * - MockArch: records timer arms, IPIs and dispatch requests, exposes a
 *   settable clock and current CPU, keeps the interrupt flag per host thread
 * - MockSpace: counts address space loads
 * - HeapStacks: kernel stacks from the host heap, with accounting and an
 *   injectable allocation failure
 *
 * Each test builds its own `Scheduler` through `TestRig`, so tests do not
 * share state beyond the globally installed MockArch used by the locks.
 */

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::alloc::{Layout, alloc, dealloc};
use std::sync::{Mutex, OnceLock};

use crate::arch::{self, Arch, IpiTarget, SegmentBases, StackTops};
use crate::memory::{AddressSpace, StackAllocator};
use crate::scheduler::{
    CpuId, Process, SchedConfig, Scheduler, Thread, ThreadEntry, ThreadStatus,
};

std::thread_local! {
    static INTERRUPTS: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
struct Log {
    timers: Vec<(CpuId, u64)>,
    ipis: Vec<(IpiTarget, u8)>,
    dispatch_requests: usize,
    saved_extended: usize,
    loaded_extended: usize,
    fpu_inits: usize,
    console: String,
}

pub struct MockArch {
    cpus: usize,
    current: AtomicU32,
    now: AtomicU64,
    spurious: AtomicBool,
    log: Mutex<Log>,
}

impl MockArch {
    pub fn leaked(cpus: usize) -> &'static MockArch {
        Box::leak(Box::new(MockArch {
            cpus,
            current: AtomicU32::new(0),
            now: AtomicU64::new(0),
            spurious: AtomicBool::new(false),
            log: Mutex::new(Log::default()),
        }))
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current.store(cpu.0, Ordering::SeqCst);
    }

    pub fn set_now_ns(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// Make the next acknowledgements report a spurious interrupt
    pub fn set_spurious(&self, spurious: bool) {
        self.spurious.store(spurious, Ordering::SeqCst);
    }

    pub fn timers(&self) -> Vec<(CpuId, u64)> {
        self.log().timers.clone()
    }

    pub fn ipis(&self) -> Vec<(IpiTarget, u8)> {
        self.log().ipis.clone()
    }

    pub fn dispatch_requests(&self) -> usize {
        self.log().dispatch_requests
    }

    pub fn saved_extended(&self) -> usize {
        self.log().saved_extended
    }

    pub fn loaded_extended(&self) -> usize {
        self.log().loaded_extended
    }

    pub fn fpu_inits(&self) -> usize {
        self.log().fpu_inits
    }

    pub fn console(&self) -> String {
        self.log().console.clone()
    }

    /// Forget everything recorded so far
    pub fn clear_log(&self) {
        *self.log() = Log::default();
    }
}

impl Arch for MockArch {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> CpuId {
        CpuId(self.current.load(Ordering::SeqCst))
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS.with(|flag| flag.get())
    }

    fn set_interrupts(&self, enabled: bool) {
        INTERRUPTS.with(|flag| flag.set(enabled));
    }

    fn halt(&self) {}

    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn console_write(&self, s: &str) {
        self.log().console.push_str(s);
    }

    fn fpu_area_size(&self) -> usize {
        512
    }

    fn init_fpu_area(&self, area: &mut [u8]) {
        area[0] = 0x7f;
        area[1] = 0x03;
        self.log().fpu_inits += 1;
    }

    fn save_extended(&self, _fpu: &mut [u8], _bases: &mut SegmentBases, _user: bool) {
        self.log().saved_extended += 1;
    }

    fn load_extended(
        &self,
        _cpu: CpuId,
        _fpu: Option<&[u8]>,
        _bases: &SegmentBases,
        _stacks: StackTops,
        _user: bool,
    ) {
        self.log().loaded_extended += 1;
    }

    fn install_dispatch_vector(&self, hint: u8) -> Option<u8> {
        Some(hint)
    }

    fn arm_timer(&self, cpu: CpuId, ns: u64, _vector: u8) {
        self.log().timers.push((cpu, ns));
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        self.log().ipis.push((target, vector));
    }

    fn request_dispatch(&self, _vector: u8) {
        self.log().dispatch_requests += 1;
    }

    fn acknowledge(&self) -> bool {
        !self.spurious.load(Ordering::SeqCst)
    }

    fn eoi(&self, _vector: u8) {}

    fn halt_others(&self) {}
}

static GLOBAL_ARCH: OnceLock<&'static MockArch> = OnceLock::new();

/// Install a MockArch as the global backend (idempotent)
pub fn install_global_arch() -> &'static MockArch {
    GLOBAL_ARCH.get_or_init(|| {
        let mock = MockArch::leaked(1);
        arch::install(mock);
        mock
    })
}

/// Address space that only counts activations
#[derive(Clone, Default)]
pub struct MockSpace {
    loads: Arc<AtomicUsize>,
}

impl MockSpace {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl AddressSpace for MockSpace {
    fn load(&self, _is_bootstrap: bool) {
        self.loads.fetch_add(1, Ordering::SeqCst);
    }
}

const STACK_ALIGN: usize = 16;

/// Kernel stacks from the host heap
pub struct HeapStacks {
    live: AtomicUsize,
    /// Allocations still allowed; negative means unlimited
    budget: AtomicIsize,
}

impl HeapStacks {
    pub fn leaked() -> &'static HeapStacks {
        Box::leak(Box::new(HeapStacks {
            live: AtomicUsize::new(0),
            budget: AtomicIsize::new(-1),
        }))
    }

    /// Stacks allocated and not yet freed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Let `n` more allocations succeed, then fail every one after
    pub fn fail_after(&self, n: isize) {
        self.budget.store(n, Ordering::SeqCst);
    }
}

impl StackAllocator for HeapStacks {
    fn alloc_kernel_stack(&self, size: usize) -> Option<usize> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                0 => None,
                b if b < 0 => Some(b),
                b => Some(b - 1),
            })
            .ok()?;
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        // SAFETY: stack sizes are non-zero
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(ptr as usize)
    }

    fn free_kernel_stack(&self, base: usize, size: usize) {
        let Ok(layout) = Layout::from_size_align(size, STACK_ALIGN) else {
            return;
        };
        // SAFETY: `base` came from `alloc_kernel_stack` with the same size
        unsafe { dealloc(base as *mut u8, layout) };
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A private scheduler over mock collaborators
pub struct TestRig {
    pub sched: Scheduler,
    pub arch: &'static MockArch,
    pub stacks: &'static HeapStacks,
}

impl TestRig {
    pub fn new(cpus: usize) -> Self {
        Self::with_config(cpus, SchedConfig::default())
    }

    pub fn with_max_pid(cpus: usize, max_pid: usize) -> Self {
        Self::with_config(
            cpus,
            SchedConfig {
                max_pid,
                ..SchedConfig::default()
            },
        )
    }

    pub fn with_config(cpus: usize, config: SchedConfig) -> Self {
        install_global_arch();
        let arch = MockArch::leaked(cpus);
        let stacks = HeapStacks::leaked();
        let sched = Scheduler::new(arch, stacks, Box::new(MockSpace::default()), config)
            .expect("scheduler");
        arch.clear_log();
        Self {
            sched,
            arch,
            stacks,
        }
    }

    pub fn space(&self) -> Box<dyn AddressSpace> {
        Box::new(MockSpace::default())
    }

    pub fn new_process(&self, name: &str) -> Arc<Process> {
        self.sched
            .create_process(None, name, self.space())
            .expect("process")
    }

    pub fn new_process_with_space(&self, name: &str) -> (Arc<Process>, MockSpace) {
        let space = MockSpace::default();
        let process = self
            .sched
            .create_process(None, name, Box::new(space.clone()))
            .expect("process");
        (process, space)
    }

    /// Kernel thread in the kernel process, created but not enqueued
    pub fn spawn_kernel_thread(&self, name: &str, entry: ThreadEntry) -> Arc<Thread> {
        self.sched
            .create_thread(self.sched.kernel_process(), name, 0x1000, entry)
            .expect("thread")
    }

    /// Make `thread` the running thread of its CPU without a dispatch
    pub fn force_running(&self, thread: &Arc<Thread>) {
        let cpu = self.sched.cpu(thread.last_cpu());
        let mut queue = cpu.queue.lock();
        queue.remove(thread, &cpu.queued);
        if let Some(previous) = queue.running.take() {
            previous.transition(ThreadStatus::Running, ThreadStatus::Ready);
        }
        thread.transition(ThreadStatus::Ready, ThreadStatus::Running);
        queue.running = Some(thread.clone());
    }

    /// A fresh kernel thread running on `cpu`, with the arch log cleared
    pub fn running_kernel_thread(&self, cpu: u32) -> Arc<Thread> {
        let thread = self.spawn_kernel_thread("runner", ThreadEntry::Kernel { arg: 0 });
        thread.set_last_cpu(CpuId(cpu));
        self.force_running(&thread);
        self.arch.clear_log();
        thread
    }
}
