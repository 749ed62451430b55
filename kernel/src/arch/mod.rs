/*
 * Architecture Abstraction Layer
 *
 * The scheduler core never branches on the architecture. Everything that
 * differs between CPUs (trap frame layout, FPU/extended state save/restore,
 * segment/TLS bases, per-CPU stack fields, IPIs, the preemption timer) sits
 * behind the `Arch` capability trait. One backend is installed at boot and
 * handed to `scheduler::init`.
 *
 * Backends:
 * - x86_64: xAPIC IPIs and timer, FXSAVE/XSAVE, FS/KernelGS base, TSS patching
 * - aarch64: GICv3 SGIs, generic timer, FP/SIMD registers, TPIDR_EL0
 *
 * The free functions `interrupts_enabled` / `set_interrupts` work before a
 * backend is installed (they do nothing), so lock primitives can be used from
 * the first instruction of the kernel.
 */

use spin::Once;

use crate::scheduler::CpuId;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::context::InterruptContext as TrapFrame;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::context::ExceptionContext as TrapFrame;

/// Privilege level a new thread starts in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Kernel,
    User,
}

/// Destination of an inter-processor interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    /// One specific CPU
    Cpu(CpuId),
    /// Every CPU except the sender
    AllButSelf,
}

/// Per-thread base registers that are not part of the trap frame
///
/// x86_64: `tls_base` = FS base, `aux_base` = user GS base (KernelGsBase while
/// in the kernel). aarch64: `tls_base` = TPIDR_EL0, `aux_base` = TPIDRRO_EL0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentBases {
    pub tls_base: u64,
    pub aux_base: u64,
}

/// Stack tops the CPU must switch to when the loaded thread traps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackTops {
    /// Kernel stack used on privilege change (x86_64 TSS.rsp0, aarch64 SP_EL1)
    pub kernel: usize,
    /// Dedicated stack for page faults taken while already on the kernel stack
    pub page_fault: usize,
}

/// Architecture capability interface
///
/// Implementations must be usable from interrupt context: none of these
/// methods may block.
pub trait Arch: Sync {
    fn name(&self) -> &'static str;

    /// Number of CPUs the scheduler manages
    fn cpu_count(&self) -> usize;

    /// Index of the CPU executing the caller
    fn current_cpu(&self) -> CpuId;

    fn interrupts_enabled(&self) -> bool;

    fn set_interrupts(&self, enabled: bool);

    /// Wait for the next interrupt (idle loop body)
    fn halt(&self);

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Sink for kernel log output
    fn console_write(&self, s: &str);

    /// Bytes needed for one thread's FPU/extended state area
    fn fpu_area_size(&self) -> usize;

    /// Fill a zeroed FPU area with the architecture's default control state
    fn init_fpu_area(&self, area: &mut [u8]);

    /// Build the initial trapped register state for a new thread
    ///
    /// `args` land in the first argument registers of the calling convention.
    fn prepare_frame(
        &self,
        frame: &mut TrapFrame,
        entry: usize,
        stack_top: usize,
        args: &[usize],
        mode: EntryMode,
    ) {
        init_frame(frame, entry, stack_top, args, mode);
    }

    /// Save FPU state and segment bases of the outgoing thread
    fn save_extended(&self, fpu: &mut [u8], bases: &mut SegmentBases, user: bool);

    /// Load FPU state, segment bases and per-CPU stack fields of the incoming thread
    ///
    /// `fpu` is `None` for threads without an FPU area (idle threads).
    fn load_extended(
        &self,
        cpu: CpuId,
        fpu: Option<&[u8]>,
        bases: &SegmentBases,
        stacks: StackTops,
        user: bool,
    );

    /// Route `hint` (or the nearest free vector) to the dispatch trap entry
    fn install_dispatch_vector(&self, hint: u8) -> Option<u8>;

    /// Arm `cpu`'s one-shot timer to raise `vector` after `ns` nanoseconds
    fn arm_timer(&self, cpu: CpuId, ns: u64, vector: u8);

    fn send_ipi(&self, target: IpiTarget, vector: u8);

    /// Trap into the dispatch vector on the calling CPU right now
    fn request_dispatch(&self, vector: u8);

    /// Claim the interrupt that entered the dispatch trap
    ///
    /// Returns false for a spurious interrupt, which must not dispatch.
    fn acknowledge(&self) -> bool {
        true
    }

    /// Acknowledge `vector` at the interrupt controller if it was delivered through it
    fn eoi(&self, vector: u8);

    /// Stop every other CPU without waiting for acknowledgement
    fn halt_others(&self);
}

/// Architecture-neutral initial frame: entry, stack, arguments, interrupts on
pub fn init_frame(
    frame: &mut TrapFrame,
    entry: usize,
    stack_top: usize,
    args: &[usize],
    mode: EntryMode,
) {
    *frame = TrapFrame::default();
    if mode == EntryMode::User {
        frame.set_user_mode();
    }
    frame.set_ip(entry);
    frame.set_sp(stack_top);
    frame.set_interrupts_enabled(true);
    for (index, value) in args.iter().enumerate() {
        frame.set_arg(index, *value);
    }
}

static ARCH: Once<&'static dyn Arch> = Once::new();

/// Install the architecture backend (first call wins)
pub fn install(arch: &'static dyn Arch) -> &'static dyn Arch {
    *ARCH.call_once(|| arch)
}

/// Installed backend, if any
pub fn try_get() -> Option<&'static dyn Arch> {
    ARCH.get().copied()
}

/// Installed backend
///
/// # Panics
/// Panics if no backend has been installed.
pub fn get() -> &'static dyn Arch {
    match try_get() {
        Some(arch) => arch,
        None => panic!("architecture backend not installed"),
    }
}

pub fn interrupts_enabled() -> bool {
    try_get().is_some_and(|arch| arch.interrupts_enabled())
}

pub fn set_interrupts(enabled: bool) {
    if let Some(arch) = try_get() {
        arch.set_interrupts(enabled);
    }
}

/// Stop all other CPUs (fatal error path)
pub fn halt_others() {
    if let Some(arch) = try_get() {
        arch.halt_others();
    }
}
