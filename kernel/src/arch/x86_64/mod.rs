/*
 * x86_64 Architecture Backend
 *
 * Implements the `Arch` capability trait on top of:
 * - the local APIC (one-shot timer, fixed IPIs, NMI broadcast, EOI)
 * - FXSAVE/XSAVE for FPU state
 * - the FS base and KernelGsBase MSRs for per-thread TLS bases
 * - each CPU's TSS: RSP0 is the running thread's kernel stack, IST slot
 *   `PAGE_FAULT_IST_INDEX` its page-fault stack
 *
 * Bring-up (GDT, IDT, LAPIC enable, TSC calibration) happens before this
 * backend is constructed; it only consumes the results.
 */

pub mod context;
pub mod fpu;
pub mod lapic;
pub mod trap;

use alloc::vec::Vec;
use core::ptr::NonNull;

use x86_64::{
    VirtAddr,
    instructions::{hlt, interrupts},
    registers::model_specific::{FsBase, KernelGsBase},
    structures::tss::TaskStateSegment,
};

use self::{fpu::FpuMode, lapic::Lapic};
use super::{Arch, EntryMode, IpiTarget, SegmentBases, StackTops, TrapFrame};
use crate::scheduler::CpuId;

/// IST slot the IDT's page-fault gate uses
pub const PAGE_FAULT_IST_INDEX: usize = 1;

/// First vector free for dynamic allocation (below are exceptions and legacy IRQs)
const FIRST_DYNAMIC_VECTOR: u8 = 0x30;
/// Last vector free for dynamic allocation (above are spurious/reserved)
const LAST_DYNAMIC_VECTOR: u8 = 0xEF;

/// One CPU as discovered during bring-up
pub struct CpuDescriptor {
    pub apic_id: u32,
    pub tss: &'static mut TaskStateSegment,
}

/// Bring-up results the backend needs
pub struct X86_64Config {
    /// Virtual address of the mapped xAPIC register page
    pub lapic_base: NonNull<u8>,
    pub cpus: Vec<CpuDescriptor>,
    /// LAPIC timer ticks (divide-by-16) per millisecond
    pub lapic_ticks_per_ms: u32,
    /// TSC ticks per microsecond
    pub tsc_per_us: u64,
    /// Serial/console sink for log output
    pub console: fn(&str),
    /// Point an IDT vector at a handler address; false if the vector is taken
    pub route_vector: fn(vector: u8, handler: usize) -> bool,
}

struct CpuSlot {
    apic_id: u32,
    tss: NonNull<TaskStateSegment>,
}

pub struct X86_64 {
    lapic: Lapic,
    cpus: Vec<CpuSlot>,
    fpu: FpuMode,
    lapic_ticks_per_ms: u32,
    tsc_per_us: u64,
    console: fn(&str),
    route_vector: fn(u8, usize) -> bool,
}

// Each TSS is only written by the CPU it belongs to, from `load_extended`
// with interrupts disabled.
unsafe impl Send for X86_64 {}
unsafe impl Sync for X86_64 {}

impl X86_64 {
    /// # Safety
    /// `config.lapic_base` must map the xAPIC registers and every TSS must be
    /// the one loaded on the CPU with the matching APIC ID.
    pub unsafe fn new(config: X86_64Config) -> Self {
        let cpus = config
            .cpus
            .into_iter()
            .map(|cpu| CpuSlot {
                apic_id: cpu.apic_id,
                tss: NonNull::from(cpu.tss),
            })
            .collect();
        let fpu = FpuMode::detect();
        log::info!("x86_64: FPU save mode {:?}", fpu);
        Self {
            // SAFETY: guaranteed by the caller
            lapic: unsafe { Lapic::new(config.lapic_base) },
            cpus,
            fpu,
            lapic_ticks_per_ms: config.lapic_ticks_per_ms.max(1),
            tsc_per_us: config.tsc_per_us.max(1),
            console: config.console,
            route_vector: config.route_vector,
        }
    }

    fn apic_id(&self, cpu: CpuId) -> Option<u32> {
        self.cpus.get(cpu.as_usize()).map(|slot| slot.apic_id)
    }

    fn ns_to_lapic_ticks(&self, ns: u64) -> u32 {
        let ticks = ns.saturating_mul(self.lapic_ticks_per_ms as u64) / 1_000_000;
        ticks.clamp(1, u32::MAX as u64) as u32
    }
}

impl Arch for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> CpuId {
        let id = self.lapic.id();
        let index = self
            .cpus
            .iter()
            .position(|slot| slot.apic_id == id)
            .unwrap_or(0);
        CpuId(index as u32)
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn set_interrupts(&self, enabled: bool) {
        if enabled {
            interrupts::enable();
        } else {
            interrupts::disable();
        }
    }

    fn halt(&self) {
        hlt();
    }

    fn now_ns(&self) -> u64 {
        // SAFETY: RDTSC has no side effects
        let tsc = unsafe { core::arch::x86_64::_rdtsc() };
        tsc.saturating_mul(1000) / self.tsc_per_us
    }

    fn console_write(&self, s: &str) {
        (self.console)(s);
    }

    fn fpu_area_size(&self) -> usize {
        self.fpu.area_size()
    }

    fn init_fpu_area(&self, area: &mut [u8]) {
        self.fpu.init_area(area);
    }

    fn prepare_frame(
        &self,
        frame: &mut TrapFrame,
        entry: usize,
        stack_top: usize,
        args: &[usize],
        mode: EntryMode,
    ) {
        // Entry code expects RSP % 16 == 8, as if reached through `call`
        super::init_frame(frame, entry, stack_top.saturating_sub(8), args, mode);
    }

    fn save_extended(&self, fpu: &mut [u8], bases: &mut SegmentBases, user: bool) {
        // SAFETY: FpuArea is 64-byte aligned and sized from `fpu_area_size`
        unsafe { self.fpu.save(fpu) };
        bases.tls_base = FsBase::read().as_u64();
        if user {
            bases.aux_base = KernelGsBase::read().as_u64();
        }
    }

    fn load_extended(
        &self,
        cpu: CpuId,
        fpu: Option<&[u8]>,
        bases: &SegmentBases,
        stacks: StackTops,
        user: bool,
    ) {
        if let Some(area) = fpu {
            // SAFETY: the area holds an image from `save` or `init_fpu_area`
            unsafe { self.fpu.restore(area) };
        }
        FsBase::write(VirtAddr::new_truncate(bases.tls_base));
        if user {
            KernelGsBase::write(VirtAddr::new_truncate(bases.aux_base));
        }
        if let Some(slot) = self.cpus.get(cpu.as_usize()) {
            // SAFETY: this CPU's TSS, written with interrupts disabled
            let tss = unsafe { &mut *slot.tss.as_ptr() };
            tss.privilege_stack_table[0] = VirtAddr::new_truncate(stacks.kernel as u64);
            tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX] =
                VirtAddr::new_truncate(stacks.page_fault as u64);
        }
    }

    fn install_dispatch_vector(&self, hint: u8) -> Option<u8> {
        let handler = trap::entry_address()?;
        let start = hint.max(FIRST_DYNAMIC_VECTOR);
        (start..=LAST_DYNAMIC_VECTOR)
            .chain(FIRST_DYNAMIC_VECTOR..start)
            .find(|vector| (self.route_vector)(*vector, handler))
    }

    fn arm_timer(&self, cpu: CpuId, ns: u64, vector: u8) {
        // The LAPIC timer is CPU-local; only the executing CPU can arm its own.
        if cpu != self.current_cpu() {
            log::warn!("x86_64: cannot arm timer of remote cpu {}", cpu.as_usize());
            return;
        }
        self.lapic.arm_oneshot(self.ns_to_lapic_ticks(ns), vector);
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        match target {
            IpiTarget::Cpu(cpu) => match self.apic_id(cpu) {
                Some(apic_id) => self.lapic.send_ipi(apic_id, vector),
                None => log::warn!("x86_64: IPI to unknown cpu {}", cpu.as_usize()),
            },
            IpiTarget::AllButSelf => self.lapic.send_ipi_all_but_self(vector),
        }
    }

    fn request_dispatch(&self, vector: u8) {
        self.lapic.send_self_ipi(vector);
    }

    fn eoi(&self, _vector: u8) {
        self.lapic.eoi();
    }

    fn halt_others(&self) {
        self.lapic.send_nmi_all_but_self();
    }
}

