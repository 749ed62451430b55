/*
 * aarch64 Architecture Backend
 *
 * - GICv3 system-register interface: SGIs for reschedule IPIs, IAR/EOIR
 * - EL1 virtual generic timer for the preemption quantum
 * - q0..q31 + FPCR/FPSR as the FPU save area
 * - TPIDR_EL0 / TPIDRRO_EL0 as the per-thread TLS bases
 *
 * The kernel's IRQ vectors branch to the dispatch stub in trap.rs, which
 * acknowledges the interrupt through this backend, runs dispatch and resumes
 * the selected thread on its own stack. Page-fault handling reads the stack
 * tops of the current CPU from `stack_tops`.
 */

pub mod context;
pub mod trap;

use alloc::vec::Vec;
use core::arch::asm;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{Arch, IpiTarget, SegmentBases, StackTops};
use crate::scheduler::CpuId;

/// 32 Q registers plus FPCR and FPSR
const FPU_AREA_SIZE: usize = 32 * 16 + 16;
/// Software-generated interrupts occupy INTIDs 0..16
const SGI_COUNT: u8 = 16;
const SPURIOUS_INTID: u32 = 1023;

/// One CPU as discovered during bring-up
#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    /// MPIDR_EL1 affinity bits (Aff3..Aff0)
    pub mpidr: u64,
}

pub struct Aarch64Config {
    pub cpus: Vec<CpuDescriptor>,
    pub console: fn(&str),
    /// SGI used to park other cores on a fatal error
    pub halt_sgi: u8,
    /// Claim an SGI for the dispatch handler; false if taken
    pub route_sgi: fn(intid: u8) -> bool,
}

struct CpuSlot {
    mpidr: u64,
    kernel_stack: AtomicUsize,
    page_fault_stack: AtomicUsize,
    active_intid: AtomicU32,
}

pub struct Aarch64 {
    cpus: Vec<CpuSlot>,
    console: fn(&str),
    halt_sgi: u8,
    route_sgi: fn(u8) -> bool,
    counter_hz: u64,
}

const MPIDR_AFFINITY_MASK: u64 = 0xFF_00FF_FFFF;

fn read_mpidr() -> u64 {
    let value: u64;
    unsafe { asm!("mrs {}, mpidr_el1", out(reg) value, options(nomem, nostack)) };
    value & MPIDR_AFFINITY_MASK
}

impl Aarch64 {
    pub fn new(config: Aarch64Config) -> Self {
        let counter_hz: u64;
        unsafe { asm!("mrs {}, cntfrq_el0", out(reg) counter_hz, options(nomem, nostack)) };
        let cpus = config
            .cpus
            .into_iter()
            .map(|cpu| CpuSlot {
                mpidr: cpu.mpidr & MPIDR_AFFINITY_MASK,
                kernel_stack: AtomicUsize::new(0),
                page_fault_stack: AtomicUsize::new(0),
                active_intid: AtomicU32::new(SPURIOUS_INTID),
            })
            .collect();
        Self {
            cpus,
            console: config.console,
            halt_sgi: config.halt_sgi,
            route_sgi: config.route_sgi,
            counter_hz: counter_hz.max(1),
        }
    }

    /// Stack tops the exception vectors switch to for `cpu`
    pub fn stack_tops(&self, cpu: CpuId) -> StackTops {
        match self.cpus.get(cpu.as_usize()) {
            Some(slot) => StackTops {
                kernel: slot.kernel_stack.load(Ordering::Acquire),
                page_fault: slot.page_fault_stack.load(Ordering::Acquire),
            },
            None => StackTops::default(),
        }
    }

    fn send_sgi(&self, target: IpiTarget, intid: u8) {
        let intid = (intid as u64 & 0xF) << 24;
        let value = match target {
            IpiTarget::AllButSelf => intid | (1 << 40),
            IpiTarget::Cpu(cpu) => {
                let Some(slot) = self.cpus.get(cpu.as_usize()) else {
                    log::warn!("aarch64: SGI to unknown cpu {}", cpu.as_usize());
                    return;
                };
                let aff0 = slot.mpidr & 0xFF;
                let aff1 = (slot.mpidr >> 8) & 0xFF;
                let aff2 = (slot.mpidr >> 16) & 0xFF;
                let aff3 = (slot.mpidr >> 32) & 0xFF;
                let target_list = 1u64 << (aff0 & 0xF);
                let range_selector = aff0 >> 4;
                (aff3 << 48)
                    | (range_selector << 44)
                    | (aff2 << 32)
                    | intid
                    | (aff1 << 16)
                    | target_list
            }
        };
        unsafe {
            asm!("dsb ishst", "msr icc_sgi1r_el1, {}", "isb", in(reg) value, options(nostack));
        }
    }
}

impl Arch for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> CpuId {
        let mpidr = read_mpidr();
        CpuId(self.cpus.iter().position(|slot| slot.mpidr == mpidr).unwrap_or(0) as u32)
    }

    fn interrupts_enabled(&self) -> bool {
        let daif: u64;
        unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack)) };
        daif & (1 << 7) == 0
    }

    fn set_interrupts(&self, enabled: bool) {
        unsafe {
            if enabled {
                asm!("msr daifclr, #2", options(nomem, nostack));
            } else {
                asm!("msr daifset, #2", options(nomem, nostack));
            }
        }
    }

    fn halt(&self) {
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }

    fn now_ns(&self) -> u64 {
        let ticks: u64;
        unsafe { asm!("isb", "mrs {}, cntvct_el0", out(reg) ticks, options(nomem, nostack)) };
        ((ticks as u128 * 1_000_000_000) / self.counter_hz as u128) as u64
    }

    fn console_write(&self, s: &str) {
        (self.console)(s);
    }

    fn fpu_area_size(&self) -> usize {
        FPU_AREA_SIZE
    }

    fn init_fpu_area(&self, area: &mut [u8]) {
        // Zeroed FPCR is round-to-nearest with all traps masked
        area.fill(0);
    }

    fn save_extended(&self, fpu: &mut [u8], bases: &mut SegmentBases, user: bool) {
        let ptr = fpu.as_mut_ptr();
        unsafe {
            asm!(
                "stp q0, q1, [{p}, #0]",
                "stp q2, q3, [{p}, #32]",
                "stp q4, q5, [{p}, #64]",
                "stp q6, q7, [{p}, #96]",
                "stp q8, q9, [{p}, #128]",
                "stp q10, q11, [{p}, #160]",
                "stp q12, q13, [{p}, #192]",
                "stp q14, q15, [{p}, #224]",
                "stp q16, q17, [{p}, #256]",
                "stp q18, q19, [{p}, #288]",
                "stp q20, q21, [{p}, #320]",
                "stp q22, q23, [{p}, #352]",
                "stp q24, q25, [{p}, #384]",
                "stp q26, q27, [{p}, #416]",
                "stp q28, q29, [{p}, #448]",
                "stp q30, q31, [{p}, #480]",
                "mrs {t}, fpcr",
                "str {t}, [{p}, #512]",
                "mrs {t}, fpsr",
                "str {t}, [{p}, #520]",
                p = in(reg) ptr,
                t = out(reg) _,
                options(nostack),
            );
            let tls: u64;
            asm!("mrs {}, tpidr_el0", out(reg) tls, options(nomem, nostack));
            bases.tls_base = tls;
            if user {
                let aux: u64;
                asm!("mrs {}, tpidrro_el0", out(reg) aux, options(nomem, nostack));
                bases.aux_base = aux;
            }
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
        unsafe {
            if let Some(area) = fpu {
                let ptr = area.as_ptr();
                asm!(
                    "ldp q0, q1, [{p}, #0]",
                    "ldp q2, q3, [{p}, #32]",
                    "ldp q4, q5, [{p}, #64]",
                    "ldp q6, q7, [{p}, #96]",
                    "ldp q8, q9, [{p}, #128]",
                    "ldp q10, q11, [{p}, #160]",
                    "ldp q12, q13, [{p}, #192]",
                    "ldp q14, q15, [{p}, #224]",
                    "ldp q16, q17, [{p}, #256]",
                    "ldp q18, q19, [{p}, #288]",
                    "ldp q20, q21, [{p}, #320]",
                    "ldp q22, q23, [{p}, #352]",
                    "ldp q24, q25, [{p}, #384]",
                    "ldp q26, q27, [{p}, #416]",
                    "ldp q28, q29, [{p}, #448]",
                    "ldp q30, q31, [{p}, #480]",
                    "ldr {t}, [{p}, #512]",
                    "msr fpcr, {t}",
                    "ldr {t}, [{p}, #520]",
                    "msr fpsr, {t}",
                    p = in(reg) ptr,
                    t = out(reg) _,
                    options(nostack),
                );
            }
            asm!("msr tpidr_el0, {}", in(reg) bases.tls_base, options(nomem, nostack));
            if user {
                asm!("msr tpidrro_el0, {}", in(reg) bases.aux_base, options(nomem, nostack));
            }
        }
        if let Some(slot) = self.cpus.get(cpu.as_usize()) {
            slot.kernel_stack.store(stacks.kernel, Ordering::Release);
            slot.page_fault_stack.store(stacks.page_fault, Ordering::Release);
        }
    }

    fn install_dispatch_vector(&self, hint: u8) -> Option<u8> {
        let start = hint % SGI_COUNT;
        (start..SGI_COUNT)
            .chain(0..start)
            .filter(|intid| *intid != self.halt_sgi)
            .find(|intid| (self.route_sgi)(*intid))
    }

    fn arm_timer(&self, cpu: CpuId, ns: u64, _vector: u8) {
        // The virtual timer PPI is routed to the dispatch handler at bring-up.
        if cpu != self.current_cpu() {
            log::warn!("aarch64: cannot arm timer of remote cpu {}", cpu.as_usize());
            return;
        }
        let ticks = ((ns as u128 * self.counter_hz as u128) / 1_000_000_000).max(1) as u64;
        unsafe {
            asm!(
                "msr cntv_tval_el0, {}",
                "msr cntv_ctl_el0, {}",
                "isb",
                in(reg) ticks,
                in(reg) 1u64,
                options(nomem, nostack),
            );
        }
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        self.send_sgi(target, vector);
    }

    fn request_dispatch(&self, vector: u8) {
        self.send_sgi(IpiTarget::Cpu(self.current_cpu()), vector);
    }

    /// Read IAR1 on IRQ entry; the INTID is written back by `eoi`
    fn acknowledge(&self) -> bool {
        let intid: u64;
        unsafe { asm!("mrs {}, icc_iar1_el1", out(reg) intid, options(nomem, nostack)) };
        let intid = intid as u32 & 0xFF_FFFF;
        if intid == SPURIOUS_INTID {
            return false;
        }
        if let Some(slot) = self.cpus.get(self.current_cpu().as_usize()) {
            slot.active_intid.store(intid, Ordering::Relaxed);
        }
        true
    }

    fn eoi(&self, _vector: u8) {
        let Some(slot) = self.cpus.get(self.current_cpu().as_usize()) else {
            return;
        };
        let intid = slot.active_intid.swap(SPURIOUS_INTID, Ordering::Relaxed);
        if intid != SPURIOUS_INTID {
            unsafe {
                asm!("msr icc_eoir1_el1, {}", in(reg) intid as u64, options(nomem, nostack));
            }
        }
    }

    fn halt_others(&self) {
        self.send_sgi(IpiTarget::AllButSelf, self.halt_sgi);
    }
}
