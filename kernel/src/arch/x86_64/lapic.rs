/*
 * Local APIC (xAPIC MMIO) access
 *
 * Only the registers the scheduler needs: ID, EOI, the interrupt command
 * register for IPIs, and the LVT timer in one-shot mode. The LAPIC is
 * enabled and the MMIO page is mapped during bring-up, before the backend
 * is constructed.
 */

use core::ptr::NonNull;

use volatile::VolatilePtr;

const LAPIC_ID: usize = 0x020;
const LAPIC_EOI: usize = 0x0B0;
const LAPIC_ICR_LOW: usize = 0x300;
const LAPIC_ICR_HIGH: usize = 0x310;
const LAPIC_TIMER: usize = 0x320;
const LAPIC_TIMER_INIT: usize = 0x380;
const LAPIC_TIMER_DIV: usize = 0x3E0;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_ASSERT: u32 = 1 << 14;
const ICR_NMI: u32 = 4 << 8;
const ICR_SHORTHAND_SELF: u32 = 1 << 18;
const ICR_SHORTHAND_ALL_BUT_SELF: u32 = 3 << 18;

const TIMER_ONESHOT: u32 = 0;
const TIMER_DIVIDE_BY_16: u32 = 0x03;

/// Handle on the memory-mapped local APIC of the executing CPU
///
/// Every CPU sees its own LAPIC at the same virtual address, so one handle
/// serves all of them.
#[derive(Debug, Clone, Copy)]
pub struct Lapic {
    base: NonNull<u8>,
}

// The register window is per-CPU hardware; accesses are single volatile loads/stores.
unsafe impl Send for Lapic {}
unsafe impl Sync for Lapic {}

impl Lapic {
    /// # Safety
    /// `base` must be the virtual address of a mapped, enabled xAPIC register page.
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    fn reg(&self, offset: usize) -> VolatilePtr<'_, u32> {
        // SAFETY: offsets are LAPIC register offsets inside the mapped page
        unsafe { VolatilePtr::new(self.base.add(offset).cast::<u32>()) }
    }

    /// APIC ID of the executing CPU
    pub fn id(&self) -> u32 {
        self.reg(LAPIC_ID).read() >> 24
    }

    pub fn eoi(&self) {
        self.reg(LAPIC_EOI).write(0);
    }

    fn wait_icr_idle(&self) {
        while self.reg(LAPIC_ICR_LOW).read() & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    fn send(&self, destination: u32, command: u32) {
        self.wait_icr_idle();
        self.reg(LAPIC_ICR_HIGH).write(destination << 24);
        self.reg(LAPIC_ICR_LOW).write(command);
    }

    /// Fixed-delivery IPI to one APIC ID
    pub fn send_ipi(&self, apic_id: u32, vector: u8) {
        self.send(apic_id, ICR_ASSERT | vector as u32);
    }

    /// Fixed-delivery IPI to every CPU except the sender
    pub fn send_ipi_all_but_self(&self, vector: u8) {
        self.send(0, ICR_ASSERT | ICR_SHORTHAND_ALL_BUT_SELF | vector as u32);
    }

    /// Raise `vector` on the executing CPU
    pub fn send_self_ipi(&self, vector: u8) {
        self.send(0, ICR_ASSERT | ICR_SHORTHAND_SELF | vector as u32);
    }

    /// NMI broadcast to every other CPU; the NMI handler parks the core
    pub fn send_nmi_all_but_self(&self) {
        self.send(0, ICR_ASSERT | ICR_SHORTHAND_ALL_BUT_SELF | ICR_NMI);
    }

    /// Fire `vector` once after `ticks` timer ticks (bus clock / 16)
    pub fn arm_oneshot(&self, ticks: u32, vector: u8) {
        self.reg(LAPIC_TIMER_DIV).write(TIMER_DIVIDE_BY_16);
        self.reg(LAPIC_TIMER).write(TIMER_ONESHOT | vector as u32);
        self.reg(LAPIC_TIMER_INIT).write(ticks.max(1));
    }
}
