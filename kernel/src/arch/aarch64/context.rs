/*
 * aarch64 Trapped Register State
 *
 * Layout written by the dispatch stub (trap.rs): x0..x30, the interrupted
 * stack pointer, ELR_EL1, SPSR_EL1. The stack pointer is SP_EL0 for frames
 * taken from EL0 and SP_EL1 for frames taken from EL1h; the stub restores
 * it into the matching register before `eret`.
 */

const SPSR_MODE_MASK: u64 = 0b1111;
const SPSR_EL0T: u64 = 0b0000;
const SPSR_EL1H: u64 = 0b0101;
const SPSR_IRQ_MASK: u64 = 1 << 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionContext {
    pub x: [u64; 31],
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
}

impl Default for ExceptionContext {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            elr: 0,
            spsr: SPSR_EL1H,
        }
    }
}

impl ExceptionContext {
    pub fn ip(&self) -> usize {
        self.elr as usize
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.elr = ip as u64;
    }

    pub fn sp(&self) -> usize {
        self.sp as usize
    }

    /// Stack pointer to resume on (SP_EL0 or SP_EL1 depending on the mode)
    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp as u64;
    }

    /// AAPCS64 argument registers x0..x7
    pub fn set_arg(&mut self, index: usize, value: usize) {
        if index < 8 {
            self.x[index] = value as u64;
        }
    }

    pub fn arg(&self, index: usize) -> Option<usize> {
        (index < 8).then(|| self.x[index] as usize)
    }

    pub fn is_user(&self) -> bool {
        self.spsr & SPSR_MODE_MASK == SPSR_EL0T
    }

    pub fn set_user_mode(&mut self) {
        self.spsr = (self.spsr & !SPSR_MODE_MASK) | SPSR_EL0T;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.spsr & SPSR_IRQ_MASK == 0
    }

    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        if enabled {
            self.spsr &= !SPSR_IRQ_MASK;
        } else {
            self.spsr |= SPSR_IRQ_MASK;
        }
    }
}
