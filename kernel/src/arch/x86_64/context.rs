/*
 * x86_64 Trapped Register State
 *
 * The dispatch trap stub pushes all general purpose registers on top of the
 * hardware interrupt frame, producing exactly the `InterruptContext` layout
 * below, and hands the scheduler a pointer to it. Resuming a thread means
 * copying its saved `InterruptContext` over that stack slot and letting the
 * stub pop it and `iretq`.
 *
 * Memory layout (from high to low addresses on stack):
 * - Interrupt frame (pushed by CPU): SS, RSP, RFLAGS, CS, RIP
 * - General purpose registers (pushed by the stub): RAX .. R15
 */

/// Kernel code segment selector (GDT entry 1)
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector (GDT entry 2)
pub const KERNEL_SS: u64 = 0x10;
/// User data segment selector (GDT entry 5, RPL 3)
pub const USER_SS: u64 = 0x2b;
/// User code segment selector (GDT entry 6, RPL 3)
pub const USER_CS: u64 = 0x33;

const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_RESERVED: u64 = 1 << 1;

/// Interrupt frame pushed by CPU during interrupt
///
/// The #[repr(C)] ensures the struct layout matches what the CPU pushes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptFrame {
    pub rip: u64,    // Instruction pointer - where to resume execution
    pub cs: u64,     // Code segment selector
    pub rflags: u64, // CPU flags register
    pub rsp: u64,    // Stack pointer before interrupt
    pub ss: u64,     // Stack segment selector
}

impl Default for InterruptFrame {
    fn default() -> Self {
        Self {
            rip: 0,
            cs: KERNEL_CS,
            rflags: RFLAGS_IF | RFLAGS_RESERVED,
            rsp: 0,
            ss: KERNEL_SS,
        }
    }
}

/// Complete CPU context captured at a trap
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptContext {
    // General purpose registers (pushed by the trap stub)
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    // Interrupt frame (pushed automatically by CPU)
    pub iret_frame: InterruptFrame,
}

impl InterruptContext {
    pub fn ip(&self) -> usize {
        self.iret_frame.rip as usize
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.iret_frame.rip = ip as u64;
    }

    pub fn sp(&self) -> usize {
        self.iret_frame.rsp as usize
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.iret_frame.rsp = sp as u64;
    }

    /// Set the `index`th System V argument register (rdi, rsi, rdx, rcx, r8, r9)
    ///
    /// Indices past the sixth register are ignored.
    pub fn set_arg(&mut self, index: usize, value: usize) {
        let value = value as u64;
        match index {
            0 => self.rdi = value,
            1 => self.rsi = value,
            2 => self.rdx = value,
            3 => self.rcx = value,
            4 => self.r8 = value,
            5 => self.r9 = value,
            _ => {}
        }
    }

    pub fn arg(&self, index: usize) -> Option<usize> {
        let value = match index {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.rcx,
            4 => self.r8,
            5 => self.r9,
            _ => return None,
        };
        Some(value as usize)
    }

    /// Whether the trap was taken from ring 3
    pub fn is_user(&self) -> bool {
        self.iret_frame.cs & 3 == 3
    }

    pub fn set_user_mode(&mut self) {
        self.iret_frame.cs = USER_CS;
        self.iret_frame.ss = USER_SS;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.iret_frame.rflags & RFLAGS_IF != 0
    }

    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        if enabled {
            self.iret_frame.rflags |= RFLAGS_IF;
        } else {
            self.iret_frame.rflags &= !RFLAGS_IF;
        }
        self.iret_frame.rflags |= RFLAGS_RESERVED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_is_kernel_with_interrupts() {
        let ctx = InterruptContext::default();
        assert!(!ctx.is_user());
        assert!(ctx.interrupts_enabled());
        assert_eq!(ctx.iret_frame.cs, KERNEL_CS);
        assert_eq!(ctx.iret_frame.ss, KERNEL_SS);
    }

    #[test]
    fn test_user_mode_selectors_have_rpl3() {
        let mut ctx = InterruptContext::default();
        ctx.set_user_mode();
        assert!(ctx.is_user());
        assert_eq!(ctx.iret_frame.ss & 3, 3);
    }

    #[test]
    fn test_args_follow_sysv_order() {
        let mut ctx = InterruptContext::default();
        for i in 0..7 {
            ctx.set_arg(i, 100 + i);
        }
        assert_eq!(ctx.rdi, 100);
        assert_eq!(ctx.rsi, 101);
        assert_eq!(ctx.rdx, 102);
        assert_eq!(ctx.rcx, 103);
        assert_eq!(ctx.r8, 104);
        assert_eq!(ctx.r9, 105);
        assert_eq!(ctx.arg(6), None);
    }

    #[test]
    fn test_interrupt_flag_toggle_keeps_reserved_bit() {
        let mut ctx = InterruptContext::default();
        ctx.set_interrupts_enabled(false);
        assert!(!ctx.interrupts_enabled());
        assert_eq!(ctx.iret_frame.rflags, RFLAGS_RESERVED);
        ctx.set_interrupts_enabled(true);
        assert!(ctx.interrupts_enabled());
    }

    #[test]
    fn test_layout_matches_stub_push_order() {
        assert_eq!(core::mem::size_of::<InterruptContext>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(InterruptContext, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(InterruptContext, iret_frame), 15 * 8);
    }
}
