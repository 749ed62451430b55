/*
 * aarch64 dispatch trap entry
 *
 * The kernel's vector table branches to one of two entries from its IRQ
 * slots:
 *
 *   cluu_dispatch_entry_el1  - "current EL with SP_ELx" IRQ
 *   cluu_dispatch_entry_el0  - "lower EL, AArch64" IRQ
 *
 * Both push an `ExceptionContext` on the current SP_EL1 stack, recording the
 * interrupted stack pointer (SP_EL1 before the push, or SP_EL0), and call into
 * `dispatch_from_trap`, which acknowledges the interrupt, may overwrite the
 * frame with another thread's saved context, and signals EOI.
 *
 * FRAME LAYOUT (272 bytes, offsets from SP):
 *
 *   0    x0 .. x29 (pairs)
 *   240  x30
 *   248  interrupted SP
 *   256  ELR_EL1
 *   264  SPSR_EL1
 *
 * On the way out the frame is copied to just below the stack the incoming
 * thread resumes on (its saved SP for EL1h, its kernel stack top for EL0),
 * registers are restored from there and the copy is popped, so SP_EL1 ends
 * up exactly at that stack. For EL0 frames SP_EL0 is restored as well.
 *
 * Only assembled for the bare-metal target.
 */

use super::context::ExceptionContext;

const FRAME_SIZE: usize = core::mem::size_of::<ExceptionContext>();
const _: () = assert!(FRAME_SIZE == 272);

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global cluu_dispatch_entry_el1",
    "cluu_dispatch_entry_el1:",
    "sub sp, sp, #272",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "add x0, sp, #272",
    "stp x30, x0, [sp, #240]",
    "b cluu_dispatch_common",
    "",
    ".global cluu_dispatch_entry_el0",
    "cluu_dispatch_entry_el0:",
    "sub sp, sp, #272",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "mrs x0, sp_el0",
    "stp x30, x0, [sp, #240]",
    "",
    "cluu_dispatch_common:",
    "mrs x0, elr_el1",
    "mrs x1, spsr_el1",
    "stp x0, x1, [sp, #256]",
    "mov x0, sp",
    "bl cluu_dispatch_trap",
    // x0 = stack top to resume on
    "ldp x1, x2, [sp, #256]",
    "msr elr_el1, x1",
    "msr spsr_el1, x2",
    "tst x2, #0xf",
    "b.ne 1f",
    "ldr x3, [sp, #248]",
    "msr sp_el0, x3",
    "1:",
    "sub x4, x0, #272",
    "mov x5, sp",
    "mov x6, #34",
    "2:",
    "ldr x7, [x5], #8",
    "str x7, [x4], #8",
    "subs x6, x6, #1",
    "b.ne 2b",
    "sub sp, x0, #272",
    "ldp x0, x1, [sp, #0]",
    "ldp x2, x3, [sp, #16]",
    "ldp x4, x5, [sp, #32]",
    "ldp x6, x7, [sp, #48]",
    "ldp x8, x9, [sp, #64]",
    "ldp x10, x11, [sp, #80]",
    "ldp x12, x13, [sp, #96]",
    "ldp x14, x15, [sp, #112]",
    "ldp x16, x17, [sp, #128]",
    "ldp x18, x19, [sp, #144]",
    "ldp x20, x21, [sp, #160]",
    "ldp x22, x23, [sp, #176]",
    "ldp x24, x25, [sp, #192]",
    "ldp x26, x27, [sp, #208]",
    "ldp x28, x29, [sp, #224]",
    "ldr x30, [sp, #240]",
    "add sp, sp, #272",
    "eret",
);

/// Rust side of the dispatch trap; returns the stack top to resume on
///
/// # Safety
/// Only called from the dispatch stub with a pointer to the frame it built.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
unsafe extern "C" fn cluu_dispatch_trap(frame: *mut ExceptionContext) -> usize {
    let frame_top = frame as usize + FRAME_SIZE;
    // SAFETY: the stub passes the frame it just pushed on this stack
    let frame = unsafe { &mut *frame };
    crate::scheduler::dispatch_from_trap(frame);

    let kernel_top = crate::scheduler::try_get()
        .and_then(|sched| sched.current(sched.arch().current_cpu()))
        .map_or(0, |thread| thread.stack_tops().kernel);
    resume_stack(frame, kernel_top, frame_top)
}

/// Stack the stub resumes `frame` on
///
/// EL1h frames continue on their own saved SP_EL1. EL0 frames leave SP_EL1 at
/// the thread's kernel stack top, where its next exception will land; without
/// one the frame's current position is kept.
pub fn resume_stack(frame: &ExceptionContext, kernel_top: usize, frame_top: usize) -> usize {
    if !frame.is_user() {
        frame.sp()
    } else if kernel_top != 0 {
        kernel_top
    } else {
        frame_top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_frame_resumes_on_saved_sp() {
        let mut frame = ExceptionContext::default();
        frame.set_sp(0x8000);
        assert_eq!(resume_stack(&frame, 0x4000, 0x2000), 0x8000);
    }

    #[test]
    fn test_user_frame_resumes_on_kernel_stack() {
        let mut frame = ExceptionContext::default();
        frame.set_user_mode();
        frame.set_sp(0x7fff_0000);
        assert_eq!(resume_stack(&frame, 0x4000, 0x2000), 0x4000);
        assert_eq!(resume_stack(&frame, 0, 0x2000), 0x2000);
    }
}
