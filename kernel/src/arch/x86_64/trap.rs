/*
 * Dispatch trap entry
 *
 * The scheduler's dispatch vector (timer expiry, reschedule IPI, explicit
 * yield) points at `cluu_dispatch_entry`. It builds an `InterruptContext` on
 * the current kernel stack, hands it to the scheduler, which may overwrite
 * it with another thread's saved context, then restores whatever is there
 * and returns with `iretq`.
 *
 * STACK LAYOUT AFTER ENTRY:
 *
 * High Address  [SS] [RSP] [RFLAGS] [CS] [RIP]   <- Pushed by CPU
 *               [RAX] [RBX] ... [R15]            <- Pushed by the stub
 * Low Address                                    <- RSP passed to Rust
 *
 * GS follows the swapgs convention: the kernel GS base is live while in
 * ring 0, the user one sits in KernelGsBase. The CS check is repeated on the
 * way out because the frame may now belong to a different thread.
 *
 * Only assembled for the bare-metal target.
 */

#[cfg(target_os = "none")]
use super::context::InterruptContext;

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global cluu_dispatch_entry",
    "cluu_dispatch_entry:",
    "test qword ptr [rsp + 8], 3",
    "jz 1f",
    "swapgs",
    "1:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "cld",
    "mov rdi, rsp",
    "call cluu_dispatch_trap",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "test qword ptr [rsp + 8], 3",
    "jz 2f",
    "swapgs",
    "2:",
    "iretq",
);

/// Rust side of the dispatch trap
///
/// # Safety
/// Only called from `cluu_dispatch_entry` with a pointer to the frame it built.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
unsafe extern "C" fn cluu_dispatch_trap(frame: *mut InterruptContext) {
    // SAFETY: the stub passes the frame it just pushed on this stack
    let frame = unsafe { &mut *frame };
    crate::scheduler::dispatch_from_trap(frame);
}

/// Address of the dispatch trap entry, if this build contains one
pub fn entry_address() -> Option<usize> {
    #[cfg(target_os = "none")]
    {
        unsafe extern "C" {
            fn cluu_dispatch_entry();
        }
        Some(cluu_dispatch_entry as usize)
    }
    #[cfg(not(target_os = "none"))]
    {
        None
    }
}
