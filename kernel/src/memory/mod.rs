/*
 * Memory Management Interface
 *
 * Physical/virtual memory management lives outside the scheduler core. This
 * module is the narrow surface the core consumes:
 * - `AddressSpace`: an opaque per-process page table handle that can be
 *   activated on the executing CPU
 * - `StackAllocator`: kernel stack allocation and release
 * - `KernelStack` / `FpuArea`: owning handles for per-thread memory that
 *   release themselves when the thread is reclaimed
 */

pub mod fpu_area;
pub mod stack;

pub use fpu_area::FpuArea;
pub use stack::KernelStack;

/// Per-process page table handle
pub trait AddressSpace: Send + Sync {
    /// Activate this address space on the executing CPU
    ///
    /// `is_bootstrap` is true for the kernel's own address space.
    fn load(&self, is_bootstrap: bool);
}

/// Source of kernel stacks
pub trait StackAllocator: Sync {
    /// Allocate `size` bytes of kernel stack, returning the lowest address
    fn alloc_kernel_stack(&self, size: usize) -> Option<usize>;

    /// Release a stack previously returned by `alloc_kernel_stack`
    fn free_kernel_stack(&self, base: usize, size: usize);
}
