/*
 * Owned kernel stack
 */

use super::StackAllocator;

/// A kernel stack returned to its allocator when dropped
pub struct KernelStack {
    base: usize,
    size: usize,
    allocator: &'static dyn StackAllocator,
}

impl KernelStack {
    /// Allocate a stack of `size` bytes, or `None` if the allocator is exhausted
    pub fn allocate(allocator: &'static dyn StackAllocator, size: usize) -> Option<Self> {
        let base = allocator.alloc_kernel_stack(size)?;
        Some(Self {
            base,
            size,
            allocator,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Initial stack pointer: one past the highest byte, 16-byte aligned
    pub fn top(&self) -> usize {
        (self.base + self.size) & !0xF
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        self.allocator.free_kernel_stack(self.base, self.size);
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelStack")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}
