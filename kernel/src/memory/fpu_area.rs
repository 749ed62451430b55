/*
 * FPU / extended state save area
 *
 * XSAVE requires 64-byte alignment, so the area is allocated directly from
 * the global allocator with that alignment rather than as a `Vec<u8>`.
 */

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;

const FPU_AREA_ALIGN: usize = 64;

pub struct FpuArea {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Plain owned bytes.
unsafe impl Send for FpuArea {}
unsafe impl Sync for FpuArea {}

impl FpuArea {
    /// Zeroed area of `size` bytes, `None` if `size` is zero or memory is exhausted
    pub fn zeroed(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, FPU_AREA_ALIGN).ok()?;
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for FpuArea {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for FpuArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FpuArea({} bytes)", self.len())
    }
}
