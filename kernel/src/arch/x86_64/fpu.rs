/*
 * x86_64 FPU / SSE / AVX state handling
 *
 * Threads get a save area sized from CPUID: 512 bytes for FXSAVE, or the
 * XSAVE size for the features enabled in XCR0 when the OS has turned on
 * XSAVE (CR4.OSXSAVE). The area is seeded with the default control words
 * (x87 FCW 0x037F, MXCSR 0x1F80) so a fresh user thread starts with the
 * same FPU configuration as after FNINIT.
 */

use lazy_static::lazy_static;
use x86::cpuid::CpuId;

/// Size of the legacy FXSAVE region
pub const FXSAVE_AREA_SIZE: usize = 512;

const FCW_OFFSET: usize = 0;
const MXCSR_OFFSET: usize = 24;
const MXCSR_MASK_OFFSET: usize = 28;

const DEFAULT_FCW: u16 = 0x037F;
const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_MXCSR_MASK: u32 = 0xFFFF;

lazy_static! {
    /// Legacy region of a freshly initialized FPU
    static ref DEFAULT_FXSAVE_IMAGE: [u8; FXSAVE_AREA_SIZE] = {
        let mut image = [0u8; FXSAVE_AREA_SIZE];
        image[FCW_OFFSET..FCW_OFFSET + 2].copy_from_slice(&DEFAULT_FCW.to_le_bytes());
        image[MXCSR_OFFSET..MXCSR_OFFSET + 4].copy_from_slice(&DEFAULT_MXCSR.to_le_bytes());
        image[MXCSR_MASK_OFFSET..MXCSR_MASK_OFFSET + 4]
            .copy_from_slice(&DEFAULT_MXCSR_MASK.to_le_bytes());
        image
    };
}

/// Save/restore instruction family in use on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuMode {
    Fxsave,
    Xsave { area_size: usize },
}

impl FpuMode {
    /// Pick XSAVE when the CPU supports it and the OS enabled it
    pub fn detect() -> Self {
        let cpuid = CpuId::new();
        let xsave_enabled = cpuid
            .get_feature_info()
            .is_some_and(|info| info.has_xsave() && info.has_oxsave());
        if !xsave_enabled {
            return FpuMode::Fxsave;
        }
        match cpuid.get_extended_state_info() {
            Some(info) => {
                let size = info.xsave_area_size_enabled_features() as usize;
                FpuMode::Xsave {
                    area_size: size.max(FXSAVE_AREA_SIZE + 64),
                }
            }
            None => FpuMode::Fxsave,
        }
    }

    pub fn area_size(&self) -> usize {
        match self {
            FpuMode::Fxsave => FXSAVE_AREA_SIZE,
            FpuMode::Xsave { area_size } => *area_size,
        }
    }

    /// Write the default control state into a zeroed area
    ///
    /// The XSAVE header stays zero, so XRSTOR puts every extended component
    /// in its init state.
    pub fn init_area(&self, area: &mut [u8]) {
        let len = area.len().min(FXSAVE_AREA_SIZE);
        area[..len].copy_from_slice(&DEFAULT_FXSAVE_IMAGE[..len]);
    }

    /// # Safety
    /// `area` must be 64-byte aligned and at least `area_size()` bytes.
    pub unsafe fn save(&self, area: &mut [u8]) {
        let ptr = area.as_mut_ptr();
        match self {
            FpuMode::Fxsave => unsafe {
                core::arch::asm!("fxsave64 [{}]", in(reg) ptr, options(nostack, preserves_flags));
            },
            FpuMode::Xsave { .. } => unsafe {
                core::arch::asm!(
                    "xsave64 [{}]",
                    in(reg) ptr,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack, preserves_flags),
                );
            },
        }
    }

    /// # Safety
    /// `area` must be 64-byte aligned, at least `area_size()` bytes and hold a
    /// valid image produced by `save` or `init_area`.
    pub unsafe fn restore(&self, area: &[u8]) {
        let ptr = area.as_ptr();
        match self {
            FpuMode::Fxsave => unsafe {
                core::arch::asm!("fxrstor64 [{}]", in(reg) ptr, options(nostack, preserves_flags));
            },
            FpuMode::Xsave { .. } => unsafe {
                core::arch::asm!(
                    "xrstor64 [{}]",
                    in(reg) ptr,
                    in("eax") u32::MAX,
                    in("edx") u32::MAX,
                    options(nostack, preserves_flags),
                );
            },
        }
    }
}
