//! Application-to-shadow address mapping.
//!
//! Every application byte owns one pointer-sized shadow slot at
//!
//! ```text
//! shadow_for(addr) = (addr & app_mask) * size_of::<usize>() + shadow_addr
//! ```
//!
//! The shadow region itself spans `[shadow_addr, app_addr)` and is reserved
//! (not committed) once at init. The constants depend on the architecture and,
//! for aarch64 and powerpc64, on the virtual address width detected at
//! startup from a stack address.

use std::fmt;

use crate::error::InitError;

/// Base/mask constants of one supported address-space layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    /// First byte of the shadow region.
    pub shadow_addr: usize,
    /// First byte past the shadow region; application memory starts here.
    pub app_addr: usize,
    /// Mask applied to an application address before scaling.
    pub app_mask: usize,
}

impl Mapping {
    /// Shadow slot address for `addr`.
    #[inline(always)]
    #[must_use]
    pub const fn shadow_for(&self, addr: usize) -> usize {
        (addr & self.app_mask)
            .wrapping_mul(size_of::<usize>())
            .wrapping_add(self.shadow_addr)
    }

    /// Length in bytes of the shadow region.
    #[must_use]
    pub const fn shadow_len(&self) -> usize {
        self.app_addr - self.shadow_addr
    }

    /// True if `slot` lies inside `[shadow_addr, app_addr)`.
    #[inline]
    #[must_use]
    pub const fn contains_slot(&self, slot: usize) -> bool {
        slot >= self.shadow_addr && slot < self.app_addr
    }

    /// A mapping that folds every address into a `2^bits`-byte window whose
    /// shadow starts at `shadow_addr`.
    ///
    /// Addresses congruent modulo `2^bits` share a slot, so this is only
    /// faithful for application memory spanning less than `2^bits` bytes. It
    /// backs embedders and tests that cannot reserve a fixed layout.
    #[must_use]
    pub const fn windowed(shadow_addr: usize, bits: u32) -> Self {
        let span = 1usize << bits;
        Self {
            shadow_addr,
            app_addr: shadow_addr + span * size_of::<usize>(),
            app_mask: span - 1,
        }
    }
}

/// Architectures with a known shadow layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Mips64,
    Aarch64,
    PowerPc64,
}

impl Arch {
    /// The architecture this runtime was compiled for, if supported.
    #[must_use]
    pub const fn current() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "mips64") {
            Some(Self::Mips64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Self::PowerPc64)
        } else {
            None
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X86_64 => "x86_64",
            Self::Mips64 => "mips64",
            Self::Aarch64 => "aarch64",
            Self::PowerPc64 => "powerpc64",
        };
        f.write_str(name)
    }
}

/// Every supported (architecture, VMA width) layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    X86_64,
    Mips64,
    Aarch64Vma39,
    Aarch64Vma42,
    Aarch64Vma48,
    PowerPc64Vma44,
    PowerPc64Vma46,
}

impl Layout {
    pub const ALL: [Layout; 7] = [
        Layout::X86_64,
        Layout::Mips64,
        Layout::Aarch64Vma39,
        Layout::Aarch64Vma42,
        Layout::Aarch64Vma48,
        Layout::PowerPc64Vma44,
        Layout::PowerPc64Vma46,
    ];

    /// Shadow constants for this layout.
    #[must_use]
    pub const fn mapping(self) -> Mapping {
        let (shadow_addr, app_addr, hole) = match self {
            Self::X86_64 => (0x0100_0000_0000, 0x5500_0000_0000, 0x7800_0000_0000),
            Self::Mips64 => (0x24_0000_0000, 0xfe_0000_0000, 0xf8_0000_0000),
            Self::Aarch64Vma39 => (0x08_0000_0000, 0x55_0000_0000, 0x78_0000_0000),
            Self::Aarch64Vma42 => (0x100_0000_0000, 0x2aa_0000_0000, 0x3c0_0000_0000),
            Self::Aarch64Vma48 => (0x20_0000_0000, 0xaaaa_0000_0000, 0xfff8_0000_0000),
            Self::PowerPc64Vma44 => (0x0b00_0000_0000, 0x0f00_0000_0000, 0x0ff0_0000_0000),
            Self::PowerPc64Vma46 => (0x0100_0000_0000, 0x3d00_0000_0000, 0x3c00_0000_0000),
        };
        Mapping {
            shadow_addr,
            app_addr,
            app_mask: !hole,
        }
    }

    /// Pick the layout for `arch` given the detected VMA width.
    ///
    /// `vma_bits` is ignored on architectures with a single layout.
    pub fn select(arch: Arch, vma_bits: u32) -> Result<Self, InitError> {
        match arch {
            Arch::X86_64 => Ok(Self::X86_64),
            Arch::Mips64 => Ok(Self::Mips64),
            Arch::Aarch64 => match vma_bits {
                39 => Ok(Self::Aarch64Vma39),
                42 => Ok(Self::Aarch64Vma42),
                48 => Ok(Self::Aarch64Vma48),
                found => Err(InitError::UnsupportedVma {
                    found,
                    supported: "39, 42 and 48",
                }),
            },
            Arch::PowerPc64 => match vma_bits {
                44 => Ok(Self::PowerPc64Vma44),
                46 => Ok(Self::PowerPc64Vma46),
                found => Err(InitError::UnsupportedVma {
                    found,
                    supported: "44 and 46",
                }),
            },
        }
    }
}

/// Number of significant bits in `addr` (index of the top set bit plus one).
#[inline]
#[must_use]
pub const fn vma_bits_for_address(addr: usize) -> u32 {
    usize::BITS - addr.leading_zeros()
}

/// Address of a slot in the caller's stack frame.
#[inline(never)]
#[must_use]
pub fn current_frame_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Detect the layout of the running process.
pub fn detect_layout() -> Result<(Layout, u32), InitError> {
    let arch = Arch::current().ok_or(InitError::UnsupportedPlatform)?;
    let vma_bits = vma_bits_for_address(current_frame_address());
    let layout = Layout::select(arch, vma_bits)?;
    Ok((layout, vma_bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_constants_match_layout_table() {
        let m = Layout::X86_64.mapping();
        assert_eq!(m.shadow_addr, 0x0100_0000_0000);
        assert_eq!(m.app_addr, 0x5500_0000_0000);
        assert_eq!(m.app_mask, !0x7800_0000_0000usize);
    }

    #[test]
    fn aarch64_vma48_constants_match_layout_table() {
        let m = Layout::Aarch64Vma48.mapping();
        assert_eq!(m.shadow_addr, 0x20_0000_0000);
        assert_eq!(m.app_addr, 0xaaaa_0000_0000);
        assert_eq!(m.app_mask, !0xfff8_0000_0000usize);
    }

    #[test]
    fn shadow_for_scales_by_word_size() {
        let m = Layout::X86_64.mapping();
        let base = 0x7f12_3456_7000usize;
        assert_eq!(m.shadow_for(base + 1) - m.shadow_for(base), 8);
        assert_eq!(m.shadow_for(base + 64) - m.shadow_for(base), 64 * 8);
    }

    #[test]
    fn user_space_addresses_land_inside_reserved_shadow() {
        for layout in [Layout::X86_64] {
            let m = layout.mapping();
            for addr in [0x1000usize, 0x5555_5555_0000, 0x7fff_ffff_f000] {
                assert!(m.contains_slot(m.shadow_for(addr)), "{addr:#x}");
            }
        }
    }

    #[test]
    fn shadow_region_precedes_app_region_for_every_layout() {
        for layout in Layout::ALL {
            let m = layout.mapping();
            assert!(m.shadow_addr < m.app_addr, "{layout:?}");
            assert!(m.shadow_len() > 0);
        }
    }

    #[test]
    fn fixed_layouts_ignore_vma_width() {
        assert_eq!(Layout::select(Arch::X86_64, 12).unwrap(), Layout::X86_64);
        assert_eq!(Layout::select(Arch::Mips64, 0).unwrap(), Layout::Mips64);
    }

    #[test]
    fn aarch64_selects_by_vma_width() {
        assert_eq!(Layout::select(Arch::Aarch64, 39).unwrap(), Layout::Aarch64Vma39);
        assert_eq!(Layout::select(Arch::Aarch64, 42).unwrap(), Layout::Aarch64Vma42);
        assert_eq!(Layout::select(Arch::Aarch64, 48).unwrap(), Layout::Aarch64Vma48);
        match Layout::select(Arch::Aarch64, 47) {
            Err(InitError::UnsupportedVma { found, supported }) => {
                assert_eq!(found, 47);
                assert_eq!(supported, "39, 42 and 48");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn powerpc64_selects_by_vma_width() {
        assert_eq!(Layout::select(Arch::PowerPc64, 44).unwrap(), Layout::PowerPc64Vma44);
        assert_eq!(Layout::select(Arch::PowerPc64, 46).unwrap(), Layout::PowerPc64Vma46);
        assert!(Layout::select(Arch::PowerPc64, 48).is_err());
    }

    #[test]
    fn vma_bits_is_msb_index_plus_one() {
        assert_eq!(vma_bits_for_address(0), 0);
        assert_eq!(vma_bits_for_address(1), 1);
        assert_eq!(vma_bits_for_address(0x7fff_ffff_f000), 47);
        assert_eq!(vma_bits_for_address(0x0000_ffff_ffff_f000), 48);
    }

    #[test]
    fn windowed_mapping_folds_addresses_into_window() {
        let m = Mapping::windowed(0x1000_0000, 12);
        assert_eq!(m.shadow_len(), 4096 * 8);
        assert_eq!(m.shadow_for(0x5_0003), 0x1000_0000 + 3 * 8);
        assert!(m.contains_slot(m.shadow_for(usize::MAX)));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn detect_layout_on_x86_64() {
        let (layout, bits) = detect_layout().unwrap();
        assert_eq!(layout, Layout::X86_64);
        assert!(bits > 0);
    }
}
