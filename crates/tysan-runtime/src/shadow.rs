//! Shadow memory store.
//!
//! One word per application byte, holding one of:
//!
//! - `0`: type unknown,
//! - `usize::MAX` ([`INTERIOR`]): this byte is inside a typed object whose
//!   descriptor lives in an earlier slot,
//! - anything else: the descriptor of the object starting at this byte.
//!
//! Slots are read and written with relaxed atomics. There is no locking:
//! concurrent unsynchronized accesses to the same application bytes race on
//! their slots exactly as they race on the data, which can surface as a
//! spurious or missed report but never as undefined behavior in the runtime.
//! Atomic stores also keep the fill/copy loops from being lowered into calls
//! to the intercepted `memset`/`memmove`.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::descriptor::TypeRef;
use crate::error::InitError;
use crate::mapping::{Layout, Mapping};

/// Slot value marking a non-initial byte of a typed object.
pub const INTERIOR: usize = usize::MAX;
/// Slot value for "type unknown".
pub const UNKNOWN: usize = 0;

/// Decoded slot contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Unknown,
    Interior,
    Type(TypeRef),
}

impl Slot {
    /// Decode a slot word read from a [`ShadowMemory`]. Only words the store
    /// itself wrote are valid input.
    #[inline]
    #[must_use]
    pub(crate) fn from_raw(word: usize) -> Self {
        match word {
            UNKNOWN => Self::Unknown,
            INTERIOR => Self::Interior,
            // SAFETY: non-sentinel slot values are only ever written from
            // valid descriptor handles.
            _ => match unsafe { TypeRef::from_raw(word as *const _) } {
                Some(td) => Self::Type(td),
                None => Self::Unknown,
            },
        }
    }

    /// The stored descriptor, `None` for unknown (and interior) slots.
    #[inline]
    #[must_use]
    pub fn descriptor(self) -> Option<TypeRef> {
        match self {
            Self::Type(td) => Some(td),
            Self::Unknown | Self::Interior => None,
        }
    }
}

/// A reserved shadow region plus the mapping that addresses it.
///
/// Construction reserves `[shadow_addr, app_addr)`. Addresses whose slot
/// falls outside that range (kernel or non-canonical addresses under a fixed
/// layout) have no shadow: they read as unknown and writes to them are
/// dropped.
#[derive(Debug)]
pub struct ShadowMemory {
    mapping: Mapping,
}

impl ShadowMemory {
    /// Reserve the fixed shadow range of `layout` at its architectural
    /// address. Pages are committed lazily on first touch.
    pub fn reserve_fixed(layout: Layout) -> Result<Self, InitError> {
        let mapping = layout.mapping();
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE;
        // SAFETY: the shadow range is reserved for the runtime by layout
        // design; MAP_FIXED places it exactly there.
        let addr = unsafe {
            map_shadow(mapping.shadow_addr as *mut libc::c_void, mapping.shadow_len(), flags)
        }?;
        debug_assert_eq!(addr, mapping.shadow_addr);
        Ok(Self { mapping })
    }

    /// Reserve a `8 << bits`-byte shadow anywhere and address it with
    /// [`Mapping::windowed`].
    pub fn reserve_window(bits: u32) -> Result<Self, InitError> {
        if !(1..=32).contains(&bits) {
            return Err(InitError::InvalidWindow(bits));
        }
        let len = (1usize << bits) * size_of::<usize>();
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        // SAFETY: a non-fixed anonymous mapping cannot clobber existing memory.
        let addr = unsafe { map_shadow(std::ptr::null_mut(), len, flags) }?;
        Ok(Self {
            mapping: Mapping::windowed(addr, bits),
        })
    }

    #[inline]
    #[must_use]
    pub fn mapping(&self) -> Mapping {
        self.mapping
    }

    #[inline(always)]
    fn slot(&self, addr: usize) -> Option<&AtomicUsize> {
        let slot = self.mapping.shadow_for(addr);
        if !self.mapping.contains_slot(slot) {
            return None;
        }
        // SAFETY: `slot` lies in `[shadow_addr, app_addr)`, which the
        // constructor reserved and nothing unmaps.
        Some(unsafe { &*(slot as *const AtomicUsize) })
    }

    #[inline(always)]
    fn store(&self, addr: usize, word: usize) {
        if let Some(slot) = self.slot(addr) {
            slot.store(word, Ordering::Relaxed);
        }
    }

    /// Raw slot word for `addr`; [`UNKNOWN`] when `addr` has no shadow.
    #[inline]
    #[must_use]
    pub fn raw_slot(&self, addr: usize) -> usize {
        self.slot(addr)
            .map_or(UNKNOWN, |slot| slot.load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn load(&self, addr: usize) -> Slot {
        Slot::from_raw(self.raw_slot(addr))
    }

    /// Mark `[addr, addr + size)` as untyped.
    pub fn set_type_unknown(&self, addr: usize, size: usize) {
        for i in 0..size {
            self.store(addr.wrapping_add(i), UNKNOWN);
        }
    }

    /// Copy the slots of `[src, src + size)` onto `[dst, dst + size)`.
    /// Overlapping ranges behave like `memmove`.
    pub fn copy_types(&self, dst: usize, src: usize, size: usize) {
        if dst == src || size == 0 {
            return;
        }
        let copy = |i: usize| {
            let word = self.raw_slot(src.wrapping_add(i));
            self.store(dst.wrapping_add(i), word);
        };
        if dst < src {
            (0..size).for_each(copy);
        } else {
            (0..size).rev().for_each(copy);
        }
    }

    /// Record an object of type `ty` spanning `[addr, addr + size)`: the first
    /// slot gets the descriptor, the rest become [`INTERIOR`].
    pub fn set_type(&self, addr: usize, ty: TypeRef, size: usize) {
        if size == 0 {
            return;
        }
        self.store(addr, ty.addr());
        for i in 1..size {
            self.store(addr.wrapping_add(i), INTERIOR);
        }
    }

    /// Snapshot of the raw slot words for `[addr, addr + size)`.
    #[must_use]
    pub fn raw_slots(&self, addr: usize, size: usize) -> Vec<usize> {
        (0..size).map(|i| self.raw_slot(addr.wrapping_add(i))).collect()
    }
}

/// Reserve an anonymous read/write region and exclude it from core dumps.
///
/// # Safety
///
/// With `MAP_FIXED` in `flags`, the caller guarantees nothing else lives in
/// `[hint, hint + len)`.
unsafe fn map_shadow(
    hint: *mut libc::c_void,
    len: usize,
    flags: libc::c_int,
) -> Result<usize, InitError> {
    // SAFETY: anonymous mapping; placement contract is the caller's.
    let ret = unsafe {
        libc::mmap(hint, len, libc::PROT_READ | libc::PROT_WRITE, flags, -1, 0)
    };
    if ret == libc::MAP_FAILED {
        return Err(InitError::ShadowReservation {
            addr: hint as usize,
            len,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    exclude_from_core_dumps(ret, len);
    Ok(ret as usize)
}

#[cfg(target_os = "linux")]
fn exclude_from_core_dumps(addr: *mut libc::c_void, len: usize) {
    // SAFETY: advice on a mapping owned by the runtime.
    unsafe {
        libc::madvise(addr, len, libc::MADV_DONTDUMP);
    }
}

#[cfg(not(target_os = "linux"))]
fn exclude_from_core_dumps(_addr: *mut libc::c_void, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorArena;

    fn window() -> ShadowMemory {
        ShadowMemory::reserve_window(16).unwrap()
    }

    #[test]
    fn fresh_window_reads_unknown() {
        let shadow = window();
        let buf = [0u8; 64];
        let p = buf.as_ptr() as usize;
        assert!(shadow.raw_slots(p, 64).iter().all(|&w| w == UNKNOWN));
        assert_eq!(shadow.load(p), Slot::Unknown);
    }

    #[test]
    fn set_type_writes_head_and_interior() {
        let arena = DescriptorArena::new();
        let int = arena.scalar("int").unwrap();
        let shadow = window();
        let buf = [0u8; 16];
        let p = buf.as_ptr() as usize;

        shadow.set_type(p, int, 4);
        assert_eq!(shadow.load(p), Slot::Type(int));
        for i in 1..4 {
            assert_eq!(shadow.load(p + i), Slot::Interior);
        }
        assert_eq!(shadow.load(p + 4), Slot::Unknown);
    }

    #[test]
    fn set_type_unknown_clears_range_only() {
        let arena = DescriptorArena::new();
        let long = arena.scalar("long").unwrap();
        let shadow = window();
        let buf = [0u8; 32];
        let p = buf.as_ptr() as usize;

        shadow.set_type(p, long, 8);
        shadow.set_type(p + 8, long, 8);
        shadow.set_type_unknown(p, 8);
        assert!(shadow.raw_slots(p, 8).iter().all(|&w| w == UNKNOWN));
        assert_eq!(shadow.load(p + 8), Slot::Type(long));
    }

    #[test]
    fn copy_types_handles_overlap_in_both_directions() {
        let arena = DescriptorArena::new();
        let a = arena.scalar("a").unwrap();
        let b = arena.scalar("b").unwrap();
        let shadow = window();
        let buf = [0u8; 64];
        let p = buf.as_ptr() as usize;

        shadow.set_type(p, a, 4);
        shadow.set_type(p + 4, b, 4);
        let before = shadow.raw_slots(p, 8);

        shadow.copy_types(p + 2, p, 8);
        assert_eq!(shadow.raw_slots(p + 2, 8), before);

        shadow.set_type_unknown(p, 16);
        shadow.set_type(p + 8, a, 4);
        shadow.set_type(p + 12, b, 4);
        let before = shadow.raw_slots(p + 8, 8);
        shadow.copy_types(p + 5, p + 8, 8);
        assert_eq!(shadow.raw_slots(p + 5, 8), before);
    }

    #[test]
    fn slot_decoding() {
        assert_eq!(Slot::from_raw(UNKNOWN), Slot::Unknown);
        assert_eq!(Slot::from_raw(INTERIOR), Slot::Interior);
        assert_eq!(Slot::Interior.descriptor(), None);
    }

    #[test]
    fn addresses_without_shadow_read_unknown_and_ignore_writes() {
        // Nothing is reserved: only slot-less addresses may be touched.
        let shadow = ShadowMemory {
            mapping: Layout::X86_64.mapping(),
        };
        let arena = DescriptorArena::new();
        let int = arena.scalar("int").unwrap();
        let kernel = 0xffff_8000_0000_1000usize;
        let high_half = 0x0000_8000_0000_0000usize;
        for addr in [kernel, high_half] {
            assert!(!shadow.mapping().contains_slot(shadow.mapping().shadow_for(addr)));
            shadow.set_type(addr, int, 4);
            shadow.set_type_unknown(addr, 4);
            shadow.copy_types(addr + 64, addr, 4);
            assert_eq!(shadow.raw_slot(addr), UNKNOWN);
            assert_eq!(shadow.load(addr), Slot::Unknown);
            assert_eq!(shadow.raw_slots(addr, 4), vec![UNKNOWN; 4]);
        }
    }

    #[test]
    fn invalid_window_is_rejected() {
        assert!(matches!(
            ShadowMemory::reserve_window(0),
            Err(InitError::InvalidWindow(0))
        ));
        assert!(matches!(
            ShadowMemory::reserve_window(60),
            Err(InitError::InvalidWindow(60))
        ));
    }
}
