//! Next-in-line definitions of every intercepted libc symbol.
//!
//! Wrappers forward to the definition that follows this library in symbol
//! lookup order, resolved once with `dlsym(RTLD_NEXT, ..)` during
//! [`crate::interface::__tysan_init`]. Until then (and for symbols the
//! process lacks) each accessor returns `None` and the wrappers fall back to
//! the internal implementations below. `dlsym` itself allocates, which is
//! what the bootstrap buffer in [`EARLY`] is for.

use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use tysan_runtime::EarlyAllocator;

pub(crate) type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub(crate) type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub(crate) type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub(crate) type FreeFn = unsafe extern "C" fn(*mut c_void);
pub(crate) type AlignedFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub(crate) type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
pub(crate) type StrdupFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
pub(crate) type MemsetFn = unsafe extern "C" fn(*mut c_void, c_int, usize) -> *mut c_void;
pub(crate) type MemcpyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> *mut c_void;
pub(crate) type MmapFn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
pub(crate) type Mmap64Fn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off64_t) -> *mut c_void;

/// Bootstrap allocations made before `malloc`/`calloc` are resolved.
pub static EARLY: EarlyAllocator = EarlyAllocator::new();

macro_rules! real_table {
    ($($field:ident : $ty:ty = $sym:literal;)*) => {
        /// Resolved addresses of the next definitions; zero when unresolved.
        pub(crate) struct RealFns {
            $($field: AtomicUsize,)*
        }

        pub(crate) static REAL: RealFns = RealFns {
            $($field: AtomicUsize::new(0),)*
        };

        impl RealFns {
            $(
                #[inline]
                pub(crate) fn $field(&self) -> Option<$ty> {
                    let addr = self.$field.load(Ordering::Acquire);
                    if addr == 0 {
                        return None;
                    }
                    // SAFETY: only ever set from the dlsym result for this
                    // symbol, whose C signature the alias spells out.
                    Some(unsafe { std::mem::transmute::<usize, $ty>(addr) })
                }
            )*

            /// Resolve every symbol; returns how many are missing.
            fn resolve_all(&self) -> usize {
                let mut missing = 0;
                $(
                    // SAFETY: static NUL-terminated symbol name.
                    let addr = unsafe {
                        libc::dlsym(libc::RTLD_NEXT, concat!($sym, "\0").as_ptr().cast())
                    } as usize;
                    if addr == 0 {
                        missing += 1;
                    }
                    self.$field.store(addr, Ordering::Release);
                )*
                missing
            }
        }
    };
}

real_table! {
    malloc: MallocFn = "malloc";
    calloc: CallocFn = "calloc";
    realloc: ReallocFn = "realloc";
    free: FreeFn = "free";
    valloc: MallocFn = "valloc";
    pvalloc: MallocFn = "pvalloc";
    memalign: AlignedFn = "memalign";
    libc_memalign: AlignedFn = "__libc_memalign";
    aligned_alloc: AlignedFn = "aligned_alloc";
    posix_memalign: PosixMemalignFn = "posix_memalign";
    strdup: StrdupFn = "strdup";
    strdup_internal: StrdupFn = "__strdup";
    memset: MemsetFn = "memset";
    memmove: MemcpyFn = "memmove";
    memcpy: MemcpyFn = "memcpy";
    mmap: MmapFn = "mmap";
    mmap64: Mmap64Fn = "mmap64";
}

static MISSING: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Resolve the next definitions and tune the libc allocator. Called once
/// from `__tysan_init` before the runtime is created.
pub fn init_interceptors() {
    let missing = REAL.resolve_all();
    MISSING.store(missing, Ordering::Release);
    tune_libc_malloc();
}

/// Shrink the libc allocator's footprint: no fastbins, mmap from 32 KiB.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn tune_libc_malloc() {
    const M_MXFAST: c_int = 1;
    const M_MMAP_THRESHOLD: c_int = -3;
    // SAFETY: mallopt only adjusts allocator tunables.
    unsafe {
        libc::mallopt(M_MXFAST, 0);
        libc::mallopt(M_MMAP_THRESHOLD, 32 * 1024);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn tune_libc_malloc() {}

/// Number of intercepted symbols without a next definition, or `None`
/// before [`init_interceptors`] ran.
#[must_use]
pub fn missing_symbols() -> Option<usize> {
    match MISSING.load(Ordering::Acquire) {
        usize::MAX => None,
        n => Some(n),
    }
}

// ---------------------------------------------------------------------------
// Internal fallbacks
// ---------------------------------------------------------------------------

/// Byte-wise `memset`. Volatile stores keep it from being lowered back into
/// a `memset` call.
///
/// # Safety
///
/// `dst` must be valid for `size` byte writes.
pub(crate) unsafe fn internal_memset(dst: *mut c_void, v: c_int, size: usize) -> *mut c_void {
    let d = dst.cast::<u8>();
    for i in 0..size {
        // SAFETY: caller guarantees `dst..dst+size` is writable.
        unsafe { d.add(i).write_volatile(v as u8) };
    }
    dst
}

/// Byte-wise overlap-safe copy.
///
/// # Safety
///
/// `src` must be readable and `dst` writable for `size` bytes.
pub(crate) unsafe fn internal_memmove(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
) -> *mut c_void {
    let d = dst.cast::<u8>();
    let s = src.cast::<u8>();
    // SAFETY: caller guarantees both ranges; the direction handles overlap.
    unsafe {
        if (d as usize) < (s as usize) {
            for i in 0..size {
                d.add(i).write_volatile(s.add(i).read_volatile());
            }
        } else {
            for i in (0..size).rev() {
                d.add(i).write_volatile(s.add(i).read_volatile());
            }
        }
    }
    dst
}

/// `mmap` straight through the syscall.
///
/// # Safety
///
/// Same contract as `mmap(2)`.
pub(crate) unsafe fn raw_mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: i64,
) -> *mut c_void {
    // SAFETY: arguments are forwarded unchanged to the kernel.
    let ret = unsafe { libc::syscall(libc::SYS_mmap, addr, length, prot, flags, fd, offset) };
    ret as *mut c_void
}
