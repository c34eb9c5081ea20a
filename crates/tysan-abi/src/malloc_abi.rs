//! ABI layer for the allocation family.
//!
//! Every successful allocation resets the shadow of the returned block to
//! "unknown" for the requested size. `free` leaves the shadow alone; the
//! next allocation that reuses the memory resets it.

use std::ffi::{c_int, c_void};

use tysan_runtime::runtime::Runtime;

use crate::interception::{EARLY, REAL, internal_memmove};
use crate::interface::active_runtime;

#[inline]
fn mark_unknown(rt: Option<&Runtime>, ptr: *mut c_void, size: usize) {
    if let Some(rt) = rt
        && !ptr.is_null()
    {
        rt.set_type_unknown(ptr as usize, size);
    }
}

fn early_alloc(size: usize) -> *mut c_void {
    EARLY
        .allocate(size)
        .map_or(std::ptr::null_mut(), |p| p.as_ptr().cast())
}

// ---------------------------------------------------------------------------
// malloc / calloc / realloc / free
// ---------------------------------------------------------------------------

/// `malloc`. Served from the bootstrap buffer until the real allocator is
/// resolved.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.malloc() else {
        return early_alloc(size);
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(size) };
    mark_unknown(rt, res, size);
    res
}

/// `calloc`. Bootstrap blocks are zero-filled already.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.calloc() else {
        return match nmemb.checked_mul(size) {
            Some(total) => early_alloc(total),
            None => std::ptr::null_mut(),
        };
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(nmemb, size) };
    mark_unknown(rt, res, nmemb.wrapping_mul(size));
    res
}

/// `realloc`. The new block's shadow is reset, not carried over.
///
/// Bootstrap blocks are never handed to libc: they are copied into a fresh
/// block (as many bytes as remain in the buffer after `ptr`, capped at
/// `size`).
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if EARLY.contains(ptr.cast_const().cast()) {
        // SAFETY: plain allocation through this module.
        let fresh = unsafe { malloc(size) };
        if !fresh.is_null() {
            let n = size.min(EARLY.bytes_after(ptr.cast_const().cast()));
            // SAFETY: `ptr` has `n` readable bytes left in the buffer and
            // `fresh` was just allocated with room for `size >= n`.
            unsafe { internal_memmove(fresh, ptr, n) };
        }
        return fresh;
    }

    let rt = active_runtime();
    let Some(real) = REAL.realloc() else {
        // Nothing outside the bootstrap buffer can exist yet.
        return early_alloc(size);
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(ptr, size) };
    mark_unknown(rt, res, size);
    res
}

/// `free`. Bootstrap blocks are never released.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || EARLY.contains(ptr.cast_const().cast()) {
        return;
    }
    if let Some(real) = REAL.free() {
        // SAFETY: `ptr` came from the real allocator.
        unsafe { real(ptr) };
    }
}

// ---------------------------------------------------------------------------
// aligned and page allocations
// ---------------------------------------------------------------------------

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.valloc() else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(size) };
    mark_unknown(rt, res, size);
    res
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.pvalloc() else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(size) };
    mark_unknown(rt, res, size);
    res
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.memalign() else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(alignment, size) };
    mark_unknown(rt, res, size);
    res
}

/// glibc-internal `memalign` used by the dynamic loader; falls back to
/// `memalign` when the process has no separate definition.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __libc_memalign(alignment: usize, size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.libc_memalign().or_else(|| REAL.memalign()) else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(alignment, size) };
    mark_unknown(rt, res, size);
    res
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let rt = active_runtime();
    let Some(real) = REAL.aligned_alloc() else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(alignment, size) };
    mark_unknown(rt, res, size);
    res
}

/// `posix_memalign`. The shadow is reset only when the call succeeds.
///
/// # Safety
///
/// `memptr` must be valid for a pointer write.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    let rt = active_runtime();
    let Some(real) = REAL.posix_memalign() else {
        return libc::ENOMEM;
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(memptr, alignment, size) };
    if res == 0 && !memptr.is_null() {
        // SAFETY: success means libc stored the block through `memptr`.
        mark_unknown(rt, unsafe { *memptr }, size);
    }
    res
}
