//! ABI layer for the memory and string copy family.
//!
//! `memset` leaves its destination untyped. `memmove`, `memcpy` and the
//! `strdup` pair carry the source's shadow over to the destination.

use std::ffi::{c_char, c_int, c_void};

use crate::interception::{REAL, internal_memmove, internal_memset};
use crate::interface::active_runtime;

#[inline]
fn copy_shadow(dst: *const c_void, src: *const c_void, size: usize) {
    if let Some(rt) = active_runtime() {
        rt.copy_types(dst as usize, src as usize, size);
    }
}

// ---------------------------------------------------------------------------
// memset / memmove / memcpy
// ---------------------------------------------------------------------------

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memset(dst: *mut c_void, c: c_int, n: usize) -> *mut c_void {
    let res = match REAL.memset() {
        // SAFETY: forwarded to the next definition with the caller's arguments.
        Some(real) => unsafe { real(dst, c, n) },
        // SAFETY: caller guarantees `dst` is writable for `n` bytes.
        None => unsafe { internal_memset(dst, c, n) },
    };
    if let Some(rt) = active_runtime() {
        rt.set_type_unknown(dst as usize, n);
    }
    res
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    let res = match REAL.memmove() {
        // SAFETY: forwarded to the next definition with the caller's arguments.
        Some(real) => unsafe { real(dst, src, n) },
        // SAFETY: caller guarantees both ranges.
        None => unsafe { internal_memmove(dst, src, n) },
    };
    copy_shadow(dst, src, n);
    res
}

/// `memcpy`. Types are copied with `memmove` semantics, so overlapping
/// calls still leave a consistent shadow.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    let res = match REAL.memcpy() {
        // SAFETY: forwarded to the next definition with the caller's arguments.
        Some(real) => unsafe { real(dst, src, n) },
        // SAFETY: caller guarantees both ranges.
        None => unsafe { internal_memmove(dst, src, n) },
    };
    copy_shadow(dst, src, n);
    res
}

// ---------------------------------------------------------------------------
// strdup
// ---------------------------------------------------------------------------

/// # Safety
///
/// `s` must be a valid NUL-terminated string.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
    let Some(real) = REAL.strdup() else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(s) };
    if !res.is_null() {
        // SAFETY: `s` is NUL-terminated per the caller contract.
        let len = unsafe { libc::strlen(s) };
        copy_shadow(res.cast_const().cast(), s.cast(), len);
    }
    res
}

/// glibc alias of `strdup`.
///
/// # Safety
///
/// `s` must be a valid NUL-terminated string.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __strdup(s: *const c_char) -> *mut c_char {
    let Some(real) = REAL.strdup_internal().or_else(|| REAL.strdup()) else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded to the next definition with the caller's arguments.
    let res = unsafe { real(s) };
    if !res.is_null() {
        // SAFETY: `s` is NUL-terminated per the caller contract.
        let len = unsafe { libc::strlen(s) };
        copy_shadow(res.cast_const().cast(), s.cast(), len);
    }
    res
}
