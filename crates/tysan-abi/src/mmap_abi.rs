//! ABI layer for anonymous and file mappings.
//!
//! A successful mapping is untyped over its whole page-rounded length.

use std::ffi::{c_int, c_void};

use crate::interception::{REAL, raw_mmap};
use crate::interface::active_runtime;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

fn mark_mapped(res: *mut c_void, length: usize) {
    if res == libc::MAP_FAILED {
        return;
    }
    let Some(rt) = active_runtime() else {
        return;
    };
    let len = length
        .checked_next_multiple_of(page_size())
        .unwrap_or(length);
    rt.set_type_unknown(res as usize, len);
}

/// # Safety
///
/// Same contract as `mmap(2)`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let res = match REAL.mmap() {
        // SAFETY: forwarded to the next definition with the caller's arguments.
        Some(real) => unsafe { real(addr, length, prot, flags, fd, offset) },
        // SAFETY: same contract, straight to the kernel.
        None => unsafe { raw_mmap(addr, length, prot, flags, fd, offset as i64) },
    };
    mark_mapped(res, length);
    res
}

/// # Safety
///
/// Same contract as `mmap(2)`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    let res = match REAL.mmap64() {
        // SAFETY: forwarded to the next definition with the caller's arguments.
        Some(real) => unsafe { real(addr, length, prot, flags, fd, offset) },
        // SAFETY: same contract, straight to the kernel.
        None => unsafe { raw_mmap(addr, length, prot, flags, fd, offset as i64) },
    };
    mark_mapped(res, length);
    res
}
