//! Compiler-to-runtime interface.
//!
//! Instrumented code calls `__tysan_check` around typed accesses and may
//! inline the shadow computation itself using the two exported mapping
//! globals. `tysan_set_type_unknown` and `tysan_copy_types` are the shadow
//! primitives shared with the interceptors.

#![allow(non_upper_case_globals)]

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tysan_runtime::descriptor::RawTypeDescriptor;
use tysan_runtime::report;
use tysan_runtime::runtime::{self, Runtime, RuntimeOptions};
use tysan_runtime::{Access, AccessKind, Flags, InitError, Mapping, StackFrame, TypeRef};

use crate::interception;

/// Base of the shadow region; zero until initialized.
#[unsafe(no_mangle)]
pub static __tysan_shadow_memory_address: AtomicUsize = AtomicUsize::new(0);

/// Mask applied to application addresses before scaling.
#[unsafe(no_mangle)]
pub static __tysan_app_memory_mask: AtomicUsize = AtomicUsize::new(0);

/// Publish `mapping` through the exported globals.
pub fn publish_mapping(mapping: Mapping) {
    __tysan_shadow_memory_address.store(mapping.shadow_addr, Ordering::Release);
    __tysan_app_memory_mask.store(mapping.app_mask, Ordering::Release);
}

// ABI init states.
const INIT_UNINIT: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_DONE: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_UNINIT);

thread_local! {
    static INIT_ON_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether `__tysan_init` is in progress on some thread.
#[inline]
#[must_use]
pub fn init_is_running() -> bool {
    INIT_STATE.load(Ordering::Acquire) == INIT_RUNNING
}

/// The runtime, initializing it on first use. `None` while initialization
/// is in progress, so wrappers called from inside it pass straight through.
#[inline]
pub(crate) fn active_runtime() -> Option<&'static Runtime> {
    if let Some(rt) = runtime::get() {
        return Some(rt);
    }
    if INIT_STATE.load(Ordering::Acquire) != INIT_UNINIT {
        return None;
    }
    // SAFETY: no preconditions; reentry is routed through INIT_STATE.
    unsafe { __tysan_init() };
    runtime::get()
}

/// Initialize the runtime: resolve interceptors, parse `TYSAN_OPTIONS`,
/// detect the layout, reserve the shadow and publish the mapping globals.
///
/// Idempotent. A call from inside its own initialization is fatal; calls
/// from other threads wait for it to finish.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tysan_init() {
    loop {
        match INIT_STATE.compare_exchange(
            INIT_UNINIT,
            INIT_RUNNING,
            Ordering::SeqCst,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(INIT_DONE) => return,
            Err(_) => {
                if INIT_ON_THIS_THREAD.with(Cell::get) {
                    report::fatal(&InitError::Reentrant, 1);
                }
                std::thread::yield_now();
            }
        }
    }
    INIT_ON_THIS_THREAD.with(|f| f.set(true));

    interception::init_interceptors();

    let options = RuntimeOptions::from_env().on_shadow_ready(publish_mapping);
    let exitcode = Flags::from_source(&options.options).0.exitcode;
    match runtime::initialize(options) {
        Ok(rt) => {
            // Covers a runtime installed before the ABI initialized.
            publish_mapping(rt.shadow().mapping());
            rt.reporter().log(
                2,
                format_args!(
                    "interceptors resolved ({} missing)",
                    interception::missing_symbols().unwrap_or(0)
                ),
            );
        }
        Err(err) => report::fatal(&err, exitcode),
    }

    INIT_ON_THIS_THREAD.with(|f| f.set(false));
    INIT_STATE.store(INIT_DONE, Ordering::Release);
}

/// Initialize as the library loads.
#[cfg(all(not(test), not(debug_assertions), target_os = "linux"))]
#[used]
#[unsafe(link_section = ".init_array")]
static TYSAN_INIT_ARRAY_ENTRY: extern "C" fn() = init_from_loader;

#[cfg(all(not(test), not(debug_assertions), target_os = "linux"))]
extern "C" fn init_from_loader() {
    // SAFETY: runs once from the loader before any other thread exists.
    unsafe { __tysan_init() }
}

/// Check an access of `size` bytes at `addr` typed `td` (null = unknown).
/// `flags` bit 0 marks a read, bit 1 a write. Reports carry the registers of
/// the instrumented caller.
///
/// # Safety
///
/// `td` must be null or a compiler-emitted descriptor.
#[unsafe(no_mangle)]
#[inline(never)]
pub unsafe extern "C" fn __tysan_check(
    addr: *mut c_void,
    size: c_int,
    td: *const RawTypeDescriptor,
    flags: c_int,
) {
    let frame = StackFrame::capture_caller();
    let Some(rt) = active_runtime() else {
        return;
    };
    let access = Access {
        addr: addr as usize,
        size: size.max(0) as usize,
        // SAFETY: caller contract.
        ty: unsafe { TypeRef::from_raw(td) },
        kind: AccessKind::from_flags(flags),
    };
    rt.check(&access, &frame);
}

/// Mark `[addr, addr + size)` as untyped.
#[unsafe(no_mangle)]
pub extern "C" fn tysan_set_type_unknown(addr: *const c_void, size: usize) {
    if let Some(rt) = active_runtime() {
        rt.set_type_unknown(addr as usize, size);
    }
}

/// Copy the shadow of `[saddr, saddr + size)` onto `[daddr, daddr + size)`.
#[unsafe(no_mangle)]
pub extern "C" fn tysan_copy_types(daddr: *const c_void, saddr: *const c_void, size: usize) {
    if let Some(rt) = active_runtime() {
        rt.copy_types(daddr as usize, saddr as usize, size);
    }
}
