// Interceptors take raw pointers straight from C callers with the libc
// contracts of the functions they replace.
#![allow(clippy::missing_safety_doc)]
//! # tysan-abi
//!
//! C ABI boundary of the type sanitizer. Produces `libtysan_abi.so`, which
//! instrumented programs link (or `LD_PRELOAD`) to get:
//!
//! - the compiler interface (`__tysan_init`, `__tysan_check`, the exported
//!   shadow mapping globals and the shadow primitives), and
//! - libc interceptors that keep the shadow in step with allocation, copy,
//!   fill and mapping calls.
//!
//! ```text
//! instrumented code -> __tysan_check -> tysan-runtime check -> report
//! libc call -> interceptor -> next definition (dlsym RTLD_NEXT) -> shadow update
//! ```
//!
//! Interceptor symbols are only exported in release builds so debug test
//! binaries keep using the host libc directly.

pub mod interception;
pub mod interface;
pub mod malloc_abi;
pub mod mmap_abi;
pub mod string_abi;
