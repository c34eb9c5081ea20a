//! # tysan-runtime
//!
//! Runtime core of a type-based aliasing violation detector.
//!
//! Every byte of application memory has one word-sized shadow slot recording
//! which type descriptor last defined it. Instrumented code calls into the
//! runtime before each typed access; the runtime compares the incoming type
//! against the stored one and reports accesses that alias incompatible types.
//!
//! # Architecture
//!
//! ```text
//! instrumented access -> check_access -> is_aliasing_legal -> Reporter
//!                              |
//!                        ShadowMemory (Mapping::shadow_for)
//!
//! libc interceptor (tysan-abi) -> ShadowMemory::{set_type_unknown, copy_types}
//! ```
//!
//! This crate exports no C symbols. The `tysan-abi` crate owns the
//! compiler-facing ABI and the libc interceptors, and drives the process-wide
//! [`runtime`] context defined here.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the type sanitizer runtime requires a 64-bit target");

pub mod check;
pub mod config;
pub mod descriptor;
pub mod early_alloc;
pub mod error;
pub mod legality;
pub mod mapping;
pub mod report;
pub mod runtime;
pub mod shadow;
pub mod symbolizer;

pub use check::{Access, AccessKind, Violation, ViolationKind, check_access};
pub use config::{ColorMode, FlagSource, Flags, OptionString, ReportFormat};
pub use descriptor::{Descriptor, DescriptorArena, TypeRef};
pub use early_alloc::EarlyAllocator;
pub use error::{DescriptorError, FlagError, InitError};
pub use legality::is_aliasing_legal;
pub use mapping::{Arch, Layout, Mapping};
pub use report::{Reporter, StackFrame, ViolationStats};
pub use runtime::{Runtime, RuntimeOptions, ShadowPlacement};
pub use shadow::{ShadowMemory, Slot};
pub use symbolizer::{StdSymbolizer, Symbolizer};
