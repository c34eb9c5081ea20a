//! Symbolizer seam used only for diagnostics.
//!
//! Demangling and stack unwinding are provided by the host toolchain; the
//! runtime only needs a name transform and a way to print the current stack.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{self, Write};

use crate::report::StackFrame;

/// Diagnostic collaborator: turns type names into display names and prints
/// stack traces.
pub trait Symbolizer: Send + Sync {
    /// Demangle a symbol name. Names that are not mangled come back unchanged.
    fn demangle<'a>(&self, name: &'a str) -> Cow<'a, str>;

    /// Print the stack trace for `frame` into `out`.
    fn print_stack_trace(&self, frame: &StackFrame, out: &mut dyn Write) -> fmt::Result;
}

/// Default symbolizer: identity demangling and `std::backtrace` traces.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdSymbolizer;

impl Symbolizer for StdSymbolizer {
    fn demangle<'a>(&self, name: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(name)
    }

    fn print_stack_trace(&self, _frame: &StackFrame, out: &mut dyn Write) -> fmt::Result {
        writeln!(out, "{}", Backtrace::force_capture())
    }
}
