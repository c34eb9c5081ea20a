//! Violation reports.
//!
//! Reports are rendered into a `String` and emitted with one `write(2)` on
//! fd 2 so they do not interleave with other threads' output and never touch
//! buffered std streams from inside an interceptor.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::check::{Violation, ViolationKind};
use crate::config::{Flags, ReportFormat};
use crate::descriptor::write_type_name;
use crate::symbolizer::Symbolizer;

const WARNING: &str = "\x1b[1m\x1b[31m";
const NAME: &str = "\x1b[1m\x1b[32m";
const END: &str = "\x1b[1m\x1b[0m";

/// Registers of the frame a violation was detected in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub pc: usize,
    pub bp: usize,
    pub sp: usize,
}

impl StackFrame {
    /// Capture pc, frame pointer and stack pointer at the call site.
    ///
    /// The pc is the capture point itself. Architectures without a capture
    /// sequence report zero for pc and bp, which suppresses stack traces.
    #[inline(always)]
    #[must_use]
    pub fn capture() -> Self {
        let marker = 0u8;
        Self {
            pc: current_pc(),
            bp: frame_pointer(),
            sp: std::hint::black_box(&marker) as *const u8 as usize,
        }
    }

    /// Registers of the caller of the function this is inlined into, read
    /// from that function's frame record. Falls back to [`Self::capture`]
    /// when the record is not where a frame pointer would put it (code
    /// built without frame pointers).
    #[inline(always)]
    #[must_use]
    pub fn capture_caller() -> Self {
        let here = Self::capture();
        here.caller().unwrap_or(here)
    }

    /// Unwind one frame: `[bp]` holds the caller's bp and `[bp + 8]` the
    /// return address, on both x86_64 and aarch64. Only frames produced by
    /// `capture` may be passed in.
    fn caller(&self) -> Option<Self> {
        const MAX_FRAME: usize = 4096;
        let word = size_of::<usize>();
        if self.bp == 0
            || self.bp % word != 0
            || self.bp < self.sp
            || self.bp - self.sp >= MAX_FRAME
        {
            return None;
        }
        let record = self.bp as *const usize;
        // SAFETY: `bp` is aligned and lies less than a page above the live
        // stack pointer, inside this thread's mapped stack.
        let (saved_bp, ret) = unsafe { (record.read(), record.add(1).read()) };
        if ret == 0 {
            return None;
        }
        Some(Self {
            pc: ret,
            bp: saved_bp,
            sp: self.bp + 2 * word,
        })
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_pc() -> usize {
    let pc: usize;
    // SAFETY: reads rip only.
    unsafe {
        std::arch::asm!("lea {}, [rip]", out(reg) pc, options(nomem, nostack, preserves_flags));
    }
    pc
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: copies rbp without modifying it.
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) bp, options(nomem, nostack, preserves_flags));
    }
    bp
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn current_pc() -> usize {
    let pc: usize;
    // SAFETY: reads the pc only.
    unsafe {
        std::arch::asm!("adr {}, .", out(reg) pc, options(nomem, nostack, preserves_flags));
    }
    pc
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: copies x29 without modifying it.
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) bp, options(nomem, nostack, preserves_flags));
    }
    bp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn current_pc() -> usize {
    0
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn frame_pointer() -> usize {
    0
}

/// Per-kind violation counters.
#[derive(Debug, Default)]
pub struct ViolationStats {
    by_kind: [AtomicU64; 3],
    total: AtomicU64,
}

impl ViolationStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            by_kind: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, kind: ViolationKind) {
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self, kind: ViolationKind) -> u64 {
        self.by_kind[kind.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// One-line summary, e.g.
    /// `SUMMARY: TypeSanitizer: 3 type-aliasing-violation(s) (existing-object: 2, ...)`.
    #[must_use]
    pub fn render_summary(&self) -> String {
        let mut out = format!(
            "SUMMARY: TypeSanitizer: {} type-aliasing-violation(s) (",
            self.total()
        );
        for (i, kind) in ViolationKind::ALL.into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{}: {}", kind.id(), self.count(kind));
        }
        out.push_str(")\n");
        out
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    kind: &'static str,
    access: &'static str,
    size: usize,
    address: &'a str,
    offset: isize,
    incoming_type: &'a str,
    stored_type: &'a str,
    pc: &'a str,
    bp: &'a str,
    sp: &'a str,
    tid: i64,
}

/// Renders and emits violation reports.
pub struct Reporter {
    flags: Flags,
    color: bool,
    symbolizer: Box<dyn Symbolizer>,
    stats: ViolationStats,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("flags", &self.flags)
            .field("color", &self.color)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// `color=auto` is resolved here against fd 2.
    #[must_use]
    pub fn new(flags: Flags, symbolizer: Box<dyn Symbolizer>) -> Self {
        // SAFETY: isatty only inspects the descriptor.
        let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } == 1;
        Self {
            color: flags.color.enabled(is_tty),
            flags,
            symbolizer,
            stats: ViolationStats::new(),
        }
    }

    #[must_use]
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    #[must_use]
    pub fn stats(&self) -> &ViolationStats {
        &self.stats
    }

    #[must_use]
    pub fn symbolizer(&self) -> &dyn Symbolizer {
        self.symbolizer.as_ref()
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.color { code } else { "" }
    }

    /// Human-readable report.
    #[must_use]
    pub fn render_text(&self, v: &Violation, frame: &StackFrame) -> String {
        let mut out = String::with_capacity(256);
        let _ = self.write_text(&mut out, v, frame);
        out
    }

    fn write_text(&self, out: &mut String, v: &Violation, frame: &StackFrame) -> fmt::Result {
        let sym = self.symbolizer();
        let addr = Ptr(v.access.addr);
        writeln!(
            out,
            "{}=={}==ERROR: TypeSanitizer: type-aliasing-violation on address {addr} \
             (pc {} bp {} sp {} tid {}){}",
            self.paint(WARNING),
            pid(),
            Ptr(frame.pc),
            Ptr(frame.bp),
            Ptr(frame.sp),
            tid(),
            self.paint(END),
        )?;
        write!(
            out,
            "{} of size {} at {addr} with type {}",
            v.access.kind,
            v.access.size,
            self.paint(NAME)
        )?;
        write_type_name(out, v.access.ty, sym)?;
        write!(out, "{} {} of type {}", self.paint(END), v.kind.description(), self.paint(NAME))?;
        write_type_name(out, v.stored, sym)?;
        out.write_str(self.paint(END))?;
        if v.offset != 0 {
            write!(out, " that starts at offset {}", v.offset)?;
        }
        out.push('\n');

        if self.flags.print_stacktrace && frame.pc != 0 {
            sym.print_stack_trace(frame, out)
        } else {
            out.write_char('\n')
        }
    }

    /// One-line JSON report (newline terminated).
    #[must_use]
    pub fn render_json(&self, v: &Violation, frame: &StackFrame) -> String {
        let sym = self.symbolizer();
        let mut incoming = String::new();
        let mut stored = String::new();
        let _ = write_type_name(&mut incoming, v.access.ty, sym);
        let _ = write_type_name(&mut stored, v.stored, sym);
        let address = Ptr(v.access.addr).to_string();
        let pc = Ptr(frame.pc).to_string();
        let bp = Ptr(frame.bp).to_string();
        let sp = Ptr(frame.sp).to_string();
        let record = JsonReport {
            kind: v.kind.id(),
            access: v.access.kind.as_str(),
            size: v.access.size,
            address: &address,
            offset: v.offset,
            incoming_type: &incoming,
            stored_type: &stored,
            pc: &pc,
            bp: &bp,
            sp: &sp,
            tid: tid(),
        };
        let mut line = serde_json::to_string(&record).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Count, render and emit `v`. With `halt_on_error` the process exits
    /// with `exitcode` after the report is written.
    pub fn report(&self, v: &Violation, frame: &StackFrame) {
        self.stats.record(v.kind);
        let rendered = match self.flags.report_format {
            ReportFormat::Text => self.render_text(v, frame),
            ReportFormat::Json => self.render_json(v, frame),
        };
        write_stderr(&rendered);
        if self.flags.halt_on_error {
            if self.flags.print_summary {
                write_stderr(&self.stats.render_summary());
            }
            // SAFETY: _exit never returns and runs no user code.
            unsafe { libc::_exit(self.flags.exitcode) }
        }
    }

    /// Informational line shown at `verbosity >= level`.
    pub fn log(&self, level: i32, args: fmt::Arguments<'_>) {
        if self.flags.verbosity >= level {
            log_line(args);
        }
    }
}

/// Pointer formatted the sanitizer way: `0x` plus twelve hex digits.
struct Ptr(usize);

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

fn pid() -> i32 {
    // SAFETY: getpid has no preconditions.
    unsafe { libc::getpid() }
}

fn tid() -> i64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as i64 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// Write `msg` to fd 2, retrying on short writes and `EINTR`.
pub fn write_stderr(msg: &str) {
    let mut bytes = msg.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// `==<pid>==TypeSanitizer: <args>`.
pub fn log_line(args: fmt::Arguments<'_>) {
    write_stderr(&format!("=={}==TypeSanitizer: {args}\n", pid()));
}

/// `==<pid>==WARNING: TypeSanitizer: <args>`.
pub fn warn(args: fmt::Arguments<'_>) {
    write_stderr(&format!("=={}==WARNING: TypeSanitizer: {args}\n", pid()));
}

/// Print a fatal error and terminate with `exitcode`.
pub fn fatal(err: &dyn fmt::Display, exitcode: i32) -> ! {
    write_stderr(&format!("=={}==FATAL: TypeSanitizer: {err}\n", pid()));
    // SAFETY: _exit never returns and runs no user code.
    unsafe { libc::_exit(exitcode) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{Access, AccessKind};
    use crate::config::ColorMode;
    use crate::descriptor::DescriptorArena;
    use crate::symbolizer::StdSymbolizer;

    fn reporter(flags: Flags) -> Reporter {
        Reporter::new(
            Flags {
                color: ColorMode::Never,
                ..flags
            },
            Box::new(StdSymbolizer),
        )
    }

    fn point_violation(arena: &DescriptorArena) -> Violation {
        let float = arena.scalar("float").unwrap();
        let point = arena.structure("Point", &[(float, 0), (float, 4)]).unwrap();
        let y = arena.member(point, float, 4);
        Violation {
            kind: ViolationKind::ExistingObject,
            access: Access {
                addr: 0x7f00_0000_1000,
                size: 4,
                ty: Some(y),
                kind: AccessKind::Read,
            },
            stored: Some(point),
            offset: 0,
        }
    }

    #[test]
    fn caller_frame_comes_from_the_frame_record() {
        let record: [usize; 2] = [0x7ffd_0000_2000, 0x5555_0000_1234];
        let bp = record.as_ptr() as usize;
        let frame = StackFrame {
            pc: 0x5555_0000_0100,
            bp,
            sp: bp - 32,
        };
        assert_eq!(
            frame.caller(),
            Some(StackFrame {
                pc: 0x5555_0000_1234,
                bp: 0x7ffd_0000_2000,
                sp: bp + 16,
            })
        );
    }

    #[test]
    fn implausible_frame_records_are_not_followed() {
        let record: [usize; 2] = [0x7ffd_0000_2000, 0x5555_0000_1234];
        let bp = record.as_ptr() as usize;
        let at = |bp: usize, sp: usize| StackFrame { pc: 1, bp, sp }.caller();

        assert_eq!(at(0, bp), None);
        assert_eq!(at(bp + 1, bp), None);
        assert_eq!(at(bp, bp + 8), None);
        assert_eq!(at(bp, bp - 4096), None);

        let empty: [usize; 2] = [0, 0];
        let bp = empty.as_ptr() as usize;
        assert_eq!(at(bp, bp), None);
    }

    #[test]
    fn capture_caller_falls_back_to_a_usable_frame() {
        let frame = StackFrame::capture_caller();
        assert_ne!(frame.sp, 0);
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            assert_ne!(frame.pc, 0);
        }
    }

    #[test]
    fn text_report_layout() {
        let arena = DescriptorArena::new();
        let v = point_violation(&arena);
        let frame = StackFrame {
            pc: 0,
            bp: 0x7ffd_0000_0010,
            sp: 0x7ffd_0000_0000,
        };
        let text = reporter(Flags::default()).render_text(&v, &frame);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with(&format!("=={}==ERROR: TypeSanitizer: ", pid())));
        assert!(lines[0].contains(
            "type-aliasing-violation on address 0x7f0000001000 (pc 0x000000000000 \
             bp 0x7ffd00000010 sp 0x7ffd00000000 tid "
        ));
        assert_eq!(
            lines[1],
            "READ of size 4 at 0x7f0000001000 with type float (in Point at offset 4) \
             accesses an existing object of type Point"
        );
        assert!(text.ends_with("\n\n"));
        assert!(!text.contains('\x1b'));
    }

    #[test]
    fn offset_suffix_only_when_nonzero() {
        let arena = DescriptorArena::new();
        let mut v = point_violation(&arena);
        v.kind = ViolationKind::PartOfObject;
        v.offset = -2;
        let rep = reporter(Flags {
            print_stacktrace: false,
            ..Flags::default()
        });
        let text = rep.render_text(&v, &StackFrame::default());
        assert!(text.contains(
            "accesses part of an existing object of type Point that starts at offset -2\n"
        ));
    }

    #[test]
    fn colored_report_wraps_header_and_names() {
        let arena = DescriptorArena::new();
        let v = point_violation(&arena);
        let rep = Reporter::new(
            Flags {
                color: ColorMode::Always,
                ..Flags::default()
            },
            Box::new(StdSymbolizer),
        );
        let text = rep.render_text(&v, &StackFrame::default());
        assert!(text.starts_with(WARNING));
        assert!(text.contains(&format!("with type {NAME}float (in Point at offset 4){END}")));
    }

    #[test]
    fn json_report_fields() {
        let arena = DescriptorArena::new();
        let v = point_violation(&arena);
        let rep = reporter(Flags::default());
        let line = rep.render_json(&v, &StackFrame::default());
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["kind"], "existing-object");
        assert_eq!(value["access"], "READ");
        assert_eq!(value["size"], 4);
        assert_eq!(value["address"], "0x7f0000001000");
        assert_eq!(value["offset"], 0);
        assert_eq!(value["incoming_type"], "float (in Point at offset 4)");
        assert_eq!(value["stored_type"], "Point");
        assert_eq!(value["pc"], "0x000000000000");
    }

    #[test]
    fn report_counts_by_kind() {
        let arena = DescriptorArena::new();
        let mut v = point_violation(&arena);
        let rep = reporter(Flags {
            report_format: ReportFormat::Json,
            ..Flags::default()
        });
        rep.report(&v, &StackFrame::default());
        v.kind = ViolationKind::PartialAccess;
        rep.report(&v, &StackFrame::default());
        rep.report(&v, &StackFrame::default());

        let stats = rep.stats();
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.count(ViolationKind::ExistingObject), 1);
        assert_eq!(stats.count(ViolationKind::PartOfObject), 0);
        assert_eq!(stats.count(ViolationKind::PartialAccess), 2);
        assert_eq!(
            stats.render_summary(),
            "SUMMARY: TypeSanitizer: 3 type-aliasing-violation(s) \
             (existing-object: 1, part-of-object: 0, partial-access: 2)\n"
        );
    }

    #[test]
    fn capture_reads_a_live_stack_pointer() {
        let local = 0u64;
        let frame = StackFrame::capture();
        let here = std::hint::black_box(&local) as *const u64 as usize;
        assert!(frame.sp.abs_diff(here) < 4096);
        #[cfg(target_arch = "x86_64")]
        assert_ne!(frame.pc, 0);
    }
}
