//! Process-lifetime runtime context.
//!
//! [`Runtime`] bundles the shadow memory, the resolved flags and the
//! reporter. A process has at most one published instance, created by
//! [`initialize`] and read lock-free through [`get`]. Standalone instances
//! from [`Runtime::new`] serve embedders and tests.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::check::{Access, check_access};
use crate::config::{Flags, OptionString};
use crate::descriptor::TypeRef;
use crate::error::InitError;
use crate::mapping::{Layout, Mapping, detect_layout};
use crate::report::{self, Reporter, StackFrame};
use crate::shadow::ShadowMemory;
use crate::symbolizer::{StdSymbolizer, Symbolizer};

// Runtime lifecycle states.
const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

// Same non-blocking state machine as a OnceLock, minus the futex: an
// allocation made during init re-enters the interceptors, which must see
// INITIALIZING and pass through instead of waiting on themselves.
static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

thread_local! {
    static INIT_ON_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Where the shadow region goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowPlacement {
    /// The architectural layout detected from the running process.
    Fixed,
    /// A `2^bits`-byte folding window reserved anywhere.
    Window(u32),
}

/// Inputs to [`initialize`] / [`Runtime::new`].
pub struct RuntimeOptions {
    pub placement: ShadowPlacement,
    pub options: OptionString,
    pub symbolizer: Box<dyn Symbolizer>,
    /// Called with the final mapping before the runtime is published.
    pub on_shadow_ready: Option<fn(Mapping)>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            placement: ShadowPlacement::Fixed,
            options: OptionString::default(),
            symbolizer: Box::new(StdSymbolizer),
            on_shadow_ready: None,
        }
    }
}

impl RuntimeOptions {
    /// Fixed layout, flags from `TYSAN_OPTIONS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            options: OptionString::from_env(),
            ..Self::default()
        }
    }

    /// Windowed shadow with default flags.
    #[must_use]
    pub fn windowed(bits: u32) -> Self {
        Self {
            placement: ShadowPlacement::Window(bits),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: OptionString) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_symbolizer(mut self, symbolizer: Box<dyn Symbolizer>) -> Self {
        self.symbolizer = symbolizer;
        self
    }

    #[must_use]
    pub fn on_shadow_ready(mut self, hook: fn(Mapping)) -> Self {
        self.on_shadow_ready = Some(hook);
        self
    }
}

/// Shadow memory, flags and reporter for one process.
#[derive(Debug)]
pub struct Runtime {
    shadow: ShadowMemory,
    reporter: Reporter,
    layout: Option<(Layout, u32)>,
}

impl Runtime {
    /// Resolve flags, reserve the shadow and build the reporter.
    ///
    /// Flag problems are printed as warnings, or returned as an error with
    /// `strict_flags=1`.
    pub fn new(options: RuntimeOptions) -> Result<Self, InitError> {
        let RuntimeOptions {
            placement,
            options,
            symbolizer,
            on_shadow_ready,
        } = options;

        let (flags, errors) = Flags::from_source(&options);
        if let Some(first) = errors.first() {
            if flags.strict_flags {
                return Err(first.clone().into());
            }
            for err in &errors {
                report::warn(format_args!("{err}"));
            }
        }
        if flags.help {
            report::write_stderr(&flags.describe());
        }

        let (shadow, layout) = match placement {
            ShadowPlacement::Fixed => {
                let (layout, vma_bits) = detect_layout()?;
                (ShadowMemory::reserve_fixed(layout)?, Some((layout, vma_bits)))
            }
            ShadowPlacement::Window(bits) => (ShadowMemory::reserve_window(bits)?, None),
        };
        let reporter = Reporter::new(flags, symbolizer);

        let mapping = shadow.mapping();
        reporter.log(
            1,
            format_args!(
                "shadow [{:#x}, {:#x}) app mask {:#x}{}",
                mapping.shadow_addr,
                mapping.app_addr,
                mapping.app_mask,
                match layout {
                    Some((layout, bits)) => format!(" layout {layout:?} VMA {bits} bits"),
                    None => String::from(" (windowed)"),
                }
            ),
        );
        if let Some(hook) = on_shadow_ready {
            hook(mapping);
        }

        Ok(Self {
            shadow,
            reporter,
            layout,
        })
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowMemory {
        &self.shadow
    }

    #[must_use]
    pub fn flags(&self) -> &Flags {
        self.reporter.flags()
    }

    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// The detected layout and VMA width; `None` for windowed shadows.
    #[must_use]
    pub fn layout(&self) -> Option<(Layout, u32)> {
        self.layout
    }

    /// Check one access and report every violation against `frame`.
    pub fn check(&self, access: &Access, frame: &StackFrame) -> usize {
        check_access(&self.shadow, access, |v| self.reporter.report(&v, frame))
    }

    pub fn set_type_unknown(&self, addr: usize, size: usize) {
        self.shadow.set_type_unknown(addr, size);
    }

    pub fn copy_types(&self, dst: usize, src: usize, size: usize) {
        self.shadow.copy_types(dst, src, size);
    }

    pub fn set_type(&self, addr: usize, ty: TypeRef, size: usize) {
        self.shadow.set_type(addr, ty, size);
    }
}

/// The published runtime, if initialization has completed.
#[inline]
#[must_use]
pub fn get() -> Option<&'static Runtime> {
    if STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = RUNTIME.load(Ordering::Acquire);
    // SAFETY: once READY, RUNTIME points at a leaked Runtime that is never
    // freed or replaced.
    unsafe { ptr.as_ref() }
}

/// Whether some thread is inside [`initialize`] right now.
#[must_use]
pub fn init_is_running() -> bool {
    STATE.load(Ordering::Acquire) == STATE_INITIALIZING
}

/// Create and publish the process runtime. Idempotent: later calls return
/// the published instance and ignore `options`.
///
/// A nested call from the thread that is already initializing fails with
/// [`InitError::Reentrant`]; other threads wait for the first to finish.
pub fn initialize(options: RuntimeOptions) -> Result<&'static Runtime, InitError> {
    loop {
        match STATE.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(STATE_READY) => {
                if let Some(rt) = get() {
                    return Ok(rt);
                }
            }
            Err(_) => {
                if INIT_ON_THIS_THREAD.with(Cell::get) {
                    return Err(InitError::Reentrant);
                }
                std::thread::yield_now();
            }
        }
    }

    INIT_ON_THIS_THREAD.with(|f| f.set(true));
    let result = Runtime::new(options);
    INIT_ON_THIS_THREAD.with(|f| f.set(false));

    match result {
        Ok(rt) => {
            let print_summary = rt.flags().print_summary;
            let ptr = Box::into_raw(Box::new(rt));
            RUNTIME.store(ptr, Ordering::Release);
            STATE.store(STATE_READY, Ordering::Release);
            if print_summary {
                // SAFETY: registers a plain extern "C" callback.
                unsafe {
                    libc::atexit(print_summary_at_exit);
                }
            }
            // SAFETY: just published; never freed.
            Ok(unsafe { &*ptr })
        }
        Err(err) => {
            STATE.store(STATE_UNINIT, Ordering::Release);
            Err(err)
        }
    }
}

extern "C" fn print_summary_at_exit() {
    if let Some(rt) = get() {
        report::write_stderr(&rt.reporter().stats().render_summary());
    }
}
