//! `malloc_canary` is a debugging layer for manually managed memory.  It sits between a
//! program and `malloc`/`realloc`/`free` and catches, at the moment they happen, the
//! mistakes a production allocator lets slide:
//!
//! * writes past the end of an allocation (detected through guard bytes appended to
//!   every block, re-checked on every `free`/`realloc` and on demand);
//! * freeing or resizing a pointer that is not live, including double frees;
//! * memory that is never freed before the process exits.
//!
//! Any misuse prints a diagnostic with the site of the offending call and the site the
//! memory was allocated from, then terminates the process with exit status
//! [`EXIT_STATUS`].  Once memory is corrupted nothing the program does afterwards can
//! be trusted, so there is no recovery path.
//!
//! `malloc_canary` is a debugging tool.  It keeps metadata for every live allocation
//! behind a single lock and is not meant for production builds.
//!
//! ## Using `malloc_canary` from Rust
//!
//! Call the wrapped primitives on [`CanaryAllocator`] instead of the raw ones, passing
//! the call site:
//!
//! ```
//! use malloc_canary::{CanaryAllocator, Origin};
//!
//! let p = CanaryAllocator::malloc(16, Origin::here());
//! CanaryAllocator::comment(p, Some("scratch buffer"), Origin::here());
//! unsafe { CanaryAllocator::free(p, Origin::here()) };
//! ```
//!
//! The first call creates the process-wide tracker and registers a hook that prints the
//! overflow and leak reports when the process exits normally.
//!
//! ## Using `malloc_canary` from C
//!
//! The companion [`lib_malloc_canary`] crate builds a dynamic library exporting the
//! same surface with a C ABI (`malloc_canary_malloc(size, __FILE__, __LINE__)`, ...).
//!
//! ## Configuration
//!
//! The process-wide tracker reads its [`Config`] from the environment:
//!
//! * `MALLOC_CANARY_ZERO_SIZE=reject|minimal`: whether zero-byte requests are refused
//!   with a warning and a null result (the default), or served as a guarded empty
//!   block.
//! * `MALLOC_CANARY_CAPACITY=<n>`: stop the program once more than `n` allocations are
//!   live.  Unbounded by default.

pub mod config;
pub mod error;
pub mod fatal;
mod guard;
pub mod registry;
pub mod report;
pub mod tracker;

use std::{
    fmt, io,
    sync::atomic::{AtomicBool, Ordering},
};

use once_cell::sync::Lazy;

pub use config::{Config, ZeroSizePolicy};
pub use error::{Fault, Op};
pub use fatal::{describe_signal, install_signal_handlers, on_fatal_signal, EXIT_STATUS};
pub use registry::{AllocationRecord, Origin};
pub use report::{LeakSummary, Report};
pub use tracker::{Backend, LibcBackend, Tracker};

static TRACKER: Lazy<Tracker> = Lazy::new(|| {
    let config = Config::from_env();
    log::debug!("malloc_canary tracker created with {:?}", config);
    fatal::register_exit_hook(exit_report);
    Tracker::new(config)
});

static EXIT_REPORT_DONE: AtomicBool = AtomicBool::new(false);

// Runs once from `atexit`.
extern "C" fn exit_report() {
    if !EXIT_REPORT_DONE.swap(true, Ordering::SeqCst) {
        TRACKER.check_all();
    }
}

fn or_die<T>(result: Result<T, Fault>) -> T {
    result.unwrap_or_else(|fault| fatal::die(&fault))
}

/// Front end to the process-wide tracker.
///
/// Every function records or checks the allocation in the shared registry.  A misuse
/// prints a diagnostic and terminates the process with [`EXIT_STATUS`]; none of these
/// functions return an error.
pub struct CanaryAllocator;

impl CanaryAllocator {
    /// The process-wide tracker.
    pub fn tracker() -> &'static Tracker {
        &TRACKER
    }

    pub fn malloc(size: usize, origin: Origin) -> *mut u8 {
        or_die(TRACKER.malloc(size, origin))
    }

    /// Zeroed array allocation; overflow of `count * size` is fatal.
    pub fn calloc(count: usize, size: usize, origin: Origin) -> *mut u8 {
        or_die(TRACKER.calloc(count, size, origin))
    }

    /// # Safety
    ///
    /// See [`Tracker::realloc`].
    pub unsafe fn realloc<T>(ptr: *mut T, size: usize, origin: Origin) -> *mut u8 {
        or_die(TRACKER.realloc(ptr as *mut u8, size, origin))
    }

    /// # Safety
    ///
    /// See [`Tracker::realloc`].
    pub unsafe fn reallocarray<T>(ptr: *mut T, count: usize, size: usize, origin: Origin) -> *mut u8 {
        or_die(TRACKER.reallocarray(ptr as *mut u8, count, size, origin))
    }

    /// # Safety
    ///
    /// See [`Tracker::free`].
    pub unsafe fn free<T>(ptr: *mut T, origin: Origin) {
        or_die(TRACKER.free(ptr as *mut u8, origin))
    }

    pub fn strdup(s: &[u8], origin: Origin) -> *mut u8 {
        or_die(TRACKER.strdup(s, origin))
    }

    pub fn strndup(s: &[u8], max: usize, origin: Origin) -> *mut u8 {
        or_die(TRACKER.strndup(s, max, origin))
    }

    /// Formatted allocation; see [`canary_format!`].
    pub fn format(origin: Origin, args: fmt::Arguments<'_>) -> (*mut u8, usize) {
        or_die(TRACKER.format(origin, args))
    }

    /// Leave a live allocation out of leak reports.
    pub fn ignore<T>(ptr: *const T, origin: Origin) {
        or_die(TRACKER.ignore(ptr as *const u8, origin))
    }

    /// Attach a comment to a live allocation; it shows up in every report about it.
    pub fn comment<T>(ptr: *const T, comment: Option<&str>, origin: Origin) {
        or_die(TRACKER.comment(ptr as *const u8, comment, origin))
    }

    /// Print what is known about a live allocation to stderr.
    pub fn query<T>(ptr: *const T, origin: Origin) -> AllocationRecord {
        let record = or_die(TRACKER.query(ptr as *const u8, origin.clone()));
        let _ = report::write_query(&mut io::stderr().lock(), &origin, &record);
        record
    }

    /// Check every live guard; prints the corrupted allocations and returns their count.
    pub fn check_overflow() -> usize {
        TRACKER.check_overflow()
    }

    /// Print every live allocation that is not ignored.
    pub fn check_leaks() -> LeakSummary {
        TRACKER.check_leaks()
    }

    /// [`CanaryAllocator::check_overflow`] then [`CanaryAllocator::check_leaks`].  Runs
    /// automatically at exit.
    pub fn check_all() {
        TRACKER.check_all()
    }

    pub fn snapshot() -> Report {
        TRACKER.snapshot()
    }

    /// Print the reports, then crash with SIGSEGV.  Used to check that diagnostics
    /// reach stderr before a crash is observed from outside.
    pub fn exit_segv() -> ! {
        Self::check_all();
        EXIT_REPORT_DONE.store(true, Ordering::SeqCst);
        unsafe { libc::raise(libc::SIGSEGV) };
        std::process::abort()
    }
}

/// Allocate a formatted, NUL-terminated string through the process-wide tracker,
/// recording the invocation site.  Evaluates to `(pointer, length)`.
///
/// ```
/// let (p, len) = malloc_canary::canary_format!("{}-{}", "chunk", 4);
/// assert_eq!(len, 7);
/// unsafe { malloc_canary::CanaryAllocator::free(p, malloc_canary::Origin::here()) };
/// ```
#[macro_export]
macro_rules! canary_format {
    ($($arg:tt)*) => {
        $crate::CanaryAllocator::format(
            $crate::Origin::new(file!(), line!()),
            format_args!($($arg)*),
        )
    };
}
