//! Process termination: the fatal path, the exit-time hook and the signal handler.

use std::{ffi::CStr, process, sync::Once};

use libc::{c_int, c_void};

use crate::error::Fault;

/// Exit status of a process stopped by `malloc_canary`.
pub const EXIT_STATUS: i32 = 9;

/// Signals that [`install_signal_handlers`] takes over.
pub const FATAL_SIGNALS: [c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGABRT,
];

/// Print `fault` and end the process.  Callers must not hold the registry lock: the
/// exit hook takes it to print the final report.
pub fn die(fault: &Fault) -> ! {
    log::debug!("fatal: {:?}", fault);
    eprintln!("malloc_canary: {}", fault);
    process::exit(EXIT_STATUS)
}

static EXIT_HOOK: Once = Once::new();

/// Register `hook` with `atexit`; later calls do nothing.
pub(crate) fn register_exit_hook(hook: extern "C" fn()) {
    EXIT_HOOK.call_once(|| {
        if unsafe { libc::atexit(hook) } != 0 {
            log::warn!("atexit registration failed; no report will be printed at exit");
        }
    });
}

/// Human-readable name of signal `sig`.
pub fn describe_signal(sig: c_int) -> String {
    let name = unsafe { libc::strsignal(sig) };
    if name.is_null() {
        return format!("signal {}", sig);
    }
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

unsafe fn write_stderr(bytes: *const u8, len: usize) {
    let _ = libc::write(libc::STDERR_FILENO, bytes as *const c_void, len);
}

/// Signal handler: name the signal on stderr and `_exit` with [`EXIT_STATUS`].
///
/// Only async-signal-safe calls are made.  The registry is not touched since the
/// interrupted thread may hold its lock.
pub extern "C" fn on_fatal_signal(sig: c_int) {
    const PREFIX: &[u8] = b"malloc_canary: ";
    unsafe {
        write_stderr(PREFIX.as_ptr(), PREFIX.len());
        let name = libc::strsignal(sig);
        if name.is_null() {
            const UNKNOWN: &[u8] = b"fatal signal";
            write_stderr(UNKNOWN.as_ptr(), UNKNOWN.len());
        } else {
            write_stderr(name as *const u8, libc::strlen(name));
        }
        write_stderr(b"\n".as_ptr(), 1);
        libc::_exit(EXIT_STATUS);
    }
}

/// Route [`FATAL_SIGNALS`] to [`on_fatal_signal`].
pub fn install_signal_handlers() {
    let handler = on_fatal_signal as extern "C" fn(c_int);
    for sig in FATAL_SIGNALS.iter() {
        if unsafe { libc::signal(*sig, handler as libc::sighandler_t) } == libc::SIG_ERR {
            log::warn!("cannot install handler for {}", describe_signal(*sig));
        }
    }
}
