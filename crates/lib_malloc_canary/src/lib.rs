//! Companion crate to [`malloc_canary`].  This crate compiles into a dynamic library that
//! exports the allocation debugger with a C ABI.  C code calls these functions in place
//! of `malloc`, `free` and friends, passing `__FILE__` and `__LINE__` so that reports
//! point at the offending call:
//!
//! ```c
//! char *buf = malloc_canary_malloc(64, __FILE__, __LINE__);
//! malloc_canary_comment(buf, "input buffer", __FILE__, __LINE__);
//! malloc_canary_free(buf, __FILE__, __LINE__);
//! ```
//!
//! Formatted allocation (`asprintf`) is only available from Rust.

use std::{ffi::CStr, slice};

use libc::{c_char, c_int, c_void, size_t};
use malloc_canary::{CanaryAllocator as Canary, Origin};

unsafe fn origin(file: *const c_char, line: c_int) -> Origin {
    let line = if line < 0 { 0 } else { line as u32 };
    if file.is_null() {
        Origin::new("<unknown>", line)
    } else {
        Origin::new(&CStr::from_ptr(file).to_string_lossy(), line)
    }
}

/// # Safety
///
/// `file` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_malloc(
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    Canary::malloc(size, origin(file, line)) as *mut c_void
}

/// # Safety
///
/// `file` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_calloc(
    count: size_t,
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    Canary::calloc(count, size, origin(file, line)) as *mut c_void
}

/// # Safety
///
/// `p` must not be used after this call unless it is null.  `file` must be null or a
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_realloc(
    p: *mut c_void,
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    Canary::realloc(p, size, origin(file, line)) as *mut c_void
}

/// # Safety
///
/// As for [`malloc_canary_realloc`].
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_reallocarray(
    p: *mut c_void,
    count: size_t,
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    Canary::reallocarray(p, count, size, origin(file, line)) as *mut c_void
}

/// # Safety
///
/// `p` must not be used after this call.  `file` must be null or a NUL-terminated
/// string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_free(p: *mut c_void, file: *const c_char, line: c_int) {
    Canary::free(p, origin(file, line))
}

/// # Safety
///
/// `s` and `file` must be NUL-terminated strings (`file` may be null).
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_strdup(
    s: *const c_char,
    file: *const c_char,
    line: c_int,
) -> *mut c_char {
    Canary::strdup(CStr::from_ptr(s).to_bytes(), origin(file, line)) as *mut c_char
}

/// # Safety
///
/// `s` must be readable up to its terminator or `n` bytes, whichever comes first.
/// `file` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_strndup(
    s: *const c_char,
    n: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_char {
    let len = libc::strnlen(s, n);
    let bytes = slice::from_raw_parts(s as *const u8, len);
    Canary::strndup(bytes, n, origin(file, line)) as *mut c_char
}

/// # Safety
///
/// `file` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_ignore(p: *const c_void, file: *const c_char, line: c_int) {
    Canary::ignore(p, origin(file, line))
}

/// A null `comment` leaves the allocation untouched.
///
/// # Safety
///
/// `comment` and `file` must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_comment(
    p: *const c_void,
    comment: *const c_char,
    file: *const c_char,
    line: c_int,
) {
    let comment = if comment.is_null() {
        None
    } else {
        Some(CStr::from_ptr(comment).to_string_lossy())
    };
    Canary::comment(p, comment.as_deref(), origin(file, line))
}

/// # Safety
///
/// `file` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn malloc_canary_query(p: *const c_void, file: *const c_char, line: c_int) {
    Canary::query(p, origin(file, line));
}

#[no_mangle]
pub extern "C" fn malloc_canary_check_overflow() -> size_t {
    Canary::check_overflow()
}

#[no_mangle]
pub extern "C" fn malloc_canary_check_leaks() {
    Canary::check_leaks();
}

#[no_mangle]
pub extern "C" fn malloc_canary_check_all() {
    Canary::check_all()
}

/// Signal handler suitable for `signal(2)`: prints the signal name and exits.
#[no_mangle]
pub extern "C" fn malloc_canary_sighandler(sig: c_int) {
    malloc_canary::on_fatal_signal(sig)
}

/// Print the reports and crash with SIGSEGV.
#[no_mangle]
pub extern "C" fn malloc_canary_exit_segv(_dummy: c_int) {
    Canary::exit_segv()
}
