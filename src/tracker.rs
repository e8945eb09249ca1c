//! The allocation tracker: wrapped allocation primitives and annotations over one
//! locked [`Registry`].

use std::{
    fmt, ptr, slice,
    sync::{Mutex, MutexGuard, PoisonError},
};

use libc::c_void;

use crate::{
    config::{Config, ZeroSizePolicy},
    error::{Fault, Op},
    guard,
    registry::{AllocationRecord, Full, Origin, Registry},
};

/// The allocator that actually services requests.  Sizes passed here already include
/// the guard.
///
/// # Safety
///
/// Implementations must behave like `malloc`/`realloc`/`free`: return null on failure,
/// never hand out a live address twice, and accept back exactly the pointers they
/// returned.
pub unsafe trait Backend: Send + Sync {
    unsafe fn malloc(&self, size: usize) -> *mut u8;
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;
    unsafe fn free(&self, ptr: *mut u8);
}

/// The C library allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcBackend;

unsafe impl Backend for LibcBackend {
    unsafe fn malloc(&self, size: usize) -> *mut u8 {
        libc::malloc(size) as *mut u8
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        libc::realloc(ptr as *mut c_void, size) as *mut u8
    }

    unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr as *mut c_void)
    }
}

fn unknown(op: Op, ptr: *const u8, site: &Origin) -> Fault {
    Fault::UnknownPointer {
        op,
        ptr: ptr as usize,
        site: site.clone(),
    }
}

// Safety: `record` must describe a live block, i.e. `record.size + GUARD_LEN` bytes
// at `record.ptr` are allocated.
unsafe fn check_guard(op: Op, record: &AllocationRecord, site: &Origin) -> Result<(), Fault> {
    if guard::is_intact(record.ptr as *const u8, record.size) {
        Ok(())
    } else {
        Err(Fault::Overflow {
            op,
            site: site.clone(),
            record: record.clone(),
        })
    }
}

// Counts the bytes a format would produce.
struct Measure(usize);

impl fmt::Write for Measure {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 = self.0.saturating_add(s.len());
        Ok(())
    }
}

// Renders into a fixed buffer, refusing to go past its end.
struct Render<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for Render<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos.checked_add(s.len()).ok_or(fmt::Error)?;
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}

/// Tracks every live allocation made through it.
///
/// All registry lookups, guard checks and calls into the backend happen under a single
/// lock.  Failed checks come back as [`Fault`]s; the process-wide front end in the crate
/// root turns them into a diagnostic and an exit.
pub struct Tracker<B: Backend = LibcBackend> {
    registry: Mutex<Registry>,
    config: Config,
    backend: B,
}

impl Tracker<LibcBackend> {
    pub fn new(config: Config) -> Self {
        Tracker::with_backend(config, LibcBackend)
    }
}

impl<B: Backend> Tracker<B> {
    pub fn with_backend(config: Config, backend: B) -> Self {
        Tracker {
            registry: Mutex::new(Registry::with_capacity(config.capacity)),
            config,
            backend,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // A panic while holding the lock cannot leave the registry half-updated: every
    // mutation is a single map operation.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_live(&self, ptr: *const u8) -> bool {
        self.lock().find(ptr as usize).is_some()
    }

    /// Allocate `size` bytes followed by a guard.
    ///
    /// With [`ZeroSizePolicy::Reject`], a zero-byte request prints a warning and yields
    /// null without recording anything.
    pub fn malloc(&self, size: usize, site: Origin) -> Result<*mut u8, Fault> {
        self.alloc_with(Op::Malloc, size, site)
    }

    fn alloc_with(&self, op: Op, size: usize, site: Origin) -> Result<*mut u8, Fault> {
        if size == 0 && self.config.zero_size == ZeroSizePolicy::Reject {
            eprintln!("{}: malloc_canary: {}: zero-size allocation", site, op.name());
            return Ok(ptr::null_mut());
        }
        let padded = guard::padded_len(size).ok_or_else(|| Fault::too_large(op, &site, size))?;

        let mut registry = self.lock();
        let ptr = unsafe { self.backend.malloc(padded) };
        if ptr.is_null() {
            return Err(Fault::out_of_memory(op, &site, size));
        }
        unsafe { guard::arm(ptr, size) };
        match registry.insert(ptr as usize, size, site.clone()) {
            Ok(_) => Ok(ptr),
            Err(Full(capacity)) => {
                unsafe { self.backend.free(ptr) };
                Err(Fault::CapacityExceeded { site, capacity })
            }
        }
    }

    /// Allocate a zeroed array of `count` elements of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize, site: Origin) -> Result<*mut u8, Fault> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| Fault::size_overflow(Op::Calloc, &site, count, size))?;
        let ptr = self.alloc_with(Op::Calloc, total, site)?;
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        Ok(ptr)
    }

    /// Release a live allocation after checking its guard.  Null is ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` is live, no other code may use the block afterwards.
    pub unsafe fn free(&self, ptr: *mut u8, site: Origin) -> Result<(), Fault> {
        self.free_with(Op::Free, ptr, site)
    }

    unsafe fn free_with(&self, op: Op, ptr: *mut u8, site: Origin) -> Result<(), Fault> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut registry = self.lock();
        let record = registry
            .find(ptr as usize)
            .ok_or_else(|| unknown(op, ptr, &site))?;
        check_guard(op, record, &site)?;
        registry.remove(ptr as usize);
        self.backend.free(ptr);
        Ok(())
    }

    /// Resize a live allocation.  The guard is checked before resizing and re-armed at
    /// the new end; the record keeps its serial, comment and ignore flag.  A null
    /// `ptr` allocates, a zero `size` frees and yields null.
    ///
    /// # Safety
    ///
    /// If `ptr` is live, only the returned pointer may be used afterwards.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize, site: Origin) -> Result<*mut u8, Fault> {
        self.realloc_with(Op::Realloc, ptr, size, site)
    }

    /// [`Tracker::realloc`] for `count` elements of `size` bytes.
    ///
    /// # Safety
    ///
    /// As for [`Tracker::realloc`].
    pub unsafe fn reallocarray(
        &self,
        ptr: *mut u8,
        count: usize,
        size: usize,
        site: Origin,
    ) -> Result<*mut u8, Fault> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| Fault::size_overflow(Op::ReallocArray, &site, count, size))?;
        self.realloc_with(Op::ReallocArray, ptr, total, site)
    }

    unsafe fn realloc_with(
        &self,
        op: Op,
        ptr: *mut u8,
        size: usize,
        site: Origin,
    ) -> Result<*mut u8, Fault> {
        if ptr.is_null() {
            return self.alloc_with(op, size, site);
        }
        if size == 0 {
            self.free_with(op, ptr, site)?;
            return Ok(ptr::null_mut());
        }

        let mut registry = self.lock();
        let record = registry
            .find(ptr as usize)
            .ok_or_else(|| unknown(op, ptr, &site))?;
        check_guard(op, record, &site)?;
        let padded = guard::padded_len(size).ok_or_else(|| Fault::too_large(op, &site, size))?;
        let new = self.backend.realloc(ptr, padded);
        if new.is_null() {
            return Err(Fault::out_of_memory(op, &site, size));
        }
        guard::arm(new, size);
        registry.relocate(ptr as usize, new as usize, size, site);
        Ok(new)
    }

    /// Copy a NUL-terminated string into a new allocation.  The copy stops at the first
    /// NUL in `s`, or at its end.
    pub fn strdup(&self, s: &[u8], site: Origin) -> Result<*mut u8, Fault> {
        self.dup_with(Op::Strdup, s, site)
    }

    /// Like [`Tracker::strdup`], but copies at most `max` bytes before terminating.
    pub fn strndup(&self, s: &[u8], max: usize, site: Origin) -> Result<*mut u8, Fault> {
        self.dup_with(Op::Strndup, &s[..s.len().min(max)], site)
    }

    fn dup_with(&self, op: Op, s: &[u8], site: Origin) -> Result<*mut u8, Fault> {
        let len = s.iter().position(|b| *b == 0).unwrap_or_else(|| s.len());
        let size = len
            .checked_add(1)
            .ok_or_else(|| Fault::too_large(op, &site, len))?;
        let ptr = self.alloc_with(op, size, site)?;
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), ptr, len);
            *ptr.add(len) = 0;
        }
        Ok(ptr)
    }

    /// Render `args` into a new NUL-terminated allocation sized exactly for the text.
    /// Returns the allocation and the text length, not counting the terminator.
    ///
    /// The formatting code runs without the lock held, so `Display` impls may allocate
    /// through this tracker.
    pub fn format(&self, site: Origin, args: fmt::Arguments<'_>) -> Result<(*mut u8, usize), Fault> {
        let mut measure = Measure(0);
        let _ = fmt::write(&mut measure, args);
        let len = measure.0;
        let size = len
            .checked_add(1)
            .ok_or_else(|| Fault::too_large(Op::Format, &site, len))?;
        let ptr = self.alloc_with(Op::Format, size, site)?;

        // The block is ours until we return it; nobody else can see it yet.
        let buf = unsafe { slice::from_raw_parts_mut(ptr, size) };
        let mut render = Render {
            buf: &mut buf[..len],
            pos: 0,
        };
        let _ = fmt::write(&mut render, args);
        let written = render.pos;
        buf[written] = 0;
        Ok((ptr, written))
    }

    /// Exclude a live allocation from leak reports.
    pub fn ignore(&self, ptr: *const u8, site: Origin) -> Result<(), Fault> {
        let mut registry = self.lock();
        let record = registry
            .find_mut(ptr as usize)
            .ok_or_else(|| unknown(Op::Ignore, ptr, &site))?;
        record.ignored = true;
        Ok(())
    }

    /// Attach `comment` to a live allocation, replacing any previous one.  `None` does
    /// nothing.
    pub fn comment(&self, ptr: *const u8, comment: Option<&str>, site: Origin) -> Result<(), Fault> {
        let comment = match comment {
            Some(comment) => comment,
            None => return Ok(()),
        };
        let mut registry = self.lock();
        let record = registry
            .find_mut(ptr as usize)
            .ok_or_else(|| unknown(Op::Comment, ptr, &site))?;
        record.set_comment(comment);
        Ok(())
    }

    /// Current state of a live allocation.
    pub fn query(&self, ptr: *const u8, site: Origin) -> Result<AllocationRecord, Fault> {
        self.lock()
            .find(ptr as usize)
            .cloned()
            .ok_or_else(|| unknown(Op::Query, ptr, &site))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{ffi::CStr, sync::Arc, thread::spawn};

    fn here(line: u32) -> Origin {
        Origin::new("tracker.rs", line)
    }

    fn tracker() -> Tracker {
        Tracker::new(Config::default())
    }

    // Never succeeds.
    struct Exhausted;

    unsafe impl Backend for Exhausted {
        unsafe fn malloc(&self, _size: usize) -> *mut u8 {
            ptr::null_mut()
        }
        unsafe fn realloc(&self, _ptr: *mut u8, _size: usize) -> *mut u8 {
            ptr::null_mut()
        }
        unsafe fn free(&self, _ptr: *mut u8) {}
    }

    #[test]
    fn free_removes_record() {
        let tracker = tracker();
        let p = tracker.malloc(10, here(1)).unwrap();
        assert!(tracker.is_live(p));
        unsafe { tracker.free(p, here(2)).unwrap() };
        assert!(!tracker.is_live(p));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn double_free_is_unknown_pointer() {
        let tracker = tracker();
        let p = tracker.malloc(10, here(1)).unwrap();
        unsafe { tracker.free(p, here(2)).unwrap() };
        match unsafe { tracker.free(p, here(3)) } {
            Err(Fault::UnknownPointer { op, ptr, site }) => {
                assert_eq!(op, Op::Free);
                assert_eq!(ptr, p as usize);
                assert_eq!(site, here(3));
            }
            other => panic!("expected unknown pointer, got {:?}", other),
        }
    }

    #[test]
    fn null_free_is_noop() {
        let tracker = tracker();
        unsafe { tracker.free(ptr::null_mut(), here(1)).unwrap() };
    }

    #[test]
    fn payload_writes_are_not_overflows() {
        let tracker = tracker();
        let p = tracker.malloc(16, here(1)).unwrap();
        unsafe {
            ptr::write_bytes(p, 0xff, 16);
            tracker.free(p, here(2)).unwrap();
        }
    }

    #[test]
    fn overflow_is_detected_on_free() {
        let tracker = tracker();
        let p = tracker.malloc(8, here(1)).unwrap();
        tracker.comment(p, Some("small"), here(2)).unwrap();
        unsafe { *p.add(8) = 0 };
        match unsafe { tracker.free(p, here(3)) } {
            Err(Fault::Overflow { op, site, record }) => {
                assert_eq!(op, Op::Free);
                assert_eq!(site, here(3));
                assert_eq!(record.origin, here(1));
                assert_eq!(record.size, 8);
                assert_eq!(record.comment.as_deref(), Some("small"));
            }
            other => panic!("expected overflow, got {:?}", other),
        }
        // Still registered: nothing is released after a failed check.
        assert!(tracker.is_live(p));
    }

    #[test]
    fn overflow_is_detected_on_realloc() {
        let tracker = tracker();
        let p = tracker.malloc(4, here(1)).unwrap();
        unsafe { *p.add(4 + guard::GUARD_LEN - 1) = 0 };
        let err = unsafe { tracker.realloc(p, 100, here(2)) }.unwrap_err();
        assert!(matches!(err, Fault::Overflow { op: Op::Realloc, .. }));
        let message = err.to_string();
        assert!(message.contains("tracker.rs:2"), "{}", message);
        assert!(message.contains("allocated at tracker.rs:1"), "{}", message);
    }

    #[test]
    fn realloc_preserves_contents_and_identity() {
        let tracker = tracker();
        let p = tracker.malloc(4, here(1)).unwrap();
        unsafe { ptr::copy_nonoverlapping(b"abcd".as_ptr(), p, 4) };
        tracker.comment(p, Some("grows"), here(2)).unwrap();
        tracker.ignore(p, here(3)).unwrap();
        let serial = tracker.query(p, here(4)).unwrap().serial;

        let q = unsafe { tracker.realloc(p, 4096, here(5)) }.unwrap();
        let record = tracker.query(q, here(6)).unwrap();
        assert_eq!(record.serial, serial);
        assert_eq!(record.size, 4096);
        assert_eq!(record.origin, here(5));
        assert_eq!(record.comment.as_deref(), Some("grows"));
        assert!(record.ignored);
        assert_eq!(unsafe { slice::from_raw_parts(q, 4) }, b"abcd");
        assert_eq!(tracker.live_count(), 1);

        // Writing the whole new payload is fine.
        unsafe {
            ptr::write_bytes(q, 1, 4096);
            tracker.free(q, here(7)).unwrap();
        }
    }

    #[test]
    fn realloc_edge_cases() {
        let tracker = tracker();
        let p = unsafe { tracker.realloc(ptr::null_mut(), 8, here(1)) }.unwrap();
        assert!(tracker.is_live(p));
        let q = unsafe { tracker.realloc(p, 0, here(2)) }.unwrap();
        assert!(q.is_null());
        assert_eq!(tracker.live_count(), 0);

        let err = unsafe { tracker.realloc(p, 8, here(3)) }.unwrap_err();
        assert!(matches!(err, Fault::UnknownPointer { op: Op::Realloc, .. }));
    }

    #[test]
    fn array_sizes_are_checked() {
        let tracker = tracker();
        let err = tracker.calloc(usize::MAX, 2, here(1)).unwrap_err();
        assert!(matches!(err, Fault::AllocationFailure { op: Op::Calloc, .. }));

        let p = tracker.calloc(4, 8, here(2)).unwrap();
        assert!(unsafe { slice::from_raw_parts(p, 32) }.iter().all(|b| *b == 0));
        let err = unsafe { tracker.reallocarray(p, usize::MAX / 2, 3, here(3)) }.unwrap_err();
        assert!(matches!(err, Fault::AllocationFailure { op: Op::ReallocArray, .. }));
        let q = unsafe { tracker.reallocarray(p, 8, 8, here(4)) }.unwrap();
        assert_eq!(tracker.query(q, here(5)).unwrap().size, 64);
        unsafe { tracker.free(q, here(6)).unwrap() };
    }

    #[test]
    fn guard_padding_overflow_is_an_allocation_failure() {
        let tracker = tracker();
        let err = tracker.malloc(usize::MAX, here(1)).unwrap_err();
        assert!(matches!(err, Fault::AllocationFailure { op: Op::Malloc, .. }));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn exhausted_backend() {
        let tracker = Tracker::with_backend(Config::default(), Exhausted);
        let err = tracker.malloc(10, here(1)).unwrap_err();
        assert_eq!(err.to_string(), "tracker.rs:1: malloc: cannot allocate 10 bytes: out of memory");
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn zero_size_policies() {
        let reject = tracker();
        assert!(reject.malloc(0, here(1)).unwrap().is_null());
        assert!(reject.calloc(0, 8, here(2)).unwrap().is_null());
        assert_eq!(reject.live_count(), 0);

        let minimal = Tracker::new(Config {
            zero_size: ZeroSizePolicy::Minimal,
            ..Config::default()
        });
        let p = minimal.malloc(0, here(3)).unwrap();
        assert!(!p.is_null());
        assert_eq!(minimal.query(p, here(4)).unwrap().size, 0);
        unsafe { *p = 1 };
        let err = unsafe { minimal.free(p, here(5)) }.unwrap_err();
        assert!(matches!(err, Fault::Overflow { .. }));
    }

    #[test]
    fn capacity_is_enforced() {
        let tracker = Tracker::new(Config {
            capacity: Some(2),
            ..Config::default()
        });
        let a = tracker.malloc(1, here(1)).unwrap();
        let b = tracker.malloc(1, here(2)).unwrap();
        let err = tracker.malloc(1, here(3)).unwrap_err();
        assert_eq!(
            err,
            Fault::CapacityExceeded {
                site: here(3),
                capacity: 2
            }
        );
        unsafe {
            tracker.free(a, here(4)).unwrap();
            tracker.free(b, here(5)).unwrap();
        }
    }

    #[test]
    fn string_duplicates() {
        let tracker = tracker();
        let p = tracker.strdup(b"hello\0world", here(1)).unwrap();
        assert_eq!(unsafe { CStr::from_ptr(p as *const _) }.to_bytes(), b"hello");
        assert_eq!(tracker.query(p, here(2)).unwrap().size, 6);

        let q = tracker.strndup(b"hello", 3, here(3)).unwrap();
        assert_eq!(unsafe { CStr::from_ptr(q as *const _) }.to_bytes(), b"hel");
        assert_eq!(tracker.query(q, here(4)).unwrap().size, 4);

        let r = tracker.strndup(b"hi\0there", 100, here(5)).unwrap();
        assert_eq!(unsafe { CStr::from_ptr(r as *const _) }.to_bytes(), b"hi");

        // The empty string still needs its terminator.
        let e = tracker.strdup(b"", here(6)).unwrap();
        assert_eq!(tracker.query(e, here(7)).unwrap().size, 1);

        unsafe {
            for p in [p, q, r, e].iter() {
                tracker.free(*p, here(8)).unwrap();
            }
        }
    }

    #[test]
    fn format_allocates_exact_length() {
        let tracker = tracker();
        let (p, len) = tracker
            .format(here(1), format_args!("{}-{:03}", "id", 7))
            .unwrap();
        assert_eq!(len, 6);
        assert_eq!(unsafe { CStr::from_ptr(p as *const _) }.to_bytes(), b"id-007");
        assert_eq!(tracker.query(p, here(2)).unwrap().size, 7);
        unsafe { tracker.free(p, here(3)).unwrap() };
    }

    #[test]
    fn comment_replaces_previous() {
        let tracker = tracker();
        let p = tracker.malloc(32, here(1)).unwrap();
        tracker.comment(p, Some("buffer A"), here(2)).unwrap();
        assert_eq!(tracker.query(p, here(3)).unwrap().comment.as_deref(), Some("buffer A"));
        tracker.comment(p, Some("buffer B"), here(4)).unwrap();
        assert_eq!(tracker.query(p, here(5)).unwrap().comment.as_deref(), Some("buffer B"));
        tracker.comment(p, None, here(6)).unwrap();
        assert_eq!(tracker.query(p, here(7)).unwrap().comment.as_deref(), Some("buffer B"));
        unsafe { tracker.free(p, here(8)).unwrap() };
    }

    #[test]
    fn annotations_require_live_pointer() {
        let tracker = tracker();
        let p = tracker.malloc(4, here(1)).unwrap();
        unsafe { tracker.free(p, here(2)).unwrap() };
        assert!(matches!(
            tracker.ignore(p, here(3)),
            Err(Fault::UnknownPointer { op: Op::Ignore, .. })
        ));
        assert!(matches!(
            tracker.comment(p, Some("x"), here(4)),
            Err(Fault::UnknownPointer { op: Op::Comment, .. })
        ));
        assert!(matches!(
            tracker.query(p, here(5)),
            Err(Fault::UnknownPointer { op: Op::Query, .. })
        ));
    }

    #[test]
    fn concurrent_alloc_free_cycles() {
        const THREADS: usize = 8;
        const CYCLES: usize = 500;

        let tracker = Arc::new(tracker());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                spawn(move || {
                    for i in 0..CYCLES {
                        let size = 1 + (t * 31 + i) % 200;
                        let p = tracker.malloc(size, Origin::new("thread", t as u32)).unwrap();
                        unsafe {
                            ptr::write_bytes(p, t as u8, size);
                            tracker.free(p, Origin::new("thread", t as u32)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.live_count(), 0);
    }
}
