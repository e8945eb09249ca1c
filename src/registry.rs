//! Metadata for live allocations, keyed by the pointer handed to the program.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    fmt::{Display, Formatter},
    panic::Location,
};

use serde::Serialize;

/// Longest file name kept in an [`Origin`], in bytes.
pub const MAX_FILE_LEN: usize = 255;

/// Longest comment kept in an [`AllocationRecord`], in bytes.
pub const MAX_COMMENT_LEN: usize = 127;

// Cut `s` to at most `max` bytes without splitting a UTF-8 sequence.
fn bounded(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

/// Source location of a call into the allocation surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub file: String,
    pub line: u32,
}

impl Origin {
    pub fn new(file: &str, line: u32) -> Self {
        Origin {
            file: bounded(file, MAX_FILE_LEN),
            line,
        }
    }

    /// Location of the caller.  Functions that take an `Origin` and are themselves
    /// `#[track_caller]` can use this to report their own call site.
    #[track_caller]
    pub fn here() -> Self {
        Location::caller().into()
    }
}

impl From<&Location<'_>> for Origin {
    fn from(location: &Location<'_>) -> Self {
        Origin::new(location.file(), location.line())
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Everything known about one live allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// Allocation order; survives resizes.
    pub serial: u64,
    pub ptr: usize,
    /// Payload bytes, not counting the guard.
    pub size: usize,
    pub origin: Origin,
    pub comment: Option<String>,
    /// Excluded from leak reports (but not from overflow checks).
    pub ignored: bool,
}

impl AllocationRecord {
    pub(crate) fn set_comment(&mut self, comment: &str) {
        self.comment = Some(bounded(comment, MAX_COMMENT_LEN));
    }
}

impl Display for AllocationRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}: {:#x}, {} bytes", self.origin, self.ptr, self.size)?;
        if let Some(comment) = &self.comment {
            write!(f, " ({})", comment)?;
        }
        Ok(())
    }
}

/// The registry is full; carries its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full(pub usize);

/// Live allocations indexed by pointer value.
///
/// The registry never touches the memory it describes; guard checks are done by the
/// caller, which also owns the lock around it.
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<usize, AllocationRecord>,
    capacity: Option<usize>,
    next_serial: u64,
}

impl Registry {
    /// A registry holding at most `capacity` records, or unbounded for `None`.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Registry {
            records: HashMap::new(),
            capacity,
            next_serial: 0,
        }
    }

    /// Record a new live allocation.  `ptr` must not already be live: the underlying
    /// allocator never hands out the same address twice without a free in between.
    pub fn insert(
        &mut self,
        ptr: usize,
        size: usize,
        origin: Origin,
    ) -> Result<&mut AllocationRecord, Full> {
        if let Some(capacity) = self.capacity {
            if self.records.len() >= capacity {
                return Err(Full(capacity));
            }
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        log::trace!("insert {:#x} ({} bytes) from {}", ptr, size, origin);
        match self.records.entry(ptr) {
            Entry::Occupied(oe) => {
                // The allocator broke its contract; keep the newest allocation.
                log::warn!("pointer {:#x} registered twice", ptr);
                let record = oe.into_mut();
                *record = AllocationRecord {
                    serial,
                    ptr,
                    size,
                    origin,
                    comment: None,
                    ignored: false,
                };
                Ok(record)
            }
            Entry::Vacant(ve) => Ok(ve.insert(AllocationRecord {
                serial,
                ptr,
                size,
                origin,
                comment: None,
                ignored: false,
            })),
        }
    }

    pub fn find(&self, ptr: usize) -> Option<&AllocationRecord> {
        self.records.get(&ptr)
    }

    pub fn find_mut(&mut self, ptr: usize) -> Option<&mut AllocationRecord> {
        self.records.get_mut(&ptr)
    }

    pub fn remove(&mut self, ptr: usize) -> Option<AllocationRecord> {
        log::trace!("remove {:#x}", ptr);
        self.records.remove(&ptr)
    }

    /// Move the record for `old` to `new` after a resize, updating its size and origin.
    /// Serial, comment and ignore flag are preserved.
    pub fn relocate(
        &mut self,
        old: usize,
        new: usize,
        size: usize,
        origin: Origin,
    ) -> Option<&mut AllocationRecord> {
        let mut record = self.records.remove(&old)?;
        record.ptr = new;
        record.size = size;
        record.origin = origin;
        log::trace!("relocate {:#x} -> {:#x} ({} bytes)", old, new, size);
        Some(self.records.entry(new).or_insert(record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Live records in allocation order.
    pub fn live(&self) -> Vec<&AllocationRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|r| r.serial);
        records
    }
}
