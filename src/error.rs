//! Conditions that end the instrumented program.

use thiserror::Error;

use crate::registry::{AllocationRecord, Origin};

fn comment_suffix(record: &AllocationRecord) -> String {
    record
        .comment
        .as_ref()
        .map(|c| format!(" ({})", c))
        .unwrap_or_default()
}

/// The primitive that tripped over a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Malloc,
    Calloc,
    Realloc,
    ReallocArray,
    Free,
    Strdup,
    Strndup,
    Format,
    Ignore,
    Comment,
    Query,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Malloc => "malloc",
            Op::Calloc => "calloc",
            Op::Realloc => "realloc",
            Op::ReallocArray => "reallocarray",
            Op::Free => "free",
            Op::Strdup => "strdup",
            Op::Strndup => "strndup",
            Op::Format => "format",
            Op::Ignore => "ignore",
            Op::Comment => "comment",
            Op::Query => "query",
        }
    }
}

/// A detected misuse of the allocation surface.
///
/// None of these is recoverable for the instrumented program: the front end prints
/// the fault and exits with [`crate::EXIT_STATUS`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The pointer has no live record: double free, or never allocated here.
    #[error("{site}: {}: unknown pointer {ptr:#x} (double free?)", .op.name())]
    UnknownPointer { op: Op, ptr: usize, site: Origin },

    /// Guard bytes after the payload were overwritten.
    #[error(
        "{site}: {}: memory overflow on {:#x}, {} bytes\n  allocated at {}{}",
        .op.name(), .record.ptr, .record.size, .record.origin, comment_suffix(.record)
    )]
    Overflow {
        op: Op,
        site: Origin,
        record: AllocationRecord,
    },

    /// The registry was configured with a capacity and is full.
    #[error("{site}: too many live allocations (max: {capacity})")]
    CapacityExceeded { site: Origin, capacity: usize },

    /// The underlying allocator is exhausted or the requested size does not fit.
    #[error("{site}: {}: cannot allocate {what}", .op.name())]
    AllocationFailure {
        op: Op,
        site: Origin,
        what: String,
    },
}

impl Fault {
    pub(crate) fn out_of_memory(op: Op, site: &Origin, size: usize) -> Self {
        Fault::AllocationFailure {
            op,
            site: site.clone(),
            what: format!("{} bytes: out of memory", size),
        }
    }

    pub(crate) fn too_large(op: Op, site: &Origin, size: usize) -> Self {
        Fault::AllocationFailure {
            op,
            site: site.clone(),
            what: format!("{} bytes: size overflows with guard", size),
        }
    }

    pub(crate) fn size_overflow(op: Op, site: &Origin, count: usize, size: usize) -> Self {
        Fault::AllocationFailure {
            op,
            site: site.clone(),
            what: format!("{} x {} bytes: size overflows", count, size),
        }
    }
}
