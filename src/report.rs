//! Overflow and leak reports over the live registry.

use std::io::{self, Write};

use num_format::{Locale, ToFormattedString};
use serde::Serialize;

use crate::{
    guard,
    registry::{AllocationRecord, Origin},
    tracker::{Backend, Tracker},
};

/// Totals from a leak report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LeakSummary {
    pub records: usize,
    pub bytes: usize,
}

/// Point-in-time view of everything the reports would print.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub overflowed: Vec<AllocationRecord>,
    pub leaked: Vec<AllocationRecord>,
    pub leaked_bytes: usize,
}

fn bytes(n: usize) -> String {
    n.to_formatted_string(&Locale::en)
}

/// Print one record for an explicit query.
pub fn write_query<W: Write>(out: &mut W, site: &Origin, record: &AllocationRecord) -> io::Result<()> {
    write!(out, "{}: malloc_canary: query: {}", site, record)?;
    if record.ignored {
        write!(out, " [ignored]")?;
    }
    writeln!(out)
}

impl<B: Backend> Tracker<B> {
    /// Live allocations whose guard has been overwritten, in allocation order.
    pub fn overflowed(&self) -> Vec<AllocationRecord> {
        let registry = self.lock();
        registry
            .live()
            .into_iter()
            // Every record in the registry describes a block we still own.
            .filter(|r| !unsafe { guard::is_intact(r.ptr as *const u8, r.size) })
            .cloned()
            .collect()
    }

    /// Live allocations not marked as ignored, in allocation order.
    pub fn leaked(&self) -> Vec<AllocationRecord> {
        let registry = self.lock();
        registry
            .live()
            .into_iter()
            .filter(|r| !r.ignored)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Report {
        let overflowed = self.overflowed();
        let leaked = self.leaked();
        let leaked_bytes = leaked.iter().map(|r| r.size).sum();
        Report {
            overflowed,
            leaked,
            leaked_bytes,
        }
    }

    /// Write the overflow report to `out`; returns the number of corrupted allocations.
    pub fn write_overflow_report<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let overflowed = self.overflowed();
        write!(out, "Memory overflow:")?;
        if overflowed.is_empty() {
            writeln!(out, " none")?;
            return Ok(0);
        }
        for record in overflowed.iter() {
            write!(out, "\n  {}", record)?;
        }
        writeln!(out, "\nTotal overflowed: {}", overflowed.len())?;
        Ok(overflowed.len())
    }

    /// Write the leak report to `out`.
    pub fn write_leak_report<W: Write>(&self, out: &mut W) -> io::Result<LeakSummary> {
        let leaked = self.leaked();
        let summary = LeakSummary {
            records: leaked.len(),
            bytes: leaked.iter().map(|r| r.size).sum(),
        };
        write!(out, "Memory allocated and not freed:")?;
        if leaked.is_empty() {
            writeln!(out, " none")?;
            return Ok(summary);
        }
        for record in leaked.iter() {
            write!(out, "\n  {}", record)?;
        }
        writeln!(
            out,
            "\nTotal: {} bytes, {} allocations",
            bytes(summary.bytes),
            summary.records.to_formatted_string(&Locale::en)
        )?;
        Ok(summary)
    }

    /// Print the overflow report to stderr and return the number of corrupted
    /// allocations.
    pub fn check_overflow(&self) -> usize {
        self.write_overflow_report(&mut io::stderr().lock())
            .unwrap_or_else(|_| self.overflowed().len())
    }

    /// Print the leak report to stderr.
    pub fn check_leaks(&self) -> LeakSummary {
        self.write_leak_report(&mut io::stderr().lock())
            .unwrap_or_else(|_| {
                let leaked = self.leaked();
                LeakSummary {
                    records: leaked.len(),
                    bytes: leaked.iter().map(|r| r.size).sum(),
                }
            })
    }

    /// Overflow report followed by leak report.
    pub fn check_all(&self) {
        self.check_overflow();
        self.check_leaks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::ptr;

    fn here(line: u32) -> Origin {
        Origin::new("report.rs", line)
    }

    fn render<F: FnOnce(&mut Vec<u8>)>(f: F) -> String {
        let mut out = Vec::new();
        f(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn clean_registry() {
        let tracker = Tracker::new(Config::default());
        let text = render(|out| {
            assert_eq!(tracker.write_overflow_report(out).unwrap(), 0);
            assert_eq!(tracker.write_leak_report(out).unwrap(), LeakSummary::default());
        });
        assert_eq!(text, "Memory overflow: none\nMemory allocated and not freed: none\n");
    }

    #[test]
    fn leaks_are_counted_and_summed() {
        let tracker = Tracker::new(Config::default());
        let sizes = [10usize, 2000, 7, 64, 1];
        let ptrs: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| tracker.malloc(*size, here(i as u32)).unwrap())
            .collect();
        unsafe {
            tracker.free(ptrs[1], here(10)).unwrap();
            tracker.free(ptrs[3], here(11)).unwrap();
        }
        tracker.comment(ptrs[0], Some("buffer A"), here(12)).unwrap();

        let mut summary = LeakSummary::default();
        let text = render(|out| summary = tracker.write_leak_report(out).unwrap());
        assert_eq!(summary, LeakSummary { records: 3, bytes: 18 });
        assert!(text.contains("report.rs:0: "), "{}", text);
        assert!(text.contains("10 bytes (buffer A)"), "{}", text);
        assert!(!text.contains("report.rs:1: "), "{}", text);
        assert!(text.ends_with("Total: 18 bytes, 3 allocations\n"), "{}", text);
    }

    #[test]
    fn totals_use_separators() {
        let tracker = Tracker::new(Config::default());
        let p = tracker.malloc(1_500_000, here(1)).unwrap();
        let text = render(|out| {
            tracker.write_leak_report(out).unwrap();
        });
        assert!(text.contains("Total: 1,500,000 bytes, 1 allocations"), "{}", text);
        unsafe { tracker.free(p, here(2)).unwrap() };
    }

    #[test]
    fn ignored_allocations_still_checked_for_overflow() {
        let tracker = Tracker::new(Config::default());
        let p = tracker.malloc(5, here(1)).unwrap();
        tracker.ignore(p, here(2)).unwrap();
        assert!(tracker.leaked().is_empty());

        unsafe { *p.add(5) = b'!' };
        let mut count = 0;
        let text = render(|out| count = tracker.write_overflow_report(out).unwrap());
        assert_eq!(count, 1);
        assert!(text.contains("report.rs:1: "), "{}", text);
        assert!(text.ends_with("Total overflowed: 1\n"), "{}", text);

        let report = tracker.snapshot();
        assert_eq!(report.overflowed.len(), 1);
        assert!(report.leaked.is_empty());
        assert_eq!(report.leaked_bytes, 0);
    }

    #[test]
    fn overflow_scan_leaves_records_in_place() {
        let tracker = Tracker::new(Config::default());
        let p = tracker.malloc(3, here(1)).unwrap();
        unsafe { ptr::write_bytes(p, 0, 4) };
        assert_eq!(tracker.overflowed().len(), 1);
        assert_eq!(tracker.overflowed().len(), 1);
        assert_eq!(tracker.live_count(), 1);
    }

    #[test]
    fn query_line() {
        let tracker = Tracker::new(Config::default());
        let p = tracker.malloc(3, here(1)).unwrap();
        tracker.comment(p, Some("buffer A"), here(2)).unwrap();
        tracker.ignore(p, here(3)).unwrap();
        let record = tracker.query(p, here(4)).unwrap();
        let text = render(|out| write_query(out, &here(4), &record).unwrap());
        assert!(text.starts_with("report.rs:4: malloc_canary: query: report.rs:1: "), "{}", text);
        assert!(text.ends_with("3 bytes (buffer A) [ignored]\n"), "{}", text);
        unsafe { tracker.free(p, here(5)).unwrap() };
    }
}
