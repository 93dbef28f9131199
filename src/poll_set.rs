//! The context-level poll-record set (spec section 4.3): every descriptor
//! watch any attached source has registered, kept sorted by descriptor so
//! duplicates collapse into one slot of the flattened poll array and the
//! post-poll scatter can walk both lists in lockstep.

use std::os::unix::io::RawFd;

use crate::ready::Ready;
use crate::source::{SourceId, WatchKey};
use crate::sys::poll::PollEntry;

#[derive(Debug, Clone)]
pub(crate) struct PollRecord {
    pub source_id: SourceId,
    pub watch_key: WatchKey,
    pub fd: RawFd,
    pub requested: Ready,
    pub priority: i32,
}

#[derive(Debug, Default)]
pub(crate) struct PollRecordSet {
    // Kept sorted by `fd` ascending at all times (the invariant spec
    // section 8 requires be observable at every point).
    records: Vec<PollRecord>,
    dirty: bool,
}

impl PollRecordSet {
    pub fn new() -> PollRecordSet {
        PollRecordSet::default()
    }

    pub fn is_sorted_by_fd(&self) -> bool {
        self.records.windows(2).all(|w| w[0].fd <= w[1].fd)
    }

    fn insertion_point(&self, fd: RawFd) -> usize {
        self.records.partition_point(|r| r.fd < fd)
    }

    pub fn add(&mut self, record: PollRecord) {
        let at = self.insertion_point(record.fd);
        self.records.insert(at, record);
        self.dirty = true;
    }

    /// Remove by (source, watch) identity — a descriptor may have more than
    /// one record (two sources watching the same fd), so identity, not fd
    /// alone, disambiguates.
    pub fn remove(&mut self, source_id: SourceId, watch_key: WatchKey) -> bool {
        if let Some(idx) = self
            .records
            .iter()
            .position(|r| r.source_id == source_id && r.watch_key == watch_key)
        {
            self.records.remove(idx);
            self.dirty = true;
            true
        } else {
            false
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Flatten records at priority `<= max_priority` into `out`, merging
    /// consecutive same-fd records into one entry with OR-combined
    /// requested masks. Returns the number of slots written (the "needed"
    /// count from spec section 4.3).
    pub fn flatten(&mut self, max_priority: i32, out: &mut Vec<PollEntry>) -> usize {
        out.clear();

        let mut iter = self.records.iter().filter(|r| r.priority <= max_priority).peekable();

        while let Some(first) = iter.next() {
            let mut requested = first.requested;
            while let Some(next) = iter.peek() {
                if next.fd == first.fd {
                    requested |= next.requested;
                    iter.next();
                } else {
                    break;
                }
            }
            out.push(PollEntry::new(first.fd, requested));
        }

        self.dirty = false;
        out.len()
    }

    /// Re-walk the same filtered/merged grouping `flatten` produced and
    /// invoke `deliver` once per underlying record with that record's own
    /// filtered received mask (spec section 4.5 step 5's joint walk).
    ///
    /// `poll_entries` must be the array `flatten` most recently produced
    /// for the same `max_priority` — callers are expected to call this
    /// immediately after the poll that consumed that array.
    pub fn scatter(
        &self,
        max_priority: i32,
        poll_entries: &[PollEntry],
        mut deliver: impl FnMut(SourceId, WatchKey, Ready),
    ) {
        let mut iter = self.records.iter().filter(|r| r.priority <= max_priority).peekable();
        let mut slot = 0;

        while let Some(first) = iter.next() {
            let Some(entry) = poll_entries.get(slot) else { break };
            deliver(
                first.source_id,
                first.watch_key,
                entry.received.filter_received(first.requested),
            );

            while let Some(next) = iter.peek() {
                if next.fd == first.fd {
                    let next = iter.next().unwrap();
                    deliver(
                        next.source_id,
                        next.watch_key,
                        entry.received.filter_received(next.requested),
                    );
                } else {
                    break;
                }
            }

            slot += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(source: u32, watch: usize, fd: RawFd, priority: i32) -> PollRecord {
        PollRecord {
            source_id: SourceId::from_raw(source),
            watch_key: WatchKey::from_raw(watch),
            fd,
            requested: Ready::readable(),
            priority,
        }
    }

    #[test]
    fn stays_sorted_on_arbitrary_insertion_order() {
        let mut set = PollRecordSet::new();
        set.add(rec(1, 0, 5, 0));
        set.add(rec(2, 0, 1, 0));
        set.add(rec(3, 0, 3, 0));
        assert!(set.is_sorted_by_fd());
    }

    #[test]
    fn flatten_merges_duplicate_descriptors() {
        let mut set = PollRecordSet::new();
        set.add(PollRecord {
            requested: Ready::readable(),
            ..rec(1, 0, 4, 0)
        });
        set.add(PollRecord {
            requested: Ready::writable(),
            ..rec(2, 0, 4, 0)
        });

        let mut out = Vec::new();
        let needed = set.flatten(i32::MAX, &mut out);
        assert_eq!(needed, 1);
        assert!(out[0].requested.is_readable());
        assert!(out[0].requested.is_writable());
    }

    #[test]
    fn flatten_skips_lower_priority() {
        let mut set = PollRecordSet::new();
        set.add(rec(1, 0, 4, 0));
        set.add(rec(2, 0, 5, 10));

        let mut out = Vec::new();
        let needed = set.flatten(0, &mut out);
        assert_eq!(needed, 1);
        assert_eq!(out[0].fd, 4);
    }

    #[test]
    fn scatter_delivers_per_record_filtered_mask() {
        let mut set = PollRecordSet::new();
        set.add(PollRecord {
            requested: Ready::readable(),
            ..rec(1, 0, 4, 0)
        });
        set.add(PollRecord {
            requested: Ready::writable(),
            ..rec(2, 0, 4, 0)
        });

        let mut out = Vec::new();
        set.flatten(i32::MAX, &mut out);
        out[0].received = Ready::readable() | Ready::writable();

        let mut delivered = Vec::new();
        set.scatter(i32::MAX, &out, |source, _watch, ready| {
            delivered.push((source, ready));
        });

        assert_eq!(delivered.len(), 2);
        assert!(delivered[0].1.is_readable());
        assert!(!delivered[0].1.is_writable());
        assert!(delivered[1].1.is_writable());
        assert!(!delivered[1].1.is_readable());
    }
}
