use serde::{Deserialize, Serialize};

/// A single replicated command. Indices are globally monotonic across the
/// node's lifetime, including entries already discarded by snapshotting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// In-memory log suffix covering `(last_snapshot_index, last_index]`.
///
/// Offset `i` in `entries` corresponds to absolute index
/// `last_snapshot_index + 1 + i`; everything at or below the snapshot
/// boundary exists only as `(last_snapshot_index, last_snapshot_term)`.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    last_snapshot_index: u64,
    last_snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(entries: Vec<LogEntry>, last_snapshot_index: u64, last_snapshot_term: u64) -> Self {
        RaftLog {
            entries,
            last_snapshot_index,
            last_snapshot_term,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index
    }

    pub fn last_snapshot_term(&self) -> u64 {
        self.last_snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.last_snapshot_index,
        }
    }

    pub fn last_term(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.last_snapshot_term,
        }
    }

    /// Translates an absolute log index into an offset into `entries`.
    ///
    /// Indices at or below the snapshot boundary have no in-memory slot;
    /// asking for one is a programming error, not a protocol condition.
    pub fn offset_of(&self, index: u64) -> usize {
        if index <= self.last_snapshot_index {
            panic!(
                "log index {} is at or below the snapshot boundary {}",
                index, self.last_snapshot_index
            );
        }
        (index - self.last_snapshot_index - 1) as usize
    }

    /// Term recorded at `index`; the snapshot term at the boundary itself.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == self.last_snapshot_index {
            return self.last_snapshot_term;
        }
        self.entries[self.offset_of(index)].term
    }

    pub fn entry(&self, index: u64) -> &LogEntry {
        &self.entries[self.offset_of(index)]
    }

    /// True iff `index` is within `[last_snapshot_index, last_index]` and
    /// carries `term` there.
    pub fn matches(&self, index: u64, term: u64) -> bool {
        if index < self.last_snapshot_index || index > self.last_index() {
            return false;
        }
        self.term_at(index) == term
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Overwrites the slot holding `entry.index` with `entry`.
    pub fn set_entry(&mut self, entry: LogEntry) {
        let offset = self.offset_of(entry.index);
        self.entries[offset] = entry;
    }

    /// Clones all entries from absolute index `from` to the end. Empty when
    /// `from` runs past the last entry.
    pub fn tail_from(&self, from: u64) -> Vec<LogEntry> {
        if from > self.last_index() {
            return Vec::new();
        }
        self.entries[self.offset_of(from)..].to_vec()
    }

    /// Discards every entry with absolute index `<= index` and moves the
    /// snapshot boundary to `(index, term)`. Entries past the boundary are
    /// retained.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        self.entries.retain(|entry| entry.index > index);
        self.last_snapshot_index = index;
        self.last_snapshot_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: format!("cmd-{}", index).into_bytes(),
        }
    }

    #[test]
    fn test_empty_log_uses_boundary() {
        let log = RaftLog::restore(Vec::new(), 7, 3);
        assert_eq!(log.last_index(), 7);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.term_at(7), 3);
        assert!(log.matches(7, 3));
        assert!(!log.matches(7, 2));
        assert!(!log.matches(8, 3));
    }

    #[test]
    fn test_offset_translation() {
        let mut log = RaftLog::restore(Vec::new(), 5, 2);
        log.append(entry(6, 2));
        log.append(entry(7, 3));

        assert_eq!(log.offset_of(6), 0);
        assert_eq!(log.offset_of(7), 1);
        assert_eq!(log.entry(7).term, 3);
        assert_eq!(log.last_index(), 7);
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    #[should_panic]
    fn test_offset_below_boundary_panics() {
        let log = RaftLog::restore(Vec::new(), 5, 2);
        log.offset_of(5);
    }

    #[test]
    fn test_compact_retains_suffix() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(i, 1));
        }
        log.compact_to(3, 1);

        assert_eq!(log.last_snapshot_index(), 3);
        assert_eq!(log.last_snapshot_term(), 1);
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.entry(4).index, 4);
    }

    #[test]
    fn test_compact_past_end_clears() {
        let mut log = RaftLog::new();
        for i in 1..=3 {
            log.append(entry(i, 1));
        }
        log.compact_to(10, 4);

        assert!(log.entries().is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn test_tail_from() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(entry(i, 1));
        }
        let tail = log.tail_from(3);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 3);
        assert!(log.tail_from(5).is_empty());
    }
}
