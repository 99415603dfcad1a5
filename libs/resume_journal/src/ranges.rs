//! Sorted, disjoint byte-range set used by the download journal to track
//! which parts of the file have already been written, so the remaining
//! work can be computed as the complement against `[0, total_size)`.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64, // exclusive
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    fn overlaps_or_touches(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Inserts a range, merging it with any overlapping or adjacent
    /// ranges so the set stays sorted and disjoint.
    pub fn insert(&mut self, range: ByteRange) {
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.overlaps_or_touches(&merged) {
                merged = ByteRange::new(merged.start.min(existing.start), merged.end.max(existing.end));
            } else {
                kept.push(existing);
            }
        }
        kept.push(merged);
        kept.sort();
        self.ranges = kept;
    }

    pub fn total_covered(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn contains_fully(&self, start: u64, end: u64) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= start && end <= r.end)
    }

    /// The gaps left in `[0, total_size)` after subtracting every range in
    /// the set: exactly the bytes still needed.
    pub fn complement(&self, total_size: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for r in &self.ranges {
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < total_size {
            gaps.push(ByteRange::new(cursor, total_size));
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_overlapping_ranges() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 10));
        set.insert(ByteRange::new(5, 20));
        assert_eq!(set.ranges(), &[ByteRange::new(0, 20)]);
    }

    #[test]
    fn insert_merges_adjacent_ranges() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 10));
        set.insert(ByteRange::new(10, 20));
        assert_eq!(set.ranges(), &[ByteRange::new(0, 20)]);
    }

    #[test]
    fn insert_keeps_disjoint_ranges_separate() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 10));
        set.insert(ByteRange::new(20, 30));
        assert_eq!(set.ranges(), &[ByteRange::new(0, 10), ByteRange::new(20, 30)]);
    }

    #[test]
    fn complement_computes_remaining_gaps() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 10));
        set.insert(ByteRange::new(20, 30));
        assert_eq!(
            set.complement(30),
            vec![ByteRange::new(10, 20)]
        );
        assert_eq!(
            set.complement(40),
            vec![ByteRange::new(10, 20), ByteRange::new(30, 40)]
        );
    }

    #[test]
    fn complement_of_empty_set_is_whole_file() {
        let set = RangeSet::new();
        assert_eq!(set.complement(100), vec![ByteRange::new(0, 100)]);
    }

    #[test]
    fn contains_fully_checks_subranges() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 100));
        assert!(set.contains_fully(10, 50));
        assert!(!set.contains_fully(90, 150));
    }
}
