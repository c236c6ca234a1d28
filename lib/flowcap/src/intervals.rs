// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disjoint byte-interval tracking.

use core::ops::Range;

/// An ordered set of disjoint half-open byte ranges.
///
/// Overlapping and adjacent ranges are merged on insert, so `total()`
/// counts each byte offset once no matter how many times it was seen.
#[derive(Clone, Debug, Default)]
pub struct IntervalSet {
    runs: Vec<Range<u64>>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }

        // Runs that end strictly before `range.start` cannot merge
        // with it; adjacent runs (end == start) can.
        let lo = self.runs.partition_point(|r| r.end < range.start);

        let mut merged = range;
        let mut hi = lo;
        while hi < self.runs.len() && self.runs[hi].start <= merged.end {
            merged.start = merged.start.min(self.runs[hi].start);
            merged.end = merged.end.max(self.runs[hi].end);
            hi += 1;
        }

        self.runs.splice(lo..hi, [merged]);
    }

    /// Total number of distinct byte offsets covered.
    pub fn total(&self) -> u64 {
        self.runs.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    pub fn runs(&self) -> &[Range<u64>] {
        &self.runs
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disjoint_inserts_stay_sorted() {
        let mut set = IntervalSet::new();
        set.insert(10..20);
        set.insert(30..40);
        set.insert(0..5);
        assert_eq!(set.runs(), &[0..5, 10..20, 30..40]);
        assert_eq!(set.total(), 25);
    }

    #[test]
    fn overlap_and_adjacency_merge() {
        let mut set = IntervalSet::new();
        set.insert(0..10);
        set.insert(10..20); // adjacent
        assert_eq!(set.runs(), &[0..20]);

        set.insert(15..25); // overlapping
        assert_eq!(set.runs(), &[0..25]);

        set.insert(40..50);
        set.insert(5..45); // bridges everything
        assert_eq!(set.runs(), &[0..50]);
        assert_eq!(set.total(), 50);
    }

    #[test]
    fn duplicate_bytes_count_once() {
        let mut set = IntervalSet::new();
        set.insert(0..16);
        set.insert(0..16);
        set.insert(4..8);
        assert_eq!(set.total(), 16);
    }

    #[test]
    fn empty_range_ignored() {
        let mut set = IntervalSet::new();
        set.insert(5..5);
        assert!(set.is_empty());
        assert_eq!(set.total(), 0);
    }
}
