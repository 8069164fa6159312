//! Interval index preserving first-match-in-list-order lookups.
//!
//! The boundaries of every range split the line into elementary intervals.
//! Each elementary interval is labelled with the lowest list index of the
//! ranges covering it, which is exactly the record a linear scan in list
//! order would return first. A query is one binary search.

#[derive(Debug, Clone, Default)]
pub(crate) struct IntervalIndex {
    bounds: Vec<u64>,
    owners: Vec<Option<usize>>,
}

impl IntervalIndex {
    /// Build from `(list_index, start, end)` half-open ranges.
    ///
    /// `ranges` must be ordered by list index; empty ranges are ignored.
    pub(crate) fn build(ranges: &[(usize, u64, u64)]) -> Self {
        let mut bounds: Vec<u64> = ranges
            .iter()
            .filter(|(_, s, e)| s < e)
            .flat_map(|&(_, s, e)| [s, e])
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut owners = vec![None; bounds.len().saturating_sub(1)];
        for &(index, start, end) in ranges.iter().filter(|(_, s, e)| s < e) {
            let first = bounds.partition_point(|&b| b < start);
            for slot in first..owners.len() {
                if bounds[slot] >= end {
                    break;
                }
                owners[slot].get_or_insert(index);
            }
        }

        Self { bounds, owners }
    }

    /// List index of the first range containing `value`.
    pub(crate) fn lookup(&self, value: u64) -> Option<usize> {
        let pos = self.bounds.partition_point(|&b| b <= value);
        if pos == 0 {
            return None;
        }
        self.owners.get(pos - 1).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(ranges: &[(usize, u64, u64)], v: u64) -> Option<usize> {
        ranges
            .iter()
            .find(|(_, s, e)| v >= *s && v < *e)
            .map(|(i, _, _)| *i)
    }

    #[test]
    fn test_first_match_wins() {
        // Later, smaller range nested in an earlier one never wins.
        let ranges = [(0, 0x1000, 0x2000), (1, 0x1000, 0x1100), (2, 0x1800, 0x3000)];
        let idx = IntervalIndex::build(&ranges);
        assert_eq!(idx.lookup(0x1000), Some(0));
        assert_eq!(idx.lookup(0x1900), Some(0));
        assert_eq!(idx.lookup(0x2000), Some(2));
        assert_eq!(idx.lookup(0x3000), None);
        assert_eq!(idx.lookup(0x0FFF), None);
    }

    #[test]
    fn test_matches_linear_scan() {
        let ranges = [
            (0, 50, 60),
            (1, 0, 100),
            (2, 40, 45),
            (3, 90, 200),
            (4, 150, 150),
            (5, 300, 310),
        ];
        let idx = IntervalIndex::build(&ranges);
        for v in 0..400 {
            assert_eq!(idx.lookup(v), linear(&ranges, v), "value {v}");
        }
    }

    #[test]
    fn test_empty() {
        let idx = IntervalIndex::build(&[]);
        assert_eq!(idx.lookup(0), None);
    }
}
