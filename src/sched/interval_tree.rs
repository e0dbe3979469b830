//! Augmented interval tree over immutable span sets.
//!
//! Built once per CPU after inference finishes, so instead of a rebalancing
//! BST the tree is an implicit balanced recursion over the start-sorted
//! interval array, with each node carrying its subtree's maximum end.
//! Stabbing and range queries run in O(log n + k) and degenerate inputs
//! (one long-lived PID per CPU) cannot unbalance anything.

use crate::events::Timestamp;

/// Interval payloads are arena span ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: Timestamp,
    pub end: Timestamp,
    pub id: u32,
}

#[derive(Debug, Default)]
pub struct IntervalTree {
    items: Vec<Interval>,
    /// Maximum interval end within the subtree rooted at each index.
    max_end: Vec<Timestamp>,
}

impl IntervalTree {
    pub fn build(mut items: Vec<Interval>) -> Self {
        items.sort_by_key(|iv| (iv.start, iv.end, iv.id));
        let mut tree = IntervalTree {
            max_end: vec![Timestamp::MIN; items.len()],
            items,
        };
        if !tree.items.is_empty() {
            tree.fill_max(0, tree.items.len());
        }
        tree
    }

    /// Compute subtree max-ends bottom-up for the node rooted at the
    /// midpoint of `[lo, hi)`.
    fn fill_max(&mut self, lo: usize, hi: usize) -> Timestamp {
        let mid = lo + (hi - lo) / 2;
        let mut max = self.items[mid].end;
        if lo < mid {
            max = max.max(self.fill_max(lo, mid));
        }
        if mid + 1 < hi {
            max = max.max(self.fill_max(mid + 1, hi));
        }
        self.max_end[mid] = max;
        max
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collect ids of intervals overlapping the half-open query `[qs, qe)`.
    pub fn overlapping(&self, qs: Timestamp, qe: Timestamp, out: &mut Vec<u32>) {
        if !self.items.is_empty() && qs < qe {
            self.query(0, self.items.len(), qs, qe, out);
        }
    }

    fn query(&self, lo: usize, hi: usize, qs: Timestamp, qe: Timestamp, out: &mut Vec<u32>) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        // Nothing in this subtree ends after the query start.
        if self.max_end[mid] <= qs {
            return;
        }
        self.query(lo, mid, qs, qe, out);
        let node = &self.items[mid];
        if node.start < qe {
            if node.end > qs {
                out.push(node.id);
            }
            self.query(mid + 1, hi, qs, qe, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(spans: &[(Timestamp, Timestamp)]) -> IntervalTree {
        IntervalTree::build(
            spans
                .iter()
                .enumerate()
                .map(|(i, &(start, end))| Interval {
                    start,
                    end,
                    id: i as u32,
                })
                .collect(),
        )
    }

    fn query(tree: &IntervalTree, qs: Timestamp, qe: Timestamp) -> Vec<u32> {
        let mut out = Vec::new();
        tree.overlapping(qs, qe, &mut out);
        out.sort_unstable();
        out
    }

    #[test]
    fn stabbing_matches_brute_force() {
        let spans = [
            (0, 10),
            (5, 25),
            (10, 12),
            (11, 30),
            (20, 21),
            (20, 40),
            (35, 36),
        ];
        let tree = tree(&spans);
        for qs in 0..45 {
            for qe in qs + 1..46 {
                let expected: Vec<u32> = spans
                    .iter()
                    .enumerate()
                    .filter(|(_, &(s, e))| s < qe && e > qs)
                    .map(|(i, _)| i as u32)
                    .collect();
                assert_eq!(query(&tree, qs, qe), expected, "query [{qs}, {qe})");
            }
        }
    }

    #[test]
    fn point_stab_is_start_inclusive_end_exclusive() {
        let tree = tree(&[(10, 20)]);
        assert_eq!(query(&tree, 10, 11), vec![0]);
        assert_eq!(query(&tree, 19, 20), vec![0]);
        assert_eq!(query(&tree, 20, 21), Vec::<u32>::new());
        assert_eq!(query(&tree, 9, 10), Vec::<u32>::new());
    }

    #[test]
    fn degenerate_nested_intervals() {
        // Long-lived outer intervals enclosing many short ones.
        let mut spans = vec![(0, 1000)];
        for i in 0..100 {
            spans.push((i * 10, i * 10 + 5));
        }
        let tree = tree(&spans);
        let hits = query(&tree, 500, 501);
        assert!(hits.contains(&0));
        assert!(hits.contains(&51));
    }

    #[test]
    fn empty_tree_and_empty_query() {
        let empty = IntervalTree::build(Vec::new());
        let mut out = Vec::new();
        empty.overlapping(0, 100, &mut out);
        assert!(out.is_empty());

        let tree = tree(&[(0, 10)]);
        tree.overlapping(5, 5, &mut out);
        assert!(out.is_empty());
    }
}
