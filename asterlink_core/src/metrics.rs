//! Work counters threaded through the tree queries and the linking search.
//!
//! The trees report how much of the index they actually touched, which is
//! the number that tells you whether pruning is earning its keep.

use serde::{Deserialize, Serialize};

/// Counters accumulated across one search (or one query, if reset between).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Tree nodes whose pruning test ran.
    pub nodes_visited: u64,
    /// Tracklets tested exactly at a leaf or in a linear scan.
    pub tracklets_tested: u64,
    /// Near-point queries issued by the search driver.
    pub near_point_queries: u64,
    /// Midpoint queries issued by the search driver.
    pub midpoint_queries: u64,
    /// Combined hypotheses that passed the fit threshold.
    pub hypotheses_formed: u64,
    /// Hypotheses emitted into the candidate set before consolidation.
    pub candidates_emitted: u64,
}

impl SearchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds another counter set into this one (per-seed collection in a
    /// parallel driver concatenates stats the same way it concatenates
    /// candidates).
    pub fn merge(&mut self, other: &SearchStats) {
        self.nodes_visited += other.nodes_visited;
        self.tracklets_tested += other.tracklets_tested;
        self.near_point_queries += other.near_point_queries;
        self.midpoint_queries += other.midpoint_queries;
        self.hypotheses_formed += other.hypotheses_formed;
        self.candidates_emitted += other.candidates_emitted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_fields() {
        let mut a = SearchStats {
            nodes_visited: 3,
            tracklets_tested: 10,
            ..Default::default()
        };
        let b = SearchStats {
            nodes_visited: 2,
            midpoint_queries: 1,
            ..Default::default()
        };
        a.merge(&b);

        assert_eq!(a.nodes_visited, 5);
        assert_eq!(a.tracklets_tested, 10);
        assert_eq!(a.midpoint_queries, 1);
    }
}
