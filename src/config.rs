//! Engine configuration.
//!
//! All structural bounds and statistical thresholds live here. The defaults
//! reproduce the behavior the engine was tuned with; they can be relaxed or
//! tightened per model, but `max_rid` bounds the size of rid-offset windows
//! and must stay small enough that `2 * max_rid` visited slots per node are
//! cheap.

use serde::{Deserialize, Serialize};

/// Tunable parameters for a lattice model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hard window for relational-id offsets. Offsets with magnitude at or
    /// above this value abandon the affected propagation branch.
    pub max_rid: i32,
    /// Maximum rid spread allowed inside a single AND-node discovered
    /// speculatively.
    pub max_rid_range: i32,
    /// Maximum number of refinements combined into one AND-node.
    pub max_conjunction_size: usize,
    /// Minimum observed frequency before a node counts as frequent.
    pub min_frequency: u32,
    /// Cumulative binomial probability above which an observed frequency is
    /// considered significant.
    pub significance_threshold: f64,
    /// Gzip level for suspended node snapshots (0-9).
    pub gzip_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_rid: 25,
            max_rid_range: 5,
            max_conjunction_size: 4,
            min_frequency: 5,
            significance_threshold: 0.98,
            gzip_level: 6,
        }
    }
}

impl Config {
    /// Returns true if `offset` lies inside the rid window.
    #[inline]
    pub fn rid_in_range(&self, offset: i32) -> bool {
        offset > -self.max_rid && offset < self.max_rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.max_rid, 25);
        assert_eq!(c.max_conjunction_size, 4);
        assert!(c.rid_in_range(24));
        assert!(c.rid_in_range(-24));
        assert!(!c.rid_in_range(25));
        assert!(!c.rid_in_range(-25));
    }
}
