//! Acceptance statistics.
//!
//! Every move keeps per-key running means of acceptance and of mean-squared
//! displacement, where a key is whatever partitions that move's reporting
//! naturally: an atom-type id, a molecule name, or a single process label.
//! Built on `average::Mean`, the same running-statistics crate the move
//! family's attempt counters already rely on.

use average::{Estimate, Mean};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Running acceptance and mean-squared-displacement statistics for one key.
#[derive(Clone, Debug, Default)]
pub struct KeyStatistics {
    acceptance: Mean,
    msq_displacement: Mean,
}

impl KeyStatistics {
    pub fn record(&mut self, accepted: bool, squared_displacement: f64) {
        self.acceptance.add(accepted as u8 as f64);
        if accepted {
            self.msq_displacement.add(squared_displacement);
        }
    }

    pub fn acceptance(&self) -> f64 {
        self.acceptance.mean()
    }

    pub fn mean_squared_displacement(&self) -> f64 {
        self.msq_displacement.mean()
    }

    pub fn attempts(&self) -> u64 {
        self.acceptance.len()
    }
}

/// A mapping from `Key` to [`KeyStatistics`], keyed by atom type, molecule
/// name, or process label depending on the move.
#[derive(Clone, Debug, Default)]
pub struct AcceptanceMap<Key: Ord + Hash + Eq + Clone + Debug> {
    entries: BTreeMap<Key, KeyStatistics>,
}

impl<Key: Ord + Hash + Eq + Clone + Debug> AcceptanceMap<Key> {
    pub fn record(&mut self, key: Key, accepted: bool, squared_displacement: f64) {
        self.entries
            .entry(key)
            .or_default()
            .record(accepted, squared_displacement);
    }

    pub fn get(&self, key: &Key) -> Option<&KeyStatistics> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &KeyStatistics)> {
        self.entries.iter()
    }
}

/// Overall attempt/acceptance counters for a move, independent of any
/// per-key breakdown -- the numbers every move's JSON report leads with.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MoveCounters {
    pub trials: u64,
    pub accepted: u64,
}

impl MoveCounters {
    pub fn record_attempt(&mut self) {
        self.trials += 1;
    }

    pub fn record_acceptance(&mut self) {
        self.accepted += 1;
    }

    pub fn acceptance_ratio(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.accepted as f64 / self.trials as f64
        }
    }
}

/// Structured per-move report, serialised as the JSON payload the
/// propagator's summary dump emits for each move.
#[derive(Clone, Debug, Serialize)]
pub struct MoveReport {
    pub name: String,
    pub trials: u64,
    pub acceptance: f64,
    pub runfraction: f64,
    pub relative_time: f64,
    /// Move-specific extra payload: per-atom displacement, GC activity
    /// tables, titration per-site acceptance, etc.
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_ratio_with_no_trials_is_zero() {
        let counters = MoveCounters::default();
        assert_eq!(counters.acceptance_ratio(), 0.0);
    }

    #[test]
    fn acceptance_ratio_tracks_accepted_over_trials() {
        let mut counters = MoveCounters::default();
        for _ in 0..10 {
            counters.record_attempt();
        }
        for _ in 0..3 {
            counters.record_acceptance();
        }
        assert!((counters.acceptance_ratio() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn acceptance_map_tracks_per_key_statistics() {
        let mut map: AcceptanceMap<usize> = AcceptanceMap::default();
        map.record(0, true, 4.0);
        map.record(0, false, 0.0);
        map.record(1, true, 1.0);
        let stats0 = map.get(&0).unwrap();
        assert_eq!(stats0.attempts(), 2);
        assert!((stats0.acceptance() - 0.5).abs() < 1e-12);
        assert!((stats0.mean_squared_displacement() - 4.0).abs() < 1e-12);
    }
}
