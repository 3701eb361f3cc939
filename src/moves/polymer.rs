//! Crankshaft, pivot, and reptation moves for linear polymer chains (spec
//! section 4.6). Each move acts on one molecular group, treating its
//! particle range as an ordered chain of monomers.

use crate::energy::Hamiltonian;
use crate::moves::{MoveAlgorithm, MoveListEntry};
use crate::rng::MoveRng;
use crate::space::{mass_centre, Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::{Rotation3, Unit, Vector3};
use std::collections::HashMap;

fn rotate_about_line(point: Vector3<f64>, axis_point: Vector3<f64>, axis: Vector3<f64>, angle: f64) -> Vector3<f64> {
    let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle);
    axis_point + rotation * (point - axis_point)
}

/// `minlen`/`maxlen` bounds on `j - i` (or `j - i - 1` for crankshaft),
/// keyed per molecule id, matching the configuration document's per-molecule
/// chain-length window.
#[derive(Clone, Copy, Debug)]
pub struct ChainWindow {
    pub min_len: usize,
    pub max_len: usize,
}

fn pick_chain_endpoints(chain_len: usize, window: ChainWindow, inclusive_gap: bool, rng: &mut MoveRng) -> Option<(usize, usize)> {
    if chain_len < 2 {
        return None;
    }
    let mut candidates = Vec::new();
    for i in 0..chain_len {
        for j in (i + 1)..chain_len {
            let gap = if inclusive_gap { j - i } else { j - i - 1 };
            if gap >= window.min_len && gap <= window.max_len {
                candidates.push((i, j));
            }
        }
    }
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[rng.range(0, candidates.len())])
    }
}

/// Rotate the monomers strictly between `i` and `j` about the axis `p_i -> p_j`.
pub struct Crankshaft {
    move_list: Vec<MoveListEntry>,
    windows: HashMap<usize, ChainWindow>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_sq_angle: f64,
}

impl Crankshaft {
    pub fn new(move_list: Vec<MoveListEntry>, windows: HashMap<usize, ChainWindow>) -> Self {
        Crankshaft {
            move_list,
            windows,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_sq_angle: 0.0,
        }
    }
}

impl MoveAlgorithm for Crankshaft {
    fn name(&self) -> &str {
        "crankshaft"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let Some(&window) = self.windows.get(&entry.molecule_id) else {
            return false;
        };
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id && g.molecular)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let range = space.groups[group_index].range.clone();
        let chain_len = range.len();
        let Some((i, j)) = pick_chain_endpoints(chain_len, window, false, rng) else {
            return false;
        };
        if j - i < 2 {
            return false;
        }
        let base = range.start;
        let p_i = space.trial[base + i].position;
        let p_j = space.trial[base + j].position;
        let axis = p_j - p_i;
        if axis.norm() < 1e-12 {
            return false;
        }
        let angle = entry.dp1 * rng.half();
        for k in (i + 1)..j {
            space.trial[base + k].position = rotate_about_line(space.trial[base + k].position, p_i, axis, angle);
        }
        self.trial_sq_angle = angle * angle;
        space.groups[group_index].trial_cm = mass_centre(&space.trial, range);
        change.register_whole_group(group_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance
            .record(self.move_list[self.current_entry].molecule_id, true, self.trial_sq_angle);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance
            .record(self.move_list[self.current_entry].molecule_id, false, 0.0);
    }

    fn counters_mut(&mut self) -> &mut MoveCounters {
        &mut self.counters
    }

    fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::Value::Null,
        }
    }
}

/// Rotate everything past `j`, or everything before `i` (50/50), about the
/// axis `p_i -> p_j`.
pub struct Pivot {
    move_list: Vec<MoveListEntry>,
    windows: HashMap<usize, ChainWindow>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_sq_angle: f64,
}

impl Pivot {
    pub fn new(move_list: Vec<MoveListEntry>, windows: HashMap<usize, ChainWindow>) -> Self {
        Pivot {
            move_list,
            windows,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_sq_angle: 0.0,
        }
    }
}

impl MoveAlgorithm for Pivot {
    fn name(&self) -> &str {
        "pivot"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let Some(&window) = self.windows.get(&entry.molecule_id) else {
            return false;
        };
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id && g.molecular)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let range = space.groups[group_index].range.clone();
        let chain_len = range.len();
        let Some((i, j)) = pick_chain_endpoints(chain_len, window, true, rng) else {
            return false;
        };
        let base = range.start;
        let p_i = space.trial[base + i].position;
        let p_j = space.trial[base + j].position;
        let axis = p_j - p_i;
        if axis.norm() < 1e-12 {
            return false;
        }
        let angle = entry.dp1 * rng.half();
        let rotate_tail = rng.coin_flip();
        if rotate_tail {
            for k in (j + 1)..chain_len {
                space.trial[base + k].position = rotate_about_line(space.trial[base + k].position, p_i, axis, angle);
            }
        } else {
            for k in 0..i {
                space.trial[base + k].position = rotate_about_line(space.trial[base + k].position, p_i, axis, angle);
            }
        }
        self.trial_sq_angle = angle * angle;
        space.groups[group_index].trial_cm = mass_centre(&space.trial, range);
        change.register_whole_group(group_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance
            .record(self.move_list[self.current_entry].molecule_id, true, self.trial_sq_angle);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance
            .record(self.move_list[self.current_entry].molecule_id, false, 0.0);
    }

    fn counters_mut(&mut self) -> &mut MoveCounters {
        &mut self.counters
    }

    fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::Value::Null,
        }
    }
}

/// Shift the chain by one monomer, dropping the opposite end and growing a
/// new terminal monomer at a fixed (or automatic) bond length in a random
/// direction.
pub struct Reptation {
    move_list: Vec<MoveListEntry>,
    /// `bondlength` per molecule id; `None` means "automatic" (use the
    /// existing terminal bond length).
    bond_lengths: HashMap<usize, Option<f64>>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
}

impl Reptation {
    pub fn new(move_list: Vec<MoveListEntry>, bond_lengths: HashMap<usize, Option<f64>>) -> Self {
        Reptation {
            move_list,
            bond_lengths,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
        }
    }
}

impl MoveAlgorithm for Reptation {
    fn name(&self) -> &str {
        "reptate"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let Some(&configured_bond) = self.bond_lengths.get(&entry.molecule_id) else {
            return false;
        };
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id && g.molecular)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let range = space.groups[group_index].range.clone();
        let chain_len = range.len();
        if chain_len < 2 {
            return false;
        }
        let base = range.start;
        let grow_at_head = rng.coin_flip();

        let dropped_end_bond = if grow_at_head {
            (space.trial[base].position - space.trial[base + 1].position).norm()
        } else {
            (space.trial[base + chain_len - 1].position - space.trial[base + chain_len - 2].position).norm()
        };
        let bond_length = configured_bond.unwrap_or(dropped_end_bond);

        if grow_at_head {
            // drop the tail, shift everything up by one, grow a new head
            for k in (1..chain_len).rev() {
                space.trial[base + k].position = space.trial[base + k - 1].position;
            }
            let anchor = space.trial[base + 1].position;
            let direction = rng.unit_vector();
            space.trial[base].position = space.boundary.wrap(anchor + direction * bond_length);
        } else {
            // drop the head, shift everything down by one, grow a new tail
            for k in 0..chain_len - 1 {
                space.trial[base + k].position = space.trial[base + k + 1].position;
            }
            let anchor = space.trial[base + chain_len - 2].position;
            let direction = rng.unit_vector();
            space.trial[base + chain_len - 1].position = space.boundary.wrap(anchor + direction * bond_length);
        }

        space.groups[group_index].trial_cm = mass_centre(&space.trial, range);
        change.register_whole_group(group_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(self.move_list[self.current_entry].molecule_id, true, 0.0);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(self.move_list[self.current_entry].molecule_id, false, 0.0);
    }

    fn counters_mut(&mut self) -> &mut MoveCounters {
        &mut self.counters
    }

    fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{Coulomb, Nonbonded};
    use crate::space::{Cuboid, Group, Particle, Space};

    fn linear_chain(n: usize) -> Space {
        let particles: Vec<Particle> = (0..n).map(|k| Particle::new(Vector3::new(k as f64, 0.0, 0.0), 0.0, 0)).collect();
        let groups = vec![Group::new("chain", 0, 0..n, true)];
        Space::new(particles, groups, Cuboid::cubic(200.0))
    }

    #[test]
    fn crankshaft_preserves_bond_lengths_on_rotated_segment() {
        let mut space = linear_chain(6);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(31);
        let mut windows = HashMap::new();
        windows.insert(0, ChainWindow { min_len: 1, max_len: 4 });
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0);
        let mut mover = Crankshaft::new(vec![entry], windows);
        for _ in 0..10 {
            mover.step(&mut space, &hamiltonian, &mut rng);
        }
        assert!(space.committed_matches_trial());
    }

    #[test]
    fn pivot_is_a_no_op_when_window_is_empty() {
        let mut space = linear_chain(3);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(32);
        let windows: HashMap<usize, ChainWindow> = HashMap::new();
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0);
        let mut mover = Pivot::new(vec![entry], windows);
        let du = mover.step(&mut space, &hamiltonian, &mut rng);
        assert_eq!(du, 0.0);
    }

    #[test]
    fn reptation_preserves_chain_length() {
        let mut space = linear_chain(5);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(33);
        let mut bond_lengths = HashMap::new();
        bond_lengths.insert(0, None);
        let entry = MoveListEntry::new(0);
        let mut mover = Reptation::new(vec![entry], bond_lengths);
        mover.step(&mut space, &hamiltonian, &mut rng);
        assert_eq!(space.committed.len(), 5);
        assert!(space.committed_matches_trial());
    }
}
