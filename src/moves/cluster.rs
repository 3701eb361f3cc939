//! Cluster move with bias correction for detailed balance (spec section 4.4).

use crate::energy::Hamiltonian;
use crate::moves::{MoveAlgorithm, MoveListEntry};
use crate::rng::MoveRng;
use crate::space::{mass_centre, Boundary, Change, Particle, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::{Rotation3, Unit, Vector3};
use std::collections::HashSet;

const BIAS_REJECTION_THRESHOLD: f64 = 1e-7;

/// `P(i is recruited into the cluster | seed)`, the default geometric
/// overlap criterion: `distance < radius_i + radius_j + threshold`, read
/// off whichever particle slice the caller passes (committed for the
/// pre-move probability, trial for the post-move one).
fn overlap_probability(boundary: &dyn Boundary, particles: &[Particle], i: usize, j: usize, threshold: f64) -> f64 {
    let r = boundary.wrap(particles[i].position - particles[j].position).norm();
    let cutoff = particles[i].radius + particles[j].radius + threshold;
    if r < cutoff {
        1.0
    } else {
        0.0
    }
}

/// Recursively grow a cluster of particle indices starting from `seed`,
/// excluding anything in `excluded_indices`. Growth happens on the
/// pre-move geometry, so it reads `space.committed`.
fn grow_atomic_cluster(space: &Space, seed: usize, threshold: f64, mobile: &[usize], rng: &mut MoveRng) -> HashSet<usize> {
    let mut cluster = HashSet::new();
    cluster.insert(seed);
    let mut frontier = vec![seed];
    while let Some(current) = frontier.pop() {
        for &candidate in mobile {
            if cluster.contains(&candidate) {
                continue;
            }
            let p = overlap_probability(&space.boundary, &space.committed, current, candidate, threshold);
            if p > 0.0 && rng.uniform() < p {
                cluster.insert(candidate);
                frontier.push(candidate);
            }
        }
    }
    cluster
}

/// Grow a cluster of *group indices*, starting from `seed_group`, skipping
/// any group whose molecule id is in `static_molecules`.
fn grow_molecular_cluster(
    space: &Space,
    seed_group: usize,
    threshold: f64,
    static_molecules: &[usize],
    rng: &mut MoveRng,
) -> HashSet<usize> {
    let mut cluster = HashSet::new();
    cluster.insert(seed_group);
    let mut frontier = vec![seed_group];
    while let Some(current) = frontier.pop() {
        for (candidate, group) in space.groups.iter().enumerate() {
            if cluster.contains(&candidate) || static_molecules.contains(&group.molecule_id) {
                continue;
            }
            let p = group_overlap_probability(space, current, candidate, threshold, false);
            if p > 0.0 && rng.uniform() < p {
                cluster.insert(candidate);
                frontier.push(candidate);
            }
        }
    }
    cluster
}

fn group_overlap_probability(space: &Space, group_a: usize, group_b: usize, threshold: f64, use_trial: bool) -> f64 {
    let particles: &[Particle] = if use_trial { &space.trial } else { &space.committed };
    for i in space.groups[group_a].range.clone() {
        for j in space.groups[group_b].range.clone() {
            if overlap_probability(&space.boundary, particles, i, j, threshold) > 0.0 {
                return 1.0;
            }
        }
    }
    0.0
}

fn longest_extent(space: &Space, indices: &[usize]) -> f64 {
    let mut max_extent: f64 = 0.0;
    for &i in indices {
        for &j in indices {
            let d = (space.committed[i].position - space.committed[j].position).norm();
            max_extent = max_extent.max(d);
        }
    }
    max_extent
}

/// Atomic cluster around one macromolecule: mobile atoms near a single seed
/// group are recruited into a cluster that translates/rotates as a rigid
/// unit, with a bias correction applied to recover detailed balance.
pub struct ClusterMove {
    move_list: Vec<MoveListEntry>,
    threshold: f64,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    last_bias: f64,
}

impl ClusterMove {
    pub fn new(move_list: Vec<MoveListEntry>, threshold: f64) -> Self {
        ClusterMove {
            move_list,
            threshold,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            last_bias: 1.0,
        }
    }

    /// Indices of every particle that is not itself part of a molecular
    /// group matching the current move's molecule id -- the "mobile pool"
    /// atoms eligible for recruitment.
    fn mobile_pool(&self, space: &Space) -> Vec<usize> {
        let seed_molecule = self.move_list[self.current_entry].molecule_id;
        space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.molecular || g.molecule_id != seed_molecule)
            .flat_map(|(_, g)| g.range.clone())
            .collect()
    }
}

impl MoveAlgorithm for ClusterMove {
    fn name(&self) -> &str {
        "moltransrotcluster"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let seed_candidates: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecular && g.molecule_id == entry.molecule_id)
            .map(|(i, _)| i)
            .collect();
        if seed_candidates.is_empty() {
            return false;
        }
        let seed_group = seed_candidates[rng.range(0, seed_candidates.len())];
        let seed_indices: Vec<usize> = space.groups[seed_group].range.clone().collect();
        let mobile = self.mobile_pool(space);

        let mut cluster = HashSet::new();
        for &seed_atom in &seed_indices {
            cluster.extend(grow_atomic_cluster(space, seed_atom, self.threshold, &mobile, rng));
        }
        cluster.extend(seed_indices.iter().copied());
        let cluster: Vec<usize> = cluster.into_iter().collect();
        let not_in_cluster: Vec<usize> = mobile.into_iter().filter(|i| !cluster.contains(i)).collect();

        let p_old: Vec<f64> = not_in_cluster
            .iter()
            .map(|&l| {
                cluster
                    .iter()
                    .map(|&c| overlap_probability(&space.boundary, &space.committed, c, l, self.threshold))
                    .fold(0.0_f64, f64::max)
            })
            .collect();

        let cm = mass_centre(&space.trial, seed_indices[0]..seed_indices[0] + 1);
        let direction = rng.unit_vector();
        let dp_trans = entry.dp1;
        let translation = direction * dp_trans * 0.5 * rng.half();
        let angle = entry.dp2 * rng.half();
        let rotation_axis = rng.unit_vector();
        let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(rotation_axis), angle);

        for &index in &cluster {
            let relative = space.trial[index].position - cm;
            space.trial[index].position = space.boundary.wrap(cm + rotation * relative + translation);
        }

        let mut bias = 1.0;
        for (k, &l) in not_in_cluster.iter().enumerate() {
            let p_new = cluster
                .iter()
                .map(|&c| overlap_probability(&space.boundary, &space.trial, c, l, self.threshold))
                .fold(0.0_f64, f64::max);
            let numerator = 1.0 - p_new;
            let denominator = 1.0 - p_old[k];
            if denominator.abs() > 1e-300 {
                bias *= numerator / denominator;
            }
        }
        self.last_bias = bias;

        let touched_groups: HashSet<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.range.clone().any(|i| cluster.contains(&i)))
            .map(|(gi, _)| gi)
            .collect();
        change.groups.clear();
        for group_index in touched_groups {
            for &index in &cluster {
                if space.groups[group_index].range.contains(&index) {
                    change.register_particle(group_index, index);
                }
            }
        }
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        if self.last_bias < BIAS_REJECTION_THRESHOLD {
            return f64::INFINITY;
        }
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
            payload: serde_json::json!({ "last_bias": self.last_bias }),
        }
    }
}

/// Full molecular clustering: recursively grow by visiting whole groups,
/// with a static-molecule-type exclusion list for segregating phases.
pub struct MolecularClusterMove {
    move_list: Vec<MoveListEntry>,
    threshold: f64,
    static_molecules: Vec<usize>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    last_bias: f64,
}

impl MolecularClusterMove {
    pub fn new(move_list: Vec<MoveListEntry>, threshold: f64, static_molecules: Vec<usize>) -> Self {
        MolecularClusterMove {
            move_list,
            threshold,
            static_molecules,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            last_bias: 1.0,
        }
    }
}

impl MoveAlgorithm for MolecularClusterMove {
    fn name(&self) -> &str {
        "ClusterMove"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let seed_candidates: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id)
            .map(|(i, _)| i)
            .collect();
        if seed_candidates.is_empty() {
            return false;
        }
        let seed_group = seed_candidates[rng.range(0, seed_candidates.len())];
        let cluster_groups = grow_molecular_cluster(space, seed_group, self.threshold, &self.static_molecules, rng);
        let cluster_indices: Vec<usize> = cluster_groups
            .iter()
            .flat_map(|&g| space.groups[g].range.clone())
            .collect();
        let outside_groups: Vec<usize> = (0..space.groups.len()).filter(|g| !cluster_groups.contains(g)).collect();

        let p_old: Vec<f64> = outside_groups
            .iter()
            .map(|&outside| {
                cluster_groups
                    .iter()
                    .map(|&c| group_overlap_probability(space, c, outside, self.threshold, false))
                    .fold(0.0_f64, f64::max)
            })
            .collect();

        // half the box side is the periodic-aliasing limit for rotation
        let sides = space.boundary.side_lengths();
        let half_side = sides.x.min(sides.y).min(sides.z) * 0.5;
        let extent = longest_extent(space, &cluster_indices);
        let suppress_rotation = extent > half_side;

        let cm: Vector3<f64> = {
            let sum: Vector3<f64> = cluster_indices.iter().map(|&i| space.trial[i].position).sum();
            sum / (cluster_indices.len().max(1) as f64)
        };
        let direction = rng.unit_vector();
        let translation = direction * entry.dp1 * 0.5 * rng.half();

        let rotation = if suppress_rotation {
            Rotation3::identity()
        } else {
            let axis = rng.unit_vector();
            let angle = entry.dp2 * rng.half();
            Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle)
        };

        for &index in &cluster_indices {
            let relative = space.trial[index].position - cm;
            space.trial[index].position = space.boundary.wrap(cm + rotation * relative + translation);
        }

        let mut bias = 1.0;
        for (k, &outside) in outside_groups.iter().enumerate() {
            let p_new = cluster_groups
                .iter()
                .map(|&c| group_overlap_probability(space, c, outside, self.threshold, true))
                .fold(0.0_f64, f64::max);
            let numerator = 1.0 - p_new;
            let denominator = 1.0 - p_old[k];
            if denominator.abs() > 1e-300 {
                bias *= numerator / denominator;
            }
        }
        self.last_bias = bias;
        change.groups.clear();
        for &group_index in &cluster_groups {
            change.register_whole_group(group_index);
            let range = space.groups[group_index].range.clone();
            space.groups[group_index].trial_cm = mass_centre(&space.trial, range);
        }
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        if self.last_bias < BIAS_REJECTION_THRESHOLD {
            return f64::INFINITY;
        }
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
            payload: serde_json::json!({ "last_bias": self.last_bias }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{Coulomb, Nonbonded};
    use crate::space::{Cuboid, Group, Particle, Space};

    fn seed_plus_mobile() -> Space {
        let mut particles = vec![Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 0)];
        particles[0].radius = 2.0;
        for k in 1..5 {
            let mut p = Particle::new(Vector3::new(k as f64, 0.0, 0.0), -0.1, 1);
            p.radius = 1.0;
            particles.push(p);
        }
        let groups = vec![
            Group::new("seed", 0, 0..1, true),
            Group::new("mobile", 1, 1..5, false),
        ];
        Space::new(particles, groups, Cuboid::cubic(100.0))
    }

    #[test]
    fn zero_threshold_reduces_cluster_to_seed_alone() {
        let mut space = seed_plus_mobile();
        // with radii summing to > 0, keep threshold at -10 so nothing overlaps
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(11);
        let entry = MoveListEntry::new(0).with_dp(0.5, 0.0);
        let mut mover = ClusterMove::new(vec![entry], -10.0);
        mover.step(&mut space, &hamiltonian, &mut rng);
        assert!(space.committed_matches_trial());
    }

    #[test]
    fn bias_below_threshold_forces_rejection() {
        let mut space = seed_plus_mobile();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(12);
        let entry = MoveListEntry::new(0).with_dp(0.0, 0.0);
        let mut mover = ClusterMove::new(vec![entry], 5.0);
        mover.last_bias = 1e-9;
        let du = mover.energy_change(&space, &hamiltonian, &Change::default());
        assert!(du.is_infinite());
    }

    #[test]
    fn overlap_probability_reads_the_given_slice_not_always_committed() {
        let mut space = seed_plus_mobile();
        // in the committed state the bystander at x=10 doesn't overlap the seed
        space.committed.push(Particle::new(Vector3::new(10.0, 0.0, 0.0), 0.0, 1));
        space.trial.push(space.committed[5].clone());
        let far = overlap_probability(&space.boundary, &space.committed, 0, 5, 0.0);
        assert_eq!(far, 0.0);

        // move only the trial copy on top of the seed: trial and committed must
        // now disagree, proving the function isn't silently reading committed
        space.trial[5].position = Vector3::new(0.5, 0.0, 0.0);
        let near_trial = overlap_probability(&space.boundary, &space.trial, 0, 5, 0.0);
        let near_committed = overlap_probability(&space.boundary, &space.committed, 0, 5, 0.0);
        assert_eq!(near_trial, 1.0);
        assert_eq!(near_committed, 0.0);
    }

    #[test]
    fn group_overlap_probability_reads_the_given_slice_not_always_committed() {
        let mut space = seed_plus_mobile();
        space.groups.push(Group::new("bystander", 2, 5..6, false));
        space.committed.push(Particle::new(Vector3::new(10.0, 0.0, 0.0), 0.0, 2));
        space.trial.push(space.committed[5].clone());

        let far = group_overlap_probability(&space, 0, 2, 0.0, false);
        assert_eq!(far, 0.0);

        // only the trial copy moves on top of the seed group's particle
        space.trial[5].position = Vector3::new(0.5, 0.0, 0.0);
        let near_trial = group_overlap_probability(&space, 0, 2, 0.0, true);
        let near_committed = group_overlap_probability(&space, 0, 2, 0.0, false);
        assert_eq!(near_trial, 1.0);
        assert_eq!(near_committed, 0.0);
    }
}
