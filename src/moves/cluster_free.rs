//! Rejection-free cluster translation (spec section 4.5), `ctransnr`.

use crate::energy::Hamiltonian;
use crate::moves::MoveListEntry;
use crate::rng::MoveRng;
use crate::space::{Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::Vector3;

/// Translates a molecular cluster with no rejection step: recruitment into
/// the moving set is probabilistic and itself carries the acceptance, the
/// way it does for symmetric pair potentials in purely molecular systems.
pub struct ClusterTranslateNoReject {
    move_list: Vec<MoveListEntry>,
    /// When true, skip the full post-move energy sweep and report zero
    /// (the audit-corrected apparent-drift tradeoff described in the spec).
    skip_energy: bool,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
}

impl ClusterTranslateNoReject {
    pub fn new(move_list: Vec<MoveListEntry>, skip_energy: bool) -> Self {
        ClusterTranslateNoReject {
            move_list,
            skip_energy,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
        }
    }

    /// Run the full rejection-free step for one trial: grow the moving set,
    /// translate every member, and return the total system energy delta
    /// (or zero if `skip_energy` is set). This move has no accept/reject
    /// branch of its own, so it bypasses the generic `step()` default.
    pub fn run(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        if self.move_list.is_empty() {
            return 0.0;
        }
        let index = rng.range(0, self.move_list.len());
        self.current_entry = index;
        let entry = self.move_list[index].clone();
        if rng.uniform() > entry.probability {
            return 0.0;
        }
        self.counters.record_attempt();

        let molecular_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecular)
            .map(|(i, _)| i)
            .collect();
        if molecular_groups.is_empty() {
            return 0.0;
        }
        let seed = molecular_groups[rng.range(0, molecular_groups.len())];

        let direction = rng.unit_vector();
        let translation = direction * entry.dp1 * 0.5 * rng.half();

        let energy_before = if self.skip_energy {
            0.0
        } else {
            hamiltonian.system_energy(&space.committed)
        };

        let mut moved = vec![seed];
        let mut remaining: Vec<usize> = molecular_groups.iter().copied().filter(|&g| g != seed).collect();
        let mut cursor = 0;
        while cursor < moved.len() {
            let current = moved[cursor];
            cursor += 1;
            for index in space.groups[current].range.clone() {
                space.trial[index].position = space.boundary.wrap(space.trial[index].position + translation);
            }
            let mut still_remaining = Vec::new();
            for &candidate in &remaining {
                let before: f64 = space.groups[candidate]
                    .range
                    .clone()
                    .map(|j| {
                        space.groups[current]
                            .range
                            .clone()
                            .map(|i| hamiltonian.interaction_energy(&space.committed, &[i, j]))
                            .sum::<f64>()
                    })
                    .sum();
                let after: f64 = space.groups[candidate]
                    .range
                    .clone()
                    .map(|j| {
                        space.groups[current]
                            .range
                            .clone()
                            .map(|i| hamiltonian.interaction_energy(&space.trial, &[i, j]))
                            .sum::<f64>()
                    })
                    .sum();
                let delta = after - before;
                let recruit_probability = (1.0 - (-delta).exp()).max(0.0);
                if rng.uniform() < recruit_probability {
                    moved.push(candidate);
                } else {
                    still_remaining.push(candidate);
                }
            }
            remaining = still_remaining;
        }

        let mut change = Change::default();
        for &group_index in &moved {
            change.register_whole_group(group_index);
        }
        space.commit(&change);
        self.counters.record_acceptance();
        self.acceptance.record(entry.molecule_id, true, translation.norm_squared());

        if self.skip_energy {
            0.0
        } else {
            hamiltonian.system_energy(&space.committed) - energy_before
        }
    }
}

impl crate::moves::RunnableMove for ClusterTranslateNoReject {
    fn name(&self) -> &str {
        "ctransnr"
    }

    fn run_step(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        self.run(space, hamiltonian, rng)
    }

    fn trials(&self) -> u64 {
        self.counters.trials
    }

    fn acceptance_ratio(&self) -> f64 {
        self.counters.acceptance_ratio()
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

    fn three_dimers() -> Space {
        let mut particles = Vec::new();
        let mut groups = Vec::new();
        for k in 0..3 {
            let base = Vector3::new(k as f64 * 30.0, 0.0, 0.0);
            particles.push(Particle::new(base, 1.0, 0));
            particles.push(Particle::new(base + Vector3::new(2.0, 0.0, 0.0), -1.0, 0));
            groups.push(Group::new("dimer", 0, k * 2..k * 2 + 2, true));
        }
        Space::new(particles, groups, Cuboid::cubic(200.0))
    }

    #[test]
    fn run_always_commits_with_no_rejection() {
        let mut space = three_dimers();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(21);
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0);
        let mut mover = ClusterTranslateNoReject::new(vec![entry], false);
        mover.run(&mut space, &hamiltonian, &mut rng);
        assert!(space.committed_matches_trial());
        assert_eq!(mover.counters().trials, 1);
        assert_eq!(mover.counters().accepted, 1);
    }

    #[test]
    fn skip_energy_always_reports_zero() {
        let mut space = three_dimers();
        let hamiltonian = Nonbonded::new(Coulomb::new(1.0));
        let mut rng = MoveRng::from_seed(22);
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0);
        let mut mover = ClusterTranslateNoReject::new(vec![entry], true);
        let du = mover.run(&mut space, &hamiltonian, &mut rng);
        assert_eq!(du, 0.0);
    }
}
