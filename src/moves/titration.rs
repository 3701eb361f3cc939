//! Implicit titration (`SwapMove`, spec section 4.8.3): a titratable site
//! swaps between a protonated and deprotonated atom-type id.

use crate::energy::Hamiltonian;
use crate::rng::MoveRng;
use crate::space::{Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};

/// One equilibrium process: `bound_species <-> unbound_species`, with the
/// system at the given pH and the process's pK.
#[derive(Clone, Debug)]
pub struct EquilibriumProcess {
    pub bound_id: usize,
    pub unbound_id: usize,
    pub pk: f64,
    pub ph: f64,
}

impl EquilibriumProcess {
    /// Intrinsic free-energy change applied in the bound -> unbound
    /// direction, `ln(10) * (pH - pK)`.
    fn intrinsic_energy(&self) -> f64 {
        std::f64::consts::LN_10 * (self.ph - self.pk)
    }

    fn involves(&self, id: usize) -> bool {
        id == self.bound_id || id == self.unbound_id
    }

    fn other_end(&self, id: usize) -> Option<(usize, f64)> {
        if id == self.bound_id {
            Some((self.unbound_id, self.intrinsic_energy()))
        } else if id == self.unbound_id {
            Some((self.bound_id, -self.intrinsic_energy()))
        } else {
            None
        }
    }
}

/// Per-trial titratable-site swap: pick a site uniformly, pick a process
/// whose endpoints include the site's current type, swap, and test
/// acceptance against the interaction ΔU plus the intrinsic free energy.
pub struct TitrationSwap {
    processes: Vec<EquilibriumProcess>,
    probability: f64,
    save_charge: std::collections::HashMap<usize, f64>,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    last_interaction_energy: f64,
}

impl TitrationSwap {
    pub fn new(processes: Vec<EquilibriumProcess>, probability: f64, save_charge: std::collections::HashMap<usize, f64>) -> Self {
        TitrationSwap {
            processes,
            probability,
            save_charge,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            last_interaction_energy: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        "titrate"
    }

    pub fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    pub fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        let mut per_site = serde_json::Map::new();
        for (site, stats) in self.acceptance.iter() {
            per_site.insert(site.to_string(), serde_json::json!(stats.acceptance()));
        }
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::Value::Object(per_site),
        }
    }

    /// Runs one titration trial (bypasses the generic `step` default
    /// because acceptance composes an intrinsic free energy with the
    /// interaction ΔU, mirroring the grand-canonical moves' pattern).
    pub fn run(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        if self.processes.is_empty() || space.committed.is_empty() {
            return 0.0;
        }
        if rng.uniform() > self.probability {
            return 0.0;
        }
        self.counters.record_attempt();

        let site = rng.range(0, space.trial.len());
        let current_id = space.trial[site].id;
        let candidates: Vec<&EquilibriumProcess> = self.processes.iter().filter(|p| p.involves(current_id)).collect();
        if candidates.is_empty() {
            return 0.0;
        }
        let process = candidates[rng.range(0, candidates.len())];
        let Some((new_id, delta_intrinsic)) = process.other_end(current_id) else {
            return 0.0;
        };

        space.trial[site].id = new_id;
        if let Some(&new_charge) = self.save_charge.get(&new_id) {
            space.trial[site].charge = new_charge;
        }

        let interaction = hamiltonian.interaction_energy(&space.trial, &[site]) - hamiltonian.interaction_energy(&space.committed, &[site]);
        self.last_interaction_energy = interaction;
        let delta_u = interaction + delta_intrinsic;

        let group_index = space
            .groups
            .iter()
            .position(|g| g.range.contains(&site))
            .expect("every particle belongs to a group");
        let mut change = Change::default();
        change.register_particle(group_index, site);
        let accepted = rng.uniform() <= (-delta_u).exp();
        if accepted {
            space.commit(&change);
            self.counters.record_acceptance();
            self.acceptance.record(site, true, 0.0);
            interaction
        } else {
            space.reject(&change);
            self.acceptance.record(site, false, 0.0);
            0.0
        }
    }
}

impl crate::moves::RunnableMove for TitrationSwap {
    fn name(&self) -> &str {
        self.name()
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
        self.report(runfraction, relative_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{Coulomb, Nonbonded};
    use crate::space::{Cuboid, Group, Particle, Space};
    use nalgebra::Vector3;

    fn titratable_space() -> Space {
        let particles = vec![
            Particle::new(Vector3::new(0.0, 0.0, 0.0), 0.0, 0), // bound (neutral acid)
            Particle::new(Vector3::new(5.0, 0.0, 0.0), 0.0, 2),
        ];
        let groups = vec![Group::new("site", 0, 0..1, false), Group::new("other", 1, 1..2, false)];
        Space::new(particles, groups, Cuboid::cubic(100.0))
    }

    #[test]
    fn at_ph_equal_pk_acceptance_is_driven_by_interaction_only() {
        let mut space = titratable_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(61);
        let mut save_charge = std::collections::HashMap::new();
        save_charge.insert(0, 0.0);
        save_charge.insert(1, -1.0);
        let processes = vec![EquilibriumProcess { bound_id: 0, unbound_id: 1, pk: 7.0, ph: 7.0 }];
        let mut mover = TitrationSwap::new(processes, 1.0, save_charge);
        for _ in 0..20 {
            mover.run(&mut space, &hamiltonian, &mut rng);
        }
        assert!(space.committed_matches_trial());
    }

    #[test]
    fn site_with_no_matching_process_is_a_no_op() {
        let mut space = titratable_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(62);
        let processes = vec![EquilibriumProcess { bound_id: 5, unbound_id: 6, pk: 7.0, ph: 7.0 }];
        let mut mover = TitrationSwap::new(processes, 1.0, std::collections::HashMap::new());
        let du = mover.run(&mut space, &hamiltonian, &mut rng);
        assert_eq!(du, 0.0);
    }
}
