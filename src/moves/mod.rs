//! The move operator protocol (see `SPEC_FULL.md` section 4.1) and the
//! shared move-list metadata every concrete move is configured with.
//!
//! One trait, `MoveAlgorithm`, carries the six operations every move
//! implements; concrete moves are plain structs stored as boxed trait
//! objects in the [`crate::propagator::Propagator`]'s move list, the same
//! shape as this crate's original `MonteCarloMove`/`Propagator` pairing, now
//! carrying move-list sampling, repeat counts, and acceptance bookkeeping
//! keyed per molecule instead of per move.

pub mod atomic;
pub mod cluster;
pub mod cluster_free;
pub mod grandcanonical;
pub mod grouptransrot;
pub mod polarize;
pub mod polymer;
pub mod temper;
pub mod titration;
pub mod titration_gc;
pub mod volume;

use crate::energy::Hamiltonian;
use crate::rng::MoveRng;
use crate::space::{Change, Space};
use crate::stats::{MoveCounters, MoveReport};
use nalgebra::Vector3;

/// Per-(move, molecule) configuration, as described in the data model:
/// probability, a direction mask, two move-specific scalar displacement
/// parameters, and the two repeat-count multipliers.
#[derive(Clone, Debug)]
pub struct MoveListEntry {
    pub molecule_id: usize,
    pub probability: f64,
    pub direction: Vector3<f64>,
    pub dp1: f64,
    pub dp2: f64,
    pub per_atom: bool,
    pub per_mol: bool,
}

impl MoveListEntry {
    pub fn new(molecule_id: usize) -> Self {
        MoveListEntry {
            molecule_id,
            probability: 1.0,
            direction: Vector3::new(1.0, 1.0, 1.0),
            dp1: 0.0,
            dp2: 0.0,
            per_atom: false,
            per_mol: false,
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_dp(mut self, dp1: f64, dp2: f64) -> Self {
        self.dp1 = dp1;
        self.dp2 = dp2;
        self
    }

    pub fn with_direction(mut self, direction: Vector3<f64>) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_repeat_flags(mut self, per_atom: bool, per_mol: bool) -> Self {
        self.per_atom = per_atom;
        self.per_mol = per_mol;
        self
    }
}

/// How many groups of `molecule_id` currently exist, and how large the
/// first one is -- the two ingredients `MoveListEntry::repeat` needs.
pub fn num_molecules_of_type(space: &Space, molecule_id: usize) -> usize {
    space.groups.iter().filter(|g| g.molecule_id == molecule_id).count()
}

pub fn group_size_of_molecule(space: &Space, molecule_id: usize) -> usize {
    space
        .groups
        .iter()
        .find(|g| g.molecule_id == molecule_id)
        .map(|g| g.len())
        .unwrap_or(0)
}

/// `repeat = 1 * (perAtom ? group.size : 1) * (perMol ? numMoleculesOfType : 1)`.
pub fn effective_repeat(entry: &MoveListEntry, space: &Space) -> usize {
    let mut repeat = 1usize;
    if entry.per_atom {
        repeat *= group_size_of_molecule(space, entry.molecule_id).max(1);
    }
    if entry.per_mol {
        repeat *= num_molecules_of_type(space, entry.molecule_id).max(1);
    }
    repeat
}

/// What the propagator actually dispatches against.
///
/// Most moves fit the strict propose/evaluate/accept/reject split of
/// [`MoveAlgorithm`] and get this for free via the blanket impl below. A
/// handful of moves -- the rejection-free cluster translation and the
/// grand-canonical family -- compute their own non-Metropolis or
/// ideal-gas-augmented acceptance internally and drive their own commit;
/// those implement this trait directly instead of `MoveAlgorithm`.
pub trait RunnableMove {
    fn name(&self) -> &str;
    fn run_step(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64;
    fn trials(&self) -> u64;
    fn acceptance_ratio(&self) -> f64;
    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport;
}

impl<T: MoveAlgorithm> RunnableMove for T {
    fn name(&self) -> &str {
        MoveAlgorithm::name(self)
    }

    fn run_step(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        self.step(space, hamiltonian, rng)
    }

    fn trials(&self) -> u64 {
        self.counters().trials
    }

    fn acceptance_ratio(&self) -> f64 {
        self.counters().acceptance_ratio()
    }

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        MoveAlgorithm::report(self, runfraction, relative_time)
    }
}

/// The uniform operator protocol every concrete move implements.
pub trait MoveAlgorithm {
    fn name(&self) -> &str;

    /// Per-(move, molecule) configuration entries this move was built with.
    fn move_list(&self) -> &[MoveListEntry];

    /// Informs the move which move-list entry governs the trial about to
    /// run, so `propose` knows which molecule/parameters to use.
    fn set_current_entry(&mut self, index: usize);

    /// Attempt a trial perturbation, writing the change descriptor. Returns
    /// `false` for a silent no-op (e.g. insufficient inventory for a
    /// deletion) which counts as an attempt but not a rejection.
    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool;

    /// The Metropolis-test energy (kT), which for grand-canonical and
    /// titration moves includes an ideal-gas or intrinsic term in addition
    /// to the Hamiltonian's interaction energy.
    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64;

    fn accept(&mut self, space: &mut Space, change: &Change);
    fn reject(&mut self, space: &mut Space, change: &Change);

    /// When the reported/tracked energy differs from the Metropolis-test
    /// energy (grand-canonical moves, whose acceptance includes an
    /// ideal-gas term that should not count as "real" Hamiltonian drift),
    /// a move overrides this to report the interaction-only delta for the
    /// most recently evaluated trial.
    fn alternate_return_energy(&self) -> Option<f64> {
        None
    }

    fn counters_mut(&mut self) -> &mut MoveCounters;
    fn counters(&self) -> &MoveCounters;

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport;

    /// Drives one Markov step: select a move-list entry, test runfraction,
    /// then repeat `propose`/`energy_change`/accept-or-reject `repeat`
    /// times. Returns the summed reported energy change.
    fn step(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        if self.move_list().is_empty() {
            return 0.0;
        }
        let index = rng.range(0, self.move_list().len());
        let (runfraction, repeat) = {
            let entry = &self.move_list()[index];
            (entry.probability, effective_repeat(entry, space))
        };
        self.set_current_entry(index);
        if rng.uniform() > runfraction {
            return 0.0;
        }

        let mut energy_total = 0.0;
        for _ in 0..repeat.max(1) {
            self.counters_mut().record_attempt();
            let mut change = Change::default();
            if !self.propose(space, &mut change, rng) {
                continue;
            }
            hamiltonian.notify_change(&change);
            let delta_u = self.energy_change(space, hamiltonian, &change);
            // Exactly one draw, regardless of the sign of delta_u, so
            // lock-step replica-exchange schemes stay in sync.
            let uniform = rng.uniform();
            let accepted = uniform <= (-delta_u).exp();
            if accepted {
                self.accept(space, &change);
                self.counters_mut().record_acceptance();
                energy_total += self.alternate_return_energy().unwrap_or(delta_u);
            } else {
                self.reject(space, &change);
            }
            debug_assert!(
                space.committed_matches_trial(),
                "{}: committed/trial mismatch after step",
                self.name()
            );
        }
        energy_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Cuboid, Group, Particle, Space};

    fn two_molecule_space() -> Space {
        let particles = vec![
            Particle::new(Vector3::zeros(), 0.0, 0),
            Particle::new(Vector3::zeros(), 0.0, 0),
            Particle::new(Vector3::zeros(), 0.0, 0),
        ];
        let groups = vec![
            Group::new("m", 0, 0..2, true),
            Group::new("m", 0, 2..3, true),
        ];
        Space::new(particles, groups, Cuboid::cubic(100.0))
    }

    #[test]
    fn effective_repeat_combines_per_atom_and_per_mol() {
        let space = two_molecule_space();
        let entry = MoveListEntry::new(0).with_repeat_flags(true, true);
        // molecule 0 has two groups, the first sized 2 -> repeat = 2 * 2 = 4
        assert_eq!(effective_repeat(&entry, &space), 4);
    }

    #[test]
    fn effective_repeat_defaults_to_one() {
        let space = two_molecule_space();
        let entry = MoveListEntry::new(0);
        assert_eq!(effective_repeat(&entry, &space), 1);
    }
}
