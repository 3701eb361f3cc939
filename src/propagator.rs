//! The propagator (spec section 4.11): owns the move roster and the two
//! RNG streams, samples one move uniformly per outer step, and tracks an
//! energy-drift diagnostic across the whole run.

use crate::energy::Hamiltonian;
use crate::moves::RunnableMove;
use crate::rng::MoveRng;
use crate::space::Space;
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;

/// Default relative-drift assertion threshold, `0.1%` of the sampled
/// energy, per the diagnostic this dispatcher is required to run.
pub const DEFAULT_DRIFT_TOLERANCE: f64 = 1e-3;

/// One move slot in the roster, boxed behind [`RunnableMove`] so atomic
/// moves, group moves, and the ideal-gas-augmented grand-canonical/titration
/// moves can all be dispatched uniformly.
pub struct Propagator {
    moves: Vec<Box<dyn RunnableMove>>,
    global_rng: SmallRng,
    move_rng: MoveRng,
    delta_u_sum: f64,
    u_initial: Option<f64>,
    steps_run: u64,
    drift_tolerance: f64,
}

impl Propagator {
    pub fn new(seed: u64) -> Self {
        let mut global_rng = SmallRng::seed_from_u64(seed);
        let move_rng = MoveRng::seeded_from(&mut global_rng);
        Propagator {
            moves: Vec::new(),
            global_rng,
            move_rng,
            delta_u_sum: 0.0,
            u_initial: None,
            steps_run: 0,
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
        }
    }

    pub fn with_drift_tolerance(mut self, tolerance: f64) -> Self {
        self.drift_tolerance = tolerance;
        self
    }

    pub fn push(&mut self, mov: Box<dyn RunnableMove>) {
        self.moves.push(mov);
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Access to the propagator's own RNG stream, e.g. for a caller that
    /// needs to seed a replica-exchange channel from the same seed tree.
    pub fn global_rng_mut(&mut self) -> &mut SmallRng {
        &mut self.global_rng
    }

    /// Run `steps` outer Markov steps, sampling one move uniformly each
    /// time. The first call records `U_initial`; later calls accumulate
    /// onto the same running `ΔU_sum` so `check_energy_drift` reflects the
    /// whole session, not just the latest `run` call.
    pub fn run(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, steps: u64) {
        if self.moves.is_empty() {
            warn!("propagator has an empty move roster; run() is a no-op");
            return;
        }
        if self.u_initial.is_none() {
            self.u_initial = Some(hamiltonian.system_energy(&space.committed));
            info!(
                "propagator roster: {}",
                self.moves.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
            );
        }

        for step in 0..steps {
            let index = self.move_rng.range(0, self.moves.len());
            let delta_u = {
                let mov = &mut self.moves[index];
                let delta_u = mov.run_step(space, hamiltonian, &mut self.move_rng);
                debug!("step {}: move `{}` dU = {:.6}", self.steps_run, mov.name(), delta_u);
                delta_u
            };
            if delta_u.is_nan() {
                warn!("step {}: move `{}` reported a NaN energy change", step, self.moves[index].name());
            }
            self.delta_u_sum += delta_u;
            self.steps_run += 1;
        }

        for mov in &self.moves {
            info!("move `{}`: trials={} acceptance={:.4}", mov.name(), mov.trials(), mov.acceptance_ratio());
        }
    }

    /// `drift = U_sampled − (U_initial + ΔU_sum)`. Returns the relative
    /// drift `|drift / U_sampled|` (or the bare drift if `U_sampled` is
    /// within rounding of zero).
    pub fn energy_drift(&self, space: &Space, hamiltonian: &dyn Hamiltonian) -> f64 {
        let u_initial = self.u_initial.unwrap_or(0.0);
        let u_sampled = hamiltonian.system_energy(&space.committed);
        let drift = u_sampled - (u_initial + self.delta_u_sum);
        if u_sampled.abs() > 1e-9 {
            (drift / u_sampled).abs()
        } else {
            drift.abs()
        }
    }

    /// Asserts the energy-drift diagnostic is within `drift_tolerance`.
    /// Panics on breach: per the error-handling design, a numerically
    /// drifting Hamiltonian is an invariant violation, not a recoverable
    /// configuration mistake.
    pub fn assert_energy_drift_within_tolerance(&self, space: &Space, hamiltonian: &dyn Hamiltonian) {
        let relative = self.energy_drift(space, hamiltonian);
        assert!(
            relative < self.drift_tolerance,
            "energy drift {:.3e} exceeds tolerance {:.3e}",
            relative,
            self.drift_tolerance
        );
    }

    /// A JSON summary of every move's report plus the drift diagnostic --
    /// the document the propagator writes on completion (honouring the
    /// `_jsonfile` configuration key, or stdout otherwise).
    pub fn summary(&self, space: &Space, hamiltonian: &dyn Hamiltonian) -> RunSummary {
        let total_trials: u64 = self.moves.iter().map(|m| m.trials()).sum();
        let reports = self
            .moves
            .iter()
            .map(|mov| {
                let runfraction = if self.steps_run == 0 { 0.0 } else { mov.trials() as f64 / self.steps_run as f64 };
                let relative_time = if total_trials == 0 { 0.0 } else { mov.trials() as f64 / total_trials as f64 };
                mov.report(runfraction, relative_time)
            })
            .collect();
        RunSummary {
            steps_run: self.steps_run,
            delta_u_sum: self.delta_u_sum,
            energy_drift: self.energy_drift(space, hamiltonian),
            moves: reports,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub steps_run: u64,
    pub delta_u_sum: f64,
    pub energy_drift: f64,
    pub moves: Vec<crate::stats::MoveReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{Coulomb, Nonbonded};
    use crate::moves::atomic::AtomTranslate;
    use crate::moves::MoveListEntry;
    use crate::space::{Cuboid, Group, Particle, Space};
    use nalgebra::Vector3;

    fn two_particle_space() -> Space {
        let particles = vec![
            Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 0),
            Particle::new(Vector3::new(5.0, 0.0, 0.0), -1.0, 1),
        ];
        let groups = vec![Group::new("a", 0, 0..1, false), Group::new("b", 1, 1..2, false)];
        Space::new(particles, groups, Cuboid::cubic(50.0))
    }

    #[test]
    fn zero_dp_run_has_zero_drift() {
        let mut space = two_particle_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(7.0));
        let entry = MoveListEntry::new(0).with_dp(0.0, 0.0).with_repeat_flags(false, false);
        let mut propagator = Propagator::new(11);
        propagator.push(Box::new(AtomTranslate::new(vec![entry])));
        propagator.run(&mut space, &hamiltonian, 200);
        assert!(propagator.energy_drift(&space, &hamiltonian) < 1e-9);
    }

    #[test]
    fn empty_roster_run_does_not_panic() {
        let mut space = two_particle_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(7.0));
        let mut propagator = Propagator::new(12);
        propagator.run(&mut space, &hamiltonian, 10);
        assert_eq!(propagator.summary(&space, &hamiltonian).steps_run, 0);
    }
}
