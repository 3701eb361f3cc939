//! Parallel tempering (spec section 4.10): periodic replica-exchange
//! attempts between neighbouring Markov chains. The move framework has no
//! MPI collaborator in scope, so the exchange channel is modelled as a
//! trait with an in-process, queue-backed implementation suitable for
//! single-process tests; a multi-process deployment substitutes a real
//! message-passing layer at this seam.

use crate::energy::Hamiltonian;
use crate::rng::MoveRng;
use crate::space::{Particle, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What a replica exchanges with its partner: full particle state, plus
/// whatever box volume went with it (so NPT replicas exchange consistently).
#[derive(Clone, Debug)]
pub struct ReplicaState {
    pub particles: Vec<Particle>,
    pub volume: f64,
}

/// The messaging seam a real MPI-backed deployment would implement instead
/// of [`InProcessChannel`]. Every call names both the sending and the
/// receiving rank explicitly, so a queue-backed stand-in can key on the
/// ordered `(from_rank, to_rank)` pair rather than guessing a direction.
/// `recv`/`recv_energy` return `None` rather than blocking when the
/// partner hasn't posted yet; a real transport would block instead, but a
/// single-process stand-in has no way to wait for a call that hasn't
/// happened.
pub trait ReplicaChannel {
    fn send(&self, from_rank: usize, to_rank: usize, state: ReplicaState);
    fn recv(&self, from_rank: usize, to_rank: usize) -> Option<ReplicaState>;
    fn send_energy(&self, from_rank: usize, to_rank: usize, delta_u: f64);
    fn recv_energy(&self, from_rank: usize, to_rank: usize) -> Option<f64>;
}

/// A pair of FIFO queues per ordered rank pair, usable to exercise the
/// tempering move in single-process tests without a real transport.
#[derive(Clone, Default)]
pub struct InProcessChannel {
    states: Arc<Mutex<std::collections::HashMap<(usize, usize), VecDeque<ReplicaState>>>>,
    energies: Arc<Mutex<std::collections::HashMap<(usize, usize), VecDeque<f64>>>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaChannel for InProcessChannel {
    fn send(&self, from_rank: usize, to_rank: usize, state: ReplicaState) {
        self.states
            .lock()
            .expect("replica channel lock poisoned")
            .entry((from_rank, to_rank))
            .or_default()
            .push_back(state);
    }

    fn recv(&self, from_rank: usize, to_rank: usize) -> Option<ReplicaState> {
        self.states
            .lock()
            .expect("replica channel lock poisoned")
            .get_mut(&(from_rank, to_rank))
            .and_then(|queue| queue.pop_front())
    }

    fn send_energy(&self, from_rank: usize, to_rank: usize, delta_u: f64) {
        self.energies
            .lock()
            .expect("replica channel lock poisoned")
            .entry((from_rank, to_rank))
            .or_default()
            .push_back(delta_u);
    }

    fn recv_energy(&self, from_rank: usize, to_rank: usize) -> Option<f64> {
        self.energies
            .lock()
            .expect("replica channel lock poisoned")
            .get_mut(&(from_rank, to_rank))
            .and_then(|queue| queue.pop_front())
    }
}

/// One replica's tempering move: every invocation attempts an exchange with
/// a deterministically chosen partner rank.
pub struct ParallelTempering<C: ReplicaChannel> {
    rank: usize,
    channel: C,
    probability: f64,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
}

impl<C: ReplicaChannel> ParallelTempering<C> {
    pub fn new(rank: usize, channel: C, probability: f64) -> Self {
        ParallelTempering {
            rank,
            channel,
            probability,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        "temper"
    }

    pub fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    pub fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::Value::Null,
        }
    }

    /// Partner selection: even ranks add 1, odd ranks subtract 1, with a
    /// 50/50 sign flip that lets the pairing alternate across the replica
    /// chain over successive exchange attempts.
    fn partner_rank(&self, replica_count: usize, rng: &mut MoveRng) -> Option<usize> {
        let sign: i64 = if self.rank % 2 == 0 { 1 } else { -1 };
        let flip: i64 = if rng.coin_flip() { 1 } else { -1 };
        let candidate = self.rank as i64 + sign * flip;
        if candidate < 0 || candidate as usize >= replica_count {
            None
        } else {
            Some(candidate as usize)
        }
    }

    /// Attempt one replica-exchange step. Returns this replica's own ΔU
    /// only, never the partner's, so apparent energy drift is not double
    /// counted across the ensemble.
    pub fn run(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, replica_count: usize, rng: &mut MoveRng) -> f64 {
        if rng.uniform() > self.probability {
            return 0.0;
        }
        self.counters.record_attempt();
        let Some(partner) = self.partner_rank(replica_count, rng) else {
            return 0.0;
        };

        let own_state = ReplicaState {
            particles: space.trial.clone(),
            volume: space.boundary.volume(),
        };
        self.channel.send(self.rank, partner, own_state);
        // the partner may not have posted its side of the exchange yet; that
        // is a routine "try again next round" outcome, not an error
        let Some(partner_state) = self.channel.recv(partner, self.rank) else {
            return 0.0;
        };

        let energy_before = hamiltonian.system_energy(&space.committed);
        let energy_after = hamiltonian.system_energy(&partner_state.particles);
        let delta_u_self = energy_after - energy_before;

        self.channel.send_energy(self.rank, partner, delta_u_self);
        let Some(delta_u_partner) = self.channel.recv_energy(partner, self.rank) else {
            return 0.0;
        };

        let combined = (-delta_u_self - delta_u_partner).exp().min(1.0);
        let accepted = rng.uniform() <= combined;
        if accepted {
            space.trial = partner_state.particles;
            space.committed = space.trial.clone();
            space.boundary.set_volume(partner_state.volume);
            space.tracker.rebuild(&space.committed);
            space.recompute_all_mass_centres();
            self.counters.record_acceptance();
            self.acceptance.record(partner, true, 0.0);
            delta_u_self
        } else {
            self.acceptance.record(partner, false, 0.0);
            0.0
        }
    }
}

impl<C: ReplicaChannel> crate::moves::RunnableMove for ParallelTempering<C> {
    fn name(&self) -> &str {
        self.name()
    }

    fn run_step(&mut self, space: &mut Space, hamiltonian: &dyn Hamiltonian, rng: &mut MoveRng) -> f64 {
        self.run(space, hamiltonian, 1, rng)
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
    use crate::space::{Cuboid, Group, Space};
    use nalgebra::Vector3;

    fn single_particle_space(x: f64) -> Space {
        let particles = vec![Particle::new(Vector3::new(x, 0.0, 0.0), 1.0, 0)];
        let groups = vec![Group::new("a", 0, 0..1, false)];
        Space::new(particles, groups, Cuboid::cubic(50.0))
    }

    /// Finds a seed whose probability-gate draw plus partner-selection draw
    /// sends `rank` to `expected_partner`, so tests can drive `run()` down a
    /// known branch without guessing at `MoveRng`'s distribution.
    fn seeded_rng_with_partner(rank: usize, expected_partner: usize) -> MoveRng {
        for seed in 0..200u64 {
            let mut probe = MoveRng::from_seed(seed);
            let _ = probe.uniform(); // mirrors run()'s probability-gate draw
            let replica = ParallelTempering::new(rank, InProcessChannel::new(), 1.0);
            if replica.partner_rank(2, &mut probe) == Some(expected_partner) {
                return MoveRng::from_seed(seed);
            }
        }
        panic!("no seed found with a valid partner in range");
    }

    #[test]
    fn channel_recv_reads_cross_partner_queue_not_own_send() {
        let channel = InProcessChannel::new();
        let state = ReplicaState { particles: Vec::new(), volume: 1.0 };
        channel.send(0, 1, state);
        // nothing has been sent in the 1 -> 0 direction yet
        assert!(channel.recv(1, 0).is_none());
        // the message addressed 0 -> 1 is readable by its addressee, not by
        // the sender reading its own outbox back
        assert!(channel.recv(0, 1).is_some());
    }

    #[test]
    fn exchange_reads_the_partners_posted_state_not_its_own() {
        let mut space_a = single_particle_space(1.0);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let channel = InProcessChannel::new();

        // simulate replica 1 having already reported a distinct state and a
        // neutral delta-U to replica 0
        let partner_particles = vec![Particle::new(Vector3::new(7.0, 0.0, 0.0), 1.0, 0)];
        channel.send(
            1,
            0,
            ReplicaState { particles: partner_particles.clone(), volume: space_a.boundary.volume() },
        );
        channel.send_energy(1, 0, 0.0);

        let mut rng = seeded_rng_with_partner(0, 1);
        let mut replica_a = ParallelTempering::new(0, channel, 1.0);
        let du = replica_a.run(&mut space_a, &hamiltonian, 2, &mut rng);

        assert_eq!(du, 0.0);
        assert_eq!(space_a.committed[0].position, partner_particles[0].position);
    }

    #[test]
    fn exchange_without_a_reply_is_a_silent_no_op() {
        let mut space_a = single_particle_space(1.0);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let channel = InProcessChannel::new();
        let original_position = space_a.committed[0].position;

        let mut rng = seeded_rng_with_partner(0, 1);
        let mut replica_a = ParallelTempering::new(0, channel, 1.0);
        let du = replica_a.run(&mut space_a, &hamiltonian, 2, &mut rng);

        assert_eq!(du, 0.0);
        assert_eq!(space_a.committed[0].position, original_position);
    }

    #[test]
    fn partner_rank_stays_within_bounds() {
        let channel = InProcessChannel::new();
        let replica = ParallelTempering::new(0, channel, 1.0);
        let mut rng = MoveRng::from_seed(93);
        for _ in 0..20 {
            if let Some(partner) = replica.partner_rank(2, &mut rng) {
                assert!(partner < 2);
            }
        }
    }
}
