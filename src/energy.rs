// Copyright (c) 2022 Mikael Lund
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! The Hamiltonian collaborator.
//!
//! The move framework is agnostic to the physics encoded here: it only
//! needs an incremental energy for a [`Change`] and, for the polarisation
//! wrapper and grand-canonical moves, a couple of narrower queries. The
//! concrete `Nonbonded` potential below generalises this crate's original
//! pairwise energy terms (`particle_energy`, `swap_move_energy`) from one or
//! two hardcoded indices to an arbitrary moved-index set, which is what
//! group, cluster, and rejection-free moves all need.

use crate::space::{Change, Particle, Space};
use nalgebra::Vector3;
use std::collections::HashSet;

/// Pairwise interaction between two particles (kT units).
pub trait PairPotential {
    fn energy(&self, particle_1: &Particle, particle_2: &Particle) -> f64;

    /// Electric field produced by `source` at `target`'s position, used by
    /// the polarisation wrapper. Defaults to zero for potentials that don't
    /// model polarisability.
    fn field(&self, source: &Particle, target: &Particle) -> Vector3<f64> {
        let _ = (source, target);
        Vector3::zeros()
    }
}

/// Trait for the full Hamiltonian as seen by the move framework.
pub trait Hamiltonian {
    /// Opaque hook fired before `energy_change`; lets a caching Hamiltonian
    /// know what is about to be evaluated. No-op by default.
    fn notify_change(&self, change: &Change) {
        let _ = change;
    }

    /// Incremental energy of the trial state relative to the committed
    /// state, for a `Change` that does not alter particle count.
    fn energy_change(&self, space: &Space, change: &Change) -> f64;

    /// Total system energy of a particle configuration (used for full
    /// recomputes: volume moves, the polarisation wrapper, parallel
    /// tempering's replica exchange, and diagnostics).
    fn system_energy(&self, particles: &[Particle]) -> f64;

    /// Interaction energy between `indices` and every other particle in
    /// `particles`, not double-counting pairs where both ends are in
    /// `indices`. Used directly by grand-canonical and titration moves,
    /// whose acceptance energy composes this with an ideal-gas or intrinsic
    /// term the move itself supplies.
    fn interaction_energy(&self, particles: &[Particle], indices: &[usize]) -> f64;

    /// Electric field at `index`'s position from every other particle.
    /// Used by the polarisation wrapper; defaults to zero so Hamiltonians
    /// that don't model polarisability need not implement it.
    fn field_at(&self, particles: &[Particle], index: usize) -> Vector3<f64> {
        let _ = (particles, index);
        Vector3::zeros()
    }

    /// Intramolecular (bonded) energy of the particles in `range`, used by
    /// conformation swap to account for the internal-energy difference
    /// between the old and new conformation. Defaults to zero for a purely
    /// nonbonded Hamiltonian.
    fn internal_energy(&self, particles: &[Particle], range: std::ops::Range<usize>) -> f64 {
        let _ = (particles, range);
        0.0
    }
}

/// Sum of a single pair potential over all distinct particle pairs.
pub struct Nonbonded<P: PairPotential> {
    pub pair_potential: P,
}

impl<P: PairPotential> Nonbonded<P> {
    pub fn new(pair_potential: P) -> Self {
        Nonbonded { pair_potential }
    }

    fn pair_energy_indices(&self, particles: &[Particle], moved: &[usize]) -> f64 {
        let moved_set: HashSet<usize> = moved.iter().copied().collect();
        let mut energy = 0.0;
        for &i in moved {
            for j in 0..particles.len() {
                if i == j {
                    continue;
                }
                // a moved-moved pair must be counted exactly once
                if moved_set.contains(&j) && j < i {
                    continue;
                }
                energy += self.pair_potential.energy(&particles[i], &particles[j]);
            }
        }
        energy
    }
}

impl<P: PairPotential> Hamiltonian for Nonbonded<P> {
    fn energy_change(&self, space: &Space, change: &Change) -> f64 {
        if change.geometry_change {
            let old = self.system_energy(&space.committed);
            let new = self.system_energy(&space.trial);
            return new - old;
        }
        let moved = change.moved_indices(&space.groups);
        let old = self.pair_energy_indices(&space.committed, &moved);
        let new = self.pair_energy_indices(&space.trial, &moved);
        new - old
    }

    fn system_energy(&self, particles: &[Particle]) -> f64 {
        let mut energy = 0.0;
        for i in 0..particles.len() {
            for j in (i + 1)..particles.len() {
                energy += self.pair_potential.energy(&particles[i], &particles[j]);
            }
        }
        energy
    }

    fn interaction_energy(&self, particles: &[Particle], indices: &[usize]) -> f64 {
        self.pair_energy_indices(particles, indices)
    }

    fn field_at(&self, particles: &[Particle], index: usize) -> Vector3<f64> {
        let target = &particles[index];
        let mut field = Vector3::zeros();
        for (j, source) in particles.iter().enumerate() {
            if j != index {
                field += self.pair_potential.field(source, target);
            }
        }
        field
    }
}

/// Coulomb interaction with a soft-core repulsion.
pub struct Coulomb {
    /// Bjerrum length, e^2 / 4 x pi x epsilon_0 x epsilon_r * k_B * T
    pub bjerrum_length: f64,
    /// Soft-core repulsion prefactor; set to zero to recover bare Coulomb.
    pub softcore_sigma: f64,
}

impl Coulomb {
    pub fn new(bjerrum_length: f64) -> Self {
        Coulomb {
            bjerrum_length,
            softcore_sigma: 4.0,
        }
    }
}

impl PairPotential for Coulomb {
    fn energy(&self, particle_1: &Particle, particle_2: &Particle) -> f64 {
        let distance = (particle_1.position - particle_2.position).norm();
        4.0 * f64::powi(self.softcore_sigma / distance, 12)
            + self.bjerrum_length * particle_1.charge * particle_2.charge / distance
    }

    fn field(&self, source: &Particle, target: &Particle) -> Vector3<f64> {
        let r = target.position - source.position;
        let distance = r.norm();
        if distance < 1e-12 {
            return Vector3::zeros();
        }
        self.bjerrum_length * source.charge * r / distance.powi(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Cuboid, Group, Particle, Space};
    use approx::assert_abs_diff_eq;

    fn two_particle_space(distance: f64) -> Space {
        let particles = vec![
            Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 0),
            Particle::new(Vector3::new(distance, 0.0, 0.0), -1.0, 1),
        ];
        let groups = vec![
            Group::new("a", 0, 0..1, false),
            Group::new("b", 1, 1..2, false),
        ];
        Space::new(particles, groups, Cuboid::cubic(1000.0))
    }

    #[test]
    fn energy_change_matches_full_recompute() {
        let mut space = two_particle_space(5.0);
        let hamiltonian = Nonbonded::new(Coulomb::new(7.0));
        space.trial[1].position.x = 6.0;
        let mut change = Change::default();
        change.register_particle(1, 1);

        let incremental = hamiltonian.energy_change(&space, &change);
        let old = hamiltonian.system_energy(&space.committed);
        let new = hamiltonian.system_energy(&space.trial);
        assert_abs_diff_eq!(incremental, new - old, epsilon = 1e-9);
    }

    #[test]
    fn interaction_energy_of_whole_system_equals_system_energy() {
        let space = two_particle_space(5.0);
        let hamiltonian = Nonbonded::new(Coulomb::new(7.0));
        let indices: Vec<usize> = (0..space.committed.len()).collect();
        let via_indices = hamiltonian.interaction_energy(&space.committed, &indices);
        let via_system = hamiltonian.system_energy(&space.committed);
        assert_abs_diff_eq!(via_indices, via_system, epsilon = 1e-9);
    }
}
