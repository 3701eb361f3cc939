//! The data model shared by every move: particles, groups, the change
//! descriptor, and the particle tracker, plus a minimal periodic-boundary
//! collaborator sufficient to exercise the move framework end to end.
//!
//! The pair/energy Hamiltonian, the full geometry package, and the
//! particle/molecule parameter database are out of scope for this crate;
//! [`Boundary`] is a deliberately small stand-in for "the geometry", named
//! the way the specification's design notes ask for.

use crate::rng::MoveRng;
use nalgebra::Vector3;
use std::collections::HashMap;
use std::ops::Range;

/// A single particle: position, charge, identity and the handful of
/// per-particle attributes the move family needs (radius for cluster
/// overlap tests, dipole for the polarisation wrapper).
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub position: Vector3<f64>,
    pub charge: f64,
    /// Atom-type id; used by the tracker and by titration/grand-canonical moves.
    pub id: usize,
    pub radius: f64,
    /// Permanent dipole moment magnitude, direction encoded in `dipole_direction`.
    pub dipole_permanent: f64,
    pub dipole_direction: Vector3<f64>,
    /// Induced dipole, mutated only by the polarisation wrapper.
    pub dipole_induced: Vector3<f64>,
    /// Scalar polarisability (isotropic simplification of a full tensor).
    pub polarisability: f64,
    pub hydrophobic: bool,
}

impl Particle {
    pub fn new(position: Vector3<f64>, charge: f64, id: usize) -> Self {
        Particle {
            position,
            charge,
            id,
            radius: 0.0,
            dipole_permanent: 0.0,
            dipole_direction: Vector3::z(),
            dipole_induced: Vector3::zeros(),
            polarisability: 0.0,
            hydrophobic: false,
        }
    }

    /// Total dipole moment (permanent + induced), used by the Hamiltonian
    /// and by the polarisation wrapper's convergence check.
    pub fn total_dipole(&self) -> Vector3<f64> {
        self.dipole_permanent * self.dipole_direction + self.dipole_induced
    }
}

/// A contiguous half-open range of particle indices belonging to one
/// molecule or to an atomic pool (e.g. the mobile salt group).
#[derive(Clone, Debug)]
pub struct Group {
    pub name: String,
    pub molecule_id: usize,
    pub range: Range<usize>,
    pub committed_cm: Vector3<f64>,
    pub trial_cm: Vector3<f64>,
    /// Molecular groups track a mass centre; atomic pools (free ions) don't.
    pub molecular: bool,
}

impl Group {
    pub fn new(name: impl Into<String>, molecule_id: usize, range: Range<usize>, molecular: bool) -> Self {
        Group {
            name: name.into(),
            molecule_id,
            range,
            committed_cm: Vector3::zeros(),
            trial_cm: Vector3::zeros(),
            molecular,
        }
    }

    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Computes the mass centre (unweighted geometric centre) of a particle
/// slice, the convention the spec's molecular groups use.
pub fn mass_centre(particles: &[Particle], range: Range<usize>) -> Vector3<f64> {
    let slice = &particles[range.clone()];
    if slice.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = slice.iter().map(|p| p.position).sum();
    sum / (slice.len() as f64)
}

/// Describes what the current trial altered: which groups had which
/// particle indices moved, and whether the box volume changed.
///
/// An entry with an empty index list means "every particle of this group
/// moved together" -- the signal a group-level move gives the Hamiltonian so
/// it can use a cheaper group-vs-rest energy evaluation instead of summing
/// per particle.
#[derive(Clone, Debug, Default)]
pub struct Change {
    pub groups: HashMap<usize, Vec<usize>>,
    pub geometry_change: bool,
    pub d_volume: f64,
}

impl Change {
    pub fn clear(&mut self) {
        self.groups.clear();
        self.geometry_change = false;
        self.d_volume = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && !self.geometry_change
    }

    /// Register that a single particle index within `group_index` moved.
    pub fn register_particle(&mut self, group_index: usize, particle_index: usize) {
        self.groups.entry(group_index).or_default().push(particle_index);
    }

    /// Register that every particle of `group_index` moved together.
    pub fn register_whole_group(&mut self, group_index: usize) {
        self.groups.entry(group_index).or_default();
    }

    /// Resolve the change into a flat, deduplicated list of absolute
    /// particle indices, expanding "whole group moved" entries using the
    /// current group ranges.
    pub fn moved_indices(&self, groups: &[Group]) -> Vec<usize> {
        let mut indices = Vec::new();
        for (&group_index, particle_indices) in &self.groups {
            if particle_indices.is_empty() {
                indices.extend(groups[group_index].range.clone());
            } else {
                indices.extend(particle_indices.iter().copied());
            }
        }
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Dense index from atom-type id to the positions in the particle vector
/// currently occupied by particles of that type. Lets grand-canonical moves
/// sample a random particle of a given type in O(1) instead of scanning.
#[derive(Clone, Debug, Default)]
pub struct ParticleTracker {
    positions: HashMap<usize, Vec<usize>>,
}

impl ParticleTracker {
    pub fn rebuild(&mut self, particles: &[Particle]) {
        self.positions.clear();
        for (index, particle) in particles.iter().enumerate() {
            self.positions.entry(particle.id).or_default().push(index);
        }
    }

    pub fn positions_of(&self, id: usize) -> &[usize] {
        self.positions.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn count(&self, id: usize) -> usize {
        self.positions.get(&id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn sample_index(&self, id: usize, rng: &mut MoveRng) -> Option<usize> {
        let positions = self.positions_of(id);
        if positions.is_empty() {
            None
        } else {
            Some(positions[rng.range(0, positions.len())])
        }
    }

    /// Check every tracked position still refers to a particle of the
    /// expected type -- used by invariant tests, not on the hot path.
    pub fn is_consistent(&self, particles: &[Particle]) -> bool {
        for (&id, positions) in &self.positions {
            for &index in positions {
                if particles.get(index).map(|p| p.id) != Some(id) {
                    return false;
                }
            }
        }
        let mut seen = vec![false; particles.len()];
        for positions in self.positions.values() {
            for &index in positions {
                if seen[index] {
                    return false; // an index is listed twice
                }
                seen[index] = true;
            }
        }
        particles
            .iter()
            .enumerate()
            .all(|(index, particle)| self.positions_of(particle.id).contains(&index) == seen[index])
    }
}

/// The geometry collaborator. Out of scope in detail, but a minimal cuboid
/// with periodic wrapping is provided so the move family can be driven and
/// tested without a full simulation package.
pub trait Boundary: std::fmt::Debug {
    fn wrap(&self, position: Vector3<f64>) -> Vector3<f64>;
    fn volume(&self) -> f64;
    fn set_volume(&mut self, volume: f64);
    /// Side lengths after an anisotropic rescale (used by isochoric moves).
    fn side_lengths(&self) -> Vector3<f64>;
    fn set_side_lengths(&mut self, sides: Vector3<f64>);
    fn random_position(&self, rng: &mut MoveRng) -> Vector3<f64>;
}

/// A simple periodic cuboid, the geometry the spec's end-to-end scenarios
/// are phrased in terms of.
#[derive(Clone, Debug)]
pub struct Cuboid {
    side: Vector3<f64>,
}

impl Cuboid {
    pub fn new(side: Vector3<f64>) -> Self {
        Cuboid { side }
    }

    pub fn cubic(length: f64) -> Self {
        Cuboid::new(Vector3::new(length, length, length))
    }
}

impl Boundary for Cuboid {
    fn wrap(&self, position: Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            position.x - self.side.x * (position.x / self.side.x).round(),
            position.y - self.side.y * (position.y / self.side.y).round(),
            position.z - self.side.z * (position.z / self.side.z).round(),
        )
    }

    fn volume(&self) -> f64 {
        self.side.x * self.side.y * self.side.z
    }

    fn set_volume(&mut self, volume: f64) {
        let scale = (volume / self.volume()).cbrt();
        self.side *= scale;
    }

    fn side_lengths(&self) -> Vector3<f64> {
        self.side
    }

    fn set_side_lengths(&mut self, sides: Vector3<f64>) {
        self.side = sides;
    }

    fn random_position(&self, rng: &mut MoveRng) -> Vector3<f64> {
        Vector3::new(
            self.side.x * rng.half(),
            self.side.y * rng.half(),
            self.side.z * rng.half(),
        )
    }
}

/// The shared mutable state every move borrows serially: the committed and
/// trial particle vectors, the group list, the tracker, and the geometry.
#[derive(Debug)]
pub struct Space {
    pub committed: Vec<Particle>,
    pub trial: Vec<Particle>,
    pub groups: Vec<Group>,
    pub tracker: ParticleTracker,
    pub boundary: Cuboid,
}

impl Space {
    pub fn new(particles: Vec<Particle>, groups: Vec<Group>, boundary: Cuboid) -> Self {
        let mut tracker = ParticleTracker::default();
        tracker.rebuild(&particles);
        let trial = particles.clone();
        let mut space = Space {
            committed: particles,
            trial,
            groups,
            tracker,
            boundary,
        };
        space.recompute_all_mass_centres();
        space
    }

    pub fn recompute_all_mass_centres(&mut self) {
        for group in &mut self.groups {
            if group.molecular {
                let cm = mass_centre(&self.committed, group.range.clone());
                group.committed_cm = cm;
                group.trial_cm = cm;
            }
        }
    }

    /// Copy the trial state onto the committed state for the indices named
    /// by `change`, or wholesale for a geometry change / particle-count
    /// change, and clear `change` afterwards.
    pub fn commit(&mut self, change: &Change) {
        if change.geometry_change || self.committed.len() != self.trial.len() {
            self.committed = self.trial.clone();
        } else {
            for index in change.moved_indices(&self.groups) {
                self.committed[index] = self.trial[index].clone();
            }
        }
        for &group_index in change.groups.keys() {
            let group = &mut self.groups[group_index];
            if group.molecular {
                group.committed_cm = group.trial_cm;
            }
        }
        self.tracker.rebuild(&self.committed);
    }

    /// Roll the trial state back to the committed state for the indices
    /// named by `change`, and clear `change` afterwards.
    pub fn reject(&mut self, change: &Change) {
        if change.geometry_change || self.committed.len() != self.trial.len() {
            self.trial = self.committed.clone();
        } else {
            for index in change.moved_indices(&self.groups) {
                self.trial[index] = self.committed[index].clone();
            }
        }
        for &group_index in change.groups.keys() {
            let group = &mut self.groups[group_index];
            if group.molecular {
                group.trial_cm = group.committed_cm;
            }
        }
    }

    /// Invariant check used by tests and by `debug_assert!`s in movers:
    /// committed and trial agree everywhere.
    pub fn committed_matches_trial(&self) -> bool {
        self.committed.len() == self.trial.len() && self.committed == self.trial
    }

    pub fn total_charge(&self) -> f64 {
        self.committed.iter().map(|p| p.charge).sum()
    }

    /// Append `particles` to the end of `group_index`'s range in the trial
    /// vector, shifting every later group's range by the inserted count.
    /// Used by grand-canonical moves to grow the particle count.
    pub fn insert_into_group(&mut self, group_index: usize, particles: Vec<Particle>) -> Vec<usize> {
        let count = particles.len();
        if count == 0 {
            return Vec::new();
        }
        let insert_at = self.groups[group_index].range.end;
        for (offset, particle) in particles.into_iter().enumerate() {
            self.trial.insert(insert_at + offset, particle);
        }
        for (i, group) in self.groups.iter_mut().enumerate() {
            if i == group_index {
                group.range = group.range.start..group.range.end + count;
            } else if group.range.start >= insert_at {
                group.range = group.range.start + count..group.range.end + count;
            }
        }
        (insert_at..insert_at + count).collect()
    }

    /// Remove the given absolute indices, all of which must lie within
    /// `group_index`'s range, from the trial vector, shifting later groups'
    /// ranges down by the removed count. Used by grand-canonical moves to
    /// shrink the particle count.
    pub fn remove_from_group(&mut self, group_index: usize, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        let mut sorted = indices.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        for &index in &sorted {
            self.trial.remove(index);
        }
        let count = sorted.len();
        for (i, group) in self.groups.iter_mut().enumerate() {
            if i == group_index {
                group.range = group.range.start..group.range.end - count;
            } else {
                let shift = indices.iter().filter(|&&idx| idx < group.range.start).count();
                group.range = group.range.start - shift..group.range.end - shift;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_space() -> Space {
        let particles = vec![
            Particle::new(Vector3::new(1.0, 0.0, 0.0), 1.0, 0),
            Particle::new(Vector3::new(-1.0, 0.0, 0.0), -1.0, 1),
        ];
        let groups = vec![Group::new("mol", 0, 0..2, true)];
        Space::new(particles, groups, Cuboid::cubic(30.0))
    }

    #[test]
    fn mass_centre_of_two_symmetric_particles_is_origin() {
        let space = sample_space();
        assert_abs_diff_eq!(space.groups[0].committed_cm.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn commit_then_reject_is_a_no_op() {
        let mut space = sample_space();
        let mut change = Change::default();
        space.trial[0].position.x += 5.0;
        change.register_particle(0, 0);
        space.reject(&change);
        assert!(space.committed_matches_trial());
    }

    #[test]
    fn commit_copies_trial_into_committed() {
        let mut space = sample_space();
        let mut change = Change::default();
        space.trial[0].position.x += 5.0;
        change.register_particle(0, 0);
        space.commit(&change);
        assert!(space.committed_matches_trial());
        assert_eq!(space.committed[0].position.x, 6.0);
    }

    #[test]
    fn tracker_is_consistent_after_rebuild() {
        let space = sample_space();
        assert!(space.tracker.is_consistent(&space.committed));
    }

    #[test]
    fn cuboid_wraps_into_primary_image() {
        let cuboid = Cuboid::cubic(10.0);
        let wrapped = cuboid.wrap(Vector3::new(7.0, 0.0, 0.0));
        assert_abs_diff_eq!(wrapped.x, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn cuboid_set_volume_rescales_isotropically() {
        let mut cuboid = Cuboid::cubic(10.0);
        cuboid.set_volume(8000.0);
        let sides = cuboid.side_lengths();
        assert_abs_diff_eq!(sides.x, 20.0, epsilon = 1e-9);
    }
}
