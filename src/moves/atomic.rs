//! Single-particle translation and rotation moves (spec section 4.2).

use crate::energy::Hamiltonian;
use crate::moves::{MoveAlgorithm, MoveListEntry};
use crate::rng::MoveRng;
use crate::space::{Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::Vector3;
use std::collections::HashMap;

/// Translate a single, randomly chosen particle within a randomly chosen
/// group of the current move-list entry's molecule type.
///
/// The displacement magnitude is looked up per atom-type id in
/// `per_atom_type_dp`, falling back to the move-list entry's generic `dp1`
/// when no type-specific value is configured (or it is effectively zero),
/// exactly as the protocol describes.
pub struct AtomTranslate {
    move_list: Vec<MoveListEntry>,
    per_atom_type_dp: HashMap<usize, f64>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_group: usize,
    trial_particle: usize,
    trial_key: usize,
    trial_sq_displacement: f64,
}

impl AtomTranslate {
    pub fn new(move_list: Vec<MoveListEntry>) -> Self {
        AtomTranslate {
            move_list,
            per_atom_type_dp: HashMap::new(),
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_group: 0,
            trial_particle: 0,
            trial_key: 0,
            trial_sq_displacement: 0.0,
        }
    }

    pub fn with_per_atom_type_dp(mut self, id: usize, dp: f64) -> Self {
        self.per_atom_type_dp.insert(id, dp);
        self
    }

    fn displacement_for(&self, atom_type: usize, generic_dp: f64) -> f64 {
        match self.per_atom_type_dp.get(&atom_type) {
            Some(&dp) if dp.abs() > 1e-12 => dp,
            _ => generic_dp,
        }
    }
}

impl MoveAlgorithm for AtomTranslate {
    fn name(&self) -> &str {
        "atomtranslate"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = &self.move_list[self.current_entry];
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let group_range = space.groups[group_index].range.clone();
        if group_range.is_empty() {
            return false;
        }
        let particle_index = group_range.start + rng.range(0, group_range.len());
        let atom_type = space.trial[particle_index].id;
        let dp = self.displacement_for(atom_type, entry.dp1);

        let displacement = Vector3::new(
            entry.direction.x * dp * rng.half(),
            entry.direction.y * dp * rng.half(),
            entry.direction.z * dp * rng.half(),
        );
        let new_position = space.boundary.wrap(space.trial[particle_index].position + displacement);
        space.trial[particle_index].position = new_position;

        if space.groups[group_index].molecular {
            space.groups[group_index].trial_cm =
                crate::space::mass_centre(&space.trial, space.groups[group_index].range.clone());
        }

        self.trial_group = group_index;
        self.trial_particle = particle_index;
        self.trial_key = atom_type;
        self.trial_sq_displacement = displacement.norm_squared();

        change.register_particle(group_index, particle_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(self.trial_key, true, self.trial_sq_displacement);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(self.trial_key, false, 0.0);
    }

    fn counters_mut(&mut self) -> &mut MoveCounters {
        &mut self.counters
    }

    fn counters(&self) -> &MoveCounters {
        &self.counters
    }

    fn report(&self, runfraction: f64, relative_time: f64) -> MoveReport {
        let payload: HashMap<String, f64> = self
            .acceptance
            .iter()
            .map(|(id, stats)| (format!("atomtype_{id}_msq_displacement"), stats.mean_squared_displacement()))
            .collect();
        MoveReport {
            name: self.name().to_string(),
            trials: self.counters.trials,
            acceptance: self.counters.acceptance_ratio(),
            runfraction,
            relative_time,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Rotate a single particle's orientation (its dipole direction, the only
/// vector attribute a bare particle carries) about a random axis through
/// the origin by an angle drawn uniformly in `±dprot/2`.
pub struct AtomRotate {
    move_list: Vec<MoveListEntry>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_group: usize,
    trial_particle: usize,
    trial_key: usize,
    trial_sq_angle: f64,
}

impl AtomRotate {
    pub fn new(move_list: Vec<MoveListEntry>) -> Self {
        AtomRotate {
            move_list,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_group: 0,
            trial_particle: 0,
            trial_key: 0,
            trial_sq_angle: 0.0,
        }
    }
}

impl MoveAlgorithm for AtomRotate {
    fn name(&self) -> &str {
        "atomrotate"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = &self.move_list[self.current_entry];
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let group_range = space.groups[group_index].range.clone();
        if group_range.is_empty() {
            return false;
        }
        let particle_index = group_range.start + rng.range(0, group_range.len());
        let axis = rng.unit_vector();
        let angle = entry.dp1 * rng.half();
        let rotation = nalgebra::Rotation3::from_axis_angle(&nalgebra::Unit::new_normalize(axis), angle);
        let particle = &mut space.trial[particle_index];
        particle.dipole_direction = rotation * particle.dipole_direction;

        self.trial_group = group_index;
        self.trial_particle = particle_index;
        self.trial_key = particle.id;
        self.trial_sq_angle = angle * angle;

        change.register_particle(group_index, particle_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(self.trial_key, true, self.trial_sq_angle);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(self.trial_key, false, 0.0);
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

/// Convert spherical coordinates to cartesian, the 2D-sphere variant's
/// underlying parametrisation.
fn spherical_to_cartesian(theta: f64, phi: f64, radius: f64) -> Vector3<f64> {
    Vector3::new(
        radius * theta.sin() * phi.cos(),
        radius * theta.sin() * phi.sin(),
        radius * theta.cos(),
    )
}

/// The 2D-sphere variant of atomic translation: particles are confined to
/// the surface of a sphere of fixed radius, and the tangential displacement
/// is scaled by the local metric (`R sin(theta)` for `theta`, `R` for `phi`)
/// before the new position is renormalised back onto the sphere.
pub struct AtomTranslateOnSphere {
    move_list: Vec<MoveListEntry>,
    radius: f64,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_group: usize,
    trial_particle: usize,
    trial_key: usize,
    trial_sq_displacement: f64,
}

impl AtomTranslateOnSphere {
    pub fn new(move_list: Vec<MoveListEntry>, radius: f64) -> Self {
        AtomTranslateOnSphere {
            move_list,
            radius,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_group: 0,
            trial_particle: 0,
            trial_key: 0,
            trial_sq_displacement: 0.0,
        }
    }
}

impl MoveAlgorithm for AtomTranslateOnSphere {
    fn name(&self) -> &str {
        "atomtranslate2dsphere"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = &self.move_list[self.current_entry];
        let candidate_groups: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == entry.molecule_id)
            .map(|(i, _)| i)
            .collect();
        if candidate_groups.is_empty() {
            return false;
        }
        let group_index = candidate_groups[rng.range(0, candidate_groups.len())];
        let group_range = space.groups[group_index].range.clone();
        if group_range.is_empty() {
            return false;
        }
        let particle_index = group_range.start + rng.range(0, group_range.len());
        let position = space.trial[particle_index].position;
        let theta = f64::acos((position.z / self.radius).clamp(-1.0, 1.0));
        let phi = f64::atan2(position.y, position.x);

        let random_angle = 2.0 * std::f64::consts::PI * rng.uniform();
        let random_length = entry.dp1 * rng.uniform();
        let sin_theta = theta.sin().max(1e-9);
        let new_theta = theta + random_angle.cos() * random_length / (self.radius * sin_theta);
        let new_phi = phi + random_angle.sin() * random_length / self.radius;

        let new_position = spherical_to_cartesian(new_theta, new_phi, self.radius);
        let old_position = position;
        space.trial[particle_index].position = new_position;

        if space.groups[group_index].molecular {
            space.groups[group_index].trial_cm =
                crate::space::mass_centre(&space.trial, space.groups[group_index].range.clone());
        }

        self.trial_group = group_index;
        self.trial_particle = particle_index;
        self.trial_key = space.trial[particle_index].id;
        self.trial_sq_displacement = (new_position - old_position).norm_squared();

        change.register_particle(group_index, particle_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(self.trial_key, true, self.trial_sq_displacement);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(self.trial_key, false, 0.0);
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
    use crate::rng::MoveRng;
    use crate::space::{Cuboid, Group, Particle, Space};

    fn ideal_gas_space(n: usize) -> Space {
        let particles: Vec<Particle> = (0..n)
            .map(|i| Particle::new(Vector3::new(i as f64, 0.0, 0.0), 0.0, 0))
            .collect();
        let groups = vec![Group::new("ions", 0, 0..n, false)];
        Space::new(particles, groups, Cuboid::cubic(50.0))
    }

    #[test]
    fn zero_dp_never_moves_the_particle() {
        let mut space = ideal_gas_space(5);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(7);
        let entry = MoveListEntry::new(0).with_dp(0.0, 0.0);
        let mut mover = AtomTranslate::new(vec![entry]);
        for _ in 0..50 {
            mover.step(&mut space, &hamiltonian, &mut rng);
        }
        assert!(space.committed_matches_trial());
        assert_eq!(mover.counters().acceptance_ratio(), 1.0);
    }

    #[test]
    fn neutral_ideal_gas_always_accepts() {
        let mut space = ideal_gas_space(10);
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(11);
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0);
        let mut mover = AtomTranslate::new(vec![entry]);
        for _ in 0..200 {
            mover.step(&mut space, &hamiltonian, &mut rng);
        }
        // zero charge, zero Bjerrum length: every move is energetically free
        assert_eq!(mover.counters().acceptance_ratio(), 1.0);
        assert!(space.committed_matches_trial());
    }

    #[test]
    fn per_atom_type_dp_overrides_generic_dp() {
        let mover = AtomTranslate::new(vec![MoveListEntry::new(0).with_dp(1.0, 0.0)])
            .with_per_atom_type_dp(3, 9.0);
        assert!((mover.displacement_for(3, 1.0) - 9.0).abs() < 1e-12);
        assert!((mover.displacement_for(4, 1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sphere_translation_keeps_particle_on_sphere() {
        let radius = 20.0;
        let particles = vec![Particle::new(Vector3::new(radius, 0.0, 0.0), 0.0, 0)];
        let groups = vec![Group::new("surface", 0, 0..1, false)];
        let mut space = Space::new(particles, groups, Cuboid::cubic(1000.0));
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(13);
        let entry = MoveListEntry::new(0).with_dp(0.5, 0.0);
        let mut mover = AtomTranslateOnSphere::new(vec![entry], radius);
        for _ in 0..50 {
            mover.step(&mut space, &hamiltonian, &mut rng);
            let norm = space.committed[0].position.norm();
            assert!((norm - radius).abs() < 1e-6);
        }
    }
}
