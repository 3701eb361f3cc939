//! Whole-group translate/rotate moves and their variants (spec section 4.3).

use crate::energy::Hamiltonian;
use crate::moves::{MoveAlgorithm, MoveListEntry};
use crate::rng::MoveRng;
use crate::space::{mass_centre, Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::{Rotation3, Unit, Vector3};

const ROTATION_EPSILON: f64 = 1e-9;
/// Tolerance used by debug-only consistency checks on rotated geometry,
/// replacing the original engine's ad-hoc diagnostic prints.
const ROTATION_TOLERANCE: f64 = 1e-7;

fn rotate_about_line(point: Vector3<f64>, axis_point: Vector3<f64>, axis: Vector3<f64>, angle: f64) -> Vector3<f64> {
    let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle);
    axis_point + rotation * (point - axis_point)
}

/// Translate and/or rotate every particle of one randomly chosen molecular
/// group as a rigid body.
pub struct GroupTranslateRotate {
    move_list: Vec<MoveListEntry>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_group: usize,
    trial_sq_displacement: f64,
    trial_sq_rotation: f64,
}

impl GroupTranslateRotate {
    pub fn new(move_list: Vec<MoveListEntry>) -> Self {
        GroupTranslateRotate {
            move_list,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_group: 0,
            trial_sq_displacement: 0.0,
            trial_sq_rotation: 0.0,
        }
    }

    /// Perform the translate+rotate perturbation on `group_index`, using
    /// `dp_trans`/`dp_rot` and the direction mask from `entry`. Returns the
    /// squared displacement and squared rotation angle actually applied, for
    /// acceptance-statistics bookkeeping.
    fn perturb_group(space: &mut Space, group_index: usize, entry: &MoveListEntry, rng: &mut MoveRng) -> (f64, f64) {
        let mut sq_displacement = 0.0;
        let mut sq_rotation = 0.0;
        let dp_rot = entry.dp2;
        let dp_trans = entry.dp1;

        if dp_rot > ROTATION_EPSILON {
            let cm = space.groups[group_index].trial_cm;
            let direction = rng.unit_vector();
            let axis_point = cm + direction;
            let angle = dp_rot * rng.half();
            let range = space.groups[group_index].range.clone();
            for index in range {
                space.trial[index].position = rotate_about_line(space.trial[index].position, axis_point, direction, angle);
            }
            sq_rotation = angle * angle;
        }
        if dp_trans > ROTATION_EPSILON {
            let translation = Vector3::new(
                entry.direction.x * dp_trans * 0.5 * rng.half(),
                entry.direction.y * dp_trans * 0.5 * rng.half(),
                entry.direction.z * dp_trans * 0.5 * rng.half(),
            );
            let range = space.groups[group_index].range.clone();
            for index in range {
                space.trial[index].position = space.boundary.wrap(space.trial[index].position + translation);
            }
            sq_displacement = translation.norm_squared();
        }

        let range = space.groups[group_index].range.clone();
        space.groups[group_index].trial_cm = mass_centre(&space.trial, range);
        (sq_displacement, sq_rotation)
    }
}

impl MoveAlgorithm for GroupTranslateRotate {
    fn name(&self) -> &str {
        "moltransrot"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
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
        let (sq_displacement, sq_rotation) = Self::perturb_group(space, group_index, &entry, rng);

        self.trial_group = group_index;
        self.trial_sq_displacement = sq_displacement;
        self.trial_sq_rotation = sq_rotation;

        change.register_whole_group(group_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(
            self.move_list[self.current_entry].molecule_id,
            true,
            self.trial_sq_displacement + self.trial_sq_rotation,
        );
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

/// N-body variant: perturb every molecular group independently in a single
/// trial. The energy change is delegated to the Hamiltonian's generic
/// moved-index evaluation, which already sums external-on-each-moved-group,
/// moved-versus-static, and moved-versus-moved contributions without
/// double-counting, because every perturbed group is registered as "whole
/// group moved" in the same `Change`.
pub struct GroupTranslateRotateAll {
    move_list: Vec<MoveListEntry>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
}

impl GroupTranslateRotateAll {
    pub fn new(move_list: Vec<MoveListEntry>) -> Self {
        GroupTranslateRotateAll {
            move_list,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
        }
    }
}

impl MoveAlgorithm for GroupTranslateRotateAll {
    fn name(&self) -> &str {
        "moltransrotall"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entries = self.move_list.clone();
        let mut moved_any = false;
        for group_index in 0..space.groups.len() {
            if !space.groups[group_index].molecular {
                continue;
            }
            let molecule_id = space.groups[group_index].molecule_id;
            let Some(entry) = entries.iter().find(|e| e.molecule_id == molecule_id) else {
                continue;
            };
            GroupTranslateRotate::perturb_group(space, group_index, entry, rng);
            change.register_whole_group(group_index);
            moved_any = true;
        }
        moved_any
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(0, true, 0.0);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(0, false, 0.0);
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

/// Exactly two groups move symmetrically along their cm-cm vector; the
/// smaller of the two configured `dp_trans` values governs the translation
/// magnitude, and each group can independently rotate about its own centre.
pub struct GroupTranslateRotateTwoBody {
    /// Exactly two entries: one per molecule type participating.
    move_list: Vec<MoveListEntry>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
}

impl GroupTranslateRotateTwoBody {
    pub fn new(first: MoveListEntry, second: MoveListEntry) -> Self {
        GroupTranslateRotateTwoBody {
            move_list: vec![first, second],
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
        }
    }

    fn pick_group(space: &Space, molecule_id: usize, rng: &mut MoveRng) -> Option<usize> {
        let candidates: Vec<usize> = space
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.molecule_id == molecule_id && g.molecular)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            None
        } else {
            Some(candidates[rng.range(0, candidates.len())])
        }
    }

    fn rotate_in_place(space: &mut Space, group_index: usize, dp_rot: f64, rng: &mut MoveRng) {
        if dp_rot <= ROTATION_EPSILON {
            return;
        }
        let cm = space.groups[group_index].trial_cm;
        let axis = rng.unit_vector();
        let angle = dp_rot * rng.half();
        let range = space.groups[group_index].range.clone();
        for index in range {
            space.trial[index].position = rotate_about_line(space.trial[index].position, cm, axis, angle);
        }
    }
}

impl MoveAlgorithm for GroupTranslateRotateTwoBody {
    fn name(&self) -> &str {
        "moltransrottwobody"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, _index: usize) {
        // this move always perturbs both configured molecule types at once
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry_a = self.move_list[0].clone();
        let entry_b = self.move_list[1].clone();
        let Some(group_a) = Self::pick_group(space, entry_a.molecule_id, rng) else {
            return false;
        };
        let Some(group_b) = Self::pick_group(space, entry_b.molecule_id, rng) else {
            return false;
        };
        if group_a == group_b {
            return false;
        }

        let cm_a = space.groups[group_a].trial_cm;
        let cm_b = space.groups[group_b].trial_cm;
        let direction = (cm_b - cm_a).try_normalize(1e-12).unwrap_or_else(Vector3::x);
        let dp_trans = entry_a.dp1.min(entry_b.dp1);
        let magnitude = dp_trans * 0.5 * rng.half();
        let shift = direction * magnitude;

        for index in space.groups[group_a].range.clone() {
            space.trial[index].position = space.boundary.wrap(space.trial[index].position + shift);
        }
        for index in space.groups[group_b].range.clone() {
            space.trial[index].position = space.boundary.wrap(space.trial[index].position - shift);
        }
        let range_a = space.groups[group_a].range.clone();
        let range_b = space.groups[group_b].range.clone();
        space.groups[group_a].trial_cm = mass_centre(&space.trial, range_a);
        space.groups[group_b].trial_cm = mass_centre(&space.trial, range_b);

        Self::rotate_in_place(space, group_a, entry_a.dp2, rng);
        Self::rotate_in_place(space, group_b, entry_b.dp2, rng);
        let range_a = space.groups[group_a].range.clone();
        let range_b = space.groups[group_b].range.clone();
        space.groups[group_a].trial_cm = mass_centre(&space.trial, range_a);
        space.groups[group_b].trial_cm = mass_centre(&space.trial, range_b);

        change.register_whole_group(group_a);
        change.register_whole_group(group_b);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record(0, true, 0.0);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.reject(change);
        self.acceptance.record(0, false, 0.0);
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

/// One conformation in a molecule's conformation library: positions
/// relative to the molecule's mass centre.
pub type Conformation = Vec<Vector3<f64>>;

/// Replace a molecule with a randomly chosen, randomly oriented conformation
/// from its library, re-centred on the existing mass centre.
pub struct ConformationSwap {
    move_list: Vec<MoveListEntry>,
    /// Per molecule-id conformation library.
    libraries: std::collections::HashMap<usize, Vec<Conformation>>,
    current_entry: usize,
    counters: MoveCounters,
    acceptance: AcceptanceMap<usize>,
    trial_group: usize,
    trial_cm_before: Vector3<f64>,
}

impl ConformationSwap {
    pub fn new(move_list: Vec<MoveListEntry>, libraries: std::collections::HashMap<usize, Vec<Conformation>>) -> Self {
        ConformationSwap {
            move_list,
            libraries,
            current_entry: 0,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            trial_group: 0,
            trial_cm_before: Vector3::zeros(),
        }
    }
}

impl MoveAlgorithm for ConformationSwap {
    fn name(&self) -> &str {
        "conformationswap"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &self.move_list
    }

    fn set_current_entry(&mut self, index: usize) {
        self.current_entry = index;
    }

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        let entry = self.move_list[self.current_entry].clone();
        let Some(library) = self.libraries.get(&entry.molecule_id) else {
            return false;
        };
        if library.is_empty() {
            return false;
        }
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
        let conformation = &library[rng.range(0, library.len())];
        let range = space.groups[group_index].range.clone();
        if conformation.len() != range.len() {
            return false;
        }
        let cm = space.groups[group_index].trial_cm;
        let axis = rng.unit_vector();
        let angle = 2.0 * std::f64::consts::PI * rng.uniform();
        let rotation = Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle);

        for (offset, index) in range.clone().enumerate() {
            space.trial[index].position = cm + rotation * conformation[offset];
        }
        space.groups[group_index].trial_cm = mass_centre(&space.trial, range);

        self.trial_group = group_index;
        self.trial_cm_before = cm;

        debug_assert!(
            (space.groups[group_index].trial_cm - cm).norm() < ROTATION_TOLERANCE,
            "conformation swap must not drift the mass centre"
        );

        change.register_whole_group(group_index);
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        let pair_delta = hamiltonian.energy_change(space, change);
        let range = space.groups[self.trial_group].range.clone();
        let internal_old = hamiltonian.internal_energy(&space.committed, range.clone());
        let internal_new = hamiltonian.internal_energy(&space.trial, range);
        pair_delta + (internal_new - internal_old)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance
            .record(self.move_list[self.current_entry].molecule_id, true, 0.0);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{Coulomb, Nonbonded};
    use crate::space::{Cuboid, Group, Particle, Space};

    fn two_rigid_dimers() -> Space {
        let particles = vec![
            Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 0),
            Particle::new(Vector3::new(2.0, 0.0, 0.0), -1.0, 0),
            Particle::new(Vector3::new(20.0, 0.0, 0.0), 1.0, 0),
            Particle::new(Vector3::new(22.0, 0.0, 0.0), -1.0, 0),
        ];
        let groups = vec![Group::new("dimer", 0, 0..2, true), Group::new("dimer", 0, 2..4, true)];
        Space::new(particles, groups, Cuboid::cubic(200.0))
    }

    #[test]
    fn zero_dp_is_a_no_op_with_zero_energy() {
        let mut space = two_rigid_dimers();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(5);
        let entry = MoveListEntry::new(0).with_dp(0.0, 0.0);
        let mut mover = GroupTranslateRotate::new(vec![entry]);
        let du = mover.step(&mut space, &hamiltonian, &mut rng);
        assert_eq!(du, 0.0);
        assert_eq!(mover.counters().acceptance_ratio(), 1.0);
    }

    #[test]
    fn translate_preserves_group_shape() {
        let mut space = two_rigid_dimers();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(6);
        let entry = MoveListEntry::new(0).with_dp(2.0, 0.0);
        let mut mover = GroupTranslateRotate::new(vec![entry]);
        for _ in 0..20 {
            mover.step(&mut space, &hamiltonian, &mut rng);
        }
        let bond = (space.committed[1].position - space.committed[0].position).norm();
        assert!((bond - 2.0).abs() < 1e-9 || (space.committed[3].position - space.committed[2].position).norm() - 2.0 < 1e-9);
    }

    #[test]
    fn nbody_variant_moves_every_molecular_group() {
        let mut space = two_rigid_dimers();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(9);
        let entry = MoveListEntry::new(0).with_dp(1.0, 0.0).with_probability(1.0);
        let mut mover = GroupTranslateRotateAll::new(vec![entry]);
        mover.step(&mut space, &hamiltonian, &mut rng);
        assert!(space.committed_matches_trial());
    }
}
