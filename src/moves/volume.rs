//! Isobaric and isochoric volume moves (spec section 4.7).

use crate::energy::Hamiltonian;
use crate::moves::{MoveAlgorithm, MoveListEntry};
use crate::rng::MoveRng;
use crate::space::{Change, Space};
use crate::stats::{AcceptanceMap, MoveCounters, MoveReport};
use nalgebra::Vector3;

fn rescale_space(space: &mut Space, scale: Vector3<f64>, change: &mut Change) {
    for (group_index, group) in space.groups.iter_mut().enumerate() {
        if group.molecular {
            let old_cm = group.trial_cm;
            let new_cm = old_cm.component_mul(&scale);
            let shift = new_cm - old_cm;
            for index in group.range.clone() {
                space.trial[index].position += shift;
            }
            group.trial_cm = new_cm;
            change.register_whole_group(group_index);
        } else {
            for index in group.range.clone() {
                space.trial[index].position = space.trial[index].position.component_mul(&scale);
                change.register_particle(group_index, index);
            }
        }
    }
}

/// Isobaric (NPT) volume fluctuation: log-volume displacement, isotropic
/// rescale of every group's mass centre (molecular) or every particle
/// (atomic). The ideal-gas/pV term is the Hamiltonian's responsibility; the
/// move itself only performs the geometric rescale.
pub struct IsobaricVolumeMove {
    dp: f64,
    /// Pressure in mM units, carried through for the Hamiltonian's pV term.
    pressure_mm: f64,
    probability: f64,
    counters: MoveCounters,
    acceptance: AcceptanceMap<&'static str>,
    last_d_volume: f64,
}

impl IsobaricVolumeMove {
    pub fn new(dp: f64, pressure_mm: f64, probability: f64) -> Self {
        IsobaricVolumeMove {
            dp,
            pressure_mm,
            probability,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            last_d_volume: 0.0,
        }
    }

    pub fn pressure_mm(&self) -> f64 {
        self.pressure_mm
    }
}

impl MoveAlgorithm for IsobaricVolumeMove {
    fn name(&self) -> &str {
        "isobaric"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &[]
    }

    fn set_current_entry(&mut self, _index: usize) {}

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        if rng.uniform() > self.probability {
            return false;
        }
        self.counters.record_attempt();
        let volume_old = space.boundary.volume();
        let volume_new = (volume_old.ln() + self.dp * rng.half()).exp();
        let linear_scale = (volume_new / volume_old).cbrt();
        let scale = Vector3::new(linear_scale, linear_scale, linear_scale);

        space.boundary.set_volume(volume_new);
        rescale_space(space, scale, change);
        change.geometry_change = true;
        change.d_volume = volume_new - volume_old;
        self.last_d_volume = change.d_volume;
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record("volume", true, self.last_d_volume.powi(2));
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        space.boundary.set_volume(space.boundary.volume() - self.last_d_volume);
        space.reject(change);
        self.acceptance.record("volume", false, 0.0);
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
            payload: serde_json::json!({ "pressure_mm": self.pressure_mm }),
        }
    }
}

/// Isochoric (NVT, shape-change) volume move: expand the z-axis by `s`,
/// contract `x,y` by `1/sqrt(s)`, preserving total volume.
pub struct IsochoricVolumeMove {
    dp: f64,
    probability: f64,
    counters: MoveCounters,
    acceptance: AcceptanceMap<&'static str>,
    last_scale: Vector3<f64>,
}

impl IsochoricVolumeMove {
    pub fn new(dp: f64, probability: f64) -> Self {
        IsochoricVolumeMove {
            dp,
            probability,
            counters: MoveCounters::default(),
            acceptance: AcceptanceMap::default(),
            last_scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl MoveAlgorithm for IsochoricVolumeMove {
    fn name(&self) -> &str {
        "isochoric"
    }

    fn move_list(&self) -> &[MoveListEntry] {
        &[]
    }

    fn set_current_entry(&mut self, _index: usize) {}

    fn propose(&mut self, space: &mut Space, change: &mut Change, rng: &mut MoveRng) -> bool {
        if rng.uniform() > self.probability {
            return false;
        }
        self.counters.record_attempt();
        let s = (1.0 + self.dp * rng.half()).max(1e-6);
        let scale = Vector3::new(1.0 / s.sqrt(), 1.0 / s.sqrt(), s);
        let old_sides = space.boundary.side_lengths();
        space.boundary.set_side_lengths(old_sides.component_mul(&scale));
        rescale_space(space, scale, change);
        change.geometry_change = true;
        change.d_volume = 0.0;
        self.last_scale = scale;
        true
    }

    fn energy_change(&mut self, space: &Space, hamiltonian: &dyn Hamiltonian, change: &Change) -> f64 {
        hamiltonian.energy_change(space, change)
    }

    fn accept(&mut self, space: &mut Space, change: &Change) {
        space.commit(change);
        self.acceptance.record("shape", true, 0.0);
    }

    fn reject(&mut self, space: &mut Space, change: &Change) {
        let inverse = Vector3::new(1.0 / self.last_scale.x, 1.0 / self.last_scale.y, 1.0 / self.last_scale.z);
        let sides = space.boundary.side_lengths();
        space.boundary.set_side_lengths(sides.component_mul(&inverse));
        space.reject(change);
        self.acceptance.record("shape", false, 0.0);
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

    fn two_particle_space() -> Space {
        let particles = vec![
            Particle::new(Vector3::new(10.0, 10.0, 10.0), 1.0, 0),
            Particle::new(Vector3::new(20.0, 10.0, 10.0), -1.0, 1),
        ];
        let groups = vec![Group::new("a", 0, 0..1, false), Group::new("b", 1, 1..2, false)];
        Space::new(particles, groups, Cuboid::cubic(30.0))
    }

    #[test]
    fn zero_dp_is_a_no_op_volume() {
        let mut space = two_particle_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(41);
        let mut mover = IsobaricVolumeMove::new(0.0, 100.0, 1.0);
        let volume_before = space.boundary.volume();
        let du = mover.step(&mut space, &hamiltonian, &mut rng);
        assert_eq!(du, 0.0);
        assert!((space.boundary.volume() - volume_before).abs() < 1e-9);
    }

    #[test]
    fn isochoric_move_preserves_total_volume() {
        let mut space = two_particle_space();
        let hamiltonian = Nonbonded::new(Coulomb::new(0.0));
        let mut rng = MoveRng::from_seed(42);
        let mut mover = IsochoricVolumeMove::new(0.2, 1.0);
        let volume_before = space.boundary.volume();
        mover.step(&mut space, &hamiltonian, &mut rng);
        assert!((space.boundary.volume() - volume_before).abs() < 1e-6);
    }
}
