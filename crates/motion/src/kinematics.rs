//! Kinematics abstraction (component K): maps Cartesian positions to
//! per-stepper positions, owns the per-group trapq, and tracks homing state.
//!
//! Implementations share one concrete shape ([`CartKinematics`]) rather than
//! an open trait-object hierarchy, per the design notes: the capability set
//! is fixed (`check_move`, `home_targets`, `set_position`, `get_status`) and
//! callers never need to downcast. The primary XYZ group and an optional
//! second "ABC" group (see `new_abc`) are both instances of this same type,
//! bound to different axis letters/trapq/rails — exactly the axis-group
//! composition the toolhead dispatches per-group.

use crate::coord::Coord;
use crate::error::MotionError;
use crate::queue::Move;
use crate::trapq::{Trapq, TrapqSegment};

/// The narrow interface to the (external, out-of-scope) iterative step-time
/// solver for one physical stepper motor. A systems-language host supplies a
/// concrete implementation that talks to the real MCU transport; this core
/// only ever calls through the trait.
pub trait StepperHandle: Send {
    fn set_position(&mut self, pos_mm: f64);
    /// Requests that steps be generated/flushed up to `flush_time`.
    fn generate_steps(&mut self, flush_time: f64);
    fn get_position(&self) -> f64;
}

/// A simple in-memory stepper used by tests and the batch/simulation hosts:
/// it tracks position but does not emit real pulses.
#[derive(Debug, Default, Clone)]
pub struct NullStepper {
    pub position: f64,
    pub last_flush: f64,
}

impl StepperHandle for NullStepper {
    fn set_position(&mut self, pos_mm: f64) {
        self.position = pos_mm;
    }
    fn generate_steps(&mut self, flush_time: f64) {
        self.last_flush = flush_time;
    }
    fn get_position(&self) -> f64 {
        self.position
    }
}

/// Homing direction for a rail's endstop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingDirection {
    Min,
    Max,
}

/// One logical axis: a named physical axis binding one or more steppers,
/// sharing an endstop and travel range.
pub struct Rail {
    pub name: String,
    pub steppers: Vec<Box<dyn StepperHandle>>,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    pub homing_speed: f64,
    pub second_homing_speed: f64,
    pub homing_retract_dist: f64,
    pub homing_direction: HomingDirection,
}

impl Rail {
    pub fn new(name: impl Into<String>, position_min: f64, position_max: f64, position_endstop: f64) -> Self {
        Rail {
            name: name.into(),
            steppers: Vec::new(),
            position_min,
            position_max,
            position_endstop,
            homing_speed: 5.0,
            second_homing_speed: 2.5,
            homing_retract_dist: 5.0,
            homing_direction: HomingDirection::Min,
        }
    }

    pub fn set_position(&mut self, pos_mm: f64) {
        for s in self.steppers.iter_mut() {
            s.set_position(pos_mm);
        }
    }

    pub fn get_range(&self) -> (f64, f64) {
        (self.position_min, self.position_max)
    }
}

/// `(min, max)` travel limit for one axis slot of a kinematic group. The
/// sentinel `(1.0, -1.0)` (min > max) marks the axis as unhomed.
pub type AxisLimit = (f64, f64);
pub const UNHOMED: AxisLimit = (1.0, -1.0);

/// Status snapshot exposed for `GET_POSITION` and diagnostics.
#[derive(Debug, Clone)]
pub struct KinematicsStatus {
    pub homed_axes: String,
    pub axis_minimum: [f64; 3],
    pub axis_maximum: [f64; 3],
}

/// Shared machinery for a 3-axis-slot cartesian-style kinematic group.
pub struct CartKinematics {
    /// Axis letters this group is responsible for, length <= 3 (e.g. "XYZ"
    /// or "AB").
    pub axis_names: Vec<char>,
    /// Canonical `Coord`/`Move.axes_d` slot for each entry of `axis_names`
    /// (e.g. `[0,1,2]` for the primary XYZ group, `[3,4]` for an "AB" ABC
    /// group bound at index 3). Local arrays (`limits`, `rails`) are
    /// indexed 0..axis_names.len(); `axis_indices` translates into the
    /// shared global Move/Coord frame.
    pub axis_indices: Vec<usize>,
    pub rails: Vec<Rail>,
    pub trapq: Trapq,
    pub limits: [AxisLimit; 3],
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_z_velocity: f64,
    pub max_z_accel: f64,
    /// Whether this group supports homing (the ABC variant does not,
    /// matching the upstream "Homing is not implemented for ABC" note).
    pub supports_homing: bool,
}

impl CartKinematics {
    pub fn new_primary(max_velocity: f64, max_accel: f64) -> Self {
        CartKinematics {
            axis_names: vec!['X', 'Y', 'Z'],
            axis_indices: vec![0, 1, 2],
            rails: Vec::new(),
            trapq: Trapq::new(),
            limits: [UNHOMED; 3],
            max_velocity,
            max_accel,
            max_z_velocity: max_velocity,
            max_z_accel: max_accel,
            supports_homing: true,
        }
    }

    /// Builds the ABC-group variant bound to the given letters (length <=
    /// 3) at the given canonical Move/Coord indices, sharing the same
    /// check_move/set_position shape but its own trapq and rails, with
    /// homing explicitly unsupported.
    pub fn new_abc(axis_names: Vec<char>, axis_indices: Vec<usize>, max_velocity: f64, max_accel: f64) -> Self {
        assert_eq!(axis_names.len(), axis_indices.len());
        CartKinematics {
            axis_names,
            axis_indices,
            rails: Vec::new(),
            trapq: Trapq::new(),
            limits: [UNHOMED; 3],
            max_velocity,
            max_accel,
            max_z_velocity: max_velocity,
            max_z_accel: max_accel,
            supports_homing: false,
        }
    }

    pub fn axis_count(&self) -> usize {
        self.axis_names.len()
    }

    /// Rejects a move whose endpoint falls outside homed limits on any
    /// bound axis; additionally scales speed/accel down for large
    /// Z-displacement moves, matching the original cartesian.py logic.
    pub fn check_move(&self, mv: &Move) -> Result<(f64, f64), MotionError> {
        let mut limit_velocity = self.max_velocity;
        let mut limit_accel = self.max_accel;

        for (local, (&letter, &global)) in self.axis_names.iter().zip(self.axis_indices.iter()).enumerate() {
            if mv.axes_d[global].abs() < 1e-12 {
                continue;
            }
            let end = mv.end_pos.get(global);
            let (min, max) = self.limits[local];
            if min > max {
                return Err(MotionError::MustHomeFirst { axis: letter });
            }
            if end < min - 1e-9 || end > max + 1e-9 {
                return Err(MotionError::OutOfRange {
                    axis: letter,
                    value: end,
                    min,
                    max,
                });
            }
        }

        // Z-ratio speed/accel limiting: only meaningful for the primary
        // XYZ group (slot 2 == Z).
        if self.axis_names.len() == 3 && self.axis_names[2] == 'Z' {
            let z_d = mv.axes_d[2].abs();
            if z_d > 1e-12 && mv.move_d > 0.0 {
                let r = mv.move_d / z_d;
                limit_velocity = limit_velocity.min(self.max_z_velocity * r);
                limit_accel = limit_accel.min(self.max_z_accel * r);
            }
        }
        Ok((limit_velocity, limit_accel))
    }

    pub fn set_position(&mut self, pos: &Coord) {
        for (local, rail) in self.rails.iter_mut().enumerate() {
            let global = self.axis_indices[local];
            rail.set_position(pos.get(global));
        }
        let mut xyz = [0.0; 3];
        for (local, &global) in self.axis_indices.iter().enumerate() {
            xyz[local] = pos.get(global);
        }
        self.trapq.set_position(xyz[0], xyz[1], xyz[2]);
    }

    /// Marks `axis` (by letter) homed at its rail's configured range.
    pub fn note_homed(&mut self, axis: char) {
        if let Some(slot) = self.axis_names.iter().position(|&c| c == axis) {
            if let Some(rail) = self.rails.get(slot) {
                self.limits[slot] = rail.get_range();
            }
        }
    }

    pub fn note_unhomed(&mut self, axis: char) {
        if let Some(slot) = self.axis_names.iter().position(|&c| c == axis) {
            self.limits[slot] = UNHOMED;
        }
    }

    /// Per-axis force-from/target pair for homing, 1.5x the travel past
    /// the endstop. Returns an error for the ABC group (unsupported).
    pub fn home_targets(&self, axis: char) -> Result<(f64, f64), MotionError> {
        if !self.supports_homing {
            return Err(MotionError::Fatal(format!(
                "homing axis {axis} is not supported on this kinematic group"
            )));
        }
        let slot = self
            .axis_names
            .iter()
            .position(|&c| c == axis)
            .ok_or_else(|| MotionError::Fatal(format!("axis {axis} not bound to this group")))?;
        let rail = self
            .rails
            .get(slot)
            .ok_or_else(|| MotionError::Fatal(format!("no rail configured for axis {axis}")))?;
        let travel = rail.position_max - rail.position_min;
        let force_from = match rail.homing_direction {
            HomingDirection::Min => rail.position_endstop + 1.5 * travel,
            HomingDirection::Max => rail.position_endstop - 1.5 * travel,
        };
        Ok((force_from, rail.position_endstop))
    }

    pub fn get_status(&self) -> KinematicsStatus {
        let mut homed = String::new();
        let mut axis_min = [0.0; 3];
        let mut axis_max = [0.0; 3];
        for (slot, &letter) in self.axis_names.iter().enumerate() {
            let (min, max) = self.limits[slot];
            if min <= max {
                homed.push(letter);
            }
            axis_min[slot] = min;
            axis_max[slot] = max;
        }
        KinematicsStatus {
            homed_axes: homed,
            axis_minimum: axis_min,
            axis_maximum: axis_max,
        }
    }

    /// Appends one trapq segment mirroring a flushed Move's planned
    /// profile, in this group's local axis frame.
    pub fn append_segment(&mut self, mv: &Move, t0: f64) {
        let mut start_pos = [0.0; 3];
        let mut axes_r = [0.0; 3];
        for (local, &global) in self.axis_indices.iter().enumerate() {
            start_pos[local] = mv.start_pos.get(global);
            axes_r[local] = mv.axes_r[global];
        }
        self.trapq.append(TrapqSegment {
            t0,
            accel_t: mv.accel_t,
            cruise_t: mv.cruise_t,
            decel_t: mv.decel_t,
            start_pos,
            axes_r,
            start_v: mv.start_v,
            cruise_v: mv.cruise_v,
            accel: mv.accel,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Coord;

    fn sample_move() -> Move {
        Move::new(
            Coord::xyz(0.0, 0.0, 0.0),
            Coord::xyz(10.0, 0.0, 0.0),
            10.0,
            1000.0,
            500.0,
            0.02,
        )
    }

    #[test]
    fn rejects_move_on_unhomed_axis() {
        let k = CartKinematics::new_primary(300.0, 3000.0);
        let err = k.check_move(&sample_move()).unwrap_err();
        assert!(matches!(err, MotionError::MustHomeFirst { axis: 'X' }));
    }

    #[test]
    fn accepts_move_within_homed_range() {
        let mut k = CartKinematics::new_primary(300.0, 3000.0);
        k.rails.push(Rail::new("x", 0.0, 200.0, 0.0));
        k.rails.push(Rail::new("y", 0.0, 200.0, 0.0));
        k.rails.push(Rail::new("z", 0.0, 200.0, 0.0));
        k.note_homed('X');
        k.note_homed('Y');
        k.note_homed('Z');
        assert!(k.check_move(&sample_move()).is_ok());
    }

    #[test]
    fn abc_group_rejects_homing() {
        let k = CartKinematics::new_abc(vec!['A', 'B'], vec![3, 4], 300.0, 3000.0);
        assert!(k.home_targets('A').is_err());
    }
}
