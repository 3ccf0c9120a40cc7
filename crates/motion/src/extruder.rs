//! A minimal extruder collaborator.
//!
//! The full extruder (pressure advance, per-filament junction limits) is
//! out of this core's scope, but the toolhead's move dispatch and the Q
//! planner's junction calc both need *some* extruder to call into for
//! `check_move`, `move`, and `update_move_time`, and for its own junction
//! velocity limit. This is the narrowest implementation that satisfies
//! those call sites: a single-axis trapq-backed device with a configured
//! max velocity/acceleration and instantaneous corner-velocity limit.

use crate::queue::Move;
use crate::trapq::{Trapq, TrapqSegment};

pub struct Extruder {
    pub trapq: Trapq,
    pub max_e_velocity: f64,
    pub max_e_accel: f64,
    /// Squared velocity below which an extruder direction reversal is
    /// considered free (Klipper's `instant_corner_v`).
    pub instant_corner_v2: f64,
    pub commanded_e_pos: f64,
}

impl Extruder {
    pub fn new(max_e_velocity: f64, max_e_accel: f64) -> Self {
        Extruder {
            trapq: Trapq::new(),
            max_e_velocity,
            max_e_accel,
            instant_corner_v2: 1.0,
            commanded_e_pos: 0.0,
        }
    }

    pub fn junction_v2(&self) -> f64 {
        self.instant_corner_v2
    }

    pub fn check_move(&self, mv: &Move) -> Result<(), crate::error::MotionError> {
        let e_d = mv.axes_d[6].abs();
        if e_d < 1e-12 {
            return Ok(());
        }
        // Extruder-only constraint surface: reject absurd jumps; real
        // filament-diameter/volumetric-limit checks live outside this core.
        if e_d > 1e6 {
            return Err(crate::error::MotionError::OutOfRange {
                axis: 'E',
                value: e_d,
                min: 0.0,
                max: 1e6,
            });
        }
        Ok(())
    }

    pub fn move_extruder(&mut self, mv: &Move, t0: f64) {
        let e_d = mv.axes_d[6];
        if e_d.abs() < 1e-12 {
            return;
        }
        self.trapq.append(TrapqSegment {
            t0,
            accel_t: mv.accel_t,
            cruise_t: mv.cruise_t,
            decel_t: mv.decel_t,
            start_pos: [self.commanded_e_pos, 0.0, 0.0],
            axes_r: [e_d.signum(), 0.0, 0.0],
            start_v: mv.start_v,
            cruise_v: mv.cruise_v,
            accel: mv.accel,
        });
        self.commanded_e_pos += e_d;
    }

    pub fn update_move_time(&mut self, upto: f64) {
        self.trapq.finalize_moves(upto);
    }

    pub fn set_position(&mut self, e_pos: f64) {
        self.commanded_e_pos = e_pos;
        self.trapq.set_position(e_pos, 0.0, 0.0);
    }
}
