//! G-code motion state machine (component G).
//!
//! Interprets already-tokenized command parameters (the text-level parser
//! itself is an external collaborator, per the spec) into the coordinate
//! frames, offsets, and unit conventions that feed the toolhead. This type
//! owns no trapq or toolhead reference; callers read `last_position`/
//! `speed` back out after each call and pass moves on to the toolhead
//! themselves, mirroring the `move_transform` indirection upstream.

use std::collections::HashMap;

use crate::coord::{AxisSet, Coord};
use crate::error::MotionError;

/// A parameter list as handed down by the (out-of-scope) command parser:
/// axis letter to numeric value, `F` folded in like any other axis letter.
#[derive(Debug, Clone, Default)]
pub struct Params(pub Vec<(char, f64)>);

impl Params {
    pub fn get(&self, letter: char) -> Option<f64> {
        self.0.iter().find(|(c, _)| *c == letter).map(|(_, v)| *v)
    }
}

/// A named snapshot of every scalar field `SAVE_GCODE_STATE` captures.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct SavedState {
    pub absolute_coord: bool,
    pub absolute_extrude: bool,
    pub base_position: Coord,
    pub last_position: Coord,
    pub homing_position: Coord,
    pub speed: f64,
    pub speed_factor: f64,
    pub extrude_factor: f64,
}

pub struct GCodeMove {
    pub axes: AxisSet,
    pub absolute_coord: bool,
    pub absolute_extrude: bool,
    pub base_position: Coord,
    pub last_position: Coord,
    pub homing_position: Coord,
    /// mm/s, derived from the last F parameter times speed_factor.
    pub speed: f64,
    /// mm/min -> mm/s conversion factor, default 1/60, scaled by M220.
    pub speed_factor: f64,
    /// M221 flow percentage, default 1.0.
    pub extrude_factor: f64,
    pub saved_states: HashMap<String, SavedState>,
}

impl GCodeMove {
    pub fn new(axes: AxisSet) -> Self {
        GCodeMove {
            axes,
            absolute_coord: true,
            absolute_extrude: true,
            base_position: Coord::ZERO,
            last_position: Coord::ZERO,
            homing_position: Coord::ZERO,
            speed: 25.0,
            speed_factor: 1.0 / 60.0,
            extrude_factor: 1.0,
            saved_states: HashMap::new(),
        }
    }

    /// Re-syncs `last_position` from the toolhead's commanded position.
    /// Called on toolhead `set_position`, manual move, command error, and
    /// extruder activation.
    pub fn reset_last_position(&mut self, commanded: Coord) {
        self.last_position = commanded;
    }

    /// G90/G91.
    pub fn set_absolute_coord(&mut self, absolute: bool) {
        self.absolute_coord = absolute;
    }

    /// M82/M83.
    pub fn set_absolute_extrude(&mut self, absolute: bool) {
        self.absolute_extrude = absolute;
    }

    /// G20: rejected (mm-native system).
    pub fn cmd_g20(&self) -> Result<(), MotionError> {
        Err(MotionError::parse("G20", "inches are not supported"))
    }

    /// G1/G0: updates `last_position` and `speed` in place, returning the
    /// new full `last_position` for the caller to hand to the toolhead.
    pub fn cmd_g1(&mut self, params: &Params) -> Result<Coord, MotionError> {
        for &letter in &self.axes.letters.clone() {
            if let Some(value) = params.get(letter) {
                let idx = self.axes.index_of(letter).unwrap();
                let new_val = if self.absolute_coord {
                    value + self.base_position.get(idx)
                } else {
                    self.last_position.get(idx) + value
                };
                self.last_position.set(idx, new_val);
            }
        }
        if let Some(e) = params.get('E') {
            let scaled = e * self.extrude_factor;
            let new_e = if self.absolute_extrude {
                scaled + self.base_position.e
            } else {
                self.last_position.e + scaled
            };
            self.last_position.e = new_e;
        }
        if let Some(f) = params.get('F') {
            if f <= 0.0 {
                return Err(MotionError::parse("G1", format!("invalid speed F{f}")));
            }
            self.speed = f * self.speed_factor;
        }
        Ok(self.last_position)
    }

    /// G92: resets base_position so the given values become the new
    /// "gcode position" without commanding a move. No axes => snapshot all.
    pub fn cmd_g92(&mut self, params: &Params) {
        let mut any = false;
        for &letter in &self.axes.letters.clone() {
            if let Some(value) = params.get(letter) {
                let idx = self.axes.index_of(letter).unwrap();
                self.base_position.set(idx, self.last_position.get(idx) - value);
                any = true;
            }
        }
        if let Some(e) = params.get('E') {
            self.base_position.e = self.last_position.e - e;
            any = true;
        }
        if !any {
            self.base_position = self.last_position;
        }
    }

    /// M220 S<pct>: rescales `speed` and `speed_factor` together so the
    /// currently commanded feed stays self-consistent.
    pub fn cmd_m220(&mut self, params: &Params) -> Result<(), MotionError> {
        let pct = params
            .get('S')
            .ok_or_else(|| MotionError::parse("M220", "missing S"))?;
        let new_factor = (pct / 100.0) / 60.0;
        self.speed = (self.speed / self.speed_factor) * new_factor;
        self.speed_factor = new_factor;
        Ok(())
    }

    /// M221 S<pct>: adjusts `base_position[E]` so the commanded extruder
    /// position is preserved across the factor change.
    pub fn cmd_m221(&mut self, params: &Params) -> Result<(), MotionError> {
        let pct = params
            .get('S')
            .ok_or_else(|| MotionError::parse("M221", "missing S"))?;
        let new_extrude_factor = pct / 100.0;
        if new_extrude_factor <= 0.0 {
            return Err(MotionError::parse("M221", "extrude factor must be positive"));
        }
        let e_value = (self.last_position.e - self.base_position.e) / self.extrude_factor;
        self.base_position.e = self.last_position.e - e_value * new_extrude_factor;
        self.extrude_factor = new_extrude_factor;
        Ok(())
    }

    /// M204: returns the effective `min(accel_print, accel_travel)` ceiling
    /// for newly-built moves; the toolhead stores the result.
    pub fn cmd_m204(&self, params: &Params, hard_max: f64) -> Result<f64, MotionError> {
        if let Some(s) = params.get('S') {
            return Ok(s.min(hard_max).max(0.0));
        }
        let p = params.get('P');
        let t = params.get('T');
        match (p, t) {
            (Some(p), Some(t)) => Ok(p.min(t).min(hard_max).max(0.0)),
            _ => Err(MotionError::parse("M204", "expected S or P and T")),
        }
    }

    /// SET_GCODE_OFFSET's absolute (`X=`) form: the new gcode-visible
    /// offset for each axis letter present. Returns the (possibly
    /// translated) last_position when MOVE=1 was requested, so the caller
    /// can dispatch a synchronizing move.
    pub fn cmd_set_gcode_offset(&mut self, params: &Params) -> Option<Coord> {
        let also_move = params.get('M').map(|m| m != 0.0).unwrap_or(false);
        for &letter in &self.axes.letters.clone() {
            let idx = self.axes.index_of(letter).unwrap();
            if let Some(abs_value) = params.get(letter) {
                let delta = abs_value - (self.base_position.get(idx) - self.homing_position.get(idx));
                self.base_position.set(idx, self.base_position.get(idx) + delta);
                self.homing_position.set(idx, self.homing_position.get(idx) + delta);
                if also_move {
                    self.last_position.set(idx, self.last_position.get(idx) + delta);
                }
            }
        }
        also_move.then_some(self.last_position)
    }

    /// SET_GCODE_OFFSET's `_ADJUST` delta form, applied per axis letter
    /// present in `adjust`. Both forms update base_position and
    /// homing_position identically; only the computation of `delta` differs.
    pub fn cmd_set_gcode_offset_adjust(&mut self, adjust: &Params, also_move: bool) -> Option<Coord> {
        for &letter in &self.axes.letters.clone() {
            let idx = self.axes.index_of(letter).unwrap();
            if let Some(delta) = adjust.get(letter) {
                self.base_position.set(idx, self.base_position.get(idx) + delta);
                self.homing_position.set(idx, self.homing_position.get(idx) + delta);
                if also_move {
                    self.last_position.set(idx, self.last_position.get(idx) + delta);
                }
            }
        }
        if also_move {
            Some(self.last_position)
        } else {
            None
        }
    }

    /// SAVE_GCODE_STATE NAME=<name>.
    pub fn save_state(&mut self, name: impl Into<String>) {
        self.saved_states.insert(
            name.into(),
            SavedState {
                absolute_coord: self.absolute_coord,
                absolute_extrude: self.absolute_extrude,
                base_position: self.base_position,
                last_position: self.last_position,
                homing_position: self.homing_position,
                speed: self.speed,
                speed_factor: self.speed_factor,
                extrude_factor: self.extrude_factor,
            },
        );
    }

    /// RESTORE_GCODE_STATE NAME=<name> [MOVE=1]: restores all scalar
    /// fields, preserving the extruder's relative position across the
    /// restore by adjusting `base_position[E]`. Returns the position to
    /// dispatch a move to when `also_move` is set.
    pub fn restore_state(&mut self, name: &str, also_move: bool) -> Result<Option<Coord>, MotionError> {
        let state = self
            .saved_states
            .get(name)
            .cloned()
            .ok_or_else(|| MotionError::parse("RESTORE_GCODE_STATE", format!("unknown state '{name}'")))?;
        let e_delta = self.last_position.e - state.last_position.e;

        self.absolute_coord = state.absolute_coord;
        self.absolute_extrude = state.absolute_extrude;
        self.base_position = state.base_position;
        self.base_position.e += e_delta;
        self.homing_position = state.homing_position;
        self.speed = state.speed;
        self.speed_factor = state.speed_factor;
        self.extrude_factor = state.extrude_factor;

        if also_move {
            let mut target = state.last_position;
            target.e = self.last_position.e;
            self.last_position = target;
            Ok(Some(target))
        } else {
            self.last_position = state.last_position;
            self.last_position.e += e_delta;
            Ok(None)
        }
    }

    /// Called at the end of homing: commits `homing_position` into
    /// `base_position` for each homed axis letter.
    pub fn note_homing_end(&mut self, homed_letters: &str) {
        for letter in homed_letters.chars() {
            if let Some(idx) = self.axes.index_of(letter) {
                self.base_position.set(idx, self.homing_position.get(idx));
            }
        }
    }

    /// M114 / GET_POSITION's gcode-facing lines: `gcode_pos`, `base_pos`,
    /// `homing_pos`. The MCU-step-count and kinematic-reverse-transform
    /// lines are the host's responsibility (see `StepperPositionSource`).
    pub fn position_report(&self) -> String {
        format!(
            "gcode_pos: {}\ngcode_base_pos: {}\ngcode_homing_pos: {}",
            self.last_position, self.base_position, self.homing_position
        )
    }
}

/// Extension point so a host can splice raw per-stepper step counts into
/// `GET_POSITION`'s report without this core depending on a concrete MCU
/// transport.
pub trait StepperPositionSource {
    fn mcu_position_report(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(char, f64)]) -> Params {
        Params(pairs.to_vec())
    }

    #[test]
    fn g1_absolute_mode_adds_base_position() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.cmd_g1(&params(&[('X', 10.0)])).unwrap();
        assert_eq!(g.last_position.axes[0], 10.0);
    }

    #[test]
    fn g1_relative_mode_accumulates() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.set_absolute_coord(false);
        g.cmd_g1(&params(&[('X', 10.0)])).unwrap();
        g.cmd_g1(&params(&[('X', 5.0)])).unwrap();
        assert_eq!(g.last_position.axes[0], 15.0);
    }

    #[test]
    fn g92_resets_base_position_without_moving() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.cmd_g1(&params(&[('X', 10.0)])).unwrap();
        g.cmd_g92(&params(&[('X', 0.0)]));
        assert_eq!(g.base_position.axes[0], 10.0);
        // Next relative-equivalent move in absolute mode at X=0 returns to
        // the gcode-visible origin without changing machine position.
        g.cmd_g1(&params(&[('X', 0.0)])).unwrap();
        assert_eq!(g.last_position.axes[0], 10.0);
    }

    #[test]
    fn m220_is_noop_at_100_and_round_trips() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.cmd_g1(&params(&[('F', 600.0)])).unwrap();
        let original_speed = g.speed;
        g.cmd_m220(&params(&[('S', 100.0)])).unwrap();
        assert!((g.speed - original_speed).abs() < 1e-9);
        g.cmd_m220(&params(&[('S', 50.0)])).unwrap();
        g.cmd_m220(&params(&[('S', 100.0)])).unwrap();
        assert!((g.speed - original_speed).abs() < 1e-6);
    }

    #[test]
    fn save_restore_round_trips_scalar_fields() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.cmd_g92(&params(&[('X', 0.0)]));
        g.cmd_g1(&params(&[('X', 5.0)])).unwrap();
        g.save_state("a");
        g.cmd_g1(&params(&[('X', 7.0)])).unwrap();
        g.restore_state("a", false).unwrap();
        assert_eq!(g.last_position.axes[0], 5.0);
        assert_eq!(g.base_position.axes[0], 0.0);
    }

    #[test]
    fn restore_preserves_relative_extruder_position() {
        let mut g = GCodeMove::new(AxisSet::xyz());
        g.save_state("a");
        g.cmd_g1(&params(&[('E', 2.0)])).unwrap();
        let before_e = g.last_position.e;
        g.restore_state("a", false).unwrap();
        assert!((g.last_position.e - before_e).abs() < 1e-9);
    }
}
