//! Toolhead (component H): owns the print-time clock, the ordered set of
//! kinematic groups, the extruder, and the flushing/drip-mode policy.

use tracing::{debug, trace, warn};

use crate::coord::Coord;
use crate::error::{MotionError, MotionResult};
use crate::extruder::Extruder;
use crate::kinematics::CartKinematics;
use crate::queue::{LookaheadQueue, Move};
use crate::reactor::Reactor;

pub const MOVE_BATCH_TIME: f64 = 0.500;
pub const DRIP_SEGMENT_TIME: f64 = 0.050;
pub const MIN_KIN_TIME: f64 = 0.100;
pub const STALL_PAUSE_TIME: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialQueuingState {
    Main,
    Flushed,
    Priming,
    Drip,
}

/// The external MCU clock-sync oracle. Both methods are expected to be
/// cheap and safe to call from the reactor thread.
pub trait McuClock: Send {
    fn estimated_print_time(&self, system_time: f64) -> f64;
    fn flush_moves(&mut self, upto_print_time: f64);
}

/// The endstop completion the homing/drip-mode flow polls.
pub trait EndstopCompletion {
    fn test(&self) -> bool;
    /// Waits (or simulates waiting) until `deadline`; returns true if the
    /// endstop tripped before the deadline.
    fn wait(&mut self, deadline: f64) -> bool;
}

/// Result of one drip-mode move: either the whole move was emitted, or the
/// endstop fired partway through and the move was abandoned. Re-encodes
/// what upstream signals via an exception unwinding the flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DripOutcome {
    Completed,
    EndstopTriggered,
}

pub struct ToolheadConfig {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    pub buffer_time_low: f64,
    pub buffer_time_high: f64,
    pub buffer_time_start: f64,
    pub move_flush_time: f64,
}

impl Default for ToolheadConfig {
    fn default() -> Self {
        let max_accel = 3000.0;
        ToolheadConfig {
            max_velocity: 300.0,
            max_accel,
            max_accel_to_decel: 0.5 * max_accel,
            square_corner_velocity: 5.0,
            buffer_time_low: 1.0,
            buffer_time_high: 2.0,
            buffer_time_start: 0.25,
            move_flush_time: 0.05,
        }
    }
}

/// Owns kinematics, extruder, and print-time clock. Generic over the MCU
/// clock collaborator so tests can supply a deterministic fake.
pub struct Toolhead<C: McuClock> {
    pub groups: Vec<(String, CartKinematics)>,
    pub extruder: Extruder,
    pub reactor: Reactor,
    pub lookahead: LookaheadQueue,
    pub commanded_pos: Coord,
    pub print_time: f64,
    pub special_queuing_state: SpecialQueuingState,
    pub force_flush_time: f64,
    pub last_kin_move_time: f64,
    pub kin_flush_delay: f64,
    pub need_check_stall: f64,
    pub check_moves: bool,
    pub cfg: ToolheadConfig,
    pub accel_override: Option<f64>,
    mcu: C,
}

impl<C: McuClock> Toolhead<C> {
    pub fn new(cfg: ToolheadConfig, mcu: C) -> Self {
        let primary = CartKinematics::new_primary(cfg.max_velocity, cfg.max_accel);
        Toolhead {
            groups: vec![("XYZ".to_string(), primary)],
            extruder: Extruder::new(cfg.max_velocity, cfg.max_accel),
            reactor: Reactor::new(0.0),
            lookahead: LookaheadQueue::new(cfg.max_accel_to_decel),
            commanded_pos: Coord::ZERO,
            print_time: 0.0,
            special_queuing_state: SpecialQueuingState::Flushed,
            force_flush_time: 0.0,
            last_kin_move_time: 0.0,
            kin_flush_delay: 0.05,
            need_check_stall: 0.0,
            check_moves: true,
            accel_override: None,
            cfg,
            mcu,
        }
    }

    pub fn add_group(&mut self, name: impl Into<String>, group: CartKinematics) {
        self.groups.push((name.into(), group));
    }

    fn junction_deviation(&self) -> f64 {
        let scv2 = self.cfg.square_corner_velocity * self.cfg.square_corner_velocity;
        scv2 * (std::f64::consts::SQRT_2 - 1.0) / self.cfg.max_accel
    }

    fn effective_accel(&self) -> f64 {
        self.accel_override.unwrap_or(self.cfg.max_accel)
    }

    /// SET_VELOCITY_LIMIT.
    pub fn set_velocity_limit(
        &mut self,
        velocity: Option<f64>,
        accel: Option<f64>,
        square_corner_velocity: Option<f64>,
        accel_to_decel: Option<f64>,
    ) {
        if let Some(v) = velocity {
            self.cfg.max_velocity = v;
        }
        if let Some(a) = accel {
            self.cfg.max_accel = a;
        }
        if let Some(scv) = square_corner_velocity {
            self.cfg.square_corner_velocity = scv;
        }
        if let Some(atd) = accel_to_decel {
            self.cfg.max_accel_to_decel = atd;
        }
    }

    /// M204.
    pub fn set_accel_limit(&mut self, accel: f64) {
        self.accel_override = Some(accel.min(self.cfg.max_accel).max(0.0));
    }

    /// `_calc_print_time`: used re-entering Main from Flushed.
    fn calc_print_time(&mut self) {
        let est = self.mcu.estimated_print_time(self.reactor.monotonic());
        self.print_time = est
            .max(self.cfg.buffer_time_start + est)
            .max(est + MIN_KIN_TIME + self.kin_flush_delay)
            .max(self.force_flush_time + self.kin_flush_delay);
        self.special_queuing_state = SpecialQueuingState::Main;
        debug!(print_time = self.print_time, "toolhead:sync_print_time");
    }

    /// `_update_move_time(next)`: advances print_time toward `next` in
    /// MOVE_BATCH_TIME chunks, flushing step generation, trapqs, extruder,
    /// and the MCU transport at each chunk boundary.
    fn update_move_time(&mut self, next_print_time: f64) {
        let mut batch_end = self.print_time;
        while batch_end < next_print_time {
            batch_end = (batch_end + MOVE_BATCH_TIME).min(next_print_time);
            self.print_time = batch_end;

            let sg_flush_time = self.print_time;
            let flush_deadline = self.force_flush_time.max(sg_flush_time - self.kin_flush_delay);
            for (_, group) in self.groups.iter_mut() {
                for rail in group.rails.iter_mut() {
                    for stepper in rail.steppers.iter_mut() {
                        stepper.generate_steps(flush_deadline);
                    }
                }
                group.trapq.finalize_moves(flush_deadline);
            }
            self.extruder.update_move_time(flush_deadline);

            let mcu_flush = self.force_flush_time.max(sg_flush_time - self.cfg.move_flush_time);
            self.mcu.flush_moves(mcu_flush);
        }
        self.last_kin_move_time = self.last_kin_move_time.max(next_print_time);
    }

    /// Flushes the look-ahead queue into each group's trapq plus the
    /// extruder, then advances print_time through those moves.
    fn process_moves(&mut self, moves: Vec<Move>) {
        let mut t0 = self.print_time;
        for mv in &moves {
            for (_, group) in self.groups.iter_mut() {
                group.append_segment(mv, t0);
            }
            self.extruder.move_extruder(mv, t0);
            t0 += mv.total_time();
        }
        self.update_move_time(t0);
    }

    /// Explicit flush (dwell, state transitions, shutdown, drip-mode exit).
    pub fn flush_step_generation(&mut self) {
        if self.lookahead.is_empty() {
            self.special_queuing_state = SpecialQueuingState::Flushed;
            return;
        }
        let moves = self.lookahead.flush(false);
        self.process_moves(moves);
        self.special_queuing_state = SpecialQueuingState::Flushed;
    }

    fn check_stall(&mut self) {
        if self.special_queuing_state != SpecialQueuingState::Main {
            return;
        }
        let est = self.mcu.estimated_print_time(self.reactor.monotonic());
        let buffered = self.print_time - est;
        if buffered <= self.cfg.buffer_time_high {
            return;
        }
        warn!(buffered, high_water = self.cfg.buffer_time_high, "stall, pausing");
        while self.reactor.can_pause() {
            let est = self.mcu.estimated_print_time(self.reactor.monotonic());
            if self.print_time - est <= self.cfg.buffer_time_high {
                break;
            }
            self.reactor.pause(self.reactor.monotonic() + STALL_PAUSE_TIME);
        }
        self.special_queuing_state = SpecialQueuingState::Priming;
    }

    /// `move(newpos, speed)`: builds and enqueues a Move from
    /// `commanded_pos -> newpos`.
    pub fn move_to(&mut self, newpos: Coord, speed: f64) -> MotionResult<()> {
        let clamped_speed = speed.min(self.cfg.max_velocity);
        let accel = self.effective_accel();
        let jd = self.junction_deviation();
        let mut mv = Move::new(
            self.commanded_pos,
            newpos,
            clamped_speed,
            accel,
            self.cfg.max_accel_to_decel,
            jd,
        );

        if mv.move_d < 1e-9 && mv.axes_d[6].abs() < 1e-9 {
            return Ok(());
        }

        if self.check_moves {
            for (_, group) in self.groups.iter() {
                let (limit_v, limit_a) = group.check_move(&mv)?;
                mv.limit_speed(limit_v, limit_a);
            }
        }
        if mv.axes_d[6].abs() > 1e-12 {
            self.extruder.check_move(&mv)?;
        }

        self.commanded_pos = newpos;
        if self.special_queuing_state == SpecialQueuingState::Flushed {
            self.calc_print_time();
        }
        self.lookahead.add_move(mv, self.extruder.junction_v2());

        if self.lookahead.ready_to_flush(self.cfg.buffer_time_high) {
            let moves = self.lookahead.flush(true);
            if !moves.is_empty() {
                self.process_moves(moves);
            }
        }

        if self.print_time > self.need_check_stall {
            self.check_stall();
            self.need_check_stall = self.print_time + self.cfg.buffer_time_low;
        }
        Ok(())
    }

    /// `manual_move`: convenience wrapper that merges partial axis deltas
    /// on top of commanded_pos before dispatching.
    pub fn manual_move(&mut self, partial: &[(usize, f64)], speed: f64) -> MotionResult<()> {
        let mut target = self.commanded_pos;
        for &(axis, value) in partial {
            target.set(axis, value);
        }
        self.move_to(target, speed)
    }

    /// G4 / dwell: advances print_time by `seconds` and runs a stall check.
    pub fn dwell(&mut self, seconds: f64) {
        self.last_kin_move_time += seconds;
        self.print_time = self.print_time.max(self.last_kin_move_time);
        self.check_stall();
    }

    /// M400: flushes look-ahead, then polls the MCU clock until
    /// `print_time <= estimated_print_time`.
    pub fn wait_moves(&mut self) {
        self.flush_step_generation();
        loop {
            let est = self.mcu.estimated_print_time(self.reactor.monotonic());
            if self.print_time <= est {
                break;
            }
            if !self.reactor.can_pause() {
                break;
            }
            self.reactor.pause(self.reactor.monotonic() + 0.1);
        }
    }

    /// Flushes step generation, re-positions every kinematic group/rail and
    /// the extruder, and updates commanded_pos.
    pub fn set_position(&mut self, pos: Coord) {
        self.flush_step_generation();
        for (_, group) in self.groups.iter_mut() {
            group.set_position(&pos);
        }
        self.extruder.set_position(pos.e);
        self.commanded_pos = pos;
        trace!(?pos, "set_position");
    }

    pub fn get_position(&self) -> Coord {
        self.commanded_pos
    }

    /// Enters Drip mode and emits `newpos`'s move in `DRIP_SEGMENT_TIME`
    /// slices, pausing between slices until either the move completes or
    /// `endstop` trips. On trigger, all trapqs are finalized to `NEVER`,
    /// the extruder is updated to the same sentinel, the look-ahead queue
    /// is cleared, and step generation is re-flushed — mirroring the
    /// cancellation sequence in the concurrency model.
    pub fn drip_move(
        &mut self,
        newpos: Coord,
        speed: f64,
        endstop: &mut dyn EndstopCompletion,
    ) -> MotionResult<DripOutcome> {
        self.special_queuing_state = SpecialQueuingState::Drip;
        self.move_to(newpos, speed)?;
        let moves = self.lookahead.flush(false);

        let mut t0 = self.print_time;
        for mv in &moves {
            for (_, group) in self.groups.iter_mut() {
                group.append_segment(mv, t0);
            }
            self.extruder.move_extruder(mv, t0);
            let move_end = t0 + mv.total_time();

            let mut slice_end = t0;
            while slice_end < move_end {
                slice_end = (slice_end + DRIP_SEGMENT_TIME).min(move_end);
                if endstop.test() || endstop.wait(slice_end) {
                    return Ok(self.abandon_drip_move());
                }
                self.update_move_time(slice_end);
            }
            t0 = move_end;
        }
        self.special_queuing_state = SpecialQueuingState::Flushed;
        Ok(DripOutcome::Completed)
    }

    fn abandon_drip_move(&mut self) -> DripOutcome {
        self.lookahead.flush(false);
        for (_, group) in self.groups.iter_mut() {
            group.trapq.finalize_moves(Reactor::NEVER);
        }
        self.extruder.update_move_time(Reactor::NEVER);
        self.flush_step_generation();
        DripOutcome::EndstopTriggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock {
        print_time: f64,
        flushed_upto: f64,
    }

    impl McuClock for FixedClock {
        fn estimated_print_time(&self, _system_time: f64) -> f64 {
            self.print_time
        }
        fn flush_moves(&mut self, upto_print_time: f64) {
            self.flushed_upto = upto_print_time;
        }
    }

    struct NeverTrips;
    impl EndstopCompletion for NeverTrips {
        fn test(&self) -> bool {
            false
        }
        fn wait(&mut self, _deadline: f64) -> bool {
            false
        }
    }

    struct TripsAt {
        trip_time: f64,
        now: f64,
    }
    impl EndstopCompletion for TripsAt {
        fn test(&self) -> bool {
            self.now >= self.trip_time
        }
        fn wait(&mut self, deadline: f64) -> bool {
            self.now = deadline;
            self.now >= self.trip_time
        }
    }

    fn test_toolhead() -> Toolhead<FixedClock> {
        let mut th = Toolhead::new(
            ToolheadConfig::default(),
            FixedClock {
                print_time: 0.0,
                flushed_upto: 0.0,
            },
        );
        th.check_moves = false;
        th
    }

    #[test]
    fn move_updates_commanded_pos() {
        let mut th = test_toolhead();
        th.move_to(Coord::xyz(10.0, 0.0, 0.0), 50.0).unwrap();
        assert_eq!(th.commanded_pos.axes[0], 10.0);
    }

    /// Regression test for the `ready_to_flush` unit mismatch: two
    /// collinear moves dispatched through the public `move_to` API must
    /// stay co-resident in the look-ahead queue (each move here takes 0.5s
    /// at cruise speed, well under the 2.0s `buffer_time_high` default) so
    /// the junction pass can chain `move1.end_v` into `move2.start_v`
    /// instead of flushing each move alone with a forced-zero boundary.
    #[test]
    fn collinear_moves_chain_junction_velocity_through_public_move_api() {
        let mut th = test_toolhead();
        th.move_to(Coord::xyz(10.0, 0.0, 0.0), 20.0).unwrap();
        th.move_to(Coord::xyz(20.0, 0.0, 0.0), 20.0).unwrap();
        assert_eq!(th.lookahead.len(), 2, "both moves should still be buffered together");

        let moves = th.lookahead.flush(false);
        assert_eq!(moves.len(), 2);
        assert!((moves[0].cruise_v - 20.0).abs() < 1e-6);
        assert!(
            moves[1].start_v > 1e-6,
            "second move should inherit a nonzero start_v from the junction, not restart from 0"
        );
    }

    #[test]
    fn set_position_round_trips() {
        let mut th = test_toolhead();
        th.set_position(Coord::xyz(5.0, 6.0, 7.0));
        let p = th.get_position();
        assert_eq!((p.axes[0], p.axes[1], p.axes[2]), (5.0, 6.0, 7.0));
    }

    #[test]
    fn print_time_never_goes_backwards_across_moves() {
        let mut th = test_toolhead();
        th.move_to(Coord::xyz(10.0, 0.0, 0.0), 50.0).unwrap();
        let t1 = th.print_time;
        th.move_to(Coord::xyz(20.0, 0.0, 0.0), 50.0).unwrap();
        assert!(th.print_time >= t1);
    }

    #[test]
    fn drip_move_completes_when_endstop_never_trips() {
        let mut th = test_toolhead();
        let mut endstop = NeverTrips;
        let outcome = th.drip_move(Coord::xyz(10.0, 0.0, 0.0), 5.0, &mut endstop).unwrap();
        assert_eq!(outcome, DripOutcome::Completed);
        assert!(th.lookahead.is_empty());
    }

    #[test]
    fn drip_move_abandons_on_endstop_trigger() {
        let mut th = test_toolhead();
        let mut endstop = TripsAt { trip_time: 0.001, now: 0.0 };
        let outcome = th.drip_move(Coord::xyz(100.0, 0.0, 0.0), 5.0, &mut endstop).unwrap();
        assert_eq!(outcome, DripOutcome::EndstopTriggered);
        assert!(th.lookahead.is_empty());
        for (_, group) in th.groups.iter() {
            assert!(group.trapq.is_empty());
        }
    }
}
