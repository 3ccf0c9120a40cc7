//! Move look-ahead queue and trapezoid planner (component Q).
//!
//! A [`Move`] is an immutable record of a single linear displacement once
//! its junction/trapezoid fields have been assigned by [`LookaheadQueue`].
//! The queue buffers moves, runs a backward pass to cap each junction's
//! start velocity against what the *next* moves can tolerate, then a
//! forward pass to turn those caps into an actual trapezoidal velocity
//! profile, and finally flushes the completed prefix to the caller.

use crate::coord::Coord;

/// Below this squared-distance a move is treated as extrude-only.
const MOVE_D_EPSILON: f64 = 1e-9;
const JUNCTION_COS_THRESHOLD: f64 = 0.999999;

/// Per-axis-group geometry plus planner bookkeeping for one linear segment.
#[derive(Debug, Clone)]
pub struct Move {
    pub start_pos: Coord,
    pub end_pos: Coord,
    /// Signed per-axis displacement, extruder at index 6.
    pub axes_d: [f64; 7],
    /// Unit direction over axes_d (zero vector for extrude-only moves).
    pub axes_r: [f64; 7],
    /// Euclidean length over the kinematic axes only.
    pub move_d: f64,
    pub is_kinematic_move: bool,

    pub accel: f64,
    pub junction_deviation: f64,
    pub max_cruise_v2: f64,
    pub max_start_v2: f64,
    pub max_smoothed_v2: f64,
    pub delta_v2: f64,
    pub smooth_delta_v2: f64,

    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
}

impl Move {
    /// Builds a new Move from `start -> end` at `speed` (mm/s), with the
    /// given acceleration ceiling and junction-deviation constant. Mirrors
    /// the constructor half of Klipper's `Move.__init__`.
    pub fn new(
        start: Coord,
        end: Coord,
        speed: f64,
        accel: f64,
        max_accel_to_decel: f64,
        junction_deviation: f64,
    ) -> Self {
        let mut axes_d = [0.0; 7];
        let d = end.delta(&start);
        axes_d[..6].copy_from_slice(&d[..6]);
        axes_d[6] = d[6];

        let move_d = (axes_d[0] * axes_d[0] + axes_d[1] * axes_d[1] + axes_d[2] * axes_d[2]).sqrt();
        let is_kinematic_move = move_d >= MOVE_D_EPSILON;

        let mut axes_r = [0.0; 7];
        let inv_move_d = if is_kinematic_move { 1.0 / move_d } else { 0.0 };
        if is_kinematic_move {
            for i in 0..3 {
                axes_r[i] = axes_d[i] * inv_move_d;
            }
        } else {
            // Extrude-only move: direction collapses onto the extruder axis.
            let e_d = axes_d[6].abs();
            if e_d >= MOVE_D_EPSILON {
                axes_r[6] = axes_d[6].signum();
            }
        }

        let effective_move_d = if is_kinematic_move { move_d } else { axes_d[6].abs() };
        let velocity = speed.max(0.0);
        let max_cruise_v2 = velocity * velocity;

        Move {
            start_pos: start,
            end_pos: end,
            axes_d,
            axes_r,
            move_d: effective_move_d,
            is_kinematic_move,
            accel,
            junction_deviation,
            max_cruise_v2,
            max_start_v2: 0.0,
            max_smoothed_v2: 0.0,
            delta_v2: 2.0 * effective_move_d * accel,
            smooth_delta_v2: 2.0 * effective_move_d * max_accel_to_decel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
        }
    }

    /// Junction-deviation + centripetal + extruder cornering limit between
    /// `self` (the earlier move) and `next`. Mutates `next.max_start_v2` and
    /// `next.max_smoothed_v2`. Mirrors `Move.calc_junction`.
    pub fn calc_junction(&self, next: &mut Move, extruder_junction_v2: f64) {
        if !self.is_kinematic_move || !next.is_kinematic_move {
            // Extrude-only moves don't corner against kinematic moves.
            next.max_start_v2 = next.max_cruise_v2.min(self.max_cruise_v2);
            next.max_smoothed_v2 = next.max_start_v2;
            return;
        }

        let mut cos_theta = 0.0;
        for i in 0..3 {
            cos_theta -= self.axes_r[i] * next.axes_r[i];
        }
        cos_theta = cos_theta.clamp(-1.0, 1.0);

        if cos_theta > JUNCTION_COS_THRESHOLD {
            // Near-collinear: carry the previous junction limit forward.
            next.max_start_v2 = next.max_cruise_v2.min(self.max_cruise_v2);
            next.max_smoothed_v2 = next.max_start_v2;
            return;
        }

        let sin_half = (0.5 * (1.0 - cos_theta)).max(0.0).sqrt();
        let mut max_start_v2 = f64::INFINITY;
        if sin_half < 0.999999999 {
            let r_jd = sin_half / (1.0 - sin_half);
            let jd_limit_self = r_jd * self.junction_deviation * self.accel;
            let jd_limit_next = r_jd * next.junction_deviation * next.accel;
            max_start_v2 = max_start_v2.min(jd_limit_self).min(jd_limit_next);
        }

        // Centripetal velocity: a move can't safely corner faster than what
        // keeps the machine within accel at the corner's effective radius.
        let tan_half = if cos_theta > -0.999999999 {
            (sin_half / (0.5 * (1.0 + cos_theta)).max(1e-12).sqrt()).abs()
        } else {
            f64::INFINITY
        };
        if tan_half.is_finite() {
            let centripetal_self = 0.5 * self.move_d * tan_half * self.accel;
            let centripetal_next = 0.5 * next.move_d * tan_half * next.accel;
            max_start_v2 = max_start_v2.min(centripetal_self).min(centripetal_next);
        }

        max_start_v2 = max_start_v2
            .min(extruder_junction_v2)
            .min(self.max_cruise_v2)
            .min(next.max_cruise_v2)
            .min(self.max_start_v2 + self.delta_v2);

        next.max_start_v2 = max_start_v2.max(0.0);

        let max_smoothed_v2 = max_start_v2
            .min(self.max_smoothed_v2 + self.smooth_delta_v2);
        next.max_smoothed_v2 = max_smoothed_v2.max(0.0);
    }

    /// Assigns `start_v`, `cruise_v`, `end_v`, `accel_t`, `cruise_t`,
    /// `decel_t` from the squared velocities chosen by the look-ahead pass.
    /// Mirrors `Move.set_junction`.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        let start_v2 = start_v2.max(0.0);
        let cruise_v2 = cruise_v2.max(start_v2);
        let end_v2 = end_v2.max(0.0).min(cruise_v2);

        let accel_d = ((cruise_v2 - start_v2) / (2.0 * self.accel)).max(0.0);
        let decel_d = ((cruise_v2 - end_v2) / (2.0 * self.accel)).max(0.0);
        let cruise_d = (self.move_d - accel_d - decel_d).max(0.0);

        let start_v = start_v2.sqrt();
        let cruise_v = cruise_v2.sqrt();
        let end_v = end_v2.sqrt();

        self.start_v = start_v;
        self.cruise_v = cruise_v;
        self.end_v = end_v;

        self.accel_t = if start_v + cruise_v > 0.0 {
            accel_d / ((start_v + cruise_v) / 2.0)
        } else {
            0.0
        };
        self.cruise_t = if cruise_v > 0.0 { cruise_d / cruise_v } else { 0.0 };
        self.decel_t = if end_v + cruise_v > 0.0 {
            decel_d / ((end_v + cruise_v) / 2.0)
        } else {
            0.0
        };
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    /// Narrows this move's cruise velocity and acceleration ceilings to
    /// `speed`/`accel` if they're tighter than what's already set, re-deriving
    /// `delta_v2`/`smooth_delta_v2` from the new accel. Mirrors Klipper's
    /// `Move.limit_speed`, called by a kinematic group's `check_move` when a
    /// large Z-displacement (or similar per-axis constraint) caps the move
    /// below the toolhead's global velocity/accel limits.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
        }
        if accel < self.accel {
            self.accel = accel;
            self.delta_v2 = 2.0 * self.move_d * accel;
            self.smooth_delta_v2 = self.smooth_delta_v2.min(self.delta_v2);
        }
    }
}

/// Buffers unflushed moves and performs the two-pass junction/trapezoid
/// planning over a prefix of the queue.
pub struct LookaheadQueue {
    queue: Vec<Move>,
    /// Reduced acceleration used for the smoothed-velocity pass.
    max_accel_to_decel: f64,
    /// Sum of delta_v2 since the last flush boundary; once large enough,
    /// earlier junction limits can no longer be improved by future moves.
    junction_flush: f64,
    /// Sum of each queued move's estimated duration (move_d / cruise speed)
    /// since the last flush boundary, in seconds. Compared against
    /// `buffer_time_high` to decide when the queue holds enough buffered
    /// time to flush (spec's flush policy (i)); exact `accel_t`/`cruise_t`/
    /// `decel_t` aren't known until the forward pass runs in `flush`, so
    /// this is a cruise-speed estimate rather than the final move time.
    buffered_time: f64,
}

/// A finalized, flushed move ready for trapq insertion.
pub type FlushedMove = Move;

impl LookaheadQueue {
    pub fn new(max_accel_to_decel: f64) -> Self {
        LookaheadQueue {
            queue: Vec::new(),
            max_accel_to_decel,
            junction_flush: 0.0,
            buffered_time: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Adds a move, running junction calc against the previous tail move.
    pub fn add_move(&mut self, mut mv: Move, extruder_junction_v2: f64) {
        mv.max_start_v2 = mv.max_cruise_v2.min(mv.max_start_v2.max(0.0));
        if let Some(prev) = self.queue.last() {
            prev.clone().calc_junction(&mut mv, extruder_junction_v2);
        } else {
            mv.max_start_v2 = 0.0;
            mv.max_smoothed_v2 = 0.0;
        }
        self.junction_flush += mv.delta_v2.min(mv.smooth_delta_v2);
        self.buffered_time += if mv.max_cruise_v2 > 0.0 {
            mv.move_d / mv.max_cruise_v2.sqrt()
        } else {
            0.0
        };
        self.queue.push(mv);
    }

    /// True once the queue's buffered time exceeds `buffer_time_high`
    /// (spec's flush policy (i)). `buffered_time` accumulates each move's
    /// estimated duration, in seconds, not `junction_flush`'s mm²/s² units.
    pub fn ready_to_flush(&self, buffer_time_high_threshold: f64) -> bool {
        self.buffered_time >= buffer_time_high_threshold && !self.queue.is_empty()
    }

    /// Forces a flush regardless of the junction_flush accumulator (dwell,
    /// state transitions, shutdown, or a non-kinematic move boundary).
    pub fn flush(&mut self, lazy: bool) -> Vec<FlushedMove> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        let n = self.queue.len();
        let mut update_flush_count = lazy;
        let mut delayed = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;

        // Backward pass: propagate the minimum achievable start_v2 down
        // through moves that cannot reach their own max_start_v2 from the
        // move ahead of them (Klipper's flush() backward sweep).
        let mut smoothed_results: Vec<(f64, f64)> = vec![(0.0, 0.0); n]; // (start_v2, cruise_v2)
        for i in (0..n).rev() {
            let mv = &self.queue[i];
            let reachable_start_v2 = next_end_v2 + mv.delta_v2;
            let start_v2 = mv.max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + mv.smooth_delta_v2;
            let smoothed_v2 = mv.max_smoothed_v2.min(reachable_smoothed_v2);

            if smoothed_v2 < next_smoothed_v2.min(mv.max_smoothed_v2) - 1e-9 {
                update_flush_count = true;
            }
            if update_flush_count && i < n.saturating_sub(1) {
                delayed.push(i);
            }

            peak_cruise_v2 = mv.max_cruise_v2;
            smoothed_results[i] = (start_v2, peak_cruise_v2);
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }

        // Forward pass: assign the actual start/cruise/end triple for each
        // move, chaining end_v2 of move i into start_v2 of move i+1.
        let mut prev_end_v2 = 0.0;
        for i in 0..n {
            let (capped_start_v2, cruise_v2) = smoothed_results[i];
            let start_v2 = prev_end_v2.min(capped_start_v2);
            let mv = &mut self.queue[i];
            let end_v2 = if i + 1 < n {
                smoothed_results[i + 1].0
            } else {
                0.0
            };
            mv.set_junction(start_v2, cruise_v2.max(start_v2).max(end_v2), end_v2);
            prev_end_v2 = mv.end_v * mv.end_v;
        }

        if lazy && !delayed.is_empty() {
            // Keep the tail move(s) buffered for more look-ahead; only
            // flush the settled prefix.
            let keep_from = *delayed.iter().min().unwrap();
            let flushed: Vec<Move> = self.queue.drain(0..keep_from).collect();
            self.junction_flush = 0.0;
            self.buffered_time = 0.0;
            return flushed;
        }

        self.junction_flush = 0.0;
        self.buffered_time = 0.0;
        std::mem::take(&mut self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(from: (f64, f64, f64), to: (f64, f64, f64), speed: f64) -> Move {
        Move::new(
            Coord::xyz(from.0, from.1, from.2),
            Coord::xyz(to.0, to.1, to.2),
            speed,
            1000.0,
            500.0,
            0.02,
        )
    }

    #[test]
    fn collinear_moves_share_full_speed_junction() {
        let mut q = LookaheadQueue::new(500.0);
        q.add_move(mv((0.0, 0.0, 0.0), (10.0, 0.0, 0.0), 10.0), f64::INFINITY);
        q.add_move(mv((10.0, 0.0, 0.0), (20.0, 0.0, 0.0), 10.0), f64::INFINITY);
        let flushed = q.flush(false);
        assert_eq!(flushed.len(), 2);
        assert!((flushed[0].end_v - flushed[1].start_v).abs() < 1e-6);
        assert!((flushed[0].end_v - 10.0).abs() < 1e-6);
    }

    #[test]
    fn right_angle_corner_limits_start_velocity() {
        let mut q = LookaheadQueue::new(500.0);
        q.add_move(mv((0.0, 0.0, 0.0), (10.0, 0.0, 0.0), 20.0), f64::INFINITY);
        q.add_move(mv((10.0, 0.0, 0.0), (10.0, 10.0, 0.0), 20.0), f64::INFINITY);
        let flushed = q.flush(false);
        let sin_half = (std::f64::consts::FRAC_PI_4 / 2.0).sin();
        let r_jd = sin_half / (1.0 - sin_half);
        let expected_v2 = r_jd * 0.02 * 1000.0;
        assert!(flushed[1].start_v * flushed[1].start_v <= expected_v2 + 1e-6);
    }

    #[test]
    fn trapezoid_segments_sum_to_move_distance() {
        let mut q = LookaheadQueue::new(500.0);
        q.add_move(mv((0.0, 0.0, 0.0), (100.0, 0.0, 0.0), 50.0), f64::INFINITY);
        let flushed = q.flush(false);
        let m = &flushed[0];
        let accel_d = (m.cruise_v * m.cruise_v - m.start_v * m.start_v) / (2.0 * m.accel);
        let decel_d = (m.cruise_v * m.cruise_v - m.end_v * m.end_v) / (2.0 * m.accel);
        let cruise_d = m.move_d - accel_d - decel_d;
        assert!((accel_d + cruise_d + decel_d - m.move_d).abs() < 1e-6);
        assert!(m.accel_t >= 0.0 && m.cruise_t >= 0.0 && m.decel_t >= 0.0);
    }

    #[test]
    fn extrude_only_move_skips_junction_limit() {
        let mut q = LookaheadQueue::new(500.0);
        let mut e1 = Move::new(
            Coord::xyze(0.0, 0.0, 0.0, 0.0),
            Coord::xyze(0.0, 0.0, 0.0, 1.0),
            5.0,
            1000.0,
            500.0,
            0.02,
        );
        e1.max_start_v2 = e1.max_cruise_v2;
        assert!(!e1.is_kinematic_move);
        q.add_move(e1, f64::INFINITY);
        let e2 = Move::new(
            Coord::xyze(0.0, 0.0, 0.0, 1.0),
            Coord::xyze(0.0, 0.0, 0.0, 0.5),
            5.0,
            1000.0,
            500.0,
            0.02,
        );
        q.add_move(e2, f64::INFINITY);
        let flushed = q.flush(false);
        assert_eq!(flushed.len(), 2);
        assert!((flushed[1].axes_d[6] - (-0.5)).abs() < 1e-9);
    }
}
