//! Trapezoidal motion queue (component T).
//!
//! A [`Trapq`] holds position/velocity segments consumed by an external
//! iterative step-time solver. Per the design notes this is modeled as an
//! in-process opaque handle rather than a bridge to a separate C object:
//! the operation set (`append`, `set_position`, `finalize_moves`) matches
//! what the real `trapq_*` C functions expose.

#[derive(Debug, Clone, Copy)]
pub struct TrapqSegment {
    pub t0: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub start_pos: [f64; 3],
    pub axes_r: [f64; 3],
    pub start_v: f64,
    pub cruise_v: f64,
    pub accel: f64,
}

impl TrapqSegment {
    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub fn end_time(&self) -> f64 {
        self.t0 + self.total_time()
    }

    /// Position at `print_time`, clamped to the segment's own span.
    pub fn position_at(&self, print_time: f64) -> [f64; 3] {
        let t = (print_time - self.t0).clamp(0.0, self.total_time());
        let dist = if t <= self.accel_t {
            self.start_v * t + 0.5 * self.accel * t * t
        } else if t <= self.accel_t + self.cruise_t {
            let accel_d = self.start_v * self.accel_t + 0.5 * self.accel * self.accel_t * self.accel_t;
            accel_d + self.cruise_v * (t - self.accel_t)
        } else {
            let accel_d = self.start_v * self.accel_t + 0.5 * self.accel * self.accel_t * self.accel_t;
            let cruise_d = accel_d + self.cruise_v * self.cruise_t;
            let dt = t - self.accel_t - self.cruise_t;
            cruise_d + self.cruise_v * dt - 0.5 * self.accel * dt * dt
        };
        [
            self.start_pos[0] + self.axes_r[0] * dist,
            self.start_pos[1] + self.axes_r[1] * dist,
            self.start_pos[2] + self.axes_r[2] * dist,
        ]
    }
}

/// Time-ordered queue of segments for one kinematic group (or the
/// extruder). Segments are appended in non-decreasing `t0` and finalized
/// (removed) in time order by the toolhead's flush loop.
#[derive(Debug, Default)]
pub struct Trapq {
    segments: Vec<TrapqSegment>,
}

impl Trapq {
    pub fn new() -> Self {
        Trapq { segments: Vec::new() }
    }

    pub fn append(&mut self, seg: TrapqSegment) {
        debug_assert!(
            self.segments.last().map(|s| s.t0 <= seg.t0).unwrap_or(true),
            "trapq segments must be appended in non-decreasing t0 order"
        );
        self.segments.push(seg);
    }

    /// Pops (and returns) every segment fully before `upto`. `upto ==
    /// Reactor::NEVER` finalizes unconditionally (drip-mode cancellation).
    pub fn finalize_moves(&mut self, upto: f64) -> Vec<TrapqSegment> {
        if upto.is_infinite() && upto.is_sign_positive() {
            return std::mem::take(&mut self.segments);
        }
        let cut = self
            .segments
            .iter()
            .position(|s| s.end_time() > upto)
            .unwrap_or(self.segments.len());
        self.segments.drain(0..cut).collect()
    }

    pub fn set_position(&mut self, x: f64, y: f64, z: f64) {
        self.segments.clear();
        // A single zero-length anchor segment so position_at() queries
        // immediately after a set_position still resolve.
        self.segments.push(TrapqSegment {
            t0: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            start_pos: [x, y, z],
            axes_r: [0.0, 0.0, 0.0],
            start_v: 0.0,
            cruise_v: 0.0,
            accel: 0.0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[TrapqSegment] {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_drains_only_completed_segments() {
        let mut tq = Trapq::new();
        tq.append(TrapqSegment {
            t0: 0.0,
            accel_t: 1.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            start_pos: [0.0; 3],
            axes_r: [1.0, 0.0, 0.0],
            start_v: 0.0,
            cruise_v: 10.0,
            accel: 10.0,
        });
        tq.append(TrapqSegment {
            t0: 1.0,
            accel_t: 1.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            start_pos: [10.0, 0.0, 0.0],
            axes_r: [1.0, 0.0, 0.0],
            start_v: 10.0,
            cruise_v: 0.0,
            accel: -10.0,
        });
        let finalized = tq.finalize_moves(1.0);
        assert_eq!(finalized.len(), 1);
        assert_eq!(tq.len(), 1);
    }

    #[test]
    fn finalize_never_drains_everything() {
        let mut tq = Trapq::new();
        tq.append(TrapqSegment {
            t0: 0.0,
            accel_t: 1.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            start_pos: [0.0; 3],
            axes_r: [1.0, 0.0, 0.0],
            start_v: 0.0,
            cruise_v: 10.0,
            accel: 10.0,
        });
        let finalized = tq.finalize_moves(f64::INFINITY);
        assert_eq!(finalized.len(), 1);
        assert!(tq.is_empty());
    }
}
