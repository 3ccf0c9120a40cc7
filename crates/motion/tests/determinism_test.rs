//! Tests for the trapezoid planner's determinism and correctness (S1/S2
//! style end-to-end scenarios).

use motion::coord::Coord;
use motion::queue::{LookaheadQueue, Move};

fn linear_move(from: (f64, f64), to: (f64, f64), feed_mm_per_min: f64) -> Move {
    Move::new(
        Coord::xyz(from.0, from.1, 0.0),
        Coord::xyz(to.0, to.1, 0.0),
        feed_mm_per_min / 60.0,
        1000.0,
        500.0,
        0.02,
    )
}

#[test]
fn s1_collinear_moves_cruise_at_commanded_feed() {
    let mut q = LookaheadQueue::new(500.0);
    q.add_move(linear_move((0.0, 0.0), (10.0, 0.0), 600.0), f64::INFINITY);
    q.add_move(linear_move((10.0, 0.0), (20.0, 0.0), 600.0), f64::INFINITY);
    let flushed = q.flush(false);

    assert_eq!(flushed.len(), 2);
    assert!((flushed[0].move_d - 10.0).abs() < 1e-9);
    assert!((flushed[1].move_d - 10.0).abs() < 1e-9);
    assert!((flushed[0].end_v - 10.0).abs() < 1e-6);
    assert!((flushed[1].start_v - flushed[0].end_v).abs() < 1e-9);
}

#[test]
fn s2_right_angle_corner_uses_junction_deviation_limit() {
    let mut q = LookaheadQueue::new(500.0);
    q.add_move(linear_move((0.0, 0.0), (10.0, 0.0), 1200.0), f64::INFINITY);
    q.add_move(linear_move((10.0, 0.0), (10.0, 10.0), 1200.0), f64::INFINITY);
    let flushed = q.flush(false);

    let sin_half = (std::f64::consts::FRAC_PI_2 / 2.0).sin();
    let r_jd = sin_half / (1.0 - sin_half);
    let expected_v2 = r_jd * 0.02 * 1000.0;
    assert!(flushed[1].start_v * flushed[1].start_v <= expected_v2 + 1e-6);
    assert!(flushed[1].start_v > 0.0);
}

#[test]
fn trapezoid_phases_are_nonnegative_and_sum_to_move_time() {
    let mut q = LookaheadQueue::new(500.0);
    q.add_move(linear_move((0.0, 0.0), (50.0, 0.0), 3000.0), f64::INFINITY);
    let flushed = q.flush(false);
    let m = &flushed[0];
    assert!(m.accel_t >= 0.0);
    assert!(m.cruise_t >= 0.0);
    assert!(m.decel_t >= 0.0);
    assert!((m.accel_t + m.cruise_t + m.decel_t - m.total_time()).abs() < 1e-9);
}
