//! Stress/property-style tests over longer move sequences.

use motion::coord::Coord;
use motion::queue::{LookaheadQueue, Move};

#[test]
fn long_zigzag_sequence_keeps_print_time_monotonic_and_distances_exact() {
    let mut q = LookaheadQueue::new(1500.0);
    let mut pos = (0.0, 0.0);
    for i in 0..500 {
        let (x, y) = if i % 2 == 0 {
            (pos.0 + 1.0, pos.1)
        } else {
            (pos.0, pos.1 + 1.0)
        };
        let mv = Move::new(
            Coord::xyz(pos.0, pos.1, 0.0),
            Coord::xyz(x, y, 0.0),
            150.0,
            3000.0,
            1500.0,
            0.02,
        );
        q.add_move(mv, f64::INFINITY);
        pos = (x, y);
    }
    let flushed = q.flush(false);
    assert_eq!(flushed.len(), 500);

    let mut t = 0.0;
    for mv in &flushed {
        assert!(mv.start_v * mv.start_v <= mv.max_start_v2 + 1e-6);
        assert!(mv.cruise_v * mv.cruise_v <= mv.max_cruise_v2 + 1e-6);
        t += mv.total_time();
        assert!(t >= 0.0);
    }
}

#[test]
fn degenerate_zero_length_move_is_still_extrude_only_safe() {
    let mut q = LookaheadQueue::new(500.0);
    let mv = Move::new(
        Coord::xyze(0.0, 0.0, 0.0, 0.0),
        Coord::xyze(0.0, 0.0, 0.0, 0.0),
        10.0,
        1000.0,
        500.0,
        0.02,
    );
    assert!(!mv.is_kinematic_move);
    q.add_move(mv, f64::INFINITY);
    let flushed = q.flush(false);
    assert_eq!(flushed.len(), 1);
}

#[test]
fn large_sequence_respects_queue_length_growth_without_overflow() {
    let mut q = LookaheadQueue::new(f64::INFINITY);
    for i in 0..2000 {
        let mv = Move::new(
            Coord::xyz(i as f64, 0.0, 0.0),
            Coord::xyz(i as f64 + 1.0, 0.0, 0.0),
            100.0,
            2000.0,
            1000.0,
            0.02,
        );
        q.add_move(mv, f64::INFINITY);
    }
    assert_eq!(q.len(), 2000);
    let flushed = q.flush(false);
    assert_eq!(flushed.len(), 2000);
}
