//! End-to-end motion pipeline test: G-code motion state -> arc interpolator
//! -> toolhead move dispatch -> trapq segments, exercised together rather
//! than unit-by-unit as the per-crate tests under `crates/motion/tests/` do.

use motion::arc::{plan_arc, Plane};
use motion::coord::{AxisSet, Coord};
use motion::gcode_state::{GCodeMove, Params};
use motion::kinematics::{CartKinematics, Rail};
use motion::toolhead::{McuClock, Toolhead, ToolheadConfig};

struct FixedClock;
impl McuClock for FixedClock {
    fn estimated_print_time(&self, _system_time: f64) -> f64 {
        0.0
    }
    fn flush_moves(&mut self, _upto_print_time: f64) {}
}

fn homed_toolhead() -> Toolhead<FixedClock> {
    let mut th = Toolhead::new(ToolheadConfig::default(), FixedClock);
    {
        let (_, group) = &mut th.groups[0];
        group.rails.push(Rail::new("x", -200.0, 200.0, 0.0));
        group.rails.push(Rail::new("y", -200.0, 200.0, 0.0));
        group.rails.push(Rail::new("z", 0.0, 200.0, 0.0));
        group.note_homed('X');
        group.note_homed('Y');
        group.note_homed('Z');
    }
    th
}

#[test]
fn gcode_move_feeds_toolhead_and_updates_commanded_position() {
    let mut gcode = GCodeMove::new(AxisSet::xyz());
    let mut th = homed_toolhead();

    let target = gcode.cmd_g1(&Params(vec![('X', 10.0), ('F', 600.0)])).unwrap();
    th.move_to(target, gcode.speed).unwrap();

    assert_eq!(th.commanded_pos.axes[0], 10.0);
    assert!((gcode.speed - 10.0).abs() < 1e-9);
}

#[test]
fn arc_decomposition_feeds_a_sequence_of_moves_ending_exactly_on_target() {
    let mut gcode = GCodeMove::new(AxisSet::xyz());
    let mut th = homed_toolhead();

    // Establish the current position with a regular move first.
    let start = gcode.cmd_g1(&Params(vec![('X', 0.0), ('Y', 0.0), ('F', 600.0)])).unwrap();
    th.move_to(start, gcode.speed).unwrap();

    let segments = plan_arc(
        (0.0, 0.0, 0.0),
        (10.0, 0.0, 0.0),
        5.0,
        0.0,
        true,
        Plane::Xy,
        0.0,
        1.0,
    )
    .unwrap();

    for seg in &segments {
        let mut p = th.commanded_pos;
        p.axes[0] = seg.alpha;
        p.axes[1] = seg.beta;
        th.move_to(p, gcode.speed).unwrap();
    }

    assert!((th.commanded_pos.axes[0] - 10.0).abs() < 1e-9);
    assert!((th.commanded_pos.axes[1] - 0.0).abs() < 1e-9);
}

#[test]
fn save_and_restore_gcode_state_round_trips_through_a_move() {
    let mut gcode = GCodeMove::new(AxisSet::xyz());
    let mut th = homed_toolhead();

    let p1 = gcode.cmd_g1(&Params(vec![('X', 5.0)])).unwrap();
    th.move_to(p1, 50.0).unwrap();
    gcode.save_state("pre_probe");

    let p2 = gcode.cmd_g1(&Params(vec![('X', 7.0)])).unwrap();
    th.move_to(p2, 50.0).unwrap();

    let restored = gcode.restore_state("pre_probe", true).unwrap().unwrap();
    th.move_to(restored, 50.0).unwrap();

    assert!((th.commanded_pos.axes[0] - 5.0).abs() < 1e-9);
}

#[test]
fn rejects_a_move_outside_homed_travel_limits() {
    let mut th = homed_toolhead();
    let err = th.move_to(Coord::xyz(1000.0, 0.0, 0.0), 50.0).unwrap_err();
    assert!(matches!(err, motion::error::MotionError::OutOfRange { axis: 'X', .. }));
}

#[allow(dead_code)]
fn unused_type_hint(_k: &CartKinematics) {}
