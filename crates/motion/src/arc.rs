//! Arc interpolator (component A): decomposes a G2/G3 centre-format arc
//! into linear segments, grounded directly on the Marlin-derived `planArc`
//! algorithm used upstream.

use crate::error::MotionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    /// G17: alpha=X, beta=Y, helical=Z.
    Xy,
    /// G18: alpha=Z, beta=X, helical=Y.
    Zx,
    /// G19: alpha=Y, beta=Z, helical=X.
    Yz,
}

/// One interior or final waypoint of a decomposed arc, in the same 3-axis
/// frame as the move that produced it, plus the evenly-distributed E delta
/// for that segment.
#[derive(Debug, Clone, Copy)]
pub struct ArcSegment {
    pub alpha: f64,
    pub beta: f64,
    pub helical: f64,
    pub e: f64,
}

const ARC_TOLERANCE_EPSILON: f64 = 1e-9;

/// Decomposes an arc from `start` to `target` with centre offset
/// `(offset_alpha, offset_beta)` relative to `start`, in the given `plane`.
/// `clockwise` selects G2 vs G3. `e_total` is the total extruder delta for
/// the whole arc, distributed evenly across segments. `resolution` is the
/// configured segment length in mm (default 1.0).
///
/// Returns an ordered list of segments; the final segment's `(alpha, beta,
/// helical)` is exactly `target`'s plane/helical components.
#[allow(clippy::too_many_arguments)]
pub fn plan_arc(
    start: (f64, f64, f64),
    target: (f64, f64, f64),
    offset_alpha: f64,
    offset_beta: f64,
    clockwise: bool,
    plane: Plane,
    e_total: f64,
    resolution: f64,
) -> Result<Vec<ArcSegment>, MotionError> {
    if offset_alpha.abs() < ARC_TOLERANCE_EPSILON && offset_beta.abs() < ARC_TOLERANCE_EPSILON {
        return Err(MotionError::parse("G2/G3", "arc requires a nonzero I/J/K offset"));
    }

    let (start_alpha, start_beta, start_helical) = select_plane(start, plane);
    let (target_alpha, target_beta, target_helical) = select_plane(target, plane);

    let center_alpha = start_alpha + offset_alpha;
    let center_beta = start_beta + offset_beta;

    let radius = (offset_alpha * offset_alpha + offset_beta * offset_beta).sqrt();

    // Vector from centre to start (r_P, r_Q in the spec's notation) and
    // centre to target.
    let r_p = -offset_alpha;
    let r_q = -offset_beta;
    let rt_alpha = target_alpha - center_alpha;
    let rt_beta = target_beta - center_beta;

    let mut angular_travel = (r_p * rt_beta - r_q * rt_alpha).atan2(r_p * rt_alpha + r_q * rt_beta);
    if angular_travel < 0.0 {
        angular_travel += 2.0 * std::f64::consts::PI;
    }

    let is_full_circle = (target_alpha - start_alpha).abs() < ARC_TOLERANCE_EPSILON
        && (target_beta - start_beta).abs() < ARC_TOLERANCE_EPSILON
        && angular_travel.abs() < ARC_TOLERANCE_EPSILON;

    if is_full_circle {
        angular_travel = 2.0 * std::f64::consts::PI;
    }

    let signed_angular_travel = if clockwise {
        angular_travel - 2.0 * std::f64::consts::PI
    } else {
        angular_travel
    };

    let linear_travel = target_helical - start_helical;
    let mm_of_travel = (radius * signed_angular_travel.abs()).hypot(linear_travel);
    if mm_of_travel < ARC_TOLERANCE_EPSILON {
        return Ok(vec![ArcSegment {
            alpha: target_alpha,
            beta: target_beta,
            helical: target_helical,
            e: e_total,
        }]);
    }

    let segments = ((mm_of_travel / resolution).floor() as i64).max(1) as usize;

    let mut out = Vec::with_capacity(segments);
    let theta_per_segment = signed_angular_travel / segments as f64;
    let linear_per_segment = linear_travel / segments as f64;
    let e_per_segment = e_total / segments as f64;

    for i in 1..segments {
        let theta = theta_per_segment * i as f64;
        // r' = R(-theta) * r, where r = (r_p, r_q) points centre->start.
        let (sin_t, cos_t) = theta.sin_cos();
        let r_alpha = r_p * cos_t - r_q * sin_t;
        let r_beta = r_p * sin_t + r_q * cos_t;
        out.push(ArcSegment {
            alpha: center_alpha - r_alpha,
            beta: center_beta - r_beta,
            helical: start_helical + linear_per_segment * i as f64,
            e: e_per_segment,
        });
    }

    // Final segment lands exactly on the target to avoid accumulated
    // floating-point drift.
    out.push(ArcSegment {
        alpha: target_alpha,
        beta: target_beta,
        helical: target_helical,
        e: e_per_segment,
    });

    Ok(out)
}

fn select_plane(p: (f64, f64, f64), plane: Plane) -> (f64, f64, f64) {
    match plane {
        Plane::Xy => (p.0, p.1, p.2),
        Plane::Zx => (p.2, p.0, p.1),
        Plane::Yz => (p.1, p.2, p.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semicircle_ends_exactly_on_target() {
        let segs = plan_arc(
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
        let last = segs.last().unwrap();
        assert!((last.alpha - 10.0).abs() < 1e-9);
        assert!((last.beta - 0.0).abs() < 1e-9);
    }

    #[test]
    fn segment_count_matches_resolution() {
        let segs = plan_arc(
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
        // Semicircle of radius 5: arc length = pi*5 ~= 15.7, resolution 1mm.
        let expected = (std::f64::consts::PI * 5.0).floor() as usize;
        assert_eq!(segs.len(), expected.max(1));
    }

    #[test]
    fn zero_offset_is_rejected() {
        let err = plan_arc((0.0, 0.0, 0.0), (10.0, 0.0, 0.0), 0.0, 0.0, true, Plane::Xy, 0.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, MotionError::Parse { .. }));
    }

    #[test]
    fn full_circle_when_target_equals_start() {
        let segs = plan_arc((0.0, 0.0, 0.0), (0.0, 0.0, 0.0), 5.0, 0.0, false, Plane::Xy, 0.0, 1.0)
            .unwrap();
        let last = segs.last().unwrap();
        assert!((last.alpha - 0.0).abs() < 1e-6);
        assert!((last.beta - 0.0).abs() < 1e-6);
        assert!(segs.len() > 1);
    }

    #[test]
    fn extrusion_is_distributed_evenly() {
        let segs = plan_arc((0.0, 0.0, 0.0), (10.0, 0.0, 0.0), 5.0, 0.0, true, Plane::Xy, 2.0, 1.0)
            .unwrap();
        let total: f64 = segs.iter().map(|s| s.e).sum();
        assert!((total - 2.0).abs() < 1e-9);
    }
}
