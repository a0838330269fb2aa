//! Fiducial pose snap: from marker observations and plan references to a
//! target pose for the odometry blend.
//!
//! Two solvers:
//!
//! - **pair mode** when at least two detections reference known plan
//!   markers: the plan baseline between the two markers fixes the geometry,
//!   the pinhole relation on their pixel separation gives the range;
//! - **single-marker mode** otherwise: range from the observed area against
//!   the `3253 px² at 150 mm` calibration anchor, direction from the
//!   marker's room-facing axis.
//!
//! The empirical constants (0.18 edge fallback factor, the 120 px pair
//! weight, the anchor itself) come from field calibration and are kept
//! verbatim.

use super::detect::MarkerObservation;
use crate::error::{Error, Result};
use crate::geometry::{normalize_deg, Point, Pose};
use crate::plan::{MarkerRef, Plan};

/// Tuning knobs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SnapTuning {
    pub focal_px: f64,
    pub heading_gain_deg: f64,
}

/// Range clamp for every distance estimate, millimetres.
const RANGE_MIN_MM: f64 = 70.0;
const RANGE_MAX_MM: f64 = 2500.0;

/// Area (px²) of a 150 mm marker observed at 150 mm.
const AREA_ANCHOR_150: f64 = 3253.0;

/// Empirical factor of the pinhole edge fallback. Preserved verbatim.
const EDGE_FALLBACK_FACTOR: f64 = 0.18;

/// Pair score weight on pixel separation. Preserved verbatim.
const PAIR_DISTANCE_WEIGHT: f64 = 120.0;

/// Blend of the separation-based range against the area-based range.
const PAIR_RANGE_BLEND: f64 = 0.85;

/// Thresholds for snapping onto a declared `snap_pose`: the observation must
/// be near-frontal and near the calibration anchor.
const FRONT_SNAP_MIN_SHAPE_COS: f64 = 0.8;
const FRONT_SNAP_MIN_PROXIMITY: f64 = 0.75;

/// Quad shape statistics used for foreshortening and yaw correction.
#[derive(Debug, Clone, Copy)]
struct QuadShape {
    /// Mean of the top/bottom edge lengths, pixels.
    width: f64,
    /// Mean of the left/right edge lengths, pixels.
    height: f64,
    /// min/max ratio of width and height, clamped to [0.08, 1].
    shape_cos: f64,
    /// Left/right edge asymmetry expressed as degrees of yaw.
    yaw_deg: f64,
}

fn quad_shape(corners: &[[f64; 2]; 4]) -> QuadShape {
    let dist = |a: [f64; 2], b: [f64; 2]| ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();

    let mut by_x = *corners;
    by_x.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap_or(std::cmp::Ordering::Equal));
    let left_edge = dist(by_x[0], by_x[1]);
    let right_edge = dist(by_x[2], by_x[3]);

    let mut by_y = *corners;
    by_y.sort_by(|a, b| a[1].partial_cmp(&b[1]).unwrap_or(std::cmp::Ordering::Equal));
    let top_edge = dist(by_y[0], by_y[1]);
    let bottom_edge = dist(by_y[2], by_y[3]);

    let width = (top_edge + bottom_edge) * 0.5;
    let height = (left_edge + right_edge) * 0.5;
    let (small, large) = if width < height {
        (width, height)
    } else {
        (height, width)
    };
    let shape_cos = if large > f64::EPSILON {
        (small / large).clamp(0.08, 1.0)
    } else {
        0.08
    };

    // A nearer (taller) right edge means the robot sits right of the marker
    // normal; scaled into a bounded yaw estimate.
    let yaw_deg = if left_edge.max(right_edge) > f64::EPSILON {
        (right_edge - left_edge) / left_edge.max(right_edge) * 45.0
    } else {
        0.0
    };

    QuadShape {
        width,
        height,
        shape_cos,
        yaw_deg,
    }
}

/// Area anchor for a marker of the given printed size.
fn area_anchor(size_mm: f64) -> f64 {
    AREA_ANCHOR_150 * (size_mm / 150.0).powi(2)
}

/// Range estimate from the observed area, with pinhole edge fallback.
fn estimate_range(
    marker: &MarkerRef,
    observation: &MarkerObservation,
    shape: &QuadShape,
    tuning: &SnapTuning,
) -> Result<f64> {
    let anchor = area_anchor(marker.size_mm);
    let reference = 150.0 * (marker.size_mm / 150.0);

    let raw = if observation.area_px > 1.0 {
        reference * (anchor / observation.area_px).sqrt()
    } else {
        let edge_px = shape.width.max(shape.height);
        if edge_px <= 1.0 {
            return Err(Error::SnapRejected(format!(
                "marker {}: no usable area or edge",
                observation.id
            )));
        }
        tuning.focal_px * marker.size_mm / edge_px * EDGE_FALLBACK_FACTOR
    };

    // Foreshortening: an oblique marker shows less area than a frontal one
    // at the same range.
    let corrected = raw.clamp(RANGE_MIN_MM, RANGE_MAX_MM) * shape.shape_cos.sqrt();
    Ok(corrected.clamp(RANGE_MIN_MM, RANGE_MAX_MM))
}

/// Single-marker target pose.
pub fn single_marker_target(
    marker: &MarkerRef,
    observation: &MarkerObservation,
    frame_width: u32,
    tuning: &SnapTuning,
) -> Result<Pose> {
    let shape = quad_shape(&observation.corners);
    let axis = marker.axis();
    let anchor = area_anchor(marker.size_mm);
    let proximity = (observation.area_px / anchor).clamp(0.0, 1.0);

    let mut range = estimate_range(marker, observation, &shape, tuning)?;
    if let Some(offset) = marker.front_offset_mm {
        range += offset;
    }

    // A declared snap pose wins for frontal observations near the
    // calibration range: that point is exactly where the operator intends
    // the robot to sit in front of the marker.
    let position = match marker.snap_pose {
        Some(snap)
            if shape.shape_cos >= FRONT_SNAP_MIN_SHAPE_COS
                && proximity >= FRONT_SNAP_MIN_PROXIMITY =>
        {
            snap
        }
        _ => Point::new(marker.x_mm + axis.x * range, marker.y_mm + axis.y * range),
    };

    let base_heading = (-axis.y).atan2(-axis.x).to_degrees();
    let image_offset = if frame_width > 0 {
        (observation.center[0] / frame_width as f64 - 0.5)
            * tuning.heading_gain_deg
            * (0.2 * (1.0 - proximity))
    } else {
        0.0
    };
    let shape_yaw = shape.yaw_deg * (0.33 * (1.0 - 0.5 * proximity));

    Ok(Pose::new(
        position.x,
        position.y,
        normalize_deg(base_heading + image_offset + shape_yaw),
    ))
}

/// Pair-mode target pose from the best-scoring marker pair.
pub fn pair_target(
    pairs: &[(&MarkerRef, &MarkerObservation)],
    tuning: &SnapTuning,
) -> Result<Pose> {
    if pairs.len() < 2 {
        return Err(Error::SnapRejected("pair mode needs two markers".into()));
    }

    // Best pair: big and well separated beats small and close together.
    let mut best: Option<(usize, usize, f64)> = None;
    for i in 0..pairs.len() {
        for j in (i + 1)..pairs.len() {
            let (_, obs_a) = pairs[i];
            let (_, obs_b) = pairs[j];
            let pixel_distance = ((obs_a.center[0] - obs_b.center[0]).powi(2)
                + (obs_a.center[1] - obs_b.center[1]).powi(2))
            .sqrt();
            let score = obs_a.area_px + obs_b.area_px + PAIR_DISTANCE_WEIGHT * pixel_distance;
            if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                best = Some((i, j, score));
            }
        }
    }
    let (i, j, _) = best.expect("at least one pair");
    let (marker_a, obs_a) = pairs[i];
    let (marker_b, obs_b) = pairs[j];

    let world_sep = marker_a.position().distance(marker_b.position());
    let pixel_sep = ((obs_a.center[0] - obs_b.center[0]).powi(2)
        + (obs_a.center[1] - obs_b.center[1]).powi(2))
    .sqrt();
    if world_sep <= f64::EPSILON || pixel_sep <= 1.0 {
        return Err(Error::SnapRejected("degenerate marker pair".into()));
    }

    // Baseline tangent and the room-side normal.
    let tangent = Point::new(
        (marker_b.x_mm - marker_a.x_mm) / world_sep,
        (marker_b.y_mm - marker_a.y_mm) / world_sep,
    );
    let mut normal = Point::new(-tangent.y, tangent.x);
    let axis_a = marker_a.axis();
    let axis_b = marker_b.axis();
    let avg_axis = Point::new((axis_a.x + axis_b.x) * 0.5, (axis_a.y + axis_b.y) * 0.5);
    if normal.x * avg_axis.x + normal.y * avg_axis.y < 0.0 {
        normal = Point::new(-normal.x, -normal.y);
    }

    let mut range = tuning.focal_px * world_sep / pixel_sep;
    let shape_a = quad_shape(&obs_a.corners);
    let shape_b = quad_shape(&obs_b.corners);
    if obs_a.area_px > 1.0 && obs_b.area_px > 1.0 {
        let range_a = estimate_range(marker_a, obs_a, &shape_a, tuning)?;
        let range_b = estimate_range(marker_b, obs_b, &shape_b, tuning)?;
        range = PAIR_RANGE_BLEND * range + (1.0 - PAIR_RANGE_BLEND) * (range_a + range_b) * 0.5;
    }
    let range = range.clamp(RANGE_MIN_MM, RANGE_MAX_MM);

    let mid = Point::new(
        (marker_a.x_mm + marker_b.x_mm) * 0.5,
        (marker_a.y_mm + marker_b.y_mm) * 0.5,
    );
    let heading = (-normal.y).atan2(-normal.x).to_degrees();

    Ok(Pose::new(
        mid.x + normal.x * range,
        mid.y + normal.y * range,
        normalize_deg(heading),
    ))
}

/// Resolve a frame of detections against the plan into one target pose.
///
/// Pair mode runs when two or more detections reference known markers;
/// otherwise the largest known detection drives single-marker mode.
/// Detections whose ids are absent from the plan are ignored.
pub fn compute_target(
    plan: &Plan,
    observations: &[MarkerObservation],
    frame_width: u32,
    tuning: &SnapTuning,
) -> Result<Pose> {
    let known: Vec<(&MarkerRef, &MarkerObservation)> = observations
        .iter()
        .filter_map(|obs| plan.marker(obs.id).map(|marker| (marker, obs)))
        .collect();

    if known.is_empty() {
        return Err(Error::SnapRejected(
            "no detection references a plan marker".into(),
        ));
    }
    if known.len() >= 2 {
        if let Ok(pose) = pair_target(&known, tuning) {
            return Ok(pose);
        }
    }
    let (marker, observation) = known
        .iter()
        .max_by(|a, b| {
            a.1.area_px
                .partial_cmp(&b.1.area_px)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("non-empty");
    single_marker_target(marker, observation, frame_width, tuning)
}
