//! Polygon geometry for collision-aware odometry.
//!
//! The room is a closed CCW polygon; obstacles are closed polygons inside it.
//! The robot is a disc whose centre must keep a configured clearance from
//! every edge. Obstacle edge lists and bounding boxes are precomputed so a
//! collision query is O(edges) with a cheap bbox reject per obstacle.

use serde::{Deserialize, Serialize};

/// A point in millimetres, room frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance(&self, other: Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Robot pose in the room frame: millimetres and degrees.
///
/// The heading is counter-clockwise positive with 0° along +x, and is kept
/// normalised to (-180, 180].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
}

impl Pose {
    /// Create a pose with the heading normalised to (-180, 180].
    pub fn new(x_mm: f64, y_mm: f64, theta_deg: f64) -> Self {
        Self {
            x_mm,
            y_mm,
            theta_deg: normalize_deg(theta_deg),
        }
    }

    #[inline]
    pub fn position(&self) -> Point {
        Point::new(self.x_mm, self.y_mm)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// Normalise an angle in degrees to (-180, 180].
#[inline]
pub fn normalize_deg(mut deg: f64) -> f64 {
    deg %= 360.0;
    if deg <= -180.0 {
        deg += 360.0;
    } else if deg > 180.0 {
        deg -= 360.0;
    }
    deg
}

/// Shortest signed arc from `from` to `to`, both in degrees.
#[inline]
pub fn shortest_arc_deg(from: f64, to: f64) -> f64 {
    normalize_deg(to - from)
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    fn of(points: &[Point]) -> Self {
        let mut b = Bounds {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for p in points {
            b.min_x = b.min_x.min(p.x);
            b.min_y = b.min_y.min(p.y);
            b.max_x = b.max_x.max(p.x);
            b.max_y = b.max_y.max(p.y);
        }
        b
    }

    /// Whether `p` lies within the box expanded by `margin` on all sides.
    #[inline]
    pub fn contains_expanded(&self, p: Point, margin: f64) -> bool {
        p.x >= self.min_x - margin
            && p.x <= self.max_x + margin
            && p.y >= self.min_y - margin
            && p.y <= self.max_y + margin
    }

    /// Whether two boxes overlap.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Distance from a point to a segment, plus the closest point parameter.
#[inline]
fn segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len2 = abx * abx + aby * aby;
    if len2 <= f64::EPSILON {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len2).clamp(0.0, 1.0);
    p.distance(Point::new(a.x + t * abx, a.y + t * aby))
}

/// A closed polygon with precomputed edges and bounds.
#[derive(Debug, Clone)]
pub struct Polygon {
    vertices: Vec<Point>,
    bounds: Bounds,
}

impl Polygon {
    /// Build a polygon from at least 3 vertices. Winding is normalised to
    /// CCW (positive signed area).
    pub fn new(mut vertices: Vec<Point>) -> Option<Self> {
        if vertices.len() < 3 {
            return None;
        }
        if signed_area(&vertices) < 0.0 {
            vertices.reverse();
        }
        let bounds = Bounds::of(&vertices);
        Some(Self { vertices, bounds })
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Edge iterator as (start, end) pairs, closing back to the first vertex.
    pub fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Even-odd containment test. Points on an edge count as inside.
    pub fn contains(&self, p: Point) -> bool {
        if !self.bounds.contains_expanded(p, 0.0) {
            return false;
        }
        let mut inside = false;
        for (a, b) in self.edges() {
            if segment_distance(p, a, b) <= f64::EPSILON * 1e3 {
                return true;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Minimum distance from `p` to the polygon boundary.
    pub fn boundary_distance(&self, p: Point) -> f64 {
        self.edges()
            .map(|(a, b)| segment_distance(p, a, b))
            .fold(f64::INFINITY, f64::min)
    }

    /// The boundary edge closest to `p`.
    pub fn nearest_edge(&self, p: Point) -> (Point, Point) {
        let mut best = (self.vertices[0], self.vertices[1]);
        let mut best_d = f64::INFINITY;
        for (a, b) in self.edges() {
            let d = segment_distance(p, a, b);
            if d < best_d {
                best_d = d;
                best = (a, b);
            }
        }
        best
    }
}

/// Shoelace signed area; positive for CCW winding.
pub fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    let mut sum = 0.0;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        sum += a.x * b.y - b.x * a.y;
    }
    sum * 0.5
}

/// Room-minus-obstacles collision model for a disc robot.
///
/// A position is clear when it lies inside the room, outside every obstacle,
/// and keeps at least `clearance` millimetres from every edge.
#[derive(Debug, Clone)]
pub struct CollisionMap {
    room: Polygon,
    obstacles: Vec<Polygon>,
    clearance: f64,
}

impl CollisionMap {
    pub fn new(room: Polygon, obstacles: Vec<Polygon>, clearance: f64) -> Self {
        Self {
            room,
            obstacles,
            clearance: clearance.max(0.0),
        }
    }

    pub fn clearance(&self) -> f64 {
        self.clearance
    }

    /// Signed clearance of a position: distance to the nearest constraining
    /// edge, negative when the position is on the wrong side (outside the
    /// room or inside an obstacle).
    pub fn signed_clearance(&self, p: Point) -> f64 {
        let room_d = self.room.boundary_distance(p);
        let mut clearance = if self.room.contains(p) { room_d } else { -room_d };
        for obstacle in &self.obstacles {
            if !obstacle.bounds().contains_expanded(p, self.clearance) {
                continue;
            }
            let d = obstacle.boundary_distance(p);
            let d = if obstacle.contains(p) { -d } else { d };
            clearance = clearance.min(d);
        }
        clearance
    }

    /// Whether the disc centre may occupy `p`.
    pub fn is_clear(&self, p: Point) -> bool {
        self.signed_clearance(p) >= self.clearance
    }

    /// The edge of the nearest violated constraint at `p`, if any.
    fn nearest_violated_edge(&self, p: Point) -> Option<(Point, Point)> {
        let mut best: Option<((Point, Point), f64)> = None;
        let mut consider = |poly: &Polygon, violated: bool| {
            if !violated {
                return;
            }
            let (a, b) = poly.nearest_edge(p);
            let d = segment_distance(p, a, b);
            if best.map(|(_, bd)| d < bd).unwrap_or(true) {
                best = Some(((a, b), d));
            }
        };

        let room_violated =
            !self.room.contains(p) || self.room.boundary_distance(p) < self.clearance;
        consider(&self.room, room_violated);

        for obstacle in &self.obstacles {
            if !obstacle.bounds().contains_expanded(p, self.clearance) {
                continue;
            }
            let violated =
                obstacle.contains(p) || obstacle.boundary_distance(p) < self.clearance;
            consider(obstacle, violated);
        }
        best.map(|(edge, _)| edge)
    }

    /// Clamp a translation step from `from` to `to`.
    ///
    /// When the candidate violates a constraint the step is decomposed along
    /// the nearest violated edge: the tangential component is kept, the
    /// into-obstacle component discarded, and the result re-checked. A
    /// concave corner that still violates clamps translation to zero.
    ///
    /// A starting position that is already in violation (restored history or
    /// a hand-set pose) may still move, but only by steps that improve its
    /// clearance; the constraint becomes strict again once satisfied once.
    pub fn clamp_step(&self, from: Point, to: Point) -> Point {
        if self.is_clear(to) {
            return to;
        }

        let start_clearance = self.signed_clearance(from);
        if start_clearance < self.clearance {
            // Escape-only regime: accept strictly improving steps.
            if self.signed_clearance(to) > start_clearance {
                return to;
            }
            return from;
        }

        let Some((a, b)) = self.nearest_violated_edge(to) else {
            return from;
        };
        let len = a.distance(b);
        if len <= f64::EPSILON {
            return from;
        }
        let tx = (b.x - a.x) / len;
        let ty = (b.y - a.y) / len;
        let dot = (to.x - from.x) * tx + (to.y - from.y) * ty;
        let slid = Point::new(from.x + dot * tx, from.y + dot * ty);
        if self.is_clear(slid) {
            slid
        } else {
            from
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f64) -> Polygon {
        Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(side, 0.0),
            Point::new(side, side),
            Point::new(0.0, side),
        ])
        .unwrap()
    }

    #[test]
    fn test_winding_normalised_to_ccw() {
        let cw = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 100.0),
            Point::new(100.0, 100.0),
            Point::new(100.0, 0.0),
        ])
        .unwrap();
        assert!(signed_area(cw.vertices()) > 0.0);
    }

    #[test]
    fn test_containment() {
        let room = square(3000.0);
        assert!(room.contains(Point::new(1500.0, 1500.0)));
        assert!(!room.contains(Point::new(3500.0, 1500.0)));
        assert!(room.contains(Point::new(3000.0, 1500.0))); // on edge
    }

    #[test]
    fn test_normalize_deg_half_open_interval() {
        assert_eq!(normalize_deg(180.0), 180.0);
        assert_eq!(normalize_deg(-180.0), 180.0);
        assert_eq!(normalize_deg(540.0), 180.0);
        assert!((normalize_deg(-190.0) - 170.0).abs() < 1e-9);
        assert!((normalize_deg(370.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear_positions_respect_margin() {
        let map = CollisionMap::new(square(3000.0), vec![], 99.0);
        assert!(map.is_clear(Point::new(1500.0, 1500.0)));
        assert!(map.is_clear(Point::new(2901.0, 1500.0))); // tangent accepted
        assert!(!map.is_clear(Point::new(2901.1, 1500.0)));
    }

    #[test]
    fn test_step_slides_along_wall() {
        let map = CollisionMap::new(square(3000.0), vec![], 100.0);
        // Diagonal step into the right wall keeps its +y component.
        let from = Point::new(2850.0, 1000.0);
        let clamped = map.clamp_step(from, Point::new(2950.0, 1100.0));
        assert!(clamped.x <= 2900.0 + 1e-6);
        assert!(clamped.y > 1000.0);
    }

    #[test]
    fn test_step_into_corner_clamps_to_zero() {
        let map = CollisionMap::new(square(3000.0), vec![], 100.0);
        let from = Point::new(2899.0, 2899.0);
        let clamped = map.clamp_step(from, Point::new(2990.0, 2990.0));
        assert_eq!(clamped, from);
    }

    #[test]
    fn test_obstacle_blocks_translation() {
        let obstacle = Polygon::new(vec![
            Point::new(1000.0, 1000.0),
            Point::new(1200.0, 1000.0),
            Point::new(1200.0, 1200.0),
            Point::new(1000.0, 1200.0),
        ])
        .unwrap();
        let map = CollisionMap::new(square(3000.0), vec![obstacle], 50.0);
        assert!(!map.is_clear(Point::new(1100.0, 1100.0)));
        assert!(!map.is_clear(Point::new(960.0, 1100.0)));
        assert!(map.is_clear(Point::new(940.0, 1100.0)));
    }

    #[test]
    fn test_violating_start_may_only_improve() {
        let map = CollisionMap::new(square(3000.0), vec![], 99.0);
        let stuck = Point::new(2950.0, 500.0);
        // Forward (worse) is refused, reverse (better) is allowed.
        assert_eq!(map.clamp_step(stuck, Point::new(2960.0, 500.0)), stuck);
        let back = map.clamp_step(stuck, Point::new(2940.0, 500.0));
        assert!((back.x - 2940.0).abs() < 1e-9);
    }
}
