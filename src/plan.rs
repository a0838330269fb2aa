//! Plan loading and storage.
//!
//! A plan is the static description of the room: a closed contour, obstacle
//! polygons placed from a shape library, fiducial marker references, and the
//! start pose. Geometry is millimetres; angles are degrees, CCW positive,
//! 0° along +x. A document may override the unit with `unit = "cm"` / `"m"`.
//!
//! Plans are immutable after load. [`PlanManager`] holds the active plan and
//! keeps the previous one when a reload fails.

use crate::error::{Error, Result};
use crate::geometry::{CollisionMap, Point, Polygon, Pose};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Raw plan document as found on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanDocument {
    /// Length unit for every coordinate in the document. Default millimetres.
    #[serde(default)]
    pub unit: Option<String>,

    /// Closed room contour, at least 3 vertices.
    pub contour: Vec<[f64; 2]>,

    #[serde(default)]
    pub start_pose: Option<PoseDoc>,

    /// Shape library: shape id -> contour in shape-local coordinates.
    #[serde(default)]
    pub object_shapes: HashMap<String, Vec<[f64; 2]>>,

    /// Obstacle placements referencing the shape library.
    #[serde(default)]
    pub objects: Vec<ObjectPlacement>,

    #[serde(default)]
    pub aruco_markers: Vec<MarkerDoc>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PoseDoc {
    #[serde(default)]
    pub x_mm: f64,
    #[serde(default)]
    pub y_mm: f64,
    #[serde(default)]
    pub theta_deg: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectPlacement {
    pub shape: String,
    #[serde(default)]
    pub x_mm: f64,
    #[serde(default)]
    pub y_mm: f64,
    #[serde(default)]
    pub theta_deg: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkerDoc {
    pub id: u32,
    pub x_mm: f64,
    pub y_mm: f64,
    #[serde(default)]
    pub theta_deg: f64,
    #[serde(default)]
    pub size_mm: Option<f64>,
    #[serde(default)]
    pub snap_pose: Option<PoseDoc>,
    #[serde(default)]
    pub front_offset_mm: Option<f64>,
}

/// An obstacle already transformed to world coordinates.
#[derive(Debug, Clone)]
pub struct Obstacle {
    pub shape_id: String,
    pub pose: Pose,
    pub contour: Polygon,
}

/// A fiducial marker reference in the room frame.
#[derive(Debug, Clone)]
pub struct MarkerRef {
    pub id: u32,
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    pub size_mm: f64,
    /// Declared robot pose for a frontal snap against this marker.
    pub snap_pose: Option<Point>,
    /// Extra distance added along the marker axis when estimating range.
    pub front_offset_mm: Option<f64>,
}

impl MarkerRef {
    pub fn position(&self) -> Point {
        Point::new(self.x_mm, self.y_mm)
    }

    /// Unit axis pointing from the marker into the room: toward `snap_pose`
    /// when declared, along the marker heading otherwise.
    pub fn axis(&self) -> Point {
        if let Some(snap) = self.snap_pose {
            let dx = snap.x - self.x_mm;
            let dy = snap.y - self.y_mm;
            let len = (dx * dx + dy * dy).sqrt();
            if len > f64::EPSILON {
                return Point::new(dx / len, dy / len);
            }
        }
        let rad = self.theta_deg.to_radians();
        Point::new(rad.cos(), rad.sin())
    }
}

/// A validated, world-transformed plan.
#[derive(Debug, Clone)]
pub struct Plan {
    room: Polygon,
    obstacles: Vec<Obstacle>,
    start_pose: Pose,
    markers: Vec<MarkerRef>,
}

impl Plan {
    /// Build a plan from a raw document.
    ///
    /// `default_marker_size_mm` fills marker entries without an explicit
    /// `size_mm`; the configured printed size is the usual source.
    pub fn from_document(doc: &PlanDocument, default_marker_size_mm: f64) -> Result<Self> {
        let scale = unit_scale(doc.unit.as_deref())?;

        let contour: Vec<Point> = doc
            .contour
            .iter()
            .map(|[x, y]| Point::new(x * scale, y * scale))
            .collect();
        let room = Polygon::new(contour)
            .ok_or_else(|| Error::PlanInvalid("contour needs at least 3 points".into()))?;

        let mut obstacles = Vec::with_capacity(doc.objects.len());
        for placement in &doc.objects {
            let shape = doc.object_shapes.get(&placement.shape).ok_or_else(|| {
                Error::PlanInvalid(format!("unknown object shape `{}`", placement.shape))
            })?;
            let pose = Pose::new(
                placement.x_mm * scale,
                placement.y_mm * scale,
                placement.theta_deg,
            );
            let rad = pose.theta_deg.to_radians();
            let (sin, cos) = rad.sin_cos();
            let world: Vec<Point> = shape
                .iter()
                .map(|[x, y]| {
                    let (x, y) = (x * scale, y * scale);
                    Point::new(
                        pose.x_mm + x * cos - y * sin,
                        pose.y_mm + x * sin + y * cos,
                    )
                })
                .collect();
            let contour = Polygon::new(world).ok_or_else(|| {
                Error::PlanInvalid(format!("shape `{}` needs at least 3 points", placement.shape))
            })?;
            if !contour.bounds().intersects(room.bounds()) {
                return Err(Error::PlanInvalid(format!(
                    "object `{}` lies entirely outside the room",
                    placement.shape
                )));
            }
            obstacles.push(Obstacle {
                shape_id: placement.shape.clone(),
                pose,
                contour,
            });
        }

        let mut seen_ids = HashSet::new();
        let mut markers = Vec::with_capacity(doc.aruco_markers.len());
        for m in &doc.aruco_markers {
            if !seen_ids.insert(m.id) {
                return Err(Error::PlanInvalid(format!("duplicate marker id {}", m.id)));
            }
            markers.push(MarkerRef {
                id: m.id,
                x_mm: m.x_mm * scale,
                y_mm: m.y_mm * scale,
                theta_deg: m.theta_deg,
                size_mm: m.size_mm.map(|s| s * scale).unwrap_or(default_marker_size_mm),
                snap_pose: m
                    .snap_pose
                    .map(|p| Point::new(p.x_mm * scale, p.y_mm * scale)),
                front_offset_mm: m.front_offset_mm.map(|d| d * scale),
            });
        }

        let start_pose = doc
            .start_pose
            .map(|p| Pose::new(p.x_mm * scale, p.y_mm * scale, p.theta_deg))
            .unwrap_or_default();

        Ok(Self {
            room,
            obstacles,
            start_pose,
            markers,
        })
    }

    /// Load and validate a plan from a JSON file.
    pub fn load_file<P: AsRef<Path>>(path: P, default_marker_size_mm: f64) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::PlanInvalid(format!("failed to read plan: {}", e)))?;
        let doc: PlanDocument = serde_json::from_str(&text)
            .map_err(|e| Error::PlanInvalid(format!("failed to parse plan: {}", e)))?;
        Self::from_document(&doc, default_marker_size_mm)
    }

    pub fn room_contour(&self) -> &Polygon {
        &self.room
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn start_pose(&self) -> Pose {
        self.start_pose
    }

    pub fn markers(&self) -> &[MarkerRef] {
        &self.markers
    }

    pub fn marker(&self, id: u32) -> Option<&MarkerRef> {
        self.markers.iter().find(|m| m.id == id)
    }

    /// Build the collision model for a disc robot with the given clearance.
    pub fn collision_map(&self, clearance_mm: f64) -> CollisionMap {
        CollisionMap::new(
            self.room.clone(),
            self.obstacles.iter().map(|o| o.contour.clone()).collect(),
            clearance_mm,
        )
    }
}

fn unit_scale(unit: Option<&str>) -> Result<f64> {
    match unit.unwrap_or("mm") {
        "mm" => Ok(1.0),
        "cm" => Ok(10.0),
        "m" => Ok(1000.0),
        other => Err(Error::PlanInvalid(format!("unknown unit `{}`", other))),
    }
}

/// Holder for the active plan. Reload failures keep the previous plan.
#[derive(Default)]
pub struct PlanManager {
    active: RwLock<Option<Arc<Plan>>>,
}

impl PlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file<P: AsRef<Path>>(
        &self,
        path: P,
        default_marker_size_mm: f64,
    ) -> Result<Arc<Plan>> {
        let plan = Arc::new(Plan::load_file(path, default_marker_size_mm)?);
        *self.active.write().map_err(|_| Error::MutexPoisoned)? = Some(Arc::clone(&plan));
        Ok(plan)
    }

    pub fn load_from_document(
        &self,
        doc: &PlanDocument,
        default_marker_size_mm: f64,
    ) -> Result<Arc<Plan>> {
        let plan = Arc::new(Plan::from_document(doc, default_marker_size_mm)?);
        *self.active.write().map_err(|_| Error::MutexPoisoned)? = Some(Arc::clone(&plan));
        Ok(plan)
    }

    pub fn get(&self) -> Option<Arc<Plan>> {
        self.active.read().ok().and_then(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> PlanDocument {
        serde_json::from_str(
            r#"{
                "contour": [[0, 0], [3000, 0], [3000, 3000], [0, 3000]],
                "start_pose": {"x_mm": 500, "y_mm": 500, "theta_deg": 0},
                "object_shapes": {"crate": [[-100, -100], [100, -100], [100, 100], [-100, 100]]},
                "objects": [{"shape": "crate", "x_mm": 1500, "y_mm": 1500, "theta_deg": 45}],
                "aruco_markers": [
                    {"id": 7, "x_mm": 2000, "y_mm": 2000, "theta_deg": 180,
                     "snap_pose": {"x_mm": 1700, "y_mm": 2000}}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_plan_loads_and_transforms_objects() {
        let plan = Plan::from_document(&sample_doc(), 150.0).unwrap();
        assert_eq!(plan.obstacles().len(), 1);
        let obstacle = &plan.obstacles()[0];
        // 45° rotated 200mm square: corners land on the diagonals.
        let b = obstacle.contour.bounds();
        assert!((b.min_x - (1500.0 - 100.0 * 2f64.sqrt())).abs() < 1e-6);
        assert_eq!(plan.start_pose(), Pose::new(500.0, 500.0, 0.0));
    }

    #[test]
    fn test_marker_axis_prefers_snap_pose() {
        let plan = Plan::from_document(&sample_doc(), 150.0).unwrap();
        let marker = plan.marker(7).unwrap();
        assert!((marker.size_mm - 150.0).abs() < 1e-9);
        let axis = marker.axis();
        assert!((axis.x + 1.0).abs() < 1e-9);
        assert!(axis.y.abs() < 1e-9);
    }

    #[test]
    fn test_short_contour_rejected() {
        let doc: PlanDocument =
            serde_json::from_str(r#"{"contour": [[0, 0], [1000, 0]]}"#).unwrap();
        assert!(matches!(
            Plan::from_document(&doc, 150.0),
            Err(Error::PlanInvalid(_))
        ));
    }

    #[test]
    fn test_duplicate_marker_ids_rejected() {
        let mut doc = sample_doc();
        doc.aruco_markers.push(doc.aruco_markers[0].clone());
        assert!(Plan::from_document(&doc, 150.0).is_err());
    }

    #[test]
    fn test_unit_override_scales_lengths() {
        let doc: PlanDocument = serde_json::from_str(
            r#"{"unit": "m", "contour": [[0, 0], [3, 0], [3, 3], [0, 3]]}"#,
        )
        .unwrap();
        let plan = Plan::from_document(&doc, 150.0).unwrap();
        assert!((plan.room_contour().bounds().max_x - 3000.0).abs() < 1e-9);
    }

    #[test]
    fn test_manager_keeps_previous_plan_on_failure() {
        let manager = PlanManager::new();
        manager.load_from_document(&sample_doc(), 150.0).unwrap();
        let bad: PlanDocument =
            serde_json::from_str(r#"{"contour": [[0, 0], [1, 0]]}"#).unwrap();
        assert!(manager.load_from_document(&bad, 150.0).is_err());
        assert!(manager.get().is_some());
        assert_eq!(manager.get().unwrap().markers().len(), 1);
    }
}
