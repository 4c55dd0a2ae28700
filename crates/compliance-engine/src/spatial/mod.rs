//! 3D spatial relationship analysis over building objects.
//!
//! Objects are reduced to axis-aligned bounding boxes with shape-aware
//! volume and area measures. A uniform grid accelerates candidate lookup
//! for intersection and proximity queries; every exact predicate still runs
//! on the candidates, so the grid only trims work, never changes answers.

pub mod index;

use std::collections::HashMap;

use shared_types::{BuildingModel, BuildingObject, Location};
use tracing::debug;

use self::index::GridIndex;

/// Face-touch tolerance for adjacency, in model units.
pub const ADJACENCY_EPS: f64 = 0.001;

/// Default radius for `near` conditions without an explicit distance.
pub const DEFAULT_NEAR_DISTANCE: f64 = 2.0;

/// Default radius for `within_distance` conditions without an explicit
/// distance.
pub const DEFAULT_WITHIN_DISTANCE: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    /// Width on x, depth on y, height on z.
    pub fn from_location(loc: &Location) -> Self {
        Self {
            min: [loc.x, loc.y, loc.z],
            max: [loc.x + loc.width, loc.y + loc.depth, loc.z + loc.height],
        }
    }

    pub fn extents(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn centroid(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    /// Strict overlap on all three axes. Boxes that merely touch do not
    /// intersect; that is adjacency.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| self.min[axis] < other.max[axis] && other.min[axis] < self.max[axis])
    }

    /// Full axis-wise subsumption of `other` inside `self`.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        (0..3).all(|axis| self.min[axis] <= other.min[axis] && other.max[axis] <= self.max[axis])
    }

    /// Face contact: the boxes touch within `ADJACENCY_EPS` on one axis and
    /// overlap on the two remaining axes.
    pub fn adjacent(&self, other: &BoundingBox) -> bool {
        for axis in 0..3 {
            let touches = (self.max[axis] - other.min[axis]).abs() <= ADJACENCY_EPS
                || (other.max[axis] - self.min[axis]).abs() <= ADJACENCY_EPS;
            if !touches {
                continue;
            }
            let overlap_elsewhere = (0..3).filter(|a| *a != axis).all(|a| {
                self.min[a] < other.max[a] && other.min[a] < self.max[a]
            });
            if overlap_elsewhere {
                return true;
            }
        }
        false
    }

    pub fn expanded(&self, margin: f64) -> BoundingBox {
        BoundingBox {
            min: [
                self.min[0] - margin,
                self.min[1] - margin,
                self.min[2] - margin,
            ],
            max: [
                self.max[0] + margin,
                self.max[1] + margin,
                self.max[2] + margin,
            ],
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
                self.min[2].min(other.min[2]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
                self.max[2].max(other.max[2]),
            ],
        }
    }
}

/// A building object reduced to its geometric footprint.
#[derive(Debug, Clone)]
pub struct SpatialObject {
    pub object_id: String,
    pub object_type: String,
    pub bbox: BoundingBox,
    pub volume: f64,
    pub area: f64,
    pub centroid: [f64; 3],
}

const ROOM_LIKE: &[&str] = &["room", "space", "zone"];
const PANEL_LIKE: &[&str] = &["wall", "column", "beam"];
const ROUND_LIKE: &[&str] = &["duct", "pipe", "conduit"];

fn type_matches(object_type: &str, names: &[&str]) -> bool {
    let lower = object_type.to_lowercase();
    names.iter().any(|n| lower.contains(n))
}

impl SpatialObject {
    fn from_object(object: &BuildingObject, loc: &Location) -> Self {
        let bbox = BoundingBox::from_location(loc);
        let [w, d, h] = bbox.extents();
        let mut dims = [w, d, h];
        dims.sort_by(|a, b| a.total_cmp(b));
        let [smallest, middle, largest] = dims;

        let (volume, area) = if type_matches(&object.object_type, ROUND_LIKE) {
            // Cylinder: diameter from the smallest cross dimension, length
            // from the largest.
            let radius = smallest / 2.0;
            let volume = std::f64::consts::PI * radius * radius * largest;
            let area = std::f64::consts::PI * smallest * largest;
            (volume, area)
        } else if type_matches(&object.object_type, PANEL_LIKE) {
            // Thin panel: face area times thickness.
            let face_area = middle * largest;
            (face_area * smallest, face_area)
        } else if type_matches(&object.object_type, ROOM_LIKE) {
            (w * d * h, w * d)
        } else {
            (w * d * h, w * d)
        };

        Self {
            object_id: object.object_id.clone(),
            object_type: object.object_type.clone(),
            bbox: bbox.clone(),
            volume,
            area,
            centroid: bbox.centroid(),
        }
    }
}

/// Aggregate geometry over every located object in a model.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialStatistics {
    pub object_count: usize,
    pub total_volume: f64,
    pub total_area: f64,
    pub enclosing_bbox: Option<BoundingBox>,
    pub intersection_count: usize,
}

/// Spatial view of one building model. Built once per validation run; the
/// model is immutable for the run's duration so the index never goes stale.
pub struct SpatialAnalyzer {
    objects: Vec<SpatialObject>,
    by_id: HashMap<String, usize>,
    grid: GridIndex,
}

impl SpatialAnalyzer {
    pub fn new(model: &BuildingModel) -> Self {
        let mut objects = Vec::new();
        for object in &model.objects {
            match &object.location {
                Some(loc) => objects.push(SpatialObject::from_object(object, loc)),
                None => {
                    debug!(
                        object_id = %object.object_id,
                        "object has no location, excluded from spatial analysis"
                    );
                }
            }
        }

        let boxes: Vec<BoundingBox> = objects.iter().map(|o| o.bbox.clone()).collect();
        let grid = GridIndex::for_boxes(&boxes);
        let by_id = objects
            .iter()
            .enumerate()
            .map(|(i, o)| (o.object_id.clone(), i))
            .collect();

        Self {
            objects,
            by_id,
            grid,
        }
    }

    pub fn object(&self, object_id: &str) -> Option<&SpatialObject> {
        self.by_id.get(object_id).map(|i| &self.objects[*i])
    }

    pub fn objects(&self) -> &[SpatialObject] {
        &self.objects
    }

    pub fn intersects(&self, a: &str, b: &str) -> bool {
        match (self.object(a), self.object(b)) {
            (Some(a), Some(b)) => a.bbox.intersects(&b.bbox),
            _ => false,
        }
    }

    pub fn contains(&self, outer: &str, inner: &str) -> bool {
        match (self.object(outer), self.object(inner)) {
            (Some(outer), Some(inner)) => outer.bbox.contains(&inner.bbox),
            _ => false,
        }
    }

    pub fn adjacent(&self, a: &str, b: &str) -> bool {
        match (self.object(a), self.object(b)) {
            (Some(a), Some(b)) => a.bbox.adjacent(&b.bbox),
            _ => false,
        }
    }

    /// Euclidean centroid distance; `None` when either object has no
    /// location.
    pub fn distance3d(&self, a: &str, b: &str) -> Option<f64> {
        let a = self.object(a)?;
        let b = self.object(b)?;
        Some(centroid_distance(&a.centroid, &b.centroid))
    }

    /// Objects whose centroid lies within `max_distance` of the given
    /// object's centroid. The object itself is excluded.
    pub fn nearby(&self, object_id: &str, max_distance: f64) -> Vec<&SpatialObject> {
        let Some(origin) = self.object(object_id) else {
            return Vec::new();
        };
        self.grid
            .candidates_within(&origin.bbox, max_distance)
            .into_iter()
            .map(|i| &self.objects[i])
            .filter(|o| o.object_id != origin.object_id)
            .filter(|o| centroid_distance(&origin.centroid, &o.centroid) <= max_distance)
            .collect()
    }

    /// Objects fully contained in the given volume.
    pub fn within_volume(&self, volume: &BoundingBox) -> Vec<&SpatialObject> {
        self.grid
            .candidates(volume)
            .into_iter()
            .map(|i| &self.objects[i])
            .filter(|o| volume.contains(&o.bbox))
            .collect()
    }

    /// True when `object_id` stands in `relationship` to at least one object
    /// of `target_type`.
    pub fn relates_to_type(
        &self,
        object_id: &str,
        relationship: shared_types::SpatialRelationship,
        target_type: &str,
        max_distance: Option<f64>,
    ) -> bool {
        use shared_types::SpatialRelationship as Rel;

        let Some(origin) = self.object(object_id) else {
            return false;
        };

        let candidates = match relationship {
            Rel::Near => self
                .grid
                .candidates_within(&origin.bbox, max_distance.unwrap_or(DEFAULT_NEAR_DISTANCE)),
            Rel::WithinDistance => self.grid.candidates_within(
                &origin.bbox,
                max_distance.unwrap_or(DEFAULT_WITHIN_DISTANCE),
            ),
            // Adjacency needs the epsilon margin; intersect/contain do not,
            // but the margin is harmless for a candidate superset.
            _ => self.grid.candidates_within(&origin.bbox, ADJACENCY_EPS),
        };

        candidates
            .into_iter()
            .map(|i| &self.objects[i])
            .filter(|t| t.object_id != origin.object_id && t.object_type == target_type)
            .any(|target| match relationship {
                Rel::Intersects => origin.bbox.intersects(&target.bbox),
                Rel::Contains => origin.bbox.contains(&target.bbox),
                Rel::Adjacent => origin.bbox.adjacent(&target.bbox),
                Rel::Near => {
                    centroid_distance(&origin.centroid, &target.centroid)
                        <= max_distance.unwrap_or(DEFAULT_NEAR_DISTANCE)
                }
                Rel::WithinDistance => {
                    centroid_distance(&origin.centroid, &target.centroid)
                        <= max_distance.unwrap_or(DEFAULT_WITHIN_DISTANCE)
                }
            })
    }

    pub fn statistics(&self) -> SpatialStatistics {
        let enclosing_bbox = self
            .objects
            .iter()
            .map(|o| o.bbox.clone())
            .reduce(|a, b| a.union(&b));

        let mut intersection_count = 0;
        for (i, a) in self.objects.iter().enumerate() {
            for j in self.grid.candidates(&a.bbox) {
                if j > i && a.bbox.intersects(&self.objects[j].bbox) {
                    intersection_count += 1;
                }
            }
        }

        SpatialStatistics {
            object_count: self.objects.len(),
            total_volume: self.objects.iter().map(|o| o.volume).sum(),
            total_area: self.objects.iter().map(|o| o.area).sum(),
            enclosing_bbox,
            intersection_count,
        }
    }
}

fn centroid_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}
