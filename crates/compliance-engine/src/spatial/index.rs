//! Uniform-grid index over axis-aligned bounding boxes.
//!
//! Each box is registered in every grid cell it overlaps; a query gathers
//! the candidate set from the cells a probe box touches. Candidates are a
//! superset of the true result, so callers always run the exact predicate
//! afterwards.

use std::collections::HashMap;

use super::BoundingBox;

#[derive(Debug)]
pub struct GridIndex {
    cell_size: f64,
    cells: HashMap<(i64, i64, i64), Vec<usize>>,
    len: usize,
}

impl GridIndex {
    pub fn new(cell_size: f64) -> Self {
        Self {
            // Degenerate cell sizes would put everything in one cell.
            cell_size: cell_size.max(1e-6),
            cells: HashMap::new(),
            len: 0,
        }
    }

    /// Pick a cell size from the boxes being indexed: twice the average
    /// largest extent keeps most boxes within a handful of cells.
    pub fn for_boxes(boxes: &[BoundingBox]) -> Self {
        let mut index = if boxes.is_empty() {
            Self::new(1.0)
        } else {
            let avg_extent: f64 = boxes
                .iter()
                .map(|b| {
                    let e = b.extents();
                    e[0].max(e[1]).max(e[2])
                })
                .sum::<f64>()
                / boxes.len() as f64;
            Self::new((avg_extent * 2.0).max(1.0))
        };
        for (i, bbox) in boxes.iter().enumerate() {
            index.insert(i, bbox);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn cell_of(&self, coord: f64) -> i64 {
        (coord / self.cell_size).floor() as i64
    }

    fn cell_range(&self, bbox: &BoundingBox) -> [(i64, i64); 3] {
        [
            (self.cell_of(bbox.min[0]), self.cell_of(bbox.max[0])),
            (self.cell_of(bbox.min[1]), self.cell_of(bbox.max[1])),
            (self.cell_of(bbox.min[2]), self.cell_of(bbox.max[2])),
        ]
    }

    pub fn insert(&mut self, id: usize, bbox: &BoundingBox) {
        let [(x0, x1), (y0, y1), (z0, z1)] = self.cell_range(bbox);
        for x in x0..=x1 {
            for y in y0..=y1 {
                for z in z0..=z1 {
                    self.cells.entry((x, y, z)).or_default().push(id);
                }
            }
        }
        self.len += 1;
    }

    /// Ids of every box registered in a cell the probe box touches,
    /// deduplicated and in ascending order.
    pub fn candidates(&self, probe: &BoundingBox) -> Vec<usize> {
        let [(x0, x1), (y0, y1), (z0, z1)] = self.cell_range(probe);
        let mut ids = Vec::new();
        for x in x0..=x1 {
            for y in y0..=y1 {
                for z in z0..=z1 {
                    if let Some(cell) = self.cells.get(&(x, y, z)) {
                        ids.extend_from_slice(cell);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Candidates for a box grown by `margin` on every axis, for proximity
    /// queries.
    pub fn candidates_within(&self, probe: &BoundingBox, margin: f64) -> Vec<usize> {
        self.candidates(&probe.expanded(margin))
    }
}
