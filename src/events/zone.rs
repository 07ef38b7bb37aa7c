use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tracker::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneShape {
    /// Axis-aligned bounds of the given vertices
    Rectangle,
    /// Simple polygon, even-odd rule
    Polygon,
}

impl ZoneShape {
    pub fn min_vertices(&self) -> usize {
        match self {
            ZoneShape::Rectangle => 2,
            ZoneShape::Polygon => 3,
        }
    }

    pub fn check_vertices(&self, count: usize) -> Result<()> {
        let min = self.min_vertices();
        if count < min {
            return Err(Error::InvalidZone { min, got: count });
        }
        Ok(())
    }
}

/// A region of one source's image, in normalised coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub zone_id: u64,
    pub source_id: SourceId,
    pub vertices: Vec<(f32, f32)>,
    pub shape: ZoneShape,
    pub active: bool,
}

impl Zone {
    pub fn new(
        zone_id: u64,
        source_id: SourceId,
        shape: ZoneShape,
        vertices: Vec<(f32, f32)>,
    ) -> Result<Self> {
        shape.check_vertices(vertices.len())?;
        Ok(Self {
            zone_id,
            source_id,
            vertices,
            shape,
            active: true,
        })
    }

    pub fn contains(&self, point: (f32, f32)) -> bool {
        match self.shape {
            ZoneShape::Rectangle => self.bounds_contain(point),
            ZoneShape::Polygon => self.polygon_contains(point),
        }
    }

    fn bounds_contain(&self, (x, y): (f32, f32)) -> bool {
        let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
        let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for &(vx, vy) in &self.vertices {
            min_x = min_x.min(vx);
            min_y = min_y.min(vy);
            max_x = max_x.max(vx);
            max_y = max_y.max(vy);
        }
        x >= min_x && x <= max_x && y >= min_y && y <= max_y
    }

    fn polygon_contains(&self, (x, y): (f32, f32)) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}
