//! Planar polygons over projected node positions.

use crate::error::ExploreError;
use crate::types::Position;
use serde::{Deserialize, Serialize};

/// Simple polygon given by its vertices in order (closing edge implied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Position>", into = "Vec<Position>")]
pub struct Polygon {
    vertices: Vec<Position>,
}

impl TryFrom<Vec<Position>> for Polygon {
    type Error = ExploreError;

    fn try_from(vertices: Vec<Position>) -> Result<Self, Self::Error> {
        Self::new(vertices)
    }
}

impl From<Polygon> for Vec<Position> {
    fn from(polygon: Polygon) -> Self {
        polygon.vertices
    }
}

impl Polygon {
    /// At least three finite vertices enclosing a non-zero area are required.
    pub fn new(vertices: Vec<Position>) -> Result<Self, ExploreError> {
        if vertices.len() < 3 {
            return Err(ExploreError::InvalidPolygon(format!(
                "need at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        if vertices.iter().any(|v| !v.x.is_finite() || !v.y.is_finite()) {
            return Err(ExploreError::InvalidPolygon(
                "vertex coordinates must be finite".to_string(),
            ));
        }
        let polygon = Self { vertices };
        if polygon.area() <= polygon.area_tolerance() {
            return Err(ExploreError::InvalidPolygon(
                "vertices enclose no area".to_string(),
            ));
        }
        Ok(polygon)
    }

    /// Unsigned shoelace area.
    pub fn area(&self) -> f64 {
        let n = self.vertices.len();
        let twice: f64 = (0..n)
            .map(|i| {
                let (a, b) = (self.vertices[i], self.vertices[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum();
        twice.abs() / 2.0
    }

    // Scaled to the bounding box so collinear vertices far from the origin
    // still register as flat.
    fn area_tolerance(&self) -> f64 {
        let (min_x, max_x, min_y, max_y) = self.vertices.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(x0, x1, y0, y1), v| (x0.min(v.x), x1.max(v.x), y0.min(v.y), y1.max(v.y)),
        );
        let extent = (max_x - min_x).max(max_y - min_y);
        1e-9 * extent * extent
    }

    pub fn from_points(points: &[(f64, f64)]) -> Result<Self, ExploreError> {
        Self::new(points.iter().map(|&(x, y)| Position::new(x, y)).collect())
    }

    pub fn vertices(&self) -> &[Position] {
        &self.vertices
    }

    /// Even-odd ray casting. Points exactly on an edge may land either way.
    pub fn contains(&self, point: &Position) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (vi, vj) = (self.vertices[i], self.vertices[j]);
            if (vi.y > point.y) != (vj.y > point.y) {
                let x_cross = (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x;
                if point.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Area-weighted centroid; the vertex mean for degenerate polygons.
    pub fn centroid(&self) -> Position {
        let n = self.vertices.len();
        let mut area2 = 0.0;
        let (mut cx, mut cy) = (0.0, 0.0);
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[(i + 1) % n];
            let cross = a.x * b.y - b.x * a.y;
            area2 += cross;
            cx += (a.x + b.x) * cross;
            cy += (a.y + b.y) * cross;
        }
        if area2.abs() < f64::EPSILON {
            return self.vertex_mean();
        }
        Position::new(cx / (3.0 * area2), cy / (3.0 * area2))
    }

    fn vertex_mean(&self) -> Position {
        let n = self.vertices.len() as f64;
        let (sx, sy) = self
            .vertices
            .iter()
            .fold((0.0, 0.0), |(sx, sy), v| (sx + v.x, sy + v.y));
        Position::new(sx / n, sy / n)
    }

    /// A point strictly inside the polygon.
    ///
    /// The centroid when it is inside (always for convex shapes); otherwise the
    /// midpoint of the widest interior span on the horizontal line through the
    /// centroid. Falls back to the centroid for degenerate polygons.
    pub fn interior_point(&self) -> Position {
        let centroid = self.centroid();
        if self.contains(&centroid) {
            return centroid;
        }

        let y = centroid.y;
        let n = self.vertices.len();
        let mut crossings: Vec<f64> = Vec::new();
        let mut j = n - 1;
        for i in 0..n {
            let (vi, vj) = (self.vertices[i], self.vertices[j]);
            if (vi.y > y) != (vj.y > y) {
                crossings.push((vj.x - vi.x) * (y - vi.y) / (vj.y - vi.y) + vi.x);
            }
            j = i;
        }
        crossings.sort_by(f64::total_cmp);

        crossings
            .chunks_exact(2)
            .max_by(|a, b| (a[1] - a[0]).total_cmp(&(b[1] - b[0])))
            .map(|span| Position::new((span[0] + span[1]) / 2.0, y))
            .filter(|p| self.contains(p))
            .unwrap_or(centroid)
    }
}
