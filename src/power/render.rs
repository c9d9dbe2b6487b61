use serde::{Deserialize, Serialize};

use super::geometry::{Extent, Region, Shape};

/// Serializable description of a region for diagnostics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DebugShape {
    /// Closed rings as `[p, q]` pairs, first vertex not repeated
    pub polygons: Vec<Vec<[f64; 2]>>,
    pub segments: Vec<[[f64; 2]; 2]>,
    pub points: Vec<[f64; 2]>,
    pub bounding_box: Option<Extent>,
}

impl DebugShape {
    pub fn from_region(region: &Region) -> Self {
        let mut shape = DebugShape {
            bounding_box: region.extent(),
            ..Default::default()
        };
        for piece in region.shapes() {
            match piece {
                Shape::Point(p) => shape.points.push([p.p, p.q]),
                Shape::Segment([a, b]) => shape.segments.push([[a.p, a.q], [b.p, b.q]]),
                Shape::Polygon(v) => shape.polygons.push(v.iter().map(|p| [p.p, p.q]).collect()),
            }
        }
        shape
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty() && self.segments.is_empty() && self.points.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::geometry::{Line, Point};

    #[test]
    fn test_render_mixed_region() {
        let disc = Region::disc(100.0, 8);
        let chord = disc.intersect_line(&Line::horizontal(0.0));
        let mut shapes: Vec<Shape> = disc.shapes().to_vec();
        shapes.extend(chord.shapes().iter().cloned());
        shapes.push(Shape::Point(Point::new(1.0, 2.0)));
        let render = DebugShape::from_region(&Region::from_shapes(shapes));

        assert_eq!(render.polygons.len(), 1);
        assert_eq!(render.polygons[0].len(), 8);
        assert_eq!(render.segments.len(), 1);
        assert_eq!(render.points, vec![[1.0, 2.0]]);
        let bbox = render.bounding_box.unwrap();
        assert!((bbox.max_p - 100.0).abs() < 1e-9);
        assert!(render.to_json().contains("\"bounding_box\""));
    }

    #[test]
    fn test_render_empty_region() {
        let render = DebugShape::from_region(&Region::empty());
        assert!(render.is_empty());
        assert_eq!(render.bounding_box, None);
    }
}
