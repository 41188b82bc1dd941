//! Area polygons loaded from Osmosis `.poly` files.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::{AnalysisError, Result};
use crate::model::BBox;

/// Boxes narrower than this in either dimension are treated as points.
const POINT_BOX_SIZE: f64 = 0.000_001;

fn point_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let flt = r"[+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?";
        Regex::new(&format!(r"^\s*({flt})\s+({flt})")).ok()
    })
    .as_ref()
}

/// A simple polygon of `(lon, lat)` vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| AnalysisError::Area {
            path: path.display().to_string(),
            source,
        })?;
        let polygon = Self::parse(&text);
        if polygon.points.len() < 3 {
            return Err(AnalysisError::Rule(format!(
                "area file {} has fewer than 3 points",
                path.display()
            )));
        }
        Ok(polygon)
    }

    /// Parse `.poly` text. Only the first ring is read.
    pub fn parse(text: &str) -> Self {
        let mut points = Vec::new();
        let Some(re) = point_line() else {
            return Self { points };
        };
        for line in text.lines() {
            if let Some(caps) = re.captures(line) {
                let x = caps[1].parse::<f64>();
                let y = caps[2].parse::<f64>();
                if let (Ok(x), Ok(y)) = (x, y) {
                    points.push((x, y));
                }
            } else if line.trim() == "END" && !points.is_empty() {
                break;
            }
        }
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Bounds as `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let first = self.points.first()?;
        Some(self.points.iter().fold(
            (first.0, first.1, first.0, first.1),
            |(x1, y1, x2, y2), &(x, y)| (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
        ))
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    fn edges(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    /// True if the box and the polygon share any point.
    pub fn intersects_bbox(&self, bbox: &BBox) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let (x1, y1, x2, y2) = (bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat);

        let point_sized = (x2 - x1).abs() < POINT_BOX_SIZE || (y2 - y1).abs() < POINT_BOX_SIZE;
        if point_sized && self.contains(x1, y1) {
            return true;
        }

        let in_box = |&(x, y): &(f64, f64)| x >= x1 && x <= x2 && y >= y1 && y <= y2;
        if self.points.iter().any(in_box) {
            return true;
        }

        let corners = [(x1, y1), (x2, y1), (x2, y2), (x1, y2)];
        if corners.iter().any(|&(x, y)| self.contains(x, y)) {
            return true;
        }

        let box_edges = [
            (corners[0], corners[1]),
            (corners[1], corners[2]),
            (corners[2], corners[3]),
            (corners[3], corners[0]),
        ];
        self.edges().any(|(a, b)| {
            box_edges
                .iter()
                .any(|&(c, d)| segments_intersect(a, b, c, d))
        })
    }

    /// True if the centre of the box lies inside the polygon.
    pub fn contains_bbox_center(&self, bbox: &BBox) -> bool {
        let (x, y) = bbox.center();
        self.contains(x, y)
    }
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

fn segments_intersect(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    let d1 = orientation(c, d, a);
    let d2 = orientation(c, d, b);
    let d3 = orientation(a, b, c);
    let d4 = orientation(a, b, d);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(c, d, a))
        || (d2 == 0.0 && on_segment(c, d, b))
        || (d3 == 0.0 && on_segment(a, b, c))
        || (d4 == 0.0 && on_segment(a, b, d))
}
