//! # Planar geometry for feasible (P, Q) regions
//!
//! The x axis is active power (P), the y axis reactive power (Q).
//! A [`Region`] is a union of convex [`Shape`]s; it degenerates from polygons to
//! segments and points as constraints tighten. Everything here is plain data with
//! free constructors, nothing keeps global state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::f64::consts::TAU;
use std::ops::{Add, Mul, Sub};

/// Tolerance for on-boundary decisions (power units)
pub const EPSILON: f64 = 1e-6;

/// A point in the P/Q plane
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    /// Active power
    pub p: f64,
    /// Reactive power
    pub q: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { p: 0.0, q: 0.0 };

    pub const fn new(p: f64, q: f64) -> Self {
        Self { p, q }
    }

    pub fn distance(&self, other: Point) -> f64 {
        (self.p - other.p).hypot(self.q - other.q)
    }

    fn dot(self, other: Point) -> f64 {
        self.p * other.p + self.q * other.q
    }

    fn cross(self, other: Point) -> f64 {
        self.p * other.q - self.q * other.p
    }

    fn norm(self) -> f64 {
        self.p.hypot(self.q)
    }

    fn is_finite(&self) -> bool {
        self.p.is_finite() && self.q.is_finite()
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.p + rhs.p, self.q + rhs.q)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.p - rhs.p, self.q - rhs.q)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.p * rhs, self.q * rhs)
    }
}

/// Infinite line `a·p + b·q = c` with a unit normal `(a, b)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    a: f64,
    b: f64,
    c: f64,
}

impl Line {
    /// Returns `None` for a zero normal or non-finite coefficients
    pub fn new(a: f64, b: f64, c: f64) -> Option<Self> {
        let n = a.hypot(b);
        if !(n > 0.0) || !n.is_finite() || !c.is_finite() {
            return None;
        }
        Some(Self {
            a: a / n,
            b: b / n,
            c: c / n,
        })
    }

    /// `Q = q`
    pub fn horizontal(q: f64) -> Self {
        Self { a: 0.0, b: 1.0, c: q }
    }

    /// `P = p`
    pub fn vertical(p: f64) -> Self {
        Self { a: 1.0, b: 0.0, c: p }
    }

    /// `Q = slope · P`
    pub fn through_origin(slope: f64) -> Self {
        let n = slope.hypot(1.0);
        Self {
            a: -slope / n,
            b: 1.0 / n,
            c: 0.0,
        }
    }

    /// Positive on the side the normal points to
    pub fn signed_distance(&self, point: Point) -> f64 {
        self.a * point.p + self.b * point.q - self.c
    }

    /// Orthogonal projection of `point` onto the line
    pub fn project(&self, point: Point) -> Point {
        let d = self.signed_distance(point);
        Point::new(point.p - d * self.a, point.q - d * self.b)
    }

    /// Parallel line passing through `point`
    pub fn shifted_through(&self, point: Point) -> Self {
        Self {
            c: self.a * point.p + self.b * point.q,
            ..*self
        }
    }

    fn direction(&self) -> Point {
        Point::new(-self.b, self.a)
    }

    fn flipped(&self) -> Self {
        Self {
            a: -self.a,
            b: -self.b,
            c: -self.c,
        }
    }
}

/// Closed half-plane `a·p + b·q <= c`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfPlane {
    boundary: Line,
}

impl HalfPlane {
    /// The side of `line` its normal points away from
    pub fn below(line: Line) -> Self {
        Self { boundary: line }
    }

    /// The side of `line` its normal points to
    pub fn above(line: Line) -> Self {
        Self {
            boundary: line.flipped(),
        }
    }

    pub fn p_at_most(p: f64) -> Self {
        Self::below(Line::vertical(p))
    }

    pub fn p_at_least(p: f64) -> Self {
        Self::above(Line::vertical(p))
    }

    pub fn q_at_most(q: f64) -> Self {
        Self::below(Line::horizontal(q))
    }

    pub fn q_at_least(q: f64) -> Self {
        Self::above(Line::horizontal(q))
    }

    pub fn boundary(&self) -> Line {
        self.boundary
    }

    /// Non-positive inside
    pub fn signed_distance(&self, point: Point) -> f64 {
        self.boundary.signed_distance(point)
    }

    pub fn contains(&self, point: Point) -> bool {
        self.signed_distance(point) <= EPSILON
    }
}

/// Axis-aligned extent of a region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_p: f64,
    pub max_p: f64,
    pub min_q: f64,
    pub max_q: f64,
}

/// A convex piece of a region. Polygons are counter-clockwise without collinear vertices.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Point),
    Segment([Point; 2]),
    Polygon(Vec<Point>),
}

impl Shape {
    /// Convex hull of `points`, collapsed to a segment or point when degenerate
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Option<Shape> {
        let mut pts: Vec<Point> = points.into_iter().filter(Point::is_finite).collect();
        pts.sort_by(|a, b| a.p.total_cmp(&b.p).then(a.q.total_cmp(&b.q)));
        pts.dedup_by(|a, b| a.distance(*b) <= EPSILON);

        match pts.len() {
            0 => None,
            1 => Some(Shape::Point(pts[0])),
            _ => Some(Self::from_hull(convex_hull(&pts))),
        }
    }

    fn from_hull(hull: Vec<Point>) -> Shape {
        match hull.len() {
            1 => Shape::Point(hull[0]),
            2 => Shape::Segment([hull[0], hull[1]]),
            _ => {
                let area = polygon_area(&hull);
                let perimeter: f64 = edges(&hull).map(|(a, b)| a.distance(b)).sum();
                if area <= EPSILON * perimeter {
                    // sliver from floating point noise, keep its diameter
                    let (a, b) = farthest_pair(&hull);
                    Shape::Segment([a, b])
                } else {
                    Shape::Polygon(hull)
                }
            }
        }
    }

    pub fn vertices(&self) -> &[Point] {
        match self {
            Shape::Point(p) => std::slice::from_ref(p),
            Shape::Segment(s) => s,
            Shape::Polygon(v) => v,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        match self {
            Shape::Point(p) => p.distance(point) <= EPSILON,
            Shape::Segment([a, b]) => closest_on_segment(*a, *b, point).distance(point) <= EPSILON,
            Shape::Polygon(v) => edges(v).all(|(a, b)| {
                let edge = b - a;
                edge.cross(point - a) / edge.norm() >= -EPSILON
            }),
        }
    }

    pub fn nearest_point(&self, target: Point) -> Point {
        match self {
            Shape::Point(p) => *p,
            Shape::Segment([a, b]) => closest_on_segment(*a, *b, target),
            Shape::Polygon(v) => {
                if self.contains(target) {
                    return target;
                }
                edges(v)
                    .map(|(a, b)| closest_on_segment(a, b, target))
                    .min_by(|x, y| cmp_distance(x, y, target))
                    .unwrap_or(v[0])
            }
        }
    }

    /// Sutherland-Hodgman against a single half-plane
    pub fn clip(&self, half_plane: &HalfPlane) -> Option<Shape> {
        let v = self.vertices();
        let n = v.len();
        let mut out = Vec::with_capacity(n + 2);
        for i in 0..n {
            let cur = v[i];
            let next = v[(i + 1) % n];
            let dc = half_plane.signed_distance(cur);
            let dn = half_plane.signed_distance(next);
            if dc <= EPSILON {
                out.push(cur);
            }
            if (dc < -EPSILON && dn > EPSILON) || (dc > EPSILON && dn < -EPSILON) {
                out.push(cur + (next - cur) * (dc / (dc - dn)));
            }
        }
        Shape::from_points(out)
    }

    /// Part of the shape lying on `line`: a segment, a point or nothing
    pub fn intersect_line(&self, line: &Line) -> Option<Shape> {
        let v = self.vertices();
        let n = v.len();
        let mut hits = Vec::new();
        for i in 0..n {
            let cur = v[i];
            let next = v[(i + 1) % n];
            let dc = line.signed_distance(cur);
            let dn = line.signed_distance(next);
            if dc.abs() <= EPSILON {
                hits.push(line.project(cur));
            } else if (dc < -EPSILON && dn > EPSILON) || (dc > EPSILON && dn < -EPSILON) {
                hits.push(line.project(cur + (next - cur) * (dc / (dc - dn))));
            }
        }

        let dir = line.direction();
        let along = |a: &&Point, b: &&Point| a.dot(dir).total_cmp(&b.dot(dir));
        let first = *hits.iter().min_by(along)?;
        let last = *hits.iter().max_by(along)?;
        if first.distance(last) <= EPSILON {
            Some(Shape::Point(first))
        } else {
            Some(Shape::Segment([first, last]))
        }
    }

    /// Whether every point of `other` lies in this shape. Both are convex, so the
    /// vertices decide.
    pub fn covers(&self, other: &Shape) -> bool {
        other.vertices().iter().all(|v| self.contains(*v))
    }

    pub fn translate(&self, by: Point) -> Shape {
        match self {
            Shape::Point(p) => Shape::Point(*p + by),
            Shape::Segment([a, b]) => Shape::Segment([*a + by, *b + by]),
            Shape::Polygon(v) => Shape::Polygon(v.iter().map(|p| *p + by).collect()),
        }
    }
}

/// A constraint region a feasible region can be intersected with
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Line(Line),
    HalfPlane(HalfPlane),
    Rectangle {
        min_p: f64,
        max_p: f64,
        min_q: f64,
        max_q: f64,
    },
    /// Inscribed regular polygon around the origin
    Disc { radius: f64, segments: usize },
    /// Keeps whatever lies in either half-plane
    Either(HalfPlane, HalfPlane),
}

/// Union of convex pieces. Empty when it has no pieces.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Region {
    shapes: Vec<Shape>,
}

impl Region {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn point(point: Point) -> Self {
        Self {
            shapes: vec![Shape::Point(point)],
        }
    }

    pub fn from_shapes(shapes: impl IntoIterator<Item = Shape>) -> Self {
        Self {
            shapes: shapes.into_iter().collect(),
        }
    }

    /// Regular polygon inscribed in the circle of `radius` around the origin.
    ///
    /// The vertex count is rounded up to a multiple of four so there is a vertex on each
    /// axis and the axis extremes equal the radius.
    pub fn disc(radius: f64, segments: usize) -> Self {
        Self::from_shapes(Shape::from_points(disc_vertices(radius, segments)))
    }

    pub fn rectangle(min_p: f64, max_p: f64, min_q: f64, max_q: f64) -> Self {
        Self::from_shapes(Shape::from_points([
            Point::new(min_p, min_q),
            Point::new(max_p, min_q),
            Point::new(max_p, max_q),
            Point::new(min_p, max_q),
        ]))
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn vertices(&self) -> impl Iterator<Item = Point> + '_ {
        self.shapes.iter().flat_map(|s| s.vertices().iter().copied())
    }

    pub fn contains(&self, point: Point) -> bool {
        self.shapes.iter().any(|s| s.contains(point))
    }

    pub fn clip(&self, half_plane: &HalfPlane) -> Region {
        Self::from_shapes(self.shapes.iter().filter_map(|s| s.clip(half_plane)))
    }

    pub fn intersect_line(&self, line: &Line) -> Region {
        Self::from_shapes(self.shapes.iter().filter_map(|s| s.intersect_line(line)))
    }

    /// Geometric intersection with `constraint`. Pure.
    pub fn intersect(&self, constraint: &Constraint) -> Region {
        match constraint {
            Constraint::Line(line) => self.intersect_line(line),
            Constraint::HalfPlane(hp) => self.clip(hp),
            Constraint::Rectangle {
                min_p,
                max_p,
                min_q,
                max_q,
            } => [
                HalfPlane::p_at_least(*min_p),
                HalfPlane::p_at_most(*max_p),
                HalfPlane::q_at_least(*min_q),
                HalfPlane::q_at_most(*max_q),
            ]
            .iter()
            .fold(self.clone(), |region, hp| region.clip(hp)),
            Constraint::Disc { radius, segments } => {
                let v = disc_vertices(*radius, *segments);
                edges(&v)
                    .filter_map(|(a, b)| {
                        // outward normal of a counter-clockwise edge
                        let d = b - a;
                        Line::new(d.q, -d.p, d.q * a.p - d.p * a.q).map(HalfPlane::below)
                    })
                    .fold(self.clone(), |region, hp| region.clip(&hp))
            }
            Constraint::Either(first, second) => {
                let mut shapes = self.clip(first).shapes;
                shapes.extend(self.clip(second).shapes);
                Self {
                    shapes: without_covered(shapes),
                }
            }
        }
    }

    /// Point of the region closest to `target`; `None` for an empty region
    pub fn nearest_point(&self, target: Point) -> Option<Point> {
        self.shapes
            .iter()
            .map(|s| s.nearest_point(target))
            .min_by(|a, b| cmp_distance(a, b, target))
    }

    /// Point of the region closest to `line`.
    ///
    /// Only meaningful when the region does not touch the line; then the closest point of
    /// every convex piece is one of its vertices.
    pub fn nearest_point_to_line(&self, line: &Line) -> Option<Point> {
        self.vertices().min_by(|a, b| {
            line.signed_distance(*a)
                .abs()
                .total_cmp(&line.signed_distance(*b).abs())
        })
    }

    pub fn extent(&self) -> Option<Extent> {
        let mut vertices = self.vertices();
        let first = vertices.next()?;
        let init = Extent {
            min_p: first.p,
            max_p: first.p,
            min_q: first.q,
            max_q: first.q,
        };
        Some(vertices.fold(init, |e, v| Extent {
            min_p: e.min_p.min(v.p),
            max_p: e.max_p.max(v.p),
            min_q: e.min_q.min(v.q),
            max_q: e.max_q.max(v.q),
        }))
    }

    pub fn translate(&self, by: Point) -> Region {
        Self::from_shapes(self.shapes.iter().map(|s| s.translate(by)))
    }

    /// Vector sum `{a + b | a in self, b in other}`.
    ///
    /// For two convex pieces the sum is the hull of all pairwise vertex sums, i.e. the
    /// union of `other` translated to every boundary point of `self`.
    pub fn minkowski_sum(&self, other: &Region) -> Region {
        let mut shapes = Vec::with_capacity(self.shapes.len() * other.shapes.len());
        for a in &self.shapes {
            for b in &other.shapes {
                let sums = a
                    .vertices()
                    .iter()
                    .flat_map(|va| b.vertices().iter().map(move |vb| *va + *vb));
                shapes.extend(Shape::from_points(sums));
            }
        }
        // sums of split members repeat and nest, keep only the outermost pieces
        Self {
            shapes: without_covered(shapes),
        }
    }
}

/// Drops every piece that another piece covers. The first of two equal pieces is kept.
fn without_covered(shapes: Vec<Shape>) -> Vec<Shape> {
    let mut kept: Vec<Shape> = Vec::with_capacity(shapes.len());
    for shape in shapes {
        if kept.iter().any(|k| k.covers(&shape)) {
            continue;
        }
        kept.retain(|k| !shape.covers(k));
        kept.push(shape);
    }
    kept
}

fn disc_vertices(radius: f64, segments: usize) -> Vec<Point> {
    let n = segments.max(4).div_ceil(4) * 4;
    (0..n)
        .map(|k| {
            let angle = TAU * k as f64 / n as f64;
            Point::new(radius * angle.cos(), radius * angle.sin())
        })
        .collect()
}

fn edges(v: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = v.len();
    (0..n).map(move |i| (v[i], v[(i + 1) % n]))
}

fn convex_hull(sorted: &[Point]) -> Vec<Point> {
    let turn = |o: Point, a: Point, b: Point| (a - o).cross(b - o);

    let mut lower: Vec<Point> = Vec::with_capacity(sorted.len());
    for &pt in sorted {
        while lower.len() >= 2 && turn(lower[lower.len() - 2], lower[lower.len() - 1], pt) <= 0.0 {
            lower.pop();
        }
        lower.push(pt);
    }
    let mut upper: Vec<Point> = Vec::with_capacity(sorted.len());
    for &pt in sorted.iter().rev() {
        while upper.len() >= 2 && turn(upper[upper.len() - 2], upper[upper.len() - 1], pt) <= 0.0 {
            upper.pop();
        }
        upper.push(pt);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn polygon_area(v: &[Point]) -> f64 {
    edges(v).map(|(a, b)| a.cross(b)).sum::<f64>().abs() / 2.0
}

fn farthest_pair(v: &[Point]) -> (Point, Point) {
    let mut best = (v[0], v[0], 0.0);
    for (i, a) in v.iter().enumerate() {
        for b in &v[i + 1..] {
            let d = a.distance(*b);
            if d > best.2 {
                best = (*a, *b, d);
            }
        }
    }
    (best.0, best.1)
}

fn closest_on_segment(a: Point, b: Point, target: Point) -> Point {
    let d = b - a;
    let len2 = d.dot(d);
    if len2 == 0.0 {
        return a;
    }
    let t = ((target - a).dot(d) / len2).clamp(0.0, 1.0);
    a + d * t
}

fn cmp_distance(a: &Point, b: &Point, target: Point) -> Ordering {
    a.distance(target).total_cmp(&b.distance(target))
}
