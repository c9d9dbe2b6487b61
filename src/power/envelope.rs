//! # Power envelope
//!
//! The feasible (P, Q) region of one storage device or of a whole cluster. It starts as
//! the disc of the rated apparent power and only ever shrinks through limitations until
//! the owner resets it.

use serde::{Deserialize, Serialize};

use super::error::PowerError;
use super::geometry::{Constraint, Point, Region};
use super::limitation::{Limitation, CIRCLE_SEGMENTS};
use super::render::DebugShape;

/// Extreme active and reactive power of a region.
///
/// Taken from the region's vertices: all four are `Some` for any non-empty region, and a
/// point or line region reports equal min and max on the collapsed axis instead of `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub min_p: Option<f64>,
    pub max_p: Option<f64>,
    pub min_q: Option<f64>,
    pub max_q: Option<f64>,
}

impl Bounds {
    fn of(region: &Region) -> Self {
        match region.extent() {
            Some(e) => Self {
                min_p: Some(e.min_p),
                max_p: Some(e.max_p),
                min_q: Some(e.min_q),
                max_q: Some(e.max_q),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PowerEnvelope {
    max_apparent_power: f64,
    region: Region,
    bounds: Bounds,
}

impl PowerEnvelope {
    /// Disc of `rated_apparent_power` around the origin
    pub fn new(rated_apparent_power: f64) -> Result<Self, PowerError> {
        if !rated_apparent_power.is_finite() || rated_apparent_power <= 0.0 {
            return Err(PowerError::InvalidRating(rated_apparent_power));
        }
        Ok(Self::from_region(
            Region::disc(rated_apparent_power, CIRCLE_SEGMENTS),
            rated_apparent_power,
        ))
    }

    /// Envelope over an already computed region, e.g. a cluster aggregate
    pub fn from_region(region: Region, max_apparent_power: f64) -> Self {
        let bounds = Bounds::of(&region);
        Self {
            max_apparent_power,
            region,
            bounds,
        }
    }

    pub fn max_apparent_power(&self) -> f64 {
        self.max_apparent_power
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Intersection of the current region with `constraint`; does not mutate
    pub fn intersect(&self, constraint: &Constraint) -> Region {
        self.region.intersect(constraint)
    }

    /// Narrows the region through `limitation`.
    ///
    /// On error the previous region stays in place.
    pub fn apply_limitation(&mut self, limitation: &mut Limitation) -> Result<(), PowerError> {
        let narrowed = limitation.apply(&self.region, self.max_apparent_power)?;
        if narrowed.is_empty() {
            return Err(PowerError::Feasibility(format!(
                "{limitation}: no feasible point left"
            )));
        }
        self.replace_region(narrowed);
        Ok(())
    }

    /// Replaces the region wholesale, e.g. when resetting to the base region
    pub fn replace_region(&mut self, region: Region) {
        self.bounds = Bounds::of(&region);
        self.region = region;
    }

    /// Closest feasible point to `target`
    pub fn nearest_point_to(&self, target: Point) -> Option<Point> {
        self.region.nearest_point(target)
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn render(&self) -> DebugShape {
        DebugShape::from_region(&self.region)
    }
}
