//! # Limitations
//!
//! Named constraints that narrow a feasible region. Equality limitations relax to the
//! nearest feasible value when their line misses the region; bound limitations never
//! relax and report a feasibility error instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::IntoStaticStr;
use tracing::debug;

use super::error::PowerError;
use super::geometry::{Constraint, HalfPlane, Line, Point, Region, EPSILON};

/// Vertex count used for apparent power discs
pub const CIRCLE_SEGMENTS: usize = 64;

/// One support point of a power factor characteristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub active_power: f64,
    pub cos_phi: f64,
}

/// cos φ as a function of active power, linear between support points and flat outside
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct PiecewiseCurve {
    points: Vec<CurvePoint>,
}

impl PiecewiseCurve {
    pub fn new(mut points: Vec<CurvePoint>) -> Self {
        points.sort_by(|a, b| a.active_power.total_cmp(&b.active_power));
        Self { points }
    }

    pub fn cos_phi_at(&self, active_power: f64) -> Option<f64> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        if active_power <= first.active_power {
            return Some(first.cos_phi);
        }
        if active_power >= last.active_power {
            return Some(last.cos_phi);
        }
        self.points.windows(2).find_map(|w| {
            let (a, b) = (w[0], w[1]);
            if active_power > b.active_power {
                return None;
            }
            let span = b.active_power - a.active_power;
            if span <= 0.0 {
                return Some(b.cos_phi);
            }
            let t = (active_power - a.active_power) / span;
            Some(a.cos_phi + (b.cos_phi - a.cos_phi) * t)
        })
    }
}

impl From<Vec<CurvePoint>> for PiecewiseCurve {
    fn from(points: Vec<CurvePoint>) -> Self {
        Self::new(points)
    }
}

impl From<PiecewiseCurve> for Vec<CurvePoint> {
    fn from(curve: PiecewiseCurve) -> Self {
        curve.points
    }
}

/// Constraint variants with their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LimitationKind {
    /// `P = value`
    ActivePowerEquals { value: f64 },
    /// `Q = value`
    ReactivePowerEquals { value: f64 },
    ActivePowerAtMost { value: f64 },
    ActivePowerAtLeast { value: f64 },
    ReactivePowerAtMost { value: f64 },
    ReactivePowerAtLeast { value: f64 },
    /// `sqrt(P² + Q²) <= value`
    ApparentPowerAtMost { value: f64 },
    /// `P <= from or P >= to`
    ActivePowerExcluded { from: f64, to: f64 },
    /// `Q = ±tan(acos(cos_phi)) · P`, positive sign when inductive
    PowerFactor { cos_phi: f64, inductive: bool },
    /// Power factor looked up from a characteristic at a reference active power
    PowerFactorCurve {
        curve: PiecewiseCurve,
        inductive: bool,
        reference_active_power: f64,
    },
}

impl LimitationKind {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    fn is_equality(&self) -> bool {
        matches!(
            self,
            LimitationKind::ActivePowerEquals { .. }
                | LimitationKind::ReactivePowerEquals { .. }
                | LimitationKind::PowerFactor { .. }
                | LimitationKind::PowerFactorCurve { .. }
        )
    }
}

/// A named constraint attached to one envelope owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    pub name: String,
    #[serde(flatten)]
    kind: LimitationKind,
}

impl Limitation {
    pub fn new(name: impl Into<String>, kind: LimitationKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn active_power_equals(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, LimitationKind::ActivePowerEquals { value })
    }

    pub fn reactive_power_equals(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, LimitationKind::ReactivePowerEquals { value })
    }

    pub fn reactive_power_at_most(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, LimitationKind::ReactivePowerAtMost { value })
    }

    pub fn kind(&self) -> &LimitationKind {
        &self.kind
    }

    pub fn is_equality(&self) -> bool {
        self.kind.is_equality()
    }

    /// The primary parameter: the bound or target value, cos φ, or the curve's reference power
    pub fn value(&self) -> Option<f64> {
        match &self.kind {
            LimitationKind::ActivePowerEquals { value }
            | LimitationKind::ReactivePowerEquals { value }
            | LimitationKind::ActivePowerAtMost { value }
            | LimitationKind::ActivePowerAtLeast { value }
            | LimitationKind::ReactivePowerAtMost { value }
            | LimitationKind::ReactivePowerAtLeast { value }
            | LimitationKind::ApparentPowerAtMost { value } => Some(*value),
            LimitationKind::PowerFactor { cos_phi, .. } => Some(*cos_phi),
            LimitationKind::PowerFactorCurve {
                reference_active_power,
                ..
            } => Some(*reference_active_power),
            LimitationKind::ActivePowerExcluded { .. } => None,
        }
    }

    /// Replaces the primary parameter. Returns whether anything changed so the owner
    /// knows to rebuild regions derived from it.
    pub fn set_value(&mut self, new_value: f64) -> bool {
        let slot = match &mut self.kind {
            LimitationKind::ActivePowerEquals { value }
            | LimitationKind::ReactivePowerEquals { value }
            | LimitationKind::ActivePowerAtMost { value }
            | LimitationKind::ActivePowerAtLeast { value }
            | LimitationKind::ReactivePowerAtMost { value }
            | LimitationKind::ReactivePowerAtLeast { value }
            | LimitationKind::ApparentPowerAtMost { value } => value,
            LimitationKind::PowerFactor { cos_phi, .. } => cos_phi,
            LimitationKind::PowerFactorCurve {
                reference_active_power,
                ..
            } => reference_active_power,
            LimitationKind::ActivePowerExcluded { .. } => return false,
        };
        if *slot == new_value {
            return false;
        }
        *slot = new_value;
        true
    }

    /// Replaces the whole constraint. Returns whether anything changed.
    pub fn set_kind(&mut self, kind: LimitationKind) -> bool {
        if self.kind == kind {
            return false;
        }
        self.kind = kind;
        true
    }

    /// Narrows `region`.
    ///
    /// `max_apparent_power` is the owner's rating; lines and bands are bounded to a frame
    /// one unit wider than it. Equality kinds relax when their line misses the region and
    /// only fail for an already empty region. A relaxed P or Q target replaces the stored
    /// value until the caller sets a new one.
    pub fn apply(&mut self, region: &Region, max_apparent_power: f64) -> Result<Region, PowerError> {
        let name = self.name.as_str();
        if region.is_empty() {
            return Err(PowerError::Feasibility(format!(
                "{name}: region is already empty"
            )));
        }
        let frame = max_apparent_power.abs() + 1.0;

        match &mut self.kind {
            LimitationKind::ActivePowerEquals { value } => {
                let (result, anchor) = equal_or_relax(name, region, Line::vertical(*value), frame)?;
                if let Some(anchor) = anchor {
                    debug!(limitation = name, requested = *value, relaxed = anchor.p, "relaxed active power");
                    *value = anchor.p;
                }
                Ok(result)
            }
            LimitationKind::ReactivePowerEquals { value } => {
                let (result, anchor) =
                    equal_or_relax(name, region, Line::horizontal(*value), frame)?;
                if let Some(anchor) = anchor {
                    debug!(limitation = name, requested = *value, relaxed = anchor.q, "relaxed reactive power");
                    *value = anchor.q;
                }
                Ok(result)
            }
            LimitationKind::ActivePowerAtMost { value } => bound(
                name,
                region,
                Constraint::Rectangle {
                    min_p: -frame,
                    max_p: *value,
                    min_q: -frame,
                    max_q: frame,
                },
            ),
            LimitationKind::ActivePowerAtLeast { value } => bound(
                name,
                region,
                Constraint::Rectangle {
                    min_p: *value,
                    max_p: frame,
                    min_q: -frame,
                    max_q: frame,
                },
            ),
            LimitationKind::ReactivePowerAtMost { value } => bound(
                name,
                region,
                Constraint::Rectangle {
                    min_p: -frame,
                    max_p: frame,
                    min_q: -frame,
                    max_q: *value,
                },
            ),
            LimitationKind::ReactivePowerAtLeast { value } => bound(
                name,
                region,
                Constraint::Rectangle {
                    min_p: -frame,
                    max_p: frame,
                    min_q: *value,
                    max_q: frame,
                },
            ),
            LimitationKind::ApparentPowerAtMost { value } => {
                if !value.is_finite() || *value < 0.0 {
                    return Err(PowerError::InvalidParameter(format!(
                        "{name}: apparent power limit {value}"
                    )));
                }
                if *value <= EPSILON {
                    return if region.contains(Point::ORIGIN) {
                        Ok(Region::point(Point::ORIGIN))
                    } else {
                        Err(PowerError::Feasibility(format!(
                            "{name}: zero apparent power excluded by the region"
                        )))
                    };
                }
                bound(
                    name,
                    region,
                    Constraint::Disc {
                        radius: *value,
                        segments: CIRCLE_SEGMENTS,
                    },
                )
            }
            LimitationKind::ActivePowerExcluded { from, to } => {
                let (low, high) = if from <= to { (*from, *to) } else { (*to, *from) };
                let framed = region.intersect(&Constraint::Rectangle {
                    min_p: -frame,
                    max_p: frame,
                    min_q: -frame,
                    max_q: frame,
                });
                bound(
                    name,
                    &framed,
                    Constraint::Either(HalfPlane::p_at_most(low), HalfPlane::p_at_least(high)),
                )
            }
            LimitationKind::PowerFactor { cos_phi, inductive } => {
                let line = power_factor_line(name, *cos_phi, *inductive)?;
                equal_or_relax(name, region, line, frame).map(|(result, _)| result)
            }
            LimitationKind::PowerFactorCurve {
                curve,
                inductive,
                reference_active_power,
            } => match curve.cos_phi_at(*reference_active_power) {
                Some(cos_phi) => {
                    let line = power_factor_line(name, cos_phi, *inductive)?;
                    equal_or_relax(name, region, line, frame).map(|(result, _)| result)
                }
                None => Ok(region.clone()),
            },
        }
    }
}

impl fmt::Display for Limitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{} ({} {})", self.name, self.kind.name(), value),
            None => write!(f, "{} ({})", self.name, self.kind.name()),
        }
    }
}

fn framed_line(region: &Region, line: &Line, frame: f64) -> Region {
    region.intersect_line(line).intersect(&Constraint::Rectangle {
        min_p: -frame,
        max_p: frame,
        min_q: -frame,
        max_q: frame,
    })
}

/// Intersects `region` with `line`. When that is empty the line is shifted parallel through
/// the closest feasible point, looking first at the part of the region below the line.
/// Returns the point the line was shifted through, if any.
fn equal_or_relax(
    name: &str,
    region: &Region,
    line: Line,
    frame: f64,
) -> Result<(Region, Option<Point>), PowerError> {
    let direct = framed_line(region, &line, frame);
    if !direct.is_empty() {
        return Ok((direct, None));
    }

    // TODO: no mirrored search above the line; confirm with product owner whether the
    // upper side should be tried first when raising the target would help
    let below = region.clip(&HalfPlane::below(line));
    let anchor = if below.is_empty() {
        region.nearest_point_to_line(&line)
    } else {
        below.nearest_point_to_line(&line)
    }
    .ok_or_else(|| PowerError::Feasibility(format!("{name}: no feasible point")))?;

    let relaxed = framed_line(region, &line.shifted_through(anchor), frame);
    if relaxed.is_empty() {
        // rounding missed the shifted line, the anchor itself is feasible
        return Ok((Region::point(anchor), Some(anchor)));
    }
    Ok((relaxed, Some(anchor)))
}

fn bound(name: &str, region: &Region, constraint: Constraint) -> Result<Region, PowerError> {
    let result = region.intersect(&constraint);
    if result.is_empty() {
        return Err(PowerError::Feasibility(format!(
            "{name}: bound excludes the whole feasible region"
        )));
    }
    Ok(result)
}

fn power_factor_line(name: &str, cos_phi: f64, inductive: bool) -> Result<Line, PowerError> {
    if !(cos_phi > 0.0 && cos_phi <= 1.0) {
        return Err(PowerError::InvalidParameter(format!(
            "{name}: cos phi {cos_phi} outside (0, 1]"
        )));
    }
    let tan_phi = (1.0 - cos_phi * cos_phi).sqrt() / cos_phi;
    let slope = if inductive { tan_phi } else { -tan_phi };
    Ok(Line::through_origin(slope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::geometry::Shape;

    const RATED: f64 = 100_000.0;

    fn disc() -> Region {
        Region::disc(RATED, CIRCLE_SEGMENTS)
    }

    #[test]
    fn test_reactive_equality_collapses_to_line() {
        let mut limitation = Limitation::reactive_power_equals("q", -1100.0);
        let region = limitation.apply(&disc(), RATED).unwrap();
        let extent = region.extent().unwrap();
        assert!((extent.min_q + 1100.0).abs() < 1e-6);
        assert!((extent.max_q + 1100.0).abs() < 1e-6);
        assert_eq!(limitation.value(), Some(-1100.0));
    }

    #[test]
    fn test_reactive_equality_relaxes_to_edge() {
        let mut limitation = Limitation::reactive_power_equals("q", -250_000.0);
        let region = limitation.apply(&disc(), RATED).unwrap();
        assert!(!region.is_empty());
        let relaxed = limitation.value().unwrap();
        assert!((relaxed + RATED).abs() < 1e-6, "relaxed to {relaxed}");
    }

    #[test]
    fn test_reactive_equality_relaxes_from_below() {
        let base = disc()
            .intersect(&Constraint::HalfPlane(HalfPlane::q_at_least(-1000.0)))
            .intersect(&Constraint::HalfPlane(HalfPlane::q_at_most(1000.0)));
        let mut limitation = Limitation::reactive_power_equals("q", 5000.0);
        let region = limitation.apply(&base, RATED).unwrap();
        assert!(!region.is_empty());
        assert!((limitation.value().unwrap() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_equality_is_idempotent() {
        let mut limitation = Limitation::reactive_power_equals("q", -1100.0);
        let once = limitation.apply(&disc(), RATED).unwrap();
        let twice = limitation.apply(&disc(), RATED).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_reactive_bound_fails_when_excluding_region() {
        let base = disc()
            .intersect(&Constraint::HalfPlane(HalfPlane::q_at_least(-1000.0)));
        let mut limitation = Limitation::reactive_power_at_most("q max", -5000.0);
        let err = limitation.apply(&base, RATED).unwrap_err();
        assert!(err.is_feasibility());
        assert_eq!(limitation.value(), Some(-5000.0));
    }

    #[test]
    fn test_active_bounds_narrow_region() {
        let mut at_most = Limitation::new("discharge", LimitationKind::ActivePowerAtMost { value: 3000.0 });
        let mut at_least = Limitation::new("charge", LimitationKind::ActivePowerAtLeast { value: -2000.0 });
        let region = at_most.apply(&disc(), RATED).unwrap();
        let region = at_least.apply(&region, RATED).unwrap();
        let extent = region.extent().unwrap();
        assert!((extent.max_p - 3000.0).abs() < 1e-6);
        assert!((extent.min_p + 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_apparent_power_limit() {
        let mut limitation =
            Limitation::new("smax", LimitationKind::ApparentPowerAtMost { value: 5000.0 });
        let region = limitation.apply(&disc(), RATED).unwrap();
        let extent = region.extent().unwrap();
        assert!(extent.max_p <= 5000.0 + 1e-6);
        assert!(extent.max_p > 4900.0);

        let mut zero = Limitation::new("off", LimitationKind::ApparentPowerAtMost { value: 0.0 });
        let region = zero.apply(&disc(), RATED).unwrap();
        assert_eq!(region, Region::point(Point::ORIGIN));
    }

    #[test]
    fn test_excluded_band_splits_region() {
        let mut limitation = Limitation::new(
            "band",
            LimitationKind::ActivePowerExcluded {
                from: -500.0,
                to: 500.0,
            },
        );
        let region = limitation.apply(&disc(), RATED).unwrap();
        assert_eq!(region.shapes().len(), 2);
        let nearest = region.nearest_point(Point::ORIGIN).unwrap();
        assert!((nearest.p.abs() - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_power_factor_line() {
        let mut limitation = Limitation::new(
            "cos phi",
            LimitationKind::PowerFactor {
                cos_phi: 0.8,
                inductive: true,
            },
        );
        let region = limitation.apply(&disc(), RATED).unwrap();
        for v in region.vertices() {
            assert!((v.q - 0.75 * v.p).abs() < 1e-3);
        }
        assert!(matches!(region.shapes()[0], Shape::Segment(_)));
    }

    #[test]
    fn test_power_factor_rejects_invalid_cos_phi() {
        let mut limitation = Limitation::new(
            "cos phi",
            LimitationKind::PowerFactor {
                cos_phi: 1.5,
                inductive: false,
            },
        );
        assert!(matches!(
            limitation.apply(&disc(), RATED),
            Err(PowerError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_curve_interpolation() {
        let curve = PiecewiseCurve::new(vec![
            CurvePoint { active_power: 10_000.0, cos_phi: 0.9 },
            CurvePoint { active_power: 0.0, cos_phi: 1.0 },
        ]);
        assert_eq!(curve.cos_phi_at(-5.0), Some(1.0));
        assert_eq!(curve.cos_phi_at(20_000.0), Some(0.9));
        let mid = curve.cos_phi_at(5_000.0).unwrap();
        assert!((mid - 0.95).abs() < 1e-9);
        assert_eq!(PiecewiseCurve::default().cos_phi_at(0.0), None);
    }

    #[test]
    fn test_set_value_reports_change() {
        let mut limitation = Limitation::reactive_power_at_most("q", 10.0);
        assert!(!limitation.set_value(10.0));
        assert!(limitation.set_value(20.0));
        assert_eq!(limitation.value(), Some(20.0));

        let mut band = Limitation::new("band", LimitationKind::ActivePowerExcluded { from: 0.0, to: 1.0 });
        assert!(!band.set_value(5.0));
        assert!(band.set_kind(LimitationKind::ActivePowerExcluded { from: 0.0, to: 2.0 }));
    }

    #[test]
    fn test_empty_region_is_infeasible() {
        let mut limitation = Limitation::reactive_power_equals("q", 0.0);
        assert!(limitation.apply(&Region::empty(), RATED).unwrap_err().is_feasibility());
    }

    #[test]
    fn test_limitation_display_and_serde() {
        let limitation = Limitation::reactive_power_at_most("q max", 1000.0);
        assert_eq!(limitation.to_string(), "q max (reactive_power_at_most 1000)");
        let json = serde_json::to_value(&limitation).unwrap();
        assert_eq!(json["kind"], "reactive_power_at_most");
        assert_eq!(json["value"], 1000.0);
    }
}
