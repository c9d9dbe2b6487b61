/// Power Envelope Engine
///
/// Feasible (active power, reactive power) regions of storage systems, the limitations
/// that narrow them and the geometry underneath.

pub mod envelope;
pub mod error;
pub mod geometry;
pub mod limitation;
pub mod render;

pub use envelope::{Bounds, PowerEnvelope};
pub use error::PowerError;
pub use geometry::{Constraint, HalfPlane, Line, Point, Region, Shape};
pub use limitation::{CurvePoint, Limitation, LimitationKind, PiecewiseCurve};
pub use render::DebugShape;
