//! # Device Dispatcher
//!
//! Owns the power envelope of one storage device. The base region (rating plus static
//! limitations) is rebuilt whenever a static limitation changes; every control cycle
//! starts from it and dynamic limitations narrow it until the dispatch point is taken.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::controller::smoothing::SetpointSmoother;
use crate::domain::{EssMeasurements, Setpoint};
use crate::power::limitation::CIRCLE_SEGMENTS;
use crate::power::{Bounds, DebugShape, Limitation, LimitationKind, Point, PowerEnvelope, PowerError, Region};

/// Dispatcher shared between the cluster aggregator and the control loop
pub type SharedDevice = Arc<Mutex<DeviceDispatcher>>;

/// Handle of a registered static limitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimitationId(usize);

impl fmt::Display for LimitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct DeviceDispatcher {
    id: String,
    envelope: PowerEnvelope,
    base: Region,
    static_limitations: Vec<(LimitationId, Limitation)>,
    dynamic_limitations: Vec<Limitation>,
    next_limitation_id: usize,
    smoother: SetpointSmoother,
    measurements: EssMeasurements,
    last_setpoint: Option<Setpoint>,
}

impl DeviceDispatcher {
    pub fn new(
        id: impl Into<String>,
        rated_apparent_power: f64,
        config: &EngineConfig,
    ) -> Result<Self, PowerError> {
        let envelope = PowerEnvelope::new(rated_apparent_power)?;
        Ok(Self {
            id: id.into(),
            base: envelope.region().clone(),
            envelope,
            static_limitations: Vec::new(),
            dynamic_limitations: Vec::new(),
            next_limitation_id: 0,
            smoother: SetpointSmoother::new(config.smoothing.clone()),
            measurements: EssMeasurements::default(),
            last_setpoint: None,
        })
    }

    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rated_apparent_power(&self) -> f64 {
        self.envelope.max_apparent_power()
    }

    /// Swaps the rating; the base region is rebuilt from the new disc
    pub fn set_rated_apparent_power(&mut self, rated_apparent_power: f64) -> Result<(), PowerError> {
        self.envelope = PowerEnvelope::new(rated_apparent_power)?;
        self.rebuild_base();
        Ok(())
    }

    pub fn add_static_limitation(&mut self, limitation: Limitation) -> LimitationId {
        let id = LimitationId(self.next_limitation_id);
        self.next_limitation_id += 1;
        self.static_limitations.push((id, limitation));
        self.rebuild_base();
        id
    }

    pub fn remove_static_limitation(&mut self, id: LimitationId) -> Result<Limitation, PowerError> {
        let index = self.static_index(id)?;
        let (_, removed) = self.static_limitations.remove(index);
        self.rebuild_base();
        Ok(removed)
    }

    /// Replaces the constraint behind `id`; returns whether the base region was rebuilt
    pub fn update_static_limitation(&mut self, id: LimitationId, kind: LimitationKind) -> Result<bool, PowerError> {
        let index = self.static_index(id)?;
        let changed = self.static_limitations[index].1.set_kind(kind);
        if changed {
            self.rebuild_base();
        }
        Ok(changed)
    }

    /// Replaces the primary value behind `id`; returns whether the base region was rebuilt
    pub fn set_static_limitation_value(&mut self, id: LimitationId, value: f64) -> Result<bool, PowerError> {
        let index = self.static_index(id)?;
        let changed = self.static_limitations[index].1.set_value(value);
        if changed {
            self.rebuild_base();
        }
        Ok(changed)
    }

    pub fn static_limitation(&self, id: LimitationId) -> Option<&Limitation> {
        self.static_limitations
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, limitation)| limitation)
    }

    pub fn static_limitations(&self) -> impl Iterator<Item = &Limitation> {
        self.static_limitations.iter().map(|(_, limitation)| limitation)
    }

    fn static_index(&self, id: LimitationId) -> Result<usize, PowerError> {
        self.static_limitations
            .iter()
            .position(|(candidate, _)| *candidate == id)
            .ok_or_else(|| PowerError::UnknownLimitation(format!("{} on {}", id, self.id)))
    }

    fn rebuild_base(&mut self) {
        let rated = self.envelope.max_apparent_power();
        let mut base = PowerEnvelope::from_region(
            Region::disc(rated, CIRCLE_SEGMENTS),
            rated,
        );
        for (_, limitation) in self.static_limitations.iter_mut() {
            if let Err(e) = base.apply_limitation(limitation) {
                warn!(device = %self.id, limitation = %limitation, error = %e, "skipping static limitation");
            }
        }
        self.base = base.region().clone();

        // Limitations already applied this cycle stay in force on the new base
        self.envelope = base;
        let dynamic = std::mem::take(&mut self.dynamic_limitations);
        for limitation in dynamic {
            if let Err(e) = self.apply_limitation(limitation.clone()) {
                warn!(device = %self.id, limitation = %limitation, error = %e, "dropping dynamic limitation after rebuild");
            }
        }
    }

    /// Discards the previous cycle's dynamic limitations
    pub fn begin_cycle(&mut self) {
        self.dynamic_limitations.clear();
        self.envelope.replace_region(self.base.clone());
    }

    /// Narrows the current region for this cycle.
    ///
    /// Returns the limitation as applied, with any relaxed target value. On error the
    /// region is left untouched.
    pub fn apply_limitation(&mut self, mut limitation: Limitation) -> Result<Limitation, PowerError> {
        self.envelope.apply_limitation(&mut limitation)?;
        debug!(device = %self.id, limitation = %limitation, "limitation applied");
        self.dynamic_limitations.push(limitation.clone());
        Ok(limitation)
    }

    pub fn dynamic_limitations(&self) -> &[Limitation] {
        &self.dynamic_limitations
    }

    pub fn envelope(&self) -> &PowerEnvelope {
        &self.envelope
    }

    pub fn region(&self) -> &Region {
        self.envelope.region()
    }

    pub fn base_region(&self) -> &Region {
        &self.base
    }

    pub fn bounds(&self) -> Bounds {
        self.envelope.bounds()
    }

    pub fn render(&self) -> DebugShape {
        self.envelope.render()
    }

    pub fn measurements(&self) -> EssMeasurements {
        self.measurements
    }

    pub fn update_measurements(&mut self, measurements: EssMeasurements) {
        self.measurements = measurements;
    }

    /// Point of the current region closest to zero power
    pub fn dispatch_point(&self) -> Option<Point> {
        self.envelope.nearest_point_to(Point::ORIGIN)
    }

    /// Takes the dispatch point, smooths it and returns the setpoint to write.
    ///
    /// The smoothed point may lag outside the cycle's region but never leaves the base
    /// region.
    pub fn dispatch(&mut self) -> Setpoint {
        let target = self.dispatch_point().unwrap_or_else(|| self.smoother.current());
        let smoothed = self.smoother.step(target);
        let feasible = self.base.nearest_point(smoothed).unwrap_or(smoothed);
        if feasible != smoothed {
            self.smoother.force_to(feasible);
        }

        let setpoint = Setpoint::from(feasible);
        debug!(
            device = %self.id,
            target_p = target.p,
            target_q = target.q,
            active_power = setpoint.active_power,
            reactive_power = setpoint.reactive_power,
            "dispatch"
        );
        self.last_setpoint = Some(setpoint);
        setpoint
    }

    pub fn last_setpoint(&self) -> Option<Setpoint> {
        self.last_setpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(rated: f64) -> DeviceDispatcher {
        DeviceDispatcher::new("ess-1", rated, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_rating() {
        let err = DeviceDispatcher::new("ess-1", 0.0, &EngineConfig::default()).unwrap_err();
        assert_eq!(err, PowerError::InvalidRating(0.0));
    }

    #[test]
    fn test_rate_limited_dispatch() {
        let mut d = dispatcher(10_000.0);

        d.begin_cycle();
        d.apply_limitation(Limitation::active_power_equals("target", 1_000.0)).unwrap();
        assert!((d.dispatch().active_power - 500.0).abs() < 1e-6);

        d.begin_cycle();
        d.apply_limitation(Limitation::active_power_equals("target", 1_000.0)).unwrap();
        assert!((d.dispatch().active_power - 750.0).abs() < 1e-6);
        assert!(d.last_setpoint().unwrap().reactive_power.abs() < 1e-6);
    }

    #[test]
    fn test_begin_cycle_drops_dynamic_limitations() {
        let mut d = dispatcher(1_000.0);
        d.apply_limitation(Limitation::new("floor", LimitationKind::ActivePowerAtLeast { value: 200.0 }))
            .unwrap();
        assert_eq!(d.bounds().min_p.map(f64::round), Some(200.0));
        assert_eq!(d.dynamic_limitations().len(), 1);

        d.begin_cycle();
        assert!(d.dynamic_limitations().is_empty());
        assert!(d.bounds().min_p.unwrap() < -999.0);
    }

    #[test]
    fn test_static_limitation_shapes_base() {
        let mut d = dispatcher(1_000.0);
        let id = d.add_static_limitation(Limitation::new("export cap", LimitationKind::ActivePowerAtMost { value: 300.0 }));
        assert!((d.bounds().max_p.unwrap() - 300.0).abs() < 1e-6);

        assert!(d.set_static_limitation_value(id, 400.0).unwrap());
        assert!(!d.set_static_limitation_value(id, 400.0).unwrap());
        assert!((d.bounds().max_p.unwrap() - 400.0).abs() < 1e-6);

        d.begin_cycle();
        assert!((d.bounds().max_p.unwrap() - 400.0).abs() < 1e-6);

        let removed = d.remove_static_limitation(id).unwrap();
        assert_eq!(removed.name, "export cap");
        assert!(d.bounds().max_p.unwrap() > 999.0);
        assert!(matches!(
            d.remove_static_limitation(id),
            Err(PowerError::UnknownLimitation(_))
        ));
    }

    #[test]
    fn test_infeasible_static_limitation_is_skipped() {
        let mut d = dispatcher(1_000.0);
        d.add_static_limitation(Limitation::new("floor", LimitationKind::ActivePowerAtLeast { value: 5_000.0 }));
        assert_eq!(d.static_limitations().count(), 1);
        assert!(d.bounds().max_p.unwrap() > 999.0);
    }

    #[test]
    fn test_infeasible_dynamic_limitation_propagates() {
        let mut d = dispatcher(1_000.0);
        let before = d.region().clone();
        let err = d
            .apply_limitation(Limitation::new("ceiling", LimitationKind::ActivePowerAtMost { value: -5_000.0 }))
            .unwrap_err();
        assert!(err.is_feasibility());
        assert_eq!(d.region(), &before);
        assert!(d.dynamic_limitations().is_empty());
    }

    #[test]
    fn test_relaxed_value_is_returned() {
        let mut d = dispatcher(1_000.0);
        let applied = d.apply_limitation(Limitation::active_power_equals("target", 2_000.0)).unwrap();
        let value = applied.value().unwrap();
        assert!(value <= 1_000.0 + 1e-6);
        assert!(value > 990.0);
    }

    #[test]
    fn test_rebuild_keeps_dynamic_limitations() {
        let mut d = dispatcher(1_000.0);
        d.apply_limitation(Limitation::active_power_equals("target", 100.0)).unwrap();
        d.add_static_limitation(Limitation::reactive_power_at_most("q cap", 50.0));
        let bounds = d.bounds();
        assert!((bounds.min_p.unwrap() - 100.0).abs() < 1e-6);
        assert!((bounds.max_q.unwrap() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_dispatch_stays_in_base_region() {
        let mut d = dispatcher(1_000.0);
        d.apply_limitation(Limitation::active_power_equals("target", 800.0)).unwrap();
        d.dispatch();
        d.set_rated_apparent_power(200.0).unwrap();
        d.begin_cycle();
        let setpoint = d.dispatch();
        assert!(setpoint.apparent_power() <= 200.0 + 1e-6);
    }
}
