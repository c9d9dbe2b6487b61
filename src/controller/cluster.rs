//! # Cluster Aggregation
//!
//! Treats a set of storage devices as one virtual device. The cluster region is the
//! Minkowski sum of the member regions, narrowed by the cluster's own limitations.
//! The dispatch point of that region is split across the members as per-member
//! equality limitations: active power weighted by usable state of charge, reactive
//! power by nominal power.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::dispatcher::SharedDevice;
use crate::power::geometry::EPSILON;
use crate::power::{Bounds, DebugShape, Limitation, Point, PowerEnvelope, PowerError, Region};

/// Share of the cluster dispatch point assigned to one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberAssignment {
    pub device_id: String,
    pub active_power: f64,
    pub reactive_power: f64,
    /// Set when the member rejected its share; its previous setpoint stands
    pub error: Option<String>,
}

/// Result of one [`ClusterAggregator::set_power`] call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub cluster_id: String,
    pub target: Point,
    pub assignments: Vec<MemberAssignment>,
    pub computed_at: DateTime<Utc>,
}

impl Allocation {
    pub fn assignment(&self, device_id: &str) -> Option<&MemberAssignment> {
        self.assignments.iter().find(|a| a.device_id == device_id)
    }

    pub fn failed_members(&self) -> impl Iterator<Item = &MemberAssignment> {
        self.assignments.iter().filter(|a| a.error.is_some())
    }

    /// Sum of the assigned (P, Q) over members that accepted their share
    pub fn total(&self) -> Point {
        self.assignments
            .iter()
            .filter(|a| a.error.is_none())
            .fold(Point::ORIGIN, |acc, a| {
                acc + Point::new(a.active_power, a.reactive_power)
            })
    }
}

/// Aggregated readings of all members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub member_count: usize,
    /// Capacity-weighted state of charge (%)
    pub soc: Option<f64>,
    pub active_power: f64,
    pub reactive_power: f64,
    pub rated_apparent_power: f64,
}

#[derive(Debug)]
struct ClusterState {
    static_limitations: Vec<Limitation>,
    dynamic_limitations: Vec<Limitation>,
    base: Region,
    envelope: PowerEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Active,
    Reactive,
}

impl Axis {
    fn limitation(self, cluster_id: &str, value: f64) -> Limitation {
        match self {
            Axis::Active => Limitation::active_power_equals(format!("{cluster_id} active power share"), value),
            Axis::Reactive => Limitation::reactive_power_equals(format!("{cluster_id} reactive power share"), value),
        }
    }

    /// Largest magnitude the member can take in the direction of the target's sign
    fn cap(self, bounds: &Bounds, positive: bool) -> f64 {
        let (low, high) = match self {
            Axis::Active => (bounds.min_p, bounds.max_p),
            Axis::Reactive => (bounds.min_q, bounds.max_q),
        };
        if positive {
            high.unwrap_or(0.0).max(0.0)
        } else {
            low.unwrap_or(0.0).min(0.0)
        }
    }

    fn assign(self, assignment: &mut MemberAssignment, value: f64) {
        match self {
            Axis::Active => assignment.active_power = value,
            Axis::Reactive => assignment.reactive_power = value,
        }
    }
}

struct Candidate {
    index: usize,
    device: SharedDevice,
    weight: f64,
    cap: f64,
}

pub struct ClusterAggregator {
    id: String,
    members: Mutex<Vec<SharedDevice>>,
    state: Mutex<ClusterState>,
}

impl ClusterAggregator {
    /// Cluster without members; its region is the single point at zero power
    pub fn new(id: impl Into<String>) -> Self {
        let base = Region::point(Point::ORIGIN);
        Self {
            id: id.into(),
            members: Mutex::new(Vec::new()),
            state: Mutex::new(ClusterState {
                static_limitations: Vec::new(),
                dynamic_limitations: Vec::new(),
                envelope: PowerEnvelope::from_region(base.clone(), 0.0),
                base,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a member, replacing one with the same id, and re-aggregates
    pub fn add_member(&self, device: SharedDevice) {
        {
            let id = device.lock().id().to_string();
            let mut members = self.members.lock();
            members.retain(|m| m.lock().id() != id);
            members.push(device);
            info!(cluster = %self.id, device = %id, members = members.len(), "member added");
        }
        self.merge_power();
    }

    pub fn remove_member(&self, device_id: &str) -> Result<SharedDevice, PowerError> {
        let removed = {
            let mut members = self.members.lock();
            let index = members
                .iter()
                .position(|m| m.lock().id() == device_id)
                .ok_or_else(|| PowerError::UnknownMember(device_id.to_string()))?;
            members.remove(index)
        };
        info!(cluster = %self.id, device = %device_id, "member removed");
        self.merge_power();
        Ok(removed)
    }

    /// Snapshot of the current membership
    pub fn members(&self) -> Vec<SharedDevice> {
        self.members.lock().clone()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members().iter().map(|m| m.lock().id().to_string()).collect()
    }

    /// Rebuilds the cluster region from the members' current regions.
    ///
    /// Static limitations are applied to the sum, infeasible ones skipped. Dynamic
    /// limitations already applied this cycle are applied again on top.
    pub fn merge_power(&self) {
        let members = self.members();
        let mut region = Region::point(Point::ORIGIN);
        let mut rated = 0.0;
        for member in &members {
            let device = member.lock();
            region = region.minkowski_sum(device.region());
            rated += device.rated_apparent_power();
        }

        let mut state = self.state.lock();
        let mut envelope = PowerEnvelope::from_region(region, rated);
        for limitation in state.static_limitations.iter_mut() {
            if let Err(e) = envelope.apply_limitation(limitation) {
                warn!(cluster = %self.id, limitation = %limitation, error = %e, "skipping static limitation");
            }
        }
        state.base = envelope.region().clone();

        let dynamic = std::mem::take(&mut state.dynamic_limitations);
        for mut limitation in dynamic {
            match envelope.apply_limitation(&mut limitation) {
                Ok(()) => state.dynamic_limitations.push(limitation),
                Err(e) => warn!(cluster = %self.id, limitation = %limitation, error = %e, "dropping dynamic limitation after merge"),
            }
        }
        state.envelope = envelope;
        debug!(cluster = %self.id, members = members.len(), rated_apparent_power = rated, "cluster region merged");
    }

    /// Drops last cycle's cluster limitations and re-aggregates. Members must have
    /// started their cycle first.
    pub fn begin_cycle(&self) {
        self.state.lock().dynamic_limitations.clear();
        self.merge_power();
    }

    /// Narrows the cluster region for this cycle; see [`crate::controller::DeviceDispatcher::apply_limitation`]
    pub fn apply_limitation(&self, mut limitation: Limitation) -> Result<Limitation, PowerError> {
        let mut state = self.state.lock();
        state.envelope.apply_limitation(&mut limitation)?;
        state.dynamic_limitations.push(limitation.clone());
        Ok(limitation)
    }

    pub fn add_static_limitation(&self, limitation: Limitation) {
        self.state.lock().static_limitations.push(limitation);
        self.merge_power();
    }

    pub fn remove_static_limitation(&self, name: &str) -> Result<Limitation, PowerError> {
        let removed = {
            let mut state = self.state.lock();
            let index = state
                .static_limitations
                .iter()
                .position(|l| l.name == name)
                .ok_or_else(|| PowerError::UnknownLimitation(name.to_string()))?;
            state.static_limitations.remove(index)
        };
        self.merge_power();
        Ok(removed)
    }

    pub fn static_limitations(&self) -> Vec<Limitation> {
        self.state.lock().static_limitations.clone()
    }

    pub fn bounds(&self) -> Bounds {
        self.state.lock().envelope.bounds()
    }

    pub fn region(&self) -> Region {
        self.state.lock().envelope.region().clone()
    }

    pub fn base_region(&self) -> Region {
        self.state.lock().base.clone()
    }

    pub fn render(&self) -> DebugShape {
        self.state.lock().envelope.render()
    }

    /// Point of the cluster region closest to zero power, rounded to whole W and var
    pub fn dispatch_point(&self) -> Point {
        let point = self
            .state
            .lock()
            .envelope
            .nearest_point_to(Point::ORIGIN)
            .unwrap_or(Point::ORIGIN);
        Point::new(point.p.round(), point.q.round())
    }

    /// Splits the dispatch point across the members.
    ///
    /// Active power goes first, so every member's reactive capability is taken after its
    /// active power share is fixed. A member rejecting its share is reported in the
    /// allocation and the others continue with what it would have taken.
    pub fn set_power(&self) -> Allocation {
        let target = self.dispatch_point();
        let members = self.members();
        let mut assignments: Vec<MemberAssignment> = members
            .iter()
            .map(|m| MemberAssignment {
                device_id: m.lock().id().to_string(),
                active_power: 0.0,
                reactive_power: 0.0,
                error: None,
            })
            .collect();

        let positive = target.p > 0.0;
        let active = members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let device = member.lock();
                let headroom = device.measurements().usable_headroom();
                // Discharge the fullest most, charge the emptiest most
                let weight = if positive {
                    headroom.clamp(0.0, 100.0)
                } else {
                    (100.0 - headroom).max(0.0)
                };
                Candidate {
                    index,
                    device: member.clone(),
                    weight,
                    cap: Axis::Active.cap(&device.bounds(), positive),
                }
            })
            .sorted_by_key(|c| OrderedFloat(c.weight))
            .collect();
        self.cascade(Axis::Active, active, target.p, &mut assignments);

        let positive = target.q > 0.0;
        let reactive = members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let device = member.lock();
                let nominal = device
                    .measurements()
                    .nominal_power
                    .unwrap_or_else(|| device.rated_apparent_power())
                    .max(0.0);
                Candidate {
                    index,
                    device: member.clone(),
                    weight: nominal,
                    cap: Axis::Reactive.cap(&device.bounds(), positive),
                }
            })
            .sorted_by_key(|c| OrderedFloat(c.weight))
            .collect();
        self.cascade(Axis::Reactive, reactive, target.q, &mut assignments);

        let allocation = Allocation {
            cluster_id: self.id.clone(),
            target,
            assignments,
            computed_at: Utc::now(),
        };
        let total = allocation.total();
        info!(
            cluster = %self.id,
            target_p = target.p,
            target_q = target.q,
            allocated_p = total.p,
            allocated_q = total.q,
            failed = allocation.failed_members().count(),
            "cluster power allocated"
        );
        allocation
    }

    /// Hands out `target` member by member in the given order.
    ///
    /// Each member gets a share of its feasible range `[low, high]`: `low` is what the
    /// members after it cannot cover, `high` its own cap or whatever is left. Relaxed
    /// values count as assigned so later members make up the difference.
    fn cascade(&self, axis: Axis, candidates: Vec<Candidate>, target: f64, assignments: &mut [MemberAssignment]) {
        let positive = target > 0.0;
        let count = candidates.len();
        let mut remaining = target;
        let mut remaining_weight: f64 = candidates.iter().map(|c| c.weight).sum();

        for (position, candidate) in candidates.iter().enumerate() {
            let others: f64 = candidates[position + 1..].iter().map(|c| c.cap).sum();
            let (low, high) = if positive {
                let high = candidate.cap.min(remaining);
                ((remaining - others).max(0.0).min(high), high)
            } else {
                let high = candidate.cap.max(remaining);
                ((remaining - others).min(0.0).max(high), high)
            };
            let share = if remaining_weight > EPSILON {
                candidate.weight / remaining_weight
            } else {
                1.0 / (count - position) as f64
            };
            remaining_weight -= candidate.weight;
            let planned = (low + (high - low) * share).round();

            let result = candidate
                .device
                .lock()
                .apply_limitation(axis.limitation(&self.id, planned));
            let assignment = &mut assignments[candidate.index];
            match result {
                Ok(applied) => {
                    let value = applied.value().unwrap_or(planned);
                    axis.assign(assignment, value);
                    remaining -= value;
                }
                // equalities relax rather than fail, so only an empty member region ends up here
                Err(e) => {
                    warn!(
                        cluster = %self.id,
                        device = %assignment.device_id,
                        planned,
                        error = %e,
                        "member rejected its share"
                    );
                    assignment.error = Some(e.to_string());
                    remaining -= planned;
                }
            }
        }
    }

    pub fn summary(&self) -> ClusterSummary {
        let members = self.members();
        let mut weighted_soc = 0.0;
        let mut capacity = 0.0;
        let mut active_power = 0.0;
        let mut reactive_power = 0.0;
        let mut rated = 0.0;
        for member in &members {
            let device = member.lock();
            let m = device.measurements();
            if let (Some(soc), Some(cap)) = (m.soc, m.capacity_wh) {
                weighted_soc += soc * cap;
                capacity += cap;
            }
            if let Some(setpoint) = device.last_setpoint() {
                active_power += setpoint.active_power;
                reactive_power += setpoint.reactive_power;
            }
            rated += device.rated_apparent_power();
        }
        ClusterSummary {
            cluster_id: self.id.clone(),
            member_count: members.len(),
            soc: (capacity > 0.0).then(|| weighted_soc / capacity),
            active_power,
            reactive_power,
            rated_apparent_power: rated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::dispatcher::DeviceDispatcher;
    use crate::config::EngineConfig;
    use crate::domain::EssMeasurements;
    use crate::power::LimitationKind;

    fn member(id: &str, rated: f64, soc: f64, min_soc: f64) -> SharedDevice {
        let mut d = DeviceDispatcher::new(id, rated, &EngineConfig::default()).unwrap();
        d.update_measurements(EssMeasurements {
            soc: Some(soc),
            min_soc: Some(min_soc),
            nominal_power: Some(rated),
            capacity_wh: Some(10_000.0),
        });
        d.into_shared()
    }

    fn cluster(members: &[SharedDevice]) -> ClusterAggregator {
        let cluster = ClusterAggregator::new("cluster-1");
        for m in members {
            cluster.add_member(m.clone());
        }
        cluster
    }

    #[test]
    fn test_empty_cluster_is_origin() {
        let cluster = ClusterAggregator::new("empty");
        assert_eq!(cluster.region(), Region::point(Point::ORIGIN));
        let allocation = cluster.set_power();
        assert_eq!(allocation.target, Point::ORIGIN);
        assert!(allocation.assignments.is_empty());
    }

    #[test]
    fn test_aggregate_bounds_are_sum() {
        let a = member("a", 10_000.0, 50.0, 10.0);
        let b = member("b", 5_000.0, 50.0, 10.0);
        let cluster = cluster(&[a, b]);
        let bounds = cluster.bounds();
        assert!((bounds.max_p.unwrap() - 15_000.0).abs() < 1e-6);
        assert!((bounds.min_q.unwrap() + 15_000.0).abs() < 1e-6);
        assert_eq!(cluster.member_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_discharge_split_by_headroom() {
        let a = member("a", 10_000.0, 50.0, 10.0);
        let b = member("b", 10_000.0, 20.0, 10.0);
        let cluster = cluster(&[a, b]);
        cluster.apply_limitation(Limitation::active_power_equals("target", 500.0)).unwrap();

        let allocation = cluster.set_power();
        let pa = allocation.assignment("a").unwrap().active_power;
        let pb = allocation.assignment("b").unwrap().active_power;
        assert!(pa > pb, "a={pa} b={pb}");
        assert!((pa + pb - 500.0).abs() <= 1.0);
        assert!(allocation.failed_members().next().is_none());
    }

    #[test]
    fn test_charge_prefers_emptiest() {
        let a = member("a", 10_000.0, 90.0, 10.0);
        let b = member("b", 10_000.0, 15.0, 10.0);
        let cluster = cluster(&[a, b]);
        cluster.apply_limitation(Limitation::active_power_equals("target", -2_000.0)).unwrap();

        let allocation = cluster.set_power();
        let pa = allocation.assignment("a").unwrap().active_power;
        let pb = allocation.assignment("b").unwrap().active_power;
        assert!(pa <= 0.0 && pb <= 0.0);
        assert!(pb < pa, "a={pa} b={pb}");
        assert!((pa + pb + 2_000.0).abs() <= 1.0);
    }

    #[test]
    fn test_member_caps_are_respected() {
        let a = member("a", 1_000.0, 80.0, 10.0);
        let b = member("b", 10_000.0, 15.0, 10.0);
        let cluster = cluster(&[a, b]);
        cluster.apply_limitation(Limitation::active_power_equals("target", 6_000.0)).unwrap();

        let allocation = cluster.set_power();
        let pa = allocation.assignment("a").unwrap().active_power;
        let pb = allocation.assignment("b").unwrap().active_power;
        assert!(pa <= 1_000.0 + 1e-6);
        assert!((pa + pb - 6_000.0).abs() <= 1.0);
    }

    #[test]
    fn test_reactive_split_by_nominal_power() {
        let a = member("a", 10_000.0, 50.0, 10.0);
        let b = member("b", 5_000.0, 50.0, 10.0);
        let cluster = cluster(&[a, b]);
        cluster.apply_limitation(Limitation::reactive_power_equals("q", 3_000.0)).unwrap();

        let allocation = cluster.set_power();
        let qa = allocation.assignment("a").unwrap().reactive_power;
        let qb = allocation.assignment("b").unwrap().reactive_power;
        assert!(qa > qb);
        assert!((qa + qb - 3_000.0).abs() <= 1.0);
        // Members are pinned to their share for this cycle
        let bounds = cluster.members()[0].lock().bounds();
        assert!((bounds.max_q.unwrap() - qa).abs() < 1e-6);
    }

    #[test]
    fn test_relaxed_member_share_is_compensated() {
        let a = member("a", 10_000.0, 20.0, 10.0);
        let b = member("b", 10_000.0, 50.0, 10.0);
        let cluster = cluster(&[a.clone(), b]);
        cluster.apply_limitation(Limitation::active_power_equals("target", 1_000.0)).unwrap();

        // a is forced to charge after the cluster region was merged
        a.lock()
            .apply_limitation(Limitation::new("forced charge", LimitationKind::ActivePowerAtMost { value: -500.0 }))
            .unwrap();

        let allocation = cluster.set_power();
        assert!(allocation.failed_members().next().is_none());
        let pa = allocation.assignment("a").unwrap().active_power;
        let pb = allocation.assignment("b").unwrap().active_power;
        assert!((pa + 500.0).abs() < 1e-3, "a={pa}");
        assert!((pb - 1_500.0).abs() <= 1.0, "b={pb}");
        assert!((allocation.total().p - 1_000.0).abs() <= 1.0);
    }

    #[test]
    fn test_infeasible_cluster_limitation_leaves_region() {
        let cluster = cluster(&[member("a", 1_000.0, 50.0, 10.0)]);
        let before = cluster.region();
        let err = cluster
            .apply_limitation(Limitation::new("floor", LimitationKind::ActivePowerAtLeast { value: 2_000.0 }))
            .unwrap_err();
        assert!(err.is_feasibility());
        assert_eq!(cluster.region(), before);
    }

    #[test]
    fn test_static_limitation_and_removal() {
        let a = member("a", 1_000.0, 50.0, 10.0);
        let cluster = cluster(&[a]);
        cluster.add_static_limitation(Limitation::new("grid export", LimitationKind::ActivePowerAtMost { value: 200.0 }));
        assert!((cluster.bounds().max_p.unwrap() - 200.0).abs() < 1e-6);

        cluster.begin_cycle();
        assert!((cluster.bounds().max_p.unwrap() - 200.0).abs() < 1e-6);

        cluster.remove_static_limitation("grid export").unwrap();
        assert!((cluster.bounds().max_p.unwrap() - 1_000.0).abs() < 1e-6);
        assert!(matches!(
            cluster.remove_static_limitation("grid export"),
            Err(PowerError::UnknownLimitation(_))
        ));
    }

    #[test]
    fn test_remove_member() {
        let cluster = cluster(&[member("a", 1_000.0, 50.0, 10.0), member("b", 1_000.0, 50.0, 10.0)]);
        cluster.remove_member("a").unwrap();
        assert_eq!(cluster.member_ids(), vec!["b".to_string()]);
        assert!((cluster.bounds().max_p.unwrap() - 1_000.0).abs() < 1e-6);
        assert!(matches!(cluster.remove_member("a"), Err(PowerError::UnknownMember(_))));
    }

    #[test]
    fn test_summary_weights_soc_by_capacity() {
        let a = member("a", 1_000.0, 80.0, 10.0);
        let b = DeviceDispatcher::new("b", 1_000.0, &EngineConfig::default()).unwrap();
        let b = b.into_shared();
        b.lock().update_measurements(EssMeasurements {
            soc: Some(20.0),
            capacity_wh: Some(30_000.0),
            ..Default::default()
        });
        let cluster = cluster(&[a, b]);
        let summary = cluster.summary();
        assert_eq!(summary.member_count, 2);
        assert!((summary.soc.unwrap() - 35.0).abs() < 1e-9);
        assert_eq!(summary.rated_apparent_power, 2_000.0);
    }
}
