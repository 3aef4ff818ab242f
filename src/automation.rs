// src/automation.rs
//
// Parameter automation: time-ordered curve lanes sampled by the engine
// once per slice, plus a recording session that streams points in.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::ids::{self, LaneId};

/// Matching tolerance used by [`Automation::remove_point`] when none is given.
pub const DEFAULT_POINT_TOLERANCE: f64 = 0.001;

// ═══════════════════════════════════════════════════════════════════
// Points and lanes
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveType {
    #[default]
    Linear,
    Exponential,
    Step,
}

impl CurveType {
    /// Value at fraction `t` (0..1) between `from` and `to`.
    pub fn interpolate(&self, from: f64, to: f64, t: f64) -> f64 {
        match self {
            CurveType::Linear => from + (to - from) * t,
            CurveType::Exponential => {
                if from <= 0.0 || to <= 0.0 {
                    from + (to - from) * t
                } else {
                    from * (to / from).powf(t)
                }
            }
            CurveType::Step => from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub time: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationLane {
    pub id: LaneId,
    /// Track id, effect id or `master`.
    pub target_id: String,
    pub parameter: String,
    pub points: Vec<AutomationPoint>,
    pub curve: CurveType,
    pub enabled: bool,
}

impl AutomationLane {
    pub fn new(target_id: impl Into<String>, parameter: impl Into<String>, curve: CurveType) -> Self {
        Self {
            id: ids::generate("lane"),
            target_id: target_id.into(),
            parameter: parameter.into(),
            points: Vec::new(),
            curve,
            enabled: true,
        }
    }

    /// Insert in time order; an existing point at exactly `time` is replaced.
    pub fn insert_point(&mut self, time: f64, value: f64) {
        let point = AutomationPoint { time, value };
        let index = self.points.partition_point(|p| p.time <= time);
        if index > 0 && self.points[index - 1].time == time {
            self.points[index - 1] = point;
        } else {
            self.points.insert(index, point);
        }
    }

    pub fn value_at(&self, time: f64) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        let first = self.points.first()?;
        let last = self.points.last()?;
        if time <= first.time {
            return Some(first.value);
        }
        if time >= last.time {
            return Some(last.value);
        }

        // First point strictly after `time`; index >= 1 because time > first.time.
        let next = self.points.partition_point(|p| p.time <= time);
        let p1 = self.points[next - 1];
        if p1.time == time {
            return Some(p1.value);
        }
        let p2 = self.points[next];
        let t = (time - p1.time) / (p2.time - p1.time);
        Some(self.curve.interpolate(p1.value, p2.value, t))
    }
}

// ═══════════════════════════════════════════════════════════════════
// Lane collection
// ═══════════════════════════════════════════════════════════════════

/// Parameter value produced by [`Automation::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutomatedValue {
    pub target_id: String,
    pub parameter: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AutomationSnapshot {
    lanes: Vec<AutomationLane>,
}

#[derive(Debug, Default)]
pub struct Automation {
    lanes: Vec<AutomationLane>,
    recording_lane: Option<LaneId>,
}

impl Automation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_lane(
        &mut self,
        target_id: impl Into<String>,
        parameter: impl Into<String>,
        curve: CurveType,
    ) -> LaneId {
        let lane = AutomationLane::new(target_id, parameter, curve);
        let id = lane.id.clone();
        log::debug!("Created automation lane {} ({}.{})", id, lane.target_id, lane.parameter);
        self.lanes.push(lane);
        id
    }

    pub fn lane(&self, id: &str) -> Option<&AutomationLane> {
        self.lanes.iter().find(|l| l.id == id)
    }

    fn lane_mut(&mut self, id: &str) -> EngineResult<&mut AutomationLane> {
        self.lanes
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| lane_not_found(id))
    }

    pub fn lanes(&self) -> &[AutomationLane] {
        &self.lanes
    }

    pub fn lanes_for_target(&self, target_id: &str) -> Vec<&AutomationLane> {
        self.lanes.iter().filter(|l| l.target_id == target_id).collect()
    }

    pub fn delete_lane(&mut self, id: &str) -> bool {
        if self.recording_lane.as_deref() == Some(id) {
            self.recording_lane = None;
        }
        let before = self.lanes.len();
        self.lanes.retain(|l| l.id != id);
        self.lanes.len() != before
    }

    pub fn set_lane_enabled(&mut self, id: &str, enabled: bool) -> EngineResult<()> {
        self.lane_mut(id)?.enabled = enabled;
        Ok(())
    }

    pub fn set_lane_curve(&mut self, id: &str, curve: CurveType) -> EngineResult<()> {
        self.lane_mut(id)?.curve = curve;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.lanes.clear();
        self.recording_lane = None;
    }

    // ─────────────────────────────────────────────────────────────────
    // Points
    // ─────────────────────────────────────────────────────────────────

    pub fn add_point(&mut self, lane_id: &str, time: f64, value: f64) -> EngineResult<()> {
        if !(time.is_finite() && time >= 0.0) {
            return Err(EngineError::invalid_parameter(
                "Automation time must be a non-negative number",
            ));
        }
        if !value.is_finite() {
            return Err(EngineError::invalid_parameter(
                "Automation value must be finite",
            ));
        }
        self.lane_mut(lane_id)?.insert_point(time, value);
        Ok(())
    }

    /// Remove the first point within `tolerance` of `time`.
    pub fn remove_point(&mut self, lane_id: &str, time: f64, tolerance: f64) -> EngineResult<bool> {
        let lane = self.lane_mut(lane_id)?;
        match lane.points.iter().position(|p| (p.time - time).abs() < tolerance) {
            Some(index) => {
                lane.points.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every point with `start <= time <= end`.
    pub fn remove_points_in_range(
        &mut self,
        lane_id: &str,
        start: f64,
        end: f64,
    ) -> EngineResult<usize> {
        let lane = self.lane_mut(lane_id)?;
        let before = lane.points.len();
        lane.points.retain(|p| p.time < start || p.time > end);
        Ok(before - lane.points.len())
    }

    pub fn value_at(&self, lane_id: &str, time: f64) -> Option<f64> {
        self.lane(lane_id)?.value_at(time)
    }

    /// Sample every enabled, non-empty lane at `time`.
    pub fn evaluate(&self, time: f64) -> Vec<AutomatedValue> {
        self.lanes
            .iter()
            .filter_map(|lane| {
                lane.value_at(time).map(|value| AutomatedValue {
                    target_id: lane.target_id.clone(),
                    parameter: lane.parameter.clone(),
                    value,
                })
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────────

    pub fn start_recording(&mut self, lane_id: &str) -> EngineResult<()> {
        if self.lane(lane_id).is_none() {
            return Err(lane_not_found(lane_id));
        }
        self.recording_lane = Some(lane_id.to_string());
        log::info!("Automation recording started on lane {lane_id}");
        Ok(())
    }

    /// Ends the session, returning the lane that was recording.
    pub fn stop_recording(&mut self) -> Option<LaneId> {
        let lane = self.recording_lane.take();
        if let Some(id) = &lane {
            log::info!("Automation recording stopped on lane {id}");
        }
        lane
    }

    pub fn is_recording(&self) -> bool {
        self.recording_lane.is_some()
    }

    pub fn recording_lane(&self) -> Option<&str> {
        self.recording_lane.as_deref()
    }

    /// Stream a point into the recording lane. Returns whether one was stored.
    pub fn record_point(&mut self, time: f64, value: f64) -> bool {
        let Some(lane_id) = self.recording_lane.clone() else {
            return false;
        };
        match self.add_point(&lane_id, time, value) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Dropped automation point: {err}");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────

    pub fn to_json(&self) -> EngineResult<String> {
        let snapshot = AutomationSnapshot {
            lanes: self.lanes.clone(),
        };
        serde_json::to_string(&snapshot).map_err(|e| {
            EngineError::new(ErrorCode::OperationFailed, "Failed to serialize automation")
                .with_source(e)
        })
    }

    /// Replace all lanes with those in `json`.
    pub fn load_json(&mut self, json: &str) -> EngineResult<()> {
        let snapshot: AutomationSnapshot = serde_json::from_str(json).map_err(|e| {
            EngineError::invalid_parameter("Invalid automation data").with_source(e)
        })?;
        let mut lanes = snapshot.lanes;
        for lane in &mut lanes {
            lane.points.sort_by(|a, b| a.time.total_cmp(&b.time));
        }
        self.lanes = lanes;
        self.recording_lane = None;
        Ok(())
    }
}

fn lane_not_found(id: &str) -> EngineError {
    EngineError::invalid_parameter(format!("Automation lane {id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lane_with(curve: CurveType, points: &[(f64, f64)]) -> (Automation, LaneId) {
        let mut automation = Automation::new();
        let id = automation.create_lane("track-1", "volume", curve);
        for &(t, v) in points {
            automation.add_point(&id, t, v).unwrap();
        }
        (automation, id)
    }

    #[test]
    fn test_insert_orders_and_replaces() {
        let (mut a, id) = lane_with(CurveType::Linear, &[(2.0, 1.0), (0.0, 0.0), (1.0, 0.5)]);
        a.add_point(&id, 1.0, 0.75).unwrap();
        let times: Vec<f64> = a.lane(&id).unwrap().points.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
        assert_eq!(a.lane(&id).unwrap().points[1].value, 0.75);
    }

    #[test]
    fn test_value_outside_range_uses_nearest() {
        let (a, id) = lane_with(CurveType::Linear, &[(1.0, 0.2), (2.0, 0.8)]);
        assert_eq!(a.value_at(&id, 0.0), Some(0.2));
        assert_eq!(a.value_at(&id, 5.0), Some(0.8));
        assert_eq!(a.value_at(&id, 1.0), Some(0.2));
    }

    #[test]
    fn test_disabled_or_empty_lane_has_no_value() {
        let (mut a, id) = lane_with(CurveType::Linear, &[]);
        assert_eq!(a.value_at(&id, 1.0), None);
        a.add_point(&id, 0.0, 1.0).unwrap();
        a.set_lane_enabled(&id, false).unwrap();
        assert_eq!(a.value_at(&id, 1.0), None);
        assert!(a.evaluate(1.0).is_empty());
    }

    #[test]
    fn test_linear_interpolation_is_monotonic() {
        let (a, id) = lane_with(CurveType::Linear, &[(0.0, 0.0), (1.0, 1.0)]);
        assert_relative_eq!(a.value_at(&id, 0.25).unwrap(), 0.25);
        let mut previous = f64::MIN;
        for i in 0..=100 {
            let v = a.value_at(&id, f64::from(i) / 100.0).unwrap();
            assert!(v >= previous);
            assert_eq!(a.value_at(&id, f64::from(i) / 100.0).unwrap(), v);
            previous = v;
        }
    }

    #[test]
    fn test_exponential_and_fallback() {
        let (a, id) = lane_with(CurveType::Exponential, &[(0.0, 1.0), (1.0, 100.0)]);
        assert_relative_eq!(a.value_at(&id, 0.5).unwrap(), 10.0, epsilon = 1e-9);

        let (b, id) = lane_with(CurveType::Exponential, &[(0.0, 0.0), (1.0, 1.0)]);
        assert_relative_eq!(b.value_at(&id, 0.5).unwrap(), 0.5);
    }

    #[test]
    fn test_step_holds_previous_value() {
        let (a, id) = lane_with(CurveType::Step, &[(0.0, 0.1), (1.0, 0.9)]);
        assert_eq!(a.value_at(&id, 0.99), Some(0.1));
        assert_eq!(a.value_at(&id, 1.0), Some(0.9));
    }

    #[test]
    fn test_remove_points() {
        let (mut a, id) = lane_with(CurveType::Linear, &[(0.0, 0.0), (1.0, 1.0), (2.0, 0.0), (3.0, 1.0)]);
        assert!(a.remove_point(&id, 1.0005, DEFAULT_POINT_TOLERANCE).unwrap());
        assert!(!a.remove_point(&id, 1.0, DEFAULT_POINT_TOLERANCE).unwrap());
        assert_eq!(a.remove_points_in_range(&id, 2.0, 3.0).unwrap(), 2);
        assert_eq!(a.lane(&id).unwrap().points.len(), 1);
        assert!(a.remove_point("lane-missing", 0.0, 0.1).is_err());
    }

    #[test]
    fn test_recording_session() {
        let (mut a, id) = lane_with(CurveType::Linear, &[]);
        assert!(!a.record_point(0.0, 1.0));
        assert!(a.start_recording("nope").is_err());

        a.start_recording(&id).unwrap();
        assert!(a.record_point(0.5, 0.3));
        assert!(a.record_point(1.0, 0.6));
        assert_eq!(a.stop_recording().as_deref(), Some(id.as_str()));
        assert!(!a.record_point(1.5, 0.9));
        assert_eq!(a.lane(&id).unwrap().points.len(), 2);
    }

    #[test]
    fn test_delete_lane_stops_recording() {
        let (mut a, id) = lane_with(CurveType::Linear, &[]);
        a.start_recording(&id).unwrap();
        assert!(a.delete_lane(&id));
        assert!(!a.is_recording());
        assert!(a.lanes_for_target("track-1").is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let (a, id) = lane_with(CurveType::Step, &[(0.0, 0.5), (1.0, 1.0)]);
        let json = a.to_json().unwrap();
        assert!(json.contains("\"step\""));

        let mut b = Automation::new();
        b.load_json(&json).unwrap();
        assert_eq!(b.lane(&id), a.lane(&id));
    }
}
