//! Telemetry collection at the event-emission boundary.
//!
//! The collector never touches disk; `report()` returns a document the
//! caller is free to serialize. The cooperation score aggregates how well
//! the fleet is behaving: near-misses and late yields pull it down,
//! completed emergency preemptions push it up.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// Bounded event log size.
const MAX_EVENTS: usize = 1000;

/// Cooperation score weights: `100 - k1*near_misses - k2*late_yields +
/// k3*successful_preemptions`, clamped to `[0, 100]`.
#[derive(Debug, Clone)]
pub struct CooperationWeights {
    pub k1_near_miss: f64,
    pub k2_late_yield: f64,
    pub k3_preemption: f64,
}

impl Default for CooperationWeights {
    fn default() -> Self {
        Self {
            k1_near_miss: 2.0,
            k2_late_yield: 1.0,
            k3_preemption: 3.0,
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub timestamp: f64,
    pub data: Value,
}

/// One scenario run in the session history.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRun {
    pub scenario: String,
    pub started_at: f64,
    pub ended_at: Option<f64>,
}

/// The telemetry report document.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub session_duration: f64,
    pub collisions_prevented: u64,
    pub vehicles_passed: u64,
    pub total_v2x_messages: u64,
    pub throughput_per_min: f64,
    pub risk_breakdown: BTreeMap<String, u64>,
    pub near_misses: u64,
    pub late_yields: u64,
    pub successful_preemptions: u64,
    pub cooperation_score: f64,
    pub active_scenario: Option<String>,
    pub scenarios_run: usize,
    pub recent_events: Vec<TelemetryEvent>,
}

/// Event sink owned by the simulation manager, fed during apply phases.
pub struct TelemetryCollector {
    weights: CooperationWeights,
    events: VecDeque<TelemetryEvent>,
    collisions_prevented: u64,
    vehicles_passed: u64,
    total_v2x_messages: u64,
    near_misses: u64,
    late_yields: u64,
    successful_preemptions: u64,
    risk_breakdown: BTreeMap<String, u64>,
    started_at: f64,
    scenario_history: Vec<ScenarioRun>,
    active_scenario: Option<String>,
}

impl TelemetryCollector {
    pub fn new(weights: CooperationWeights) -> Self {
        Self {
            weights,
            events: VecDeque::new(),
            collisions_prevented: 0,
            vehicles_passed: 0,
            total_v2x_messages: 0,
            near_misses: 0,
            late_yields: 0,
            successful_preemptions: 0,
            risk_breakdown: BTreeMap::new(),
            started_at: 0.0,
            scenario_history: Vec::new(),
            active_scenario: None,
        }
    }

    /// Records a generic event into the bounded log.
    pub fn record_event(&mut self, kind: &str, now: f64, data: Value) {
        self.events.push_back(TelemetryEvent {
            kind: kind.to_string(),
            timestamp: now,
            data,
        });
        while self.events.len() > MAX_EVENTS {
            self.events.pop_front();
        }
    }

    pub fn record_collision_prevented(&mut self, now: f64, agents: (&str, &str)) {
        self.collisions_prevented += 1;
        self.record_event(
            "collision_prevented",
            now,
            serde_json::json!({ "agents": [agents.0, agents.1] }),
        );
    }

    pub fn record_vehicle_passed(&mut self) {
        self.vehicles_passed += 1;
    }

    pub fn record_v2x_message(&mut self) {
        self.total_v2x_messages += 1;
    }

    pub fn record_risk(&mut self, level: &str) {
        *self.risk_breakdown.entry(level.to_string()).or_insert(0) += 1;
    }

    pub fn record_near_miss(&mut self) {
        self.near_misses += 1;
    }

    /// A yield issued only after the conflict was already critical.
    pub fn record_late_yield(&mut self) {
        self.late_yields += 1;
    }

    pub fn record_preemption_success(&mut self, now: f64) {
        self.successful_preemptions += 1;
        self.record_event("preemption_complete", now, Value::Null);
    }

    pub fn scenario_started(&mut self, scenario: &str, now: f64) {
        self.active_scenario = Some(scenario.to_string());
        self.scenario_history.push(ScenarioRun {
            scenario: scenario.to_string(),
            started_at: now,
            ended_at: None,
        });
        self.record_event(
            "scenario_started",
            now,
            serde_json::json!({ "scenario": scenario }),
        );
    }

    pub fn scenario_ended(&mut self, now: f64) {
        if let Some(run) = self.scenario_history.last_mut() {
            run.ended_at = Some(now);
        }
        self.active_scenario = None;
    }

    /// The clamped cooperation score.
    pub fn cooperation_score(&self) -> f64 {
        let w = &self.weights;
        let score = 100.0 - w.k1_near_miss * self.near_misses as f64
            - w.k2_late_yield * self.late_yields as f64
            + w.k3_preemption * self.successful_preemptions as f64;
        score.clamp(0.0, 100.0)
    }

    pub fn collisions_prevented(&self) -> u64 {
        self.collisions_prevented
    }

    /// Builds the report document.
    pub fn report(&self, now: f64) -> TelemetryReport {
        let elapsed = (now - self.started_at).max(0.0);
        let minutes = (elapsed / 60.0).max(0.01);
        let skip = self.events.len().saturating_sub(20);
        TelemetryReport {
            session_duration: elapsed,
            collisions_prevented: self.collisions_prevented,
            vehicles_passed: self.vehicles_passed,
            total_v2x_messages: self.total_v2x_messages,
            throughput_per_min: self.vehicles_passed as f64 / minutes,
            risk_breakdown: self.risk_breakdown.clone(),
            near_misses: self.near_misses,
            late_yields: self.late_yields,
            successful_preemptions: self.successful_preemptions,
            cooperation_score: self.cooperation_score(),
            active_scenario: self.active_scenario.clone(),
            scenarios_run: self.scenario_history.len(),
            recent_events: self.events.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn reset(&mut self, now: f64) {
        self.events.clear();
        self.collisions_prevented = 0;
        self.vehicles_passed = 0;
        self.total_v2x_messages = 0;
        self.near_misses = 0;
        self.late_yields = 0;
        self.successful_preemptions = 0;
        self.risk_breakdown.clear();
        self.started_at = now;
        self.scenario_history.clear();
        self.active_scenario = None;
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(CooperationWeights::default())
    }
}
