//! Sanitized per-tick state export.
//!
//! This is the only document that leaves the kernel. Every numeric field
//! is forced finite and clamped into its legal range before export, so a
//! consumer can never observe NaN, infinities or out-of-world
//! coordinates regardless of internal state.

use crate::grid::GridInfo;
use crossway_core::channel::SecurityStats;
use crossway_core::message::{COORD_MAX, V_MAX};
use serde::Serialize;
use std::collections::BTreeMap;

/// Clamps a possibly-degenerate number into a range, rounding to two
/// decimals.
fn sane(value: f64, lo: f64, hi: f64) -> f64 {
    let v = if value.is_finite() { value } else { lo };
    (v.clamp(lo, hi) * 100.0).round() / 100.0
}

/// One exported vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedAgent {
    pub x: f64,
    pub y: f64,
    pub v: f64,
    pub heading: f64,
    pub decision: String,
    pub reason: String,
    pub risk_level: String,
    pub is_emergency: bool,
    pub is_police: bool,
    pub is_drunk: bool,
    pub pulling_over: bool,
    pub inside_intersection: bool,
    pub background: bool,
    pub llm_calls: u64,
}

impl ExportedAgent {
    /// Applies range sanitization to all numeric fields.
    pub fn sanitized(mut self) -> Self {
        self.x = sane(self.x, -COORD_MAX, COORD_MAX);
        self.y = sane(self.y, -COORD_MAX, COORD_MAX);
        self.v = sane(self.v, 0.0, V_MAX);
        self.heading = sane(self.heading, 0.0, 359.99);
        self
    }
}

/// One exported traffic light.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedLight {
    pub phase: String,
    pub phase_remaining: f64,
    pub emergency_mode: bool,
    pub x: f64,
    pub y: f64,
}

/// One exported collision pair.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedPair {
    pub agent1: String,
    pub agent2: String,
    pub ttc: f64,
    pub risk: String,
}

/// Session statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedStats {
    pub elapsed_time: f64,
    pub collisions_prevented: u64,
    pub cooperation_score: f64,
}

/// The complete per-tick export document.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedState {
    pub running: bool,
    pub scenario: Option<String>,
    pub tick: u64,
    pub t: f64,
    pub agents: BTreeMap<String, ExportedAgent>,
    pub infrastructure: BTreeMap<String, ExportedLight>,
    pub collision_pairs: Vec<ExportedPair>,
    pub grid: GridInfo,
    pub stats: ExportedStats,
    pub security: SecurityStats,
    pub background_traffic: bool,
}

impl ExportedState {
    /// Serializes to a JSON string (pretty for humans).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
