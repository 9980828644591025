//! V2X message types and the canonical wire form used for authentication.
//!
//! Every agent state update travels as a [`V2xMessage`]. The MAC is
//! computed over a canonical serialization: the key-sorted `key=value`
//! join of all payload fields except `mac`, with floats at fixed
//! precision so both sides serialize bit-identically.

use crossway_env::AgentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling on message speed (m/s). Driving limits are far lower;
/// anything above this is a corrupt or forged field.
pub const V_MAX: f64 = 50.0;

/// Coordinate bound for message validation (meters from origin).
pub const COORD_MAX: f64 = 500.0;

/// Planned movement through the next intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Through,
    Left,
    Right,
}

impl Intent {
    /// Wire name used in the canonical serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Through => "through",
            Intent::Left => "left",
            Intent::Right => "right",
        }
    }
}

/// Risk classification attached to messages and collision pairs.
///
/// Ordered: `Low < Medium < High < Collision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Collision,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Collision => "collision",
        }
    }
}

/// The action component of a decision.
///
/// Ordered by restrictiveness: when two rules disagree, the more
/// restrictive action wins (`Stop` beats `Yield` beats `Go`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Go,
    Yield,
    Brake,
    Stop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Go => "go",
            Action::Yield => "yield",
            Action::Brake => "brake",
            Action::Stop => "stop",
        }
    }

    /// Parses a wire/advisor action name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "go" => Some(Action::Go),
            "yield" => Some(Action::Yield),
            "brake" => Some(Action::Brake),
            "stop" => Some(Action::Stop),
            _ => None,
        }
    }
}

/// A committed per-tick decision: what to do, how fast, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub target_speed: f64,
    pub reason: String,
}

impl Decision {
    pub fn new(action: Action, target_speed: f64, reason: impl Into<String>) -> Self {
        Self {
            action,
            target_speed,
            reason: reason.into(),
        }
    }

    /// Full stop with the given reason.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::new(Action::Stop, 0.0, reason)
    }
}

/// Validation failure for a message field.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldError {
    #[error("{field} is not finite: {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// A signed agent state broadcast.
///
/// Invariants (enforced by [`V2xMessage::validate`] on publish):
/// numeric fields finite, `speed ∈ [0, V_MAX]`, `heading ∈ [0, 360)`,
/// coordinates within the world bounds, and `timestamp` strictly
/// monotonic per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2xMessage {
    pub agent_id: AgentId,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    /// Heading in degrees, 0 = north, 90 = east.
    pub heading: f64,
    pub intent: Intent,
    pub decision: Action,
    pub risk_level: RiskLevel,
    pub is_emergency: bool,
    pub is_police: bool,
    pub is_drunk: bool,
    pub pulling_over: bool,
    /// Sender's simulation time in seconds.
    pub timestamp: f64,
    /// Hex HMAC-SHA256 over [`V2xMessage::canonical_payload`].
    pub mac: String,
}

impl V2xMessage {
    /// Checks field finiteness and ranges.
    ///
    /// Boundary semantics: `speed = V_MAX` and `heading = 0.0` are
    /// accepted; `speed < 0`, `heading = 360.0`, NaN and Inf are not.
    pub fn validate(&self) -> Result<(), FieldError> {
        for (field, value) in [
            ("x", self.x),
            ("y", self.y),
            ("speed", self.speed),
            ("heading", self.heading),
            ("timestamp", self.timestamp),
        ] {
            if !value.is_finite() {
                return Err(FieldError::NotFinite { field, value });
            }
        }
        if self.x.abs() > COORD_MAX {
            return Err(FieldError::OutOfRange {
                field: "x",
                value: self.x,
            });
        }
        if self.y.abs() > COORD_MAX {
            return Err(FieldError::OutOfRange {
                field: "y",
                value: self.y,
            });
        }
        if !(0.0..=V_MAX).contains(&self.speed) {
            return Err(FieldError::OutOfRange {
                field: "speed",
                value: self.speed,
            });
        }
        if !(0.0..360.0).contains(&self.heading) {
            return Err(FieldError::OutOfRange {
                field: "heading",
                value: self.heading,
            });
        }
        Ok(())
    }

    /// Canonical byte form covered by the MAC.
    ///
    /// Fields are emitted key-sorted as `key=value` pairs joined by `|`,
    /// excluding `mac`. Floats use fixed precision (4 decimals, 6 for the
    /// timestamp) so signer and verifier agree byte for byte.
    pub fn canonical_payload(&self) -> String {
        format!(
            "agent_id={}|decision={}|heading={:.4}|intent={}|is_drunk={}|is_emergency={}|\
             is_police={}|pulling_over={}|risk_level={}|speed={:.4}|timestamp={:.6}|x={:.4}|y={:.4}",
            self.agent_id,
            self.decision.as_str(),
            self.heading,
            self.intent.as_str(),
            self.is_drunk,
            self.is_emergency,
            self.is_police,
            self.pulling_over,
            self.risk_level.as_str(),
            self.speed,
            self.timestamp,
            self.x,
            self.y,
        )
    }
}

/// Builder-style constructor for the common case.
///
/// Most call sites fill position, heading, speed and flags and leave the
/// rest at their defaults until the decision pipeline has run.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub agent_id: AgentId,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub heading: f64,
    pub intent: Intent,
    pub decision: Action,
    pub risk_level: RiskLevel,
    pub is_emergency: bool,
    pub is_police: bool,
    pub is_drunk: bool,
    pub pulling_over: bool,
    pub timestamp: f64,
}

impl MessageDraft {
    pub fn new(agent_id: AgentId, timestamp: f64) -> Self {
        Self {
            agent_id,
            x: 0.0,
            y: 0.0,
            speed: 0.0,
            heading: 0.0,
            intent: Intent::Through,
            decision: Action::Go,
            risk_level: RiskLevel::Low,
            is_emergency: false,
            is_police: false,
            is_drunk: false,
            pulling_over: false,
            timestamp,
        }
    }

    /// Turns the draft into an unsigned message (empty MAC).
    pub fn unsigned(self) -> V2xMessage {
        V2xMessage {
            agent_id: self.agent_id,
            x: self.x,
            y: self.y,
            speed: self.speed,
            heading: self.heading,
            intent: self.intent,
            decision: self.decision,
            risk_level: self.risk_level,
            is_emergency: self.is_emergency,
            is_police: self.is_police,
            is_drunk: self.is_drunk,
            pulling_over: self.pulling_over,
            timestamp: self.timestamp,
            mac: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(speed: f64, heading: f64) -> V2xMessage {
        let mut draft = MessageDraft::new(AgentId::new("VH_A"), 1.0);
        draft.speed = speed;
        draft.heading = heading;
        draft.unsigned()
    }

    #[test]
    fn test_boundary_values_accepted() {
        assert!(message(V_MAX, 0.0).validate().is_ok());
        assert!(message(0.0, 359.9999).validate().is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(message(-0.1, 0.0).validate().is_err());
        assert!(message(V_MAX + 0.1, 0.0).validate().is_err());
        assert!(message(10.0, 360.0).validate().is_err());
        assert!(message(f64::NAN, 0.0).validate().is_err());
        assert!(message(10.0, f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_canonical_payload_is_key_sorted_and_stable() {
        let msg = message(12.5, 90.0);
        let payload = msg.canonical_payload();

        // Keys appear in sorted order and mac is excluded
        let keys: Vec<&str> = payload
            .split('|')
            .map(|kv| kv.split('=').next().unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(!payload.contains("mac"));

        // Same fields serialize to the same bytes
        assert_eq!(payload, message(12.5, 90.0).canonical_payload());
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Collision);
    }
}
