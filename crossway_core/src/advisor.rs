//! Advisor integration: prompt building, reply parsing and the deadline
//! guard.
//!
//! The advisor is never on the critical path. Calls are bounded by a hard
//! deadline, gated by the shared circuit breaker (via the per-tick
//! permit), and any failure - timeout, transport, malformed reply -
//! simply drops the agent back onto its deterministic rule cascade.

use crate::message::{Action, Decision, Intent, RiskLevel, V_MAX};
use crate::light::Signal;
use crate::priority::Advisory;
use crossway_env::{AdvisorError, AdvisorTransport, AgentId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Advisor call tunables.
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    /// Hard per-call deadline.
    pub timeout: Duration,
    /// Minimum spacing between calls from the same agent (seconds).
    pub min_call_interval: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(800),
            min_call_interval: 0.6,
        }
    }
}

/// One nearby vehicle as presented to the advisor.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: AgentId,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub heading: f64,
    pub is_emergency: bool,
    pub distance: f64,
    pub ttc: Option<f64>,
    pub decision: Action,
}

/// Compact situation context for one advisor call: own state, the three
/// nearest peers, the arbitration advisory and a memory digest.
#[derive(Debug, Clone)]
pub struct AdvisorContext {
    pub agent_id: AgentId,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub heading: f64,
    pub intent: Intent,
    pub is_emergency: bool,
    pub inside_intersection: bool,
    pub risk: RiskLevel,
    /// Signal for this agent's axis, if a light governs the intersection.
    pub signal: Option<Signal>,
    pub distance_to_stop_line: f64,
    pub advisory: Option<Advisory>,
    pub peers: Vec<PeerSummary>,
    pub memory_digest: String,
}

impl AdvisorContext {
    /// Renders the situation prompt sent to the model.
    pub fn prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(format!("I am vehicle {}.", self.agent_id));
        parts.push(format!(
            "Position: ({:.1}, {:.1}), Speed: {:.1} m/s, Heading: {:.0} deg, Intent: {}.",
            self.x,
            self.y,
            self.speed,
            self.heading,
            self.intent.as_str()
        ));
        parts.push(format!(
            "Emergency: {}. Inside intersection: {}. Distance to stop line: {:.1} m.",
            self.is_emergency, self.inside_intersection, self.distance_to_stop_line
        ));
        parts.push(format!("Current risk: {}.", self.risk.as_str()));

        match self.signal {
            Some(Signal::Green) => parts.push("Traffic light for my axis: GREEN.".to_string()),
            Some(Signal::Red) => parts.push("Traffic light for my axis: RED.".to_string()),
            None => parts.push("No traffic light - right-of-way rules apply.".to_string()),
        }
        match self.advisory {
            Some(Advisory::MustYield) => {
                parts.push("Priority arbitration says I must yield.".to_string())
            }
            Some(Advisory::MayGo) => parts.push("Priority arbitration says I may go.".to_string()),
            None => {}
        }

        if self.peers.is_empty() {
            parts.push("No other vehicles nearby.".to_string());
        } else {
            parts.push(format!("NEARBY VEHICLES ({}):", self.peers.len()));
            for p in &self.peers {
                let ttc = p
                    .ttc
                    .map(|t| format!("{t:.1}s"))
                    .unwrap_or_else(|| "inf".to_string());
                parts.push(format!(
                    "  - {}: pos=({:.1},{:.1}), speed={:.1}, heading={:.0}, emergency={}, \
                     distance={:.1}, ttc={}, their_decision={}",
                    p.id,
                    p.x,
                    p.y,
                    p.speed,
                    p.heading,
                    p.is_emergency,
                    p.distance,
                    ttc,
                    p.decision.as_str()
                ));
            }
        }

        if !self.memory_digest.is_empty() {
            parts.push(String::new());
            parts.push(self.memory_digest.clone());
        }

        parts.push(String::new());
        parts.push(
            "Reply with JSON only: {\"action\": \"go|yield|brake|stop\", \
             \"speed\": <0..50>, \"reason\": \"<short>\"}"
                .to_string(),
        );
        parts.join("\n")
    }
}

#[derive(Deserialize)]
struct RawReply {
    action: String,
    speed: f64,
    reason: Option<String>,
}

/// Parses and validates a raw advisor reply into a [`Decision`].
///
/// Accepts an optional markdown code fence around the JSON body. Any
/// schema violation - unknown action, speed outside `[0, V_MAX]`,
/// non-finite speed - is a `Malformed` failure and counts against the
/// breaker.
pub fn parse_reply(text: &str) -> Result<Decision, AdvisorError> {
    let mut body = text.trim();
    if let Some(stripped) = body.strip_prefix("```") {
        // Drop the fence line (```json etc.) and the closing fence
        let without_lang = stripped.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        body = without_lang.rsplit_once("```").map(|(head, _)| head).unwrap_or(without_lang);
        body = body.trim();
    }

    let raw: RawReply = serde_json::from_str(body)
        .map_err(|e| AdvisorError::malformed(format!("invalid JSON: {e}")))?;

    let action = Action::parse(&raw.action)
        .ok_or_else(|| AdvisorError::malformed(format!("unknown action {:?}", raw.action)))?;

    if !raw.speed.is_finite() || !(0.0..=V_MAX).contains(&raw.speed) {
        return Err(AdvisorError::malformed(format!(
            "speed out of range: {}",
            raw.speed
        )));
    }

    let mut reason = raw.reason.unwrap_or_else(|| "llm_decision".to_string());
    reason.truncate(50);

    Ok(Decision::new(action, raw.speed, reason))
}

/// Deadline-guarded advisor handle shared by all vehicle brains.
///
/// Breaker gating happens outside: the tick loop hands each agent a call
/// permit, and advisor outcomes are fed back to the breaker during the
/// apply phase.
#[derive(Clone)]
pub struct GuardedAdvisor {
    transport: Arc<dyn AdvisorTransport>,
    timeout: Duration,
}

impl GuardedAdvisor {
    pub fn new(transport: Arc<dyn AdvisorTransport>, config: &AdvisorConfig) -> Self {
        Self {
            transport,
            timeout: config.timeout,
        }
    }

    /// Issues one advisor call under the deadline.
    ///
    /// When the deadline fires the underlying future is dropped
    /// (cancelled) and control returns with `Timeout`.
    pub async fn advise(&self, context: &AdvisorContext) -> Result<Decision, AdvisorError> {
        let prompt = context.prompt();
        match tokio::time::timeout(self.timeout, self.transport.request(&prompt)).await {
            Err(_) => Err(AdvisorError::Timeout(self.timeout.as_millis() as u64)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(text)) => parse_reply(&text),
        }
    }
}
