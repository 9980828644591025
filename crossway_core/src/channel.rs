//! The V2X broadcast channel: a signed, rate-limited message bus with
//! per-tick snapshot semantics.
//!
//! Within a tick, publish order is irrelevant - readers only ever see the
//! final per-agent message through an immutable [`Snapshot`] captured at
//! the tick boundary. Across ticks, snapshots form a total order.

use crate::message::V2xMessage;
use crate::security::{LivenessTracker, MacKey, RateLimiter};
use crossway_env::AgentId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Rejection reasons for [`V2xChannel::publish`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    /// The HMAC did not verify against the canonical payload.
    #[error("invalid MAC from {0}")]
    InvalidMac(AgentId),

    /// A numeric field is non-finite or out of range.
    #[error("invalid field range from {agent}: {detail}")]
    InvalidRange { agent: AgentId, detail: String },

    /// Timestamp regressed, repeated, or is older than the stale window.
    #[error("stale message from {agent}: ts={timestamp}")]
    StaleMessage { agent: AgentId, timestamp: f64 },

    /// The agent exceeded its per-second message budget.
    #[error("rate limited: {0}")]
    RateLimited(AgentId),
}

/// Side-channel alert broadcast between agents.
///
/// Unlike state messages, alerts are free-form, optionally targeted, and
/// kept in a bounded deque rather than last-writer-wins storage.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub from: AgentId,
    pub kind: String,
    pub message: String,
    pub timestamp: f64,
    /// None = broadcast to everyone.
    pub target: Option<AgentId>,
}

/// Immutable view of the channel at a tick boundary.
///
/// Backed by a sorted map so iteration order is deterministic; cloning is
/// cheap (`Arc` bump) which lets every parallel decision task hold the
/// same view.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    inner: Arc<BTreeMap<AgentId, V2xMessage>>,
}

impl Snapshot {
    pub fn get(&self, id: &AgentId) -> Option<&V2xMessage> {
        self.inner.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &V2xMessage)> {
        self.inner.iter()
    }

    /// All messages except the caller's own.
    pub fn others<'a>(
        &'a self,
        me: &'a AgentId,
    ) -> impl Iterator<Item = (&'a AgentId, &'a V2xMessage)> {
        self.inner.iter().filter(move |(id, _)| *id != me)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Counters surfaced in telemetry and the export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityStats {
    pub rejected_messages: u64,
    pub rejected_alerts: u64,
    pub active_agents: Vec<AgentId>,
    pub stale_agents: Vec<AgentId>,
}

/// Channel tunables.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Per-agent state message budget (messages per second).
    pub message_rate_limit: usize,
    /// Per-agent alert budget (alerts per second).
    pub alert_rate_limit: usize,
    /// Agents silent for longer than this are pruned (seconds).
    pub stale_timeout: f64,
    /// Messages older than this are rejected on publish (seconds).
    pub max_message_age: f64,
    /// Bounded history of accepted messages.
    pub max_history: usize,
    /// Bounded alert deque.
    pub max_alerts: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            message_rate_limit: 20,
            alert_rate_limit: 10,
            stale_timeout: 5.0,
            max_message_age: 5.0,
            max_history: 500,
            max_alerts: 200,
        }
    }
}

/// The shared V2X bus.
///
/// Owned by the simulation manager; all mutation happens in the
/// single-writer apply phase, readers go through [`V2xChannel::snapshot`].
pub struct V2xChannel {
    key: MacKey,
    config: ChannelConfig,
    messages: BTreeMap<AgentId, V2xMessage>,
    history: VecDeque<V2xMessage>,
    alerts: VecDeque<Alert>,
    limiter: RateLimiter,
    alert_limiter: RateLimiter,
    liveness: LivenessTracker,
    rejected_messages: u64,
    rejected_alerts: u64,
}

impl V2xChannel {
    pub fn new(key: MacKey, config: ChannelConfig) -> Self {
        let limiter = RateLimiter::new(config.message_rate_limit);
        let alert_limiter = RateLimiter::new(config.alert_rate_limit);
        let liveness = LivenessTracker::new(config.stale_timeout);
        Self {
            key,
            config,
            messages: BTreeMap::new(),
            history: VecDeque::new(),
            alerts: VecDeque::new(),
            limiter,
            alert_limiter,
            liveness,
            rejected_messages: 0,
            rejected_alerts: 0,
        }
    }

    /// Returns the signing key so agents can produce valid MACs.
    pub fn key(&self) -> &MacKey {
        &self.key
    }

    /// Validates and stores a message, replacing the agent's prior state.
    ///
    /// Checks run in contract order: MAC, field ranges, timestamp
    /// freshness/monotonicity, then the rate limit. A rejected publish
    /// leaves the agent's previous message untouched.
    pub fn publish(&mut self, message: V2xMessage, now: f64) -> Result<(), ChannelError> {
        let result = self.check(&message, now);
        if let Err(err) = &result {
            self.rejected_messages += 1;
            warn!(error = %err, "rejected V2X message");
            return result;
        }

        self.liveness.touch(&message.agent_id, now);
        self.history.push_back(message.clone());
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
        self.messages.insert(message.agent_id.clone(), message);
        Ok(())
    }

    fn check(&mut self, message: &V2xMessage, now: f64) -> Result<(), ChannelError> {
        if !self.key.verify(message) {
            return Err(ChannelError::InvalidMac(message.agent_id.clone()));
        }
        if let Err(field) = message.validate() {
            return Err(ChannelError::InvalidRange {
                agent: message.agent_id.clone(),
                detail: field.to_string(),
            });
        }
        let too_old = now - message.timestamp > self.config.max_message_age;
        let regressed = self
            .messages
            .get(&message.agent_id)
            .is_some_and(|prev| message.timestamp <= prev.timestamp);
        if too_old || regressed {
            return Err(ChannelError::StaleMessage {
                agent: message.agent_id.clone(),
                timestamp: message.timestamp,
            });
        }
        if !self.limiter.allow(&message.agent_id, now) {
            return Err(ChannelError::RateLimited(message.agent_id.clone()));
        }
        Ok(())
    }

    /// Captures the consistent per-tick view.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            inner: Arc::new(self.messages.clone()),
        }
    }

    /// The last `n` accepted messages, oldest first.
    pub fn history(&self, n: usize) -> Vec<V2xMessage> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Publishes a side-channel alert, subject to its own rate limit.
    pub fn alert(&mut self, alert: Alert, now: f64) -> bool {
        if !self.alert_limiter.allow(&alert.from, now) {
            self.rejected_alerts += 1;
            return false;
        }
        self.alerts.push_back(alert);
        while self.alerts.len() > self.config.max_alerts {
            self.alerts.pop_front();
        }
        true
    }

    /// Alerts visible to `agent_id` from the last `window` seconds:
    /// broadcasts plus alerts targeted at it, excluding its own.
    pub fn alerts_for(&self, agent_id: &AgentId, window: f64, now: f64) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| {
                a.timestamp >= now - window
                    && a.from != *agent_id
                    && a.target.as_ref().is_none_or(|t| t == agent_id)
            })
            .cloned()
            .collect()
    }

    /// Removes agents with no update for the stale timeout. Returns the
    /// pruned ids.
    pub fn prune_stale(&mut self, now: f64) -> Vec<AgentId> {
        let stale = self.liveness.stale_agents(now);
        for id in &stale {
            self.messages.remove(id);
            self.liveness.remove(id);
            self.limiter.remove(id);
        }
        if !stale.is_empty() {
            warn!(?stale, "pruned silent agents from channel");
        }
        stale
    }

    /// Removes one agent entirely (despawn).
    pub fn remove(&mut self, agent_id: &AgentId) {
        self.messages.remove(agent_id);
        self.liveness.remove(agent_id);
        self.limiter.remove(agent_id);
    }

    pub fn security_stats(&self, now: f64) -> SecurityStats {
        SecurityStats {
            rejected_messages: self.rejected_messages,
            rejected_alerts: self.rejected_alerts,
            active_agents: self.messages.keys().cloned().collect(),
            stale_agents: self.liveness.stale_agents(now),
        }
    }

    /// Drops all state (restart).
    pub fn clear(&mut self) {
        self.messages.clear();
        self.history.clear();
        self.alerts.clear();
        self.limiter.reset();
        self.alert_limiter.reset();
        self.liveness.reset();
        self.rejected_messages = 0;
        self.rejected_alerts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageDraft, V_MAX};

    fn channel() -> V2xChannel {
        V2xChannel::new(MacKey::from_seed(7), ChannelConfig::default())
    }

    fn draft(id: &str, ts: f64) -> MessageDraft {
        let mut d = MessageDraft::new(AgentId::new(id), ts);
        d.x = 10.0;
        d.y = 20.0;
        d.speed = 12.0;
        d.heading = 180.0;
        d
    }

    #[test]
    fn test_publish_accepts_signed_message() {
        let mut ch = channel();
        let msg = ch.key().signed(draft("VH_A", 0.1).unsigned());
        assert!(ch.publish(msg, 0.1).is_ok());
        assert_eq!(ch.snapshot().len(), 1);
    }

    #[test]
    fn test_publish_rejects_bad_mac() {
        let mut ch = channel();
        let mut msg = ch.key().signed(draft("VH_A", 0.1).unsigned());
        msg.speed = 13.0; // tamper after signing
        assert!(matches!(
            ch.publish(msg, 0.1),
            Err(ChannelError::InvalidMac(_))
        ));
        assert_eq!(ch.security_stats(0.1).rejected_messages, 1);
    }

    #[test]
    fn test_publish_rejects_out_of_range() {
        let mut ch = channel();
        let mut d = draft("VH_A", 0.1);
        d.speed = V_MAX + 1.0;
        let msg = ch.key().signed(d.unsigned());
        assert!(matches!(
            ch.publish(msg, 0.1),
            Err(ChannelError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_timestamp_monotonicity() {
        let mut ch = channel();
        let first = ch.key().signed(draft("VH_A", 1.0).unsigned());
        assert!(ch.publish(first, 1.0).is_ok());

        // Same timestamp: rejected
        let repeat = ch.key().signed(draft("VH_A", 1.0).unsigned());
        assert!(matches!(
            ch.publish(repeat, 1.1),
            Err(ChannelError::StaleMessage { .. })
        ));

        // Strictly newer by epsilon: accepted
        let newer = ch.key().signed(draft("VH_A", 1.0 + 1e-6).unsigned());
        assert!(ch.publish(newer, 1.1).is_ok());
    }

    #[test]
    fn test_too_old_message_rejected() {
        let mut ch = channel();
        let msg = ch.key().signed(draft("VH_A", 1.0).unsigned());
        assert!(matches!(
            ch.publish(msg, 7.0),
            Err(ChannelError::StaleMessage { .. })
        ));
    }

    #[test]
    fn test_rate_limit() {
        let mut ch = V2xChannel::new(
            MacKey::from_seed(7),
            ChannelConfig {
                message_rate_limit: 2,
                ..Default::default()
            },
        );
        for i in 0..2 {
            let msg = ch.key().signed(draft("VH_A", 0.1 + i as f64 * 0.01).unsigned());
            assert!(ch.publish(msg, 0.1).is_ok());
        }
        let over = ch.key().signed(draft("VH_A", 0.2).unsigned());
        assert!(matches!(
            ch.publish(over, 0.2),
            Err(ChannelError::RateLimited(_))
        ));
    }

    #[test]
    fn test_snapshot_is_order_independent() {
        let mut ch1 = channel();
        let mut ch2 = channel();

        let a = ch1.key().signed(draft("VH_A", 0.1).unsigned());
        let b = ch1.key().signed(draft("VH_B", 0.1).unsigned());

        ch1.publish(a.clone(), 0.1).unwrap();
        ch1.publish(b.clone(), 0.1).unwrap();
        ch2.publish(b, 0.1).unwrap();
        ch2.publish(a, 0.1).unwrap();

        let ids1: Vec<_> = ch1.snapshot().iter().map(|(id, _)| id.clone()).collect();
        let ids2: Vec<_> = ch2.snapshot().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn test_snapshot_keeps_last_message_per_agent() {
        let mut ch = channel();
        ch.publish(ch.key().signed(draft("VH_A", 0.1).unsigned()), 0.1)
            .unwrap();
        let mut second = draft("VH_A", 0.2);
        second.speed = 5.0;
        ch.publish(ch.key().signed(second.unsigned()), 0.2).unwrap();

        let snap = ch.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get(&AgentId::new("VH_A")).unwrap().speed, 5.0);
    }

    #[test]
    fn test_prune_stale_agents() {
        let mut ch = channel();
        ch.publish(ch.key().signed(draft("VH_A", 0.1).unsigned()), 0.1)
            .unwrap();
        ch.publish(ch.key().signed(draft("VH_B", 4.0).unsigned()), 4.0)
            .unwrap();

        let pruned = ch.prune_stale(6.0);
        assert_eq!(pruned, vec![AgentId::new("VH_A")]);
        assert!(ch.snapshot().get(&AgentId::new("VH_A")).is_none());
        assert!(ch.snapshot().get(&AgentId::new("VH_B")).is_some());
    }

    #[test]
    fn test_alert_targeting_and_window() {
        let mut ch = channel();
        ch.alert(
            Alert {
                from: AgentId::new("AMB"),
                kind: "siren".into(),
                message: "coming through".into(),
                timestamp: 1.0,
                target: None,
            },
            1.0,
        );
        ch.alert(
            Alert {
                from: AgentId::new("AMB"),
                kind: "pull_over".into(),
                message: "move right".into(),
                timestamp: 1.1,
                target: Some(AgentId::new("VH_A")),
            },
            1.1,
        );

        let for_a = ch.alerts_for(&AgentId::new("VH_A"), 5.0, 1.2);
        assert_eq!(for_a.len(), 2);
        let for_b = ch.alerts_for(&AgentId::new("VH_B"), 5.0, 1.2);
        assert_eq!(for_b.len(), 1);
        // Own alerts are not echoed back
        let for_amb = ch.alerts_for(&AgentId::new("AMB"), 5.0, 1.2);
        assert!(for_amb.is_empty());
        // Outside the window nothing is visible
        assert!(ch.alerts_for(&AgentId::new("VH_A"), 5.0, 10.0).is_empty());
    }

    #[test]
    fn test_history_bounded_and_ordered() {
        let mut ch = channel();
        for i in 0..5 {
            let ts = 0.1 + i as f64 * 0.05;
            ch.publish(ch.key().signed(draft("VH_A", ts).unsigned()), ts)
                .unwrap();
        }
        let recent = ch.history(3);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].timestamp < recent[2].timestamp);
    }
}
