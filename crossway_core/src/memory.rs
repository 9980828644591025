//! Per-agent experience memory.
//!
//! Every vehicle keeps a bounded record of what it decided, what nearly
//! went wrong, what peers broadcast at it, and the short lessons derived
//! from near-misses. The memory digest feeds the advisor prompt so the
//! model sees the agent's recent history. All buffers are bounded; a
//! despawned agent drops everything with its `VehicleAgent`.

use crate::message::Action;
use crossway_env::AgentId;
use serde::Serialize;
use std::collections::VecDeque;

/// Capacity of the decision ring.
const MAX_DECISIONS: usize = 20;
/// Capacity of near-miss and alert rings.
const MAX_EVENTS: usize = 10;
/// Capacity of the lesson set.
const MAX_LESSONS: usize = 5;
/// Waiting longer than this while stopped counts as stuck (seconds).
const STUCK_WAIT_SECS: f64 = 10.0;
/// Same-action streak that counts as stuck when stationary.
const STUCK_STREAK: u32 = 15;

/// One remembered decision.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    /// Tick when the decision was committed.
    pub tick: u64,
    /// One-line situation summary at decision time.
    pub context: String,
    pub action: Action,
    pub target_speed: f64,
    pub reason: String,
}

/// A dangerous approach that was survived.
#[derive(Debug, Clone, Serialize)]
pub struct NearMiss {
    pub peer: AgentId,
    pub ttc: f64,
    /// Position of this agent when the near-miss peaked.
    pub x: f64,
    pub y: f64,
    pub tick: u64,
}

/// A V2X alert absorbed into memory.
#[derive(Debug, Clone)]
pub struct RememberedAlert {
    pub from: AgentId,
    pub kind: String,
    pub message: String,
    pub tick: u64,
}

/// Aggregate memory statistics for the export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub decisions: usize,
    pub near_misses: usize,
    pub alerts_received: usize,
    pub lessons: usize,
    pub total_stops: u64,
    pub total_yields: u64,
    pub total_brakes: u64,
    pub time_waiting: f64,
    pub is_stuck: bool,
}

/// Bounded per-agent memory. Created at spawn, destroyed at despawn.
#[derive(Debug, Default)]
pub struct AgentMemory {
    decisions: VecDeque<DecisionRecord>,
    near_misses: VecDeque<NearMiss>,
    alerts: VecDeque<RememberedAlert>,
    lessons: VecDeque<String>,
    total_stops: u64,
    total_yields: u64,
    total_brakes: u64,
    last_action: Option<Action>,
    same_action_streak: u32,
    time_waiting: f64,
    wait_started: Option<f64>,
}

impl AgentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a committed decision and updates behavioral counters.
    pub fn record_decision(
        &mut self,
        tick: u64,
        now: f64,
        context: String,
        action: Action,
        target_speed: f64,
        reason: &str,
    ) {
        if self.last_action == Some(action) {
            self.same_action_streak += 1;
        } else {
            self.same_action_streak = 0;
        }
        self.last_action = Some(action);

        match action {
            Action::Stop => self.total_stops += 1,
            Action::Yield => self.total_yields += 1,
            Action::Brake => self.total_brakes += 1,
            Action::Go => {}
        }

        // Waiting = standing still on a stop/yield decision
        if matches!(action, Action::Stop | Action::Yield) && target_speed < 0.5 {
            self.wait_started.get_or_insert(now);
        } else if let Some(start) = self.wait_started.take() {
            self.time_waiting += now - start;
        }

        self.decisions.push_back(DecisionRecord {
            tick,
            context,
            action,
            target_speed,
            reason: reason.to_string(),
        });
        while self.decisions.len() > MAX_DECISIONS {
            self.decisions.pop_front();
        }
    }

    /// Records a near-miss and derives a lesson from it.
    pub fn record_near_miss(&mut self, peer: AgentId, ttc: f64, x: f64, y: f64, tick: u64) {
        let lesson = format!(
            "near-miss with {peer} (ttc={ttc:.1}s), approach more cautiously"
        );
        if !self.lessons.contains(&lesson) {
            self.lessons.push_back(lesson);
            while self.lessons.len() > MAX_LESSONS {
                self.lessons.pop_front();
            }
        }
        self.near_misses.push_back(NearMiss {
            peer,
            ttc,
            x,
            y,
            tick,
        });
        while self.near_misses.len() > MAX_EVENTS {
            self.near_misses.pop_front();
        }
    }

    /// Records an incoming V2X alert.
    pub fn record_alert(&mut self, from: AgentId, kind: &str, message: &str, tick: u64) {
        self.alerts.push_back(RememberedAlert {
            from,
            kind: kind.to_string(),
            message: message.to_string(),
            tick,
        });
        while self.alerts.len() > MAX_EVENTS {
            self.alerts.pop_front();
        }
    }

    /// Last `n` decision actions, oldest first. Drives the oscillation
    /// damper.
    pub fn recent_actions(&self, n: usize) -> Vec<Action> {
        let skip = self.decisions.len().saturating_sub(n);
        self.decisions.iter().skip(skip).map(|d| d.action).collect()
    }

    pub fn near_misses(&self) -> impl Iterator<Item = &NearMiss> {
        self.near_misses.iter()
    }

    /// Whether the agent appears deadlocked: waiting too long, or locked
    /// into a long stationary stop/yield streak.
    pub fn is_stuck(&self, now: f64) -> bool {
        if let Some(start) = self.wait_started {
            if now - start > STUCK_WAIT_SECS {
                return true;
            }
        }
        self.same_action_streak > STUCK_STREAK
            && matches!(self.last_action, Some(Action::Stop) | Some(Action::Yield))
    }

    /// Compact text digest for the advisor prompt: recent decisions,
    /// behavior stats, remembered near-misses, alerts, lessons.
    pub fn digest(&self, now: f64) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.decisions.is_empty() {
            parts.push("RECENT DECISIONS:".to_string());
            let skip = self.decisions.len().saturating_sub(5);
            for d in self.decisions.iter().skip(skip) {
                parts.push(format!(
                    "  tick {}: {} => {} (speed={:.1}, reason={})",
                    d.tick,
                    d.context,
                    d.action.as_str(),
                    d.target_speed,
                    d.reason
                ));
            }
        }

        let mut stats: Vec<String> = Vec::new();
        if self.total_stops > 0 {
            stats.push(format!("stops={}", self.total_stops));
        }
        if self.total_yields > 0 {
            stats.push(format!("yields={}", self.total_yields));
        }
        let waiting = self.waiting_time(now);
        if waiting > 0.0 {
            stats.push(format!("time_waiting={waiting:.1}s"));
        }
        if self.same_action_streak > 3 {
            if let Some(action) = self.last_action {
                stats.push(format!(
                    "WARNING: '{}' repeated {} times",
                    action.as_str(),
                    self.same_action_streak
                ));
            }
        }
        if !stats.is_empty() {
            parts.push(format!("BEHAVIOR: {}", stats.join(", ")));
        }

        if !self.near_misses.is_empty() {
            parts.push("NEAR-MISSES:".to_string());
            let skip = self.near_misses.len().saturating_sub(3);
            for nm in self.near_misses.iter().skip(skip) {
                parts.push(format!("  - {} at ttc={:.1}s", nm.peer, nm.ttc));
            }
        }

        if !self.alerts.is_empty() {
            parts.push("V2X ALERTS:".to_string());
            let skip = self.alerts.len().saturating_sub(3);
            for a in self.alerts.iter().skip(skip) {
                parts.push(format!("  - from {}: [{}] {}", a.from, a.kind, a.message));
            }
        }

        if !self.lessons.is_empty() {
            parts.push("LESSONS:".to_string());
            for lesson in &self.lessons {
                parts.push(format!("  - {lesson}"));
            }
        }

        parts.join("\n")
    }

    fn waiting_time(&self, now: f64) -> f64 {
        let mut total = self.time_waiting;
        if let Some(start) = self.wait_started {
            total += now - start;
        }
        total
    }

    pub fn stats(&self, now: f64) -> MemoryStats {
        MemoryStats {
            decisions: self.decisions.len(),
            near_misses: self.near_misses.len(),
            alerts_received: self.alerts.len(),
            lessons: self.lessons.len(),
            total_stops: self.total_stops,
            total_yields: self.total_yields,
            total_brakes: self.total_brakes,
            time_waiting: self.waiting_time(now),
            is_stuck: self.is_stuck(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_ring_is_bounded() {
        let mut mem = AgentMemory::new();
        for i in 0..30 {
            mem.record_decision(i, i as f64 * 0.05, "ctx".into(), Action::Go, 10.0, "clear");
        }
        assert_eq!(mem.stats(2.0).decisions, MAX_DECISIONS);
        // Oldest entries were evicted
        assert_eq!(mem.recent_actions(100).len(), MAX_DECISIONS);
    }

    #[test]
    fn test_recent_actions_order() {
        let mut mem = AgentMemory::new();
        mem.record_decision(0, 0.0, "a".into(), Action::Go, 10.0, "r");
        mem.record_decision(1, 0.1, "b".into(), Action::Stop, 0.0, "r");
        mem.record_decision(2, 0.2, "c".into(), Action::Go, 10.0, "r");
        assert_eq!(
            mem.recent_actions(2),
            vec![Action::Stop, Action::Go]
        );
    }

    #[test]
    fn test_near_miss_derives_unique_lessons() {
        let mut mem = AgentMemory::new();
        let peer = AgentId::new("VH_B");
        mem.record_near_miss(peer.clone(), 2.3, 0.0, 0.0, 10);
        mem.record_near_miss(peer.clone(), 2.3, 1.0, 0.0, 11);
        let stats = mem.stats(1.0);
        assert_eq!(stats.near_misses, 2);
        // Identical lesson text is not duplicated
        assert_eq!(stats.lessons, 1);
    }

    #[test]
    fn test_waiting_time_accumulates() {
        let mut mem = AgentMemory::new();
        mem.record_decision(0, 0.0, "red".into(), Action::Stop, 0.0, "red_light");
        mem.record_decision(1, 2.0, "red".into(), Action::Stop, 0.0, "red_light");
        assert!((mem.stats(3.0).time_waiting - 3.0).abs() < 1e-9);

        mem.record_decision(2, 4.0, "green".into(), Action::Go, 10.0, "clear");
        assert!((mem.stats(9.0).time_waiting - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_stuck_detection_on_long_wait() {
        let mut mem = AgentMemory::new();
        mem.record_decision(0, 0.0, "red".into(), Action::Stop, 0.0, "red_light");
        assert!(!mem.is_stuck(5.0));
        assert!(mem.is_stuck(11.0));
    }

    #[test]
    fn test_digest_mentions_history_and_lessons() {
        let mut mem = AgentMemory::new();
        mem.record_decision(3, 0.15, "pos=(0,40)".into(), Action::Yield, 4.0, "right_of_way");
        mem.record_near_miss(AgentId::new("VH_X"), 1.8, 0.0, 20.0, 4);
        let digest = mem.digest(0.2);
        assert!(digest.contains("RECENT DECISIONS"));
        assert!(digest.contains("right_of_way"));
        assert!(digest.contains("NEAR-MISSES"));
        assert!(digest.contains("LESSONS"));
    }
}
