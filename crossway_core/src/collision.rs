//! Pair-wise collision prediction over a channel snapshot.
//!
//! Trajectories are extrapolated linearly and the time-to-collision is
//! the smallest `t >= 0` with `||p_a(t) - p_b(t)|| <= s_collision`,
//! solved in closed form from the quadratic in `t`.

use crate::channel::Snapshot;
use crate::message::{RiskLevel, V2xMessage};
use crossway_env::AgentId;
use nalgebra::Vector2;
use serde::Serialize;

/// Collision hitbox radius (meters). Two trajectories closing within this
/// distance count as a predicted contact.
pub const S_COLLISION: f64 = 3.0;

/// Spatial prefilter radius (meters): pairs farther apart than this are
/// skipped without solving the quadratic.
pub const PREFILTER_RADIUS: f64 = 120.0;

/// TTC classification thresholds (seconds).
pub const TTC_COLLISION: f64 = 1.5;
pub const TTC_HIGH: f64 = 3.0;
pub const TTC_MEDIUM: f64 = 5.0;

/// A predicted conflict between two agents, `a < b` lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollisionPair {
    pub a: AgentId,
    pub b: AgentId,
    pub ttc: f64,
    pub risk: RiskLevel,
}

/// Converts heading degrees (0 = north, 90 = east) and scalar speed into
/// a velocity vector.
pub fn velocity_of(message: &V2xMessage) -> Vector2<f64> {
    let rad = message.heading.to_radians();
    Vector2::new(message.speed * rad.sin(), message.speed * rad.cos())
}

/// Position vector of a message.
pub fn position_of(message: &V2xMessage) -> Vector2<f64> {
    Vector2::new(message.x, message.y)
}

/// Closed-form time-to-collision between two linear trajectories.
///
/// Returns `None` when the trajectories never close within the hitbox:
/// parallel courses, diverging pairs, or a discriminant below zero. A
/// pair already overlapping returns `Some(0.0)` regardless of relative
/// speed.
pub fn time_to_collision(a: &V2xMessage, b: &V2xMessage) -> Option<f64> {
    let p = position_of(b) - position_of(a);
    let v = velocity_of(b) - velocity_of(a);

    let c = p.dot(&p) - S_COLLISION * S_COLLISION;
    if c <= 0.0 {
        // Hitboxes already overlap
        return Some(0.0);
    }

    let a2 = v.dot(&v);
    if a2 < 1e-9 {
        // Zero relative velocity and not overlapping: never closes
        return None;
    }

    let b2 = 2.0 * p.dot(&v);
    let disc = b2 * b2 - 4.0 * a2 * c;
    if disc < 0.0 {
        return None;
    }

    let t = (-b2 - disc.sqrt()) / (2.0 * a2);
    if t >= 0.0 {
        Some(t)
    } else {
        None
    }
}

/// Maps a TTC to its risk class.
pub fn classify(ttc: Option<f64>) -> RiskLevel {
    match ttc {
        Some(t) if t <= TTC_COLLISION => RiskLevel::Collision,
        Some(t) if t <= TTC_HIGH => RiskLevel::High,
        Some(t) if t <= TTC_MEDIUM => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

/// Time for an agent to reach a fixed point along its current course, or
/// `None` if it is stopped or moving away.
pub fn time_to_point(message: &V2xMessage, point: Vector2<f64>) -> Option<f64> {
    if message.speed < 0.1 {
        return None;
    }
    let to_point = point - position_of(message);
    let dist = to_point.norm();
    if dist < 1e-9 {
        return Some(0.0);
    }
    let closing = velocity_of(message).dot(&to_point) / dist;
    if closing <= 0.0 {
        return None;
    }
    Some(dist / closing)
}

/// Computes all collision pairs above `low` risk for a snapshot.
///
/// Pairs are keyed `(min(a,b), max(a,b))` so each appears at most once;
/// the snapshot's sorted iteration keeps output order deterministic.
/// Infrastructure agents (speed 0 at origin of their box) participate
/// like any other sender but never close on anything, so they fall out
/// via the prefilter or classify as low.
pub fn collision_pairs(snapshot: &Snapshot) -> Vec<CollisionPair> {
    let messages: Vec<(&AgentId, &V2xMessage)> = snapshot.iter().collect();
    let mut pairs = Vec::new();

    for i in 0..messages.len() {
        for j in (i + 1)..messages.len() {
            let (id_a, msg_a) = messages[i];
            let (id_b, msg_b) = messages[j];

            let gap = (position_of(msg_a) - position_of(msg_b)).norm();
            if gap > PREFILTER_RADIUS {
                continue;
            }

            let ttc = time_to_collision(msg_a, msg_b);
            let risk = classify(ttc);
            if risk == RiskLevel::Low {
                continue;
            }

            // Snapshot iteration is id-sorted, so i < j implies a < b
            pairs.push(CollisionPair {
                a: id_a.clone(),
                b: id_b.clone(),
                ttc: ttc.unwrap_or(f64::INFINITY),
                risk,
            });
        }
    }

    pairs
}

/// Worst risk level involving the given agent, from a precomputed pair
/// list.
pub fn risk_for(agent_id: &AgentId, pairs: &[CollisionPair]) -> RiskLevel {
    pairs
        .iter()
        .filter(|p| p.a == *agent_id || p.b == *agent_id)
        .map(|p| p.risk)
        .max()
        .unwrap_or(RiskLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageDraft;

    fn msg(id: &str, x: f64, y: f64, speed: f64, heading: f64) -> V2xMessage {
        let mut d = MessageDraft::new(AgentId::new(id), 1.0);
        d.x = x;
        d.y = y;
        d.speed = speed;
        d.heading = heading;
        d.unsigned()
    }

    #[test]
    fn test_head_on_ttc() {
        // 100 m apart, closing at 20 m/s: contact at ~(100 - 3) / 20
        let a = msg("A", 0.0, 0.0, 10.0, 0.0); // north
        let b = msg("B", 0.0, 100.0, 10.0, 180.0); // south
        let ttc = time_to_collision(&a, &b).unwrap();
        assert!((ttc - (100.0 - S_COLLISION) / 20.0).abs() < 0.01);
    }

    #[test]
    fn test_perpendicular_ttc() {
        // Both 50 m out at 10 m/s toward the origin: paths meet there
        let a = msg("A", 0.0, -50.0, 10.0, 0.0); // northbound
        let b = msg("B", -50.0, 0.0, 10.0, 90.0); // eastbound
        let ttc = time_to_collision(&a, &b).unwrap();
        assert!(ttc > 4.0 && ttc < 5.0, "ttc = {ttc}");
    }

    #[test]
    fn test_parallel_trajectories_no_ttc() {
        let a = msg("A", 0.0, 0.0, 10.0, 0.0);
        let b = msg("B", 10.0, 0.0, 10.0, 0.0);
        assert_eq!(time_to_collision(&a, &b), None);
        assert_eq!(classify(time_to_collision(&a, &b)), RiskLevel::Low);
    }

    #[test]
    fn test_overlap_is_immediate_collision() {
        // Same spot, zero relative speed
        let a = msg("A", 0.0, 0.0, 0.0, 0.0);
        let b = msg("B", 1.0, 0.0, 0.0, 0.0);
        assert_eq!(time_to_collision(&a, &b), Some(0.0));
        assert_eq!(classify(Some(0.0)), RiskLevel::Collision);
    }

    #[test]
    fn test_diverging_pair_no_ttc() {
        let a = msg("A", 0.0, 0.0, 10.0, 180.0); // south
        let b = msg("B", 0.0, 50.0, 10.0, 0.0); // north
        assert_eq!(time_to_collision(&a, &b), None);
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(classify(Some(1.5)), RiskLevel::Collision);
        assert_eq!(classify(Some(2.9)), RiskLevel::High);
        assert_eq!(classify(Some(4.9)), RiskLevel::Medium);
        assert_eq!(classify(Some(5.1)), RiskLevel::Low);
        assert_eq!(classify(None), RiskLevel::Low);
    }

    #[test]
    fn test_pairs_are_ordered_and_unique() {
        use crate::channel::{ChannelConfig, V2xChannel};
        use crate::security::MacKey;

        let mut ch = V2xChannel::new(MacKey::from_seed(1), ChannelConfig::default());
        // Three vehicles converging on the origin
        for m in [
            msg("VH_C", 0.0, 60.0, 15.0, 180.0),
            msg("VH_A", 0.0, -60.0, 15.0, 0.0),
            msg("VH_B", -60.0, 0.0, 15.0, 90.0),
        ] {
            let now = m.timestamp;
            let signed = ch.key().signed(m);
            ch.publish(signed, now).unwrap();
        }

        let pairs = collision_pairs(&ch.snapshot());
        assert!(!pairs.is_empty());
        let mut seen = std::collections::HashSet::new();
        for p in &pairs {
            assert!(p.a < p.b, "pair not ordered: {:?}", p);
            assert!(seen.insert((p.a.clone(), p.b.clone())), "duplicate pair");
        }
    }

    #[test]
    fn test_prefilter_skips_distant_pairs() {
        use crate::channel::{ChannelConfig, V2xChannel};
        use crate::security::MacKey;

        let mut ch = V2xChannel::new(MacKey::from_seed(1), ChannelConfig::default());
        let a = msg("A", -200.0, 0.0, 14.0, 90.0);
        let b = msg("B", 200.0, 0.0, 14.0, 270.0);
        for m in [a, b] {
            let signed = ch.key().signed(m);
            ch.publish(signed, 1.0).unwrap();
        }
        // Head-on but 400 m apart: outside the prefilter radius
        assert!(collision_pairs(&ch.snapshot()).is_empty());
    }

    #[test]
    fn test_time_to_point() {
        let toward = msg("A", 0.0, -100.0, 10.0, 0.0);
        let t = time_to_point(&toward, Vector2::new(0.0, 0.0)).unwrap();
        assert!((t - 10.0).abs() < 0.01);

        let away = msg("B", 0.0, 100.0, 10.0, 0.0);
        assert_eq!(time_to_point(&away, Vector2::new(0.0, 0.0)), None);

        let stopped = msg("C", 0.0, -100.0, 0.0, 0.0);
        assert_eq!(time_to_point(&stopped, Vector2::new(0.0, 0.0)), None);
    }
}
