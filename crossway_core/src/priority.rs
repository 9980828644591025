//! Right-of-way and emergency-preemption arbitration.
//!
//! The arbiter looks at the snapshot and produces one advisory per agent:
//! `MayGo` or `MustYield`. Rules apply in order: emergency preemption,
//! clear first-arrival, priority-to-the-right, then an id tie-break.
//! Straight-on opposite-direction pairs never conflict and keep `MayGo`.

use crate::channel::Snapshot;
use crate::collision::{classify, position_of, time_to_collision, time_to_point};
use crate::intersection::axis_of;
use crate::message::{RiskLevel, V2xMessage};
use crossway_env::AgentId;
use nalgebra::Vector2;
use serde::Serialize;
use std::collections::BTreeMap;

/// Radius around a conflict zone inside which an approaching emergency
/// vehicle preempts everyone else (meters).
pub const PREEMPT_RADIUS: f64 = 60.0;

/// First-arrival margin: a time-to-intersection lead larger than this
/// settles priority without invoking the right-hand rule (seconds).
pub const FIRST_ARRIVAL_MARGIN: f64 = 2.0;

/// Per-agent arbitration outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Advisory {
    MayGo,
    MustYield,
}

/// Advisory plus the rule that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryEntry {
    pub advisory: Advisory,
    pub reason: &'static str,
}

impl AdvisoryEntry {
    fn may_go() -> Self {
        Self {
            advisory: Advisory::MayGo,
            reason: "clear",
        }
    }
}

/// Compass approach toward an intersection center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approach {
    North,
    East,
    South,
    West,
}

/// Which side of the intersection an agent is approaching from, judged by
/// its position relative to the center.
pub fn approach_of(message: &V2xMessage, center: Vector2<f64>) -> Approach {
    let delta = position_of(message) - center;
    if delta.x.abs() > delta.y.abs() {
        if delta.x > 0.0 {
            Approach::East
        } else {
            Approach::West
        }
    } else if delta.y > 0.0 {
        Approach::North
    } else {
        Approach::South
    }
}

/// Right-hand-traffic rule: `other` is on `mine`'s right.
pub fn is_on_right(mine: Approach, other: Approach) -> bool {
    matches!(
        (mine, other),
        (Approach::North, Approach::East)
            | (Approach::East, Approach::South)
            | (Approach::South, Approach::West)
            | (Approach::West, Approach::North)
    )
}

/// Resolves one conflicting pair. Returns advisories for `(a, b)` and the
/// rule name.
fn resolve_pair(
    a: &V2xMessage,
    b: &V2xMessage,
    center: Vector2<f64>,
) -> (Advisory, Advisory, &'static str) {
    // Rule 1: emergency preemption. Two converging emergencies resolve
    // like any other pair, ending at the id tie-break.
    if a.is_emergency && !b.is_emergency {
        return (Advisory::MayGo, Advisory::MustYield, "emergency_vehicle");
    }
    if b.is_emergency && !a.is_emergency {
        return (Advisory::MustYield, Advisory::MayGo, "emergency_vehicle");
    }

    // Rule 2: clear first arrival
    let t_a = time_to_point(a, center).unwrap_or(f64::INFINITY);
    let t_b = time_to_point(b, center).unwrap_or(f64::INFINITY);
    if (t_a - t_b).abs() > FIRST_ARRIVAL_MARGIN {
        return if t_a < t_b {
            (Advisory::MayGo, Advisory::MustYield, "first_arrival")
        } else {
            (Advisory::MustYield, Advisory::MayGo, "first_arrival")
        };
    }

    // Rule 3: priority to the right
    let app_a = approach_of(a, center);
    let app_b = approach_of(b, center);
    if is_on_right(app_a, app_b) {
        return (Advisory::MustYield, Advisory::MayGo, "right_of_way");
    }
    if is_on_right(app_b, app_a) {
        return (Advisory::MayGo, Advisory::MustYield, "right_of_way");
    }

    // Rule 4: id tie-break (also settles emergency-vs-emergency)
    if a.agent_id < b.agent_id {
        (Advisory::MayGo, Advisory::MustYield, "id_tiebreak")
    } else {
        (Advisory::MustYield, Advisory::MayGo, "id_tiebreak")
    }
}

/// Arrival-time window within which two crossing approaches contest the
/// same conflict zone (seconds).
const CONTEST_WINDOW: f64 = 4.0;

/// Separation under which a contested approach matters (meters).
const DANGER_RADIUS: f64 = 120.0;

/// Whether a pair needs arbitration: either their extrapolated hitboxes
/// actually close (high or collision risk), or they approach the same
/// center on crossing axes within the contest window. Parallel and
/// opposite straight-on courses share an axis and never conflict.
fn pair_conflicts(a: &V2xMessage, b: &V2xMessage, center: Vector2<f64>) -> bool {
    if classify(time_to_collision(a, b)) >= RiskLevel::High {
        return true;
    }
    if axis_of(a.heading) == axis_of(b.heading) {
        return false;
    }
    let (Some(t_a), Some(t_b)) = (time_to_point(a, center), time_to_point(b, center)) else {
        return false;
    };
    (t_a - t_b).abs() < CONTEST_WINDOW
        && (position_of(a) - position_of(b)).norm() < DANGER_RADIUS
}

/// Arbitrates the whole snapshot against a set of intersection centers.
///
/// Every agent starts at `MayGo`; each conflicting pair escalates the
/// loser to `MustYield`. An agent in several conflicts keeps the most
/// restrictive outcome. Emergency vehicles inside the preemption radius
/// additionally force every non-emergency agent near the same center to
/// yield, whatever the pair-wise geometry says.
pub fn arbitrate(
    snapshot: &Snapshot,
    centers: &[Vector2<f64>],
) -> BTreeMap<AgentId, AdvisoryEntry> {
    let mut advisories: BTreeMap<AgentId, AdvisoryEntry> = snapshot
        .iter()
        .map(|(id, _)| (id.clone(), AdvisoryEntry::may_go()))
        .collect();

    if centers.is_empty() {
        return advisories;
    }

    let nearest_center = |msg: &V2xMessage| -> Vector2<f64> {
        let pos = position_of(msg);
        centers
            .iter()
            .copied()
            .min_by(|a, b| {
                (pos - a)
                    .norm_squared()
                    .total_cmp(&(pos - b).norm_squared())
            })
            .unwrap_or_else(|| centers[0])
    };

    // Emergency preemption sweep
    for (_, emergency) in snapshot.iter().filter(|(_, m)| m.is_emergency) {
        let center = nearest_center(emergency);
        if (position_of(emergency) - center).norm() > PREEMPT_RADIUS {
            continue;
        }
        for (id, msg) in snapshot.iter() {
            if msg.is_emergency {
                continue;
            }
            if (position_of(msg) - center).norm() <= PREEMPT_RADIUS {
                advisories.insert(
                    id.clone(),
                    AdvisoryEntry {
                        advisory: Advisory::MustYield,
                        reason: "emergency_vehicle",
                    },
                );
            }
        }
    }

    // Pair-wise arbitration of actual conflicts
    let messages: Vec<(&AgentId, &V2xMessage)> = snapshot.iter().collect();
    for i in 0..messages.len() {
        for j in (i + 1)..messages.len() {
            let (id_a, msg_a) = messages[i];
            let (id_b, msg_b) = messages[j];

            let center = nearest_center(msg_a);
            if !pair_conflicts(msg_a, msg_b, center) {
                continue;
            }

            let (adv_a, adv_b, reason) = resolve_pair(msg_a, msg_b, center);

            for (id, adv) in [(id_a, adv_a), (id_b, adv_b)] {
                if adv == Advisory::MustYield {
                    let entry = advisories.get_mut(id).expect("advisory seeded above");
                    if entry.advisory == Advisory::MayGo {
                        *entry = AdvisoryEntry {
                            advisory: Advisory::MustYield,
                            reason,
                        };
                    }
                }
            }
        }
    }

    advisories
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, V2xChannel};
    use crate::message::MessageDraft;
    use crate::security::MacKey;

    fn msg(id: &str, x: f64, y: f64, speed: f64, heading: f64) -> V2xMessage {
        let mut d = MessageDraft::new(AgentId::new(id), 1.0);
        d.x = x;
        d.y = y;
        d.speed = speed;
        d.heading = heading;
        d.unsigned()
    }

    fn snapshot_of(messages: Vec<V2xMessage>) -> Snapshot {
        let mut ch = V2xChannel::new(MacKey::from_seed(1), ChannelConfig::default());
        for m in messages {
            let signed = ch.key().signed(m);
            ch.publish(signed, 1.0).unwrap();
        }
        ch.snapshot()
    }

    #[test]
    fn test_approach_quadrants() {
        let center = Vector2::new(0.0, 0.0);
        assert_eq!(approach_of(&msg("A", 0.0, 50.0, 10.0, 180.0), center), Approach::North);
        assert_eq!(approach_of(&msg("A", 50.0, 0.0, 10.0, 270.0), center), Approach::East);
        assert_eq!(approach_of(&msg("A", 0.0, -50.0, 10.0, 0.0), center), Approach::South);
        assert_eq!(approach_of(&msg("A", -50.0, 0.0, 10.0, 90.0), center), Approach::West);
    }

    #[test]
    fn test_right_hand_rule_cycle() {
        assert!(is_on_right(Approach::North, Approach::East));
        assert!(is_on_right(Approach::East, Approach::South));
        assert!(is_on_right(Approach::South, Approach::West));
        assert!(is_on_right(Approach::West, Approach::North));
        assert!(!is_on_right(Approach::East, Approach::North));
        assert!(!is_on_right(Approach::North, Approach::South));
    }

    #[test]
    fn test_right_of_way_pair() {
        // Same arrival time, perpendicular approaches: the agent with a
        // vehicle on its right yields.
        let center = Vector2::new(0.0, 0.0);
        let north = msg("VH_N", 0.0, 50.0, 10.0, 180.0);
        let east = msg("VH_E", 50.0, 0.0, 10.0, 270.0);
        let (adv_n, adv_e, reason) = resolve_pair(&north, &east, center);
        // East is to the right of north, so north yields
        assert_eq!(adv_n, Advisory::MustYield);
        assert_eq!(adv_e, Advisory::MayGo);
        assert_eq!(reason, "right_of_way");
    }

    #[test]
    fn test_emergency_outranks_right_of_way() {
        let center = Vector2::new(0.0, 0.0);
        let mut ambulance = msg("Z_AMB", 0.0, 50.0, 15.0, 180.0);
        ambulance.is_emergency = true;
        let civilian = msg("VH_E", 50.0, 0.0, 10.0, 270.0);
        let (adv_amb, adv_civ, reason) = resolve_pair(&ambulance, &civilian, center);
        assert_eq!(adv_amb, Advisory::MayGo);
        assert_eq!(adv_civ, Advisory::MustYield);
        assert_eq!(reason, "emergency_vehicle");
    }

    #[test]
    fn test_two_emergencies_resolve_by_id() {
        // Opposite approaches, same arrival time: no rule fires until the
        // id tie-break, which also settles emergency-vs-emergency.
        let center = Vector2::new(0.0, 0.0);
        let mut amb_a = msg("AMB_A", 0.0, 50.0, 15.0, 180.0);
        amb_a.is_emergency = true;
        let mut amb_b = msg("AMB_B", 0.0, -50.0, 15.0, 0.0);
        amb_b.is_emergency = true;
        let (adv_a, adv_b, reason) = resolve_pair(&amb_a, &amb_b, center);
        assert_eq!(reason, "id_tiebreak");
        assert_eq!(adv_a, Advisory::MayGo);
        assert_eq!(adv_b, Advisory::MustYield);
    }

    #[test]
    fn test_first_arrival_beats_right_hand_rule() {
        let center = Vector2::new(0.0, 0.0);
        // North agent is much closer: arrives ~2.5 s earlier
        let north = msg("VH_N", 0.0, 25.0, 10.0, 180.0);
        let east = msg("VH_E", 50.0, 0.0, 10.0, 270.0);
        let (adv_n, adv_e, reason) = resolve_pair(&north, &east, center);
        assert_eq!(adv_n, Advisory::MayGo);
        assert_eq!(adv_e, Advisory::MustYield);
        assert_eq!(reason, "first_arrival");
    }

    #[test]
    fn test_opposite_straight_paths_both_go() {
        // Head-on in adjacent lanes: paths never cross, no advisory flips
        let snap = snapshot_of(vec![
            msg("VH_UP", -10.0, -60.0, 14.0, 0.0),
            msg("VH_DOWN", 10.0, 60.0, 14.0, 180.0),
        ]);
        let advisories = arbitrate(&snap, &[Vector2::new(0.0, 0.0)]);
        for (_, entry) in &advisories {
            assert_eq!(entry.advisory, Advisory::MayGo);
        }
    }

    #[test]
    fn test_emergency_preemption_zone() {
        let mut ambulance = msg("AMB", -50.0, -10.0, 20.0, 90.0);
        ambulance.is_emergency = true;
        let near = msg("VH_NEAR", 10.0, -40.0, 10.0, 0.0);
        let far = msg("VH_FAR", 10.0, -200.0, 10.0, 0.0);
        let snap = snapshot_of(vec![ambulance, near, far]);

        let advisories = arbitrate(&snap, &[Vector2::new(0.0, 0.0)]);
        assert_eq!(
            advisories[&AgentId::new("VH_NEAR")].advisory,
            Advisory::MustYield
        );
        assert_eq!(advisories[&AgentId::new("VH_NEAR")].reason, "emergency_vehicle");
        assert_eq!(advisories[&AgentId::new("VH_FAR")].advisory, Advisory::MayGo);
        assert_eq!(advisories[&AgentId::new("AMB")].advisory, Advisory::MayGo);
    }

    #[test]
    fn test_conflicting_pair_gets_one_yield() {
        let snap = snapshot_of(vec![
            msg("VH_N", 0.0, 40.0, 15.0, 180.0),
            msg("VH_E", 40.0, 0.0, 15.0, 270.0),
        ]);
        let advisories = arbitrate(&snap, &[Vector2::new(0.0, 0.0)]);
        let yields = advisories
            .values()
            .filter(|e| e.advisory == Advisory::MustYield)
            .count();
        assert_eq!(yields, 1);
    }
}
