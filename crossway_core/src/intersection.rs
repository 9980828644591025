//! Per-intersection occupancy tracking and passage arbitration.
//!
//! Each intersection keeps an arrival queue (ordered by arrival tick,
//! ties by id) and an occupancy set for its center box. Uncontrolled
//! intersections admit queue members whose axis does not cross any
//! current occupant; controlled intersections defer to the light.

use crate::channel::Snapshot;
use crate::collision::position_of;
use crate::message::V2xMessage;
use crossway_env::AgentId;
use nalgebra::Vector2;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, error};

/// Distance from the stop line at which an approaching vehicle joins the
/// arrival queue (meters).
pub const ARRIVE_RADIUS: f64 = 35.0;

/// Half-width of the center conflict box (meters).
pub const BOX_RADIUS: f64 = 15.0;

/// Extra distance beyond the arrival radius a queued agent may drift
/// before its slot is released.
pub const QUEUE_HYSTERESIS: f64 = 10.0;

/// Fatal coordination failure: two crossing trajectories were found
/// inside the same uncontrolled center box. This must never happen; the
/// tick loop treats it as unrecoverable and requires a restart.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("crossing occupancy at intersection ({x:.1}, {y:.1}): {a} and {b}")]
pub struct InvariantViolation {
    pub x: f64,
    pub y: f64,
    pub a: AgentId,
    pub b: AgentId,
}

/// Movement axis through an intersection, derived from heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    NorthSouth,
    EastWest,
}

/// Classifies a heading into its dominant axis.
pub fn axis_of(heading: f64) -> Axis {
    let rad = heading.to_radians();
    if rad.cos().abs() >= rad.sin().abs() {
        Axis::NorthSouth
    } else {
        Axis::EastWest
    }
}

/// Per-agent clearance verdict for the upcoming intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearance {
    /// Admitted: the agent may enter the center box.
    Proceed,
    /// Queued behind a conflicting occupant or non-head position.
    Hold,
}

/// One intersection of the grid.
#[derive(Debug, Clone)]
pub struct Intersection {
    pub center: Vector2<f64>,
    /// True when a traffic light governs admission instead of the queue.
    pub controlled: bool,
    /// Agents currently inside the center box.
    pub occupancy: BTreeSet<AgentId>,
    /// Arrival queue: (agent, arrival tick), kept in admission order.
    pub queue: Vec<(AgentId, u64)>,
}

impl Intersection {
    pub fn new(center: Vector2<f64>, controlled: bool) -> Self {
        Self {
            center,
            controlled,
            occupancy: BTreeSet::new(),
            queue: Vec::new(),
        }
    }

    fn in_box(&self, msg: &V2xMessage) -> bool {
        let delta = position_of(msg) - self.center;
        delta.x.abs() <= BOX_RADIUS && delta.y.abs() <= BOX_RADIUS
    }

    fn in_arrival_zone(&self, msg: &V2xMessage) -> bool {
        let dist = (position_of(msg) - self.center).norm();
        dist <= ARRIVE_RADIUS && !self.in_box(msg)
    }

    fn queued(&self, id: &AgentId) -> bool {
        self.queue.iter().any(|(qid, _)| qid == id)
    }
}

/// Coordinates occupancy and queueing across all grid intersections.
pub struct IntersectionCoordinator {
    intersections: Vec<Intersection>,
}

impl IntersectionCoordinator {
    pub fn new(centers: &[Vector2<f64>], controlled: &[bool]) -> Self {
        let intersections = centers
            .iter()
            .zip(controlled)
            .map(|(&c, &ctl)| Intersection::new(c, ctl))
            .collect();
        Self { intersections }
    }

    /// Single uncontrolled or controlled intersection at the origin.
    pub fn single(controlled: bool) -> Self {
        Self::new(&[Vector2::new(0.0, 0.0)], &[controlled])
    }

    pub fn intersections(&self) -> &[Intersection] {
        &self.intersections
    }

    pub fn centers(&self) -> Vec<Vector2<f64>> {
        self.intersections.iter().map(|i| i.center).collect()
    }

    /// Index of the intersection nearest to a message's position.
    fn nearest(&self, msg: &V2xMessage) -> Option<usize> {
        let pos = position_of(msg);
        self.intersections
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (pos - a.center)
                    .norm_squared()
                    .total_cmp(&(pos - b.center).norm_squared())
            })
            .map(|(i, _)| i)
    }

    /// Updates queues and occupancy from the tick's snapshot.
    ///
    /// Agents inside a center box move from queue to occupancy; agents
    /// that left the box are released; newly arriving agents join the
    /// queue ordered by arrival tick with id tie-break.
    pub fn observe(&mut self, snapshot: &Snapshot, tick: u64) {
        // Drop departed/stale agents everywhere first
        let live: BTreeSet<&AgentId> = snapshot.iter().map(|(id, _)| id).collect();
        for intersection in &mut self.intersections {
            intersection.occupancy.retain(|id| live.contains(id));
            intersection.queue.retain(|(id, _)| live.contains(id));
        }

        let mut arrivals: Vec<(usize, AgentId)> = Vec::new();

        for (id, msg) in snapshot.iter() {
            let Some(idx) = self.nearest(msg) else {
                continue;
            };
            let intersection = &mut self.intersections[idx];

            if intersection.in_box(msg) {
                intersection.queue.retain(|(qid, _)| qid != id);
                if intersection.occupancy.insert(id.clone()) {
                    debug!(agent = %id, x = intersection.center.x, y = intersection.center.y,
                        "entered intersection box");
                }
            } else {
                if intersection.occupancy.remove(id) {
                    debug!(agent = %id, "cleared intersection box");
                }
                let dist = (position_of(msg) - intersection.center).norm();
                if intersection.in_arrival_zone(msg) && !intersection.queued(id) {
                    arrivals.push((idx, id.clone()));
                } else if dist > ARRIVE_RADIUS + QUEUE_HYSTERESIS {
                    // Departed (or backed way off): release the slot
                    intersection.queue.retain(|(qid, _)| qid != id);
                }
            }
        }

        // Same-tick arrivals are inserted in id order (the tie-break)
        arrivals.sort_by(|(ia, a), (ib, b)| ia.cmp(ib).then(a.cmp(b)));
        for (idx, id) in arrivals {
            self.intersections[idx].queue.push((id, tick));
        }
    }

    /// Computes clearances for every queued agent.
    ///
    /// At an uncontrolled intersection the queue is walked in order and
    /// each agent is admitted if its axis does not cross any occupant or
    /// any agent admitted earlier this tick - the admitted set is maximal
    /// among non-conflicting paths. Controlled intersections return no
    /// verdict here; the light decides.
    pub fn clearances(&self, snapshot: &Snapshot) -> BTreeMap<AgentId, Clearance> {
        let mut verdicts = BTreeMap::new();

        for intersection in &self.intersections {
            if intersection.controlled {
                continue;
            }

            let mut blocked_axes: Vec<Axis> = intersection
                .occupancy
                .iter()
                .filter_map(|id| snapshot.get(id))
                .map(|msg| axis_of(msg.heading))
                .collect();

            for (id, _) in &intersection.queue {
                let Some(msg) = snapshot.get(id) else {
                    continue;
                };
                let axis = axis_of(msg.heading);
                let crossing = blocked_axes.iter().any(|&a| a != axis);
                if crossing {
                    verdicts.insert(id.clone(), Clearance::Hold);
                } else {
                    blocked_axes.push(axis);
                    verdicts.insert(id.clone(), Clearance::Proceed);
                }
            }
        }

        verdicts
    }

    /// Asserts the core safety invariant: no uncontrolled center box
    /// holds two admitted agents on crossing axes.
    ///
    /// Agents that bypass admission by design - impaired adversaries and
    /// preempting emergency/police traffic - are excluded: the invariant
    /// asserts the correctness of the coordinator's own admissions, and
    /// compliant traffic is what it admits.
    pub fn check_invariant(&self, snapshot: &Snapshot) -> Result<(), InvariantViolation> {
        for intersection in &self.intersections {
            if intersection.controlled {
                continue;
            }
            let occupants: Vec<(&AgentId, Axis)> = intersection
                .occupancy
                .iter()
                .filter_map(|id| snapshot.get(id).map(|m| (id, m)))
                .filter(|(_, m)| !m.is_drunk && !m.is_emergency && !m.is_police)
                .map(|(id, m)| (id, axis_of(m.heading)))
                .collect();
            for i in 0..occupants.len() {
                for j in (i + 1)..occupants.len() {
                    if occupants[i].1 != occupants[j].1 {
                        let violation = InvariantViolation {
                            x: intersection.center.x,
                            y: intersection.center.y,
                            a: occupants[i].0.clone(),
                            b: occupants[j].0.clone(),
                        };
                        error!(%violation, "coordinator invariant violated");
                        return Err(violation);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops an agent from every queue and occupancy set (despawn).
    pub fn remove(&mut self, agent_id: &AgentId) {
        for intersection in &mut self.intersections {
            intersection.occupancy.remove(agent_id);
            intersection.queue.retain(|(id, _)| id != agent_id);
        }
    }

    pub fn clear(&mut self) {
        for intersection in &mut self.intersections {
            intersection.occupancy.clear();
            intersection.queue.clear();
        }
    }
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
    fn test_axis_classification() {
        assert_eq!(axis_of(0.0), Axis::NorthSouth);
        assert_eq!(axis_of(180.0), Axis::NorthSouth);
        assert_eq!(axis_of(90.0), Axis::EastWest);
        assert_eq!(axis_of(270.0), Axis::EastWest);
        // 45 degrees ties toward north-south
        assert_eq!(axis_of(44.0), Axis::NorthSouth);
        assert_eq!(axis_of(46.0), Axis::EastWest);
    }

    #[test]
    fn test_arrival_queue_order() {
        let mut coord = IntersectionCoordinator::single(false);

        // VH_B arrives first (tick 5), VH_A and VH_C tie at tick 8
        coord.observe(&snapshot_of(vec![msg("VH_B", 0.0, 30.0, 10.0, 180.0)]), 5);
        coord.observe(
            &snapshot_of(vec![
                msg("VH_B", 0.0, 28.0, 10.0, 180.0),
                msg("VH_C", 30.0, 0.0, 10.0, 270.0),
                msg("VH_A", 0.0, -30.0, 10.0, 0.0),
            ]),
            8,
        );

        let queue: Vec<&AgentId> = coord.intersections()[0]
            .queue
            .iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(
            queue,
            vec![
                &AgentId::new("VH_B"),
                &AgentId::new("VH_A"),
                &AgentId::new("VH_C")
            ]
        );
    }

    #[test]
    fn test_box_entry_moves_queue_to_occupancy() {
        let mut coord = IntersectionCoordinator::single(false);
        coord.observe(&snapshot_of(vec![msg("VH_A", 0.0, 30.0, 10.0, 180.0)]), 1);
        assert_eq!(coord.intersections()[0].queue.len(), 1);

        coord.observe(&snapshot_of(vec![msg("VH_A", 0.0, 10.0, 10.0, 180.0)]), 2);
        assert!(coord.intersections()[0].queue.is_empty());
        assert!(coord.intersections()[0]
            .occupancy
            .contains(&AgentId::new("VH_A")));

        coord.observe(&snapshot_of(vec![msg("VH_A", 0.0, -40.0, 10.0, 180.0)]), 3);
        assert!(coord.intersections()[0].occupancy.is_empty());
    }

    #[test]
    fn test_crossing_queue_head_holds_behind_occupant() {
        let mut coord = IntersectionCoordinator::single(false);
        let snap = snapshot_of(vec![
            msg("VH_IN", 0.0, 5.0, 10.0, 180.0),   // inside, north-south
            msg("VH_E", 30.0, 0.0, 10.0, 270.0),   // queued, east-west
            msg("VH_S", 0.0, -30.0, 10.0, 0.0),    // queued, north-south
        ]);
        coord.observe(&snap, 1);

        let verdicts = coord.clearances(&snap);
        assert_eq!(verdicts[&AgentId::new("VH_E")], Clearance::Hold);
        // Same-axis follower is admitted alongside
        assert_eq!(verdicts[&AgentId::new("VH_S")], Clearance::Proceed);
    }

    #[test]
    fn test_admitted_set_is_maximal_non_crossing() {
        let mut coord = IntersectionCoordinator::single(false);
        let snap = snapshot_of(vec![
            msg("VH_A", 0.0, 30.0, 10.0, 180.0), // NS
            msg("VH_B", 0.0, -30.0, 10.0, 0.0),  // NS
            msg("VH_C", 30.0, 0.0, 10.0, 270.0), // EW
        ]);
        coord.observe(&snap, 1);

        let verdicts = coord.clearances(&snap);
        assert_eq!(verdicts[&AgentId::new("VH_A")], Clearance::Proceed);
        assert_eq!(verdicts[&AgentId::new("VH_B")], Clearance::Proceed);
        assert_eq!(verdicts[&AgentId::new("VH_C")], Clearance::Hold);
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut coord = IntersectionCoordinator::single(false);
        let snap = snapshot_of(vec![
            msg("VH_A", 0.0, 5.0, 10.0, 180.0), // inside, NS
            msg("VH_B", 5.0, 0.0, 10.0, 270.0), // inside, EW
        ]);
        coord.observe(&snap, 1);
        let err = coord.check_invariant(&snap).unwrap_err();
        assert_eq!(err.a, AgentId::new("VH_A"));
        assert_eq!(err.b, AgentId::new("VH_B"));
    }

    #[test]
    fn test_invariant_holds_for_same_axis_occupants() {
        let mut coord = IntersectionCoordinator::single(false);
        let snap = snapshot_of(vec![
            msg("VH_A", -10.0, 5.0, 10.0, 0.0),
            msg("VH_B", 10.0, -5.0, 10.0, 180.0),
        ]);
        coord.observe(&snap, 1);
        assert!(coord.check_invariant(&snap).is_ok());
    }

    #[test]
    fn test_controlled_intersection_defers_to_light() {
        let mut coord = IntersectionCoordinator::single(true);
        let snap = snapshot_of(vec![msg("VH_A", 0.0, 30.0, 10.0, 180.0)]);
        coord.observe(&snap, 1);
        assert!(coord.clearances(&snap).is_empty());
    }
}
