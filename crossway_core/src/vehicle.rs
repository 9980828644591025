//! Vehicle agents and the per-tick decision pipeline.
//!
//! A vehicle's decision runs in the parallel phase over a read-only
//! [`DecisionView`] of its own state plus the shared tick inputs, and
//! produces a [`DecisionOutcome`]. All mutation - committing the
//! decision, memory updates, kinematic integration, message publication -
//! happens later in the single-writer apply phase.
//!
//! Pipeline order: hard safety overrides, then the breaker-gated advisor,
//! then the deterministic adaptive cascade, with the oscillation damper
//! and pull-over maneuver layered on top. The drunk profile is an
//! adversary: its own overrides are suppressed while every peer keeps
//! theirs.

use crate::advisor::{AdvisorContext, GuardedAdvisor, PeerSummary};
use crate::channel::Snapshot;
use crate::collision::{position_of, risk_for, CollisionPair};
use crate::intersection::Clearance;
use crate::light::Signal;
use crate::memory::AgentMemory;
use crate::message::{Action, Decision, Intent, MessageDraft, RiskLevel, V2xMessage};
use crate::priority::{Advisory, AdvisoryEntry};
use crossway_env::{AdvisorError, AgentId};
use nalgebra::Vector2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;

/// Behavior profile of a vehicle, expressed as a tagged variant over one
/// decision interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorProfile {
    Normal,
    Emergency,
    Police,
    Drunk,
}

impl BehaviorProfile {
    pub fn is_emergency(&self) -> bool {
        matches!(self, BehaviorProfile::Emergency)
    }

    pub fn is_police(&self) -> bool {
        matches!(self, BehaviorProfile::Police)
    }

    pub fn is_drunk(&self) -> bool {
        matches!(self, BehaviorProfile::Drunk)
    }
}

/// Vehicle dynamics and perception tunables.
#[derive(Debug, Clone)]
pub struct VehicleConfig {
    /// Cruise ceiling for normal traffic (m/s).
    pub max_speed: f64,
    /// Response ceiling for emergency/police traffic (m/s).
    pub emergency_speed: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    /// Perception radius (meters).
    pub obs_radius: f64,
    /// Stop line distance from an intersection center (meters).
    pub stop_line: f64,
    /// Radius counted as "inside" the intersection box (meters).
    pub intersection_radius: f64,
    /// Follow rule: decelerate when leader TTC drops below this.
    pub follow_ttc: f64,
    /// Trailing-emergency detection range for pull-over (meters).
    pub pull_over_range: f64,
    /// Lateral offset target when pulled over (meters).
    pub pull_over_offset: f64,
    /// Probability per decision that a drunk driver ignores signals.
    pub drunk_disregard: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            max_speed: 14.0,
            emergency_speed: 25.2,
            acceleration: 2.0,
            deceleration: 4.0,
            obs_radius: 120.0,
            stop_line: 35.0,
            intersection_radius: 15.0,
            follow_ttc: 2.0,
            pull_over_range: 60.0,
            pull_over_offset: 4.0,
            drunk_disregard: 0.7,
        }
    }
}

/// Read-only copy of one vehicle's state handed to its decision task.
#[derive(Debug, Clone)]
pub struct DecisionView {
    pub id: AgentId,
    pub profile: BehaviorProfile,
    pub position: Vector2<f64>,
    pub heading: f64,
    pub speed: f64,
    pub target_speed: f64,
    pub intent: Intent,
    pub inside_intersection: bool,
    pub pulling_over: bool,
    /// Remaining forced-yield ticks from a tripped damper.
    pub damper_remaining: u8,
    /// Last four committed actions, oldest first.
    pub recent_actions: Vec<Action>,
    pub memory_digest: String,
    /// Seconds since the last advisor call from this agent.
    pub since_last_advisor_call: f64,
    /// Deterministic per-tick seed for probabilistic behavior.
    pub noise_seed: u64,
}

/// Shared per-tick inputs for one agent's decision.
#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub snapshot: Snapshot,
    pub pairs: std::sync::Arc<Vec<CollisionPair>>,
    pub advisory: Option<AdvisoryEntry>,
    /// Signal for this agent's axis when a light governs its intersection.
    pub signal: Option<Signal>,
    pub time_to_green: f64,
    /// Light speed guidance, when present.
    pub recommended_speed: Option<f64>,
    pub clearance: Option<Clearance>,
    /// Center of the governing intersection.
    pub intersection_center: Vector2<f64>,
    /// Whether this agent may issue an advisor call this tick.
    pub advisor_permitted: bool,
    pub now: f64,
    pub tick: u64,
}

/// Everything the apply phase needs to commit one agent's tick.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub id: AgentId,
    pub decision: Decision,
    pub risk: RiskLevel,
    pub pulling_over: bool,
    /// Set when the oscillation damper tripped this tick.
    pub trip_damper: bool,
    /// Whether an advisor call was actually issued.
    pub advisor_called: bool,
    /// Outcome of the advisor call, for the breaker.
    pub advisor_result: Option<Result<(), AdvisorError>>,
    /// One-line situation summary recorded into memory.
    pub context_summary: String,
    /// Near-misses to record: (peer, ttc).
    pub near_misses: Vec<(AgentId, f64)>,
}

/// What the agent perceives in the snapshot this tick.
struct Perception {
    /// Neighbors within the observation radius, nearest first.
    neighbors: Vec<PeerSummary>,
    /// Nearest same-lane vehicle ahead: (ttc, leader speed).
    leader: Option<(f64, f64)>,
    /// A trailing emergency vehicle on the same lane wants past.
    trailing_emergency: bool,
    risk: RiskLevel,
}

fn heading_delta(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

fn perceive(
    view: &DecisionView,
    snapshot: &Snapshot,
    pairs: &[CollisionPair],
    config: &VehicleConfig,
) -> Perception {
    let own_dir = Vector2::new(
        view.heading.to_radians().sin(),
        view.heading.to_radians().cos(),
    );

    let mut neighbors: Vec<(f64, PeerSummary, &V2xMessage)> = snapshot
        .others(&view.id)
        .filter_map(|(id, msg)| {
            let delta = position_of(msg) - view.position;
            let distance = delta.norm();
            if distance > config.obs_radius {
                return None;
            }
            let pair_ttc = pairs
                .iter()
                .find(|p| {
                    (p.a == view.id && p.b == *id) || (p.b == view.id && p.a == *id)
                })
                .map(|p| p.ttc)
                .filter(|t| t.is_finite());
            let summary = PeerSummary {
                id: id.clone(),
                x: msg.x,
                y: msg.y,
                speed: msg.speed,
                heading: msg.heading,
                is_emergency: msg.is_emergency,
                distance,
                ttc: pair_ttc,
                decision: msg.decision,
            };
            Some((distance, summary, msg))
        })
        .collect();
    neighbors.sort_by(|(a, sa, _), (b, sb, _)| a.total_cmp(b).then(sa.id.cmp(&sb.id)));

    let mut leader: Option<(f64, f64, f64)> = None; // (gap, ttc, speed)
    let mut trailing_emergency = false;

    for (distance, _, msg) in &neighbors {
        let delta = position_of(msg) - view.position;
        let along = delta.dot(&own_dir);
        let lateral = (delta - own_dir * along).norm();
        let same_lane = heading_delta(view.heading, msg.heading) < 30.0 && lateral < 6.0;

        if same_lane && along > 0.0 {
            // Ahead of us in our lane
            let closing = view.speed - msg.speed;
            let ttc = if closing > 0.1 {
                (along - 5.0).max(0.0) / closing
            } else {
                f64::INFINITY
            };
            if leader.as_ref().is_none_or(|(gap, _, _)| along < *gap) {
                leader = Some((along, ttc, msg.speed));
            }
        }

        if msg.is_emergency
            && same_lane
            && along < 0.0
            && *distance <= config.pull_over_range
            && !view.profile.is_emergency()
        {
            trailing_emergency = true;
        }
    }

    let risk = risk_for(&view.id, pairs);

    Perception {
        neighbors: neighbors.into_iter().map(|(_, s, _)| s).collect(),
        leader: leader.map(|(_, ttc, speed)| (ttc, speed)),
        trailing_emergency,
        risk,
    }
}

/// Distance from the agent to its stop line, measured along the approach.
fn distance_to_stop_line(view: &DecisionView, center: Vector2<f64>, config: &VehicleConfig) -> f64 {
    ((view.position - center).norm() - config.stop_line).max(0.0)
}

fn stopping_distance(speed: f64, config: &VehicleConfig) -> f64 {
    speed * speed / (2.0 * config.deceleration)
}

/// Hard pre-overrides that the advisor can never bypass. Returns `None`
/// when no override applies. Suppressed entirely for the drunk profile.
fn hard_overrides(
    view: &DecisionView,
    inputs: &DecisionInputs,
    perception: &Perception,
    config: &VehicleConfig,
) -> Option<Decision> {
    // Red light at the stop line
    if inputs.signal == Some(Signal::Red) && !view.inside_intersection {
        let to_line = distance_to_stop_line(view, inputs.intersection_center, config);
        if to_line <= stopping_distance(view.speed, config) + 2.0 {
            return Some(Decision::stop("red_light"));
        }
    }

    // Already inside: keep moving to clear the box
    if view.inside_intersection {
        return Some(Decision::new(Action::Go, config.max_speed.min(8.0), "clear_intersection"));
    }

    // Imminent collision
    if perception.risk == RiskLevel::Collision {
        return Some(Decision::new(Action::Brake, 0.0, "imminent_collision"));
    }

    // Yield to an emergency vehicle (preemption advisory or trailing)
    if perception.trailing_emergency {
        return Some(Decision::new(Action::Yield, 3.0, "pull_over"));
    }
    if let Some(entry) = &inputs.advisory {
        if entry.advisory == Advisory::MustYield && entry.reason == "emergency_vehicle" {
            return Some(Decision::new(Action::Yield, 0.0, "emergency_vehicle"));
        }
    }

    None
}

/// Deterministic fallback cascade used when the advisor is unavailable or
/// produced nothing. Always returns a decision.
fn adaptive_decision(
    view: &DecisionView,
    inputs: &DecisionInputs,
    perception: &Perception,
    config: &VehicleConfig,
) -> Decision {
    // Follow-distance rule
    if let Some((ttc, leader_speed)) = perception.leader {
        if ttc < config.follow_ttc {
            return Decision::new(
                Action::Brake,
                (leader_speed * 0.8).max(0.0),
                "follow_distance",
            );
        }
    }

    // Red light further out: pace down toward the line
    if inputs.signal == Some(Signal::Red) && !view.inside_intersection {
        let target = inputs
            .recommended_speed
            .unwrap_or(view.speed * 0.75)
            .min(view.speed * 0.75);
        return Decision::new(Action::Yield, target.max(0.0), "decelerate_for_red");
    }

    // Priority arbitration
    if let Some(entry) = &inputs.advisory {
        if entry.advisory == Advisory::MustYield {
            let dist = (view.position - inputs.intersection_center).norm();
            let factor = (dist / 40.0).min(1.0);
            return Decision::new(Action::Yield, view.speed * factor * 0.6, entry.reason);
        }
    }

    // Queued behind conflicting traffic at an uncontrolled intersection
    if inputs.clearance == Some(Clearance::Hold) {
        let to_line = distance_to_stop_line(view, inputs.intersection_center, config);
        if to_line <= stopping_distance(view.speed, config) + 2.0 {
            return Decision::stop("intersection_queue");
        }
        return Decision::new(Action::Yield, view.speed * 0.5, "intersection_queue");
    }

    // Clear: cruise at the limit (or the green-wave recommendation)
    let cruise = inputs
        .recommended_speed
        .unwrap_or(view.target_speed)
        .min(config.max_speed);
    Decision::new(Action::Go, cruise, "clear")
}

/// Adversarial variant for the drunk profile: probabilistic disregard of
/// signals and priority, with random speed transients. Peers still apply
/// all their own overrides; this agent is the hazard they handle.
fn drunk_decision(
    view: &DecisionView,
    inputs: &DecisionInputs,
    perception: &Perception,
    config: &VehicleConfig,
) -> Decision {
    let mut rng = ChaCha8Rng::seed_from_u64(view.noise_seed);
    let disregards: bool = rng.gen::<f64>() < config.drunk_disregard;

    let mut target = view.target_speed;
    if rng.gen::<f64>() < 0.08 {
        target = (target * rng.gen_range(0.5..1.5)).clamp(2.0, config.max_speed * 1.2);
    }

    if disregards {
        return Decision::new(Action::Go, target, "impaired");
    }

    // Occasionally the rules do get through
    let mut decision = adaptive_decision(view, inputs, perception, config);
    decision.reason = "impaired_compliant".to_string();
    decision
}

/// Whether the last four committed actions alternate go/stop.
fn oscillating(recent: &[Action]) -> bool {
    if recent.len() < 4 {
        return false;
    }
    let tail = &recent[recent.len() - 4..];
    tail == [Action::Go, Action::Stop, Action::Go, Action::Stop]
        || tail == [Action::Stop, Action::Go, Action::Stop, Action::Go]
}

fn context_summary(view: &DecisionView, inputs: &DecisionInputs, perception: &Perception) -> String {
    format!(
        "pos=({:.0},{:.0}) spd={:.1} risk={} signal={} near={} inside={}",
        view.position.x,
        view.position.y,
        view.speed,
        perception.risk.as_str(),
        match inputs.signal {
            Some(Signal::Green) => "green",
            Some(Signal::Red) => "red",
            None => "none",
        },
        perception.neighbors.len(),
        view.inside_intersection,
    )
}

/// Runs the full decision pipeline for one agent.
///
/// This is the only suspension point of the tick: the advisor call is
/// deadline-guarded inside [`GuardedAdvisor::advise`]. Everything else is
/// pure computation over the snapshot.
pub async fn decide(
    view: DecisionView,
    inputs: DecisionInputs,
    advisor: GuardedAdvisor,
    advisor_min_interval: f64,
    config: VehicleConfig,
) -> DecisionOutcome {
    let perception = perceive(&view, &inputs.snapshot, &inputs.pairs, &config);

    let near_misses: Vec<(AgentId, f64)> = inputs
        .pairs
        .iter()
        .filter(|p| p.risk >= RiskLevel::High)
        .filter_map(|p| {
            if p.a == view.id {
                Some((p.b.clone(), p.ttc))
            } else if p.b == view.id {
                Some((p.a.clone(), p.ttc))
            } else {
                None
            }
        })
        .collect();

    let summary = context_summary(&view, &inputs, &perception);

    let mut outcome = DecisionOutcome {
        id: view.id.clone(),
        decision: Decision::new(Action::Go, view.target_speed, "clear"),
        risk: perception.risk,
        pulling_over: false,
        trip_damper: false,
        advisor_called: false,
        advisor_result: None,
        context_summary: summary,
        near_misses,
    };

    // Emergency and police response: priority traffic keeps moving.
    // An imminent collision still caps speed, but never below the pace
    // needed to clear the scene.
    if view.profile.is_emergency() || view.profile.is_police() {
        let reason = if view.profile.is_emergency() {
            "emergency_response"
        } else {
            "patrol"
        };
        let target = if perception.risk == RiskLevel::Collision {
            8.0
        } else {
            config.emergency_speed
        };
        outcome.decision = Decision::new(Action::Go, target, reason);
        return outcome;
    }

    // Drunk driver: adversary path, overrides and damper suppressed
    if view.profile.is_drunk() {
        outcome.decision = drunk_decision(&view, &inputs, &perception, &config);
        return outcome;
    }

    if let Some(override_decision) = hard_overrides(&view, &inputs, &perception, &config) {
        outcome.pulling_over = override_decision.reason == "pull_over"
            || (view.pulling_over && perception.trailing_emergency);
        outcome.decision = override_decision;
    } else if view.damper_remaining > 0 {
        // Oscillation damper: a tripped damper holds the vehicle on a
        // gentle yield instead of flapping go/stop. Hard overrides above
        // still win.
        outcome.decision = Decision::new(Action::Yield, view.speed * 0.5, "oscillation_damper");
    } else {
        // Advisor, when the breaker and pacing allow it
        let mut decision = None;
        if inputs.advisor_permitted && view.since_last_advisor_call >= advisor_min_interval {
            let context = AdvisorContext {
                agent_id: view.id.clone(),
                x: view.position.x,
                y: view.position.y,
                speed: view.speed,
                heading: view.heading,
                intent: view.intent,
                is_emergency: false,
                inside_intersection: view.inside_intersection,
                risk: perception.risk,
                signal: inputs.signal,
                distance_to_stop_line: distance_to_stop_line(
                    &view,
                    inputs.intersection_center,
                    &config,
                ),
                advisory: inputs.advisory.as_ref().map(|e| e.advisory),
                peers: perception.neighbors.iter().take(3).cloned().collect(),
                memory_digest: view.memory_digest.clone(),
            };
            outcome.advisor_called = true;
            match advisor.advise(&context).await {
                Ok(suggestion) => {
                    outcome.advisor_result = Some(Ok(()));
                    decision = Some(suggestion);
                }
                Err(err) => {
                    outcome.advisor_result = Some(Err(err));
                }
            }
        }

        outcome.decision = decision
            .unwrap_or_else(|| adaptive_decision(&view, &inputs, &perception, &config));

        // Damper detection over the committed go/stop history
        if oscillating(&view.recent_actions) {
            outcome.trip_damper = true;
            outcome.decision =
                Decision::new(Action::Yield, view.speed * 0.5, "oscillation_damper");
        }
    }

    outcome
}

/// A vehicle owned by the simulation manager.
///
/// All fields are mutated exclusively in the apply phase; the decision
/// phase works from a [`DecisionView`] copy.
pub struct VehicleAgent {
    pub id: AgentId,
    pub profile: BehaviorProfile,
    pub position: Vector2<f64>,
    /// Heading in degrees, 0 = north, 90 = east.
    pub heading: f64,
    pub speed: f64,
    /// Cruise target when unconstrained.
    pub base_target_speed: f64,
    pub intent: Intent,
    pub waypoints: VecDeque<Vector2<f64>>,
    /// Background vehicles persist and reroute; scenario vehicles despawn
    /// after clearing the scene.
    pub persistent: bool,
    pub background: bool,

    pub decision: Decision,
    pub risk: RiskLevel,
    pub pulling_over: bool,
    pub inside_intersection: bool,
    passed_intersection: bool,
    lateral_shift: f64,
    damper_remaining: u8,

    pub memory: AgentMemory,
    pub llm_calls: u64,
    pub llm_errors: u64,
    last_advisor_call: f64,
    pub consecutive_faults: u32,
    last_published_ts: f64,

    config: VehicleConfig,
    rng: ChaCha8Rng,
}

impl VehicleAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AgentId,
        profile: BehaviorProfile,
        position: Vector2<f64>,
        heading: f64,
        speed: f64,
        target_speed: f64,
        intent: Intent,
        config: VehicleConfig,
        rng_seed: u64,
    ) -> Self {
        Self {
            id,
            profile,
            position,
            heading,
            speed,
            base_target_speed: target_speed,
            intent,
            waypoints: VecDeque::new(),
            persistent: false,
            background: false,
            decision: Decision::new(Action::Go, target_speed, "spawn"),
            risk: RiskLevel::Low,
            pulling_over: false,
            inside_intersection: false,
            passed_intersection: false,
            lateral_shift: 0.0,
            damper_remaining: 0,
            memory: AgentMemory::new(),
            llm_calls: 0,
            llm_errors: 0,
            last_advisor_call: f64::NEG_INFINITY,
            consecutive_faults: 0,
            last_published_ts: f64::NEG_INFINITY,
            config,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
        }
    }

    pub fn with_waypoints(mut self, waypoints: Vec<Vector2<f64>>) -> Self {
        self.waypoints = waypoints.into();
        self
    }

    pub fn config(&self) -> &VehicleConfig {
        &self.config
    }

    /// Builds the read-only view for this tick's decision task.
    pub fn view(&self, now: f64, noise_seed: u64) -> DecisionView {
        DecisionView {
            id: self.id.clone(),
            profile: self.profile,
            position: self.position,
            heading: self.heading,
            speed: self.speed,
            target_speed: self.base_target_speed,
            intent: self.intent,
            inside_intersection: self.inside_intersection,
            pulling_over: self.pulling_over,
            damper_remaining: self.damper_remaining,
            recent_actions: self.memory.recent_actions(4),
            memory_digest: self.memory.digest(now),
            since_last_advisor_call: now - self.last_advisor_call,
            noise_seed,
        }
    }

    /// Commits a decision outcome: decision state, memory, counters.
    /// Apply-phase only.
    pub fn apply_outcome(&mut self, outcome: &DecisionOutcome, now: f64, tick: u64) {
        self.decision = outcome.decision.clone();
        self.risk = outcome.risk;
        self.pulling_over = outcome.pulling_over;

        if outcome.trip_damper {
            // Forced yield this tick plus one more
            self.damper_remaining = 1;
        } else if self.damper_remaining > 0 {
            self.damper_remaining -= 1;
        }

        if outcome.advisor_called {
            self.last_advisor_call = now;
            match &outcome.advisor_result {
                Some(Ok(())) => self.llm_calls += 1,
                Some(Err(_)) => self.llm_errors += 1,
                None => {}
            }
        }

        for (peer, ttc) in &outcome.near_misses {
            self.memory.record_near_miss(
                peer.clone(),
                *ttc,
                self.position.x,
                self.position.y,
                tick,
            );
        }

        self.memory.record_decision(
            tick,
            now,
            outcome.context_summary.clone(),
            outcome.decision.action,
            outcome.decision.target_speed,
            &outcome.decision.reason,
        );

        self.consecutive_faults = 0;
    }

    /// Fallback when the decision task faulted: forced stop, counted.
    pub fn apply_fault(&mut self, now: f64, tick: u64) {
        self.consecutive_faults += 1;
        self.decision = Decision::stop("decision_fault");
        self.memory.record_decision(
            tick,
            now,
            "decision fault".to_string(),
            Action::Stop,
            0.0,
            "decision_fault",
        );
    }

    /// Integrates kinematics for one tick. Apply-phase only.
    pub fn integrate(&mut self, dt: f64, intersection_center: Vector2<f64>) {
        let target = self.effective_target();

        // Speed tracking with asymmetric accel/decel
        if self.speed < target {
            self.speed = (self.speed + self.config.acceleration * dt).min(target);
        } else if self.speed > target {
            self.speed = (self.speed - self.config.deceleration * dt).max(target);
        }
        self.speed = self.speed.max(0.0);

        // Drunk wander: heading noise plus the occasional lurch
        if self.profile.is_drunk() {
            let noise = Normal::new(0.0, 2.0).expect("valid stddev");
            self.heading =
                (self.heading + noise.sample(&mut self.rng)).rem_euclid(360.0);
            if self.rng.gen::<f64>() < 0.02 {
                self.speed = (self.speed * self.rng.gen_range(0.7..1.3)).max(0.0);
            }
        }

        // Waypoint following: snap heading toward the next waypoint
        if let Some(&wp) = self.waypoints.front() {
            let delta = wp - self.position;
            if delta.norm() < 6.0 {
                self.waypoints.pop_front();
                if let Some(&next) = self.waypoints.front() {
                    self.heading = heading_toward(self.position, next);
                }
            } else if !self.profile.is_drunk() {
                self.heading = heading_toward(self.position, wp);
            }
        }

        // Forward motion
        let rad = self.heading.to_radians();
        let forward = Vector2::new(rad.sin(), rad.cos());
        self.position += forward * self.speed * dt;

        // Pull-over lateral drift toward the right lane edge
        let drift_target = if self.pulling_over {
            self.config.pull_over_offset
        } else {
            0.0
        };
        if (self.lateral_shift - drift_target).abs() > 1e-6 {
            let step = 2.0 * dt;
            let right = Vector2::new(
                (self.heading + 90.0).to_radians().sin(),
                (self.heading + 90.0).to_radians().cos(),
            );
            let delta = (drift_target - self.lateral_shift).clamp(-step, step);
            self.lateral_shift += delta;
            self.position += right * delta;
        }

        // Intersection box bookkeeping
        let dist = (self.position - intersection_center).norm();
        self.inside_intersection = dist < self.config.intersection_radius;
        if self.inside_intersection {
            self.passed_intersection = true;
        }
    }

    fn effective_target(&self) -> f64 {
        match self.decision.action {
            Action::Go => self.decision.target_speed,
            Action::Yield => self.decision.target_speed.min(self.speed),
            Action::Brake => self.decision.target_speed.min(self.speed * 0.5),
            Action::Stop => 0.0,
        }
    }

    /// True when a non-persistent vehicle has cleared the scene and can
    /// despawn.
    pub fn finished(&self, intersection_center: Vector2<f64>) -> bool {
        if self.persistent {
            return false;
        }
        self.passed_intersection
            && (self.position - intersection_center).norm() > 120.0
    }

    /// Builds this tick's outgoing state message (unsigned draft).
    pub fn draft_message(&mut self, now: f64) -> MessageDraft {
        // Timestamps must be strictly monotonic per agent
        let ts = if now > self.last_published_ts {
            now
        } else {
            self.last_published_ts + 1e-6
        };
        self.last_published_ts = ts;

        let mut draft = MessageDraft::new(self.id.clone(), ts);
        draft.x = self.position.x;
        draft.y = self.position.y;
        draft.speed = self.speed;
        draft.heading = self.heading.rem_euclid(360.0);
        draft.intent = self.intent;
        draft.decision = self.decision.action;
        draft.risk_level = self.risk;
        draft.is_emergency = self.profile.is_emergency();
        draft.is_police = self.profile.is_police();
        draft.is_drunk = self.profile.is_drunk();
        draft.pulling_over = self.pulling_over;
        draft
    }
}

fn heading_toward(from: Vector2<f64>, to: Vector2<f64>) -> f64 {
    let delta = to - from;
    delta.x.atan2(delta.y).to_degrees().rem_euclid(360.0)
}
