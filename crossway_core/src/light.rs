//! Adaptive traffic light with emergency preemption and V2I speed
//! guidance.
//!
//! Normal operation cycles `NS_GREEN -> ALL_RED -> EW_GREEN -> ALL_RED`.
//! An emergency vehicle approaching on a red axis preempts the cycle:
//! one second of `EMERGENCY_ALL_RED`, then the emergency's axis goes
//! green and holds until the vehicle clears; the interrupted phase then
//! resumes with a starvation credit.

use crate::channel::Snapshot;
use crate::collision::position_of;
use crate::intersection::{axis_of, Axis};
use crate::message::V2xMessage;
use crossway_env::AgentId;
use nalgebra::Vector2;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Traffic light phase, exported verbatim in the state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrafficPhase {
    #[serde(rename = "NS_GREEN")]
    NsGreen,
    #[serde(rename = "EW_GREEN")]
    EwGreen,
    #[serde(rename = "ALL_RED")]
    AllRed,
    #[serde(rename = "EMERGENCY_ALL_RED")]
    EmergencyAllRed,
}

impl TrafficPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficPhase::NsGreen => "NS_GREEN",
            TrafficPhase::EwGreen => "EW_GREEN",
            TrafficPhase::AllRed => "ALL_RED",
            TrafficPhase::EmergencyAllRed => "EMERGENCY_ALL_RED",
        }
    }

    /// The axis this phase greens, if any.
    fn green_axis(&self) -> Option<Axis> {
        match self {
            TrafficPhase::NsGreen => Some(Axis::NorthSouth),
            TrafficPhase::EwGreen => Some(Axis::EastWest),
            _ => None,
        }
    }

    fn for_axis(axis: Axis) -> Self {
        match axis {
            Axis::NorthSouth => TrafficPhase::NsGreen,
            Axis::EastWest => TrafficPhase::EwGreen,
        }
    }
}

/// Signal as seen by one vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Green,
    Red,
}

/// Per-vehicle guidance computed from phase timing (green wave).
#[derive(Debug, Clone, Serialize)]
pub struct SpeedRecommendation {
    pub recommended_speed: f64,
    pub action: &'static str,
    pub signal: Signal,
    pub time_to_green: f64,
}

/// Light timing parameters.
#[derive(Debug, Clone)]
pub struct LightConfig {
    /// Green phase duration (seconds).
    pub green_secs: f64,
    /// All-red interlock between greens (seconds).
    pub all_red_secs: f64,
    /// Emergency all-red hold before greening the emergency axis.
    pub emergency_all_red_secs: f64,
    /// Extra green granted to a phase suppressed by preemption.
    pub starvation_credit: f64,
    /// Emergency detection radius (meters).
    pub preempt_radius: f64,
    /// Cruise speed ceiling used in recommendations (m/s).
    pub max_speed: f64,
    /// Braking deceleration used for stop-distance guidance (m/s^2).
    pub decel: f64,
    /// Stop line distance from the center (meters).
    pub stop_line: f64,
    /// Distance under which green traffic slows for the box (meters).
    pub slow_zone: f64,
    /// Monitoring radius for recommendations (meters).
    pub approach: f64,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            green_secs: 15.0,
            all_red_secs: 2.0,
            emergency_all_red_secs: 1.0,
            starvation_credit: 5.0,
            preempt_radius: 60.0,
            max_speed: 14.0,
            decel: 4.0,
            stop_line: 35.0,
            slow_zone: 50.0,
            approach: 100.0,
        }
    }
}

/// Counters surfaced in the export and telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LightStats {
    pub phase_changes: u64,
    pub emergency_preemptions: u64,
    pub completed_preemptions: u64,
}

/// State saved when preemption interrupts the normal cycle.
#[derive(Debug, Clone)]
struct EmergencyHold {
    axis: Axis,
    /// Phase to restore once the vehicle clears.
    resume_phase: TrafficPhase,
    /// Remaining seconds of the interrupted phase.
    resume_remaining: f64,
}

/// One intersection's light.
pub struct TrafficLight {
    pub id: AgentId,
    pub center: Vector2<f64>,
    config: LightConfig,
    phase: TrafficPhase,
    remaining: f64,
    /// Axis the next green goes to after an interlock.
    next_green: Axis,
    hold: Option<EmergencyHold>,
    stats: LightStats,
}

impl TrafficLight {
    pub fn new(id: AgentId, center: Vector2<f64>, config: LightConfig) -> Self {
        let remaining = config.green_secs;
        Self {
            id,
            center,
            config,
            phase: TrafficPhase::NsGreen,
            remaining,
            next_green: Axis::EastWest,
            hold: None,
            stats: LightStats::default(),
        }
    }

    /// Pre-advances the normal cycle by `offset` seconds, used to stagger
    /// grid lights into a green wave.
    pub fn with_phase_offset(mut self, offset: f64) -> Self {
        let mut budget = offset.max(0.0);
        while budget > 0.0 {
            let step = budget.min(self.remaining);
            self.advance_cycle(step);
            budget -= step;
        }
        self
    }

    pub fn phase(&self) -> TrafficPhase {
        self.phase
    }

    pub fn phase_remaining(&self) -> f64 {
        self.remaining
    }

    pub fn stats(&self) -> &LightStats {
        &self.stats
    }

    /// True while preemption is holding a green for an emergency.
    pub fn emergency_mode(&self) -> bool {
        self.hold.is_some()
    }

    /// Advances the light by `dt`, reacting to emergencies in the
    /// snapshot. Called once per tick, before agent decisions.
    pub fn step(&mut self, dt: f64, snapshot: &Snapshot) {
        let emergency_axis = self.detect_emergency(snapshot);

        match (self.hold.is_some(), emergency_axis) {
            (false, Some(axis)) => self.begin_preemption(axis),
            (true, None) => {
                // The resumed phase takes effect at the next tick boundary
                self.end_preemption();
                return;
            }
            _ => {}
        }

        if let Some(hold_axis) = self.hold.as_ref().map(|h| h.axis) {
            if self.phase == TrafficPhase::EmergencyAllRed {
                self.remaining -= dt;
                if self.remaining <= 0.0 {
                    self.set_phase(TrafficPhase::for_axis(hold_axis), self.config.green_secs);
                }
            }
            // Holding green for the emergency: the timer is frozen until
            // the vehicle clears.
            return;
        }

        self.advance_cycle(dt);
    }

    /// Normal cycle progression.
    fn advance_cycle(&mut self, dt: f64) {
        self.remaining -= dt;
        while self.remaining <= 0.0 {
            let carry = self.remaining;
            match self.phase {
                TrafficPhase::NsGreen => {
                    self.next_green = Axis::EastWest;
                    self.set_phase(TrafficPhase::AllRed, self.config.all_red_secs);
                }
                TrafficPhase::EwGreen => {
                    self.next_green = Axis::NorthSouth;
                    self.set_phase(TrafficPhase::AllRed, self.config.all_red_secs);
                }
                TrafficPhase::AllRed => {
                    let next = TrafficPhase::for_axis(self.next_green);
                    self.set_phase(next, self.config.green_secs);
                }
                TrafficPhase::EmergencyAllRed => {
                    // Unreachable in normal cycling; handled in step()
                    break;
                }
            }
            self.remaining += carry;
        }
    }

    fn set_phase(&mut self, phase: TrafficPhase, remaining: f64) {
        if phase != self.phase {
            self.stats.phase_changes += 1;
        }
        self.phase = phase;
        self.remaining = remaining;
    }

    /// Finds an emergency vehicle inside the preemption radius that is
    /// closing on this intersection, returning its axis.
    fn detect_emergency(&self, snapshot: &Snapshot) -> Option<Axis> {
        let mut best: Option<(f64, Axis)> = None;
        for (_, msg) in snapshot.iter().filter(|(_, m)| m.is_emergency) {
            let dist = (position_of(msg) - self.center).norm();
            if dist > self.config.preempt_radius {
                continue;
            }
            if best.as_ref().is_none_or(|(d, _)| dist < *d) {
                best = Some((dist, axis_of(msg.heading)));
            }
        }
        best.map(|(_, axis)| axis)
    }

    fn begin_preemption(&mut self, axis: Axis) {
        let resume_phase = match self.phase {
            TrafficPhase::NsGreen | TrafficPhase::EwGreen => self.phase,
            // Interrupted mid-interlock: resume with the phase the
            // interlock was leading into.
            _ => TrafficPhase::for_axis(self.next_green),
        };
        let resume_remaining = match self.phase {
            TrafficPhase::NsGreen | TrafficPhase::EwGreen => self.remaining,
            _ => self.config.green_secs,
        };
        self.hold = Some(EmergencyHold {
            axis,
            resume_phase,
            resume_remaining,
        });
        self.stats.emergency_preemptions += 1;
        info!(light = %self.id, ?axis, "emergency preemption engaged");

        if self.phase.green_axis() == Some(axis) {
            // Already green for the emergency: hold it, no all-red needed
            return;
        }
        self.set_phase(
            TrafficPhase::EmergencyAllRed,
            self.config.emergency_all_red_secs,
        );
    }

    fn end_preemption(&mut self) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        self.stats.completed_preemptions += 1;
        // The suppressed phase resumes with a starvation credit
        let remaining = hold.resume_remaining + self.config.starvation_credit;
        self.set_phase(hold.resume_phase, remaining);
        info!(light = %self.id, phase = self.phase.as_str(), remaining,
            "emergency cleared, cycle resumed");
    }

    /// Whether a position is within this light's monitoring radius.
    pub fn in_approach(&self, position: Vector2<f64>) -> bool {
        (position - self.center).norm() <= self.config.approach
    }

    /// Signal for one vehicle's current axis.
    pub fn signal_for(&self, msg: &V2xMessage) -> Signal {
        match self.phase.green_axis() {
            Some(axis) if axis == axis_of(msg.heading) => Signal::Green,
            _ => Signal::Red,
        }
    }

    /// Seconds until the given axis next goes green (0 when green now).
    pub fn time_to_green(&self, axis: Axis) -> f64 {
        if self.phase.green_axis() == Some(axis) {
            return 0.0;
        }
        match self.phase {
            TrafficPhase::NsGreen | TrafficPhase::EwGreen => {
                self.remaining + self.config.all_red_secs
            }
            TrafficPhase::AllRed => {
                if self.next_green == axis {
                    self.remaining
                } else {
                    self.remaining + self.config.green_secs + self.config.all_red_secs
                }
            }
            TrafficPhase::EmergencyAllRed => self.remaining,
        }
    }

    /// Green-wave speed guidance for every vehicle in the snapshot.
    pub fn recommendations(&self, snapshot: &Snapshot) -> BTreeMap<AgentId, SpeedRecommendation> {
        let cfg = &self.config;
        let mut recs = BTreeMap::new();

        for (id, msg) in snapshot.iter() {
            let dist = (position_of(msg) - self.center).norm();
            if dist > cfg.approach {
                continue;
            }

            if msg.is_emergency {
                recs.insert(
                    id.clone(),
                    SpeedRecommendation {
                        recommended_speed: cfg.max_speed,
                        action: "emergency_override",
                        signal: Signal::Green,
                        time_to_green: 0.0,
                    },
                );
                continue;
            }

            if dist < 5.0 {
                recs.insert(
                    id.clone(),
                    SpeedRecommendation {
                        recommended_speed: msg.speed.min(cfg.max_speed),
                        action: "clear_intersection",
                        signal: Signal::Green,
                        time_to_green: 0.0,
                    },
                );
                continue;
            }

            let axis = axis_of(msg.heading);
            let rec = match self.signal_for(msg) {
                Signal::Green => {
                    if dist > cfg.slow_zone {
                        let time_to_arrive = if msg.speed > 0.1 {
                            dist / msg.speed
                        } else {
                            f64::INFINITY
                        };
                        if time_to_arrive <= self.remaining {
                            SpeedRecommendation {
                                recommended_speed: msg.speed.min(cfg.max_speed),
                                action: "maintain_speed_green",
                                signal: Signal::Green,
                                time_to_green: 0.0,
                            }
                        } else {
                            // Pace the vehicle onto the next green window
                            let next_green_in =
                                self.remaining + cfg.all_red_secs * 2.0 + cfg.green_secs;
                            let paced = (dist / next_green_in).clamp(2.0, cfg.max_speed);
                            SpeedRecommendation {
                                recommended_speed: paced,
                                action: "adjust_for_next_green",
                                signal: Signal::Green,
                                time_to_green: 0.0,
                            }
                        }
                    } else {
                        SpeedRecommendation {
                            recommended_speed: msg.speed.min(8.0),
                            action: "slow_in_intersection",
                            signal: Signal::Green,
                            time_to_green: 0.0,
                        }
                    }
                }
                Signal::Red => {
                    let stop_dist = msg.speed * msg.speed / (2.0 * cfg.decel);
                    let time_to_green = self.time_to_green(axis);
                    if dist <= stop_dist + cfg.stop_line {
                        SpeedRecommendation {
                            recommended_speed: 0.0,
                            action: "stop_red_light",
                            signal: Signal::Red,
                            time_to_green,
                        }
                    } else {
                        let target = if time_to_green > 0.0 {
                            dist / time_to_green
                        } else {
                            0.0
                        };
                        SpeedRecommendation {
                            recommended_speed: target.min(msg.speed * 0.75).max(0.0),
                            action: "decelerate_for_red",
                            signal: Signal::Red,
                            time_to_green,
                        }
                    }
                }
            };
            recs.insert(id.clone(), rec);
        }

        recs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, V2xChannel};
    use crate::message::MessageDraft;
    use crate::security::MacKey;

    const DT: f64 = 0.05;

    fn light() -> TrafficLight {
        TrafficLight::new(
            AgentId::new("INFRA_TL_01"),
            Vector2::new(0.0, 0.0),
            LightConfig::default(),
        )
    }

    fn msg(id: &str, x: f64, y: f64, speed: f64, heading: f64, emergency: bool) -> V2xMessage {
        let mut d = MessageDraft::new(AgentId::new(id), 1.0);
        d.x = x;
        d.y = y;
        d.speed = speed;
        d.heading = heading;
        d.is_emergency = emergency;
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

    fn run_for(light: &mut TrafficLight, secs: f64, snapshot: &Snapshot) {
        let ticks = (secs / DT).round() as u64;
        for _ in 0..ticks {
            light.step(DT, snapshot);
        }
    }

    #[test]
    fn test_normal_cycle_with_interlock() {
        let mut tl = light();
        let empty = Snapshot::default();

        assert_eq!(tl.phase(), TrafficPhase::NsGreen);
        run_for(&mut tl, 15.05, &empty);
        assert_eq!(tl.phase(), TrafficPhase::AllRed);
        run_for(&mut tl, 2.0, &empty);
        assert_eq!(tl.phase(), TrafficPhase::EwGreen);
        run_for(&mut tl, 15.05, &empty);
        assert_eq!(tl.phase(), TrafficPhase::AllRed);
        run_for(&mut tl, 2.0, &empty);
        assert_eq!(tl.phase(), TrafficPhase::NsGreen);
    }

    #[test]
    fn test_signal_for_axis() {
        let tl = light();
        let ns = msg("VH_N", 0.0, 50.0, 10.0, 180.0, false);
        let ew = msg("VH_E", 50.0, 0.0, 10.0, 270.0, false);
        assert_eq!(tl.signal_for(&ns), Signal::Green);
        assert_eq!(tl.signal_for(&ew), Signal::Red);
    }

    #[test]
    fn test_emergency_preemption_from_red_direction() {
        let mut tl = light();
        // NS is green; ambulance approaches eastbound (EW, red)
        let ambulance = msg("AMB", -50.0, -10.0, 20.0, 90.0, true);
        let snap = snapshot_of(vec![ambulance]);

        tl.step(DT, &snap);
        assert_eq!(tl.phase(), TrafficPhase::EmergencyAllRed);
        assert!(tl.emergency_mode());

        // After the one-second hold, the emergency axis goes green
        run_for(&mut tl, 1.0, &snap);
        assert_eq!(tl.phase(), TrafficPhase::EwGreen);
        assert_eq!(tl.stats().emergency_preemptions, 1);
    }

    #[test]
    fn test_preemption_holds_until_clear_then_credits() {
        let mut tl = light();
        // Burn 5 s of NS green first
        let empty = Snapshot::default();
        run_for(&mut tl, 5.0, &empty);
        let ns_remaining = tl.phase_remaining();

        let ambulance = msg("AMB", -50.0, -10.0, 20.0, 90.0, true);
        let snap = snapshot_of(vec![ambulance]);
        run_for(&mut tl, 1.0 + DT, &snap);
        assert_eq!(tl.phase(), TrafficPhase::EwGreen);

        // Holding: timer frozen while the ambulance is nearby
        let before = tl.phase_remaining();
        run_for(&mut tl, 3.0, &snap);
        assert_eq!(tl.phase(), TrafficPhase::EwGreen);
        assert!((tl.phase_remaining() - before).abs() < 1e-9);

        // Ambulance clears: interrupted NS green resumes with +5 s credit
        tl.step(DT, &empty);
        assert_eq!(tl.phase(), TrafficPhase::NsGreen);
        assert!(tl.phase_remaining() >= ns_remaining + 5.0 - 1e-6);
        assert_eq!(tl.stats().completed_preemptions, 1);
    }

    #[test]
    fn test_emergency_on_green_axis_holds_without_all_red() {
        let mut tl = light();
        // NS already green, ambulance northbound
        let ambulance = msg("AMB", 0.0, -50.0, 20.0, 0.0, true);
        let snap = snapshot_of(vec![ambulance]);

        tl.step(DT, &snap);
        assert_eq!(tl.phase(), TrafficPhase::NsGreen);
        assert!(tl.emergency_mode());
    }

    #[test]
    fn test_phase_offset_staggers_cycle() {
        let tl = TrafficLight::new(
            AgentId::new("TL_A"),
            Vector2::new(0.0, 0.0),
            LightConfig::default(),
        )
        .with_phase_offset(16.0);
        // 15 s NS green + 1 s into the interlock
        assert_eq!(tl.phase(), TrafficPhase::AllRed);
        assert!((tl.phase_remaining() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_red_recommendation_stops_at_line() {
        let tl = light();
        // Eastbound on red, close to the stop line
        let near = msg("VH_E", -40.0, -10.0, 14.0, 90.0, false);
        let snap = snapshot_of(vec![near]);
        let recs = tl.recommendations(&snap);
        let rec = &recs[&AgentId::new("VH_E")];
        assert_eq!(rec.signal, Signal::Red);
        assert_eq!(rec.action, "stop_red_light");
        assert_eq!(rec.recommended_speed, 0.0);
        assert!(rec.time_to_green > 0.0);
    }

    #[test]
    fn test_green_recommendation_maintains_speed() {
        let tl = light();
        // Northbound on green, far out, arrives well within the phase
        let cruiser = msg("VH_N", 10.0, -90.0, 12.0, 0.0, false);
        let snap = snapshot_of(vec![cruiser]);
        let recs = tl.recommendations(&snap);
        let rec = &recs[&AgentId::new("VH_N")];
        assert_eq!(rec.action, "maintain_speed_green");
        assert_eq!(rec.recommended_speed, 12.0);
    }

    #[test]
    fn test_emergency_recommendation_overrides() {
        let tl = light();
        let ambulance = msg("AMB", -80.0, -10.0, 20.0, 90.0, true);
        let snap = snapshot_of(vec![ambulance]);
        let recs = tl.recommendations(&snap);
        assert_eq!(recs[&AgentId::new("AMB")].action, "emergency_override");
    }
}
