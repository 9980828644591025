//! The simulation manager: lifecycle, the tick loop and state export.
//!
//! One logical tick is the unit of progress, driven in strict phase
//! order: broadcast collection, infrastructure advance, collision and
//! priority computation, parallel agent decisions over the immutable
//! snapshot, the single-writer apply phase, kinematic integration, and
//! finally export. Agent decision tasks are the only code that may
//! suspend (the advisor call); everything they produce is committed
//! sequentially in deterministic id order.

use crate::config::SimConfig;
use crate::export::{
    ExportedAgent, ExportedLight, ExportedPair, ExportedState, ExportedStats,
};
use crate::grid::{BackgroundTraffic, GridLayout};
use crate::scenarios::{ScenarioId, VehicleBlueprint};
use crossway_core::advisor::GuardedAdvisor;
use crossway_core::breaker::{BreakerState, CircuitBreaker, TickPermit};
use crossway_core::channel::{Alert, V2xChannel};
use crossway_core::collision::collision_pairs;
use crossway_core::intersection::{IntersectionCoordinator, InvariantViolation};
use crossway_core::light::{LightConfig, TrafficLight};
use crossway_core::message::{Action, RiskLevel};
use crossway_core::priority::arbitrate;
use crossway_core::security::MacKey;
use crossway_core::telemetry::{TelemetryCollector, TelemetryReport};
use crossway_core::vehicle::{decide, BehaviorProfile, DecisionInputs, DecisionOutcome, VehicleAgent};
use crossway_core::CollisionPair;
use crossway_env::{AdvisorError, AdvisorTransport, AgentId, VirtualClock, WorldClock};
use nalgebra::Vector2;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Speed of the coordinated green wave across the grid (m/s).
const GREEN_WAVE_SPEED: f64 = 13.0;

/// Operating mode chosen at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Full 5x5 grid with background traffic.
    City,
    /// Single demo intersection driven by a named scenario.
    Scenario,
}

/// Kinds of vehicles that can be injected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnKind {
    Drunk,
    Police,
    Ambulance,
}

impl std::str::FromStr for SpawnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drunk" => Ok(SpawnKind::Drunk),
            "police" => Ok(SpawnKind::Police),
            "ambulance" => Ok(SpawnKind::Ambulance),
            _ => Err(format!("unknown spawn kind: {s}")),
        }
    }
}

/// Owns every shared structure: channel, breaker, coordinator, lights,
/// vehicles, telemetry. All mutation happens inside `tick`.
pub struct SimulationManager {
    config: SimConfig,
    mode: SimMode,
    clock: VirtualClock,
    running: bool,
    tick: u64,
    started_at: f64,
    scenario: Option<ScenarioId>,

    grid: GridLayout,
    channel: V2xChannel,
    breaker: CircuitBreaker,
    advisor: GuardedAdvisor,
    coordinator: IntersectionCoordinator,
    lights: Vec<TrafficLight>,
    vehicles: BTreeMap<AgentId, VehicleAgent>,
    background: BackgroundTraffic,
    telemetry: TelemetryCollector,

    last_pairs: Vec<CollisionPair>,
    prev_collision_set: BTreeSet<(AgentId, AgentId)>,
    prev_high_set: BTreeSet<(AgentId, AgentId)>,
    prev_completed_preemptions: u64,
    spawn_counter: u32,
}

impl SimulationManager {
    pub fn new(
        mode: SimMode,
        config: SimConfig,
        advisor_transport: Arc<dyn AdvisorTransport>,
    ) -> Self {
        let grid = match mode {
            SimMode::City => GridLayout::new(
                config.grid_cols,
                config.grid_rows,
                config.grid_spacing,
                config.lane_offset,
            ),
            SimMode::Scenario => GridLayout::single(config.lane_offset),
        };

        let key = MacKey::from_seed(config.seed.wrapping_mul(0x517cc1b727220a95));
        let channel = V2xChannel::new(key, config.channel.clone());
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let advisor = GuardedAdvisor::new(advisor_transport, &config.advisor);
        let telemetry = TelemetryCollector::new(config.weights.clone());
        let background = BackgroundTraffic::new(config.seed.wrapping_mul(0x9e3779b97f4a7c15));

        let (coordinator, lights) = match mode {
            SimMode::City => Self::city_infrastructure(&grid, &config.light),
            SimMode::Scenario => (IntersectionCoordinator::single(false), Vec::new()),
        };

        Self {
            config,
            mode,
            clock: VirtualClock::new(),
            running: false,
            tick: 0,
            started_at: 0.0,
            scenario: None,
            grid,
            channel,
            breaker,
            advisor,
            coordinator,
            lights,
            vehicles: BTreeMap::new(),
            background,
            telemetry,
            last_pairs: Vec::new(),
            prev_collision_set: BTreeSet::new(),
            prev_high_set: BTreeSet::new(),
            prev_completed_preemptions: 0,
            spawn_counter: 0,
        }
    }

    /// Builds the grid coordinator plus green-wave staggered corner
    /// lights.
    fn city_infrastructure(
        grid: &GridLayout,
        light_config: &LightConfig,
    ) -> (IntersectionCoordinator, Vec<TrafficLight>) {
        let centers = grid.intersections().to_vec();
        let controlled: Vec<bool> = centers
            .iter()
            .map(|c| grid.light_positions().iter().any(|l| (l - c).norm() < 1.0))
            .collect();
        let coordinator = IntersectionCoordinator::new(&centers, &controlled);

        let mut xs: Vec<f64> = centers.iter().map(|c| c.x).collect();
        let mut ys: Vec<f64> = centers.iter().map(|c| c.y).collect();
        xs.sort_by(|a, b| a.total_cmp(b));
        xs.dedup();
        ys.sort_by(|a, b| a.total_cmp(b));
        ys.dedup();

        let travel = grid.spacing / GREEN_WAVE_SPEED;
        let cycle = 2.0 * (light_config.green_secs + light_config.all_red_secs);

        let lights = grid
            .light_positions()
            .iter()
            .enumerate()
            .map(|(i, &pos)| {
                let col = xs.iter().position(|&x| (x - pos.x).abs() < 1.0).unwrap_or(0);
                let row = ys.iter().position(|&y| (y - pos.y).abs() < 1.0).unwrap_or(0);
                let offset = (col as f64 * travel + row as f64 * travel * 0.5) % cycle;
                TrafficLight::new(
                    AgentId::new(format!("INFRA_TL_{:02}", i + 1)),
                    pos,
                    light_config.clone(),
                )
                .with_phase_offset(offset)
            })
            .collect();

        (coordinator, lights)
    }

    /// Starts a run. In scenario mode `scenario` picks the parameter set
    /// (default `right_of_way`); in city mode it is ignored and the
    /// background population is spawned instead.
    pub fn start(&mut self, scenario: Option<ScenarioId>) {
        let now = self.clock.now_secs();
        self.clear_vehicles();
        self.channel.clear();
        self.coordinator.clear();
        self.telemetry.reset(now);
        self.last_pairs.clear();
        self.prev_collision_set.clear();
        self.prev_high_set.clear();
        self.prev_completed_preemptions = 0;

        match self.mode {
            SimMode::Scenario => {
                let scenario = scenario.unwrap_or(ScenarioId::RightOfWay);
                self.scenario = Some(scenario);

                self.coordinator = IntersectionCoordinator::single(scenario.uses_light());
                self.lights = if scenario.uses_light() {
                    vec![TrafficLight::new(
                        AgentId::new("INFRA_TL_01"),
                        Vector2::new(0.0, 0.0),
                        self.config.light.clone(),
                    )]
                } else {
                    Vec::new()
                };

                for (i, blueprint) in scenario
                    .blueprints(self.config.lane_offset)
                    .into_iter()
                    .enumerate()
                {
                    let vehicle = self.vehicle_from_blueprint(&blueprint, i as u64);
                    self.vehicles.insert(vehicle.id.clone(), vehicle);
                }
                self.telemetry.scenario_started(scenario.name(), now);
                info!(scenario = scenario.name(), vehicles = self.vehicles.len(), "scenario started");
            }
            SimMode::City => {
                self.scenario = None;
                let (coordinator, lights) =
                    Self::city_infrastructure(&self.grid, &self.config.light);
                self.coordinator = coordinator;
                self.lights = lights;
                self.spawn_background();
                self.telemetry.scenario_started("city", now);
                info!(vehicles = self.vehicles.len(), "city mode started");
            }
        }

        self.started_at = now;
        self.running = true;
    }

    pub fn stop(&mut self) {
        if self.running {
            self.telemetry.scenario_ended(self.clock.now_secs());
        }
        self.running = false;
        info!("simulation stopped");
    }

    pub fn restart(&mut self) {
        let scenario = self.scenario;
        self.stop();
        self.start(scenario);
    }

    fn clear_vehicles(&mut self) {
        let ids: Vec<AgentId> = self.vehicles.keys().cloned().collect();
        for id in ids {
            self.remove_vehicle(&id);
        }
    }

    fn remove_vehicle(&mut self, id: &AgentId) {
        self.vehicles.remove(id);
        self.channel.remove(id);
        self.coordinator.remove(id);
    }

    fn vehicle_from_blueprint(&self, blueprint: &VehicleBlueprint, index: u64) -> VehicleAgent {
        VehicleAgent::new(
            AgentId::new(blueprint.id),
            blueprint.profile,
            Vector2::new(blueprint.x, blueprint.y),
            blueprint.heading,
            blueprint.speed,
            blueprint.target_speed,
            blueprint.intent,
            self.config.vehicle.clone(),
            self.config.seed ^ index.wrapping_mul(0x9e3779b97f4a7c15),
        )
    }

    /// Injects a runtime-spawned vehicle near the demo intersection.
    pub fn spawn(&mut self, kind: SpawnKind) -> AgentId {
        self.spawn_counter += 1;
        let lane = self.config.lane_offset;
        let demo = self.grid.demo_intersection();

        let (id, profile, pos, heading, speed) = match kind {
            SpawnKind::Drunk => (
                format!("DRUNK_{:03}", self.spawn_counter),
                BehaviorProfile::Drunk,
                demo + Vector2::new(120.0, lane),
                270.0,
                14.0,
            ),
            SpawnKind::Police => (
                format!("POLICE_{:03}", self.spawn_counter),
                BehaviorProfile::Police,
                demo + Vector2::new(-120.0, -lane),
                90.0,
                20.0,
            ),
            SpawnKind::Ambulance => (
                format!("AMBULANCE_{:03}", self.spawn_counter),
                BehaviorProfile::Emergency,
                demo + Vector2::new(-120.0, -lane),
                90.0,
                25.2,
            ),
        };

        let agent_id = AgentId::new(&id);
        let vehicle = VehicleAgent::new(
            agent_id.clone(),
            profile,
            pos,
            heading,
            speed,
            speed,
            crossway_core::message::Intent::Through,
            self.config.vehicle.clone(),
            self.config.seed ^ (self.spawn_counter as u64).wrapping_mul(0x2545f4914f6cdd1d),
        );
        info!(id = %agent_id, ?kind, "vehicle spawned");
        self.vehicles.insert(agent_id.clone(), vehicle);
        agent_id
    }

    /// Switches background traffic on or off. Only meaningful on the
    /// city grid.
    pub fn toggle_background_traffic(&mut self) -> bool {
        if self.grid.intersections().len() <= 1 {
            warn!("background traffic needs the city grid");
            return false;
        }
        if self.background.active {
            let ids: Vec<AgentId> = self
                .vehicles
                .values()
                .filter(|v| v.background)
                .map(|v| v.id.clone())
                .collect();
            for id in ids {
                self.remove_vehicle(&id);
            }
            self.background.active = false;
        } else {
            self.spawn_background();
        }
        self.background.active
    }

    fn spawn_background(&mut self) {
        let occupied: Vec<Vector2<f64>> =
            self.vehicles.values().map(|v| v.position).collect();
        let spawned = self
            .background
            .spawn_population(&self.config, &self.grid, &occupied);
        for vehicle in spawned {
            self.vehicles.insert(vehicle.id.clone(), vehicle);
        }
        self.background.active = true;
    }

    /// One tick at the nominal rate.
    pub async fn tick(&mut self) -> Result<(), InvariantViolation> {
        self.tick_with_dt(self.config.dt()).await
    }

    /// One tick with a measured wall-clock `dt`, capped at twice the
    /// nominal step so a stalled host cannot teleport vehicles.
    pub async fn tick_with_dt(&mut self, wall_dt: f64) -> Result<(), InvariantViolation> {
        if !self.running {
            return Ok(());
        }
        let nominal = self.config.dt();
        let dt = wall_dt.min(2.0 * nominal);
        if wall_dt > 2.0 * nominal {
            warn!(wall_dt, capped = dt, "tick overran its budget");
        }

        let now = self.clock.now_secs();
        let tick = self.tick;

        // Phase 1: collect broadcasts into the channel
        for vehicle in self.vehicles.values_mut() {
            let draft = vehicle.draft_message(now);
            let message = self.channel.key().signed(draft.unsigned());
            match self.channel.publish(message, now) {
                Ok(()) => self.telemetry.record_v2x_message(),
                Err(err) => {
                    // Local rejection: counted in security stats, the
                    // agent keeps its previous state in the snapshot
                    tracing::debug!(error = %err, "publish rejected");
                }
            }
        }
        // Emergency vehicles announce themselves on the alert channel
        if tick % self.config.tick_rate_hz as u64 == 0 {
            let sirens: Vec<AgentId> = self
                .vehicles
                .values()
                .filter(|v| v.profile.is_emergency())
                .map(|v| v.id.clone())
                .collect();
            for from in sirens {
                self.channel.alert(
                    Alert {
                        from,
                        kind: "siren".to_string(),
                        message: "emergency vehicle approaching".to_string(),
                        timestamp: now,
                        target: None,
                    },
                    now,
                );
            }
        }
        self.channel.prune_stale(now);
        let snapshot = self.channel.snapshot();

        // Phase 2: infrastructure
        for light in &mut self.lights {
            light.step(dt, &snapshot);
        }
        self.coordinator.observe(&snapshot, tick);

        // Phase 3: collision pairs, priority, clearances
        let pairs = Arc::new(collision_pairs(&snapshot));
        if let Err(violation) = self.coordinator.check_invariant(&snapshot) {
            // Fatal: no partial tick is externalized
            self.running = false;
            error!(%violation, "tick aborted");
            return Err(violation);
        }
        let advisories = arbitrate(&snapshot, &self.coordinator.centers());
        let clearances = self.coordinator.clearances(&snapshot);
        let mut recommendations = BTreeMap::new();
        for light in &self.lights {
            recommendations.extend(light.recommendations(&snapshot));
        }

        // Phase 4: parallel decisions over the immutable snapshot
        let permit = self.breaker.begin_tick(now);
        let mut probe_available = permit == TickPermit::Probe;
        let mut join_set: JoinSet<DecisionOutcome> = JoinSet::new();
        let mut task_owner: HashMap<tokio::task::Id, AgentId> = HashMap::new();

        for (id, vehicle) in &self.vehicles {
            let advisor_permitted = match permit {
                TickPermit::Pass => true,
                TickPermit::Reject => false,
                TickPermit::Probe => {
                    let takes_probe =
                        probe_available && vehicle.profile == BehaviorProfile::Normal;
                    if takes_probe {
                        probe_available = false;
                    }
                    takes_probe
                }
            };

            let governing_light = self.lights.iter().find(|l| l.in_approach(vehicle.position));
            let (signal, time_to_green) = match (governing_light, snapshot.get(id)) {
                (Some(light), Some(msg)) => (
                    Some(light.signal_for(msg)),
                    light.time_to_green(crossway_core::intersection::axis_of(msg.heading)),
                ),
                _ => (None, 0.0),
            };

            let inputs = DecisionInputs {
                snapshot: snapshot.clone(),
                pairs: pairs.clone(),
                advisory: advisories.get(id).cloned(),
                signal,
                time_to_green,
                recommended_speed: recommendations
                    .get(id)
                    .map(|r: &crossway_core::SpeedRecommendation| r.recommended_speed),
                clearance: clearances.get(id).copied(),
                intersection_center: self.grid.nearest(vehicle.position),
                advisor_permitted,
                now,
                tick,
            };

            let view = vehicle.view(now, noise_seed(self.config.seed, tick, id));
            let handle = join_set.spawn(decide(
                view,
                inputs,
                self.advisor.clone(),
                self.config.advisor.min_call_interval,
                vehicle.config().clone(),
            ));
            task_owner.insert(handle.id(), id.clone());
        }

        let mut outcomes: BTreeMap<AgentId, Option<DecisionOutcome>> = BTreeMap::new();
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => {
                    outcomes.insert(outcome.id.clone(), Some(outcome));
                }
                Err(join_err) => {
                    // A panicking decision never aborts the tick
                    if let Some(owner) = task_owner.get(&join_err.id()) {
                        error!(agent = %owner, error = %join_err, "agent decision fault");
                        outcomes.insert(owner.clone(), None);
                    }
                }
            }
        }

        // Phase 5: single-writer apply, deterministic id order
        for (id, vehicle) in self.vehicles.iter_mut() {
            match outcomes.get(id) {
                Some(Some(outcome)) => {
                    if let Some(result) = &outcome.advisor_result {
                        match result {
                            Ok(()) => self.breaker.record_success(now),
                            Err(AdvisorError::BreakerOpen) => {}
                            Err(_) => self.breaker.record_failure(now),
                        }
                    }
                    if outcome.decision.action == Action::Yield
                        && outcome.risk == RiskLevel::Collision
                    {
                        self.telemetry.record_late_yield();
                    }
                    vehicle.apply_outcome(outcome, now, tick);
                }
                _ => vehicle.apply_fault(now, tick),
            }
            // Fresh side-channel alerts land in agent memory
            for alert in self.channel.alerts_for(id, dt * 0.5, now) {
                vehicle
                    .memory
                    .record_alert(alert.from, &alert.kind, &alert.message, tick);
            }
        }
        self.update_pair_telemetry(&pairs, now);
        self.last_pairs = pairs.as_ref().clone();

        // Phase 6: integrate kinematics, reroute, despawn
        let mut finished: Vec<AgentId> = Vec::new();
        let mut faulted: Vec<AgentId> = Vec::new();
        for vehicle in self.vehicles.values_mut() {
            let center = self.grid.nearest(vehicle.position);
            let waypoints_before = vehicle.waypoints.len();
            vehicle.integrate(dt, center);

            if vehicle.background {
                if vehicle.waypoints.is_empty() {
                    self.background.continue_route(vehicle, &self.grid);
                } else if vehicle.waypoints.len() < waypoints_before {
                    self.background.reroll_intent(vehicle, &self.grid);
                }
            }

            if vehicle.consecutive_faults >= self.config.max_consecutive_faults {
                faulted.push(vehicle.id.clone());
            } else if vehicle.finished(center) {
                finished.push(vehicle.id.clone());
            }
        }
        for id in finished {
            info!(agent = %id, "vehicle cleared the scene");
            self.telemetry.record_vehicle_passed();
            self.remove_vehicle(&id);
        }
        for id in faulted {
            warn!(agent = %id, "vehicle despawned after repeated decision faults");
            self.remove_vehicle(&id);
        }

        // Phase 7: advance time
        self.clock.advance(Duration::from_secs_f64(dt));
        self.tick += 1;
        Ok(())
    }

    /// Telemetry bookkeeping over collision-pair transitions.
    fn update_pair_telemetry(&mut self, pairs: &[CollisionPair], now: f64) {
        let current_collisions: BTreeSet<(AgentId, AgentId)> = pairs
            .iter()
            .filter(|p| p.risk == RiskLevel::Collision)
            .map(|p| (p.a.clone(), p.b.clone()))
            .collect();
        let current_high: BTreeSet<(AgentId, AgentId)> = pairs
            .iter()
            .filter(|p| p.risk >= RiskLevel::High)
            .map(|p| (p.a.clone(), p.b.clone()))
            .collect();

        for (a, b) in self.prev_collision_set.difference(&current_collisions) {
            self.telemetry
                .record_collision_prevented(now, (a.as_str(), b.as_str()));
        }
        for pair in current_high.difference(&self.prev_high_set) {
            self.telemetry.record_near_miss();
            let risk = pairs
                .iter()
                .find(|p| (&p.a, &p.b) == (&pair.0, &pair.1))
                .map(|p| p.risk.as_str())
                .unwrap_or("high");
            self.telemetry.record_risk(risk);
        }

        let completed: u64 = self
            .lights
            .iter()
            .map(|l| l.stats().completed_preemptions)
            .sum();
        for _ in self.prev_completed_preemptions..completed {
            self.telemetry.record_preemption_success(now);
        }
        self.prev_completed_preemptions = completed;

        self.prev_collision_set = current_collisions;
        self.prev_high_set = current_high;
    }

    /// Builds the sanitized export document for the current state.
    pub fn export_state(&self) -> ExportedState {
        let now = self.clock.now_secs();

        let agents = self
            .vehicles
            .values()
            .map(|v| {
                let agent = ExportedAgent {
                    x: v.position.x,
                    y: v.position.y,
                    v: v.speed,
                    heading: v.heading,
                    decision: v.decision.action.as_str().to_string(),
                    reason: v.decision.reason.clone(),
                    risk_level: v.risk.as_str().to_string(),
                    is_emergency: v.profile.is_emergency(),
                    is_police: v.profile.is_police(),
                    is_drunk: v.profile.is_drunk(),
                    pulling_over: v.pulling_over,
                    inside_intersection: v.inside_intersection,
                    background: v.background,
                    llm_calls: v.llm_calls,
                }
                .sanitized();
                (v.id.to_string(), agent)
            })
            .collect();

        let infrastructure = self
            .lights
            .iter()
            .map(|l| {
                (
                    l.id.to_string(),
                    ExportedLight {
                        phase: l.phase().as_str().to_string(),
                        phase_remaining: l.phase_remaining().max(0.0),
                        emergency_mode: l.emergency_mode(),
                        x: l.center.x,
                        y: l.center.y,
                    },
                )
            })
            .collect();

        let collision_pairs = self
            .last_pairs
            .iter()
            .filter(|p| {
                // Background noise pairs stay out of the export
                !(p.a.has_prefix("BG_") && p.b.has_prefix("BG_"))
                    && !(p.a.has_prefix("AMBULANCE_") && p.b.has_prefix("AMBULANCE_"))
            })
            .take(50)
            .map(|p| ExportedPair {
                agent1: p.a.to_string(),
                agent2: p.b.to_string(),
                ttc: if p.ttc.is_finite() { p.ttc.min(999.0) } else { 999.0 },
                risk: p.risk.as_str().to_string(),
            })
            .collect();

        ExportedState {
            running: self.running,
            scenario: self.scenario.map(|s| s.name().to_string()),
            tick: self.tick,
            t: now,
            agents,
            infrastructure,
            collision_pairs,
            grid: self.grid.info(),
            stats: ExportedStats {
                elapsed_time: (now - self.started_at).max(0.0),
                collisions_prevented: self.telemetry.collisions_prevented(),
                cooperation_score: self.telemetry.cooperation_score(),
            },
            security: self.channel.security_stats(now),
            background_traffic: self.background.active,
        }
    }

    /// The telemetry report document.
    pub fn telemetry_report(&self) -> TelemetryReport {
        self.telemetry.report(self.clock.now_secs())
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn time(&self) -> f64 {
        self.clock.now_secs()
    }

    pub fn vehicle(&self, id: &AgentId) -> Option<&VehicleAgent> {
        self.vehicles.get(id)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &VehicleAgent> {
        self.vehicles.values()
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn lights(&self) -> &[TrafficLight] {
        &self.lights
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Test and control-surface hook: inserts a prebuilt vehicle.
    pub fn insert_vehicle(&mut self, vehicle: VehicleAgent) {
        self.vehicles.insert(vehicle.id.clone(), vehicle);
    }
}

/// Deterministic per-agent, per-tick seed for probabilistic behavior.
fn noise_seed(master: u64, tick: u64, id: &AgentId) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    master ^ tick.wrapping_mul(0x9e3779b97f4a7c15) ^ hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossway_core::light::TrafficPhase;
    use crossway_core::message::Intent;
    use crossway_env::{ScriptedAdvisor, UnavailableAdvisor};

    fn scenario_manager() -> SimulationManager {
        SimulationManager::new(
            SimMode::Scenario,
            SimConfig::default(),
            Arc::new(UnavailableAdvisor),
        )
    }

    fn positions_of(manager: &SimulationManager, a: &str, b: &str) -> Option<f64> {
        let a = manager.vehicle(&AgentId::new(a))?;
        let b = manager.vehicle(&AgentId::new(b))?;
        Some((a.position - b.position).norm())
    }

    #[tokio::test]
    async fn test_blind_intersection_stays_separated() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::BlindIntersection));

        let mut min_distance = f64::INFINITY;
        for _ in 0..900 {
            manager.tick().await.unwrap();
            if let Some(d) = positions_of(&manager, "VH_A", "VH_B") {
                min_distance = min_distance.min(d);
            }
            if manager.vehicle_count() == 0 {
                break;
            }
        }

        assert!(
            min_distance > crossway_core::collision::S_COLLISION,
            "vehicles came within {min_distance:.2} m"
        );
        assert_eq!(manager.vehicle_count(), 0, "both vehicles should clear");
    }

    #[tokio::test]
    async fn test_right_of_way_all_vehicles_pass_safely() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::RightOfWay));
        assert_eq!(manager.vehicle_count(), 3);

        for _ in 0..1200 {
            manager.tick().await.unwrap();
            if manager.vehicle_count() == 0 {
                break;
            }
        }
        assert_eq!(manager.vehicle_count(), 0, "all three vehicles should pass");
        assert!(manager.telemetry_report().vehicles_passed >= 3);
    }

    #[tokio::test]
    async fn test_emergency_vehicle_preempts_light() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::EmergencyVehicle));

        let amb = AgentId::new("AMBULANCE");
        let mut preempt_seen_at: Option<u64> = None;
        let mut first_in_range: Option<u64> = None;
        let mut ew_green_at: Option<u64> = None;
        let mut min_amb_speed = f64::INFINITY;

        for tick in 0..1200u64 {
            manager.tick().await.unwrap();

            if let Some(vehicle) = manager.vehicle(&amb) {
                min_amb_speed = min_amb_speed.min(vehicle.speed);
                if first_in_range.is_none() && vehicle.position.norm() <= 60.0 {
                    first_in_range = Some(tick);
                }
            }
            let phase = manager.lights()[0].phase();
            if preempt_seen_at.is_none() && phase == TrafficPhase::EmergencyAllRed {
                preempt_seen_at = Some(tick);
            }
            if preempt_seen_at.is_some() && ew_green_at.is_none() && phase == TrafficPhase::EwGreen
            {
                ew_green_at = Some(tick);
            }
            if manager.vehicle_count() == 0 {
                break;
            }
        }

        let entered = first_in_range.expect("ambulance should reach the preemption zone");
        let preempted = preempt_seen_at.expect("light should enter EMERGENCY_ALL_RED");
        assert!(
            preempted <= entered + 1,
            "preemption lagged: in range at {entered}, preempted at {preempted}"
        );
        let greened = ew_green_at.expect("emergency axis should turn green");
        // 2 s at 20 Hz = 40 ticks
        assert!(greened <= preempted + 40);
        assert!(min_amb_speed >= 5.0, "ambulance slowed to {min_amb_speed:.2}");
        assert_eq!(manager.lights()[0].stats().emergency_preemptions, 1);
        assert_eq!(manager.lights()[0].stats().completed_preemptions, 1);
    }

    #[tokio::test]
    async fn test_leads_pull_over_for_trailing_ambulance() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::RightOfWay));
        manager.clear_vehicles();

        let config = SimConfig::default();
        let mut lead_near = VehicleAgent::new(
            AgentId::new("VH_LEAD1"),
            BehaviorProfile::Normal,
            Vector2::new(10.0, 20.0),
            0.0,
            10.0,
            10.0,
            Intent::Through,
            config.vehicle.clone(),
            1,
        );
        lead_near.persistent = true;
        let mut lead_far = VehicleAgent::new(
            AgentId::new("VH_LEAD2"),
            BehaviorProfile::Normal,
            Vector2::new(10.0, 40.0),
            0.0,
            10.0,
            10.0,
            Intent::Through,
            config.vehicle.clone(),
            2,
        );
        lead_far.persistent = true;
        let mut ambulance = VehicleAgent::new(
            AgentId::new("AMBULANCE"),
            BehaviorProfile::Emergency,
            Vector2::new(10.0, -25.0),
            0.0,
            25.0,
            25.0,
            Intent::Through,
            config.vehicle.clone(),
            3,
        );
        ambulance.persistent = true;
        manager.insert_vehicle(lead_near);
        manager.insert_vehicle(lead_far);
        manager.insert_vehicle(ambulance);

        // Near lead is 45 m ahead of the ambulance: detected right away
        manager.tick().await.unwrap();
        manager.tick().await.unwrap();
        assert!(
            manager
                .vehicle(&AgentId::new("VH_LEAD1"))
                .unwrap()
                .pulling_over,
            "near lead should pull over within 2 ticks"
        );

        let mut min_amb_speed = f64::INFINITY;
        let mut far_lead_pulled_over = false;
        for _ in 0..200 {
            manager.tick().await.unwrap();
            let amb = manager.vehicle(&AgentId::new("AMBULANCE")).unwrap();
            min_amb_speed = min_amb_speed.min(amb.speed);
            if manager
                .vehicle(&AgentId::new("VH_LEAD2"))
                .unwrap()
                .pulling_over
            {
                far_lead_pulled_over = true;
            }
        }

        assert!(far_lead_pulled_over, "far lead should pull over once in range");
        assert!(min_amb_speed >= 5.0, "ambulance slowed to {min_amb_speed:.2}");
    }

    #[tokio::test]
    async fn test_drunk_driver_never_collides_with_peer() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::DrunkDriver));

        let mut min_distance = f64::INFINITY;
        for _ in 0..600 {
            manager.tick().await.unwrap();
            if let Some(d) = positions_of(&manager, "VH_A", "DRUNK") {
                min_distance = min_distance.min(d);
            }
        }
        assert!(
            min_distance > crossway_core::collision::S_COLLISION,
            "peer came within {min_distance:.2} m of the drunk"
        );
    }

    #[tokio::test]
    async fn test_breaker_opens_under_repeated_advisor_failures() {
        let mut manager = SimulationManager::new(
            SimMode::Scenario,
            SimConfig::default(),
            Arc::new(ScriptedAdvisor::failing(AdvisorError::transport("down"))),
        );
        manager.start(Some(ScenarioId::BlindIntersection));

        for _ in 0..60 {
            manager.tick().await.unwrap();
        }

        assert!(matches!(manager.breaker_state(), BreakerState::Open { .. }));
        let (calls, errors) = manager
            .vehicles()
            .fold((0u64, 0u64), |(c, e), v| (c + v.llm_calls, e + v.llm_errors));
        assert_eq!(calls, 0, "no failed call may count as an llm call");
        assert!(errors >= 5);
    }

    #[tokio::test]
    async fn test_export_state_is_sanitized_and_complete() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::MultiVehicleTrafficLight));
        for _ in 0..10 {
            manager.tick().await.unwrap();
        }

        let state = manager.export_state();
        assert!(state.running);
        assert_eq!(state.scenario.as_deref(), Some("multi_vehicle_traffic_light"));
        assert_eq!(state.agents.len(), 4);
        assert_eq!(state.infrastructure.len(), 1);
        assert_eq!(state.tick, 10);

        for agent in state.agents.values() {
            assert!(agent.x.is_finite() && agent.x.abs() <= 500.0);
            assert!(agent.v >= 0.0 && agent.v <= 50.0);
            assert!(agent.heading >= 0.0 && agent.heading < 360.0);
        }
        for pair in &state.collision_pairs {
            assert!(pair.ttc.is_finite());
            assert!(pair.agent1 < pair.agent2);
        }
        // Document must serialize cleanly
        assert!(state.to_json().is_ok());
    }

    #[tokio::test]
    async fn test_spawn_and_restart() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::RightOfWay));
        assert_eq!(manager.vehicle_count(), 3);

        let id = manager.spawn(SpawnKind::Ambulance);
        assert_eq!(manager.vehicle_count(), 4);
        assert!(manager.vehicle(&id).unwrap().profile.is_emergency());

        for _ in 0..20 {
            manager.tick().await.unwrap();
        }
        manager.restart();
        assert_eq!(manager.vehicle_count(), 3);
        assert_eq!(manager.export_state().stats.collisions_prevented, 0);
    }

    #[tokio::test]
    async fn test_city_mode_background_population() {
        let mut manager = SimulationManager::new(
            SimMode::City,
            SimConfig::default(),
            Arc::new(UnavailableAdvisor),
        );
        manager.start(None);
        assert_eq!(manager.vehicle_count(), 25);
        assert!(manager.export_state().background_traffic);

        for _ in 0..40 {
            manager.tick().await.unwrap();
        }
        // Persistent population survives
        assert_eq!(manager.vehicle_count(), 25);

        let active = manager.toggle_background_traffic();
        assert!(!active);
        assert_eq!(manager.vehicle_count(), 0);

        let active = manager.toggle_background_traffic();
        assert!(active);
        assert_eq!(manager.vehicle_count(), 25);
    }

    #[tokio::test]
    async fn test_stop_halts_progress() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::RightOfWay));
        manager.tick().await.unwrap();
        assert_eq!(manager.current_tick(), 1);

        manager.stop();
        manager.tick().await.unwrap();
        assert_eq!(manager.current_tick(), 1, "stopped manager must not advance");
        assert!(!manager.export_state().running);
    }

    #[tokio::test]
    async fn test_oversized_wall_dt_is_capped() {
        let mut manager = scenario_manager();
        manager.start(Some(ScenarioId::RightOfWay));
        let before: Vec<f64> = manager.vehicles().map(|v| v.position.y).collect();

        // A 2-second stall must not teleport vehicles more than 2 ticks
        manager.tick_with_dt(2.0).await.unwrap();

        for (v, y0) in manager.vehicles().zip(before) {
            let moved = (v.position.y - y0).abs();
            assert!(moved <= 18.0 * 2.0 * manager.config.dt() + 1e-6);
        }
    }
}
