//! City grid geometry, route building and the background traffic driver.
//!
//! The city is a `cols x rows` lattice of intersections. Vehicles drive
//! on right-hand lanes offset from the road axes; routes are waypoint
//! sequences through successive intersections. The background driver
//! keeps a persistent population on the grid, rerolling intent at each
//! intersection and turning at the grid edge.

use crate::config::SimConfig;
use crossway_core::message::Intent;
use crossway_core::vehicle::{BehaviorProfile, VehicleAgent};
use crossway_env::AgentId;
use nalgebra::Vector2;
use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

/// Exported grid description.
#[derive(Debug, Clone, Serialize)]
pub struct GridInfo {
    pub intersections: Vec<PointInfo>,
    pub grid_cols: usize,
    pub grid_rows: usize,
    pub grid_spacing: f64,
    pub demo_intersection: PointInfo,
    pub traffic_light_positions: Vec<PointInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointInfo {
    pub x: f64,
    pub y: f64,
}

impl From<Vector2<f64>> for PointInfo {
    fn from(v: Vector2<f64>) -> Self {
        Self { x: v.x, y: v.y }
    }
}

/// The intersection lattice.
#[derive(Debug, Clone)]
pub struct GridLayout {
    pub cols: usize,
    pub rows: usize,
    pub spacing: f64,
    pub lane_offset: f64,
    intersections: Vec<Vector2<f64>>,
    light_positions: Vec<Vector2<f64>>,
}

impl GridLayout {
    pub fn new(cols: usize, rows: usize, spacing: f64, lane_offset: f64) -> Self {
        let half_w = (cols - 1) as f64 * spacing / 2.0;
        let half_h = (rows - 1) as f64 * spacing / 2.0;

        let mut intersections = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for col in 0..cols {
                intersections.push(Vector2::new(
                    -half_w + col as f64 * spacing,
                    half_h - row as f64 * spacing,
                ));
            }
        }

        // Lights on the four corner-adjacent intersections, as in the
        // demo city
        let light_positions = vec![
            Vector2::new(-spacing, spacing),
            Vector2::new(spacing, spacing),
            Vector2::new(-spacing, -spacing),
            Vector2::new(spacing, -spacing),
        ];

        Self {
            cols,
            rows,
            spacing,
            lane_offset,
            intersections,
            light_positions,
        }
    }

    /// Single-intersection layout for scenario mode.
    pub fn single(lane_offset: f64) -> Self {
        Self {
            cols: 1,
            rows: 1,
            spacing: 0.0,
            lane_offset,
            intersections: vec![Vector2::new(0.0, 0.0)],
            light_positions: Vec::new(),
        }
    }

    pub fn intersections(&self) -> &[Vector2<f64>] {
        &self.intersections
    }

    pub fn light_positions(&self) -> &[Vector2<f64>] {
        &self.light_positions
    }

    /// The intersection closest to the origin (camera/demo focus).
    pub fn demo_intersection(&self) -> Vector2<f64> {
        self.intersections
            .iter()
            .copied()
            .min_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))
            .unwrap_or_else(|| Vector2::new(0.0, 0.0))
    }

    /// Nearest intersection center to a position.
    pub fn nearest(&self, pos: Vector2<f64>) -> Vector2<f64> {
        self.intersections
            .iter()
            .copied()
            .min_by(|a, b| {
                (pos - a)
                    .norm_squared()
                    .total_cmp(&(pos - b).norm_squared())
            })
            .unwrap_or_else(|| Vector2::new(0.0, 0.0))
    }

    /// Right-hand lane point beside an intersection for a heading.
    pub fn lane_point(&self, center: Vector2<f64>, heading: f64) -> Vector2<f64> {
        let l = self.lane_offset;
        match heading.rem_euclid(360.0) as u32 {
            0 => Vector2::new(center.x + l, center.y),
            180 => Vector2::new(center.x - l, center.y),
            90 => Vector2::new(center.x, center.y - l),
            270 => Vector2::new(center.x, center.y + l),
            _ => center,
        }
    }

    /// Downstream intersection centers along a cardinal heading from a
    /// start intersection, nearest first.
    fn downstream(&self, from: Vector2<f64>, heading: f64) -> Vec<Vector2<f64>> {
        let d = heading.rem_euclid(360.0);
        let mut result: Vec<Vector2<f64>> = self
            .intersections
            .iter()
            .copied()
            .filter(|p| match d as u32 {
                0 => (p.x - from.x).abs() < 1.0 && p.y > from.y + 1.0,
                180 => (p.x - from.x).abs() < 1.0 && p.y < from.y - 1.0,
                90 => (p.y - from.y).abs() < 1.0 && p.x > from.x + 1.0,
                270 => (p.y - from.y).abs() < 1.0 && p.x < from.x - 1.0,
                _ => false,
            })
            .collect();
        result.sort_by(|a, b| {
            (a - from)
                .norm_squared()
                .total_cmp(&(b - from).norm_squared())
        });
        result
    }

    /// Waypoints for a straight route from an intersection along a
    /// heading: the lane point beside each downstream intersection.
    pub fn straight_route(&self, from: Vector2<f64>, heading: f64) -> Vec<Vector2<f64>> {
        self.downstream(from, heading)
            .into_iter()
            .map(|p| self.lane_point(p, heading))
            .collect()
    }

    /// Turn options at a position that still lead somewhere on the grid.
    fn viable_turns(&self, at: Vector2<f64>, heading: f64) -> Vec<f64> {
        let d = heading.rem_euclid(360.0);
        let candidates: [f64; 2] = if d < 45.0 || (135.0..225.0).contains(&d) || d >= 315.0 {
            [90.0, 270.0]
        } else {
            [0.0, 180.0]
        };
        let turn_center = self.nearest(at);
        candidates
            .into_iter()
            .filter(|&nd| !self.downstream(turn_center, nd).is_empty())
            .collect()
    }

    /// Builds a turn (or continuation) route at the vehicle's current
    /// position. Returns the new heading and waypoints.
    pub fn turn_route(
        &self,
        at: Vector2<f64>,
        heading: f64,
        rng: &mut ChaCha8Rng,
    ) -> Option<(f64, Vec<Vector2<f64>>)> {
        let options = self.viable_turns(at, heading);
        let new_heading = *options.choose(rng)?;
        let turn_center = self.nearest(at);

        let mut waypoints = vec![self.lane_point(turn_center, new_heading)];
        waypoints.extend(self.straight_route(turn_center, new_heading));
        Some((new_heading, waypoints))
    }

    /// Intent implied by a heading change.
    pub fn intent_for_turn(old_heading: f64, new_heading: f64) -> Intent {
        let delta = (new_heading - old_heading).rem_euclid(360.0);
        if (delta - 90.0).abs() < 1.0 {
            Intent::Right
        } else if (delta - 270.0).abs() < 1.0 {
            Intent::Left
        } else {
            Intent::Through
        }
    }

    pub fn info(&self) -> GridInfo {
        GridInfo {
            intersections: self.intersections.iter().map(|&p| p.into()).collect(),
            grid_cols: self.cols,
            grid_rows: self.rows,
            grid_spacing: self.spacing,
            demo_intersection: self.demo_intersection().into(),
            traffic_light_positions: self.light_positions.iter().map(|&p| p.into()).collect(),
        }
    }
}

/// Background traffic driver: spawns and steers the persistent grid
/// population.
pub struct BackgroundTraffic {
    rng: ChaCha8Rng,
    counter: u32,
    pub active: bool,
}

impl BackgroundTraffic {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            counter: 0,
            active: false,
        }
    }

    /// Spawns the full background population on the grid, avoiding
    /// positions within the spawn-block radius of existing vehicles.
    pub fn spawn_population(
        &mut self,
        config: &SimConfig,
        grid: &GridLayout,
        occupied: &[Vector2<f64>],
    ) -> Vec<VehicleAgent> {
        // The spawn-block radius admits at most one vehicle per
        // intersection, so every intersection must contribute options to
        // reach the population target.
        let mut spawn_options: Vec<(Vector2<f64>, f64, Vector2<f64>)> = Vec::new();
        for &center in grid.intersections() {
            for d in [0.0, 90.0, 180.0, 270.0] {
                spawn_options.push((grid.lane_point(center, d), d, center));
            }
        }
        spawn_options.shuffle(&mut self.rng);

        let mut placed: Vec<Vector2<f64>> = occupied.to_vec();
        let mut vehicles = Vec::new();

        for (pos, heading, center) in spawn_options {
            if vehicles.len() >= config.background_population {
                break;
            }
            let blocked = placed
                .iter()
                .any(|p| (p - pos).norm() < config.min_spawn_distance);
            if blocked {
                continue;
            }

            let speed = self
                .rng
                .gen_range(config.background_speed_min..config.background_speed_max);
            let roll: f64 = self.rng.gen();
            let profile = if roll < config.emergency_chance {
                BehaviorProfile::Emergency
            } else if roll < config.emergency_chance + config.police_chance {
                BehaviorProfile::Police
            } else {
                BehaviorProfile::Normal
            };

            self.counter += 1;
            let id = match profile {
                BehaviorProfile::Emergency => format!("AMBULANCE_{:03}", self.counter),
                BehaviorProfile::Police => format!("POLICE_{:03}", self.counter),
                _ => format!("BG_{:03}", self.counter),
            };

            let target = match profile {
                BehaviorProfile::Emergency | BehaviorProfile::Police => (speed * 1.4).min(25.0),
                _ => speed,
            };

            let route = grid.straight_route(center, heading);
            let mut vehicle = VehicleAgent::new(
                AgentId::new(&id),
                profile,
                pos,
                heading,
                speed,
                target,
                Intent::Through,
                config.vehicle.clone(),
                config.seed ^ (self.counter as u64).wrapping_mul(0x9e3779b97f4a7c15),
            )
            .with_waypoints(route);
            vehicle.persistent = true;
            vehicle.background = true;

            debug!(id = %vehicle.id, x = pos.x, y = pos.y, heading, "spawned background vehicle");
            placed.push(pos);
            vehicles.push(vehicle);
        }

        info!(count = vehicles.len(), "background population spawned");
        vehicles
    }

    /// Rerolls intent when a vehicle reaches an intersection waypoint:
    /// mostly straight, sometimes a turn onto the crossing road.
    pub fn reroll_intent(&mut self, vehicle: &mut VehicleAgent, grid: &GridLayout) {
        let roll: f64 = self.rng.gen();
        if roll < 0.6 {
            vehicle.intent = Intent::Through;
            return;
        }
        if let Some((new_heading, waypoints)) = grid.turn_route(
            vehicle.position,
            vehicle.heading,
            &mut self.rng,
        ) {
            vehicle.intent = GridLayout::intent_for_turn(vehicle.heading, new_heading);
            vehicle.heading = new_heading;
            vehicle.waypoints = waypoints.into();
        }
    }

    /// Gives a vehicle that ran out of route a new direction (grid edge).
    pub fn continue_route(&mut self, vehicle: &mut VehicleAgent, grid: &GridLayout) {
        if let Some((new_heading, waypoints)) = grid.turn_route(
            vehicle.position,
            vehicle.heading,
            &mut self.rng,
        ) {
            vehicle.intent = GridLayout::intent_for_turn(vehicle.heading, new_heading);
            vehicle.heading = new_heading;
            vehicle.waypoints = waypoints.into();
        } else {
            // Dead corner: turn back the way we came
            vehicle.heading = (vehicle.heading + 180.0).rem_euclid(360.0);
            vehicle.intent = Intent::Through;
            let center = grid.nearest(vehicle.position);
            vehicle.waypoints = grid.straight_route(center, vehicle.heading).into();
        }
    }
}
