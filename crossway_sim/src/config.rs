//! Simulation configuration.

use crossway_core::advisor::AdvisorConfig;
use crossway_core::breaker::BreakerConfig;
use crossway_core::channel::ChannelConfig;
use crossway_core::light::LightConfig;
use crossway_core::telemetry::CooperationWeights;
use crossway_core::vehicle::VehicleConfig;

/// Top-level configuration for a simulation run.
///
/// Everything that affects behavior lives here; the master seed drives
/// every random subsystem, so two runs with the same config are
/// tick-for-tick identical.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism.
    pub seed: u64,
    /// Tick rate in Hz.
    pub tick_rate_hz: u32,
    /// Lane center offset from the road axis (meters, right-hand traffic).
    pub lane_offset: f64,

    /// City grid dimensions.
    pub grid_cols: usize,
    pub grid_rows: usize,
    /// Distance between adjacent intersections (meters).
    pub grid_spacing: f64,

    /// Background traffic population target.
    pub background_population: usize,
    /// Share of background spawns that are ambulances.
    pub emergency_chance: f64,
    /// Share of background spawns that are police cars.
    pub police_chance: f64,
    /// Minimum clear distance around a spawn point (meters).
    pub min_spawn_distance: f64,
    /// Background cruise speed band (m/s).
    pub background_speed_min: f64,
    pub background_speed_max: f64,

    /// Consecutive decision faults before an agent is despawned.
    pub max_consecutive_faults: u32,

    pub channel: ChannelConfig,
    pub light: LightConfig,
    pub breaker: BreakerConfig,
    pub advisor: AdvisorConfig,
    pub vehicle: VehicleConfig,
    pub weights: CooperationWeights,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_rate_hz: 20,
            lane_offset: 10.0,
            grid_cols: 5,
            grid_rows: 5,
            grid_spacing: 200.0,
            background_population: 25,
            emergency_chance: 0.08,
            police_chance: 0.06,
            min_spawn_distance: 45.0,
            background_speed_min: 12.0,
            background_speed_max: 20.0,
            max_consecutive_faults: 5,
            channel: ChannelConfig::default(),
            light: LightConfig::default(),
            breaker: BreakerConfig::default(),
            advisor: AdvisorConfig::default(),
            vehicle: VehicleConfig::default(),
            weights: CooperationWeights::default(),
        }
    }
}

impl SimConfig {
    /// Nominal tick duration in seconds.
    pub fn dt(&self) -> f64 {
        1.0 / self.tick_rate_hz as f64
    }
}
