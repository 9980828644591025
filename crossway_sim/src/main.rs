//! Crossway simulator CLI.
//!
//! Runs a named scenario (or the full city) headless at the configured
//! tick rate and prints the final sanitized state and telemetry report.

use clap::Parser;
use crossway_env::UnavailableAdvisor;
use crossway_sim::{ScenarioId, SimConfig, SimMode, SimulationManager};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Cooperative V2X intersection simulator
#[derive(Parser, Debug)]
#[command(name = "crossway-sim")]
#[command(about = "Run cooperative intersection-safety simulations", long_about = None)]
struct Args {
    /// Master seed for determinism
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (right_of_way, multi_vehicle,
    /// multi_vehicle_traffic_light, blind_intersection,
    /// emergency_vehicle, emergency_vehicle_no_lights, drunk_driver),
    /// or "city" for the full grid
    #[arg(short = 'S', long, default_value = "right_of_way")]
    scenario: String,

    /// Simulation duration in seconds
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Tick rate in Hz
    #[arg(long, default_value = "20")]
    tick_rate: u32,

    /// Run in real time instead of as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Print the final state as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    let config = SimConfig {
        seed: args.seed,
        tick_rate_hz: args.tick_rate,
        ..Default::default()
    };
    let nominal_dt = config.dt();

    let (mode, scenario) = if args.scenario == "city" {
        (SimMode::City, None)
    } else {
        match args.scenario.parse::<ScenarioId>() {
            Ok(s) => (SimMode::Scenario, Some(s)),
            Err(err) => {
                eprintln!("error: {err}");
                eprintln!(
                    "available: city, {}",
                    ScenarioId::all()
                        .iter()
                        .map(|s| s.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                std::process::exit(1);
            }
        }
    };

    let mut manager = SimulationManager::new(mode, config, Arc::new(UnavailableAdvisor));
    manager.start(scenario);

    info!(
        seed = args.seed,
        scenario = args.scenario,
        duration = args.duration,
        "simulation starting"
    );

    let total_ticks = (args.duration / nominal_dt).round() as u64;
    let mut last_tick = Instant::now();

    for tick in 0..total_ticks {
        let wall_dt = if args.realtime {
            let elapsed = last_tick.elapsed().as_secs_f64();
            if elapsed < nominal_dt {
                tokio::time::sleep(std::time::Duration::from_secs_f64(nominal_dt - elapsed))
                    .await;
            } else if elapsed > 2.0 * nominal_dt {
                warn!(elapsed, "tick overran its budget");
            }
            last_tick.elapsed().as_secs_f64()
        } else {
            nominal_dt
        };
        last_tick = Instant::now();

        if let Err(violation) = manager.tick_with_dt(wall_dt).await {
            error!(%violation, "fatal coordination failure, restart required");
            std::process::exit(2);
        }

        if tick % (manager_rate(args.tick_rate) * 5) == 0 {
            let state = manager.export_state();
            info!(
                t = format!("{:.1}", state.t),
                agents = state.agents.len(),
                pairs = state.collision_pairs.len(),
                score = state.stats.cooperation_score,
                "progress"
            );
        }
    }

    manager.stop();

    let state = manager.export_state();
    let report = manager.telemetry_report();

    if args.json {
        match state.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => error!(%err, "export serialization failed"),
        }
    } else {
        info!("──────────────────────────────────────────────");
        info!(
            vehicles_passed = report.vehicles_passed,
            collisions_prevented = report.collisions_prevented,
            near_misses = report.near_misses,
            preemptions = report.successful_preemptions,
            v2x_messages = report.total_v2x_messages,
            "run complete"
        );
        info!(
            cooperation_score = report.cooperation_score,
            "final cooperation score"
        );
    }
}

fn manager_rate(tick_rate: u32) -> u64 {
    tick_rate.max(1) as u64
}
