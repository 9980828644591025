//! Crossway Simulation Harness
//!
//! This crate orchestrates the kernel in `crossway_core` into a runnable
//! simulation: scenario definitions, the city grid with background
//! traffic, the tick loop, and the sanitized state export.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SimulationManager                        │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ Tick loop (fixed 20 Hz, virtual clock)               │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │ broadcast      │ snapshot            │ apply        │
//! │  ┌────▼─────┐     ┌────▼─────┐          ┌────▼─────┐        │
//! │  │   V2X    │     │ Decision │   ...    │ Decision │        │
//! │  │ Channel  │     │ task #1  │          │ task #N  │        │
//! │  └──────────┘     └────┬─────┘          └────┬─────┘        │
//! │       ▲                │  (breaker-gated advisor)           │
//! │  ┌────┴────────────────▼──────────────────────▼────┐        │
//! │  │ Lights / Coordinator / Collision / Priority     │        │
//! │  └─────────────────────────────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decisions run in parallel over an immutable snapshot; all writes
//! happen in the single-threaded apply phase, so each tick has
//! serializable semantics and a run is reproducible from its seed.

pub mod config;
pub mod export;
pub mod grid;
pub mod manager;
pub mod scenarios;

pub use config::SimConfig;
pub use export::ExportedState;
pub use grid::{BackgroundTraffic, GridInfo, GridLayout};
pub use manager::{SimMode, SimulationManager, SpawnKind};
pub use scenarios::{ScenarioId, VehicleBlueprint};
