//! Crossway Core - Cooperative V2X Intersection-Safety Kernel
//!
//! This library is the simulation kernel behind the Crossway intersection
//! simulator. Every vehicle is an autonomous agent that perceives its
//! neighborhood exclusively through a shared, authenticated V2X broadcast
//! channel, and the kernel guarantees four things:
//! 1. **Message integrity**: HMAC-SHA256 over a canonical wire form,
//!    range validation, rate limits and liveness pruning
//! 2. **Predictive safety**: closed-form pair-wise time-to-collision over
//!    a consistent per-tick snapshot
//! 3. **Cooperative arbitration**: right-of-way, emergency preemption,
//!    per-intersection queueing and adaptive signals
//! 4. **Bounded advice**: an optional language-model advisor behind a
//!    circuit breaker and a hard deadline - never on the critical path

pub mod advisor;
pub mod breaker;
pub mod channel;
pub mod collision;
pub mod intersection;
pub mod light;
pub mod memory;
pub mod message;
pub mod priority;
pub mod security;
pub mod telemetry;
pub mod vehicle;

// Re-export key types for convenience
pub use advisor::{AdvisorConfig, AdvisorContext, GuardedAdvisor};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, TickPermit};
pub use channel::{Alert, ChannelConfig, ChannelError, SecurityStats, Snapshot, V2xChannel};
pub use collision::{collision_pairs, risk_for, time_to_collision, CollisionPair};
pub use intersection::{Clearance, Intersection, IntersectionCoordinator, InvariantViolation};
pub use light::{LightConfig, Signal, SpeedRecommendation, TrafficLight, TrafficPhase};
pub use memory::{AgentMemory, MemoryStats};
pub use message::{Action, Decision, Intent, MessageDraft, RiskLevel, V2xMessage, V_MAX};
pub use priority::{arbitrate, Advisory, AdvisoryEntry};
pub use security::MacKey;
pub use telemetry::{CooperationWeights, TelemetryCollector, TelemetryReport};
pub use vehicle::{
    decide, BehaviorProfile, DecisionInputs, DecisionOutcome, DecisionView, VehicleAgent,
    VehicleConfig,
};
