//! Crossway Environment Abstraction Layer
//!
//! This crate provides the seam between the simulation kernel and the
//! outside world. Everything the kernel would normally take from the
//! environment is intercepted here:
//! - Time (`WorldClock`): the kernel only ever reads a virtual clock
//!   advanced by the tick loop
//! - The language-model advisor (`AdvisorTransport`): an opaque,
//!   cancellable request/response capability; any transport satisfies it
//! - Agent identity (`AgentId`)
//!
//! By deriving all entropy from a single 64-bit seed and all time from the
//! virtual clock, any run becomes reproducible from its seed number.

mod advisor;
mod clock;
mod error;
mod types;

pub use advisor::{AdvisorTransport, ScriptedAdvisor, UnavailableAdvisor};
pub use clock::{VirtualClock, WorldClock};
pub use error::AdvisorError;
pub use types::AgentId;
