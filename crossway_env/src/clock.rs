//! Virtual clock for deterministic simulation time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Read access to simulation time.
///
/// The kernel never reads the wall clock directly: message timestamps,
/// staleness checks, rate-limit buckets and breaker windows all consume
/// this interface, so a run is reproducible tick by tick.
pub trait WorldClock: Send + Sync {
    /// Current simulation time since start.
    fn now(&self) -> Duration;

    /// Current simulation time in seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

/// Virtual clock advanced manually by the tick loop.
///
/// Cloning shares the underlying time, so the manager and every component
/// holding a clone observe the same instant.
pub struct VirtualClock {
    /// Elapsed virtual time in nanoseconds
    elapsed_ns: Arc<Mutex<u64>>,
}

impl VirtualClock {
    /// Creates a clock at t = 0.
    pub fn new() -> Self {
        Self {
            elapsed_ns: Arc::new(Mutex::new(0)),
        }
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut ns = self.elapsed_ns.lock().unwrap();
        *ns += duration.as_nanos() as u64;
    }

    /// Sets the virtual time to an absolute value.
    pub fn set(&self, elapsed: Duration) {
        let mut ns = self.elapsed_ns.lock().unwrap();
        *ns = elapsed.as_nanos() as u64;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for VirtualClock {
    fn clone(&self) -> Self {
        Self {
            elapsed_ns: Arc::clone(&self.elapsed_ns),
        }
    }
}

impl WorldClock for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.elapsed_ns.lock().unwrap())
    }
}
