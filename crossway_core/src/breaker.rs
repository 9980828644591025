//! Circuit breaker guarding the language-model advisor.
//!
//! `Closed` forwards calls and counts failures in a sliding window; too
//! many failures open the circuit for a cooldown; the first call after
//! the cooldown becomes a single half-open probe whose outcome decides
//! between reclosing and reopening.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: usize,
    /// Sliding failure window (seconds).
    pub window_secs: f64,
    /// How long the circuit stays open before a probe (seconds).
    pub cooldown_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 30.0,
            cooldown_secs: 30.0,
        }
    }
}

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open { until: f64 },
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Per-tick call budget handed to the decision phase.
///
/// The breaker itself is only mutated at tick boundaries and in the apply
/// phase; during the parallel decision phase agents consult this permit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickPermit {
    /// Calls flow freely.
    Pass,
    /// Exactly one probe call is allowed this tick.
    Probe,
    /// All calls fail fast with `BreakerOpen`.
    Reject,
}

/// Counters for telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub state: String,
    pub recent_failures: usize,
    pub total_successes: u64,
    pub total_trips: u64,
}

/// The advisor circuit breaker, shared by all vehicle brains.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failures: VecDeque<f64>,
    total_successes: u64,
    total_trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            total_successes: 0,
            total_trips: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Advances the state machine at a tick boundary and returns the call
    /// budget for this tick.
    ///
    /// An expired `Open` transitions to `HalfOpen` here, and `HalfOpen`
    /// grants exactly one probe.
    pub fn begin_tick(&mut self, now: f64) -> TickPermit {
        if let BreakerState::Open { until } = self.state {
            if now >= until {
                self.state = BreakerState::HalfOpen;
                info!("advisor breaker half-open, probing");
            }
        }
        match self.state {
            BreakerState::Closed => TickPermit::Pass,
            BreakerState::HalfOpen => TickPermit::Probe,
            BreakerState::Open { .. } => TickPermit::Reject,
        }
    }

    /// Records a successful advisor call.
    pub fn record_success(&mut self, _now: f64) {
        self.total_successes += 1;
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.failures.clear();
            info!("advisor breaker closed, service recovered");
        }
    }

    /// Records a failed advisor call, possibly tripping the breaker.
    pub fn record_failure(&mut self, now: f64) {
        while let Some(&front) = self.failures.front() {
            if now - front >= self.config.window_secs {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        match self.state {
            BreakerState::HalfOpen => {
                self.trip(now);
                warn!("advisor breaker reopened, probe failed");
            }
            BreakerState::Closed => {
                if self.failures.len() >= self.config.failure_threshold {
                    self.trip(now);
                    warn!(
                        failures = self.failures.len(),
                        window = self.config.window_secs,
                        "advisor breaker opened"
                    );
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn trip(&mut self, now: f64) {
        self.state = BreakerState::Open {
            until: now + self.config.cooldown_secs,
        };
        self.total_trips += 1;
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state.as_str().to_string(),
            recent_failures: self.failures.len(),
            total_successes: self.total_successes,
            total_trips: self.total_trips,
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.total_successes = 0;
        self.total_trips = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::default()
    }

    #[test]
    fn test_five_failures_in_window_open_the_circuit() {
        let mut cb = breaker();
        for i in 0..4 {
            cb.record_failure(i as f64);
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure(4.0);
        assert_eq!(cb.state(), BreakerState::Open { until: 34.0 });
        assert_eq!(cb.begin_tick(5.0), TickPermit::Reject);
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let mut cb = breaker();
        // Four failures early, one far outside the 30 s window later
        for i in 0..4 {
            cb.record_failure(i as f64);
        }
        cb.record_failure(40.0);
        // The early four expired; only one failure counts
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.stats().recent_failures, 1);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i as f64);
        }
        // During cooldown every tick rejects
        assert_eq!(cb.begin_tick(20.0), TickPermit::Reject);
        // Cooldown expired (opened at t=4, until t=34): one probe
        assert_eq!(cb.begin_tick(34.5), TickPermit::Probe);
        cb.record_success(34.6);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.begin_tick(34.7), TickPermit::Pass);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i as f64);
        }
        assert_eq!(cb.begin_tick(35.0), TickPermit::Probe);
        cb.record_failure(35.1);
        assert_eq!(cb.state(), BreakerState::Open { until: 65.1 });
        assert_eq!(cb.begin_tick(36.0), TickPermit::Reject);
    }

    #[test]
    fn test_success_in_closed_state_keeps_window() {
        let mut cb = breaker();
        cb.record_failure(1.0);
        cb.record_success(2.0);
        // Success does not clear the window while closed
        assert_eq!(cb.stats().recent_failures, 1);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_trip_counter() {
        let mut cb = breaker();
        for i in 0..5 {
            cb.record_failure(i as f64);
        }
        cb.begin_tick(40.0);
        cb.record_failure(40.1);
        assert_eq!(cb.stats().total_trips, 2);
    }
}
